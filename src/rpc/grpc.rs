//! Network implementations of the timestamp service, the routing oracle and
//! the region transport.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::oracle::TimestampService;
use crate::region_cache::RoutingOracle;
use crate::types::{Key, Region, Timestamp};

use super::message::{RegionResult, Request, RequestContext};
use super::service::tessera_kv_client::TesseraKvClient;
use super::service::tessera_pd_client::TesseraPdClient;
use super::service::{Envelope, TsoRequest};
use super::{RegionTransport, TransportError};

/// Body of a `Dispatch` call. The target address travels along so a single
/// server can front several logical stores.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DispatchRequest {
    pub addr: String,
    pub ctx: RequestContext,
    pub request: Request,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Envelope, serde_json::Error> {
    Ok(Envelope {
        data: serde_json::to_vec(value)?,
    })
}

pub(crate) fn decode<T: DeserializeOwned>(envelope: Envelope) -> Result<T, serde_json::Error> {
    serde_json::from_slice(&envelope.data)
}

pub(crate) fn normalize_endpoint(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

fn status_to_transport(addr: &str, status: Status) -> TransportError {
    match status.code() {
        Code::Unavailable => TransportError::Unreachable(addr.to_string()),
        Code::DeadlineExceeded => TransportError::Timeout,
        _ => TransportError::Fatal(format!("{addr}: {}", status.message())),
    }
}

fn codec_error(err: serde_json::Error) -> TransportError {
    TransportError::Fatal(format!("malformed payload: {err}"))
}

/// Region transport over tonic, keeping one channel per store address.
#[derive(Default)]
pub struct GrpcTransport {
    clients: Mutex<HashMap<String, TesseraKvClient<Channel>>>,
}

impl GrpcTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, addr: &str) -> Result<TesseraKvClient<Channel>, TransportError> {
        if let Some(client) = self.clients.lock().await.get(addr) {
            return Ok(client.clone());
        }
        let client = TesseraKvClient::connect(normalize_endpoint(addr))
            .await
            .map_err(|err| {
                debug!(%addr, error = %err, "store connect failed");
                TransportError::Unreachable(addr.to_string())
            })?;
        self.clients
            .lock()
            .await
            .insert(addr.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl RegionTransport for GrpcTransport {
    async fn send(
        &self,
        addr: &str,
        ctx: RequestContext,
        request: Request,
    ) -> Result<RegionResult, TransportError> {
        let mut client = self.client(addr).await?;
        let envelope = encode(&DispatchRequest {
            addr: addr.to_string(),
            ctx,
            request,
        })
        .map_err(codec_error)?;

        match client.dispatch(envelope).await {
            Ok(response) => decode(response.into_inner()).map_err(codec_error),
            Err(status) => {
                if status.code() == Code::Unavailable {
                    self.clients.lock().await.remove(addr);
                }
                Err(status_to_transport(addr, status))
            }
        }
    }
}

struct PdConnection {
    index: usize,
    client: Option<TesseraPdClient<Channel>>,
}

/// Coordination-service client that sticks to one endpoint and fails over
/// to the next one in the list when it stops answering.
pub struct PdGrpcClient {
    endpoints: Vec<String>,
    current: Mutex<PdConnection>,
}

impl PdGrpcClient {
    /// Connects to the first reachable endpoint.
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Config("no coordination service endpoints".into()));
        }

        let mut last_err = None;
        for (index, endpoint) in endpoints.iter().enumerate() {
            match TesseraPdClient::connect(normalize_endpoint(endpoint)).await {
                Ok(client) => {
                    return Ok(Self {
                        endpoints: endpoints.to_vec(),
                        current: Mutex::new(PdConnection {
                            index,
                            client: Some(client),
                        }),
                    });
                }
                Err(err) => {
                    warn!(%endpoint, error = %err, "coordination service endpoint unreachable");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.map_or_else(
            || Error::Unavailable("no coordination service endpoint answered".into()),
            Error::Transport,
        ))
    }

    async fn client(&self) -> Result<(String, TesseraPdClient<Channel>), TransportError> {
        let mut current = self.current.lock().await;
        for _ in 0..self.endpoints.len() {
            let endpoint = self.endpoints[current.index].clone();
            if let Some(client) = &current.client {
                return Ok((endpoint, client.clone()));
            }
            match TesseraPdClient::connect(normalize_endpoint(&endpoint)).await {
                Ok(client) => {
                    current.client = Some(client.clone());
                    return Ok((endpoint, client));
                }
                Err(err) => {
                    debug!(%endpoint, error = %err, "coordination service endpoint unreachable");
                    current.index = (current.index + 1) % self.endpoints.len();
                }
            }
        }
        Err(TransportError::Unreachable(self.endpoints.join(",")))
    }

    async fn fail_over(&self, endpoint: &str) {
        let mut current = self.current.lock().await;
        if self.endpoints[current.index] == endpoint {
            current.client = None;
            current.index = (current.index + 1) % self.endpoints.len();
        }
    }

    async fn on_status(&self, endpoint: &str, status: Status) -> TransportError {
        if status.code() == Code::Unavailable {
            self.fail_over(endpoint).await;
        }
        status_to_transport(endpoint, status)
    }
}

#[async_trait]
impl TimestampService for PdGrpcClient {
    async fn allocate_timestamp(&self) -> Result<Timestamp, TransportError> {
        let (endpoint, mut client) = self.client().await?;
        match client.allocate_timestamp(TsoRequest {}).await {
            Ok(response) => Ok(Timestamp::from_version(response.into_inner().timestamp)),
            Err(status) => Err(self.on_status(&endpoint, status).await),
        }
    }
}

#[async_trait]
impl RoutingOracle for PdGrpcClient {
    async fn locate_key(&self, key: &Key) -> Result<Region, TransportError> {
        let (endpoint, mut client) = self.client().await?;
        let envelope = encode(key).map_err(codec_error)?;
        match client.locate_key(envelope).await {
            Ok(response) => decode(response.into_inner()).map_err(codec_error),
            Err(status) => Err(self.on_status(&endpoint, status).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_gain_a_scheme() {
        assert_eq!(normalize_endpoint("127.0.0.1:2379"), "http://127.0.0.1:2379");
        assert_eq!(normalize_endpoint("https://pd:2379"), "https://pd:2379");
    }

    #[test]
    fn status_codes_are_classified() {
        assert_eq!(
            status_to_transport("s", Status::unavailable("down")),
            TransportError::Unreachable("s".into())
        );
        assert_eq!(
            status_to_transport("s", Status::deadline_exceeded("slow")),
            TransportError::Timeout
        );
        assert!(matches!(
            status_to_transport("s", Status::internal("boom")),
            TransportError::Fatal(_)
        ));
    }
}
