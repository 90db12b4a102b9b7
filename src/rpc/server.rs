use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tonic::{Response, Status};
use tracing::debug;

use crate::mock::MockCluster;
use crate::oracle::TimestampService;
use crate::region_cache::RoutingOracle;
use crate::types::Key;

use super::grpc::{DispatchRequest, decode, encode};
use super::service::tessera_kv_server::TesseraKv;
use super::service::tessera_pd_server::TesseraPd;
use super::service::{Envelope, TsoRequest, TsoResponse};
use super::{RegionTransport, TransportError};

#[allow(clippy::result_large_err)]
fn decode_payload<T: DeserializeOwned>(envelope: Envelope, label: &str) -> Result<T, Status> {
    decode(envelope).map_err(|err| {
        Status::invalid_argument(format!("failed to decode {label} payload: {err}"))
    })
}

#[allow(clippy::result_large_err)]
fn encode_payload<T: Serialize>(value: &T, label: &str) -> Result<Envelope, Status> {
    encode(value)
        .map_err(|err| Status::internal(format!("failed to encode {label} response: {err}")))
}

fn transport_status(err: TransportError) -> Status {
    match err {
        TransportError::Timeout => Status::deadline_exceeded("request timed out"),
        TransportError::Unreachable(addr) => Status::unavailable(format!("{addr} unreachable")),
        TransportError::Fatal(reason) => Status::internal(reason),
    }
}

/// gRPC front for the region stores of a [`MockCluster`].
pub struct TesseraKvService {
    cluster: Arc<MockCluster>,
}

impl TesseraKvService {
    pub fn new(cluster: Arc<MockCluster>) -> Self {
        Self { cluster }
    }
}

#[tonic::async_trait]
impl TesseraKv for TesseraKvService {
    async fn dispatch(
        &self,
        request: tonic::Request<Envelope>,
    ) -> Result<Response<Envelope>, Status> {
        let DispatchRequest { addr, ctx, request } =
            decode_payload(request.into_inner(), "dispatch")?;
        debug!(region_id = ctx.region_id, kind = ?request.kind(), "dispatch");
        let answer = self
            .cluster
            .send(&addr, ctx, request)
            .await
            .map_err(transport_status)?;
        Ok(Response::new(encode_payload(&answer, "dispatch")?))
    }
}

/// gRPC front for the timestamp service and routing oracle of a [`MockCluster`].
pub struct TesseraPdService {
    cluster: Arc<MockCluster>,
}

impl TesseraPdService {
    pub fn new(cluster: Arc<MockCluster>) -> Self {
        Self { cluster }
    }
}

#[tonic::async_trait]
impl TesseraPd for TesseraPdService {
    async fn allocate_timestamp(
        &self,
        _request: tonic::Request<TsoRequest>,
    ) -> Result<Response<TsoResponse>, Status> {
        let ts = self
            .cluster
            .allocate_timestamp()
            .await
            .map_err(transport_status)?;
        Ok(Response::new(TsoResponse {
            timestamp: ts.version(),
        }))
    }

    async fn locate_key(
        &self,
        request: tonic::Request<Envelope>,
    ) -> Result<Response<Envelope>, Status> {
        let key: Key = decode_payload(request.into_inner(), "locate_key")?;
        let region = RoutingOracle::locate_key(self.cluster.as_ref(), &key)
            .await
            .map_err(|err| Status::not_found(err.to_string()))?;
        Ok(Response::new(encode_payload(&region, "locate_key")?))
    }
}
