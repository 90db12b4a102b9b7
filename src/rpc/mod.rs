//! Region RPC plumbing: message kinds, the retrying dispatcher, and the
//! gRPC transport/service pair that carries them between processes.

pub mod dispatcher;
pub mod grpc;
pub mod message;
pub mod server;

pub mod service {
    tonic::include_proto!("tessera");
}

use async_trait::async_trait;
use thiserror::Error;

pub use dispatcher::Dispatcher;
pub use message::{
    KeyError, LockInfo, Mutation, Op, RegionError, RegionResult, Request, RequestContext,
    RequestKind, Response, TxnStatus,
};

/// Failure to get any answer out of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("peer {0} unreachable")]
    Unreachable(String),
    #[error("{0}")]
    Fatal(String),
}

/// Sends one region-scoped request to the store listening on `addr`.
///
/// The outer `Result` reports transport failures; the inner one carries the
/// store's region-level verdict.
#[async_trait]
pub trait RegionTransport: Send + Sync {
    async fn send(
        &self,
        addr: &str,
        ctx: RequestContext,
        request: Request,
    ) -> Result<RegionResult, TransportError>;
}
