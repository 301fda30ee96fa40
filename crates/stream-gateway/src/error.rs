//! Gateway error taxonomy.

use stream_gateway_core::{RequestId, TransportError};
use stream_gateway_session::RegistryError;

use crate::pool::PoolError;

/// Errors surfaced to callers of the [`Gateway`](crate::Gateway).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("Upstream rejected the identity token")]
    InvalidToken,
    #[error("Upstream did not accept request {0}")]
    Rejected(RequestId),
    #[error("Gateway is not connected")]
    NotConnected,
    #[error("Gateway is connected to {endpoint} with a different identity")]
    ConnectionMismatch { endpoint: String },
    #[error("Invalid request parameters: {0}")]
    Params(#[from] serde_json::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
