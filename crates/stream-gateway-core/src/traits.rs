//! Collaborator traits the gateway calls into but does not implement.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::protocol::{InitConfig, RequestObject, ResponseObject, StreamResponse};

/// Error detail the backend uses to report an expired or revoked token.
pub const INVALID_TOKEN: &str = "INVALID_TOKEN";

/// Transport error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Upstream status {code}: {details}")]
    Status { code: i32, details: String },
    #[error("Stream closed")]
    Closed,
}

impl TransportError {
    /// Whether the backend rejected the identity token.
    #[must_use]
    pub fn is_invalid_token(&self) -> bool {
        matches!(self, Self::Status { details, .. } if details == INVALID_TOKEN)
    }
}

/// Frames emitted by the long-lived subscription.
pub type FrameStream = BoxStream<'static, Result<StreamResponse, TransportError>>;

/// One physical connection to the backend.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send a unary request; the backend answers with an acknowledgement only.
    async fn request(&self, request: RequestObject) -> Result<ResponseObject, TransportError>;

    /// Open the server stream carrying replies and pushes.
    async fn subscribe(&self, config: InitConfig) -> Result<FrameStream, TransportError>;
}

/// Opens physical connections. Each successful call is a new connection.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn UpstreamClient>, TransportError>;
}

/// Token refresh error.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Token refresh failed: {0}")]
    Failed(String),
}

/// Called when the backend reports `INVALID_TOKEN`.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<(), RefreshError>;
}

/// Refresher that only records the signal in the log.
#[derive(Debug, Default, Clone)]
pub struct LogOnlyRefresher;

#[async_trait]
impl TokenRefresher for LogOnlyRefresher {
    async fn refresh(&self) -> Result<(), RefreshError> {
        tracing::warn!("Token reported invalid; no refresher configured");
        Ok(())
    }
}

/// Attachment error.
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Invalid attachment encoding: {0}")]
    Decode(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decodes and persists files embedded in frame payloads.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Returns `Ok(None)` when the frame carries no attachment.
    async fn materialize(&self, frame: &StreamResponse)
    -> Result<Option<PathBuf>, AttachmentError>;
}
