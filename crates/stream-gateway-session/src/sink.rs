//! Per-session event channel and delivery failure reporting.

use futures::{StreamExt, stream::BoxStream};
use stream_gateway_core::Delivery;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

/// Why a delivery did not reach a subscriber.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("Session has no subscribers")]
    NoSubscribers,
    #[error("Subscriber lagged behind by {0} deliveries")]
    Lagged(u64),
    #[error("Listener failed: {0}")]
    Listener(String),
    #[error("Session closed")]
    Closed,
}

/// A failed delivery, published on the registry's failure channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub session: String,
    pub error: SinkError,
}

/// Receiving half of a session's event channel.
///
/// The only event a session emits is a [`Delivery`].
pub struct SessionEvents {
    session: String,
    receiver: broadcast::Receiver<Delivery>,
}

impl SessionEvents {
    pub(crate) const fn new(session: String, receiver: broadcast::Receiver<Delivery>) -> Self {
        Self { session, receiver }
    }

    /// Name of the session these events belong to.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Wait for the next delivery.
    ///
    /// # Errors
    /// Returns `SinkError::Lagged` if deliveries were skipped because this
    /// receiver fell behind (the next call continues with newer ones), or
    /// `SinkError::Closed` once the session is gone.
    pub async fn recv(&mut self) -> Result<Delivery, SinkError> {
        self.receiver.recv().await.map_err(|e| match e {
            RecvError::Lagged(n) => SinkError::Lagged(n),
            RecvError::Closed => SinkError::Closed,
        })
    }

    /// Non-blocking variant of [`recv`](Self::recv); `Ok(None)` when nothing is queued.
    ///
    /// # Errors
    /// Same as [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<Option<Delivery>, SinkError> {
        use broadcast::error::TryRecvError;
        match self.receiver.try_recv() {
            Ok(delivery) => Ok(Some(delivery)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Lagged(n)) => Err(SinkError::Lagged(n)),
            Err(TryRecvError::Closed) => Err(SinkError::Closed),
        }
    }

    /// Convert into a stream; lag is reported in-band.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, Result<Delivery, SinkError>> {
        BroadcastStream::new(self.receiver)
            .map(|res| {
                res.map_err(|BroadcastStreamRecvError::Lagged(n)| SinkError::Lagged(n))
            })
            .boxed()
    }
}
