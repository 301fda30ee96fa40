//! Correlation of outbound requests with their replies on the shared stream.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use stream_gateway_core::{Delivery, RequestId};
use tokio::sync::oneshot;

/// Correlation pool error.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Correlation id already registered: {0}")]
    DuplicateCorrelationId(RequestId),
    #[error("Correlation pool is closed")]
    Closed,
    #[error("Request {0} was cancelled before a reply arrived")]
    Cancelled(RequestId),
    #[error("Request {0} timed out")]
    TimedOut(RequestId),
}

/// What `resolve` did with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiter.
    Delivered,
    /// No waiter was registered under the id (never, or already resolved).
    Orphaned,
    /// The waiter gave up between lookup and hand-off.
    Abandoned,
}

#[derive(Default)]
struct Waiters {
    pending: HashMap<RequestId, oneshot::Sender<Delivery>>,
    closed: bool,
}

/// Maps outstanding request ids to their single waiter.
///
/// All mutation goes through one mutex, so `register`, `resolve` and
/// `cancel` for the same id never interleave.
#[derive(Default)]
pub struct CorrelationPool {
    waiters: Mutex<Waiters>,
}

impl CorrelationPool {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter for `id`.
    ///
    /// # Errors
    /// Returns `DuplicateCorrelationId` if `id` is already pending, or
    /// `Closed` after [`close`](Self::close).
    pub fn register(self: &Arc<Self>, id: &str) -> Result<PendingReply, PoolError> {
        let mut waiters = self.lock();
        if waiters.closed {
            return Err(PoolError::Closed);
        }
        if waiters.pending.contains_key(id) {
            tracing::warn!(request_id = %id, "Duplicate correlation id rejected");
            return Err(PoolError::DuplicateCorrelationId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        waiters.pending.insert(id.to_string(), tx);
        tracing::debug!(
            request_id = %id,
            pending = waiters.pending.len(),
            "Registered pending reply"
        );

        Ok(PendingReply {
            id: id.to_string(),
            rx,
            pool: Arc::downgrade(self),
        })
    }

    /// Deliver `reply` to the waiter registered under `id`, at most once.
    pub fn resolve(&self, id: &str, reply: Delivery) -> Resolution {
        let waiter = self.lock().pending.remove(id);
        match waiter {
            Some(tx) => {
                if tx.send(reply).is_ok() {
                    tracing::debug!(request_id = %id, "Reply delivered");
                    Resolution::Delivered
                } else {
                    tracing::debug!(request_id = %id, "Reply arrived after waiter gave up");
                    Resolution::Abandoned
                }
            }
            None => {
                tracing::warn!(
                    request_id = %id,
                    response_type = ?reply.frame.response_type,
                    "Orphaned reply discarded"
                );
                Resolution::Orphaned
            }
        }
    }

    /// Forget the waiter for `id`. Returns whether one was pending.
    pub fn cancel(&self, id: &str) -> bool {
        self.lock().pending.remove(id).is_some()
    }

    /// Reject further registrations and drop every pending waiter.
    ///
    /// Returns how many waiters were dropped; each observes `Cancelled`.
    pub fn close(&self) -> usize {
        let mut waiters = self.lock();
        waiters.closed = true;
        let dropped = waiters.pending.len();
        waiters.pending.clear();
        dropped
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().pending.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Waitable half of a registered correlation.
///
/// Dropping it without a reply removes the entry, so a late reply becomes an orphan.
#[derive(Debug)]
pub struct PendingReply {
    id: RequestId,
    rx: oneshot::Receiver<Delivery>,
    pool: Weak<CorrelationPool>,
}

impl PendingReply {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply.
    ///
    /// # Errors
    /// Returns `Cancelled` if the pool dropped the waiter.
    pub async fn wait(mut self) -> Result<Delivery, PoolError> {
        (&mut self.rx)
            .await
            .map_err(|_| PoolError::Cancelled(self.id.clone()))
    }

    /// Wait for the reply, giving up after `timeout` if one is set.
    ///
    /// # Errors
    /// Returns `TimedOut` when the deadline passes, `Cancelled` if the pool
    /// dropped the waiter.
    pub async fn wait_timeout(self, timeout: Option<Duration>) -> Result<Delivery, PoolError> {
        let Some(timeout) = timeout else {
            return self.wait().await;
        };
        let id = self.id.clone();
        tokio::time::timeout(timeout, self.wait())
            .await
            .unwrap_or(Err(PoolError::TimedOut(id)))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            if pool.cancel(&self.id) {
                tracing::debug!(request_id = %self.id, "Pending reply abandoned");
            }
        }
    }
}
