//! A logical subscriber of the shared stream.

use std::{
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};

use stream_gateway_core::{Delivery, Identity, IdentityKey, IdentityUpdate};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::sink::{DeliveryFailure, SessionEvents, SinkError};

/// Named session with its partially-known identity and event channel.
pub struct Session {
    name: String,
    identity: RwLock<Identity>,
    sender: broadcast::Sender<Delivery>,
    failures: broadcast::Sender<DeliveryFailure>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        name: String,
        capacity: usize,
        failures: broadcast::Sender<DeliveryFailure>,
    ) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name,
            identity: RwLock::new(Identity::default()),
            sender,
            failures,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the identity bound so far.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True while no identity attribute is bound.
    #[must_use]
    pub fn is_unbound(&self) -> bool {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_unbound()
    }

    #[must_use]
    pub fn matches(&self, key: IdentityKey) -> bool {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matches(key)
    }

    /// Merge identity attributes; returns keys that became newly routable.
    pub(crate) fn apply(&self, update: &IdentityUpdate) -> Vec<IdentityKey> {
        self.identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(update)
    }

    /// Subscribe to this session's deliveries.
    #[must_use]
    pub fn subscribe(&self) -> SessionEvents {
        SessionEvents::new(self.name.clone(), self.sender.subscribe())
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Hand a delivery to every subscriber without waiting on any of them.
    ///
    /// Failures are logged and published on the failure channel, never returned
    /// to the dispatcher.
    pub(crate) fn deliver(&self, delivery: Delivery) -> bool {
        match self.sender.send(delivery) {
            Ok(receivers) => {
                tracing::debug!(session = %self.name, receivers, "Delivered push");
                true
            }
            Err(_) => {
                self.report(SinkError::NoSubscribers);
                false
            }
        }
    }

    fn report(&self, error: SinkError) {
        tracing::warn!(session = %self.name, "Delivery failed: {error}");
        let _ = self.failures.send(DeliveryFailure {
            session: self.name.clone(),
            error,
        });
    }

    /// Run `listener` for every delivery on its own task.
    ///
    /// Listener errors and lag are reported as [`DeliveryFailure`]s and do not
    /// stop the listener.
    pub fn spawn_listener<F, Fut>(
        self: &Arc<Self>,
        listener: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let mut receiver = self.sender.subscribe();
        let session = Arc::downgrade(self);
        let name = self.name.clone();

        tokio::spawn(async move {
            loop {
                let error = match receiver.recv().await {
                    Ok(delivery) => match listener(delivery).await {
                        Ok(()) => continue,
                        Err(e) => SinkError::Listener(e),
                    },
                    Err(RecvError::Lagged(n)) => SinkError::Lagged(n),
                    Err(RecvError::Closed) => break,
                };
                match session.upgrade() {
                    Some(session) => session.report(error),
                    None => break,
                }
            }
            tracing::debug!(session = %name, "Listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use stream_gateway_core::{ResponseType, StreamResponse};

    use super::*;

    fn push(data: &str) -> Delivery {
        StreamResponse::push(ResponseType::StatusNotify, data).into()
    }

    #[tokio::test]
    async fn test_delivery_without_subscribers_is_reported() {
        let (failures, mut failures_rx) = broadcast::channel(8);
        let session = Session::new("alice".into(), 8, failures);

        assert!(!session.deliver(push("{}")));
        let failure = failures_rx.recv().await.unwrap();
        assert_eq!(failure.session, "alice");
        assert_eq!(failure.error, SinkError::NoSubscribers);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_sees_lag() {
        let (failures, _) = broadcast::channel(8);
        let session = Session::new("alice".into(), 2, failures);
        let mut events = session.subscribe();

        for i in 0..4 {
            assert!(session.deliver(push(&format!("{{\"n\":{i}}}"))));
        }

        assert_eq!(events.recv().await, Err(SinkError::Lagged(2)));
        let next = events.recv().await.unwrap();
        assert_eq!(next.frame.data, r#"{"n":2}"#);
    }

    #[tokio::test]
    async fn test_failing_listener_keeps_running() {
        let (failures, mut failures_rx) = broadcast::channel(8);
        let session = Arc::new(Session::new("alice".into(), 8, failures));
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let _listener = session.spawn_listener(move |delivery| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if delivery.frame.data.contains("bad") {
                    Err("cannot handle".to_string())
                } else {
                    Ok(())
                }
            }
        });

        session.deliver(push(r#"{"bad":true}"#));
        let failure = failures_rx.recv().await.unwrap();
        assert_eq!(failure.error, SinkError::Listener("cannot handle".into()));

        session.deliver(push("{}"));
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
