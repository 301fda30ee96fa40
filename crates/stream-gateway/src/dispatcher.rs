//! Reads the shared stream and routes every frame.

use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use stream_gateway_core::{
    Attachment, AttachmentStore, Delivery, FrameStream, InboundMessage, StreamResponse,
    TokenRefresher, TransportError,
};
use stream_gateway_session::{RouteOutcome, SessionRegistry};
use tokio::sync::{broadcast, oneshot};

use crate::pool::{CorrelationPool, Resolution};

/// Lifecycle of the physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The stream was opened.
    Established { endpoint: String },
    /// The stream failed; it is no longer read.
    Error(TransportError),
    /// The backend closed the stream.
    Ended,
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Resolved(Resolution),
    Routed(RouteOutcome),
}

/// Routes inbound frames to the correlation pool or to sessions.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<CorrelationPool>,
    registry: Arc<SessionRegistry>,
    attachments: Option<Arc<dyn AttachmentStore>>,
    refresher: Arc<dyn TokenRefresher>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        pool: Arc<CorrelationPool>,
        registry: Arc<SessionRegistry>,
        refresher: Arc<dyn TokenRefresher>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            pool,
            registry,
            attachments: None,
            refresher,
            events,
        }
    }

    #[must_use]
    pub fn with_attachments(mut self, store: Option<Arc<dyn AttachmentStore>>) -> Self {
        self.attachments = store;
        self
    }

    /// Spawn the read loop on `stream`.
    ///
    /// The loop ends on the first stream error, at end of stream, or when
    /// `shutdown_rx` fires.
    #[must_use]
    pub fn spawn(
        self,
        stream: FrameStream,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.read_loop(stream, shutdown_rx).await })
    }

    async fn read_loop(&self, mut stream: FrameStream, shutdown_rx: oneshot::Receiver<()>) {
        let mut shutdown_rx = shutdown_rx.fuse();

        loop {
            tokio::select! {
                next = stream.next() => {
                    match next {
                        Some(Ok(frame)) => {
                            self.dispatch(frame).await;
                        }
                        Some(Err(e)) => {
                            tracing::error!("Upstream stream error: {e}");
                            if e.is_invalid_token() {
                                self.refresh_token().await;
                            }
                            let _ = self.events.send(ConnectionEvent::Error(e));
                            break;
                        }
                        None => {
                            tracing::error!("Upstream stream ended");
                            let _ = self.events.send(ConnectionEvent::Ended);
                            break;
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::debug!("Dispatcher shutting down");
                    break;
                }
            }
        }
    }

    /// Route a single frame. Never fails; problems are logged and reported
    /// through the pool, the registry, or the attachment state.
    pub async fn dispatch(&self, frame: StreamResponse) -> DispatchOutcome {
        tracing::debug!(
            request_id = %frame.request_id,
            response_type = ?frame.response_type,
            bytes = frame.data.len(),
            "Inbound frame"
        );
        let message = InboundMessage::classify(frame);
        let attachment = self.materialize(message.frame()).await;

        match message {
            InboundMessage::Reply { request_id, frame } => DispatchOutcome::Resolved(
                self.pool
                    .resolve(&request_id, Delivery::new(frame, attachment)),
            ),
            push => DispatchOutcome::Routed(self.registry.deliver(push, attachment)),
        }
    }

    async fn materialize(&self, frame: &StreamResponse) -> Attachment {
        let Some(store) = &self.attachments else {
            return Attachment::None;
        };
        match store.materialize(frame).await {
            Ok(Some(path)) => Attachment::Saved(path),
            Ok(None) => Attachment::None,
            Err(e) => {
                tracing::warn!(
                    response_type = ?frame.response_type,
                    "Attachment materialization failed: {e}"
                );
                Attachment::Failed(e.to_string())
            }
        }
    }

    async fn refresh_token(&self) {
        tracing::warn!("Upstream reported INVALID_TOKEN; requesting refresh");
        if let Err(e) = self.refresher.refresh().await {
            tracing::error!("Token refresh failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use serde_json::json;
    use stream_gateway_core::{AttachmentError, ResponseType, traits::LogOnlyRefresher};

    use super::*;

    struct FailingStore;

    #[async_trait]
    impl AttachmentStore for FailingStore {
        async fn materialize(
            &self,
            _frame: &StreamResponse,
        ) -> Result<Option<PathBuf>, AttachmentError> {
            Err(AttachmentError::Decode("corrupt".into()))
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<CorrelationPool>, Arc<SessionRegistry>) {
        let pool = CorrelationPool::new();
        let registry = Arc::new(SessionRegistry::default());
        let (events, _) = broadcast::channel(8);
        let dispatcher = Dispatcher::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::new(LogOnlyRefresher),
            events,
        );
        (dispatcher, pool, registry)
    }

    #[tokio::test]
    async fn test_reply_resolves_pending_request() {
        let (dispatcher, pool, _) = dispatcher();
        let waiter = pool.register("r1").unwrap();

        let outcome = dispatcher
            .dispatch(StreamResponse::reply("r1", ResponseType::ContactList, "[]"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Resolved(Resolution::Delivered));
        assert_eq!(waiter.wait().await.unwrap().frame.data, "[]");
    }

    #[tokio::test]
    async fn test_orphaned_reply_is_not_fatal() {
        let (dispatcher, _, _) = dispatcher();
        let outcome = dispatcher
            .dispatch(StreamResponse::reply("ghost", ResponseType::ContactList, "[]"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Resolved(Resolution::Orphaned));
    }

    #[tokio::test]
    async fn test_attachment_failure_still_delivers() {
        let (dispatcher, _, registry) = dispatcher();
        let dispatcher = dispatcher.with_attachments(Some(Arc::new(FailingStore)));
        let mut events = registry.create_session("alice").subscribe();

        let frame = StreamResponse::push(
            ResponseType::LoginQrcode,
            json!({ "qrcode": "???" }).to_string(),
        );
        assert_eq!(
            dispatcher.dispatch(frame).await,
            DispatchOutcome::Routed(RouteOutcome::Delivered(1))
        );
        let delivery = events.recv().await.unwrap();
        assert!(matches!(delivery.attachment, Attachment::Failed(_)));
    }

    #[tokio::test]
    async fn test_read_loop_reports_terminal_events() {
        let (dispatcher, pool, _) = dispatcher();
        let mut events = dispatcher.events.subscribe();
        let waiter = pool.register("r1").unwrap();

        let frames: Vec<Result<StreamResponse, TransportError>> = vec![
            Ok(StreamResponse::push(ResponseType::StatusNotify, "garbage")),
            Err(TransportError::Closed),
        ];
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        dispatcher
            .spawn(futures::stream::iter(frames).boxed(), shutdown_rx)
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Error(TransportError::Closed)
        );
        // terminal stream events leave pending requests alone
        assert!(pool.contains(waiter.id()));
    }

    #[tokio::test]
    async fn test_read_loop_reports_end_of_stream() {
        let (dispatcher, _, _) = dispatcher();
        let mut events = dispatcher.events.subscribe();
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        dispatcher
            .spawn(
                futures::stream::empty::<Result<StreamResponse, TransportError>>().boxed(),
                shutdown_rx,
            )
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Ended);
    }
}
