//! In-process loopback backend.
//!
//! Useful for tests and demos: every connection opened through
//! [`MemoryBackend`] shares one scripted server side that records requests
//! and lets the caller push frames onto the live subscription.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use futures::StreamExt;
use stream_gateway_core::{
    FrameStream, InitConfig, RequestObject, ResponseObject, ResponseType, StreamResponse,
    TransportError, UpstreamClient, UpstreamConnector, traits::INVALID_TOKEN,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type FrameSender = mpsc::UnboundedSender<Result<StreamResponse, TransportError>>;
type Responder = Box<dyn Fn(&RequestObject) -> Vec<StreamResponse> + Send + Sync>;

/// How the backend acknowledges unary requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// `result: true`.
    #[default]
    Accept,
    /// `result: false`.
    Reject,
    /// Fail the call with this error.
    Fail(TransportError),
}

impl AckPolicy {
    /// Fail calls the way the backend reports an expired token.
    #[must_use]
    pub fn invalid_token() -> Self {
        Self::Fail(TransportError::Status {
            code: 16,
            details: INVALID_TOKEN.to_string(),
        })
    }
}

#[derive(Default)]
struct Inner {
    connections: AtomicUsize,
    requests: Mutex<Vec<RequestObject>>,
    subscriptions: Mutex<Vec<InitConfig>>,
    stream: Mutex<Option<FrameSender>>,
    ack: Mutex<AckPolicy>,
    connect_error: Mutex<Option<TransportError>>,
    responder: Mutex<Option<Responder>>,
    request_tx: Mutex<Option<mpsc::UnboundedSender<RequestObject>>>,
}

/// Scripted backend implementing [`UpstreamConnector`].
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    /// Create a backend that accepts every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physical connections opened so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Subscriptions opened so far, oldest first.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<InitConfig> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Requests received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<RequestObject> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receive every request from now on as it arrives.
    #[must_use]
    pub fn watch_requests(&self) -> mpsc::UnboundedReceiver<RequestObject> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .inner
            .request_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    pub fn set_ack(&self, policy: AckPolicy) {
        *self.inner.ack.lock().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// Make the next connection attempts fail.
    pub fn fail_connect(&self, error: Option<TransportError>) {
        *self
            .inner
            .connect_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Answer accepted requests with the frames `responder` returns.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&RequestObject) -> Vec<StreamResponse> + Send + Sync + 'static,
    {
        *self
            .inner
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(responder));
    }

    /// Push a frame on the live subscription. Returns false if none is open.
    pub fn push(&self, frame: StreamResponse) -> bool {
        self.send(Ok(frame))
    }

    /// Push a reply correlated to `request`.
    pub fn reply_to(
        &self,
        request: &RequestObject,
        response_type: ResponseType,
        data: &str,
    ) -> bool {
        self.push(StreamResponse::reply(
            request.request_id.clone(),
            response_type,
            data,
        ))
    }

    /// Emit a stream error; the subscription ends afterwards.
    pub fn fail_stream(&self, error: TransportError) -> bool {
        let sent = self.send(Err(error));
        self.end_stream();
        sent
    }

    /// Close the live subscription.
    pub fn end_stream(&self) {
        self.inner
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn send(&self, item: Result<StreamResponse, TransportError>) -> bool {
        self.inner
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(item).is_ok())
    }
}

#[async_trait]
impl UpstreamConnector for MemoryBackend {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn UpstreamClient>, TransportError> {
        if let Some(error) = self
            .inner
            .connect_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(error);
        }
        let n = self.inner.connections.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(%endpoint, connections = n, "Loopback connection opened");
        Ok(Arc::new(MemoryClient {
            backend: self.clone(),
        }))
    }
}

/// Client half handed out by [`MemoryBackend::connect`].
struct MemoryClient {
    backend: MemoryBackend,
}

#[async_trait]
impl UpstreamClient for MemoryClient {
    async fn request(&self, request: RequestObject) -> Result<ResponseObject, TransportError> {
        let inner = &self.backend.inner;
        inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if let Some(tx) = inner
            .request_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.send(request.clone());
        }

        let policy = inner.ack.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match policy {
            AckPolicy::Accept => {}
            AckPolicy::Reject => return Ok(ResponseObject { result: false }),
            AckPolicy::Fail(error) => return Err(error),
        }

        let replies = inner
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|respond| respond(&request))
            .unwrap_or_default();
        for reply in replies {
            self.backend.push(reply);
        }
        Ok(ResponseObject { result: true })
    }

    async fn subscribe(&self, config: InitConfig) -> Result<FrameStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = &self.backend.inner;
        inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(config);
        *inner.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
