//! Public facade: one shared upstream connection, many sessions.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use serde_json::Value;
use stream_gateway_core::{
    ApiType, AttachmentStore, Delivery, Identity, IdentityUpdate, InitConfig, RequestObject,
    TokenRefresher, TransportError, UpstreamClient, UpstreamConnector, traits::LogOnlyRefresher,
};
use stream_gateway_session::{DeliveryFailure, Session, SessionEvents, SessionRegistry, SinkError};
use stream_gateway_transport::FileAttachmentStore;
use tokio::{
    sync::{OnceCell, broadcast, oneshot},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    config::{Credentials, GatewayConfig},
    dispatcher::{ConnectionEvent, Dispatcher},
    error::GatewayError,
    pool::CorrelationPool,
};

/// The established physical connection.
struct Connection {
    credentials: Credentials,
    client: Arc<dyn UpstreamClient>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn check(&self, token: &str, endpoint: &str) -> Result<(), GatewayError> {
        if self.credentials.token == token && self.credentials.endpoint == endpoint {
            return Ok(());
        }
        tracing::warn!(
            connected = %self.credentials.endpoint,
            requested = %endpoint,
            "Attach rejected: gateway is bound to another identity"
        );
        Err(GatewayError::ConnectionMismatch {
            endpoint: self.credentials.endpoint.clone(),
        })
    }

    fn is_reading(&self) -> bool {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|reader| !reader.is_finished())
    }
}

/// Multiplexes many logical sessions over one upstream stream.
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct Gateway {
    config: GatewayConfig,
    connector: Arc<dyn UpstreamConnector>,
    refresher: Arc<dyn TokenRefresher>,
    attachments: Option<Arc<dyn AttachmentStore>>,
    registry: Arc<SessionRegistry>,
    pool: Arc<CorrelationPool>,
    events: broadcast::Sender<ConnectionEvent>,
    connection: OnceCell<Connection>,
    closed: AtomicBool,
}

impl Gateway {
    /// Create a gateway that connects through `connector` on first attach.
    #[must_use]
    pub fn new(connector: Arc<dyn UpstreamConnector>, config: GatewayConfig) -> Self {
        let attachments = config
            .attachment_dir
            .as_ref()
            .map(|dir| {
                Arc::new(FileAttachmentStore::new(dir.clone())) as Arc<dyn AttachmentStore>
            });
        let (events, _) = broadcast::channel(config.connection_event_capacity.max(1));

        Self {
            registry: Arc::new(SessionRegistry::new(config.registry_config())),
            pool: CorrelationPool::new(),
            refresher: Arc::new(LogOnlyRefresher),
            connector,
            attachments,
            events,
            connection: OnceCell::new(),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Use `refresher` when the backend reports `INVALID_TOKEN`.
    #[must_use]
    pub fn with_token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = refresher;
        self
    }

    /// Materialize attachments through `store` instead of the configured directory.
    #[must_use]
    pub fn with_attachment_store(mut self, store: Arc<dyn AttachmentStore>) -> Self {
        self.attachments = Some(store);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Register session `name` on the shared connection.
    ///
    /// The first call opens the connection and its stream. Later calls must
    /// pass the same token and endpoint; attaching an existing name returns
    /// another handle to the same session.
    ///
    /// # Errors
    /// Returns `ConnectionMismatch` if the gateway is connected with other
    /// credentials, `NotConnected` after shutdown, or the error that prevented
    /// the connection from opening. A session created by a failed call is
    /// removed again.
    pub async fn attach(
        &self,
        token: &str,
        endpoint: &str,
        name: &str,
    ) -> Result<SessionHandle, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConnected);
        }
        if let Some(connection) = self.connection.get() {
            connection.check(token, endpoint)?;
        }

        // Subscribe before the stream opens so the first pushes are not missed.
        let created = self.registry.get(name).is_none();
        let session = self.registry.create_session(name);
        let events = session.subscribe();

        let connected = self
            .connection
            .get_or_try_init(|| self.connect(token, endpoint))
            .await
            .and_then(|connection| connection.check(token, endpoint));
        if let Err(e) = connected {
            if created {
                self.registry.remove(name);
            }
            return Err(e);
        }

        tracing::info!(session = %name, %endpoint, "Session attached");
        Ok(SessionHandle {
            session,
            events,
            registry: Arc::clone(&self.registry),
        })
    }

    async fn connect(&self, token: &str, endpoint: &str) -> Result<Connection, GatewayError> {
        tracing::info!(%endpoint, "Opening upstream connection");
        let client = self.connector.connect(endpoint).await?;
        let stream = match client
            .subscribe(InitConfig {
                token: token.to_string(),
            })
            .await
        {
            Ok(stream) => stream,
            Err(e) => return Err(self.upstream_error(e).await),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let reader = Dispatcher::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.registry),
            Arc::clone(&self.refresher),
            self.events.clone(),
        )
        .with_attachments(self.attachments.clone())
        .spawn(stream, shutdown_rx);

        let _ = self.events.send(ConnectionEvent::Established {
            endpoint: endpoint.to_string(),
        });
        tracing::info!(%endpoint, "Upstream stream established");

        Ok(Connection {
            credentials: Credentials::new(token, endpoint),
            client,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Send a request on the shared connection.
    ///
    /// APIs that answer on the stream (`GET_CONTACT`) suspend until their
    /// correlated reply arrives and return it. Every other API returns `None`
    /// once the backend acknowledges the send.
    ///
    /// # Errors
    /// Returns `NotConnected` before the first attach or after shutdown,
    /// `Rejected` if the backend did not accept the request, `InvalidToken`
    /// after the refresher was notified, `Transport` on other send failures,
    /// and `Pool` errors when the wait times out or the gateway shuts down.
    pub async fn request(
        &self,
        api_type: ApiType,
        params: Option<&Value>,
    ) -> Result<Option<Delivery>, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConnected);
        }
        let connection = self.connection.get().ok_or(GatewayError::NotConnected)?;
        let request_id = Uuid::new_v4().to_string();
        let request = RequestObject::new(
            connection.credentials.token.as_str(),
            api_type,
            params,
            request_id.as_str(),
        )?;

        // Registered before sending: the reply may beat the acknowledgement.
        let pending = if api_type.expects_reply() {
            Some(self.pool.register(&request_id)?)
        } else {
            None
        };

        tracing::debug!(%request_id, ?api_type, "Sending request");
        let ack = match connection.client.request(request).await {
            Ok(ack) => ack,
            Err(e) => return Err(self.upstream_error(e).await),
        };
        if !ack.result {
            tracing::warn!(%request_id, ?api_type, "Request rejected by upstream");
            return Err(GatewayError::Rejected(request_id));
        }

        match pending {
            Some(pending) => {
                let reply = pending.wait_timeout(self.config.request_timeout).await?;
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }

    async fn upstream_error(&self, error: TransportError) -> GatewayError {
        if !error.is_invalid_token() {
            tracing::error!("Upstream call failed: {error}");
            return GatewayError::Transport(error);
        }
        tracing::warn!("Upstream reported INVALID_TOKEN; requesting refresh");
        if let Err(e) = self.refresher.refresh().await {
            tracing::error!("Token refresh failed: {e}");
        }
        GatewayError::InvalidToken
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Number of requests still waiting for their reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pool.len()
    }

    /// Connection lifecycle events from now on.
    #[must_use]
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Delivery failures of every session from now on.
    #[must_use]
    pub fn delivery_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.registry.failures()
    }

    /// Whether the stream is open and still being read.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.connection.get().is_some_and(Connection::is_reading)
    }

    /// Stop reading the stream and cancel every pending request.
    ///
    /// The gateway cannot be reconnected; create a new one instead.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = self.pool.close();

        if let Some(connection) = self.connection.get() {
            let shutdown_tx = connection
                .shutdown_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(tx) = shutdown_tx {
                let _ = tx.send(());
            }
            let reader = connection
                .reader
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(reader) = reader {
                if let Err(e) = reader.await {
                    tracing::error!("Dispatcher task failed: {e}");
                }
            }
        }
        tracing::info!(cancelled, "Gateway shut down");
    }
}

/// Caller-side view of one attached session.
pub struct SessionHandle {
    session: Arc<Session>,
    events: SessionEvents,
    registry: Arc<SessionRegistry>,
}

impl SessionHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        self.session.name()
    }

    /// Snapshot of the identity bound so far.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.session.identity()
    }

    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Wait for the next delivery routed to this session.
    ///
    /// # Errors
    /// Returns `SinkError::Lagged` if deliveries were skipped, `SinkError::Closed`
    /// once the session is gone.
    pub async fn recv(&mut self) -> Result<Delivery, SinkError> {
        self.events.recv().await
    }

    /// Next queued delivery, if any.
    ///
    /// # Errors
    /// Same as [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<Option<Delivery>, SinkError> {
        self.events.try_recv()
    }

    /// Claim a delivered login QR code so pushes for it reach only this session.
    ///
    /// # Errors
    /// Returns error if the session is no longer registered.
    pub fn claim_qrcode(&self, qrcode_id: u64) -> Result<Identity, GatewayError> {
        self.bind(&IdentityUpdate::qrcode(qrcode_id))
    }

    /// Bind identity attributes onto this session.
    ///
    /// # Errors
    /// Returns error if the session is no longer registered.
    pub fn bind(&self, update: &IdentityUpdate) -> Result<Identity, GatewayError> {
        Ok(self.registry.bind(self.session.name(), update)?)
    }

    /// Give up the handle, keeping its event receiver.
    #[must_use]
    pub fn into_events(self) -> SessionEvents {
        self.events
    }

    /// Run `listener` for every delivery to this session on its own task.
    ///
    /// Listener errors are published as [`DeliveryFailure`]s.
    pub fn spawn_listener<F, Fut>(&self, listener: F) -> JoinHandle<()>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.session.spawn_listener(listener)
    }
}
