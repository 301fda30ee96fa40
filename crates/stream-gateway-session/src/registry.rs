//! Registry of named sessions and the push routing policy.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use stream_gateway_core::{
    Attachment, Delivery, Identity, IdentityKey, IdentityUpdate, InboundMessage,
};
use tokio::sync::broadcast;

use crate::{session::Session, sink::DeliveryFailure};

/// Default number of targeted pushes held while no session matches their identity.
pub const DEFAULT_PARK_CAPACITY: usize = 256;

/// Default per-session event channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    NotFound(String),
}

/// Registry tuning.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Targeted pushes kept until a session binds their identity; 0 drops them.
    pub park_capacity: usize,
    /// Per-session event channel capacity.
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            park_capacity: DEFAULT_PARK_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// What happened to a routed push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to this many sessions.
    Delivered(usize),
    /// Held until a session binds the push's identity.
    Parked,
    /// No recipient and nowhere to keep it.
    Undeliverable,
    /// Replies belong to the correlation pool and are never routed here.
    NotRoutable,
}

struct ParkedPush {
    keys: Vec<IdentityKey>,
    identity: IdentityUpdate,
    delivery: Delivery,
}

/// Holds all sessions of one gateway.
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: RwLock<BTreeMap<String, Arc<Session>>>,
    parked: Mutex<VecDeque<ParkedPush>>,
    failures: broadcast::Sender<DeliveryFailure>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        let (failures, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            sessions: RwLock::new(BTreeMap::new()),
            parked: Mutex::new(VecDeque::new()),
            failures,
        }
    }

    /// Return the session called `name`, creating it on first use.
    pub fn create_session(&self, name: &str) -> Arc<Session> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(name) {
            tracing::debug!(session = %name, "Reusing existing session");
            return Arc::clone(existing);
        }
        let session = Arc::new(Session::new(
            name.to_string(),
            self.config.event_capacity,
            self.failures.clone(),
        ));
        sessions.insert(name.to_string(), Arc::clone(&session));
        tracing::info!(session = %name, "Session created");
        session
    }

    /// Forget the session called `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<Session>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_some() {
            tracing::info!(session = %name, "Session removed");
        }
        removed
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pushes waiting for an identity to be bound.
    #[must_use]
    pub fn parked_len(&self) -> usize {
        self.lock_parked().len()
    }

    /// Receiver for delivery failures of every session.
    #[must_use]
    pub fn failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.failures.subscribe()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Sessions that should receive `message`.
    ///
    /// - replies: none (they belong to the correlation pool);
    /// - identity assignment: every session with no bound attribute;
    /// - targeted: the session matching the first of the push's keys (uin, then QR code);
    /// - unaddressed: none.
    #[must_use]
    pub fn route(&self, message: &InboundMessage) -> Vec<Arc<Session>> {
        match message {
            InboundMessage::Reply { .. } | InboundMessage::Unaddressed { .. } => Vec::new(),
            InboundMessage::IdentityAssignment { .. } => self.unbound_sessions(),
            InboundMessage::Targeted { identity, .. } => self
                .find_by_keys(&identity.keys())
                .into_iter()
                .collect(),
        }
    }

    fn unbound_sessions(&self) -> Vec<Arc<Session>> {
        self.snapshot()
            .into_iter()
            .filter(|s| s.is_unbound())
            .collect()
    }

    fn find_by_keys(&self, keys: &[IdentityKey]) -> Option<Arc<Session>> {
        let sessions = self.snapshot();
        keys.iter()
            .find_map(|key| sessions.iter().find(|s| s.matches(*key)).cloned())
    }

    /// Route `message` and hand it to its recipients.
    ///
    /// Targeted pushes bind the identity attributes they carry onto their
    /// recipient. Targeted pushes nobody matches yet are parked until a bind
    /// makes them routable.
    pub fn deliver(&self, message: InboundMessage, attachment: Attachment) -> RouteOutcome {
        match message {
            InboundMessage::Reply { request_id, .. } => {
                tracing::warn!(%request_id, "Reply handed to session registry; ignoring");
                RouteOutcome::NotRoutable
            }
            InboundMessage::Unaddressed { reason, frame } => {
                tracing::warn!(
                    response_type = ?frame.response_type,
                    "Undeliverable push: {reason}"
                );
                RouteOutcome::Undeliverable
            }
            InboundMessage::IdentityAssignment { frame } => {
                let recipients = self.unbound_sessions();
                if recipients.is_empty() {
                    tracing::warn!(
                        response_type = ?frame.response_type,
                        "Undeliverable push: no unbound session"
                    );
                    return RouteOutcome::Undeliverable;
                }
                let delivery = Delivery::new(frame, attachment);
                for session in &recipients {
                    session.deliver(delivery.clone());
                }
                RouteOutcome::Delivered(recipients.len())
            }
            InboundMessage::Targeted {
                key,
                identity,
                frame,
            } => {
                // Route and park under the park lock so a concurrent bind
                // cannot drain the park in between.
                let mut parked = self.lock_parked();
                let delivery = Delivery::new(frame, attachment);
                match self.find_by_keys(&identity.keys()) {
                    Some(session) => {
                        bind_and_flush(&session, &identity, &mut parked);
                        session.deliver(delivery);
                        RouteOutcome::Delivered(1)
                    }
                    None => self.park(&mut parked, key, identity, delivery),
                }
            }
        }
    }

    /// Bind identity attributes onto the session called `name`.
    ///
    /// Returns the resulting identity. Parked pushes that become routable are
    /// delivered to the session in arrival order.
    ///
    /// # Errors
    /// Returns error if no such session exists.
    pub fn bind(&self, name: &str, update: &IdentityUpdate) -> Result<Identity, RegistryError> {
        let session = self
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let mut parked = self.lock_parked();
        bind_and_flush(&session, update, &mut parked);
        drop(parked);
        Ok(session.identity())
    }

    fn park(
        &self,
        parked: &mut VecDeque<ParkedPush>,
        key: IdentityKey,
        identity: IdentityUpdate,
        delivery: Delivery,
    ) -> RouteOutcome {
        if self.config.park_capacity == 0 {
            tracing::warn!(%key, "Undeliverable push: no session bound to identity");
            return RouteOutcome::Undeliverable;
        }

        while parked.len() >= self.config.park_capacity {
            if let Some(evicted) = parked.pop_front() {
                tracing::warn!(
                    key = ?evicted.keys,
                    "Undeliverable push: evicted from park"
                );
            }
        }
        tracing::debug!(%key, parked = parked.len() + 1, "Parked push until identity is bound");
        parked.push_back(ParkedPush {
            keys: identity.keys(),
            identity,
            delivery,
        });
        RouteOutcome::Parked
    }

    fn lock_parked(&self) -> MutexGuard<'_, VecDeque<ParkedPush>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Apply `update` and release every parked push it makes routable.
///
/// Released pushes bind their own attributes in turn, so a parked login
/// push that reveals a uin also releases the pushes parked under that uin.
fn bind_and_flush(
    session: &Arc<Session>,
    update: &IdentityUpdate,
    parked: &mut VecDeque<ParkedPush>,
) {
    let mut changed = session.apply(update);
    if changed.is_empty() {
        return;
    }
    tracing::info!(session = %session.name(), identity = ?session.identity(), "Identity bound");

    while !changed.is_empty() {
        let ready = take_parked(parked, &changed);
        changed.clear();
        for push in ready {
            changed.extend(session.apply(&push.identity));
            session.deliver(push.delivery);
        }
    }
    tracing::debug!(session = %session.name(), parked = parked.len(), "Parked pushes flushed");
}

/// Remove and return the parked pushes answering to any of `keys`, oldest first.
fn take_parked(parked: &mut VecDeque<ParkedPush>, keys: &[IdentityKey]) -> Vec<ParkedPush> {
    let (ready, waiting): (Vec<_>, Vec<_>) = parked
        .drain(..)
        .partition(|p| p.keys.iter().any(|k| keys.contains(k)));
    parked.extend(waiting);
    ready
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stream_gateway_core::{ResponseType, StreamResponse};

    use super::*;
    use crate::sink::SinkError;

    fn qrcode_push() -> InboundMessage {
        InboundMessage::classify(StreamResponse::push(
            ResponseType::LoginQrcode,
            json!({ "qrcodeId": 7, "qrcode": "" }).to_string(),
        ))
    }

    fn targeted(payload: &serde_json::Value) -> InboundMessage {
        InboundMessage::classify(StreamResponse::push(
            ResponseType::MessageReceive,
            payload.to_string(),
        ))
    }

    #[test]
    fn test_create_session_is_idempotent() {
        let registry = SessionRegistry::default();
        let first = registry.create_session("alice");
        let second = registry.create_session("alice");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_identity_assignment_reaches_all_unbound() {
        let registry = SessionRegistry::default();
        let names = ["a", "b", "c"];
        let mut events: Vec<_> = names
            .iter()
            .map(|n| registry.create_session(n).subscribe())
            .collect();

        assert_eq!(
            registry.deliver(qrcode_push(), Attachment::None),
            RouteOutcome::Delivered(3)
        );
        for rx in &mut events {
            assert!(rx.try_recv().unwrap().is_some());
        }

        registry.bind("b", &IdentityUpdate::qrcode(7)).unwrap();
        assert_eq!(
            registry.deliver(qrcode_push(), Attachment::None),
            RouteOutcome::Delivered(2)
        );
        assert!(events[0].try_recv().unwrap().is_some());
        assert!(events[1].try_recv().unwrap().is_none());
        assert!(events[2].try_recv().unwrap().is_some());
    }

    #[test]
    fn test_replies_are_never_routed() {
        let registry = SessionRegistry::default();
        let _alice = registry.create_session("alice");
        let reply = InboundMessage::classify(StreamResponse::reply(
            "r1",
            ResponseType::ContactList,
            "[]",
        ));
        assert!(registry.route(&reply).is_empty());
        assert_eq!(
            registry.deliver(reply, Attachment::None),
            RouteOutcome::NotRoutable
        );
    }

    #[test]
    fn test_targeted_push_binds_and_routes() {
        let registry = SessionRegistry::default();
        let alice = registry.create_session("alice");
        let bob = registry.create_session("bob");
        let mut alice_rx = alice.subscribe();
        let mut bob_rx = bob.subscribe();

        registry.bind("alice", &IdentityUpdate::qrcode(7)).unwrap();
        let login = targeted(&json!({ "qrcodeId": 7, "uin": 42, "userName": "wxid_alice" }));
        assert_eq!(
            registry.deliver(login, Attachment::None),
            RouteOutcome::Delivered(1)
        );
        assert_eq!(alice.identity().uin, 42);
        assert_eq!(alice.identity().user_name, "wxid_alice");
        assert!(alice_rx.try_recv().unwrap().is_some());

        let message = targeted(&json!({ "uin": 42, "content": "hi" }));
        assert_eq!(
            registry.deliver(message, Attachment::None),
            RouteOutcome::Delivered(1)
        );
        assert!(alice_rx.try_recv().unwrap().is_some());
        assert!(bob_rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_unmatched_push_is_parked_until_bound() {
        let registry = SessionRegistry::default();
        let alice = registry.create_session("alice");
        let mut alice_rx = alice.subscribe();

        let early = targeted(&json!({ "uin": 42, "content": "early" }));
        assert_eq!(
            registry.deliver(early, Attachment::None),
            RouteOutcome::Parked
        );
        assert_eq!(registry.parked_len(), 1);
        assert!(alice_rx.try_recv().unwrap().is_none());

        registry.bind("alice", &IdentityUpdate::uin(42)).unwrap();
        assert_eq!(registry.parked_len(), 0);
        let delivered = alice_rx.try_recv().unwrap().unwrap();
        assert!(delivered.frame.data.contains("early"));
    }

    #[test]
    fn test_flushed_login_releases_pushes_for_its_uin() {
        let registry = SessionRegistry::default();
        let alice = registry.create_session("alice");
        let mut alice_rx = alice.subscribe();

        let login = targeted(&json!({ "qrcodeId": 9, "uin": 42 }));
        let message = targeted(&json!({ "uin": 42, "content": "hi" }));
        assert_eq!(registry.deliver(login, Attachment::None), RouteOutcome::Parked);
        assert_eq!(registry.deliver(message, Attachment::None), RouteOutcome::Parked);

        let identity = registry.bind("alice", &IdentityUpdate::qrcode(9)).unwrap();
        assert_eq!(identity.uin, 42);
        assert_eq!(registry.parked_len(), 0);

        let first = alice_rx.try_recv().unwrap().unwrap();
        let second = alice_rx.try_recv().unwrap().unwrap();
        assert!(first.frame.data.contains("qrcodeId"));
        assert!(second.frame.data.contains("hi"));
    }

    #[test]
    fn test_concurrent_bind_never_strands_a_push() {
        for _ in 0..200 {
            let registry = SessionRegistry::default();
            let alice = registry.create_session("alice");
            let mut alice_rx = alice.subscribe();

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    registry.deliver(targeted(&json!({ "uin": 42 })), Attachment::None)
                });
                scope.spawn(|| registry.bind("alice", &IdentityUpdate::uin(42)).unwrap());
            });

            assert_eq!(registry.parked_len(), 0);
            assert!(alice_rx.try_recv().unwrap().is_some());
        }
    }

    #[test]
    fn test_removed_session_is_no_longer_routed() {
        let registry = SessionRegistry::default();
        let _alice = registry.create_session("alice");

        assert!(registry.remove("alice").is_some());
        assert!(registry.remove("alice").is_none());
        assert!(registry.get("alice").is_none());
        assert_eq!(
            registry.deliver(qrcode_push(), Attachment::None),
            RouteOutcome::Undeliverable
        );
    }

    #[test]
    fn test_park_is_bounded() {
        let registry = SessionRegistry::new(RegistryConfig {
            park_capacity: 2,
            ..RegistryConfig::default()
        });
        for uin in 1..=3 {
            registry.deliver(targeted(&json!({ "uin": uin })), Attachment::None);
        }
        assert_eq!(registry.parked_len(), 2);

        let alice = registry.create_session("alice");
        let mut rx = alice.subscribe();
        registry.bind("alice", &IdentityUpdate::uin(1)).unwrap();
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_parking_disabled_drops() {
        let registry = SessionRegistry::new(RegistryConfig {
            park_capacity: 0,
            ..RegistryConfig::default()
        });
        assert_eq!(
            registry.deliver(targeted(&json!({ "uin": 9 })), Attachment::None),
            RouteOutcome::Undeliverable
        );
        assert_eq!(registry.parked_len(), 0);
    }

    #[test]
    fn test_unaddressed_and_unclaimed_pushes_are_undeliverable() {
        let registry = SessionRegistry::default();
        let anonymous = targeted(&json!({ "status": "ok" }));
        assert_eq!(
            registry.deliver(anonymous, Attachment::None),
            RouteOutcome::Undeliverable
        );
        assert_eq!(
            registry.deliver(qrcode_push(), Attachment::None),
            RouteOutcome::Undeliverable
        );
    }

    #[tokio::test]
    async fn test_missing_subscriber_is_reported_not_raised() {
        let registry = SessionRegistry::default();
        let mut failures = registry.failures();
        let _alice = registry.create_session("alice");

        assert_eq!(
            registry.deliver(qrcode_push(), Attachment::None),
            RouteOutcome::Delivered(1)
        );
        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.session, "alice");
        assert_eq!(failure.error, SinkError::NoSubscribers);
    }

    #[test]
    fn test_bind_unknown_session() {
        let registry = SessionRegistry::default();
        assert!(matches!(
            registry.bind("ghost", &IdentityUpdate::uin(1)),
            Err(RegistryError::NotFound(name)) if name == "ghost"
        ));
    }
}
