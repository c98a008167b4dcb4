//! Sessions and their frontend-facing projections
//!
//! A [`Session`] is the server-side state of one client connection: a process
//! local id, the owning frontend id, an optional bound uid and a bag of
//! settings. Sessions are owned by the
//! [`SessionService`](crate::session_service::SessionService); their identity
//! mutations (`bind`, `unbind`, `close`) are only reachable through it so the
//! uid index can never drift from the sessions themselves.
//!
//! Application code works on a [`FrontendSession`], a deep copy that only
//! reaches the live session again through an explicit `push`/`push_all`.

use crate::connector::Socket;
use crate::error::SessionError;
use crate::session_service::SessionService;
use log::debug;
use relay_shared::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use tokio::sync::mpsc;

pub type SessionId = u32;

pub type Settings = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inited,
    Closed,
}

/// Notifications emitted on identity and lifecycle changes.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Bound {
        sid: SessionId,
        uid: String,
    },
    Unbound {
        sid: SessionId,
        uid: String,
    },
    Closed {
        session: FrontendSession,
        reason: String,
    },
}

/// Subscriber list for [`SessionEvent`]s, owned by the session service.
///
/// Events are queued on unbounded channels, so a subscriber only observes them
/// after the mutating call has returned.
#[derive(Debug, Default)]
pub struct Notifier {
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl Notifier {
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: SessionEvent) {
        // Dropped receivers unsubscribe themselves
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    frontend_id: String,
    uid: Option<String>,
    settings: Settings,
    socket: Socket,
    state: SessionState,
}

impl Session {
    pub(crate) fn new(id: SessionId, frontend_id: &str, socket: Socket) -> Self {
        Self {
            id,
            frontend_id: frontend_id.to_string(),
            uid: None,
            settings: Settings::new(),
            socket,
            state: SessionState::Inited,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn frontend_id(&self) -> &str {
        &self.frontend_id
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.socket.remote_address()
    }

    pub(crate) fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    pub(crate) fn into_socket(self) -> Socket {
        self.socket
    }

    pub(crate) fn bind(&mut self, uid: &str, notifier: &mut Notifier) {
        self.uid = Some(uid.to_string());
        notifier.emit(SessionEvent::Bound {
            sid: self.id,
            uid: uid.to_string(),
        });
    }

    pub(crate) fn unbind(&mut self, uid: &str, notifier: &mut Notifier) {
        self.uid = None;
        notifier.emit(SessionEvent::Unbound {
            sid: self.id,
            uid: uid.to_string(),
        });
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.settings.insert(key.into(), value);
    }

    /// Merges a bag of settings key by key.
    pub fn set_all(&mut self, bag: Settings) {
        for (key, value) in bag {
            self.settings.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    pub fn send(&mut self, envelope: &Envelope) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.socket.send(envelope)
    }

    pub fn send_batch(&mut self, envelopes: &[Envelope]) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.socket.send_batch(envelopes)
    }

    /// Moves the session to `Closed`, emits the closed notification and lets
    /// the socket flush its final notice. Returns false if already closed.
    ///
    /// Transport teardown is left to the caller, which defers it.
    pub(crate) fn close(&mut self, reason: &str, notifier: &mut Notifier) -> bool {
        debug!(
            "session on [{}] is closed with session id: {}",
            self.frontend_id, self.id
        );
        if self.state == SessionState::Closed {
            return false;
        }

        self.state = SessionState::Closed;
        notifier.emit(SessionEvent::Closed {
            session: self.to_frontend_session(),
            reason: reason.to_string(),
        });
        self.socket.closing(reason);
        true
    }

    pub fn to_frontend_session(&self) -> FrontendSession {
        FrontendSession {
            id: self.id,
            frontend_id: self.frontend_id.clone(),
            uid: self.uid.clone(),
            settings: self.settings.clone(),
        }
    }
}

/// Detached copy of a session handed to application code.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontendSession {
    pub id: SessionId,
    pub frontend_id: String,
    pub uid: Option<String>,
    settings: Settings,
}

impl FrontendSession {
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.settings.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Binds through the store; the local uid changes only on success.
    pub fn bind(&mut self, service: &mut SessionService, uid: &str) -> Result<(), SessionError> {
        service.bind(self.id, uid)?;
        self.uid = Some(uid.to_string());
        Ok(())
    }

    pub fn unbind(&mut self, service: &mut SessionService, uid: &str) -> Result<(), SessionError> {
        service.unbind(self.id, uid)?;
        self.uid = None;
        Ok(())
    }

    /// Commits one local setting back to the live session.
    pub fn push(&self, service: &mut SessionService, key: &str) -> Result<(), SessionError> {
        let value = self.get(key).cloned().unwrap_or(Value::Null);
        service.import(self.id, key, value)
    }

    pub fn push_all(&self, service: &mut SessionService) -> Result<(), SessionError> {
        service.import_all(self.id, self.settings.clone())
    }

    pub fn export(&self) -> ExportedSession {
        ExportedSession {
            id: self.id,
            frontend_id: self.frontend_id.clone(),
            uid: self.uid.clone(),
            settings: self.settings.clone(),
        }
    }
}

/// The only session fields serialized across process boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedSession {
    pub id: SessionId,
    pub frontend_id: String,
    pub uid: Option<String>,
    pub settings: Settings,
}

impl From<ExportedSession> for FrontendSession {
    fn from(exported: ExportedSession) -> Self {
        Self {
            id: exported.id,
            frontend_id: exported.frontend_id,
            uid: exported.uid,
            settings: exported.settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::tests::MockTransport;
    use serde_json::json;

    fn test_session(id: SessionId) -> (Session, MockTransport) {
        let transport = MockTransport::default();
        let socket = Socket::stream(id, Box::new(transport.clone()));
        (Session::new(id, "connector-1", socket), transport)
    }

    #[test]
    fn test_session_creation() {
        let (session, _) = test_session(4);
        assert_eq!(session.id(), 4);
        assert_eq!(session.frontend_id(), "connector-1");
        assert_eq!(session.uid(), None);
        assert!(session.settings().is_empty());
        assert_eq!(session.state(), SessionState::Inited);
    }

    #[test]
    fn test_set_single_and_bag() {
        let (mut session, _) = test_session(1);
        session.set("area", json!(3));

        let mut bag = Settings::new();
        bag.insert("area".into(), json!(5));
        bag.insert("role".into(), json!("mage"));
        session.set_all(bag);

        assert_eq!(session.get("area"), Some(&json!(5)));
        assert_eq!(session.get("role"), Some(&json!("mage")));
        assert_eq!(session.get("missing"), None);
    }

    #[test]
    fn test_bind_emits_events() {
        let (mut session, _) = test_session(1);
        let mut notifier = Notifier::default();
        let mut rx = notifier.subscribe();

        session.bind("alice", &mut notifier);
        assert_eq!(session.uid(), Some("alice"));
        session.unbind("alice", &mut notifier);
        assert_eq!(session.uid(), None);

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Bound {
                sid: 1,
                uid: "alice".into()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Unbound {
                sid: 1,
                uid: "alice".into()
            }
        );
    }

    #[test]
    fn test_notifier_drops_closed_subscribers() {
        let mut notifier = Notifier::default();
        let rx = notifier.subscribe();
        drop(rx);
        let mut live = notifier.subscribe();

        notifier.emit(SessionEvent::Unbound {
            sid: 1,
            uid: "u".into(),
        });
        assert_eq!(notifier.subscribers.len(), 1);
        assert!(live.try_recv().is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut session, transport) = test_session(2);
        let mut notifier = Notifier::default();
        let mut rx = notifier.subscribe();
        session.set("level", json!(10));

        assert!(session.close("kick", &mut notifier));
        assert!(!session.close("kick", &mut notifier));
        assert_eq!(session.state(), SessionState::Closed);

        match rx.try_recv().unwrap() {
            SessionEvent::Closed { session: fs, reason } => {
                assert_eq!(fs.id, 2);
                assert_eq!(fs.get("level"), Some(&json!(10)));
                assert_eq!(reason, "kick");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        // only the kick notice went out, teardown is deferred to the store
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.disconnects(), 0);
        assert!(!session.send(&Envelope::kick("again")));
    }

    #[test]
    fn test_frontend_session_is_a_copy() {
        let (mut session, _) = test_session(1);
        session.set("gold", json!(100));

        let mut fs = session.to_frontend_session();
        fs.set("gold", json!(0));
        fs.uid = Some("mallory".into());

        assert_eq!(session.get("gold"), Some(&json!(100)));
        assert_eq!(session.uid(), None);
    }

    #[test]
    fn test_export_format() {
        let (mut session, _) = test_session(9);
        session.set("x", json!(1));
        let exported = session.to_frontend_session().export();

        let value = serde_json::to_value(&exported).unwrap();
        assert_eq!(
            value,
            json!({"id": 9, "frontendId": "connector-1", "uid": null, "settings": {"x": 1}})
        );

        let back: FrontendSession = exported.into();
        assert_eq!(back.get("x"), Some(&json!(1)));
    }
}
