//! Session store for one frontend process
//!
//! This module tracks every live client session and the uid each one is bound
//! to:
//! - Session lifecycle (create, close, kick, remove)
//! - uid binding rules, including the optional single-session policy
//! - Message delivery by session id or by uid
//! - Deferred transport teardown so a closing notice can still reach the client
//!
//! The service is owned by the frontend event loop and handed by reference to
//! whatever needs it. All mutations run on that loop, so the indexes need no
//! locking.

use crate::connector::Socket;
use crate::error::SessionError;
use crate::session::{Notifier, Session, SessionEvent, SessionId, Settings};
use log::{debug, info};
use relay_shared::Envelope;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Owns all sessions of this frontend and the uid → sessions index.
///
/// Invariants kept by every operation:
/// - a session has a uid iff it sits in exactly one uid bucket, at most once
/// - with `single_session` a bucket never holds more than one session
/// - empty buckets are pruned immediately
#[derive(Debug)]
pub struct SessionService {
    frontend_id: String,
    single_session: bool,
    sessions: HashMap<SessionId, Session>,
    uid_map: HashMap<String, Vec<SessionId>>,
    notifier: Notifier,
    /// Sockets waiting for teardown at the end of the current loop step
    pending_disconnects: VecDeque<Socket>,
}

impl SessionService {
    pub fn new(frontend_id: impl Into<String>, single_session: bool) -> Self {
        Self {
            frontend_id: frontend_id.into(),
            single_session,
            sessions: HashMap::new(),
            uid_map: HashMap::new(),
            notifier: Notifier::default(),
            pending_disconnects: VecDeque::new(),
        }
    }

    pub fn frontend_id(&self) -> &str {
        &self.frontend_id
    }

    pub fn single_session(&self) -> bool {
        self.single_session
    }

    /// Registers for bind, unbind and closed notifications.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.notifier.subscribe()
    }

    /// Creates and indexes the session for an accepted socket.
    ///
    /// The session id is the socket id. A duplicate id is a programming error
    /// and leaves the existing session untouched.
    pub fn create(&mut self, socket: Socket) -> Result<&mut Session, SessionError> {
        let sid = socket.id();
        if self.sessions.contains_key(&sid) {
            return Err(SessionError::Duplicate(sid));
        }

        let session = Session::new(sid, &self.frontend_id, socket);
        info!(
            "Session {} created on {} for {}",
            sid,
            self.frontend_id,
            session.remote_address()
        );
        Ok(self.sessions.entry(sid).or_insert(session))
    }

    pub fn bind(&mut self, sid: SessionId, uid: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&sid)
            .ok_or(SessionError::NotFound(sid))?;

        if let Some(current) = session.uid() {
            if current == uid {
                return Ok(());
            }
            return Err(SessionError::AlreadyBound {
                sid,
                uid: current.to_string(),
            });
        }

        if self.single_session && self.uid_map.contains_key(uid) {
            return Err(SessionError::SingleSessionViolation(uid.to_string()));
        }

        let bucket = self.uid_map.entry(uid.to_string()).or_default();
        if bucket.contains(&sid) {
            return Ok(());
        }
        bucket.push(sid);
        session.bind(uid, &mut self.notifier);
        debug!("Session {} bound to uid {}", sid, uid);
        Ok(())
    }

    pub fn unbind(&mut self, sid: SessionId, uid: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&sid)
            .ok_or(SessionError::NotFound(sid))?;

        if session.uid() != Some(uid) {
            return Err(SessionError::NotBound {
                sid,
                uid: uid.to_string(),
            });
        }

        Self::remove_from_bucket(&mut self.uid_map, uid, sid);
        session.unbind(uid, &mut self.notifier);
        debug!("Session {} unbound from uid {}", sid, uid);
        Ok(())
    }

    pub fn get(&self, sid: SessionId) -> Option<&Session> {
        self.sessions.get(&sid)
    }

    pub fn get_mut(&mut self, sid: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&sid)
    }

    /// Sessions bound to `uid`, in bind order. `None` when nothing is bound.
    pub fn get_by_uid(&self, uid: &str) -> Option<Vec<&Session>> {
        self.uid_map
            .get(uid)
            .map(|sids| sids.iter().filter_map(|sid| self.sessions.get(sid)).collect())
    }

    /// Drops the session from both indexes and queues its transport for
    /// teardown. Safe to call for unknown or already removed ids.
    pub fn remove(&mut self, sid: SessionId) -> bool {
        match self.take(sid) {
            Some(session) => {
                self.pending_disconnects.push_back(session.into_socket());
                true
            }
            None => false,
        }
    }

    fn take(&mut self, sid: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&sid)?;
        if let Some(uid) = session.uid() {
            Self::remove_from_bucket(&mut self.uid_map, uid, sid);
        }
        Some(session)
    }

    fn remove_from_bucket(uid_map: &mut HashMap<String, Vec<SessionId>>, uid: &str, sid: SessionId) {
        if let Some(bucket) = uid_map.get_mut(uid) {
            bucket.retain(|id| *id != sid);
            if bucket.is_empty() {
                uid_map.remove(uid);
            }
        }
    }

    pub fn import(&mut self, sid: SessionId, key: &str, value: Value) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&sid)
            .ok_or(SessionError::NotFound(sid))?;
        session.set(key, value);
        Ok(())
    }

    pub fn import_all(&mut self, sid: SessionId, settings: Settings) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&sid)
            .ok_or(SessionError::NotFound(sid))?;
        session.set_all(settings);
        Ok(())
    }

    /// Closes one session: unindexes it, emits the closed notification, lets
    /// the socket send its closing notice and defers the transport teardown.
    pub fn close(&mut self, sid: SessionId, reason: &str) -> bool {
        let Some(mut session) = self.take(sid) else {
            return false;
        };

        session.close(reason, &mut self.notifier);
        info!("Session {} closed: {}", sid, reason);
        self.pending_disconnects.push_back(session.into_socket());
        true
    }

    /// Closes every session bound to `uid`. Returns how many were closed.
    pub fn kick(&mut self, uid: &str, reason: &str) -> usize {
        let sids = match self.uid_map.get(uid) {
            Some(sids) => sids.clone(),
            None => return 0,
        };

        sids.into_iter()
            .filter(|sid| self.close(*sid, reason))
            .count()
    }

    pub fn kick_by_session_id(&mut self, sid: SessionId, reason: &str) -> bool {
        self.close(sid, reason)
    }

    pub fn client_address(&self, sid: SessionId) -> Option<SocketAddr> {
        self.sessions.get(&sid).map(Session::remote_address)
    }

    pub fn send_message(&mut self, sid: SessionId, envelope: &Envelope) -> bool {
        match self.sessions.get_mut(&sid) {
            Some(session) => {
                session.send(envelope);
                true
            }
            None => {
                debug!(
                    "Fail to send message for non-existing session, sid: {} msg: {:?}",
                    sid, envelope
                );
                false
            }
        }
    }

    pub fn send_message_by_uid(&mut self, uid: &str, envelope: &Envelope) -> bool {
        let Some(sids) = self.uid_map.get(uid) else {
            debug!("fail to send message by uid for non-existing session. uid: {}", uid);
            return false;
        };

        for sid in sids {
            if let Some(session) = self.sessions.get_mut(sid) {
                session.send(envelope);
            }
        }
        true
    }

    pub fn send_batch(&mut self, sid: SessionId, envelopes: &[Envelope]) -> bool {
        match self.sessions.get_mut(&sid) {
            Some(session) => {
                session.send_batch(envelopes);
                true
            }
            None => {
                debug!("Fail to send batch for non-existing session, sid: {}", sid);
                false
            }
        }
    }

    pub fn for_each_session<F: FnMut(&Session)>(&self, mut f: F) {
        for session in self.sessions.values() {
            f(session);
        }
    }

    pub fn for_each_bound_session<F: FnMut(&Session)>(&self, mut f: F) {
        for sids in self.uid_map.values() {
            for sid in sids {
                if let Some(session) = self.sessions.get(sid) {
                    f(session);
                }
            }
        }
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn bound_session_ids(&self) -> Vec<SessionId> {
        self.uid_map.values().flatten().copied().collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tears down every transport queued by `close`/`remove`.
    ///
    /// The event loop calls this once the current step has finished, which is
    /// what gives closing notices their chance to go out first.
    pub fn flush_disconnects(&mut self) -> usize {
        let mut count = 0;
        while let Some(mut socket) = self.pending_disconnects.pop_front() {
            if socket.disconnect() {
                count += 1;
            }
        }
        count
    }
}

/// Test suite covering binding rules, removal and kick behavior.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::tests::MockTransport;
    use crate::session::SessionState;
    use serde_json::json;

    fn add_session(service: &mut SessionService, sid: SessionId) -> MockTransport {
        let transport = MockTransport::default();
        let socket = Socket::stream(sid, Box::new(transport.clone()));
        service.create(socket).unwrap();
        transport
    }

    fn bucket(service: &SessionService, uid: &str) -> Option<Vec<SessionId>> {
        service
            .get_by_uid(uid)
            .map(|sessions| sessions.iter().map(|s| s.id()).collect())
    }

    #[test]
    fn test_create_and_get() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);

        let session = service.get(1).unwrap();
        assert_eq!(session.id(), 1);
        assert_eq!(session.frontend_id(), "connector-1");
        assert_eq!(service.count(), 1);
        assert!(service.get(2).is_none());
    }

    #[test]
    fn test_create_duplicate_sid() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);
        service.bind(1, "alice").unwrap();

        let socket = Socket::stream(1, Box::new(MockTransport::default()));
        assert_eq!(service.create(socket).unwrap_err(), SessionError::Duplicate(1));
        assert_eq!(service.get(1).unwrap().uid(), Some("alice"));
    }

    #[test]
    fn test_bind_unknown_session() {
        let mut service = SessionService::new("connector-1", false);
        assert_eq!(service.bind(5, "alice"), Err(SessionError::NotFound(5)));
    }

    #[test]
    fn test_bind_same_uid_is_noop() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);
        let mut rx = service.subscribe();

        service.bind(1, "alice").unwrap();
        service.bind(1, "alice").unwrap();

        assert_eq!(bucket(&service, "alice"), Some(vec![1]));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_bind_other_uid_fails() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);
        service.bind(1, "alice").unwrap();

        assert_eq!(
            service.bind(1, "bob"),
            Err(SessionError::AlreadyBound {
                sid: 1,
                uid: "alice".into()
            })
        );
        assert!(service.get_by_uid("bob").is_none());
    }

    #[test]
    fn test_multiple_sessions_per_uid() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);
        add_session(&mut service, 2);

        service.bind(1, "alice").unwrap();
        service.bind(2, "alice").unwrap();
        assert_eq!(bucket(&service, "alice"), Some(vec![1, 2]));
    }

    #[test]
    fn test_single_session_violation() {
        let mut service = SessionService::new("connector-1", true);
        add_session(&mut service, 1);
        add_session(&mut service, 2);

        service.bind(1, "alice").unwrap();
        assert_eq!(
            service.bind(2, "alice"),
            Err(SessionError::SingleSessionViolation("alice".into()))
        );
        assert_eq!(service.get(2).unwrap().uid(), None);

        // once the first session leaves, the uid is free again
        service.unbind(1, "alice").unwrap();
        service.bind(2, "alice").unwrap();
        assert_eq!(bucket(&service, "alice"), Some(vec![2]));
    }

    #[test]
    fn test_unbind_prunes_bucket() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);
        add_session(&mut service, 2);
        service.bind(1, "alice").unwrap();
        service.bind(2, "alice").unwrap();

        service.unbind(1, "alice").unwrap();
        assert_eq!(bucket(&service, "alice"), Some(vec![2]));
        assert_eq!(service.get(1).unwrap().uid(), None);

        service.unbind(2, "alice").unwrap();
        assert!(service.get_by_uid("alice").is_none());
        assert!(service.uid_map.is_empty());
    }

    #[test]
    fn test_unbind_errors() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);

        assert_eq!(service.unbind(9, "alice"), Err(SessionError::NotFound(9)));
        assert_eq!(
            service.unbind(1, "alice"),
            Err(SessionError::NotBound {
                sid: 1,
                uid: "alice".into()
            })
        );

        service.bind(1, "alice").unwrap();
        assert!(matches!(
            service.unbind(1, "bob"),
            Err(SessionError::NotBound { .. })
        ));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut service = SessionService::new("connector-1", false);
        let transport = add_session(&mut service, 1);
        service.bind(1, "alice").unwrap();

        assert!(service.remove(1));
        assert!(!service.remove(1));
        assert!(service.get(1).is_none());
        assert!(service.get_by_uid("alice").is_none());

        assert_eq!(service.flush_disconnects(), 1);
        assert_eq!(transport.disconnects(), 1);
    }

    #[test]
    fn test_import_settings() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);

        service.import(1, "area", json!(2)).unwrap();
        let mut bag = Settings::new();
        bag.insert("hp".into(), json!(90));
        service.import_all(1, bag.clone()).unwrap();

        let session = service.get(1).unwrap();
        assert_eq!(session.get("area"), Some(&json!(2)));
        assert_eq!(session.get("hp"), Some(&json!(90)));

        assert_eq!(service.import(3, "a", json!(1)), Err(SessionError::NotFound(3)));
        assert_eq!(service.import_all(3, bag), Err(SessionError::NotFound(3)));
    }

    #[test]
    fn test_kick_closes_and_defers_disconnect() {
        let mut service = SessionService::new("connector-1", false);
        let transport = add_session(&mut service, 7);
        let mut rx = service.subscribe();
        service.bind(7, "alice").unwrap();

        assert_eq!(service.kick("alice", "logout"), 1);
        assert!(service.get(7).is_none());
        assert!(!service.send_message(7, &Envelope::kick("x")));

        // the onKick notice is out, the transport is still up until flush
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.disconnects(), 0);
        assert_eq!(service.flush_disconnects(), 1);
        assert_eq!(transport.disconnects(), 1);

        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Bound { .. }));
        match rx.try_recv().unwrap() {
            SessionEvent::Closed { session, reason } => {
                assert_eq!(session.id, 7);
                assert_eq!(session.uid.as_deref(), Some("alice"));
                assert_eq!(reason, "logout");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_kick_all_sessions_of_uid() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);
        add_session(&mut service, 2);
        add_session(&mut service, 3);
        service.bind(1, "alice").unwrap();
        service.bind(2, "alice").unwrap();

        assert_eq!(service.kick("alice", "kick"), 2);
        assert_eq!(service.kick("alice", "kick"), 0);
        assert_eq!(service.count(), 1);
        assert!(service.get(3).is_some());
    }

    #[test]
    fn test_kick_by_session_id() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);

        assert!(service.kick_by_session_id(1, "kick"));
        assert!(!service.kick_by_session_id(1, "kick"));
        assert!(service.is_empty());
    }

    #[test]
    fn test_send_message_routes() {
        let mut service = SessionService::new("connector-1", false);
        let t1 = add_session(&mut service, 1);
        let t2 = add_session(&mut service, 2);
        service.bind(1, "alice").unwrap();
        service.bind(2, "alice").unwrap();

        let push = relay_shared::encode(None, "onChat", json!("hi"));
        assert!(service.send_message(1, &push));
        assert!(service.send_message_by_uid("alice", &push));
        assert!(!service.send_message_by_uid("bob", &push));

        assert_eq!(t1.sent().len(), 2);
        assert_eq!(t2.sent().len(), 1);
    }

    #[test]
    fn test_traversal() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);
        add_session(&mut service, 2);
        add_session(&mut service, 3);
        service.bind(2, "bob").unwrap();

        let mut all = Vec::new();
        service.for_each_session(|s| all.push(s.id()));
        all.sort();
        assert_eq!(all, vec![1, 2, 3]);

        let mut bound = Vec::new();
        service.for_each_bound_session(|s| bound.push(s.id()));
        assert_eq!(bound, vec![2]);
        assert_eq!(service.bound_session_ids(), vec![2]);
    }

    #[test]
    fn test_client_address() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);
        assert_eq!(
            service.client_address(1),
            Some("127.0.0.1:4000".parse().unwrap())
        );
        assert_eq!(service.client_address(2), None);
    }

    #[test]
    fn test_frontend_session_round_trip_through_store() {
        let mut service = SessionService::new("connector-1", false);
        add_session(&mut service, 1);

        let mut fs = service.get(1).unwrap().to_frontend_session();
        fs.set("score", json!(42));
        assert_eq!(service.get(1).unwrap().get("score"), None);

        fs.push(&mut service, "score").unwrap();
        assert_eq!(service.get(1).unwrap().get("score"), Some(&json!(42)));

        fs.bind(&mut service, "carol").unwrap();
        assert_eq!(fs.uid.as_deref(), Some("carol"));
        assert!(fs.bind(&mut service, "dave").is_err());
        assert_eq!(fs.uid.as_deref(), Some("carol"));

        fs.set("title", json!("hero"));
        fs.push_all(&mut service).unwrap();
        let live = service.get(1).unwrap();
        assert_eq!(live.get("title"), Some(&json!("hero")));
        assert_eq!(live.state(), SessionState::Inited);
    }
}
