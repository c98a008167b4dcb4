//! Connector protocol and per-connection socket state machine
//!
//! A [`Socket`] wraps one accepted transport handle. Stream transports (one
//! reliable connection per client) start out `Working`; datagram transports walk
//! through the handshake first:
//!
//! ```text
//! Inited --handshake_response--> WaitAck --client ack--> Working --disconnect--> Closed
//! ```
//!
//! `Closed` is absorbing: every operation on a closed socket is a no-op.
//! The socket never decides the lifetime of its session. Inbound disconnects are
//! reported upward as [`SocketEvent::Disconnect`] so the session store can run
//! its close path, and the store is the one that finally calls
//! [`Socket::disconnect`].

use crate::config::HeartbeatConfig;
use crate::session::SessionId;
use log::{debug, error, warn};
use relay_shared::{
    decode, encode, encode_batch, Control, Envelope, Message, Package, PackageType, ProtocolError,
};
use serde_json::Value;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Handle to an already-accepted transport connection.
pub trait Transport: Send {
    fn send(&mut self, bytes: Vec<u8>) -> io::Result<()>;

    fn disconnect(&mut self);

    fn remote_address(&self) -> SocketAddr;

    /// Applies liveness settings. Transports without their own heartbeat
    /// machinery can ignore this.
    fn configure_heartbeat(&mut self, _heartbeat: &HeartbeatConfig) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Inited,
    WaitAck,
    Working,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// Events a socket reports upward after processing inbound bytes.
#[derive(Debug)]
pub enum SocketEvent {
    Handshake(Control),
    Heartbeat,
    Message(Message),
    Disconnect(String),
    Error(ProtocolError),
}

pub struct Socket {
    id: SessionId,
    kind: SocketKind,
    state: SocketState,
    transport: Box<dyn Transport>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("remote", &self.transport.remote_address())
            .finish()
    }
}

impl Socket {
    pub fn stream(id: SessionId, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            kind: SocketKind::Stream,
            state: SocketState::Working,
            transport,
        }
    }

    pub fn datagram(id: SessionId, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            kind: SocketKind::Datagram,
            state: SocketState::Inited,
            transport,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SocketState::Closed
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.transport.remote_address()
    }

    /// Processes one inbound payload and returns the resulting events.
    pub fn receive(&mut self, raw: &[u8]) -> Vec<SocketEvent> {
        if self.is_closed() {
            return Vec::new();
        }

        match self.kind {
            SocketKind::Stream => vec![match decode(raw) {
                Ok(msg) => SocketEvent::Message(msg),
                Err(e) => SocketEvent::Error(e),
            }],
            SocketKind::Datagram => match Package::decode_all(raw) {
                Ok(packages) => packages
                    .into_iter()
                    .filter_map(|pkg| self.handle_package(pkg))
                    .collect(),
                Err(e) => vec![SocketEvent::Error(e)],
            },
        }
    }

    fn handle_package(&mut self, pkg: Package) -> Option<SocketEvent> {
        match pkg.kind {
            PackageType::Handshake => {
                if self.state != SocketState::Inited {
                    debug!("Socket {} ignoring repeated handshake", self.id);
                    return None;
                }
                Some(match pkg.to_control() {
                    Ok(control) => SocketEvent::Handshake(control),
                    Err(e) => SocketEvent::Error(e),
                })
            }
            PackageType::HandshakeAck => {
                if self.state == SocketState::WaitAck {
                    self.state = SocketState::Working;
                } else {
                    debug!("Socket {} ack in state {:?}", self.id, self.state);
                }
                None
            }
            PackageType::Heartbeat => Some(SocketEvent::Heartbeat),
            PackageType::Data => {
                if self.state != SocketState::Working {
                    warn!(
                        "Socket {} dropping data before handshake completed",
                        self.id
                    );
                    return None;
                }
                Some(match decode(&pkg.body) {
                    Ok(msg) => SocketEvent::Message(msg),
                    Err(e) => SocketEvent::Error(e),
                })
            }
            PackageType::Kick => {
                let reason = match pkg.to_control() {
                    Ok(Control::Kick { reason }) => reason,
                    _ => "client disconnect".to_string(),
                };
                Some(SocketEvent::Disconnect(reason))
            }
        }
    }

    /// Answers a datagram handshake. Only valid once, from `Inited`.
    pub fn handshake_response(&mut self, response: &Control) -> bool {
        if self.kind != SocketKind::Datagram || self.state != SocketState::Inited {
            return false;
        }

        match Package::control(PackageType::Handshake, response).and_then(|p| p.encode()) {
            Ok(bytes) => {
                self.send_raw(bytes);
                self.state = SocketState::WaitAck;
                true
            }
            Err(e) => {
                error!("Socket {} failed to encode handshake: {}", self.id, e);
                false
            }
        }
    }

    /// Serializes and sends one envelope. Dropped unless `Working`.
    pub fn send(&mut self, envelope: &Envelope) -> bool {
        if self.state != SocketState::Working {
            return false;
        }

        let bytes = match self.kind {
            SocketKind::Stream => envelope.to_json(),
            SocketKind::Datagram => envelope
                .to_frame()
                .and_then(|frame| Package::new(PackageType::Data, frame).encode()),
        };

        match bytes {
            Ok(bytes) => self.send_raw(bytes),
            Err(e) => {
                error!("Socket {} failed to encode message: {}", self.id, e);
                false
            }
        }
    }

    /// Sends several envelopes as one transport write, preserving order.
    pub fn send_batch(&mut self, envelopes: &[Envelope]) -> bool {
        if self.state != SocketState::Working || envelopes.is_empty() {
            return false;
        }

        let bytes = match self.kind {
            SocketKind::Stream => encode_batch(envelopes),
            SocketKind::Datagram => {
                envelopes
                    .iter()
                    .try_fold(Vec::new(), |mut acc, envelope| -> Result<_, ProtocolError> {
                        let frame = envelope.to_frame()?;
                        acc.extend(Package::new(PackageType::Data, frame).encode()?);
                        Ok(acc)
                    })
            }
        };

        match bytes {
            Ok(bytes) => self.send_raw(bytes),
            Err(e) => {
                error!("Socket {} failed to encode batch: {}", self.id, e);
                false
            }
        }
    }

    /// Sends a package regardless of handshake progress. Datagram only.
    pub fn send_force(&mut self, package: &Package) -> bool {
        if self.is_closed() || self.kind != SocketKind::Datagram {
            return false;
        }

        match package.encode() {
            Ok(bytes) => self.send_raw(bytes),
            Err(e) => {
                error!("Socket {} failed to encode package: {}", self.id, e);
                false
            }
        }
    }

    /// Flushes the final notice to the client before teardown.
    pub fn closing(&mut self, reason: &str) {
        match self.kind {
            SocketKind::Stream => {
                self.send(&Envelope::kick(reason));
            }
            SocketKind::Datagram => {
                let kick = Control::Kick {
                    reason: reason.to_string(),
                };
                match Package::control(PackageType::Kick, &kick) {
                    Ok(pkg) => {
                        self.send_force(&pkg);
                    }
                    Err(e) => error!("Socket {} failed to encode kick: {}", self.id, e),
                }
            }
        }
    }

    /// Transitions to `Closed` and tears the transport down.
    ///
    /// Returns false when the socket was already closed.
    pub fn disconnect(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = SocketState::Closed;
        self.transport.disconnect();
        true
    }

    fn send_raw(&mut self, bytes: Vec<u8>) -> bool {
        match self.transport.send(bytes) {
            Ok(()) => true,
            Err(e) => {
                error!("send msg to remote {} with err: {}", self.remote_address(), e);
                false
            }
        }
    }
}

/// Accepts transports as sockets and owns the message codec.
#[derive(Debug)]
pub struct Connector {
    kind: SocketKind,
    heartbeat: HeartbeatConfig,
    next_id: SessionId,
}

impl Connector {
    pub fn new(kind: SocketKind, heartbeat: HeartbeatConfig) -> Self {
        Self {
            kind,
            heartbeat,
            next_id: 1,
        }
    }

    pub fn heartbeat(&self) -> &HeartbeatConfig {
        &self.heartbeat
    }

    /// Wraps a freshly accepted transport, assigning the next socket id.
    pub fn accept(&mut self, mut transport: Box<dyn Transport>) -> Socket {
        transport.configure_heartbeat(&self.heartbeat);

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        debug!("Connector accepted socket {} from {}", id, transport.remote_address());

        match self.kind {
            SocketKind::Stream => Socket::stream(id, transport),
            SocketKind::Datagram => Socket::datagram(id, transport),
        }
    }

    pub fn encode(&self, request_id: Option<u32>, route: &str, body: Value) -> Envelope {
        encode(request_id, route, body)
    }

    pub fn decode(&self, raw: &[u8]) -> Result<Message, ProtocolError> {
        decode(raw)
    }
}
