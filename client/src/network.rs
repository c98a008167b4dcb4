//! Datagram client speaking the frontend's package protocol

use log::{debug, info, warn};
use relay_shared::{decode, Control, Message, Package, PackageType, ProtocolError};
use serde_json::Value;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const RECV_BUFFER_BYTES: usize = 65_536;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error("kicked by server: {0}")]
    Kicked(String),
    #[error("no answer from server within {0:?}")]
    Timeout(Duration),
    #[error("unexpected handshake reply {0:?}")]
    UnexpectedHandshake(Control),
}

/// Something the server sent after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response { id: u32, body: Value },
    Push { route: String, body: Value },
    Heartbeat,
    Kick { reason: String },
}

/// Splits one datagram into the messages it carries.
pub fn parse_datagram(bytes: &[u8]) -> Result<Vec<Inbound>, ProtocolError> {
    let mut inbound = Vec::new();

    for package in Package::decode_all(bytes)? {
        match package.kind {
            PackageType::Data => {
                let msg = decode(&package.body)?;
                inbound.push(match msg.id {
                    0 => Inbound::Push {
                        route: msg.route,
                        body: msg.body,
                    },
                    id => Inbound::Response { id, body: msg.body },
                });
            }
            PackageType::Heartbeat => inbound.push(Inbound::Heartbeat),
            PackageType::Kick => {
                let reason = match package.to_control()? {
                    Control::Kick { reason } => reason,
                    other => format!("{:?}", other),
                };
                inbound.push(Inbound::Kick { reason });
            }
            PackageType::Handshake | PackageType::HandshakeAck => {
                debug!("Ignoring {:?} package after handshake", package.kind);
            }
        }
    }

    Ok(inbound)
}

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    session_id: u32,
    heartbeat_interval: Option<Duration>,
    next_request_id: u32,
    recv_timeout: Duration,
    pushes: VecDeque<(String, Value)>,
    kicked: Option<String>,
}

impl Client {
    /// Performs the handshake and acknowledges the server's welcome.
    pub async fn connect(
        server_addr: SocketAddr,
        client_version: u32,
        recv_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let local: SocketAddr = if server_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server_addr).await?;

        info!("Connecting to server {}...", server_addr);
        let hello = Package::control(PackageType::Handshake, &Control::Hello { client_version })?;
        socket.send(&hello.encode()?).await?;

        let mut buffer = vec![0u8; RECV_BUFFER_BYTES];
        let reply = loop {
            let len = timeout(recv_timeout, socket.recv(&mut buffer))
                .await
                .map_err(|_| ClientError::Timeout(recv_timeout))??;
            let handshake = Package::decode_all(&buffer[..len])?
                .into_iter()
                .find(|p| p.kind == PackageType::Handshake);
            if let Some(package) = handshake {
                break package.to_control()?;
            }
        };

        match reply {
            Control::Welcome {
                session_id,
                heartbeat_interval_ms,
            } => {
                socket
                    .send(&Package::empty(PackageType::HandshakeAck).encode()?)
                    .await?;
                info!("Connected! Session ID: {}", session_id);

                Ok(Client {
                    socket,
                    server_addr,
                    session_id,
                    heartbeat_interval: (heartbeat_interval_ms > 0)
                        .then(|| Duration::from_millis(heartbeat_interval_ms)),
                    next_request_id: 1,
                    recv_timeout,
                    pushes: VecDeque::new(),
                    kicked: None,
                })
            }
            Control::Rejected { reason } => Err(ClientError::Rejected(reason)),
            other => Err(ClientError::UnexpectedHandshake(other)),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Interval announced by the server, `None` when heartbeats are off.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn kicked(&self) -> Option<&str> {
        self.kicked.as_deref()
    }

    async fn send_message(&self, msg: &Message) -> Result<(), ClientError> {
        let package = Package::new(PackageType::Data, msg.to_frame()?);
        self.socket.send(&package.encode()?).await?;
        Ok(())
    }

    /// Sends a request and waits for its response, queueing pushes that
    /// arrive in between.
    pub async fn request(&mut self, route: &str, body: Value) -> Result<Value, ClientError> {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        self.send_message(&Message::new(id, route, body)).await?;

        loop {
            for inbound in self.recv().await? {
                match inbound {
                    Inbound::Response { id: got, body } if got == id => return Ok(body),
                    Inbound::Response { id: got, .. } => {
                        warn!("Dropping stale response {}", got);
                    }
                    other => self.stash(other)?,
                }
            }
        }
    }

    /// Sends a request that expects no response.
    pub async fn notify(&self, route: &str, body: Value) -> Result<(), ClientError> {
        self.send_message(&Message::new(0, route, body)).await
    }

    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        self.socket
            .send(&Package::empty(PackageType::Heartbeat).encode()?)
            .await?;
        Ok(())
    }

    /// Next server push, from the queue or the wire.
    pub async fn next_push(&mut self) -> Result<(String, Value), ClientError> {
        loop {
            if let Some(push) = self.pushes.pop_front() {
                return Ok(push);
            }
            for inbound in self.recv().await? {
                self.stash(inbound)?;
            }
        }
    }

    fn stash(&mut self, inbound: Inbound) -> Result<(), ClientError> {
        match inbound {
            Inbound::Push { route, body } => self.pushes.push_back((route, body)),
            Inbound::Kick { reason } => {
                warn!("Disconnected: {}", reason);
                self.kicked = Some(reason.clone());
                return Err(ClientError::Kicked(reason));
            }
            Inbound::Heartbeat => debug!("Heartbeat from server"),
            Inbound::Response { id, .. } => debug!("Unexpected response {}", id),
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<Inbound>, ClientError> {
        if let Some(reason) = &self.kicked {
            return Err(ClientError::Kicked(reason.clone()));
        }

        let mut buffer = vec![0u8; RECV_BUFFER_BYTES];
        let len = timeout(self.recv_timeout, self.socket.recv(&mut buffer))
            .await
            .map_err(|_| ClientError::Timeout(self.recv_timeout))??;
        Ok(parse_datagram(&buffer[..len])?)
    }

    /// Tells the server this client is leaving.
    pub async fn disconnect(self, reason: &str) -> Result<(), ClientError> {
        let kick = Package::control(
            PackageType::Kick,
            &Control::Kick {
                reason: reason.to_string(),
            },
        )?;
        self.socket.send(&kick.encode()?).await?;
        info!("Disconnected session {}", self.session_id);
        Ok(())
    }
}
