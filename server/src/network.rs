//! Frontend network layer: UDP transport and the event loop tying the core together

use crate::config::FrontendConfig;
use crate::connector::{Connector, SocketEvent, SocketKind, Transport};
use crate::error::{HandlerError, ScheduleError, SessionError};
use crate::scheduler::{PushRequest, PushScheduler};
use crate::serial::SerialFilter;
use crate::session::{FrontendSession, SessionEvent, SessionId, Settings};
use crate::session_service::SessionService;
use log::{debug, error, info, warn};
use relay_shared::{encode, Control, Message, Package, PackageType};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, interval, Instant, MissedTickBehavior};

pub type ServerResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const RECV_BUFFER_BYTES: usize = 65_536;
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Application request handler driven by the frontend loop.
///
/// Requests of one session reach the handler one at a time, in arrival order.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        ctx: RequestContext,
        msg: Message,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send;
}

/// What a handler gets besides the request itself.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Snapshot of the session at dispatch time
    pub session: FrontendSession,
    pub frontend: FrontendHandle,
}

/// Session commands executed on the frontend loop.
#[derive(Debug)]
pub enum Command {
    Bind {
        sid: SessionId,
        uid: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Unbind {
        sid: SessionId,
        uid: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Kick {
        uid: String,
        reason: String,
        reply: oneshot::Sender<usize>,
    },
    KickSession {
        sid: SessionId,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    Import {
        sid: SessionId,
        settings: Settings,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Push {
        request: PushRequest,
        reply: oneshot::Sender<Result<(), ScheduleError>>,
    },
    ClientAddress {
        sid: SessionId,
        reply: oneshot::Sender<Option<SocketAddr>>,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Messages sent from network and handler tasks to the main loop
#[derive(Debug)]
pub enum ServerMessage {
    DatagramReceived {
        bytes: Vec<u8>,
        addr: SocketAddr,
    },
    RequestFinished {
        sid: SessionId,
        request_id: u32,
        route: String,
        result: Result<Value, HandlerError>,
    },
    Command(Command),
    Shutdown,
}

/// Datagram queued for the sender task
#[derive(Debug)]
pub struct Outgoing {
    pub bytes: Vec<u8>,
    pub addr: SocketAddr,
}

/// One client as seen by the UDP socket. There is no connection to close, so
/// teardown only stops further writes.
#[derive(Debug)]
struct UdpTransport {
    addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    closed: bool,
}

impl Transport for UdpTransport {
    fn send(&mut self, bytes: Vec<u8>) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        self.outgoing
            .send(Outgoing {
                bytes,
                addr: self.addr,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "network sender stopped"))
    }

    fn disconnect(&mut self) {
        debug!("Dropping UDP peer {}", self.addr);
        self.closed = true;
    }

    fn remote_address(&self) -> SocketAddr {
        self.addr
    }
}

#[derive(Debug)]
struct Peer {
    sid: SessionId,
    last_seen: Instant,
}

/// Cloneable handle for issuing session commands to a running frontend.
///
/// Every reply is delivered only after the loop step that executed the
/// command has finished.
#[derive(Debug, Clone)]
pub struct FrontendHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl FrontendHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HandlerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ServerMessage::Command(build(reply)))
            .map_err(|_| HandlerError::Closed)?;
        rx.await.map_err(|_| HandlerError::Closed)
    }

    pub async fn bind(&self, sid: SessionId, uid: &str) -> Result<(), HandlerError> {
        let uid = uid.to_string();
        Ok(self.request(|reply| Command::Bind { sid, uid, reply }).await??)
    }

    pub async fn unbind(&self, sid: SessionId, uid: &str) -> Result<(), HandlerError> {
        let uid = uid.to_string();
        Ok(self.request(|reply| Command::Unbind { sid, uid, reply }).await??)
    }

    pub async fn kick(&self, uid: &str, reason: &str) -> Result<usize, HandlerError> {
        let (uid, reason) = (uid.to_string(), reason.to_string());
        self.request(|reply| Command::Kick { uid, reason, reply }).await
    }

    pub async fn kick_session(&self, sid: SessionId, reason: &str) -> Result<bool, HandlerError> {
        let reason = reason.to_string();
        self.request(|reply| Command::KickSession { sid, reason, reply })
            .await
    }

    pub async fn import(&self, sid: SessionId, key: &str, value: Value) -> Result<(), HandlerError> {
        let mut settings = Settings::new();
        settings.insert(key.to_string(), value);
        self.import_all(sid, settings).await
    }

    pub async fn import_all(&self, sid: SessionId, settings: Settings) -> Result<(), HandlerError> {
        Ok(self
            .request(|reply| Command::Import {
                sid,
                settings,
                reply,
            })
            .await??)
    }

    pub async fn push(&self, request: PushRequest) -> Result<(), HandlerError> {
        Ok(self.request(|reply| Command::Push { request, reply }).await??)
    }

    pub async fn client_address(&self, sid: SessionId) -> Result<Option<SocketAddr>, HandlerError> {
        self.request(|reply| Command::ClientAddress { sid, reply })
            .await
    }

    pub async fn session_count(&self) -> Result<usize, HandlerError> {
        self.request(|reply| Command::SessionCount { reply }).await
    }

    pub fn shutdown(&self) {
        if self.tx.send(ServerMessage::Shutdown).is_err() {
            debug!("Frontend already stopped");
        }
    }
}

type Deferred = Box<dyn FnOnce() + Send>;

/// Single UDP frontend process: accepts peers, runs the connector state
/// machine and dispatches requests to the application handler.
pub struct FrontendServer<H: Handler> {
    config: FrontendConfig,
    socket: Arc<UdpSocket>,
    connector: Connector,
    sessions: SessionService,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    peers: HashMap<SocketAddr, Peer>,
    serial: SerialFilter,
    scheduler: PushScheduler,
    handler: Arc<H>,
    /// Replies held back until the current loop step completes
    ready: Vec<Deferred>,
    tasks: Vec<JoinHandle<()>>,
    sender_task: Option<JoinHandle<()>>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    /// Dropped on shutdown so the sender task ends once the queue drains
    outgoing_tx: Option<mpsc::UnboundedSender<Outgoing>>,
    outgoing_rx: Option<mpsc::UnboundedReceiver<Outgoing>>,
}

impl<H: Handler> FrontendServer<H> {
    pub async fn new(
        config: FrontendConfig,
        handler: H,
        scheduler: PushScheduler,
    ) -> ServerResult<Self> {
        if config.flush_interval.is_zero() {
            return Err("flush interval must be greater than zero".into());
        }

        let socket = Arc::new(UdpSocket::bind(config.bind).await?);
        info!(
            "Frontend {} listening on {}",
            config.frontend_id,
            socket.local_addr()?
        );

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let mut sessions = SessionService::new(config.frontend_id.clone(), config.single_session);
        let session_events = sessions.subscribe();

        Ok(FrontendServer {
            connector: Connector::new(SocketKind::Datagram, config.heartbeat.clone()),
            serial: SerialFilter::new(config.serial_timeout),
            config,
            socket,
            sessions,
            session_events,
            peers: HashMap::new(),
            scheduler,
            handler: Arc::new(handler),
            ready: Vec::new(),
            tasks: Vec::new(),
            sender_task: None,
            server_tx,
            server_rx,
            outgoing_tx: Some(outgoing_tx),
            outgoing_rx: Some(outgoing_rx),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn handle(&self) -> FrontendHandle {
        FrontendHandle {
            tx: self.server_tx.clone(),
        }
    }

    /// Registers for session notifications. Call before `run`.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.sessions.subscribe()
    }

    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&mut self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut buffer = vec![0u8; RECV_BUFFER_BYTES];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let bytes = buffer[..len].to_vec();
                        if let Err(e) = server_tx.send(ServerMessage::DatagramReceived { bytes, addr }) {
                            error!("Failed to send datagram to main loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));
    }

    /// Spawns task that processes the outgoing datagram queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut outgoing_rx) = self.outgoing_rx.take() else {
            warn!("Network sender already running");
            return;
        };

        self.sender_task = Some(tokio::spawn(async move {
            while let Some(Outgoing { bytes, addr }) = outgoing_rx.recv().await {
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    error!("Failed to send datagram to {}: {}", addr, e);
                }
            }
        }));
    }

    /// Main loop: one message or tick per step, then the step's deferred work.
    pub async fn run(&mut self) -> ServerResult<()> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.scheduler.start()?;

        let flush_every = self
            .scheduler
            .flush_interval()
            .unwrap_or(self.config.flush_interval);
        let mut flush_tick = interval(flush_every);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut liveness_tick = interval(LIVENESS_CHECK_INTERVAL);
        liveness_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Frontend {} started", self.config.frontend_id);

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Frontend shutting down");
                            break;
                        }
                        Some(message) => self.handle_message(message),
                    }
                }
                _ = flush_tick.tick() => {
                    self.scheduler.flush(&mut self.sessions);
                }
                _ = liveness_tick.tick() => {
                    self.check_timeouts();
                }
            }
            self.end_step();
        }

        self.stop().await;
        Ok(())
    }

    /// Closes every session, then gives the sender task up to the close
    /// timeout to deliver what is still queued.
    async fn stop(&mut self) {
        if let Err(e) = self.scheduler.stop(&mut self.sessions) {
            error!("Failed to stop push scheduler: {}", e);
        }
        for sid in self.sessions.session_ids() {
            self.sessions.close(sid, "server shutdown");
        }
        self.end_step();

        for task in self.tasks.drain(..) {
            task.abort();
        }

        self.outgoing_tx = None;
        if let Some(mut sender) = self.sender_task.take() {
            let grace = self.connector.heartbeat().close_timeout;
            if time::timeout(grace, &mut sender).await.is_err() {
                warn!("Outgoing queue not drained within {:?}, dropping it", grace);
                sender.abort();
            }
        }
    }

    /// Completes the current step: tears down transports closed during it,
    /// releases their serial queues, then delivers held back replies.
    fn end_step(&mut self) {
        if self.sessions.flush_disconnects() > 0 {
            let sessions = &self.sessions;
            self.peers.retain(|_, peer| sessions.get(peer.sid).is_some());
        }

        while let Ok(event) = self.session_events.try_recv() {
            if let SessionEvent::Closed { session, reason } = event {
                debug!("Releasing serial queue of session {} ({})", session.id, reason);
                self.serial.release(session.id);
            }
        }

        for reply in self.ready.drain(..) {
            reply();
        }
    }

    fn defer<T: Send + 'static>(&mut self, reply: oneshot::Sender<T>, value: T) {
        self.ready.push(Box::new(move || {
            // The caller may have given up waiting
            let _ = reply.send(value);
        }));
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::DatagramReceived { bytes, addr } => self.handle_datagram(bytes, addr),
            ServerMessage::RequestFinished {
                sid,
                request_id,
                route,
                result,
            } => self.finish_request(sid, request_id, &route, result),
            ServerMessage::Command(command) => self.handle_command(command),
            ServerMessage::Shutdown => {}
        }
    }

    fn handle_datagram(&mut self, bytes: Vec<u8>, addr: SocketAddr) {
        let sid = match self.peers.get_mut(&addr) {
            Some(peer) => {
                peer.last_seen = Instant::now();
                peer.sid
            }
            None => match self.accept(&bytes, addr) {
                Some(sid) => sid,
                None => return,
            },
        };

        let events = match self.sessions.get_mut(sid) {
            Some(session) => session.socket_mut().receive(&bytes),
            None => return,
        };

        for event in events {
            self.handle_socket_event(sid, event);
        }
    }

    /// Creates a session for a new peer. Only a handshake opens one.
    fn accept(&mut self, bytes: &[u8], addr: SocketAddr) -> Option<SessionId> {
        if bytes.first() != Some(&(PackageType::Handshake as u8)) {
            debug!("Ignoring datagram from unknown peer {}", addr);
            return None;
        }

        let Some(outgoing) = self.outgoing_tx.clone() else {
            return None;
        };
        let transport = UdpTransport {
            addr,
            outgoing,
            closed: false,
        };
        let socket = self.connector.accept(Box::new(transport));
        let sid = match self.sessions.create(socket) {
            Ok(session) => session.id(),
            Err(e) => {
                error!("Failed to create session for {}: {}", addr, e);
                return None;
            }
        };

        self.peers.insert(
            addr,
            Peer {
                sid,
                last_seen: Instant::now(),
            },
        );
        Some(sid)
    }

    fn handle_socket_event(&mut self, sid: SessionId, event: SocketEvent) {
        match event {
            SocketEvent::Handshake(control) => self.handshake(sid, control),
            SocketEvent::Heartbeat => {
                if let Some(session) = self.sessions.get_mut(sid) {
                    session
                        .socket_mut()
                        .send_force(&Package::empty(PackageType::Heartbeat));
                }
            }
            SocketEvent::Message(msg) => self.dispatch(sid, msg),
            SocketEvent::Disconnect(reason) => {
                self.sessions.close(sid, &reason);
            }
            SocketEvent::Error(e) => {
                warn!("Invalid data from session {}: {}", sid, e);
            }
        }
    }

    fn handshake(&mut self, sid: SessionId, control: Control) {
        let rejection = match control {
            Control::Hello { client_version } if client_version != self.config.client_version => {
                Some(format!("client version {} not supported", client_version))
            }
            Control::Hello { .. } if self.sessions.count() > self.config.max_sessions => {
                Some("server full".to_string())
            }
            Control::Hello { .. } => None,
            other => Some(format!("unexpected handshake {:?}", other)),
        };

        let heartbeat = self.connector.heartbeat();
        let heartbeat_interval_ms = if heartbeat.enabled {
            heartbeat.interval.as_millis() as u64
        } else {
            0
        };

        let Some(session) = self.sessions.get_mut(sid) else {
            return;
        };

        match rejection {
            None => {
                session.socket_mut().handshake_response(&Control::Welcome {
                    session_id: sid,
                    heartbeat_interval_ms,
                });
                info!("Session {} completed handshake from {}", sid, session.remote_address());
            }
            Some(reason) => {
                warn!("Rejecting session {}: {}", sid, reason);
                session
                    .socket_mut()
                    .handshake_response(&Control::Rejected { reason });
                self.sessions.remove(sid);
            }
        }
    }

    /// Hands a request to the handler behind the session's serial queue.
    fn dispatch(&mut self, sid: SessionId, msg: Message) {
        let Some(session) = self.sessions.get(sid) else {
            return;
        };

        let ctx = RequestContext {
            session: session.to_frontend_session(),
            frontend: self.handle(),
        };
        let pending = self.serial.enqueue(sid, &msg.route);
        let handler = Arc::clone(&self.handler);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let request_id = msg.id;
            let route = msg.route.clone();
            let result = pending.run(handler.handle(ctx, msg)).await;

            let finished = ServerMessage::RequestFinished {
                sid,
                request_id,
                route,
                result,
            };
            if let Err(e) = server_tx.send(finished) {
                error!("Failed to report finished request: {}", e);
            }
        });
    }

    fn finish_request(
        &mut self,
        sid: SessionId,
        request_id: u32,
        route: &str,
        result: Result<Value, HandlerError>,
    ) {
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                warn!("Request {} of session {} failed: {}", route, sid, e);
                json!({ "code": 500, "message": e.to_string() })
            }
        };

        // Notifications carry no id and expect no answer
        if request_id == 0 {
            return;
        }
        self.sessions
            .send_message(sid, &encode(Some(request_id), route, body));
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Bind { sid, uid, reply } => {
                let result = self.sessions.bind(sid, &uid);
                self.defer(reply, result);
            }
            Command::Unbind { sid, uid, reply } => {
                let result = self.sessions.unbind(sid, &uid);
                self.defer(reply, result);
            }
            Command::Kick { uid, reason, reply } => {
                let count = self.sessions.kick(&uid, &reason);
                self.defer(reply, count);
            }
            Command::KickSession { sid, reason, reply } => {
                let closed = self.sessions.kick_by_session_id(sid, &reason);
                self.defer(reply, closed);
            }
            Command::Import {
                sid,
                settings,
                reply,
            } => {
                let result = self.sessions.import_all(sid, settings);
                self.defer(reply, result);
            }
            Command::Push { request, reply } => {
                let result = self.scheduler.schedule(&mut self.sessions, &request);
                self.defer(reply, result);
            }
            Command::ClientAddress { sid, reply } => {
                let addr = self.sessions.client_address(sid);
                self.defer(reply, addr);
            }
            Command::SessionCount { reply } => {
                let count = self.sessions.count();
                self.defer(reply, count);
            }
        }
    }

    fn check_timeouts(&mut self) {
        let heartbeat = self.connector.heartbeat();
        if !heartbeat.enabled {
            return;
        }

        let timeout = heartbeat.timeout;
        let expired: Vec<SessionId> = self
            .peers
            .values()
            .filter(|peer| peer.last_seen.elapsed() > timeout)
            .map(|peer| peer.sid)
            .collect();

        for sid in expired {
            info!("Session {} timed out", sid);
            self.sessions.close(sid, "heartbeat timeout");
        }
    }
}
