//! # Frontend Server Library
//!
//! This library provides the routing and session layer of a frontend process in
//! a distributed real-time game server. A frontend holds the live client
//! connections; everything it cannot answer itself is routed to backend
//! processes through remote calls.
//!
//! ## Core Responsibilities
//!
//! ### Session Management
//! Every accepted connection becomes a session with a process-local id. After
//! authentication the application binds it to a uid, which is how the rest of
//! the cluster addresses the player:
//! - Binding, unbinding and the optional single-session policy
//! - Kicks by uid or by session id, with a closing notice to the client
//! - Message delivery by session id or uid
//!
//! ### Request Routing
//! Remote calls are routed per server type. Unless an override is registered,
//! the target is picked by crc32 of the session uid, which keeps a player on the
//! same backend instance for as long as the server list does not change.
//!
//! ### Push Delivery
//! Server-initiated messages go through a push scheduler, either straight to
//! the transport or buffered per session and flushed as one batch.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! The session store and its indexes are owned by one event loop and mutated
//! only there, so they need no locking. Application handlers run as separate
//! tasks and talk back to the loop through a [`network::FrontendHandle`]. Their
//! replies are held until the loop step that produced them has finished.
//!
//! ### Deferred Teardown
//! Closing a session emits its notifications and flushes the closing notice
//! right away, but the transport itself is only torn down at the end of the
//! current loop step.
//!
//! ### Serial Requests
//! Requests of one session are admitted one at a time, in arrival order, with
//! a timeout on both admission and completion.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Frontend and heartbeat settings with their defaults.
//!
//! ### Connector Module (`connector`)
//! Transport abstraction and the per-connection socket state machine for
//! stream and datagram transports.
//!
//! ### Session Modules (`session`, `session_service`)
//! Sessions, their detached frontend projections, and the store owning them.
//!
//! ### Proxy Module (`proxy`)
//! Proxy record generation on membership changes and uid-sticky routing.
//!
//! ### Scheduler Module (`scheduler`)
//! Direct, buffered and composite push schedulers.
//!
//! ### Serial Module (`serial`)
//! The per-session FIFO task filter.
//!
//! ### Network Module (`network`)
//! The UDP frontend: receiver and sender tasks, heartbeat timeouts, handshake
//! and request dispatch.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay_server::config::FrontendConfig;
//! use relay_server::error::HandlerError;
//! use relay_server::network::{FrontendServer, Handler, RequestContext};
//! use relay_server::scheduler::{PushScheduler, SchedulerConfig};
//! use relay_shared::Message;
//! use serde_json::Value;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     async fn handle(&self, _ctx: RequestContext, msg: Message) -> Result<Value, HandlerError> {
//!         Ok(msg.body)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let scheduler = PushScheduler::from_config(&SchedulerConfig::default(), None)?;
//!     let mut server = FrontendServer::new(FrontendConfig::default(), Echo, scheduler).await?;
//!     server.run().await
//! }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod network;
pub mod proxy;
pub mod scheduler;
pub mod serial;
pub mod session;
pub mod session_service;
