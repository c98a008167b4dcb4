//! # Frontend Client Library
//!
//! This library provides a datagram client for the relay frontend. It is what
//! the `relay-client` binary and the workspace integration tests use to talk to
//! a running server.
//!
//! ## Protocol Overview
//!
//! Every datagram carries one or more packages (`type:u8 | length:u24 BE |
//! body`). A session is opened with a handshake:
//! - the client sends a `Handshake` package with its protocol version
//! - the server answers with a welcome (session id, heartbeat interval) or a
//!   rejection
//! - the client acknowledges with `HandshakeAck`, after which data flows
//!
//! Requests and responses travel in `Data` packages using the request frame
//! from `relay_shared`. Responses carry the request id, pushes carry id 0 and
//! their route. A `Kick` package ends the session from either side.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! - Handshake and acknowledgement
//! - Request/response matching by id, with pushes queued in between
//! - Heartbeats and graceful disconnect
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay_client::network::Client;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr = "127.0.0.1:3010".parse()?;
//!     let mut client = Client::connect(addr, relay_shared::PROTOCOL_VERSION, Duration::from_secs(5)).await?;
//!
//!     client.request("connector.entry", json!({"uid": "alice"})).await?;
//!     client.request("chat.send", json!({"text": "hello"})).await?;
//!     let (route, body) = client.next_push().await?;
//!     println!("{}: {}", route, body);
//!
//!     client.disconnect("bye").await?;
//!     Ok(())
//! }
//! ```

pub mod network;
