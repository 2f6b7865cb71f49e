//! Durable Streams Server
//!
//! The server-side engine for the Durable Streams protocol - persistent,
//! resumable event streams over HTTP with exactly-once producer semantics.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use durable_streams_server::{AppState, ServerConfig, storage::MemoryBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = AppState::new(Arc::new(MemoryBackend::new()), ServerConfig::default());
//!     let router = durable_streams_server::create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:4437").await?;
//!     axum::serve(listener, router).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Protocol
//!
//! ## Creating a stream
//!
//! ```text
//! PUT /my-events HTTP/1.1
//! Content-Type: application/json
//!
//! Response: 201 Created
//! Stream-Next-Offset: -1
//! ```
//!
//! ## Appending
//!
//! ```text
//! POST /my-events HTTP/1.1
//! Content-Type: application/json
//! Producer-Id: worker-1
//! Producer-Epoch: 1
//! Producer-Seq: 0
//!
//! {"event": "user_created", "id": 123}
//!
//! Response: 204 No Content
//! Stream-Next-Offset: 0000000000000000_0000000000000001
//! ```
//!
//! ## Reading
//!
//! ```text
//! GET /my-events?offset=-1 HTTP/1.1
//!
//! Response: 200 OK
//! Stream-Next-Offset: 0000000000000000_0000000000000001
//! Content-Type: application/json
//!
//! [{"event": "user_created", "id": 123}]
//! ```
//!
//! Live tails use `live=long-poll` (blocks until data or timeout) or
//! `live=sse` (Server-Sent Events; binary streams are base64-encoded and
//! flagged with `Stream-SSE-Data-Encoding: base64`).

pub mod config;
pub mod cursor;
pub mod error;
pub mod fence;
pub mod log;
pub mod notify;
pub mod offset;
pub mod registry;
pub mod retry;
pub mod server;
pub mod sse;
pub mod storage;
pub mod webhook;

pub use config::ServerConfig;
pub use error::EngineError;
pub use fence::{FenceEntry, ProducerClaims};
pub use log::{AppendOutcome, ReadFrom, ReadPage, StreamLog, StreamMeta};
pub use offset::{Offset, OffsetToken};
pub use registry::{Registry, StreamConfigReq};
pub use server::{create_router, AppState};
pub use webhook::WebhookDispatcher;
