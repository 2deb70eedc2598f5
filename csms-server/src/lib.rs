//! # CSMS Server
//!
//! OCPP central system: accepts charge point WebSocket connections, answers
//! the calls they send and lets business logic call them back.
//!
//! ## Architecture
//!
//! ```text
//! Charge points
//!       │ WebSocket JSON-RPC (ocpp1.6)
//!       ▼
//! ┌────────────────────────────────────────────┐
//! │ CentralSystem                              │
//! │  handshake ─► ConnectionRegistry           │
//! │                    │                       │
//! │  reader ─► Dispatcher ─► CodecTable        │
//! │    │                       └─► Handlers<R> │
//! │    └─────► RequestTracker ◄── call::<R>()  │
//! └────────────────────────────────────────────┘
//! ```
//!
//! - [`registry`]: one live connection per station, newer connections evict older ones
//! - [`codec`]: action name to typed parse, subscriber chain and serialization
//! - [`dispatcher`]: frame decoding, CALLRESULT/CALLERROR generation
//! - [`tracker`]: correlation and deadlines of server-initiated calls
//! - [`events`]: per-action subscriber lists, first registered responder wins
//!
//! ## Usage
//!
//! ```no_run
//! use csms_server::ocpp::v16::{BootNotificationRequest, BootNotificationResponse};
//! use csms_server::{CentralSystem, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let central = CentralSystem::new(ServerConfig::default());
//!
//!     central.respond_with(|_, _: BootNotificationRequest| async {
//!         Ok(Some(BootNotificationResponse::accepted(300)))
//!     })?;
//!
//!     central.run().await?;
//!     Ok(())
//! }
//! ```

pub mod ocpp;
pub mod registry;
pub mod codec;
pub mod events;
pub mod dispatcher;
pub mod tracker;
pub mod auth;
pub mod handshake;
pub mod server;
pub mod commands;
pub mod config;
pub mod error;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::CentralSystem;

// Re-export key types
pub use events::{HandlerError, HandlerResult, Handlers, RequestContext};
pub use ocpp::{Call, CallError, CallResult, ErrorCode, OcppRequest, OcppResponse, OcppVersion, Reply};
pub use registry::StationId;
pub use tracker::{CallOutcome, RequestError};
