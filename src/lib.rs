//! Rust library for controlling Arcam AV receivers over IP
//!
//! This library provides an async API for the Arcam binary control protocol
//! on TCP port 50000. It supports:
//!
//! - Lock-step command/response exchange with per-command timeouts
//! - Unsolicited state broadcasts as independent subscriptions
//! - Automatic reconnection with exponential backoff
//! - Typed helpers for power, volume, mute, source and version queries
//!
//! # Quick Start
//!
//! ```no_run
//! use arcam_avr::{Session, Source, Zone};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Arc::new(Session::open("192.168.1.100", 50000).await?);
//!     let zone = Zone::new(session.clone(), 1);
//!
//!     zone.power_on().await?;
//!     zone.set_volume(35).await?;
//!     zone.select_source(Source::Bd).await?;
//!     println!("Status: {:?}", zone.status().await?);
//!
//!     // Watch for changes made on the front panel or remote
//!     let mut updates = session.subscribe();
//!     if let Some(update) = updates.recv().await {
//!         println!("Broadcast: {:?}", update);
//!     }
//!
//!     session.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Raw Commands
//!
//! Any command code can be sent; answer codes are returned, not raised:
//!
//! ```no_run
//! use arcam_avr::Session;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::open("192.168.1.100", 50000).await?;
//!     let response = session.request(1, 0x1D, &[0xF0], Duration::from_secs(3)).await?;
//!     if !response.is_success() {
//!         println!("Rejected: {}", response.answer_code());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Zone**: High-level control of one zone
//! - **Commands**: Command codes, sources and payload decoders
//! - **Session**: Connection lifecycle, command serialization, subscriptions
//! - **Dispatcher**: Matching responses to the pending command, broadcast fan-out
//! - **Transport**: TCP socket, read loop and reconnection
//! - **Protocol**: Frame encoding and decoding

pub mod commands;
mod config;
mod dispatcher;
mod error;
pub mod protocol;
mod session;
mod subscription;
mod transport;
mod zone;

// Public exports
pub use commands::Source;
pub use config::{ConnectionConfig, DEFAULT_PORT};
pub use error::{ArcamError, Result};
pub use protocol::{AnswerCode, Command, Response};
pub use session::Session;
pub use subscription::Subscription;
pub use transport::ConnectionState;
pub use zone::{Zone, ZoneStatus};
