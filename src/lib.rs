//! # reborn-protocol
//!
//! Wire protocol core for legacy game clients speaking protocol v6.037
//! with the `ENCRYPT_GEN_5` cipher.
//!
//! The crate turns a TCP byte stream into typed packets and back:
//!
//! ```text
//! bytes -> frames -> [marker][ciphertext] -> decrypt -> decompress -> packets
//! ```
//!
//! ## Layers
//! - [`core`]: field encodings, packet values, frame codec
//! - [`protocol`]: packet schema, handshake, pipelines, dispatcher
//! - [`service`]: per-connection state machine
//! - [`transport`]: TCP server loop and client connector
//! - [`utils`]: cipher, compression, logging, metrics, timeouts
//!
//! ## Quick Start
//! ```rust,no_run
//! use std::sync::Arc;
//! use reborn_protocol::config::ProtocolConfig;
//! use reborn_protocol::protocol::{Capability, Direction, Dispatcher};
//! use reborn_protocol::service::ProtocolContext;
//! use reborn_protocol::transport::tcp;
//! use reborn_protocol::utils::logging::init_logging;
//!
//! # async fn run() -> reborn_protocol::error::Result<()> {
//! let config = ProtocolConfig::from_env()?;
//! init_logging(&config.logging)?;
//!
//! let ctx = ProtocolContext::new(config);
//! let dispatcher = Dispatcher::new(Arc::clone(&ctx.schema), Direction::ClientToServer);
//! dispatcher.register(Capability::Chat, |packet, layout| {
//!     tracing::info!(name = layout.name, fields = packet.fields.len(), "chat");
//!     Ok(Vec::new())
//! })?;
//!
//! tcp::start_server(ctx, Arc::new(dispatcher)).await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::ProtocolConfig;
pub use crate::core::packet::{FieldType, FieldValue, Packet};
pub use crate::error::{ProtocolError, Result};
pub use crate::service::{
    Connection, ConnectionHandle, ConnectionState, PendingConnection, ProtocolContext,
};
