//! # Utility Modules
//!
//! Supporting utilities for the cipher, compression, logging, and timing.
//!
//! ## Components
//! - **Crypto**: ENCRYPT_GEN_5 keystream state
//! - **Compression**: zlib and bzip2 with marker bytes and size limits
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Async timeout wrappers
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Decompression bomb protection (payload ceiling enforced while inflating)

pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use compression::{CompressionMode, CompressionPolicy};
pub use crypto::{CipherState, Generation};
pub use metrics::{Metrics, MetricsSnapshot};
