//! # Core Protocol Components
//!
//! Low-level field encodings, packet values, and stream framing.
//!
//! ## Components
//! - **Field**: offset-biased variable-length and fixed-width encodings
//! - **Packet**: identifier plus typed field values
//! - **Frame**: Tokio codec splitting the byte stream into frames
//!
//! ## Wire Format
//! ```text
//! [compression marker(1)] [encrypted payload(N)]   stuffed, then 0x0a
//! ```
//!
//! ## Security
//! - Maximum frame size enforced before a frame is buffered in full
//! - Field decoders never read past the buffer and reject overflow

pub mod field;
pub mod frame;
pub mod packet;
