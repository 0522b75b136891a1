//! # Protocol Layer
//!
//! Packet schema, session handshake, and the pipelines turning packets into
//! frames and back.
//!
//! ## Components
//! - **Schema**: per-direction id → layout registry
//! - **Handshake**: cipher negotiation carried by the first frame
//! - **Pipeline**: compress/encrypt outbound, decrypt/decompress inbound
//! - **Dispatcher**: capability-keyed handler routing
//!
//! ## Frame Processing
//! ```text
//! Outbound: Packet -> fields -> compress -> encrypt -> [marker][payload] -> frame
//! Inbound:  frame -> [marker][payload] -> decrypt -> decompress -> fields -> Packet
//! ```

pub mod dispatcher;
pub mod handshake;
pub mod pipeline;
pub mod schema;


pub use dispatcher::Dispatcher;
pub use handshake::{CipherPair, ClientType, Handshake};
pub use pipeline::{FramePolicy, InboundPipeline, OutboundPipeline, PreparedFrame, SealedFrame};
pub use schema::{
    Capability, Direction, DispatchTable, FieldSpec, InboundEvent, PacketLayout, UnknownPacket,
};
