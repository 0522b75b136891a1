//! Connection lifecycle on top of the protocol pipelines.

pub mod connection;

pub use connection::{
    Connection, ConnectionHandle, ConnectionState, PendingConnection, ProtocolContext,
};
