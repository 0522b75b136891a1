//! # Transport Layer
//!
//! TCP server loop and client connector.

pub mod tcp;
