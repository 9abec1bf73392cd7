//! DoTunnel Shared Library
//!
//! Envelope types and the JSON codec spoken over the relay socket.

pub mod codec;
pub mod error;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::{RequestEnvelope, ResponseEnvelope};
