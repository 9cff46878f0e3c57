//! pivot-core: shared library for the pivot tunneling relay.
//!
//! This crate provides:
//! - Protocol envelope definitions and wire format codec
//! - Bidirectional byte relay
//! - QUIC transport construction (endpoints, TLS identity)
//! - Network error classification
//! - Logging setup and error types

pub mod constants;
pub mod error;
pub mod logging;
pub mod neterror;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
