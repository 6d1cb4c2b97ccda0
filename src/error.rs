//! Crate-wide error types
//!
//! This module defines the centralized error type using `thiserror` for
//! clean error handling across the client.

use thiserror::Error;

use crate::frame::DecodeError;

/// Errors surfaced by the ProLeak client
///
/// Connection errors (connect failures, sending while disconnected, send
/// failures) are always returned to the caller. Decode errors normally stay
/// inside the receive loop, which skips the malformed frame and keeps going;
/// the variant exists for callers driving [`crate::frame::FrameDecoder`]
/// directly.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to open the TCP connection to the engine
    #[error("failed to connect to the ProLeak engine at {addr}: {source}. Is the engine running?")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The connection attempt did not complete within the configured timeout
    #[error("timed out connecting to the ProLeak engine at {addr} after {timeout_secs}s")]
    ConnectTimeout { addr: String, timeout_secs: u64 },

    /// A command was issued while no connection is open
    #[error("not connected to the ProLeak engine, call connect() first")]
    NotConnected,

    /// Writing a command to the open connection failed
    #[error("failed to send command to the ProLeak engine: {0}")]
    SendFailed(#[source] std::io::Error),

    /// A frame of the inbound stream could not be decoded
    #[error("failed to decode frame: {0}")]
    Decode(#[from] DecodeError),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Error>;
