//! ProLeak Client Library
//!
//! Client for the ProLeak engine: maintains a persistent TCP connection,
//! decodes the engine's terminator-delimited event stream into discrete
//! named events, and routes each event through user-registered callbacks.
//! Interceptors may rewrite or block a prefix event before the engine
//! commits it; handlers observe completed events, optionally with a
//! cancellation capability to stop the session.
//!
//! # Modules
//!
//! - [`client`] - Session lifecycle, the background receive loop, and the
//!   `plug` convenience mode
//! - [`config`] - Connection configuration
//! - [`dispatch`] - Handler/interceptor registries and per-frame routing
//! - [`error`] - Error types
//! - [`frame`] - Frame decoding for the inbound byte stream
//! - [`protocol`] - Wire contract: decoded events and outbound commands

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod protocol;

// Re-export commonly used types
pub use client::Client;
pub use config::Config;
pub use dispatch::{CancelToken, EventNames, Handler, Interceptor, RegistrationId};
pub use error::{Error, Result};
pub use frame::{DecodeError, Frame, FrameDecoder};
pub use protocol::{Command, Event, InterceptionResult, ParamEntries, ParamEntry, ParamMap};
