//! # Error Types
//!
//! Every fallible operation of the engine returns [`NetError`].
//!
//! ## Error Categories
//! - **Configuration**: invalid transport mode, address or handle, bad config files
//! - **I/O**: bind, listen, connect, accept, send and receive failures
//! - **Protocol**: malformed or oversized control frames, unsupported versions
//! - **State**: an operation the peer's current state does not allow, or a peer
//!   that has already been torn down
//!
//! Protocol violations observed on the wire never reach the caller as errors;
//! the engine closes the offending peer and reports through events instead.
//!
//! ## Example Usage
//! ```rust
//! use reactor_net::error::{NetError, Result};
//! use reactor_net::Mode;
//!
//! fn parse(mode: &str) -> Result<Mode> {
//!     mode.parse::<Mode>()
//! }
//!
//! assert!(parse("tcp").is_ok());
//! assert!(matches!(parse("sctp"), Err(NetError::InvalidMode(_))));
//! ```

use crate::protocol::state::PeerStatus;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Mode parsing
    pub const ERR_INVALID_MODE: &str = "Invalid operand. Expected 'tcp' or 'udp'";
    pub const ERR_INVALID_ADDR_KIND: &str =
        "Invalid operand. Expected 'hwaddr' or 'macaddr', 'local' or 'remote'";
    pub const ERR_INVALID_TIMEOUT_KIND: &str =
        "Invalid operand. Expected 'conn' or 'connect', 'auth' or 'authenticate'";

    /// Address resolution
    pub const ERR_NO_ADDRESS: &str = "Host resolved to no usable address";

    /// Frame decoding
    pub const ERR_UNKNOWN_COMMAND: &str = "Unknown control command";
    pub const ERR_BAD_HALO: &str = "Halo payload must be exactly 1 byte";
    pub const ERR_BAD_TIMESTAMP: &str = "Ping/pong payload must be exactly 8 bytes";
    pub const ERR_BAD_UTF8: &str = "Text payload is not valid UTF-8";
    pub const ERR_TRAILING_DATAGRAM: &str = "Datagram ends with a partial frame";

    /// Hardware address lookup
    pub const ERR_NO_HWADDR: &str = "No hardware address available";
    pub const ERR_HWADDR_UNSUPPORTED: &str = "Hardware address lookup on this platform";
}

/// Primary error type for all engine operations
#[derive(Error, Debug)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid transport mode: {0}")]
    InvalidMode(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid session handle")]
    InvalidHandle,

    #[error("Peer is already closed")]
    PeerClosed,

    #[error("Engine has been destroyed")]
    EngineDestroyed,

    #[error("Engine is busy")]
    EngineBusy,

    #[error("Cannot {op} while peer is {status}")]
    InvalidState {
        op: &'static str,
        status: PeerStatus,
    },

    #[error("Invalid control frame: {0}")]
    InvalidFrame(&'static str),

    #[error("Control frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl NetError {
    /// Whether this error means the peer is gone, as opposed to a failed operation
    pub fn is_closed(&self) -> bool {
        matches!(self, NetError::PeerClosed | NetError::EngineDestroyed)
    }
}

/// Type alias for Results using NetError
pub type Result<T> = std::result::Result<T, NetError>;
