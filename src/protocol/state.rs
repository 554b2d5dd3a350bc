//! Peer lifecycle and handshake states.
//!
//! ```text
//! outbound:  Connecting ──ok──> Connected ──close()──> Closing ──flushed──> Closed
//!                 │ timeout / error                       remote close / error ──┘
//!                 └──────────────────────────> Closed
//!
//! listener:  Listening ──close()──> Closed
//!
//! accepted:  Connected [AwaitingHalo ──halo──> AwaitingAuth ──accept──> Accepted]
//!                                                   └──reject──> Rejected ──> Closing
//! ```
//!
//! The handshake sub-state only exists on TCP stream peers. UDP peers are
//! usable as soon as they are `Connected`.
//!
//! Every per-peer operation is checked here before the engine touches any
//! socket, so a call in the wrong state fails with `InvalidState` and leaves
//! the peer untouched.

use crate::error::{constants, NetError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport used by a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Tcp,
    Udp,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Tcp => "tcp",
            Mode::Udp => "udp",
        }
    }
}

impl FromStr for Mode {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Mode::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Mode::Udp)
        } else {
            Err(NetError::InvalidMode(format!(
                "{}: '{s}'",
                constants::ERR_INVALID_MODE
            )))
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a peer came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Bound by `server()`
    Listener,
    /// Opened by `connect()`
    Outbound,
    /// Accepted from a listener
    Accepted,
}

/// Lifecycle state visible to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Listening,
    Closing,
    Closed,
}

impl PeerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerStatus::Connecting => "connecting",
            PeerStatus::Connected => "connected",
            PeerStatus::Listening => "listening",
            PeerStatus::Closing => "closing",
            PeerStatus::Closed => "closed",
        }
    }

    /// Closing or closed
    pub fn is_terminating(self) -> bool {
        matches!(self, PeerStatus::Closing | PeerStatus::Closed)
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-level handshake progress of a TCP stream peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Handshake {
    /// Accepted peer waiting for the remote halo; outbound peer waiting for a verdict
    AwaitingHalo,
    /// Halo received, waiting for credentials and then the host's decision
    AwaitingAuth,
    Accepted,
    Rejected,
}

/// Host-visible operations that depend on peer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Send,
    Ping,
    Pong,
    Auth,
    Accept,
    Reject,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Send => "send",
            Op::Ping => "ping",
            Op::Pong => "pong",
            Op::Auth => "auth",
            Op::Accept => "accept",
            Op::Reject => "reject",
        }
    }
}

/// Snapshot of the state that decides whether an operation is allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    pub mode: Mode,
    pub role: Role,
    pub status: PeerStatus,
    pub handshake: Option<Handshake>,
    /// Set once an outbound peer has sent its credentials
    pub auth_sent: bool,
    /// Set once an accepted peer has presented credentials
    pub auth_received: bool,
}

impl PeerState {
    /// Initial state for a freshly created peer
    pub fn new(mode: Mode, role: Role) -> Self {
        let status = match role {
            Role::Listener => PeerStatus::Listening,
            Role::Outbound => PeerStatus::Connecting,
            Role::Accepted => PeerStatus::Connected,
        };
        let handshake = match (mode, role) {
            (Mode::Tcp, Role::Outbound | Role::Accepted) => Some(Handshake::AwaitingHalo),
            _ => None,
        };
        Self {
            mode,
            role,
            status,
            handshake,
            auth_sent: false,
            auth_received: false,
        }
    }

    /// Whether application data may flow
    pub fn is_established(&self) -> bool {
        self.status == PeerStatus::Connected
            && matches!(self.handshake, None | Some(Handshake::Accepted))
    }

    /// Check `op` against the current state
    pub fn check(&self, op: Op) -> Result<()> {
        let allowed = self.status == PeerStatus::Connected
            && match op {
                Op::Send => self.is_established(),
                // An accepted stream must see the remote's halo first
                Op::Ping | Op::Pong => !(self.role == Role::Accepted
                    && self.handshake == Some(Handshake::AwaitingHalo)),
                Op::Auth => {
                    self.role == Role::Outbound
                        && self.handshake == Some(Handshake::AwaitingHalo)
                        && !self.auth_sent
                }
                Op::Accept => {
                    self.role == Role::Accepted
                        && self.handshake == Some(Handshake::AwaitingAuth)
                        && self.auth_received
                }
                Op::Reject => {
                    self.role == Role::Accepted
                        && self.handshake == Some(Handshake::AwaitingAuth)
                }
            };

        if allowed {
            Ok(())
        } else {
            Err(NetError::InvalidState {
                op: op.as_str(),
                status: self.status,
            })
        }
    }
}
