//! Events produced by the engine and drained by the host.
//!
//! [`Event`] is a closed enum, so hosts match on it exhaustively. When a host
//! needs a loosely typed record instead, the serde representation is a map
//! with a `cmd` discriminator:
//!
//! ```rust
//! use reactor_net::Event;
//!
//! let json = serde_json::to_string(&Event::Halo { protocol_version: 1 }).unwrap();
//! assert_eq!(json, r#"{"cmd":"halo","protocol_version":1}"#);
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// One observable transition or arrival on a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Event {
    /// A listener accepted a new peer
    Incoming,
    /// An outbound connect did not complete in time
    #[serde(rename = "conn-timeout")]
    ConnectTimeout,
    /// An accepted peer sent no credentials before the auth timeout
    Unauthorized,
    /// The remote announced its protocol version
    Halo { protocol_version: u8 },
    /// The remote presented credentials
    Auth { credential: String },
    /// The remote accepted our credentials
    Accepted { welcome: String },
    /// The remote rejected our credentials
    Rejected { reason: String },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    /// An outbound connect completed
    Outgoing,
    Data { bytes: Bytes },
}

impl Event {
    /// Command name, as used in the `cmd` field
    pub fn command(&self) -> &'static str {
        match self {
            Event::Incoming => "incoming",
            Event::ConnectTimeout => "conn-timeout",
            Event::Unauthorized => "unauthorized",
            Event::Halo { .. } => "halo",
            Event::Auth { .. } => "auth",
            Event::Accepted { .. } => "accepted",
            Event::Rejected { .. } => "rejected",
            Event::Ping { .. } => "ping",
            Event::Pong { .. } => "pong",
            Event::Outgoing => "outgoing",
            Event::Data { .. } => "data",
        }
    }
}

/// FIFO of events tagged with the peer they originate from
///
/// Keeps a per-origin count so the engine can tell whether a peer that has
/// already been removed still has undelivered events.
#[derive(Debug)]
pub struct EventQueue<K> {
    events: VecDeque<(K, Event)>,
    pending: HashMap<K, usize>,
}

impl<K: Copy + Eq + Hash> Default for EventQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash> EventQueue<K> {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, origin: K, event: Event) {
        *self.pending.entry(origin).or_insert(0) += 1;
        self.events.push_back((origin, event));
    }

    pub fn pop(&mut self) -> Option<(K, Event)> {
        let (origin, event) = self.events.pop_front()?;
        if let Some(count) = self.pending.get_mut(&origin) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(&origin);
            }
        }
        Some((origin, event))
    }

    /// Undelivered events for `origin`
    pub fn pending_for(&self, origin: K) -> usize {
        self.pending.get(&origin).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Discard everything, returning how many events were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.events.len();
        self.events.clear();
        self.pending.clear();
        dropped
    }
}
