//! Engine-owned connection state.

use crate::core::handle::Handle;
use crate::engine::session::SessionInner;
use crate::protocol::state::{Mode, PeerState, Role};
use crate::transport::Socket;
use bytes::{Bytes, BytesMut};
use mio::Token;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::rc::Weak;
use std::time::Instant;

/// Engine-internal peer identifier, doubling as the poll token.
///
/// Identifiers are never reused within an engine, so an id that is no
/// longer in the peer set always refers to a removed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct PeerId(pub usize);

impl PeerId {
    pub fn token(self) -> Token {
        Token(self.0)
    }
}

impl From<Token> for PeerId {
    fn from(token: Token) -> Self {
        PeerId(token.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One TCP stream, UDP association or listening socket
#[derive(Debug)]
pub(crate) struct Peer {
    pub state: PeerState,
    pub socket: Socket,
    /// Listener this peer was accepted from
    pub parent: Option<PeerId>,
    /// Peers accepted from this listener
    pub children: HashSet<PeerId>,
    /// UDP listeners only: remote address to association
    pub associations: HashMap<SocketAddr, PeerId>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Version announced in the remote halo
    pub protocol_version: Option<u8>,
    pub inbound: BytesMut,
    pub outbound: BytesMut,
    /// Datagrams the socket would not take yet, with their destination
    pub datagrams: VecDeque<(Option<SocketAddr>, Bytes)>,
    pub connect_deadline: Option<Instant>,
    pub auth_deadline: Option<Instant>,
    pub close_deadline: Option<Instant>,
    /// Registry handle, present once the host has a wrapper
    pub handle: Option<Handle>,
    /// Host wrapper, cleared together with removal from the peer set
    pub session: Option<Weak<SessionInner>>,
}

impl Peer {
    pub fn new(mode: Mode, role: Role, socket: Socket, remote_addr: Option<SocketAddr>) -> Self {
        let local_addr = socket.local_addr();
        Self {
            state: PeerState::new(mode, role),
            socket,
            parent: None,
            children: HashSet::new(),
            associations: HashMap::new(),
            local_addr,
            remote_addr,
            protocol_version: None,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            datagrams: VecDeque::new(),
            connect_deadline: None,
            auth_deadline: None,
            close_deadline: None,
            handle: None,
            session: None,
        }
    }

    /// Child accepted from `parent`
    pub fn accepted(
        mode: Mode,
        socket: Socket,
        parent: PeerId,
        local_addr: Option<SocketAddr>,
        remote_addr: SocketAddr,
    ) -> Self {
        let mut peer = Self::new(mode, Role::Accepted, socket, Some(remote_addr));
        peer.parent = Some(parent);
        if peer.local_addr.is_none() {
            peer.local_addr = local_addr;
        }
        peer
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.connect_deadline, self.auth_deadline, self.close_deadline]
            .into_iter()
            .flatten()
            .min()
    }
}
