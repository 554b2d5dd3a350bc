//! The reactor proper: peer set, poll loop, timers and event production.
//!
//! `EngineCore` is only ever reached through a `RefCell` borrow held by the
//! public [`Engine`](crate::Engine) or a [`Session`] call, so every method
//! here runs to completion before the host regains control.

use crate::config::{is_supported_version, EngineSettings, PROTOCOL_VERSION};
use crate::core::frame::{Frame, FrameCodec};
use crate::core::handle::{Handle, HandleRegistry};
use crate::engine::peer::{Peer, PeerId};
use crate::engine::session::{Session, SessionInner};
use crate::engine::{AddrKind, Address, Shared};
use crate::error::{NetError, Result};
use crate::protocol::event::{Event, EventQueue};
use crate::protocol::state::{Handshake, Mode, Op, PeerStatus, Role};
use crate::transport::{self, ConnectProgress, Socket};
use crate::utils::metrics::EngineMetrics;
use bytes::{Buf, Bytes};
use mio::{Events, Poll};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, instrument, trace, warn};

/// Readiness reported for one peer in a poll cycle
#[derive(Debug, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Connect,
    Auth,
    Close,
}

/// Holder of a removed peer's undelivered events
enum Retired {
    /// The host held a wrapper when the peer was removed
    Observed(Weak<SessionInner>),
    /// Removed by a timer before the host saw it
    Unobserved(Session),
}

pub(crate) struct EngineCore {
    poll: Poll,
    events: Events,
    peers: HashMap<PeerId, Peer>,
    pub(crate) registry: HandleRegistry<PeerId>,
    queue: EventQueue<PeerId>,
    /// Removed peers that still have undelivered events
    retired: HashMap<PeerId, Retired>,
    next_id: usize,
    conn_timeout: Duration,
    auth_timeout: Duration,
    settings: EngineSettings,
    codec: FrameCodec,
    scratch: Vec<u8>,
    metrics: EngineMetrics,
    destroyed: bool,
}

impl EngineCore {
    pub fn new(settings: &EngineSettings) -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(settings.event_capacity),
            peers: HashMap::new(),
            registry: HandleRegistry::new(),
            queue: EventQueue::new(),
            retired: HashMap::new(),
            next_id: 1,
            conn_timeout: settings.connect_timeout,
            auth_timeout: settings.auth_timeout,
            settings: settings.clone(),
            codec: FrameCodec::new(settings.max_frame_size),
            scratch: vec![0; settings.read_chunk_size],
            metrics: EngineMetrics::new(),
            destroyed: false,
        })
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            Err(NetError::EngineDestroyed)
        } else {
            Ok(())
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub fn listen(&mut self, mode: Mode, addr: SocketAddr, backlog: Option<i32>) -> Result<PeerId> {
        self.ensure_alive()?;
        let socket = match mode {
            Mode::Tcp => {
                let backlog = backlog.unwrap_or(self.settings.listen_backlog);
                Socket::TcpListener(transport::listen_tcp(addr, backlog)?)
            }
            Mode::Udp => Socket::Udp(transport::bind_udp(addr)?),
        };
        let local = socket.local_addr();
        let id = self.add_peer(Peer::new(mode, Role::Listener, socket, None))?;
        info!(peer = %id, %mode, local = ?local, "Listening");
        Ok(id)
    }

    #[instrument(skip(self), level = "debug")]
    pub fn connect(&mut self, mode: Mode, addr: SocketAddr) -> Result<PeerId> {
        self.ensure_alive()?;
        let socket = match mode {
            Mode::Tcp => Socket::TcpStream(transport::connect_tcp(addr)?),
            Mode::Udp => Socket::Udp(transport::connect_udp(addr)?),
        };
        let mut peer = Peer::new(mode, Role::Outbound, socket, Some(addr));
        peer.connect_deadline = Some(Instant::now() + self.conn_timeout);
        let id = self.add_peer(peer)?;
        debug!(peer = %id, "Connecting");
        Ok(id)
    }

    fn next_peer_id(&mut self) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id += 1;
        id
    }

    fn add_peer(&mut self, mut peer: Peer) -> Result<PeerId> {
        let id = self.next_peer_id();
        peer.socket.register(self.poll.registry(), id.token())?;
        self.peers.insert(id, peer);
        self.metrics.peer_opened();
        Ok(id)
    }

    /// Return the host wrapper for `id`, creating it and its handle if the
    /// host has never seen this peer.
    ///
    /// Returns `None` when a wrapper existed but the host has dropped it.
    pub fn attach(&mut self, id: PeerId, engine: &Weak<Shared>) -> Option<Session> {
        let peer = self.peers.get_mut(&id)?;
        if let Some(weak) = &peer.session {
            return weak.upgrade().map(Session::from_inner);
        }
        let handle = match peer.handle {
            Some(handle) => handle,
            None => {
                let handle = self.registry.insert(id);
                peer.handle = Some(handle);
                handle
            }
        };
        let session = Session::new(handle, peer.state.mode, engine.clone());
        peer.session = Some(Rc::downgrade(&session.inner));
        trace!(peer = %id, %handle, "Session attached");
        Some(session)
    }

    pub fn lookup(&self, handle: Handle) -> Result<Session> {
        self.ensure_alive()?;
        let id = self.registry.get(handle).ok_or(NetError::InvalidHandle)?;
        self.peers
            .get(&id)
            .and_then(|peer| peer.session.as_ref())
            .and_then(Weak::upgrade)
            .map(Session::from_inner)
            .ok_or(NetError::InvalidHandle)
    }

    pub fn set_conn_timeout(&mut self, timeout: Duration) -> Duration {
        std::mem::replace(&mut self.conn_timeout, timeout)
    }

    pub fn set_auth_timeout(&mut self, timeout: Duration) -> Duration {
        std::mem::replace(&mut self.auth_timeout, timeout)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Run one poll cycle bounded by `timeout`
    pub fn update(&mut self, timeout: Duration) -> Result<usize> {
        self.ensure_alive()?;
        self.promote_udp_outbound();

        let now = Instant::now();
        let wait = match self.peers.values().filter_map(Peer::next_deadline).min() {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(now)),
            None => timeout,
        };

        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        let ready: Vec<(PeerId, Readiness)> = self
            .events
            .iter()
            .map(|event| {
                (
                    PeerId::from(event.token()),
                    Readiness {
                        readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                        writable: event.is_writable() || event.is_error(),
                    },
                )
            })
            .collect();

        for &(id, readiness) in &ready {
            self.handle_ready(id, readiness);
        }

        self.check_timers(Instant::now());
        Ok(ready.len())
    }

    /// Connected UDP sockets have no handshake to wait for
    fn promote_udp_outbound(&mut self) {
        let mut promoted: Vec<PeerId> = self
            .peers
            .iter_mut()
            .filter(|(_, peer)| {
                peer.state.mode == Mode::Udp
                    && peer.state.role == Role::Outbound
                    && peer.state.status == PeerStatus::Connecting
            })
            .map(|(id, peer)| {
                peer.state.status = PeerStatus::Connected;
                peer.connect_deadline = None;
                *id
            })
            .collect();
        promoted.sort();
        for id in promoted {
            debug!(peer = %id, "UDP peer connected");
            self.emit(id, Event::Outgoing);
        }
    }

    fn handle_ready(&mut self, id: PeerId, readiness: Readiness) {
        let Some(peer) = self.peers.get(&id) else {
            // Removed earlier in this cycle
            return;
        };
        match (&peer.socket, peer.state.status) {
            (Socket::TcpListener(_), _) => self.accept_streams(id),
            (Socket::TcpStream(_), PeerStatus::Connecting) => {
                if self.finish_connect(id) {
                    self.read_stream(id);
                    self.flush_stream(id);
                }
            }
            (Socket::TcpStream(_), _) => {
                if readiness.readable {
                    self.read_stream(id);
                }
                if readiness.writable {
                    self.flush_stream(id);
                }
            }
            (Socket::Udp(_), _) => {
                if readiness.readable {
                    self.read_datagrams(id);
                }
                if readiness.writable {
                    self.flush_datagrams(id);
                }
            }
            (Socket::UdpAssociation, _) => {}
        }
    }

    /// Returns whether the connect completed
    fn finish_connect(&mut self, id: PeerId) -> bool {
        let Some(peer) = self.peers.get_mut(&id) else {
            return false;
        };
        let Socket::TcpStream(stream) = &peer.socket else {
            return false;
        };
        match transport::connect_progress(stream) {
            ConnectProgress::Pending => false,
            ConnectProgress::Established => {
                peer.state.status = PeerStatus::Connected;
                peer.connect_deadline = None;
                peer.local_addr = stream.local_addr().ok();
                peer.remote_addr = stream.peer_addr().ok().or(peer.remote_addr);
                debug!(peer = %id, remote = ?peer.remote_addr, "Connected");
                self.emit(id, Event::Outgoing);
                if let Err(e) = self.send_frame(id, Frame::Halo(PROTOCOL_VERSION)) {
                    warn!(peer = %id, error = %e, "Failed to send halo");
                }
                self.peers.contains_key(&id)
            }
            ConnectProgress::Failed(e) => {
                warn!(peer = %id, error = %e, "Connect failed");
                self.metrics.io_error();
                self.remove_peer(id);
                false
            }
        }
    }

    fn accept_streams(&mut self, id: PeerId) {
        loop {
            let Some(Peer {
                socket: Socket::TcpListener(listener),
                local_addr,
                ..
            }) = self.peers.get(&id)
            else {
                return;
            };
            let local_addr = *local_addr;
            match listener.accept() {
                Ok((stream, remote)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    let mut child = Peer::accepted(
                        Mode::Tcp,
                        Socket::TcpStream(stream),
                        id,
                        local_addr,
                        remote,
                    );
                    child.auth_deadline = Some(Instant::now() + self.auth_timeout);
                    self.adopt(id, child, remote);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(peer = %id, error = %e, "Accept failed");
                    self.metrics.io_error();
                    return;
                }
            }
        }
    }

    /// Insert a child of `parent` and announce it
    fn adopt(&mut self, parent: PeerId, child: Peer, remote: SocketAddr) -> Option<PeerId> {
        let mode = child.state.mode;
        let child_id = match self.add_peer(child) {
            Ok(child_id) => child_id,
            Err(e) => {
                warn!(peer = %parent, error = %e, "Failed to register accepted peer");
                return None;
            }
        };
        if let Some(listener) = self.peers.get_mut(&parent) {
            listener.children.insert(child_id);
            if mode == Mode::Udp {
                listener.associations.insert(remote, child_id);
            }
        }
        self.metrics.connection_accepted();
        debug!(peer = %child_id, listener = %parent, %remote, "Incoming peer");
        self.emit(child_id, Event::Incoming);
        Some(child_id)
    }

    /// Read until the socket pushes back, decoding after every chunk.
    ///
    /// A frame whose length exceeds the limit is refused as soon as its
    /// header is buffered, so `inbound` never holds more than one partial
    /// frame plus one read chunk.
    fn read_stream(&mut self, id: PeerId) {
        loop {
            let Some(peer) = self.peers.get_mut(&id) else {
                return;
            };
            let Socket::TcpStream(stream) = &mut peer.socket else {
                return;
            };
            match stream.read(&mut self.scratch) {
                Ok(0) => {
                    debug!(peer = %id, "Remote closed");
                    self.remove_peer(id);
                    return;
                }
                Ok(n) => {
                    peer.inbound.extend_from_slice(&self.scratch[..n]);
                    if !self.decode_inbound(id) {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(peer = %id, error = %e, "Read failed");
                    self.metrics.io_error();
                    self.remove_peer(id);
                    return;
                }
            }
        }
    }

    /// Dispatch every complete frame buffered for `id`; `false` once the peer is gone
    fn decode_inbound(&mut self, id: PeerId) -> bool {
        loop {
            let Some(peer) = self.peers.get_mut(&id) else {
                return false;
            };
            match self.codec.decode(&mut peer.inbound) {
                Ok(Some(frame)) => {
                    self.metrics.frame_received(frame.encoded_len());
                    self.dispatch(id, frame);
                }
                Ok(None) => return true,
                Err(e) => {
                    warn!(peer = %id, error = %e, "Malformed frame, closing peer");
                    self.metrics.protocol_error();
                    self.remove_peer(id);
                    return false;
                }
            }
        }
    }

    fn read_datagrams(&mut self, id: PeerId) {
        loop {
            let Some(Peer {
                socket: Socket::Udp(socket),
                state,
                local_addr,
                ..
            }) = self.peers.get(&id)
            else {
                return;
            };
            let role = state.role;
            let local_addr = *local_addr;
            let received = match role {
                Role::Listener => socket
                    .recv_from(&mut self.scratch)
                    .map(|(n, from)| (n, Some(from))),
                _ => socket.recv(&mut self.scratch).map(|n| (n, None)),
            };
            match received {
                Ok((n, from)) => {
                    let datagram = Bytes::copy_from_slice(&self.scratch[..n]);
                    let target = match from {
                        Some(remote) => match self.association(id, remote, local_addr) {
                            Some(child) => child,
                            None => continue,
                        },
                        None => id,
                    };
                    self.deliver_datagram(target, &datagram);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if role == Role::Listener => {
                    // ICMP errors for one remote must not take the listener down
                    trace!(peer = %id, error = %e, "Datagram receive error");
                    self.metrics.io_error();
                }
                Err(e) => {
                    warn!(peer = %id, error = %e, "Datagram receive failed");
                    self.metrics.io_error();
                    self.remove_peer(id);
                    return;
                }
            }
        }
    }

    /// Association for `remote` on UDP listener `id`, created on first contact
    fn association(
        &mut self,
        id: PeerId,
        remote: SocketAddr,
        local_addr: Option<SocketAddr>,
    ) -> Option<PeerId> {
        if let Some(child) = self
            .peers
            .get(&id)
            .and_then(|listener| listener.associations.get(&remote))
        {
            return Some(*child);
        }
        let child = Peer::accepted(Mode::Udp, Socket::UdpAssociation, id, local_addr, remote);
        self.adopt(id, child, remote)
    }

    fn deliver_datagram(&mut self, id: PeerId, datagram: &[u8]) {
        match self.codec.decode_datagram(datagram) {
            Ok(frames) => {
                for frame in frames {
                    if !self.peers.contains_key(&id) {
                        return;
                    }
                    self.metrics.frame_received(frame.encoded_len());
                    self.dispatch(id, frame);
                }
            }
            Err(e) => {
                warn!(peer = %id, error = %e, "Malformed datagram, closing peer");
                self.metrics.protocol_error();
                self.remove_peer(id);
            }
        }
    }

    /// Apply one inbound frame to the peer's state machine
    fn dispatch(&mut self, id: PeerId, frame: Frame) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if peer.state.status != PeerStatus::Connected {
            trace!(peer = %id, frame = frame.name(), "Discarding frame on closing peer");
            return;
        }
        let state = peer.state;
        let awaiting_verdict = state.role == Role::Outbound
            && state.handshake == Some(Handshake::AwaitingHalo)
            && state.auth_sent;

        match frame {
            Frame::Data(bytes) if state.is_established() => self.emit(id, Event::Data { bytes }),
            Frame::Ping(timestamp) if state.check(Op::Ping).is_ok() => {
                self.emit(id, Event::Ping { timestamp })
            }
            Frame::Pong(timestamp) if state.check(Op::Pong).is_ok() => {
                self.emit(id, Event::Pong { timestamp })
            }
            Frame::Halo(version)
                if state.role == Role::Accepted
                    && state.handshake == Some(Handshake::AwaitingHalo) =>
            {
                if is_supported_version(version) {
                    peer.protocol_version = Some(version);
                    peer.state.handshake = Some(Handshake::AwaitingAuth);
                    debug!(peer = %id, version, "Halo received");
                    self.emit(
                        id,
                        Event::Halo {
                            protocol_version: version,
                        },
                    );
                } else {
                    let err = NetError::UnsupportedVersion(version);
                    warn!(peer = %id, error = %err, "Handshake failed");
                    self.metrics.handshake_failed();
                    self.remove_peer(id);
                }
            }
            Frame::Auth(credential)
                if state.handshake == Some(Handshake::AwaitingAuth) && !state.auth_received =>
            {
                peer.state.auth_received = true;
                peer.auth_deadline = None;
                debug!(peer = %id, "Credentials received");
                self.emit(id, Event::Auth { credential });
            }
            Frame::Accepted(welcome) if awaiting_verdict => {
                peer.state.handshake = Some(Handshake::Accepted);
                self.metrics.handshake_success();
                debug!(peer = %id, "Handshake accepted by remote");
                self.emit(id, Event::Accepted { welcome });
            }
            Frame::Rejected(reason) if awaiting_verdict => {
                peer.state.handshake = Some(Handshake::Rejected);
                self.metrics.handshake_failed();
                debug!(peer = %id, %reason, "Handshake rejected by remote");
                self.emit(id, Event::Rejected { reason });
            }
            other => {
                warn!(
                    peer = %id,
                    frame = other.name(),
                    handshake = ?state.handshake,
                    "Unexpected frame, closing peer"
                );
                self.metrics.protocol_error();
                self.remove_peer(id);
            }
        }
    }

    fn emit(&mut self, id: PeerId, event: Event) {
        trace!(peer = %id, cmd = event.command(), "Event queued");
        self.queue.push(id, event);
        self.metrics.event_emitted();
    }

    fn send_frame(&mut self, id: PeerId, frame: Frame) -> Result<()> {
        let peer = self.peers.get_mut(&id).ok_or(NetError::PeerClosed)?;
        let len = frame.encoded_len();
        match &peer.socket {
            Socket::TcpStream(_) => {
                self.codec.encode(frame, &mut peer.outbound)?;
                self.metrics.frame_sent(len);
                self.flush_stream(id);
                Ok(())
            }
            Socket::Udp(_) | Socket::UdpAssociation => {
                let datagram = Bytes::from(self.codec.encode_to_vec(frame)?);
                self.metrics.frame_sent(len);
                self.send_datagram(id, datagram)
            }
            Socket::TcpListener(_) => Err(NetError::InvalidState {
                op: "send",
                status: peer.state.status,
            }),
        }
    }

    /// Write buffered stream output until the socket pushes back, then
    /// finish a graceful close once nothing is left.
    fn flush_stream(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if peer.state.status == PeerStatus::Connecting {
            return;
        }
        let Socket::TcpStream(stream) = &mut peer.socket else {
            return;
        };

        let mut failure = None;
        while !peer.outbound.is_empty() {
            match stream.write(&peer.outbound) {
                Ok(0) => {
                    failure = Some(io::Error::from(io::ErrorKind::WriteZero));
                    break;
                }
                Ok(n) => peer.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            warn!(peer = %id, error = %e, "Write failed");
            self.metrics.io_error();
            self.remove_peer(id);
        } else if peer.state.status == PeerStatus::Closing && peer.outbound.is_empty() {
            if let Err(e) = stream.shutdown(Shutdown::Write) {
                trace!(peer = %id, error = %e, "Shutdown failed");
            }
            debug!(peer = %id, "Graceful close complete");
            self.remove_peer(id);
        }
    }

    fn send_datagram(&mut self, id: PeerId, datagram: Bytes) -> Result<()> {
        let peer = self.peers.get(&id).ok_or(NetError::PeerClosed)?;
        let (owner, target) = match peer.socket {
            Socket::UdpAssociation => (
                peer.parent.ok_or(NetError::PeerClosed)?,
                peer.remote_addr,
            ),
            _ => (id, None),
        };
        let owner_peer = self.peers.get_mut(&owner).ok_or(NetError::PeerClosed)?;
        let Socket::Udp(socket) = &owner_peer.socket else {
            return Err(NetError::PeerClosed);
        };
        if !owner_peer.datagrams.is_empty() {
            owner_peer.datagrams.push_back((target, datagram));
            return Ok(());
        }
        let sent = match target {
            Some(remote) => socket.send_to(&datagram, remote),
            None => socket.send(&datagram),
        };
        match sent {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                owner_peer.datagrams.push_back((target, datagram));
                Ok(())
            }
            Err(e) => {
                self.metrics.io_error();
                Err(e.into())
            }
        }
    }

    fn flush_datagrams(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let Socket::Udp(socket) = &peer.socket else {
            return;
        };
        while let Some((target, datagram)) = peer.datagrams.front() {
            let sent = match target {
                Some(remote) => socket.send_to(datagram, *remote),
                None => socket.send(datagram),
            };
            match sent {
                Ok(_) => {
                    peer.datagrams.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    trace!(peer = %id, error = %e, "Dropping queued datagram");
                    self.metrics.io_error();
                    peer.datagrams.pop_front();
                }
            }
        }
    }

    fn check(&self, id: PeerId, op: Op) -> Result<()> {
        self.peers
            .get(&id)
            .ok_or(NetError::PeerClosed)?
            .state
            .check(op)
    }

    pub fn status(&self, id: PeerId) -> Result<PeerStatus> {
        Ok(self.peers.get(&id).ok_or(NetError::PeerClosed)?.state.status)
    }

    pub fn protocol_version(&self, id: PeerId) -> Result<Option<u8>> {
        Ok(self
            .peers
            .get(&id)
            .ok_or(NetError::PeerClosed)?
            .protocol_version)
    }

    pub fn send(&mut self, id: PeerId, bytes: Bytes) -> Result<()> {
        self.check(id, Op::Send)?;
        self.send_frame(id, Frame::Data(bytes))
    }

    pub fn ping(&mut self, id: PeerId, timestamp: u64) -> Result<()> {
        self.check(id, Op::Ping)?;
        self.send_frame(id, Frame::Ping(timestamp))
    }

    pub fn pong(&mut self, id: PeerId, timestamp: u64) -> Result<()> {
        self.check(id, Op::Pong)?;
        self.send_frame(id, Frame::Pong(timestamp))
    }

    pub fn auth(&mut self, id: PeerId, credential: &str) -> Result<()> {
        self.check(id, Op::Auth)?;
        self.send_frame(id, Frame::Auth(credential.to_owned()))?;
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.state.auth_sent = true;
        }
        Ok(())
    }

    pub fn accept(&mut self, id: PeerId, welcome: &str) -> Result<()> {
        self.check(id, Op::Accept)?;
        self.send_frame(id, Frame::Accepted(welcome.to_owned()))?;
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.state.handshake = Some(Handshake::Accepted);
        }
        self.metrics.handshake_success();
        debug!(peer = %id, "Handshake accepted");
        Ok(())
    }

    pub fn reject(&mut self, id: PeerId, reason: &str) -> Result<()> {
        self.check(id, Op::Reject)?;
        self.send_frame(id, Frame::Rejected(reason.to_owned()))?;
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.state.handshake = Some(Handshake::Rejected);
        }
        self.metrics.handshake_failed();
        debug!(peer = %id, %reason, "Handshake rejected");
        self.close(id);
        Ok(())
    }

    pub fn addr(&self, id: PeerId, kind: AddrKind) -> Result<Address> {
        let peer = self.peers.get(&id).ok_or(NetError::PeerClosed)?;
        let unavailable = NetError::InvalidState {
            op: "addr",
            status: peer.state.status,
        };
        match kind {
            AddrKind::Local => peer.local_addr.map(Address::Socket).ok_or(unavailable),
            AddrKind::Remote if peer.state.role == Role::Listener => Err(unavailable),
            AddrKind::Remote => peer.remote_addr.map(Address::Socket).ok_or(unavailable),
            AddrKind::HwAddr => transport::hardware_address().map(Address::Hardware),
        }
    }

    /// Begin a graceful close. Idempotent.
    ///
    /// Only connected TCP streams linger in `Closing` to flush their output;
    /// everything else is removed immediately.
    pub fn close(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        match (&peer.socket, peer.state.status) {
            (_, PeerStatus::Closing) => {}
            (Socket::TcpStream(_), PeerStatus::Connected) => {
                peer.state.status = PeerStatus::Closing;
                peer.auth_deadline = None;
                peer.close_deadline = Some(Instant::now() + self.conn_timeout);
                debug!(peer = %id, pending = peer.outbound.len(), "Closing");
                self.flush_stream(id);
            }
            _ => self.remove_peer(id),
        }
    }

    /// Force-close the peer behind a wrapper the host has dropped
    pub fn finalize(&mut self, handle: Handle) {
        if let Some(id) = self.registry.get(handle) {
            debug!(peer = %id, "Session dropped, closing peer");
            self.remove_peer(id);
        }
    }

    fn check_timers(&mut self, now: Instant) {
        let mut expired: Vec<(PeerId, Timer)> = self
            .peers
            .iter()
            .filter_map(|(id, peer)| {
                let due = |deadline: Option<Instant>| deadline.is_some_and(|d| now >= d);
                if due(peer.connect_deadline) {
                    Some((*id, Timer::Connect))
                } else if due(peer.auth_deadline) {
                    Some((*id, Timer::Auth))
                } else if due(peer.close_deadline) {
                    Some((*id, Timer::Close))
                } else {
                    None
                }
            })
            .collect();
        expired.sort_by_key(|(id, _)| *id);

        for (id, timer) in expired {
            if !self.peers.contains_key(&id) {
                continue;
            }
            let notice = match timer {
                Timer::Connect => {
                    debug!(peer = %id, "Connect timed out");
                    self.metrics.timeout();
                    Some(Event::ConnectTimeout)
                }
                Timer::Auth => {
                    debug!(peer = %id, "No credentials before auth timeout");
                    self.metrics.timeout();
                    self.metrics.handshake_failed();
                    Some(Event::Unauthorized)
                }
                Timer::Close => {
                    debug!(peer = %id, "Graceful close timed out");
                    self.metrics.timeout();
                    None
                }
            };
            match notice {
                Some(event) => {
                    self.emit(id, event);
                    self.remove_with_notice(id);
                }
                None => self.remove_peer(id),
            }
        }
    }

    /// Remove a peer whose last queued event announces its removal.
    ///
    /// A peer the host has not observed yet keeps its queued events on a
    /// detached wrapper, so the notice is still delivered.
    fn remove_with_notice(&mut self, id: PeerId) {
        let unobserved = self
            .peers
            .get(&id)
            .filter(|peer| peer.session.is_none())
            .map(|peer| peer.state.mode);
        if let Some(mode) = unobserved {
            if self.parent_observable(id) {
                let session = Session::detached(mode);
                self.retired.insert(id, Retired::Unobserved(session));
            }
        }
        self.remove_peer(id);
    }

    /// Tear a peer down immediately and detach its wrapper
    fn remove_peer(&mut self, id: PeerId) {
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        if let Err(e) = peer.socket.deregister(self.poll.registry()) {
            trace!(peer = %id, error = %e, "Deregister failed");
        }

        if let Some(parent) = peer.parent.and_then(|parent| self.peers.get_mut(&parent)) {
            parent.children.remove(&id);
            if let Some(remote) = peer.remote_addr {
                if parent.associations.get(&remote) == Some(&id) {
                    parent.associations.remove(&remote);
                }
            }
        }
        for child in std::mem::take(&mut peer.children) {
            self.remove_peer(child);
        }

        if let Some(weak) = peer.session.take() {
            if let Some(inner) = weak.upgrade() {
                inner.detach();
            }
            if self.queue.pending_for(id) > 0 {
                self.retired.insert(id, Retired::Observed(weak));
            }
        }
        if let Some(handle) = peer.handle.take() {
            self.registry.release(handle);
        }

        peer.state.status = PeerStatus::Closed;
        self.metrics.peer_closed();
        debug!(peer = %id, role = ?peer.state.role, "Peer closed");
    }

    /// Whether the listener an accepted peer came from is still held by the host
    fn parent_observable(&self, id: PeerId) -> bool {
        let Some(peer) = self.peers.get(&id) else {
            return false;
        };
        match peer.parent {
            None => true,
            Some(parent) => self
                .peers
                .get(&parent)
                .and_then(|listener| listener.session.as_ref())
                .is_some_and(|weak| weak.strong_count() > 0),
        }
    }

    /// Pop the next deliverable event
    pub fn receive(&mut self, engine: &Weak<Shared>) -> Option<(Session, Event)> {
        if self.destroyed {
            return None;
        }
        loop {
            let (id, event) = self.queue.pop()?;

            if self.peers.contains_key(&id) {
                let session = if self.parent_observable(id) {
                    self.attach(id, engine)
                } else {
                    None
                };
                match session {
                    Some(session) => return Some((session, event)),
                    None => {
                        let cmd = event.command();
                        debug!(peer = %id, cmd, "Peer no longer observable, closing");
                        self.metrics.events_dropped(1);
                        self.remove_peer(id);
                        continue;
                    }
                }
            }

            let session = match self.retired.get(&id) {
                Some(Retired::Observed(weak)) => weak.upgrade().map(Session::from_inner),
                Some(Retired::Unobserved(session)) => Some(session.clone()),
                None => None,
            };
            if self.queue.pending_for(id) == 0 {
                self.retired.remove(&id);
            }
            match session {
                Some(session) => return Some((session, event)),
                None => {
                    trace!(peer = %id, cmd = event.command(), "Dropping event for removed peer");
                    self.metrics.events_dropped(1);
                }
            }
        }
    }

    /// Close every peer and discard every queued event. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort();
        for id in ids {
            self.remove_peer(id);
        }
        let dropped = self.queue.clear();
        self.metrics.events_dropped(dropped);
        self.retired.clear();
        self.registry.clear();
        self.destroyed = true;

        self.metrics.log_metrics();
        info!(dropped_events = dropped, "Engine destroyed");
    }
}
