//! Non-blocking sockets owned by engine peers.
//!
//! Every socket is a `mio` source registered with the engine's poll under the
//! owning peer's token. UDP associations accepted by a listener own no socket
//! of their own; they send and receive through the listener's.

use crate::error::{constants, NetError, Result};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// Socket held by a peer
#[derive(Debug)]
pub enum Socket {
    TcpListener(TcpListener),
    TcpStream(TcpStream),
    /// Bound listener or connected outbound UDP socket
    Udp(UdpSocket),
    /// Association sharing its parent listener's socket
    UdpAssociation,
}

impl Socket {
    /// Register with the poll under `token`
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = Interest::READABLE | Interest::WRITABLE;
        match self {
            Socket::TcpListener(l) => registry.register(l, token, Interest::READABLE),
            Socket::TcpStream(s) => registry.register(s, token, interest),
            Socket::Udp(u) => registry.register(u, token, interest),
            Socket::UdpAssociation => Ok(()),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Socket::TcpListener(l) => registry.deregister(l),
            Socket::TcpStream(s) => registry.deregister(s),
            Socket::Udp(u) => registry.deregister(u),
            Socket::UdpAssociation => Ok(()),
        }
    }

    /// Locally bound address, when the peer owns a socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Socket::TcpListener(l) => l.local_addr().ok(),
            Socket::TcpStream(s) => s.local_addr().ok(),
            Socket::Udp(u) => u.local_addr().ok(),
            Socket::UdpAssociation => None,
        }
    }
}

/// Resolve `host:port` to the first usable address
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| NetError::InvalidAddress(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| {
            NetError::InvalidAddress(format!("{host}:{port}: {}", constants::ERR_NO_ADDRESS))
        })
}

/// Bind and listen with an explicit backlog
pub fn listen_tcp(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Start a non-blocking connect.
///
/// Errors the OS reports synchronously (a refused loopback connect, for
/// instance) are returned here rather than surfacing on a later tick.
pub fn connect_tcp(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Outcome of checking a pending connect
pub enum ConnectProgress {
    Pending,
    Established,
    Failed(io::Error),
}

/// Check a pending connect after the stream reported readiness
pub fn connect_progress(stream: &TcpStream) -> ConnectProgress {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => return ConnectProgress::Failed(e),
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(_) => ConnectProgress::Established,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectProgress::Pending,
        Err(e) => ConnectProgress::Failed(e),
    }
}

pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    UdpSocket::bind(addr)
}

/// Bind an ephemeral local port of the right family and fix the remote end
pub fn connect_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let local = match addr.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = UdpSocket::bind(local)?;
    socket.connect(addr)?;
    Ok(socket)
}

/// MAC address of the first non-loopback interface
#[cfg(target_os = "linux")]
pub fn hardware_address() -> Result<[u8; 6]> {
    let mut names: Vec<_> = std::fs::read_dir("/sys/class/net")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    for name in names {
        let path = std::path::Path::new("/sys/class/net")
            .join(&name)
            .join("address");
        let Ok(text) = std::fs::read_to_string(path) else {
            continue;
        };
        if let Some(mac) = parse_mac(text.trim()) {
            if mac != [0; 6] {
                return Ok(mac);
            }
        }
    }
    Err(NetError::NotSupported(constants::ERR_NO_HWADDR))
}

#[cfg(not(target_os = "linux"))]
pub fn hardware_address() -> Result<[u8; 6]> {
    Err(NetError::NotSupported(constants::ERR_HWADDR_UNSUPPORTED))
}

/// Parse `aa:bb:cc:dd:ee:ff`
pub fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Format as lowercase `aa:bb:cc:dd:ee:ff`
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
