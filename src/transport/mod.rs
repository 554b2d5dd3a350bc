//! # Transport Layer
//!
//! Non-blocking TCP and UDP sockets for the reactor.
//!
//! ## Components
//! - **Socket**: the `mio` source a peer owns, registered under its token
//! - **Listeners**: TCP listeners built through `socket2` so the backlog and
//!   address reuse can be set before `listen()`
//! - **Connect**: non-blocking connect with synchronous failure reporting
//! - **Hardware address**: MAC lookup for `addr(HwAddr)`

pub mod socket;

pub use socket::{
    bind_udp, connect_progress, connect_tcp, connect_udp, format_mac, hardware_address,
    listen_tcp, parse_mac, resolve, ConnectProgress, Socket,
};
