//! # Net Engine
//!
//! Single-threaded reactor that multiplexes TCP and UDP peers.
//!
//! The host drives it with two calls: [`Engine::update`] runs one bounded
//! poll cycle and fills the event queue, [`Engine::receive`] drains one
//! event at a time. Peers are reached through [`Session`] wrappers, which
//! fail cleanly with [`NetError::PeerClosed`] once the engine has removed
//! the peer behind them.
//!
//! ## Example
//! ```rust,no_run
//! use reactor_net::{Engine, Event, Mode};
//! use std::time::Duration;
//!
//! # fn main() -> reactor_net::Result<()> {
//! let engine = Engine::new()?;
//! let _listener = engine.server(Mode::Tcp, "127.0.0.1", 7000, None)?;
//! let mut peers = Vec::new();
//!
//! loop {
//!     engine.update(Duration::from_millis(50))?;
//!     while let Some(net_event) = engine.receive() {
//!         match net_event.event {
//!             Event::Incoming => peers.push(net_event.who),
//!             Event::Auth { credential } if credential == "secret" => {
//!                 net_event.who.accept("welcome")?;
//!             }
//!             Event::Auth { .. } => net_event.who.reject("bad credentials")?,
//!             Event::Data { bytes } => net_event.who.send(bytes)?,
//!             _ => {}
//!         }
//!     }
//! }
//! # }
//! ```
//!
//! Every accepted peer must be kept alive by the host: dropping the last
//! [`Session`] of a live peer closes it.

pub(crate) mod peer;
pub(crate) mod reactor;
pub mod session;

pub use session::Session;

use crate::config::EngineConfig;
use crate::core::handle::Handle;
use crate::error::{constants, NetError, Result};
use crate::protocol::event::Event;
use crate::protocol::state::Mode;
use crate::transport;
use crate::utils::metrics::MetricsSnapshot;
use self::reactor::EngineCore;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// State shared between the engine and the weak references its sessions hold
pub(crate) struct Shared {
    pub(crate) core: RefCell<EngineCore>,
    /// Handles of dropped sessions whose peers could not be closed right away
    deferred: RefCell<Vec<Handle>>,
}

impl Shared {
    /// Close the peer behind a session the host has dropped
    pub(crate) fn finalize(&self, handle: Handle) {
        match self.core.try_borrow_mut() {
            Ok(mut core) => core.finalize(handle),
            Err(_) => {
                debug!(%handle, "Engine busy, deferring close of dropped session");
                self.deferred.borrow_mut().push(handle);
            }
        }
    }
}

/// One event together with the peer it concerns
#[derive(Debug, Clone)]
pub struct NetEvent {
    pub who: Session,
    pub event: Event,
}

/// Which address [`Session::addr`] reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    /// Locally bound socket address
    Local,
    /// Address of the remote end
    Remote,
    /// MAC address of the local network interface
    HwAddr,
}

impl FromStr for AddrKind {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(AddrKind::Local),
            "remote" => Ok(AddrKind::Remote),
            "hwaddr" | "macaddr" => Ok(AddrKind::HwAddr),
            _ => Err(NetError::InvalidAddress(format!(
                "{}: '{s}'",
                constants::ERR_INVALID_ADDR_KIND
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Socket(SocketAddr),
    Hardware([u8; 6]),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{addr}"),
            Address::Hardware(mac) => f.write_str(&transport::format_mac(mac)),
        }
    }
}

/// Timer adjusted by [`Engine::set_timeout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    Auth,
}

impl FromStr for TimeoutKind {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "conn" | "connect" => Ok(TimeoutKind::Connect),
            "auth" | "authenticate" => Ok(TimeoutKind::Auth),
            _ => Err(NetError::ConfigError(format!(
                "{}: '{s}'",
                constants::ERR_INVALID_TIMEOUT_KIND
            ))),
        }
    }
}

/// Handle-safe network reactor.
///
/// Not `Send`: an engine and its sessions live on one thread. Dropping the
/// engine destroys it.
pub struct Engine {
    shared: Rc<Shared>,
}

impl Engine {
    /// Create an engine with default settings
    pub fn new() -> Result<Self> {
        Self::with_config(&EngineConfig::default())
    }

    /// Create an engine from a validated configuration
    pub fn with_config(config: &EngineConfig) -> Result<Self> {
        config.validate_strict()?;
        let core = EngineCore::new(&config.engine)?;
        debug!(
            connect_timeout_ms = config.engine.connect_timeout.as_millis() as u64,
            auth_timeout_ms = config.engine.auth_timeout.as_millis() as u64,
            "Engine created"
        );
        Ok(Self {
            shared: Rc::new(Shared {
                core: RefCell::new(core),
                deferred: RefCell::new(Vec::new()),
            }),
        })
    }

    /// Bind a listener on `host:port`.
    ///
    /// For TCP, `backlog` is passed to `listen()`; `None` uses the configured
    /// default. Failure leaves no peer behind.
    pub fn server(
        &self,
        mode: Mode,
        host: &str,
        port: u16,
        backlog: Option<i32>,
    ) -> Result<Session> {
        let addr = transport::resolve(host, port)?;
        let mut core = self.core()?;
        let id = core.listen(mode, addr, backlog)?;
        core.attach(id, &Rc::downgrade(&self.shared))
            .ok_or(NetError::PeerClosed)
    }

    /// Start connecting to `host:port`.
    ///
    /// The returned session is `Connecting`; completion is reported by an
    /// `Outgoing` event, expiry by `ConnectTimeout`. Failures the OS reports
    /// immediately are returned here and leave no peer behind.
    pub fn connect(&self, mode: Mode, host: &str, port: u16) -> Result<Session> {
        let addr = transport::resolve(host, port)?;
        let mut core = self.core()?;
        let id = core.connect(mode, addr)?;
        core.attach(id, &Rc::downgrade(&self.shared))
            .ok_or(NetError::PeerClosed)
    }

    /// Set the connect timeout for peers created from now on; returns the old value
    pub fn set_conn_timeout(&self, timeout: Duration) -> Result<Duration> {
        Ok(self.core()?.set_conn_timeout(timeout))
    }

    /// Set the auth timeout for peers accepted from now on; returns the old value
    pub fn set_auth_timeout(&self, timeout: Duration) -> Result<Duration> {
        Ok(self.core()?.set_auth_timeout(timeout))
    }

    pub fn set_timeout(&self, kind: TimeoutKind, timeout: Duration) -> Result<Duration> {
        match kind {
            TimeoutKind::Connect => self.set_conn_timeout(timeout),
            TimeoutKind::Auth => self.set_auth_timeout(timeout),
        }
    }

    /// Run one poll cycle, blocking at most `timeout`.
    ///
    /// Returns the number of readiness notifications handled.
    pub fn update(&self, timeout: Duration) -> Result<usize> {
        self.run_deferred();
        self.core()?.update(timeout)
    }

    /// Take the next event, or `None` when the queue is empty
    pub fn receive(&self) -> Option<NetEvent> {
        self.run_deferred();
        let engine = Rc::downgrade(&self.shared);
        let (who, event) = self.shared.core.try_borrow_mut().ok()?.receive(&engine)?;
        Some(NetEvent { who, event })
    }

    /// Recover the session of a live peer from its handle
    pub fn lookup(&self, handle: Handle) -> Result<Session> {
        self.core()?.lookup(handle)
    }

    /// Peers currently owned by the engine, listeners included
    pub fn peer_count(&self) -> Result<usize> {
        Ok(self.core_ref()?.peer_count())
    }

    /// Events waiting to be received
    pub fn pending_events(&self) -> Result<usize> {
        Ok(self.core_ref()?.pending_events())
    }

    pub fn metrics(&self) -> Result<MetricsSnapshot> {
        Ok(self.core_ref()?.metrics().snapshot())
    }

    pub fn is_destroyed(&self) -> Result<bool> {
        Ok(self.core_ref()?.is_destroyed())
    }

    /// Close every peer and drop every queued event.
    ///
    /// Sessions stay valid as objects but report `Closed`. Idempotent.
    pub fn destroy(&self) {
        self.shared.deferred.borrow_mut().clear();
        if let Ok(mut core) = self.shared.core.try_borrow_mut() {
            core.destroy();
        }
    }

    fn core(&self) -> Result<RefMut<'_, EngineCore>> {
        self.shared
            .core
            .try_borrow_mut()
            .map_err(|_| NetError::EngineBusy)
    }

    fn core_ref(&self) -> Result<Ref<'_, EngineCore>> {
        self.shared
            .core
            .try_borrow()
            .map_err(|_| NetError::EngineBusy)
    }

    /// Apply closes queued by sessions dropped while the engine was busy
    fn run_deferred(&self) {
        let pending: Vec<Handle> = self.shared.deferred.borrow_mut().drain(..).collect();
        if pending.is_empty() {
            return;
        }
        if let Ok(mut core) = self.shared.core.try_borrow_mut() {
            for handle in pending {
                core.finalize(handle);
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Engine");
        match self.core_ref() {
            Ok(core) => debug
                .field("peers", &core.peer_count())
                .field("pending_events", &core.pending_events()),
            Err(_) => debug.field("busy", &true),
        };
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_addr_kind_names() {
        assert_eq!("local".parse::<AddrKind>().unwrap(), AddrKind::Local);
        assert_eq!("Remote".parse::<AddrKind>().unwrap(), AddrKind::Remote);
        assert_eq!("macaddr".parse::<AddrKind>().unwrap(), AddrKind::HwAddr);
        assert!("peer".parse::<AddrKind>().is_err());
    }

    #[test]
    fn test_timeout_kind_names() {
        assert_eq!("conn".parse::<TimeoutKind>().unwrap(), TimeoutKind::Connect);
        assert_eq!(
            "authenticate".parse::<TimeoutKind>().unwrap(),
            TimeoutKind::Auth
        );
        assert!("read".parse::<TimeoutKind>().is_err());
    }

    #[test]
    fn test_timeouts_return_previous_value() {
        let engine = Engine::new().unwrap();
        let first = engine.set_conn_timeout(Duration::from_millis(250)).unwrap();
        assert_eq!(first, crate::config::DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(
            engine
                .set_timeout(TimeoutKind::Connect, Duration::from_secs(1))
                .unwrap(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_busy_engine_reports_busy() {
        let engine = Engine::new().unwrap();
        let held = engine.shared.core.borrow_mut();

        assert!(matches!(engine.peer_count(), Err(NetError::EngineBusy)));
        assert!(matches!(engine.metrics(), Err(NetError::EngineBusy)));
        assert!(matches!(
            engine.set_auth_timeout(Duration::from_secs(1)),
            Err(NetError::EngineBusy)
        ));
        assert!(matches!(
            engine.update(Duration::ZERO),
            Err(NetError::EngineBusy)
        ));
        assert!(format!("{engine:?}").contains("busy"));

        drop(held);
        assert_eq!(engine.peer_count().unwrap(), 0);
    }

    #[test]
    fn test_hardware_address_display() {
        let addr = Address::Hardware([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        assert_eq!(addr.to_string(), "de:ad:be:ef:00:01");
    }

    #[test]
    fn test_destroyed_engine_refuses_work() {
        let engine = Engine::new().unwrap();
        engine.destroy();
        engine.destroy();
        assert!(engine.is_destroyed().unwrap());
        assert!(matches!(
            engine.update(Duration::ZERO),
            Err(NetError::EngineDestroyed)
        ));
        assert!(matches!(
            engine.server(Mode::Tcp, "127.0.0.1", 0, None),
            Err(NetError::EngineDestroyed)
        ));
        assert!(engine.receive().is_none());
    }
}
