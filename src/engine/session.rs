//! # Lifecycle Bridge
//!
//! [`Session`] is the host's view of one peer. It never owns the peer: it
//! holds the peer's registry [`Handle`] and a weak reference to the engine,
//! and every call resolves both before touching engine state.
//!
//! Deletion runs in both directions:
//! - **Engine side**: when a peer reaches `Closed`, the engine clears the
//!   session's handle, releases the handle and drops the peer in one step.
//!   Later calls fail with [`NetError::PeerClosed`].
//! - **Host side**: when the last clone of a session is dropped while its
//!   peer is still alive, the peer is force-closed without a graceful flush.
//!   If the engine is in the middle of an operation at that moment, the close
//!   is queued and applied at the start of the next `update()` or `receive()`.
//!
//! After either path neither side can reach the other.

use crate::core::handle::Handle;
use crate::engine::reactor::EngineCore;
use crate::engine::peer::PeerId;
use crate::engine::{AddrKind, Address, Shared};
use crate::error::{NetError, Result};
use crate::protocol::state::{Mode, PeerStatus};
use bytes::Bytes;
use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Host-side wrapper of one peer.
///
/// Cheap to clone; clones refer to the same peer. Not `Send`.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Rc<SessionInner>,
}

pub(crate) struct SessionInner {
    /// Back-pointer into the engine, `None` once the peer is gone
    peer: Cell<Option<Handle>>,
    engine: Weak<Shared>,
    mode: Mode,
}

impl SessionInner {
    /// Sever the link to the peer. Called by the engine on removal.
    pub(crate) fn detach(&self) {
        self.peer.set(None);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let Some(handle) = self.peer.take() else {
            return;
        };
        if let Some(shared) = self.engine.upgrade() {
            shared.finalize(handle);
        }
    }
}

impl Session {
    pub(crate) fn new(handle: Handle, mode: Mode, engine: Weak<Shared>) -> Self {
        Self {
            inner: Rc::new(SessionInner {
                peer: Cell::new(Some(handle)),
                engine,
                mode,
            }),
        }
    }

    /// Wrapper for a peer the engine removed before the host ever saw it.
    /// Exists only to carry the peer's last events.
    pub(crate) fn detached(mode: Mode) -> Self {
        Self {
            inner: Rc::new(SessionInner {
                peer: Cell::new(None),
                engine: Weak::new(),
                mode,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Registry handle of the peer, or `None` once it has been removed
    pub fn handle(&self) -> Option<Handle> {
        self.inner.peer.get()
    }

    /// Transport of the peer. Still answers after the peer is gone.
    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// Whether the engine has removed the peer
    pub fn is_closed(&self) -> bool {
        self.inner.peer.get().is_none()
    }

    /// Current lifecycle state; `Closed` once the peer has been removed
    pub fn status(&self) -> PeerStatus {
        self.with_core(|core, id| core.status(id))
            .unwrap_or(PeerStatus::Closed)
    }

    /// Send application data
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.with_core(|core, id| core.send(id, data))
    }

    /// Close gracefully. A no-op on a peer that is already closing or gone.
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.with_core(|core, id| {
            core.close(id);
            Ok(())
        }) {
            Err(e) if e.is_closed() => Ok(()),
            other => other,
        }
    }

    pub fn ping(&self, timestamp: u64) -> Result<()> {
        self.with_core(|core, id| core.ping(id, timestamp))
    }

    pub fn pong(&self, timestamp: u64) -> Result<()> {
        self.with_core(|core, id| core.pong(id, timestamp))
    }

    /// Present credentials to the accepting side
    pub fn auth(&self, credential: &str) -> Result<()> {
        self.with_core(|core, id| core.auth(id, credential))
    }

    /// Complete the handshake of an accepted peer
    pub fn accept(&self, welcome: &str) -> Result<()> {
        self.with_core(|core, id| core.accept(id, welcome))
    }

    /// Refuse an accepted peer's credentials and close it
    pub fn reject(&self, reason: &str) -> Result<()> {
        self.with_core(|core, id| core.reject(id, reason))
    }

    pub fn addr(&self, kind: AddrKind) -> Result<Address> {
        self.with_core(|core, id| core.addr(id, kind))
    }

    /// Version the remote announced in its halo, if any
    pub fn protocol_version(&self) -> Result<Option<u8>> {
        self.with_core(|core, id| core.protocol_version(id))
    }

    /// Resolve the back-pointer and run `op` against the live peer.
    ///
    /// The handle stays referenced for the duration of `op`.
    fn with_core<R>(&self, op: impl FnOnce(&mut EngineCore, PeerId) -> Result<R>) -> Result<R> {
        let handle = self.inner.peer.get().ok_or(NetError::PeerClosed)?;
        let shared = self
            .inner
            .engine
            .upgrade()
            .ok_or(NetError::EngineDestroyed)?;
        let mut core = shared
            .core
            .try_borrow_mut()
            .map_err(|_| NetError::EngineBusy)?;
        let guard = core.registry.acquire(handle).ok_or(NetError::PeerClosed)?;
        let id = *guard;
        let result = op(&mut core, id);
        drop(guard);
        result
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.inner.peer.get())
            .field("mode", &self.inner.mode)
            .finish()
    }
}
