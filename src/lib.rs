//! # reactor-net
//!
//! Single-threaded TCP/UDP reactor with a connection handshake state machine
//! and handle-safe peer sessions.
//!
//! ## Layout
//! - [`core`]: handle registry and control frame codec
//! - [`protocol`]: peer states, operation rules and events
//! - [`transport`]: non-blocking `mio` sockets
//! - [`engine`]: the reactor and the host-facing [`Session`] wrapper
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Handshake
//! ```text
//! outbound                         accepted
//!    │ ── halo(version) ─────────────> │  Halo event
//!    │ ── auth(credential) ──────────> │  Auth event
//!    │ <───── accepted(welcome) ────── │  host calls accept()
//!    │ <───── rejected(reason) ─────── │  or reject(), then close
//! ```
//!
//! ## Threading
//! An [`Engine`], its [`Session`]s and their [`Handle`]s are bound to the
//! thread that created them. Run one engine per thread.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::EngineConfig;
pub use crate::core::handle::Handle;
pub use engine::{AddrKind, Address, Engine, NetEvent, Session, TimeoutKind};
pub use error::{NetError, Result};
pub use protocol::event::Event;
pub use protocol::state::{Mode, PeerStatus};
pub use utils::metrics::MetricsSnapshot;
