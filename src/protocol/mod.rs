//! # Protocol Layer
//!
//! What peers can be, what they may do, and what the host gets told.
//!
//! ## Components
//! - **State**: lifecycle and handshake states, and the validity check every
//!   per-peer operation goes through
//! - **Event**: the closed set of events the engine produces and the FIFO
//!   they wait in until the host receives them

pub mod event;
pub mod state;
