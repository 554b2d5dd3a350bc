//! # Core Components
//!
//! Building blocks the engine is assembled from.
//!
//! ## Components
//! - **Handle**: generation-checked slot table brokering safe lookup of engine resources
//! - **Frame**: fixed control commands and their length-prefixed wire codec
//!
//! ## Wire Format
//! ```text
//! [Command(1)] [Length(4)] [Payload(N)]
//! ```
//!
//! ## Safety
//! - Stale handles fail lookup instead of resolving to a reused slot
//! - Frame lengths are validated before allocation

pub mod frame;
pub mod handle;
