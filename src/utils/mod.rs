//! # Utility Modules
//!
//! Supporting utilities shared by the engine.
//!
//! ## Components
//! - **Logging**: structured `tracing` subscriber setup
//! - **Metrics**: per-engine observability counters

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{EngineMetrics, MetricsSnapshot};
