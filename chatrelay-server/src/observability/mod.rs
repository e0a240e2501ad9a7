//! Observability subsystem for chatrelay
//!
//! Provides relay counters; structured logging lives in `chatrelay-utils`.

pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
