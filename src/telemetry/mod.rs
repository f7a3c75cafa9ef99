//! Telemetry and logging infrastructure
//!
//! Provides structured logging with tracing and per-pipeline counters.

pub mod logging;
pub mod metrics;

pub use logging::{
    init_logging, init_logging_default, subscriber, LogConfig, LogGuard, LogOutput, LoggingError,
};
pub use metrics::{PipelineStats, PipelineStatsSnapshot};
