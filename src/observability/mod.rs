//! # Observability
//!
//! Observability modules for metrics and logging.
//!
//! - `metrics`: Prometheus metrics collection
//! - `logging`: tracing subscriber initialisation

pub mod logging;
pub mod metrics;

pub use logging::{init_tracing, LogFormat};
