//! Observability: structured logging, Prometheus metrics, health tracking
//! and per-collaborator communication monitors.

pub mod health;
pub mod metrics;
mod tracing;

pub use self::tracing::{init_tracing, TracingConfig};
