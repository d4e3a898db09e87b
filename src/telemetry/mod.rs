//! Ambient observability: structured logging init and in-process counters.
//! No collector/exporter wiring lives here — that belongs to the
//! higher layer this crate is embedded in.

pub mod metrics;
pub mod tracing;

pub use metrics::Metrics;
pub use tracing::init_tracing;
