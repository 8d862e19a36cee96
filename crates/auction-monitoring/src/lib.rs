//! Monitoring and observability for the sealed-intent auction.
//!
//! # Components
//!
//! - `metrics`: counters and gauges fed from the event bus, rendered in the
//!   Prometheus text format
//! - `tracing`: subscriber setup for structured logs
//!
//! Nothing in this crate feeds back into the pipeline.

pub mod metrics;
pub mod tracing;

pub use metrics::{spawn_event_sink, AuctionMetrics, MetricsSnapshot};
pub use self::tracing::{init_tracing, TracingConfig};
