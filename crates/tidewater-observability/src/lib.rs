//! Tidewater Observability
//!
//! Prometheus metrics for streams and continuous queries.
//!
//! # Usage
//!
//! ```no_run
//! use tidewater_observability::{exporter, metrics};
//!
//! metrics::init();
//! metrics::STREAM_APPENDS_TOTAL.with_label_values(&["readings"]).inc();
//!
//! let text = exporter::render().unwrap();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}
