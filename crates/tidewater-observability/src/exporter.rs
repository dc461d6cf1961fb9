use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

/// Content type of [`render`]'s output
pub fn content_type() -> &'static str {
    "text/plain; version=0.0.4"
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
