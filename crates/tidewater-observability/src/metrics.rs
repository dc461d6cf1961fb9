use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Query Metrics
    // ============================================================================

    /// Records read by a continuous query, whatever their outcome
    pub static ref QUERY_MESSAGES_PROCESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidewater_query_messages_processed_total", "Total records processed by a query"),
        &["query"]
    ).expect("metric can be created");

    /// Records appended to the target stream
    pub static ref QUERY_MESSAGES_EMITTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidewater_query_messages_emitted_total", "Total records emitted by a query"),
        &["query"]
    ).expect("metric can be created");

    /// Records rejected by the query filter
    pub static ref QUERY_MESSAGES_FILTERED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidewater_query_messages_filtered_total", "Total records filtered out by a query"),
        &["query"]
    ).expect("metric can be created");

    /// Records dropped because of an error
    pub static ref QUERY_MESSAGES_FAILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidewater_query_messages_failed_total", "Total records a query failed to process"),
        &["query", "reason"] // malformed, schema_mismatch, evaluation, timestamp, log
    ).expect("metric can be created");

    /// Time spent on one record, decode to append
    pub static ref QUERY_PROCESSING_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("tidewater_query_processing_seconds", "Per-record processing time in seconds")
            .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        &["query"]
    ).expect("metric can be created");

    /// Queries currently submitted and not stopped
    pub static ref ACTIVE_QUERIES: IntGauge = IntGauge::new(
        "tidewater_active_queries",
        "Number of running or paused continuous queries"
    ).expect("metric can be created");

    // ============================================================================
    // Stream Metrics
    // ============================================================================

    /// Appends to a stream, from producers and queries alike
    pub static ref STREAM_APPENDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidewater_stream_appends_total", "Total records appended to a stream"),
        &["stream"]
    ).expect("metric can be created");
}

/// Register every metric with [`REGISTRY`]; safe to call more than once
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(QUERY_MESSAGES_PROCESSED_TOTAL.clone()))
            .expect("query_messages_processed_total can be registered");
        REGISTRY
            .register(Box::new(QUERY_MESSAGES_EMITTED_TOTAL.clone()))
            .expect("query_messages_emitted_total can be registered");
        REGISTRY
            .register(Box::new(QUERY_MESSAGES_FILTERED_TOTAL.clone()))
            .expect("query_messages_filtered_total can be registered");
        REGISTRY
            .register(Box::new(QUERY_MESSAGES_FAILED_TOTAL.clone()))
            .expect("query_messages_failed_total can be registered");
        REGISTRY
            .register(Box::new(QUERY_PROCESSING_SECONDS.clone()))
            .expect("query_processing_seconds can be registered");
        REGISTRY
            .register(Box::new(ACTIVE_QUERIES.clone()))
            .expect("active_queries can be registered");
        REGISTRY
            .register(Box::new(STREAM_APPENDS_TOTAL.clone()))
            .expect("stream_appends_total can be registered");
    });
}
