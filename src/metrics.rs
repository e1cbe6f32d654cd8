//! Prometheus metrics for the crawler.
//!
//! Metrics live in an explicit [`REGISTRY`] rather than the process-global
//! default so embedding applications control exposition.
//! [`register_metrics`] is idempotent; calling it from several
//! constructors is harmless.

use lazy_static::lazy_static;
use prometheus::{
    linear_buckets, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Duration of dial attempts, successful or not.
    pub static ref CONNECT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "crawler_worker_connect_duration_seconds",
            "Histogram for the duration of connection establishment."
        )
        .buckets(linear_buckets(0.0, 1.0, 45).expect("bucket layout"))
    )
    .expect("metric creation failed");

    /// Raw number of IDs obtained per crawled peer, before global dedup.
    pub static ref RAW_OBTAINED_IDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "crawler_worker_raw_obtained_IDs_per_peer",
            "Raw number of obtained IDs per crawled peer. Does not exclude previously seen IDs."
        )
        .buckets(linear_buckets(0.0, 300.0, 10).expect("bucket layout"))
    )
    .expect("metric creation failed");

    /// Requests currently awaiting responses.
    pub static ref WAITING_FOR_REQUESTS: Gauge = Gauge::new(
        "crawler_cmanager_waiting_for_request_queue_length",
        "Current number of requests that are awaiting responses."
    )
    .expect("metric creation failed");

    /// Newly learned node IDs, labelled by reachability.
    pub static ref NUMBER_OF_NEW_IDS: CounterVec = CounterVec::new(
        Opts::new(
            "crawler_cmanager_number_new_IDs",
            "Number of newly learned node IDs."
        ),
        &["reachable"]
    )
    .expect("metric creation failed");

    /// Free capacity of the token bucket rate limiting the crawl.
    pub static ref TOKEN_BUCKET_FREE: Gauge = Gauge::new(
        "crawler_cmanager_token_bucket_free_capacity",
        "Free capacity of the token bucket used to rate limit the crawl."
    )
    .expect("metric creation failed");
}

/// Register all crawler metrics with [`REGISTRY`]. Duplicate registration
/// is tolerated so multiple managers in one process do not trip over each
/// other.
pub fn register_metrics() {
    let collectors: [Box<dyn prometheus::core::Collector>; 5] = [
        Box::new(CONNECT_DURATION.clone()),
        Box::new(RAW_OBTAINED_IDS.clone()),
        Box::new(WAITING_FOR_REQUESTS.clone()),
        Box::new(NUMBER_OF_NEW_IDS.clone()),
        Box::new(TOKEN_BUCKET_FREE.clone()),
    ];
    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) => {}
            Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => warn!(error = %e, "metric registration failed"),
        }
    }
}

/// Encode the current metric values in the Prometheus text format.
pub fn gather() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buf) {
        warn!(error = %e, "metrics encoding failed");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
