use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

lazy_static::lazy_static! {
    // === Dispatch / runtime ===

    pub static ref EVENTS_DISPATCHED: IntCounterVec =
        IntCounterVec::new(
            Opts::new("events_dispatched_total", "Events routed to a queue")
                .namespace("twincore"),
            &["queue"]
        ).unwrap();

    pub static ref EVENTS_APPLIED: IntCounterVec =
        IntCounterVec::new(
            Opts::new("events_applied_total", "Events applied by a runtime container")
                .namespace("twincore"),
            &["queue", "status"] // status: ok, error, dropped, replayed
        ).unwrap();

    // === API manager ===

    pub static ref API_REQUESTS: IntCounterVec =
        IntCounterVec::new(
            Opts::new("api_requests_total", "API manager calls by identify")
                .namespace("twincore"),
            &["identify"]
        ).unwrap();

    pub static ref HOLDER_WAITERS: IntGauge =
        IntGauge::with_opts(
            Opts::new("holder_waiters", "Requests currently waiting for a reply")
                .namespace("twincore")
        ).unwrap();

    // === Placement ===

    pub static ref RAFT_PROPOSALS: IntCounterVec =
        IntCounterVec::new(
            Opts::new("raft_proposals_total", "Placement commands proposed")
                .namespace("twincore"),
            &["command"]
        ).unwrap();

    pub static ref CALLBACKS_SENT: IntCounter =
        IntCounter::with_opts(
            Opts::new("callbacks_sent_total", "Reply events posted to callback URLs")
                .namespace("twincore")
        ).unwrap();
}

/// Registers every metric on the default registry. Safe to call once at
/// startup; duplicate registration is reported, not fatal.
pub fn register_all() {
    let registry = prometheus::default_registry();
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(EVENTS_DISPATCHED.clone()),
        Box::new(EVENTS_APPLIED.clone()),
        Box::new(API_REQUESTS.clone()),
        Box::new(HOLDER_WAITERS.clone()),
        Box::new(RAFT_PROPOSALS.clone()),
        Box::new(CALLBACKS_SENT.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            tracing::debug!(error = %e, "metric already registered");
        }
    }
}

/// Renders the default registry in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::default_registry().gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
