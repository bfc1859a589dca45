//! Prometheus-based underlay metrics
//!
//! Process-wide counters for carrier lifecycle. All metrics are
//! registered into the crate registry for export by the embedding
//! application.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Underlays opened by this endpoint (client dials)
    pub static ref UNDERLAY_ACTIVE_OPENS: IntCounter = IntCounter::new(
        "velum_underlay_active_opens_total",
        "Total number of underlays opened actively (client side)"
    ).unwrap();

    /// Underlays opened by a peer (server accepts)
    pub static ref UNDERLAY_PASSIVE_OPENS: IntCounter = IntCounter::new(
        "velum_underlay_passive_opens_total",
        "Total number of underlays opened passively (server side)"
    ).unwrap();

    /// Currently established underlays
    pub static ref UNDERLAY_CURR_ESTABLISHED: IntGauge = IntGauge::new(
        "velum_underlay_curr_established",
        "Number of currently established underlays"
    ).unwrap();

    /// Peak number of concurrently established underlays
    pub static ref UNDERLAY_MAX_CONN: IntGauge = IntGauge::new(
        "velum_underlay_max_conn",
        "Maximum number of concurrently established underlays observed"
    ).unwrap();
}

/// Register all underlay metrics with the crate registry
pub fn register_metrics() {
    REGISTRY.register(Box::new(UNDERLAY_ACTIVE_OPENS.clone())).ok();
    REGISTRY.register(Box::new(UNDERLAY_PASSIVE_OPENS.clone())).ok();
    REGISTRY.register(Box::new(UNDERLAY_CURR_ESTABLISHED.clone())).ok();
    REGISTRY.register(Box::new(UNDERLAY_MAX_CONN.clone())).ok();
}

/// Record a client-initiated underlay open.
pub(crate) fn record_active_open() {
    UNDERLAY_ACTIVE_OPENS.inc();
    record_established();
}

/// Record a server-accepted underlay open.
pub(crate) fn record_passive_open() {
    UNDERLAY_PASSIVE_OPENS.inc();
    record_established();
}

/// Record an underlay teardown.
pub(crate) fn record_closed() {
    UNDERLAY_CURR_ESTABLISHED.dec();
}

fn record_established() {
    UNDERLAY_CURR_ESTABLISHED.inc();
    let curr = UNDERLAY_CURR_ESTABLISHED.get();
    // Latch the peak. Load-then-store; an interleaved update can only
    // make the stored peak stale by one observation.
    if curr > UNDERLAY_MAX_CONN.get() {
        UNDERLAY_MAX_CONN.set(curr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are process-wide; other tests may bump them
    // concurrently, so assertions are monotone.
    #[test]
    fn test_open_close_balance() {
        register_metrics();
        let active_before = UNDERLAY_ACTIVE_OPENS.get();
        let passive_before = UNDERLAY_PASSIVE_OPENS.get();

        record_active_open();
        record_passive_open();
        assert!(UNDERLAY_ACTIVE_OPENS.get() >= active_before + 1);
        assert!(UNDERLAY_PASSIVE_OPENS.get() >= passive_before + 1);
        assert!(UNDERLAY_MAX_CONN.get() >= 1);

        record_closed();
        record_closed();
    }
}
