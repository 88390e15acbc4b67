//! Prometheus metrics, registered once into the default global registry and updated
//! from the event loop. Mirrors the teacher's `Lazy<...>` + `register_*!` pattern, using
//! the `prometheus` crate directly rather than a wrapper.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge};

pub static CONNECTED_ACCEPTORS: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!(
        "walproposer_connected_acceptors",
        "Number of acceptors currently past the handshake"
    )
    .expect("metric can be registered")
});

pub static CURRENT_TERM: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("walproposer_current_term", "This proposer's current term")
        .expect("metric can be registered")
});

pub static QUORUM_COMMIT_LSN: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!(
        "walproposer_quorum_commit_lsn",
        "Highest LSN acknowledged by a quorum of acceptors"
    )
    .expect("metric can be registered")
});

pub static TRUNCATE_LSN: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!(
        "walproposer_truncate_lsn",
        "Lowest LSN still needed by any acceptor"
    )
    .expect("metric can be registered")
});

pub static RECONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "walproposer_reconnects_total",
        "Total acceptor reconnect attempts across all acceptors"
    )
    .expect("metric can be registered")
});

/// Spec §9 open question: acceptors disagreeing on `timeline_start_lsn` is logged and
/// counted, not treated as fatal.
pub static TIMELINE_START_LSN_MISMATCHES: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "walproposer_timeline_start_lsn_mismatches_total",
        "Elections where voting acceptors disagreed on timeline_start_lsn"
    )
    .expect("metric can be registered")
});

/// Bytes `available_lsn` is ahead of the pageserver's last known flush position
/// (spec §3/§5 backpressure counter); the host throttles WAL production on this.
pub static BACKPRESSURE_LAG: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!(
        "walproposer_backpressure_lag_bytes",
        "Bytes of produced WAL the pageserver has not yet flushed"
    )
    .expect("metric can be registered")
});

/// Latest pageserver-reported flush position, merged across acceptors.
pub static DISK_CONSISTENT_LSN: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!(
        "walproposer_disk_consistent_lsn",
        "Latest pageserver disk_consistent_lsn reported by any acceptor"
    )
    .expect("metric can be registered")
});

/// Latest pageserver-reported remote-durable position, merged across acceptors.
pub static REMOTE_CONSISTENT_LSN: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!(
        "walproposer_remote_consistent_lsn",
        "Latest pageserver remote_consistent_lsn reported by any acceptor"
    )
    .expect("metric can be registered")
});

pub fn set_commit_lsn(lsn: walproposer_api::Lsn) {
    QUORUM_COMMIT_LSN.set(u64::from(lsn) as i64);
}

pub fn set_truncate_lsn(lsn: walproposer_api::Lsn) {
    TRUNCATE_LSN.set(u64::from(lsn) as i64);
}

pub fn set_pageserver_feedback(fb: &walproposer_api::PageserverFeedback) {
    if let Some(lsn) = fb.disk_consistent_lsn {
        DISK_CONSISTENT_LSN.set(u64::from(lsn) as i64);
    }
    if let Some(lsn) = fb.remote_consistent_lsn {
        REMOTE_CONSISTENT_LSN.set(u64::from(lsn) as i64);
    }
}
