//! Prometheus metrics for the engine
//!
//! Counters are updated from the accept and processing threads; pool
//! gauges are refreshed by the processing thread after each busy cycle.

use crate::buffer::{SlabPool, TierKind};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::info;

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // Connection metrics
    pub static ref ACTIVE_CONNECTIONS: IntGauge = IntGauge::new(
        "photonwire_active_connections",
        "Connections registered with the socket processor"
    ).unwrap();

    pub static ref CONNECTIONS_ACCEPTED: IntCounter = IntCounter::new(
        "photonwire_connections_accepted_total",
        "Connections accepted by the listener"
    ).unwrap();

    pub static ref CONNECTIONS_CLOSED: IntCounterVec = IntCounterVec::new(
        Opts::new("photonwire_connections_closed_total", "Connections closed"),
        &["reason"]
    ).unwrap();

    // Traffic metrics
    pub static ref BYTES_READ: IntCounter = IntCounter::new(
        "photonwire_bytes_read_total",
        "Bytes read from sockets"
    ).unwrap();

    pub static ref BYTES_WRITTEN: IntCounter = IntCounter::new(
        "photonwire_bytes_written_total",
        "Bytes written to sockets"
    ).unwrap();

    pub static ref MESSAGES_DELIVERED: IntCounter = IntCounter::new(
        "photonwire_messages_delivered_total",
        "Complete inbound messages handed to the processor"
    ).unwrap();

    pub static ref MESSAGES_WRITTEN: IntCounter = IntCounter::new(
        "photonwire_messages_written_total",
        "Outbound messages fully written"
    ).unwrap();

    // Pool metrics
    pub static ref BACKPRESSURE_STALLS: IntCounter = IntCounter::new(
        "photonwire_backpressure_stalls_total",
        "Read passes stopped because the read pool had no free slot"
    ).unwrap();

    pub static ref POOL_FREE_SLOTS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("photonwire_pool_free_slots", "Free slots per pool and tier"),
        &["pool", "tier"]
    ).unwrap();

    pub static ref LOOP_RESTARTS: IntCounter = IntCounter::new(
        "photonwire_loop_restarts_total",
        "Selector rebuilds after a failed processing cycle"
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(ACTIVE_CONNECTIONS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(CONNECTIONS_ACCEPTED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(CONNECTIONS_CLOSED.clone())).ok();

    METRICS_REGISTRY.register(Box::new(BYTES_READ.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BYTES_WRITTEN.clone())).ok();
    METRICS_REGISTRY.register(Box::new(MESSAGES_DELIVERED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(MESSAGES_WRITTEN.clone())).ok();

    METRICS_REGISTRY.register(Box::new(BACKPRESSURE_STALLS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(POOL_FREE_SLOTS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(LOOP_RESTARTS.clone())).ok();
}

/// Refresh the free-slot gauges of one pool
pub fn record_pool(pool: &SlabPool) {
    for kind in TierKind::ALL {
        POOL_FREE_SLOTS
            .with_label_values(&[pool.name(), kind.as_str()])
            .set(pool.free_slots(kind) as i64);
    }
}

/// Export metrics in Prometheus text format
pub fn export() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&METRICS_REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{PoolConfig, TierConfig};

    #[test]
    fn test_export_contains_registered_metrics() {
        init_metrics();
        init_metrics();
        CONNECTIONS_CLOSED.with_label_values(&["eof"]).inc();

        let pool = SlabPool::new(
            "metrics-test",
            &PoolConfig {
                small: TierConfig::new(16, 2),
                medium: TierConfig::new(64, 1),
                large: TierConfig::new(256, 1),
            },
        );
        record_pool(&pool);

        let text = export().unwrap();
        assert!(text.contains("photonwire_connections_closed_total"));
        assert!(text.contains("pool=\"metrics-test\""));
    }
}
