//! Relay telemetry counters.
//!
//! The registry is owned by whoever embeds the relay; the relay only
//! increments. Export surfaces (HTTP, push, …) are outside the core.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

#[derive(Clone, Default)]
pub struct Metrics {
    pub rounds: Counter,
    pub upstream_cells: Counter,
    pub upstream_bytes: Counter,
    pub downstream_cells: Counter,
    pub downstream_bytes: Counter,
    pub resyncs: Counter,
    pub disruptions: Counter,
    pub peers_expelled: Counter,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "dcnet_rounds",
            "Rounds completed since start",
            metrics.rounds.clone(),
        );
        registry.register(
            "dcnet_upstream_cells",
            "Upstream cells collected",
            metrics.upstream_cells.clone(),
        );
        registry.register(
            "dcnet_upstream_bytes",
            "Upstream payload bytes decoded",
            metrics.upstream_bytes.clone(),
        );
        registry.register(
            "dcnet_downstream_cells",
            "Downstream cells broadcast",
            metrics.downstream_cells.clone(),
        );
        registry.register(
            "dcnet_downstream_bytes",
            "Downstream payload bytes broadcast",
            metrics.downstream_bytes.clone(),
        );
        registry.register(
            "dcnet_resyncs",
            "Setups torn down and restarted",
            metrics.resyncs.clone(),
        );
        registry.register(
            "dcnet_disruptions",
            "Disruptions detected",
            metrics.disruptions.clone(),
        );
        registry.register(
            "dcnet_peers_expelled",
            "Peers expelled from the roster",
            metrics.peers_expelled.clone(),
        );
        metrics
    }
}
