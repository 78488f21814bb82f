//! Metrics for the repo backend.

use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Counters for the repo backend.
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub changes_written: Counter,
    pub changes_applied: Counter,
    pub blocks_replicated: Counter,
    pub gossip_sent: Counter,
    pub gossip_received: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            changes_written: Counter::new("Number of local changes written to feeds"),
            changes_applied: Counter::new("Number of remote changes applied to documents"),
            blocks_replicated: Counter::new("Number of feed blocks received from peers"),
            gossip_sent: Counter::new("Number of gossip messages sent"),
            gossip_received: Counter::new("Number of gossip messages received"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "hypermerge"
    }
}
