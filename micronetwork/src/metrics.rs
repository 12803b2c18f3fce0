use crate::{link::DropReason, topology::NodeId};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Packet {
    pub origin: String,
    pub recipient: String,
}

impl Packet {
    pub fn new(origin: &NodeId, recipient: &NodeId) -> Self {
        Self {
            origin: origin.to_string(),
            recipient: recipient.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Dropped {
    pub origin: String,
    pub recipient: String,
    pub reason: String,
}

impl Dropped {
    pub fn new(origin: &NodeId, recipient: &NodeId, reason: DropReason) -> Self {
        Self {
            origin: origin.to_string(),
            recipient: recipient.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Node {
    pub node: String,
}

#[derive(Debug)]
pub struct Metrics {
    pub sent: Family<Packet, Counter>,
    pub delivered: Family<Packet, Counter>,
    pub dropped: Family<Dropped, Counter>,
    pub faults: Family<Node, Counter>,
    pub dispatched: Counter,
    pub clock: Gauge,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            sent: Family::default(),
            delivered: Family::default(),
            dropped: Family::default(),
            faults: Family::default(),
            dispatched: Counter::default(),
            clock: Gauge::default(),
        };
        registry.register("packets_sent", "packets sent", metrics.sent.clone());
        registry.register(
            "packets_delivered",
            "packets delivered",
            metrics.delivered.clone(),
        );
        registry.register("packets_dropped", "packets dropped", metrics.dropped.clone());
        registry.register("node_faults", "node faults", metrics.faults.clone());
        registry.register(
            "events_dispatched",
            "events dispatched",
            metrics.dispatched.clone(),
        );
        registry.register(
            "clock_ms",
            "simulated time in milliseconds",
            metrics.clock.clone(),
        );
        metrics
    }
}
