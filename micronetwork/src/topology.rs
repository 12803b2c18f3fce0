//! Registry of simulated nodes and the directed links between them.

use crate::{link::Latency, ConfigError};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    num::NonZeroU64,
    time::Duration,
};

/// Unique name of a simulated node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&NodeId> for NodeId {
    fn from(id: &NodeId) -> Self {
        id.clone()
    }
}

/// Describes a connection between two nodes.
///
/// Links are unidirectional (and must be set up in both directions
/// for a bidirectional connection).
#[derive(Clone, Debug, PartialEq)]
pub struct LinkConfig {
    /// Distribution of the propagation delay of a packet.
    pub latency: Latency,

    /// Probability of a packet being lost (in range [0,1]).
    pub loss: f64,

    /// Maximum number of bytes per second the link can transmit (unlimited if `None`).
    pub bandwidth: Option<NonZeroU64>,

    /// Whether all packets sent over the link are dropped.
    pub partitioned: bool,
}

impl LinkConfig {
    /// A lossless, unlimited, healthy link with the given latency.
    pub fn new(latency: Latency) -> Self {
        Self {
            latency,
            loss: 0.0,
            bandwidth: None,
            partitioned: false,
        }
    }

    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_bandwidth(mut self, bytes_per_second: NonZeroU64) -> Self {
        self.bandwidth = Some(bytes_per_second);
        self
    }

    pub fn partitioned(mut self) -> Self {
        self.partitioned = true;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.loss.is_finite() || !(0.0..=1.0).contains(&self.loss) {
            return Err(ConfigError::InvalidLoss(self.loss));
        }
        self.latency.validate()
    }
}

/// A registered link and its transmission backlog.
#[derive(Clone, Debug)]
pub struct Link {
    config: LinkConfig,

    /// Simulated time at which the last queued transmission leaves the sender.
    pub(crate) busy_until: Duration,
}

impl Link {
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn is_partitioned(&self) -> bool {
        self.config.partitioned
    }
}

/// Nodes and the directed links between them.
///
/// Both sets are ordered so that iteration never depends on insertion
/// history or hashing.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    nodes: BTreeSet<NodeId>,
    links: BTreeMap<(NodeId, NodeId), Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new node.
    pub fn add_node(&mut self, id: impl Into<NodeId>) -> Result<(), ConfigError> {
        let id = id.into();
        if self.nodes.contains(&id) {
            return Err(ConfigError::DuplicateNode(id));
        }
        self.nodes.insert(id);
        Ok(())
    }

    /// Create a unidirectional link between two registered nodes.
    ///
    /// Each ordered pair may only be linked once.
    pub fn add_link(
        &mut self,
        src: impl Into<NodeId>,
        dst: impl Into<NodeId>,
        config: LinkConfig,
    ) -> Result<(), ConfigError> {
        let (src, dst) = (src.into(), dst.into());
        for id in [&src, &dst] {
            if !self.nodes.contains(id) {
                return Err(ConfigError::UnknownNode(id.clone()));
            }
        }
        if src == dst {
            return Err(ConfigError::LinkingSelf(src));
        }
        config.validate()?;

        let key = (src, dst);
        if self.links.contains_key(&key) {
            let (src, dst) = key;
            return Err(ConfigError::DuplicateLink(src, dst));
        }
        self.links.insert(
            key,
            Link {
                config,
                busy_until: Duration::ZERO,
            },
        );
        Ok(())
    }

    /// Toggle whether packets on an existing link are dropped.
    pub fn set_partition(
        &mut self,
        src: impl Into<NodeId>,
        dst: impl Into<NodeId>,
        partitioned: bool,
    ) -> Result<(), ConfigError> {
        let key = (src.into(), dst.into());
        match self.links.get_mut(&key) {
            Some(link) => {
                link.config.partitioned = partitioned;
                Ok(())
            }
            None => {
                let (src, dst) = key;
                Err(ConfigError::UnknownLink(src, dst))
            }
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains(id)
    }

    pub fn link(&self, src: &NodeId, dst: &NodeId) -> Option<&Link> {
        self.links.get(&(src.clone(), dst.clone()))
    }

    pub(crate) fn link_mut(&mut self, src: &NodeId, dst: &NodeId) -> Option<&mut Link> {
        self.links.get_mut(&(src.clone(), dst.clone()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }

    pub fn links(&self) -> impl Iterator<Item = (&NodeId, &NodeId, &Link)> {
        self.links.iter().map(|((src, dst), link)| (src, dst, link))
    }
}
