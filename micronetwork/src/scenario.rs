//! Describe a simulation in YAML.
//!
//! A scenario lists the nodes of a simulation (and the handler driving each), the links
//! between them, and the work scheduled before the run starts. All times are in
//! milliseconds of simulated time.
//!
//! ```yaml
//! seed: 7
//! deadline_ms: 1000
//! nodes:
//!   - name: pinger
//!     handler: { kind: pinger, peer: echo, count: 3, interval_ms: 100 }
//!   - name: echo
//!     handler: { kind: echo }
//! links:
//!   - { from: pinger, to: echo, latency: { fixed: 10 } }
//!   - { from: echo, to: pinger, latency: { uniform: { low: 5, high: 15 } }, loss: 0.1 }
//! partitions:
//!   - { at_ms: 150, from: echo, to: pinger, partitioned: true }
//! ```
//!
//! Pinger nodes are started automatically (their [Pinger::TIMER] fires at time zero).

use crate::{
    app::{App, Config},
    handlers::{Echo, Gossip, Pinger},
    link::Latency,
    topology::{LinkConfig, NodeId},
    ConfigError, Report,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet, fs::File, num::NonZeroU64, path::Path, str::FromStr, time::Duration,
};
use thiserror::Error;
use tracing::debug;

/// Scenario used when none is provided.
pub const DEMO: &str = r#"
seed: 42
deadline_ms: 2000
nodes:
  - name: pinger
    handler: { kind: pinger, peer: echo, count: 5, interval_ms: 100 }
  - name: echo
    handler: { kind: echo }
  - name: alice
    handler: { kind: gossip, peers: [bob, carol] }
  - name: bob
    handler: { kind: gossip, peers: [alice, carol] }
  - name: carol
    handler: { kind: gossip, peers: [alice, bob] }
links:
  - { from: pinger, to: echo, latency: { fixed: 10 } }
  - { from: echo, to: pinger, latency: { uniform: { low: 5, high: 25 } }, loss: 0.1 }
  - { from: alice, to: bob, latency: { exponential: { mean: 20 } }, bandwidth: 1000 }
  - { from: bob, to: alice, latency: { exponential: { mean: 20 } }, bandwidth: 1000 }
  - { from: alice, to: carol, latency: { normal: { mean: 30, stddev: 5 } } }
  - { from: carol, to: alice, latency: { normal: { mean: 30, stddev: 5 } } }
  - { from: bob, to: carol, latency: { fixed: 15 }, loss: 0.2 }
  - { from: carol, to: bob, latency: { fixed: 15 }, loss: 0.2 }
sends:
  - { at_ms: 0, from: alice, to: bob, payload: "rumor-1" }
  - { at_ms: 300, from: carol, to: alice, payload: "rumor-2" }
partitions:
  - { at_ms: 250, from: echo, to: pinger, partitioned: true }
  - { at_ms: 350, from: echo, to: pinger, partitioned: false }
"#;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read scenario: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid scenario: {0}")]
    Config(#[from] ConfigError),
    #[error("handler of {0} references unknown node: {1}")]
    UnknownNode(NodeId, NodeId),
    #[error("simulation finished with {} node fault(s)", .0.faults.len())]
    Faults(Box<Report>),
}

impl From<crate::Error> for Error {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Config(err) => Error::Config(err),
            crate::Error::Faults(report) => Error::Faults(report),
        }
    }
}

fn default_seed() -> u64 {
    Config::default().seed
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Scenario {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub watchdog_ms: Option<u64>,

    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub sends: Vec<SendSpec>,
    #[serde(default)]
    pub timers: Vec<TimerSpec>,
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeSpec {
    pub name: String,
    pub handler: HandlerSpec,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerSpec {
    Echo,
    Pinger {
        peer: String,
        count: u64,
        interval_ms: u64,
    },
    Gossip {
        peers: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencySpec {
    Fixed(u64),
    Uniform { low: u64, high: u64 },
    Exponential { mean: u64 },
    Normal { mean: u64, stddev: u64 },
}

impl From<&LatencySpec> for Latency {
    fn from(spec: &LatencySpec) -> Self {
        match *spec {
            LatencySpec::Fixed(ms) => Latency::Fixed(Duration::from_millis(ms)),
            LatencySpec::Uniform { low, high } => Latency::Uniform {
                low: Duration::from_millis(low),
                high: Duration::from_millis(high),
            },
            LatencySpec::Exponential { mean } => Latency::Exponential {
                mean: Duration::from_millis(mean),
            },
            LatencySpec::Normal { mean, stddev } => Latency::Normal {
                mean: Duration::from_millis(mean),
                stddev: Duration::from_millis(stddev),
            },
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LinkSpec {
    pub from: String,
    pub to: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub latency: LatencySpec,
    #[serde(default)]
    pub loss: f64,
    /// Bytes per second (unlimited if absent).
    #[serde(default)]
    pub bandwidth: Option<u64>,
    #[serde(default)]
    pub partitioned: bool,
}

impl LinkSpec {
    fn config(&self) -> Result<LinkConfig, ConfigError> {
        let mut config = LinkConfig::new(Latency::from(&self.latency)).with_loss(self.loss);
        if let Some(bandwidth) = self.bandwidth {
            let bandwidth = NonZeroU64::new(bandwidth).ok_or(ConfigError::InvalidBandwidth)?;
            config = config.with_bandwidth(bandwidth);
        }
        if self.partitioned {
            config = config.partitioned();
        }
        Ok(config)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SendSpec {
    pub at_ms: u64,
    pub from: String,
    pub to: String,
    pub payload: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TimerSpec {
    pub at_ms: u64,
    pub node: String,
    pub id: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PartitionSpec {
    pub at_ms: u64,
    pub from: String,
    pub to: String,
    pub partitioned: bool,
}

impl FromStr for Scenario {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_yaml::from_str(s)?)
    }
}

impl Scenario {
    /// Read a scenario from a YAML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// The built-in demo scenario.
    pub fn demo() -> Result<Self, Error> {
        DEMO.parse()
    }

    /// Simulation configuration described by the scenario (with a fresh registry).
    pub fn config(&self) -> Config {
        Config {
            seed: self.seed,
            deadline: self.deadline_ms.map(Duration::from_millis),
            watchdog: self.watchdog_ms.map(Duration::from_millis),
            ..Config::default()
        }
    }

    /// Assemble the simulation described by the scenario.
    pub fn build(&self, cfg: Config) -> Result<App, Error> {
        cfg.validate()?;
        let names: BTreeSet<&str> = self.nodes.iter().map(|node| node.name.as_str()).collect();
        let check = |node: &str, peer: &str| {
            if names.contains(peer) {
                Ok(())
            } else {
                Err(Error::UnknownNode(node.into(), peer.into()))
            }
        };

        let mut app = App::new(cfg);
        for node in &self.nodes {
            let name = node.name.as_str();
            match &node.handler {
                HandlerSpec::Echo => app.add_node(name, Echo::default())?,
                HandlerSpec::Pinger {
                    peer,
                    count,
                    interval_ms,
                } => {
                    check(name, peer)?;
                    let interval = Duration::from_millis(*interval_ms);
                    app.add_node(name, Pinger::new(peer.as_str(), *count, interval))?;
                }
                HandlerSpec::Gossip { peers } => {
                    for peer in peers {
                        check(name, peer)?;
                    }
                    app.add_node(name, Gossip::new(peers.iter().map(String::as_str)))?;
                }
            }
        }
        for link in &self.links {
            app.add_link(link.from.as_str(), link.to.as_str(), link.config()?)?;
        }

        for node in &self.nodes {
            if let HandlerSpec::Pinger { .. } = node.handler {
                app.timer(Duration::ZERO, node.name.as_str(), Pinger::TIMER)?;
            }
        }
        for send in &self.sends {
            app.send(
                Duration::from_millis(send.at_ms),
                send.from.as_str(),
                send.to.as_str(),
                send.payload.clone(),
            )?;
        }
        for timer in &self.timers {
            app.timer(
                Duration::from_millis(timer.at_ms),
                timer.node.as_str(),
                timer.id,
            )?;
        }
        for partition in &self.partitions {
            app.partition(
                Duration::from_millis(partition.at_ms),
                partition.from.as_str(),
                partition.to.as_str(),
                partition.partitioned,
            )?;
        }
        debug!(
            nodes = self.nodes.len(),
            links = self.links.len(),
            sends = self.sends.len(),
            timers = self.timers.len(),
            partitions = self.partitions.len(),
            "built scenario"
        );
        Ok(app)
    }
}
