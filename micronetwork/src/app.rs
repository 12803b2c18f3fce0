//! Wire the topology, scheduler and nodes together and drive a simulation.
//!
//! # Example
//!
//! ```rust
//! use micronetwork::{
//!     app::{App, Config, Outcome},
//!     handlers::{Echo, Pinger},
//!     link::Latency,
//!     topology::LinkConfig,
//! };
//! use std::time::Duration;
//!
//! let mut app = App::new(Config::default());
//! app.add_node("pinger", Pinger::new("echo", 3, Duration::from_millis(100))).unwrap();
//! app.add_node("echo", Echo::default()).unwrap();
//! let link = LinkConfig::new(Latency::Fixed(Duration::from_millis(10)));
//! app.add_link("pinger", "echo", link.clone()).unwrap();
//! app.add_link("echo", "pinger", link).unwrap();
//! app.timer(Duration::ZERO, "pinger", Pinger::TIMER).unwrap();
//!
//! let report = app.run().unwrap();
//! assert_eq!(report.outcome, Outcome::Drained);
//! assert_eq!(report.delivered, 6);
//! ```

use crate::{
    auditor::Auditor,
    link::{self, Decision, DropReason},
    metrics::{self, Metrics},
    node::{Fault, Handler, Input, Node, Packet},
    scheduler::{Action, Event, Scheduler},
    topology::{LinkConfig, NodeId, Topology},
    ConfigError, Error,
};
use bytes::Bytes;
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tracing::{debug, info, trace, warn};

/// Prefix for all metrics registered by a simulation.
const METRICS_PREFIX: &str = "micronetwork";

/// Configuration for a simulation.
#[derive(Clone, Debug)]
pub struct Config {
    /// Seed for the random number generator used by the link model.
    pub seed: u64,

    /// If set, events scheduled after this simulated time are not dispatched.
    pub deadline: Option<Duration>,

    /// If set, every handler runs on its own thread and any invocation that takes
    /// longer than this (in wall-clock time) faults the node.
    pub watchdog: Option<Duration>,

    /// Registry the simulation's metrics are registered in.
    pub registry: Arc<Mutex<Registry>>,
}

impl Config {
    /// Check that the configuration can drive a reproducible run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog.is_some_and(|limit| limit.is_zero()) {
            return Err(ConfigError::InvalidWatchdog);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            deadline: None,
            watchdog: None,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }
}

/// Stops a running simulation before its next dispatch.
#[derive(Clone, Debug, Default)]
pub struct Canceller {
    cancelled: Arc<AtomicBool>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Why a simulation stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// No events were left to dispatch.
    Drained,
    /// The next event was scheduled after the deadline.
    Deadline,
    /// The simulation was cancelled.
    Cancelled,
}

/// Summary of a finished simulation.
#[derive(Clone, Debug)]
pub struct Report {
    pub outcome: Outcome,

    /// Simulated time of the last dispatched event.
    pub now: Duration,

    /// Number of events dispatched.
    pub dispatched: u64,

    /// Number of packets handed to their destination.
    pub delivered: u64,

    /// Number of packets that never reached their destination.
    pub dropped: u64,

    /// Number of events left in the queue.
    pub pending: usize,

    /// Faults recorded during the run, in the order they occurred.
    pub faults: Vec<Fault>,

    /// Digest of everything dispatched (see [Auditor::state]).
    pub state: String,

    /// Final state of every node, as reported by [Handler::snapshot].
    pub snapshots: BTreeMap<NodeId, Bytes>,
}

/// A simulation under construction.
///
/// Nodes, links and initial work are registered first; [App::run] then consumes the
/// app and drives the simulation until it stops.
pub struct App {
    cfg: Config,
    topology: Topology,
    handlers: BTreeMap<NodeId, Box<dyn Handler>>,
    scheduler: Scheduler,
    canceller: Canceller,
    metrics: Metrics,
}

impl App {
    /// Create a new, empty simulation.
    pub fn new(cfg: Config) -> Self {
        let metrics = {
            let mut registry = cfg.registry.lock().unwrap();
            Metrics::init(registry.sub_registry_with_prefix(METRICS_PREFIX))
        };
        Self {
            cfg,
            topology: Topology::new(),
            handlers: BTreeMap::new(),
            scheduler: Scheduler::new(),
            canceller: Canceller::default(),
            metrics,
        }
    }

    /// Register a node driven by `handler`.
    pub fn add_node(
        &mut self,
        id: impl Into<NodeId>,
        handler: impl Handler,
    ) -> Result<(), Error> {
        let id = id.into();
        self.topology.add_node(id.clone())?;
        self.handlers.insert(id, Box::new(handler));
        Ok(())
    }

    /// Create a unidirectional link between two registered nodes.
    pub fn add_link(
        &mut self,
        src: impl Into<NodeId>,
        dst: impl Into<NodeId>,
        config: LinkConfig,
    ) -> Result<(), Error> {
        Ok(self.topology.add_link(src, dst, config)?)
    }

    /// Partition (or heal) a link before the simulation starts.
    pub fn set_partition(
        &mut self,
        src: impl Into<NodeId>,
        dst: impl Into<NodeId>,
        partitioned: bool,
    ) -> Result<(), Error> {
        Ok(self.topology.set_partition(src, dst, partitioned)?)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn ensure_node(&self, id: &NodeId) -> Result<(), Error> {
        if !self.topology.contains(id) {
            return Err(ConfigError::UnknownNode(id.clone()).into());
        }
        Ok(())
    }

    /// Have `src` send `payload` to `dst` at simulated time `at`.
    ///
    /// The packet goes through the link model like any packet emitted by a handler.
    pub fn send(
        &mut self,
        at: Duration,
        src: impl Into<NodeId>,
        dst: impl Into<NodeId>,
        payload: impl Into<Bytes>,
    ) -> Result<(), Error> {
        let (src, dst) = (src.into(), dst.into());
        self.ensure_node(&src)?;
        self.ensure_node(&dst)?;
        self.scheduler.schedule(
            at,
            Action::Send {
                src,
                dst,
                payload: payload.into(),
            },
        );
        Ok(())
    }

    /// Fire timer `id` on `node` at simulated time `at`.
    pub fn timer(&mut self, at: Duration, node: impl Into<NodeId>, id: u64) -> Result<(), Error> {
        let node = node.into();
        self.ensure_node(&node)?;
        self.scheduler.schedule(at, Action::Timer { node, id });
        Ok(())
    }

    /// Partition (or heal) an existing link at simulated time `at`.
    pub fn partition(
        &mut self,
        at: Duration,
        src: impl Into<NodeId>,
        dst: impl Into<NodeId>,
        partitioned: bool,
    ) -> Result<(), Error> {
        let (src, dst) = (src.into(), dst.into());
        if self.topology.link(&src, &dst).is_none() {
            return Err(ConfigError::UnknownLink(src, dst).into());
        }
        self.scheduler.schedule(
            at,
            Action::Partition {
                src,
                dst,
                partitioned,
            },
        );
        Ok(())
    }

    /// Returns a handle that can cancel the simulation (from any thread).
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Cancel the simulation.
    ///
    /// If called before [App::run], the run stops before dispatching anything.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// Run the simulation until no events remain, the deadline is reached, or it is cancelled.
    ///
    /// Returns [Error::Faults] (which still carries the [Report]) if any node faulted.
    pub fn run(self) -> Result<Report, Error> {
        let Self {
            cfg,
            topology,
            handlers,
            scheduler,
            canceller,
            metrics,
        } = self;
        cfg.validate()?;
        let nodes = handlers
            .into_iter()
            .map(|(id, handler)| (id.clone(), Node::new(id, handler, cfg.watchdog)))
            .collect::<BTreeMap<_, _>>();
        info!(
            seed = cfg.seed,
            nodes = nodes.len(),
            links = topology.links().count(),
            pending = scheduler.len(),
            "starting simulation"
        );

        let mut simulation = Simulation {
            topology,
            nodes,
            scheduler,
            rng: StdRng::seed_from_u64(cfg.seed),
            auditor: Auditor::default(),
            metrics,
            dispatched: 0,
            delivered: 0,
            dropped: 0,
            faults: Vec::new(),
        };
        let outcome = loop {
            if canceller.is_cancelled() {
                break Outcome::Cancelled;
            }
            let Some(next) = simulation.scheduler.peek() else {
                break Outcome::Drained;
            };
            if cfg.deadline.is_some_and(|deadline| next > deadline) {
                break Outcome::Deadline;
            }
            let Some(event) = simulation.scheduler.next() else {
                break Outcome::Drained;
            };
            simulation.dispatch(event);
        };

        let report = simulation.finish(outcome);
        info!(
            ?outcome,
            now = ?report.now,
            dispatched = report.dispatched,
            delivered = report.delivered,
            dropped = report.dropped,
            faults = report.faults.len(),
            state = %report.state,
            "simulation finished"
        );
        if !report.faults.is_empty() {
            return Err(Error::Faults(Box::new(report)));
        }
        Ok(report)
    }
}

/// Run one independent simulation per seed, in parallel.
///
/// Each simulation is still driven by a single thread, so results are the same as
/// running them one after another.
pub fn sweep<F, E>(seeds: &[u64], build: F) -> Vec<Result<Report, E>>
where
    F: Fn(u64) -> Result<App, E> + Sync,
    E: From<Error> + Send,
{
    seeds
        .par_iter()
        .map(|seed| -> Result<Report, E> { Ok(build(*seed)?.run()?) })
        .collect()
}

/// State owned by a running simulation.
struct Simulation {
    topology: Topology,
    nodes: BTreeMap<NodeId, Node>,
    scheduler: Scheduler,
    rng: StdRng,
    auditor: Auditor,
    metrics: Metrics,

    dispatched: u64,
    delivered: u64,
    dropped: u64,
    faults: Vec<Fault>,
}

impl Simulation {
    fn dispatch(&mut self, event: Event) {
        let now = event.at;
        self.dispatched += 1;
        self.metrics.dispatched.inc();
        self.metrics
            .clock
            .set(i64::try_from(now.as_millis()).unwrap_or(i64::MAX));
        trace!(
            at = ?now,
            sequence = event.sequence,
            target = ?event.action.target(),
            "dispatching event"
        );

        match event.action {
            Action::Send { src, dst, payload } => {
                let Some(node) = self.nodes.get_mut(&src) else {
                    return;
                };
                let packet = node.stamp(dst, now, payload);
                self.route(now, packet);
            }
            Action::Deliver(packet) => {
                let stalled = self
                    .nodes
                    .get(&packet.dst)
                    .map_or(true, |node| node.is_stalled());
                if stalled {
                    self.drop(now, &packet, DropReason::Stalled);
                    return;
                }
                self.auditor.deliver(now, &packet);
                self.delivered += 1;
                self.metrics
                    .delivered
                    .get_or_create(&metrics::Packet::new(&packet.src, &packet.dst))
                    .inc();
                let node = packet.dst.clone();
                self.invoke(now, node, Input::Packet(packet));
            }
            Action::Timer { node, id } => {
                if self.nodes.get(&node).map_or(true, |node| node.is_stalled()) {
                    debug!(%node, id, "skipping timer on stalled node");
                    return;
                }
                self.auditor.timer(now, &node, id);
                self.invoke(now, node, Input::Timer(id));
            }
            Action::Partition {
                src,
                dst,
                partitioned,
            } => {
                if let Err(err) = self.topology.set_partition(&src, &dst, partitioned) {
                    warn!(?err, "failed to update partition");
                    return;
                }
                self.auditor.partition(now, &src, &dst, partitioned);
                debug!(%src, %dst, partitioned, "updated partition");
            }
        }
    }

    /// Deliver `input` to `id` and schedule everything it emits.
    fn invoke(&mut self, now: Duration, id: NodeId, input: Input) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        match node.invoke(now, input) {
            Ok((packets, timers)) => {
                for packet in packets {
                    self.route(now, packet);
                }
                for (at, timer) in timers {
                    self.scheduler.schedule(
                        at,
                        Action::Timer {
                            node: id.clone(),
                            id: timer,
                        },
                    );
                }
            }
            Err(kind) => {
                warn!(node = %id, at = ?now, %kind, "node fault");
                self.auditor.fault(now, &id);
                self.metrics
                    .faults
                    .get_or_create(&metrics::Node {
                        node: id.to_string(),
                    })
                    .inc();
                self.faults.push(Fault {
                    node: id,
                    at: now,
                    kind,
                });
            }
        }
    }

    /// Send a packet through the link model.
    fn route(&mut self, now: Duration, packet: Packet) {
        let Some(link) = self.topology.link_mut(&packet.src, &packet.dst) else {
            self.drop(now, &packet, DropReason::NoLink);
            return;
        };
        self.metrics
            .sent
            .get_or_create(&metrics::Packet::new(&packet.src, &packet.dst))
            .inc();
        match link::resolve(link, &packet, now, &mut self.rng) {
            Decision::Deliver(at) => {
                trace!(
                    src = %packet.src,
                    dst = %packet.dst,
                    sequence = packet.sequence,
                    at = ?at,
                    "sending packet"
                );
                self.scheduler.schedule(at, Action::Deliver(packet));
            }
            Decision::Drop(reason) => self.drop(now, &packet, reason),
        }
    }

    fn drop(&mut self, now: Duration, packet: &Packet, reason: DropReason) {
        debug!(
            src = %packet.src,
            dst = %packet.dst,
            sequence = packet.sequence,
            %reason,
            "dropping packet"
        );
        self.auditor.drop(now, packet, reason);
        self.dropped += 1;
        self.metrics
            .dropped
            .get_or_create(&metrics::Dropped::new(&packet.src, &packet.dst, reason))
            .inc();
    }

    fn finish(mut self, outcome: Outcome) -> Report {
        let snapshots = self
            .nodes
            .iter_mut()
            .map(|(id, node)| (id.clone(), node.snapshot()))
            .collect();
        Report {
            outcome,
            now: self.scheduler.now(),
            dispatched: self.dispatched,
            delivered: self.delivered,
            dropped: self.dropped,
            pending: self.scheduler.len(),
            faults: self.faults,
            state: self.auditor.state(),
            snapshots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use crate::{
        handlers::{Echo, Gossip, Pinger},
        link::Latency,
        node::{FaultKind, HandlerError, Outbox},
    };
    use prometheus_client::encoding::text::encode;
    use std::{io, sync::atomic::AtomicU64, thread};

    type Log = Arc<Mutex<Vec<(Duration, Packet)>>>;

    /// Handler that records every packet it receives.
    fn recorder() -> (Log, impl Handler) {
        let log = Log::default();
        let handler = {
            let log = log.clone();
            move |now: Duration, input: Input, _outbox: &mut Outbox| -> Result<(), HandlerError> {
                if let Input::Packet(packet) = input {
                    log.lock().unwrap().push((now, packet));
                }
                Ok(())
            }
        };
        (log, handler)
    }

    fn fixed(ms: u64) -> LinkConfig {
        LinkConfig::new(Latency::Fixed(Duration::from_millis(ms)))
    }

    #[test_traced("DEBUG")]
    fn test_delivery_after_latency() {
        let (log, b) = recorder();
        let mut app = App::new(Config::default());
        app.add_node("a", Echo::default()).unwrap();
        app.add_node("b", b).unwrap();
        app.add_link("a", "b", fixed(10)).unwrap();
        app.send(Duration::ZERO, "a", "b", "P").unwrap();

        let report = app.run().unwrap();
        assert_eq!(report.outcome, Outcome::Drained);
        assert_eq!(report.now, Duration::from_millis(10));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.pending, 0);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        let (at, packet) = &log[0];
        assert_eq!(*at, Duration::from_millis(10));
        assert_eq!(packet.src, NodeId::from("a"));
        assert_eq!(packet.sent_at, Duration::ZERO);
        assert_eq!(packet.payload, Bytes::from("P"));
    }

    #[test_traced("DEBUG")]
    fn test_partitioned_link_drops_without_fault() {
        let (log, b) = recorder();
        let mut app = App::new(Config::default());
        app.add_node("a", Echo::default()).unwrap();
        app.add_node("b", b).unwrap();
        app.add_link("a", "b", fixed(10)).unwrap();
        app.set_partition("a", "b", true).unwrap();
        app.send(Duration::ZERO, "a", "b", "P").unwrap();

        let report = app.run().unwrap();
        assert_eq!(report.outcome, Outcome::Drained);
        assert_eq!(report.pending, 0);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.dropped, 1);
        assert!(report.faults.is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test_traced("DEBUG")]
    fn test_total_loss_drops_everything() {
        let (log, b) = recorder();
        let mut app = App::new(Config::default());
        app.add_node("a", Echo::default()).unwrap();
        app.add_node("b", b).unwrap();
        app.add_link("a", "b", fixed(10).with_loss(1.0)).unwrap();
        for i in 0..1_000 {
            app.send(Duration::from_millis(i), "a", "b", "P").unwrap();
        }

        let report = app.run().unwrap();
        assert_eq!(report.dropped, 1_000);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test_traced("DEBUG")]
    fn test_same_time_deliveries_keep_send_order() {
        let (log, b) = recorder();
        let mut app = App::new(Config::default());
        app.add_node("a", Echo::default()).unwrap();
        app.add_node("b", b).unwrap();
        app.add_link("a", "b", fixed(10)).unwrap();
        for payload in ["0", "1", "2", "3"] {
            app.send(Duration::ZERO, "a", "b", payload).unwrap();
        }
        app.run().unwrap();

        let log = log.lock().unwrap();
        let sequences: Vec<_> = log.iter().map(|(_, packet)| packet.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        let payloads: Vec<_> = log.iter().map(|(_, packet)| packet.payload.clone()).collect();
        assert_eq!(payloads, vec!["0", "1", "2", "3"]);
        assert!(log.iter().all(|(at, _)| *at == Duration::from_millis(10)));
    }

    #[test_traced("DEBUG")]
    fn test_handler_fault_is_isolated() {
        let (log, c) = recorder();
        let failing =
            |_now: Duration, _input: Input, _outbox: &mut Outbox| -> Result<(), HandlerError> {
                Err(Box::new(io::Error::other("boom")))
            };
        let mut app = App::new(Config::default());
        app.add_node("a", Echo::default()).unwrap();
        app.add_node("b", failing).unwrap();
        app.add_node("c", c).unwrap();
        app.add_link("a", "b", fixed(10)).unwrap();
        app.add_link("a", "c", fixed(10)).unwrap();
        app.send(Duration::ZERO, "a", "b", "first").unwrap();
        app.send(Duration::ZERO, "a", "c", "same time").unwrap();
        app.send(Duration::from_millis(5), "a", "c", "later").unwrap();

        let Err(Error::Faults(report)) = app.run() else {
            panic!("expected faults");
        };
        assert_eq!(report.outcome, Outcome::Drained);
        assert_eq!(
            report.faults,
            vec![Fault {
                node: "b".into(),
                at: Duration::from_millis(10),
                kind: FaultKind::Handler("boom".into()),
            }]
        );
        assert_eq!(report.delivered, 3);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test_traced("DEBUG")]
    fn test_cancel_stops_before_next_dispatch() {
        let mut app = App::new(Config::default());
        let canceller = app.canceller();
        let invocations = Arc::new(AtomicU64::new(0));
        let looping = {
            let invocations = invocations.clone();
            move |_now: Duration, _input: Input, outbox: &mut Outbox| -> Result<(), HandlerError> {
                if invocations.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                    canceller.cancel();
                }
                outbox.timer(Duration::from_millis(1), 0);
                Ok(())
            }
        };
        app.add_node("a", looping).unwrap();
        app.timer(Duration::ZERO, "a", 0).unwrap();

        let report = app.run().unwrap();
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(invocations.load(Ordering::SeqCst), 5);
        assert_eq!(report.dispatched, 5);
        assert_eq!(report.pending, 1);
    }

    #[test_traced("DEBUG")]
    fn test_cancel_from_another_thread() {
        let mut app = App::new(Config::default());
        let spin =
            |_now: Duration, _input: Input, outbox: &mut Outbox| -> Result<(), HandlerError> {
                outbox.timer(Duration::from_millis(1), 0);
                Ok(())
            };
        app.add_node("a", spin).unwrap();
        app.timer(Duration::ZERO, "a", 0).unwrap();

        let canceller = app.canceller();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });
        let report = app.run().unwrap();
        handle.join().unwrap();
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert!(report.dispatched > 0);
    }

    #[test_traced("DEBUG")]
    fn test_cancel_before_run() {
        let mut app = App::new(Config::default());
        app.add_node("a", Echo::default()).unwrap();
        app.timer(Duration::ZERO, "a", 0).unwrap();
        app.cancel();

        let report = app.run().unwrap();
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.pending, 1);
    }

    #[test_traced("DEBUG")]
    fn test_deadline() {
        let mut app = App::new(Config {
            deadline: Some(Duration::from_millis(95)),
            ..Config::default()
        });
        app.add_node("pinger", Pinger::new("echo", 100, Duration::from_millis(10)))
            .unwrap();
        app.add_node("echo", Echo::default()).unwrap();
        app.add_link("pinger", "echo", fixed(1)).unwrap();
        app.add_link("echo", "pinger", fixed(1)).unwrap();
        app.timer(Duration::ZERO, "pinger", Pinger::TIMER).unwrap();

        let report = app.run().unwrap();
        assert_eq!(report.outcome, Outcome::Deadline);
        assert!(report.now <= Duration::from_millis(95));
        assert_eq!(report.pending, 1);

        // Pings at 0, 10, ..., 90 all complete a round trip
        let snapshot = &report.snapshots[&NodeId::from("pinger")];
        assert_eq!(&snapshot[..8], &10u64.to_be_bytes());
        assert_eq!(snapshot.len(), 8 * 11);
    }

    #[test_traced("DEBUG")]
    fn test_scheduled_partition_and_heal() {
        let (log, b) = recorder();
        let mut app = App::new(Config::default());
        app.add_node("a", Echo::default()).unwrap();
        app.add_node("b", b).unwrap();
        app.add_link("a", "b", fixed(10)).unwrap();
        app.partition(Duration::from_millis(5), "a", "b", true).unwrap();
        app.partition(Duration::from_millis(15), "a", "b", false).unwrap();
        app.send(Duration::ZERO, "a", "b", "before").unwrap();
        app.send(Duration::from_millis(10), "a", "b", "during").unwrap();
        app.send(Duration::from_millis(20), "a", "b", "after").unwrap();

        let report = app.run().unwrap();
        assert_eq!(report.dropped, 1);
        let log = log.lock().unwrap();
        let received: Vec<_> = log
            .iter()
            .map(|(at, packet)| (*at, packet.payload.clone()))
            .collect();
        assert_eq!(
            received,
            vec![
                (Duration::from_millis(10), Bytes::from("before")),
                (Duration::from_millis(30), Bytes::from("after")),
            ]
        );
    }

    #[test_traced("DEBUG")]
    fn test_send_without_link_is_dropped() {
        let mut app = App::new(Config::default());
        app.add_node("a", Echo::default()).unwrap();
        app.add_node("b", Echo::default()).unwrap();
        app.send(Duration::ZERO, "a", "b", "P").unwrap();

        let report = app.run().unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.delivered, 0);
    }

    #[test_traced("DEBUG")]
    fn test_build_errors() {
        let mut app = App::new(Config::default());
        app.add_node("a", Echo::default()).unwrap();
        app.add_node("b", Echo::default()).unwrap();
        assert!(matches!(
            app.add_node("a", Echo::default()),
            Err(Error::Config(ConfigError::DuplicateNode(_)))
        ));
        app.add_link("a", "b", fixed(1)).unwrap();
        assert!(matches!(
            app.add_link("a", "b", fixed(1)),
            Err(Error::Config(ConfigError::DuplicateLink(_, _)))
        ));
        assert!(matches!(
            app.send(Duration::ZERO, "a", "z", "P"),
            Err(Error::Config(ConfigError::UnknownNode(_)))
        ));
        assert!(matches!(
            app.timer(Duration::ZERO, "z", 0),
            Err(Error::Config(ConfigError::UnknownNode(_)))
        ));
        assert!(matches!(
            app.partition(Duration::ZERO, "b", "a", true),
            Err(Error::Config(ConfigError::UnknownLink(_, _)))
        ));
    }

    #[test_traced("DEBUG")]
    fn test_watchdog_isolates_stalled_node() {
        let (log, c) = recorder();
        let stuck =
            |_now: Duration, _input: Input, _outbox: &mut Outbox| -> Result<(), HandlerError> {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            };
        let mut app = App::new(Config {
            watchdog: Some(Duration::from_millis(50)),
            ..Config::default()
        });
        app.add_node("a", Echo::default()).unwrap();
        app.add_node("b", stuck).unwrap();
        app.add_node("c", c).unwrap();
        app.add_link("a", "b", fixed(10)).unwrap();
        app.add_link("a", "c", fixed(10)).unwrap();
        app.send(Duration::ZERO, "a", "b", "stuck").unwrap();
        app.send(Duration::ZERO, "a", "c", "fine").unwrap();
        app.send(Duration::from_millis(20), "a", "b", "ignored").unwrap();

        let Err(Error::Faults(report)) = app.run() else {
            panic!("expected faults");
        };
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].node, NodeId::from("b"));
        assert_eq!(
            report.faults[0].kind,
            FaultKind::Stalled(Duration::from_millis(50))
        );
        assert_eq!(report.dropped, 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test_traced("DEBUG")]
    fn test_zero_watchdog_rejected() {
        let mut app = App::new(Config {
            watchdog: Some(Duration::ZERO),
            ..Config::default()
        });
        app.add_node("a", Echo::default()).unwrap();
        app.add_node("b", Echo::default()).unwrap();
        app.add_link("a", "b", fixed(10)).unwrap();
        app.send(Duration::ZERO, "a", "b", "P").unwrap();
        assert!(matches!(app.run(), Err(Error::Config(ConfigError::InvalidWatchdog))));
    }

    fn lossy(seed: u64) -> Result<App, Error> {
        let mut app = App::new(Config {
            seed,
            ..Config::default()
        });
        let names = ["a", "b", "c", "d", "e"];
        for name in names {
            let peers = names.iter().filter(|peer| **peer != name).copied();
            app.add_node(name, Gossip::new(peers))?;
        }
        for src in names {
            for dst in names {
                if src == dst {
                    continue;
                }
                let latency = Latency::Uniform {
                    low: Duration::from_millis(1),
                    high: Duration::from_millis(50),
                };
                app.add_link(src, dst, LinkConfig::new(latency).with_loss(0.3))?;
            }
        }
        for i in 0..20u64 {
            app.send(Duration::from_millis(i), "a", "b", i.to_be_bytes().to_vec())?;
        }
        Ok(app)
    }

    #[test_traced("DEBUG")]
    fn test_same_seed_same_run() {
        let first = lossy(7).unwrap().run().unwrap();
        let second = lossy(7).unwrap().run().unwrap();
        assert_eq!(first.state, second.state);
        assert_eq!(first.snapshots, second.snapshots);
        assert_eq!(first.dispatched, second.dispatched);
        assert_eq!(first.now, second.now);
    }

    #[test_traced("DEBUG")]
    fn test_different_seed_different_run() {
        let first = lossy(7).unwrap().run().unwrap();
        let second = lossy(8).unwrap().run().unwrap();
        assert_ne!(first.state, second.state);
    }

    #[test_traced("DEBUG")]
    fn test_watchdog_does_not_change_outcome() {
        let inline = lossy(3).unwrap().run().unwrap();
        let mut guarded = lossy(3).unwrap();
        guarded.cfg.watchdog = Some(Duration::from_secs(5));
        let guarded = guarded.run().unwrap();
        assert_eq!(inline.state, guarded.state);
        assert_eq!(inline.snapshots, guarded.snapshots);
    }

    #[test_traced("DEBUG")]
    fn test_sweep_matches_sequential_runs() {
        let seeds = [1, 2, 3, 4];
        let results = sweep(&seeds, lossy);
        for (seed, result) in seeds.iter().zip(results) {
            let parallel = result.unwrap();
            let sequential = lossy(*seed).unwrap().run().unwrap();
            assert_eq!(parallel.state, sequential.state);
        }
    }

    #[test_traced("DEBUG")]
    fn test_metrics() {
        let cfg = Config::default();
        let registry = cfg.registry.clone();
        let mut app = App::new(cfg);
        app.add_node("a", Echo::default()).unwrap();
        app.add_node("b", Echo::default()).unwrap();
        app.add_link("a", "b", fixed(10)).unwrap();
        app.send(Duration::ZERO, "a", "b", "P").unwrap();
        app.run().unwrap();

        let mut buffer = String::new();
        encode(&mut buffer, &registry.lock().unwrap()).unwrap();
        assert!(buffer.contains("micronetwork_packets_delivered_total"));
        assert!(buffer.contains("micronetwork_events_dispatched_total 2"));
        assert!(buffer.contains("recipient=\"b\""));
    }
}
