//! Host the handlers that implement the behavior of simulated nodes.
//!
//! A [Handler] is invoked once per packet delivered to (or timer fired on) its node and
//! records the packets and timers it wants to emit in an [Outbox]. The runtime stamps the
//! emitted packets (source, sequence number, send time) and hands them back to the
//! orchestrator, which routes them through the link model.
//!
//! When a watchdog is configured, each handler lives on a dedicated thread and every
//! invocation waits a bounded amount of wall-clock time for it. Invocations are still issued
//! one at a time from the dispatch loop, so the order in which handlers observe events is
//! unaffected.

use crate::topology::NodeId;
use bytes::Bytes;
use std::{error::Error as StdError, sync::mpsc, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// A packet exchanged between two nodes.
///
/// Packets are never mutated after they are created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub src: NodeId,
    pub dst: NodeId,

    /// Simulated time at which the packet was sent.
    pub sent_at: Duration,

    /// Position of the packet among all packets sent by `src` (diagnostic only).
    pub sequence: u64,

    pub payload: Bytes,
}

/// Something that happened to a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// A packet arrived.
    Packet(Packet),
    /// A timer the node (or the orchestrator) scheduled fired.
    Timer(u64),
}

/// Packets and timers requested by a handler during a single invocation.
#[derive(Debug, Default)]
pub struct Outbox {
    sends: Vec<(NodeId, Bytes)>,
    timers: Vec<(Duration, u64)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `payload` to `to` over the link from this node.
    pub fn send(&mut self, to: impl Into<NodeId>, payload: impl Into<Bytes>) {
        self.sends.push((to.into(), payload.into()));
    }

    /// Fire timer `id` on this node `after` the current time.
    pub fn timer(&mut self, after: Duration, id: u64) {
        self.timers.push((after, id));
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.timers.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<(NodeId, Bytes)>, Vec<(Duration, u64)>) {
        (self.sends, self.timers)
    }
}

/// Error returned by a [Handler].
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Behavior of a simulated node.
///
/// Handlers own all of their node's state. They must not block indefinitely and should be
/// deterministic for equal inputs (otherwise runs cannot be reproduced).
pub trait Handler: Send + 'static {
    /// React to `input` at simulated time `now`.
    ///
    /// If an error is returned, everything recorded in `outbox` is discarded.
    fn handle(&mut self, now: Duration, input: Input, outbox: &mut Outbox)
        -> Result<(), HandlerError>;

    /// Serialize the observable state of the handler (collected at the end of a run).
    fn snapshot(&self) -> Bytes {
        Bytes::new()
    }
}

impl<F> Handler for F
where
    F: FnMut(Duration, Input, &mut Outbox) -> Result<(), HandlerError> + Send + 'static,
{
    fn handle(
        &mut self,
        now: Duration,
        input: Input,
        outbox: &mut Outbox,
    ) -> Result<(), HandlerError> {
        (self)(now, input, outbox)
    }
}

/// Reason a node failed to handle an input.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FaultKind {
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("handler did not return within {0:?}")]
    Stalled(Duration),
    #[error("handler panicked")]
    Panicked,
}

/// A failure confined to a single node.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("node {node} faulted at {at:?}: {kind}")]
pub struct Fault {
    pub node: NodeId,
    pub at: Duration,
    pub kind: FaultKind,
}

enum Request {
    Handle(Duration, Input),
    Snapshot,
}

enum Response {
    Handled(Result<Outbox, HandlerError>),
    Snapshot(Bytes),
}

/// Handler running on its own thread.
struct Worker {
    requests: mpsc::Sender<Request>,
    responses: mpsc::Receiver<Response>,
    limit: Duration,
}

impl Worker {
    fn spawn(id: &NodeId, mut handler: Box<dyn Handler>, limit: Duration) -> Self {
        let (requests, request_receiver) = mpsc::channel::<Request>();
        let (response_sender, responses) = mpsc::channel();
        let name = format!("node-{id}");
        let spawned = thread::Builder::new().name(name).spawn(move || {
            while let Ok(request) = request_receiver.recv() {
                let response = match request {
                    Request::Handle(now, input) => {
                        let mut outbox = Outbox::new();
                        Response::Handled(
                            handler.handle(now, input, &mut outbox).map(|_| outbox),
                        )
                    }
                    Request::Snapshot => Response::Snapshot(handler.snapshot()),
                };

                // This can only fail if the node was abandoned after a timeout.
                if response_sender.send(response).is_err() {
                    return;
                }
            }
        });

        // If the thread could not be created, the receiver is dropped with the closure and
        // the first invocation reports the node as panicked.
        if let Err(err) = spawned {
            warn!(node = %id, ?err, "failed to spawn node worker");
        }
        Self {
            requests,
            responses,
            limit,
        }
    }
}

enum Host {
    Inline(Box<dyn Handler>),
    Worker(Worker),
    Stalled,
}

/// A node in a running simulation.
pub(crate) struct Node {
    id: NodeId,
    host: Host,
    sequence: u64,
}

impl Node {
    /// Host `handler`, on its own thread if a watchdog limit is provided.
    pub(crate) fn new(id: NodeId, handler: Box<dyn Handler>, watchdog: Option<Duration>) -> Self {
        let host = match watchdog {
            Some(limit) => Host::Worker(Worker::spawn(&id, handler, limit)),
            None => Host::Inline(handler),
        };
        Self {
            id,
            host,
            sequence: 0,
        }
    }

    pub(crate) fn is_stalled(&self) -> bool {
        matches!(self.host, Host::Stalled)
    }

    /// Invoke the handler and stamp the packets it emits.
    ///
    /// Returns the emitted packets and the timers to schedule (as absolute times).
    pub(crate) fn invoke(
        &mut self,
        now: Duration,
        input: Input,
    ) -> Result<(Vec<Packet>, Vec<(Duration, u64)>), FaultKind> {
        let outbox = match &mut self.host {
            Host::Inline(handler) => {
                let mut outbox = Outbox::new();
                handler
                    .handle(now, input, &mut outbox)
                    .map_err(|err| FaultKind::Handler(err.to_string()))?;
                outbox
            }
            Host::Worker(worker) => {
                let limit = worker.limit;
                let result = match worker.requests.send(Request::Handle(now, input)) {
                    Ok(()) => worker.responses.recv_timeout(limit),
                    Err(_) => Err(mpsc::RecvTimeoutError::Disconnected),
                };
                match result {
                    Ok(Response::Handled(Ok(outbox))) => outbox,
                    Ok(Response::Handled(Err(err))) => {
                        return Err(FaultKind::Handler(err.to_string()))
                    }
                    Ok(Response::Snapshot(_)) => unreachable!("snapshot response to handle"),
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        // Abandon the worker (it exits once the handler returns)
                        self.host = Host::Stalled;
                        return Err(FaultKind::Stalled(limit));
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        self.host = Host::Stalled;
                        return Err(FaultKind::Panicked);
                    }
                }
            }
            Host::Stalled => unreachable!("invoked stalled node"),
        };

        // Stamp outgoing packets
        let (sends, timers) = outbox.into_parts();
        let mut packets = Vec::with_capacity(sends.len());
        for (dst, payload) in sends {
            packets.push(Packet {
                src: self.id.clone(),
                dst,
                sent_at: now,
                sequence: self.next_sequence(),
                payload,
            });
        }
        let timers = timers
            .into_iter()
            .map(|(after, id)| (now.saturating_add(after), id))
            .collect();
        Ok((packets, timers))
    }

    /// Stamp a packet injected on behalf of this node.
    pub(crate) fn stamp(&mut self, dst: NodeId, sent_at: Duration, payload: Bytes) -> Packet {
        Packet {
            src: self.id.clone(),
            dst,
            sent_at,
            sequence: self.next_sequence(),
            payload,
        }
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    /// Observable state of the handler (empty if the node is stalled).
    pub(crate) fn snapshot(&mut self) -> Bytes {
        match &mut self.host {
            Host::Inline(handler) => handler.snapshot(),
            Host::Worker(worker) => {
                if worker.requests.send(Request::Snapshot).is_err() {
                    return Bytes::new();
                }
                match worker.responses.recv_timeout(worker.limit) {
                    Ok(Response::Snapshot(snapshot)) => snapshot,
                    _ => {
                        debug!(node = %self.id, "failed to collect snapshot");
                        Bytes::new()
                    }
                }
            }
            Host::Stalled => Bytes::new(),
        }
    }
}
