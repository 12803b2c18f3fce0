//! Handlers for common node behaviors.

use crate::{
    node::{Handler, HandlerError, Input, Outbox},
    topology::NodeId,
};
use bytes::Bytes;
use std::{collections::BTreeSet, time::Duration};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed pong (expected 8 bytes, got {0})")]
    MalformedPong(usize),
    #[error("pong from unexpected node: {0}")]
    UnexpectedPeer(NodeId),
    #[error("pong from the future")]
    PongFromFuture,
}

/// Returns every packet to its sender.
#[derive(Clone, Debug, Default)]
pub struct Echo {
    echoed: u64,
}

impl Echo {
    pub fn echoed(&self) -> u64 {
        self.echoed
    }
}

impl Handler for Echo {
    fn handle(
        &mut self,
        _now: Duration,
        input: Input,
        outbox: &mut Outbox,
    ) -> Result<(), HandlerError> {
        if let Input::Packet(packet) = input {
            outbox.send(packet.src, packet.payload);
            self.echoed += 1;
        }
        Ok(())
    }

    fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.echoed.to_be_bytes())
    }
}

/// Periodically pings a peer and measures round-trip times.
///
/// Each ping carries the simulated time it was sent at (in nanoseconds, big-endian),
/// which the peer is expected to echo back. Pinging starts when [Pinger::TIMER] fires.
#[derive(Clone, Debug)]
pub struct Pinger {
    peer: NodeId,
    count: u64,
    interval: Duration,

    sent: u64,
    rtts: Vec<Duration>,
}

impl Pinger {
    /// Timer that triggers the next ping.
    pub const TIMER: u64 = 0;

    pub fn new(peer: impl Into<NodeId>, count: u64, interval: Duration) -> Self {
        Self {
            peer: peer.into(),
            count,
            interval,
            sent: 0,
            rtts: Vec::new(),
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Round-trip times of every pong received so far.
    pub fn rtts(&self) -> &[Duration] {
        &self.rtts
    }
}

impl Handler for Pinger {
    fn handle(
        &mut self,
        now: Duration,
        input: Input,
        outbox: &mut Outbox,
    ) -> Result<(), HandlerError> {
        match input {
            Input::Timer(Self::TIMER) => {
                if self.sent >= self.count {
                    return Ok(());
                }
                let stamp = u64::try_from(now.as_nanos()).unwrap_or(u64::MAX);
                outbox.send(self.peer.clone(), stamp.to_be_bytes().to_vec());
                self.sent += 1;
                if self.sent < self.count {
                    outbox.timer(self.interval, Self::TIMER);
                }
            }
            Input::Timer(id) => debug!(id, "ignoring unknown timer"),
            Input::Packet(packet) => {
                if packet.src != self.peer {
                    return Err(Error::UnexpectedPeer(packet.src).into());
                }
                let stamp: [u8; 8] = packet
                    .payload
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::MalformedPong(packet.payload.len()))?;
                let sent_at = Duration::from_nanos(u64::from_be_bytes(stamp));
                let rtt = now.checked_sub(sent_at).ok_or(Error::PongFromFuture)?;
                self.rtts.push(rtt);
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Bytes {
        let mut snapshot = Vec::with_capacity(8 * (self.rtts.len() + 1));
        snapshot.extend_from_slice(&self.sent.to_be_bytes());
        for rtt in &self.rtts {
            let nanos = u64::try_from(rtt.as_nanos()).unwrap_or(u64::MAX);
            snapshot.extend_from_slice(&nanos.to_be_bytes());
        }
        snapshot.into()
    }
}

/// Forwards every payload it has not seen before to all of its peers (except the sender).
#[derive(Clone, Debug)]
pub struct Gossip {
    peers: Vec<NodeId>,
    seen: BTreeSet<Bytes>,
}

impl Gossip {
    pub fn new<I, P>(peers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<NodeId>,
    {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
            seen: BTreeSet::new(),
        }
    }

    pub fn seen(&self) -> impl Iterator<Item = &Bytes> {
        self.seen.iter()
    }
}

impl Handler for Gossip {
    fn handle(
        &mut self,
        _now: Duration,
        input: Input,
        outbox: &mut Outbox,
    ) -> Result<(), HandlerError> {
        let Input::Packet(packet) = input else {
            return Ok(());
        };
        if !self.seen.insert(packet.payload.clone()) {
            return Ok(());
        }
        for peer in &self.peers {
            if *peer == packet.src {
                continue;
            }
            outbox.send(peer.clone(), packet.payload.clone());
        }
        Ok(())
    }

    fn snapshot(&self) -> Bytes {
        let mut snapshot = Vec::new();
        for payload in &self.seen {
            snapshot.extend_from_slice(&(payload.len() as u64).to_be_bytes());
            snapshot.extend_from_slice(payload);
        }
        snapshot.into()
    }
}
