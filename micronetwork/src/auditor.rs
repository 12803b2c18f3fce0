//! Track the dispatches of a simulation for determinism auditing.

use crate::{link::DropReason, node::Packet, topology::NodeId};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Rolling digest over everything a simulation dispatched.
///
/// Two runs that dispatch the same events, in the same order, at the same
/// simulated times end with the same [Auditor::state].
#[derive(Clone, Debug, Default)]
pub struct Auditor {
    hash: Vec<u8>,
}

impl Auditor {
    fn update(&mut self, label: &[u8], at: Duration, fields: &[&[u8]]) {
        let mut hasher = Sha256::new();
        hasher.update(&self.hash);
        hasher.update(label);
        hasher.update(at.as_nanos().to_be_bytes());
        for field in fields {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        self.hash = hasher.finalize().to_vec();
    }

    pub(crate) fn deliver(&mut self, at: Duration, packet: &Packet) {
        self.update(
            b"deliver",
            at,
            &[
                packet.src.as_str().as_bytes(),
                packet.dst.as_str().as_bytes(),
                &packet.sequence.to_be_bytes(),
                &packet.payload,
            ],
        );
    }

    pub(crate) fn drop(&mut self, at: Duration, packet: &Packet, reason: DropReason) {
        self.update(
            b"drop",
            at,
            &[
                packet.src.as_str().as_bytes(),
                packet.dst.as_str().as_bytes(),
                &packet.sequence.to_be_bytes(),
                reason.as_str().as_bytes(),
            ],
        );
    }

    pub(crate) fn timer(&mut self, at: Duration, node: &NodeId, id: u64) {
        self.update(b"timer", at, &[node.as_str().as_bytes(), &id.to_be_bytes()]);
    }

    pub(crate) fn partition(
        &mut self,
        at: Duration,
        src: &NodeId,
        dst: &NodeId,
        partitioned: bool,
    ) {
        self.update(
            b"partition",
            at,
            &[
                src.as_str().as_bytes(),
                dst.as_str().as_bytes(),
                &[partitioned as u8],
            ],
        );
    }

    pub(crate) fn fault(&mut self, at: Duration, node: &NodeId) {
        self.update(b"fault", at, &[node.as_str().as_bytes()]);
    }

    /// Generate a representation of the current state of the simulation.
    ///
    /// This can be used to ensure that logic running on top
    /// of the simulator is interacting deterministically.
    pub fn state(&self) -> String {
        hex(&self.hash)
    }
}

/// Encode bytes as lowercase hex.
fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
