//! Groups queued calls into bundles.

use tracing::debug;

use crate::auth_gate::AuthGate;
use crate::descriptor::OperationDescriptor;
use crate::protocol::{OutboundBundle, PacketId};
use crate::queue::RequestQueue;

/// Default maximum number of calls per bundle.
pub const DEFAULT_MAX_BUNDLE_SIZE: usize = 10;

/// Calls sent together in one round trip.
///
/// Positions matter: the n-th response answers the n-th descriptor.
#[derive(Debug)]
pub struct Bundle {
    packet_id: PacketId,
    pub(crate) descriptors: Vec<OperationDescriptor>,
    elided: usize,
    pub(crate) dispatched: bool,
}

impl Bundle {
    pub fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// An empty bundle must not be transmitted.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Number of heartbeats elided while this bundle was built.
    pub fn elided(&self) -> usize {
        self.elided
    }

    pub fn contains_authenticate(&self) -> bool {
        self.descriptors.iter().any(OperationDescriptor::is_authenticate)
    }

    /// Wire form of this bundle.
    pub fn to_outbound(&self, session_id: Option<&str>) -> OutboundBundle {
        OutboundBundle {
            packet_id: self.packet_id,
            session_id: session_id.map(String::from),
            messages: self.descriptors.iter().map(|d| d.call().clone()).collect(),
        }
    }
}

/// Builds bundles from the queue and numbers them.
#[derive(Debug)]
pub struct Bundler {
    max_bundle_size: usize,
    next_packet_id: PacketId,
}

impl Default for Bundler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUNDLE_SIZE)
    }
}

impl Bundler {
    /// Values below 1 are clamped to 1.
    pub fn new(max_bundle_size: usize) -> Self {
        Self {
            max_bundle_size: max_bundle_size.max(1),
            next_packet_id: 0,
        }
    }

    pub fn max_bundle_size(&self) -> usize {
        self.max_bundle_size
    }

    /// Drain every call the gate permits, in enqueue order, into a bundle.
    ///
    /// Packet ids are only consumed by non-empty bundles. Elided heartbeats
    /// are dropped here without being answered.
    pub fn build_bundle(&mut self, queue: &mut RequestQueue, gate: &mut AuthGate) -> Bundle {
        let drained = queue.drain_for_bundle(gate, self.max_bundle_size);
        let elided = drained.elided.len();
        if elided > 0 {
            debug!(elided, "heartbeats dropped ahead of authentication");
        }

        let packet_id = if drained.ready.is_empty() {
            self.next_packet_id
        } else {
            let id = self.next_packet_id;
            self.next_packet_id += 1;
            id
        };

        Bundle {
            packet_id,
            descriptors: drained.ready,
            elided,
            dispatched: false,
        }
    }
}
