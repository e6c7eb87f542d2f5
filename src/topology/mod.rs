//! Topology store: the shared zone/room graph
//!
//! Readers take cheap `Arc` snapshots. Discovery swaps the whole graph in one
//! write; event deltas copy-on-write into the current graph so snapshots
//! already handed out never change underneath their holder.

pub mod model;

pub use model::{
    clamp_volume, parse_volume, Device, EventSource, Room, ServiceEndpoint, Topology,
    TransportState, Zone,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::bus::{BusEvent, SharedBus};

pub struct TopologyStore {
    current: RwLock<Arc<Topology>>,
    /// Set after a structural zone job, cleared by the next replace
    structural_fence: AtomicBool,
    bus: SharedBus,
}

impl TopologyStore {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            current: RwLock::new(Arc::new(Topology::default())),
            structural_fence: AtomicBool::new(false),
            bus,
        }
    }

    /// Current graph. Safe to hold across awaits; it never changes.
    pub async fn snapshot(&self) -> Arc<Topology> {
        self.current.read().await.clone()
    }

    /// Atomically swaps in a new graph and returns its generation.
    pub async fn replace(&self, mut topology: Topology) -> u64 {
        let mut current = self.current.write().await;
        topology.generation = current.generation + 1;
        let generation = topology.generation;
        let zones = topology.addressable_zones().count();
        *current = Arc::new(topology);
        self.structural_fence.store(false, Ordering::Release);
        drop(current);

        debug!("Topology replaced: generation {} ({} zones)", generation, zones);
        self.bus
            .publish(BusEvent::TopologyReplaced { generation, zones });
        generation
    }

    /// Merges one state variable. Unknown udns are a logged no-op.
    pub async fn apply_state_delta(&self, udn: &str, name: &str, value: &str) -> bool {
        let applied = {
            let mut current = self.current.write().await;
            Arc::make_mut(&mut *current).apply_delta(udn, name, value)
        };
        if applied {
            self.bus.publish(BusEvent::StateChanged {
                udn: udn.to_string(),
                variable: name.to_string(),
                value: value.to_string(),
            });
        } else {
            debug!("Ignoring {}={} for unknown device {}", name, value, udn);
        }
        applied
    }

    /// Claims the structural fence. False if it is already held.
    pub fn try_raise_structural_fence(&self) -> bool {
        self.structural_fence
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases a fence claimed by a job the host rejected.
    pub fn release_structural_fence(&self) {
        self.structural_fence.store(false, Ordering::Release);
    }

    pub fn structural_fence_raised(&self) -> bool {
        self.structural_fence.load(Ordering::Acquire)
    }
}

/// Leveled "topology needs a refresh" signal, read-and-clear.
#[derive(Debug, Default)]
pub struct StaleFlag(AtomicBool);

impl StaleFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns whether the flag was set and clears it.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
