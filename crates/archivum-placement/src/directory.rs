//! Capacity directory
//!
//! A map from node id to the descriptor that node last published. Entries
//! are kept current by heartbeats and become stale after the TTL. The
//! directory is eventually consistent: placement only needs bounded
//! staleness. Reservations hold capacity between placement and the node's
//! next publication so concurrent placements do not oversubscribe a node.

use crate::thresholds::CapacityThresholds;
use archivum_common::{
    Clock, Error, NodeId, Result, StorageMode, StorageNodeDescriptor,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use derive_more::Display;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Where a snapshot was sourced from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryTier {
    /// The live directory answered
    #[display("live")]
    Live,
    /// Last known good snapshot, within its staleness bound
    #[display("cached")]
    Cached,
    /// Static configuration, the emergency floor
    #[display("static")]
    Static,
}

/// Acknowledgement of a heartbeat
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub node_id: NodeId,
    pub received_at: DateTime<Utc>,
}

/// Capacity held on a node for an in-flight operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Caller-chosen id; replaying a reservation with the same id is a no-op
    pub id: String,
    pub node_id: NodeId,
    pub bytes: u64,
}

/// Point-in-time view of all known nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub nodes: Vec<StorageNodeDescriptor>,
    pub taken_at: DateTime<Utc>,
    pub tier: DirectoryTier,
}

impl DirectorySnapshot {
    /// Fresh nodes in `mode`, ordered by priority.
    ///
    /// Staleness is judged against `now` for live data and against the
    /// capture time for cached data. Static entries never go stale.
    #[must_use]
    pub fn view(
        &self,
        mode: StorageMode,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Vec<&StorageNodeDescriptor> {
        let reference = match self.tier {
            DirectoryTier::Live => Some(now),
            DirectoryTier::Cached => Some(self.taken_at),
            DirectoryTier::Static => None,
        };
        let mut nodes: Vec<_> = self
            .nodes
            .iter()
            .filter(|d| d.mode == mode)
            .filter(|d| reference.is_none_or(|at| !d.is_stale(at, ttl)))
            .collect();
        nodes.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        nodes
    }

    /// Descriptor of one node, stale or not
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&StorageNodeDescriptor> {
        self.nodes.iter().find(|d| &d.node_id == node_id)
    }

    /// Apply held reservations to the published capacities
    pub(crate) fn apply_holds(&mut self, holds: &HashMap<NodeId, u64>) {
        for node in &mut self.nodes {
            if let Some(&held) = holds.get(&node.node_id) {
                hold_capacity(node, held);
            }
        }
    }
}

/// Interface to the directory, whatever backs it
#[async_trait]
pub trait CapacityDirectory: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Record a node's descriptor
    async fn heartbeat(&self, descriptor: StorageNodeDescriptor) -> Result<HeartbeatAck>;

    /// Current view of all nodes, with reservations applied
    async fn snapshot(&self) -> Result<DirectorySnapshot>;

    /// Hold capacity on a node. Idempotent per reservation id.
    async fn reserve(&self, reservation: Reservation) -> Result<()>;

    /// Drop a reservation. Returns whether it existed.
    async fn release(&self, reservation_id: &str) -> Result<bool>;

    /// Publish a fresh descriptor and settle the reservation it accounts for
    async fn publish(
        &self,
        descriptor: StorageNodeDescriptor,
        settles: Option<&str>,
    ) -> Result<HeartbeatAck> {
        let ack = self.heartbeat(descriptor).await?;
        if let Some(id) = settles {
            self.release(id).await?;
        }
        Ok(ack)
    }
}

#[derive(Default)]
struct DirectoryState {
    nodes: BTreeMap<NodeId, StorageNodeDescriptor>,
    reservations: HashMap<String, Reservation>,
}

impl DirectoryState {
    fn holds(&self) -> HashMap<NodeId, u64> {
        let mut holds: HashMap<NodeId, u64> = HashMap::new();
        for r in self.reservations.values() {
            *holds.entry(r.node_id.clone()).or_default() += r.bytes;
        }
        holds
    }

    fn record(&mut self, mut descriptor: StorageNodeDescriptor, now: DateTime<Utc>) -> HeartbeatAck {
        // Receipt time, so node clock skew cannot extend an entry's life
        descriptor.last_heartbeat = now;
        let node_id = descriptor.node_id.clone();
        self.nodes.insert(node_id.clone(), descriptor);
        HeartbeatAck {
            node_id,
            received_at: now,
        }
    }
}

/// In-process directory; the authoritative instance served by a daemon
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
    clock: Arc<dyn Clock>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(DirectoryState::default()),
            clock,
        }
    }

    /// Number of outstanding reservations
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.state.lock().reservations.len()
    }

    /// Bytes currently reserved on `node_id`
    #[must_use]
    pub fn reserved_on(&self, node_id: &NodeId) -> u64 {
        self.state
            .lock()
            .reservations
            .values()
            .filter(|r| &r.node_id == node_id)
            .map(|r| r.bytes)
            .sum()
    }
}

#[async_trait]
impl CapacityDirectory for MemoryDirectory {
    fn name(&self) -> &str {
        "memory"
    }

    async fn heartbeat(&self, descriptor: StorageNodeDescriptor) -> Result<HeartbeatAck> {
        let now = self.clock.now();
        Ok(self.state.lock().record(descriptor, now))
    }

    async fn snapshot(&self) -> Result<DirectorySnapshot> {
        let state = self.state.lock();
        let mut snapshot = DirectorySnapshot {
            nodes: state.nodes.values().cloned().collect(),
            taken_at: self.clock.now(),
            tier: DirectoryTier::Live,
        };
        snapshot.apply_holds(&state.holds());
        Ok(snapshot)
    }

    async fn reserve(&self, reservation: Reservation) -> Result<()> {
        let mut state = self.state.lock();
        if state.reservations.contains_key(&reservation.id) {
            return Ok(());
        }
        let node = state
            .nodes
            .get(&reservation.node_id)
            .ok_or_else(|| Error::NodeNotFound(reservation.node_id.clone()))?;

        let held = state.holds().get(&node.node_id).copied().unwrap_or(0);
        let free = node.capacity.with_held(held).free;
        if reservation.bytes > free {
            return Err(Error::CapacityExhausted {
                mode: node.mode,
                size: reservation.bytes,
            });
        }

        debug!(
            reservation = %reservation.id,
            node_id = %reservation.node_id,
            bytes = reservation.bytes,
            "Reserved capacity"
        );
        state.reservations.insert(reservation.id.clone(), reservation);
        Ok(())
    }

    async fn release(&self, reservation_id: &str) -> Result<bool> {
        Ok(self.state.lock().reservations.remove(reservation_id).is_some())
    }

    async fn publish(
        &self,
        descriptor: StorageNodeDescriptor,
        settles: Option<&str>,
    ) -> Result<HeartbeatAck> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(id) = settles {
            state.reservations.remove(id);
        }
        Ok(state.record(descriptor, now))
    }
}

/// Reduce a descriptor's free space by `held` bytes and re-derive its status
pub(crate) fn hold_capacity(node: &mut StorageNodeDescriptor, held: u64) {
    node.capacity = node.capacity.with_held(held);
    let derived = CapacityThresholds::for_total(node.capacity.total).status_for(node.capacity.free);
    node.status = node.status.max(derived);
}

#[cfg(test)]
pub(crate) fn descriptor(
    id: &str,
    mode: StorageMode,
    priority: u32,
    total: u64,
    used: u64,
) -> StorageNodeDescriptor {
    use archivum_common::Capacity;

    let capacity = Capacity::from_usage(total, used);
    StorageNodeDescriptor {
        node_id: NodeId::new(id),
        mode,
        capacity,
        status: CapacityThresholds::for_total(total).status_for(capacity.free),
        priority,
        last_heartbeat: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivum_common::{CapacityStatus, ManualClock, TB};

    #[tokio::test]
    async fn test_reservations_reduce_free_space() {
        let clock = ManualClock::shared();
        let dir = MemoryDirectory::new(clock);
        dir.heartbeat(descriptor("tmp-01", StorageMode::TemporaryCrud, 1, TB, 0))
            .await
            .unwrap();

        let r = Reservation {
            id: "saga-1".into(),
            node_id: NodeId::new("tmp-01"),
            bytes: 400 * archivum_common::GB,
        };
        dir.reserve(r.clone()).await.unwrap();
        // Replays do not double-reserve
        dir.reserve(r).await.unwrap();
        assert_eq!(dir.reservation_count(), 1);

        let snap = dir.snapshot().await.unwrap();
        let node = snap.node(&NodeId::new("tmp-01")).unwrap();
        assert_eq!(node.capacity.free, 600 * archivum_common::GB);

        assert!(dir.release("saga-1").await.unwrap());
        assert!(!dir.release("saga-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reserve_beyond_free_space_fails() {
        let dir = MemoryDirectory::new(ManualClock::shared());
        dir.heartbeat(descriptor("tmp-01", StorageMode::TemporaryCrud, 1, 1000, 900))
            .await
            .unwrap();

        let err = dir
            .reserve(Reservation {
                id: "big".into(),
                node_id: NodeId::new("tmp-01"),
                bytes: 101,
            })
            .await
            .unwrap_err();
        assert!(err.is_capacity_exhausted());

        let err = dir
            .reserve(Reservation {
                id: "nowhere".into(),
                node_id: NodeId::new("missing"),
                bytes: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_publish_settles_reservation() {
        let dir = MemoryDirectory::new(ManualClock::shared());
        dir.heartbeat(descriptor("tmp-01", StorageMode::TemporaryCrud, 1, TB, 0))
            .await
            .unwrap();
        dir.reserve(Reservation {
            id: "saga-2".into(),
            node_id: NodeId::new("tmp-01"),
            bytes: 10,
        })
        .await
        .unwrap();

        dir.publish(
            descriptor("tmp-01", StorageMode::TemporaryCrud, 1, TB, 10),
            Some("saga-2"),
        )
        .await
        .unwrap();
        assert_eq!(dir.reserved_on(&NodeId::new("tmp-01")), 0);
        let snap = dir.snapshot().await.unwrap();
        assert_eq!(snap.nodes[0].capacity.used, 10);
    }

    #[tokio::test]
    async fn test_view_excludes_stale_and_orders_by_priority() {
        let clock = ManualClock::shared();
        let dir = MemoryDirectory::new(clock.clone());
        let ttl = Duration::seconds(90);

        dir.heartbeat(descriptor("tmp-b", StorageMode::TemporaryCrud, 2, TB, 0))
            .await
            .unwrap();
        dir.heartbeat(descriptor("tmp-a", StorageMode::TemporaryCrud, 1, TB, 0))
            .await
            .unwrap();
        dir.heartbeat(descriptor("perm-a", StorageMode::PermanentAppendOnly, 1, TB, 0))
            .await
            .unwrap();

        let snap = dir.snapshot().await.unwrap();
        let ids: Vec<_> = snap
            .view(StorageMode::TemporaryCrud, clock.now(), ttl)
            .iter()
            .map(|d| d.node_id.to_string())
            .collect();
        assert_eq!(ids, ["tmp-a", "tmp-b"]);

        // tmp-a keeps heartbeating, tmp-b goes silent for three intervals
        clock.advance(Duration::seconds(61));
        dir.heartbeat(descriptor("tmp-a", StorageMode::TemporaryCrud, 1, TB, 0))
            .await
            .unwrap();
        clock.advance(Duration::seconds(30));

        let snap = dir.snapshot().await.unwrap();
        let view = snap.view(StorageMode::TemporaryCrud, clock.now(), ttl);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].node_id.as_str(), "tmp-a");
        // Still reported OK, but excluded anyway
        assert_eq!(
            snap.node(&NodeId::new("tmp-b")).unwrap().status,
            CapacityStatus::Ok
        );
    }

    #[test]
    fn test_holding_capacity_can_escalate_status() {
        let mut node = descriptor("tmp-01", StorageMode::TemporaryCrud, 1, TB, 0);
        hold_capacity(&mut node, 990 * archivum_common::GB);
        assert_eq!(node.status, CapacityStatus::Full);
    }
}
