//! Sequential Fill placement
//!
//! Candidates of the required mode are taken in ascending priority order and
//! the first one that is not FULL and has room for the request wins. Filling
//! nodes one after another keeps the rest of the pool empty for large
//! files and makes placement deterministic.

use crate::directory::{CapacityDirectory, DirectorySnapshot, DirectoryTier};
use archivum_common::{
    CapacityStatus, Clock, Error, NodeId, Result, RetentionPolicy, StorageMode,
    StorageNodeDescriptor,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a placement decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub node_id: NodeId,
    pub descriptor: StorageNodeDescriptor,
    /// Tier the deciding snapshot came from
    pub tier: DirectoryTier,
}

impl Placement {
    /// Degradation notice when the decision was made on fallback data
    #[must_use]
    pub fn degraded(&self) -> Option<Error> {
        (self.tier != DirectoryTier::Live).then(|| Error::StaleDirectoryData {
            tier: self.tier.to_string(),
        })
    }
}

/// Chooses target nodes from the capacity directory
pub struct StorageSelector {
    directory: Arc<dyn CapacityDirectory>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    /// Nodes this process can write to; `None` means any
    local: Option<HashSet<NodeId>>,
}

impl StorageSelector {
    pub fn new(directory: Arc<dyn CapacityDirectory>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            directory,
            clock,
            ttl,
            local: None,
        }
    }

    /// Only place on the given nodes
    #[must_use]
    pub fn restricted_to(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.local = Some(nodes.into_iter().collect());
        self
    }

    /// Place `size` bytes on a node in `mode`
    pub async fn select(&self, mode: StorageMode, size: u64) -> Result<Placement> {
        self.select_excluding(mode, size, None).await
    }

    /// Place `size` bytes for a file with retention `policy`
    pub async fn select_for_policy(&self, policy: RetentionPolicy, size: u64) -> Result<Placement> {
        self.select(policy.required_mode(), size).await
    }

    /// Place `size` bytes in `mode`, never on `exclude`
    pub async fn select_excluding(
        &self,
        mode: StorageMode,
        size: u64,
        exclude: Option<&NodeId>,
    ) -> Result<Placement> {
        let snapshot = self.directory.snapshot().await?;
        let eligible = |d: &StorageNodeDescriptor| {
            exclude != Some(&d.node_id)
                && self.local.as_ref().is_none_or(|local| local.contains(&d.node_id))
        };
        let placement = select_from(&snapshot, mode, size, eligible, self.clock.now(), self.ttl)?;

        if let Some(notice) = placement.degraded() {
            warn!(node_id = %placement.node_id, %mode, size, "Placement decided on degraded data: {notice}");
        } else {
            debug!(node_id = %placement.node_id, %mode, size, "Placement decided");
        }
        Ok(placement)
    }
}

/// Sequential Fill over one snapshot
pub fn select_from(
    snapshot: &DirectorySnapshot,
    mode: StorageMode,
    size: u64,
    eligible: impl Fn(&StorageNodeDescriptor) -> bool,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<Placement> {
    snapshot
        .view(mode, now, ttl)
        .into_iter()
        .filter(|d| eligible(d))
        .find(|d| d.status != CapacityStatus::Full && d.capacity.free >= size)
        .map(|d| Placement {
            node_id: d.node_id.clone(),
            descriptor: d.clone(),
            tier: snapshot.tier,
        })
        .ok_or(Error::CapacityExhausted { mode, size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, Reservation, descriptor};
    use archivum_common::{GB, ManualClock, TB};

    fn snapshot(nodes: Vec<StorageNodeDescriptor>) -> DirectorySnapshot {
        DirectorySnapshot {
            nodes,
            taken_at: Utc::now(),
            tier: DirectoryTier::Live,
        }
    }

    fn pick(snap: &DirectorySnapshot, mode: StorageMode, size: u64) -> Result<Placement> {
        select_from(snap, mode, size, |_| true, Utc::now(), Duration::seconds(90))
    }

    #[test]
    fn test_lowest_priority_eligible_node_wins() {
        let snap = snapshot(vec![
            descriptor("tmp-03", StorageMode::TemporaryCrud, 3, TB, 0),
            descriptor("tmp-01", StorageMode::TemporaryCrud, 1, TB, 0),
            descriptor("tmp-02", StorageMode::TemporaryCrud, 2, TB, 0),
            descriptor("perm-00", StorageMode::PermanentAppendOnly, 0, TB, 0),
        ]);
        let placement = pick(&snap, StorageMode::TemporaryCrud, 10 * GB).unwrap();
        assert_eq!(placement.node_id.as_str(), "tmp-01");
        assert!(placement.degraded().is_none());
    }

    #[test]
    fn test_full_node_is_never_selected() {
        let mut full = descriptor("tmp-01", StorageMode::TemporaryCrud, 1, TB, 0);
        // Reports FULL even though it claims free space
        full.status = CapacityStatus::Full;
        let snap = snapshot(vec![
            full,
            descriptor("tmp-02", StorageMode::TemporaryCrud, 2, TB, 0),
        ]);
        let placement = pick(&snap, StorageMode::TemporaryCrud, GB).unwrap();
        assert_eq!(placement.node_id.as_str(), "tmp-02");
    }

    #[test]
    fn test_insufficient_space_falls_through() {
        let snap = snapshot(vec![
            descriptor("tmp-01", StorageMode::TemporaryCrud, 1, TB, TB - 500 * GB),
            descriptor("tmp-02", StorageMode::TemporaryCrud, 2, TB, 0),
        ]);
        assert_eq!(
            pick(&snap, StorageMode::TemporaryCrud, 600 * GB)
                .unwrap()
                .node_id
                .as_str(),
            "tmp-02"
        );
        assert_eq!(
            pick(&snap, StorageMode::TemporaryCrud, 400 * GB)
                .unwrap()
                .node_id
                .as_str(),
            "tmp-01"
        );
    }

    #[test]
    fn test_no_candidate_is_capacity_exhausted() {
        let snap = snapshot(vec![descriptor(
            "tmp-01",
            StorageMode::TemporaryCrud,
            1,
            TB,
            0,
        )]);
        let err = pick(&snap, StorageMode::PermanentAppendOnly, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExhausted {
                mode: StorageMode::PermanentAppendOnly,
                size: 1
            }
        ));
    }

    #[test]
    fn test_excluded_node_is_skipped() {
        let snap = snapshot(vec![
            descriptor("perm-01", StorageMode::PermanentAppendOnly, 1, TB, 0),
            descriptor("perm-02", StorageMode::PermanentAppendOnly, 2, TB, 0),
        ]);
        let placement = select_from(
            &snap,
            StorageMode::PermanentAppendOnly,
            1,
            |d| d.node_id.as_str() != "perm-01",
            Utc::now(),
            Duration::seconds(90),
        )
        .unwrap();
        assert_eq!(placement.node_id.as_str(), "perm-02");
    }

    #[tokio::test]
    async fn test_silent_node_excluded_despite_ok_status() {
        let clock = ManualClock::shared();
        let directory = Arc::new(MemoryDirectory::new(clock.clone()));
        let selector = StorageSelector::new(directory.clone(), clock.clone(), Duration::seconds(90));

        directory
            .heartbeat(descriptor("tmp-01", StorageMode::TemporaryCrud, 1, TB, 0))
            .await
            .unwrap();
        directory
            .heartbeat(descriptor("tmp-02", StorageMode::TemporaryCrud, 2, TB, 0))
            .await
            .unwrap();
        assert_eq!(
            selector
                .select(StorageMode::TemporaryCrud, GB)
                .await
                .unwrap()
                .node_id
                .as_str(),
            "tmp-01"
        );

        // Three missed 30s heartbeats from tmp-01
        for _ in 0..3 {
            clock.advance(Duration::seconds(31));
            directory
                .heartbeat(descriptor("tmp-02", StorageMode::TemporaryCrud, 2, TB, 0))
                .await
                .unwrap();
        }
        let placement = selector
            .select_for_policy(RetentionPolicy::Temporary, GB)
            .await
            .unwrap();
        assert_eq!(placement.node_id.as_str(), "tmp-02");
    }

    #[tokio::test]
    async fn test_reservations_steer_concurrent_placements() {
        let clock = ManualClock::shared();
        let directory = Arc::new(MemoryDirectory::new(clock.clone()));
        let selector = StorageSelector::new(directory.clone(), clock, Duration::seconds(90));
        directory
            .heartbeat(descriptor("tmp-01", StorageMode::TemporaryCrud, 1, TB, 0))
            .await
            .unwrap();
        directory
            .heartbeat(descriptor("tmp-02", StorageMode::TemporaryCrud, 2, TB, 0))
            .await
            .unwrap();

        directory
            .reserve(Reservation {
                id: "first".into(),
                node_id: NodeId::new("tmp-01"),
                bytes: 900 * GB,
            })
            .await
            .unwrap();
        let placement = selector
            .select(StorageMode::TemporaryCrud, 200 * GB)
            .await
            .unwrap();
        assert_eq!(placement.node_id.as_str(), "tmp-02");
    }

    #[tokio::test]
    async fn test_restricted_selector_ignores_foreign_nodes() {
        let clock = ManualClock::shared();
        let directory = Arc::new(MemoryDirectory::new(clock.clone()));
        directory
            .heartbeat(descriptor("remote-01", StorageMode::TemporaryCrud, 0, TB, 0))
            .await
            .unwrap();
        directory
            .heartbeat(descriptor("tmp-01", StorageMode::TemporaryCrud, 5, TB, 0))
            .await
            .unwrap();

        let selector = StorageSelector::new(directory, clock, Duration::seconds(90))
            .restricted_to([NodeId::new("tmp-01")]);
        let placement = selector.select(StorageMode::TemporaryCrud, GB).await.unwrap();
        assert_eq!(placement.node_id.as_str(), "tmp-01");
    }
}
