//! Three-tier directory sourcing
//!
//! Snapshots come from the live directory when it answers, otherwise from
//! the last known good snapshot while it is within its staleness bound,
//! otherwise from static configuration. Every tier change is logged and
//! published on a watch channel so degraded sourcing is always visible.

use crate::directory::{
    CapacityDirectory, DirectorySnapshot, DirectoryTier, HeartbeatAck, Reservation, hold_capacity,
};
use archivum_common::config::StaticNodeConfig;
use archivum_common::{Clock, Error, NodeId, Result, StorageNodeDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Health of directory sourcing
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DirectoryHealth {
    pub tier: DirectoryTier,
    /// When the current tier was entered
    pub since: DateTime<Utc>,
    /// Most recent live-directory failure while degraded
    pub last_error: Option<String>,
}

impl DirectoryHealth {
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.tier != DirectoryTier::Live
    }
}

/// Directory that falls back from live to cached to static sourcing
pub struct FallbackDirectory {
    live: Arc<dyn CapacityDirectory>,
    static_nodes: Vec<StaticNodeConfig>,
    max_staleness: Duration,
    clock: Arc<dyn Clock>,
    cached: RwLock<Option<DirectorySnapshot>>,
    /// Reservations accepted while the live directory was unreachable
    local_holds: Mutex<HashMap<String, Reservation>>,
    health: watch::Sender<DirectoryHealth>,
}

impl FallbackDirectory {
    pub fn new(
        live: Arc<dyn CapacityDirectory>,
        static_nodes: Vec<StaticNodeConfig>,
        max_staleness: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (health, _) = watch::channel(DirectoryHealth {
            tier: DirectoryTier::Live,
            since: clock.now(),
            last_error: None,
        });
        Self {
            live,
            static_nodes,
            max_staleness,
            clock,
            cached: RwLock::new(None),
            local_holds: Mutex::new(HashMap::new()),
            health,
        }
    }

    /// Current sourcing health
    #[must_use]
    pub fn health(&self) -> DirectoryHealth {
        self.health.borrow().clone()
    }

    /// Watch sourcing health changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DirectoryHealth> {
        self.health.subscribe()
    }

    fn enter(&self, tier: DirectoryTier, error: Option<&Error>) {
        let now = self.clock.now();
        let last_error = error.map(ToString::to_string);
        self.health.send_if_modified(|health| {
            if health.tier == tier {
                if last_error.is_some() && health.last_error != last_error {
                    health.last_error = last_error.clone();
                    return true;
                }
                return false;
            }

            let from = health.tier;
            if tier == DirectoryTier::Live {
                info!(from = %from, "Capacity directory recovered, serving live data");
            } else {
                let degraded = Error::StaleDirectoryData {
                    tier: tier.to_string(),
                };
                warn!(
                    from = %from,
                    to = %tier,
                    live = self.live.name(),
                    error = last_error.as_deref().unwrap_or(""),
                    "{degraded}"
                );
            }
            *health = DirectoryHealth {
                tier,
                since: now,
                last_error: last_error.clone(),
            };
            true
        });
    }

    fn static_snapshot(&self, now: DateTime<Utc>) -> DirectorySnapshot {
        DirectorySnapshot {
            nodes: self
                .static_nodes
                .iter()
                .map(|n| {
                    let mut d = n.descriptor(now);
                    hold_capacity(&mut d, 0);
                    d
                })
                .collect(),
            taken_at: now,
            tier: DirectoryTier::Static,
        }
    }

    fn local_hold_totals(&self) -> HashMap<NodeId, u64> {
        let mut holds: HashMap<NodeId, u64> = HashMap::new();
        for r in self.local_holds.lock().values() {
            *holds.entry(r.node_id.clone()).or_default() += r.bytes;
        }
        holds
    }
}

#[async_trait]
impl CapacityDirectory for FallbackDirectory {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn heartbeat(&self, descriptor: StorageNodeDescriptor) -> Result<HeartbeatAck> {
        self.live.heartbeat(descriptor).await
    }

    async fn snapshot(&self) -> Result<DirectorySnapshot> {
        let error = match self.live.snapshot().await {
            Ok(mut snapshot) => {
                *self.cached.write() = Some(snapshot.clone());
                self.enter(DirectoryTier::Live, None);
                snapshot.apply_holds(&self.local_hold_totals());
                return Ok(snapshot);
            }
            Err(e) => e,
        };

        let now = self.clock.now();
        let cached = self
            .cached
            .read()
            .clone()
            .filter(|s| now.signed_duration_since(s.taken_at) <= self.max_staleness);

        let mut snapshot = if let Some(mut cached) = cached {
            cached.tier = DirectoryTier::Cached;
            self.enter(DirectoryTier::Cached, Some(&error));
            cached
        } else if !self.static_nodes.is_empty() {
            self.enter(DirectoryTier::Static, Some(&error));
            self.static_snapshot(now)
        } else {
            return Err(Error::DirectoryUnavailable(format!(
                "live directory failed ({error}) and no fallback is available"
            )));
        };
        snapshot.apply_holds(&self.local_hold_totals());
        Ok(snapshot)
    }

    async fn reserve(&self, reservation: Reservation) -> Result<()> {
        match self.live.reserve(reservation.clone()).await {
            Ok(()) => {
                self.local_holds.lock().remove(&reservation.id);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    reservation = %reservation.id,
                    node_id = %reservation.node_id,
                    error = %e,
                    "Live directory unreachable, holding reservation locally"
                );
                self.local_holds
                    .lock()
                    .insert(reservation.id.clone(), reservation);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn release(&self, reservation_id: &str) -> Result<bool> {
        let local = self.local_holds.lock().remove(reservation_id).is_some();
        match self.live.release(reservation_id).await {
            Ok(released) => Ok(released || local),
            Err(_) if local => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn publish(
        &self,
        descriptor: StorageNodeDescriptor,
        settles: Option<&str>,
    ) -> Result<HeartbeatAck> {
        let ack = self.live.publish(descriptor, settles).await?;
        if let Some(id) = settles {
            self.local_holds.lock().remove(id);
        }
        Ok(ack)
    }
}
