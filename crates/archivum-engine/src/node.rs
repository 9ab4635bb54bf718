//! Storage nodes hosted by this process

use archivum_common::config::{AttributeConfig, LocalNodeConfig};
use archivum_common::{
    Capacity, Error, NodeId, Result, StorageMode, StorageNodeDescriptor,
};
use archivum_placement::CapacityThresholds;
use archivum_storage::{AttributeStore, BlobStore, OverflowStore};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One storage node: file bytes plus their attribute records
pub struct StorageNode {
    pub id: NodeId,
    pub mode: StorageMode,
    pub total_capacity: u64,
    pub priority: u32,
    pub blobs: BlobStore,
    pub attributes: AttributeStore,
}

impl StorageNode {
    /// Open the node rooted at `config.root`
    pub async fn open(
        config: &LocalNodeConfig,
        overflow: Arc<dyn OverflowStore>,
        attributes: &AttributeConfig,
    ) -> Result<Self> {
        let blobs = BlobStore::open(config.root.join("blobs")).await?;
        let attributes = AttributeStore::open(
            config.root.join("attributes"),
            config.node_id.clone(),
            overflow,
            attributes,
        )?;
        Ok(Self {
            id: config.node_id.clone(),
            mode: config.mode,
            total_capacity: config.total_capacity,
            priority: config.priority,
            blobs,
            attributes,
        })
    }

    /// Descriptor reflecting current usage
    #[must_use]
    pub fn descriptor(&self, now: DateTime<Utc>) -> StorageNodeDescriptor {
        let capacity = Capacity::from_usage(self.total_capacity, self.blobs.used_bytes());
        StorageNodeDescriptor {
            node_id: self.id.clone(),
            mode: self.mode,
            capacity,
            status: CapacityThresholds::for_total(self.total_capacity).status_for(capacity.free),
            priority: self.priority,
            last_heartbeat: now,
        }
    }
}

/// Nodes keyed by id
#[derive(Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<NodeId, Arc<StorageNode>>,
}

impl NodeRegistry {
    /// Open every configured node
    pub async fn open(
        configs: &[LocalNodeConfig],
        overflow: &Arc<dyn OverflowStore>,
        attributes: &AttributeConfig,
    ) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for config in configs {
            let node = StorageNode::open(config, Arc::clone(overflow), attributes).await?;
            nodes.insert(node.id.clone(), Arc::new(node));
        }
        Ok(Self { nodes })
    }

    pub fn get(&self, node_id: &NodeId) -> Result<Arc<StorageNode>> {
        self.nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(node_id.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StorageNode>> {
        self.nodes.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
