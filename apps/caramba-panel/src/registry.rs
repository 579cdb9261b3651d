use std::collections::HashMap;
use std::sync::Arc;

use caramba_shared::command::PendingCommand;
use caramba_shared::node_plane::{MetricsSnapshot, NodeStatus};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::queue::{CommandQueue, EnqueueError};

/// In-memory, per-node live view (`NodeSessionState`). Owns the node's
/// command queue too — both are mutated from the same call paths (Register
/// creates both, the reaper tears down both) so they share one lock.
#[derive(Debug)]
pub struct NodeSessionState {
    pub node_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub status: NodeStatus,
    pub metrics: Option<MetricsSnapshot>,
    pub config_version: i64,
    queue: CommandQueue,
}

impl NodeSessionState {
    fn new(node_id: String, queue_capacity: usize) -> Self {
        Self {
            node_id,
            last_heartbeat: Utc::now(),
            status: NodeStatus::Online,
            metrics: None,
            config_version: 0,
            queue: CommandQueue::new(queue_capacity),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryEnqueueError {
    NodeUnknown,
    QueueFull,
}

/// The process-wide Node Registry: a map-level lock guards
/// insert/remove, a per-entry lock guards in-place mutation. No lock is
/// held across a persistence call from any caller of this type.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, Arc<RwLock<NodeSessionState>>>>>,
    default_queue_capacity: usize,
}

impl Registry {
    pub fn new(default_queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            default_queue_capacity,
        }
    }

    /// Publishes or refreshes an entry on Register. Always called
    /// after the persistence write has committed.
    pub async fn publish_register(&self, node_id: &str) -> Arc<RwLock<NodeSessionState>> {
        let map = self.inner.read().await;
        if let Some(entry) = map.get(node_id) {
            let entry = entry.clone();
            drop(map);
            let mut state = entry.write().await;
            state.last_heartbeat = Utc::now();
            state.status = NodeStatus::Online;
            drop(state);
            return entry;
        }
        drop(map);

        let mut map = self.inner.write().await;
        map.entry(node_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(NodeSessionState::new(node_id.to_string(), self.default_queue_capacity))))
            .clone()
    }

    pub async fn get(&self, node_id: &str) -> Option<Arc<RwLock<NodeSessionState>>> {
        self.inner.read().await.get(node_id).cloned()
    }

    pub async fn contains(&self, node_id: &str) -> bool {
        self.inner.read().await.contains_key(node_id)
    }

    /// Heartbeat's Registry half: bump `last_heartbeat`, merge status,
    /// never decreasing below `online` on an online heartbeat.
    pub async fn record_heartbeat(&self, node_id: &str, status: NodeStatus) -> Option<()> {
        let entry = self.get(node_id).await?;
        let mut state = entry.write().await;
        state.last_heartbeat = Utc::now();
        state.status = status;
        Some(())
    }

    pub async fn set_status(&self, node_id: &str, status: NodeStatus) -> Option<()> {
        let entry = self.get(node_id).await?;
        entry.write().await.status = status;
        Some(())
    }

    pub async fn record_metrics(&self, node_id: &str, metrics: MetricsSnapshot) -> Option<()> {
        let entry = self.get(node_id).await?;
        entry.write().await.metrics = Some(metrics);
        Some(())
    }

    pub async fn bump_config_version(&self, node_id: &str) -> Option<i64> {
        let entry = self.get(node_id).await?;
        let mut state = entry.write().await;
        state.config_version += 1;
        Some(state.config_version)
    }

    pub async fn enqueue(&self, node_id: &str, cmd: PendingCommand) -> Result<(), RegistryEnqueueError> {
        let entry = self.get(node_id).await.ok_or(RegistryEnqueueError::NodeUnknown)?;
        entry
            .write()
            .await
            .queue
            .enqueue(cmd)
            .map_err(|EnqueueError::QueueFull| RegistryEnqueueError::QueueFull)
    }

    /// Drains the node's Command Queue. Empty, not an error, if the
    /// node is unknown — heartbeat already validated existence upstream.
    pub async fn drain(&self, node_id: &str) -> Vec<PendingCommand> {
        match self.get(node_id).await {
            Some(entry) => entry.write().await.queue.drain(),
            None => Vec::new(),
        }
    }

    /// Reaper scan: takes the map read lock, collects candidates,
    /// then per-entry write locks — never both simultaneously.
    pub async fn snapshot(&self) -> Vec<(String, DateTime<Utc>, NodeStatus)> {
        let map = self.inner.read().await;
        let mut out = Vec::with_capacity(map.len());
        for (node_id, entry) in map.iter() {
            let state = entry.read().await;
            out.push((node_id.clone(), state.last_heartbeat, state.status));
        }
        out
    }

    /// Reaper eviction: removes the entry and, with it, its command
    /// queue — pending commands are dropped by contract.
    pub async fn evict(&self, node_id: &str) {
        self.inner.write().await.remove(node_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_enqueue_is_visible_immediately() {
        let registry = Registry::new(100);
        registry.publish_register("node-A").await;
        assert!(registry.contains("node-A").await);
        assert!(registry.enqueue("node-A", test_cmd()).await.is_ok());
    }

    #[tokio::test]
    async fn enqueue_against_unknown_node_fails() {
        let registry = Registry::new(100);
        assert_eq!(
            registry.enqueue("node-ghost", test_cmd()).await,
            Err(RegistryEnqueueError::NodeUnknown)
        );
    }

    #[tokio::test]
    async fn drain_after_evict_is_empty_and_enqueue_reports_unknown() {
        let registry = Registry::new(10);
        registry.publish_register("node-A").await;
        registry.enqueue("node-A", test_cmd()).await.unwrap();
        registry.evict("node-A").await;
        assert!(registry.drain("node-A").await.is_empty());
        assert_eq!(
            registry.enqueue("node-A", test_cmd()).await,
            Err(RegistryEnqueueError::NodeUnknown)
        );
    }

    fn test_cmd() -> PendingCommand {
        PendingCommand::new("node-A", caramba_shared::command::CommandKind::AddUser, Default::default())
    }
}
