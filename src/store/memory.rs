use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::model::{InstanceGraph, SessionId};
use crate::store::traits::GraphStore;

/// Keeps persisted graphs in memory. Used by tests and by deployments that do
/// not need artifacts on disk.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    graphs: Arc<RwLock<HashMap<SessionId, InstanceGraph>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail, to exercise persistence error paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn contains(&self, session_id: &SessionId) -> bool {
        self.graphs.read().await.contains_key(session_id)
    }

    /// Overwrite the stored graph without going through a session
    pub async fn put(&self, session_id: &SessionId, graph: InstanceGraph) {
        self.graphs.write().await.insert(session_id.clone(), graph);
    }
}

#[async_trait::async_trait]
impl GraphStore for InMemoryStore {
    async fn save(&self, session_id: &SessionId, graph: &InstanceGraph) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("storage is read-only");
        }
        self.graphs
            .write()
            .await
            .insert(session_id.clone(), graph.clone());
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Option<InstanceGraph>> {
        Ok(self.graphs.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self.graphs.write().await.remove(session_id).is_some())
    }
}
