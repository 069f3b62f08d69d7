use crate::model::{InstanceGraph, SessionId};
use anyhow::Result;

/// Persistence collaborator for session graphs
#[async_trait::async_trait]
pub trait GraphStore: Send + Sync {
    /// Write the whole graph of a session, replacing any previous artifact
    async fn save(&self, session_id: &SessionId, graph: &InstanceGraph) -> Result<()>;
    /// Read the persisted graph back, if one exists
    async fn load(&self, session_id: &SessionId) -> Result<Option<InstanceGraph>>;
    /// Remove the persisted artifact. Returns false when there was none.
    async fn delete(&self, session_id: &SessionId) -> Result<bool>;
}
