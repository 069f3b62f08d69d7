use anyhow::{Context, Result};
use log::debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::model::{InstanceGraph, SessionId};
use crate::store::traits::GraphStore;

/// Stores each session graph as `model_<session>.json` inside one directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create the store, making sure the uploads directory exists
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create uploads directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self, session_id: &SessionId) -> PathBuf {
        self.dir.join(format!("model_{}.json", session_id))
    }
}

#[async_trait::async_trait]
impl GraphStore for FileStore {
    async fn save(&self, session_id: &SessionId, graph: &InstanceGraph) -> Result<()> {
        let path = self.model_path(session_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(graph).context("Failed to serialize model")?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move model into {}", path.display()))?;
        debug!("Saved {} instances to {}", graph.len(), path.display());
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Option<InstanceGraph>> {
        let path = self.model_path(session_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let graph = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt model file {}", path.display()))?;
        Ok(Some(graph))
    }

    async fn delete(&self, session_id: &SessionId) -> Result<bool> {
        let path = self.model_path(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}
