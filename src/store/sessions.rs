use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::logic::{SchemaRegistry, TypeCoercer};
use crate::model::{generate_id, InstanceGraph, Schema, SessionId};
use crate::store::traits::GraphStore;

/// One uploaded schema and the graph built against it.
///
/// Readers take a cheap snapshot of the current graph. Writers are serialized
/// per session and work on a copy which only replaces the snapshot once it
/// has been persisted.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub schema: Arc<Schema>,
    pub created_at: DateTime<Utc>,
    graph: RwLock<Arc<InstanceGraph>>,
    updated_at: RwLock<DateTime<Utc>>,
    writer: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Session {
    fn new(id: SessionId, schema: Arc<Schema>, graph: InstanceGraph) -> Self {
        let now = Utc::now();
        Self {
            id,
            schema,
            created_at: now,
            graph: RwLock::new(Arc::new(graph)),
            updated_at: RwLock::new(now),
            writer: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Current graph snapshot
    pub fn graph(&self) -> Arc<InstanceGraph> {
        self.graph.read().clone()
    }

    fn swap(&self, graph: InstanceGraph) {
        *self.graph.write() = Arc::new(graph);
        *self.updated_at.write() = Utc::now();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            schema_name: self.schema.name.clone(),
            ns_uri: self.schema.ns_uri.clone(),
            instance_count: self.graph().len(),
            created_at: self.created_at,
            updated_at: *self.updated_at.read(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub schema_name: String,
    pub ns_uri: String,
    pub instance_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Owns every live session. The table lock is only held for individual map
/// operations, never across persistence calls.
pub struct SessionManager<S: GraphStore> {
    store: Arc<S>,
    registry: Arc<SchemaRegistry>,
    coercer: Arc<TypeCoercer>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl<S: GraphStore> SessionManager<S> {
    pub fn new(store: Arc<S>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            coercer: Arc::new(TypeCoercer::new(registry.clone())),
            store,
            registry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn coercer(&self) -> &Arc<TypeCoercer> {
        &self.coercer
    }

    /// Load a schema into a new session and persist its (empty) graph right
    /// away so the session is readable as soon as this returns.
    pub async fn create_session(&self, schema_bytes: &[u8]) -> EngineResult<Arc<Session>> {
        let schema = self.registry.load_schema(schema_bytes)?;
        let id = generate_id();
        let graph = InstanceGraph::new();

        if let Err(e) = self.store.save(&id, &graph).await {
            warn!("Could not persist empty model for new session {}: {:#}", id, e);
            self.release_namespace(&schema);
            return Err(EngineError::persistence(e));
        }

        let session = Arc::new(Session::new(id.clone(), schema, graph));
        self.sessions.write().insert(id.clone(), session.clone());
        info!("Created session {} for schema '{}'", id, session.schema.name);
        Ok(session)
    }

    /// Another live session may share the namespace of a schema going away;
    /// the newest such session keeps it resolvable.
    fn release_namespace(&self, schema: &Schema) {
        let successor = self
            .sessions
            .read()
            .values()
            .filter(|s| s.schema.ns_uri == schema.ns_uri && s.schema.id != schema.id)
            .max_by_key(|s| s.created_at)
            .map(|s| s.schema.clone());
        self.registry.unregister(schema, successor);
    }

    pub fn session(&self, session_id: &str) -> EngineResult<Arc<Session>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub fn get_schema(&self, session_id: &str) -> Option<Arc<Schema>> {
        self.session(session_id).ok().map(|s| s.schema.clone())
    }

    pub fn get_graph(&self, session_id: &str) -> Option<Arc<InstanceGraph>> {
        self.session(session_id).ok().map(|s| s.graph())
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Persist `graph` and make it the session's current graph.
    pub async fn replace_graph(&self, session_id: &str, graph: InstanceGraph) -> EngineResult<()> {
        self.mutate(session_id, move |_, current| {
            *current = graph;
            Ok(())
        })
        .await?;
        info!("Replaced model of session {}", session_id);
        Ok(())
    }

    /// Run one mutation against a private copy of the session graph. The copy
    /// becomes current only if `apply` succeeds and the result is persisted.
    pub async fn mutate<T, F>(&self, session_id: &str, apply: F) -> EngineResult<T>
    where
        F: FnOnce(&Schema, &mut InstanceGraph) -> EngineResult<T> + Send,
        T: Send,
    {
        let session = self.session(session_id)?;
        let _writer = session.writer.lock().await;
        if session.closed.load(Ordering::SeqCst) {
            return Err(EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }

        let mut graph = InstanceGraph::clone(&session.graph());
        let outcome = apply(&session.schema, &mut graph)?;

        self.store.save(&session.id, &graph).await.map_err(|e| {
            warn!("Could not persist session {}: {:#}", session.id, e);
            EngineError::persistence(e)
        })?;
        debug!("Persisted session {} ({} instances)", session.id, graph.len());
        session.swap(graph);
        Ok(outcome)
    }

    /// Replace the in-memory graph with what the store holds.
    pub async fn reload_graph(&self, session_id: &str) -> EngineResult<Arc<InstanceGraph>> {
        let session = self.session(session_id)?;
        let _writer = session.writer.lock().await;
        let graph = self
            .store
            .load(&session.id)
            .await
            .map_err(EngineError::persistence)?
            .ok_or_else(|| EngineError::Persistence {
                message: format!("no persisted model for session {}", session.id),
            })?;
        graph.check_integrity(&session.schema, |t| self.coercer.resolve_kind(&session.schema, t))?;
        session.swap(graph);
        info!("Reloaded model of session {} from storage", session.id);
        Ok(session.graph())
    }

    /// Forget a session and delete its persisted artifact. Destroying an
    /// unknown or already destroyed session succeeds.
    pub async fn destroy_session(&self, session_id: &str) -> EngineResult<()> {
        let removed = self.sessions.write().remove(session_id);
        if let Some(session) = &removed {
            let _writer = session.writer.lock().await;
            session.closed.store(true, Ordering::SeqCst);
            self.release_namespace(&session.schema);
            self.coercer.forget(&session.schema);
        }
        self.store
            .delete(&session_id.to_string())
            .await
            .map_err(EngineError::persistence)?;
        if removed.is_some() {
            info!("Destroyed session {}", session_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::Instance;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn schema_bytes() -> Vec<u8> {
        json!({ "name": "people", "classes": [{ "name": "Person" }] })
            .to_string()
            .into_bytes()
    }

    fn manager() -> (SessionManager<InMemoryStore>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let manager = SessionManager::new(store.clone(), Arc::new(SchemaRegistry::new()));
        (manager, store)
    }

    #[tokio::test]
    async fn test_create_persists_empty_graph() {
        let (manager, store) = manager();
        let session = manager.create_session(&schema_bytes()).await.unwrap();
        assert!(store.contains(&session.id).await);
        assert!(manager.get_graph(&session.id).unwrap().is_empty());
        assert_eq!(manager.get_schema(&session.id).unwrap().name, "people");
        assert!(manager.registry().resolve("people").is_some());
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let (manager, _) = manager();
        let a = manager.create_session(&schema_bytes()).await.unwrap();
        let b = manager.create_session(&schema_bytes()).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(manager.list_sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_schema_creates_nothing() {
        let (manager, _) = manager();
        let err = manager.create_session(b"{").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaParseError);
        assert!(manager.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_mutation_keeps_previous_graph() {
        let (manager, store) = manager();
        let session = manager.create_session(&schema_bytes()).await.unwrap();

        let result: EngineResult<()> = manager
            .mutate(&session.id, |_, graph| {
                let id = graph.issue_id();
                graph.add_root(Instance::new(id, "Person"));
                Err(EngineError::invalid_request("rejected"))
            })
            .await;
        assert!(result.is_err());
        assert!(session.graph().is_empty());

        store.set_fail_writes(true);
        let err = manager
            .mutate(&session.id, |_, graph| {
                let id = graph.issue_id();
                graph.add_root(Instance::new(id, "Person"));
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceError);
        assert!(session.graph().is_empty());
        assert!(store.load(&session.id).await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_and_reload() {
        let (manager, store) = manager();
        let session = manager.create_session(&schema_bytes()).await.unwrap();

        let mut graph = InstanceGraph::new();
        let id = graph.issue_id();
        graph.add_root(Instance::new(id, "Person"));
        manager.replace_graph(&session.id, graph.clone()).await.unwrap();
        assert_eq!(manager.get_graph(&session.id).unwrap().len(), 1);
        assert_eq!(store.load(&session.id).await.unwrap().unwrap(), graph);

        store.put(&session.id, InstanceGraph::new()).await;
        let reloaded = manager.reload_graph(&session.id).await.unwrap();
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (manager, store) = manager();
        let session = manager.create_session(&schema_bytes()).await.unwrap();
        manager.destroy_session(&session.id).await.unwrap();
        manager.destroy_session(&session.id).await.unwrap();
        assert!(!store.contains(&session.id).await);
        assert!(manager.get_schema(&session.id).is_none());
        assert!(manager.registry().resolve("people").is_none());

        let err = manager
            .mutate(&session.id, |_, _| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn test_destroy_keeps_namespace_of_live_session() {
        let (manager, _) = manager();
        let older = manager.create_session(&schema_bytes()).await.unwrap();
        let newer = manager.create_session(&schema_bytes()).await.unwrap();
        assert_eq!(manager.registry().resolve("people").unwrap().id, newer.schema.id);

        manager.destroy_session(&newer.id).await.unwrap();
        assert!(manager.session(&older.id).is_ok());
        assert_eq!(manager.registry().resolve("people").unwrap().id, older.schema.id);

        manager.destroy_session(&older.id).await.unwrap();
        assert!(manager.registry().resolve("people").is_none());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let (manager, _) = manager();
        let a = manager.create_session(&schema_bytes()).await.unwrap();
        let b = manager.create_session(&schema_bytes()).await.unwrap();
        manager
            .mutate(&a.id, |_, graph| {
                let id = graph.issue_id();
                graph.add_root(Instance::new(id, "Person"));
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(a.graph().len(), 1);
        assert!(b.graph().is_empty());
    }
}
