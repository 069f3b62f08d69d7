pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes::{build_app, create_router};

pub use error::{EngineError, EngineResult, ErrorKind};

// Export logic types
pub use logic::{
    describe, CrudEngine, Description, IdentityStrategy, Operation, RemoveKey, SchemaRegistry,
    TypeCoercer,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{FileStore, GraphStore, InMemoryStore, SessionInfo, SessionManager};

use std::sync::Arc;

/// Wire the engine on top of a store.
pub fn build_engine<S: GraphStore + 'static>(
    store: Arc<S>,
    strategy: IdentityStrategy,
) -> Arc<CrudEngine<S>> {
    let sessions = Arc::new(SessionManager::new(store, Arc::new(SchemaRegistry::new())));
    Arc::new(CrudEngine::new(sessions, strategy))
}
