use log::{debug, info};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::model::{DataTypeDef, Schema};

/// Process-wide table of loaded schemas keyed by namespace URI. Lets one
/// schema's attributes name data types declared by another ("ns#Type").
/// A later upload with the same namespace replaces the earlier entry.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    by_namespace: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a schema document and make it resolvable by its namespace.
    pub fn load_schema(&self, bytes: &[u8]) -> EngineResult<Arc<Schema>> {
        let schema = Arc::new(Schema::parse(bytes)?);
        self.register(schema.clone());
        info!(
            "Loaded schema '{}' ({} classes) as {}",
            schema.name,
            schema.classes().len(),
            schema.ns_uri
        );
        Ok(schema)
    }

    pub fn register(&self, schema: Arc<Schema>) {
        let mut table = self.by_namespace.write();
        if let Some(previous) = table.insert(schema.ns_uri.clone(), schema.clone()) {
            if previous.id != schema.id {
                debug!("Namespace {} now resolves to schema {}", schema.ns_uri, schema.id);
            }
        }
    }

    pub fn resolve(&self, ns_uri: &str) -> Option<Arc<Schema>> {
        self.by_namespace.read().get(ns_uri).cloned()
    }

    /// Release the namespace entry of a schema going away. Only acts if the
    /// entry still points at this schema; it then moves to `successor`, a
    /// live schema of the same namespace, or is dropped when there is none.
    pub fn unregister(&self, schema: &Schema, successor: Option<Arc<Schema>>) {
        let mut table = self.by_namespace.write();
        if !table.get(&schema.ns_uri).is_some_and(|s| s.id == schema.id) {
            return;
        }
        match successor.filter(|s| s.ns_uri == schema.ns_uri) {
            Some(next) => {
                debug!("Namespace {} now resolves to schema {}", next.ns_uri, next.id);
                table.insert(next.ns_uri.clone(), next);
            }
            None => {
                table.remove(&schema.ns_uri);
            }
        }
    }

    /// Look a data type up by a qualified "nsUri#Name" reference.
    pub fn resolve_data_type(&self, qualified: &str) -> Option<DataTypeDef> {
        let (ns_uri, name) = qualified.rsplit_once('#')?;
        self.resolve(ns_uri)?.data_type(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(name: &str, ns: Option<&str>) -> Vec<u8> {
        let mut value = json!({
            "name": name,
            "dataTypes": [{ "name": "Age", "kind": "int" }],
            "classes": [{ "name": "Thing" }]
        });
        if let Some(ns) = ns {
            value["nsUri"] = json!(ns);
        }
        value.to_string().into_bytes()
    }

    #[test]
    fn test_schema_resolvable_by_derived_namespace() {
        let registry = SchemaRegistry::new();
        let schema = registry.load_schema(&doc("shapes", None)).unwrap();
        assert_eq!(schema.ns_uri, "shapes");
        assert_eq!(registry.resolve("shapes").unwrap().id, schema.id);
        assert_eq!(
            registry.resolve_data_type("shapes#Age").unwrap().kind,
            Some(crate::model::ScalarKind::Int)
        );
        assert!(registry.resolve_data_type("shapes#Height").is_none());
        assert!(registry.resolve_data_type("Age").is_none());
    }

    #[test]
    fn test_unregister_leaves_newer_schema_alone() {
        let registry = SchemaRegistry::new();
        let first = registry.load_schema(&doc("a", Some("http://x"))).unwrap();
        let second = registry.load_schema(&doc("b", Some("http://x"))).unwrap();
        registry.unregister(&first, None);
        assert_eq!(registry.resolve("http://x").unwrap().id, second.id);
        registry.unregister(&second, None);
        assert!(registry.resolve("http://x").is_none());
    }

    #[test]
    fn test_unregister_hands_namespace_to_successor() {
        let registry = SchemaRegistry::new();
        let first = registry.load_schema(&doc("a", Some("http://x"))).unwrap();
        let second = registry.load_schema(&doc("b", Some("http://x"))).unwrap();
        let other = registry.load_schema(&doc("c", Some("http://y"))).unwrap();

        registry.unregister(&second, Some(first.clone()));
        assert_eq!(registry.resolve("http://x").unwrap().id, first.id);
        assert!(registry.resolve_data_type("http://x#Age").is_some());

        // A successor from another namespace is ignored
        registry.unregister(&first, Some(other));
        assert!(registry.resolve("http://x").is_none());
    }
}
