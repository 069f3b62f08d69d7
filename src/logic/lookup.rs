use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{FeatureValue, Instance, InstanceGraph, InstanceId, Schema};

/// How instances are identified to clients.
///
/// * `Generated`: the id issued by the graph at creation time.
/// * `NamedFeature`: the value of the class's "name" attribute. Lookup returns
///   the first match of a pre-order walk, so same-named instances shadow each
///   other deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    #[default]
    Generated,
    NamedFeature,
}

impl IdentityStrategy {
    pub fn identity_of(&self, schema: &Schema, instance: &Instance) -> Option<String> {
        match self {
            IdentityStrategy::Generated => Some(instance.id.to_string()),
            IdentityStrategy::NamedFeature => name_of(schema, instance),
        }
    }

    pub fn find_by_id<'g>(
        &self,
        schema: &Schema,
        graph: &'g InstanceGraph,
        key: &str,
    ) -> Option<&'g Instance> {
        if key.is_empty() {
            return None;
        }
        all_instances(schema, graph)
            .into_iter()
            .find(|instance| self.identity_of(schema, instance).as_deref() == Some(key))
    }

    /// Resolve a reference element from a request: a bare id (string or
    /// number) or an object carrying an "id" field.
    pub fn resolve_reference<'g>(
        &self,
        schema: &Schema,
        graph: &'g InstanceGraph,
        element: &Value,
    ) -> Option<&'g Instance> {
        self.find_by_id(schema, graph, &reference_key(element)?)
    }

    /// Identity of a referenced instance, for projections
    pub fn identity_of_id(
        &self,
        schema: &Schema,
        graph: &InstanceGraph,
        id: InstanceId,
    ) -> Option<String> {
        graph.get(id).and_then(|i| self.identity_of(schema, i))
    }
}

pub fn reference_key(element: &Value) -> Option<String> {
    match element {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("id").and_then(reference_key),
        _ => None,
    }
}

/// Every instance of the graph, roots in insertion order, each followed by its
/// containment subtree.
pub fn all_instances<'g>(schema: &Schema, graph: &'g InstanceGraph) -> Vec<&'g Instance> {
    graph
        .pre_order(schema)
        .into_iter()
        .filter_map(|id| graph.get(id))
        .collect()
}

fn name_of(schema: &Schema, instance: &Instance) -> Option<String> {
    let class = schema.class(&instance.class)?;
    let attribute = class.name_attribute()?;
    match instance.value(&attribute.name) {
        FeatureValue::Scalar(value) => Some(value.to_text()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Container, ScalarValue};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::parse(
            json!({
                "name": "zoo",
                "classes": [
                    { "name": "Zoo", "features": [
                        { "kind": "attribute", "name": "name", "type": "EString" },
                        { "kind": "reference", "name": "animals", "target": "Animal",
                          "many": true, "containment": true }
                    ]},
                    { "name": "Animal", "features": [
                        { "kind": "attribute", "name": "name", "type": "EString" }
                    ]},
                    { "name": "Rock" }
                ]
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    fn named(graph: &mut InstanceGraph, class: &str, name: &str) -> InstanceId {
        let id = graph.issue_id();
        let mut instance = Instance::new(id, class);
        instance.set_value("name", FeatureValue::Scalar(ScalarValue::String(name.into())));
        graph.add_root(instance);
        id
    }

    fn graph() -> (InstanceGraph, InstanceId, InstanceId, InstanceId) {
        let mut graph = InstanceGraph::new();
        let zoo = named(&mut graph, "Zoo", "leo");
        let lion = named(&mut graph, "Animal", "leo");
        graph.detach(lion);
        graph.get_mut(lion).unwrap().container = Some(Container {
            parent: zoo,
            feature: "animals".into(),
        });
        graph
            .get_mut(zoo)
            .unwrap()
            .set_value("animals", FeatureValue::RefSeq(vec![lion]));
        let rock = graph.issue_id();
        graph.add_root(Instance::new(rock, "Rock"));
        (graph, zoo, lion, rock)
    }

    #[test]
    fn test_generated_lookup() {
        let schema = schema();
        let (graph, _, lion, _) = graph();
        let strategy = IdentityStrategy::Generated;
        let found = strategy.find_by_id(&schema, &graph, &lion.to_string()).unwrap();
        assert_eq!(found.id, lion);
        assert!(strategy.find_by_id(&schema, &graph, "999").is_none());
        assert!(strategy.find_by_id(&schema, &graph, "abc").is_none());
        assert_eq!(
            strategy
                .resolve_reference(&schema, &graph, &json!({ "id": lion.0 }))
                .map(|i| i.id),
            Some(lion)
        );
    }

    #[test]
    fn test_named_lookup_returns_first_in_pre_order() {
        let schema = schema();
        let (graph, zoo, _, rock) = graph();
        let strategy = IdentityStrategy::NamedFeature;
        assert_eq!(strategy.find_by_id(&schema, &graph, "leo").unwrap().id, zoo);
        assert!(strategy.find_by_id(&schema, &graph, "nobody").is_none());
        // classes without a name attribute have no identity under this strategy
        assert_eq!(strategy.identity_of(&schema, graph.get(rock).unwrap()), None);
    }

    #[test]
    fn test_all_instances_is_restartable() {
        let schema = schema();
        let (graph, zoo, lion, rock) = graph();
        let first: Vec<_> = all_instances(&schema, &graph).iter().map(|i| i.id).collect();
        let second: Vec<_> = all_instances(&schema, &graph).iter().map(|i| i.id).collect();
        assert_eq!(first, vec![zoo, lion, rock]);
        assert_eq!(first, second);
    }
}
