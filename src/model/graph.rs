use crate::error::{EngineError, EngineResult};
use crate::model::{Container, FeatureDef, FeatureValue, Instance, InstanceId, ScalarKind, Schema};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// The object graph of one session: a forest of root instances plus everything
/// they transitively contain. Containment is the only ownership edge; every
/// other reference is a plain link that may be purged when its target goes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceGraph {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    roots: Vec<InstanceId>,
    #[serde(default)]
    instances: BTreeMap<InstanceId, Instance>,
}

impl InstanceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue_id(&mut self) -> InstanceId {
        self.next_id += 1;
        InstanceId(self.next_id)
    }

    pub fn add_root(&mut self, instance: Instance) {
        let id = instance.id;
        self.instances.insert(id, instance);
        if !self.roots.contains(&id) {
            self.roots.push(id);
        }
    }

    pub fn get(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.instances.get_mut(&id)
    }

    pub fn set_value(&mut self, id: InstanceId, feature: &str, value: FeatureValue) {
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.set_value(feature, value);
        }
    }

    pub fn set_container(&mut self, id: InstanceId, container: Option<Container>) {
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.container = container;
        }
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn roots(&self) -> &[InstanceId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Directly contained instances, in schema feature order then value order
    pub fn children(&self, schema: &Schema, id: InstanceId) -> Vec<InstanceId> {
        let Some(instance) = self.instances.get(&id) else {
            return Vec::new();
        };
        let Some(class) = schema.class(&instance.class) else {
            return Vec::new();
        };
        class
            .containment_features()
            .flat_map(|f| instance.value(f.name()).ref_ids())
            .filter(|child| self.instances.contains_key(child))
            .collect()
    }

    /// Pre-order walk of the containment forest, roots in insertion order.
    pub fn pre_order(&self, schema: &Schema) -> Vec<InstanceId> {
        let mut out = Vec::with_capacity(self.instances.len());
        let mut seen = HashSet::new();
        for root in &self.roots {
            self.walk(schema, *root, &mut out, &mut seen);
        }
        out
    }

    /// The instance itself followed by everything it transitively contains
    pub fn subtree(&self, schema: &Schema, id: InstanceId) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.walk(schema, id, &mut out, &mut seen);
        out
    }

    fn walk(
        &self,
        schema: &Schema,
        id: InstanceId,
        out: &mut Vec<InstanceId>,
        seen: &mut HashSet<InstanceId>,
    ) {
        if !self.instances.contains_key(&id) || !seen.insert(id) {
            return;
        }
        out.push(id);
        for child in self.children(schema, id) {
            self.walk(schema, child, out, seen);
        }
    }

    /// True when `candidate` is `id` or one of its containers, transitively.
    pub fn is_ancestor_or_self(&self, candidate: InstanceId, id: InstanceId) -> bool {
        let mut current = Some(id);
        let mut hops = 0;
        while let Some(cur) = current {
            if cur == candidate {
                return true;
            }
            hops += 1;
            if hops > self.instances.len() {
                return false;
            }
            current = self
                .instances
                .get(&cur)
                .and_then(|i| i.container.as_ref())
                .map(|c| c.parent);
        }
        false
    }

    /// Remove an instance from wherever it currently hangs: its container's
    /// feature, or the root list.
    pub fn detach(&mut self, id: InstanceId) {
        let container = self.instances.get_mut(&id).and_then(|i| i.container.take());
        match container {
            Some(container) => {
                if let Some(parent) = self.instances.get_mut(&container.parent) {
                    let remaining = match parent.value(&container.feature) {
                        FeatureValue::Ref(r) if *r == id => FeatureValue::Absent,
                        FeatureValue::RefSeq(ids) => {
                            FeatureValue::RefSeq(ids.iter().copied().filter(|r| *r != id).collect())
                        }
                        other => other.clone(),
                    };
                    parent.set_value(&container.feature, remaining);
                }
            }
            None => self.roots.retain(|r| *r != id),
        }
    }

    /// Turn an instance whose container let go of it into a root. The
    /// container's feature value is expected to be updated by the caller.
    pub fn make_root(&mut self, id: InstanceId) {
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.container = None;
            if !self.roots.contains(&id) {
                self.roots.push(id);
            }
        }
    }

    /// Delete an instance together with its containment subtree and purge every
    /// reference to any of them from the rest of the graph. Returns the removed ids.
    pub fn remove_cascading(&mut self, schema: &Schema, id: InstanceId) -> Vec<InstanceId> {
        let doomed = self.subtree(schema, id);
        if doomed.is_empty() {
            return doomed;
        }
        self.detach(id);
        let doomed_set: HashSet<InstanceId> = doomed.iter().copied().collect();
        for d in &doomed {
            self.instances.remove(d);
        }
        self.roots.retain(|r| !doomed_set.contains(r));

        for instance in self.instances.values_mut() {
            if instance
                .container
                .as_ref()
                .is_some_and(|c| doomed_set.contains(&c.parent))
            {
                instance.container = None;
            }
            instance.values.retain(|_, value| match value {
                FeatureValue::Ref(r) => !doomed_set.contains(r),
                FeatureValue::RefSeq(ids) => {
                    ids.retain(|r| !doomed_set.contains(r));
                    true
                }
                _ => true,
            });
        }
        doomed
    }

    /// Structural conformance of a graph handed in from outside (imports,
    /// reloads): classes and features exist, value shapes match multiplicity,
    /// scalars have the kind `kind_of` resolves for their attribute type,
    /// references resolve to compatible classes, containment forms a forest.
    pub fn check_integrity<K>(&self, schema: &Schema, kind_of: K) -> EngineResult<()>
    where
        K: Fn(&str) -> ScalarKind,
    {
        let invalid = |msg: String| Err(EngineError::invalid_request(msg));

        for (key, instance) in &self.instances {
            if *key != instance.id {
                return invalid(format!("instance stored under {} claims id {}", key, instance.id));
            }
            if instance.id.0 > self.next_id {
                return invalid(format!("instance id {} was never issued", instance.id));
            }
            let Some(class) = schema.class(&instance.class) else {
                return invalid(format!("unknown class '{}'", instance.class));
            };
            if class.is_abstract {
                return invalid(format!("instance {} has abstract class '{}'", instance.id, class.name));
            }
            for (name, value) in &instance.values {
                let Some(feature) = class.feature(name) else {
                    return invalid(format!("unknown feature '{}.{}'", class.name, name));
                };
                let shape_ok = match (feature, value) {
                    (FeatureDef::Attribute(a), FeatureValue::Scalar(_)) => !a.many,
                    (FeatureDef::Attribute(a), FeatureValue::ScalarSeq(_)) => a.many,
                    (FeatureDef::Reference(r), FeatureValue::Ref(_)) => !r.many,
                    (FeatureDef::Reference(r), FeatureValue::RefSeq(_)) => r.many,
                    (_, FeatureValue::Absent) => true,
                    _ => false,
                };
                if !shape_ok {
                    return invalid(format!("value of '{}.{}' does not match its declaration", class.name, name));
                }
                if let FeatureDef::Attribute(a) = feature {
                    let expected = kind_of(&a.data_type);
                    let scalars = match value {
                        FeatureValue::Scalar(v) => std::slice::from_ref(v),
                        FeatureValue::ScalarSeq(vs) => vs.as_slice(),
                        _ => &[],
                    };
                    if let Some(bad) = scalars.iter().find(|v| v.kind() != expected) {
                        return invalid(format!(
                            "'{}.{}' of {} holds {:?} value '{}', expected {}",
                            class.name,
                            name,
                            instance.id,
                            bad.kind(),
                            bad.to_text(),
                            a.data_type
                        ));
                    }
                }
                if let FeatureDef::Reference(r) = feature {
                    for target in value.ref_ids() {
                        let Some(target_instance) = self.instances.get(&target) else {
                            return invalid(format!("'{}.{}' of {} points at missing {}", class.name, name, instance.id, target));
                        };
                        let compatible = schema
                            .class(&target_instance.class)
                            .is_some_and(|c| c.conforms_to(&r.target));
                        if !compatible {
                            return invalid(format!("'{}.{}' cannot hold a {}", class.name, name, target_instance.class));
                        }
                        if r.containment && !target_instance.is_contained_in(instance.id, name) {
                            return invalid(format!("{} is listed in '{}.{}' of {} but not contained there", target, class.name, name, instance.id));
                        }
                    }
                }
            }
            match &instance.container {
                Some(c) => {
                    let held = self
                        .instances
                        .get(&c.parent)
                        .is_some_and(|p| p.value(&c.feature).references(instance.id));
                    if !held {
                        return invalid(format!("{} claims a container that does not hold it", instance.id));
                    }
                    if self.is_ancestor_or_self(instance.id, c.parent) {
                        return invalid(format!("{} contains itself", instance.id));
                    }
                }
                None if !self.roots.contains(&instance.id) => {
                    return invalid(format!("{} has no container and is not a root", instance.id));
                }
                None => {}
            }
        }

        let mut seen = HashSet::new();
        for root in &self.roots {
            let is_root = self.instances.get(root).is_some_and(|i| i.container.is_none());
            if !is_root || !seen.insert(*root) {
                return invalid(format!("invalid root entry {}", root));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScalarValue;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::parse(
            json!({
                "name": "org",
                "classes": [
                    { "name": "Team", "features": [
                        { "kind": "reference", "name": "members", "target": "Person",
                          "many": true, "containment": true },
                        { "kind": "reference", "name": "lead", "target": "Person" }
                    ]},
                    { "name": "Person", "features": [
                        { "kind": "attribute", "name": "name", "type": "EString" },
                        { "kind": "reference", "name": "friend", "target": "Person" }
                    ]}
                ]
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    fn by_name(type_name: &str) -> ScalarKind {
        ScalarKind::from_type_name(type_name).unwrap_or(ScalarKind::String)
    }

    fn contain(graph: &mut InstanceGraph, parent: InstanceId, children: &[InstanceId]) {
        for child in children {
            graph.detach(*child);
            graph.get_mut(*child).unwrap().container = Some(Container {
                parent,
                feature: "members".to_string(),
            });
        }
        graph
            .get_mut(parent)
            .unwrap()
            .set_value("members", FeatureValue::RefSeq(children.to_vec()));
    }

    fn team_with_two() -> (InstanceGraph, InstanceId, InstanceId, InstanceId) {
        let mut graph = InstanceGraph::new();
        let team = graph.issue_id();
        graph.add_root(Instance::new(team, "Team"));
        let a = graph.issue_id();
        graph.add_root(Instance::new(a, "Person"));
        let b = graph.issue_id();
        graph.add_root(Instance::new(b, "Person"));
        contain(&mut graph, team, &[a, b]);
        (graph, team, a, b)
    }

    #[test]
    fn test_pre_order_visits_contained_after_container() {
        let schema = schema();
        let (mut graph, team, a, b) = team_with_two();
        let loner = graph.issue_id();
        graph.add_root(Instance::new(loner, "Person"));
        assert_eq!(graph.roots(), &[team, loner]);
        assert_eq!(graph.pre_order(&schema), vec![team, a, b, loner]);
        assert!(graph.check_integrity(&schema, by_name).is_ok());
    }

    #[test]
    fn test_cascading_delete_purges_references() {
        let schema = schema();
        let (mut graph, team, a, b) = team_with_two();
        let outsider = graph.issue_id();
        let mut o = Instance::new(outsider, "Person");
        o.set_value("friend", FeatureValue::Ref(a));
        graph.add_root(o);

        let removed = graph.remove_cascading(&schema, team);
        assert_eq!(removed, vec![team, a, b]);
        assert_eq!(graph.len(), 1);
        assert!(graph.get(outsider).unwrap().value("friend").is_absent());
        assert_eq!(graph.roots(), &[outsider]);
        assert!(graph.check_integrity(&schema, by_name).is_ok());
    }

    #[test]
    fn test_deleting_contained_instance_detaches_it() {
        let schema = schema();
        let (mut graph, team, a, b) = team_with_two();
        graph.remove_cascading(&schema, a);
        assert_eq!(graph.get(team).unwrap().value("members"), &FeatureValue::RefSeq(vec![b]));
        assert!(graph.check_integrity(&schema, by_name).is_ok());
    }

    #[test]
    fn test_ids_are_not_reused() {
        let schema = schema();
        let mut graph = InstanceGraph::new();
        let first = graph.issue_id();
        graph.add_root(Instance::new(first, "Person"));
        graph.remove_cascading(&schema, first);
        assert_ne!(graph.issue_id(), first);
    }

    #[test]
    fn test_ancestry() {
        let (graph, team, a, _) = team_with_two();
        assert!(graph.is_ancestor_or_self(team, a));
        assert!(graph.is_ancestor_or_self(a, a));
        assert!(!graph.is_ancestor_or_self(a, team));
    }

    #[test]
    fn test_integrity_rejects_dangling_and_orphans() {
        let schema = schema();
        let (mut graph, _, a, _) = team_with_two();
        graph
            .get_mut(a)
            .unwrap()
            .set_value("friend", FeatureValue::Ref(InstanceId(99)));
        assert!(graph.check_integrity(&schema, by_name).is_err());

        let (mut graph, _, a, _) = team_with_two();
        graph.get_mut(a).unwrap().container = None;
        assert!(graph.check_integrity(&schema, by_name).is_err());

        let (mut graph, _, a, _) = team_with_two();
        graph
            .get_mut(a)
            .unwrap()
            .set_value("name", FeatureValue::ScalarSeq(vec![ScalarValue::Int(1)]));
        assert!(graph.check_integrity(&schema, by_name).is_err());
    }

    #[test]
    fn test_integrity_rejects_mistyped_scalars() {
        let schema = schema();
        let (mut graph, _, a, _) = team_with_two();
        graph
            .get_mut(a)
            .unwrap()
            .set_value("name", FeatureValue::Scalar(ScalarValue::String("Ann".into())));
        assert!(graph.check_integrity(&schema, by_name).is_ok());

        graph
            .get_mut(a)
            .unwrap()
            .set_value("name", FeatureValue::Scalar(ScalarValue::Int(7)));
        let err = graph.check_integrity(&schema, by_name).unwrap_err();
        assert!(err.to_string().contains("Person.name"));
    }

    #[test]
    fn test_persisted_document_round_trips() {
        let (graph, _, _, _) = team_with_two();
        let text = serde_json::to_string(&graph).unwrap();
        let back: InstanceGraph = serde_json::from_str(&text).unwrap();
        assert_eq!(back, graph);
    }
}
