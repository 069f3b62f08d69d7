use itertools::Itertools;
use log::{debug, info};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::logic::coerce::{parse_text, TypeCoercer};
use crate::logic::describe::{describe, Description};
use crate::logic::lookup::{all_instances, reference_key, IdentityStrategy};
use crate::model::{
    AttributeDef, ClassDefinition, Container, FeatureDef, FeatureValue, Instance, InstanceGraph,
    InstanceId, InstanceView, ReferenceDef, Schema,
};
use crate::store::sessions::{Session, SessionInfo, SessionManager};
use crate::store::traits::GraphStore;

/// How a removal request designates the element to drop from a many-valued
/// feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveKey {
    Index(i64),
    /// A scalar in textual form for attributes, an identity for references
    Value(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Replace,
    Append,
}

/// Generic create/read/update/delete over the graph of any session.
///
/// Every mutating operation resolves session, class, target and feature in
/// that order, then applies its change to a private copy of the graph which
/// only becomes visible once persisted. The first failure wins and nothing is
/// applied.
pub struct CrudEngine<S: GraphStore> {
    sessions: Arc<SessionManager<S>>,
    strategy: IdentityStrategy,
}

impl<S: GraphStore> CrudEngine<S> {
    pub fn new(sessions: Arc<SessionManager<S>>, strategy: IdentityStrategy) -> Self {
        Self { sessions, strategy }
    }

    pub fn sessions(&self) -> &Arc<SessionManager<S>> {
        &self.sessions
    }

    pub fn strategy(&self) -> IdentityStrategy {
        self.strategy
    }

    // Session level

    pub async fn create_session(&self, schema_bytes: &[u8]) -> EngineResult<(Arc<Session>, Description)> {
        let session = self.sessions.create_session(schema_bytes).await?;
        let description = describe(&session.schema);
        Ok((session, description))
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list_sessions()
    }

    pub fn session_info(&self, session_id: &str) -> EngineResult<SessionInfo> {
        Ok(self.sessions.session(session_id)?.info())
    }

    pub fn describe_session(&self, session_id: &str) -> EngineResult<Description> {
        Ok(describe(&self.sessions.session(session_id)?.schema))
    }

    pub async fn destroy_session(&self, session_id: &str) -> EngineResult<()> {
        self.sessions.destroy_session(session_id).await
    }

    /// The persisted form of the session graph, for handing to other tools
    pub fn export_graph(&self, session_id: &str) -> EngineResult<Arc<InstanceGraph>> {
        Ok(self.sessions.session(session_id)?.graph())
    }

    /// Replace the session graph with a document produced elsewhere, after
    /// checking that it conforms to the session schema.
    pub async fn import_graph(&self, session_id: &str, graph: InstanceGraph) -> EngineResult<()> {
        let session = self.sessions.session(session_id)?;
        let coercer = self.sessions.coercer();
        graph.check_integrity(&session.schema, |t| coercer.resolve_kind(&session.schema, t))?;
        let count = graph.len();
        self.sessions.replace_graph(session_id, graph).await?;
        info!("Imported {} instances into session {}", count, session_id);
        Ok(())
    }

    pub async fn reload_graph(&self, session_id: &str) -> EngineResult<SessionInfo> {
        self.sessions.reload_graph(session_id).await?;
        self.session_info(session_id)
    }

    // Instance level

    pub async fn create_instance(
        &self,
        session_id: &str,
        class_name: &str,
        initial: Option<&Value>,
    ) -> EngineResult<InstanceView> {
        let coercer = self.sessions.coercer().as_ref();
        let strategy = self.strategy;
        let view = self
            .sessions
            .mutate(session_id, move |schema, graph| {
                let editor = Editor::new(schema, coercer, strategy);
                let class = resolve_class(schema, class_name)?;
                if class.is_abstract {
                    return Err(EngineError::AbstractClass {
                        class_name: class.name.clone(),
                    });
                }
                let fields = match initial {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(fields)) => Some(fields),
                    Some(_) => {
                        return Err(EngineError::invalid_request(
                            "initial feature values must be a JSON object",
                        ))
                    }
                };

                let id = graph.issue_id();
                graph.add_root(Instance::new(id, class.name.clone()));
                if let Some(fields) = fields {
                    editor.apply_fields(graph, class, id, fields)?;
                }
                editor.view(graph, id)
            })
            .await?;
        debug!("Created {} {:?} in session {}", view.class, view.id, session_id);
        Ok(view)
    }

    pub fn read_instance(&self, session_id: &str, class_name: &str, id: &str) -> EngineResult<InstanceView> {
        let session = self.sessions.session(session_id)?;
        let graph = session.graph();
        let editor = Editor::new(&session.schema, self.sessions.coercer(), self.strategy);
        let class = resolve_class(&session.schema, class_name)?;
        let target = editor.target(&graph, class, id)?;
        editor.view(&graph, target)
    }

    /// Every instance of exactly this class (subclasses excluded), in
    /// traversal order.
    pub fn list_instances(&self, session_id: &str, class_name: &str) -> EngineResult<Vec<InstanceView>> {
        let session = self.sessions.session(session_id)?;
        let graph = session.graph();
        let editor = Editor::new(&session.schema, self.sessions.coercer(), self.strategy);
        let class = resolve_class(&session.schema, class_name)?;
        all_instances(&session.schema, &graph)
            .into_iter()
            .filter(|instance| instance.class == class.name)
            .map(|instance| editor.project(&graph, instance))
            .collect()
    }

    pub async fn update_instance(
        &self,
        session_id: &str,
        class_name: &str,
        id: &str,
        fields: &Value,
    ) -> EngineResult<InstanceView> {
        let coercer = self.sessions.coercer().as_ref();
        let strategy = self.strategy;
        self.sessions
            .mutate(session_id, move |schema, graph| {
                let editor = Editor::new(schema, coercer, strategy);
                let class = resolve_class(schema, class_name)?;
                let target = editor.target(graph, class, id)?;
                let Value::Object(fields) = fields else {
                    return Err(EngineError::invalid_request(
                        "update body must be a JSON object of feature values",
                    ));
                };
                editor.apply_fields(graph, class, target, fields)?;
                editor.view(graph, target)
            })
            .await
    }

    pub async fn update_feature(
        &self,
        session_id: &str,
        class_name: &str,
        id: &str,
        feature_name: &str,
        value: &Value,
    ) -> EngineResult<InstanceView> {
        self.write_feature(session_id, class_name, id, feature_name, value, WriteMode::Replace)
            .await
    }

    /// Append to a many-valued feature. Single-valued features are replaced.
    pub async fn append_to_feature(
        &self,
        session_id: &str,
        class_name: &str,
        id: &str,
        feature_name: &str,
        value: &Value,
    ) -> EngineResult<InstanceView> {
        self.write_feature(session_id, class_name, id, feature_name, value, WriteMode::Append)
            .await
    }

    async fn write_feature(
        &self,
        session_id: &str,
        class_name: &str,
        id: &str,
        feature_name: &str,
        value: &Value,
        mode: WriteMode,
    ) -> EngineResult<InstanceView> {
        let coercer = self.sessions.coercer().as_ref();
        let strategy = self.strategy;
        self.sessions
            .mutate(session_id, move |schema, graph| {
                let editor = Editor::new(schema, coercer, strategy);
                let class = resolve_class(schema, class_name)?;
                let target = editor.target(graph, class, id)?;
                let feature = resolve_feature(class, feature_name)?;
                editor.write(graph, target, feature, value, mode)?;
                editor.view(graph, target)
            })
            .await
    }

    pub async fn remove_element(
        &self,
        session_id: &str,
        class_name: &str,
        id: &str,
        feature_name: &str,
        key: RemoveKey,
    ) -> EngineResult<InstanceView> {
        let coercer = self.sessions.coercer().as_ref();
        let strategy = self.strategy;
        self.sessions
            .mutate(session_id, move |schema, graph| {
                let editor = Editor::new(schema, coercer, strategy);
                let class = resolve_class(schema, class_name)?;
                let target = editor.target(graph, class, id)?;
                let feature = resolve_feature(class, feature_name)?;
                editor.remove(graph, target, feature, &key)?;
                editor.view(graph, target)
            })
            .await
    }

    /// Many-valued features become an empty sequence, single-valued ones
    /// become absent.
    pub async fn clear_feature(
        &self,
        session_id: &str,
        class_name: &str,
        id: &str,
        feature_name: &str,
    ) -> EngineResult<InstanceView> {
        let coercer = self.sessions.coercer().as_ref();
        let strategy = self.strategy;
        self.sessions
            .mutate(session_id, move |schema, graph| {
                let editor = Editor::new(schema, coercer, strategy);
                let class = resolve_class(schema, class_name)?;
                let target = editor.target(graph, class, id)?;
                let feature = resolve_feature(class, feature_name)?;
                editor.clear(graph, target, feature);
                editor.view(graph, target)
            })
            .await
    }

    /// Delete an instance, everything it contains, and every reference to
    /// any of them. Returns the number of instances removed.
    pub async fn delete_instance(&self, session_id: &str, class_name: &str, id: &str) -> EngineResult<usize> {
        let coercer = self.sessions.coercer().as_ref();
        let strategy = self.strategy;
        let removed = self
            .sessions
            .mutate(session_id, move |schema, graph| {
                let editor = Editor::new(schema, coercer, strategy);
                let class = resolve_class(schema, class_name)?;
                let target = editor.target(graph, class, id)?;
                Ok(graph.remove_cascading(schema, target).len())
            })
            .await?;
        debug!(
            "Deleted {} {} from session {} ({} instances removed)",
            class_name, id, session_id, removed
        );
        Ok(removed)
    }
}

fn resolve_class<'s>(schema: &'s Schema, class_name: &str) -> EngineResult<&'s ClassDefinition> {
    schema
        .find_class(class_name)
        .ok_or_else(|| EngineError::ClassNotFound {
            class_name: class_name.to_string(),
        })
}

fn resolve_feature<'c>(class: &'c ClassDefinition, feature_name: &str) -> EngineResult<&'c FeatureDef> {
    class
        .feature(feature_name)
        .ok_or_else(|| EngineError::FeatureNotFound {
            class_name: class.name.clone(),
            feature: feature_name.to_string(),
        })
}

/// Applies feature-level changes to one graph using a session's schema.
struct Editor<'a> {
    schema: &'a Schema,
    coercer: &'a TypeCoercer,
    strategy: IdentityStrategy,
}

impl<'a> Editor<'a> {
    fn new(schema: &'a Schema, coercer: &'a TypeCoercer, strategy: IdentityStrategy) -> Self {
        Self {
            schema,
            coercer,
            strategy,
        }
    }

    fn target(&self, graph: &InstanceGraph, class: &ClassDefinition, id: &str) -> EngineResult<InstanceId> {
        let instance = self
            .strategy
            .find_by_id(self.schema, graph, id)
            .ok_or_else(|| EngineError::InstanceNotFound {
                class_name: class.name.clone(),
                id: id.to_string(),
            })?;
        if instance.class != class.name {
            return Err(EngineError::ClassMismatch {
                id: id.to_string(),
                expected: class.name.clone(),
                actual: instance.class.clone(),
            });
        }
        Ok(instance.id)
    }

    fn apply_fields(
        &self,
        graph: &mut InstanceGraph,
        class: &ClassDefinition,
        target: InstanceId,
        fields: &Map<String, Value>,
    ) -> EngineResult<()> {
        for (name, value) in fields {
            let feature = resolve_feature(class, name)?;
            self.write(graph, target, feature, value, WriteMode::Replace)?;
        }
        Ok(())
    }

    fn write(
        &self,
        graph: &mut InstanceGraph,
        target: InstanceId,
        feature: &FeatureDef,
        input: &Value,
        mode: WriteMode,
    ) -> EngineResult<()> {
        match feature {
            FeatureDef::Attribute(a) => self.write_attribute(graph, target, a, input, mode),
            FeatureDef::Reference(r) => self.write_reference(graph, target, r, input, mode),
        }
    }

    fn write_attribute(
        &self,
        graph: &mut InstanceGraph,
        target: InstanceId,
        attribute: &AttributeDef,
        input: &Value,
        mode: WriteMode,
    ) -> EngineResult<()> {
        let value = if attribute.many {
            let mut items = match mode {
                WriteMode::Replace => Vec::new(),
                WriteMode::Append => match current(graph, target, &attribute.name) {
                    FeatureValue::ScalarSeq(existing) => existing.clone(),
                    _ => Vec::new(),
                },
            };
            let input = match mode {
                WriteMode::Append => as_sequence(input),
                WriteMode::Replace => input.clone(),
            };
            items.extend(self.coercer.parse_many(self.schema, &attribute.data_type, &input)?);
            FeatureValue::ScalarSeq(items)
        } else {
            match self.coercer.parse_scalar(self.schema, &attribute.data_type, input)? {
                Some(scalar) => FeatureValue::Scalar(scalar),
                None => FeatureValue::Absent,
            }
        };
        graph.set_value(target, &attribute.name, value);
        Ok(())
    }

    fn write_reference(
        &self,
        graph: &mut InstanceGraph,
        target: InstanceId,
        reference: &ReferenceDef,
        input: &Value,
        mode: WriteMode,
    ) -> EngineResult<()> {
        if !reference.many {
            if input.is_null() {
                return self.assign(graph, target, reference, Vec::new());
            }
            let key = reference_key(input).unwrap_or_else(|| input.to_string());
            let found = self
                .strategy
                .resolve_reference(self.schema, graph, input)
                .ok_or_else(|| EngineError::ReferenceNotFound {
                    reference: key.clone(),
                })?;
            if !self.compatible(found, reference) {
                return Err(EngineError::InvalidReferenceTarget {
                    feature: reference.name.clone(),
                    reference: key,
                    expected: reference.target.clone(),
                    actual: found.class.clone(),
                });
            }
            let id = found.id;
            return self.assign(graph, target, reference, vec![id]);
        }

        let elements = match (input, mode) {
            (Value::Array(items), _) => items.clone(),
            (Value::Null, _) => Vec::new(),
            (other, WriteMode::Append) => vec![other.clone()],
            (_, WriteMode::Replace) => Vec::new(),
        };
        let mut ids = match mode {
            WriteMode::Replace => Vec::new(),
            WriteMode::Append => current(graph, target, &reference.name).ref_ids(),
        };
        for element in &elements {
            match self.strategy.resolve_reference(self.schema, graph, element) {
                Some(found) if self.compatible(found, reference) => ids.push(found.id),
                Some(found) => debug!(
                    "Skipping {} {} for {}: not a {}",
                    found.class, found.id, reference.name, reference.target
                ),
                None => debug!("Skipping unresolved element {} for {}", element, reference.name),
            }
        }
        self.assign(graph, target, reference, ids)
    }

    fn compatible(&self, instance: &Instance, reference: &ReferenceDef) -> bool {
        self.schema
            .class(&instance.class)
            .is_some_and(|c| c.conforms_to(&reference.target))
    }

    /// Store the new reference list. For containment features the incoming
    /// children are detached from their previous location first and children
    /// that are no longer held become roots.
    fn assign(
        &self,
        graph: &mut InstanceGraph,
        target: InstanceId,
        reference: &ReferenceDef,
        ids: Vec<InstanceId>,
    ) -> EngineResult<()> {
        let name = reference.name.as_str();
        let previous = current(graph, target, name).ref_ids();
        let ids: Vec<InstanceId> = if reference.containment {
            ids.into_iter().unique().collect()
        } else {
            ids
        };

        if reference.containment {
            for child in &ids {
                if graph.is_ancestor_or_self(*child, target) {
                    return Err(EngineError::ContainmentCycle {
                        feature: reference.name.clone(),
                        child: self.identity(graph, *child),
                    });
                }
            }
            for child in &ids {
                let already_here = graph.get(*child).is_some_and(|c| c.is_contained_in(target, name));
                if !already_here {
                    graph.detach(*child);
                }
            }
        }

        let value = match (reference.many, ids.first()) {
            (true, _) => FeatureValue::RefSeq(ids.clone()),
            (false, Some(id)) => FeatureValue::Ref(*id),
            (false, None) => FeatureValue::Absent,
        };
        graph.set_value(target, name, value);

        if reference.containment {
            for child in &ids {
                graph.set_container(
                    *child,
                    Some(Container {
                        parent: target,
                        feature: name.to_string(),
                    }),
                );
            }
            for old in previous.iter().filter(|old| !ids.contains(old)) {
                release(graph, target, name, *old);
            }
        }
        Ok(())
    }

    fn remove(
        &self,
        graph: &mut InstanceGraph,
        target: InstanceId,
        feature: &FeatureDef,
        key: &RemoveKey,
    ) -> EngineResult<()> {
        if !feature.is_many() {
            self.clear(graph, target, feature);
            return Ok(());
        }
        let name = feature.name();
        let out_of_bounds = |index: i64, len: usize| EngineError::IndexOutOfBounds {
            feature: name.to_string(),
            index,
            len,
        };
        let not_found = |element: &String| EngineError::ElementNotFound {
            feature: name.to_string(),
            element: element.clone(),
        };

        match feature {
            FeatureDef::Attribute(a) => {
                let mut items = match current(graph, target, name) {
                    FeatureValue::ScalarSeq(items) => items.clone(),
                    _ => Vec::new(),
                };
                let position = match key {
                    RemoveKey::Index(index) => checked_index(*index, items.len())
                        .ok_or_else(|| out_of_bounds(*index, items.len()))?,
                    RemoveKey::Value(text) => {
                        let kind = self.coercer.resolve_kind(self.schema, &a.data_type);
                        let wanted = parse_text(kind, &a.data_type, text)?.ok_or_else(|| not_found(text))?;
                        items
                            .iter()
                            .position(|item| *item == wanted)
                            .ok_or_else(|| not_found(text))?
                    }
                };
                items.remove(position);
                graph.set_value(target, name, FeatureValue::ScalarSeq(items));
            }
            FeatureDef::Reference(r) => {
                let mut ids = current(graph, target, name).ref_ids();
                let position = match key {
                    RemoveKey::Index(index) => checked_index(*index, ids.len())
                        .ok_or_else(|| out_of_bounds(*index, ids.len()))?,
                    RemoveKey::Value(identity) => {
                        let wanted = self
                            .strategy
                            .find_by_id(self.schema, graph, identity)
                            .map(|i| i.id)
                            .ok_or_else(|| not_found(identity))?;
                        ids.iter()
                            .position(|id| *id == wanted)
                            .ok_or_else(|| not_found(identity))?
                    }
                };
                let removed = ids.remove(position);
                graph.set_value(target, name, FeatureValue::RefSeq(ids.clone()));
                if r.containment && !ids.contains(&removed) {
                    release(graph, target, name, removed);
                }
            }
        }
        Ok(())
    }

    fn clear(&self, graph: &mut InstanceGraph, target: InstanceId, feature: &FeatureDef) {
        let name = feature.name();
        let previous = current(graph, target, name).ref_ids();
        let value = match feature {
            FeatureDef::Attribute(a) if a.many => FeatureValue::ScalarSeq(Vec::new()),
            FeatureDef::Reference(r) if r.many => FeatureValue::RefSeq(Vec::new()),
            _ => FeatureValue::Absent,
        };
        graph.set_value(target, name, value);
        if feature.is_containment() {
            for child in previous {
                release(graph, target, name, child);
            }
        }
    }

    fn identity(&self, graph: &InstanceGraph, id: InstanceId) -> String {
        self.strategy
            .identity_of_id(self.schema, graph, id)
            .unwrap_or_else(|| id.to_string())
    }

    fn view(&self, graph: &InstanceGraph, id: InstanceId) -> EngineResult<InstanceView> {
        let instance = graph.get(id).ok_or_else(|| EngineError::InstanceNotFound {
            class_name: String::new(),
            id: id.to_string(),
        })?;
        self.project(graph, instance)
    }

    /// Shallow projection: every feature (own and inherited) with references
    /// rendered as identities.
    fn project(&self, graph: &InstanceGraph, instance: &Instance) -> EngineResult<InstanceView> {
        let class = self
            .schema
            .class(&instance.class)
            .ok_or_else(|| EngineError::ClassNotFound {
                class_name: instance.class.clone(),
            })?;
        let mut features = Map::new();
        for feature in class.all_features() {
            let value = instance.value(feature.name());
            let rendered = match (feature, value) {
                (_, FeatureValue::Scalar(v)) => v.to_json(),
                (_, FeatureValue::ScalarSeq(items)) => {
                    Value::Array(items.iter().map(|v| v.to_json()).collect())
                }
                (_, FeatureValue::Ref(id)) => self
                    .strategy
                    .identity_of_id(self.schema, graph, *id)
                    .map(Value::String)
                    .unwrap_or(Value::Null),
                (_, FeatureValue::RefSeq(ids)) => Value::Array(
                    ids.iter()
                        .filter_map(|id| self.strategy.identity_of_id(self.schema, graph, *id))
                        .map(Value::String)
                        .collect(),
                ),
                (f, FeatureValue::Absent) if f.is_many() => Value::Array(Vec::new()),
                (_, FeatureValue::Absent) => Value::Null,
            };
            features.insert(feature.name().to_string(), rendered);
        }
        Ok(InstanceView {
            id: self.strategy.identity_of(self.schema, instance),
            class: instance.class.clone(),
            features,
        })
    }
}

fn current<'g>(graph: &'g InstanceGraph, target: InstanceId, feature: &str) -> &'g FeatureValue {
    static ABSENT: FeatureValue = FeatureValue::Absent;
    graph.get(target).map_or(&ABSENT, |i| i.value(feature))
}

/// A child let go by its container becomes a root, unless it has already
/// moved elsewhere.
fn release(graph: &mut InstanceGraph, parent: InstanceId, feature: &str, child: InstanceId) {
    if graph.get(child).is_some_and(|c| c.is_contained_in(parent, feature)) {
        graph.make_root(child);
    }
}

fn as_sequence(input: &Value) -> Value {
    match input {
        Value::Array(_) => input.clone(),
        Value::Null => Value::Array(Vec::new()),
        other => Value::Array(vec![other.clone()]),
    }
}

fn checked_index(index: i64, len: usize) -> Option<usize> {
    usize::try_from(index).ok().filter(|i| *i < len)
}
