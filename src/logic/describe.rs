use itertools::Itertools;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::model::{FeatureDef, Multiplicity, ScalarKind, Schema};

/// Generic endpoints available for one loaded schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Description {
    pub schema: String,
    pub ns_uri: String,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    /// One per non-abstract class
    Create { class: String, path: String },
    /// One per feature (own and inherited) of every class; covers update,
    /// append, remove and clear on that feature.
    UpdateFeature {
        class: String,
        feature: String,
        path: String,
        multiplicity: Multiplicity,
        #[serde(rename = "valueType")]
        value_type: String,
        containment: bool,
    },
}

/// Derive the description from the schema alone. Classes appear in document
/// order, features in merged order, so the same schema always yields the
/// same description.
pub fn describe(schema: &Schema) -> Description {
    let mut operations = Vec::new();
    for class in schema.classes() {
        let class_path = format!("/sessions/{{sessionId}}/model/{}", class.name);
        if !class.is_abstract {
            operations.push(Operation::Create {
                class: class.name.clone(),
                path: class_path.clone(),
            });
        }
        for feature in class.all_features() {
            operations.push(Operation::UpdateFeature {
                class: class.name.clone(),
                feature: feature.name().to_string(),
                path: format!("{}/{{id}}/{}", class_path, feature.name()),
                multiplicity: feature.multiplicity(),
                value_type: value_type(schema, feature),
                containment: feature.is_containment(),
            });
        }
    }
    Description {
        schema: schema.name.clone(),
        ns_uri: schema.ns_uri.clone(),
        operations,
    }
}

fn value_type(schema: &Schema, feature: &FeatureDef) -> String {
    match feature {
        FeatureDef::Reference(r) => r.target.clone(),
        FeatureDef::Attribute(a) => {
            let local = a.data_type.rsplit('#').next().unwrap_or(&a.data_type);
            schema
                .data_type(&a.data_type)
                .and_then(|d| d.kind)
                .or_else(|| ScalarKind::from_type_name(local))
                .unwrap_or(ScalarKind::String)
                .json_type()
                .to_string()
        }
    }
}

impl Description {
    /// Render as an OpenAPI 3 document.
    pub fn to_openapi(&self) -> Value {
        let mut paths = Map::new();
        let by_path = self.operations.iter().into_group_map_by(|op| match op {
            Operation::Create { path, .. } | Operation::UpdateFeature { path, .. } => path.clone(),
        });
        for (path, ops) in by_path.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
            let mut item = Map::new();
            for op in ops {
                match op {
                    Operation::Create { class, .. } => {
                        item.insert(
                            "post".to_string(),
                            json!({
                                "summary": format!("Create {}", class),
                                "requestBody": { "required": false, "content": {
                                    "application/json": { "schema": { "type": "object" } }
                                }},
                                "responses": { "200": { "description": format!("{} created", class) } }
                            }),
                        );
                    }
                    Operation::UpdateFeature {
                        class,
                        feature,
                        multiplicity,
                        value_type,
                        containment,
                        ..
                    } => {
                        let value_schema = if multiplicity.is_many() {
                            json!({ "type": "array", "items": { "x-type": value_type } })
                        } else {
                            json!({ "x-type": value_type })
                        };
                        item.insert(
                            "put".to_string(),
                            json!({
                                "summary": format!("Update {}.{}", class, feature),
                                "parameters": [{ "name": "id", "in": "path", "required": true,
                                                 "schema": { "type": "string" } }],
                                "requestBody": { "required": true, "content": {
                                    "application/json": { "schema": {
                                        "type": "object",
                                        "properties": { "value": value_schema }
                                    }}
                                }},
                                "x-containment": containment,
                                "responses": { "200": { "description": "Feature updated" } }
                            }),
                        );
                        item.insert(
                            "delete".to_string(),
                            json!({
                                "summary": format!("Clear {}.{}", class, feature),
                                "x-containment": containment,
                                "responses": { "200": { "description": "Feature cleared" } }
                            }),
                        );
                    }
                }
            }
            paths.insert(path, Value::Object(item));
        }
        json!({
            "openapi": "3.0.0",
            "info": { "title": format!("{} model API", self.schema), "version": "1.0.0" },
            "paths": paths,
        })
    }
}
