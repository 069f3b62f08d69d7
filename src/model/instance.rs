use crate::model::{InstanceId, ScalarKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ScalarValue {
    String(String),
    Int(i32),
    Long(i64),
    Bool(bool),
    Float(f32),
    Double(f64),
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarValue::String(_) => ScalarKind::String,
            ScalarValue::Int(_) => ScalarKind::Int,
            ScalarValue::Long(_) => ScalarKind::Long,
            ScalarValue::Bool(_) => ScalarKind::Bool,
            ScalarValue::Float(_) => ScalarKind::Float,
            ScalarValue::Double(_) => ScalarKind::Double,
        }
    }

    /// Canonical textual form, the inverse of coercion
    pub fn to_text(&self) -> String {
        match self {
            ScalarValue::String(s) => s.clone(),
            ScalarValue::Int(v) => v.to_string(),
            ScalarValue::Long(v) => v.to_string(),
            ScalarValue::Bool(v) => v.to_string(),
            ScalarValue::Float(v) => v.to_string(),
            ScalarValue::Double(v) => v.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ScalarValue::String(s) => Value::String(s.clone()),
            ScalarValue::Int(v) => Value::from(*v),
            ScalarValue::Long(v) => Value::from(*v),
            ScalarValue::Bool(v) => Value::Bool(*v),
            // Go through the shortest decimal form so 0.1f32 reads back as 0.1
            ScalarValue::Float(v) => v
                .to_string()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(v.to_string())),
            ScalarValue::Double(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(v.to_string())),
        }
    }
}

/// Stored value of one feature. A missing map entry reads as `Absent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FeatureValue {
    Absent,
    Scalar(ScalarValue),
    ScalarSeq(Vec<ScalarValue>),
    Ref(InstanceId),
    RefSeq(Vec<InstanceId>),
}

static ABSENT: FeatureValue = FeatureValue::Absent;

impl FeatureValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, FeatureValue::Absent)
    }

    /// Referenced instances, in order
    pub fn ref_ids(&self) -> Vec<InstanceId> {
        match self {
            FeatureValue::Ref(id) => vec![*id],
            FeatureValue::RefSeq(ids) => ids.clone(),
            _ => Vec::new(),
        }
    }

    pub fn references(&self, id: InstanceId) -> bool {
        match self {
            FeatureValue::Ref(r) => *r == id,
            FeatureValue::RefSeq(ids) => ids.contains(&id),
            _ => false,
        }
    }
}

/// Where a contained instance lives: the owning instance and the containment
/// feature holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub parent: InstanceId,
    pub feature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub class: String,
    #[serde(default)]
    pub values: BTreeMap<String, FeatureValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
}

impl Instance {
    pub fn new(id: InstanceId, class: impl Into<String>) -> Self {
        Self {
            id,
            class: class.into(),
            values: BTreeMap::new(),
            container: None,
        }
    }

    pub fn value(&self, feature: &str) -> &FeatureValue {
        self.values.get(feature).unwrap_or(&ABSENT)
    }

    pub fn set_value(&mut self, feature: &str, value: FeatureValue) {
        if value.is_absent() {
            self.values.remove(feature);
        } else {
            self.values.insert(feature.to_string(), value);
        }
    }

    pub fn is_contained_in(&self, parent: InstanceId, feature: &str) -> bool {
        matches!(&self.container, Some(c) if c.parent == parent && c.feature == feature)
    }
}

/// Shallow projection returned by reads: references are rendered as the
/// identities of their targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: Option<String>,
    pub class: String,
    pub features: serde_json::Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_json_forms() {
        assert_eq!(ScalarValue::Int(42).to_json(), json!(42));
        assert_eq!(ScalarValue::Float(0.1).to_json(), json!(0.1));
        assert_eq!(ScalarValue::Double(2.5).to_json(), json!(2.5));
        assert_eq!(ScalarValue::Bool(true).to_text(), "true");
        assert_eq!(ScalarValue::Double(f64::NAN).to_json(), json!("NaN"));
    }

    #[test]
    fn test_absent_values_are_not_stored() {
        let mut instance = Instance::new(InstanceId(1), "Person");
        instance.set_value("age", FeatureValue::Scalar(ScalarValue::Int(3)));
        assert_eq!(instance.values.len(), 1);
        instance.set_value("age", FeatureValue::Absent);
        assert!(instance.values.is_empty());
        assert!(instance.value("age").is_absent());
    }

    #[test]
    fn test_persisted_form_is_tagged() {
        let mut instance = Instance::new(InstanceId(7), "Team");
        instance.set_value("members", FeatureValue::RefSeq(vec![InstanceId(8)]));
        let json = serde_json::to_value(&instance).unwrap();
        assert_eq!(json["values"]["members"], json!({ "kind": "ref_seq", "value": [8] }));
        let back: Instance = serde_json::from_value(json).unwrap();
        assert_eq!(back, instance);
    }
}
