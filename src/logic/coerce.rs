use log::debug;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::logic::SchemaRegistry;
use crate::model::{Id, ScalarKind, ScalarValue, Schema};

/// Converts request values into typed scalars for an attribute's data type.
///
/// A data type either declares its kind, or gets one inferred from its name
/// (unrecognised names become strings). The outcome is memoized per schema
/// and type name so the lookup happens once.
#[derive(Debug)]
pub struct TypeCoercer {
    registry: Arc<SchemaRegistry>,
    resolved: Mutex<HashMap<(Id, String), ScalarKind>>,
}

impl TypeCoercer {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve_kind(&self, schema: &Schema, type_name: &str) -> ScalarKind {
        let mut resolved = self.resolved.lock();
        let key = (schema.id.clone(), type_name.to_string());
        if let Some(kind) = resolved.get(&key) {
            return *kind;
        }

        let declared = schema
            .data_type(type_name)
            .cloned()
            .or_else(|| self.registry.resolve_data_type(type_name));
        let kind = match declared.and_then(|d| d.kind) {
            Some(kind) => kind,
            None => {
                let local_name = type_name.rsplit('#').next().unwrap_or(type_name);
                let kind = ScalarKind::from_type_name(local_name).unwrap_or(ScalarKind::String);
                debug!("Data type '{}' has no declared kind, using {:?}", type_name, kind);
                kind
            }
        };
        resolved.insert(key, kind);
        kind
    }

    /// Forget memoized kinds of a schema that is going away
    pub fn forget(&self, schema: &Schema) {
        self.resolved.lock().retain(|(id, _), _| *id != schema.id);
    }

    /// Coerce one JSON value. `null` and empty text for non-string types yield
    /// `None` (the value is absent).
    pub fn parse_scalar(
        &self,
        schema: &Schema,
        type_name: &str,
        input: &Value,
    ) -> EngineResult<Option<ScalarValue>> {
        let text = match input {
            Value::Null => return Ok(None),
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(EngineError::TypeCoercion {
                    type_name: type_name.to_string(),
                    value: other.to_string(),
                })
            }
        };
        parse_text(self.resolve_kind(schema, type_name), type_name, &text)
    }

    /// Element-wise coercion for many-valued attributes. Anything that is not
    /// a JSON array yields an empty sequence; null elements are skipped.
    pub fn parse_many(
        &self,
        schema: &Schema,
        type_name: &str,
        input: &Value,
    ) -> EngineResult<Vec<ScalarValue>> {
        let Value::Array(items) = input else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if let Some(value) = self.parse_scalar(schema, type_name, item)? {
                out.push(value);
            }
        }
        Ok(out)
    }
}

pub fn parse_text(kind: ScalarKind, type_name: &str, text: &str) -> EngineResult<Option<ScalarValue>> {
    if kind == ScalarKind::String {
        return Ok(Some(ScalarValue::String(text.to_string())));
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let reject = || EngineError::TypeCoercion {
        type_name: type_name.to_string(),
        value: text.to_string(),
    };
    let value = match kind {
        ScalarKind::String => unreachable!("handled above"),
        ScalarKind::Int => ScalarValue::Int(trimmed.parse().map_err(|_| reject())?),
        ScalarKind::Long => ScalarValue::Long(trimmed.parse().map_err(|_| reject())?),
        ScalarKind::Float => ScalarValue::Float(trimmed.parse().map_err(|_| reject())?),
        ScalarKind::Double => ScalarValue::Double(trimmed.parse().map_err(|_| reject())?),
        ScalarKind::Bool => {
            if trimmed.eq_ignore_ascii_case("true") {
                ScalarValue::Bool(true)
            } else if trimmed.eq_ignore_ascii_case("false") {
                ScalarValue::Bool(false)
            } else {
                return Err(reject());
            }
        }
    };
    Ok(Some(value))
}
