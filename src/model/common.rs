use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type Id = String;
pub type SessionId = String;

/// Internal key of an instance inside one graph. Issued monotonically by the
/// graph and never reused, even after the instance is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime representation of an attribute's primitive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    String,
    Int,
    Long,
    Bool,
    Float,
    Double,
}

impl ScalarKind {
    /// Canonical primitive-type name table. Returns None for names it does not
    /// recognise; callers decide the fallback.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "String" | "EString" | "string" => Some(ScalarKind::String),
            "int" | "Integer" | "EInt" | "EIntegerObject" => Some(ScalarKind::Int),
            "boolean" | "Boolean" | "EBoolean" | "EBooleanObject" => Some(ScalarKind::Bool),
            "float" | "Float" | "EFloat" | "EFloatObject" => Some(ScalarKind::Float),
            "double" | "Double" | "EDouble" | "EDoubleObject" => Some(ScalarKind::Double),
            "long" | "Long" | "ELong" | "ELongObject" => Some(ScalarKind::Long),
            _ => None,
        }
    }

    /// Type name used in generated API descriptions
    pub fn json_type(&self) -> &'static str {
        match self {
            ScalarKind::String => "string",
            ScalarKind::Int | ScalarKind::Long => "integer",
            ScalarKind::Bool => "boolean",
            ScalarKind::Float | ScalarKind::Double => "number",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Multiplicity {
    Single,
    Many,
}

impl Multiplicity {
    pub fn from_many(many: bool) -> Self {
        if many {
            Multiplicity::Many
        } else {
            Multiplicity::Single
        }
    }

    pub fn is_many(&self) -> bool {
        matches!(self, Multiplicity::Many)
    }
}

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_name_table() {
        assert_eq!(ScalarKind::from_type_name("EString"), Some(ScalarKind::String));
        assert_eq!(ScalarKind::from_type_name("Integer"), Some(ScalarKind::Int));
        assert_eq!(ScalarKind::from_type_name("boolean"), Some(ScalarKind::Bool));
        assert_eq!(ScalarKind::from_type_name("EDouble"), Some(ScalarKind::Double));
        assert_eq!(ScalarKind::from_type_name("long"), Some(ScalarKind::Long));
        assert_eq!(ScalarKind::from_type_name("EDate"), None);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(generate_id(), generate_id());
    }
}
