use serde::{Deserialize, Serialize};

/// Stable tag for every failure the engine can report.
/// Serialized verbatim into error responses so clients can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SchemaParseError,
    SessionNotFound,
    ClassNotFound,
    AbstractClass,
    InstanceNotFound,
    ClassMismatch,
    FeatureNotFound,
    TypeCoercionError,
    ReferenceNotFound,
    InvalidReferenceTarget,
    ContainmentCycle,
    IndexOutOfBounds,
    ElementNotFound,
    InvalidRequest,
    PersistenceError,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid schema: {message}")]
    SchemaParse { message: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Class not found: {class_name}")]
    ClassNotFound { class_name: String },

    #[error("Class '{class_name}' is abstract and cannot be instantiated")]
    AbstractClass { class_name: String },

    #[error("Object not found: {class_name}/{id}")]
    InstanceNotFound { class_name: String, id: String },

    #[error("Object '{id}' is of type '{actual}', not '{expected}'")]
    ClassMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Feature not found: {class_name}.{feature}")]
    FeatureNotFound { class_name: String, feature: String },

    #[error("Invalid value for type {type_name}: {value}")]
    TypeCoercion { type_name: String, value: String },

    #[error("Referenced object not found: {reference}")]
    ReferenceNotFound { reference: String },

    #[error("Object '{reference}' of type '{actual}' cannot be assigned to {feature} (expects {expected})")]
    InvalidReferenceTarget {
        feature: String,
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("Assigning '{child}' to {feature} would make it contain itself")]
    ContainmentCycle { feature: String, child: String },

    #[error("Index {index} out of bounds for {feature} (length {len})")]
    IndexOutOfBounds {
        feature: String,
        index: i64,
        len: usize,
    },

    #[error("Element '{element}' not found in {feature}")]
    ElementNotFound { feature: String, element: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Persistence failed: {message}")]
    Persistence { message: String },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::SchemaParse { .. } => ErrorKind::SchemaParseError,
            EngineError::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            EngineError::ClassNotFound { .. } => ErrorKind::ClassNotFound,
            EngineError::AbstractClass { .. } => ErrorKind::AbstractClass,
            EngineError::InstanceNotFound { .. } => ErrorKind::InstanceNotFound,
            EngineError::ClassMismatch { .. } => ErrorKind::ClassMismatch,
            EngineError::FeatureNotFound { .. } => ErrorKind::FeatureNotFound,
            EngineError::TypeCoercion { .. } => ErrorKind::TypeCoercionError,
            EngineError::ReferenceNotFound { .. } => ErrorKind::ReferenceNotFound,
            EngineError::InvalidReferenceTarget { .. } => ErrorKind::InvalidReferenceTarget,
            EngineError::ContainmentCycle { .. } => ErrorKind::ContainmentCycle,
            EngineError::IndexOutOfBounds { .. } => ErrorKind::IndexOutOfBounds,
            EngineError::ElementNotFound { .. } => ErrorKind::ElementNotFound,
            EngineError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            EngineError::Persistence { .. } => ErrorKind::PersistenceError,
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        EngineError::SchemaParse {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        EngineError::InvalidRequest {
            message: message.into(),
        }
    }

    /// Flatten a store failure (and its context chain) into a persistence error.
    pub fn persistence(err: anyhow::Error) -> Self {
        EngineError::Persistence {
            message: format!("{:#}", err),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offending_value() {
        let err = EngineError::TypeCoercion {
            type_name: "EInt".to_string(),
            value: "abc".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::TypeCoercionError);
        assert_eq!(err.to_string(), "Invalid value for type EInt: abc");
    }

    #[test]
    fn test_persistence_keeps_context_chain() {
        let err = anyhow::anyhow!("disk full").context("Failed to write model_abc.json");
        let err = EngineError::persistence(err);
        assert_eq!(err.kind(), ErrorKind::PersistenceError);
        assert!(err.to_string().contains("model_abc.json"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_kind_serializes_as_stable_tag() {
        let json = serde_json::to_string(&ErrorKind::IndexOutOfBounds).unwrap();
        assert_eq!(json, "\"IndexOutOfBounds\"");
    }
}
