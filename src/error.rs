//! Typed errors: model integrity (build time) and query compilation/execution (run time).

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("missing reference: {kind} '{name}'")]
    MissingReference { kind: &'static str, name: String },
    #[error("duplicate entity type '{0}'")]
    DuplicateEntityType(String),
    #[error("duplicate property '{property}' on entity type '{entity}'")]
    DuplicateProperty { entity: String, property: String },
    #[error("duplicate navigation '{navigation}' on entity type '{entity}'")]
    DuplicateNavigation { entity: String, navigation: String },
    #[error("duplicate key {{{properties}}} on entity type '{entity}'")]
    DuplicateKey { entity: String, properties: String },
    #[error("duplicate foreign key {{{properties}}} on '{entity}' referencing '{principal}'")]
    DuplicateForeignKey {
        entity: String,
        properties: String,
        principal: String,
    },
    #[error("duplicate index {{{properties}}} on entity type '{entity}'")]
    DuplicateIndex { entity: String, properties: String },
    #[error("{kind} on entity type '{entity}' must contain at least one property")]
    EmptyPropertyList { kind: &'static str, entity: String },
    #[error("key property '{property}' on entity type '{entity}' cannot be nullable")]
    NullableKeyProperty { entity: String, property: String },
    #[error("entity type '{entity}' cannot declare a key: it derives from '{root}', keys are declared on the root type")]
    DerivedKey { entity: String, root: String },
    #[error("entity type '{entity}' is keyless and cannot define keys")]
    KeylessWithKey { entity: String },
    #[error("key {{{properties}}} on '{entity}' is referenced by a foreign key from '{dependent}' and cannot be removed")]
    KeyInUse {
        entity: String,
        properties: String,
        dependent: String,
    },
    #[error("entity type '{base}' cannot be the base type of '{entity}': {reason}")]
    InvalidBaseType {
        entity: String,
        base: String,
        reason: String,
    },
    #[error("navigation '{navigation}' on '{entity}' is incompatible with its relationship: {reason}")]
    IncompatibleNavigation {
        entity: String,
        navigation: String,
        reason: String,
    },
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("model load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("the expression '{expression}' could not be translated{}", .details.as_deref().map(|d| format!(": {}", d)).unwrap_or_default())]
    Translation {
        expression: String,
        details: Option<String>,
    },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("a second operation ('{attempted}') was started on this context instance before a previous operation ('{active}') completed")]
    ConcurrentAccess { active: String, attempted: String },
    #[error("data error materializing '{entity}': {message}")]
    Data { entity: String, message: String },
    #[error("the operation was cancelled")]
    Cancelled,
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

impl QueryError {
    pub fn translation(expression: impl std::fmt::Display) -> Self {
        QueryError::Translation {
            expression: expression.to_string(),
            details: None,
        }
    }

    pub fn translation_with(expression: impl std::fmt::Display, details: impl Into<String>) -> Self {
        QueryError::Translation {
            expression: expression.to_string(),
            details: Some(details.into()),
        }
    }

    pub fn data(entity: impl Into<String>, message: impl Into<String>) -> Self {
        QueryError::Data {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Model(_) => "model_error",
            QueryError::Translation { .. } => "translation_error",
            QueryError::InvalidOperation(_) => "invalid_operation",
            QueryError::ConcurrentAccess { .. } => "concurrent_access",
            QueryError::Data { .. } => "data_error",
            QueryError::Cancelled => "cancelled",
            QueryError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    "not_found"
                } else {
                    "database_error"
                }
            }
        }
    }
}

pub type Result<T, E = QueryError> = std::result::Result<T, E>;
