use thiserror::Error;

/// Errors raised while interpreting a FHIR search request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("Unknown search parameter '{code}' for resource type '{resource_type}'")]
    UnknownParameter { resource_type: String, code: String },

    #[error("Modifier '{modifier}' is not allowed for search parameter '{code}' of type {param_type}")]
    ModifierNotAllowed {
        code: String,
        modifier: String,
        param_type: String,
    },

    #[error("Unknown modifier '{0}'")]
    UnknownModifier(String),

    #[error("Invalid value '{value}' for search parameter '{code}': {reason}")]
    InvalidValue {
        code: String,
        value: String,
        reason: String,
    },

    #[error("Invalid date '{0}'")]
    InvalidDate(String),

    #[error("Invalid escape sequence in '{0}'")]
    InvalidEscape(String),

    #[error("Invalid resource type '{0}'")]
    InvalidResourceType(String),

    #[error("Invalid search parameter definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid search: {0}")]
    Invalid(String),
}

impl SearchError {
    pub fn invalid_value(code: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            code: code.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;
