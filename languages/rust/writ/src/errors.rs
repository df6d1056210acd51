use thiserror::Error;

use std::fmt;

pub use writ_core::error::{ErrorKind, PolicyError};

/// Errors raised by the host library.
#[derive(Error, Debug)]
pub enum WritError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] PolicyError),

    #[error("failed to convert type from writ")]
    FromWrit,

    #[error("policy files must have the .writ extension. {filename} does not")]
    IncorrectFileType { filename: String },

    #[error("Inline query failed {location}")]
    InlineQueryFailed { location: String },

    #[error(transparent)]
    TypeError(TypeError),

    #[error(transparent)]
    InvalidCall(#[from] InvalidCallError),

    #[error("Unsupported operation {operation} for type {type_name}.")]
    UnsupportedOperation {
        operation: String,
        type_name: String,
    },

    #[error("Class {name} already registered")]
    DuplicateClassError { name: String },

    #[error("Unregistered class: {name}")]
    MissingClassError { name: String },

    #[error("Unregistered instance: {id}")]
    MissingInstanceError { id: u64 },

    #[error("{type_name} has no constructor")]
    MissingConstructorError { type_name: String },

    #[error("Error in {}: {source}", .attr.as_deref().unwrap_or("method"))]
    ApplicationError {
        source: Box<dyn std::error::Error + Send + Sync>,
        attr: Option<String>,
    },

    #[error("Data filtering is not configured for {class}: {missing}")]
    DataFilteringNotConfigured { class: String, missing: String },

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("{message}")]
    Custom { message: String },
}

impl WritError {
    /// Whether the error came from the policy parser or load-time validation.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            WritError::Core(e) if matches!(e.kind(), ErrorKind::Parse(_) | ErrorKind::Validation(_))
        )
    }
}

/// Outcome of a denied `authorize` call.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationError {
    /// The actor may read the resource but not perform the action.
    #[error("Forbidden")]
    Forbidden,
    /// The actor may not even learn the resource exists.
    #[error("Not found")]
    NotFound,
}

/// A method, attribute or class method the host could not resolve.
///
/// These are reported back to the VM as application errors, so a failed
/// lookup fails the current branch rather than the whole query (unless the
/// query is strict).
#[derive(Error, Debug)]
pub enum InvalidCallError {
    #[error("Class method {method_name} not found on type {type_name}.")]
    ClassMethodNotFound {
        method_name: String,
        type_name: String,
    },
    #[error("Method {method_name} not found on type {type_name}.")]
    MethodNotFound {
        method_name: String,
        type_name: String,
    },
    #[error("Attribute {attribute_name} not found on type {type_name}.")]
    AttributeNotFound {
        attribute_name: String,
        type_name: String,
    },
    #[error("{type_name} does not take keyword arguments.")]
    KeywordArguments { type_name: String },
}

/// A value had a different type than the one asked for.
#[derive(Debug, Clone)]
pub struct TypeError {
    pub got: Option<String>,
    pub expected: String,
}

impl std::error::Error for TypeError {}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.got {
            Some(got) => write!(f, "Type error: Expected {} got {}", self.expected, got),
            None => write!(f, "Type error: Expected {}.", self.expected),
        }
    }
}

impl TypeError {
    pub fn expected<T: Into<String>>(expected: T) -> Self {
        Self {
            got: None,
            expected: expected.into(),
        }
    }

    pub fn got<T: Into<String>>(mut self, got: T) -> Self {
        self.got.replace(got.into());
        self
    }

    /// The caller handed us the wrong type.
    pub fn user(self) -> WritError {
        WritError::TypeError(self)
    }

    /// We handed ourselves the wrong type: a bug in the host library.
    pub fn invariant(self) -> WritError {
        WritError::Custom {
            message: format!("Internal type error, this is a bug: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, WritError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_errors_read_naturally() {
        let err = TypeError::expected("Integer").got("String").user();
        assert_eq!(err.to_string(), "Type error: Expected Integer got String");
        let err = TypeError::expected("Integer").user();
        assert_eq!(err.to_string(), "Type error: Expected Integer.");
    }

    #[test]
    fn application_errors_name_the_attribute() {
        let err = WritError::ApplicationError {
            source: "boom".into(),
            attr: Some("name".to_owned()),
        };
        assert_eq!(err.to_string(), "Error in name: boom");
    }
}
