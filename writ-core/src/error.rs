use std::fmt;

use serde::{Deserialize, Serialize};

use crate::formatting::ToPolicy;
use crate::sources::Source;
use crate::terms::{Operation, Symbol, Term};

pub type PolicyResult<T> = std::result::Result<T, PolicyError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "FormattedPolicyError")]
pub struct PolicyError {
    pub kind: ErrorKind,
    pub context: Option<ErrorContext>,
}

/// Wire shape of an error: the kind plus its rendered message.
#[derive(Clone, Deserialize, Serialize)]
pub struct FormattedPolicyError {
    pub kind: ErrorKind,
    pub formatted: String,
}

impl From<PolicyError> for FormattedPolicyError {
    fn from(other: PolicyError) -> Self {
        Self {
            formatted: other.to_string(),
            kind: other.kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ErrorKind {
    Parse(ParseError),
    Runtime(RuntimeError),
    Operational(OperationalError),
    Validation(ValidationError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub source: Source,
    pub row: usize,
    pub column: usize,
}

impl ErrorContext {
    fn at(source: &Source, offset: usize) -> Self {
        let (row, column) = source.position(offset);
        Self {
            source: source.clone(),
            row,
            column,
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, " at line {}, column {}", self.row + 1, self.column + 1)?;
        if let Some(filename) = &self.source.filename {
            write!(f, " in file {}", filename)?;
        }
        Ok(())
    }
}

impl PolicyError {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Locate a parse error within the text it came from.
    pub fn with_source(mut self, source: &Source) -> Self {
        if let ErrorKind::Parse(e) = &self.kind {
            self.context = Some(ErrorContext::at(source, e.loc()));
        }
        self
    }

    /// Point the error at the term that caused it, if that term was parsed.
    pub fn with_term(mut self, term: &Term) -> Self {
        if self.context.is_none() {
            if let Some((source, left, _)) = term.source_info.span() {
                self.context = Some(ErrorContext::at(source, left));
            }
        }
        self
    }

    pub fn is_parse_error(&self) -> bool {
        matches!(self.kind, ErrorKind::Parse(_) | ErrorKind::Validation(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Runtime(RuntimeError::QueryTimeout { .. }))
    }

    /// Errors that only fail the current branch instead of the whole query.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Runtime(RuntimeError::Application { .. })
                | ErrorKind::Runtime(RuntimeError::QueryForUndefinedRule { .. })
        )
    }
}

impl std::error::Error for PolicyError {}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::Parse(e) => write!(f, "{}", e)?,
            ErrorKind::Runtime(e) => write!(f, "{}", e)?,
            ErrorKind::Operational(e) => write!(f, "{}", e)?,
            ErrorKind::Validation(e) => write!(f, "{}", e)?,
        }
        if let Some(context) = &self.context {
            write!(f, "{}", context)?;
        }
        Ok(())
    }
}

macro_rules! into_policy_error {
    ($($err:ident => $kind:ident),*) => {
        $(impl From<$err> for PolicyError {
            fn from(err: $err) -> Self {
                Self {
                    kind: ErrorKind::$kind(err),
                    context: None,
                }
            }
        })*
    };
}

into_policy_error!(
    ParseError => Parse,
    RuntimeError => Runtime,
    OperationalError => Operational,
    ValidationError => Validation
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParseError {
    IntegerOverflow { token: String, loc: usize },
    InvalidTokenCharacter { token: String, c: char, loc: usize },
    InvalidToken { loc: usize },
    InvalidEscape { token: String, loc: usize },
    UnrecognizedEOF { loc: usize },
    UnrecognizedToken { token: String, expected: Vec<String>, loc: usize },
    ExtraToken { token: String, loc: usize },
    ReservedWord { token: String, loc: usize },
    InvalidFloat { token: String, loc: usize },
    WrongValueType { term: Term, expected: String, loc: usize },
    DuplicateKey { key: String, loc: usize },
}

impl ParseError {
    pub fn loc(&self) -> usize {
        match self {
            Self::IntegerOverflow { loc, .. }
            | Self::InvalidTokenCharacter { loc, .. }
            | Self::InvalidToken { loc }
            | Self::InvalidEscape { loc, .. }
            | Self::UnrecognizedEOF { loc }
            | Self::UnrecognizedToken { loc, .. }
            | Self::ExtraToken { loc, .. }
            | Self::ReservedWord { loc, .. }
            | Self::InvalidFloat { loc, .. }
            | Self::WrongValueType { loc, .. }
            | Self::DuplicateKey { loc, .. } => *loc,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::IntegerOverflow { token, .. } => {
                write!(f, "'{}' caused an integer overflow", token.escape_debug())
            }
            Self::InvalidTokenCharacter { token, c, .. } => write!(
                f,
                "'{}' is not a valid character. Found in {}",
                c.escape_debug(),
                token.escape_debug()
            ),
            Self::InvalidToken { .. } => write!(f, "found an unexpected sequence of characters"),
            Self::InvalidEscape { token, .. } => {
                write!(f, "'\\{}' is not a valid escape sequence", token.escape_debug())
            }
            Self::UnrecognizedEOF { .. } => write!(
                f,
                "hit the end of the file unexpectedly. Did you forget a semi-colon"
            ),
            Self::UnrecognizedToken {
                token, expected, ..
            } => {
                write!(f, "did not expect to find the token '{}'", token.escape_debug())?;
                if !expected.is_empty() {
                    write!(f, ", expected one of: {}", expected.join(", "))?;
                }
                Ok(())
            }
            Self::ExtraToken { token, .. } => write!(
                f,
                "did not expect to find the token '{}' after the end of the input",
                token.escape_debug()
            ),
            Self::ReservedWord { token, .. } => write!(
                f,
                "{} is a reserved word and cannot be used here",
                token.escape_debug()
            ),
            Self::InvalidFloat { token, .. } => write!(
                f,
                "{} was parsed as a float, but is invalid",
                token.escape_debug()
            ),
            Self::WrongValueType { term, expected, .. } => {
                write!(f, "wrong value type: {}. Expected a {}", term.to_policy(), expected)
            }
            Self::DuplicateKey { key, .. } => write!(f, "duplicate dictionary key '{}'", key),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RuntimeError {
    ArithmeticError {
        msg: String,
    },
    Unsupported {
        msg: String,
    },
    TypeError {
        msg: String,
        stack_trace: Option<String>,
    },
    UnboundVariable {
        sym: Symbol,
    },
    StackOverflow {
        msg: String,
    },
    QueryTimeout {
        msg: String,
    },
    Application {
        msg: String,
        stack_trace: Option<String>,
    },
    IncompatibleBindings {
        msg: String,
    },
    UnhandledPartial {
        var: Symbol,
        term: Term,
    },
    QueryForUndefinedRule {
        name: String,
        arity: usize,
    },
    DataFilteringFieldMissing {
        var_type: String,
        field: String,
    },
    DataFilteringUnsupportedOp {
        operation: Operation,
    },
    InvalidRegistration {
        sym: Symbol,
        msg: String,
    },
    FileLoading {
        msg: String,
    },
}

impl RuntimeError {
    /// Attach the rule activation stack to errors that carry one.
    pub fn with_stack_trace(mut self, trace: String) -> Self {
        if let Self::Application { stack_trace, .. } | Self::TypeError { stack_trace, .. } =
            &mut self
        {
            *stack_trace = Some(trace);
        }
        self
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ArithmeticError { msg } => write!(f, "Arithmetic error: {}", msg),
            Self::Unsupported { msg } => write!(f, "Not supported: {}", msg),
            Self::TypeError { msg, stack_trace } => {
                if let Some(stack_trace) = stack_trace {
                    writeln!(f, "{}", stack_trace)?;
                }
                write!(f, "Type error: {}", msg)
            }
            Self::UnboundVariable { sym } => write!(f, "{} is an unbound variable", sym.0),
            Self::StackOverflow { msg } => write!(f, "Hit a stack limit: {}", msg),
            Self::QueryTimeout { msg } => write!(f, "Query timeout: {}", msg),
            Self::Application { msg, stack_trace } => {
                if let Some(stack_trace) = stack_trace {
                    writeln!(f, "{}", stack_trace)?;
                }
                write!(f, "Application error: {}", msg)
            }
            Self::IncompatibleBindings { msg } => {
                write!(f, "Attempted binding was incompatible: {}", msg)
            }
            Self::UnhandledPartial { var, term } => write!(
                f,
                "Found an unhandled partial in the query result: {} = {}. \
                 Results with residual constraints require accept_expression.",
                var,
                term.to_policy()
            ),
            Self::QueryForUndefinedRule { name, arity } => write!(
                f,
                "Query for undefined rule `{}` with {} argument{}",
                name,
                arity,
                if *arity == 1 { "" } else { "s" }
            ),
            Self::DataFilteringFieldMissing { var_type, field } => write!(
                f,
                "Unregistered field or relation: {}.{}. Declare it when registering {}.",
                var_type, field, var_type
            ),
            Self::DataFilteringUnsupportedOp { operation } => write!(
                f,
                "Unsupported operation in data filtering: {}",
                operation.to_policy()
            ),
            Self::InvalidRegistration { sym, msg } => {
                write!(f, "Invalid attempt to register '{}': {}", sym, msg)
            }
            Self::FileLoading { msg } => write!(f, "Problem loading file: {}", msg),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalError {
    InvalidState { msg: String },
    Serialization { msg: String },
    Unknown,
}

impl fmt::Display for OperationalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidState { msg } => write!(f, "Invalid state: {}", msg),
            Self::Serialization { msg } => write!(f, "Serialization error: {}", msg),
            Self::Unknown => write!(
                f,
                "We hit an error we do not know how to handle or did not expect. Please submit a bug"
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ValidationError {
    /// A pattern names a class the host never registered.
    UnregisteredClass { term: Term },
    /// A resource block is internally inconsistent.
    ResourceBlock { term: Term, msg: String },
    DuplicateResourceBlockDeclaration {
        resource: Term,
        declaration: Term,
        existing: String,
        new: String,
    },
    InvalidRule { rule: String, msg: String },
    InvalidRuleType { rule_type: String, msg: String },
    FileLoading { msg: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnregisteredClass { term } => {
                write!(f, "Unregistered class: {}", term.to_policy())
            }
            Self::ResourceBlock { msg, .. } => write!(f, "{}", msg),
            Self::DuplicateResourceBlockDeclaration {
                resource,
                declaration,
                existing,
                new,
            } => write!(
                f,
                "Cannot overwrite existing {} declaration {} in resource {} with {}",
                existing,
                declaration.to_policy(),
                resource.to_policy(),
                new
            ),
            Self::InvalidRule { rule, msg } => write!(f, "Invalid rule: {} {}", rule, msg),
            Self::InvalidRuleType { rule_type, msg } => {
                write!(f, "Invalid rule type: {} {}", rule_type, msg)
            }
            Self::FileLoading { msg } => write!(f, "Problem loading file: {}", msg),
        }
    }
}

pub fn invalid_state<T, S: Into<String>>(msg: S) -> PolicyResult<T> {
    Err(OperationalError::InvalidState { msg: msg.into() }.into())
}

pub fn unsupported<T, S: Into<String>>(msg: S, term: &Term) -> PolicyResult<T> {
    Err(PolicyError::from(RuntimeError::Unsupported { msg: msg.into() }).with_term(term))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::terms::Value;

    #[test]
    fn test_parse_error_location() {
        let source = Source::new_with_name("policy.writ", "f(x);\ng(;");
        let err = PolicyError::from(ParseError::UnrecognizedToken {
            token: ";".to_owned(),
            expected: vec![],
            loc: 8,
        })
        .with_source(&source);
        assert_eq!(
            err.to_string(),
            "did not expect to find the token ';' at line 2, column 3 in file policy.writ"
        );
        assert!(err.is_parse_error());
    }

    #[test]
    fn test_term_context() {
        let source = Arc::new(Source::new("allow(x) if x > 1;"));
        let term = Term::new_from_parser(source, 12, 17, Value::Boolean(true));
        let err = PolicyError::from(RuntimeError::ArithmeticError {
            msg: "overflow".to_owned(),
        })
        .with_term(&term);
        assert_eq!(err.to_string(), "Arithmetic error: overflow at line 1, column 13");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_stack_trace_attaches() {
        let err = RuntimeError::Application {
            msg: "boom".to_owned(),
            stack_trace: None,
        }
        .with_stack_trace("trace:\n  in query f()".to_owned());
        assert_eq!(err.to_string(), "trace:\n  in query f()\nApplication error: boom");
    }
}
