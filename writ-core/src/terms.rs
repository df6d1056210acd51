//! The runtime value model shared by the parser, the knowledge base and the VM.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use super::numerics::Numeric;
use super::error::{PolicyResult, RuntimeError};
use super::formatting::ToPolicy;
use super::sources::{Source, SourceInfo};
use super::visitor::{walk_operation, walk_term, Visitor};

pub type TermList = Vec<Term>;

/// Name of the variable standing for the subject of a partial expression.
pub const THIS_VAR: &str = "_this";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Dictionary {
    pub fields: BTreeMap<Symbol, Term>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// `Tag{field: value, ...}` as written in a pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InstanceLiteral {
    pub tag: Symbol,
    pub fields: Dictionary,
}

/// Handle to a host-owned object. The VM only ever sees the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalInstance {
    pub instance_id: u64,
    pub constructor: Option<Term>,
    pub repr: Option<String>,
    pub class_repr: Option<String>,
}

impl PartialEq for ExternalInstance {
    fn eq(&self, other: &Self) -> bool {
        self.instance_id == other.instance_id
    }
}

impl Eq for ExternalInstance {}

impl Hash for ExternalInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance_id.hash(state)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(name: &str) -> Self {
        Self(name.to_owned())
    }

    /// Variables whose names start with `_` never appear in results.
    pub fn is_temporary_var(&self) -> bool {
        self.0.starts_with('_')
    }

    pub fn is_this_var(&self) -> bool {
        self.0 == THIS_VAR
    }

    /// The bare `_` variable; every occurrence is distinct.
    pub fn is_anonymous(&self) -> bool {
        self.0 == "_"
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A predicate or method application: `name(args, key: value)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Call {
    pub name: Symbol,
    pub args: TermList,
    pub kwargs: Option<BTreeMap<Symbol, Term>>,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Operator {
    Debug,
    Print,
    Cut,
    In,
    Isa,
    New,
    Dot,
    Not,
    Mul,
    Div,
    Mod,
    Rem,
    Add,
    Sub,
    Eq,
    Geq,
    Leq,
    Neq,
    Gt,
    Lt,
    Unify,
    Or,
    And,
    ForAll,
    Assign,
}

impl Operator {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Neq | Self::Lt | Self::Leq | Self::Gt | Self::Geq
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod | Self::Rem
        )
    }

    /// The comparison that holds with the operands swapped.
    pub fn mirrored(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Gt => Self::Lt,
            Self::Leq => Self::Geq,
            Self::Geq => Self::Leq,
            op => op,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Operation {
    pub operator: Operator,
    pub args: TermList,
}

impl Operation {
    pub fn new(operator: Operator, args: TermList) -> Self {
        Self { operator, args }
    }

    /// Conjuncts of an `And`, or the operation itself.
    pub fn conjuncts(&self) -> Vec<Term> {
        if self.operator == Operator::And {
            self.args.clone()
        } else {
            vec![Term::new_temporary(Value::Expression(self.clone()))]
        }
    }
}

/// Right-hand side of `matches` and rule parameter specializers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Pattern {
    Dictionary(Dictionary),
    Instance(InstanceLiteral),
}

impl Pattern {
    pub fn instance(tag: &str) -> Self {
        Self::Instance(InstanceLiteral {
            tag: Symbol::new(tag),
            fields: Dictionary::new(),
        })
    }

    pub fn tag(&self) -> Option<&Symbol> {
        match self {
            Self::Instance(InstanceLiteral { tag, .. }) => Some(tag),
            Self::Dictionary(_) => None,
        }
    }

    pub fn fields(&self) -> &Dictionary {
        match self {
            Self::Instance(InstanceLiteral { fields, .. }) | Self::Dictionary(fields) => fields,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Value {
    Number(Numeric),
    String(String),
    Boolean(bool),
    ExternalInstance(ExternalInstance),
    Dictionary(Dictionary),
    Pattern(Pattern),
    Call(Call),
    List(TermList),
    Variable(Symbol),
    RestVariable(Symbol),
    Expression(Operation),
}

impl Value {
    fn type_error<T>(&self, expected: &str) -> Result<T, RuntimeError> {
        Err(RuntimeError::TypeError {
            msg: format!("Expected {}, got: {}", expected, self.to_policy()),
            stack_trace: None,
        })
    }

    pub fn as_symbol(&self) -> Result<&Symbol, RuntimeError> {
        match self {
            Self::Variable(name) | Self::RestVariable(name) => Ok(name),
            _ => self.type_error("symbol"),
        }
    }

    pub fn as_string(&self) -> Result<&str, RuntimeError> {
        match self {
            Self::String(string) => Ok(string.as_ref()),
            _ => self.type_error("string"),
        }
    }

    pub fn as_expression(&self) -> Result<&Operation, RuntimeError> {
        match self {
            Self::Expression(op) => Ok(op),
            _ => self.type_error("expression"),
        }
    }

    pub fn as_call(&self) -> Result<&Call, RuntimeError> {
        match self {
            Self::Call(call) => Ok(call),
            _ => self.type_error("call"),
        }
    }

    pub fn as_pattern(&self) -> Result<&Pattern, RuntimeError> {
        match self {
            Self::Pattern(pattern) => Ok(pattern),
            _ => self.type_error("pattern"),
        }
    }

    pub fn as_list(&self) -> Result<&TermList, RuntimeError> {
        match self {
            Self::List(list) => Ok(list),
            _ => self.type_error("list"),
        }
    }

    pub fn as_number(&self) -> Result<Numeric, RuntimeError> {
        match self {
            Self::Number(n) => Ok(*n),
            _ => self.type_error("number"),
        }
    }

    pub fn is_ground(&self) -> bool {
        match self {
            Self::Number(_) | Self::String(_) | Self::Boolean(_) | Self::ExternalInstance(_) => {
                true
            }
            Self::Variable(_) | Self::RestVariable(_) | Self::Expression(_) => false,
            Self::Call(call) => {
                call.args.iter().all(Term::is_ground)
                    && call
                        .kwargs
                        .as_ref()
                        .map_or(true, |kwargs| kwargs.values().all(Term::is_ground))
            }
            Self::Dictionary(dict) | Self::Pattern(Pattern::Dictionary(dict)) => {
                dict.fields.values().all(Term::is_ground)
            }
            Self::Pattern(Pattern::Instance(lit)) => lit.fields.fields.values().all(Term::is_ground),
            Self::List(terms) => terms.iter().all(Term::is_ground),
        }
    }

    /// Name of the built-in class this value is an instance of.
    pub fn builtin_class(&self) -> Option<&'static str> {
        match self {
            Self::Number(Numeric::Integer(_)) => Some("Integer"),
            Self::Number(Numeric::Float(_)) => Some("Float"),
            Self::String(_) => Some("String"),
            Self::Boolean(_) => Some("Boolean"),
            Self::List(_) => Some("List"),
            Self::Dictionary(_) => Some("Dictionary"),
            _ => None,
        }
    }
}

/// A value plus where it came from. Equality and hashing ignore the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    #[serde(skip, default = "SourceInfo::ffi")]
    pub source_info: SourceInfo,

    value: Arc<Value>,
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Term {}

impl Hash for Term {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value().hash(state)
    }
}

impl Term {
    pub fn new_temporary(value: Value) -> Self {
        Self {
            source_info: SourceInfo::TemporaryVariable,
            value: Arc::new(value),
        }
    }

    pub fn new_from_ffi(value: Value) -> Self {
        Self {
            source_info: SourceInfo::Ffi,
            value: Arc::new(value),
        }
    }

    pub fn new_from_parser(source: Arc<Source>, left: usize, right: usize, value: Value) -> Self {
        Self {
            source_info: SourceInfo::parser(source, left, right),
            value: Arc::new(value),
        }
    }

    pub fn new_from_test(value: Value) -> Self {
        Self {
            source_info: SourceInfo::Test,
            value: Arc::new(value),
        }
    }

    /// A new term with `value`, keeping this term's source.
    pub fn clone_with_value(&self, value: Value) -> Self {
        Self {
            source_info: self.source_info.clone(),
            value: Arc::new(value),
        }
    }

    pub fn replace_value(&mut self, value: Value) {
        self.value = Arc::new(value);
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Copy-on-write access to the value.
    pub fn mut_value(&mut self) -> &mut Value {
        Arc::make_mut(&mut self.value)
    }

    pub fn offset(&self) -> usize {
        self.span().map_or(0, |(left, _)| left)
    }

    pub fn span(&self) -> Option<(usize, usize)> {
        self.source_info.span().map(|(_, left, right)| (left, right))
    }

    pub fn is_ground(&self) -> bool {
        self.value().is_ground()
    }

    /// Collect every variable occurring in this term.
    pub fn variables(&self, vars: &mut HashSet<Symbol>) {
        struct Collector<'set>(&'set mut HashSet<Symbol>);

        impl<'set> Visitor for Collector<'set> {
            fn visit_variable(&mut self, v: &Symbol) {
                self.0.insert(v.clone());
            }

            fn visit_rest_variable(&mut self, v: &Symbol) {
                self.0.insert(v.clone());
            }
        }

        walk_term(&mut Collector(vars), self);
    }

    pub fn contains_variable(&self, var: &Symbol) -> bool {
        struct Occurs<'var> {
            var: &'var Symbol,
            found: bool,
        }

        impl<'var> Visitor for Occurs<'var> {
            fn visit_variable(&mut self, v: &Symbol) {
                self.found |= v == self.var;
            }

            fn visit_operation(&mut self, o: &Operation) {
                if !self.found {
                    walk_operation(self, o);
                }
            }
        }

        let mut occurs = Occurs { var, found: false };
        walk_term(&mut occurs, self);
        occurs.found
    }

    /// Stable integer identity of the value, used to key traces and caches.
    pub fn hash_value(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn as_symbol(&self) -> PolicyResult<&Symbol> {
        Ok(self.value().as_symbol()?)
    }
}

impl From<Value> for Term {
    fn from(value: Value) -> Self {
        Self::new_temporary(value)
    }
}

impl From<Operation> for Term {
    fn from(op: Operation) -> Self {
        Self::new_temporary(Value::Expression(op))
    }
}

impl From<Symbol> for Term {
    fn from(sym: Symbol) -> Self {
        Self::new_temporary(Value::Variable(sym))
    }
}

impl From<i64> for Term {
    fn from(i: i64) -> Self {
        Self::new_temporary(Value::Number(Numeric::Integer(i)))
    }
}

impl From<&str> for Term {
    fn from(s: &str) -> Self {
        Self::new_temporary(Value::String(s.to_owned()))
    }
}

impl From<bool> for Term {
    fn from(b: bool) -> Self {
        Self::new_temporary(Value::Boolean(b))
    }
}

pub fn has_rest_var(list: &[Term]) -> bool {
    matches!(list.last().map(Term::value), Some(Value::RestVariable(_)))
}
