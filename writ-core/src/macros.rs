//! Shorthand for building terms and rules, mostly for tests.

use std::collections::BTreeMap;

use crate::rules::Parameter;
use crate::terms::*;

#[macro_export]
macro_rules! value {
    ([$($args:expr),* , @rest $rest:literal]) => {
        $crate::terms::Value::List(vec![
            $($crate::term!($crate::value!($args)),)*
            $crate::terms::Term::from($crate::terms::Value::RestVariable($crate::sym!($rest))),
        ])
    };
    ([$($args:expr),*]) => {
        $crate::terms::Value::List(vec![
            $($crate::term!($crate::value!($args))),*
        ])
    };
    ($arg:expr) => {
        $crate::macros::TestHelper::<$crate::terms::Value>::from($arg).0
    };
}

#[macro_export]
macro_rules! values {
    ($($args:expr),*) => {
        vec![$($crate::value!($args)),*]
    };
}

#[macro_export]
macro_rules! term {
    ($($expr:tt)*) => {
        $crate::macros::TestHelper::<$crate::terms::Term>::from($crate::value!($($expr)*)).0
    };
}

#[macro_export]
macro_rules! sym {
    ($arg:expr) => {
        $crate::macros::TestHelper::<$crate::terms::Symbol>::from($arg).0
    };
}

#[macro_export]
macro_rules! var {
    ($arg:expr) => {
        $crate::terms::Term::from($crate::terms::Value::Variable($crate::sym!($arg)))
    };
}

#[macro_export]
macro_rules! str {
    ($arg:expr) => {
        $crate::terms::Term::from($crate::terms::Value::String(String::from($arg)))
    };
}

#[macro_export]
macro_rules! call {
    ($name:expr) => {
        $crate::terms::Call {
            name: $crate::sym!($name),
            args: vec![],
            kwargs: None,
        }
    };
    ($name:expr, [$($args:expr),*]) => {
        $crate::terms::Call {
            name: $crate::sym!($name),
            args: vec![$($crate::term!($args)),*],
            kwargs: None,
        }
    };
    ($name:expr, [$($args:expr),*], $kwargs:expr) => {
        $crate::terms::Call {
            name: $crate::sym!($name),
            args: vec![$($crate::term!($args)),*],
            kwargs: Some($kwargs),
        }
    };
}

#[macro_export]
macro_rules! op {
    ($operator:ident, $($args:expr),+) => {
        $crate::terms::Operation {
            operator: $crate::terms::Operator::$operator,
            args: vec![$($args),+],
        }
    };
    ($operator:ident) => {
        $crate::terms::Operation {
            operator: $crate::terms::Operator::$operator,
            args: vec![],
        }
    };
}

#[macro_export]
macro_rules! dict {
    ($arg:expr) => {
        $crate::macros::TestHelper::<$crate::terms::Dictionary>::from($arg).0
    };
}

#[macro_export]
macro_rules! instance {
    ($tag:expr) => {
        $crate::terms::InstanceLiteral {
            tag: $crate::sym!($tag),
            fields: $crate::terms::Dictionary::new(),
        }
    };
    ($tag:expr, $fields:expr) => {
        $crate::terms::InstanceLiteral {
            tag: $crate::sym!($tag),
            fields: $crate::dict!($fields),
        }
    };
}

#[macro_export]
macro_rules! pattern {
    ($arg:expr) => {
        $crate::terms::Value::Pattern($crate::macros::TestHelper::<$crate::terms::Pattern>::from($arg).0)
    };
}

#[macro_export]
macro_rules! param {
    ($($tt:tt)*) => {
        $crate::macros::TestHelper::<$crate::rules::Parameter>::from($($tt)*).0
    };
}

/// Parameters for `rule!`. `name; spec` is a variable specialized on `spec`;
/// a bare expression becomes a parameter through `value!`.
#[macro_export]
macro_rules! args {
    () => {
        Vec::<$crate::rules::Parameter>::new()
    };
    ($name:expr ; $spec:expr $(, $($tt:tt)*)?) => {{
        let mut params = vec![$crate::param!(($crate::sym!($name), $crate::term!($spec)))];
        params.extend($crate::args!($($($tt)*)?));
        params
    }};
    ($name:expr $(, $($tt:tt)*)?) => {{
        let mut params = vec![$crate::param!($crate::value!($name))];
        params.extend($crate::args!($($($tt)*)?));
        params
    }};
}

#[macro_export]
macro_rules! rule {
    ($name:expr, [$($args:tt)*] => $($body:expr),+) => {
        $crate::rules::Rule {
            name: $crate::sym!($name),
            params: $crate::args!($($args)*),
            body: $crate::term!($crate::op!(And, $($crate::term!($body)),+)),
            source_info: $crate::sources::SourceInfo::Test,
        }
    };
    ($name:expr, [$($args:tt)*]) => {
        $crate::rules::Rule {
            name: $crate::sym!($name),
            params: $crate::args!($($args)*),
            body: $crate::term!($crate::op!(And)),
            source_info: $crate::sources::SourceInfo::Test,
        }
    };
}

/// Wrapper that converts eagerly so the macros can accept many input types.
pub struct TestHelper<T>(pub T);

impl<T> From<T> for TestHelper<T> {
    fn from(other: T) -> Self {
        Self(other)
    }
}

impl From<Value> for TestHelper<Term> {
    fn from(other: Value) -> Self {
        Self(Term::new_from_test(other))
    }
}

impl From<Term> for TestHelper<Value> {
    fn from(other: Term) -> Self {
        Self(other.value().clone())
    }
}

impl<S: AsRef<str>> From<S> for TestHelper<Symbol> {
    fn from(other: S) -> Self {
        Self(Symbol::new(other.as_ref()))
    }
}

impl From<BTreeMap<Symbol, Term>> for TestHelper<Dictionary> {
    fn from(fields: BTreeMap<Symbol, Term>) -> Self {
        Self(Dictionary { fields })
    }
}

impl From<InstanceLiteral> for TestHelper<Pattern> {
    fn from(other: InstanceLiteral) -> Self {
        Self(Pattern::Instance(other))
    }
}

impl From<Dictionary> for TestHelper<Pattern> {
    fn from(other: Dictionary) -> Self {
        Self(Pattern::Dictionary(other))
    }
}

impl From<BTreeMap<Symbol, Term>> for TestHelper<Pattern> {
    fn from(fields: BTreeMap<Symbol, Term>) -> Self {
        Self(Pattern::Dictionary(Dictionary { fields }))
    }
}

/// `(name, specializer)`: dictionaries and instance literals in specializer
/// position are patterns.
impl From<(Symbol, Term)> for TestHelper<Parameter> {
    fn from((name, spec): (Symbol, Term)) -> Self {
        let specializer = match spec.value() {
            Value::Dictionary(dict) => spec.clone_with_value(Value::Pattern(Pattern::Dictionary(dict.clone()))),
            _ => spec.clone(),
        };
        Self(Parameter {
            parameter: spec.clone_with_value(Value::Variable(name)),
            specializer: Some(specializer),
        })
    }
}

/// A symbol names the parameter; anything else is a ground parameter.
impl From<Value> for TestHelper<Parameter> {
    fn from(value: Value) -> Self {
        Self(Parameter {
            parameter: Term::new_from_test(value),
            specializer: None,
        })
    }
}

macro_rules! value_from {
    ($($ty:ty => |$x:ident| $body:expr),* $(,)?) => {
        $(impl From<$ty> for TestHelper<Value> {
            fn from($x: $ty) -> Self {
                Self($body)
            }
        })*
    };
}

value_from! {
    i64 => |x| Value::Number(x.into()),
    f64 => |x| Value::Number(x.into()),
    &str => |x| Value::String(x.to_owned()),
    String => |x| Value::String(x),
    bool => |x| Value::Boolean(x),
    Call => |x| Value::Call(x),
    Dictionary => |x| Value::Dictionary(x),
    Operation => |x| Value::Expression(x),
    TermList => |x| Value::List(x),
    Symbol => |x| Value::Variable(x),
    Pattern => |x| Value::Pattern(x),
    InstanceLiteral => |x| Value::Pattern(Pattern::Instance(x)),
    BTreeMap<Symbol, Term> => |x| Value::Dictionary(Dictionary { fields: x }),
    ExternalInstance => |x| Value::ExternalInstance(x),
}

impl<'a, T> From<&'a T> for TestHelper<Value>
where
    T: Clone + Into<TestHelper<Value>>,
{
    fn from(other: &'a T) -> Self {
        other.clone().into()
    }
}
