use writ_core::terms::*;

use std::collections::hash_map::HashMap;

use crate::host::{Host, Instance};

/// An enum of the possible value types that can be
/// sent to/from a policy.
///
/// All variants except `Instance` represent types that can
/// be used natively in a policy.
/// Any other types can be wrapped using `WritValue::new_from_instance`.
/// If the instance has a registered `Class`, then this can be used
/// from the policy too.
#[derive(Clone, Debug)]
pub enum WritValue {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Map(HashMap<String, WritValue>),
    List(Vec<WritValue>),
    Variable(String),
    Instance(Instance),
}

impl PartialEq for WritValue {
    fn eq(&self, other: &WritValue) -> bool {
        match (self, other) {
            (WritValue::Boolean(b1), WritValue::Boolean(b2)) => b1 == b2,
            (WritValue::Float(f1), WritValue::Float(f2)) => f1 == f2,
            (WritValue::Integer(i1), WritValue::Integer(i2)) => i1 == i2,
            (WritValue::List(l1), WritValue::List(l2)) => l1 == l2,
            (WritValue::Map(m1), WritValue::Map(m2)) => m1 == m2,
            (WritValue::String(s1), WritValue::String(s2)) => s1 == s2,
            (WritValue::Variable(v1), WritValue::Variable(v2)) => v1 == v2,
            _ => false,
        }
    }
}

impl WritValue {
    /// Create a `WritValue::Instance` from any type.
    pub fn new_from_instance<T>(instance: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self::Instance(Instance::new(instance))
    }

    pub(crate) fn from_term(term: &Term, host: &Host) -> crate::Result<Self> {
        let val = match term.value() {
            Value::Number(Numeric::Integer(i)) => WritValue::Integer(*i),
            Value::Number(Numeric::Float(f)) => WritValue::Float(*f),
            Value::String(s) => WritValue::String(s.clone()),
            Value::Boolean(b) => WritValue::Boolean(*b),
            Value::Dictionary(dict) => {
                let mut map = HashMap::new();
                for (k, v) in &dict.fields {
                    map.insert(k.0.clone(), WritValue::from_term(v, host)?);
                }
                WritValue::Map(map)
            }
            Value::ExternalInstance(instance) => {
                WritValue::Instance(host.get_instance(instance.instance_id)?.clone())
            }
            Value::List(l) => {
                let mut list = vec![];
                for t in l {
                    list.push(WritValue::from_term(t, host)?);
                }
                WritValue::List(list)
            }
            Value::Variable(Symbol(sym)) => WritValue::Variable(sym.clone()),
            Value::Expression(_) => {
                return lazy_error!(
                    "Received an expression for {}. Use `authorized_query` to work with partially evaluated results.",
                    term
                )
            }
            _ => return lazy_error!("Unsupported value type: {}", term),
        };
        Ok(val)
    }

    pub(crate) fn to_term(&self, host: &mut Host) -> Term {
        let value = match self {
            WritValue::Integer(i) => Value::Number(Numeric::Integer(*i)),
            WritValue::Float(f) => Value::Number(Numeric::Float(*f)),
            WritValue::String(s) => Value::String(s.clone()),
            WritValue::Boolean(b) => Value::Boolean(*b),
            WritValue::Map(map) => {
                let mut dict = Dictionary::new();
                for (k, v) in map {
                    dict.fields.insert(Symbol(k.clone()), v.to_term(host));
                }
                Value::Dictionary(dict)
            }
            WritValue::Instance(instance) => {
                let class_repr = instance
                    .class(host)
                    .ok()
                    .map(|class| class.name.clone())
                    .or_else(|| super::to_writ::default_class_name(instance.type_id()));
                let id = host.cache_instance(instance.clone(), None);
                Value::ExternalInstance(ExternalInstance {
                    constructor: None,
                    instance_id: id,
                    repr: Some(instance.debug_name().to_owned()),
                    class_repr,
                })
            }
            WritValue::List(l) => Value::List(l.iter().map(|v| v.to_term(host)).collect()),
            WritValue::Variable(s) => Value::Variable(Symbol(s.clone())),
        };
        Term::from(value)
    }

    pub fn type_name(&self) -> WritValueType {
        match self {
            WritValue::Integer(_) => WritValueType::Integer,
            WritValue::Float(_) => WritValueType::Float,
            WritValue::String(_) => WritValueType::String,
            WritValue::Boolean(_) => WritValueType::Boolean,
            WritValue::Map(_) => WritValueType::Map,
            WritValue::List(_) => WritValueType::List,
            WritValue::Variable(_) => WritValueType::Variable,
            WritValue::Instance(i) => WritValueType::Instance(i.debug_name()),
        }
    }
}

#[derive(Clone, Debug)]
pub enum WritValueType {
    Integer,
    Float,
    String,
    Boolean,
    Map,
    List,
    Variable,
    Instance(&'static str),
}

impl std::fmt::Display for WritValueType {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WritValueType::Instance(name) => write!(fmt, "Instance<{}>", name),
            _ => std::fmt::Debug::fmt(self, fmt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use writ_core::Engine;

    #[test]
    fn values_survive_a_trip_through_terms() {
        let mut host = Host::new(Arc::new(Engine::new()));
        let value = WritValue::List(vec![
            WritValue::Integer(1),
            WritValue::Float(1.5),
            WritValue::String("a".to_owned()),
            WritValue::Map(
                vec![("k".to_owned(), WritValue::Boolean(true))]
                    .into_iter()
                    .collect(),
            ),
        ]);
        let term = value.to_term(&mut host);
        assert_eq!(WritValue::from_term(&term, &host).unwrap(), value);
    }

    #[test]
    fn instances_are_cached_on_the_host() {
        let mut host = Host::new(Arc::new(Engine::new()));
        let term = WritValue::new_from_instance(7u8).to_term(&mut host);
        match WritValue::from_term(&term, &host).unwrap() {
            WritValue::Instance(i) => assert_eq!(i.downcast::<u8>(None).unwrap(), &7),
            v => panic!("unexpected {:?}", v),
        }
        assert_eq!(
            WritValue::new_from_instance(7u8).type_name().to_string(),
            "Instance<u8>"
        );
    }
}
