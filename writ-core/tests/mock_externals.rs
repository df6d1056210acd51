//! A stand-in host for tests. Instances remember the class and keyword
//! arguments they were constructed with, and field lookups read them back.
use std::collections::{BTreeMap, HashMap};

use writ_core::terms::{Call, ExternalInstance, Symbol, Term, Value};

#[derive(Default)]
pub struct MockExternal {
    instances: HashMap<u64, Call>,
    /// `(child, parent)` pairs.
    parents: Vec<(Symbol, Symbol)>,
}

impl MockExternal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subclass(mut self, child: &str, parent: &str) -> Self {
        self.parents.push((Symbol::new(child), Symbol::new(parent)));
        self
    }

    fn constructor(&self, instance: &Term) -> Option<&Call> {
        match instance.value() {
            Value::ExternalInstance(ExternalInstance { instance_id, .. }) => {
                self.instances.get(instance_id)
            }
            _ => None,
        }
    }

    pub fn external_call(
        &mut self,
        instance: Term,
        attribute: Symbol,
        args: Option<Vec<Term>>,
        kwargs: Option<BTreeMap<Symbol, Term>>,
    ) -> Option<Term> {
        assert!(
            args.is_none() && kwargs.is_none(),
            "method calls aren't mocked: {}",
            attribute
        );
        let call = self
            .constructor(&instance)
            .expect("instance was never constructed");
        call.kwargs.as_ref()?.get(&attribute).cloned()
    }

    pub fn make_external(&mut self, instance_id: u64, constructor: Term) {
        let call = match constructor.value() {
            Value::Call(call) => call.clone(),
            other => panic!("not a constructor call: {:?}", other),
        };
        let previous = self.instances.insert(instance_id, call);
        assert!(previous.is_none(), "instance {} constructed twice", instance_id);
    }

    pub fn is_subclass(&self, left: &Symbol, right: &Symbol) -> bool {
        left == right || self.parents.contains(&(left.clone(), right.clone()))
    }

    pub fn external_isa(&mut self, instance: Term, class_tag: Symbol) -> bool {
        self.constructor(&instance)
            .map_or(false, |call| self.is_subclass(&call.name, &class_tag))
    }
}
