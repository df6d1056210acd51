//! Read-only traversal of terms and rules.
//!
//! Overriding a `visit_*` hook takes over traversal of that node; call the
//! matching `walk_*` function to continue into its children.

use crate::rules::{Parameter, Rule};
use crate::terms::*;

pub trait Visitor: Sized {
    fn visit_variable(&mut self, _v: &Symbol) {}
    fn visit_rest_variable(&mut self, _v: &Symbol) {}
    fn visit_external_instance(&mut self, _e: &ExternalInstance) {}

    fn visit_rule(&mut self, rule: &Rule) {
        walk_rule(self, rule)
    }
    fn visit_param(&mut self, param: &Parameter) {
        walk_param(self, param)
    }
    fn visit_term(&mut self, term: &Term) {
        walk_term(self, term)
    }
    fn visit_call(&mut self, call: &Call) {
        walk_call(self, call)
    }
    fn visit_operation(&mut self, op: &Operation) {
        walk_operation(self, op)
    }
    fn visit_pattern(&mut self, pattern: &Pattern) {
        walk_pattern(self, pattern)
    }
    fn visit_dictionary(&mut self, dict: &Dictionary) {
        walk_dictionary(self, dict)
    }
}

pub fn walk_rule<V: Visitor>(visitor: &mut V, rule: &Rule) {
    for param in &rule.params {
        visitor.visit_param(param);
    }
    visitor.visit_term(&rule.body);
}

pub fn walk_param<V: Visitor>(visitor: &mut V, param: &Parameter) {
    visitor.visit_term(&param.parameter);
    if let Some(specializer) = &param.specializer {
        visitor.visit_term(specializer);
    }
}

pub fn walk_term<V: Visitor>(visitor: &mut V, term: &Term) {
    match term.value() {
        Value::Number(_) | Value::String(_) | Value::Boolean(_) => {}
        Value::ExternalInstance(e) => visitor.visit_external_instance(e),
        Value::Dictionary(d) => visitor.visit_dictionary(d),
        Value::Pattern(p) => visitor.visit_pattern(p),
        Value::Call(c) => visitor.visit_call(c),
        Value::List(l) => l.iter().for_each(|t| visitor.visit_term(t)),
        Value::Variable(v) => visitor.visit_variable(v),
        Value::RestVariable(r) => visitor.visit_rest_variable(r),
        Value::Expression(o) => visitor.visit_operation(o),
    }
}

pub fn walk_call<V: Visitor>(visitor: &mut V, call: &Call) {
    call.args.iter().for_each(|t| visitor.visit_term(t));
    if let Some(kwargs) = &call.kwargs {
        kwargs.values().for_each(|t| visitor.visit_term(t));
    }
}

pub fn walk_operation<V: Visitor>(visitor: &mut V, op: &Operation) {
    op.args.iter().for_each(|t| visitor.visit_term(t));
}

pub fn walk_pattern<V: Visitor>(visitor: &mut V, pattern: &Pattern) {
    visitor.visit_dictionary(pattern.fields())
}

pub fn walk_dictionary<V: Visitor>(visitor: &mut V, dict: &Dictionary) {
    dict.fields.values().for_each(|t| visitor.visit_term(t));
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CallNames(Vec<String>);

    impl Visitor for CallNames {
        fn visit_call(&mut self, call: &Call) {
            self.0.push(call.name.0.clone());
            walk_call(self, call);
        }
    }

    #[test]
    fn test_walk_reaches_nested_calls() {
        let body = term!(op!(
            And,
            term!(call!("f", [term!(call!("g"))])),
            term!(op!(Not, term!(call!("h", [var!("x")]))))
        ));
        let mut names = CallNames(vec![]);
        names.visit_term(&body);
        assert_eq!(names.0, vec!["f", "g", "h"]);
    }
}
