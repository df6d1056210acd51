//! Load-time checks. Lints come back as warning strings; problems that
//! make a policy unusable come back as errors.

use std::collections::{HashMap, HashSet};

use super::error::{PolicyError, ValidationError};
use super::formatting::{source_position, ToPolicy};
use super::kb::*;
use super::rules::*;
use super::terms::*;
use super::visitor::{walk_operation, walk_rule, walk_term, Visitor};

/// Rules a policy needs at least one of to ever authorize anything.
const ALLOW_RULES: [&str; 3] = ["allow", "allow_field", "allow_request"];

/// Record variables that occur exactly once in a rule.
#[derive(Default)]
struct SingletonVisitor {
    singletons: HashMap<Symbol, Option<Term>>,
    order: Vec<Symbol>,
}

impl SingletonVisitor {
    fn note(&mut self, term: &Term, var: &Symbol) {
        if var.is_temporary_var() {
            return;
        }
        match self.singletons.get_mut(var) {
            Some(seen) => *seen = None,
            None => {
                self.order.push(var.clone());
                self.singletons.insert(var.clone(), Some(term.clone()));
            }
        }
    }

    fn warnings(mut self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|var| self.singletons.remove(var).flatten())
            .map(|term| {
                format!(
                    "Singleton variable {} is unused or undefined; try renaming to _{}{}",
                    term.to_policy(),
                    term.to_policy(),
                    source_position(&term)
                )
            })
            .collect()
    }
}

impl Visitor for SingletonVisitor {
    fn visit_term(&mut self, term: &Term) {
        match term.value() {
            Value::Variable(v) | Value::RestVariable(v) => self.note(term, v),
            _ => walk_term(self, term),
        }
    }
}

pub fn check_singletons(rule: &Rule) -> Vec<String> {
    let mut visitor = SingletonVisitor::default();
    walk_rule(&mut visitor, rule);
    visitor.warnings()
}

pub fn check_no_allow_rule(kb: &KnowledgeBase) -> Option<String> {
    if ALLOW_RULES
        .iter()
        .any(|name| kb.has_rule_named(&Symbol::new(name)))
    {
        None
    } else {
        Some(
            "Your policy does not contain an allow rule, which usually means \
that no actions are allowed. Did you mean to add an allow rule to the top of your policy?"
                .to_owned(),
        )
    }
}

/// Collect calls in rule bodies, skipping method calls and constructors.
#[derive(Default)]
struct CallVisitor {
    calls: Vec<Term>,
}

impl Visitor for CallVisitor {
    fn visit_term(&mut self, term: &Term) {
        match term.value() {
            Value::Call(_) => {
                self.calls.push(term.clone());
                walk_term(self, term)
            }
            Value::Expression(Operation {
                operator: Operator::Dot,
                args,
            }) => {
                // Only the object of a lookup can contain rule calls.
                if let Some(object) = args.first() {
                    self.visit_term(object);
                }
            }
            Value::Expression(Operation {
                operator: Operator::New,
                ..
            }) => {}
            Value::Expression(op) => walk_operation(self, op),
            _ => walk_term(self, term),
        }
    }
}

pub fn check_undefined_rule_calls(kb: &KnowledgeBase) -> Vec<String> {
    let defined = kb.rule_names();
    let mut visitor = CallVisitor::default();
    for generic in kb.generic_rules() {
        for rule in generic.ordered_rules() {
            visitor.visit_term(&rule.body);
        }
    }

    let mut reported = HashSet::new();
    visitor
        .calls
        .into_iter()
        .filter(|term| {
            term.value()
                .as_call()
                .map_or(false, |call| !defined.contains(&call.name))
        })
        .filter(|term| reported.insert(term.to_policy()))
        .map(|term| {
            format!(
                "Call to undefined rule: {}{}",
                term.to_policy(),
                source_position(&term)
            )
        })
        .collect()
}

/// Class names used as parameter specializers must be registered.
pub fn check_unregistered_classes(kb: &KnowledgeBase) -> Vec<PolicyError> {
    let mut errors = vec![];
    for generic in kb.generic_rules() {
        for rule in generic.ordered_rules() {
            for param in &rule.params {
                if let (Some(Pattern::Instance(InstanceLiteral { tag, .. })), Some(spec)) =
                    (param.pattern(), &param.specializer)
                {
                    if !kb.is_registered_class(tag) {
                        let term = spec.clone_with_value(Value::Variable(tag.clone()));
                        errors.push(
                            PolicyError::from(ValidationError::UnregisteredClass {
                                term: term.clone(),
                            })
                            .with_term(&term),
                        );
                    }
                }
            }
        }
    }
    errors
}
