use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::sources::SourceInfo;
use super::terms::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub parameter: Term,
    pub specializer: Option<Term>,
}

impl Parameter {
    /// A parameter that only accepts one value, e.g. `"read"` in `allow(_, "read", _)`.
    pub fn is_ground(&self) -> bool {
        self.specializer.is_none() && self.parameter.is_ground()
    }

    /// The specializer's pattern, if it has one.
    pub fn pattern(&self) -> Option<&Pattern> {
        match self.specializer.as_ref().map(Term::value) {
            Some(Value::Pattern(pattern)) => Some(pattern),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: Symbol,
    pub params: Vec<Parameter>,
    pub body: Term,
    #[serde(skip, default = "SourceInfo::ffi")]
    pub source_info: SourceInfo,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.params == other.params && self.body == other.body
    }
}

impl Rule {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn span(&self) -> Option<(usize, usize)> {
        self.source_info.span().map(|(_, left, right)| (left, right))
    }

    pub fn new_from_parser(
        source_info: SourceInfo,
        name: Symbol,
        params: Vec<Parameter>,
        body: Term,
    ) -> Self {
        Self {
            name,
            params,
            body,
            source_info,
        }
    }

    /// A rule with no body conditions.
    pub fn is_fact(&self) -> bool {
        matches!(
            self.body.value(),
            Value::Expression(Operation { operator: Operator::And, args }) if args.is_empty()
        )
    }
}

pub type Rules = Vec<Arc<Rule>>;

type RuleSet = BTreeSet<u64>;

/// Trie over rule parameters. Each level is one argument position; ground
/// parameters are keyed by their value, everything else sits under `None`.
#[derive(Clone, Default, Debug)]
struct RuleIndex {
    rules: RuleSet,
    children: HashMap<Option<Value>, RuleIndex>,
}

impl RuleIndex {
    fn insert(&mut self, rule_id: u64, params: &[Parameter]) {
        match params.split_first() {
            None => {
                self.rules.insert(rule_id);
            }
            Some((first, rest)) => {
                let key = first.is_ground().then(|| first.parameter.value().clone());
                self.children.entry(key).or_default().insert(rule_id, rest);
            }
        }
    }

    /// Ids of rules whose ground parameters are compatible with `args`.
    fn applicable(&self, args: &[Term], found: &mut RuleSet) {
        match args.split_first() {
            None => found.extend(self.rules.iter().copied()),
            Some((arg, rest)) if arg.is_ground() => {
                if let Some(child) = self.children.get(&Some(arg.value().clone())) {
                    child.applicable(rest, found);
                }
                if let Some(child) = self.children.get(&None) {
                    child.applicable(rest, found);
                }
            }
            Some((_, rest)) => {
                for child in self.children.values() {
                    child.applicable(rest, found);
                }
            }
        }
    }
}

/// All rules sharing a name and arity, kept in source order.
#[derive(Clone, Debug)]
pub struct GenericRule {
    pub name: Symbol,
    pub arity: usize,
    pub rules: HashMap<u64, Arc<Rule>>,
    index: RuleIndex,
    next_rule_id: u64,
}

impl GenericRule {
    pub fn new(name: Symbol, arity: usize, rules: Rules) -> Self {
        let mut generic = Self {
            name,
            arity,
            rules: HashMap::new(),
            index: RuleIndex::default(),
            next_rule_id: 0,
        };
        for rule in rules {
            generic.add_rule(rule);
        }
        generic
    }

    pub fn add_rule(&mut self, rule: Arc<Rule>) {
        let rule_id = self.next_rule_id;
        self.next_rule_id += 1;
        self.index.insert(rule_id, &rule.params);
        self.rules.insert(rule_id, rule);
    }

    /// Candidate rules for a call with `args`, in source order.
    pub fn get_applicable_rules(&self, args: &[Term]) -> Rules {
        let mut ids = RuleSet::new();
        self.index.applicable(args, &mut ids);
        ids.into_iter()
            .filter_map(|id| self.rules.get(&id).cloned())
            .collect()
    }

    /// Every rule, in source order.
    pub fn ordered_rules(&self) -> Rules {
        let mut ids: Vec<_> = self.rules.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| self.rules[&id].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_filters_on_ground_params() {
        let rules: Rules = vec![
            rule!("f", [1, 1]),
            rule!("f", [1, 2]),
            rule!("f", [sym!("x"), 2]),
            rule!("f", ["x"; instance!("Foo"), 1]),
            rule!("f", [2, sym!("y")]),
        ]
        .into_iter()
        .map(Arc::new)
        .collect();
        let generic = GenericRule::new(sym!("f"), 2, rules.clone());

        let applicable = |args: Vec<Term>| -> Vec<Arc<Rule>> { generic.get_applicable_rules(&args) };

        assert_eq!(
            applicable(vec![term!(1), term!(1)]),
            vec![rules[0].clone(), rules[3].clone()]
        );
        assert_eq!(
            applicable(vec![term!(1), term!(2)]),
            vec![rules[1].clone(), rules[2].clone()]
        );
        assert_eq!(
            applicable(vec![term!(2), term!(2)]),
            vec![rules[2].clone(), rules[4].clone()]
        );
        assert_eq!(applicable(vec![var!("a"), var!("b")]), rules);
        assert_eq!(
            applicable(vec![var!("a"), term!(1)]),
            vec![rules[0].clone(), rules[3].clone(), rules[4].clone()]
        );
        assert_eq!(applicable(vec![term!(3), term!(3)]), vec![]);
    }

    #[test]
    fn test_float_and_integer_share_index_slot() {
        let rule = Arc::new(rule!("g", [1]));
        let generic = GenericRule::new(sym!("g"), 1, vec![rule.clone()]);
        assert_eq!(generic.get_applicable_rules(&[term!(1.0)]), vec![rule]);
    }

    #[test]
    fn test_fact_detection() {
        assert!(rule!("g", [1]).is_fact());
        assert!(!rule!("h", [sym!("x")] => call!("g", [sym!("x")])).is_fact());
    }
}
