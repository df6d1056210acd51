use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::bindings::Bindings;
use super::error::{PolicyError, PolicyResult, ValidationError};
use super::filter::Filter;
use super::kb::*;
use super::messages::*;
use super::parser::{self, Line};
use super::query::Query;
use super::resource_block::ResourceBlock;
use super::rewrites::*;
use super::sources::*;
use super::terms::*;
use super::validations::{
    check_no_allow_rule, check_singletons, check_undefined_rule_calls, check_unregistered_classes,
};
use super::vm::*;

/// Entry point of the core: owns the knowledge base and hands out queries.
pub struct Engine {
    pub kb: Arc<RwLock<KnowledgeBase>>,
    messages: MessageQueue,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            kb: Arc::new(RwLock::new(KnowledgeBase::new())),
            messages: MessageQueue::new(),
        }
    }

    fn read_kb(&self) -> RwLockReadGuard<'_, KnowledgeBase> {
        self.kb.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_kb(&self) -> RwLockWriteGuard<'_, KnowledgeBase> {
        self.kb.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load `sources` into the KB. Either every source loads or, on the
    /// first error, the KB is left without rules.
    pub fn load(&self, sources: Vec<Source>) -> PolicyResult<()> {
        let mut kb = self.write_kb();
        let mut warnings = vec![];
        let result = load_sources(&mut kb, sources, &mut warnings);
        if let Err(e) = result {
            kb.clear_rules();
            return Err(e);
        }
        self.messages
            .extend(warnings.into_iter().map(Message::warning));
        Ok(())
    }

    pub fn load_str(&self, src: &str) -> PolicyResult<()> {
        self.load(vec![Source::new(src)])
    }

    /// Clear rules from the knowledge base
    pub fn clear_rules(&self) {
        self.write_kb().clear_rules();
    }

    /// Inline queries (`?= ...;`) come back in source order.
    pub fn next_inline_query(&self, options: QueryOptions) -> Option<Query> {
        let term = {
            let mut kb = self.write_kb();
            if kb.inline_queries.is_empty() {
                None
            } else {
                Some(kb.inline_queries.remove(0))
            }
        };
        term.map(|t| self.new_query_from_term(t, options))
    }

    pub fn new_query(&self, src: &str, options: QueryOptions) -> PolicyResult<Query> {
        let source = Arc::new(Source::new(src));
        let term =
            parser::parse_query(source.clone()).map_err(|e| PolicyError::from(e).with_source(&source))?;
        Ok(self.new_query_from_term(term, options))
    }

    pub fn new_query_from_term(&self, term: Term, options: QueryOptions) -> Query {
        let term = rewrite_term(term, &self.read_kb());
        let query = Goal::Query { term: term.clone() };
        let vm = VirtualMachine::new(self.kb.clone(), options, vec![query], self.messages.clone());
        Query::new(vm, term)
    }

    /// Id for a new host instance, unique across all queries.
    pub fn get_external_id(&self) -> u64 {
        self.read_kb().new_id()
    }

    pub fn register_constant(&self, name: Symbol, value: Term) -> PolicyResult<()> {
        self.write_kb().register_constant(name, value)
    }

    pub fn register_class(&self, name: Symbol, fields: HashMap<Symbol, FieldType>) {
        self.write_kb().register_class(name, fields)
    }

    /// Register the superclass chain of `name`, most specific first.
    pub fn register_mro(&self, name: Symbol, mro: Vec<Symbol>) {
        self.write_kb().register_mro(name, mro)
    }

    pub fn next_message(&self) -> Option<Message> {
        self.messages.next()
    }

    /// Filter for the `class` objects `var` may be, given the results of a
    /// query where `var` was partial.
    pub fn build_filter(&self, results: &[Bindings], var: &str, class: &str) -> PolicyResult<Filter> {
        Filter::build(&self.read_kb(), results, var, class)
    }
}

fn load_sources(
    kb: &mut KnowledgeBase,
    sources: Vec<Source>,
    warnings: &mut Vec<String>,
) -> PolicyResult<()> {
    for source in sources {
        kb.add_source(&source)?;
        let source = Arc::new(source);
        let lines = parser::parse_lines(source.clone())
            .map_err(|e| PolicyError::from(e).with_source(&source))?;
        for line in lines {
            match line {
                Line::Rule(rule) => {
                    warnings.extend(check_singletons(&rule));
                    let rule = rewrite_rule(rule, kb);
                    kb.add_rule(rule);
                }
                Line::RuleType(rule_type) => {
                    let rule_type = rewrite_rule(rule_type, kb);
                    if !rule_type.is_fact() {
                        return Err(ValidationError::InvalidRuleType {
                            rule_type: rule_type.to_string(),
                            msg: "Rule types cannot contain dot lookups.".to_owned(),
                        }
                        .into());
                    }
                    kb.add_rule_type(rule_type);
                }
                Line::Query(term) => kb.inline_queries.push(term),
                Line::ResourceBlock {
                    keyword,
                    resource,
                    productions,
                } => {
                    let (block, errors) =
                        ResourceBlock::from_productions(keyword, resource, productions);
                    if let Some(e) = errors.into_iter().next() {
                        return Err(e);
                    }
                    if let Some(e) = kb.resource_blocks.add(block).into_iter().next() {
                        return Err(e);
                    }
                }
            }
        }
    }

    // Shorthand rules are expanded once, after every block they may refer
    // to has been read.
    let (rules, errors) = kb.resource_blocks.rules();
    kb.resource_blocks.shorthand_rules.clear();
    if let Some(e) = errors.into_iter().next() {
        return Err(e);
    }
    for rule in rules {
        let rule = rewrite_rule(rule, kb);
        kb.add_rule(rule);
    }

    if let Some(e) = check_unregistered_classes(kb).into_iter().next() {
        return Err(e);
    }

    kb.create_resource_specific_rule_types();
    if let Some(e) = kb.validate_rules().into_iter().next() {
        return Err(e);
    }

    warnings.extend(check_undefined_rule_calls(kb));
    warnings.extend(check_no_allow_rule(kb));
    Ok(())
}
