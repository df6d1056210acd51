use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use super::bindings::Bindings;
use super::counter::Counter;
use super::error::{PolicyError, PolicyResult, RuntimeError, ValidationError};
use super::resource_block::ResourceBlocks;
use super::rules::*;
use super::sources::Source;
use super::terms::*;

/// Classes the core understands without asking the host.
pub const BUILTIN_CLASSES: [&str; 7] = [
    "Boolean",
    "Integer",
    "Float",
    "Number",
    "String",
    "List",
    "Dictionary",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    One,
    Many,
}

/// Declared type of a class field, used to follow dotted paths during
/// data filtering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Base {
        class_tag: String,
    },
    Relation {
        kind: RelationKind,
        other_class_tag: String,
        my_field: String,
        other_field: String,
    },
}

impl FieldType {
    pub fn class_tag(&self) -> &str {
        match self {
            Self::Base { class_tag } => class_tag,
            Self::Relation {
                other_class_tag, ..
            } => other_class_tag,
        }
    }
}

/// Host class metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub fields: HashMap<Symbol, FieldType>,
    /// Superclass chain, most specific first. Empty when the host didn't
    /// provide one.
    pub mro: Vec<Symbol>,
}

/// Class of a literal, as named in patterns.
fn builtin_class(value: &Value) -> Option<&'static str> {
    match value {
        Value::Number(Numeric::Integer(_)) => Some("Integer"),
        Value::Number(Numeric::Float(_)) => Some("Float"),
        Value::String(_) => Some("String"),
        Value::Boolean(_) => Some("Boolean"),
        Value::List(_) => Some("List"),
        Value::Dictionary(_) => Some("Dictionary"),
        _ => None,
    }
}

/// Every field the rule type constrains is constrained the same way.
fn fields_fit(actual: &Dictionary, expected: &Dictionary) -> bool {
    expected
        .fields
        .iter()
        .all(|(key, value)| actual.fields.get(key) == Some(value))
}

#[derive(Default)]
pub struct KnowledgeBase {
    constants: Bindings,
    classes: HashMap<Symbol, ClassInfo>,
    rules: HashMap<(Symbol, usize), GenericRule>,
    /// Declared with `type`, keyed by rule name.
    rule_types: HashMap<Symbol, Vec<Rule>>,
    /// Implied by resource blocks. Rebuilt after every load.
    resource_rule_types: HashMap<Symbol, Vec<Rule>>,
    pub resource_blocks: ResourceBlocks,
    pub inline_queries: Vec<Term>,

    /// Filename → content hash, and content hash → filename.
    loaded_files: HashMap<String, u64>,
    loaded_content: HashMap<u64, String>,

    /// For symbols returned from gensym.
    gensym_counter: Counter,
    /// For call ids and instance ids.
    id_counter: Counter,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic id for calls and instances, shared with the host.
    pub fn new_id(&self) -> u64 {
        self.id_counter.next()
    }

    pub fn id_counter(&self) -> Counter {
        self.id_counter.clone()
    }

    /// Generate a fresh variable name. Generated names start with `_`, so
    /// they never show up in results.
    pub fn gensym(&self, prefix: &str) -> Symbol {
        let next = self.gensym_counter.next();
        if prefix == "_" {
            Symbol(format!("_{}", next))
        } else if prefix.starts_with('_') {
            Symbol(format!("{}_{}", prefix, next))
        } else {
            Symbol(format!("_{}_{}", prefix, next))
        }
    }

    pub fn register_constant(&mut self, name: Symbol, value: Term) -> PolicyResult<()> {
        if name.is_temporary_var() {
            return Err(RuntimeError::InvalidRegistration {
                sym: name,
                msg: "constant names may not start with '_'".to_owned(),
            }
            .into());
        }
        self.constants.insert(name, value);
        Ok(())
    }

    pub fn is_constant(&self, name: &Symbol) -> bool {
        self.constants.contains_key(name)
    }

    pub fn constants(&self) -> &Bindings {
        &self.constants
    }

    /// Record field types for a class. Registering again replaces the fields
    /// but keeps a previously registered mro.
    pub fn register_class(&mut self, name: Symbol, fields: HashMap<Symbol, FieldType>) {
        self.classes.entry(name).or_default().fields = fields;
    }

    pub fn register_mro(&mut self, name: Symbol, mro: Vec<Symbol>) {
        self.classes.entry(name).or_default().mro = mro;
    }

    pub fn class_info(&self, name: &Symbol) -> Option<&ClassInfo> {
        self.classes.get(name)
    }

    pub fn field_type(&self, class: &Symbol, field: &Symbol) -> Option<&FieldType> {
        self.classes.get(class).and_then(|info| info.fields.get(field))
    }

    /// Field types of every class that declared some.
    pub fn class_fields(&self) -> impl Iterator<Item = (&Symbol, &HashMap<Symbol, FieldType>)> {
        self.classes
            .iter()
            .filter(|(_, info)| !info.fields.is_empty())
            .map(|(name, info)| (name, &info.fields))
    }

    pub fn is_builtin_class(name: &Symbol) -> bool {
        BUILTIN_CLASSES.contains(&name.0.as_str())
    }

    /// A class name patterns may refer to.
    pub fn is_registered_class(&self, name: &Symbol) -> bool {
        Self::is_builtin_class(name) || self.is_constant(name) || self.classes.contains_key(name)
    }

    /// Whether `left` is `right` or one of its subclasses, if the core can
    /// tell without asking the host.
    pub fn is_subclass(&self, left: &Symbol, right: &Symbol) -> Option<bool> {
        if left == right {
            return Some(true);
        }
        if Self::is_builtin_class(left) {
            let numeric = matches!(left.0.as_str(), "Integer" | "Float");
            return Some(numeric && right.0 == "Number");
        }
        match self.classes.get(left) {
            Some(ClassInfo { mro, .. }) if !mro.is_empty() => Some(mro.contains(right)),
            _ => None,
        }
    }

    pub fn add_rule(&mut self, rule: Rule) {
        let key = (rule.name.clone(), rule.arity());
        self.rules
            .entry(key)
            .or_insert_with(|| GenericRule::new(rule.name.clone(), rule.arity(), vec![]))
            .add_rule(Arc::new(rule));
    }

    pub fn get_generic_rule(&self, name: &Symbol, arity: usize) -> Option<&GenericRule> {
        self.rules.get(&(name.clone(), arity))
    }

    /// Whether any rule of any arity is called `name`.
    pub fn has_rule_named(&self, name: &Symbol) -> bool {
        self.rules.keys().any(|(rule_name, _)| rule_name == name)
    }

    pub fn generic_rules(&self) -> impl Iterator<Item = &GenericRule> {
        self.rules.values()
    }

    pub fn rule_names(&self) -> HashSet<&Symbol> {
        self.rules.keys().map(|(name, _)| name).collect()
    }

    pub fn add_rule_type(&mut self, rule_type: Rule) {
        self.rule_types
            .entry(rule_type.name.clone())
            .or_default()
            .push(rule_type);
    }

    /// Declared and resource-generated types for rules called `name`.
    pub fn get_rule_types(&self, name: &Symbol) -> Vec<&Rule> {
        let declared = self.rule_types.get(name).into_iter().flatten();
        let generated = self.resource_rule_types.get(name).into_iter().flatten();
        declared.chain(generated).collect()
    }

    pub fn create_resource_specific_rule_types(&mut self) {
        self.resource_rule_types.clear();
        for rule_type in self.resource_blocks.rule_types() {
            self.resource_rule_types
                .entry(rule_type.name.clone())
                .or_default()
                .push(rule_type);
        }
    }

    /// Every rule with rule types must match at least one of them.
    pub fn validate_rules(&self) -> Vec<PolicyError> {
        let mut errors = vec![];
        let mut names: Vec<_> = self.rule_names().into_iter().collect();
        names.sort();
        for name in names {
            let rule_types = self.get_rule_types(name);
            if rule_types.is_empty() {
                continue;
            }
            let mut generics: Vec<_> = self
                .rules
                .values()
                .filter(|generic| &generic.name == name)
                .collect();
            generics.sort_by_key(|generic| generic.arity);
            for rule in generics.into_iter().flat_map(GenericRule::ordered_rules) {
                let matches = rule_types.iter().any(|rule_type| {
                    rule_type.arity() == rule.arity()
                        && rule
                            .params
                            .iter()
                            .zip(&rule_type.params)
                            .all(|(param, expected)| self.param_fits(param, expected))
                });
                if !matches {
                    let expected = rule_types
                        .iter()
                        .map(|rule_type| format!("\n\t{}", rule_type))
                        .collect::<String>();
                    errors.push(
                        ValidationError::InvalidRule {
                            rule: rule.to_string(),
                            msg: format!("Must match one of the following rule types:{}", expected),
                        }
                        .into(),
                    );
                }
            }
        }
        errors
    }

    /// Whether a rule parameter is acceptable where a rule type expects
    /// `expected`. Unspecialized variables fit anything.
    fn param_fits(&self, param: &Parameter, expected: &Parameter) -> bool {
        let spec = match &param.specializer {
            Some(spec) => spec,
            None if matches!(param.parameter.value(), Value::Variable(_)) => return true,
            None if !param.parameter.is_ground() => return true,
            None => &param.parameter,
        };
        match &expected.specializer {
            None if expected.parameter.is_ground() => spec == &expected.parameter,
            None => true,
            Some(expected) => self.specializer_fits(spec.value(), expected.value()),
        }
    }

    fn specializer_fits(&self, actual: &Value, expected: &Value) -> bool {
        match (actual, expected) {
            (
                Value::Pattern(Pattern::Instance(actual)),
                Value::Pattern(Pattern::Instance(expected)),
            ) => {
                self.tag_fits(&actual.tag, &expected.tag)
                    && fields_fit(&actual.fields, &expected.fields)
            }
            (
                Value::Pattern(Pattern::Dictionary(actual)),
                Value::Pattern(Pattern::Dictionary(expected)),
            ) => fields_fit(actual, expected),
            (value, Value::Pattern(Pattern::Instance(InstanceLiteral { tag, fields }))) => {
                fields.is_empty()
                    && builtin_class(value)
                        .map_or(false, |class| self.tag_fits(&Symbol::new(class), tag))
            }
            (actual, expected) => actual == expected,
        }
    }

    /// `tag` is `expected`, a subclass of it, or a member of the union it
    /// names.
    fn tag_fits(&self, tag: &Symbol, expected: &Symbol) -> bool {
        if self.is_subclass(tag, expected) == Some(true) {
            return true;
        }
        match self.resource_blocks.union_members(expected) {
            Some(mut members) => {
                members.any(|member| self.is_subclass(tag, member) == Some(true))
            }
            None => false,
        }
    }

    /// Record a source about to be loaded. The same file or the same
    /// content may only be loaded once until the rules are cleared.
    pub fn add_source(&mut self, source: &Source) -> PolicyResult<()> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        source.src.hash(&mut hasher);
        let content_hash = hasher.finish();

        let filename = source.filename.clone().unwrap_or_else(|| "<inline>".to_owned());
        if let Some(existing) = self.loaded_content.get(&content_hash) {
            let msg = if existing == &filename {
                format!("File {} has already been loaded.", filename)
            } else {
                format!(
                    "A file with the same contents as {} named {} has already been loaded.",
                    filename, existing
                )
            };
            return Err(ValidationError::FileLoading { msg }.into());
        }
        if source.filename.is_some() && self.loaded_files.contains_key(&filename) {
            return Err(ValidationError::FileLoading {
                msg: format!(
                    "A file with the name {}, but different contents has already been loaded.",
                    filename
                ),
            }
            .into());
        }
        self.loaded_files.insert(filename.clone(), content_hash);
        self.loaded_content.insert(content_hash, filename);
        Ok(())
    }

    /// Drop rules, resource blocks, inline queries and loaded sources.
    /// Constants and class metadata stay.
    pub fn clear_rules(&mut self) {
        self.rules.clear();
        self.rule_types.clear();
        self.resource_rule_types.clear();
        self.resource_blocks.clear();
        self.inline_queries.clear();
        self.loaded_files.clear();
        self.loaded_content.clear();
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }
}
