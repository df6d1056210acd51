//! `resource Repo { ... }` blocks and their expansion into ordinary rules.
//!
//! Given
//!
//! ```text
//! resource Repo {
//!   roles = ["reader", "writer"];
//!   relations = {parent: Org};
//!   "reader" if "writer";
//!   "writer" if "owner" on "parent";
//! }
//! ```
//!
//! the shorthand rules become
//!
//! ```text
//! has_role(actor, "reader", repo: Repo) if has_role(actor, "writer", repo);
//! has_role(actor, "writer", repo: Repo) if
//!   has_relation(related_org, "parent", repo) and has_role(actor, "owner", related_org);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{PolicyError, PolicyResult, ValidationError};
use super::rules::*;
use super::sources::SourceInfo;
use super::terms::*;

/// Body of a resource block as the parser saw it, before validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Production {
    /// `roles = [...]`, `permissions = [...]` or `relations = {...}`.
    Declaration((Term, Term)),
    /// `"head" if "implier"` with an optional `on "relation"`.
    ShorthandRule(Term, (Term, Option<(Term, Term)>)),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Declaration {
    Role,
    Permission,
    /// The related class, e.g. `Org` in `parent: Org`.
    Relation(Term),
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Role => write!(f, "role"),
            Self::Permission => write!(f, "permission"),
            Self::Relation(_) => write!(f, "relation"),
        }
    }
}

impl Declaration {
    fn rule_name(&self) -> Symbol {
        Symbol(format!("has_{}", self))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShorthandRule {
    /// `"reader"` in `"reader" if "writer";`.
    pub head: Term,
    /// The implier, plus the `on "relation"` suffix when present.
    pub body: (Term, Option<(Term, Term)>),
}

type Declarations = HashMap<Term, Declaration>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockType {
    Actor,
    Resource,
}

/// A parsed block whose declarations have not been merged into the KB yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceBlock {
    pub block_type: BlockType,
    pub resource: Term,
    pub roles: Option<Term>,
    pub permissions: Option<Term>,
    pub relations: Option<Term>,
    pub shorthand_rules: Vec<ShorthandRule>,
}

fn block_error(term: &Term, msg: String) -> PolicyError {
    ValidationError::ResourceBlock {
        term: term.clone(),
        msg,
    }
    .into()
}

fn block_type(keyword: Option<Term>, resource: &Term) -> PolicyResult<BlockType> {
    let keyword = match keyword {
        Some(keyword) => keyword,
        None => {
            return Err(block_error(
                resource,
                format!("Expected 'actor {0}' or 'resource {0}'.", resource),
            ))
        }
    };
    match keyword.as_symbol()?.0.as_str() {
        "actor" => Ok(BlockType::Actor),
        "resource" => Ok(BlockType::Resource),
        other => Err(block_error(
            &keyword,
            format!("Expected 'actor' or 'resource' but found '{}'.", other),
        )),
    }
}

impl ResourceBlock {
    /// Validate parsed productions. Every problem found is returned, not just the first.
    pub fn from_productions(
        keyword: Option<Term>,
        resource: Term,
        productions: Vec<Production>,
    ) -> (Self, Vec<PolicyError>) {
        let mut errors = vec![];
        let block_type = block_type(keyword, &resource).unwrap_or_else(|e| {
            errors.push(e);
            BlockType::Resource
        });

        let mut block = Self {
            block_type,
            resource,
            roles: None,
            permissions: None,
            relations: None,
            shorthand_rules: vec![],
        };

        for production in productions {
            match production {
                Production::Declaration((name, declared)) => {
                    let name_str = name.as_symbol().map(|s| s.0.as_str());
                    let (slot, kind) = match (name_str, declared.value()) {
                        (Ok("roles"), Value::List(_)) => (&mut block.roles, "roles"),
                        (Ok("permissions"), Value::List(_)) => {
                            (&mut block.permissions, "permissions")
                        }
                        (Ok("relations"), Value::Dictionary(_)) => {
                            (&mut block.relations, "relations")
                        }
                        (Ok("roles" | "permissions"), _) => {
                            errors.push(block_error(
                                &declared,
                                format!("Expected '{}' declaration to be a list of strings", name),
                            ));
                            continue;
                        }
                        (Ok("relations"), _) => {
                            errors.push(block_error(
                                &declared,
                                "Expected 'relations' declaration to be a dictionary".to_owned(),
                            ));
                            continue;
                        }
                        _ => {
                            errors.push(block_error(
                                &name,
                                format!(
                                    "Unexpected declaration '{}'. Expected 'roles', 'permissions' or 'relations'.",
                                    name
                                ),
                            ));
                            continue;
                        }
                    };
                    if slot.is_some() {
                        errors.push(block_error(
                            &declared,
                            format!(
                                "Multiple '{}' declarations in '{}' resource block.",
                                kind, block.resource
                            ),
                        ));
                    }
                    *slot = Some(declared);
                }
                Production::ShorthandRule(head, body) => {
                    block.shorthand_rules.push(ShorthandRule { head, body })
                }
            }
        }
        (block, errors)
    }

    fn declarations(&self) -> PolicyResult<Declarations> {
        let mut declarations = HashMap::new();
        let mut declare = |key: Term, new: Declaration| -> PolicyResult<()> {
            if let Some(existing) = declarations.insert(key.clone(), new.clone()) {
                return Err(ValidationError::DuplicateResourceBlockDeclaration {
                    resource: self.resource.clone(),
                    declaration: key,
                    existing: existing.to_string(),
                    new: new.to_string(),
                }
                .into());
            }
            Ok(())
        };

        for (list, declaration) in [
            (&self.roles, Declaration::Role),
            (&self.permissions, Declaration::Permission),
        ] {
            let items = list
                .iter()
                .flat_map(|l| l.value().as_list().into_iter().flatten());
            for item in items {
                if !matches!(item.value(), Value::String(_)) {
                    return Err(block_error(
                        item,
                        format!("Expected a string {}; found {}", declaration, item),
                    ));
                }
                declare(item.clone(), declaration.clone())?;
            }
        }
        if let Some(relations) = &self.relations {
            if let Value::Dictionary(dict) = relations.value() {
                for (name, related) in &dict.fields {
                    related.as_symbol()?;
                    // Relations are referenced by string in shorthand rules.
                    let key = related.clone_with_value(Value::String(name.0.clone()));
                    declare(key, Declaration::Relation(related.clone()))?;
                }
            }
        }
        Ok(declarations)
    }
}

/// Variable name for a block's resource: `Repo` becomes `repo`, `related_repo` when it
/// names the other side of a relation.
fn resource_var(resource: &Term, related: bool) -> PolicyResult<Value> {
    let name = &resource.as_symbol()?.0;
    let mut var = name.to_lowercase();
    if &var == name {
        var.push_str("_instance");
    }
    if related {
        var.insert_str(0, "related_");
    }
    Ok(Value::Variable(Symbol(var)))
}

/// Union of every class declared with an `actor` block.
pub const ACTOR_UNION_NAME: &str = "Actor";
/// Union of every class declared with a `resource` block.
pub const RESOURCE_UNION_NAME: &str = "Resource";

fn typed_param(name: &str, class: &str) -> Parameter {
    Parameter {
        parameter: Term::new_temporary(Value::Variable(Symbol::new(name))),
        specializer: Some(Term::new_temporary(Value::Pattern(Pattern::instance(class)))),
    }
}

fn rule_type(name: Symbol, params: Vec<Parameter>) -> Rule {
    Rule {
        name,
        params,
        body: Term::new_temporary(Value::Expression(Operation::new(Operator::And, vec![]))),
        source_info: SourceInfo::ffi(),
    }
}

/// Declarations of every block loaded so far, keyed by resource name.
#[derive(Clone, Default, Debug)]
pub struct ResourceBlocks {
    declarations: HashMap<Term, Declarations>,
    pub shorthand_rules: HashMap<Term, Vec<ShorthandRule>>,
    actors: HashSet<Term>,
    resources: HashSet<Term>,
}

impl ResourceBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.declarations.clear();
        self.shorthand_rules.clear();
        self.actors.clear();
        self.resources.clear();
    }

    /// Merge `block` in. Reopening a block may add declarations but not change them.
    pub fn add(&mut self, block: ResourceBlock) -> Vec<PolicyError> {
        let declarations = match block.declarations() {
            Ok(declarations) => declarations,
            Err(e) => return vec![e],
        };
        match block.block_type {
            BlockType::Actor => self.actors.insert(block.resource.clone()),
            BlockType::Resource => self.resources.insert(block.resource.clone()),
        };
        let mut errors = vec![];
        let existing = self.declarations.entry(block.resource.clone()).or_default();
        for (key, new) in declarations {
            match existing.get(&key) {
                Some(old) if old != &new => errors.push(
                    ValidationError::DuplicateResourceBlockDeclaration {
                        resource: block.resource.clone(),
                        declaration: key,
                        existing: old.to_string(),
                        new: new.to_string(),
                    }
                    .into(),
                ),
                _ => {
                    existing.insert(key, new);
                }
            }
        }
        self.shorthand_rules
            .entry(block.resource)
            .or_default()
            .extend(block.shorthand_rules);
        errors
    }

    /// Classes in the union called `union`, or `None` if there is no
    /// such union.
    pub fn union_members(&self, union: &Symbol) -> Option<impl Iterator<Item = &Symbol>> {
        let members = match union.0.as_str() {
            ACTOR_UNION_NAME => &self.actors,
            RESOURCE_UNION_NAME => &self.resources,
            _ => return None,
        };
        Some(members.iter().filter_map(|m| m.as_symbol().ok()))
    }

    fn declares(&self, wanted: fn(&Declaration) -> bool) -> bool {
        self.declarations
            .values()
            .flat_map(HashMap::values)
            .any(wanted)
    }

    /// Rule types implied by the blocks. `has_role` and `has_permission`
    /// take an actor, a string and a resource when any block declares
    /// roles or permissions. Each relation `name: Related` declared in
    /// block `R` adds `has_relation(subject: Related, "name", object: R)`.
    pub fn rule_types(&self) -> Vec<Rule> {
        let mut types = vec![];
        let has_roles = self.declares(|d| matches!(d, Declaration::Role));
        let has_permissions = self.declares(|d| matches!(d, Declaration::Permission));
        for (declaration, declared) in [
            (Declaration::Role, has_roles),
            (Declaration::Permission, has_permissions),
        ] {
            if declared {
                types.push(rule_type(
                    declaration.rule_name(),
                    vec![
                        typed_param("actor", ACTOR_UNION_NAME),
                        typed_param(&declaration.to_string(), "String"),
                        typed_param("resource", RESOURCE_UNION_NAME),
                    ],
                ));
            }
        }
        for (resource, declarations) in &self.declarations {
            let resource_name = match resource.as_symbol() {
                Ok(name) => name,
                Err(_) => continue,
            };
            for (name, declaration) in declarations {
                if let Declaration::Relation(related) = declaration {
                    let related = match related.as_symbol() {
                        Ok(related) => related,
                        Err(_) => continue,
                    };
                    types.push(rule_type(
                        Symbol::new("has_relation"),
                        vec![
                            typed_param("subject", &related.0),
                            Parameter {
                                parameter: name.clone(),
                                specializer: None,
                            },
                            typed_param("object", &resource_name.0),
                        ],
                    ));
                }
            }
        }
        types
    }

    fn declaration(&self, name: &Term, resource: &Term) -> PolicyResult<&Declaration> {
        self.declarations
            .get(resource)
            .and_then(|declarations| declarations.get(name))
            .ok_or_else(|| {
                block_error(
                    name,
                    format!(
                        "Undeclared term {} referenced in rule in '{}' resource block. Did you mean to declare it as a role, permission, or relation?",
                        name, resource
                    ),
                )
            })
    }

    fn related_type(&self, relation: &Term, resource: &Term) -> PolicyResult<&Term> {
        match self.declaration(relation, resource)? {
            Declaration::Relation(related) => Ok(related),
            other => Err(block_error(
                relation,
                format!("{} is declared as a {} in '{}', not a relation", relation, other, resource),
            )),
        }
    }

    /// Expand one shorthand rule of `resource` into a rule.
    pub fn expand(&self, shorthand: &ShorthandRule, resource: &Term) -> PolicyResult<Rule> {
        let ShorthandRule {
            head,
            body: (implier, relation),
        } = shorthand;
        let resource_name = resource.as_symbol()?;
        let resource_term = head.clone_with_value(resource_var(resource, false)?);
        let actor = head.clone_with_value(Value::Variable(Symbol::new("actor")));
        let call = |term: &Term, name: Symbol, args: TermList| {
            term.clone_with_value(Value::Call(Call {
                name,
                args,
                kwargs: None,
            }))
        };

        let body = match relation {
            None => {
                let name = self.declaration(implier, resource)?.rule_name();
                vec![call(implier, name, vec![actor.clone(), implier.clone(), resource_term.clone()])]
            }
            Some((keyword, relation)) => {
                if keyword.as_symbol()?.0 != "on" {
                    return Err(block_error(
                        keyword,
                        format!("Unexpected relation keyword '{}'. Did you mean 'on'?", keyword),
                    ));
                }
                let related_type = self.related_type(relation, resource)?;
                let related_var = relation.clone_with_value(resource_var(related_type, true)?);
                let name = match self.declarations.get(related_type) {
                    None => {
                        return Err(block_error(
                            related_type,
                            format!(
                                "{}: relation {} has type '{}', but no such resource block exists. Try declaring one: `resource {} {{}}`",
                                resource, relation, related_type, related_type
                            ),
                        ))
                    }
                    Some(declarations) => match declarations.get(implier) {
                        Some(declaration) => declaration.rule_name(),
                        None => {
                            return Err(block_error(
                                implier,
                                format!(
                                    "{}: term {} is not declared in related resource block '{}'",
                                    resource, implier, related_type
                                ),
                            ))
                        }
                    },
                };
                vec![
                    call(
                        relation,
                        Symbol::new("has_relation"),
                        vec![related_var.clone(), relation.clone(), resource_term.clone()],
                    ),
                    call(implier, name, vec![actor.clone(), implier.clone(), related_var]),
                ]
            }
        };

        let name = match self.declaration(head, resource)? {
            Declaration::Relation(_) => {
                return Err(block_error(
                    head,
                    format!("{} is a relation and cannot head a shorthand rule", head),
                ))
            }
            declaration => declaration.rule_name(),
        };
        Ok(Rule {
            name,
            params: vec![
                Parameter {
                    parameter: actor,
                    specializer: None,
                },
                Parameter {
                    parameter: head.clone(),
                    specializer: None,
                },
                Parameter {
                    parameter: resource_term,
                    specializer: Some(resource.clone_with_value(Value::Pattern(Pattern::instance(
                        &resource_name.0,
                    )))),
                },
            ],
            body: head.clone_with_value(Value::Expression(Operation::new(Operator::And, body))),
            source_info: head.source_info.clone(),
        })
    }

    /// Expand every stored shorthand rule.
    pub fn rules(&self) -> (Vec<Rule>, Vec<PolicyError>) {
        let mut rules = vec![];
        let mut errors = vec![];
        for (resource, shorthands) in &self.shorthand_rules {
            for shorthand in shorthands {
                match self.expand(shorthand, resource) {
                    Ok(rule) => rules.push(rule),
                    Err(e) => errors.push(e),
                }
            }
        }
        (rules, errors)
    }
}
