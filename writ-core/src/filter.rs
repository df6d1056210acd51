//! Data filtering output: turn the residual expressions of a partial query
//! into a datastore-neutral filter the host can translate into a query.
use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::bindings::Bindings;
use crate::error::{invalid_state, PolicyResult, RuntimeError};
use crate::formatting::ToPolicy;
use crate::kb::{FieldType, KnowledgeBase};
use crate::terms::*;

type TypeName = String;
type FieldName = String;
type Set<A> = HashSet<A>;

#[derive(Clone, Eq, Debug, Serialize, PartialEq)]
pub struct Filter {
    pub root: TypeName,
    pub relations: Set<Relation>,
    /// Disjunctive normal form: any set of conditions may hold.
    pub conditions: Vec<Set<Condition>>,
}

/// A join from `0.1` to the class `2`.
#[derive(PartialEq, Eq, Debug, Serialize, Clone, Hash)]
pub struct Relation(pub TypeName, pub FieldName, pub TypeName);

#[derive(PartialEq, Eq, Debug, Serialize, Clone, Hash)]
pub struct Condition(pub Datum, pub Comparison, pub Datum);

#[derive(PartialEq, Eq, Debug, Serialize, Clone, Hash)]
pub enum Datum {
    Field(Projection),
    Immediate(Value),
}

/// A field of a class, or with no field the object itself.
#[derive(PartialEq, Eq, Debug, Serialize, Clone, Hash)]
pub struct Projection(pub TypeName, pub Option<FieldName>);

#[derive(PartialEq, Debug, Serialize, Copy, Clone, Eq, Hash)]
pub enum Comparison {
    Eq,
    Neq,
    In,
    Nin,
    Lt,
    Leq,
    Gt,
    Geq,
}

impl Comparison {
    fn from_operator(operator: Operator) -> Option<Self> {
        match operator {
            Operator::Unify | Operator::Eq => Some(Self::Eq),
            Operator::Neq => Some(Self::Neq),
            Operator::In => Some(Self::In),
            Operator::Lt => Some(Self::Lt),
            Operator::Leq => Some(Self::Leq),
            Operator::Gt => Some(Self::Gt),
            Operator::Geq => Some(Self::Geq),
            _ => None,
        }
    }

    fn negate(self) -> Option<Self> {
        match self {
            Self::Eq => Some(Self::Neq),
            Self::Neq => Some(Self::Eq),
            Self::In => Some(Self::Nin),
            Self::Nin => Some(Self::In),
            Self::Lt => Some(Self::Geq),
            Self::Leq => Some(Self::Gt),
            Self::Gt => Some(Self::Leq),
            Self::Geq => Some(Self::Lt),
        }
    }
}

/// A variable followed by a chain of field names, e.g. `_this.org.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PathVar {
    var: Symbol,
    path: Vec<FieldName>,
}

impl PathVar {
    fn from_term(t: &Term) -> PolicyResult<Self> {
        match t.value() {
            Value::Expression(Operation {
                operator: Operator::Dot,
                args,
            }) if args.len() == 2 => {
                let field = args[1].value().as_string()?.to_owned();
                let mut pv = Self::from_term(&args[0])?;
                pv.path.push(field);
                Ok(pv)
            }
            Value::Variable(var) => Ok(Self {
                var: var.clone(),
                path: vec![],
            }),
            _ => invalid_state(format!("not a field path: {}", t.to_policy())),
        }
    }
}

impl Filter {
    /// Build a filter for `class` from the partial bindings of `var` in
    /// each result. No results gives a filter that matches nothing.
    pub fn build(
        kb: &KnowledgeBase,
        results: &[Bindings],
        var: &str,
        class: &str,
    ) -> PolicyResult<Self> {
        let var = Symbol::new(var);
        results
            .iter()
            .map(|bindings| Self::from_bindings(kb, bindings, &var, class))
            .reduce(|left, right| Ok(left?.union(right?)))
            .unwrap_or_else(|| Ok(Self::empty(class)))
    }

    fn from_bindings(
        kb: &KnowledgeBase,
        bindings: &Bindings,
        var: &Symbol,
        class: &str,
    ) -> PolicyResult<Self> {
        let term = bindings.get(var).ok_or_else(|| RuntimeError::IncompatibleBindings {
            msg: format!("no binding for {} in result", var),
        })?;
        Self::from_partial(kb, term, class)
    }

    fn from_partial(kb: &KnowledgeBase, term: &Term, class: &str) -> PolicyResult<Self> {
        match term.value() {
            Value::Expression(op) => {
                let conjuncts = op
                    .conjuncts()
                    .iter()
                    .map(|arg| match arg.value().as_expression() {
                        Ok(x) => Ok(x.clone()),
                        Err(_) => unsupported_term(arg),
                    })
                    .collect::<PolicyResult<Vec<Operation>>>()?;
                FilterBuilder::new(kb, class).build(conjuncts)
            }

            // The variable was bound to a specific object.
            v @ Value::ExternalInstance(_) => Ok(Self {
                root: class.to_owned(),
                relations: HashSet::new(),
                conditions: vec![singleton(Condition(
                    Datum::Field(Projection(class.to_owned(), None)),
                    Comparison::Eq,
                    Datum::Immediate(v.clone()),
                ))],
            }),

            _ => unsupported_term(term),
        }
    }

    fn empty(class: &str) -> Self {
        Self {
            root: class.to_owned(),
            relations: HashSet::new(),
            conditions: vec![singleton(Condition(
                Datum::Immediate(Value::Boolean(true)),
                Comparison::Eq,
                Datum::Immediate(Value::Boolean(false)),
            ))],
        }
    }

    fn union(self, mut other: Self) -> Self {
        other.conditions.extend(self.conditions);
        other.relations.extend(self.relations);
        other
    }
}

struct FilterBuilder<'kb> {
    kb: &'kb KnowledgeBase,
    root: TypeName,
    conditions: Set<Condition>,
    relations: Set<Relation>,
}

impl<'kb> FilterBuilder<'kb> {
    fn new(kb: &'kb KnowledgeBase, root: &str) -> Self {
        Self {
            kb,
            root: root.to_owned(),
            conditions: HashSet::new(),
            relations: HashSet::new(),
        }
    }

    fn relation(&self, typ: &str, field: &str) -> Option<Relation> {
        match self.kb.field_type(&Symbol::new(typ), &Symbol::new(field)) {
            Some(FieldType::Relation {
                other_class_tag, ..
            }) => Some(Relation(
                typ.to_owned(),
                field.to_owned(),
                other_class_tag.clone(),
            )),
            _ => None,
        }
    }

    /// Resolve a path on `_this` into a projection, adding a relation for
    /// every join it crosses.
    fn projection(&mut self, pv: PathVar) -> PolicyResult<Projection> {
        let PathVar { var, mut path } = pv;
        if !var.is_this_var() {
            return invalid_state(format!("unknown type for `{}`", var));
        }
        let mut typ = self.root.clone();

        // Only the last field may be a plain attribute.
        let field = path.pop();
        for dot in path {
            match self.relation(&typ, &dot) {
                None => {
                    return Err(RuntimeError::DataFilteringFieldMissing {
                        var_type: typ,
                        field: dot,
                    }
                    .into())
                }
                Some(rel) => {
                    typ = rel.2.clone();
                    self.relations.insert(rel);
                }
            }
        }

        match field.as_ref().and_then(|dot| self.relation(&typ, dot)) {
            Some(rel) => {
                let tag = rel.2.clone();
                self.relations.insert(rel);
                Ok(Projection(tag, None))
            }
            None => Ok(Projection(typ, field)),
        }
    }

    fn datum(&mut self, x: &Term) -> PolicyResult<Datum> {
        match PathVar::from_term(x) {
            Ok(pv) => self.projection(pv).map(Datum::Field),
            Err(_) => match x.value() {
                v @ (Value::String(_)
                | Value::Number(_)
                | Value::Boolean(_)
                | Value::ExternalInstance(_)
                | Value::List(_)) => Ok(Datum::Immediate(v.clone())),
                _ => invalid_state(format!("illegal immediate value: {}", x.to_policy())),
            },
        }
    }

    fn add_constraint(&mut self, op: Operation) -> PolicyResult<()> {
        let (op, negated) = match op.operator {
            Operator::Not => match op.args.first().map(|t| t.value()) {
                Some(Value::Expression(inner)) => (inner.clone(), true),
                _ => return unsupported_op(op),
            },
            _ => (op, false),
        };
        let comparison = Comparison::from_operator(op.operator)
            .and_then(|c| if negated { c.negate() } else { Some(c) });
        let comparison = match comparison {
            Some(c) if op.args.len() == 2 => c,
            _ => return unsupported_op(op),
        };

        let (left, right) = (self.datum(&op.args[0])?, self.datum(&op.args[1])?);
        let comparison = match (comparison, &left, &right) {
            // Membership in a related object is a join, not a list test.
            (Comparison::In, Datum::Immediate(Value::ExternalInstance(_)), Datum::Field(Projection(_, None)))
            | (Comparison::In, Datum::Field(Projection(_, None)), Datum::Field(Projection(_, None))) => {
                Comparison::Eq
            }
            (Comparison::Nin, Datum::Immediate(Value::ExternalInstance(_)), Datum::Field(Projection(_, None))) => {
                Comparison::Neq
            }
            (c, _, _) => c,
        };
        self.conditions.insert(Condition(left, comparison, right));
        Ok(())
    }

    fn build(mut self, parts: Vec<Operation>) -> PolicyResult<Filter> {
        for op in parts {
            match op.operator {
                // Type tests on `_this` are implied by the root class. Tests on
                // related objects are implied by the relation's declared type.
                Operator::Isa => continue,
                _ => self.add_constraint(op)?,
            }
        }
        Ok(Filter {
            root: self.root,
            relations: self.relations,
            conditions: vec![self.conditions],
        })
    }
}

fn unsupported_term<A>(term: &Term) -> PolicyResult<A> {
    Err(RuntimeError::Unsupported {
        msg: format!("cannot build a filter from {}", term.to_policy()),
    }
    .into())
}

fn unsupported_op<A>(operation: Operation) -> PolicyResult<A> {
    Err(RuntimeError::DataFilteringUnsupportedOp { operation }.into())
}

pub fn singleton<X>(x: X) -> Set<X>
where
    X: std::hash::Hash + Eq,
{
    let mut set = HashSet::new();
    set.insert(x);
    set
}

/// Field types by class, as registered in the knowledge base.
pub fn class_types(kb: &KnowledgeBase) -> HashMap<TypeName, HashMap<FieldName, FieldType>> {
    kb.class_fields()
        .map(|(class, fields)| {
            (
                class.0.clone(),
                fields
                    .iter()
                    .map(|(field, typ)| (field.0.clone(), typ.clone()))
                    .collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb::RelationKind;

    fn dot(object: Term, field: &str) -> Term {
        term!(op!(Dot, object, str!(field)))
    }

    fn this() -> Term {
        var!("_this")
    }

    fn kb() -> KnowledgeBase {
        let mut kb = KnowledgeBase::new();
        kb.register_class(
            sym!("Repo"),
            hashmap! {
                sym!("is_public") => FieldType::Base { class_tag: "Boolean".to_owned() },
                sym!("org") => FieldType::Relation {
                    kind: RelationKind::One,
                    other_class_tag: "Org".to_owned(),
                    my_field: "org_id".to_owned(),
                    other_field: "id".to_owned(),
                },
            },
        );
        kb.register_class(
            sym!("Org"),
            hashmap! { sym!("name") => FieldType::Base { class_tag: "String".to_owned() } },
        );
        kb
    }

    fn result(partial: Term) -> Bindings {
        hashmap! { sym!("r") => partial }
    }

    #[test]
    fn test_no_results_matches_nothing() {
        let filter = Filter::build(&kb(), &[], "r", "Repo").unwrap();
        assert_eq!(filter, Filter::empty("Repo"));
    }

    #[test]
    fn test_simple_field_condition() {
        let partial = term!(op!(
            And,
            term!(op!(Isa, this(), term!(pattern!(instance!("Repo"))))),
            term!(op!(Unify, dot(this(), "is_public"), term!(true)))
        ));
        let filter = Filter::build(&kb(), &[result(partial)], "r", "Repo").unwrap();
        assert_eq!(filter.root, "Repo");
        assert!(filter.relations.is_empty());
        assert_eq!(
            filter.conditions,
            vec![singleton(Condition(
                Datum::Field(Projection("Repo".to_owned(), Some("is_public".to_owned()))),
                Comparison::Eq,
                Datum::Immediate(Value::Boolean(true)),
            ))]
        );
    }

    #[test]
    fn test_paths_become_joins() {
        let partial = term!(op!(
            And,
            term!(op!(Gt, dot(dot(this(), "org"), "name"), str!("m")))
        ));
        let filter = Filter::build(&kb(), &[result(partial)], "r", "Repo").unwrap();
        assert_eq!(
            filter.relations,
            singleton(Relation("Repo".to_owned(), "org".to_owned(), "Org".to_owned()))
        );
        assert_eq!(
            filter.conditions,
            vec![singleton(Condition(
                Datum::Field(Projection("Org".to_owned(), Some("name".to_owned()))),
                Comparison::Gt,
                Datum::Immediate(Value::String("m".to_owned())),
            ))]
        );
    }

    #[test]
    fn test_unknown_relation_is_an_error() {
        let partial = term!(op!(
            And,
            term!(op!(Unify, dot(dot(this(), "owner"), "name"), str!("m")))
        ));
        let err = Filter::build(&kb(), &[result(partial)], "r", "Repo").unwrap_err();
        assert!(
            err.to_string().starts_with("Unregistered field or relation: Repo.owner"),
            "{}",
            err
        );
    }

    #[test]
    fn test_results_are_disjuncts() {
        let first = term!(op!(And, term!(op!(Unify, dot(this(), "is_public"), term!(true)))));
        let second = term!(op!(And));
        let filter = Filter::build(&kb(), &[result(first), result(second)], "r", "Repo").unwrap();
        assert_eq!(filter.conditions.len(), 2);
        assert!(filter.conditions.iter().any(HashSet::is_empty));
    }

    #[test]
    fn test_unsupported_operator() {
        let partial = term!(op!(And, term!(op!(Add, dot(this(), "n"), term!(1)))));
        assert!(Filter::build(&kb(), &[result(partial)], "r", "Repo").is_err());
    }

    #[test]
    fn test_class_types() {
        let types = class_types(&kb());
        assert_eq!(types["Org"]["name"].class_tag(), "String");
        assert_eq!(types["Repo"]["org"].class_tag(), "Org");
    }
}
