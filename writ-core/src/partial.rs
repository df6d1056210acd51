//! Turning the constraints collected on a partial variable into the
//! residual expression returned with a result.
//!
//! Constraints are recorded as they are encountered, so they mention
//! temporaries introduced by rewriting (`_value_3 = x.field`), contain
//! duplicates, and name the variable by whichever alias was in scope. The
//! simplifier gathers everything reachable from the variable through
//! temporaries, substitutes temporaries away, and renames the variable to
//! `_this`.
use std::collections::{HashSet, VecDeque};

use crate::bindings::BindingManager;
use crate::folder::{fold_term, Folder};
use crate::terms::*;

struct Substitute<'a> {
    var: &'a Symbol,
    value: &'a Term,
}

impl<'a> Folder for Substitute<'a> {
    fn fold_term(&mut self, t: Term) -> Term {
        match t.value() {
            Value::Variable(v) if v == self.var => self.value.clone(),
            _ => fold_term(t, self),
        }
    }
}

fn substitute(term: Term, var: &Symbol, value: &Term) -> Term {
    Substitute { var, value }.fold_term(term)
}

/// Rename `var` to `_this`.
pub fn sub_this(var: &Symbol, term: Term) -> Term {
    let this = Term::from(Value::Variable(Symbol::new(THIS_VAR)));
    substitute(term, var, &this)
}

/// Constraints on `root`, and on every temporary they mention, with bound
/// variables replaced by their values.
fn gather(root: &Symbol, bindings: &BindingManager) -> Vec<Term> {
    let mut seen = HashSet::new();
    seen.insert(root.clone());
    let mut queue = VecDeque::from(vec![root.clone()]);
    let mut constraints: Vec<Term> = vec![];

    while let Some(var) = queue.pop_front() {
        for constraint in bindings.get_constraints(&var).args {
            let constraint = bindings.deep_deref(&constraint);
            if constraints.contains(&constraint) {
                continue;
            }
            let mut vars = HashSet::new();
            constraint.variables(&mut vars);
            let mut vars: Vec<Symbol> = vars.into_iter().map(|v| bindings.root(&v)).collect();
            vars.sort();
            for v in vars {
                if v.is_temporary_var() && seen.insert(v.clone()) {
                    queue.push_back(v);
                }
            }
            constraints.push(constraint);
        }
    }
    constraints
}

/// `w = t` or `t = w` for a temporary `w` other than `keep` that does not
/// occur in `t`.
fn temporary_binding(constraint: &Term, keep: &Symbol) -> Option<(Symbol, Term)> {
    let op = match constraint.value() {
        Value::Expression(op) if matches!(op.operator, Operator::Unify | Operator::Eq) => op,
        _ => return None,
    };
    if op.args.len() != 2 {
        return None;
    }
    let eliminable = |var: &Term, value: &Term| match var.value() {
        Value::Variable(w) if w != keep && w.is_temporary_var() && !value.contains_variable(w) => {
            Some((w.clone(), value.clone()))
        }
        _ => None,
    };
    eliminable(&op.args[0], &op.args[1]).or_else(|| eliminable(&op.args[1], &op.args[0]))
}

/// Put the ground side of a binary comparison on the right.
fn orient(constraint: Term) -> Term {
    match constraint.value() {
        Value::Expression(Operation { operator, args })
            if args.len() == 2
                && (operator.is_comparison() || *operator == Operator::Unify)
                && args[0].is_ground()
                && !args[1].is_ground() =>
        {
            let swapped = Operation::new(operator.mirrored(), vec![args[1].clone(), args[0].clone()]);
            constraint.clone_with_value(Value::Expression(swapped))
        }
        _ => constraint,
    }
}

fn is_trivial(constraint: &Term) -> bool {
    matches!(constraint.value(),
        Value::Expression(Operation { operator: Operator::Unify | Operator::Eq, args })
            if args.len() == 2 && args[0] == args[1])
}

/// The residual expression for `var`: a conjunction over `_this`.
pub fn simplify_partial(var: &Symbol, bindings: &BindingManager) -> Term {
    let root = bindings.root(var);
    let mut constraints = gather(&root, bindings);

    loop {
        let found = constraints
            .iter()
            .enumerate()
            .find_map(|(i, c)| temporary_binding(c, &root).map(|(w, t)| (i, w, t)));
        match found {
            None => break,
            Some((i, w, t)) => {
                constraints.remove(i);
                constraints = constraints
                    .into_iter()
                    .map(|c| substitute(c, &w, &t))
                    .collect();
            }
        }
    }

    let mut simplified: Vec<Term> = vec![];
    for constraint in constraints.into_iter().map(orient) {
        if !is_trivial(&constraint) && !simplified.contains(&constraint) {
            simplified.push(constraint);
        }
    }

    let conjunction = Term::from(Operation::new(Operator::And, simplified));
    sub_this(&root, conjunction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatting::ToPolicy;

    fn dot(object: Term, field: &str) -> Term {
        term!(op!(Dot, object, str!(field)))
    }

    #[test]
    fn test_temporaries_are_substituted() {
        let mut bm = BindingManager::new();
        bm.bind(&sym!("x"), term!(op!(And))).unwrap();
        bm.add_constraint(&term!(op!(Isa, var!("x"), term!(pattern!(instance!("Repo"))))))
            .unwrap();
        bm.add_constraint(&term!(op!(Unify, var!("_value_1"), dot(var!("x"), "is_public"))))
            .unwrap();
        bm.add_constraint(&term!(op!(Unify, term!(true), dot(var!("x"), "is_public"))))
            .unwrap();
        bm.bind(&sym!("_value_1"), term!(true)).unwrap();

        assert_eq!(
            simplify_partial(&sym!("x"), &bm).to_policy(),
            "_this matches Repo and _this.is_public = true"
        );
    }

    #[test]
    fn test_chains_through_unbound_temporaries() {
        let mut bm = BindingManager::new();
        bm.bind(&sym!("x"), term!(op!(And))).unwrap();
        bm.add_constraint(&term!(op!(Unify, var!("_value_1"), dot(var!("x"), "org"))))
            .unwrap();
        bm.add_constraint(&term!(op!(Unify, var!("_value_2"), dot(var!("_value_1"), "name"))))
            .unwrap();
        bm.add_constraint(&term!(op!(Gt, var!("_value_2"), term!(3))))
            .unwrap();

        assert_eq!(
            simplify_partial(&sym!("x"), &bm).to_policy(),
            "_this.org.name > 3"
        );
    }

    #[test]
    fn test_aliases_become_this() {
        let mut bm = BindingManager::new();
        bm.bind(&sym!("x"), term!(op!(And))).unwrap();
        bm.bind(&sym!("_r_1"), var!("x")).unwrap();
        bm.add_constraint(&term!(op!(Lt, term!(1), dot(var!("_r_1"), "n"))))
            .unwrap();
        bm.add_constraint(&term!(op!(Unify, var!("x"), var!("x"))))
            .unwrap();

        assert_eq!(simplify_partial(&sym!("x"), &bm).to_policy(), "_this.n > 1");
        assert_eq!(
            simplify_partial(&sym!("_r_1"), &bm).to_policy(),
            "_this.n > 1"
        );
    }

    #[test]
    fn test_unconstrained_partial_is_empty_conjunction() {
        let mut bm = BindingManager::new();
        bm.bind(&sym!("x"), term!(op!(And))).unwrap();
        assert_eq!(simplify_partial(&sym!("x"), &bm), term!(op!(And)));
    }
}
