//! Variable bindings for one query.
//!
//! Bindings live in a flat table; every change is recorded on a trail so a
//! choice point only has to remember the trail length (`Bsp`) to undo all
//! bindings made after it. A variable may be bound to a value, aliased to
//! another variable, or constrained: a constrained ("partial") variable is
//! bound to an `And` expression holding the constraints collected so far.
use std::collections::{HashMap, HashSet};

use crate::error::{PolicyResult, RuntimeError};
use crate::folder::{fold_term, Folder};
use crate::terms::{Operation, Operator, Symbol, Term, Value};

pub type Bindings = HashMap<Symbol, Term>;

/// Binding stack pointer: a position on the trail.
pub type Bsp = usize;

#[derive(Clone, Debug, PartialEq)]
pub enum VariableState {
    Unbound,
    Bound(Term),
    /// Unbound, but constrained by the conjunction.
    Partial(Operation),
}

/// One undoable change: `var` used to be bound to `previous`.
#[derive(Clone, Debug)]
pub struct TrailEntry {
    pub var: Symbol,
    pub previous: Option<Term>,
}

#[derive(Clone, Debug, Default)]
pub struct BindingManager {
    table: Bindings,
    trail: Vec<TrailEntry>,
}

impl BindingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bsp(&self) -> Bsp {
        self.trail.len()
    }

    /// Undo every change made after `bsp`.
    pub fn backtrack(&mut self, bsp: Bsp) {
        while self.trail.len() > bsp {
            if let Some(TrailEntry { var, previous }) = self.trail.pop() {
                match previous {
                    Some(value) => self.table.insert(var, value),
                    None => self.table.remove(&var),
                };
            }
        }
    }

    fn set(&mut self, var: Symbol, value: Term) {
        let previous = self.table.insert(var.clone(), value);
        self.trail.push(TrailEntry { var, previous });
    }

    /// Follow aliases from `var` to the last variable of the chain, and
    /// whatever that variable is bound to.
    fn walk<'a>(&'a self, var: &'a Symbol) -> (&'a Symbol, Option<&'a Term>) {
        let mut current = var;
        let mut seen = HashSet::new();
        loop {
            match self.table.get(current) {
                Some(term) => match term.value() {
                    Value::Variable(next) | Value::RestVariable(next) => {
                        if !seen.insert(current) {
                            return (current, None);
                        }
                        current = next;
                    }
                    _ => return (current, Some(term)),
                },
                None => return (current, None),
            }
        }
    }

    /// The variable at the end of `var`'s alias chain.
    pub fn root(&self, var: &Symbol) -> Symbol {
        self.walk(var).0.clone()
    }

    pub fn variable_state(&self, var: &Symbol) -> VariableState {
        match self.walk(var).1 {
            None => VariableState::Unbound,
            Some(term) => match term.value() {
                Value::Expression(op) => VariableState::Partial(op.clone()),
                _ => VariableState::Bound(term.clone()),
            },
        }
    }

    /// Bind `var` to `value`.
    ///
    /// Binding a constrained variable to a value returns its constraints as
    /// a term the caller must query to check them. Binding an already bound
    /// variable is an error; the VM unifies the values instead.
    pub fn bind(&mut self, var: &Symbol, value: Term) -> PolicyResult<Option<Term>> {
        if let Value::Variable(other) | Value::RestVariable(other) = value.value() {
            return self.bind_variables(var, other);
        }
        let root = self.root(var);
        match self.variable_state(&root) {
            VariableState::Bound(existing) => Err(RuntimeError::IncompatibleBindings {
                msg: format!("cannot rebind {} from {} to {}", var, existing, value),
            }
            .into()),
            VariableState::Unbound => {
                self.set(root, value);
                Ok(None)
            }
            VariableState::Partial(constraints) => {
                self.set(root, value);
                Ok(Some(Term::from(constraints)))
            }
        }
    }

    /// Overwrite the value of a variable the VM created to receive a host
    /// answer. The change is trailed like any other binding.
    pub fn rebind(&mut self, var: &Symbol, value: Term) {
        self.set(var.clone(), value);
    }

    fn bind_variables(&mut self, left: &Symbol, right: &Symbol) -> PolicyResult<Option<Term>> {
        let (left, right) = (self.root(left), self.root(right));
        if left == right {
            return Ok(None);
        }
        let alias = |to: &Symbol| Term::from(Value::Variable(to.clone()));
        match (self.variable_state(&left), self.variable_state(&right)) {
            (VariableState::Bound(l), VariableState::Bound(r)) => Ok(Some(Term::from(Operation::new(
                Operator::Unify,
                vec![l, r],
            )))),
            (VariableState::Unbound, _) => {
                self.set(left, alias(&right));
                Ok(None)
            }
            (_, VariableState::Unbound) => {
                self.set(right, alias(&left));
                Ok(None)
            }
            (VariableState::Bound(value), VariableState::Partial(constraints)) => {
                self.set(right, value);
                Ok(Some(Term::from(constraints)))
            }
            (VariableState::Partial(constraints), VariableState::Bound(value)) => {
                self.set(left, value);
                Ok(Some(Term::from(constraints)))
            }
            (VariableState::Partial(mut l), VariableState::Partial(r)) => {
                for constraint in r.args {
                    if !l.args.contains(&constraint) {
                        l.args.push(constraint);
                    }
                }
                self.set(right, alias(&left));
                self.set(left, Term::from(l));
                Ok(None)
            }
        }
    }

    /// Record `constraint` on every unbound or constrained variable it
    /// mentions.
    pub fn add_constraint(&mut self, constraint: &Term) -> PolicyResult<()> {
        let mut vars = HashSet::new();
        constraint.variables(&mut vars);
        let roots: HashSet<Symbol> = vars.iter().map(|v| self.root(v)).collect();
        for root in roots {
            let mut constraints = match self.variable_state(&root) {
                VariableState::Bound(_) => continue,
                VariableState::Unbound => Operation::new(Operator::And, vec![]),
                VariableState::Partial(constraints) => constraints,
            };
            if !constraints.args.contains(constraint) {
                constraints.args.push(constraint.clone());
                self.set(root, Term::from(constraints));
            }
        }
        Ok(())
    }

    /// Constraints recorded on `var`, empty if it has none.
    pub fn get_constraints(&self, var: &Symbol) -> Operation {
        match self.variable_state(var) {
            VariableState::Partial(constraints) => constraints,
            _ => Operation::new(Operator::And, vec![]),
        }
    }

    /// Replace bound variables in `term` by their values, recursively.
    /// Unbound and constrained variables become the root of their alias chain.
    pub fn deep_deref(&self, term: &Term) -> Term {
        struct Derefer<'bm> {
            bindings: &'bm BindingManager,
            expanding: HashSet<Symbol>,
        }

        impl<'bm> Folder for Derefer<'bm> {
            fn fold_term(&mut self, t: Term) -> Term {
                match t.value() {
                    Value::Variable(v) | Value::RestVariable(v) => {
                        let root = self.bindings.root(v);
                        match self.bindings.variable_state(&root) {
                            VariableState::Bound(value) if !self.expanding.contains(&root) => {
                                self.expanding.insert(root.clone());
                                let folded = self.fold_term(value);
                                self.expanding.remove(&root);
                                folded
                            }
                            _ if &root == v => t,
                            _ => {
                                let renamed = match t.value() {
                                    Value::RestVariable(_) => Value::RestVariable(root),
                                    _ => Value::Variable(root),
                                };
                                t.clone_with_value(renamed)
                            }
                        }
                    }
                    _ => fold_term(t, self),
                }
            }
        }

        Derefer {
            bindings: self,
            expanding: HashSet::new(),
        }
        .fold_term(term.clone())
    }

    /// Shallow dereference: the value of a bound variable, or the term itself.
    pub fn deref(&self, term: &Term) -> Term {
        match term.value() {
            Value::Variable(v) | Value::RestVariable(v) => match self.variable_state(v) {
                VariableState::Bound(value) => value,
                _ => term.clone(),
            },
            _ => term.clone(),
        }
    }

    /// Every variable with an entry in the table.
    pub fn variables(&self) -> impl Iterator<Item = &Symbol> {
        self.table.keys()
    }

    /// Values of `vars`, dereferenced. Unbound variables are left out.
    pub fn variable_bindings(&self, vars: &HashSet<Symbol>) -> Bindings {
        vars.iter()
            .filter_map(|var| {
                let value = self.deep_deref(&Term::from(Value::Variable(var.clone())));
                match value.value() {
                    Value::Variable(v) if v == var => None,
                    _ => Some((var.clone(), value)),
                }
            })
            .collect()
    }

    /// Changes made after `bsp`, oldest first.
    pub fn trail_after(&self, bsp: Bsp) -> &[TrailEntry] {
        &self.trail[bsp.min(self.trail.len())..]
    }

    /// Current value of each variable first bound after `bsp`.
    pub fn bindings_after(&self, include_temps: bool, bsp: Bsp) -> Bindings {
        self.trail_after(bsp)
            .iter()
            .map(|entry| &entry.var)
            .filter(|var| include_temps || !var.is_temporary_var())
            .filter_map(|var| self.table.get(var).map(|value| (var.clone(), value.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_backtrack() {
        let mut bm = BindingManager::new();
        let start = bm.bsp();
        assert!(bm.bind(&sym!("x"), term!(1)).unwrap().is_none());
        assert_eq!(bm.variable_state(&sym!("x")), VariableState::Bound(term!(1)));
        assert!(bm.bind(&sym!("x"), term!(2)).is_err());

        let mark = bm.bsp();
        bm.bind(&sym!("y"), var!("x")).unwrap();
        assert_eq!(bm.variable_state(&sym!("y")), VariableState::Bound(term!(1)));

        bm.backtrack(mark);
        assert_eq!(bm.variable_state(&sym!("y")), VariableState::Unbound);
        bm.backtrack(start);
        assert_eq!(bm.variable_state(&sym!("x")), VariableState::Unbound);
        assert!(bm.variables().next().is_none());
    }

    #[test]
    fn test_aliases_share_a_value() {
        let mut bm = BindingManager::new();
        bm.bind(&sym!("a"), var!("b")).unwrap();
        bm.bind(&sym!("b"), var!("c")).unwrap();
        // Already aliased; nothing to do.
        assert!(bm.bind(&sym!("c"), var!("a")).unwrap().is_none());
        bm.bind(&sym!("a"), term!("v")).unwrap();
        for v in ["a", "b", "c"] {
            assert_eq!(bm.variable_state(&sym!(v)), VariableState::Bound(term!("v")));
        }
    }

    #[test]
    fn test_walk_stops_on_cycles() {
        let mut bm = BindingManager::new();
        bm.set(sym!("p"), var!("q"));
        bm.set(sym!("q"), var!("p"));
        assert_eq!(bm.variable_state(&sym!("p")), VariableState::Unbound);
    }

    #[test]
    fn test_constraints_are_checked_on_bind() {
        let mut bm = BindingManager::new();
        let gt = term!(op!(Gt, var!("x"), term!(1)));
        bm.add_constraint(&gt).unwrap();
        assert_eq!(
            bm.variable_state(&sym!("x")),
            VariableState::Partial(op!(And, gt.clone()))
        );
        let check = bm.bind(&sym!("x"), term!(2)).unwrap();
        assert_eq!(check, Some(term!(op!(And, gt))));
        assert_eq!(bm.variable_state(&sym!("x")), VariableState::Bound(term!(2)));
    }

    #[test]
    fn test_partials_merge_when_aliased() {
        let mut bm = BindingManager::new();
        let a = term!(op!(Gt, var!("x"), term!(1)));
        let b = term!(op!(Lt, var!("y"), term!(5)));
        bm.add_constraint(&a).unwrap();
        bm.add_constraint(&b).unwrap();
        bm.bind(&sym!("x"), var!("y")).unwrap();
        assert_eq!(bm.root(&sym!("y")), sym!("x"));
        assert_eq!(bm.get_constraints(&sym!("y")), op!(And, a, b));
    }

    #[test]
    fn test_deep_deref() {
        let mut bm = BindingManager::new();
        bm.bind(&sym!("x"), term!([var!("y"), 2])).unwrap();
        bm.bind(&sym!("y"), term!(1)).unwrap();
        bm.bind(&sym!("z"), var!("w")).unwrap();
        assert_eq!(bm.deep_deref(&var!("x")), term!([1, 2]));
        assert_eq!(bm.deep_deref(&var!("z")), var!("w"));

        // A value containing its own variable stops expanding.
        bm.bind(&sym!("loop"), term!([var!("loop")])).unwrap();
        assert_eq!(bm.deep_deref(&var!("loop")), term!([var!("loop")]));
    }

    #[test]
    fn test_bindings_after() {
        let mut bm = BindingManager::new();
        bm.bind(&sym!("constant"), term!(1)).unwrap();
        let csp = bm.bsp();
        bm.bind(&sym!("x"), term!(2)).unwrap();
        bm.bind(&sym!("_tmp"), term!(3)).unwrap();
        assert_eq!(bm.bindings_after(false, csp), hashmap! {sym!("x") => term!(2)});
        assert_eq!(bm.bindings_after(true, csp).len(), 2);
    }
}
