use std::collections::HashMap;

use super::folder::*;
use super::kb::*;
use super::rules::*;
use super::terms::*;

/// Give every non-constant variable in a rule a fresh name, so each
/// activation of the rule gets its own variables.
pub struct Renamer<'kb> {
    kb: &'kb KnowledgeBase,
    renames: HashMap<Symbol, Symbol>,
}

impl<'kb> Renamer<'kb> {
    pub fn new(kb: &'kb KnowledgeBase) -> Self {
        Self {
            kb,
            renames: HashMap::new(),
        }
    }

    fn rename(&mut self, v: Symbol) -> Symbol {
        if self.kb.is_constant(&v) {
            return v;
        }
        let kb = self.kb;
        self.renames
            .entry(v)
            .or_insert_with_key(|v| kb.gensym(&v.0))
            .clone()
    }
}

impl<'kb> Folder for Renamer<'kb> {
    fn fold_variable(&mut self, v: Symbol) -> Symbol {
        self.rename(v)
    }

    fn fold_rest_variable(&mut self, r: Symbol) -> Symbol {
        self.rename(r)
    }
}

/// Lifts lookups, arithmetic and constructors out of their surrounding
/// term: `f(a.b)` becomes `.(a, "b", _value_1) and f(_value_1)`. Each
/// lifted operation gets an extra output argument and is hoisted into the
/// nearest enclosing conjunction.
pub struct Rewriter<'kb> {
    kb: &'kb KnowledgeBase,
    stack: Vec<Vec<Term>>,
}

impl<'kb> Rewriter<'kb> {
    pub fn new(kb: &'kb KnowledgeBase) -> Self {
        Self { kb, stack: vec![] }
    }

    fn needs_rewrite(o: &Operation) -> bool {
        match o.operator {
            Operator::Dot => o.args.len() == 2,
            op if op.is_arithmetic() => o.args.len() == 2,
            Operator::New => o.args.len() == 1,
            _ => false,
        }
    }

    /// Fold `t` inside a fresh frame and prepend whatever got hoisted.
    fn fold_in_frame(&mut self, t: Term) -> Term {
        self.stack.push(vec![]);
        let mut folded = self.fold_term(t);
        for rewrite in self.stack.pop().unwrap_or_default().into_iter().rev() {
            and_wrap(&mut folded, rewrite);
        }
        folded
    }
}

fn temp_name(op: Operator) -> &'static str {
    match op {
        Operator::Dot => "value",
        Operator::New => "instance",
        _ => "op",
    }
}

impl<'kb> Folder for Rewriter<'kb> {
    /// Lifted operations in the head become trailing body conjuncts.
    fn fold_rule(&mut self, rule: Rule) -> Rule {
        let Rule {
            name,
            params,
            body,
            source_info,
        } = rule;
        let mut body = self.fold_term(body);

        self.stack.push(vec![]);
        let params = params.into_iter().map(|p| self.fold_param(p)).collect();
        let rewrites = self.stack.pop().unwrap_or_default();
        if !rewrites.is_empty() {
            let args = unwrap_and(&body).into_iter().chain(rewrites).collect();
            body.replace_value(Value::Expression(Operation::new(Operator::And, args)));
        }
        Rule {
            name,
            params,
            body,
            source_info,
        }
    }

    fn fold_term(&mut self, t: Term) -> Term {
        if self.stack.is_empty() {
            return self.fold_in_frame(t);
        }
        match t.value() {
            Value::Expression(o) if Self::needs_rewrite(o) => {
                let mut lifted = fold_operation(o.clone(), self);
                let temp = Value::Variable(self.kb.gensym(temp_name(o.operator)));
                lifted.args.push(Term::new_temporary(temp.clone()));
                if let Some(frame) = self.stack.last_mut() {
                    frame.push(t.clone_with_value(Value::Expression(lifted)));
                }
                t.clone_with_value(temp)
            }
            _ => fold_term(t, self),
        }
    }

    fn fold_operation(&mut self, o: Operation) -> Operation {
        match o.operator {
            Operator::And | Operator::Or | Operator::Not | Operator::ForAll => Operation {
                operator: o.operator,
                args: o
                    .args
                    .into_iter()
                    .map(|arg| self.fold_in_frame(arg))
                    .collect(),
            },
            _ => fold_operation(o, self),
        }
    }

    fn fold_variable(&mut self, v: Symbol) -> Symbol {
        if v.is_anonymous() {
            self.kb.gensym("_")
        } else {
            v
        }
    }

    fn fold_rest_variable(&mut self, v: Symbol) -> Symbol {
        self.fold_variable(v)
    }
}

/// Replace `left` with `right and left`.
fn and_wrap(left: &mut Term, right: Term) {
    let wrapped = Value::Expression(Operation::new(Operator::And, vec![right, left.clone()]));
    left.replace_value(wrapped);
}

/// Conjuncts of an `And` body, or the body itself.
pub fn unwrap_and(term: &Term) -> TermList {
    match term.value() {
        Value::Expression(op) => op.conjuncts(),
        _ => vec![term.clone()],
    }
}

pub fn rewrite_term(term: Term, kb: &KnowledgeBase) -> Term {
    Rewriter::new(kb).fold_term(term)
}

pub fn rewrite_rule(rule: Rule, kb: &KnowledgeBase) -> Rule {
    Rewriter::new(kb).fold_rule(rule)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::formatting::ToPolicy;
    use crate::sources::Source;

    fn parse_query(src: &str) -> Term {
        crate::parser::parse_query(Arc::new(Source::new(src))).unwrap()
    }

    fn parse_rule(src: &str) -> Rule {
        crate::parser::parse_rules(Arc::new(Source::new(src)))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_anonymous_variables_are_distinct() {
        let kb = KnowledgeBase::new();
        let query = parse_query("[1, 2, 3] = [_, _, _]");
        assert_eq!(
            rewrite_term(query, &kb).to_policy(),
            "[1, 2, 3] = [_1, _2, _3]"
        );
    }

    #[test]
    fn test_head_lookups_move_into_body() {
        let kb = KnowledgeBase::new();
        let rule = rewrite_rule(parse_rule("f(a.b);"), &kb);
        assert_eq!(rule.to_policy(), "f(_value_1) if a.b = _value_1;");

        let rule = rewrite_rule(parse_rule("f(a.b.c);"), &kb);
        assert_eq!(
            rule.to_policy(),
            "f(_value_3) if a.b = _value_2 and _value_2.c = _value_3;"
        );
    }

    #[test]
    fn test_nested_method_calls() {
        let kb = KnowledgeBase::new();
        let rule = rewrite_rule(parse_rule("f(a, c) if a.b(c.d());"), &kb);
        assert_eq!(
            rule.to_policy(),
            "f(a, c) if c.d() = _value_1 and a.b(_value_1) = _value_2 and _value_2;"
        );
    }

    #[test]
    fn test_arithmetic() {
        let kb = KnowledgeBase::new();
        let term = rewrite_term(parse_query("x + 1 = 2"), &kb);
        assert_eq!(term.to_policy(), "x + 1 = _op_1 and _op_1 = 2");

        let rule = rewrite_rule(
            parse_rule("fib(n, a + b) if fib(n - 1, a) and fib(n - 2, b);"),
            &kb,
        );
        assert_eq!(
            rule.to_policy(),
            "fib(n, _op_4) if n - 1 = _op_2 and fib(_op_2, a) and n - 2 = _op_3 and fib(_op_3, b) and a + b = _op_4;"
        );
    }

    #[test]
    fn test_constructor_is_lifted() {
        let kb = KnowledgeBase::new();
        let term = rewrite_term(parse_query("f(new Foo(x: bar.y))"), &kb);
        assert_eq!(
            term.to_policy(),
            "bar.y = _value_1 and new Foo(x: _value_1) = _instance_2 and f(_instance_2)"
        );
    }

    #[test]
    fn test_negation_gets_its_own_frame() {
        let kb = KnowledgeBase::new();
        let term = rewrite_term(parse_query("not foo.x = 1"), &kb);
        assert_eq!(term.to_policy(), "not (foo.x = _value_1 and _value_1 = 1)");

        let term = rewrite_term(parse_query("forall(x in y.items, x.ok)"), &kb);
        assert_eq!(
            term.to_policy(),
            "forall(y.items = _value_2 and x in _value_2, x.ok = _value_3 and _value_3)"
        );
    }

    #[test]
    fn test_renamer_skips_constants() {
        let mut kb = KnowledgeBase::new();
        kb.register_constant(sym!("Foo"), term!(1)).unwrap();
        let rule = rule!("f", [sym!("x")] => call!("g", [sym!("x"), sym!("Foo")]));
        let renamed = Renamer::new(&kb).fold_rule(rule);
        assert_eq!(renamed.to_policy(), "f(_x_1) if g(_x_1, Foo);");
    }
}
