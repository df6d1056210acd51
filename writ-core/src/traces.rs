use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::formatting::term_source;
use super::rules::*;
use super::terms::*;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Rule(Arc<Rule>),
    Term(Term),
}

/// One step of an evaluation: a query or the rule it entered, with the
/// steps it took underneath.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub node: Node,
    pub children: Vec<Rc<Trace>>,
}

impl Trace {
    pub fn term(&self) -> Option<Term> {
        if let Node::Term(t) = &self.node {
            Some(t.clone())
        } else {
            None
        }
    }

    /// Indented rendering of the tree. Conjunctions are elided; their
    /// conjuncts show up one level down.
    pub fn draw(&self) -> String {
        let mut res = String::new();
        self.draw_trace(0, &mut res);
        res
    }

    fn draw_trace(&self, nest: usize, res: &mut String) {
        if matches!(&self.node, Node::Term(term)
            if matches!(term.value(), Value::Expression(Operation { operator: Operator::And, .. })))
        {
            for c in &self.children {
                c.draw_trace(nest + 1, res);
            }
            return;
        }

        let text = match &self.node {
            Node::Rule(rule) => rule.to_string(),
            Node::Term(term) => term_source(term, false),
        };
        let indented = text
            .split('\n')
            .map(|line| "  ".repeat(nest) + line)
            .collect::<Vec<_>>()
            .join("\n");
        res.push_str(&indented);
        res.push_str(" [");
        if !self.children.is_empty() {
            res.push('\n');
            for c in &self.children {
                c.draw_trace(nest + 1, res);
            }
            res.push_str(&"  ".repeat(nest));
        }
        res.push_str("]\n");
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    pub trace: Rc<Trace>,
    pub formatted: String,
}

impl TraceResult {
    pub fn new(trace: Rc<Trace>) -> Self {
        Self {
            formatted: trace.draw(),
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(term: Term) -> Rc<Trace> {
        Rc::new(Trace {
            node: Node::Term(term),
            children: vec![],
        })
    }

    #[test]
    fn test_draw_nests_rules_and_skips_conjunctions() {
        let rule = rule!("f", [sym!("x")] => op!(Gt, var!("x"), term!(1)));
        let body = Rc::new(Trace {
            node: Node::Term(term!(op!(And, term!(op!(Gt, var!("x"), term!(1)))))),
            children: vec![leaf(term!(op!(Gt, var!("x"), term!(1))))],
        });
        let root = Trace {
            node: Node::Term(term!(call!("f", [2]))),
            children: vec![Rc::new(Trace {
                node: Node::Rule(Arc::new(rule)),
                children: vec![body],
            })],
        };
        assert_eq!(
            root.draw(),
            "f(2) [\n  f(x) if x > 1; [\n      x > 1 []\n  ]\n]\n"
        );
        assert_eq!(root.term(), Some(term!(call!("f", [2]))));
        assert_eq!(TraceResult::new(Rc::new(root.clone())).formatted, root.draw());
    }
}
