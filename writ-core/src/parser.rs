//! Policy parser. The grammar lives in `writ.lalrpop`; this module holds
//! the helpers its actions call and the mapping into [`error::ParseError`].
//!
//! Binding strength, tightest first: `.` and calls, `* / mod rem`, `+ -`,
//! comparisons and `=`/`:=`, `matches`/`in`, `not`, `and`, `or`.

use std::collections::BTreeMap;
use std::sync::Arc;

use lalrpop_util::{lalrpop_mod, ParseError};

lalrpop_mod!(
    #[allow(clippy::all, dead_code, unused_imports, unused_mut)]
    writ
);

use super::error;
use super::lexer::{Lexer, Token};
use super::resource_block::Production;
use super::rules::*;
use super::sources::{Source, SourceInfo};
use super::terms::*;

#[derive(Clone, Debug, PartialEq)]
pub enum Line {
    Rule(Rule),
    RuleType(Rule),
    Query(Term),
    ResourceBlock {
        keyword: Option<Term>,
        resource: Term,
        productions: Vec<Production>,
    },
}

/// An argument to a call that accepts keyword arguments.
pub enum Arg {
    Positional(Term),
    Keyword(usize, Symbol, Term),
}

type Fallible<T> = Result<T, ParseError<usize, Token, error::ParseError>>;

fn fail<T>(error: error::ParseError) -> Fallible<T> {
    Err(ParseError::User { error })
}

fn is_logical(term: &Term) -> bool {
    use Operator::*;
    matches!(
        term.value(),
        Value::Expression(Operation { operator, .. }) if matches!(
            operator,
            And | Or | Not | Unify | Assign | Isa | In | Cut | ForAll | Print | Debug
                | Eq | Neq | Lt | Leq | Gt | Geq
        )
    )
}

/// Terms that cannot stand as a goal on their own.
fn is_value_only(term: &Term) -> bool {
    match term.value() {
        Value::Number(_) | Value::String(_) | Value::List(_) | Value::Dictionary(_) => true,
        Value::Expression(op) => op.operator.is_arithmetic(),
        _ => false,
    }
}

fn wrong_type<T>(term: Term, expected: &str) -> Fallible<T> {
    fail(error::ParseError::WrongValueType {
        loc: term.offset(),
        term,
        expected: expected.to_owned(),
    })
}

fn operation(op: Operator, args: TermList) -> Value {
    Value::Expression(Operation::new(op, args))
}

/// A term spanning from the start of `first` to `right`.
fn spanning(source: &Arc<Source>, first: &Term, right: usize, value: Value) -> Term {
    Term::new_from_parser(source.clone(), first.offset(), right, value)
}

fn end_of(term: &Term) -> usize {
    term.span().map_or(0, |(_, right)| right)
}

fn value(term: Term) -> Fallible<Term> {
    if is_logical(&term) {
        return wrong_type(term, "value");
    }
    Ok(term)
}

fn goal(term: Term) -> Fallible<Term> {
    if is_value_only(&term) {
        return wrong_type(term, "logical expression");
    }
    Ok(term)
}

fn dot(source: &Arc<Source>, object: Term, field: Term, right: usize) -> Term {
    let lookup = operation(Operator::Dot, vec![object.clone(), field]);
    spanning(source, &object, right, lookup)
}

/// Arithmetic, comparison and membership operators take values on both sides.
fn binary(source: &Arc<Source>, op: Operator, left: Term, right: Term) -> Fallible<Term> {
    let left = value(left)?;
    let right = value(right)?;
    let end = end_of(&right);
    Ok(spanning(source, &left, end, operation(op, vec![left.clone(), right])))
}

fn negation(source: &Arc<Source>, left: usize, right: usize, negated: Term) -> Fallible<Term> {
    let negated = goal(negated)?;
    Ok(Term::new_from_parser(
        source.clone(),
        left,
        right,
        operation(Operator::Not, vec![negated]),
    ))
}

/// `and` and `or` chains, flattened into one operation.
fn connective(source: &Arc<Source>, op: Operator, first: Term, rest: TermList) -> Fallible<Term> {
    let mut args = vec![goal(first)?];
    for term in rest {
        args.push(goal(term)?);
    }
    let end = args.last().map_or(0, end_of);
    let first = args[0].clone();
    Ok(spanning(source, &first, end, operation(op, args)))
}

fn list((mut items, rest): (TermList, Option<Term>)) -> Value {
    items.extend(rest);
    Value::List(items)
}

fn dictionary(entries: Vec<(usize, Symbol, Term)>) -> Fallible<Dictionary> {
    let mut fields = BTreeMap::new();
    for (loc, key, value) in entries {
        if fields.contains_key(&key) {
            return fail(error::ParseError::DuplicateKey { key: key.0, loc });
        }
        fields.insert(key, value);
    }
    Ok(Dictionary { fields })
}

/// Positional arguments first, then keyword arguments.
fn call(name: Symbol, parsed: Vec<Arg>) -> Fallible<Call> {
    let mut args = vec![];
    let mut kwargs: Option<BTreeMap<Symbol, Term>> = None;
    for arg in parsed {
        match arg {
            Arg::Positional(term) if kwargs.is_some() => {
                return fail(error::ParseError::UnrecognizedToken {
                    token: term.to_string(),
                    expected: vec!["keyword argument".to_owned()],
                    loc: term.offset(),
                })
            }
            Arg::Positional(term) => args.push(term),
            Arg::Keyword(loc, key, value) => {
                let kwargs = kwargs.get_or_insert_with(BTreeMap::new);
                if kwargs.insert(key.clone(), value).is_some() {
                    return fail(error::ParseError::DuplicateKey { key: key.0, loc });
                }
            }
        }
    }
    Ok(Call { name, args, kwargs })
}

fn specialized(parameter: Term, specializer: Term) -> Fallible<Parameter> {
    if !matches!(parameter.value(), Value::Variable(_)) {
        return wrong_type(parameter, "variable before a specializer");
    }
    Ok(Parameter {
        parameter,
        specializer: Some(specializer),
    })
}

/// The span triple is the start of the rule, the end of its head and the end of
/// the rule. A rule without a body gets an empty `and` over its head.
fn rule(
    source: &Arc<Source>,
    (left, head, right): (usize, usize, usize),
    name: Symbol,
    params: Vec<Parameter>,
    body: Option<Term>,
) -> Rule {
    let body = match body {
        Some(body) => match body.value() {
            Value::Expression(Operation {
                operator: Operator::And,
                ..
            }) => body,
            _ => body.clone_with_value(operation(Operator::And, vec![body.clone()])),
        },
        None => Term::new_from_parser(
            source.clone(),
            left,
            head,
            operation(Operator::And, vec![]),
        ),
    };
    Rule::new_from_parser(
        SourceInfo::parser(source.clone(), left, right),
        name,
        params,
        body,
    )
}

fn to_parse_error(e: ParseError<usize, Token, error::ParseError>) -> error::ParseError {
    match e {
        ParseError::InvalidToken { location: loc } => error::ParseError::InvalidToken { loc },
        ParseError::UnrecognizedEOF { location: loc, .. } => {
            error::ParseError::UnrecognizedEOF { loc }
        }
        ParseError::UnrecognizedToken {
            token: (loc, t, _),
            expected,
        } => match t {
            Token::Debug
            | Token::Cut
            | Token::In
            | Token::New
            | Token::Print
            | Token::ForAll
            | Token::Type => error::ParseError::ReservedWord {
                token: t.to_string(),
                loc,
            },
            _ => error::ParseError::UnrecognizedToken {
                token: t.to_string(),
                expected,
                loc,
            },
        },
        ParseError::ExtraToken { token: (loc, t, _) } => error::ParseError::ExtraToken {
            token: t.to_string(),
            loc,
        },
        ParseError::User { error } => error,
    }
}

pub fn parse_lines(source: Arc<Source>) -> Result<Vec<Line>, error::ParseError> {
    writ::LinesParser::new()
        .parse(&source, Lexer::new(&source.src))
        .map_err(to_parse_error)
}

/// A single query, e.g. the text passed to `Engine::new_query`. A
/// trailing semicolon is allowed.
pub fn parse_query(source: Arc<Source>) -> Result<Term, error::ParseError> {
    writ::QueryParser::new()
        .parse(&source, Lexer::new(&source.src))
        .map_err(to_parse_error)
}

#[cfg(test)]
pub fn parse_rules(source: Arc<Source>) -> Result<Vec<Rule>, error::ParseError> {
    writ::RulesParser::new()
        .parse(&source, Lexer::new(&source.src))
        .map_err(to_parse_error)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::ParseError::*;
    use crate::formatting::ToPolicy;

    #[track_caller]
    fn parse_term(src: &str) -> Term {
        let source = Arc::new(Source::new(src));
        writ::TermParser::new()
            .parse(&source, Lexer::new(&source.src))
            .map_err(to_parse_error)
            .unwrap()
    }

    #[track_caller]
    fn parse_term_error(src: &str) -> error::ParseError {
        super::parse_query(Arc::new(Source::new(src))).unwrap_err()
    }

    #[track_caller]
    fn parse_rule(src: &str) -> Rule {
        super::parse_rules(Arc::new(Source::new(src)))
            .unwrap()
            .pop()
            .unwrap()
    }

    #[track_caller]
    fn parse_lines(src: &str) -> Vec<Line> {
        super::parse_lines(Arc::new(Source::new(src))).unwrap()
    }

    #[test]
    fn test_literals_and_lookups() {
        assert_eq!(parse_term("a.b"), term!(op!(Dot, var!("a"), str!("b"))));
        assert_eq!(parse_term("-12"), term!(-12));
        assert_eq!(parse_term("+1.5"), term!(1.5));
        assert_eq!(parse_term("[x, \"y\", true]"), term!([sym!("x"), "y", true]));
        assert_eq!(
            parse_term(r#"foo.a(b)"#),
            term!(op!(Dot, var!("foo"), term!(call!("a", [sym!("b")]))))
        );
        assert_eq!(
            parse_term(r#"x.("odd-key")"#),
            term!(op!(Dot, var!("x"), str!("odd-key")))
        );
        let int = parse_term("  123");
        assert_eq!(int.span(), Some((2, 5)));
        let lookup = parse_term("a.b.c(1) + 2");
        assert_eq!(lookup.span(), Some((0, 12)));

        // A bare number is a term, but not a query.
        assert!(matches!(parse_term_error("-12"), WrongValueType { .. }));
    }

    #[test]
    fn test_precedence() {
        let t = parse_term("a = 1 + 2 * 3 and b or not c");
        assert_eq!(t.to_policy(), "a = 1 + 2 * 3 and b or not c");
        let sum = term!(op!(Add, term!(1), term!(op!(Mul, term!(2), term!(3)))));
        let Value::Expression(or) = t.value() else { panic!() };
        assert_eq!(or.operator, Operator::Or);
        let Value::Expression(and) = or.args[0].value() else { panic!() };
        assert_eq!(and.args[0], term!(op!(Unify, var!("a"), sum)));

        assert_eq!(
            parse_term("x in y.tags"),
            term!(op!(In, var!("x"), term!(op!(Dot, var!("y"), str!("tags")))))
        );
        assert_eq!(parse_term("7 % 2 = 1").to_policy(), "7 rem 2 = 1");
    }

    #[test]
    fn test_rules() {
        assert_eq!(
            parse_rule("f(x) if g(x);"),
            rule!("f", [sym!("x")] => call!("g", [sym!("x")]))
        );
        assert_eq!(parse_rule("f(x);"), rule!("f", [sym!("x")]));
        assert_eq!(parse_rule("f(x: 1);"), rule!("f", ["x"; 1]));
        assert_eq!(
            parse_rule("f(x: Foo, y: {a: 1});"),
            rule!("f", ["x"; instance!("Foo"), "y"; btreemap! {sym!("a") => term!(1)}])
        );
        let rule = parse_rule("f(x: Foo{id: 1}) if x.a = 2 and cut;");
        assert_eq!(rule.to_string(), "f(x: Foo{id: 1}) if x.a = 2 and cut;");
    }

    #[test]
    fn test_rule_heads_take_expressions() {
        let rule = parse_rule("f(a + 1);");
        assert_eq!(
            rule.params[0].parameter,
            term!(op!(Add, var!("a"), term!(1)))
        );
        let rule = parse_rule("fib(n, a + b) if n > 0;");
        assert_eq!(rule.to_string(), "fib(n, a + b) if n > 0;");

        let err = super::parse_rules(Arc::new(Source::new("f(a + 1: Foo);"))).unwrap_err();
        assert!(matches!(err, WrongValueType { .. }));
        let err = super::parse_rules(Arc::new(Source::new("f(x = 1);"))).unwrap_err();
        assert!(matches!(err, WrongValueType { .. }));
    }

    #[test]
    fn test_rule_types() {
        let lines = parse_lines("type f(x: Foo, y: String);\nf(x: Foo, \"a\");");
        assert_eq!(
            lines[0],
            Line::RuleType(rule!("f", ["x"; instance!("Foo"), "y"; instance!("String")]))
        );
        assert!(matches!(lines[1], Line::Rule(_)));

        let lines = parse_lines("type f(x) if x.y = 1;");
        let Line::RuleType(rule_type) = &lines[0] else {
            panic!("expected a rule type")
        };
        assert!(!rule_type.is_fact());

        let err = super::parse_lines(Arc::new(Source::new("f(type);"))).unwrap_err();
        assert!(matches!(err, ReservedWord { .. }));
    }

    #[test]
    fn test_lines() {
        let lines = parse_lines("f(1); ?= f(1);\n# comment\ng(2);");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], Line::Query(term!(call!("f", [1]))));

        let lines = parse_lines(
            r#"resource Repo {
                 roles = ["reader", "writer"];
                 relations = {parent: Org};
                 "reader" if "writer";
                 "reader" if "member" on "parent";
               }"#,
        );
        let Line::ResourceBlock { keyword, resource, productions } = &lines[0] else {
            panic!("expected a resource block")
        };
        assert_eq!(keyword, &Some(var!("resource")));
        assert_eq!(resource, &var!("Repo"));
        assert_eq!(productions.len(), 4);
        assert_eq!(
            productions[3],
            Production::ShorthandRule(
                str!("reader"),
                (str!("member"), Some((var!("on"), str!("parent"))))
            )
        );
    }

    #[test]
    fn test_new_and_kwargs() {
        let rule = parse_rule("a(x) if x = new Foo(1, bar: 3);");
        assert_eq!(rule.to_string(), "a(x) if x = new Foo(1, bar: 3);");
        let rule = parse_rule("a(x) if x.m(1, k: 2);");
        assert_eq!(rule.to_string(), "a(x) if x.m(1, k: 2);");

        let err = super::parse_rules(Arc::new(Source::new("a(x) if f(x: 1);"))).unwrap_err();
        assert!(matches!(err, UnrecognizedToken { .. }));
        let err =
            super::parse_rules(Arc::new(Source::new("a(x) if x = new Foo(b: 1, 2);"))).unwrap_err();
        assert!(matches!(err, UnrecognizedToken { .. }));
    }

    #[test]
    fn test_rest_vars() {
        let q = "[1, 2, *x] = [*rest]";
        assert_eq!(parse_term(q).to_policy(), q);
        assert!(matches!(parse_term_error("[*rest, 3] = x"), UnrecognizedToken { .. }));
        assert!(matches!(parse_term_error("[1, *3] = x"), UnrecognizedToken { .. }));
    }

    #[test]
    fn test_wrong_value_types() {
        for bad in &[
            "x in [1, 2] < 2",
            "{x: 1 < 2} = y",
            "not 1",
            "1 and 2",
            "x = (1 or 2)",
            "x = y = z",
            "x = (not x)",
            "foo.bar(x or y)",
        ] {
            assert!(
                matches!(parse_term_error(bad), WrongValueType { .. }),
                "{} should not parse",
                bad
            );
        }
    }

    #[test]
    fn test_errors() {
        assert!(matches!(parse_term_error("{a: 1, a: 2} = x"), DuplicateKey { .. }));
        assert!(matches!(parse_term_error("f(x"), UnrecognizedEOF { .. }));
        assert!(matches!(parse_term_error("f(x) g"), UnrecognizedToken { .. }));
        assert!(matches!(parse_term_error("f(x);;"), UnrecognizedToken { .. }));
        let err = super::parse_lines(Arc::new(Source::new("cut(x);"))).unwrap_err();
        assert!(matches!(err, ReservedWord { .. }));
        let err = super::parse_lines(Arc::new(Source::new("f(x) if x = \"\\q\";"))).unwrap_err();
        assert!(matches!(err, InvalidEscape { .. }));
    }
}
