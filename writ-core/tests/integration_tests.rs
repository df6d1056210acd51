mod mock_externals;

use indoc::indoc;
use permute::permute;
use pretty_assertions::assert_eq;

use std::cell::RefCell;
use std::collections::HashMap;

use writ_core::{
    error::*,
    events::*,
    formatting::ToPolicy,
    kb::{FieldType, RelationKind},
    messages::*,
    op,
    sources::Source,
    sym, term,
    terms::*,
    traces::*,
    value, Engine, Query, QueryOptions,
};

type QueryResults = Vec<(HashMap<Symbol, Value>, Option<TraceResult>)>;
use mock_externals::MockExternal;

fn no_results(_: Term, _: Symbol, _: Option<Vec<Term>>) -> Option<Term> {
    None
}

fn print_messages(msg: &Message) {
    eprintln!("[{:?}] {}", msg.kind, msg.msg);
}

fn no_externals(_: u64, _: Term) {}

fn no_debug(_: &str) -> String {
    "".to_string()
}

fn no_isa(_: Term, _: Symbol) -> bool {
    true
}

fn no_is_subclass(_: Symbol, _: Symbol) -> bool {
    false
}

fn try_query_results<F, G, H, I, J, K>(
    mut query: Query,
    mut external_call_handler: F,
    mut make_external_handler: H,
    mut external_isa_handler: I,
    mut external_is_subclass_handler: J,
    mut debug_handler: G,
    mut message_handler: K,
) -> PolicyResult<QueryResults>
where
    F: FnMut(Term, Symbol, Option<Vec<Term>>) -> Option<Term>,
    G: FnMut(&str) -> String,
    H: FnMut(u64, Term),
    I: FnMut(Term, Symbol) -> bool,
    J: FnMut(Symbol, Symbol) -> bool,
    K: FnMut(&Message),
{
    let mut results = vec![];
    loop {
        let event = query.next_event();
        while let Some(msg) = query.next_message() {
            message_handler(&msg)
        }
        match event? {
            QueryEvent::Done { .. } => break,
            QueryEvent::Result { bindings, trace } => {
                results.push((
                    bindings
                        .into_iter()
                        .map(|(k, v)| (k, v.value().clone()))
                        .collect(),
                    trace,
                ));
            }
            QueryEvent::ExternalCall {
                call_id,
                instance,
                attribute,
                args,
                ..
            } => {
                query.call_result(call_id, external_call_handler(instance, attribute, args))?;
            }
            QueryEvent::MakeExternal {
                instance_id,
                constructor,
            } => make_external_handler(instance_id, constructor),
            QueryEvent::ExternalIsa {
                call_id,
                instance,
                class_tag,
            } => query.question_result(call_id, external_isa_handler(instance, class_tag))?,
            QueryEvent::ExternalIsSubclass {
                call_id,
                left_class_tag,
                right_class_tag,
            } => query.question_result(
                call_id,
                external_is_subclass_handler(left_class_tag, right_class_tag),
            )?,
            QueryEvent::ExternalIsaWithPath { call_id, .. } => {
                query.question_result(call_id, false)?
            }
            QueryEvent::ExternalOp { call_id, .. } => query.question_result(call_id, false)?,
            QueryEvent::NextExternal { call_id, .. } => query.call_result(call_id, None)?,
            QueryEvent::Debug { ref message } => {
                query.debug_command(&debug_handler(message))?;
            }
            QueryEvent::None => {}
        }
    }
    Ok(results)
}

macro_rules! query_results {
    ($query:expr) => {
        try_query_results(
            $query,
            no_results,
            no_externals,
            no_isa,
            no_is_subclass,
            no_debug,
            print_messages,
        )
        .unwrap()
    };
    ($query:expr, @msgs $message_handler:expr) => {
        try_query_results(
            $query,
            no_results,
            no_externals,
            no_isa,
            no_is_subclass,
            no_debug,
            $message_handler,
        )
        .unwrap()
    };
    ($query:expr, $external_call_handler:expr) => {
        try_query_results(
            $query,
            $external_call_handler,
            no_externals,
            no_isa,
            no_is_subclass,
            no_debug,
            print_messages,
        )
        .unwrap()
    };
}

fn query_results_with_externals(query: Query, mock: MockExternal) -> PolicyResult<QueryResults> {
    let mock = RefCell::new(mock);
    try_query_results(
        query,
        |a, b, c| mock.borrow_mut().external_call(a, b, c, None),
        |a, b| mock.borrow_mut().make_external(a, b),
        |a, b| mock.borrow_mut().external_isa(a, b),
        |a, b| mock.borrow().is_subclass(&a, &b),
        no_debug,
        print_messages,
    )
}

#[track_caller]
#[must_use = "test results need to be asserted"]
fn qeval(engine: &Engine, query_str: &str) -> bool {
    let query = engine.new_query(query_str, QueryOptions::default()).unwrap();
    !query_results!(query).is_empty()
}

#[track_caller]
#[must_use = "test results need to be asserted"]
fn qnull(engine: &Engine, query_str: &str) -> bool {
    let query = engine.new_query(query_str, QueryOptions::default()).unwrap();
    query_results!(query).is_empty()
}

#[track_caller]
#[must_use = "test results need to be asserted"]
fn qext(engine: &Engine, query_str: &str, external_results: Vec<Value>) -> QueryResults {
    let mut external_results: Vec<Term> = external_results
        .into_iter()
        .map(Term::from)
        .rev()
        .collect();
    let query = engine.new_query(query_str, QueryOptions::default()).unwrap();
    query_results!(query, |_, _, _| external_results.pop())
}

#[track_caller]
#[must_use = "test results need to be asserted"]
fn qvar(engine: &Engine, query_str: &str, var: &str) -> Vec<Value> {
    let query = engine
        .new_query(query_str, QueryOptions::default())
        .expect("Expected result for var, got None");
    query_results!(query)
        .iter()
        .map(|bindings| bindings.0.get(&sym!(var)).unwrap().clone())
        .collect()
}

#[track_caller]
#[must_use = "test results need to be asserted"]
fn qvars(engine: &Engine, query_str: &str, vars: &[&str]) -> Vec<Vec<Value>> {
    let query = engine.new_query(query_str, QueryOptions::default()).unwrap();

    query_results!(query)
        .iter()
        .map(|bindings| {
            vars.iter()
                .map(|&var| bindings.0.get(&sym!(var)).unwrap().clone())
                .collect()
        })
        .collect()
}

#[track_caller]
fn qerr(engine: &Engine, query_str: &str) -> PolicyError {
    let query = engine.new_query(query_str, QueryOptions::default()).unwrap();
    try_query_results(
        query,
        no_results,
        no_externals,
        no_isa,
        no_is_subclass,
        no_debug,
        print_messages,
    )
    .unwrap_err()
}

/// Run `query_str` with `var` bound as a partial, returning the residual
/// expression of `var` in each result.
#[track_caller]
fn qpartial(engine: &Engine, query_str: &str, var: &str) -> Vec<Term> {
    let options = QueryOptions {
        accept_expression: true,
        ..QueryOptions::default()
    };
    let mut query = engine.new_query(query_str, options).unwrap();
    query.bind(sym!(var), term!(op!(And))).unwrap();
    query_results!(query)
        .into_iter()
        .map(|(bindings, _)| Term::from(bindings[&sym!(var)].clone()))
        .collect()
}

/// Adapted from <http://web.cse.ohio-state.edu/~stiff.4/cse3521/prolog-resolution.html>
#[test]
fn test_functions() {
    let engine = Engine::new();
    engine
        .load_str("f(1); f(2); g(1); g(2); h(2); k(x) if f(x) and h(x) and g(x);")
        .unwrap();

    assert!(qnull(&engine, "k(1)"));
    assert!(qeval(&engine, "k(2)"));
    assert!(qnull(&engine, "k(3)"));
    assert_eq!(qvar(&engine, "k(a)", "a"), vec![value!(2)]);
}

/// Adapted from <http://web.cse.ohio-state.edu/~stiff.4/cse3521/prolog-resolution.html>
#[test]
fn test_jealous() {
    let engine = Engine::new();
    engine
        .load_str(
            r#"loves("vincent", "mia");
               loves("marcellus", "mia");
               jealous(a, b) if loves(a, c) and loves(b, c);"#,
        )
        .unwrap();

    let query = engine
        .new_query("jealous(who, of)", QueryOptions::default())
        .unwrap();
    let results = query_results!(query);
    let jealous = |who: &str, of: &str| {
        assert!(
            &results.iter().any(|(r, _)| r
                == &HashMap::from_iter(vec![(sym!("who"), value!(who)), (sym!("of"), value!(of))])),
            "{} is not jealous of {} (but should be)",
            who,
            of
        );
    };
    assert_eq!(results.len(), 4);
    jealous("vincent", "vincent");
    jealous("vincent", "marcellus");
    jealous("marcellus", "vincent");
    jealous("marcellus", "marcellus");
}

#[test]
fn test_trace() {
    let engine = Engine::new();
    engine
        .load_str("f(x) if x = 1 and x = 1; f(y) if y = 1;")
        .unwrap();
    let options = QueryOptions {
        trace: true,
        ..QueryOptions::default()
    };
    let query = engine.new_query("f(1)", options).unwrap();
    let results = query_results!(query);
    let trace = results[0].1.as_ref().unwrap();
    let expected = r#"f(1) [
  f(x) if x = 1 and x = 1; [
      x = 1 []
      x = 1 []
  ]
]
"#;
    assert_eq!(trace.formatted, expected);
    let trace = results[1].1.as_ref().unwrap();
    let expected = r#"f(1) [
  f(y) if y = 1; [
      y = 1 []
  ]
]
"#;
    assert_eq!(trace.formatted, expected);
}

#[test]
fn test_nested_rule() {
    let engine = Engine::new();
    engine
        .load_str("f(x) if g(x); g(x) if h(x); h(2); g(x) if j(x); j(4);")
        .unwrap();

    assert!(qeval(&engine, "f(2)"));
    assert!(qnull(&engine, "f(3)"));
    assert!(qeval(&engine, "f(4)"));
    assert!(qeval(&engine, "j(4)"));
}

/// A functions permutation that is known to fail.
#[test]
fn test_bad_functions() {
    let engine = Engine::new();
    engine
        .load_str("f(2); f(1); g(1); g(2); h(2); k(x) if f(x) and h(x) and g(x);")
        .unwrap();
    assert_eq!(qvar(&engine, "k(a)", "a"), vec![value!(2)]);
}

/// The order rules are written in must not change which answers come back.
#[test]
fn test_functions_permute() {
    let rules = vec!["f(1)", "f(2)", "g(1)", "g(2)", "h(2)", "k(x) if f(x) and h(x) and g(x)"];
    for permutation in permute(rules) {
        let engine = Engine::new();
        engine
            .load_str(&format!("{};", permutation.join(";")))
            .unwrap();
        assert!(qnull(&engine, "k(1)"));
        assert!(qeval(&engine, "k(2)"));
        assert_eq!(qvar(&engine, "k(a)", "a"), vec![value!(2)]);
    }
}

#[test]
fn test_unify_is_symmetric() {
    let engine = Engine::new();
    let terms = vec![
        "1",
        "1.0",
        "\"a\"",
        "true",
        "[1, 2]",
        "[1, 2, 3]",
        "{a: 1}",
        "{a: 1, b: 2}",
        "[]",
    ];
    for a in &terms {
        for b in &terms {
            let forward = qeval(&engine, &format!("{} = {}", a, b));
            let backward = qeval(&engine, &format!("{} = {}", b, a));
            assert_eq!(forward, backward, "{} = {}", a, b);
        }
    }
    assert!(qeval(&engine, "1 = 1.0"));
    assert!(qnull(&engine, "[1, 2] = [1, 2, 3]"));
    assert!(qnull(&engine, "{a: 1} = {a: 1, b: 2}"));
}

#[test]
fn test_unify_binds_the_same_both_ways() {
    let engine = Engine::new();
    assert_eq!(
        qvars(&engine, "[x, 2] = [1, y]", &["x", "y"]),
        vec![vec![value!(1), value!(2)]]
    );
    assert_eq!(
        qvars(&engine, "[1, y] = [x, 2]", &["x", "y"]),
        vec![vec![value!(1), value!(2)]]
    );
}

#[test]
fn test_exhausted_query_restores_bindings() {
    let engine = Engine::new();
    engine
        .load_str(indoc! {r#"
            f(1);
            f(2);
            f(x) if x = 3;
            g(x) if f(x) and x > 1;
        "#})
        .unwrap();
    let mut query = engine
        .new_query("y = 0 and g(x) and z = [x, y]", QueryOptions::default())
        .unwrap();
    let before = query.bindings();

    let mut answers = vec![];
    loop {
        match query.next_event().unwrap() {
            QueryEvent::Result { bindings, .. } => {
                // Rule variables are renamed into temporaries while a rule runs.
                assert!(query.bindings().keys().any(Symbol::is_temporary_var));
                answers.push(bindings[&sym!("x")].clone());
            }
            QueryEvent::Done { .. } => break,
            QueryEvent::None => {}
            event => panic!("unexpected event: {:?}", event),
        }
    }
    assert_eq!(answers, vec![term!(2), term!(3)]);
    assert_eq!(query.bindings(), before);
}

#[test]
fn test_rest_variables() {
    let engine = Engine::new();
    engine
        .load_str("head([x, *_], x); tail([_, *rest], rest);")
        .unwrap();
    assert_eq!(qvar(&engine, "head([1, 2, 3], h)", "h"), vec![value!(1)]);
    assert_eq!(qvar(&engine, "tail([1, 2, 3], t)", "t"), vec![value!([2, 3])]);
    assert!(qnull(&engine, "tail([], _)"));
    assert_eq!(qvar(&engine, "[1, 2, *rest] = [1, 2, 3, 4]", "rest"), vec![value!([3, 4])]);
}

#[test]
fn test_dictionaries_and_lookups() {
    let engine = Engine::new();
    assert_eq!(qvar(&engine, "x = {a: 1, b: 2}.b", "x"), vec![value!(2)]);
    assert!(qnull(&engine, "x = {a: 1}.c"));
    assert!(qeval(&engine, "{a: 1, b: 2} matches {a: 1}"));
    assert!(qnull(&engine, "{a: 1} matches {a: 1, b: 2}"));
}

#[test]
fn test_or_and_not() {
    let engine = Engine::new();
    engine.load_str("f(1); f(2);").unwrap();
    assert_eq!(
        qvar(&engine, "x = 1 or x = 2 or x = 3", "x"),
        vec![value!(1), value!(2), value!(3)]
    );
    assert!(qeval(&engine, "not f(3)"));
    assert!(qnull(&engine, "not f(1)"));
    // Bindings made under `not` don't escape it.
    assert!(qeval(&engine, "not (x = 1 and x = 2) and x = 3"));
}

#[test]
fn test_in_and_forall() {
    let engine = Engine::new();
    assert_eq!(
        qvar(&engine, "x in [1, 2, 3]", "x"),
        vec![value!(1), value!(2), value!(3)]
    );
    assert!(qnull(&engine, "4 in [1, 2, 3]"));
    assert!(qnull(&engine, "_ in []"));
    assert!(qeval(&engine, "forall(x in [1, 2, 3], x > 0)"));
    assert!(qnull(&engine, "forall(x in [1, 2, 3], x > 1)"));
    assert!(qeval(&engine, "forall(x in [], x > 1)"));
}

#[test]
fn test_arithmetic() {
    let engine = Engine::new();
    assert_eq!(qvar(&engine, "x = 1 + 2 * 3", "x"), vec![value!(7)]);
    assert_eq!(qvar(&engine, "x = 7 / 2", "x"), vec![value!(3.5)]);
    assert_eq!(qvar(&engine, "x = 1 + 0.5", "x"), vec![value!(1.5)]);
    assert_eq!(qvar(&engine, "x = -7 mod 3", "x"), vec![value!(2)]);
    assert_eq!(qvar(&engine, "x = -7 rem 3", "x"), vec![value!(-1)]);
    assert!(qeval(&engine, "1 < 2 and 2 <= 2 and 3 > 2.5 and 1 != 2"));

    let err = qerr(&engine, "x = 1 / 0");
    assert!(
        matches!(err.kind(), ErrorKind::Runtime(RuntimeError::ArithmeticError { .. })),
        "{}",
        err
    );
    let err = qerr(&engine, "x = 9223372036854775807 + 1");
    assert!(matches!(err.kind(), ErrorKind::Runtime(RuntimeError::ArithmeticError { .. })));
    let err = qerr(&engine, "x = \"a\" + 1");
    assert!(matches!(err.kind(), ErrorKind::Runtime(RuntimeError::TypeError { .. })));
}

#[test]
fn test_assignment() {
    let engine = Engine::new();
    assert_eq!(qvar(&engine, "x := 1", "x"), vec![value!(1)]);
    let err = qerr(&engine, "x = 1 and x := 2");
    assert!(
        err.to_string().contains("Can only assign to unbound variables"),
        "{}",
        err
    );
}

#[test]
fn test_cut() {
    let engine = Engine::new();
    engine.load_str("g(1); g(2); h(x) if g(x) and cut;").unwrap();
    assert_eq!(qvar(&engine, "h(v)", "v"), vec![value!(1)]);

    // Cut commits its own rule, not the caller.
    engine.clear_rules();
    engine
        .load_str(indoc! {r#"
            g(1); g(2);
            h(x) if g(x) and cut;
            h(3);
            k(x, y) if h(x) and g(y);
        "#})
        .unwrap();
    assert_eq!(qvar(&engine, "h(v)", "v"), vec![value!(1)]);
    assert_eq!(
        qvars(&engine, "k(x, y)", &["x", "y"]),
        vec![vec![value!(1), value!(1)], vec![value!(1), value!(2)]]
    );
}

#[test]
fn test_specializers_on_builtins() {
    let engine = Engine::new();
    engine
        .load_str(indoc! {r#"
            kind(_: Integer, "integer");
            kind(_: Float, "float");
            kind(_: Number, "number");
            kind(_: String, "string");
            kind(_: List, "list");
            kind(_: Dictionary, "dictionary");
        "#})
        .unwrap();
    assert_eq!(
        qvar(&engine, "kind(1, k)", "k"),
        vec![value!("integer"), value!("number")]
    );
    assert_eq!(
        qvar(&engine, "kind(1.5, k)", "k"),
        vec![value!("float"), value!("number")]
    );
    assert_eq!(qvar(&engine, "kind(\"s\", k)", "k"), vec![value!("string")]);
    assert_eq!(qvar(&engine, "kind([], k)", "k"), vec![value!("list")]);
    assert_eq!(qvar(&engine, "kind({}, k)", "k"), vec![value!("dictionary")]);
}

#[test]
fn test_more_specific_rules_first() {
    let engine = Engine::new();
    engine.register_class(sym!("Parent"), HashMap::new());
    engine.register_class(sym!("Child"), HashMap::new());
    engine
        .load_str(indoc! {r#"
            f(_: Parent, "parent");
            f(_: Child, "child");
        "#})
        .unwrap();

    let mock = MockExternal::new().with_subclass("Child", "Parent");
    let query = engine
        .new_query("f(new Child(), x)", QueryOptions::default())
        .unwrap();
    let results = query_results_with_externals(query, mock).unwrap();
    let found: Vec<Value> = results
        .into_iter()
        .map(|(bindings, _)| bindings[&sym!("x")].clone())
        .collect();
    assert_eq!(found, vec![value!("child"), value!("parent")]);
}

#[test]
fn test_mro_answers_subclass_questions() {
    let engine = Engine::new();
    engine.register_class(sym!("Parent"), HashMap::new());
    engine.register_class(sym!("Child"), HashMap::new());
    engine.register_mro(sym!("Child"), vec![sym!("Child"), sym!("Parent")]);
    engine.register_mro(sym!("Parent"), vec![sym!("Parent")]);
    engine
        .register_constant(sym!("Child"), term!(value!("Child")))
        .unwrap();
    engine
        .load_str(r#"f(_: Parent, "parent"); f(_: Child, "child");"#)
        .unwrap();

    // The host is never asked: any isa question would panic here.
    let query = engine
        .new_query("f(new Child(), x)", QueryOptions::default())
        .unwrap();
    let results = try_query_results(
        query,
        no_results,
        no_externals,
        |_, _| panic!("unexpected isa"),
        |_, _| panic!("unexpected is_subclass"),
        no_debug,
        print_messages,
    )
    .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0[&sym!("x")], value!("child"));
}

#[test]
fn test_field_access_via_host() {
    let engine = Engine::new();
    engine.register_class(sym!("Expense"), HashMap::new());
    engine
        .load_str(r#"allow(u, "view", e: Expense) if u = e.owner;"#)
        .unwrap();

    let check = |actor: &str| {
        let query = engine
            .new_query(
                &format!(r#"allow("{}", "view", new Expense(owner: "alice"))"#, actor),
                QueryOptions::default(),
            )
            .unwrap();
        !query_results_with_externals(query, MockExternal::new())
            .unwrap()
            .is_empty()
    };
    assert!(check("alice"));
    assert!(!check("bob"));
}

#[test]
fn test_external_results_are_unified() {
    let engine = Engine::new();
    engine
        .register_constant(
            sym!("config"),
            term!(ExternalInstance {
                instance_id: 1,
                constructor: None,
                repr: None,
                class_repr: None,
            }),
        )
        .unwrap();
    let results = qext(&engine, "x = config.name", vec![value!("alice")]);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0[&sym!("x")], value!("alice"));
    assert!(qext(&engine, "x = config.name", vec![]).is_empty());
}

#[test]
fn test_list_membership_from_host() {
    let engine = Engine::new();
    engine.register_class(sym!("Doc"), HashMap::new());
    engine
        .load_str(r#"allow(_, "tag", r: Doc) if t in r.tags and t = "public";"#)
        .unwrap();

    let check = |tags: &str| {
        let query = engine
            .new_query(
                &format!(r#"allow("u", "tag", new Doc(tags: {}))"#, tags),
                QueryOptions::default(),
            )
            .unwrap();
        !query_results_with_externals(query, MockExternal::new())
            .unwrap()
            .is_empty()
    };
    assert!(check(r#"["draft", "public"]"#));
    assert!(!check(r#"["draft"]"#));
}

#[test]
fn test_simple_allow() {
    let engine = Engine::new();
    engine.load_str(r#"allow("alice", "read", "doc1");"#).unwrap();
    assert!(qeval(&engine, r#"allow("alice", "read", "doc1")"#));
    assert!(qnull(&engine, r#"allow("bob", "read", "doc1")"#));
}

const ORG_BLOCK: &str = r#"
    allow(actor, action, resource) if has_permission(actor, action, resource);
    actor User {}
    resource Org {
        roles = ["owner", "member"];
        permissions = ["create_repo"];
        "create_repo" if "member";
        "member" if "owner";
    }
"#;

const ORG_HANDWRITTEN: &str = r#"
    allow(actor, action, resource) if has_permission(actor, action, resource);
    has_permission(actor, "create_repo", org: Org) if has_role(actor, "member", org);
    has_role(actor, "member", org: Org) if has_role(actor, "owner", org);
"#;

const ORG_ROLES: &str = r#"
    has_role(user: User, "owner", org: Org) if user.name = "leina" and org.name = "osohq";
"#;

fn org_engine(policy: &str) -> Engine {
    let engine = Engine::new();
    engine.register_class(sym!("User"), HashMap::new());
    engine.register_class(sym!("Org"), HashMap::new());
    engine.load_str(&format!("{}\n{}", policy, ORG_ROLES)).unwrap();
    engine
}

fn create_repo_allowed(engine: &Engine, user: &str, org: &str) -> bool {
    let query = engine
        .new_query(
            &format!(
                r#"allow(new User(name: "{}"), "create_repo", new Org(name: "{}"))"#,
                user, org
            ),
            QueryOptions::default(),
        )
        .unwrap();
    !query_results_with_externals(query, MockExternal::new())
        .unwrap()
        .is_empty()
}

#[test]
fn test_hierarchy_role() {
    let engine = org_engine(ORG_BLOCK);
    assert!(create_repo_allowed(&engine, "leina", "osohq"));
    assert!(!create_repo_allowed(&engine, "leina", "apple"));
    assert!(!create_repo_allowed(&engine, "steve", "osohq"));
}

#[test]
fn test_resource_block_matches_handwritten_rules() {
    let block = org_engine(ORG_BLOCK);
    let handwritten = org_engine(ORG_HANDWRITTEN);
    for user in &["leina", "steve"] {
        for org in &["osohq", "apple"] {
            assert_eq!(
                create_repo_allowed(&block, user, org),
                create_repo_allowed(&handwritten, user, org),
                "{} on {}",
                user,
                org
            );
        }
    }
}

#[test]
fn test_resource_block_errors() {
    let engine = Engine::new();
    engine.register_class(sym!("Repo"), HashMap::new());
    let err = engine
        .load_str(r#"resource Repo { roles = ["reader"]; "writer" if "reader"; }"#)
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Validation(ValidationError::ResourceBlock { .. })));
    assert!(err.to_string().contains("Undeclared term \"writer\""), "{}", err);
}

#[test]
fn test_partial_round_trip() {
    let engine = Engine::new();
    engine.register_class(sym!("Repo"), HashMap::new());
    engine
        .load_str(r#"allow("alice", "read", r: Repo) if r.is_public = true;"#)
        .unwrap();

    let residuals = qpartial(&engine, r#"allow("alice", "read", r)"#, "r");
    assert_eq!(residuals.len(), 1);
    assert_eq!(
        residuals[0].to_policy(),
        "_this matches Repo and _this.is_public = true"
    );
    assert!(qpartial(&engine, r#"allow("bob", "read", r)"#, "r").is_empty());
}

#[test]
fn test_partial_comparison() {
    let engine = Engine::new();
    engine.load_str("f(x) if x.field = 42;").unwrap();
    let residuals = qpartial(&engine, "f(x)", "x");
    assert_eq!(residuals.len(), 1);
    assert_eq!(residuals[0].to_policy(), "_this.field = 42");
}

#[test]
fn test_partial_disjunction_gives_one_result_per_branch() {
    let engine = Engine::new();
    engine
        .load_str("f(x) if x.a = 1; f(x) if x.b = 2 or x.c = 3;")
        .unwrap();
    let residuals: Vec<String> = qpartial(&engine, "f(x)", "x")
        .iter()
        .map(ToPolicy::to_policy)
        .collect();
    assert_eq!(
        residuals,
        vec!["_this.a = 1", "_this.b = 2", "_this.c = 3"]
    );
}

#[test]
fn test_partial_without_accept_expression_is_an_error() {
    let engine = Engine::new();
    engine.load_str("f(x) if x.field = 42;").unwrap();
    let mut query = engine.new_query("f(x)", QueryOptions::default()).unwrap();
    query.bind(sym!("x"), term!(op!(And))).unwrap();
    let err = try_query_results(
        query,
        no_results,
        no_externals,
        no_isa,
        no_is_subclass,
        no_debug,
        print_messages,
    )
    .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Runtime(RuntimeError::UnhandledPartial { .. })));
}

#[test]
fn test_not_under_partial_is_unsupported() {
    let engine = Engine::new();
    engine.load_str("f(x) if not x.hidden = true;").unwrap();
    let options = QueryOptions {
        accept_expression: true,
        ..QueryOptions::default()
    };
    let mut query = engine.new_query("f(x)", options).unwrap();
    query.bind(sym!("x"), term!(op!(And))).unwrap();
    let err = query_results_err(query);
    assert!(matches!(err.kind(), ErrorKind::Runtime(RuntimeError::Unsupported { .. })));
}

fn query_results_err(query: Query) -> PolicyError {
    try_query_results(
        query,
        no_results,
        no_externals,
        no_isa,
        no_is_subclass,
        no_debug,
        print_messages,
    )
    .unwrap_err()
}

#[test]
fn test_data_filtering_plan() {
    let engine = Engine::new();
    engine.register_class(
        sym!("Repo"),
        maplit::hashmap! {
            sym!("is_public") => FieldType::Base { class_tag: "Boolean".to_owned() },
            sym!("org") => FieldType::Relation {
                kind: RelationKind::One,
                other_class_tag: "Org".to_owned(),
                my_field: "org_id".to_owned(),
                other_field: "id".to_owned(),
            },
        },
    );
    engine.register_class(sym!("Org"), HashMap::new());
    engine
        .load_str(indoc! {r#"
            allow("alice", "read", r: Repo) if r.is_public = true;
            allow("alice", "read", r: Repo) if r.org.name = "osohq";
        "#})
        .unwrap();

    let options = QueryOptions {
        accept_expression: true,
        ..QueryOptions::default()
    };
    let mut query = engine
        .new_query(r#"allow("alice", "read", r)"#, options)
        .unwrap();
    query.bind(sym!("r"), term!(op!(And))).unwrap();
    let mut results = vec![];
    for event in query {
        if let QueryEvent::Result { bindings, .. } = event.unwrap() {
            results.push(bindings);
        }
    }
    assert_eq!(results.len(), 2);

    let filter = engine.build_filter(&results, "r", "Repo").unwrap();
    assert_eq!(filter.root, "Repo");
    assert_eq!(filter.conditions.len(), 2);
    assert_eq!(filter.relations.len(), 1);
    let json = serde_json::to_value(&filter).unwrap();
    assert_eq!(json["root"], "Repo");

    // Nothing allowed: nothing matches.
    let empty = engine.build_filter(&[], "r", "Repo").unwrap();
    assert_eq!(empty.conditions.len(), 1);
}

#[test]
fn test_undefined_rules() {
    let engine = Engine::new();
    let err = qerr(&engine, "missing(1)");
    assert!(matches!(
        err.kind(),
        ErrorKind::Runtime(RuntimeError::QueryForUndefinedRule { .. })
    ));

    // Rules a policy may leave out just fail.
    assert!(qnull(&engine, "allow(1, 2, 3)"));
    assert!(qnull(&engine, "has_role(1, 2, 3)"));

    let options = QueryOptions {
        lenient: true,
        ..QueryOptions::default()
    };
    let query = engine.new_query("missing(1)", options).unwrap();
    assert!(query_results!(query).is_empty());
}

#[test]
fn test_application_errors() {
    let engine = Engine::new();
    engine
        .register_constant(
            sym!("thing"),
            term!(ExternalInstance {
                instance_id: 1,
                constructor: None,
                repr: None,
                class_repr: None,
            }),
        )
        .unwrap();
    engine.load_str("f(x) if x = thing.name; f(\"fallback\");").unwrap();

    let run = |strict: bool| {
        let options = QueryOptions {
            strict,
            ..QueryOptions::default()
        };
        let mut query = engine.new_query("f(x)", options).unwrap();
        let mut results = vec![];
        loop {
            match query.next_event()? {
                QueryEvent::Done { .. } => break,
                QueryEvent::ExternalCall { call_id, .. } => {
                    query.application_error(call_id, "boom".to_owned())?
                }
                QueryEvent::Result { bindings, .. } => results.push(bindings[&sym!("x")].clone()),
                e => panic!("unexpected event {:?}", e),
            }
        }
        Ok::<_, PolicyError>(results)
    };

    assert_eq!(run(false).unwrap(), vec![term!("fallback")]);
    let err = run(true).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Runtime(RuntimeError::Application { .. })));
    assert!(err.to_string().contains("boom"), "{}", err);
}

#[test]
fn test_print_and_messages() {
    let engine = Engine::new();
    let query = engine
        .new_query("print(\"hello\", 1)", QueryOptions::default())
        .unwrap();
    let mut messages = vec![];
    let results = query_results!(query, @msgs |m: &Message| messages.push(m.clone()));
    assert_eq!(results.len(), 1);
    assert_eq!(
        messages,
        vec![Message {
            kind: MessageKind::Print,
            msg: "\"hello\", 1".to_owned()
        }]
    );
}

#[test]
fn test_debug_event() {
    let engine = Engine::new();
    let query = engine
        .new_query("debug() and x = 1", QueryOptions::default())
        .unwrap();
    let mut stops = 0;
    let results = try_query_results(
        query,
        no_results,
        no_externals,
        no_isa,
        no_is_subclass,
        |_| {
            stops += 1;
            "continue".to_owned()
        },
        print_messages,
    )
    .unwrap();
    assert_eq!(stops, 1);
    assert_eq!(results[0].0[&sym!("x")], value!(1));
}

#[test]
fn test_inline_queries() {
    let engine = Engine::new();
    engine
        .load_str("f(1); ?= f(1); ?= not f(2);")
        .unwrap();
    let mut count = 0;
    while let Some(query) = engine.next_inline_query(QueryOptions::default()) {
        assert!(!query_results!(query).is_empty());
        count += 1;
    }
    assert_eq!(count, 2);
}

#[test]
fn test_load_errors_carry_location() {
    let engine = Engine::new();
    let err = engine
        .load(vec![Source::new_with_name("policy.writ", "f(x) if x = ;")])
        .unwrap_err();
    assert!(err.is_parse_error());
    assert_eq!(err.to_string().lines().count(), 1);
    assert!(err.to_string().contains("in file policy.writ"), "{}", err);
}

#[test]
fn test_loading_warns_about_singletons() {
    let engine = Engine::new();
    engine
        .load_str("allow(actor, _action, resource) if resource = 1;")
        .unwrap();
    let msg = engine.next_message().unwrap();
    assert_eq!(msg.kind, MessageKind::Warning);
    assert!(msg.msg.starts_with("Singleton variable actor"), "{}", msg.msg);
    assert!(engine.next_message().is_none());
}
