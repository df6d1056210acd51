use std::collections::HashSet;

use maplit::hashmap;
use writ::{Action, AuthorizationError, ToWrit, Writ, WritClass, WritError, WritValue};

mod common;

use common::WritTest;

#[derive(Clone, Debug, PartialEq)]
struct Expense {
    owner: String,
    amount: i64,
}

impl WritClass for Expense {}

#[derive(Clone, Debug, PartialEq)]
struct Counter {
    n: i64,
}

impl WritClass for Counter {}

impl Counter {
    fn new(n: i64) -> Self {
        Self { n }
    }

    fn zero() -> Self {
        Self { n: 0 }
    }

    fn plus(&self, m: i64) -> i64 {
        self.n + m
    }

    fn upto(&self) -> Vec<i64> {
        (1..=self.n).collect()
    }
}

#[derive(Clone, Debug)]
struct Resource {
    tags: Vec<String>,
}

impl WritClass for Resource {}

fn writ_test() -> WritTest {
    common::setup();
    let mut test = WritTest::new();
    test.writ
        .register_class(
            Expense::get_writ_class_builder()
                .add_attribute_getter("owner", |e: &Expense| e.owner.clone())
                .add_attribute_getter("amount", |e: &Expense| e.amount)
                .build(),
        )
        .unwrap();
    test.writ
        .register_class(
            Counter::get_writ_class_builder()
                .set_constructor(Counter::new)
                .with_equality_check()
                .add_attribute_getter("n", |c: &Counter| c.n)
                .add_method("plus", Counter::plus)
                .add_iterator_method("upto", Counter::upto)
                .add_class_method("zero", Counter::zero)
                .set_into_iter(|c: &Counter| 0..c.n)
                .build(),
        )
        .unwrap();
    test.writ
        .register_class(
            Resource::get_writ_class_builder()
                .add_attribute_getter("tags", |r: &Resource| r.tags.clone())
                .build(),
        )
        .unwrap();
    test
}

fn expense(owner: &str) -> Expense {
    Expense {
        owner: owner.to_owned(),
        amount: 100,
    }
}

#[test]
fn test_simple_allow() -> writ::Result<()> {
    let mut writ = Writ::new();
    writ.load_str(r#"allow("alice", "read", "doc1");"#)?;
    assert!(writ.is_allowed("alice", "read", "doc1")?);
    assert!(!writ.is_allowed("bob", "read", "doc1")?);
    assert!(!writ.is_allowed("alice", "write", "doc1")?);
    Ok(())
}

#[test]
fn test_field_access() -> writ::Result<()> {
    let mut test = writ_test();
    test.load_str(r#"allow(u, "view", e: Expense) if u = e.owner;"#);
    assert!(test.writ.is_allowed("alice", "view", expense("alice"))?);
    assert!(!test.writ.is_allowed("bob", "view", expense("alice"))?);
    assert!(!test.writ.is_allowed("alice", "edit", expense("alice"))?);
    Ok(())
}

#[test]
fn test_list_membership() -> writ::Result<()> {
    let mut test = writ_test();
    test.load_str(r#"allow(_u, "tag", r: Resource) if t in r.tags and t = "public";"#);
    let tagged = |tags: &[&str]| Resource {
        tags: tags.iter().map(|t| t.to_string()).collect(),
    };
    assert!(test.writ.is_allowed("u", "tag", tagged(&["draft", "public"]))?);
    assert!(!test.writ.is_allowed("u", "tag", tagged(&["draft"]))?);
    Ok(())
}

#[test]
fn test_data_conversions() {
    let mut test = writ_test();
    test.qvar_one("x = 1", "x", 1i64);
    test.qvar_one("x = 1.5", "x", 1.5f64);
    test.qvar_one(r#"x = "hello""#, "x", "hello".to_owned());
    test.qvar_one("x = true", "x", true);
    test.qvar_one("x = [1, 2]", "x", vec![1i64, 2]);
    test.qvar_one(
        "x = {a: 1}",
        "x",
        hashmap! { "a".to_owned() => 1i64 },
    );
    test.qvar_one("x = 1 + 2 * 3", "x", 7i64);

    let results = test.query("x = 1 or x = 2");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], hashmap! { "x" => 1i64 });
    assert_eq!(results[1], hashmap! { "x" => 2i64 });
    assert!(results[0].keys().any(|k| k == "x"));
}

#[test]
fn test_constructors_and_methods() {
    let mut test = writ_test();
    test.qvar_one("c = new Counter(5) and x = c.n", "x", 5i64);
    test.qvar_one("c = new Counter(5) and x = c.plus(2)", "x", 7i64);
    test.qvar_one("c = Counter.zero() and x = c.n", "x", 0i64);
    test.qvar_one("x = new Counter(3)", "x", Counter { n: 3 });

    // Methods on builtin values.
    test.qvar_one(r#"x = "a b".split_whitespace()"#, "x", vec!["a".to_owned(), "b".to_owned()]);
    test.qeval(r#""abc".starts_with("ab") = true"#);
    test.qnull(r#""abc".starts_with("b") = true"#);
}

#[test]
fn test_iteration() {
    let mut test = writ_test();
    assert_eq!(test.qvar::<i64>("x in new Counter(3)", "x"), vec![0, 1, 2]);
    assert_eq!(
        test.qvar::<i64>("c = new Counter(3) and x in c.upto()", "x"),
        vec![1, 2, 3]
    );
    test.qnull("x in new Counter(0)");
}

#[test]
fn test_equality() -> writ::Result<()> {
    let mut test = writ_test();
    test.load_str("same(a, b) if a == b; differ(a, b) if a != b;");
    let same = |writ: &Writ, a: i64, b: i64| writ.query_rule_once("same", (Counter::new(a), Counter::new(b)));
    assert!(same(&test.writ, 1, 1)?);
    assert!(!same(&test.writ, 1, 2)?);
    assert!(test
        .writ
        .query_rule_once("differ", (Counter::new(1), Counter::new(2)))?);
    Ok(())
}

#[test]
fn test_isa() -> writ::Result<()> {
    let mut test = writ_test();
    test.load_str(
        r#"kind(_: Expense, "expense");
           kind(_: Counter, "counter");
           kind(_: Integer, "integer");"#,
    );
    let kind = |writ: &Writ, value: WritValue| -> writ::Result<Vec<String>> {
        writ.query_rule("kind", (value, WritValue::Variable("k".to_owned())))?
            .map(|r| r?.get_typed::<String>("k"))
            .collect()
    };
    assert_eq!(kind(&test.writ, expense("a").to_writ())?, vec!["expense"]);
    assert_eq!(kind(&test.writ, Counter::new(1).to_writ())?, vec!["counter"]);
    assert_eq!(kind(&test.writ, WritValue::Integer(1))?, vec!["integer"]);
    Ok(())
}

#[test]
fn test_cut() -> writ::Result<()> {
    let mut test = writ_test();
    test.load_str("g(1); g(2); h(x) if g(x) and cut;");
    let results: Vec<i64> = test
        .writ
        .query_rule("h", (WritValue::Variable("v".to_owned()),))?
        .map(|r| r?.get_typed("v"))
        .collect::<writ::Result<_>>()?;
    assert_eq!(results, vec![1]);
    Ok(())
}

#[test]
fn test_nil() {
    let mut test = writ_test();
    test.qeval("x = nil and x.is_none() = true");
    test.qnull("nil.is_some() = true");
}

#[test]
fn test_authorize() -> writ::Result<()> {
    let mut test = writ_test();
    test.load_str(
        r#"allow(u, "read", e: Expense) if u = e.owner or u = "auditor";
           allow(u, "delete", e: Expense) if u = e.owner;"#,
    );
    test.writ.authorize("alice", "delete", expense("alice"), true)?;

    let err = test
        .writ
        .authorize("auditor", "delete", expense("alice"), true)
        .unwrap_err();
    assert!(matches!(err, WritError::Authorization(AuthorizationError::Forbidden)));

    let err = test
        .writ
        .authorize("mallory", "delete", expense("alice"), true)
        .unwrap_err();
    assert!(matches!(err, WritError::Authorization(AuthorizationError::NotFound)));

    let err = test
        .writ
        .authorize("mallory", "delete", expense("alice"), false)
        .unwrap_err();
    assert!(matches!(err, WritError::Authorization(AuthorizationError::Forbidden)));
    Ok(())
}

#[test]
fn test_authorized_actions() -> writ::Result<()> {
    let mut test = writ_test();
    test.load_str(
        r#"allow(u, action, e: Expense) if u = e.owner and action in ["read", "write"];
           allow("auditor", "read", _e: Expense);"#,
    );
    let actions: HashSet<String> = test.writ.authorized_actions("alice", expense("alice"))?;
    assert_eq!(
        actions,
        vec!["read".to_owned(), "write".to_owned()].into_iter().collect()
    );
    let actions: HashSet<Action> = test.writ.authorized_actions("auditor", expense("alice"))?;
    assert_eq!(actions, vec![Action::Typed("read".to_owned())].into_iter().collect());
    let actions: HashSet<String> = test.writ.authorized_actions("bob", expense("alice"))?;
    assert!(actions.is_empty());
    Ok(())
}

#[test]
fn test_constants() -> writ::Result<()> {
    let mut test = writ_test();
    test.writ.register_constant(42i64, "answer")?;
    test.writ.register_constant(Counter::new(2), "two")?;
    test.qvar_one("x = answer", "x", 42i64);
    test.qvar_one("x = two.plus(1)", "x", 3i64);
    Ok(())
}

#[test]
fn test_load_files() {
    let mut test = writ_test();
    test.load_file("basic.writ").unwrap();
    test.qeval(r#"allow("alice", "read", "doc1")"#);

    // The same file twice is rejected.
    assert!(test.load_file("basic.writ").is_err());

    let err = test.writ.load_files(vec!["policy.txt"]).unwrap_err();
    assert!(matches!(err, WritError::IncorrectFileType { .. }), "{}", err);
}

#[test]
fn test_clear_rules() -> writ::Result<()> {
    let mut test = writ_test();
    test.load_str("f(1);");
    test.qeval("f(1)");
    test.writ.clear_rules()?;
    test.load_str("f(2);");
    test.qnull("f(1)");
    test.qeval("f(2)");
    Ok(())
}

#[test]
fn test_inline_queries() {
    let mut test = writ_test();
    test.load_str("f(1); ?= f(1);");

    let mut writ = Writ::new();
    let err = writ.load_str("g(1); ?= g(2);").unwrap_err();
    assert!(matches!(err, WritError::InlineQueryFailed { .. }), "{}", err);
    assert!(err.to_string().starts_with("Inline query failed"));
    // A failed load leaves no rules behind.
    assert!(!writ.query_rule_once("g", (1,)).unwrap_or(false));
}

#[test]
fn test_writ_is_shareable() -> writ::Result<()> {
    let mut writ = Writ::new();
    writ.load_str(r#"allow("alice", "read", "doc1");"#)?;
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let writ = writ.clone();
            std::thread::spawn(move || writ.is_allowed("alice", "read", "doc1"))
        })
        .collect();
    for handle in handles {
        assert!(handle.join().expect("thread panicked")?);
    }
    Ok(())
}
