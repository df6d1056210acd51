//! Methods callable on the builtin values of a policy, such as
//! `name.starts_with("a")` or `roles.contains("admin")`.

use std::collections::HashMap;

use crate::{Class, ClassBuilder, WritError, WritValue};

type List = Vec<WritValue>;
type Dict = HashMap<String, WritValue>;

fn builtin<T>(name: &str) -> ClassBuilder<T>
where
    T: Default + PartialEq + Send + Sync + 'static,
{
    ClassBuilder::<T>::with_default()
        .name(name)
        .with_equality_check()
}

fn owned<'a>(parts: impl Iterator<Item = &'a str>) -> Vec<String> {
    parts.map(str::to_owned).collect()
}

fn numbers() -> [Class; 2] {
    [
        builtin::<i64>("Integer")
            .add_method("abs", |i: &i64| i.abs())
            .add_method("pow", |i: &i64, exp: u32| i.pow(exp))
            .build(),
        builtin::<f64>("Float")
            .add_method("abs", |f: &f64| f.abs())
            .add_method("floor", |f: &f64| f.floor())
            .add_method("ceil", |f: &f64| f.ceil())
            .add_method("round", |f: &f64| f.round())
            .build(),
    ]
}

fn collections() -> [Class; 2] {
    [
        builtin::<List>("List")
            .add_method("len", |l: &List| l.len() as i64)
            .add_method("is_empty", |l: &List| l.is_empty())
            .add_method("contains", |l: &List, item: WritValue| l.contains(&item))
            .with_iter()
            .build(),
        builtin::<Dict>("Dictionary")
            .add_method("len", |d: &Dict| d.len() as i64)
            .add_method("is_empty", |d: &Dict| d.is_empty())
            .add_method("contains_key", |d: &Dict, key: String| d.contains_key(&key))
            .add_method("keys", |d: &Dict| d.keys().cloned().collect::<Vec<_>>())
            .add_method("values", |d: &Dict| d.values().cloned().collect::<List>())
            .build(),
    ]
}

fn string() -> Class {
    builtin::<String>("String")
        .add_method("len", |s: &String| s.len() as i64)
        .add_method("is_empty", |s: &String| s.is_empty())
        .add_method("contains", |s: &String, pat: String| s.contains(pat.as_str()))
        .add_method("starts_with", |s: &String, pat: String| s.starts_with(pat.as_str()))
        .add_method("ends_with", |s: &String, pat: String| s.ends_with(pat.as_str()))
        .add_method("find", |s: &String, pat: String| s.find(pat.as_str()).map(|i| i as i64))
        .add_method("split", |s: &String, sep: String| owned(s.split(sep.as_str())))
        .add_method("split_whitespace", |s: &String| owned(s.split_whitespace()))
        .add_method("trim", |s: &String| s.trim().to_owned())
        .add_method("to_lowercase", |s: &String| s.to_lowercase())
        .add_method("to_uppercase", |s: &String| s.to_uppercase())
        .add_method("repeat", |s: &String, n: i64| s.repeat(n.max(0) as usize))
        .build()
}

/// `nil` on the policy side.
fn option() -> Class {
    builtin::<Option<WritValue>>("Option")
        .add_method("is_none", |o: &Option<WritValue>| o.is_none())
        .add_method("is_some", |o: &Option<WritValue>| o.is_some())
        .add_method("unwrap", |o: &Option<WritValue>| {
            o.clone().ok_or_else(|| WritError::Custom {
                message: "called `unwrap` on nil".to_owned(),
            })
        })
        .with_iter()
        .build()
}

/// Returns the builtin classes. They are cached on the host only, so
/// methods on builtin values dispatch, but the names stay reserved for
/// the core's own type checks.
///
/// `Class` itself is among them: a registered class is a constant whose
/// value is its `Class`, and `Name.method()` calls go through it.
pub fn classes() -> Vec<Class> {
    let mut classes = vec![
        Class::builder::<Class>().build(),
        builtin::<bool>("Boolean").build(),
        string(),
        option(),
    ];
    classes.extend(numbers());
    classes.extend(collections());
    classes
}
