//! Owning, rebuilding traversal of terms and rules.
//!
//! A `Folder` consumes a tree and returns a tree of the same shape. Hooks
//! default to the `fold_*` functions below, which rebuild children.

use std::collections::BTreeMap;

use crate::rules::{Parameter, Rule};
use crate::terms::*;

pub trait Folder: Sized {
    fn fold_term(&mut self, t: Term) -> Term {
        fold_term(t, self)
    }
    fn fold_value(&mut self, v: Value) -> Value {
        fold_value(v, self)
    }
    fn fold_variable(&mut self, v: Symbol) -> Symbol {
        v
    }
    fn fold_rest_variable(&mut self, v: Symbol) -> Symbol {
        v
    }
    fn fold_external_instance(&mut self, e: ExternalInstance) -> ExternalInstance {
        e
    }
    fn fold_call(&mut self, c: Call) -> Call {
        fold_call(c, self)
    }
    fn fold_operation(&mut self, o: Operation) -> Operation {
        fold_operation(o, self)
    }
    fn fold_dictionary(&mut self, d: Dictionary) -> Dictionary {
        fold_dictionary(d, self)
    }
    fn fold_pattern(&mut self, p: Pattern) -> Pattern {
        fold_pattern(p, self)
    }
    fn fold_list(&mut self, l: TermList) -> TermList {
        l.into_iter().map(|t| self.fold_term(t)).collect()
    }
    fn fold_param(&mut self, p: Parameter) -> Parameter {
        fold_param(p, self)
    }
    fn fold_rule(&mut self, r: Rule) -> Rule {
        fold_rule(r, self)
    }
}

pub fn fold_term<F: Folder>(term: Term, folder: &mut F) -> Term {
    let value = folder.fold_value(term.value().clone());
    term.clone_with_value(value)
}

pub fn fold_value<F: Folder>(value: Value, folder: &mut F) -> Value {
    match value {
        v @ (Value::Number(_) | Value::String(_) | Value::Boolean(_)) => v,
        Value::ExternalInstance(e) => Value::ExternalInstance(folder.fold_external_instance(e)),
        Value::Dictionary(d) => Value::Dictionary(folder.fold_dictionary(d)),
        Value::Pattern(p) => Value::Pattern(folder.fold_pattern(p)),
        Value::Call(c) => Value::Call(folder.fold_call(c)),
        Value::List(l) => Value::List(folder.fold_list(l)),
        Value::Variable(v) => Value::Variable(folder.fold_variable(v)),
        Value::RestVariable(r) => Value::RestVariable(folder.fold_rest_variable(r)),
        Value::Expression(o) => Value::Expression(folder.fold_operation(o)),
    }
}

pub fn fold_call<F: Folder>(Call { name, args, kwargs }: Call, folder: &mut F) -> Call {
    Call {
        name,
        args: folder.fold_list(args),
        kwargs: kwargs.map(|kwargs| {
            kwargs
                .into_iter()
                .map(|(k, v)| (k, folder.fold_term(v)))
                .collect::<BTreeMap<_, _>>()
        }),
    }
}

pub fn fold_operation<F: Folder>(Operation { operator, args }: Operation, folder: &mut F) -> Operation {
    Operation {
        operator,
        args: folder.fold_list(args),
    }
}

pub fn fold_dictionary<F: Folder>(Dictionary { fields }: Dictionary, folder: &mut F) -> Dictionary {
    Dictionary {
        fields: fields
            .into_iter()
            .map(|(k, v)| (k, folder.fold_term(v)))
            .collect(),
    }
}

pub fn fold_pattern<F: Folder>(pattern: Pattern, folder: &mut F) -> Pattern {
    match pattern {
        Pattern::Dictionary(d) => Pattern::Dictionary(folder.fold_dictionary(d)),
        Pattern::Instance(InstanceLiteral { tag, fields }) => Pattern::Instance(InstanceLiteral {
            tag,
            fields: folder.fold_dictionary(fields),
        }),
    }
}

pub fn fold_param<F: Folder>(
    Parameter {
        parameter,
        specializer,
    }: Parameter,
    folder: &mut F,
) -> Parameter {
    Parameter {
        parameter: folder.fold_term(parameter),
        specializer: specializer.map(|s| folder.fold_term(s)),
    }
}

pub fn fold_rule<F: Folder>(rule: Rule, folder: &mut F) -> Rule {
    let Rule {
        name,
        params,
        body,
        source_info,
    } = rule;
    Rule {
        name,
        params: params.into_iter().map(|p| folder.fold_param(p)).collect(),
        body: folder.fold_term(body),
        source_info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Prefix;

    impl Folder for Prefix {
        fn fold_variable(&mut self, v: Symbol) -> Symbol {
            Symbol(format!("p_{}", v.0))
        }
    }

    #[test]
    fn test_fold_renames_everywhere() {
        let t = term!(op!(
            And,
            term!(call!("f", [var!("x")])),
            term!([var!("y"), term!(btreemap! {sym!("k") => var!("z")})])
        ));
        let expected = term!(op!(
            And,
            term!(call!("f", [var!("p_x")])),
            term!([var!("p_y"), term!(btreemap! {sym!("k") => var!("p_z")})])
        ));
        assert_eq!(Prefix.fold_term(t), expected);
    }
}
