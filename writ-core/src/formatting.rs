//! Rendering terms back into policy syntax.
//!
//! `Debug` output is derived and verbose. `to_policy()` produces text the
//! parser accepts, and `Display` for terms and rules delegates to it.

use std::fmt;
use std::sync::Arc;

use crate::numerics::Numeric;
use crate::rules::{Parameter, Rule};
use crate::sources::{loc_to_pos, Source};
use crate::terms::*;
use crate::traces::Node;
use crate::vm::Goal;

pub trait ToPolicy {
    fn to_policy(&self) -> String;
}

/// Binding strength of an operator when printed infix; higher binds tighter.
fn precedence(op: Operator) -> u8 {
    use Operator::*;
    match op {
        Print | Debug | New | Cut | ForAll => 11,
        Dot => 10,
        Mul | Div | Mod | Rem => 8,
        Add | Sub => 7,
        Eq | Neq | Lt | Leq | Gt | Geq | Unify | Assign => 6,
        In | Isa => 5,
        Not => 4,
        And => 3,
        Or => 2,
    }
}

fn symbol(op: Operator) -> &'static str {
    use Operator::*;
    match op {
        Debug => "debug",
        Print => "print",
        Cut => "cut",
        In => "in",
        Isa => "matches",
        New => "new",
        Dot => ".",
        Not => "not",
        Mul => "*",
        Div => "/",
        Mod => "mod",
        Rem => "rem",
        Add => "+",
        Sub => "-",
        Eq => "==",
        Geq => ">=",
        Leq => "<=",
        Neq => "!=",
        Gt => ">",
        Lt => "<",
        Unify => "=",
        Or => "or",
        And => "and",
        ForAll => "forall",
        Assign => ":=",
    }
}

/// Lookups, arithmetic and constructors after rewriting carry an extra
/// output argument and print as `lhs = output`.
fn has_output(o: &Operation) -> bool {
    match o.operator {
        Operator::New => o.args.len() == 2,
        Operator::Dot => o.args.len() == 3,
        op => op.is_arithmetic() && o.args.len() == 3,
    }
}

fn operation_precedence(o: &Operation) -> u8 {
    if has_output(o) {
        precedence(Operator::Unify)
    } else {
        precedence(o.operator)
    }
}

/// Render `term` as an operand of `op`, parenthesized if it binds looser.
fn operand(op: Operator, term: &Term) -> String {
    match term.value() {
        Value::Expression(inner)
            if inner.args.len() > 1 && operation_precedence(inner) < precedence(op) =>
        {
            format!("({})", inner.to_policy())
        }
        _ => term.to_policy(),
    }
}

fn join(terms: &[Term], op: Operator, sep: &str) -> String {
    terms
        .iter()
        .map(|t| operand(op, t))
        .collect::<Vec<_>>()
        .join(sep)
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

impl ToPolicy for Operation {
    fn to_policy(&self) -> String {
        use Operator::*;
        let args = &self.args;
        if let Some((output, input)) = args.split_last().filter(|_| has_output(self)) {
            let lhs = Operation::new(self.operator, input.to_vec());
            return format!("{} = {}", lhs.to_policy(), output.to_policy());
        }
        match (self.operator, args.len()) {
            (Debug | Print, _) => format!("{}({})", symbol(self.operator), join(args, And, ", ")),
            (Cut, _) => "cut".to_owned(),
            (ForAll, 2) => format!(
                "forall({}, {})",
                args[0].to_policy(),
                args[1].to_policy()
            ),
            (New, 1) => format!("new {}", args[0].to_policy()),
            (Not, 1) => format!("not {}", operand(Not, &args[0])),
            (And, 0) => "true".to_owned(),
            (Or, 0) => "false".to_owned(),
            (And | Or, _) => join(args, self.operator, &format!(" {} ", symbol(self.operator))),
            (Dot, 2) => {
                let field = match args[1].value() {
                    Value::String(s) => s.clone(),
                    Value::Call(call) => call.to_policy(),
                    _ => format!("({})", args[1].to_policy()),
                };
                format!("{}.{}", operand(Dot, &args[0]), field)
            }
            (Isa, 2) => format!("{} matches {}", operand(Isa, &args[0]), args[1].to_policy()),
            (_, 2) => format!(
                "{} {} {}",
                operand(self.operator, &args[0]),
                symbol(self.operator),
                operand(self.operator, &args[1])
            ),
            (_, _) => format!("{}({})", symbol(self.operator), join(args, And, ", ")),
        }
    }
}

impl ToPolicy for Call {
    fn to_policy(&self) -> String {
        let mut args: Vec<String> = self.args.iter().map(ToPolicy::to_policy).collect();
        if let Some(kwargs) = &self.kwargs {
            args.extend(
                kwargs
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.to_policy())),
            );
        }
        format!("{}({})", self.name, args.join(", "))
    }
}

impl ToPolicy for Dictionary {
    fn to_policy(&self) -> String {
        let fields = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v.to_policy()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{}}}", fields)
    }
}

impl ToPolicy for InstanceLiteral {
    fn to_policy(&self) -> String {
        if self.fields.is_empty() {
            self.tag.0.clone()
        } else {
            format!("{}{}", self.tag, self.fields.to_policy())
        }
    }
}

impl ToPolicy for Pattern {
    fn to_policy(&self) -> String {
        match self {
            Pattern::Dictionary(d) => d.to_policy(),
            Pattern::Instance(i) => i.to_policy(),
        }
    }
}

impl ToPolicy for ExternalInstance {
    fn to_policy(&self) -> String {
        match (&self.repr, &self.class_repr) {
            (Some(repr), _) => repr.clone(),
            (None, Some(class)) => format!("<{} {}>", class, self.instance_id),
            (None, None) => format!("^{{id: {}}}", self.instance_id),
        }
    }
}

impl ToPolicy for Numeric {
    fn to_policy(&self) -> String {
        self.to_string()
    }
}

impl ToPolicy for Value {
    fn to_policy(&self) -> String {
        match self {
            Value::Number(n) => n.to_policy(),
            Value::String(s) => format!("\"{}\"", escape(s)),
            Value::Boolean(b) => b.to_string(),
            Value::ExternalInstance(e) => e.to_policy(),
            Value::Dictionary(d) => d.to_policy(),
            Value::Pattern(p) => p.to_policy(),
            Value::Call(c) => c.to_policy(),
            Value::List(l) => format!("[{}]", join(l, Operator::And, ", ")),
            Value::Variable(v) => v.0.clone(),
            Value::RestVariable(v) => format!("*{}", v),
            Value::Expression(e) => e.to_policy(),
        }
    }
}

impl ToPolicy for Term {
    fn to_policy(&self) -> String {
        self.value().to_policy()
    }
}

impl ToPolicy for Parameter {
    fn to_policy(&self) -> String {
        match &self.specializer {
            None => self.parameter.to_policy(),
            Some(spec) => format!("{}: {}", self.parameter.to_policy(), spec.to_policy()),
        }
    }
}

impl Rule {
    pub fn head_to_policy(&self) -> String {
        let params = self
            .params
            .iter()
            .map(ToPolicy::to_policy)
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({})", self.name, params)
    }
}

impl ToPolicy for Rule {
    fn to_policy(&self) -> String {
        match self.body.value() {
            Value::Expression(Operation {
                operator: Operator::And,
                args,
            }) if args.is_empty() => format!("{};", self.head_to_policy()),
            Value::Expression(Operation {
                operator: Operator::And,
                args,
            }) => format!("{} if {};", self.head_to_policy(), join(args, Operator::And, " and ")),
            _ => format!("{} if {};", self.head_to_policy(), self.body.to_policy()),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_policy())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_policy())
    }
}

/// The text a term was parsed from, or its rendering if it wasn't parsed.
/// With `include_info`, the position is appended.
pub fn term_source(term: &Term, include_info: bool) -> String {
    let mut out = match term.source_info.span() {
        Some((source, left, right)) => source
            .src
            .get(left..right)
            .map_or_else(|| term.to_policy(), str::to_owned),
        None => term.to_policy(),
    };
    if include_info {
        out.push_str(&source_position(term));
    }
    out
}

/// ` at line L, column C in file F` for a parsed term, empty otherwise.
pub fn source_position(term: &Term) -> String {
    match term.source_info.span() {
        Some((source, left, _)) => {
            let (row, column) = source.position(left);
            let mut out = format!(" at line {}, column {}", row + 1, column + 1);
            if let Some(filename) = &source.filename {
                out.push_str(&format!(" in file {}", filename));
            }
            out
        }
        None => String::new(),
    }
}

/// Same as `source_position`, for where a rule was defined.
pub fn rule_position(rule: &Rule) -> String {
    match rule.source_info.span() {
        Some((source, left, _)) => {
            let (row, column) = source.position(left);
            let mut out = format!(" at line {}, column {}", row + 1, column + 1);
            if let Some(filename) = &source.filename {
                out.push_str(&format!(" in file {}", filename));
            }
            out
        }
        None => String::new(),
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn rules(rules: &[Arc<Rule>]) -> String {
            rules
                .iter()
                .map(|rule| rule.head_to_policy())
                .collect::<Vec<_>>()
                .join(" ")
        }

        match self {
            Goal::Isa { left, right } => write!(f, "Isa({}, {})", left, right),
            Goal::IsMoreSpecific { left, right, args } => write!(
                f,
                "IsMoreSpecific({} {} ({}))",
                left.head_to_policy(),
                right.head_to_policy(),
                args.iter().map(Term::to_policy).collect::<Vec<_>>().join(", ")
            ),
            Goal::IsSubclass { left, right, .. } => write!(f, "IsSubclass({}, {})", left, right),
            Goal::Lookup { dict, field, value } => write!(
                f,
                "Lookup({}.{} = {})",
                dict.to_policy(),
                field,
                value
            ),
            Goal::LookupExternal {
                instance, field, ..
            } => write!(f, "LookupExternal({}.{})", instance, field),
            Goal::PopQuery { term } => write!(f, "PopQuery({})", term),
            Goal::Query { term } => write!(f, "Query({})", term),
            Goal::FilterRules {
                applicable_rules,
                unfiltered_rules,
                ..
            } => write!(
                f,
                "FilterRules([{}], [{}])",
                rules(applicable_rules),
                rules(unfiltered_rules)
            ),
            Goal::SortRules {
                rules: sorting,
                outer,
                inner,
                ..
            } => write!(
                f,
                "SortRules([{}], outer={}, inner={})",
                rules(sorting),
                outer,
                inner
            ),
            Goal::TraceRule { trace } => match &trace.node {
                Node::Rule(rule) => write!(f, "TraceRule({})", rule.head_to_policy()),
                Node::Term(term) => write!(f, "TraceRule({})", term),
            },
            Goal::Unify { left, right } => write!(f, "Unify({}, {})", left, right),
            Goal::AddConstraint { term } => write!(f, "AddConstraint({})", term),
            g => write!(f, "{:?}", g),
        }
    }
}

/// The line holding `offset` plus up to `context` lines either side, numbered,
/// with a caret under the offending column.
pub fn source_lines(source: &Source, offset: usize, context: usize) -> String {
    let (target_row, target_column) = loc_to_pos(&source.src, offset);
    let first = target_row.saturating_sub(context);
    let mut out = Vec::new();
    for (row, line) in source
        .src
        .lines()
        .enumerate()
        .skip(first)
        .take(target_row - first + context + 1)
    {
        out.push(format!("{:03}: {}", row + 1, line));
        if row == target_row {
            out.push(format!("{}^", " ".repeat("123: ".len() + target_column)));
        }
    }
    out.join("\n")
}
