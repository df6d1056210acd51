//! The interactive debugger. It never touches the goal stack itself: it
//! answers with a `Goal::Debug` that the VM pushes, which surfaces as a
//! `QueryEvent::Debug` for the host.

use std::fmt::Display;
use std::rc::Rc;

use super::error::{PolicyError, PolicyResult};
use super::formatting::source_lines;
use super::terms::*;
use super::traces::*;
use super::vm::*;

impl VirtualMachine {
    /// `QUERY: <term>, BINDINGS: {<var> = <value>, ...}` for the variables
    /// of `query`.
    pub fn query_summary(&self, query: &Term) -> String {
        let bindings = sorted_lines(
            self.relevant_bindings(&[query])
                .iter()
                .map(|(var, value)| format!("{} = {}", var.0, value)),
        );
        format!("QUERY: {}, BINDINGS: {{{}}}", query, bindings.join(", "))
    }

    /// Push a `Goal::Debug` if the debugger stops at `event`. Returns
    /// whether it did.
    pub fn maybe_break(&mut self, event: DebugEvent) -> PolicyResult<bool> {
        let goal = self.debugger.maybe_break(event, self);
        let stopped = goal.is_some();
        if let Some(goal) = goal {
            self.push_goal(goal)?;
        }
        Ok(stopped)
    }
}

/// Points in evaluation where the debugger may stop.
#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug)]
pub enum DebugEvent {
    Goal(Rc<Goal>),
    Query,
    Pop,
    Error(PolicyError),
    Rule,
}

/// Where to stop next.
#[derive(Clone, Copy, Debug, PartialEq)]
enum StopAt {
    Goal,
    Query,
    /// The next query at this trace depth.
    QueryAtDepth(usize),
    /// The next query shallower than this trace depth.
    QueryAbove(usize),
    Error,
    Rule,
}

enum Command<'a> {
    Resume(Option<StopAt>),
    Line(usize),
    Query(usize),
    Stack,
    Goals,
    Bindings,
    Vars(&'a [&'a str]),
    Help,
}

const HELP: &str = "Debugger Commands
  h[elp]              Show this message.
  c[ontinue], q[uit]  Run until the next `debug()`.
  s[tep], into        Stop at the next query, entering rules.
  n[ext], over        Stop at the next query at this depth.
  o[ut]               Stop at the next query above this depth.
  g[oal]              Stop at the next VM goal.
  e[rror]             Stop at the next error.
  r[ule]              Stop at the next rule.
  l[ine] [<n>]        Show the current line with <n> lines of context.
  query [<i>]         Show the current query, or the one <i> levels up.
  queries             Same as `query`.
  stack, trace        Show the query stack.
  goals               Show the goal stack.
  bindings            Show every binding.
  var [<name> ...]    List variables in scope, or show the named ones.

An empty command repeats the last one.";

fn sorted_lines(lines: impl Iterator<Item = String>) -> Vec<String> {
    let mut lines: Vec<String> = lines.collect();
    lines.sort();
    lines
}

fn show_all<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Clone, Debug, Default)]
pub struct Debugger {
    /// `None` runs freely.
    stop_at: Option<StopAt>,
    last_command: Option<String>,
}

impl Debugger {
    fn parse<'a>(words: &'a [&'a str], vm: &VirtualMachine) -> Command<'a> {
        let depth = vm.trace_stack.len();
        let number = || words.get(1).and_then(|n| n.parse().ok()).unwrap_or(0);
        match words.first().copied().unwrap_or("help") {
            "c" | "continue" | "q" | "quit" => Command::Resume(None),
            "s" | "step" | "into" => Command::Resume(Some(StopAt::Query)),
            "n" | "next" | "over" => Command::Resume(Some(StopAt::QueryAtDepth(depth))),
            "o" | "out" => Command::Resume(Some(StopAt::QueryAbove(depth))),
            "g" | "goal" => Command::Resume(Some(StopAt::Goal)),
            "e" | "error" => Command::Resume(Some(StopAt::Error)),
            "r" | "rule" => Command::Resume(Some(StopAt::Rule)),
            "l" | "line" => Command::Line(number()),
            "query" | "queries" => Command::Query(number()),
            "stack" | "trace" => Command::Stack,
            "goals" => Command::Goals,
            "bindings" => Command::Bindings,
            "var" => Command::Vars(&words[1..]),
            _ => Command::Help,
        }
    }

    fn source_around(query: &Term, context: usize) -> String {
        match query.source_info.span() {
            Some((source, left, _)) => source_lines(source, left, context),
            None => String::new(),
        }
    }

    fn maybe_break(&self, event: DebugEvent, vm: &VirtualMachine) -> Option<Goal> {
        let depth = vm.trace_stack.len();
        let message = match (self.stop_at?, event) {
            (StopAt::Goal, DebugEvent::Goal(goal)) => goal.to_string(),
            (StopAt::Query, DebugEvent::Query) | (StopAt::Rule, DebugEvent::Rule) => {
                self.break_msg(vm)?
            }
            (StopAt::QueryAtDepth(level), DebugEvent::Query) if depth == level => {
                self.break_msg(vm)?
            }
            (StopAt::QueryAbove(level), DebugEvent::Query) if depth == 0 || depth < level => {
                self.break_msg(vm)?
            }
            (StopAt::Error, DebugEvent::Error(error)) => {
                format!("{}\nERROR: {}\n", self.break_msg(vm)?, error)
            }
            _ => return None,
        };
        Some(Goal::Debug { message })
    }

    /// What the VM is working on: the current query with its source, or
    /// the rule being entered. `None` for a single-element conjunction,
    /// which is about to become a query of its own.
    pub fn break_msg(&self, vm: &VirtualMachine) -> Option<String> {
        match &vm.trace.last()?.node {
            Node::Rule(rule) => Some(rule.to_string()),
            Node::Term(query) => match query.value() {
                Value::Expression(Operation {
                    operator: Operator::And,
                    args,
                }) if args.len() == 1 => None,
                _ => Some(format!(
                    "{}\n\n{}\n",
                    vm.query_summary(query),
                    Self::source_around(query, 3)
                )),
            },
        }
    }

    /// The query `level` steps up the query stack.
    fn query_at(level: usize, vm: &VirtualMachine) -> Result<Option<Term>, String> {
        let current = vm.trace.last().and_then(|t| t.term());
        if level == 0 {
            return Ok(current);
        }
        vm.trace_stack
            .iter()
            .rev()
            .filter_map(|traces| traces.last().and_then(|t| t.term()))
            .nth(level - 1)
            .map(Some)
            .ok_or_else(|| "Error: level is out of range".to_owned())
    }

    /// Run a debugger command. Commands that show something answer with a
    /// `Goal::Debug`; the rest choose where evaluation stops next.
    pub fn debug_command(&mut self, command: &str, vm: &VirtualMachine) -> Option<Goal> {
        let mut words: Vec<&str> = command.split_whitespace().collect();
        let last = self.last_command.take();
        if words.is_empty() {
            words = last.as_deref().map_or_else(Vec::new, |l| l.split_whitespace().collect());
        }
        self.last_command = words.first().map(|w| w.to_string());

        let message = match Self::parse(&words, vm) {
            Command::Resume(stop_at) => {
                self.stop_at = stop_at;
                return None;
            }
            Command::Line(context) => vm
                .queries
                .last()
                .map_or_else(String::new, |query| Self::source_around(query, context)),
            Command::Query(level) => match Self::query_at(level, vm) {
                Ok(query) => query.map_or_else(String::new, |q| vm.query_summary(&q)),
                Err(message) => message,
            },
            Command::Stack => vm.stack_trace(),
            Command::Goals => show_all(&vm.goals),
            Command::Bindings => show_all(&sorted_lines(
                vm.bindings(true)
                    .into_iter()
                    .map(|(var, value)| format!("{} = {}", var, value)),
            )),
            Command::Vars([]) => {
                let names = sorted_lines(vm.bindings(true).keys().map(|k| k.0.clone()));
                if names.is_empty() {
                    "No variables in scope.".to_owned()
                } else {
                    names.join(", ")
                }
            }
            Command::Vars(names) => names
                .iter()
                .map(|name| describe_var(name, vm))
                .collect::<Vec<_>>()
                .join("\n"),
            Command::Help => HELP.to_owned(),
        };
        Some(Goal::Debug { message })
    }
}

/// `name = value` for a variable. Rule variables are renamed to `_name_N`
/// on entry to a rule, so fall back to the newest renaming.
fn describe_var(name: &str, vm: &VirtualMachine) -> String {
    let bindings = vm.bindings(true);
    if let Some(value) = bindings.get(&Symbol::new(name)) {
        return format!("{} = {}", name, vm.deref(value));
    }
    let prefix = format!("_{}_", name);
    let renamed = bindings
        .iter()
        .filter_map(|(var, value)| {
            let n: u64 = var.0.strip_prefix(&prefix)?.parse().ok()?;
            Some((n, var, value))
        })
        .max_by_key(|(n, _, _)| *n);
    match renamed {
        Some((_, var, value)) => format!("{}@{} = {}", name, var, vm.deref(value)),
        None => format!("{} = <unbound>", name),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};

    use super::*;
    use crate::events::QueryEvent;
    use crate::kb::KnowledgeBase;

    fn empty_vm(goals: Vec<Goal>) -> VirtualMachine {
        VirtualMachine::new_test(Arc::new(RwLock::new(KnowledgeBase::new())), false, goals)
    }

    fn reply(vm: &mut VirtualMachine, command: &str) -> String {
        vm.debug_command(command).unwrap();
        match vm.run().unwrap() {
            QueryEvent::Debug { message } => message,
            e => panic!("expected a debug event, got {:?}", e),
        }
    }

    #[test]
    fn var_finds_the_newest_renaming() {
        let mut vm = empty_vm(vec![]);
        vm.bind(&sym!("_x_3"), term!(1)).unwrap();
        vm.bind(&sym!("_x_7"), term!(2)).unwrap();
        vm.bind(&sym!("y"), term!("hi")).unwrap();

        assert_eq!(reply(&mut vm, "var x"), "x@_x_7 = 2");
        assert_eq!(reply(&mut vm, "var y z"), "y = \"hi\"\nz = <unbound>");
        assert_eq!(reply(&mut vm, "var"), "_x_3, _x_7, y");
    }

    #[test]
    fn an_empty_command_repeats_the_last_one() {
        let mut vm = empty_vm(vec![]);
        assert!(reply(&mut vm, "help").starts_with("Debugger Commands"));
        assert!(reply(&mut vm, "").starts_with("Debugger Commands"));
        assert_eq!(reply(&mut vm, "bindings"), "");
        assert_eq!(reply(&mut vm, "query 4"), "Error: level is out of range");
    }

    #[test]
    fn step_stops_at_the_next_query() {
        let mut kb = KnowledgeBase::new();
        kb.add_rule(rule!("f", [sym!("x")] => op!(Gt, var!("x"), term!(0))));
        let query = Goal::Query {
            term: term!(op!(And, term!(op!(Debug)), term!(call!("f", [1])))),
        };
        let mut vm = VirtualMachine::new_test(Arc::new(RwLock::new(kb)), false, vec![query]);

        assert!(matches!(vm.run().unwrap(), QueryEvent::Debug { .. }));
        vm.debug_command("step").unwrap();
        match vm.run().unwrap() {
            QueryEvent::Debug { message } => {
                assert!(message.starts_with("QUERY: f(1)"), "{}", message)
            }
            e => panic!("unexpected event: {:?}", e),
        }
        vm.debug_command("continue").unwrap();
        assert!(matches!(vm.run().unwrap(), QueryEvent::Result { .. }));
    }
}
