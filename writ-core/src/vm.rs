use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Write};
use std::rc::Rc;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use crate::bindings::{BindingManager, Bindings, Bsp, VariableState};
use crate::debugger::{DebugEvent, Debugger};
use crate::error::{invalid_state, unsupported, PolicyError, PolicyResult, RuntimeError};
use crate::events::*;
use crate::folder::Folder;
use crate::formatting::{rule_position, source_position, term_source, ToPolicy};
use crate::kb::*;
use crate::messages::*;
use crate::numerics::*;
use crate::partial::simplify_partial;
use crate::rewrites::Renamer;
use crate::rules::*;
use crate::terms::*;
use crate::traces::*;
use crate::visitor::{walk_term, Visitor};

pub const MAX_STACK_SIZE: usize = 10_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Rules a policy is allowed to leave undefined; querying them just fails.
const OPTIONAL_RULES: [&str; 6] = [
    "allow",
    "allow_field",
    "allow_request",
    "has_permission",
    "has_role",
    "has_relation",
];

#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
}

impl LogLevel {
    fn should_print_on_level(&self, level: LogLevel) -> bool {
        *self <= level
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Trace => write!(f, "TRACE"),
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
        }
    }
}

/// Per-query switches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Record a trace tree and return it with each result.
    pub trace: bool,
    /// Allow results that bind variables to residual expressions.
    pub accept_expression: bool,
    /// Querying an undefined rule fails instead of raising an error.
    pub lenient: bool,
    /// Host errors abort the query instead of failing the current branch.
    pub strict: bool,
}

/// One instruction for the machine. Goals are pushed on a stack and run
/// last in, first out.
#[derive(Debug, Clone)]
#[must_use = "ignored goals are never accomplished"]
#[allow(clippy::large_enum_variant)]
pub enum Goal {
    // Control.
    Noop,
    Halt,
    Backtrack,
    /// Drop every choice from `choice_index` up.
    Cut {
        choice_index: usize,
    },
    Error {
        error: PolicyError,
    },
    Debug {
        message: String,
    },

    // Evaluation.
    Query {
        term: Term,
    },
    PopQuery {
        term: Term,
    },
    Unify {
        left: Term,
        right: Term,
    },
    Isa {
        left: Term,
        right: Term,
    },
    Lookup {
        dict: Dictionary,
        field: Term,
        value: Term,
    },
    AddConstraint {
        term: Term,
    },

    // Rule selection.
    FilterRules {
        args: TermList,
        applicable_rules: Rules,
        unfiltered_rules: Rules,
    },
    SortRules {
        args: TermList,
        rules: Rules,
        outer: usize,
        inner: usize,
    },
    IsMoreSpecific {
        left: Arc<Rule>,
        right: Arc<Rule>,
        args: TermList,
    },

    // Questions for the host.
    LookupExternal {
        call_id: u64,
        instance: Term,
        field: Term,
    },
    NextExternal {
        call_id: u64,
        iterable: Term,
    },
    MakeExternal {
        constructor: Term,
        instance_id: u64,
    },
    IsaExternal {
        instance: Term,
        literal: InstanceLiteral,
    },
    /// Succeed if class `left` is `right` or one of its subclasses.
    IsSubclass {
        left: Symbol,
        right: Symbol,
    },
    /// Succeed if following `path` from an instance of `base_tag` leads to
    /// an instance of `class_tag`.
    IsaWithPath {
        base_tag: Symbol,
        path: TermList,
        class_tag: Symbol,
    },
    /// Fail the branch if the host reported an error for the last call.
    CheckError,

    // Tracing.
    TraceRule {
        trace: Rc<Trace>,
    },
    TraceStackPush,
    TraceStackPop,
}

/// A saved machine state to resume from on backtrack, with the goal
/// stacks still left to try from it.
#[derive(Clone, Debug)]
pub struct Choice {
    pub alternatives: Vec<GoalStack>,
    /// Bindings are rolled back to here.
    bsp: Bsp,
    pub goals: GoalStack,
    queries: Queries,
    trace: Vec<Rc<Trace>>,
    trace_stack: TraceStack,
}

pub type Choices = Vec<Choice>;
pub type Goals = Vec<Goal>;
pub type TraceStack = Vec<Rc<Vec<Rc<Trace>>>>;

/// Goals with the next one to run on top.
#[derive(Clone, Debug, Default)]
pub struct GoalStack(Vec<Rc<Goal>>);

impl GoalStack {
    /// Stack `goals` so that the first one runs first.
    fn new_reversed(goals: Goals) -> Self {
        let mut stack = Vec::with_capacity(goals.len());
        stack.extend(goals.into_iter().rev().map(Rc::new));
        Self(stack)
    }
}

impl std::ops::Deref for GoalStack {
    type Target = Vec<Rc<Goal>>;
    fn deref(&self) -> &Vec<Rc<Goal>> {
        &self.0
    }
}

impl std::ops::DerefMut for GoalStack {
    fn deref_mut(&mut self) -> &mut Vec<Rc<Goal>> {
        &mut self.0
    }
}

pub type Queries = TermList;

/// Evaluate a comparison between two ground operands.
pub fn compare(op: Operator, left: &Term, right: &Term, context: &Term) -> PolicyResult<bool> {
    use {Operator::*, Value::*};
    // Booleans compare as 0 and 1.
    fn to_int(x: bool) -> Numeric {
        Numeric::Integer(i64::from(x))
    }

    fn compare<T: PartialOrd>(op: Operator, left: T, right: T) -> PolicyResult<bool> {
        match op {
            Lt => Ok(left < right),
            Leq => Ok(left <= right),
            Gt => Ok(left > right),
            Geq => Ok(left >= right),
            Eq => Ok(left == right),
            Neq => Ok(left != right),
            _ => invalid_state(format!("`{:?}` is not a comparison operator", op)),
        }
    }

    match (left.value(), right.value()) {
        (Boolean(l), Boolean(r)) => compare(op, &to_int(*l), &to_int(*r)),
        (Boolean(l), Number(r)) => compare(op, &to_int(*l), r),
        (Number(l), Boolean(r)) => compare(op, l, &to_int(*r)),
        (Number(l), Number(r)) => compare(op, l, r),
        (String(l), String(r)) => compare(op, l, r),
        // Other ground values only support (in)equality.
        _ if matches!(op, Eq | Neq) && left.is_ground() && right.is_ground() => {
            Ok((left == right) == (op == Eq))
        }
        _ => unsupported(format!("cannot compare: {}", context), context),
    }
}

fn binary_args(term: &Term, args: &[Term]) -> PolicyResult<(Term, Term)> {
    match args {
        [left, right] => Ok((left.clone(), right.clone())),
        _ => invalid_state(format!("wrong arity: {}", term)),
    }
}

/// A list's fixed elements, and the rest variable ending it if any.
fn split_rest(list: &[Term]) -> (&[Term], Option<&Term>) {
    match list.split_last() {
        Some((last, items)) if matches!(last.value(), Value::RestVariable(_)) => (items, Some(last)),
        _ => (list, None),
    }
}

#[derive(Clone)]
pub struct VirtualMachine {
    /// Stacks.
    pub goals: GoalStack,
    binding_manager: BindingManager,
    choices: Choices,
    pub queries: Queries,

    pub tracing: bool,
    pub trace_stack: TraceStack, // Stack of traces higher up the tree.
    pub trace: Vec<Rc<Trace>>,   // Traces for the current level of the trace tree.

    /// Error reported by the host for the outstanding call.
    pub external_error: Option<String>,

    /// Time spent inside `run`; waiting on the host does not count.
    query_start_time: Option<Instant>,
    elapsed: Duration,
    query_timeout_ms: u64,

    /// Maximum size of the goal and choice stacks.
    stack_limit: usize,

    /// Binding stack constant below here.
    csp: Bsp,

    pub debugger: Debugger,

    pub kb: Arc<RwLock<KnowledgeBase>>,

    /// Call ID -> result variable name table.
    call_id_symbols: HashMap<u64, Symbol>,

    /// Subclass questions waiting on the host, and the answers so far.
    pending_subclass: HashMap<u64, (Symbol, Symbol)>,
    subclass_cache: HashMap<(Symbol, Symbol), bool>,

    log_level: Option<LogLevel>,
    log_stderr: bool,
    trace_mute: bool,

    pub query_contains_partial: bool,
    accept_expression: bool,
    lenient: bool,
    strict: bool,

    /// Output messages.
    pub messages: MessageQueue,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        VirtualMachine::new(
            Arc::new(RwLock::new(KnowledgeBase::default())),
            QueryOptions::default(),
            vec![],
            // Messages will not be exposed, only use default() for testing.
            MessageQueue::new(),
        )
    }
}

// Methods which aren't goals/instructions.
impl VirtualMachine {
    /// A machine that will run `goals` in order. Timeout and logging
    /// settings come from `WRIT_TIMEOUT_MS` and `WRIT_LOG`.
    pub fn new(
        kb: Arc<RwLock<KnowledgeBase>>,
        options: QueryOptions,
        goals: Goals,
        messages: MessageQueue,
    ) -> Self {
        let query_timeout_ms = std::env::var("WRIT_TIMEOUT_MS")
            .ok()
            .and_then(|ms| ms.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let constants = kb
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .constants()
            .clone();

        let mut vm = Self {
            goals: GoalStack::new_reversed(goals),
            binding_manager: BindingManager::new(),
            query_start_time: None,
            elapsed: Duration::default(),
            query_timeout_ms,
            stack_limit: MAX_STACK_SIZE,
            csp: Bsp::default(),
            choices: vec![],
            queries: vec![],
            tracing: options.trace,
            trace_stack: vec![],
            trace: vec![],
            external_error: None,
            debugger: Debugger::default(),
            kb,
            call_id_symbols: HashMap::new(),
            pending_subclass: HashMap::new(),
            subclass_cache: HashMap::new(),
            log_level: None,
            log_stderr: false,
            trace_mute: false,
            query_contains_partial: false,
            accept_expression: options.accept_expression,
            lenient: options.lenient,
            strict: options.strict,
            messages,
        };
        vm.bind_constants(constants);
        vm.query_contains_partial();

        vm.set_logging_options(std::env::var("WRIT_LOG").ok());

        vm
    }

    /// Configure logging from a comma separated list of tokens: a level
    /// (`trace`, `debug`, `info`), `now` to print straight to stderr, and
    /// `off` or `0` to disable logging whatever else is set.
    pub fn set_logging_options(&mut self, writ_log: Option<String>) {
        let writ_log = writ_log.unwrap_or_default();
        let log_vars: HashSet<String> = writ_log
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_lowercase)
            .collect();

        self.log_stderr = log_vars.contains("now");

        let muted = log_vars.contains("off") || log_vars.contains("0");
        self.log_level = if log_vars.is_empty() || muted {
            None
        } else {
            let requested = |level: LogLevel| log_vars.contains(&level.to_string().to_lowercase());
            if requested(LogLevel::Trace) {
                Some(LogLevel::Trace)
            } else if requested(LogLevel::Debug) {
                Some(LogLevel::Debug)
            } else {
                Some(LogLevel::Info)
            }
        };
    }

    /// Recompute whether any pending query mentions a partial variable.
    /// Called again after the host binds variables.
    pub fn query_contains_partial(&mut self) {
        struct VarVisitor<'vm> {
            has_partial: bool,
            vm: &'vm VirtualMachine,
        }

        impl<'vm> Visitor for VarVisitor<'vm> {
            fn visit_variable(&mut self, v: &Symbol) {
                if matches!(self.vm.variable_state(v), VariableState::Partial(_)) {
                    self.has_partial = true;
                }
            }
        }

        let mut visitor = VarVisitor {
            has_partial: false,
            vm: self,
        };
        let has_partial = self.goals.iter().any(|goal| {
            if let Goal::Query { term } = goal.as_ref() {
                walk_term(&mut visitor, term);
                visitor.has_partial
            } else {
                false
            }
        });
        self.query_contains_partial = has_partial;
    }

    #[cfg(test)]
    pub fn new_test(kb: Arc<RwLock<KnowledgeBase>>, tracing: bool, goals: Goals) -> Self {
        let options = QueryOptions {
            trace: tracing,
            ..QueryOptions::default()
        };
        VirtualMachine::new(kb, options, goals, MessageQueue::new())
    }

    #[cfg(test)]
    fn set_stack_limit(&mut self, limit: usize) {
        self.stack_limit = limit;
    }

    fn kb(&self) -> RwLockReadGuard<'_, KnowledgeBase> {
        self.kb.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_id(&self) -> u64 {
        self.kb().new_id()
    }

    fn new_call_id(&mut self, symbol: &Symbol) -> u64 {
        let call_id = self.new_id();
        self.call_id_symbols.insert(call_id, symbol.clone());
        call_id
    }

    /// A fresh variable bound to `initial_value` that a host answer will
    /// overwrite, with the call id the answer comes back under.
    fn new_call_var(&mut self, var_prefix: &str, initial_value: Value) -> PolicyResult<(u64, Term)> {
        let sym = self.kb().gensym(var_prefix);
        self.bind(&sym, Term::from(initial_value))?;
        let call_id = self.new_call_id(&sym);
        Ok((call_id, Term::from(sym)))
    }

    fn get_call_sym(&self, call_id: u64) -> PolicyResult<&Symbol> {
        match self.call_id_symbols.get(&call_id) {
            Some(sym) => Ok(sym),
            None => invalid_state(format!("unregistered external call ID: {}", call_id)),
        }
    }

    /// Run one goal. Returns the event for the host when the goal needs an
    /// answer from it, and `QueryEvent::None` when it ran to completion.
    fn next(&mut self, goal: Rc<Goal>) -> PolicyResult<QueryEvent> {
        self.log(LogLevel::Trace, || goal.to_string(), &[]);
        self.check_timeout()?;

        match goal.as_ref() {
            // Goals that hand control to the host or end the run.
            Goal::Halt => return Ok(self.halt()),
            Goal::Error { error } => return Err(error.clone()),
            Goal::Debug { message } => return Ok(self.debug(message)),
            Goal::CheckError => return self.check_error(),
            Goal::Query { term } => {
                let event = self.query(term);
                self.maybe_break(DebugEvent::Query)?;
                return event;
            }
            Goal::LookupExternal {
                call_id,
                instance,
                field,
            } => return self.lookup_external(*call_id, instance, field),
            Goal::NextExternal { call_id, iterable } => {
                return self.next_external(*call_id, iterable)
            }
            Goal::MakeExternal {
                constructor,
                instance_id,
            } => return Ok(self.make_external(constructor, *instance_id)),
            Goal::IsaExternal { instance, literal } => return self.isa_external(instance, literal),
            Goal::IsSubclass { left, right } => return self.is_subclass(left, right),
            Goal::IsaWithPath {
                base_tag,
                path,
                class_tag,
            } => return self.isa_with_path(base_tag, path, class_tag),

            // Goals the machine finishes on its own.
            Goal::Noop => {}
            Goal::Backtrack => self.backtrack()?,
            Goal::Cut { choice_index } => self.cut(*choice_index),
            Goal::PopQuery { .. } => self.pop_query(),
            Goal::Unify { left, right } => self.unify(left, right)?,
            Goal::Isa { left, right } => self.isa(left, right)?,
            Goal::Lookup { dict, field, value } => self.lookup(dict, field, value)?,
            Goal::AddConstraint { term } => self.add_constraint(term)?,
            Goal::FilterRules {
                applicable_rules,
                unfiltered_rules,
                args,
            } => self.filter_rules(applicable_rules, unfiltered_rules, args)?,
            Goal::SortRules {
                rules,
                outer,
                inner,
                args,
            } => self.sort_rules(rules, args, *outer, *inner)?,
            Goal::IsMoreSpecific { left, right, args } => {
                self.is_more_specific(left, right, args)?
            }
            Goal::TraceStackPush => self.open_trace_level(),
            Goal::TraceStackPop => self.close_trace_level()?,
            Goal::TraceRule { trace } => self.record_rule_trace(trace)?,
        }
        Ok(QueryEvent::None)
    }

    /// Start collecting traces one level further down the tree.
    fn open_trace_level(&mut self) {
        let parent = std::mem::take(&mut self.trace);
        self.trace_stack.push(Rc::new(parent));
    }

    /// Attach the traces of the finished level to their parent node.
    fn close_trace_level(&mut self) -> PolicyResult<()> {
        let mut children = std::mem::take(&mut self.trace);
        self.trace = match self.trace_stack.pop() {
            Some(parent) => parent.as_ref().clone(),
            None => vec![],
        };
        let mut parent = match self.trace.pop() {
            Some(parent) => parent,
            None => return invalid_state("trace stack underflow"),
        };
        Rc::make_mut(&mut parent).children.append(&mut children);
        self.trace.push(parent);
        self.maybe_break(DebugEvent::Pop)?;
        Ok(())
    }

    fn record_rule_trace(&mut self, trace: &Rc<Trace>) -> PolicyResult<()> {
        if let Node::Rule(rule) = &trace.node {
            self.log(LogLevel::Info, || format!("RULE: {}", rule), &[]);
        }
        self.trace.push(trace.clone());
        self.maybe_break(DebugEvent::Rule)?;
        Ok(())
    }

    fn check_stack_size(&self, size: usize, what: &str) -> PolicyResult<()> {
        if size < self.stack_limit {
            return Ok(());
        }
        Err(RuntimeError::StackOverflow {
            msg: format!("{} stack overflow: the limit is {}", what, self.stack_limit),
        }
        .into())
    }

    /// Push a goal onto the goal stack.
    pub fn push_goal(&mut self, goal: Goal) -> PolicyResult<()> {
        self.check_stack_size(self.goals.len(), "Goal")?;
        match &goal {
            // The answer to a host call lands in a fresh variable.
            Goal::LookupExternal { call_id, .. } | Goal::NextExternal { call_id, .. } => {
                let answer = self.get_call_sym(*call_id)?;
                if self.variable_state(answer) != VariableState::Unbound {
                    return invalid_state(format!(
                        "the answer variable {} for call {} is already bound",
                        answer, call_id
                    ));
                }
            }
            _ => {}
        }
        self.goals.push(Rc::new(goal));
        Ok(())
    }

    /// Save the current state together with `alternatives`, to be tried
    /// in order when the machine backtracks to this point. The goal stack
    /// is left alone; see `choose` to run the first alternative now.
    fn push_choice<I>(&mut self, alternatives: I) -> PolicyResult<()>
    where
        I: IntoIterator<Item = Goals>,
        I::IntoIter: std::iter::DoubleEndedIterator,
    {
        self.check_stack_size(self.choices.len(), "Choice")?;
        // Alternatives are popped off the end, so the first goes last.
        let alternatives: Vec<GoalStack> = alternatives
            .into_iter()
            .rev()
            .map(GoalStack::new_reversed)
            .collect();
        let choice = Choice {
            alternatives,
            bsp: self.bsp(),
            goals: self.goals.clone(),
            queries: self.queries.clone(),
            trace: self.trace.clone(),
            trace_stack: self.trace_stack.clone(),
        };
        self.choices.push(choice);
        Ok(())
    }

    /// Run the first of `alternatives` now, keeping the others for
    /// backtracking. No alternatives at all is a failure.
    fn choose<I>(&mut self, alternatives: I) -> PolicyResult<()>
    where
        I: IntoIterator<Item = Goals>,
        I::IntoIter: std::iter::DoubleEndedIterator,
    {
        let mut alternatives = alternatives.into_iter();
        match alternatives.next() {
            None => self.backtrack(),
            Some(first) => {
                self.push_choice(alternatives)?;
                self.append_goals(first)
            }
        }
    }

    /// If-then-else: run `consequent` when every goal of `conditional`
    /// succeeds, and `alternative` otherwise.
    ///
    /// Both branches start from a backtrack, so nothing `conditional` bound
    /// survives into them.
    fn choose_conditional(
        &mut self,
        mut conditional: Goals,
        consequent: Goals,
        mut alternative: Goals,
    ) -> PolicyResult<()> {
        let consequent_choice = self.choices.len();
        self.push_choice(vec![consequent])?;
        let alternative_choice = self.choices.len();

        // Success drops the alternative and falls back into the consequent.
        conditional.push(Goal::Cut {
            choice_index: alternative_choice,
        });
        conditional.push(Goal::Backtrack);
        // Failure drops the consequent before taking the alternative.
        alternative.insert(
            0,
            Goal::Cut {
                choice_index: consequent_choice,
            },
        );

        self.choose(vec![conditional, alternative])
    }

    /// Push multiple goals onto the stack in reverse order.
    fn append_goals<I>(&mut self, goals: I) -> PolicyResult<()>
    where
        I: IntoIterator<Item = Goal>,
        I::IntoIter: std::iter::DoubleEndedIterator,
    {
        goals.into_iter().rev().try_for_each(|g| self.push_goal(g))
    }

    /// Push a binding onto the binding stack. Binding a constrained
    /// variable re-checks its constraints against the new value.
    pub fn bind(&mut self, var: &Symbol, val: Term) -> PolicyResult<()> {
        self.log(
            LogLevel::Trace,
            || format!("⇒ bind: {} ← {}", var, val),
            &[],
        );
        if let Some(constraints) = self.binding_manager.bind(var, val)? {
            self.push_goal(Goal::Query { term: constraints })
        } else {
            Ok(())
        }
    }

    /// Add a single constraint operation to the variables referenced in it.
    fn add_constraint(&mut self, term: &Term) -> PolicyResult<()> {
        let negated = self.queries.iter().any(|query| {
            matches!(
                query.value(),
                Value::Expression(Operation {
                    operator: Operator::Not,
                    ..
                })
            )
        });
        if negated {
            return unsupported("cannot use `not` with partial evaluation", term);
        }
        self.log(
            LogLevel::Trace,
            || format!("⇒ add_constraint: {}", term),
            &[],
        );
        self.binding_manager.add_constraint(term)
    }

    /// Augment the bindings stack with constants from a hash map.
    /// There must be no temporaries bound yet.
    fn bind_constants(&mut self, bindings: Bindings) {
        for (var, value) in bindings {
            // A fresh table cannot hold a conflicting binding.
            let _ = self.binding_manager.bind(&var, value);
        }
        self.csp = self.bsp();
    }

    /// Retrieve the current non-constant bindings as a hash map.
    pub fn bindings(&self, include_temps: bool) -> Bindings {
        self.binding_manager
            .bindings_after(include_temps, self.csp)
    }

    /// Returns bindings for all vars used by terms in terms.
    pub fn relevant_bindings(&self, terms: &[&Term]) -> Bindings {
        let mut variables = HashSet::new();
        for t in terms {
            t.variables(&mut variables);
        }
        self.binding_manager.variable_bindings(&variables)
    }

    /// Return the current binding stack pointer.
    fn bsp(&self) -> Bsp {
        self.binding_manager.bsp()
    }

    pub fn variable_state(&self, variable: &Symbol) -> VariableState {
        self.binding_manager.variable_state(variable)
    }

    /// Recursively dereference variables in a term, including subterms.
    pub fn deref(&self, term: &Term) -> Term {
        self.binding_manager.deep_deref(term)
    }

    /// Generate a fresh set of variables for a rule.
    fn rename_rule_vars(&self, rule: &Rule) -> Rule {
        let kb = self.kb();
        let mut renamer = Renamer::new(&kb);
        renamer.fold_rule(rule.clone())
    }

    /// Push or print a message to the output stream.
    fn print<S: Into<String>>(&self, message: S) {
        let message = message.into();
        if self.log_stderr {
            eprintln!("{}", message);
        } else {
            self.messages.push(MessageKind::Print, message);
        }
    }

    fn log<F, R>(&self, level: LogLevel, message_fn: F, terms: &[&Term])
    where
        F: FnOnce() -> R,
        R: AsRef<str>,
    {
        let configured = match self.log_level {
            Some(configured) if configured.should_print_on_level(level) => configured,
            _ => return,
        };
        // Rule applicability checks are noise at TRACE.
        if level == LogLevel::Trace && self.trace_mute {
            return;
        }

        let prefix = format!("[writ][{}] {}", level, "  ".repeat(self.queries.len() + 1));
        let message = message_fn();
        let mut lines = message.as_ref().split('\n');
        let mut head = match lines.next() {
            Some(line) => format!("{}{}", prefix, line),
            None => return,
        };
        if configured == LogLevel::Trace && !terms.is_empty() {
            let bindings = self
                .relevant_bindings(terms)
                .iter()
                .map(|(var, val)| format!("{} => {}", var.0, val))
                .collect::<Vec<_>>();
            let _ = write!(head, ", BINDINGS: {{{}}}", bindings.join(", "));
        }
        self.print(head);
        for line in lines {
            self.print(format!("{}{}", prefix, line));
        }
    }

    /// The chain of queries that led to the current goal, oldest first,
    /// for error messages.
    pub(crate) fn stack_trace(&self) -> String {
        let mut path = vec![];
        let mut level: &[Rc<Trace>] = &self.trace;
        let mut parents = self.trace_stack.iter().rev();
        while let Some(node) = level.last() {
            path.push(node.clone());
            level = parents.next().map(|parent| parent.as_slice()).unwrap_or(&[]);
        }
        path.reverse();

        // Only queries are numbered; rules give the context they ran in.
        let mut remaining = path.iter().filter(|node| node.term().is_some()).count();
        let mut out = "trace (most recent evaluation last):\n".to_owned();
        let mut rule = None;
        for node in &path {
            let term = match &node.node {
                Node::Rule(r) => {
                    rule = Some(r.clone());
                    continue;
                }
                Node::Term(term) => term,
            };
            if matches!(term.value(), Value::Expression(Operation { operator: Operator::And, args }) if args.len() == 1)
            {
                continue;
            }

            remaining = remaining.saturating_sub(1);
            let _ = writeln!(out, "  {:03}: {}", remaining, term_source(term, false));
            if term.source_info.span().is_some() {
                let context = match &rule {
                    Some(rule) => format!("    in rule {}", rule.name),
                    None => "    in query".to_owned(),
                };
                let _ = writeln!(out, "{}{}", context, source_position(term));
            }
        }
        out
    }

    fn query_duration(&self) -> Duration {
        let running = self
            .query_start_time
            .map(|start| start.elapsed())
            .unwrap_or_default();
        self.elapsed + running
    }

    /// Stop the clock while control is with the host.
    fn pause_timer(&mut self) {
        if let Some(start) = self.query_start_time.take() {
            self.elapsed += start.elapsed();
        }
    }

    fn is_query_timeout_disabled(&self) -> bool {
        self.query_timeout_ms == 0
    }

    fn check_timeout(&self) -> PolicyResult<()> {
        if self.is_query_timeout_disabled() {
            return Ok(());
        }

        let elapsed = self.query_duration().as_millis();
        let timeout = u128::from(self.query_timeout_ms);
        if elapsed > timeout {
            let msg = format!(
                "Query running for {}ms, which exceeds the timeout of {}ms. To disable timeouts, set the WRIT_TIMEOUT_MS environment variable to 0.",
                elapsed, timeout
            );
            return Err(RuntimeError::QueryTimeout { msg }.into());
        }
        Ok(())
    }
}

/// Implementations of instructions.
impl VirtualMachine {
    /// Unwind to the most recent choice that still has an alternative
    /// and start on it. Halts once every choice is used up.
    fn backtrack(&mut self) -> PolicyResult<()> {
        self.log(LogLevel::Trace, || "BACKTRACK", &[]);

        while let Some(mut choice) = self.choices.pop() {
            self.binding_manager.backtrack(choice.bsp);
            let mut alternative = match choice.alternatives.pop() {
                Some(alternative) => alternative,
                None => continue,
            };

            if choice.alternatives.is_empty() {
                // Last alternative: the saved state can be moved out.
                let Choice {
                    goals,
                    queries,
                    trace,
                    trace_stack,
                    ..
                } = choice;
                self.goals = goals;
                self.queries = queries;
                self.trace = trace;
                self.trace_stack = trace_stack;
            } else {
                self.goals.clone_from(&choice.goals);
                self.queries.clone_from(&choice.queries);
                self.trace.clone_from(&choice.trace);
                self.trace_stack.clone_from(&choice.trace_stack);
                self.choices.push(choice);
            }
            self.goals.append(&mut alternative);
            return Ok(());
        }
        self.push_goal(Goal::Halt)
    }

    /// Drop every choice from `index` up, committing to the branch taken.
    fn cut(&mut self, index: usize) {
        self.choices.truncate(index);
    }

    fn pop_query(&mut self) {
        self.queries.pop();
    }

    fn debug(&mut self, message: &str) -> QueryEvent {
        QueryEvent::Debug {
            message: message.to_owned(),
        }
    }

    /// Stop: nothing is left to run and nothing to backtrack to. Bindings
    /// made outside any choice are undone too, leaving only constants.
    fn halt(&mut self) -> QueryEvent {
        self.log(LogLevel::Trace, || "HALT", &[]);
        self.choices.clear();
        self.goals.clear();
        self.binding_manager.backtrack(self.csp);
        QueryEvent::Done { result: true }
    }

    /// `left matches right`. Like unification, except that a pattern on
    /// the right only constrains what it names.
    fn isa(&mut self, left: &Term, right: &Term) -> PolicyResult<()> {
        self.log(
            LogLevel::Trace,
            || format!("MATCHES: {} matches {}", left, right),
            &[left, right],
        );

        match (left.value(), right.value()) {
            (_, Value::Dictionary(_)) => {
                return unsupported(format!("cannot match against a dictionary: {}", right), right)
            }
            (Value::Expression(_), _) | (_, Value::Expression(_)) => {
                return invalid_state(format!("isa on an expression: {} matches {}", left, right))
            }

            (Value::Variable(l) | Value::RestVariable(l), _) => match self.variable_state(l) {
                VariableState::Bound(value) => self.push_goal(Goal::Isa {
                    left: value,
                    right: right.clone(),
                })?,
                _ => self.isa_expr(left, right)?,
            },

            (_, Value::Variable(r) | Value::RestVariable(r)) => match self.variable_state(r) {
                VariableState::Bound(value) => self.push_goal(Goal::Isa {
                    left: left.clone(),
                    right: value,
                })?,
                _ => self.push_goal(Goal::Unify {
                    left: left.clone(),
                    right: right.clone(),
                })?,
            },

            (Value::List(left), Value::List(right)) => {
                self.unify_lists(left, right, |(left, right)| Goal::Isa {
                    left: left.clone(),
                    right: right.clone(),
                })?;
            }

            // Every field the pattern names must be present and match.
            (Value::Dictionary(dict), Value::Pattern(Pattern::Dictionary(pattern))) => {
                let mut goals = Vec::with_capacity(pattern.fields.len());
                for (key, wanted) in &pattern.fields {
                    match dict.fields.get(key) {
                        Some(found) => goals.push(Goal::Isa {
                            left: found.clone(),
                            right: wanted.clone(),
                        }),
                        None => return self.push_goal(Goal::Backtrack),
                    }
                }
                self.append_goals(goals)?;
            }

            // Other built-in values have no fields, so only `{}` matches them.
            (value, Value::Pattern(Pattern::Dictionary(pattern)))
                if !matches!(value, Value::ExternalInstance(_)) =>
            {
                if !pattern.fields.is_empty() {
                    self.push_goal(Goal::Backtrack)?;
                }
            }

            // Instance fields come from the host, one lookup per field.
            (_, Value::Pattern(Pattern::Dictionary(pattern))) => {
                for (key, wanted) in &pattern.fields {
                    let answer = self.kb().gensym("isa_value");
                    let call_id = self.new_call_id(&answer);
                    self.append_goals(vec![
                        Goal::LookupExternal {
                            call_id,
                            instance: left.clone(),
                            field: wanted.clone_with_value(Value::String(key.0.clone())),
                        },
                        Goal::Isa {
                            left: Term::from(answer),
                            right: wanted.clone(),
                        },
                    ])?;
                }
            }

            (_, Value::Pattern(Pattern::Instance(right_literal))) => {
                // Check the fields after the class.
                if !right_literal.fields.is_empty() {
                    self.push_goal(Goal::Isa {
                        left: left.clone(),
                        right: right.clone_with_value(Value::Pattern(Pattern::Dictionary(
                            right_literal.fields.clone(),
                        ))),
                    })?;
                }

                let tag = &right_literal.tag;
                match left.value() {
                    Value::ExternalInstance(ExternalInstance { class_repr, .. }) => {
                        let known = class_repr
                            .as_ref()
                            .and_then(|class| self.known_subclass(&Symbol::new(class), tag));
                        match known {
                            Some(true) => {}
                            Some(false) => self.push_goal(Goal::Backtrack)?,
                            None => self.push_goal(Goal::IsaExternal {
                                instance: left.clone(),
                                literal: right_literal.clone(),
                            })?,
                        }
                    }
                    value => {
                        // A built-in value is never an instance of a host class.
                        let builtin = value.builtin_class().map(Symbol::new);
                        let matched = builtin
                            .and_then(|class| self.kb().is_subclass(&class, tag))
                            .unwrap_or(false);
                        if !matched {
                            self.push_goal(Goal::Backtrack)?;
                        }
                    }
                }
            }

            // Default case: x isa y if x = y.
            _ => self.push_goal(Goal::Unify {
                left: left.clone(),
                right: right.clone(),
            })?,
        }
        Ok(())
    }

    /// `left matches right` for an unbound or constrained `left`: record the
    /// match as constraints.
    fn isa_expr(&mut self, left: &Term, right: &Term) -> PolicyResult<()> {
        match right.value() {
            Value::Pattern(Pattern::Dictionary(fields)) => {
                let goals = fields
                    .fields
                    .iter()
                    .map(|(field, value)| {
                        let dot = op!(Dot, left.clone(), term!(field.0.clone()));
                        Goal::AddConstraint {
                            term: Term::from(op!(Unify, Term::from(dot), value.clone())),
                        }
                    })
                    .collect::<Vec<_>>();
                self.append_goals(goals)
            }
            Value::Pattern(Pattern::Instance(InstanceLiteral { tag, fields })) => {
                let var = left.as_symbol()?.clone();
                let mut goals = vec![];

                let existing = self.isa_tags(&var);
                if !existing.contains(tag) {
                    goals.push(Goal::AddConstraint {
                        term: left.clone_with_value(Value::Expression(op!(
                            Isa,
                            left.clone(),
                            right.clone_with_value(Value::Pattern(Pattern::instance(&tag.0)))
                        ))),
                    });
                }
                goals.extend(fields.fields.iter().map(|(field, value)| {
                    let dot = op!(Dot, left.clone(), term!(field.0.clone()));
                    Goal::AddConstraint {
                        term: Term::from(op!(Unify, Term::from(dot), value.clone())),
                    }
                }));

                match existing.last() {
                    // The classes must be related one way or the other.
                    Some(previous) if previous != tag => {
                        let narrower = Goal::IsSubclass {
                            left: tag.clone(),
                            right: previous.clone(),
                        };
                        let wider = Goal::IsSubclass {
                            left: previous.clone(),
                            right: tag.clone(),
                        };
                        let mut alternative = vec![wider];
                        alternative.extend(goals.iter().cloned());
                        self.choose_conditional(vec![narrower], goals, alternative)
                    }
                    Some(_) => self.append_goals(goals),
                    None => {
                        if let Some((base_tag, path)) = self.path_to(&var) {
                            goals.insert(
                                0,
                                Goal::IsaWithPath {
                                    base_tag,
                                    path,
                                    class_tag: tag.clone(),
                                },
                            );
                        }
                        self.append_goals(goals)
                    }
                }
            }
            _ => self.push_goal(Goal::Unify {
                left: left.clone(),
                right: right.clone(),
            }),
        }
    }

    /// Class tags `var` has already been constrained to match, oldest first.
    fn isa_tags(&self, var: &Symbol) -> Vec<Symbol> {
        let root = self.binding_manager.root(var);
        let mut tags = vec![];
        for constraint in self.binding_manager.get_constraints(&root).args {
            if let Value::Expression(Operation {
                operator: Operator::Isa,
                args,
            }) = constraint.value()
            {
                if let [subject, pattern] = &args[..] {
                    let same_var = matches!(subject.value(),
                        Value::Variable(v) if self.binding_manager.root(v) == root);
                    if let (true, Value::Pattern(Pattern::Instance(literal))) =
                        (same_var, pattern.value())
                    {
                        if !tags.contains(&literal.tag) {
                            tags.push(literal.tag.clone());
                        }
                    }
                }
            }
        }
        tags
    }

    /// If `var` was looked up as `base.f1.f2...` from a variable with a
    /// known class, that class and the field path.
    fn path_to(&self, var: &Symbol) -> Option<(Symbol, TermList)> {
        let mut path = vec![];
        let mut current = self.binding_manager.root(var);
        // Paths longer than this are not worth checking up front.
        for _ in 0..8 {
            let source = self
                .binding_manager
                .get_constraints(&current)
                .args
                .into_iter()
                .find_map(|constraint| match constraint.value() {
                    Value::Expression(Operation {
                        operator: Operator::Unify,
                        args,
                    }) if args.len() == 2 => {
                        let (value, dot) = (&args[0], &args[1]);
                        let is_current = matches!(value.value(),
                            Value::Variable(v) if self.binding_manager.root(v) == current);
                        match dot.value() {
                            Value::Expression(Operation {
                                operator: Operator::Dot,
                                args,
                            }) if is_current && args.len() == 2 => match (args[0].value(), args[1].value()) {
                                (Value::Variable(object), Value::String(_)) => {
                                    Some((self.binding_manager.root(object), args[1].clone()))
                                }
                                _ => None,
                            },
                            _ => None,
                        }
                    }
                    _ => None,
                })?;
            let (object, field) = source;
            path.insert(0, field);
            if let Some(tag) = self.isa_tags(&object).last() {
                return Some((tag.clone(), path));
            }
            current = object;
        }
        None
    }

    /// Whether class `left` is `right` or a subclass of it, if known without
    /// asking the host.
    fn known_subclass(&self, left: &Symbol, right: &Symbol) -> Option<bool> {
        self.kb().is_subclass(left, right).or_else(|| {
            self.subclass_cache
                .get(&(left.clone(), right.clone()))
                .copied()
        })
    }

    fn is_subclass(&mut self, left: &Symbol, right: &Symbol) -> PolicyResult<QueryEvent> {
        match self.known_subclass(left, right) {
            Some(true) => Ok(QueryEvent::None),
            Some(false) => {
                self.push_goal(Goal::Backtrack)?;
                Ok(QueryEvent::None)
            }
            None => {
                let (call_id, answer) = self.new_call_var("is_subclass", Value::Boolean(false))?;
                self.pending_subclass
                    .insert(call_id, (left.clone(), right.clone()));
                self.push_goal(Goal::Unify {
                    left: answer,
                    right: Term::from(true),
                })?;
                Ok(QueryEvent::ExternalIsSubclass {
                    call_id,
                    left_class_tag: left.clone(),
                    right_class_tag: right.clone(),
                })
            }
        }
    }

    fn isa_with_path(
        &mut self,
        base_tag: &Symbol,
        path: &[Term],
        class_tag: &Symbol,
    ) -> PolicyResult<QueryEvent> {
        let resolved = {
            let kb = self.kb();
            path.iter().try_fold(base_tag.clone(), |class, field| {
                let field = match field.value() {
                    Value::String(field) => Symbol::new(field),
                    _ => return None,
                };
                kb.field_type(&class, &field)
                    .map(|field_type| Symbol::new(field_type.class_tag()))
            })
        };

        match resolved {
            Some(tag) => {
                self.push_goal(Goal::IsSubclass {
                    left: tag,
                    right: class_tag.clone(),
                })?;
                Ok(QueryEvent::None)
            }
            None => {
                let (call_id, answer) = self.new_call_var("isa_with_path", Value::Boolean(false))?;
                self.push_goal(Goal::Unify {
                    left: answer,
                    right: Term::from(true),
                })?;
                Ok(QueryEvent::ExternalIsaWithPath {
                    call_id,
                    base_tag: base_tag.clone(),
                    path: path.to_vec(),
                    class_tag: class_tag.clone(),
                })
            }
        }
    }

    /// Match `field` of `dict` against `value`. An unbound field name
    /// tries every key in turn.
    pub fn lookup(&mut self, dict: &Dictionary, field: &Term, value: &Term) -> PolicyResult<()> {
        let field = self.deref(field);
        match field.value() {
            Value::String(name) => match dict.fields.get(&Symbol(name.clone())) {
                Some(found) => self.push_goal(Goal::Unify {
                    left: found.clone(),
                    right: value.clone(),
                }),
                None => self.push_goal(Goal::Backtrack),
            },
            // A partial field name picks up a constraint per key.
            Value::Variable(_) => {
                let alternatives = dict
                    .fields
                    .iter()
                    .map(|(key, entry)| {
                        vec![
                            Goal::Unify {
                                left: field.clone(),
                                right: Term::from(Value::String(key.0.clone())),
                            },
                            Goal::Unify {
                                left: entry.clone(),
                                right: value.clone(),
                            },
                        ]
                    })
                    .collect::<Vec<Goals>>();
                self.choose(alternatives)
            }
            other => self.type_error(
                &field,
                format!("cannot look up field {:?} on a dictionary", other),
            ),
        }
    }

    /// Ask the host for an attribute of `instance`, or the result of
    /// calling a method on it.
    pub fn lookup_external(
        &mut self,
        call_id: u64,
        instance: &Term,
        field: &Term,
    ) -> PolicyResult<QueryEvent> {
        let (attribute, args, kwargs) = match self.deref(field).value() {
            Value::String(name) => (Symbol(name.clone()), None, None),
            Value::Call(Call { name, args, kwargs }) => {
                let args: Vec<Term> = args.iter().map(|arg| self.deref(arg)).collect();
                let kwargs: Option<BTreeMap<Symbol, Term>> = kwargs.as_ref().map(|kwargs| {
                    kwargs
                        .iter()
                        .map(|(key, arg)| (key.clone(), self.deref(arg)))
                        .collect()
                });
                (name.clone(), Some(args), kwargs)
            }
            other => {
                return self.type_error(
                    field,
                    format!("cannot look up field {:?} on an external instance", other),
                )
            }
        };

        // Lookups answer once. The empty choice is what a missing answer
        // backtracks through.
        self.push_choice(vec![])?;

        self.log(
            LogLevel::Trace,
            || {
                let positional = args.iter().flatten().map(|arg| arg.to_policy());
                let keyword = kwargs
                    .iter()
                    .flatten()
                    .map(|(key, arg)| format!("{}: {}", key, arg.to_policy()));
                let rendered = positional.chain(keyword).collect::<Vec<_>>();
                format!("LOOKUP: {}.{}({})", instance, attribute, rendered.join(", "))
            },
            &[],
        );

        Ok(QueryEvent::ExternalCall {
            call_id,
            instance: self.deref(instance),
            attribute,
            args,
            kwargs,
        })
    }

    pub fn isa_external(
        &mut self,
        instance: &Term,
        literal: &InstanceLiteral,
    ) -> PolicyResult<QueryEvent> {
        let (call_id, answer) = self.new_call_var("isa", Value::Boolean(false))?;
        self.push_goal(Goal::Unify {
            left: answer,
            right: Term::from(true),
        })?;

        Ok(QueryEvent::ExternalIsa {
            call_id,
            instance: self.deref(instance),
            class_tag: literal.tag.clone(),
        })
    }

    /// Ask the host for the next element of `iterable`. The choice pushed
    /// here asks again on backtrack, until the host reports no more.
    fn next_external(&mut self, call_id: u64, iterable: &Term) -> PolicyResult<QueryEvent> {
        self.push_choice(vec![vec![Goal::NextExternal {
            call_id,
            iterable: iterable.clone(),
        }]])?;

        Ok(QueryEvent::NextExternal {
            call_id,
            iterable: iterable.clone(),
        })
    }

    fn make_external(&self, constructor: &Term, instance_id: u64) -> QueryEvent {
        QueryEvent::MakeExternal {
            instance_id,
            constructor: self.deref(constructor),
        }
    }

    /// Surface an error the host reported for the last external call. In
    /// strict mode it aborts the query; otherwise it becomes a warning and
    /// the current branch fails.
    fn check_error(&mut self) -> PolicyResult<QueryEvent> {
        if let Some(msg) = self.external_error.take() {
            if self.strict {
                let stack_trace = Some(self.stack_trace());
                let error = PolicyError::from(RuntimeError::Application { msg, stack_trace });
                return Err(match self.trace.last().map(|t| t.node.clone()) {
                    Some(Node::Term(term)) => error.with_term(&term),
                    _ => error,
                });
            }
            self.messages
                .push(MessageKind::Warning, format!("Application error: {}", msg));
            self.push_goal(Goal::Backtrack)?;
        }
        Ok(QueryEvent::None)
    }

    fn log_query(&self, term: &Term) {
        match term.value() {
            Value::Call(predicate) => self.log(
                LogLevel::Info,
                || format!("QUERY RULE: {}", predicate.to_policy()),
                &[term],
            ),
            // Single-clause bodies are logged through their clause.
            Value::Expression(Operation {
                operator: Operator::And,
                args,
            }) if args.len() < 2 => {}
            _ => self.log(LogLevel::Trace, || format!("QUERY: {}", term), &[term]),
        }
    }

    /// Prove `term`. Predicates go through the rules in the knowledge
    /// base, operators through their own handlers.
    fn query(&mut self, term: &Term) -> PolicyResult<QueryEvent> {
        self.log_query(term);
        self.queries.push(term.clone());
        self.push_goal(Goal::PopQuery { term: term.clone() })?;
        self.trace.push(Rc::new(Trace {
            node: Node::Term(term.clone()),
            children: vec![],
        }));

        match term.value() {
            Value::Expression(_) => return self.query_for_operation(term),
            Value::Call(predicate) => self.query_for_predicate(predicate.clone())?,
            Value::Boolean(true) => {}
            Value::Boolean(false) => self.push_goal(Goal::Backtrack)?,
            Value::Variable(var) => {
                let goal = match self.variable_state(var) {
                    VariableState::Bound(bound) => Goal::Query { term: bound },
                    // An unbound variable used as a condition must be true.
                    _ => Goal::Unify {
                        left: term.clone(),
                        right: Term::from(true),
                    },
                };
                self.push_goal(goal)?
            }
            _ => {
                return self.type_error(
                    term,
                    format!(
                        "{} isn't something that is true or false so can't be a condition",
                        term
                    ),
                )
            }
        }
        Ok(QueryEvent::None)
    }

    /// Run the rules that may apply to `predicate`, most specific first.
    fn query_for_predicate(&mut self, predicate: Call) -> PolicyResult<()> {
        if predicate.kwargs.is_some() {
            return invalid_state(format!(
                "query_for_predicate: unexpected kwargs: {}",
                predicate.to_policy()
            ));
        }
        let arity = predicate.args.len();
        let candidates = {
            let kb = self.kb();
            kb.get_generic_rule(&predicate.name, arity).map(|generic| {
                let args: Vec<Term> = predicate.args.iter().map(|arg| self.deref(arg)).collect();
                generic.get_applicable_rules(&args)
            })
        };

        let candidates = match candidates {
            Some(rules) => rules,
            None => {
                if !self.lenient && !OPTIONAL_RULES.contains(&predicate.name.0.as_str()) {
                    return Err(RuntimeError::QueryForUndefinedRule {
                        name: predicate.name.0.clone(),
                        arity,
                    }
                    .into());
                }
                self.log(
                    LogLevel::Info,
                    || format!("No rules named {}/{}", predicate.name, arity),
                    &[],
                );
                return self.push_goal(Goal::Backtrack);
            }
        };

        self.trace_mute = true;
        self.append_goals(vec![
            Goal::TraceStackPush,
            Goal::FilterRules {
                applicable_rules: vec![],
                unfiltered_rules: candidates,
                args: predicate.args,
            },
            Goal::TraceStackPop,
        ])
    }

    fn query_for_operation(&mut self, term: &Term) -> PolicyResult<QueryEvent> {
        let operation = term.value().as_expression()?;
        let args = operation.args.clone();
        match operation.operator {
            Operator::And => {
                // Conjuncts run in order, one trace level down.
                self.push_goal(Goal::TraceStackPop)?;
                self.append_goals(args.into_iter().map(|term| Goal::Query { term }))?;
                self.push_goal(Goal::TraceStackPush)?;
            }
            Operator::Or => {
                self.choose(args.into_iter().map(|term| vec![Goal::Query { term }]))?;
            }
            Operator::Not => {
                let negated = match &args[..] {
                    [negated] => negated.clone(),
                    _ => return invalid_state(format!("wrong arity: {}", term)),
                };
                // Fail if the negated query succeeds, succeed otherwise.
                self.choose_conditional(
                    vec![Goal::Query { term: negated }],
                    vec![Goal::Backtrack],
                    vec![],
                )?;
            }
            Operator::Assign => self.query_assign(term, &args)?,
            Operator::Unify => {
                let (left, right) = binary_args(term, &args)?;
                self.push_goal(Goal::Unify { left, right })?
            }
            Operator::Isa => {
                let (left, right) = binary_args(term, &args)?;
                self.push_goal(Goal::Isa { left, right })?
            }
            Operator::Dot => return self.query_op_helper(term, Self::dot_op_helper, false, false),
            Operator::In => return self.query_op_helper(term, Self::in_op_helper, false, true),
            Operator::Lt
            | Operator::Gt
            | Operator::Leq
            | Operator::Geq
            | Operator::Eq
            | Operator::Neq => {
                return self.query_op_helper(term, Self::comparison_op_helper, true, true)
            }
            Operator::Add
            | Operator::Sub
            | Operator::Mul
            | Operator::Div
            | Operator::Mod
            | Operator::Rem => {
                return self.query_op_helper(term, Self::arithmetic_op_helper, true, true)
            }
            Operator::Debug => {
                let message = match self.debugger.break_msg(self) {
                    Some(message) => message,
                    None => format!("debug({})", self.render_args(&args)),
                };
                self.push_goal(Goal::Debug { message })?;
            }
            Operator::Print => self.print(self.render_args(&args)),
            Operator::New => self.query_new(term, &args)?,
            Operator::Cut => {
                if self.query_contains_partial {
                    return unsupported("cannot use cut with partial evaluation", term);
                }
                let choice_index = self.cut_point();
                self.push_goal(Goal::Cut { choice_index })?;
            }
            Operator::ForAll => {
                let (condition, action) = binary_args(term, &args)?;
                let expr = |operator: Operator, args: Vec<Term>| {
                    term.clone_with_value(Value::Expression(Operation { operator, args }))
                };
                // forall(c, a) holds when `c and not a` has no answer.
                let counterexample = expr(
                    Operator::And,
                    vec![condition, expr(Operator::Not, vec![action])],
                );
                self.push_goal(Goal::Query {
                    term: expr(Operator::Not, vec![counterexample]),
                })?;
            }
        }
        Ok(QueryEvent::None)
    }

    fn render_args(&self, args: &[Term]) -> String {
        args.iter()
            .map(|arg| self.deref(arg).to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `x := value` binds `x`, which must not be bound yet.
    fn query_assign(&mut self, term: &Term, args: &[Term]) -> PolicyResult<()> {
        let (left, right) = binary_args(term, args)?;
        let var = match left.value() {
            Value::Variable(var) => var,
            _ => return self.type_error(&left, format!("Cannot assign to type {}.", left)),
        };
        if self.variable_state(var) != VariableState::Unbound {
            return self.type_error(
                &left,
                format!("Can only assign to unbound variables, {} is not unbound.", var),
            );
        }
        self.push_goal(Goal::Unify { left, right })
    }

    /// `new Class(..)` unifies the result with a placeholder instance and
    /// asks the host to construct the real one under the same id.
    fn query_new(&mut self, term: &Term, args: &[Term]) -> PolicyResult<()> {
        let (constructor, result) = binary_args(term, args)?;
        result.as_symbol()?;

        let instance_id = self.new_id();
        let class = &constructor.value().as_call()?.name;
        let class_repr = Some(class.0.clone()).filter(|_| self.kb().is_constant(class));
        let instance = constructor.clone_with_value(Value::ExternalInstance(ExternalInstance {
            instance_id,
            constructor: Some(constructor.clone()),
            repr: Some(constructor.to_policy()),
            class_repr,
        }));

        // Unify as a goal: `result` may already hold an instance.
        self.append_goals(vec![
            Goal::Unify {
                left: result,
                right: instance,
            },
            Goal::MakeExternal {
                instance_id,
                constructor,
            },
        ])
    }

    /// The first choice made inside the current rule body. A cut drops it
    /// and everything after it.
    fn cut_point(&self) -> usize {
        // The last two queries are the body and the cut itself.
        let outer = &self.queries[..self.queries.len().saturating_sub(2)];
        let inner = self
            .choices
            .iter()
            .rev()
            .take_while(|choice| choice.queries.starts_with(outer))
            .count();
        self.choices.len() - inner
    }

    /// Evaluate a binary operator once its operands are as ground as they
    /// get. A bound variable operand is substituted and the operation
    /// queried again. An unbound one makes the operation a constraint,
    /// unless `eval` handles that side itself: `In` enumerates into an
    /// unbound left, `Dot` binds an unbound right.
    fn query_op_helper<F>(
        &mut self,
        term: &Term,
        eval: F,
        constrain_unbound_left: bool,
        constrain_unbound_right: bool,
    ) -> PolicyResult<QueryEvent>
    where
        F: Fn(&mut Self, &Term) -> PolicyResult<QueryEvent>,
    {
        let Operation { operator, args } = term.value().as_expression()?;
        let operator = *operator;
        if args.len() < 2 {
            return invalid_state(format!("query_op_helper: wrong arity: {}", term));
        }
        let mut args = args.clone();
        let requery = |args: Vec<Term>| Goal::Query {
            term: term.clone_with_value(Value::Expression(Operation { operator, args })),
        };

        // Constraints re-queried after a partial is bound can hold lookups.
        // Each is moved out into a fresh variable first.
        let is_lookup = |arg: &Term| {
            matches!(arg.value(), Value::Expression(Operation { operator: Operator::Dot, args }) if args.len() == 2)
        };
        if let Some(side) = (0..2).find(|&side| is_lookup(&args[side])) {
            let var = Term::from(self.kb().gensym("rwdot"));
            let lookup = std::mem::replace(&mut args[side], var.clone());
            self.push_goal(requery(args))?;
            self.push_goal(Goal::Unify {
                left: lookup,
                right: var,
            })?;
            return Ok(QueryEvent::None);
        }

        let malformed = args[..2].iter().any(|arg| {
            matches!(
                arg.value(),
                Value::Expression(_) | Value::RestVariable(_)
            )
        });
        if malformed {
            return invalid_state(format!("invalid query: {}", term));
        }

        // Right operand first.
        for (side, constrain) in [(1, constrain_unbound_right), (0, constrain_unbound_left)] {
            let var = match args[side].value() {
                Value::Variable(var) => var.clone(),
                _ => continue,
            };
            match self.variable_state(&var) {
                VariableState::Bound(bound) => {
                    args[side] = bound;
                    self.push_goal(requery(args))?;
                    return Ok(QueryEvent::None);
                }
                _ if !constrain && args[1 - side].as_symbol().is_err() => {
                    return eval(self, term)
                }
                _ => {}
            }
        }

        if args[..2].iter().any(|arg| arg.as_symbol().is_ok()) {
            self.add_constraint(term)?;
            return Ok(QueryEvent::None);
        }
        eval(self, term)
    }

    /// Evaluate comparison operations.
    fn comparison_op_helper(&mut self, term: &Term) -> PolicyResult<QueryEvent> {
        let Operation { operator: op, args } = term.value().as_expression()?;
        let (left, right) = binary_args(term, args)?;

        match (left.value(), right.value()) {
            (Value::ExternalInstance(_), _) | (_, Value::ExternalInstance(_)) => {
                // The host answers; the result must come back `true`.
                let (call_id, answer) =
                    self.new_call_var("external_op_result", Value::Boolean(false))?;
                self.push_goal(Goal::Unify {
                    left: answer,
                    right: Term::from(true),
                })?;

                Ok(QueryEvent::ExternalOp {
                    call_id,
                    operator: *op,
                    args: vec![left, right],
                })
            }
            _ => {
                if !compare(*op, &left, &right, term)? {
                    self.push_goal(Goal::Backtrack)?;
                }
                Ok(QueryEvent::None)
            }
        }
    }

    /// Evaluate arithmetic operations: `op(left, right, result)`.
    fn arithmetic_op_helper(&mut self, term: &Term) -> PolicyResult<QueryEvent> {
        let Operation { operator: op, args } = term.value().as_expression()?;

        let (left, right, result) = match &args[..] {
            [left, right, result] => (left, right, result),
            _ => return invalid_state(format!("arithmetic_op_helper: wrong arity: {}", term)),
        };
        result.as_symbol()?; // Ensure `result` is a variable.

        match (left.value(), right.value()) {
            (Value::Number(left), Value::Number(right)) => {
                if right.is_zero() && matches!(op, Operator::Div | Operator::Mod | Operator::Rem) {
                    return Err(RuntimeError::ArithmeticError {
                        msg: format!("division by zero: {}", term),
                    }
                    .into());
                }
                let answer = match op {
                    Operator::Add => *left + *right,
                    Operator::Sub => *left - *right,
                    Operator::Mul => *left * *right,
                    Operator::Div => *left / *right,
                    Operator::Mod => left.modulo(*right),
                    Operator::Rem => left.remainder(*right),
                    _ => return unsupported(format!("numeric operation {:?}", op), term),
                };
                match answer {
                    Some(answer) => {
                        self.push_goal(Goal::Unify {
                            left: term.clone_with_value(Value::Number(answer)),
                            right: result.clone(),
                        })?;
                        Ok(QueryEvent::None)
                    }
                    None => Err(RuntimeError::ArithmeticError {
                        msg: format!("arithmetic overflow: {}", term),
                    }
                    .into()),
                }
            }
            (_, _) => self.type_error(term, format!("arithmetic on non-numbers: {}", term)),
        }
    }

    /// `object.field = value`. Plain dictionary fields are looked up here
    /// and anything else goes to the host. An unbound object turns the
    /// lookup into a constraint.
    fn dot_op_helper(&mut self, term: &Term) -> PolicyResult<QueryEvent> {
        let Operation { args, .. } = term.value().as_expression()?;
        let (object, field, value) = match &args[..] {
            [object, field, value] => (object, field.clone(), value.clone()),
            _ => return invalid_state(format!("dot_op_helper: wrong arity: {}", term)),
        };

        let plain_field = matches!(field.value(), Value::String(_) | Value::Variable(_));
        match object.value() {
            Value::Dictionary(dict) if plain_field => self.push_goal(Goal::Lookup {
                dict: dict.clone(),
                field,
                value,
            })?,
            Value::Dictionary(_)
            | Value::ExternalInstance(_)
            | Value::List(_)
            | Value::Number(_)
            | Value::String(_) => {
                let answer = self.kb().gensym("lookup_value");
                let call_id = self.new_call_id(&answer);
                self.append_goals(vec![
                    Goal::LookupExternal {
                        call_id,
                        instance: object.clone(),
                        field,
                    },
                    Goal::CheckError,
                    Goal::Unify {
                        left: value,
                        right: Term::from(answer),
                    },
                ])?;
            }
            Value::Variable(var) => {
                if let Value::Call(_) = field.value() {
                    return unsupported(
                        format!("cannot call method on unbound variable {}", var),
                        object,
                    );
                }
                // Recorded as `value = object.field`.
                let lookup = Term::from(op!(Dot, object.clone(), field));
                let constraint = Term::from(op!(Unify, self.deref(&value), lookup));
                self.add_constraint(&constraint)?;
            }
            _ => {
                return self.type_error(
                    object,
                    format!(
                        "can only perform lookups on dicts and instances, this is {}",
                        object
                    ),
                )
            }
        }
        Ok(QueryEvent::None)
    }

    /// `item in iterable`, with one alternative per element that could
    /// match. Host iterables are walked with `NextExternal`.
    fn in_op_helper(&mut self, term: &Term) -> PolicyResult<QueryEvent> {
        let Operation { args, .. } = term.value().as_expression()?;
        let (item, iterable) = binary_args(term, args)?;

        // A ground item can skip ground elements that differ from it.
        let ground = item.is_ground();
        let candidate = |element: &Term| !ground || !element.is_ground() || *element == item;
        let unify_with = |element: Term| {
            vec![Goal::Unify {
                left: item.clone(),
                right: element,
            }]
        };

        let alternatives: Vec<Goals> = match iterable.value() {
            Value::List(elements) => elements
                .iter()
                .filter(|element| candidate(element))
                .map(|element| match element.value() {
                    Value::RestVariable(rest) => vec![Goal::Query {
                        term: Term::from(op!(In, item.clone(), Term::from(rest.clone()))),
                    }],
                    _ => unify_with(element.clone()),
                })
                .collect(),
            // Dictionaries yield `[key, value]` pairs.
            Value::Dictionary(dict) => dict
                .fields
                .iter()
                .map(|(key, value)| {
                    iterable.clone_with_value(Value::List(vec![
                        value.clone_with_value(Value::String(key.0.clone())),
                        value.clone(),
                    ]))
                })
                .filter(|pair| candidate(pair))
                .map(unify_with)
                .collect(),
            // Strings yield their characters.
            Value::String(string) => string
                .chars()
                .map(|c| iterable.clone_with_value(Value::String(c.to_string())))
                .filter(|c| candidate(c))
                .map(unify_with)
                .collect(),
            Value::ExternalInstance(_) => {
                // `external_call_result` binds this to each element in turn.
                let next = self.kb().gensym("next_value");
                let call_id = self.new_call_id(&next);
                self.append_goals(vec![
                    Goal::NextExternal {
                        call_id,
                        iterable: self.deref(&iterable),
                    },
                    Goal::Unify {
                        left: item.clone(),
                        right: Term::from(next),
                    },
                ])?;
                return Ok(QueryEvent::None);
            }
            _ => {
                return self.type_error(
                    &iterable,
                    format!("can only use `in` on an iterable value, this is {}", iterable),
                )
            }
        };
        self.choose(alternatives)?;
        Ok(QueryEvent::None)
    }

    /// Unify `left` with `right`: bind variables, push goals for the parts
    /// of compound values, or backtrack if they can't be equal.
    fn unify(&mut self, left: &Term, right: &Term) -> PolicyResult<()> {
        match (left.value(), right.value()) {
            (Value::Expression(op), other) | (other, Value::Expression(op)) => match op {
                // A two-argument lookup from a re-queried constraint.
                Operation {
                    operator: Operator::Dot,
                    args,
                } if args.len() == 2 => {
                    let term = Term::from(op!(
                        Dot,
                        args[0].clone(),
                        args[1].clone(),
                        Term::from(other.clone())
                    ));
                    self.push_goal(Goal::Query { term })?
                }
                _ => {
                    return self.type_error(
                        left,
                        format!("cannot unify expressions directly `{}` = `{}`", left, right),
                    )
                }
            },
            (Value::Pattern(_), _) | (_, Value::Pattern(_)) => {
                return self.type_error(
                    left,
                    format!("cannot unify patterns directly `{}` = `{}`", left, right),
                );
            }

            (Value::Variable(var) | Value::RestVariable(var), _) => self.unify_var(var, right)?,
            (_, Value::Variable(var) | Value::RestVariable(var)) => self.unify_var(var, left)?,

            (Value::List(l), Value::List(r)) => self.unify_lists(l, r, |(l, r)| Goal::Unify {
                left: l.clone(),
                right: r.clone(),
            })?,
            (Value::Dictionary(l), Value::Dictionary(r)) => {
                if !l.fields.keys().eq(r.fields.keys()) {
                    return self.push_goal(Goal::Backtrack);
                }
                let pairs = l.fields.values().zip(r.fields.values());
                self.append_goals(pairs.map(|(l, r)| Goal::Unify {
                    left: l.clone(),
                    right: r.clone(),
                }))?;
            }

            (Value::Number(l), Value::Number(r)) if l == r => {}
            (Value::String(l), Value::String(r)) if l == r => {}
            (Value::Boolean(l), Value::Boolean(r)) if l == r => {}
            (Value::ExternalInstance(l), Value::ExternalInstance(r))
                if l.instance_id == r.instance_id => {}
            // The host decides whether an instance equals anything else,
            // including a native value it converts to.
            (Value::ExternalInstance(_), _) | (_, Value::ExternalInstance(_)) => {
                self.push_goal(Goal::Query {
                    term: Term::from(op!(Eq, left.clone(), right.clone())),
                })?;
            }

            _ => self.push_goal(Goal::Backtrack)?,
        }
        Ok(())
    }

    /// Bind `var` to `other`, or unify its value with `other` if it has one.
    fn unify_var(&mut self, var: &Symbol, other: &Term) -> PolicyResult<()> {
        match self.variable_state(var) {
            VariableState::Bound(value) => self.push_goal(Goal::Unify {
                left: value,
                right: other.clone(),
            }),
            _ => self.bind(var, other.clone()),
        }
    }

    /// Pair up the elements of two lists. Either list may end in a rest
    /// variable, which takes whatever the other list has left over. `pair`
    /// builds the goal for each pair, so `isa` can share this.
    fn unify_lists<F>(&mut self, left: &[Term], right: &[Term], mut pair: F) -> PolicyResult<()>
    where
        F: FnMut((&Term, &Term)) -> Goal,
    {
        let (left_items, left_rest) = split_rest(left);
        let (right_items, right_rest) = split_rest(right);
        let shared = left_items.len().min(right_items.len());
        let leftover = |items: &[Term], rest: Option<&Term>| {
            let mut tail = items[shared..].to_vec();
            tail.extend(rest.cloned());
            Term::from(Value::List(tail))
        };

        let mut goals: Goals = left_items.iter().zip(right_items).map(&mut pair).collect();
        match (left_rest, right_rest) {
            (None, None) if left_items.len() == right_items.len() => {}
            (Some(l), Some(r)) if left_items.len() == right_items.len() => goals.push(pair((l, r))),
            (Some(l), _) if left_items.len() <= right_items.len() => {
                goals.push(pair((l, &leftover(right_items, right_rest))))
            }
            (_, Some(r)) if right_items.len() <= left_items.len() => {
                goals.push(pair((&leftover(left_items, left_rest), r)))
            }
            _ => return self.push_goal(Goal::Backtrack),
        }
        self.append_goals(goals)
    }

    /// Keep the rules whose parameters can match `args`, checking one per
    /// step, then hand the survivors to `sort_rules`.
    fn filter_rules(
        &mut self,
        applicable_rules: &Rules,
        unfiltered_rules: &Rules,
        args: &TermList,
    ) -> PolicyResult<()> {
        let (rule, remaining) = match unfiltered_rules.split_last() {
            Some((rule, remaining)) => (rule, remaining.to_vec()),
            None => {
                if applicable_rules.is_empty() {
                    self.log(LogLevel::Info, || "No matching rules found", &[]);
                }
                return self.push_goal(Goal::SortRules {
                    rules: applicable_rules.iter().rev().cloned().collect(),
                    args: args.clone(),
                    outer: 1,
                    inner: 1,
                });
            }
        };

        let skip = Goal::FilterRules {
            args: args.clone(),
            applicable_rules: applicable_rules.clone(),
            unfiltered_rules: remaining.clone(),
        };
        if rule.params.len() != args.len() {
            return self.push_goal(skip);
        }
        let keep = Goal::FilterRules {
            args: args.clone(),
            applicable_rules: applicable_rules
                .iter()
                .chain(std::iter::once(rule))
                .cloned()
                .collect(),
            unfiltered_rules: remaining,
        };

        // Ground parameters were matched when the candidates were indexed.
        if rule.params.iter().all(Parameter::is_ground) {
            return self.push_goal(keep);
        }

        // Fresh variables keep the rule's names apart from the arguments'.
        let renamed = self.rename_rule_vars(rule);
        let matches = args
            .iter()
            .zip(&renamed.params)
            .flat_map(|(arg, param)| {
                let unify = Goal::Unify {
                    left: arg.clone(),
                    right: param.parameter.clone(),
                };
                let isa = param.specializer.as_ref().map(|specializer| Goal::Isa {
                    left: arg.clone(),
                    right: specializer.clone(),
                });
                std::iter::once(unify).chain(isa)
            })
            .collect();
        self.choose_conditional(matches, vec![keep], vec![skip])
    }

    /// Order `rules` most specific first.
    ///
    /// This is an insertion sort whose state lives in `SortRules` goals,
    /// since a comparison can need answers from the host. Rules before
    /// `outer` are sorted, and `inner` is where the rule being inserted
    /// sits now. Once sorted, the rules become the alternatives of a choice.
    fn sort_rules(
        &mut self,
        rules: &Rules,
        args: &TermList,
        outer: usize,
        inner: usize,
    ) -> PolicyResult<()> {
        if rules.is_empty() {
            return self.push_goal(Goal::Backtrack);
        }
        if outer > rules.len() || inner > outer {
            return invalid_state(format!(
                "bad insertion sort state: outer {}, inner {}, {} rules",
                outer,
                inner,
                rules.len()
            ));
        }

        if outer == rules.len() {
            self.trace_mute = false;
            self.log(
                LogLevel::Info,
                || {
                    rules.iter().fold("APPLICABLE_RULES:".to_owned(), |mut out, rule| {
                        let _ = write!(out, "\n  {}{}", rule.head_to_policy(), rule_position(rule));
                        out
                    })
                },
                &[],
            );
            let alternatives = rules
                .iter()
                .map(|rule| self.rule_goals(rule, args))
                .collect::<Vec<_>>();
            return self.choose(alternatives);
        }

        let next_outer = Goal::SortRules {
            rules: rules.clone(),
            args: args.clone(),
            outer: outer + 1,
            inner: outer + 1,
        };
        if inner == 0 {
            return self.push_goal(next_outer);
        }

        let compare = Goal::IsMoreSpecific {
            left: rules[inner].clone(),
            right: rules[inner - 1].clone(),
            args: args.clone(),
        };
        let mut swapped = rules.clone();
        swapped.swap(inner - 1, inner);
        let next_inner = Goal::SortRules {
            rules: swapped,
            args: args.clone(),
            outer,
            inner: inner - 1,
        };
        // Keep moving the rule down while it beats its neighbour.
        self.choose_conditional(vec![compare], vec![next_inner], vec![next_outer])
    }

    /// Goals that run `rule` on `args`: bind the parameters, check the
    /// specializers, then prove the body.
    fn rule_goals(&self, rule: &Arc<Rule>, args: &TermList) -> Goals {
        let Rule { body, params, .. } = self.rename_rule_vars(rule);
        let mut goals = Vec::with_capacity(2 * args.len() + 4);
        goals.push(Goal::TraceRule {
            trace: Rc::new(Trace {
                node: Node::Rule(rule.clone()),
                children: vec![],
            }),
        });
        goals.push(Goal::TraceStackPush);
        for (arg, param) in args.iter().zip(params) {
            goals.push(Goal::Unify {
                left: arg.clone(),
                right: param.parameter.clone(),
            });
            if let Some(specializer) = param.specializer {
                goals.push(Goal::Isa {
                    left: param.parameter,
                    right: specializer,
                });
            }
        }
        goals.push(Goal::Query { term: body });
        goals.push(Goal::TraceStackPop);
        goals
    }

    /// Succeed if `left` is more specific than `right` with respect to `args`.
    #[allow(clippy::wrong_self_convention)]
    fn is_more_specific(&mut self, left: &Rule, right: &Rule, args: &TermList) -> PolicyResult<()> {
        let zipped = left.params.iter().zip(right.params.iter()).zip(args.iter());
        for ((left_param, right_param), _arg) in zipped {
            match (&left_param.specializer, &right_param.specializer) {
                // The first pair of differing specializers decides.
                (Some(left_spec), Some(right_spec)) if left_spec != right_spec => {
                    return self.is_subspecializer(left_spec, right_spec)
                }
                (Some(_), Some(_)) => (),
                // If the left rule has no specializer and the right does, it is NOT more specific,
                // so we Backtrack (fail)
                (None, Some(_)) => return self.push_goal(Goal::Backtrack),
                // If the left rule has a specializer and the right does not, the left IS more specific,
                // so we return
                (Some(_), None) => return Ok(()),
                // If neither has a specializer, neither is more specific, so we continue to the next argument.
                (None, None) => (),
            }
        }
        // Fail on any of the above branches that do not return
        self.push_goal(Goal::Backtrack)
    }

    /// Succeed if specializer `left` is strictly narrower than `right`.
    #[allow(clippy::wrong_self_convention)]
    fn is_subspecializer(&mut self, left: &Term, right: &Term) -> PolicyResult<()> {
        let narrower = match (left.value(), right.value()) {
            (
                Value::Pattern(Pattern::Instance(InstanceLiteral {
                    tag: left_tag,
                    fields: left_fields,
                })),
                Value::Pattern(Pattern::Instance(InstanceLiteral {
                    tag: right_tag,
                    fields: right_fields,
                })),
            ) => {
                if left_tag != right_tag {
                    return self.push_goal(Goal::IsSubclass {
                        left: left_tag.clone(),
                        right: right_tag.clone(),
                    });
                }
                left_fields.fields.len() > right_fields.fields.len()
            }
            (
                Value::Pattern(Pattern::Dictionary(left)),
                Value::Pattern(Pattern::Dictionary(right)),
            ) => left.fields.len() > right.fields.len(),
            (Value::Pattern(Pattern::Instance(_)), Value::Pattern(Pattern::Dictionary(_))) => true,
            _ => false,
        };
        if !narrower {
            self.push_goal(Goal::Backtrack)?;
        }
        Ok(())
    }

    fn type_error<T>(&self, term: &Term, msg: String) -> PolicyResult<T> {
        let error = PolicyError::from(RuntimeError::TypeError {
            msg,
            stack_trace: Some(self.stack_trace()),
        });
        Err(error.with_term(term))
    }

    /// Handle an error coming from outside the vm.
    pub fn external_error(&mut self, message: String) {
        self.external_error = Some(message);
    }
}

impl VirtualMachine {
    /// Run the virtual machine. While there are goals on the stack,
    /// pop them off and execute them one at a time until we have a
    /// `QueryEvent` to return. May be called multiple times to restart
    /// the machine.
    pub fn run(&mut self) -> PolicyResult<QueryEvent> {
        if self.query_start_time.is_none() {
            self.query_start_time = Some(Instant::now());
        }
        let event = self.run_goals();
        self.pause_timer();
        event
    }

    fn run_goals(&mut self) -> PolicyResult<QueryEvent> {
        if self.goals.is_empty() {
            if self.choices.is_empty() {
                return Ok(QueryEvent::Done { result: true });
            } else {
                self.backtrack()?;
            }
        }

        while let Some(goal) = self.goals.pop() {
            match self.next(goal.clone()) {
                Ok(QueryEvent::None) => (),
                Ok(event) => {
                    self.external_error = None;
                    return Ok(event);
                }
                Err(error) => {
                    self.handle_error(error)?;
                    continue;
                }
            }
            self.maybe_break(DebugEvent::Goal(goal.clone()))?;
        }

        if self.tracing {
            for t in &self.trace {
                self.log(LogLevel::Trace, || format!("trace\n{}", t.draw()), &[]);
            }
        }

        let trace = if self.tracing {
            self.trace.first().cloned().map(TraceResult::new)
        } else {
            None
        };

        let bindings = self.result_bindings()?;

        self.log(
            LogLevel::Info,
            || {
                if bindings.is_empty() {
                    "RESULT: SUCCESS".to_string()
                } else {
                    let mut out = "RESULT: {\n".to_string();
                    for (key, value) in &bindings {
                        let _ = writeln!(out, "  {}: {}", key, value);
                    }
                    out.push('}');
                    out
                }
            },
            &[],
        );

        Ok(QueryEvent::Result { bindings, trace })
    }

    /// Values of the query's own variables: bound variables fully
    /// dereferenced, constrained ones as a simplified expression.
    fn result_bindings(&self) -> PolicyResult<Bindings> {
        let mut bindings = Bindings::new();
        for var in self.bindings(false).into_keys() {
            let value = match self.variable_state(&var) {
                VariableState::Unbound => continue,
                VariableState::Bound(_) => self.deref(&Term::from(var.clone())),
                VariableState::Partial(_) => {
                    let simplified = simplify_partial(&var, &self.binding_manager);
                    if !self.accept_expression {
                        return Err(RuntimeError::UnhandledPartial {
                            var: var.clone(),
                            term: simplified,
                        }
                        .into());
                    }
                    simplified
                }
            };
            bindings.insert(var, value);
        }
        Ok(bindings)
    }

    fn handle_error(&mut self, error: PolicyError) -> PolicyResult<()> {
        // if we pushed a debug goal, push an error goal underneath it.
        if self.maybe_break(DebugEvent::Error(error.clone()))? {
            if let Some(debug_goal) = self.goals.pop() {
                self.push_goal(Goal::Error { error })?;
                self.goals.push(debug_goal);
            }
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Handle the host's answer to a yes/no question such as `ExternalIsa`.
    pub fn external_question_result(&mut self, call_id: u64, answer: bool) -> PolicyResult<()> {
        let var = match self.call_id_symbols.remove(&call_id) {
            Some(var) => var,
            None => return invalid_state(format!("unregistered external call ID: {}", call_id)),
        };
        if let Some(classes) = self.pending_subclass.remove(&call_id) {
            self.subclass_cache.insert(classes, answer);
        }
        self.binding_manager.rebind(&var, Term::from(answer));
        Ok(())
    }

    /// Handle an external result provided by the application.
    ///
    /// If the value is `Some(_)` then we have a result, and unify the
    /// symbol associated with the call ID to the result value. If the
    /// value is `None` then the external has no (more) results, so we
    /// backtrack to the choice point left by `Goal::LookupExternal`.
    pub fn external_call_result(&mut self, call_id: u64, term: Option<Term>) -> PolicyResult<()> {
        if let Some(value) = term {
            self.log(LogLevel::Trace, || format!("=> {}", value), &[]);

            // Fetch variable to unify with call result.
            let sym = self.get_call_sym(call_id)?.to_owned();

            self.push_goal(Goal::Unify {
                left: Term::from(sym),
                right: value,
            })?;
        } else {
            self.log(LogLevel::Trace, || "=> No more results.", &[]);

            // No more results. Clean up, cut out the retry alternative,
            // and backtrack.
            if self.call_id_symbols.remove(&call_id).is_none() {
                return invalid_state(format!("unregistered external call ID: {}", call_id));
            }

            let check_error = matches!(self.goals.last().map(|goal| goal.as_ref()), Some(Goal::CheckError));

            let choice_index = match self.choices.len().checked_sub(1) {
                Some(index) => index,
                None => return invalid_state("no choice point for an external call"),
            };
            self.push_goal(Goal::Backtrack)?;
            self.push_goal(Goal::Cut { choice_index })?;

            if check_error {
                self.push_goal(Goal::CheckError)?;
            }
        }
        Ok(())
    }

    /// Drive debugger.
    pub fn debug_command(&mut self, command: &str) -> PolicyResult<()> {
        let mut debugger = self.debugger.clone();
        let maybe_goal = debugger.debug_command(command, self);
        if let Some(goal) = maybe_goal {
            self.push_goal(goal)?;
        }
        self.debugger = debugger;
        Ok(())
    }
}
