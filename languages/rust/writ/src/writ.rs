//! Talk to the policy engine: load rules, register classes, make queries.
use writ_core::filter::Filter;
use writ_core::sources::Source;
use writ_core::terms::{
    Call, Dictionary, InstanceLiteral, Operation, Operator, Pattern, Symbol, Term, Value,
};
use writ_core::{Engine, QueryOptions};

use std::any::TypeId;
use std::collections::HashSet;
use std::fs::File;
use std::hash::Hash;
use std::io::Read;
use std::sync::Arc;

use crate::errors::AuthorizationError;
use crate::host::{Class, Host, Instance};
use crate::query::Query;
use crate::{FromWrit, ToWrit, ToWritList, WritError, WritValue};

/// Name of the variable `authorized_query` leaves partial.
const RESOURCE_VAR: &str = "resource";

/// Action `authorize` checks to tell "forbidden" from "not found".
const READ_ACTION: &str = "read";

/// Writ is the main struct you interact with. It holds the rules and
/// registered classes, and runs queries against them.
#[derive(Clone)]
pub struct Writ {
    inner: Arc<Engine>,
    host: Host,
}

impl Default for Writ {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents an `action` used in an `allow` rule.
/// When the action is bound to a concrete value (e.g. a string)
/// this returns an `Action::Typed(action)`.
/// If _any_ actions are allowed, then the `Action::Any` variant is returned.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Action<T = String> {
    Any,
    Typed(T),
}

impl<T: FromWrit> FromWrit for Action<T> {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        if matches!(val, WritValue::Variable(_)) {
            Ok(Action::Any)
        } else {
            T::from_writ(val).map(Action::Typed)
        }
    }
}

impl Writ {
    /// Create a new instance of Writ. Each instance is separate and can have different rules and classes loaded into it.
    pub fn new() -> Self {
        let inner = Arc::new(Engine::new());
        let mut host = Host::new(inner.clone());

        // Builtin names are answered by the core; the host only needs
        // their methods.
        for class in crate::builtins::classes() {
            if let Err(e) = host.cache_class(class) {
                tracing::error!("failed to cache builtin class: {}", e);
            }
        }

        let mut writ = Self { inner, host };
        if let Err(e) = writ.register_constant(Option::<WritValue>::None, "nil") {
            tracing::error!("failed to register the constant nil: {}", e);
        }
        writ
    }

    /// High level interface for authorization decisions. Makes an allow query with the given actor, action and resource and returns true or false.
    pub fn is_allowed<Actor, Action, Resource>(
        &self,
        actor: Actor,
        action: Action,
        resource: Resource,
    ) -> crate::Result<bool>
    where
        Actor: ToWrit,
        Action: ToWrit,
        Resource: ToWrit,
    {
        self.query_rule_once("allow", (actor, action, resource))
    }

    /// Ensure `actor` may perform `action` on `resource`.
    ///
    /// When denied and `check_read` is set, actors that may not even read
    /// the resource get `AuthorizationError::NotFound` instead of
    /// `AuthorizationError::Forbidden`, so they can't learn it exists.
    pub fn authorize<Actor, Action, Resource>(
        &self,
        actor: Actor,
        action: Action,
        resource: Resource,
        check_read: bool,
    ) -> crate::Result<()>
    where
        Actor: ToWrit + Clone,
        Action: ToWrit,
        Resource: ToWrit + Clone,
    {
        if self.is_allowed(actor.clone(), action, resource.clone())? {
            return Ok(());
        }
        let error = if check_read && !self.is_allowed(actor, READ_ACTION, resource)? {
            AuthorizationError::NotFound
        } else {
            AuthorizationError::Forbidden
        };
        Err(error.into())
    }

    /// Get the actions actor is allowed to take on resource.
    /// Returns a [std::collections::HashSet] of actions, typed according the return value.
    /// # Examples
    /// ```ignore
    /// writ.load_str(r#"allow(actor: Actor{name: "sally"}, action, resource: Widget{id: 1}) if
    ///               action in ["CREATE", "READ"];"#);
    ///
    /// // get a HashSet of writ::Actions
    /// let actions: HashSet<Action> = writ.authorized_actions(actor, resource)?;
    ///
    /// // or Strings
    /// let actions: HashSet<String> = writ.authorized_actions(actor, resource)?;
    /// ```
    pub fn authorized_actions<Actor, Resource, T>(
        &self,
        actor: Actor,
        resource: Resource,
    ) -> crate::Result<HashSet<T>>
    where
        Actor: ToWrit,
        Resource: ToWrit,
        T: FromWrit + Eq + Hash,
    {
        let query = self.query_rule(
            "allow",
            (actor, WritValue::Variable("action".to_owned()), resource),
        )?;

        let mut set = HashSet::new();
        for result in query {
            if let Some(action) = result?.get("action") {
                set.insert(T::from_writ(action)?);
            }
        }

        Ok(set)
    }

    /// Clear out all files and rules that have been loaded.
    pub fn clear_rules(&mut self) -> crate::Result<()> {
        self.inner.clear_rules();
        check_messages!(self.inner);
        Ok(())
    }

    fn check_inline_queries(&self) -> crate::Result<()> {
        while let Some(q) = self.inner.next_inline_query(QueryOptions::default()) {
            let location = q.source_info();
            let query = Query::new(q, self.host.clone());
            match query.collect::<crate::Result<Vec<_>>>() {
                Ok(v) if !v.is_empty() => continue,
                Ok(_) => return Err(WritError::InlineQueryFailed { location }),
                Err(e) => return lazy_error!("error in inline query: {}", e),
            }
        }
        check_messages!(self.inner);
        Ok(())
    }

    // Load policy code and check inline queries. A failed inline query
    // leaves no rules behind.
    fn load_sources(&mut self, sources: Vec<Source>) -> crate::Result<()> {
        self.inner.load(sources)?;
        check_messages!(self.inner);
        self.check_inline_queries().map_err(|e| {
            self.inner.clear_rules();
            e
        })
    }

    /// Load files containing policy rules. All policy files must end in `.writ`.
    pub fn load_files<P: AsRef<std::path::Path>>(
        &mut self,
        filenames: Vec<P>,
    ) -> crate::Result<()> {
        if filenames.is_empty() {
            return Ok(());
        }

        let mut sources = Vec::with_capacity(filenames.len());

        for file in filenames {
            let file = file.as_ref();
            let filename = file.to_string_lossy().into_owned();
            if !file.extension().map_or(false, |ext| ext == "writ") {
                return Err(WritError::IncorrectFileType { filename });
            }
            let mut f = File::open(&file)?;
            let mut src = String::new();
            f.read_to_string(&mut src)?;
            sources.push(Source::new_with_name(filename, src));
        }

        self.load_sources(sources)
    }

    /// Load a string of policy source directly.
    /// # Examples
    /// ```ignore
    /// writ.load_str("allow(a, b, c) if true;");
    /// ```
    pub fn load_str(&mut self, src: &str) -> crate::Result<()> {
        self.load_sources(vec![Source::new(src)])
    }

    /// Query the knowledge base. This can be an allow query or any other policy expression.
    /// # Examples
    /// ```ignore
    /// writ.query("x = 1 or x = 2");
    /// ```
    pub fn query(&self, s: &str) -> crate::Result<Query> {
        self.query_with_options(s, QueryOptions::default())
    }

    pub fn query_with_options(&self, s: &str, options: QueryOptions) -> crate::Result<Query> {
        let query = self.inner.new_query(s, options)?;
        check_messages!(self.inner);
        Ok(Query::new(query, self.host.clone()))
    }

    /// Query the knowledge base but with a rule name and argument list.
    /// This allows you to pass in rust values.
    /// # Examples
    /// ```ignore
    /// writ.query_rule("is_admin", (User{name: "steve"},));
    /// ```
    #[must_use = "Query that is not consumed does nothing."]
    pub fn query_rule(&self, name: &str, args: impl ToWritList) -> crate::Result<Query> {
        self.query_rule_with_options(name, args, QueryOptions::default())
    }

    pub fn query_rule_with_options(
        &self,
        name: &str,
        args: impl ToWritList,
        options: QueryOptions,
    ) -> crate::Result<Query> {
        let mut query_host = self.host.clone();
        let args = args
            .to_writ_list()
            .iter()
            .map(|value| value.to_term(&mut query_host))
            .collect();
        let query_term = Term::from(Value::Call(Call {
            name: Symbol::new(name),
            args,
            kwargs: None,
        }));
        let query = self.inner.new_query_from_term(query_term, options);
        check_messages!(self.inner);
        Ok(Query::new(query, query_host))
    }

    /// Whether the rule succeeds at least once for `args`.
    pub fn query_rule_once(&self, name: &str, args: impl ToWritList) -> crate::Result<bool> {
        let mut query = self.query_rule(name, args)?;
        match query.next() {
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => Err(e),
            None => Ok(false),
        }
    }

    /// Register a rust type as a class usable in policies.
    /// See [`crate::Class`] docs.
    pub fn register_class(&mut self, class: Class) -> crate::Result<()> {
        let name = self.host.cache_class(class.clone())?;
        let symbol = Symbol::new(&name);
        self.inner.register_class(symbol.clone(), class.fields.clone());
        // Rust types have no superclasses.
        self.inner.register_mro(symbol.clone(), vec![symbol]);

        for hook in &class.register_hooks {
            hook.call(self)?;
        }
        self.register_constant(class, &name)
    }

    /// Register a rust value as a named constant.
    pub fn register_constant<V: ToWrit + Send + Sync>(
        &mut self,
        value: V,
        name: &str,
    ) -> crate::Result<()> {
        self.inner.register_constant(
            Symbol::new(name),
            value.to_writ().to_term(&mut self.host),
        )?;
        Ok(())
    }

    /// The query object, built by the class's `build_query` handler, that
    /// selects every `R` the actor may perform `action` on.
    pub fn authorized_query<R, Q, Actor, Action>(&self, actor: Actor, action: Action) -> crate::Result<Q>
    where
        R: 'static,
        Q: Clone + 'static,
        Actor: ToWrit,
        Action: ToWrit,
    {
        let class = self.host.get_class_by_type_id(TypeId::of::<R>())?;
        let query = self.query_instance(class, actor, action)?;
        Ok(query.downcast::<Q>(Some(&self.host)).map_err(|e| e.user())?.clone())
    }

    /// Every `R` the actor may perform `action` on, loaded through the
    /// class's `exec_query` handler.
    pub fn authorized_resources<R, Actor, Action>(&self, actor: Actor, action: Action) -> crate::Result<Vec<R>>
    where
        R: Clone + 'static,
        Actor: ToWrit,
        Action: ToWrit,
    {
        let class = self.host.get_class_by_type_id(TypeId::of::<R>())?;
        let exec_query = class.exec_query.clone().ok_or_else(|| WritError::DataFilteringNotConfigured {
            class: class.name.clone(),
            missing: "exec_query".to_owned(),
        })?;
        let query = self.query_instance(class, actor, action)?;
        exec_query(&query)?
            .iter()
            .map(|instance| {
                instance
                    .downcast::<R>(Some(&self.host))
                    .map(Clone::clone)
                    .map_err(|e| e.user())
            })
            .collect()
    }

    /// Filter for the resources of `class` the actor may perform `action` on.
    pub fn authorized_filter<Actor, Action>(&self, actor: Actor, action: Action, class: &str) -> crate::Result<Filter>
    where
        Actor: ToWrit,
        Action: ToWrit,
    {
        let mut query_host = self.host.clone();
        let resource = Term::from(Symbol::new(RESOURCE_VAR));
        let allow = Term::from(Value::Call(Call {
            name: Symbol::new("allow"),
            args: vec![
                actor.to_writ().to_term(&mut query_host),
                action.to_writ().to_term(&mut query_host),
                resource.clone(),
            ],
            kwargs: None,
        }));
        let isa = Term::from(Operation::new(
            Operator::Isa,
            vec![
                resource,
                Term::from(Value::Pattern(Pattern::Instance(InstanceLiteral {
                    tag: Symbol::new(class),
                    fields: Dictionary::new(),
                }))),
            ],
        ));
        let options = QueryOptions {
            accept_expression: true,
            ..QueryOptions::default()
        };
        let mut inner = self
            .inner
            .new_query_from_term(Term::from(Operation::new(Operator::And, vec![isa, allow])), options);
        inner.bind(
            Symbol::new(RESOURCE_VAR),
            Term::from(Operation::new(Operator::And, vec![])),
        )?;
        check_messages!(self.inner);

        let results = Query::new(inner, query_host)
            .map(|result| result.map(|r| r.bindings))
            .collect::<crate::Result<Vec<_>>>()?;
        tracing::debug!(class, results = results.len(), "authorized_filter");
        Ok(self.inner.build_filter(&results, RESOURCE_VAR, class)?)
    }

    fn query_instance<Actor, Action>(&self, class: &Class, actor: Actor, action: Action) -> crate::Result<Instance>
    where
        Actor: ToWrit,
        Action: ToWrit,
    {
        let missing = |missing: &str| WritError::DataFilteringNotConfigured {
            class: class.name.clone(),
            missing: missing.to_owned(),
        };
        let build_query = class.build_query.clone().ok_or_else(|| missing("build_query"))?;
        let combine_query = class.combine_query.clone().ok_or_else(|| missing("combine_query"))?;

        let filter = self.authorized_filter(actor, action, &class.name)?;
        let Filter {
            root,
            relations,
            conditions,
        } = filter;
        // One query per disjunct, unioned together.
        conditions
            .into_iter()
            .map(|conjunct| {
                build_query(&Filter {
                    root: root.clone(),
                    relations: relations.clone(),
                    conditions: vec![conjunct],
                })
            })
            .reduce(|left, right| combine_query(&left?, &right?))
            .unwrap_or_else(|| {
                build_query(&Filter {
                    root,
                    relations,
                    conditions: vec![],
                })
            })
    }
}

// Make sure the `Writ` object is threadsafe
#[cfg(test)]
static_assertions::assert_impl_all!(Writ: Send, Sync);
