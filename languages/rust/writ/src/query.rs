use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::errors::{InvalidCallError, WritError};
use crate::host::{FromWrit, Host, Instance, WritResultIter};
use crate::WritValue;

use writ_core::events::QueryEvent;
use writ_core::terms::{Call, Operator, Symbol, Term, Value};

/// What one VM event amounted to.
enum Step {
    Continue,
    Answer(ResultSet),
    Finished,
}

/// A running query. Iterate it for one `ResultSet` per way the query
/// succeeds. The first error ends the iteration.
pub struct Query {
    inner: writ_core::Query,
    host: Host,
    /// Open `x in instance` iterations, by call id.
    iterators: HashMap<u64, WritResultIter>,
    done: bool,
}

impl Iterator for Query {
    type Item = crate::Result<ResultSet>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result()
    }
}

/// Errors the policy gets to see. A branch that hits one fails, and the
/// query carries on (unless it runs strict).
fn reported_to_vm(error: &WritError) -> bool {
    matches!(
        error,
        WritError::ApplicationError { .. } | WritError::InvalidCall(_) | WritError::TypeError(_)
    )
}

impl Query {
    pub fn new(inner: writ_core::Query, host: Host) -> Self {
        Self {
            inner,
            host,
            iterators: HashMap::new(),
            done: false,
        }
    }

    /// Where the query came from, for error messages.
    pub fn source_info(&self) -> String {
        self.inner.source_info()
    }

    pub fn next_result(&mut self) -> Option<crate::Result<ResultSet>> {
        while !self.done {
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Answer(result)) => return Some(Ok(result)),
                Ok(Step::Finished) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }

    fn step(&mut self) -> crate::Result<Step> {
        let event = self.inner.next_event();
        check_messages!(self.inner);
        let event = event?;
        tracing::debug!(?event, "query event");

        match event {
            QueryEvent::None => {}
            QueryEvent::Done { .. } => return Ok(Step::Finished),
            QueryEvent::Result { bindings, .. } => {
                return Ok(Step::Answer(ResultSet {
                    bindings,
                    host: self.host.clone(),
                }))
            }
            QueryEvent::MakeExternal {
                instance_id,
                constructor,
            } => self.make_external(instance_id, &constructor)?,
            QueryEvent::NextExternal { call_id, iterable } => {
                self.next_external(call_id, &iterable)?
            }
            QueryEvent::ExternalCall {
                call_id,
                instance,
                attribute,
                args,
                kwargs,
            } => self.external_call(call_id, &instance, attribute, args, kwargs)?,
            QueryEvent::ExternalOp {
                call_id,
                operator,
                args,
            } => {
                let answer = self.external_op(operator, &args)?;
                self.inner.question_result(call_id, answer)?;
            }
            QueryEvent::ExternalIsa {
                call_id,
                instance,
                class_tag,
            } => {
                tracing::debug!(?instance, class = %class_tag, "isa");
                let answer = self.host.isa(self.value(&instance)?, &class_tag.0)?;
                self.inner.question_result(call_id, answer)?;
            }
            QueryEvent::ExternalIsSubclass {
                call_id,
                left_class_tag,
                right_class_tag,
            } => {
                let answer = self.host.is_subclass(&left_class_tag.0, &right_class_tag.0);
                self.inner.question_result(call_id, answer)?;
            }
            QueryEvent::ExternalIsaWithPath {
                call_id,
                base_tag,
                path,
                class_tag,
            } => {
                let answer = self.host.isa_with_path(&base_tag.0, &path, &class_tag.0)?;
                self.inner.question_result(call_id, answer)?;
            }
            QueryEvent::Debug { message } => {
                // No interactive debugger here: log the stop and resume.
                tracing::info!(target: "writ", "{}", message);
                self.inner.debug_command("continue")?;
                check_messages!(self.inner);
            }
        }
        Ok(Step::Continue)
    }

    fn value(&self, term: &Term) -> crate::Result<WritValue> {
        WritValue::from_term(term, &self.host)
    }

    fn values(&self, terms: &[Term]) -> crate::Result<Vec<WritValue>> {
        terms.iter().map(|term| self.value(term)).collect()
    }

    fn instance(&self, term: &Term) -> crate::Result<Instance> {
        Instance::from_writ(self.value(term)?)
    }

    fn answer(&mut self, call_id: u64, value: Option<WritValue>) -> crate::Result<()> {
        let term = value.map(|v| v.to_term(&mut self.host));
        Ok(self.inner.call_result(call_id, term)?)
    }

    fn application_error(&mut self, call_id: u64, error: WritError) -> crate::Result<()> {
        tracing::error!(call_id, "application error {}", error);
        Ok(self.inner.application_error(call_id, error.to_string())?)
    }

    fn make_external(&mut self, instance_id: u64, constructor: &Term) -> crate::Result<()> {
        let Call { name, args, kwargs } = match constructor.value() {
            Value::Call(call) => call,
            _ => return lazy_error!("invalid type for constructing an instance -- internal error"),
        };
        if kwargs.as_ref().map_or(false, |kwargs| !kwargs.is_empty()) {
            return Err(InvalidCallError::KeywordArguments {
                type_name: name.0.clone(),
            }
            .into());
        }
        let args = self.values(args)?;
        self.host.make_instance(&name.0, args, instance_id)
    }

    fn next_external(&mut self, call_id: u64, iterable: &Term) -> crate::Result<()> {
        if !self.iterators.contains_key(&call_id) {
            let iter = self.instance(iterable)?.as_iter(&self.host)?;
            self.iterators.insert(call_id, iter);
        }
        let next = self.iterators.get_mut(&call_id).and_then(Iterator::next);
        if !matches!(next, Some(Ok(_))) {
            self.iterators.remove(&call_id);
        }
        match next {
            Some(Ok(value)) => self.answer(call_id, Some(value)),
            Some(Err(e)) => self.application_error(call_id, e),
            None => self.answer(call_id, None),
        }
    }

    /// `instance.attribute` when `args` is `None`, otherwise a method call.
    fn external_call(
        &mut self,
        call_id: u64,
        instance: &Term,
        attribute: Symbol,
        args: Option<Vec<Term>>,
        kwargs: Option<BTreeMap<Symbol, Term>>,
    ) -> crate::Result<()> {
        let instance = self.instance(instance)?;
        if kwargs.map_or(false, |kwargs| !kwargs.is_empty()) {
            let type_name = instance.name(&self.host).to_owned();
            return self.application_error(call_id, InvalidCallError::KeywordArguments { type_name }.into());
        }
        tracing::trace!(call_id, attribute = %attribute, ?args, "external call");
        let result = match args {
            Some(args) => {
                let args = self.values(&args)?;
                instance.call(&attribute.0, args, &mut self.host)
            }
            None => instance.get_attr(&attribute.0, &mut self.host),
        };
        match result {
            Ok(value) => self.answer(call_id, Some(value)),
            // Name the attribute the application failed in.
            Err(WritError::ApplicationError { source, attr: None }) => self.application_error(
                call_id,
                WritError::ApplicationError {
                    source,
                    attr: Some(attribute.0),
                },
            ),
            Err(e) if reported_to_vm(&e) => self.application_error(call_id, e),
            Err(e) => Err(e),
        }
    }

    fn external_op(&mut self, operator: Operator, args: &[Term]) -> crate::Result<bool> {
        match args {
            [left, right] => {
                let operands = [self.instance(left)?, self.instance(right)?];
                self.host.operator(operator, operands)
            }
            _ => lazy_error!("expected two operands for {:?}, got {}", operator, args.len()),
        }
    }
}

/// The bindings of one answer to a query.
#[derive(Clone)]
pub struct ResultSet {
    pub(crate) bindings: writ_core::bindings::Bindings,
    host: Host,
}

impl ResultSet {
    /// Names of the bound variables.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.bindings.keys().map(|sym| sym.0.as_str())
    }

    pub fn iter_bindings(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.bindings
            .iter()
            .map(|(name, term)| (name.0.as_str(), term.value()))
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// The value bound to `name`. `None` if it is unbound or cannot be
    /// converted, e.g. a residual expression.
    pub fn get(&self, name: &str) -> Option<WritValue> {
        let term = self.bindings.get(&Symbol::new(name))?;
        WritValue::from_term(term, &self.host).ok()
    }

    pub fn get_typed<T: FromWrit>(&self, name: &str) -> crate::Result<T> {
        match self.bindings.get(&Symbol::new(name)) {
            Some(term) => T::from_writ(WritValue::from_term(term, &self.host)?),
            None => Err(WritError::Custom {
                message: format!("no binding for `{}`", name),
            }),
        }
    }
}

impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.iter_bindings()).finish()
    }
}

/// A result equals a map when every entry of the map is bound to an
/// equal value.
impl<S, T> PartialEq<HashMap<S, T>> for ResultSet
where
    S: AsRef<str>,
    T: FromWrit + PartialEq,
{
    fn eq(&self, expected: &HashMap<S, T>) -> bool {
        expected.iter().all(|(name, value)| {
            self.get_typed::<T>(name.as_ref())
                .map_or(false, |bound| &bound == value)
        })
    }
}

// Host callbacks are not thread safe, so neither are queries.
#[cfg(test)]
static_assertions::assert_not_impl_any!(Query: Send, Sync);
