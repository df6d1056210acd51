//! Wrapper structs for the generic `Function` and `Method` traits
use std::sync::Arc;

use super::class::{Class, Instance};
use super::from_writ::FromWritList;
use super::method::{Function, Method};
use super::to_writ::{ToWritResults, WritIter};
use super::Host;
use super::WritValue;

fn join<A, B>(left: crate::Result<A>, right: crate::Result<B>) -> crate::Result<(A, B)> {
    left.and_then(|l| right.map(|r| (l, r)))
}

/// A lookup answers with exactly one value; the first result wins.
fn single<R: ToWritResults>(result: R) -> crate::Result<WritValue> {
    result
        .to_writ_results()
        .next()
        .unwrap_or_else(|| lazy_error!("method returned no result"))
}

type TypeErasedFunction<R> = Arc<dyn Fn(Vec<WritValue>) -> crate::Result<R> + Send + Sync>;
type TypeErasedMethod<R> =
    Arc<dyn Fn(&Instance, Vec<WritValue>, &Host) -> crate::Result<R> + Send + Sync>;

#[derive(Clone)]
pub struct Constructor(TypeErasedFunction<Instance>);

impl Constructor {
    pub fn new<Args, F>(f: F) -> Self
    where
        Args: FromWritList,
        F: Function<Args>,
        F::Result: Send + Sync + 'static,
    {
        Constructor(Arc::new(move |args: Vec<WritValue>| {
            Args::from_writ_list(&args).map(|args| Instance::new(f.invoke(args)))
        }))
    }

    pub fn invoke(&self, args: Vec<WritValue>) -> crate::Result<Instance> {
        self.0(args)
    }
}

#[derive(Clone)]
pub struct AttributeGetter(TypeErasedMethod<WritValue>);

impl AttributeGetter {
    pub fn new<T, F, R>(f: F) -> Self
    where
        T: 'static,
        F: Fn(&T) -> R + Send + Sync + 'static,
        R: crate::ToWrit,
    {
        Self(Arc::new(
            move |receiver: &Instance, _args: Vec<WritValue>, host: &Host| {
                receiver
                    .downcast::<T>(Some(host))
                    .map(|receiver| f(receiver).to_writ())
                    .map_err(|e| e.invariant())
            },
        ))
    }

    pub fn invoke(&self, receiver: &Instance, host: &Host) -> crate::Result<WritValue> {
        self.0(receiver, vec![], host)
    }
}

#[derive(Clone)]
pub struct InstanceMethod(TypeErasedMethod<WritValue>);

impl InstanceMethod {
    pub fn new<T, F, Args>(f: F) -> Self
    where
        Args: FromWritList,
        F: Method<T, Args>,
        F::Result: ToWritResults,
        T: 'static,
    {
        Self(Arc::new(
            move |receiver: &Instance, args: Vec<WritValue>, host: &Host| {
                let receiver = receiver
                    .downcast::<T>(Some(host))
                    .map_err(|e| e.invariant());
                let args = Args::from_writ_list(&args);
                join(receiver, args).and_then(|(receiver, args)| single(f.invoke(receiver, args)))
            },
        ))
    }

    /// Every item the method yields ends up in one list, so policies
    /// iterate it with `in`.
    pub fn new_iterator<T, F, Args, I>(f: F) -> Self
    where
        Args: FromWritList,
        F: Method<T, Args>,
        F::Result: IntoIterator<Item = I>,
        <<F as Method<T, Args>>::Result as IntoIterator>::IntoIter: Sized + 'static,
        I: ToWritResults + 'static,
        T: 'static,
    {
        Self(Arc::new(
            move |receiver: &Instance, args: Vec<WritValue>, host: &Host| {
                let receiver = receiver
                    .downcast::<T>(Some(host))
                    .map_err(|e| e.invariant());
                let args = Args::from_writ_list(&args);
                join(receiver, args).and_then(|(receiver, args)| {
                    WritIter {
                        iter: f.invoke(receiver, args).into_iter(),
                    }
                    .to_writ_results()
                    .collect::<crate::Result<Vec<_>>>()
                    .map(WritValue::List)
                })
            },
        ))
    }

    /// Methods called on a registered class constant are its class methods.
    pub fn from_class_method(name: String) -> Self {
        Self(Arc::new(
            move |receiver: &Instance, args: Vec<WritValue>, host: &Host| {
                receiver
                    .downcast::<Class>(Some(host))
                    .map_err(|e| e.invariant())
                    .and_then(|class| {
                        tracing::trace!(class = %class.name, method = %name, "class_method");
                        class.call(&name, args)
                    })
            },
        ))
    }

    pub fn invoke(
        &self,
        receiver: &Instance,
        args: Vec<WritValue>,
        host: &Host,
    ) -> crate::Result<WritValue> {
        self.0(receiver, args, host)
    }
}

#[derive(Clone)]
pub struct ClassMethod(TypeErasedFunction<WritValue>);

impl ClassMethod {
    pub fn new<F, Args>(f: F) -> Self
    where
        Args: FromWritList,
        F: Function<Args>,
        F::Result: ToWritResults,
    {
        Self(Arc::new(move |args: Vec<WritValue>| {
            Args::from_writ_list(&args).and_then(|args| single(f.invoke(args)))
        }))
    }

    pub fn invoke(&self, args: Vec<WritValue>) -> crate::Result<WritValue> {
        self.0(args)
    }
}

/// Runs against the `Writ` instance a class is registered on.
#[derive(Clone)]
pub struct RegisterHook(Arc<dyn Fn(&mut crate::Writ) -> crate::Result<()> + Send + Sync>);

impl RegisterHook {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut crate::Writ) -> crate::Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, writ: &mut crate::Writ) -> crate::Result<()> {
        (self.0)(writ)
    }
}

/// Type-erased versions of the data filtering callbacks.
pub(crate) type BuildQuery =
    Arc<dyn Fn(&writ_core::filter::Filter) -> crate::Result<Instance> + Send + Sync>;
pub(crate) type CombineQuery =
    Arc<dyn Fn(&Instance, &Instance) -> crate::Result<Instance> + Send + Sync>;
pub(crate) type ExecQuery = Arc<dyn Fn(&Instance) -> crate::Result<Vec<Instance>> + Send + Sync>;
