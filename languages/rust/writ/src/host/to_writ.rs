//! Trait and implementations of `ToWrit` for converting from
//! Rust types to policy values.

use impl_trait_for_tuples::*;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::iter;
use std::sync::{Mutex, PoisonError};

use crate::WritValue;

lazy_static::lazy_static! {
    /// Classes of every `WritClass` type converted so far. A type used
    /// before it is registered still gets its class metadata this way.
    pub static ref DEFAULT_CLASSES: Mutex<HashMap<std::any::TypeId, super::Class>> = Default::default();
}

/// Convert Rust types to policy values.
///
/// This trait is automatically implemented for any
/// type that implements the `WritClass` marker trait,
/// which should be preferred.
///
/// For non-primitive types, the instance will be stored
/// on the provided `Host`.
///
/// ## Trait bounds
///
/// `ToWrit` requires types to be `Send + Sync`, since it
/// is possible to store a `ToWrit` value on a `Writ` instance
/// which can be shared between threads.
///
/// `ToWrit` implementors must also be concrete, sized types without
/// any borrows.
pub trait ToWrit: Send + Sync + Sized + 'static {
    fn to_writ(self) -> WritValue;
}

/// Name of the class a `WritClass` type was converted with, for types
/// that were never registered.
pub(crate) fn default_class_name(id: std::any::TypeId) -> Option<String> {
    DEFAULT_CLASSES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .map(|class| class.name.clone())
}

impl<C: crate::WritClass + Send + Sync> ToWrit for C {
    fn to_writ(self) -> WritValue {
        DEFAULT_CLASSES
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(std::any::TypeId::of::<C>())
            .or_insert_with(C::get_writ_class);

        WritValue::new_from_instance(self)
    }
}

mod private {
    /// Prevents implementations of `ToWritList` outside of this crate
    pub trait Sealed {}
}

/// Argument lists for `query_rule`: tuples of `ToWrit` values.
pub trait ToWritList: private::Sealed {
    fn to_writ_list(self) -> Vec<WritValue>
    where
        Self: Sized;
}

#[impl_for_tuples(16)]
#[tuple_types_custom_trait_bound(ToWrit + 'static)]
impl private::Sealed for Tuple {}

#[impl_for_tuples(16)]
#[tuple_types_custom_trait_bound(ToWrit + 'static)]
impl ToWritList for Tuple {
    fn to_writ_list(self) -> Vec<WritValue> {
        let mut result = Vec::new();
        for_tuples!(
            #( result.push(self.Tuple.to_writ()); )*
        );
        result
    }
}

impl ToWrit for bool {
    fn to_writ(self) -> WritValue {
        WritValue::Boolean(self)
    }
}

macro_rules! int_to_writ {
    ($($i:ty),*) => {
        $(impl ToWrit for $i {
            fn to_writ(self) -> WritValue {
                WritValue::Integer(self.into())
            }
        })*
    };
}

int_to_writ!(u8, i8, u16, i16, u32, i32, i64);

macro_rules! float_to_writ {
    ($($i:ty),*) => {
        $(impl ToWrit for $i {
            fn to_writ(self) -> WritValue {
                WritValue::Float(self.into())
            }
        })*
    };
}

float_to_writ!(f32, f64);

impl ToWrit for String {
    fn to_writ(self) -> WritValue {
        WritValue::String(self)
    }
}

impl ToWrit for &'static str {
    fn to_writ(self) -> WritValue {
        WritValue::String(self.to_string())
    }
}

impl<T: ToWrit> ToWrit for Vec<T> {
    fn to_writ(self) -> WritValue {
        WritValue::List(self.into_iter().map(|v| v.to_writ()).collect())
    }
}

impl<T: ToWrit> ToWrit for HashSet<T> {
    fn to_writ(self) -> WritValue {
        WritValue::List(self.into_iter().map(|v| v.to_writ()).collect())
    }
}

impl<T: ToWrit> ToWrit for HashMap<String, T> {
    fn to_writ(self) -> WritValue {
        WritValue::Map(self.into_iter().map(|(k, v)| (k, v.to_writ())).collect())
    }
}

impl<T: ToWrit> ToWrit for BTreeMap<String, T> {
    fn to_writ(self) -> WritValue {
        WritValue::Map(self.into_iter().map(|(k, v)| (k, v.to_writ())).collect())
    }
}

impl ToWrit for WritValue {
    fn to_writ(self) -> WritValue {
        self
    }
}

impl<T: ToWrit> ToWrit for Option<T> {
    fn to_writ(self) -> WritValue {
        match self {
            Some(t) => t.to_writ(),
            None => WritValue::new_from_instance(Option::<WritValue>::None),
        }
    }
}

pub type WritResultIter = Box<dyn Iterator<Item = crate::Result<WritValue>> + 'static>;

/// Return values of methods: plain values, as well as options
/// and results of values.
pub trait ToWritResults {
    fn to_writ_results(self) -> WritResultIter;
}

impl<C: 'static + Sized + ToWrit> ToWritResults for C {
    fn to_writ_results(self) -> WritResultIter {
        Box::new(iter::once(Ok(self.to_writ())))
    }
}

impl<C, E> ToWritResults for Result<C, E>
where
    C: ToWritResults,
    E: std::error::Error + 'static + Send + Sync,
{
    fn to_writ_results(self) -> WritResultIter {
        match self {
            Ok(result) => result.to_writ_results(),
            Err(e) => Box::new(iter::once(Err(crate::WritError::ApplicationError {
                source: Box::new(e),
                attr: None,
            }))),
        }
    }
}

/// Adapts an iterator of method results into a single `WritResultIter`.
pub struct WritIter<I, Iter>
where
    I: ToWritResults + 'static,
    Iter: std::iter::Iterator<Item = I> + Sized + 'static,
{
    pub iter: Iter,
}

impl<I: ToWritResults + 'static, Iter: std::iter::Iterator<Item = I> + Sized + 'static>
    ToWritResults for WritIter<I, Iter>
{
    fn to_writ_results(self) -> WritResultIter {
        Box::new(self.iter.flat_map(|i| i.to_writ_results())) as WritResultIter
    }
}
