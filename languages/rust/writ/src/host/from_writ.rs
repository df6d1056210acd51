#![allow(clippy::many_single_char_names, clippy::type_complexity)]
//! Trait and implementations of `FromWrit` for converting from
//! policy values back to Rust types.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::convert::TryFrom;
use std::hash::Hash;

use impl_trait_for_tuples::*;

use super::class::Instance;
use super::WritValue;
use crate::errors::TypeError;
use crate::WritClass;

/// Convert policy values to Rust types.
///
/// This trait is automatically implemented for any
/// type that implements the `WritClass` trait,
/// which should be preferred.
///
/// ## Trait bounds
///
/// `FromWrit` requires `Clone` because we can only
/// get a borrowed value back from the host. In the future, this could
/// be updated to return borrowed data instead.
pub trait FromWrit: Clone {
    fn from_writ(val: WritValue) -> crate::Result<Self>;
}

impl FromWrit for WritValue {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        Ok(val)
    }
}

macro_rules! writ_to_int {
    ($($i:ty),*) => {
        $(impl FromWrit for $i {
            fn from_writ(val: WritValue) -> crate::Result<Self> {
                if let WritValue::Integer(i) = val {
                    <$i>::try_from(i).map_err(|_| crate::WritError::FromWrit)
                } else {
                    Err(TypeError::expected("Integer").got(val.type_name().to_string()).user())
                }
            }
        })*
    };
}

writ_to_int!(u8, i8, u16, i16, u32, i32, i64);

impl<T> FromWrit for T
where
    T: 'static + Clone + WritClass,
{
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        if let WritValue::Instance(instance) = val {
            Ok(instance.downcast::<T>(None).map_err(|e| e.user())?.clone())
        } else {
            Err(
                TypeError::expected(format!("Instance of {}", std::any::type_name::<T>()))
                    .got(val.type_name().to_string())
                    .user(),
            )
        }
    }
}

impl FromWrit for f64 {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        match val {
            WritValue::Float(f) => Ok(f),
            WritValue::Integer(i) => Ok(i as f64),
            _ => Err(TypeError::expected("Float").got(val.type_name().to_string()).user()),
        }
    }
}

impl FromWrit for String {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        if let WritValue::String(s) = val {
            Ok(s)
        } else {
            Err(TypeError::expected("String").got(val.type_name().to_string()).user())
        }
    }
}

impl FromWrit for bool {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        if let WritValue::Boolean(b) = val {
            Ok(b)
        } else {
            Err(TypeError::expected("Boolean").got(val.type_name().to_string()).user())
        }
    }
}

fn expect_map(val: WritValue) -> crate::Result<HashMap<String, WritValue>> {
    if let WritValue::Map(map) = val {
        Ok(map)
    } else {
        Err(TypeError::expected("Map").got(val.type_name().to_string()).user())
    }
}

fn expect_list(val: WritValue) -> crate::Result<Vec<WritValue>> {
    if let WritValue::List(l) = val {
        Ok(l)
    } else {
        Err(TypeError::expected("List").got(val.type_name().to_string()).user())
    }
}

impl<T: FromWrit> FromWrit for HashMap<String, T> {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        expect_map(val)?
            .into_iter()
            .map(|(k, v)| T::from_writ(v).map(|v| (k, v)))
            .collect()
    }
}

impl<T: FromWrit> FromWrit for BTreeMap<String, T> {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        expect_map(val)?
            .into_iter()
            .map(|(k, v)| T::from_writ(v).map(|v| (k, v)))
            .collect()
    }
}

impl<T: FromWrit> FromWrit for Vec<T> {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        expect_list(val)?.into_iter().map(T::from_writ).collect()
    }
}

impl<T: FromWrit> FromWrit for VecDeque<T> {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        expect_list(val)?.into_iter().map(T::from_writ).collect()
    }
}

impl<T: Eq + Hash + FromWrit> FromWrit for HashSet<T> {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        expect_list(val)?.into_iter().map(T::from_writ).collect()
    }
}

impl<T: Eq + Ord + FromWrit> FromWrit for BTreeSet<T> {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        expect_list(val)?.into_iter().map(T::from_writ).collect()
    }
}

impl<T: FromWrit> FromWrit for Option<T> {
    fn from_writ(val: WritValue) -> crate::Result<Self> {
        // An `Option<WritValue>` instance round-trips as itself.
        if let WritValue::Instance(ref instance) = &val {
            if let Ok(opt) = instance.downcast::<Option<WritValue>>(None) {
                return opt.clone().map(T::from_writ).transpose();
            }
        }
        T::from_writ(val).map(Some)
    }
}

macro_rules! try_from_writ {
    ($($i:ty),*) => {
        $(impl TryFrom<WritValue> for $i {
            type Error = crate::WritError;

            fn try_from(v: WritValue) -> Result<Self, Self::Error> {
                Self::from_writ(v)
            }
        })*
    };
}

try_from_writ!(u8, i8, u16, i16, u32, i32, i64, f64, String, bool);

mod private {
    /// Prevents implementations of `FromWritList` outside of this crate
    pub trait Sealed {}
}

/// Argument lists of host methods: tuples of `FromWrit` values.
pub trait FromWritList: private::Sealed {
    fn from_writ_list(values: &[WritValue]) -> crate::Result<Self>
    where
        Self: Sized;
}

impl FromWrit for Instance {
    fn from_writ(value: WritValue) -> crate::Result<Self> {
        // Every value becomes an instance so built-in classes can
        // dispatch methods on them.
        let instance = match value {
            WritValue::Boolean(b) => Instance::new(b),
            WritValue::Integer(i) => Instance::new(i),
            WritValue::Float(f) => Instance::new(f),
            WritValue::List(v) => Instance::new(v),
            WritValue::String(s) => Instance::new(s),
            WritValue::Map(d) => Instance::new(d),
            WritValue::Instance(instance) => instance,
            v => {
                tracing::warn!(value = ?v, "invalid conversion attempted");
                return Err(crate::WritError::FromWrit);
            }
        };
        Ok(instance)
    }
}

#[impl_for_tuples(16)]
#[tuple_types_custom_trait_bound(FromWrit)]
impl FromWritList for Tuple {
    fn from_writ_list(values: &[WritValue]) -> crate::Result<Self> {
        let mut iter = values.iter();
        let result = Ok((for_tuples!(
            #( Tuple::from_writ(iter.next().ok_or_else(|| TypeError::expected("more arguments").user())?.clone())? ),*
        )));

        if iter.len() > 0 {
            return Err(TypeError::expected(format!("{} arguments", values.len() - iter.len()))
                .got(format!("{} arguments", values.len()))
                .user());
        }

        result
    }
}

#[impl_for_tuples(16)]
#[tuple_types_custom_trait_bound(FromWrit)]
impl private::Sealed for Tuple {}
