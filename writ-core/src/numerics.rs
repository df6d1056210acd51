use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Sub};

use serde::{Deserialize, Serialize};

/// Integers up to 2^53 survive a conversion to `f64` unchanged.
pub const MOST_POSITIVE_EXACT_FLOAT: i64 = 1 << 53;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Numeric {
    Integer(i64),
    Float(f64),
}

impl Numeric {
    fn as_f64(self) -> f64 {
        match self {
            Self::Integer(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            Self::Integer(i) => i == 0,
            Self::Float(f) => f == 0.0,
        }
    }

    /// Remainder with the sign of the divisor.
    pub fn modulo(self, other: Self) -> Option<Self> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a
                .checked_rem(b)
                .and_then(|r| if r != 0 && (r < 0) != (b < 0) { r.checked_add(b) } else { Some(r) })
                .map(Self::Integer),
            (a, b) => {
                let (a, b) = (a.as_f64(), b.as_f64());
                let r = a % b;
                Some(Self::Float(if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }))
            }
        }
    }

    /// Remainder with the sign of the dividend.
    pub fn remainder(self, other: Self) -> Option<Self> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.checked_rem(b).map(Self::Integer),
            (a, b) => Some(Self::Float(a.as_f64() % b.as_f64())),
        }
    }
}

macro_rules! checked_numeric_op {
    ($trait:ident, $method:ident, $checked:ident, $op:tt) => {
        impl $trait for Numeric {
            type Output = Option<Self>;

            fn $method(self, other: Self) -> Option<Self> {
                match (self, other) {
                    (Self::Integer(a), Self::Integer(b)) => a.$checked(b).map(Self::Integer),
                    (a, b) => Some(Self::Float(a.as_f64() $op b.as_f64())),
                }
            }
        }
    };
}

checked_numeric_op!(Add, add, checked_add, +);
checked_numeric_op!(Sub, sub, checked_sub, -);
checked_numeric_op!(Mul, mul, checked_mul, *);

impl Div for Numeric {
    type Output = Option<Self>;

    /// Division always yields a float.
    fn div(self, other: Self) -> Option<Self> {
        Some(Self::Float(self.as_f64() / other.as_f64()))
    }
}

impl PartialEq for Numeric {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl Eq for Numeric {}

impl Hash for Numeric {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Integral floats hash like the equal integer.
        match *self {
            Self::Integer(i) => i.hash(state),
            Self::Float(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < -(i64::MIN as f64) => {
                (f as i64).hash(state)
            }
            Self::Float(f) => f.to_bits().hash(state),
        }
    }
}

/// Compare an integer against a float without losing precision on either
/// side of the 53-bit boundary.
fn compare_int_float(i: i64, f: f64) -> Option<Ordering> {
    if f.is_nan() {
        None
    } else if -MOST_POSITIVE_EXACT_FLOAT < i && i < MOST_POSITIVE_EXACT_FLOAT {
        (i as f64).partial_cmp(&f)
    } else if f >= -(i64::MIN as f64) {
        Some(Ordering::Less)
    } else if f < i64::MIN as f64 {
        Some(Ordering::Greater)
    } else {
        // |f| >= 2^53 here, so it has no fractional part.
        i.partial_cmp(&(f as i64))
    }
}

impl PartialOrd for Numeric {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (*self, *other) {
            (Self::Integer(a), Self::Integer(b)) => a.partial_cmp(&b),
            (Self::Integer(i), Self::Float(f)) => compare_int_float(i, f),
            (Self::Float(f), Self::Integer(i)) => compare_int_float(i, f).map(Ordering::reverse),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(&b),
        }
    }
}

impl From<i64> for Numeric {
    fn from(other: i64) -> Self {
        Self::Integer(other)
    }
}

impl From<f64> for Numeric {
    fn from(other: f64) -> Self {
        Self::Float(other)
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(x) if x.is_infinite() && x.is_sign_positive() => write!(f, "Infinity"),
            Self::Float(x) if x.is_infinite() => write!(f, "-Infinity"),
            Self::Float(x) if x.is_nan() => write!(f, "NaN"),
            Self::Float(x) if x.fract() == 0.0 => write!(f, "{:.1}", x),
            Self::Float(x) => write!(f, "{}", x),
        }
    }
}
