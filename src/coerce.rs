//! Turning application values into something CA can write.
//!
//! Interactive front ends hand over loosely typed values: a bare number, a
//! list of numbers, a string. [`coerce_writable`] normalizes any of these to a
//! [`DbrValue`] array. Values that are already protocol arrays pass straight
//! through; scalars become one-element arrays; lists are converted element by
//! element through the coercion table.

use thiserror::Error;

use crate::dbr::{DbrBasicType, DbrValue};

/// A dynamically typed value supplied by an application
#[derive(Clone, Debug, PartialEq)]
pub enum AppValue {
    Double(f64),
    Float(f32),
    Long(i32),
    Short(i16),
    Byte(i8),
    Str(String),
    UByte(u8),
    UShort(u16),
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    UInt(u32),
    /// A generic list of values, converted element by element
    List(Vec<AppValue>),
    /// An array already in a protocol-transmittable form
    Array(DbrValue),
}

/// The element kind of a scalar [`AppValue`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Double,
    Float,
    Long,
    Short,
    Byte,
    Str,
    UByte,
    UShort,
    Bool,
    Int64,
    UInt64,
    UInt,
}

/// Element kinds that can be put, and the array type each one becomes.
/// Kinds missing from here cannot be written.
const COERCION_TABLE: [(ElementKind, DbrBasicType); 9] = [
    (ElementKind::Double, DbrBasicType::Double),
    (ElementKind::Float, DbrBasicType::Float),
    (ElementKind::Long, DbrBasicType::Long),
    (ElementKind::Short, DbrBasicType::Int),
    (ElementKind::Byte, DbrBasicType::Char),
    (ElementKind::Str, DbrBasicType::String),
    (ElementKind::UByte, DbrBasicType::Int),
    (ElementKind::UShort, DbrBasicType::Long),
    (ElementKind::Bool, DbrBasicType::Char),
];

/// Look up the protocol array type an element kind is written as
pub fn writable_type(kind: ElementKind) -> Option<DbrBasicType> {
    COERCION_TABLE
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, basic)| *basic)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoercionError {
    #[error("Unable to coerce {0:?} into a CA writable type")]
    Unsupported(ElementKind),
    #[error("Unable to coerce a nested list into a CA writable type")]
    Nested,
    #[error("Unable to coerce a list mixing {0:?} and {1:?} elements")]
    Mixed(ElementKind, ElementKind),
    #[error("Unable to infer an element type for an empty list")]
    Empty,
}

impl AppValue {
    /// The kind of this value, if it is a scalar
    pub fn kind(&self) -> Option<ElementKind> {
        Some(match self {
            AppValue::Double(_) => ElementKind::Double,
            AppValue::Float(_) => ElementKind::Float,
            AppValue::Long(_) => ElementKind::Long,
            AppValue::Short(_) => ElementKind::Short,
            AppValue::Byte(_) => ElementKind::Byte,
            AppValue::Str(_) => ElementKind::Str,
            AppValue::UByte(_) => ElementKind::UByte,
            AppValue::UShort(_) => ElementKind::UShort,
            AppValue::Bool(_) => ElementKind::Bool,
            AppValue::Int64(_) => ElementKind::Int64,
            AppValue::UInt64(_) => ElementKind::UInt64,
            AppValue::UInt(_) => ElementKind::UInt,
            AppValue::List(_) | AppValue::Array(_) => return None,
        })
    }
}

/// Normalize an application value into a writable protocol array
pub fn coerce_writable(value: AppValue) -> Result<DbrValue, CoercionError> {
    let items = match value {
        AppValue::Array(array) => return Ok(array),
        AppValue::List(items) => items,
        scalar => vec![scalar],
    };

    let mut kinds = items.iter().map(|item| item.kind().ok_or(CoercionError::Nested));
    let kind = kinds.next().ok_or(CoercionError::Empty)??;
    for other in kinds {
        let other = other?;
        if other != kind {
            return Err(CoercionError::Mixed(kind, other));
        }
    }
    let basic_type = writable_type(kind).ok_or(CoercionError::Unsupported(kind))?;

    Ok(match basic_type {
        DbrBasicType::Double => DbrValue::Double(items.into_iter().filter_map(as_f64).collect()),
        DbrBasicType::Float => DbrValue::Float(
            items
                .into_iter()
                .filter_map(|v| match v {
                    AppValue::Float(f) => Some(f),
                    _ => None,
                })
                .collect(),
        ),
        DbrBasicType::Long => DbrValue::Long(items.into_iter().filter_map(as_i32).collect()),
        DbrBasicType::Int => DbrValue::Int(
            items
                .into_iter()
                .filter_map(|v| match v {
                    AppValue::Short(s) => Some(s),
                    AppValue::UByte(b) => Some(i16::from(b)),
                    _ => None,
                })
                .collect(),
        ),
        DbrBasicType::Char => DbrValue::Char(
            items
                .into_iter()
                .filter_map(|v| match v {
                    AppValue::Byte(b) => Some(b),
                    AppValue::Bool(b) => Some(i8::from(b)),
                    _ => None,
                })
                .collect(),
        ),
        DbrBasicType::String => DbrValue::String(
            items
                .into_iter()
                .filter_map(|v| match v {
                    AppValue::Str(s) => Some(s),
                    _ => None,
                })
                .collect(),
        ),
        DbrBasicType::Enum => return Err(CoercionError::Unsupported(kind)),
    })
}

fn as_f64(value: AppValue) -> Option<f64> {
    match value {
        AppValue::Double(d) => Some(d),
        _ => None,
    }
}

fn as_i32(value: AppValue) -> Option<i32> {
    match value {
        AppValue::Long(l) => Some(l),
        AppValue::UShort(u) => Some(i32::from(u)),
        _ => None,
    }
}

macro_rules! impl_app_value_from {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for AppValue {
            fn from(value: $typ) -> Self {
                AppValue::$variant(value)
            }
        }
    };
}
impl_app_value_from!(Double, f64);
impl_app_value_from!(Float, f32);
impl_app_value_from!(Long, i32);
impl_app_value_from!(Short, i16);
impl_app_value_from!(Byte, i8);
impl_app_value_from!(Str, String);
impl_app_value_from!(UByte, u8);
impl_app_value_from!(UShort, u16);
impl_app_value_from!(Bool, bool);
impl_app_value_from!(Int64, i64);
impl_app_value_from!(UInt64, u64);
impl_app_value_from!(UInt, u32);
impl_app_value_from!(List, Vec<AppValue>);
impl_app_value_from!(Array, DbrValue);

impl From<&str> for AppValue {
    fn from(value: &str) -> Self {
        AppValue::Str(value.to_owned())
    }
}

/// Vectors of protocol primitives are already arrays
macro_rules! impl_app_value_from_array {
    ($typ:ty) => {
        impl From<Vec<$typ>> for AppValue {
            fn from(value: Vec<$typ>) -> Self {
                AppValue::Array(value.into())
            }
        }
        impl From<&[$typ]> for AppValue {
            fn from(value: &[$typ]) -> Self {
                AppValue::Array(value.to_vec().into())
            }
        }
    };
}
impl_app_value_from_array!(f64);
impl_app_value_from_array!(f32);
impl_app_value_from_array!(i32);
impl_app_value_from_array!(i16);
impl_app_value_from_array!(i8);
impl_app_value_from_array!(String);

/// Vectors of everything else go through the coercion table
macro_rules! impl_app_value_from_list {
    ($typ:ty) => {
        impl From<Vec<$typ>> for AppValue {
            fn from(value: Vec<$typ>) -> Self {
                AppValue::List(value.into_iter().map(AppValue::from).collect())
            }
        }
    };
}
impl_app_value_from_list!(u8);
impl_app_value_from_list!(u16);
impl_app_value_from_list!(bool);
impl_app_value_from_list!(i64);
impl_app_value_from_list!(u64);
impl_app_value_from_list!(u32);
impl_app_value_from_list!(&str);
