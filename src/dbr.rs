//! Represent CA DBR representations, for data interchange.
//!
//! CA transfers data as [DBR] kinds. These break down into seven basic array
//! types, which define the data, and categories of attached metadata. This
//! module models the subset a client session needs, and provides tools for
//! converting between data types.
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`] - all numeric data types in CA are signed, and all but `Enum`
//! are arrays. The options, and the native type used to represent, are:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`])
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`]), the index of a state string.
//! - [`DbrValue::String`] - natively in CA this is a `[u8; 40]`, but here is
//!   represented by [`Vec<String>`].
//!
//! The protocol also defines `SHORT` as an alias for `INT`, which is accepted
//! when parsing type names but otherwise ignored.
//!
//! The metadata categories handled here are enumerated by [`DbrCategory`] and
//! represented by [`Dbr`]:
//! - [`Dbr::Basic`] - No extra metadata included, just the plain data value.
//! - [`Dbr::Status`] - Alarm status and severity in addition to the data.
//! - [`Dbr::Time`] - All of the information from [`Dbr::Status`], with an
//!   associated timestamp.
//!
//! When a caller does not ask for a specific type, reads and subscriptions
//! request the channel's native type "promoted" to its `Time` category, see
//! [`promote`].
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types
//!
use num::NumCast;
use num::cast::AsPrimitive;
use std::{convert::TryFrom, fmt, str::FromStr, time::SystemTime};

use thiserror::Error;

use crate::status::CaStatus;

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

/// Types of errors that can be returned from [`DbrValue::parse_into`]
#[derive(Debug, PartialEq, Error)]
pub enum DbrParseError {
    #[error("Only string values can be parsed")]
    SelfIsNotString,
    #[error("Cannot parse '{0}'")]
    CannotParse(String),
    #[error("Unknown DBR type '{0}'")]
    UnknownType(String),
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Keep at most `count` elements. Enum values are always single-valued.
    pub fn truncate(&mut self, count: usize) {
        match self {
            DbrValue::Enum(_) => (),
            DbrValue::String(items) => items.truncate(count),
            DbrValue::Char(items) => items.truncate(count),
            DbrValue::Int(items) => items.truncate(count),
            DbrValue::Long(items) => items.truncate(count),
            DbrValue::Float(items) => items.truncate(count),
            DbrValue::Double(items) => items.truncate(count),
        }
    }

    /// Render every element to a string, in order
    pub fn elements(&self) -> Vec<String> {
        fn _each<T: ToString>(from: &[T]) -> Vec<String> {
            from.iter().map(|v| v.to_string()).collect()
        }
        match self {
            DbrValue::Enum(val) => vec![val.to_string()],
            DbrValue::String(val) => val.clone(),
            DbrValue::Char(val) => _each(val),
            DbrValue::Int(val) => _each(val),
            DbrValue::Long(val) => _each(val),
            DbrValue::Float(val) => _each(val),
            DbrValue::Double(val) => _each(val),
        }
    }

    /// Convert a DbrValue::String to another data type by parsing the numeric string
    ///
    /// Fails if the DbrValue is not String or if the value cannot be parsed. Asking
    /// for a convertion from String->String just copies without doing any extra parsing.
    pub fn parse_into(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrParseError> {
        fn _parse_vec<T: FromStr>(from: &[String]) -> Result<Vec<T>, DbrParseError> {
            from.iter()
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(s.clone()))
                })
                .collect()
        }
        let DbrValue::String(val) = self else {
            return Err(DbrParseError::SelfIsNotString);
        };
        Ok(match basic_type {
            DbrBasicType::Enum => match val.as_slice() {
                [single] => DbrValue::Enum(
                    single
                        .trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(single.clone()))?,
                ),
                _ => return Err(DbrParseError::CannotParse(val.join(" "))),
            },
            DbrBasicType::String => self.clone(),
            DbrBasicType::Char => DbrValue::Char(_parse_vec(val)?),
            DbrBasicType::Int => DbrValue::Int(_parse_vec(val)?),
            DbrBasicType::Long => DbrValue::Long(_parse_vec(val)?),
            DbrBasicType::Float => DbrValue::Float(_parse_vec(val)?),
            DbrBasicType::Double => DbrValue::Double(_parse_vec(val)?),
        })
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, CaStatus> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, CaStatus>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(CaStatus::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a numeric array
        fn _encode_string<T>(from: &[String]) -> Result<Vec<T>, CaStatus>
        where
            T: Copy + 'static,
            u8: AsPrimitive<T>,
        {
            Ok(match from {
                [] => Vec::new(),
                [val] => val.as_bytes().iter().map(|c| c.as_()).collect(),
                _ => Err(CaStatus::NoConvert)?,
            })
        }

        Ok(match basic_type {
            DbrBasicType::Char => match self {
                DbrValue::Char(_val) => self.clone(),
                DbrValue::Int(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Char(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Char(vec![NumCast::from(*val).ok_or(CaStatus::NoConvert)?])
                }
            },
            DbrBasicType::Int => match self {
                DbrValue::Char(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Int(_val) => self.clone(),
                DbrValue::Long(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Int(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Int(vec![NumCast::from(*val).ok_or(CaStatus::NoConvert)?])
                }
            },
            DbrBasicType::Long => match self {
                DbrValue::Char(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Long(_val) => self.clone(),
                DbrValue::Float(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Long(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Long(vec![<i32 as From<u16>>::from(*val)]),
            },
            DbrBasicType::Float => match self {
                DbrValue::Char(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Float(_val) => self.clone(),
                DbrValue::Double(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Float(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Float(vec![<f32 as From<u16>>::from(*val)]),
            },
            DbrBasicType::Double => match self {
                DbrValue::Char(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Double(_val) => self.clone(),
                DbrValue::String(val) => DbrValue::Double(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Double(vec![<f64 as From<u16>>::from(*val)]),
            },
            DbrBasicType::String => match self {
                DbrValue::String(_) => self.clone(),
                DbrValue::Char(val) => DbrValue::String(vec![
                    String::from_utf8(
                        val.iter()
                            .take_while(|c| **c != 0)
                            .map(|c| *c as u8)
                            .collect(),
                    )
                    .map_err(|_| CaStatus::NoConvert)?,
                ]),
                // Every other numeric type renders element-wise
                other => DbrValue::String(other.elements()),
            },
            DbrBasicType::Enum => match self {
                DbrValue::Enum(_val) => self.clone(),
                DbrValue::String(_) => {
                    self.parse_into(DbrBasicType::Enum)
                        .map_err(|_| CaStatus::NoConvert)?
                }
                other => match other.convert_to(DbrBasicType::Long)? {
                    DbrValue::Long(v) if v.len() == 1 => {
                        DbrValue::Enum(NumCast::from(v[0]).ok_or(CaStatus::NoConvert)?)
                    }
                    _ => return Err(CaStatus::NoConvert),
                },
            },
        })
    }
}

impl fmt::Display for DbrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.elements().as_slice() {
            [single] => write!(f, "{single}"),
            many => write!(f, "[{}]", many.join(", ")),
        }
    }
}

/// Implement a From<datatype> for a specific dbrvalue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<&$typ> for DbrValue {
            fn from(value: &$typ) -> Self {
                DbrValue::$variant(vec![value.clone()])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = CaStatus;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => Ok(v),
                    _ => Err(CaStatus::NoConvert),
                }
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

macro_rules! impl_dbrvalue_copy_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
    };
}
impl_dbrvalue_copy_conversions_between!(Char, i8);
impl_dbrvalue_copy_conversions_between!(Int, i16);
impl_dbrvalue_copy_conversions_between!(Long, i32);
impl_dbrvalue_copy_conversions_between!(Float, f32);
impl_dbrvalue_copy_conversions_between!(Double, f64);
impl_dbrvalue_copy_conversions_between!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_owned()])
    }
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl DbrBasicType {
    /// Size in bytes of one element of this type on the wire
    pub fn element_size(&self) -> usize {
        match self {
            DbrBasicType::String => 40,
            DbrBasicType::Int => 2,
            DbrBasicType::Float => 4,
            DbrBasicType::Enum => 2,
            DbrBasicType::Char => 1,
            DbrBasicType::Long => 4,
            DbrBasicType::Double => 8,
        }
    }
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
}

/// Represent every combination of `DBR_*_*` that a session exchanges
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

impl DbrType {
    pub const fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
}

impl fmt::Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let category = match self.category {
            DbrCategory::Basic => "",
            DbrCategory::Status => "STS_",
            DbrCategory::Time => "TIME_",
        };
        let kind = match self.basic_type {
            DbrBasicType::String => "STRING",
            DbrBasicType::Int => "INT",
            DbrBasicType::Float => "FLOAT",
            DbrBasicType::Enum => "ENUM",
            DbrBasicType::Char => "CHAR",
            DbrBasicType::Long => "LONG",
            DbrBasicType::Double => "DOUBLE",
        };
        write!(f, "DBR_{category}{kind}")
    }
}

pub const DBR_TIME_STRING: DbrType = DbrType::new(DbrBasicType::String, DbrCategory::Time);
pub const DBR_TIME_INT: DbrType = DbrType::new(DbrBasicType::Int, DbrCategory::Time);
pub const DBR_TIME_FLOAT: DbrType = DbrType::new(DbrBasicType::Float, DbrCategory::Time);
pub const DBR_TIME_CHAR: DbrType = DbrType::new(DbrBasicType::Char, DbrCategory::Time);
pub const DBR_TIME_LONG: DbrType = DbrType::new(DbrBasicType::Long, DbrCategory::Time);
pub const DBR_TIME_DOUBLE: DbrType = DbrType::new(DbrBasicType::Double, DbrCategory::Time);

/// Native types that have a timestamped variant to request when the caller
/// does not ask for one. `Enum` is deliberately absent.
const PROMOTION_TABLE: [(DbrBasicType, DbrType); 6] = [
    (DbrBasicType::String, DBR_TIME_STRING),
    (DbrBasicType::Double, DBR_TIME_DOUBLE),
    (DbrBasicType::Float, DBR_TIME_FLOAT),
    (DbrBasicType::Long, DBR_TIME_LONG),
    (DbrBasicType::Int, DBR_TIME_INT),
    (DbrBasicType::Char, DBR_TIME_CHAR),
];

/// Promote a channel's native field type to the matching `Time` type.
///
/// A channel whose field type is not known to the protocol client (`None`)
/// is read as [`DBR_TIME_STRING`]. A known type without an entry in the
/// table returns `None`.
pub fn promote(native: Option<DbrBasicType>) -> Option<DbrType> {
    let Some(native) = native else {
        return Some(DBR_TIME_STRING);
    };
    PROMOTION_TABLE
        .iter()
        .find(|(basic, _)| *basic == native)
        .map(|(_, promoted)| *promoted)
}

impl FromStr for DbrType {
    type Err = DbrParseError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let unknown = || DbrParseError::UnknownType(name.to_owned());
        let upper = name.to_uppercase();
        let s = upper.strip_prefix("DBR_").unwrap_or(&upper);
        let (category, s) = match s.split_once('_') {
            Some(("BASIC", rest)) => (DbrCategory::Basic, rest),
            Some(("STS", rest)) => (DbrCategory::Status, rest),
            Some(("TIME", rest)) => (DbrCategory::Time, rest),
            Some(_) => return Err(unknown()),
            None => (DbrCategory::Basic, s),
        };
        let kind = match s {
            "STRING" => DbrBasicType::String,
            "INT" => DbrBasicType::Int,
            "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            _ => return Err(unknown()),
        };
        Ok(DbrType::new(kind, category))
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
        }
    }
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
        }
    }
    /// If a DBR type encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
        }
    }
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
        };
        DbrType::new(self.value().get_type(), category)
    }

    /// Build a DBR of the requested type out of a value and its metadata
    pub fn assemble(
        dbr_type: DbrType,
        value: &DbrValue,
        status: Status,
        timestamp: SystemTime,
    ) -> Result<Dbr, CaStatus> {
        let value = value.convert_to(dbr_type.basic_type)?;
        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp,
                value,
            },
        })
    }
}
