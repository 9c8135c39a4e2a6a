//! Dynamically typed bus values
//!
//! Signal arguments, method-call arguments and method-call replies all travel
//! as [`Value`]. The variants mirror the D-Bus basic types plus arrays and
//! string-keyed dictionaries, which is everything hook configuration can
//! express.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::BusError;

/// A single bus value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Integer view of any integral variant (or a numeric string)
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Byte(v) => Some(i128::from(*v)),
            Value::Int16(v) => Some(i128::from(*v)),
            Value::UInt16(v) => Some(i128::from(*v)),
            Value::Int32(v) => Some(i128::from(*v)),
            Value::UInt32(v) => Some(i128::from(*v)),
            Value::Int64(v) => Some(i128::from(*v)),
            Value::UInt64(v) => Some(i128::from(*v)),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Floating point view of any numeric variant
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Str(s) => s.trim().parse().ok(),
            other => other.as_i128().map(|v| v as f64),
        }
    }

    /// Borrow the text of a string or object path
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            Value::Byte(_)
                | Value::Int16(_)
                | Value::UInt16(_)
                | Value::Int32(_)
                | Value::UInt32(_)
                | Value::Int64(_)
                | Value::UInt64(_)
        )
    }

    /// Short type name used in log lines and error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Byte(_) => "byte",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Value equality that ignores wire width.
    ///
    /// Integers compare by numeric value regardless of signedness or size, and
    /// an object path equals a string with the same text. Strings never equal
    /// numbers: `"1"` and `1` are different values.
    pub fn value_eq(&self, other: &Value) -> bool {
        if self.is_integral() && other.is_integral() {
            return self.as_i128() == other.as_i128();
        }
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Double(a), b) | (b, Value::Double(a)) if b.is_integral() => {
                b.as_f64() == Some(*a)
            }
            (Value::Str(a) | Value::ObjectPath(a), Value::Str(b) | Value::ObjectPath(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.value_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.value_eq(vb))
            }
            (a, b) => a == b,
        }
    }

    /// Convert to the wire type named by a D-Bus basic type code.
    ///
    /// Supported codes: `b y n q i u x t d s o g` and `v` (unchanged).
    pub fn coerce(&self, code: char) -> Result<Value, BusError> {
        let fail = || {
            BusError::Conversion(format!(
                "cannot coerce {} '{}' to type '{}'",
                self.type_name(),
                self,
                code
            ))
        };
        let integer = || self.as_i128().ok_or_else(fail);

        Ok(match code {
            'v' => self.clone(),
            's' | 'g' => Value::Str(self.to_string()),
            'o' => {
                let text = self.to_string();
                if !text.starts_with('/') {
                    return Err(fail());
                }
                Value::ObjectPath(text)
            }
            'b' => match self {
                Value::Bool(b) => Value::Bool(*b),
                Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "yes" | "1" => Value::Bool(true),
                    "false" | "no" | "0" => Value::Bool(false),
                    _ => return Err(fail()),
                },
                other => Value::Bool(other.as_i128().ok_or_else(fail)? != 0),
            },
            'y' => Value::Byte(u8::try_from(integer()?).map_err(|_| fail())?),
            'n' => Value::Int16(i16::try_from(integer()?).map_err(|_| fail())?),
            'q' => Value::UInt16(u16::try_from(integer()?).map_err(|_| fail())?),
            'i' => Value::Int32(i32::try_from(integer()?).map_err(|_| fail())?),
            'u' => Value::UInt32(u32::try_from(integer()?).map_err(|_| fail())?),
            'x' => Value::Int64(i64::try_from(integer()?).map_err(|_| fail())?),
            't' => Value::UInt64(u64::try_from(integer()?).map_err(|_| fail())?),
            'd' => Value::Double(self.as_f64().ok_or_else(fail)?),
            _ => {
                return Err(BusError::Conversion(format!(
                    "unsupported type code '{code}'"
                )))
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Byte(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Str(s) | Value::ObjectPath(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {item}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}
