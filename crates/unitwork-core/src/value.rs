//! Dynamic SQL values.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A dynamically-typed SQL value.
///
/// Used for identifiers, version values, scalar properties and the column
/// values exchanged with the SQL-execution facade.
///
/// Equality is structural. Floating point values compare and hash by their
/// bit pattern so a `Value` can serve as an identifier and a `NaN` property
/// is not reported dirty on every flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to get this value as a bool.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get this value as an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get this value as an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The value an optimistic-lock version takes after one more update.
    ///
    /// Integer versions increment by one and timestamps advance by one
    /// microsecond. Returns `None` for values that cannot act as a version.
    pub fn next_version(&self) -> Option<Value> {
        match self {
            Value::Int(v) => v.checked_add(1).map(Value::Int),
            Value::BigInt(v) => v.checked_add(1).map(Value::BigInt),
            Value::Timestamp(v) => v.checked_add(1).map(Value::Timestamp),
            _ => None,
        }
    }

    /// Canonical form for identifier comparison: 32-bit integers widen to
    /// [`Value::BigInt`], so `1` and `1i64` name the same row.
    pub fn into_identifier(self) -> Value {
        match self {
            Value::Int(v) => Value::BigInt(i64::from(v)),
            other => other,
        }
    }

    /// Seed value for a freshly inserted versioned row.
    pub const fn initial_version() -> Value {
        Value::BigInt(0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Decimal(a), Value::Decimal(b)) | (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::BigInt(i) => {
                3u8.hash(state);
                i.hash(state);
            }
            Value::Double(f) => {
                4u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Decimal(s) => {
                5u8.hash(state);
                s.hash(state);
            }
            Value::Text(s) => {
                6u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                7u8.hash(state);
                b.hash(state);
            }
            Value::Timestamp(t) => {
                8u8.hash(state);
                t.hash(state);
            }
            Value::Uuid(u) => {
                9u8.hash(state);
                u.hash(state);
            }
            Value::Json(j) => {
                // serde_json::Value has no Hash; its canonical text does.
                10u8.hash(state);
                j.to_string().hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Timestamp(v) => write!(f, "ts:{v}"),
            Value::Uuid(v) => {
                for (i, byte) in v.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        write!(f, "-")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

// Conversion implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_null_and_type_names() {
        assert!(Value::Null.is_null());
        assert!(!Value::Int(0).is_null());
        assert_eq!(Value::Text("a".into()).type_name(), "TEXT");
        assert_eq!(Value::BigInt(1).type_name(), "BIGINT");
    }

    #[test]
    fn test_float_equality_by_bits() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
    }

    #[test]
    fn test_hash_distinguishes_variants() {
        let mut set = HashSet::new();
        set.insert(Value::Int(1));
        set.insert(Value::BigInt(1));
        set.insert(Value::Text("1".into()));
        set.insert(Value::Int(1));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_identifier_form_widens_integers() {
        assert_eq!(Value::Int(7).into_identifier(), Value::BigInt(7));
        assert_eq!(Value::BigInt(7).into_identifier(), Value::BigInt(7));
        assert_eq!(Value::from("a").into_identifier(), Value::from("a"));
    }

    #[test]
    fn test_next_version() {
        assert_eq!(Value::BigInt(3).next_version(), Some(Value::BigInt(4)));
        assert_eq!(Value::Int(0).next_version(), Some(Value::Int(1)));
        assert_eq!(Value::Int(i32::MAX).next_version(), None);
        assert_eq!(Value::Text("v1".into()).next_version(), None);
    }

    #[test]
    fn test_option_conversion() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn test_display_uuid() {
        let v = Value::Uuid([0xab; 16]);
        assert_eq!(
            v.to_string(),
            "abababab-abab-abab-abab-abababababab".to_string()
        );
    }

    #[test]
    fn test_serde_roundtrip_json_variant() {
        let v = Value::Json(serde_json::json!({"street": "Main"}));
        let text = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v, back);
    }
}
