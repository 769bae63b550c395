//! Runtime values flowing through parameters, rows and materialized objects, and the
//! CLR-level type descriptors the query tree is typed with.

use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

/// A single scalar value read from or bound to the store.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Json(serde_json::Value),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(n) => n.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Uuid(u) => u.hash(state),
            Value::DateTime(d) => d.hash(state),
            Value::Date(d) => d.hash(state),
            Value::Json(j) => j.to_string().hash(state),
        }
    }
}

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Short name of the runtime representation, used in data errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "real",
            Value::Text(_) => "text",
            Value::Bytes(_) => "blob",
            Value::Uuid(_) => "uuid",
            Value::DateTime(_) => "datetime",
            Value::Date(_) => "date",
            Value::Json(_) => "json",
        }
    }

    /// Whether this value is a valid runtime representation of `ty` (null conforms to nullable types only).
    pub fn conforms_to(&self, ty: &ClrType) -> bool {
        if self.is_null() {
            return ty.can_be_null();
        }
        match (ty.unwrap_nullable(), self) {
            (ClrType::Object, _) => true,
            (ClrType::Bool, Value::Bool(_)) => true,
            (ClrType::Int16 | ClrType::Int32 | ClrType::Int64, Value::Int(_)) => true,
            (ClrType::Enum(_), Value::Int(_)) => true,
            (ClrType::Float64 | ClrType::Decimal, Value::Float(_)) => true,
            (ClrType::String, Value::Text(_)) => true,
            (ClrType::Bytes, Value::Bytes(_)) => true,
            (ClrType::Guid, Value::Uuid(_)) => true,
            (ClrType::DateTime, Value::DateTime(_)) => true,
            (ClrType::Date, Value::Date(_)) => true,
            (ClrType::Json, Value::Json(_)) => true,
            _ => false,
        }
    }

    /// Converts a store representation into the runtime representation of `ty` where the store
    /// uses a looser encoding (integers for booleans, text for dates, guids and decimals).
    /// Returns `None` when no lossless conversion exists.
    pub fn coerce_to(self, ty: &ClrType) -> Option<Value> {
        if self.conforms_to(ty) {
            return Some(self);
        }
        match (ty.unwrap_nullable(), self) {
            (ClrType::Bool, Value::Int(n)) if n == 0 || n == 1 => Some(Value::Bool(n == 1)),
            (ClrType::Float64 | ClrType::Decimal, Value::Int(n)) => Some(Value::Float(n as f64)),
            (ClrType::Decimal, Value::Text(s)) => s.parse::<f64>().ok().map(Value::Float),
            (ClrType::Guid, Value::Text(s)) => Uuid::parse_str(&s).ok().map(Value::Uuid),
            (ClrType::Guid, Value::Bytes(b)) => Uuid::from_slice(&b).ok().map(Value::Uuid),
            (ClrType::DateTime, Value::Text(s)) => parse_datetime(&s).map(Value::DateTime),
            (ClrType::Date, Value::Text(s)) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .ok()
                .map(Value::Date),
            (ClrType::Date, Value::DateTime(d)) => Some(Value::Date(d.date())),
            (ClrType::Json, Value::Text(s)) => serde_json::from_str(&s).ok().map(Value::Json),
            _ => None,
        }
    }

    /// JSON rendering of a value (dates as ISO-8601 strings, blobs as byte arrays).
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(n) => J::Number((*n).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(J::Number).unwrap_or(J::Null),
            Value::Text(s) => J::String(s.clone()),
            Value::Bytes(b) => J::Array(b.iter().map(|x| J::Number((*x).into())).collect()),
            Value::Uuid(u) => J::String(u.to_string()),
            Value::DateTime(d) => J::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::Date(d) => J::String(d.format("%Y-%m-%d").to_string()),
            Value::Json(j) => j.clone(),
        }
    }

    /// Reads a JSON value as the runtime representation of `ty`.
    pub fn from_json(json: &serde_json::Value, ty: &ClrType) -> Option<Value> {
        use serde_json::Value as J;
        let v = match json {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(*b),
            J::Number(n) => match ty.unwrap_nullable() {
                ClrType::Float64 | ClrType::Decimal => Value::Float(n.as_f64()?),
                _ => Value::Int(n.as_i64()?),
            },
            J::String(s) => match ty.unwrap_nullable() {
                ClrType::Enum(e) => Value::Int(e.member_value(s)?),
                _ => Value::Text(s.clone()),
            },
            other => Value::Json(other.clone()),
        };
        v.coerce_to(ty)
    }
}

pub(crate) fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::Bytes(b) => write!(f, "byte[{}]", b.len()),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::DateTime(d) => write!(f, "{}", d),
            Value::Date(d) => write!(f, "{}", d),
            Value::Json(j) => write!(f, "{}", j),
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
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// An enumeration declared in the model (integer-backed, optionally a flags enum).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EnumType {
    pub name: String,
    pub underlying: ClrType,
    pub flags: bool,
    pub members: Vec<(String, i64)>,
}

impl EnumType {
    pub fn member_value(&self, name: &str) -> Option<i64> {
        self.members.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn member_name(&self, value: i64) -> Option<&str> {
        self.members.iter().find(|(_, v)| *v == value).map(|(n, _)| n.as_str())
    }
}

/// CLR-level type of a query-tree expression or property.
///
/// Value types (numbers, bool, guid, dates, enums) are non-nullable unless wrapped in
/// [`ClrType::Nullable`]; reference types (string, bytes, json, object, entities) can always be null.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClrType {
    Bool,
    Int16,
    Int32,
    Int64,
    Float64,
    Decimal,
    String,
    Bytes,
    Guid,
    DateTime,
    Date,
    Json,
    Enum(Arc<EnumType>),
    Nullable(Box<ClrType>),
    /// The boxing/upcast target (`object`).
    Object,
    /// An entity-typed expression (the name of the entity type).
    Entity(String),
    /// A sequence of elements (navigation collections, arrays).
    Collection(Box<ClrType>),
}

impl ClrType {
    pub fn unwrap_nullable(&self) -> &ClrType {
        match self {
            ClrType::Nullable(inner) => inner.unwrap_nullable(),
            other => other,
        }
    }

    pub fn is_nullable_wrapper(&self) -> bool {
        matches!(self, ClrType::Nullable(_))
    }

    pub fn is_value_type(&self) -> bool {
        !matches!(
            self,
            ClrType::String
                | ClrType::Bytes
                | ClrType::Json
                | ClrType::Object
                | ClrType::Entity(_)
                | ClrType::Collection(_)
        )
    }

    /// Whether null is a valid value of this type.
    pub fn can_be_null(&self) -> bool {
        self.is_nullable_wrapper() || !self.is_value_type()
    }

    /// Wraps a value type in `Nullable`; reference types and already-nullable types are returned as-is.
    pub fn make_nullable(self) -> ClrType {
        if self.can_be_null() {
            self
        } else {
            ClrType::Nullable(Box::new(self))
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.numeric_rank().is_some()
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.unwrap_nullable(),
            ClrType::Int16 | ClrType::Int32 | ClrType::Int64
        )
    }

    /// Widening order used when unifying numeric operands.
    pub fn numeric_rank(&self) -> Option<u8> {
        match self.unwrap_nullable() {
            ClrType::Int16 => Some(1),
            ClrType::Int32 => Some(2),
            ClrType::Int64 => Some(3),
            ClrType::Decimal => Some(4),
            ClrType::Float64 => Some(5),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&Arc<EnumType>> {
        match self.unwrap_nullable() {
            ClrType::Enum(e) => Some(e),
            _ => None,
        }
    }

    /// Parses a built-in type name (`int`, `long`, `string`, `DateTime?`, ...).
    pub fn parse(name: &str) -> Option<ClrType> {
        let trimmed = name.trim();
        if let Some(inner) = trimmed.strip_suffix('?') {
            return ClrType::parse(inner).map(ClrType::make_nullable);
        }
        let ty = match trimmed.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => ClrType::Bool,
            "short" | "int16" => ClrType::Int16,
            "int" | "int32" => ClrType::Int32,
            "long" | "int64" => ClrType::Int64,
            "double" | "float" | "float64" => ClrType::Float64,
            "decimal" => ClrType::Decimal,
            "string" => ClrType::String,
            "bytes" | "byte[]" => ClrType::Bytes,
            "guid" | "uuid" => ClrType::Guid,
            "datetime" => ClrType::DateTime,
            "date" | "dateonly" => ClrType::Date,
            "json" => ClrType::Json,
            "object" => ClrType::Object,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for ClrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClrType::Bool => write!(f, "bool"),
            ClrType::Int16 => write!(f, "short"),
            ClrType::Int32 => write!(f, "int"),
            ClrType::Int64 => write!(f, "long"),
            ClrType::Float64 => write!(f, "double"),
            ClrType::Decimal => write!(f, "decimal"),
            ClrType::String => write!(f, "string"),
            ClrType::Bytes => write!(f, "byte[]"),
            ClrType::Guid => write!(f, "Guid"),
            ClrType::DateTime => write!(f, "DateTime"),
            ClrType::Date => write!(f, "DateOnly"),
            ClrType::Json => write!(f, "JsonElement"),
            ClrType::Enum(e) => write!(f, "{}", e.name),
            ClrType::Nullable(inner) => write!(f, "{}?", inner),
            ClrType::Object => write!(f, "object"),
            ClrType::Entity(name) => write!(f, "{}", name),
            ClrType::Collection(inner) => write!(f, "IEnumerable<{}>", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn nullable_parse_and_unwrap() {
        let ty = ClrType::parse("int?").unwrap();
        assert_eq!(ty, ClrType::Nullable(Box::new(ClrType::Int32)));
        assert_eq!(ty.unwrap_nullable(), &ClrType::Int32);
        assert!(ty.can_be_null());
        assert_eq!(ClrType::parse("string?").unwrap(), ClrType::String);
        assert!(!ClrType::Int32.can_be_null());
    }

    #[test]
    fn floats_hash_by_bits() {
        let mut set = HashSet::new();
        set.insert(vec![Value::Float(1.5), Value::Int(2)]);
        assert!(set.contains(&vec![Value::Float(1.5), Value::Int(2)]));
        assert!(!set.contains(&vec![Value::Float(1.5), Value::Int(3)]));
    }

    #[test]
    fn coerces_store_representations() {
        assert_eq!(Value::Int(1).coerce_to(&ClrType::Bool), Some(Value::Bool(true)));
        assert_eq!(Value::Int(7).coerce_to(&ClrType::Bool), None);
        let dt = Value::Text("2024-03-15 10:30:45.5".into())
            .coerce_to(&ClrType::DateTime)
            .unwrap();
        assert_eq!(dt.to_json(), serde_json::json!("2024-03-15T10:30:45.500"));
        assert_eq!(Value::Text("abc".into()).coerce_to(&ClrType::Int32), None);
        assert_eq!(Value::Null.coerce_to(&ClrType::Int32), None);
        assert_eq!(
            Value::Null.coerce_to(&ClrType::Int32.make_nullable()),
            Some(Value::Null)
        );
    }
}
