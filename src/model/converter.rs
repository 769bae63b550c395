//! Value converters: bidirectional transforms between a property's in-memory value and its
//! storage representation.

use crate::value::{ClrType, EnumType, Value};
use std::fmt;
use std::sync::Arc;

type ConvertFn = dyn Fn(&Value) -> Result<Value, String> + Send + Sync;

/// A user-supplied converter. Compared by name.
pub struct CustomConverter {
    pub name: String,
    pub provider_type: ClrType,
    to_provider: Box<ConvertFn>,
    from_provider: Box<ConvertFn>,
}

impl CustomConverter {
    pub fn new(
        name: impl Into<String>,
        provider_type: ClrType,
        to_provider: impl Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
        from_provider: impl Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        CustomConverter {
            name: name.into(),
            provider_type,
            to_provider: Box::new(to_provider),
            from_provider: Box::new(from_provider),
        }
    }
}

#[derive(Clone)]
pub enum ValueConverter {
    /// Enum stored as its member name.
    EnumToString(Arc<EnumType>),
    /// Boolean stored as 0/1.
    BoolToInt,
    /// Guid stored as its hyphenated lowercase text.
    GuidToString,
    Custom(Arc<CustomConverter>),
}

impl ValueConverter {
    /// Resolves a converter by its configuration name for a property of type `model_type`.
    pub fn by_name(name: &str, model_type: &ClrType) -> Option<ValueConverter> {
        match (name, model_type.unwrap_nullable()) {
            ("enum_to_string", ClrType::Enum(e)) => Some(ValueConverter::EnumToString(e.clone())),
            ("bool_to_int", ClrType::Bool) => Some(ValueConverter::BoolToInt),
            ("guid_to_string", ClrType::Guid) => Some(ValueConverter::GuidToString),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ValueConverter::EnumToString(_) => "enum_to_string",
            ValueConverter::BoolToInt => "bool_to_int",
            ValueConverter::GuidToString => "guid_to_string",
            ValueConverter::Custom(c) => &c.name,
        }
    }

    /// The CLR type of the stored representation, keeping the nullability of `model_type`.
    pub fn provider_type(&self, model_type: &ClrType) -> ClrType {
        let provider = match self {
            ValueConverter::EnumToString(_) | ValueConverter::GuidToString => ClrType::String,
            ValueConverter::BoolToInt => ClrType::Int32,
            ValueConverter::Custom(c) => c.provider_type.clone(),
        };
        if model_type.is_nullable_wrapper() {
            provider.make_nullable()
        } else {
            provider
        }
    }

    pub fn to_provider(&self, value: &Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match (self, value) {
            (ValueConverter::EnumToString(e), Value::Int(n)) => e
                .member_name(*n)
                .map(|s| Value::Text(s.to_string()))
                .ok_or_else(|| format!("{} is not a member of enum {}", n, e.name)),
            (ValueConverter::BoolToInt, Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
            (ValueConverter::GuidToString, Value::Uuid(u)) => Ok(Value::Text(u.to_string())),
            (ValueConverter::Custom(c), v) => (c.to_provider)(v),
            (conv, v) => Err(format!(
                "converter '{}' cannot convert a {} value to the store",
                conv.name(),
                v.kind_name()
            )),
        }
    }

    pub fn from_provider(&self, value: &Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match (self, value) {
            (ValueConverter::EnumToString(e), Value::Text(s)) => e
                .member_value(s)
                .map(Value::Int)
                .ok_or_else(|| format!("'{}' is not a member of enum {}", s, e.name)),
            (ValueConverter::BoolToInt, Value::Int(n)) => Ok(Value::Bool(*n != 0)),
            (ValueConverter::GuidToString, Value::Text(s)) => uuid::Uuid::parse_str(s)
                .map(Value::Uuid)
                .map_err(|e| e.to_string()),
            (ValueConverter::Custom(c), v) => (c.from_provider)(v),
            (conv, v) => Err(format!(
                "converter '{}' cannot read a {} value from the store",
                conv.name(),
                v.kind_name()
            )),
        }
    }
}

impl PartialEq for ValueConverter {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ValueConverter::EnumToString(a), ValueConverter::EnumToString(b)) => a == b,
            (ValueConverter::BoolToInt, ValueConverter::BoolToInt) => true,
            (ValueConverter::GuidToString, ValueConverter::GuidToString) => true,
            (ValueConverter::Custom(a), ValueConverter::Custom(b)) => a.name == b.name,
            _ => false,
        }
    }
}

impl fmt::Debug for ValueConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueConverter({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> Arc<EnumType> {
        Arc::new(EnumType {
            name: "Status".into(),
            underlying: ClrType::Int32,
            flags: false,
            members: vec![("Draft".into(), 0), ("Published".into(), 1)],
        })
    }

    #[test]
    fn enum_to_string_both_ways() {
        let conv = ValueConverter::EnumToString(status());
        assert_eq!(conv.to_provider(&Value::Int(1)).unwrap(), Value::Text("Published".into()));
        assert_eq!(conv.from_provider(&Value::Text("Draft".into())).unwrap(), Value::Int(0));
        assert!(conv.from_provider(&Value::Text("Archived".into())).is_err());
        assert_eq!(conv.to_provider(&Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn provider_type_keeps_nullability() {
        let conv = ValueConverter::BoolToInt;
        assert_eq!(conv.provider_type(&ClrType::Bool), ClrType::Int32);
        assert_eq!(
            conv.provider_type(&ClrType::Bool.make_nullable()),
            ClrType::Int32.make_nullable()
        );
    }

    #[test]
    fn custom_converter_round_trips() {
        let conv = ValueConverter::Custom(Arc::new(CustomConverter::new(
            "cents",
            ClrType::Int64,
            |v| v.as_f64().map(|f| Value::Int((f * 100.0).round() as i64)).ok_or_else(|| "not a number".to_string()),
            |v| v.as_i64().map(|n| Value::Float(n as f64 / 100.0)).ok_or_else(|| "not an integer".to_string()),
        )));
        assert_eq!(conv.to_provider(&Value::Float(12.34)).unwrap(), Value::Int(1234));
        assert_eq!(conv.from_provider(&Value::Int(1234)).unwrap(), Value::Float(12.34));
    }
}
