//! Type mappings: the pairing of a CLR-level type with a store type, a literal-rendering rule and
//! an optional value converter.

use crate::error::QueryError;
use crate::model::ValueConverter;
use crate::value::{ClrType, Value};
use std::fmt::Write as _;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoolLiteral {
    /// `1` / `0`
    Integer,
    /// `TRUE` / `FALSE`
    Keyword,
    /// `CAST(1 AS bit)`
    BitCast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobLiteral {
    /// `X'0A0B'`
    XQuoted,
    /// `'\x0a0b'::bytea`
    Bytea,
    /// `0x0A0B`
    HexPrefixed,
}

/// How a value of the mapping's provider type is written as an SQL literal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LiteralStyle {
    Integer,
    Real,
    Decimal,
    Bool(BoolLiteral),
    Text { national: bool },
    Blob(BlobLiteral),
    Guid { suffix: &'static str },
    DateTime { prefix: &'static str, format: &'static str },
    Date { prefix: &'static str },
    Json { suffix: &'static str },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelationalTypeMapping {
    /// Model-level type (nullability unwrapped).
    pub clr_type: ClrType,
    pub store_type: String,
    pub store_type_base: String,
    pub size: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub converter: Option<ValueConverter>,
    pub literal: LiteralStyle,
}

pub type TypeMapping = Arc<RelationalTypeMapping>;

impl RelationalTypeMapping {
    pub fn new(clr_type: ClrType, store_type: &str, literal: LiteralStyle) -> Self {
        RelationalTypeMapping {
            clr_type,
            store_type: store_type.to_string(),
            store_type_base: store_type.to_string(),
            size: None,
            precision: None,
            scale: None,
            converter: None,
            literal,
        }
    }

    pub fn with_converter(&self, model_type: ClrType, converter: ValueConverter) -> Self {
        RelationalTypeMapping {
            clr_type: model_type,
            converter: Some(converter),
            ..self.clone()
        }
    }

    pub fn with_clr_type(&self, clr_type: ClrType) -> Self {
        RelationalTypeMapping {
            clr_type,
            ..self.clone()
        }
    }

    /// Type of the value handed to or read from the store.
    pub fn provider_type(&self) -> ClrType {
        match &self.converter {
            Some(c) => c.provider_type(&self.clr_type),
            None => match &self.clr_type {
                ClrType::Enum(e) => e.underlying.clone(),
                other => other.clone(),
            },
        }
    }

    pub fn to_provider(&self, value: &Value) -> Result<Value, QueryError> {
        match &self.converter {
            Some(c) => c
                .to_provider(value)
                .map_err(|m| QueryError::data(self.clr_type.to_string(), m)),
            None => Ok(value.clone()),
        }
    }

    pub fn from_provider(&self, value: &Value) -> Result<Value, QueryError> {
        match &self.converter {
            Some(c) => c
                .from_provider(value)
                .map_err(|m| QueryError::data(self.clr_type.to_string(), m)),
            None => Ok(value.clone()),
        }
    }

    /// Renders `value` (a model-level value) as an SQL literal.
    pub fn generate_sql_literal(&self, value: &Value) -> Result<String, QueryError> {
        let provider = self.to_provider(value)?;
        if provider.is_null() {
            return Ok("NULL".into());
        }
        let mismatch = || {
            QueryError::InvalidOperation(format!(
                "cannot render {} value {} as a '{}' literal",
                provider.kind_name(),
                provider,
                self.store_type
            ))
        };
        let sql = match (&self.literal, &provider) {
            (LiteralStyle::Integer, Value::Int(n)) => n.to_string(),
            (LiteralStyle::Integer, Value::Bool(b)) => i64::from(*b).to_string(),
            (LiteralStyle::Real | LiteralStyle::Decimal, Value::Float(f)) => {
                let s = f.to_string();
                if matches!(self.literal, LiteralStyle::Real) && !s.contains(['.', 'e', 'E', 'N', 'i']) {
                    format!("{}.0", s)
                } else {
                    s
                }
            }
            (LiteralStyle::Real | LiteralStyle::Decimal, Value::Int(n)) => {
                if matches!(self.literal, LiteralStyle::Real) {
                    format!("{}.0", n)
                } else {
                    n.to_string()
                }
            }
            (LiteralStyle::Bool(style), Value::Bool(b)) => match (style, b) {
                (BoolLiteral::Integer, true) => "1".into(),
                (BoolLiteral::Integer, false) => "0".into(),
                (BoolLiteral::Keyword, true) => "TRUE".into(),
                (BoolLiteral::Keyword, false) => "FALSE".into(),
                (BoolLiteral::BitCast, true) => "CAST(1 AS bit)".into(),
                (BoolLiteral::BitCast, false) => "CAST(0 AS bit)".into(),
            },
            (LiteralStyle::Text { national }, v) => {
                let text = match v {
                    Value::Text(s) => s.clone(),
                    Value::Uuid(u) => u.to_string(),
                    Value::DateTime(d) => d.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
                    Value::Date(d) => d.format("%Y-%m-%d").to_string(),
                    Value::Json(j) => j.to_string(),
                    Value::Float(f) => f.to_string(),
                    Value::Int(n) => n.to_string(),
                    _ => return Err(mismatch()),
                };
                format!("{}{}", if *national { "N" } else { "" }, quote_text(&text))
            }
            (LiteralStyle::Blob(style), Value::Bytes(b)) => {
                let mut hex = String::with_capacity(b.len() * 2);
                for byte in b {
                    let _ = write!(hex, "{:02X}", byte);
                }
                match style {
                    BlobLiteral::XQuoted => format!("X'{}'", hex),
                    BlobLiteral::Bytea => format!("'\\x{}'::bytea", hex.to_lowercase()),
                    BlobLiteral::HexPrefixed => format!("0x{}", hex),
                }
            }
            (LiteralStyle::Guid { suffix }, Value::Uuid(u)) => format!("'{}'{}", u, suffix),
            (LiteralStyle::DateTime { prefix, format }, Value::DateTime(d)) => {
                format!("{}'{}'", prefix, d.format(format))
            }
            (LiteralStyle::Date { prefix }, Value::Date(d)) => format!("{}'{}'", prefix, d.format("%Y-%m-%d")),
            (LiteralStyle::Json { suffix }, Value::Json(j)) => format!("{}{}", quote_text(&j.to_string()), suffix),
            _ => return Err(mismatch()),
        };
        Ok(sql)
    }
}

fn quote_text(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::EnumType;

    #[test]
    fn text_literals_escape_quotes() {
        let m = RelationalTypeMapping::new(ClrType::String, "TEXT", LiteralStyle::Text { national: false });
        assert_eq!(m.generate_sql_literal(&Value::from("O'Brien")).unwrap(), "'O''Brien'");
        let n = RelationalTypeMapping::new(ClrType::String, "nvarchar(max)", LiteralStyle::Text { national: true });
        assert_eq!(n.generate_sql_literal(&Value::from("x")).unwrap(), "N'x'");
    }

    #[test]
    fn converter_applies_before_rendering() {
        let status = Arc::new(EnumType {
            name: "Status".into(),
            underlying: ClrType::Int32,
            flags: false,
            members: vec![("Draft".into(), 0), ("Live".into(), 1)],
        });
        let base = RelationalTypeMapping::new(ClrType::String, "TEXT", LiteralStyle::Text { national: false });
        let m = base.with_converter(ClrType::Enum(status.clone()), ValueConverter::EnumToString(status));
        assert_eq!(m.generate_sql_literal(&Value::Int(1)).unwrap(), "'Live'");
        assert_eq!(m.provider_type(), ClrType::String);
    }

    #[test]
    fn real_literals_keep_a_fraction() {
        let m = RelationalTypeMapping::new(ClrType::Float64, "REAL", LiteralStyle::Real);
        assert_eq!(m.generate_sql_literal(&Value::Float(2.0)).unwrap(), "2.0");
        assert_eq!(m.generate_sql_literal(&Value::Float(2.5)).unwrap(), "2.5");
        assert_eq!(m.generate_sql_literal(&Value::Null).unwrap(), "NULL");
    }

    #[test]
    fn blob_literals_per_style() {
        let bytes = Value::Bytes(vec![0x0a, 0xff]);
        let sqlite = RelationalTypeMapping::new(ClrType::Bytes, "BLOB", LiteralStyle::Blob(BlobLiteral::XQuoted));
        assert_eq!(sqlite.generate_sql_literal(&bytes).unwrap(), "X'0AFF'");
        let pg = RelationalTypeMapping::new(ClrType::Bytes, "bytea", LiteralStyle::Blob(BlobLiteral::Bytea));
        assert_eq!(pg.generate_sql_literal(&bytes).unwrap(), "'\\x0aff'::bytea");
    }
}
