//! Convert provider-level [`Value`]s to types that sqlx can bind.

use crate::error::QueryError;
use crate::value::{ClrType, Value};
use sqlx::encode::{Encode, IsNull};
use sqlx::postgres::{PgTypeInfo, Postgres};
use sqlx::Database;

/// A value that can be bound to a PostgreSQL query. Nulls keep the type of the parameter so the
/// server does not have to infer it.
#[derive(Clone, Debug, PartialEq)]
pub enum PgBindValue {
    Null(&'static str),
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(chrono::NaiveDateTime),
    Date(chrono::NaiveDate),
    Json(serde_json::Value),
}

fn pg_type_name(ty: &ClrType) -> &'static str {
    match ty.unwrap_nullable() {
        ClrType::Bool => "BOOL",
        ClrType::Int16 => "INT2",
        ClrType::Int32 => "INT4",
        ClrType::Int64 => "INT8",
        ClrType::Float64 | ClrType::Decimal => "FLOAT8",
        ClrType::Bytes => "BYTEA",
        ClrType::Guid => "UUID",
        ClrType::DateTime => "TIMESTAMP",
        ClrType::Date => "DATE",
        ClrType::Json => "JSONB",
        ClrType::Enum(e) => pg_type_name(&e.underlying),
        _ => "TEXT",
    }
}

impl PgBindValue {
    /// `provider_type` is the type the store expects (after any value converter ran).
    pub fn from_value(value: &Value, provider_type: &ClrType) -> Result<Self, QueryError> {
        let out_of_range = |n: i64| {
            QueryError::InvalidOperation(format!("parameter value {} does not fit {}", n, provider_type))
        };
        Ok(match (value, provider_type.unwrap_nullable()) {
            (Value::Null, ty) => PgBindValue::Null(pg_type_name(ty)),
            (Value::Bool(b), _) => PgBindValue::Bool(*b),
            (Value::Int(n), ClrType::Int16) => PgBindValue::I16(i16::try_from(*n).map_err(|_| out_of_range(*n))?),
            (Value::Int(n), ClrType::Int32) => PgBindValue::I32(i32::try_from(*n).map_err(|_| out_of_range(*n))?),
            (Value::Int(n), ClrType::Enum(e)) if matches!(e.underlying, ClrType::Int32) => {
                PgBindValue::I32(i32::try_from(*n).map_err(|_| out_of_range(*n))?)
            }
            (Value::Int(n), ClrType::Float64 | ClrType::Decimal) => PgBindValue::F64(*n as f64),
            (Value::Int(n), _) => PgBindValue::I64(*n),
            (Value::Float(f), _) => PgBindValue::F64(*f),
            (Value::Text(s), _) => PgBindValue::String(s.clone()),
            (Value::Bytes(b), _) => PgBindValue::Bytes(b.clone()),
            (Value::Uuid(u), _) => PgBindValue::Uuid(*u),
            (Value::DateTime(d), _) => PgBindValue::DateTime(*d),
            (Value::Date(d), _) => PgBindValue::Date(*d),
            (Value::Json(j), _) => PgBindValue::Json(j.clone()),
        })
    }

    fn type_name(&self) -> &'static str {
        match self {
            PgBindValue::Null(name) => name,
            PgBindValue::Bool(_) => "BOOL",
            PgBindValue::I16(_) => "INT2",
            PgBindValue::I32(_) => "INT4",
            PgBindValue::I64(_) => "INT8",
            PgBindValue::F64(_) => "FLOAT8",
            PgBindValue::String(_) => "TEXT",
            PgBindValue::Bytes(_) => "BYTEA",
            PgBindValue::Uuid(_) => "UUID",
            PgBindValue::DateTime(_) => "TIMESTAMP",
            PgBindValue::Date(_) => "DATE",
            PgBindValue::Json(_) => "JSONB",
        }
    }
}

impl<'q> Encode<'q, Postgres> for PgBindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Ok(match self {
            PgBindValue::Null(_) => IsNull::Yes,
            PgBindValue::Bool(b) => <bool as Encode<Postgres>>::encode_by_ref(b, buf)?,
            PgBindValue::I16(n) => <i16 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::I32(n) => <i32 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::I64(n) => <i64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::F64(n) => <f64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::String(s) => {
                let s_ref: &str = s.as_str();
                <&str as Encode<Postgres>>::encode_by_ref(&s_ref, buf)?
            }
            PgBindValue::Bytes(b) => <Vec<u8> as Encode<Postgres>>::encode_by_ref(b, buf)?,
            PgBindValue::Uuid(u) => <uuid::Uuid as Encode<Postgres>>::encode_by_ref(u, buf)?,
            PgBindValue::DateTime(d) => <chrono::NaiveDateTime as Encode<Postgres>>::encode_by_ref(d, buf)?,
            PgBindValue::Date(d) => <chrono::NaiveDate as Encode<Postgres>>::encode_by_ref(d, buf)?,
            PgBindValue::Json(v) => <serde_json::Value as Encode<Postgres>>::encode_by_ref(v, buf)?,
        })
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(PgTypeInfo::with_name(self.type_name()))
    }
}

impl sqlx::Type<Postgres> for PgBindValue {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("TEXT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrows_integers_to_the_provider_type() {
        assert_eq!(PgBindValue::from_value(&Value::Int(7), &ClrType::Int32).unwrap(), PgBindValue::I32(7));
        assert_eq!(PgBindValue::from_value(&Value::Int(7), &ClrType::Int64).unwrap(), PgBindValue::I64(7));
        assert!(PgBindValue::from_value(&Value::Int(i64::MAX), &ClrType::Int16).is_err());
    }

    #[test]
    fn nulls_carry_the_parameter_type() {
        let v = PgBindValue::from_value(&Value::Null, &ClrType::Guid.make_nullable()).unwrap();
        assert_eq!(v, PgBindValue::Null("UUID"));
    }
}
