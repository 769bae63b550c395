//! Per-backend SQL spelling: identifier quoting, placeholders, boolean handling and paging.

use crate::options::Dialect;
use crate::value::Value;
use std::sync::Arc;

/// Where row limiting is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Paging {
    /// `LIMIT n OFFSET m`; `unbounded` is the limit written when only an offset is present.
    LimitOffset { unbounded: Option<&'static str> },
    /// `TOP(n)` for a bare limit, otherwise `OFFSET m ROWS FETCH NEXT n ROWS ONLY`.
    TopOrOffsetFetch,
}

pub trait SqlDialect: Send + Sync + std::fmt::Debug {
    fn dialect(&self) -> Dialect;

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn delimit_table(&self, name: &str, schema: Option<&str>) -> String {
        match schema {
            Some(schema) => format!("{}.{}", self.quote_identifier(schema), self.quote_identifier(name)),
            None => self.quote_identifier(name),
        }
    }

    /// Placeholder for the `ordinal`-th distinct parameter (0-based) named `name`.
    fn parameter_placeholder(&self, name: &str, ordinal: usize) -> String {
        format!("@__{}_{}", name, ordinal)
    }

    fn concat_operator(&self) -> &'static str {
        "||"
    }

    /// Whether a boolean column can stand alone as a search condition.
    fn supports_bool_predicates(&self) -> bool {
        true
    }

    fn bool_predicate(&self, value: bool) -> &'static str;

    /// Literal for a value with no type mapping attached.
    fn fallback_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".into(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => self.bool_predicate(*b).to_string(),
            other => format!("'{}'", other.to_string().replace('\'', "''")),
        }
    }

    fn paging(&self) -> Paging;
}

#[derive(Debug, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn bool_predicate(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn paging(&self) -> Paging {
        Paging::LimitOffset { unbounded: Some("-1") }
    }
}

#[derive(Debug, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn parameter_placeholder(&self, _name: &str, ordinal: usize) -> String {
        format!("${}", ordinal + 1)
    }

    fn bool_predicate(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    fn paging(&self) -> Paging {
        Paging::LimitOffset { unbounded: None }
    }
}

#[derive(Debug, Default)]
pub struct SqlServerDialect;

impl SqlDialect for SqlServerDialect {
    fn dialect(&self) -> Dialect {
        Dialect::SqlServer
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn concat_operator(&self) -> &'static str {
        "+"
    }

    fn supports_bool_predicates(&self) -> bool {
        false
    }

    fn bool_predicate(&self, value: bool) -> &'static str {
        if value {
            "1 = 1"
        } else {
            "0 = 1"
        }
    }

    fn fallback_literal(&self, value: &Value) -> String {
        match value {
            Value::Bool(true) => "CAST(1 AS bit)".into(),
            Value::Bool(false) => "CAST(0 AS bit)".into(),
            Value::Text(s) => format!("N'{}'", s.replace('\'', "''")),
            Value::Null => "NULL".into(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            other => format!("'{}'", other.to_string().replace('\'', "''")),
        }
    }

    fn paging(&self) -> Paging {
        Paging::TopOrOffsetFetch
    }
}

pub fn dialect_for(dialect: Dialect) -> Arc<dyn SqlDialect> {
    match dialect {
        Dialect::Sqlite => Arc::new(SqliteDialect),
        Dialect::Postgres => Arc::new(PostgresDialect),
        Dialect::SqlServer => Arc::new(SqlServerDialect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Dialect::Sqlite, "\"Blogs\"")]
    #[test_case(Dialect::Postgres, "\"Blogs\"")]
    #[test_case(Dialect::SqlServer, "[Blogs]")]
    fn quotes_identifiers(dialect: Dialect, expected: &str) {
        assert_eq!(dialect_for(dialect).quote_identifier("Blogs"), expected);
    }

    #[test]
    fn embedded_quotes_are_doubled() {
        assert_eq!(SqliteDialect.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(SqlServerDialect.quote_identifier("a]b"), "[a]]b]");
    }

    #[test]
    fn placeholders_per_dialect() {
        assert_eq!(SqliteDialect.parameter_placeholder("minRating", 0), "@__minRating_0");
        assert_eq!(PostgresDialect.parameter_placeholder("minRating", 2), "$3");
    }

    #[test]
    fn schema_qualified_tables() {
        assert_eq!(PostgresDialect.delimit_table("Blogs", Some("app")), "\"app\".\"Blogs\"");
    }
}
