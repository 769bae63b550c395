//! Runtime options threaded through compilation and execution. Built once per context.

use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Target SQL dialect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
    SqlServer,
}

impl std::str::FromStr for Dialect {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Dialect::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "sqlserver" | "sql_server" | "mssql" => Ok(Dialect::SqlServer),
            _ => Err(QueryError::InvalidOperation(format!(
                "invalid dialect: {} (expected sqlite, postgres or sqlserver)",
                s
            ))),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
            Dialect::SqlServer => "sqlserver",
        })
    }
}

/// Whether materialized entities are registered with the context's tracking scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingBehavior {
    #[default]
    TrackAll,
    NoTracking,
    /// Not registered, but one instance per key within a single execution.
    NoTrackingWithIdentityResolution,
}

impl std::str::FromStr for TrackingBehavior {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "track_all" | "tracking" => Ok(TrackingBehavior::TrackAll),
            "no_tracking" => Ok(TrackingBehavior::NoTracking),
            "no_tracking_with_identity_resolution" => Ok(TrackingBehavior::NoTrackingWithIdentityResolution),
            _ => Err(QueryError::InvalidOperation(format!(
                "invalid tracking behavior: {} (expected track_all, no_tracking or no_tracking_with_identity_resolution)",
                s
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub dialect: Dialect,
    pub tracking: TrackingBehavior,
    /// Compare with plain SQL `=`/`<>` instead of expanding null-safe comparisons.
    pub use_relational_nulls: bool,
    /// Evaluate untranslatable final projections and filters after materialization.
    pub client_evaluation: bool,
    pub plan_cache_capacity: usize,
    pub default_schema: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            dialect: Dialect::Sqlite,
            tracking: TrackingBehavior::TrackAll,
            use_relational_nulls: false,
            client_evaluation: true,
            plan_cache_capacity: 256,
            default_schema: None,
        }
    }
}

fn env_flag(name: &str) -> Result<Option<bool>, QueryError> {
    match std::env::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(QueryError::InvalidOperation(format!("{}: expected a boolean, got '{}'", name, v))),
        },
        Err(_) => Ok(None),
    }
}

impl QueryOptions {
    /// Defaults overridden by `ARCHITECT_DIALECT`, `ARCHITECT_TRACKING`,
    /// `ARCHITECT_RELATIONAL_NULLS`, `ARCHITECT_CLIENT_EVAL`, `ARCHITECT_PLAN_CACHE` and
    /// `ARCHITECT_SCHEMA`.
    pub fn from_env() -> Result<Self, QueryError> {
        let mut options = QueryOptions::default();
        if let Ok(d) = std::env::var("ARCHITECT_DIALECT") {
            options.dialect = d.parse()?;
        }
        if let Ok(t) = std::env::var("ARCHITECT_TRACKING") {
            options.tracking = t.parse()?;
        }
        if let Some(v) = env_flag("ARCHITECT_RELATIONAL_NULLS")? {
            options.use_relational_nulls = v;
        }
        if let Some(v) = env_flag("ARCHITECT_CLIENT_EVAL")? {
            options.client_evaluation = v;
        }
        if let Ok(n) = std::env::var("ARCHITECT_PLAN_CACHE") {
            options.plan_cache_capacity = n.parse().map_err(|_| {
                QueryError::InvalidOperation(format!("ARCHITECT_PLAN_CACHE: expected a number, got '{}'", n))
            })?;
        }
        options.default_schema = std::env::var("ARCHITECT_SCHEMA").ok().filter(|s| !s.is_empty());
        Ok(options)
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_tracking(mut self, tracking: TrackingBehavior) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn with_relational_nulls(mut self, on: bool) -> Self {
        self.use_relational_nulls = on;
        self
    }

    pub fn with_client_evaluation(mut self, on: bool) -> Self {
        self.client_evaluation = on;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("sqlite", Dialect::Sqlite)]
    #[test_case("PostgreSQL", Dialect::Postgres)]
    #[test_case("mssql", Dialect::SqlServer)]
    fn parses_dialect(input: &str, expected: Dialect) {
        assert_eq!(input.parse::<Dialect>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_dialect() {
        let err = "oracle".parse::<Dialect>().unwrap_err();
        assert_eq!(err.code(), "invalid_operation");
    }

    #[test]
    fn parses_tracking_behavior() {
        assert_eq!(
            "no-tracking".parse::<TrackingBehavior>().unwrap(),
            TrackingBehavior::NoTracking
        );
    }
}
