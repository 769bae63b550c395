//! Command execution: binds parameter values into a generated command and hands it to a store.

mod memory;
mod postgres;

pub use memory::InMemoryExecutor;
pub use postgres::PgCommandExecutor;

use crate::error::{QueryError, Result};
use crate::query::QueryParameters;
use crate::shaper::{AsyncRowCursor, RowCursor};
use crate::sql::RelationalCommandTemplate;
use crate::value::{ClrType, Value};
use async_trait::async_trait;

/// A parameter value ready for the store: converted to its provider representation.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundParameter {
    pub placeholder: String,
    pub name: String,
    pub provider_type: ClrType,
    pub value: Value,
}

/// A command template with the values of one execution.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationalCommand {
    pub sql: String,
    pub parameters: Vec<BoundParameter>,
}

impl RelationalCommand {
    pub fn bind(template: &RelationalCommandTemplate, values: &QueryParameters) -> Result<Self> {
        let mut parameters = Vec::with_capacity(template.parameters.len());
        for p in &template.parameters {
            let value = values.get(&p.invariant_name).ok_or_else(|| {
                QueryError::InvalidOperation(format!("no value was supplied for the parameter '{}'", p.invariant_name))
            })?;
            let (value, provider_type) = match &p.mapping {
                Some(mapping) => (mapping.to_provider(value)?, mapping.provider_type()),
                None => (value.clone(), p.ty.clone()),
            };
            parameters.push(BoundParameter {
                placeholder: p.placeholder.clone(),
                name: p.invariant_name.clone(),
                provider_type,
                value,
            });
        }
        Ok(RelationalCommand {
            sql: template.sql.clone(),
            parameters,
        })
    }

    pub fn values(&self) -> Vec<&Value> {
        self.parameters.iter().map(|p| &p.value).collect()
    }
}

/// Runs commands against a store and returns their result rows positionally.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    fn execute_reader(&self, command: &RelationalCommand) -> Result<Box<dyn RowCursor>> {
        let _ = command;
        Err(QueryError::InvalidOperation(
            "this executor does not support synchronous execution".into(),
        ))
    }

    async fn execute_reader_async(&self, command: &RelationalCommand) -> Result<Box<dyn AsyncRowCursor>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Dialect;
    use crate::sql::CommandParameter;
    use crate::storage::{RelationalTypeMappingSource, TypeMappingSource};

    fn template(parameters: Vec<CommandParameter>) -> RelationalCommandTemplate {
        RelationalCommandTemplate {
            sql: "SELECT 1".into(),
            parameters,
        }
    }

    #[test]
    fn missing_value_is_an_invalid_operation() {
        let t = template(vec![CommandParameter {
            placeholder: "@__rating_0".into(),
            invariant_name: "rating".into(),
            ty: ClrType::Int32,
            mapping: None,
        }]);
        let err = RelationalCommand::bind(&t, &QueryParameters::new()).unwrap_err();
        assert_eq!(err.code(), "invalid_operation");
        assert!(err.to_string().contains("'rating'"));
    }

    #[test]
    fn mapped_values_use_the_provider_type() {
        let mappings = RelationalTypeMappingSource::new(Dialect::Postgres);
        let mapping = mappings.find_mapping(&ClrType::Bool, None);
        let t = template(vec![CommandParameter {
            placeholder: "$1".into(),
            invariant_name: "active".into(),
            ty: ClrType::Bool,
            mapping,
        }]);
        let command = RelationalCommand::bind(&t, &QueryParameters::new().with("active", true)).unwrap();
        assert_eq!(command.parameters[0].placeholder, "$1");
        assert_eq!(command.parameters[0].provider_type, ClrType::Bool);
        assert_eq!(command.values(), vec![&Value::Bool(true)]);
    }
}
