use super::any_nullable;
use crate::query::{DeclaringType, MethodRef};
use crate::sql::{SqlExpression, SqlExpressionFactory};
use crate::translate::registry::MethodCallTranslator;
use crate::value::ClrType;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Custom rendering for a mapped function, given the translated arguments.
pub type FunctionTranslation = Arc<dyn Fn(&SqlExpressionFactory, &[SqlExpression]) -> SqlExpression + Send + Sync>;

/// A user method mapped onto a store function.
#[derive(Clone)]
pub struct DbFunction {
    pub declaring: DeclaringType,
    pub name: String,
    /// Name of the store function; defaults to `name`.
    pub store_name: String,
    pub return_type: ClrType,
    pub nullable: bool,
    pub translation: Option<FunctionTranslation>,
}

impl DbFunction {
    pub fn new(declaring: DeclaringType, name: &str, return_type: ClrType) -> Self {
        DbFunction {
            declaring,
            name: name.to_string(),
            store_name: name.to_string(),
            return_type,
            nullable: true,
            translation: None,
        }
    }

    pub fn with_store_name(mut self, store_name: &str) -> Self {
        self.store_name = store_name.to_string();
        self
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn with_translation(mut self, translation: FunctionTranslation) -> Self {
        self.translation = Some(translation);
        self
    }
}

impl fmt::Debug for DbFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbFunction")
            .field("declaring", &self.declaring)
            .field("name", &self.name)
            .field("store_name", &self.store_name)
            .field("return_type", &self.return_type)
            .field("custom", &self.translation.is_some())
            .finish()
    }
}

/// Registered [`DbFunction`]s, keyed by declaring type and method name. Static calls only.
#[derive(Clone, Debug, Default)]
pub struct DbFunctionTranslator {
    functions: HashMap<MethodRef, DbFunction>,
}

impl DbFunctionTranslator {
    /// Registering a function twice replaces the earlier mapping.
    pub fn register(&mut self, function: DbFunction) {
        let key = MethodRef::new(function.declaring.clone(), &function.name);
        self.functions.insert(key, function);
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl MethodCallTranslator for DbFunctionTranslator {
    fn translate(
        &self,
        f: &SqlExpressionFactory,
        instance: Option<&SqlExpression>,
        method: &MethodRef,
        args: &[SqlExpression],
    ) -> Option<SqlExpression> {
        if instance.is_some() {
            return None;
        }
        let function = self.functions.get(method)?;
        if let Some(custom) = &function.translation {
            return Some(custom(f, args));
        }
        let nullable = function.nullable || any_nullable(args);
        let ty = if nullable {
            function.return_type.clone().make_nullable()
        } else {
            function.return_type.clone()
        };
        Some(f.function(&function.store_name, args.to_vec(), ty, nullable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Dialect;
    use crate::storage::RelationalTypeMappingSource;
    use crate::value::Value;

    fn factory() -> SqlExpressionFactory {
        SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(Dialect::Postgres)), false)
    }

    fn slug() -> DeclaringType {
        DeclaringType::Custom("Slug".into())
    }

    #[test]
    fn maps_to_store_function() {
        let f = factory();
        let mut functions = DbFunctionTranslator::default();
        functions.register(DbFunction::new(slug(), "Make", ClrType::String).with_store_name("make_slug"));
        let arg = f.constant(Value::from("Hello World"), ClrType::String);
        let translated = functions.translate(&f, None, &MethodRef::new(slug(), "Make"), &[arg]);
        assert!(matches!(translated, Some(SqlExpression::Function { ref name, .. }) if name == "make_slug"));
        assert!(functions
            .translate(&f, None, &MethodRef::new(slug(), "Other"), &[])
            .is_none());
    }

    #[test]
    fn custom_translation_wins() {
        let f = factory();
        let mut functions = DbFunctionTranslator::default();
        functions.register(
            DbFunction::new(slug(), "Empty", ClrType::String)
                .with_translation(Arc::new(|f, _| f.constant(Value::Text(String::new()), ClrType::String))),
        );
        let translated = functions.translate(&f, None, &MethodRef::new(slug(), "Empty"), &[]);
        assert!(matches!(translated, Some(SqlExpression::Constant { .. })));
    }
}
