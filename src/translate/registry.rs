//! Translator registry: ordered chains of method-call and member translators. The first translator
//! returning `Some` wins; user plugins run before database functions and the built-in providers.

use super::functions::{
    DateTimeTranslator, DbFunction, DbFunctionTranslator, EqualsTranslator, HasFlagTranslator, MathTranslator,
    StringTranslator,
};
use crate::options::Dialect;
use crate::query::{DeclaringType, MethodRef};
use crate::sql::{SqlExpression, SqlExpressionFactory};
use std::sync::Arc;
use tracing::trace;

pub trait MethodCallTranslator: Send + Sync {
    /// `instance` is `None` for static methods.
    fn translate(
        &self,
        factory: &SqlExpressionFactory,
        instance: Option<&SqlExpression>,
        method: &MethodRef,
        args: &[SqlExpression],
    ) -> Option<SqlExpression>;
}

pub trait MemberTranslator: Send + Sync {
    /// `instance` is `None` for static members; `declaring` is the type the member is read from.
    fn translate(
        &self,
        factory: &SqlExpressionFactory,
        instance: Option<&SqlExpression>,
        declaring: &DeclaringType,
        member: &str,
    ) -> Option<SqlExpression>;
}

#[derive(Clone)]
pub struct TranslatorRegistry {
    plugin_methods: Vec<Arc<dyn MethodCallTranslator>>,
    plugin_members: Vec<Arc<dyn MemberTranslator>>,
    db_functions: DbFunctionTranslator,
    methods: Vec<Arc<dyn MethodCallTranslator>>,
    members: Vec<Arc<dyn MemberTranslator>>,
}

impl TranslatorRegistry {
    /// Built-in translators for `dialect`.
    pub fn new(dialect: Dialect) -> Self {
        let datetime = Arc::new(DateTimeTranslator::new(dialect));
        let string = Arc::new(StringTranslator::new(dialect));
        let methods: Vec<Arc<dyn MethodCallTranslator>> = vec![
            Arc::new(EqualsTranslator),
            Arc::new(HasFlagTranslator),
            string.clone(),
            Arc::new(MathTranslator::new(dialect)),
            datetime.clone(),
        ];
        let members: Vec<Arc<dyn MemberTranslator>> = vec![string, datetime];
        TranslatorRegistry {
            plugin_methods: Vec::new(),
            plugin_members: Vec::new(),
            db_functions: DbFunctionTranslator::default(),
            methods,
            members,
        }
    }

    pub fn add_method_translator(&mut self, translator: Arc<dyn MethodCallTranslator>) -> &mut Self {
        self.plugin_methods.push(translator);
        self
    }

    pub fn add_member_translator(&mut self, translator: Arc<dyn MemberTranslator>) -> &mut Self {
        self.plugin_members.push(translator);
        self
    }

    pub fn register_db_function(&mut self, function: DbFunction) -> &mut Self {
        self.db_functions.register(function);
        self
    }

    pub fn translate_method(
        &self,
        factory: &SqlExpressionFactory,
        instance: Option<&SqlExpression>,
        method: &MethodRef,
        args: &[SqlExpression],
    ) -> Option<SqlExpression> {
        let found = self
            .plugin_methods
            .iter()
            .find_map(|t| t.translate(factory, instance, method, args))
            .or_else(|| self.db_functions.translate(factory, instance, method, args))
            .or_else(|| self.methods.iter().find_map(|t| t.translate(factory, instance, method, args)));
        if found.is_none() {
            trace!(method = %format!("{}.{}", method.declaring, method.name), "no translator matched");
        }
        found
    }

    pub fn translate_member(
        &self,
        factory: &SqlExpressionFactory,
        instance: Option<&SqlExpression>,
        declaring: &DeclaringType,
        member: &str,
    ) -> Option<SqlExpression> {
        let found = self
            .plugin_members
            .iter()
            .chain(self.members.iter())
            .find_map(|t| t.translate(factory, instance, declaring, member));
        if found.is_none() {
            trace!(member = %format!("{}.{}", declaring, member), "no translator matched");
        }
        found
    }
}

impl std::fmt::Debug for TranslatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatorRegistry")
            .field("plugin_methods", &self.plugin_methods.len())
            .field("plugin_members", &self.plugin_members.len())
            .field("db_functions", &self.db_functions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RelationalTypeMappingSource;
    use crate::value::{ClrType, Value};

    struct Shout;

    impl MethodCallTranslator for Shout {
        fn translate(
            &self,
            factory: &SqlExpressionFactory,
            instance: Option<&SqlExpression>,
            method: &MethodRef,
            _args: &[SqlExpression],
        ) -> Option<SqlExpression> {
            if !method.is(&DeclaringType::String, "ToUpper") {
                return None;
            }
            Some(factory.function("SHOUT", vec![instance?.clone()], ClrType::String, true))
        }
    }

    fn factory() -> SqlExpressionFactory {
        SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(Dialect::Sqlite)), false)
    }

    #[test]
    fn plugins_run_before_built_ins() {
        let f = factory();
        let mut registry = TranslatorRegistry::new(Dialect::Sqlite);
        let name = f.constant(Value::from("x"), ClrType::String);
        let method = MethodRef::new(DeclaringType::String, "ToUpper");
        let built_in = registry.translate_method(&f, Some(&name), &method, &[]);
        assert!(matches!(built_in, Some(SqlExpression::Function { ref name, .. }) if name == "upper"));

        registry.add_method_translator(Arc::new(Shout));
        let plugin = registry.translate_method(&f, Some(&name), &method, &[]);
        assert!(matches!(plugin, Some(SqlExpression::Function { ref name, .. }) if name == "SHOUT"));
    }

    #[test]
    fn unknown_methods_decline() {
        let f = factory();
        let registry = TranslatorRegistry::new(Dialect::Sqlite);
        let method = MethodRef::new(DeclaringType::Custom("Slug".into()), "Make");
        assert!(registry.translate_method(&f, None, &method, &[]).is_none());
    }
}
