//! The query context: one unit of work over a model and a store. It compiles pipelines through
//! the plan cache, executes them and materializes results into its identity map.

use crate::cache::PlanCache;
use crate::concurrency::ConcurrencyDetector;
use crate::error::{QueryError, Result};
use crate::model::Model;
use crate::options::QueryOptions;
use crate::query::{ClientFunctions, Query, QueryParameters, Terminal};
use crate::service::{CommandExecutor, RelationalCommand};
use crate::shaper::{shape, shape_async, EntityEntry, EntityKey, IdentityScope, ShapedValue, SharedStateManager};
use crate::translate::{Cardinality, CompiledQuery, QueryCompiler, TranslatorRegistry};
use crate::value::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct QueryContext {
    compiler: QueryCompiler,
    executor: Arc<dyn CommandExecutor>,
    cache: PlanCache,
    state: SharedStateManager,
    detector: ConcurrencyDetector,
}

impl QueryContext {
    /// `options.default_schema` applies when the model does not set its own.
    pub fn new(mut model: Model, options: QueryOptions, executor: Arc<dyn CommandExecutor>) -> Self {
        if model.default_schema.is_none() {
            model.default_schema = options.default_schema.clone();
        }
        let cache = PlanCache::new(options.plan_cache_capacity);
        QueryContext {
            compiler: QueryCompiler::new(Arc::new(model), options),
            executor,
            cache,
            state: SharedStateManager::new(),
            detector: ConcurrencyDetector::new(),
        }
    }

    pub fn with_registry(mut self, registry: TranslatorRegistry) -> Self {
        self.compiler = self.compiler.with_registry(registry);
        self.cache.clear();
        self
    }

    pub fn with_client_functions(mut self, functions: ClientFunctions) -> Self {
        self.compiler = self.compiler.with_client_functions(functions);
        self.cache.clear();
        self
    }

    pub fn model(&self) -> &Arc<Model> {
        self.compiler.model()
    }

    pub fn options(&self) -> &QueryOptions {
        self.compiler.options()
    }

    pub fn plan_cache(&self) -> &PlanCache {
        &self.cache
    }

    pub fn compile(&self, query: &Query) -> Result<Arc<CompiledQuery>> {
        let _section = self.detector.enter("Compile")?;
        self.plan(query)
    }

    /// Runs `query` with its own terminal. Sequences yield every result; `First`/`Single`
    /// terminals yield one value (`ShapedValue::Null` for an empty `OrDefault`); scalar terminals
    /// yield their value.
    pub fn execute(&self, query: &Query, parameters: &QueryParameters) -> Result<Vec<ShapedValue>> {
        let _section = self.detector.enter(query.terminal.name())?;
        let compiled = self.plan(query)?;
        let parameters = with_constants(parameters, &compiled);
        let command = RelationalCommand::bind(&compiled.command, &parameters)?;
        let cursor = self.executor.execute_reader(&command)?;
        let results = shape(cursor, &compiled, &parameters, Some(self.scope()))?.collect::<Result<Vec<_>>>()?;
        reduce(compiled.cardinality, results)
    }

    pub async fn execute_async(
        &self,
        query: &Query,
        parameters: &QueryParameters,
        cancel: &CancellationToken,
    ) -> Result<Vec<ShapedValue>> {
        let _section = self.detector.enter(query.terminal.name())?;
        let compiled = self.plan(query)?;
        let parameters = with_constants(parameters, &compiled);
        let command = RelationalCommand::bind(&compiled.command, &parameters)?;
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        let cursor = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            cursor = self.executor.execute_reader_async(&command) => cursor?,
        };
        let results = shape_async(cursor, &compiled, &parameters, Some(self.scope()))?
            .collect_async(cancel)
            .await?;
        reduce(compiled.cardinality, results)
    }

    pub fn to_list(&self, query: &Query, parameters: &QueryParameters) -> Result<Vec<ShapedValue>> {
        self.execute(&query.clone().with_terminal(Terminal::ToList), parameters)
    }

    pub async fn to_list_async(
        &self,
        query: &Query,
        parameters: &QueryParameters,
        cancel: &CancellationToken,
    ) -> Result<Vec<ShapedValue>> {
        self.execute_async(&query.clone().with_terminal(Terminal::ToList), parameters, cancel)
            .await
    }

    pub fn first(&self, query: &Query, parameters: &QueryParameters) -> Result<ShapedValue> {
        single_result(self.execute(&query.clone().with_terminal(Terminal::First { or_default: false }), parameters)?)
    }

    pub fn first_or_default(&self, query: &Query, parameters: &QueryParameters) -> Result<ShapedValue> {
        single_result(self.execute(&query.clone().with_terminal(Terminal::First { or_default: true }), parameters)?)
    }

    pub async fn first_async(
        &self,
        query: &Query,
        parameters: &QueryParameters,
        cancel: &CancellationToken,
    ) -> Result<ShapedValue> {
        let query = query.clone().with_terminal(Terminal::First { or_default: false });
        single_result(self.execute_async(&query, parameters, cancel).await?)
    }

    pub fn single(&self, query: &Query, parameters: &QueryParameters) -> Result<ShapedValue> {
        single_result(self.execute(&query.clone().with_terminal(Terminal::Single { or_default: false }), parameters)?)
    }

    pub fn single_or_default(&self, query: &Query, parameters: &QueryParameters) -> Result<ShapedValue> {
        single_result(self.execute(&query.clone().with_terminal(Terminal::Single { or_default: true }), parameters)?)
    }

    pub fn count(&self, query: &Query, parameters: &QueryParameters) -> Result<i64> {
        as_count(self.execute(&query.clone().with_terminal(Terminal::Count), parameters)?)
    }

    pub async fn count_async(
        &self,
        query: &Query,
        parameters: &QueryParameters,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        as_count(
            self.execute_async(&query.clone().with_terminal(Terminal::Count), parameters, cancel)
                .await?,
        )
    }

    pub fn any(&self, query: &Query, parameters: &QueryParameters) -> Result<bool> {
        as_bool(self.execute(&query.clone().with_terminal(Terminal::Any), parameters)?)
    }

    pub async fn any_async(
        &self,
        query: &Query,
        parameters: &QueryParameters,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        as_bool(
            self.execute_async(&query.clone().with_terminal(Terminal::Any), parameters, cancel)
                .await?,
        )
    }

    /// Entities materialized by tracking queries, in the order they were first seen.
    pub fn tracked_entries(&self) -> Vec<EntityEntry> {
        self.state.with(|s| s.entries().cloned().collect())
    }

    pub fn tracked_entry(&self, key: &EntityKey) -> Option<EntityEntry> {
        self.state.with(|s| s.entry(key).cloned())
    }

    /// Detaches every tracked entity; later tracking queries create fresh instances.
    pub fn clear_tracking(&self) {
        debug!(tracked = self.state.with(|s| s.len()), "clearing tracked entities");
        self.state.clear();
    }

    fn plan(&self, query: &Query) -> Result<Arc<CompiledQuery>> {
        self.cache.get_or_compile(query, |q| self.compiler.compile(q))
    }

    fn scope(&self) -> Box<dyn IdentityScope> {
        Box::new(self.state.clone())
    }
}

fn with_constants(parameters: &QueryParameters, compiled: &CompiledQuery) -> QueryParameters {
    let mut parameters = parameters.clone();
    parameters.merge_missing(&compiled.constants);
    parameters
}

fn reduce(cardinality: Cardinality, mut results: Vec<ShapedValue>) -> Result<Vec<ShapedValue>> {
    match cardinality {
        Cardinality::Sequence => Ok(results),
        Cardinality::First { or_default } | Cardinality::Single { or_default } if results.is_empty() => {
            if or_default {
                Ok(vec![ShapedValue::Null])
            } else {
                Err(QueryError::InvalidOperation("sequence contains no elements".into()))
            }
        }
        Cardinality::Single { .. } if results.len() > 1 => Err(QueryError::InvalidOperation(
            "sequence contains more than one element".into(),
        )),
        Cardinality::First { .. } | Cardinality::Single { .. } => {
            results.truncate(1);
            Ok(results)
        }
        Cardinality::Scalar => match results.len() {
            1 => Ok(results),
            n => Err(QueryError::InvalidOperation(format!(
                "a scalar query returned {} rows instead of one",
                n
            ))),
        },
    }
}

fn single_result(results: Vec<ShapedValue>) -> Result<ShapedValue> {
    results
        .into_iter()
        .next()
        .ok_or_else(|| QueryError::InvalidOperation("sequence contains no elements".into()))
}

fn as_count(results: Vec<ShapedValue>) -> Result<i64> {
    match single_result(results)? {
        ShapedValue::Scalar(Value::Int(n)) => Ok(n),
        other => Err(QueryError::data("Count", format!("expected an integer, got {:?}", other))),
    }
}

fn as_bool(results: Vec<ShapedValue>) -> Result<bool> {
    match single_result(results)? {
        ShapedValue::Scalar(Value::Bool(b)) => Ok(b),
        ShapedValue::Scalar(Value::Int(n)) => Ok(n != 0),
        other => Err(QueryError::data("Any", format!("expected a boolean, got {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::from_json;
    use crate::options::TrackingBehavior;
    use crate::query::{lambda, param, var};
    use crate::service::InMemoryExecutor;
    use crate::translate::BLOGGING;
    use crate::value::ClrType;

    fn context(executor: &InMemoryExecutor, tracking: TrackingBehavior) -> QueryContext {
        let options = QueryOptions::default().with_tracking(tracking);
        QueryContext::new(from_json(BLOGGING).unwrap(), options, Arc::new(executor.clone()))
    }

    fn blog_row(id: i64, name: &str) -> Vec<Value> {
        vec![Value::Int(id), Value::Text(name.into()), Value::Null]
    }

    #[test]
    fn tracking_queries_resolve_to_one_instance() {
        let executor = InMemoryExecutor::new();
        executor.push_result(vec![blog_row(1, "a")]);
        executor.push_result(vec![blog_row(1, "renamed")]);
        let cx = context(&executor, TrackingBehavior::TrackAll);
        let q = Query::from("Blog");
        let first = cx.to_list(&q, &QueryParameters::new()).unwrap();
        let second = cx.to_list(&q, &QueryParameters::new()).unwrap();
        let (a, b) = (first[0].as_entity().unwrap(), second[0].as_entity().unwrap());
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(b.get("Name"), Some(&Value::Text("a".into())));
        assert_eq!(cx.tracked_entries().len(), 1);

        cx.clear_tracking();
        assert!(cx.tracked_entries().is_empty());
    }

    #[test]
    fn no_tracking_queries_create_fresh_instances() {
        let executor = InMemoryExecutor::new();
        executor.push_result(vec![blog_row(1, "a")]);
        executor.push_result(vec![blog_row(1, "a")]);
        let cx = context(&executor, TrackingBehavior::NoTracking);
        let q = Query::from("Blog");
        let first = cx.to_list(&q, &QueryParameters::new()).unwrap();
        let second = cx.to_list(&q, &QueryParameters::new()).unwrap();
        assert!(!Arc::ptr_eq(first[0].as_entity().unwrap(), second[0].as_entity().unwrap()));
        assert!(cx.tracked_entries().is_empty());
    }

    #[test]
    fn first_and_single_enforce_cardinality() {
        let executor = InMemoryExecutor::new();
        let cx = context(&executor, TrackingBehavior::NoTracking);
        let q = Query::from("Blog");
        let params = QueryParameters::new();

        let err = cx.first(&q, &params).unwrap_err();
        assert_eq!(err.code(), "invalid_operation");
        assert_eq!(cx.first_or_default(&q, &params).unwrap(), ShapedValue::Null);

        executor.push_result(vec![blog_row(1, "a"), blog_row(2, "b")]);
        let err = cx.single(&q, &params).unwrap_err();
        assert!(err.to_string().contains("more than one element"));
    }

    #[test]
    fn count_binds_parameters_and_reuses_the_plan() {
        let executor = InMemoryExecutor::new();
        executor.on_sql("COUNT(*)", vec![vec![Value::Int(3)]]);
        let cx = context(&executor, TrackingBehavior::NoTracking);
        let q = Query::from("Blog").filter(lambda(&["b"], var("b").member("Rating").gt(param("min", ClrType::Int32))));

        assert_eq!(cx.count(&q, &QueryParameters::new().with("min", 2)).unwrap(), 3);
        assert_eq!(cx.count(&q, &QueryParameters::new().with("min", 4)).unwrap(), 3);
        assert_eq!(cx.plan_cache().stats().hits, 1);

        let executed = executor.executed();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[1].parameters[0].value, Value::Int(4));

        let err = cx.count(&q, &QueryParameters::new()).unwrap_err();
        assert!(err.to_string().contains("'min'"));
    }

    #[test]
    fn any_accepts_integer_booleans() {
        let executor = InMemoryExecutor::new();
        executor.push_result(vec![vec![Value::Int(1)]]);
        let cx = context(&executor, TrackingBehavior::NoTracking);
        assert!(cx.any(&Query::from("Blog"), &QueryParameters::new()).unwrap());
    }

    #[test]
    fn default_schema_comes_from_options() {
        let executor = InMemoryExecutor::new();
        let options = QueryOptions {
            default_schema: Some("blogging".into()),
            ..QueryOptions::default()
        };
        let cx = QueryContext::new(from_json(BLOGGING).unwrap(), options, Arc::new(executor.clone()));
        let compiled = cx.compile(&Query::from("Blog")).unwrap();
        assert!(compiled.command.sql.contains("\"blogging\".\"Blogs\""));
    }

    #[tokio::test]
    async fn cancelled_token_stops_execution() {
        let executor = InMemoryExecutor::new();
        executor.push_result(vec![blog_row(1, "a")]);
        let cx = context(&executor, TrackingBehavior::NoTracking);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cx
            .to_list_async(&Query::from("Blog"), &QueryParameters::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
        assert!(executor.executed().is_empty());
    }
}
