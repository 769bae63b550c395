//! The query compiler: runs an operator pipeline through the visitor and projection binder,
//! finishes the select (collection joins, orderings, projection ordinals), renders the SQL and
//! builds the shaper that reads its rows.

use super::navigation::{
    collection_correlation, discriminator_filter, entity_projection, expand_reference, key_columns,
};
use super::projection::{bind_projection, Mapping};
use super::registry::TranslatorRegistry;
use super::shape::{PendingCollection, ShapeExpr};
use super::visitor::{aggregate, find_navigation, AggregateKind, Bound, CompileContext, Visitor};
use crate::error::{QueryError, Result};
use crate::model::{EntityTypeId, Model};
use crate::options::{QueryOptions, TrackingBehavior};
use crate::query::{ClientFunctions, Expr, Lambda, Query, QueryOperator, QueryParameters, QuerySource, Terminal};
use crate::shaper::{CollectionShaper, EntityShaper, IncludeShaper, IncludeTarget, PropertySlot, ScalarSlot, Shaper};
use crate::sql::{
    AliasGenerator, CaseWhen, EntityProjection, JoinKind, MappedProjection, Ordering, ProjectionMember,
    QuerySqlGeneratorFactory, RelationalCommandTemplate, SelectExpression, SqlExpression, SqlExpressionFactory,
    TableSource,
};
use crate::storage::{RelationalTypeMappingSource, TypeMappingSource};
use crate::value::{ClrType, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// How many results a compiled query produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    Sequence,
    First { or_default: bool },
    Single { or_default: bool },
    /// One server-computed value (`Count`, `Any`, `Sum`, ...).
    Scalar,
}

/// A query ready to execute: the SQL template and everything needed to shape its rows.
#[derive(Clone)]
pub struct CompiledQuery {
    pub model: Arc<Model>,
    pub command: RelationalCommandTemplate,
    pub shaper: Shaper,
    /// Ordinals identifying one result when results span several rows.
    pub identifier: Vec<usize>,
    pub cardinality: Cardinality,
    /// Predicates applied to shaped results.
    pub client_filters: Vec<Lambda>,
    pub tracking: TrackingBehavior,
    pub client_functions: Arc<ClientFunctions>,
    /// Parameter values fixed at compile time (literal `FromSql` arguments).
    pub constants: QueryParameters,
}

impl fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("command", &self.command)
            .field("shaper", &self.shaper)
            .field("identifier", &self.identifier)
            .field("cardinality", &self.cardinality)
            .field("client_filters", &self.client_filters.len())
            .field("tracking", &self.tracking)
            .finish()
    }
}

/// Compiles [`Query`] pipelines against one model and dialect.
pub struct QueryCompiler {
    model: Arc<Model>,
    options: QueryOptions,
    factory: SqlExpressionFactory,
    registry: Arc<TranslatorRegistry>,
    generator: QuerySqlGeneratorFactory,
    client_functions: Arc<ClientFunctions>,
}

impl QueryCompiler {
    pub fn new(model: Arc<Model>, options: QueryOptions) -> Self {
        let mappings: Arc<dyn TypeMappingSource> = Arc::new(RelationalTypeMappingSource::new(options.dialect));
        Self::with_mappings(model, options, mappings)
    }

    pub fn with_mappings(model: Arc<Model>, options: QueryOptions, mappings: Arc<dyn TypeMappingSource>) -> Self {
        QueryCompiler {
            factory: SqlExpressionFactory::new(mappings, options.use_relational_nulls),
            registry: Arc::new(TranslatorRegistry::new(options.dialect)),
            generator: QuerySqlGeneratorFactory::new(options.dialect),
            client_functions: Arc::new(ClientFunctions::default()),
            model,
            options,
        }
    }

    pub fn with_registry(mut self, registry: TranslatorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_client_functions(mut self, functions: ClientFunctions) -> Self {
        self.client_functions = Arc::new(functions);
        self
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    fn cx(&self) -> CompileContext<'_> {
        CompileContext {
            model: &self.model,
            factory: &self.factory,
            registry: &self.registry,
            options: &self.options,
        }
    }

    pub fn compile(&self, query: &Query) -> Result<CompiledQuery> {
        let mut aliases = AliasGenerator::default();
        let mut constants = QueryParameters::new();
        let mut state = self.compile_pipeline(query, &mut aliases, &mut constants)?;

        let cardinality = match &query.terminal {
            Terminal::ToList => Cardinality::Sequence,
            Terminal::First { or_default } => {
                self.limit_rows(&mut state, &mut aliases, 1);
                Cardinality::First { or_default: *or_default }
            }
            Terminal::Single { or_default } => {
                self.limit_rows(&mut state, &mut aliases, 2);
                Cardinality::Single { or_default: *or_default }
            }
            _ => Cardinality::Scalar,
        };

        let (shaper, identifier) = if cardinality == Cardinality::Scalar {
            if !state.client_filters.is_empty() {
                return Err(QueryError::translation_with(
                    query,
                    format!("'{}' cannot follow a filter evaluated on the client", query.terminal.name()),
                ));
            }
            (self.scalar_terminal(&mut state, &query.terminal, &mut aliases)?, Vec::new())
        } else {
            self.finish(&mut state, &mut aliases)?
        };

        let command = self.generator.create().generate(&state.select)?;
        debug!(query = %query, sql = %command.sql, parameters = command.parameters.len(), "compiled query");
        Ok(CompiledQuery {
            model: self.model.clone(),
            command,
            shaper,
            identifier,
            cardinality,
            client_filters: state.client_filters,
            tracking: query.tracking.unwrap_or(self.options.tracking),
            client_functions: self.client_functions.clone(),
            constants,
        })
    }

    fn compile_pipeline(
        &self,
        query: &Query,
        aliases: &mut AliasGenerator,
        constants: &mut QueryParameters,
    ) -> Result<QueryState> {
        let mut state = self.source(&query.source, aliases, constants)?;
        for op in &query.operators {
            if !state.client_filters.is_empty() {
                return Err(QueryError::translation_with(
                    op,
                    "no operator can follow a filter evaluated on the client",
                ));
            }
            self.apply(&mut state, op, aliases, constants)?;
        }
        Ok(state)
    }

    fn entity_type(&self, name: &str) -> Result<EntityTypeId> {
        self.model
            .find_entity_type(name)
            .ok_or_else(|| QueryError::InvalidOperation(format!("entity type '{}' is not part of the model", name)))
    }

    fn source(&self, source: &QuerySource, aliases: &mut AliasGenerator, constants: &mut QueryParameters) -> Result<QueryState> {
        let model = &*self.model;
        let entity_type = self.entity_type(source.entity_name())?;
        let alias = aliases.next(model.entity_name(entity_type));
        let mut select = match source {
            QuerySource::Entity(_) => {
                SelectExpression::from_table(model.table_name(entity_type), model.schema(entity_type), alias.clone())
            }
            QuerySource::FromSql { sql, args, .. } => {
                let args = self.from_sql_args(args, constants)?;
                SelectExpression::from_source(TableSource::FromSql { sql: sql.clone(), args }, alias.clone())
            }
        };
        let entity = entity_projection(model, self.factory.type_mappings(), entity_type, &alias, false);
        select.predicate = discriminator_filter(model, &self.factory, &entity, entity_type);
        select.set_identifier(key_columns(model, &entity));
        select
            .mapping_mut()
            .insert(ProjectionMember::root(), MappedProjection::Entity(entity));
        Ok(QueryState {
            select,
            shape: ShapeExpr::Entity(ProjectionMember::root()),
            includes: Vec::new(),
            client_filters: Vec::new(),
            having: None,
            grouped: false,
        })
    }

    /// Parameters pass through; literals become compile-time parameters.
    fn from_sql_args(&self, args: &[Expr], constants: &mut QueryParameters) -> Result<Vec<SqlExpression>> {
        args.iter()
            .map(|arg| match arg {
                Expr::Parameter { name, ty } => Ok(self.factory.parameter(name, ty.clone())),
                Expr::Constant { value, ty } => {
                    let name = format!("fromsql_{}", constants.len());
                    constants.set(&name, value.clone());
                    Ok(self.factory.parameter(&name, ty.clone()))
                }
                other => Err(QueryError::translation_with(
                    other,
                    "raw SQL arguments must be constants or captured parameters",
                )),
            })
            .collect()
    }

    fn push_down(&self, state: &mut QueryState, aliases: &mut AliasGenerator) {
        state.select.push_down(aliases.next("t"));
    }

    fn apply(
        &self,
        state: &mut QueryState,
        op: &QueryOperator,
        aliases: &mut AliasGenerator,
        constants: &mut QueryParameters,
    ) -> Result<()> {
        let f = &self.factory;
        match op {
            QueryOperator::Where(predicate) if state.is_grouping() => {
                let current = Bound::Shape(state.shape.clone());
                let sql = Visitor::new(self.cx(), aliases, &mut state.select)
                    .apply_sql(predicate, vec![current])?
                    .ok_or_else(|| QueryError::translation(op))?;
                state.having = Some(match state.having.take() {
                    Some(h) => f.and(h, sql),
                    None => sql,
                });
            }
            QueryOperator::Where(predicate) => {
                if state.select.is_limited() || state.select.distinct {
                    self.push_down(state, aliases);
                }
                let current = Bound::Shape(state.shape.clone());
                let translated = Visitor::new(self.cx(), aliases, &mut state.select).apply_sql(predicate, vec![current])?;
                match translated {
                    Some(sql) => {
                        state.select.predicate = Some(match state.select.predicate.take() {
                            Some(p) => f.and(p, sql),
                            None => sql,
                        })
                    }
                    None if self.options.client_evaluation => {
                        warn!(predicate = %predicate, "filter evaluated on the client");
                        state.client_filters.push(predicate.clone());
                    }
                    None => return Err(QueryError::translation(op)),
                }
            }
            QueryOperator::Select(selector) => {
                if state.select.distinct {
                    self.push_down(state, aliases);
                }
                if let ShapeExpr::Grouping { key, .. } = &state.shape {
                    let keys = self.key_expressions(&state.select, key)?;
                    state.select.group_by = keys.clone();
                    state.select.having = state.having.take();
                    state.select.set_identifier(keys);
                    state.grouped = true;
                }
                let current = Bound::Shape(state.shape.clone());
                let (shape, mapping) = {
                    let mut visitor = Visitor::new(self.cx(), aliases, &mut state.select);
                    bind_projection(&mut visitor, selector, vec![current])?
                };
                state.select.replace_mapping(mapping);
                state.shape = shape;
            }
            QueryOperator::OrderBy { key, descending } | QueryOperator::ThenBy { key, descending } => {
                let then_by = matches!(op, QueryOperator::ThenBy { .. });
                if !then_by && state.select.is_limited() {
                    self.push_down(state, aliases);
                }
                let current = Bound::Shape(state.shape.clone());
                let expression = Visitor::new(self.cx(), aliases, &mut state.select)
                    .apply_sql(key, vec![current])?
                    .ok_or_else(|| QueryError::translation(op))?;
                let ordering = Ordering {
                    expression,
                    ascending: !descending,
                };
                if then_by {
                    state.select.orderings.push(ordering);
                } else {
                    state.select.orderings = vec![ordering];
                }
            }
            QueryOperator::Skip(count) => {
                if state.select.is_limited() {
                    self.push_down(state, aliases);
                }
                let offset = Visitor::new(self.cx(), aliases, &mut state.select)
                    .translate(count)?
                    .ok_or_else(|| QueryError::translation(op))?;
                state.select.offset = Some(offset);
            }
            QueryOperator::Take(count) => {
                if state.select.limit.is_some() {
                    self.push_down(state, aliases);
                }
                let limit = Visitor::new(self.cx(), aliases, &mut state.select)
                    .translate(count)?
                    .ok_or_else(|| QueryError::translation(op))?;
                state.select.limit = Some(limit);
            }
            QueryOperator::Distinct => {
                if state.select.is_limited() {
                    self.push_down(state, aliases);
                }
                if state.shape.has_collection() || state.shape.has_client() {
                    return Err(QueryError::translation_with(op, "distinct over nested collections or client values"));
                }
                let identifier = shape_identifier(&self.model, &state.select, &state.shape);
                state.select.distinct = true;
                state.select.set_identifier(identifier);
            }
            QueryOperator::Include(path) => state.includes.push(path.clone()),
            QueryOperator::Join {
                inner,
                outer_key,
                inner_key,
                result,
            } => self.join(state, op, inner, outer_key, inner_key, result, aliases, constants)?,
            QueryOperator::GroupBy { key } => {
                if state.select.is_limited() || state.select.distinct {
                    self.push_down(state, aliases);
                }
                let current = Bound::Shape(state.shape.clone());
                let (key_shape, key_mapping) = {
                    let mut visitor = Visitor::new(self.cx(), aliases, &mut state.select);
                    bind_projection(&mut visitor, key, vec![current])?
                };
                if key_shape.has_client() || key_shape.has_collection() {
                    return Err(QueryError::translation_with(op, "grouping keys must translate to columns"));
                }
                let prefix = ProjectionMember::root().append("$key");
                merge_mapping(&mut state.select, &prefix, key_mapping);
                let key_shape = key_shape.reroot(&prefix);
                let keys = self.key_expressions(&state.select, &key_shape)?;
                state.select.set_identifier(keys);
                let element = std::mem::replace(&mut state.shape, ShapeExpr::Object(Vec::new()));
                state.shape = ShapeExpr::Grouping {
                    key: Box::new(key_shape),
                    element: Box::new(element),
                };
            }
            QueryOperator::OfType(name) => {
                let target = self.entity_type(name)?;
                let ShapeExpr::Entity(member) = &state.shape else {
                    return Err(QueryError::translation_with(op, "OfType applies to entity sequences"));
                };
                let member = member.clone();
                let Some(MappedProjection::Entity(entity)) = state.select.mapping().get(&member).cloned() else {
                    return Err(super::visitor::unmapped(&member));
                };
                if !self.model.is_assignable_from(entity.entity_type, target) {
                    return Err(QueryError::InvalidOperation(format!(
                        "'{}' does not derive from '{}'",
                        name,
                        self.model.entity_name(entity.entity_type)
                    )));
                }
                if state.select.is_limited() || state.select.distinct {
                    self.push_down(state, aliases);
                }
                let Some(MappedProjection::Entity(mut entity)) = state.select.mapping().get(&member).cloned() else {
                    return Err(super::visitor::unmapped(&member));
                };
                if let Some(filter) = discriminator_filter(&self.model, f, &entity, target) {
                    state.select.predicate = Some(match state.select.predicate.take() {
                        Some(p) => f.and(p, filter),
                        None => filter,
                    });
                }
                entity.entity_type = target;
                state.select.mapping_mut().insert(member, MappedProjection::Entity(entity));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn join(
        &self,
        state: &mut QueryState,
        op: &QueryOperator,
        inner: &Query,
        outer_key: &Lambda,
        inner_key: &Lambda,
        result: &Lambda,
        aliases: &mut AliasGenerator,
        constants: &mut QueryParameters,
    ) -> Result<()> {
        let f = &self.factory;
        let inner_state = self.compile_pipeline(inner, aliases, constants)?;
        if !inner_state.client_filters.is_empty() || inner_state.is_grouping() {
            return Err(QueryError::translation_with(op, "the inner sequence must translate completely"));
        }
        if state.select.is_limited() || state.select.distinct {
            self.push_down(state, aliases);
        }

        let mut inner_select = inner_state.select;
        let simple = inner_select.tables.len() == 1
            && !inner_select.is_limited()
            && !inner_select.distinct
            && inner_select.group_by.is_empty();
        if !simple {
            inner_select.push_down(aliases.next("t"));
        }
        let table = inner_select.tables.remove(0);
        let inner_predicate = inner_select.predicate.take();
        let inner_identifier = inner_select.identifier().to_vec();
        let prefix = ProjectionMember::root().append("$inner");
        merge_mapping(&mut state.select, &prefix, std::mem::take(inner_select.mapping_mut()));
        let inner_shape = inner_state.shape.reroot(&prefix);

        let outer = Bound::Shape(state.shape.clone());
        let inner = Bound::Shape(inner_shape);
        let mut visitor = Visitor::new(self.cx(), aliases, &mut state.select);
        let pairs: Vec<(Expr, Expr)> = match (&outer_key.body, &inner_key.body) {
            (Expr::New { members: o }, Expr::New { members: i }) if o.len() == i.len() => {
                o.iter().zip(i).map(|((_, a), (_, b))| (a.clone(), b.clone())).collect()
            }
            (o, i) => vec![(o.clone(), i.clone())],
        };
        let mut on: Option<SqlExpression> = None;
        for (o, i) in pairs {
            let left = visitor.apply_sql(&Lambda { params: outer_key.params.clone(), body: o }, vec![outer.clone()])?;
            let right = visitor.apply_sql(&Lambda { params: inner_key.params.clone(), body: i }, vec![inner.clone()])?;
            let (Some(left), Some(right)) = (left, right) else {
                return Err(QueryError::translation(op));
            };
            let eq = f.equal(left, right);
            on = Some(match on {
                Some(prev) => f.and(prev, eq),
                None => eq,
            });
        }
        let (shape, mapping) = bind_projection(&mut visitor, result, vec![outer, inner])?;
        drop(visitor);

        let on = match (on, inner_predicate) {
            (Some(on), Some(p)) => Some(f.and(on, p)),
            (on, None) => on,
            (None, p) => p,
        };
        state.select.add_join(JoinKind::Inner, table.source, table.alias, on);
        let mut identifier = state.select.identifier().to_vec();
        identifier.extend(inner_identifier);
        state.select.set_identifier(identifier);
        state.select.replace_mapping(mapping);
        state.shape = shape;
        Ok(())
    }

    fn key_expressions(&self, select: &SelectExpression, key: &ShapeExpr) -> Result<Vec<SqlExpression>> {
        let keys = shape_identifier(&self.model, select, key);
        if keys.is_empty() {
            return Err(QueryError::InvalidOperation("a grouping key must have at least one column".into()));
        }
        Ok(keys)
    }

    fn limit_rows(&self, state: &mut QueryState, aliases: &mut AliasGenerator, rows: i64) {
        if !state.client_filters.is_empty() {
            return;
        }
        if state.select.limit.is_some() {
            self.push_down(state, aliases);
        }
        state.select.limit = Some(self.factory.constant(Value::Int(rows), ClrType::Int32));
    }

    fn scalar_terminal(&self, state: &mut QueryState, terminal: &Terminal, aliases: &mut AliasGenerator) -> Result<Shaper> {
        let f = &self.factory;
        if state.having.is_some() && !matches!(terminal, Terminal::Count) {
            return Err(QueryError::translation_with(
                "Where",
                "a filter over groups must be followed by a projection",
            ));
        }
        let value = match terminal {
            Terminal::Count => {
                if let ShapeExpr::Grouping { key, .. } = &state.shape {
                    let keys = self.key_expressions(&state.select, key)?;
                    let root = ProjectionMember::root();
                    let mapping = keys
                        .iter()
                        .enumerate()
                        .map(|(i, k)| (root.append(&format!("k{}", i)), MappedProjection::Scalar(k.clone())))
                        .collect();
                    state.select.group_by = keys;
                    state.select.having = state.having.take();
                    state.select.replace_mapping(mapping);
                }
                if state.select.is_limited() || state.select.distinct || state.grouped || !state.select.group_by.is_empty() {
                    self.push_down(state, aliases);
                }
                state.select.orderings.clear();
                f.count()
            }
            Terminal::Any | Terminal::All(_) => {
                if let Terminal::All(predicate) = terminal {
                    if state.select.is_limited() || state.select.distinct {
                        self.push_down(state, aliases);
                    }
                    let current = Bound::Shape(state.shape.clone());
                    let test = Visitor::new(self.cx(), aliases, &mut state.select)
                        .apply_sql(predicate, vec![current])?
                        .ok_or_else(|| QueryError::translation(predicate))?;
                    let negated = f.not(test);
                    state.select.predicate = Some(match state.select.predicate.take() {
                        Some(p) => f.and(p, negated),
                        None => negated,
                    });
                }
                let mut inner = std::mem::take(&mut state.select);
                if !inner.is_limited() {
                    inner.orderings.clear();
                }
                let exists = f.exists(inner, matches!(terminal, Terminal::All(_)));
                f.case(
                    None,
                    vec![CaseWhen {
                        test: exists,
                        result: f.bool_constant(true),
                    }],
                    Some(f.bool_constant(false)),
                )
            }
            _ => {
                let ShapeExpr::Scalar(member) = &state.shape else {
                    return Err(QueryError::InvalidOperation(format!(
                        "'{}' needs a sequence of scalar values",
                        terminal.name()
                    )));
                };
                let member = member.clone();
                if state.select.is_limited() || state.select.distinct || state.grouped {
                    self.push_down(state, aliases);
                }
                let Some(MappedProjection::Scalar(value)) = state.select.mapping().get(&member).cloned() else {
                    return Err(super::visitor::unmapped(&member));
                };
                state.select.orderings.clear();
                let kind = match terminal {
                    Terminal::Min => AggregateKind::Min,
                    Terminal::Max => AggregateKind::Max,
                    Terminal::Sum => AggregateKind::Sum,
                    _ => AggregateKind::Average,
                };
                aggregate(f, kind, value)
            }
        };
        state.select.projection.clear();
        state.select.replace_mapping(Mapping::new());
        let slot = ScalarSlot {
            ordinal: 0,
            ty: value.ty(),
            mapping: value.type_mapping().cloned(),
        };
        state.select.add_to_projection(value, "c");
        Ok(Shaper::Scalar(slot))
    }

    /// Joins collections, adds identifying orderings and assigns projection ordinals.
    fn finish(&self, state: &mut QueryState, aliases: &mut AliasGenerator) -> Result<(Shaper, Vec<usize>)> {
        if state.having.is_some() {
            return Err(QueryError::translation_with(
                "Where",
                "a filter over groups must be followed by a projection",
            ));
        }
        let includes = match (&state.shape, state.includes.is_empty()) {
            (_, true) => Vec::new(),
            (ShapeExpr::Entity(_), false) => include_tree(&state.includes),
            (_, false) => {
                debug!(includes = ?state.includes, "includes ignored: the result is not an entity");
                Vec::new()
            }
        };
        let nested = state.shape.has_collection() || includes_collection(&self.model, &state.select, &state.shape, &includes);
        if nested && (state.select.is_limited() || state.select.distinct) {
            self.push_down(state, aliases);
        }

        let mut builder = ShaperBuilder {
            compiler: self,
            aliases,
            select: &mut state.select,
            child_keys: Vec::new(),
            scopes: 0,
        };
        let shape = state.shape.clone();
        let shaper = builder.build(&shape, &includes)?;
        let child_keys = std::mem::take(&mut builder.child_keys);
        drop(builder);

        if !shaper.spans_rows() {
            return Ok((shaper, Vec::new()));
        }
        let identifier = state.select.identifier().to_vec();
        if identifier.is_empty() {
            return Err(QueryError::InvalidOperation(
                "results with nested collections need a keyed root entity".into(),
            ));
        }
        for key in identifier.iter().chain(&child_keys) {
            if !state.select.orderings.iter().any(|o| &o.expression == key) {
                state.select.orderings.push(Ordering {
                    expression: key.clone(),
                    ascending: true,
                });
            }
        }
        let ordinals = identifier
            .into_iter()
            .map(|e| {
                let hint = e.alias_hint("c").to_string();
                state.select.add_to_projection(e, &hint)
            })
            .collect();
        Ok((shaper, ordinals))
    }
}

struct QueryState {
    select: SelectExpression,
    shape: ShapeExpr,
    includes: Vec<String>,
    client_filters: Vec<Lambda>,
    /// Group filter waiting for the projection that fixes `GROUP BY`.
    having: Option<SqlExpression>,
    /// A grouping was projected into aggregates.
    grouped: bool,
}

impl QueryState {
    fn is_grouping(&self) -> bool {
        matches!(self.shape, ShapeExpr::Grouping { .. })
    }
}

fn merge_mapping(select: &mut SelectExpression, prefix: &ProjectionMember, mapping: Mapping) {
    let target = select.mapping_mut();
    for (member, mapped) in mapping {
        target.insert(prefix.prepend_to(&member), mapped);
    }
}

/// Expressions identifying one value of `shape`: scalars as projected, entities by key.
fn shape_identifier(model: &Model, select: &SelectExpression, shape: &ShapeExpr) -> Vec<SqlExpression> {
    let mut out = Vec::new();
    collect_identifier(model, select.mapping(), shape, &mut out);
    out
}

fn collect_identifier(model: &Model, mapping: &Mapping, shape: &ShapeExpr, out: &mut Vec<SqlExpression>) {
    match shape {
        ShapeExpr::Scalar(m) => {
            if let Some(MappedProjection::Scalar(e)) = mapping.get(m) {
                out.push(e.clone());
            }
        }
        ShapeExpr::Entity(m) => {
            if let Some(MappedProjection::Entity(entity)) = mapping.get(m) {
                let keys = key_columns(model, entity);
                if keys.is_empty() {
                    out.extend(entity.columns.values().cloned());
                } else {
                    out.extend(keys);
                }
            }
        }
        ShapeExpr::Values(m) => {
            if let Some(MappedProjection::Values(values)) = mapping.get(m) {
                out.extend(values.iter().cloned());
            }
        }
        ShapeExpr::Object(members) => members
            .iter()
            .for_each(|(_, s)| collect_identifier(model, mapping, s, out)),
        ShapeExpr::Grouping { key, .. } => collect_identifier(model, mapping, key, out),
        ShapeExpr::Client { input, .. } => collect_identifier(model, mapping, input, out),
        ShapeExpr::Collection(_) => {}
    }
}

#[derive(Debug, Default, PartialEq)]
struct IncludeNode {
    name: String,
    children: Vec<IncludeNode>,
}

/// Dotted include paths folded into a tree; repeated prefixes are merged.
fn include_tree(paths: &[String]) -> Vec<IncludeNode> {
    let mut roots: Vec<IncludeNode> = Vec::new();
    for path in paths {
        let mut level = &mut roots;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            let index = match level.iter().position(|n| n.name == segment) {
                Some(i) => i,
                None => {
                    level.push(IncludeNode {
                        name: segment.to_string(),
                        children: Vec::new(),
                    });
                    level.len() - 1
                }
            };
            level = &mut level[index].children;
        }
    }
    roots
}

fn includes_collection(model: &Model, select: &SelectExpression, shape: &ShapeExpr, includes: &[IncludeNode]) -> bool {
    let ShapeExpr::Entity(member) = shape else {
        return false;
    };
    let Some(MappedProjection::Entity(entity)) = select.mapping().get(member) else {
        return false;
    };
    fn walk(model: &Model, entity_type: EntityTypeId, nodes: &[IncludeNode]) -> bool {
        nodes.iter().any(|node| match find_navigation(model, entity_type, &node.name) {
            Some(nav) if model.is_collection(nav) => true,
            Some(nav) => walk(model, model.navigation_target(nav), &node.children),
            None => false,
        })
    }
    walk(model, entity.entity_type, includes)
}

/// Turns shape templates into shapers, joining collections into the select as it goes.
struct ShaperBuilder<'c> {
    compiler: &'c QueryCompiler,
    aliases: &'c mut AliasGenerator,
    select: &'c mut SelectExpression,
    /// Element keys of joined collections, in join order; rows are ordered by them.
    child_keys: Vec<SqlExpression>,
    scopes: usize,
}

impl ShaperBuilder<'_> {
    fn slot(&mut self, expression: &SqlExpression, hint: &str) -> ScalarSlot {
        let ordinal = self.select.add_to_projection(expression.clone(), hint);
        ScalarSlot {
            ordinal,
            ty: expression.ty(),
            mapping: expression.type_mapping().cloned(),
        }
    }

    fn mapped(&self, member: &ProjectionMember) -> Result<MappedProjection> {
        self.select
            .mapping()
            .get(member)
            .cloned()
            .ok_or_else(|| super::visitor::unmapped(member))
    }

    fn build(&mut self, shape: &ShapeExpr, includes: &[IncludeNode]) -> Result<Shaper> {
        match shape {
            ShapeExpr::Scalar(m) => match self.mapped(m)? {
                MappedProjection::Scalar(e) => Ok(Shaper::Scalar(self.slot(&e, m.last().unwrap_or("c")))),
                _ => Err(super::visitor::unmapped(m)),
            },
            ShapeExpr::Entity(m) => match self.mapped(m)? {
                MappedProjection::Entity(entity) => Ok(Shaper::Entity(self.entity(&entity, includes)?)),
                _ => Err(super::visitor::unmapped(m)),
            },
            ShapeExpr::Values(m) => match self.mapped(m)? {
                MappedProjection::Values(values) => {
                    Ok(Shaper::Values(values.iter().map(|v| self.slot(v, "c")).collect()))
                }
                _ => Err(super::visitor::unmapped(m)),
            },
            ShapeExpr::Object(members) => {
                let mut out = Vec::with_capacity(members.len());
                for (name, member) in members {
                    out.push((name.clone(), self.build(member, &[])?));
                }
                Ok(Shaper::Object(out))
            }
            ShapeExpr::Collection(pending) => Ok(Shaper::Collection(self.collection(pending)?)),
            ShapeExpr::Grouping { key, element } => {
                let key = self.build(key, &[])?;
                let compiler = self.compiler;
                let keys = shape_identifier(&compiler.model, self.select, element);
                if keys.is_empty() {
                    return Err(QueryError::InvalidOperation("grouped elements need identifying columns".into()));
                }
                let element = self.build(element, &[])?;
                let identifier = keys.iter().map(|k| self.slot(k, "c").ordinal).collect();
                self.child_keys.extend(keys);
                Ok(Shaper::Grouping {
                    key: Box::new(key),
                    elements: CollectionShaper {
                        identifier,
                        element: Box::new(element),
                    },
                })
            }
            ShapeExpr::Client { input, selector } => Ok(Shaper::Client {
                input: Box::new(self.build(input, &[])?),
                selector: selector.clone(),
            }),
        }
    }

    fn entity(&mut self, entity: &EntityProjection, includes: &[IncludeNode]) -> Result<EntityShaper> {
        let compiler = self.compiler;
        let model = &*compiler.model;
        let mut properties = Vec::with_capacity(entity.columns.len());
        for (property, column) in &entity.columns {
            let p = model.property(*property);
            let slot = self.slot(column, &p.column);
            properties.push(PropertySlot {
                property: *property,
                name: p.name.clone(),
                shadow: p.shadow,
                slot,
            });
        }
        let key = key_columns(model, entity)
            .iter()
            .map(|k| self.slot(k, "c").ordinal)
            .collect();
        let discriminator = model
            .discriminator_property(entity.entity_type)
            .and_then(|p| entity.column(p).cloned())
            .map(|column| self.slot(&column, "c"));

        let mut shaped_includes = Vec::with_capacity(includes.len());
        for node in includes {
            let navigation = find_navigation(model, entity.entity_type, &node.name).ok_or_else(|| {
                QueryError::InvalidOperation(format!(
                    "'{}' is not a navigation of '{}'",
                    node.name,
                    model.entity_name(entity.entity_type)
                ))
            })?;
            let target = if model.is_collection(navigation) {
                let (dependent, identifier) = self.join_collection(entity, navigation, &[])?;
                IncludeTarget::Collection(Box::new(CollectionShaper {
                    identifier,
                    element: Box::new(Shaper::Entity(self.entity(&dependent, &node.children)?)),
                }))
            } else {
                let target = expand_reference(model, &compiler.factory, self.aliases, self.select, entity, navigation)?;
                IncludeTarget::Reference(Box::new(self.entity(&target, &node.children)?))
            };
            shaped_includes.push(IncludeShaper {
                navigation: node.name.clone(),
                target,
            });
        }
        Ok(EntityShaper {
            entity_type: entity.entity_type,
            properties,
            key,
            discriminator,
            nullable: entity.nullable,
            includes: shaped_includes,
        })
    }

    /// LEFT JOINs the dependents of `navigation`, filtered by `predicates` in a subquery when
    /// there are any. Returns the dependent projection and its key ordinals.
    fn join_collection(
        &mut self,
        owner: &EntityProjection,
        navigation: crate::model::NavigationId,
        predicates: &[Lambda],
    ) -> Result<(EntityProjection, Vec<usize>)> {
        let compiler = self.compiler;
        let cx = compiler.cx();
        let (model, f) = (cx.model, cx.factory);
        let target = model.navigation_target(navigation);
        let table = TableSource::Table {
            name: model.table_name(target).to_string(),
            schema: model.schema(target).map(str::to_string),
        };
        let alias = self.aliases.next(model.entity_name(target));

        let (source, alias, dependent, filter) = if predicates.is_empty() {
            let dependent = entity_projection(model, f.type_mappings(), target, &alias, true);
            let filter = discriminator_filter(model, f, &dependent, target);
            (table, alias, dependent, filter)
        } else {
            let mut sub = SelectExpression::from_source(table, alias.clone());
            let element = entity_projection(model, f.type_mappings(), target, &alias, false);
            let mut predicate = discriminator_filter(model, f, &element, target);
            for p in predicates {
                let sql = Visitor::new(cx, self.aliases, &mut sub)
                    .apply_sql(p, vec![Bound::Entity(element.clone())])?
                    .ok_or_else(|| QueryError::translation(p))?;
                predicate = Some(match predicate {
                    Some(prev) => f.and(prev, sql),
                    None => sql,
                });
            }
            sub.predicate = predicate;
            sub.mapping_mut()
                .insert(ProjectionMember::root(), MappedProjection::Entity(element));
            let outer_alias = self.aliases.next("t");
            sub.push_down(outer_alias);
            let Some(MappedProjection::Entity(lifted)) = sub.mapping().get(&ProjectionMember::root()).cloned() else {
                return Err(QueryError::InvalidOperation("filtered collection lost its projection".into()));
            };
            let item = sub.tables.remove(0);
            (item.source, item.alias, lifted.make_nullable(), None)
        };

        let mut on = collection_correlation(model, f, owner, &dependent, navigation)?;
        if let Some(filter) = filter {
            on = f.and(on, filter);
        }
        self.select.add_join(JoinKind::LeftOuter, source, alias, Some(on));

        let keys = key_columns(model, &dependent);
        if keys.is_empty() {
            return Err(QueryError::InvalidOperation(format!(
                "the collection element type '{}' has no primary key",
                model.entity_name(target)
            )));
        }
        let identifier = keys.iter().map(|k| self.slot(k, "c").ordinal).collect();
        self.child_keys.extend(keys);
        Ok((dependent, identifier))
    }

    fn collection(&mut self, pending: &PendingCollection) -> Result<CollectionShaper> {
        let owner = match self.mapped(&pending.owner)? {
            MappedProjection::Entity(owner) => owner,
            _ => return Err(super::visitor::unmapped(&pending.owner)),
        };
        let (dependent, identifier) = self.join_collection(&owner, pending.navigation, &pending.predicates)?;
        let element = match &pending.selector {
            None => Shaper::Entity(self.entity(&dependent, &[])?),
            Some(selector) => {
                let compiler = self.compiler;
                let cx = compiler.cx();
                let (shape, mapping) = {
                    let mut visitor = Visitor::new(cx, self.aliases, self.select);
                    bind_projection(&mut visitor, selector, vec![Bound::Entity(dependent)])?
                };
                self.scopes += 1;
                let prefix = ProjectionMember::root().append(&format!("$c{}", self.scopes));
                merge_mapping(self.select, &prefix, mapping);
                self.build(&shape.reroot(&prefix), &[])?
            }
        };
        Ok(CollectionShaper {
            identifier,
            element: Box::new(element),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::from_json;
    use crate::options::Dialect;
    use crate::query::{lambda, new_object, param, var, DeclaringType};
    use crate::translate::visitor::tests::BLOGGING;
    use test_case::test_case;

    fn compiler(dialect: Dialect) -> QueryCompiler {
        let options = QueryOptions {
            dialect,
            ..QueryOptions::default()
        };
        QueryCompiler::new(Arc::new(from_json(BLOGGING).unwrap()), options)
    }

    fn sql(query: &Query) -> String {
        compiler(Dialect::Sqlite).compile(query).unwrap().command.sql
    }

    #[test]
    fn where_and_order_by() {
        let q = Query::from("Blog")
            .filter(lambda(&["b"], var("b").member("Rating").gt(param("minRating", ClrType::Int32))))
            .order_by(lambda(&["b"], var("b").member("Name")));
        let compiled = compiler(Dialect::Sqlite).compile(&q).unwrap();
        let text = &compiled.command.sql;
        assert!(text.starts_with("SELECT \"b\".\"Id\", \"b\".\"Name\", \"b\".\"Rating\""), "{}", text);
        assert!(text.contains("WHERE \"b\".\"Rating\" > @__minRating_0"), "{}", text);
        assert!(text.ends_with("ORDER BY \"b\".\"Name\""), "{}", text);
        assert_eq!(compiled.command.parameters.len(), 1);
        assert!(matches!(compiled.shaper, Shaper::Entity(_)));
    }

    #[test_case(Dialect::Sqlite, "LIMIT @__n_0"; "sqlite")]
    #[test_case(Dialect::Postgres, "LIMIT $1"; "postgres")]
    #[test_case(Dialect::SqlServer, "SELECT TOP(@__n_0)"; "sqlserver")]
    fn take_per_dialect(dialect: Dialect, expected: &str) {
        let q = Query::from("Blog").take(param("n", ClrType::Int32));
        let text = compiler(dialect).compile(&q).unwrap().command.sql;
        assert!(text.contains(expected), "{}", text);
    }

    #[test]
    fn projection_excludes_unreferenced_columns() {
        let q = Query::from("Blog").select(lambda(
            &["b"],
            new_object(vec![("Id", var("b").member("Id")), ("Name", var("b").member("Name"))]),
        ));
        let text = sql(&q);
        assert!(text.starts_with("SELECT \"b\".\"Id\", \"b\".\"Name\"\nFROM"), "{}", text);
        assert!(!text.contains("Rating"), "{}", text);
    }

    #[test]
    fn where_after_take_pushes_down() {
        let q = Query::from("Blog")
            .take(Expr::int(5))
            .filter(lambda(&["b"], var("b").member("Rating").gt(Expr::int(3))));
        let text = sql(&q);
        assert!(text.contains("FROM (\n"), "{}", text);
        assert!(text.contains("LIMIT 5"), "{}", text);
        assert!(text.contains(") AS \"t\"\nWHERE \"t\".\"Rating\" > 3"), "{}", text);
    }

    #[test]
    fn include_collection_orders_by_keys() {
        let q = Query::from("Blog").include("Posts");
        let compiled = compiler(Dialect::Sqlite).compile(&q).unwrap();
        let text = &compiled.command.sql;
        assert!(text.contains("LEFT JOIN \"Posts\" AS \"p\" ON \"b\".\"Id\" = \"p\".\"BlogId\""), "{}", text);
        assert!(text.ends_with("ORDER BY \"b\".\"Id\", \"p\".\"Id\""), "{}", text);
        assert!(compiled.shaper.spans_rows());
        assert_eq!(compiled.identifier, vec![0]);
    }

    #[test]
    fn untranslatable_filter_runs_on_the_client() {
        let custom = lambda(
            &["b"],
            var("b")
                .member("Name")
                .call(DeclaringType::Custom("Slug".into()), "IsValid", vec![]),
        );
        let compiled = compiler(Dialect::Sqlite).compile(&Query::from("Blog").filter(custom.clone())).unwrap();
        assert_eq!(compiled.client_filters.len(), 1);
        assert!(!compiled.command.sql.contains("WHERE"));

        let after = Query::from("Blog").filter(custom).take(Expr::int(1));
        let err = compiler(Dialect::Sqlite).compile(&after).unwrap_err();
        assert_eq!(err.code(), "translation_error");
    }

    #[test]
    fn count_of_distinct_pushes_down() {
        let q = Query::from("Post")
            .select(lambda(&["p"], var("p").member("BlogId")))
            .distinct()
            .with_terminal(Terminal::Count);
        let compiled = compiler(Dialect::Sqlite).compile(&q).unwrap();
        assert!(compiled.command.sql.starts_with("SELECT COUNT(*)\nFROM (\n    SELECT DISTINCT"), "{}", compiled.command.sql);
        assert_eq!(compiled.cardinality, Cardinality::Scalar);
    }

    #[test]
    fn group_by_with_aggregates() {
        let q = Query::from("Post")
            .group_by(lambda(&["p"], var("p").member("BlogId")))
            .select(lambda(
                &["g"],
                new_object(vec![
                    ("BlogId", var("g").member("Key")),
                    ("Total", var("g").seq("Sum", vec![Expr::Lambda(Box::new(lambda(&["p"], var("p").member("Score"))))])),
                ]),
            ));
        let text = sql(&q);
        assert!(text.contains("COALESCE(SUM(\"p\".\"Score\"), 0)"), "{}", text);
        assert!(text.ends_with("GROUP BY \"p\".\"BlogId\""), "{}", text);
    }

    #[test]
    fn any_wraps_exists() {
        let q = Query::from("Blog").with_terminal(Terminal::Any);
        let text = sql(&q);
        assert!(text.starts_with("SELECT CASE"), "{}", text);
        assert!(text.contains("EXISTS ("), "{}", text);
    }

    #[test]
    fn negated_equality_on_nullable_column_keeps_null_rows() {
        let negated = Query::from("Blog").filter(lambda(&["b"], var("b").member("Rating").eq(Expr::int(3)).not()));
        let unequal = Query::from("Blog").filter(lambda(&["b"], var("b").member("Rating").ne(Expr::int(3))));
        let text = sql(&negated);
        assert!(text.ends_with("WHERE \"b\".\"Rating\" <> 3 OR \"b\".\"Rating\" IS NULL"), "{}", text);
        assert_eq!(text, sql(&unequal));
    }

    #[test]
    fn all_over_nullable_column_counts_nulls_as_counterexamples() {
        let q = Query::from("Blog").with_terminal(Terminal::All(lambda(&["b"], var("b").member("Rating").gt(Expr::int(3)))));
        let text = sql(&q);
        assert!(text.contains("NOT EXISTS ("), "{}", text);
        assert!(text.contains("WHERE \"b\".\"Rating\" <= 3 OR \"b\".\"Rating\" IS NULL"), "{}", text);
    }

    #[test]
    fn include_tree_merges_prefixes() {
        let tree = include_tree(&["Posts".to_string(), "Posts.Blog".to_string()]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].children.len(), 1);
    }
}
