//! Translation of query-tree expressions into SQL. The visitor declines (`Ok(None)`) whatever it
//! cannot express; callers decide between client evaluation and a translation error.

use super::navigation::{
    collection_correlation, discriminator_filter, entity_projection, expand_reference, key_columns, property_column,
};
use super::registry::TranslatorRegistry;
use super::shape::ShapeExpr;
use crate::error::{QueryError, Result};
use crate::model::{EntityTypeId, Model, NavigationId, PropertyId};
use crate::options::QueryOptions;
use crate::query::{BinaryOp, DeclaringType, Expr, Lambda, MethodRef, UnaryOp};
use crate::sql::{
    AliasGenerator, CaseWhen, EntityProjection, MappedProjection, ProjectionMember, SelectExpression,
    SqlBinaryOperator, SqlExpression, SqlExpressionFactory,
};
use crate::value::{ClrType, Value};
use tracing::trace;

/// Everything translation reads but never changes.
#[derive(Clone, Copy)]
pub(crate) struct CompileContext<'a> {
    pub model: &'a Model,
    pub factory: &'a SqlExpressionFactory,
    pub registry: &'a TranslatorRegistry,
    pub options: &'a QueryOptions,
}

/// A collection navigation of an entity, with the `Where`/`Select` calls applied to it so far.
#[derive(Clone, Debug)]
pub(crate) struct CollectionRef {
    pub owner: EntityProjection,
    pub navigation: NavigationId,
    pub predicates: Vec<Lambda>,
    pub selector: Option<Lambda>,
}

/// The elements of a grouping, read through aggregates.
#[derive(Clone, Debug)]
pub(crate) struct GroupRef {
    pub key: ShapeExpr,
    pub element: ShapeExpr,
    pub predicates: Vec<Lambda>,
    pub selector: Option<Lambda>,
}

/// What an expression evaluates to during translation.
#[derive(Clone, Debug)]
pub(crate) enum Bound {
    Sql(SqlExpression),
    Entity(EntityProjection),
    Collection(CollectionRef),
    Group(GroupRef),
    /// A shape resolved against the current projection mapping on use.
    Shape(ShapeExpr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AggregateKind {
    Count,
    Any,
    All,
    Sum,
    Min,
    Max,
    Average,
}

fn parse_aggregate<'e>(name: &str, args: &'e [Expr]) -> Option<(AggregateKind, Option<&'e Lambda>)> {
    let kind = match name {
        "Count" | "LongCount" => AggregateKind::Count,
        "Any" => AggregateKind::Any,
        "All" => AggregateKind::All,
        "Sum" => AggregateKind::Sum,
        "Min" => AggregateKind::Min,
        "Max" => AggregateKind::Max,
        "Average" => AggregateKind::Average,
        _ => return None,
    };
    let lambda = match args {
        [] => None,
        [Expr::Lambda(l)] => Some(l.as_ref()),
        _ => return None,
    };
    if kind == AggregateKind::All && lambda.is_none() {
        return None;
    }
    Some((kind, lambda))
}

pub(crate) fn unmapped(member: &ProjectionMember) -> QueryError {
    QueryError::InvalidOperation(format!("no projection is mapped for member '{}'", member))
}

/// Type whose translators handle members and methods called on a value of type `ty`.
fn declaring_type(ty: &ClrType) -> DeclaringType {
    match ty.unwrap_nullable() {
        ClrType::String => DeclaringType::String,
        ClrType::DateTime | ClrType::Date => DeclaringType::DateTime,
        ClrType::Enum(_) => DeclaringType::Enum,
        _ => DeclaringType::Object,
    }
}

fn is_bool(expr: &SqlExpression) -> bool {
    matches!(expr.ty().unwrap_nullable(), ClrType::Bool)
}

pub(crate) fn find_property(model: &Model, entity_type: EntityTypeId, name: &str) -> Option<PropertyId> {
    model.find_property_in_hierarchy(entity_type, name)
}

pub(crate) fn find_navigation(model: &Model, entity_type: EntityTypeId, name: &str) -> Option<NavigationId> {
    model.find_navigation(entity_type, name).or_else(|| {
        model
            .derived_types(entity_type)
            .into_iter()
            .find_map(|t| model.find_declared_navigation(t, name))
    })
}

/// `SUM` (null-coalesced to zero), `MIN`, `MAX` or `AVG` over `value`.
pub(crate) fn aggregate(f: &SqlExpressionFactory, kind: AggregateKind, value: SqlExpression) -> SqlExpression {
    let value = f.apply_default_type_mapping(value);
    let base = value.ty().unwrap_nullable().clone();
    let mapping = value.type_mapping().cloned();
    match kind {
        AggregateKind::Sum => {
            let sum = f.function_with_mapping("SUM", vec![value], base.clone().make_nullable(), true, mapping);
            let zero = Value::Int(0).coerce_to(&base).unwrap_or(Value::Int(0));
            f.coalesce(sum, f.constant(zero, base))
        }
        AggregateKind::Average => {
            let value = if base.is_integer() { f.convert(value, ClrType::Float64) } else { value };
            let ty = value.ty().unwrap_nullable().clone();
            let mapping = f.find_mapping(&ty);
            f.function_with_mapping("AVG", vec![value], ty.make_nullable(), true, mapping)
        }
        AggregateKind::Min => f.function_with_mapping("MIN", vec![value], base.make_nullable(), true, mapping),
        _ => f.function_with_mapping("MAX", vec![value], base.make_nullable(), true, mapping),
    }
}

pub(crate) struct Visitor<'a> {
    cx: CompileContext<'a>,
    aliases: &'a mut AliasGenerator,
    select: &'a mut SelectExpression,
    bindings: Vec<(String, Bound)>,
}

impl<'a> Visitor<'a> {
    pub fn new(cx: CompileContext<'a>, aliases: &'a mut AliasGenerator, select: &'a mut SelectExpression) -> Self {
        Visitor {
            cx,
            aliases,
            select,
            bindings: Vec::new(),
        }
    }

    pub fn context(&self) -> CompileContext<'a> {
        self.cx
    }

    pub fn select(&self) -> &SelectExpression {
        self.select
    }

    /// A visitor over another select (a subquery), sharing aliases and bindings.
    pub fn nested<'b>(&'b mut self, select: &'b mut SelectExpression) -> Visitor<'b> {
        Visitor {
            cx: self.cx,
            aliases: &mut *self.aliases,
            select,
            bindings: self.bindings.clone(),
        }
    }

    pub fn translate(&mut self, expr: &Expr) -> Result<Option<SqlExpression>> {
        Ok(match self.visit(expr)? {
            Some(Bound::Sql(sql)) => Some(sql),
            _ => None,
        })
    }

    /// Visits the body of `lambda` with its parameters bound to `args`.
    pub fn apply(&mut self, lambda: &Lambda, args: Vec<Bound>) -> Result<Option<Bound>> {
        let depth = self.bindings.len();
        for (name, arg) in lambda.params.iter().zip(args) {
            self.bindings.push((name.clone(), arg));
        }
        let result = self.visit(&lambda.body);
        self.bindings.truncate(depth);
        result
    }

    pub fn apply_sql(&mut self, lambda: &Lambda, args: Vec<Bound>) -> Result<Option<SqlExpression>> {
        Ok(match self.apply(lambda, args)? {
            Some(Bound::Sql(sql)) => Some(sql),
            _ => None,
        })
    }

    /// Runs `f` with the parameters of `lambda` bound, for callers walking the body themselves.
    pub fn with_bindings<R>(&mut self, lambda: &Lambda, args: Vec<Bound>, f: impl FnOnce(&mut Self) -> R) -> R {
        let depth = self.bindings.len();
        for (name, arg) in lambda.params.iter().zip(args) {
            self.bindings.push((name.clone(), arg));
        }
        let result = f(self);
        self.bindings.truncate(depth);
        result
    }

    pub fn resolve(&self, shape: &ShapeExpr) -> Result<Option<Bound>> {
        let mapping = self.select.mapping();
        Ok(match shape {
            ShapeExpr::Scalar(m) => match mapping.get(m) {
                Some(MappedProjection::Scalar(e)) => Some(Bound::Sql(e.clone())),
                _ => return Err(unmapped(m)),
            },
            ShapeExpr::Entity(m) => match mapping.get(m) {
                Some(MappedProjection::Entity(ep)) => Some(Bound::Entity(ep.clone())),
                _ => return Err(unmapped(m)),
            },
            ShapeExpr::Object(_) | ShapeExpr::Values(_) => Some(Bound::Shape(shape.clone())),
            ShapeExpr::Collection(pending) => match mapping.get(&pending.owner) {
                Some(MappedProjection::Entity(owner)) => Some(Bound::Collection(CollectionRef {
                    owner: owner.clone(),
                    navigation: pending.navigation,
                    predicates: pending.predicates.clone(),
                    selector: pending.selector.clone(),
                })),
                _ => return Err(unmapped(&pending.owner)),
            },
            ShapeExpr::Grouping { key, element } => Some(Bound::Group(GroupRef {
                key: (**key).clone(),
                element: (**element).clone(),
                predicates: Vec::new(),
                selector: None,
            })),
            ShapeExpr::Client { .. } => None,
        })
    }

    pub fn visit(&mut self, expr: &Expr) -> Result<Option<Bound>> {
        let f = self.cx.factory;
        match expr {
            Expr::Constant { value, ty } => Ok(Some(Bound::Sql(f.constant(value.clone(), ty.clone())))),
            Expr::Parameter { name, ty } => Ok(Some(Bound::Sql(f.parameter(name, ty.clone())))),
            Expr::Variable(name) => {
                let bound = self
                    .bindings
                    .iter()
                    .rev()
                    .find(|(n, _)| n == name)
                    .map(|(_, b)| b.clone());
                match bound {
                    Some(Bound::Shape(shape)) => self.resolve(&shape),
                    Some(other) => Ok(Some(other)),
                    None => {
                        trace!(variable = %name, "unbound variable");
                        Ok(None)
                    }
                }
            }
            Expr::Member { target, member } => match self.visit(target)? {
                Some(target) => self.member(target, member),
                None => Ok(None),
            },
            Expr::StaticMember { declaring, member } => {
                Ok(self.cx.registry.translate_member(f, None, declaring, member).map(Bound::Sql))
            }
            Expr::Call { target, method, args } => self.call(target.as_deref(), method, args),
            Expr::Binary { op, left, right } => self.binary(*op, left, right),
            Expr::Unary { op, operand } => {
                let Some(sql) = self.translate(operand)? else {
                    return Ok(None);
                };
                Ok(match op {
                    UnaryOp::Not if is_bool(&sql) => Some(Bound::Sql(f.not(sql))),
                    UnaryOp::Not => None,
                    UnaryOp::Negate => Some(Bound::Sql(f.negate(sql))),
                })
            }
            Expr::Convert { operand, ty } => self.convert(operand, ty),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                let test = self.translate(test)?;
                let if_true = self.translate(if_true)?;
                let if_false = self.translate(if_false)?;
                let (Some(test), Some(result), Some(otherwise)) = (test, if_true, if_false) else {
                    return Ok(None);
                };
                Ok(Some(Bound::Sql(f.case(None, vec![CaseWhen { test, result }], Some(otherwise)))))
            }
            Expr::New { .. } | Expr::NewArray { .. } | Expr::Lambda(_) => Ok(None),
        }
    }

    fn member(&mut self, target: Bound, member: &str) -> Result<Option<Bound>> {
        let cx = self.cx;
        let model = cx.model;
        match target {
            Bound::Entity(ep) => {
                if let Some(property) = find_property(model, ep.entity_type, member) {
                    return Ok(Some(Bound::Sql(property_column(model, &ep, property)?)));
                }
                match find_navigation(model, ep.entity_type, member) {
                    Some(nav) if model.is_collection(nav) => Ok(Some(Bound::Collection(CollectionRef {
                        owner: ep,
                        navigation: nav,
                        predicates: Vec::new(),
                        selector: None,
                    }))),
                    Some(nav) => {
                        let target = expand_reference(model, cx.factory, &mut *self.aliases, &mut *self.select, &ep, nav)?;
                        Ok(Some(Bound::Entity(target)))
                    }
                    None => {
                        trace!(entity = %model.entity_name(ep.entity_type), member, "unknown entity member");
                        Ok(None)
                    }
                }
            }
            Bound::Shape(ShapeExpr::Object(members)) => match members.iter().find(|(n, _)| n == member) {
                Some((_, shape)) => self.resolve(shape),
                None => Ok(None),
            },
            Bound::Group(group) if member == "Key" => self.resolve(&group.key),
            Bound::Sql(sql) => {
                let ty = sql.ty();
                if ty.is_nullable_wrapper() {
                    match member {
                        "Value" => return Ok(Some(Bound::Sql(sql))),
                        "HasValue" => return Ok(Some(Bound::Sql(cx.factory.is_not_null(sql)))),
                        _ => {}
                    }
                }
                let declaring = declaring_type(&ty);
                Ok(cx
                    .registry
                    .translate_member(cx.factory, Some(&sql), &declaring, member)
                    .map(Bound::Sql))
            }
            _ => Ok(None),
        }
    }

    fn call(&mut self, target: Option<&Expr>, method: &MethodRef, args: &[Expr]) -> Result<Option<Bound>> {
        let cx = self.cx;
        if method.declaring == DeclaringType::Enumerable {
            let (source, rest) = match (target, args.split_first()) {
                (Some(t), _) => (t, args),
                (None, Some((first, rest))) => (first, rest),
                (None, None) => return Ok(None),
            };
            if let Expr::NewArray { elements, .. } = source.strip_object_convert() {
                return self.array_contains(&method.name, elements, rest);
            }
            return match self.visit(source)? {
                Some(Bound::Collection(c)) => self.collection_call(c, &method.name, rest),
                Some(Bound::Group(g)) => self.group_call(g, &method.name, rest),
                _ => Ok(None),
            };
        }

        let instance = match target {
            Some(t) => match self.translate(t.strip_object_convert())? {
                Some(sql) => Some(sql),
                None => return Ok(None),
            },
            None => None,
        };
        let mut translated = Vec::with_capacity(args.len());
        for arg in args {
            match self.translate(arg.strip_object_convert())? {
                Some(sql) => translated.push(sql),
                None => return Ok(None),
            }
        }
        Ok(cx
            .registry
            .translate_method(cx.factory, instance.as_ref(), method, &translated)
            .map(Bound::Sql))
    }

    /// `new[] { a, b }.Contains(x)` → `x IN (a, b)`.
    fn array_contains(&mut self, name: &str, elements: &[Expr], args: &[Expr]) -> Result<Option<Bound>> {
        let [item] = args else {
            return Ok(None);
        };
        if name != "Contains" {
            return Ok(None);
        }
        let Some(item) = self.translate(item)? else {
            return Ok(None);
        };
        let mut values = Vec::with_capacity(elements.len());
        for e in elements {
            match self.translate(e)? {
                Some(v) => values.push(v),
                None => return Ok(None),
            }
        }
        Ok(Some(Bound::Sql(self.cx.factory.in_list(item, values, false))))
    }

    /// Aggregates over a collection navigation become correlated subqueries.
    fn collection_call(&mut self, mut c: CollectionRef, name: &str, args: &[Expr]) -> Result<Option<Bound>> {
        match (name, args) {
            ("Where", [Expr::Lambda(p)]) if c.selector.is_none() => {
                c.predicates.push((**p).clone());
                return Ok(Some(Bound::Collection(c)));
            }
            ("Select", [Expr::Lambda(s)]) if c.selector.is_none() => {
                c.selector = Some((**s).clone());
                return Ok(Some(Bound::Collection(c)));
            }
            _ => {}
        }
        let Some((kind, lambda)) = parse_aggregate(name, args) else {
            return Ok(None);
        };
        let cx = self.cx;
        let (model, f) = (cx.model, cx.factory);
        let target = model.navigation_target(c.navigation);
        let alias = self.aliases.next(model.entity_name(target));
        let mut sub = SelectExpression::from_table(model.table_name(target), model.schema(target), alias.clone());
        let dependent = entity_projection(model, f.type_mappings(), target, &alias, false);
        let mut predicate = collection_correlation(model, f, &c.owner, &dependent, c.navigation)?;
        if let Some(filter) = discriminator_filter(model, f, &dependent, target) {
            predicate = f.and(predicate, filter);
        }
        let element = Bound::Entity(dependent);

        let (filters, value) = {
            let mut nested = self.nested(&mut sub);
            let mut filters = Vec::new();
            for p in &c.predicates {
                match nested.apply_sql(p, vec![element.clone()])? {
                    Some(sql) => filters.push(sql),
                    None => return Ok(None),
                }
            }
            let projected = match &c.selector {
                Some(s) => match nested.apply(s, vec![element.clone()])? {
                    Some(b) => b,
                    None => return Ok(None),
                },
                None => element,
            };
            let mut value = None;
            match (kind, lambda) {
                (AggregateKind::Count | AggregateKind::Any, None) => {}
                (AggregateKind::Count | AggregateKind::Any | AggregateKind::All, Some(p)) => {
                    let Some(test) = nested.apply_sql(p, vec![projected])? else {
                        return Ok(None);
                    };
                    filters.push(if kind == AggregateKind::All { f.not(test) } else { test });
                }
                (_, Some(selector)) => match nested.apply_sql(selector, vec![projected])? {
                    Some(v) => value = Some(v),
                    None => return Ok(None),
                },
                (_, None) => match projected {
                    Bound::Sql(v) => value = Some(v),
                    _ => return Ok(None),
                },
            }
            (filters, value)
        };
        for filter in filters {
            predicate = f.and(predicate, filter);
        }
        sub.predicate = Some(match sub.predicate.take() {
            Some(existing) => f.and(existing, predicate),
            None => predicate,
        });

        let result = match kind {
            AggregateKind::Any => f.exists(sub, false),
            AggregateKind::All => f.exists(sub, true),
            AggregateKind::Count => {
                let count = f.count();
                let mapping = count.type_mapping().cloned();
                sub.add_to_projection(count, "c");
                f.scalar_subquery(sub, ClrType::Int32, mapping)
            }
            _ => {
                let Some(value) = value else {
                    return Ok(None);
                };
                let agg = aggregate(f, kind, value);
                let (ty, mapping) = (agg.ty(), agg.type_mapping().cloned());
                sub.add_to_projection(agg, "c");
                f.scalar_subquery(sub, ty, mapping)
            }
        };
        Ok(Some(Bound::Sql(result)))
    }

    /// Aggregates over the elements of a grouping; filters become `CASE WHEN` inside the aggregate.
    fn group_call(&mut self, mut g: GroupRef, name: &str, args: &[Expr]) -> Result<Option<Bound>> {
        match (name, args) {
            ("Where", [Expr::Lambda(p)]) if g.selector.is_none() => {
                g.predicates.push((**p).clone());
                return Ok(Some(Bound::Group(g)));
            }
            ("Select", [Expr::Lambda(s)]) if g.selector.is_none() => {
                g.selector = Some((**s).clone());
                return Ok(Some(Bound::Group(g)));
            }
            _ => {}
        }
        let Some((kind, lambda)) = parse_aggregate(name, args) else {
            return Ok(None);
        };
        let f = self.cx.factory;
        let element = Bound::Shape(g.element.clone());
        let mut filter: Option<SqlExpression> = None;
        let add_filter = |filter: &mut Option<SqlExpression>, test: SqlExpression| {
            *filter = Some(match filter.take() {
                Some(existing) => f.and(existing, test),
                None => test,
            });
        };
        for p in &g.predicates {
            let Some(test) = self.apply_sql(p, vec![element.clone()])? else {
                return Ok(None);
            };
            add_filter(&mut filter, test);
        }
        let projected = match &g.selector {
            Some(s) => match self.apply(s, vec![element.clone()])? {
                Some(b) => b,
                None => return Ok(None),
            },
            None => element,
        };

        match kind {
            AggregateKind::Count | AggregateKind::Any | AggregateKind::All => {
                if let Some(p) = lambda {
                    let Some(test) = self.apply_sql(p, vec![projected])? else {
                        return Ok(None);
                    };
                    add_filter(&mut filter, if kind == AggregateKind::All { f.not(test) } else { test });
                }
                let count = match filter {
                    None => f.count(),
                    Some(test) => {
                        let one = f.constant(Value::Int(1), ClrType::Int32);
                        let counted = f.case(None, vec![CaseWhen { test, result: one }], None);
                        f.function("COUNT", vec![counted], ClrType::Int32, false)
                    }
                };
                let zero = f.constant(Value::Int(0), ClrType::Int32);
                Ok(Some(Bound::Sql(match kind {
                    AggregateKind::Count => count,
                    AggregateKind::Any => f.binary(SqlBinaryOperator::GreaterThan, count, zero),
                    _ => f.equal(count, zero),
                })))
            }
            _ => {
                let value = match (lambda, projected) {
                    (Some(selector), projected) => self.apply_sql(selector, vec![projected])?,
                    (None, Bound::Sql(v)) => Some(v),
                    (None, _) => None,
                };
                let Some(value) = value else {
                    return Ok(None);
                };
                let value = match filter {
                    Some(test) => f.case(None, vec![CaseWhen { test, result: value }], None),
                    None => value,
                };
                Ok(Some(Bound::Sql(aggregate(f, kind, value))))
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Option<Bound>> {
        let f = self.cx.factory;
        let equality = matches!(op, BinaryOp::Equal | BinaryOp::NotEqual);
        let (left, right) = if equality {
            (left.strip_object_convert(), right.strip_object_convert())
        } else {
            (left, right)
        };
        let l = self.visit(left)?;
        let r = self.visit(right)?;
        let (l, r) = match (l, r) {
            (Some(Bound::Sql(l)), Some(Bound::Sql(r))) => (l, r),
            (Some(l), Some(r)) if equality => return Ok(self.entity_comparison(op == BinaryOp::Equal, l, r)),
            _ => return Ok(None),
        };
        let sql = match op {
            BinaryOp::Add => f.binary(SqlBinaryOperator::Add, l, r),
            BinaryOp::Subtract => f.binary(SqlBinaryOperator::Subtract, l, r),
            BinaryOp::Multiply => f.binary(SqlBinaryOperator::Multiply, l, r),
            BinaryOp::Divide => f.binary(SqlBinaryOperator::Divide, l, r),
            BinaryOp::Modulo => f.binary(SqlBinaryOperator::Modulo, l, r),
            BinaryOp::And if is_bool(&l) && is_bool(&r) => f.and(l, r),
            BinaryOp::Or if is_bool(&l) && is_bool(&r) => f.or(l, r),
            BinaryOp::And => f.binary(SqlBinaryOperator::BitAnd, l, r),
            BinaryOp::Or => f.binary(SqlBinaryOperator::BitOr, l, r),
            BinaryOp::AndAlso => f.and(l, r),
            BinaryOp::OrElse => f.or(l, r),
            BinaryOp::Equal => f.equal(l, r),
            BinaryOp::NotEqual => f.not_equal(l, r),
            BinaryOp::LessThan => f.binary(SqlBinaryOperator::LessThan, l, r),
            BinaryOp::LessThanOrEqual => f.binary(SqlBinaryOperator::LessThanOrEqual, l, r),
            BinaryOp::GreaterThan => f.binary(SqlBinaryOperator::GreaterThan, l, r),
            BinaryOp::GreaterThanOrEqual => f.binary(SqlBinaryOperator::GreaterThanOrEqual, l, r),
            BinaryOp::Coalesce => f.coalesce(l, r),
        };
        Ok(Some(Bound::Sql(sql)))
    }

    /// Entity equality compares primary keys; comparing with `null` tests the first key column.
    fn entity_comparison(&self, equal: bool, l: Bound, r: Bound) -> Option<Bound> {
        let (model, f) = (self.cx.model, self.cx.factory);
        match (l, r) {
            (Bound::Entity(e), Bound::Sql(n)) | (Bound::Sql(n), Bound::Entity(e)) if n.is_null_constant() => {
                let key = key_columns(model, &e).into_iter().next()?;
                Some(Bound::Sql(if equal { f.is_null(key) } else { f.is_not_null(key) }))
            }
            (Bound::Entity(a), Bound::Entity(b)) => {
                let (ka, kb) = (key_columns(model, &a), key_columns(model, &b));
                if ka.is_empty() || ka.len() != kb.len() {
                    return None;
                }
                let eq = ka
                    .into_iter()
                    .zip(kb)
                    .map(|(x, y)| f.equal(x, y))
                    .reduce(|acc, e| f.and(acc, e))?;
                Some(Bound::Sql(if equal { eq } else { f.not(eq) }))
            }
            _ => None,
        }
    }

    fn convert(&mut self, operand: &Expr, ty: &ClrType) -> Result<Option<Bound>> {
        if matches!(ty.unwrap_nullable(), ClrType::Object) {
            return self.visit(operand);
        }
        let Some(bound) = self.visit(operand)? else {
            return Ok(None);
        };
        let Bound::Sql(sql) = bound else {
            return Ok(Some(bound));
        };
        let from = sql.ty();
        let (source, target) = (from.unwrap_nullable(), ty.unwrap_nullable());
        let enum_to_int = (source.as_enum().is_some() && target.is_integer())
            || (target.as_enum().is_some() && source.is_integer());
        if source == target || enum_to_int {
            return Ok(Some(Bound::Sql(sql)));
        }
        Ok(Some(Bound::Sql(self.cx.factory.convert(sql, target.clone()))))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::from_json;
    use crate::options::Dialect;
    use crate::query::{lambda, var};
    use crate::sql::QuerySqlGeneratorFactory;
    use crate::storage::RelationalTypeMappingSource;
    use std::sync::Arc;

    pub(crate) const BLOGGING: &str = r#"{
        "entities": [
            { "name": "Blog", "table": "Blogs", "primary_key": "Id",
              "properties": [
                { "name": "Id", "type": "int" },
                { "name": "Name", "type": "string" },
                { "name": "Rating", "type": "int?" }
              ] },
            { "name": "Post", "table": "Posts", "primary_key": "Id",
              "properties": [
                { "name": "Id", "type": "int" },
                { "name": "Title", "type": "string" },
                { "name": "Score", "type": "int" },
                { "name": "BlogId", "type": "int" }
              ] }
        ],
        "relationships": [
            { "dependent": "Post", "properties": "BlogId", "principal": "Blog",
              "navigation": "Blog", "inverse": "Posts", "required": true }
        ]
    }"#;

    struct Fixture {
        model: Model,
        factory: SqlExpressionFactory,
        registry: TranslatorRegistry,
        options: QueryOptions,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                model: from_json(BLOGGING).unwrap(),
                factory: SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(Dialect::Sqlite)), false),
                registry: TranslatorRegistry::new(Dialect::Sqlite),
                options: QueryOptions::default(),
            }
        }

        fn cx(&self) -> CompileContext<'_> {
            CompileContext {
                model: &self.model,
                factory: &self.factory,
                registry: &self.registry,
                options: &self.options,
            }
        }

        fn entity(&self, name: &str, alias: &str) -> EntityProjection {
            let id = self.model.find_entity_type(name).unwrap();
            entity_projection(&self.model, self.factory.type_mappings(), id, alias, false)
        }
    }

    fn render(expr: SqlExpression) -> String {
        let mut select = SelectExpression::default();
        select.add_to_projection(expr, "v");
        QuerySqlGeneratorFactory::new(Dialect::Sqlite)
            .create()
            .generate(&select)
            .unwrap()
            .sql
    }

    #[test]
    fn member_access_maps_to_column() {
        let fx = Fixture::new();
        let mut aliases = AliasGenerator::default();
        let mut select = SelectExpression::from_table("Blogs", None, aliases.next("Blog"));
        let blog = fx.entity("Blog", "b");
        let mut visitor = Visitor::new(fx.cx(), &mut aliases, &mut select);
        let predicate = lambda(&["b"], var("b").member("Name").eq(Expr::string("x")));
        let sql = visitor.apply_sql(&predicate, vec![Bound::Entity(blog)]).unwrap().unwrap();
        assert!(matches!(sql, SqlExpression::Binary { .. }));
    }

    #[test]
    fn reference_navigation_joins_once() {
        let fx = Fixture::new();
        let mut aliases = AliasGenerator::default();
        let alias = aliases.next("Post");
        let mut select = SelectExpression::from_table("Posts", None, alias.clone());
        let post = fx.entity("Post", &alias);
        let mut visitor = Visitor::new(fx.cx(), &mut aliases, &mut select);
        let name = lambda(&["p"], var("p").member("Blog").member("Name"));
        visitor.apply_sql(&name, vec![Bound::Entity(post.clone())]).unwrap().unwrap();
        visitor.apply_sql(&name, vec![Bound::Entity(post)]).unwrap().unwrap();
        assert_eq!(select.tables.len(), 2);
        assert!(matches!(select.tables[1].join, Some((crate::sql::JoinKind::Inner, Some(_)))));
    }

    #[test]
    fn collection_count_becomes_correlated_subquery() {
        let fx = Fixture::new();
        let mut aliases = AliasGenerator::default();
        let alias = aliases.next("Blog");
        let mut select = SelectExpression::from_table("Blogs", None, alias.clone());
        let blog = fx.entity("Blog", &alias);
        let mut visitor = Visitor::new(fx.cx(), &mut aliases, &mut select);
        let count = lambda(
            &["b"],
            var("b")
                .member("Posts")
                .seq("Count", vec![Expr::Lambda(Box::new(lambda(&["p"], var("p").member("Score").gt(Expr::int(3)))))]),
        );
        let sql = visitor.apply_sql(&count, vec![Bound::Entity(blog)]).unwrap().unwrap();
        let text = render(sql);
        assert!(text.contains("SELECT COUNT(*)"), "{}", text);
        assert!(text.contains("\"b\".\"Id\" = \"p\".\"BlogId\""), "{}", text);
    }

    #[test]
    fn untranslatable_method_declines() {
        let fx = Fixture::new();
        let mut aliases = AliasGenerator::default();
        let mut select = SelectExpression::from_table("Blogs", None, aliases.next("Blog"));
        let blog = fx.entity("Blog", "b");
        let mut visitor = Visitor::new(fx.cx(), &mut aliases, &mut select);
        let custom = lambda(
            &["b"],
            var("b")
                .member("Name")
                .call(DeclaringType::Custom("Slug".into()), "Make", vec![]),
        );
        assert!(visitor.apply_sql(&custom, vec![Bound::Entity(blog)]).unwrap().is_none());
    }

    #[test]
    fn array_contains_becomes_in() {
        let fx = Fixture::new();
        let mut aliases = AliasGenerator::default();
        let mut select = SelectExpression::from_table("Blogs", None, aliases.next("Blog"));
        let blog = fx.entity("Blog", "b");
        let mut visitor = Visitor::new(fx.cx(), &mut aliases, &mut select);
        let array = Expr::NewArray {
            element: ClrType::Int32,
            elements: vec![Expr::int(1), Expr::int(2)],
        };
        let contains = lambda(&["b"], array.seq("Contains", vec![var("b").member("Id")]));
        let sql = visitor.apply_sql(&contains, vec![Bound::Entity(blog)]).unwrap().unwrap();
        assert!(matches!(sql, SqlExpression::In { negated: false, .. }));
    }
}
