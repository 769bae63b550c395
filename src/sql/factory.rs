//! Central construction rules for SQL expressions: type-mapping inference, numeric unification,
//! null semantics for equality and constant folding of logical operators.

use super::expression::{CaseWhen, InValues, SqlBinaryOperator, SqlExpression, SqlUnaryOperator};
use super::select::SelectExpression;
use crate::options::Dialect;
use crate::storage::{TypeMapping, TypeMappingSource};
use crate::value::{ClrType, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct SqlExpressionFactory {
    mappings: Arc<dyn TypeMappingSource>,
    relational_nulls: bool,
}

impl SqlExpressionFactory {
    pub fn new(mappings: Arc<dyn TypeMappingSource>, relational_nulls: bool) -> Self {
        SqlExpressionFactory {
            mappings,
            relational_nulls,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.mappings.dialect()
    }

    pub fn type_mappings(&self) -> &dyn TypeMappingSource {
        self.mappings.as_ref()
    }

    pub fn find_mapping(&self, ty: &ClrType) -> Option<TypeMapping> {
        self.mappings.find_mapping(ty.unwrap_nullable(), None)
    }

    fn bool_mapping(&self) -> Option<TypeMapping> {
        self.find_mapping(&ClrType::Bool)
    }

    /// Attaches `mapping` (or the default mapping of the node's type) to a node that has none yet.
    /// Nodes that already carry a mapping are returned unchanged.
    pub fn apply_type_mapping(&self, expr: SqlExpression, mapping: Option<&TypeMapping>) -> SqlExpression {
        if expr.type_mapping().is_some() {
            return expr;
        }
        let expr_ty = expr.ty();
        let resolved = || mapping.cloned().or_else(|| self.find_mapping(&expr_ty));
        match expr {
            SqlExpression::Constant { ref ty, .. } | SqlExpression::Parameter { ref ty, .. }
                if matches!(ty.unwrap_nullable(), ClrType::Object) =>
            {
                expr
            }
            SqlExpression::Constant { .. } | SqlExpression::Parameter { .. } | SqlExpression::Function { .. } => {
                let m = resolved();
                with_mapping(expr, m)
            }
            SqlExpression::Binary {
                op,
                left,
                right,
                ty,
                mapping: None,
            } if op.is_arithmetic() || op.is_bitwise() => {
                let m = mapping.cloned().or_else(|| {
                    left.type_mapping()
                        .or(right.type_mapping())
                        .cloned()
                        .or_else(|| self.find_mapping(&ty))
                });
                SqlExpression::Binary {
                    op,
                    left: Box::new(self.apply_type_mapping(*left, m.as_ref())),
                    right: Box::new(self.apply_type_mapping(*right, m.as_ref())),
                    ty,
                    mapping: m,
                }
            }
            SqlExpression::Binary {
                op,
                left,
                right,
                ty,
                mapping: None,
            } => SqlExpression::Binary {
                op,
                left,
                right,
                ty,
                mapping: self.bool_mapping(),
            },
            SqlExpression::Unary {
                op: SqlUnaryOperator::Negate,
                operand,
                ty,
                mapping: None,
            } => {
                let operand = self.apply_type_mapping(*operand, mapping);
                let m = operand.type_mapping().cloned();
                SqlExpression::Unary {
                    op: SqlUnaryOperator::Negate,
                    operand: Box::new(operand),
                    ty,
                    mapping: m,
                }
            }
            SqlExpression::Case {
                operand,
                whens,
                else_result,
                ty,
                mapping: None,
            } => {
                let m = resolved();
                SqlExpression::Case {
                    operand,
                    whens: whens
                        .into_iter()
                        .map(|w| CaseWhen {
                            test: w.test,
                            result: self.apply_type_mapping(w.result, m.as_ref()),
                        })
                        .collect(),
                    else_result: else_result.map(|e| Box::new(self.apply_type_mapping(*e, m.as_ref()))),
                    ty,
                    mapping: m,
                }
            }
            other => other,
        }
    }

    pub fn apply_default_type_mapping(&self, expr: SqlExpression) -> SqlExpression {
        self.apply_type_mapping(expr, None)
    }

    /// Brings two operands to a common type: the numerically narrower side is converted to the
    /// wider type, then the mapping of whichever side has one is propagated to the other.
    pub fn unify(&self, left: SqlExpression, right: SqlExpression) -> (SqlExpression, SqlExpression) {
        let (lt, rt) = (left.ty(), right.ty());
        let (left, right) = match (lt.numeric_rank(), rt.numeric_rank()) {
            (Some(a), Some(b)) if a != b && lt.as_enum().is_none() && rt.as_enum().is_none() => {
                if a < b {
                    let wide = right.type_mapping().cloned().or_else(|| self.find_mapping(&rt));
                    (self.implicit_convert(left, rt.unwrap_nullable(), wide), right)
                } else {
                    let wide = left.type_mapping().cloned().or_else(|| self.find_mapping(&lt));
                    let converted = self.implicit_convert(right, lt.unwrap_nullable(), wide);
                    (left, converted)
                }
            }
            _ => (left, right),
        };
        let inferred = left
            .type_mapping()
            .or(right.type_mapping())
            .cloned()
            .or_else(|| self.find_mapping(&left.ty()));
        (
            self.apply_type_mapping(left, inferred.as_ref()),
            self.apply_type_mapping(right, inferred.as_ref()),
        )
    }

    /// Retypes `expr` to `target`. Constants and parameters are retyped in place; other nodes are
    /// wrapped in a CAST unless both sides already share a store type.
    fn implicit_convert(&self, expr: SqlExpression, target: &ClrType, mapping: Option<TypeMapping>) -> SqlExpression {
        let nullable = expr.ty().is_nullable_wrapper();
        let ty = if nullable {
            target.clone().make_nullable()
        } else {
            target.clone()
        };
        match expr {
            SqlExpression::Constant { value, .. } => {
                let value = value.clone().coerce_to(&ty).unwrap_or(value);
                SqlExpression::Constant { value, ty, mapping }
            }
            SqlExpression::Parameter { name, .. } => SqlExpression::Parameter { name, ty, mapping },
            other => {
                let same_store = match (other.type_mapping(), mapping.as_ref()) {
                    (Some(a), Some(b)) => a.store_type.eq_ignore_ascii_case(&b.store_type),
                    _ => false,
                };
                if same_store {
                    other
                } else {
                    SqlExpression::Unary {
                        op: SqlUnaryOperator::Convert,
                        operand: Box::new(other),
                        ty,
                        mapping,
                    }
                }
            }
        }
    }

    pub fn constant(&self, value: Value, ty: ClrType) -> SqlExpression {
        SqlExpression::Constant {
            value,
            ty,
            mapping: None,
        }
    }

    pub fn bool_constant(&self, value: bool) -> SqlExpression {
        SqlExpression::Constant {
            value: Value::Bool(value),
            ty: ClrType::Bool,
            mapping: self.bool_mapping(),
        }
    }

    pub fn parameter(&self, name: &str, ty: ClrType) -> SqlExpression {
        SqlExpression::Parameter {
            name: name.to_string(),
            ty,
            mapping: None,
        }
    }

    pub fn fragment(&self, sql: &str) -> SqlExpression {
        SqlExpression::Fragment(sql.to_string())
    }

    /// Builds any binary node; comparisons go through the null-semantics rules of [`Self::equal`].
    pub fn binary(&self, op: SqlBinaryOperator, left: SqlExpression, right: SqlExpression) -> SqlExpression {
        match op {
            SqlBinaryOperator::And => self.and(left, right),
            SqlBinaryOperator::Or => self.or(left, right),
            SqlBinaryOperator::Equal | SqlBinaryOperator::NotEqual => self.compare_nullable(op, left, right),
            _ if op.is_comparison() => {
                let (l, r) = self.unify(left, right);
                self.make_binary(op, l, r, ClrType::Bool, self.bool_mapping())
            }
            SqlBinaryOperator::Add if is_string(&left) || is_string(&right) => {
                let left = self.concat_operand(left);
                let right = self.concat_operand(right);
                let (l, r) = self.unify(left, right);
                let m = l.type_mapping().cloned();
                self.make_binary(op, l, r, ClrType::String, m)
            }
            _ => {
                let (l, r) = self.unify(left, right);
                let nullable = l.ty().is_nullable_wrapper() || r.ty().is_nullable_wrapper();
                let base = l.ty().unwrap_nullable().clone();
                let ty = if nullable { base.make_nullable() } else { base };
                let m = l.type_mapping().or(r.type_mapping()).cloned();
                self.make_binary(op, l, r, ty, m)
            }
        }
    }

    /// String concatenation treats null as the empty string.
    fn concat_operand(&self, expr: SqlExpression) -> SqlExpression {
        let expr = if is_string(&expr) {
            expr
        } else {
            self.convert(expr, ClrType::String)
        };
        if expr.is_nullable() {
            self.coalesce(expr, self.constant(Value::Text(String::new()), ClrType::String))
        } else {
            expr
        }
    }

    fn make_binary(
        &self,
        op: SqlBinaryOperator,
        left: SqlExpression,
        right: SqlExpression,
        ty: ClrType,
        mapping: Option<TypeMapping>,
    ) -> SqlExpression {
        SqlExpression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            ty,
            mapping,
        }
    }

    pub fn equal(&self, left: SqlExpression, right: SqlExpression) -> SqlExpression {
        self.compare_nullable(SqlBinaryOperator::Equal, left, right)
    }

    pub fn not_equal(&self, left: SqlExpression, right: SqlExpression) -> SqlExpression {
        self.compare_nullable(SqlBinaryOperator::NotEqual, left, right)
    }

    /// `==`/`!=` with two-valued semantics: null equals null, and null differs from any value.
    /// The expansion only depends on which operands are nullable, so it is the same for `a == b`
    /// and `b == a`.
    fn compare_nullable(&self, op: SqlBinaryOperator, left: SqlExpression, right: SqlExpression) -> SqlExpression {
        let equal = op == SqlBinaryOperator::Equal;
        if right.is_null_constant() {
            return if equal { self.is_null(left) } else { self.is_not_null(left) };
        }
        if left.is_null_constant() {
            return if equal { self.is_null(right) } else { self.is_not_null(right) };
        }
        let (l, r) = self.unify(left, right);
        let plain = self.make_binary(op, l.clone(), r.clone(), ClrType::Bool, self.bool_mapping());
        if self.relational_nulls {
            return plain;
        }
        match (l.is_nullable(), r.is_nullable()) {
            (false, false) => plain,
            (true, true) if equal => {
                let both_null = self.and(self.is_null(l), self.is_null(r));
                self.or(plain, both_null)
            }
            (true, true) => {
                let either_null = self.or(self.is_null(l.clone()), self.is_null(r.clone()));
                let not_both_null = self.or(self.is_not_null(l), self.is_not_null(r));
                self.and(self.or(plain, either_null), not_both_null)
            }
            (true, false) if !equal => self.or(plain, self.is_null(l)),
            (false, true) if !equal => self.or(plain, self.is_null(r)),
            _ => plain,
        }
    }

    /// `a.Equals(b)`: folds to `false` when the operand types differ after unwrapping nullability.
    pub fn equals_method(&self, left: SqlExpression, right: SqlExpression) -> SqlExpression {
        if left.ty().unwrap_nullable() != right.ty().unwrap_nullable() && !is_null_typed(&left) && !is_null_typed(&right)
        {
            return self.bool_constant(false);
        }
        self.equal(left, right)
    }

    pub fn and(&self, left: SqlExpression, right: SqlExpression) -> SqlExpression {
        match (left.as_bool_constant(), right.as_bool_constant()) {
            (Some(false), _) | (_, Some(false)) => self.bool_constant(false),
            (Some(true), _) => right,
            (_, Some(true)) => left,
            _ => self.make_binary(SqlBinaryOperator::And, left, right, ClrType::Bool, self.bool_mapping()),
        }
    }

    pub fn or(&self, left: SqlExpression, right: SqlExpression) -> SqlExpression {
        match (left.as_bool_constant(), right.as_bool_constant()) {
            (Some(true), _) | (_, Some(true)) => self.bool_constant(true),
            (Some(false), _) => right,
            (_, Some(false)) => left,
            _ => self.make_binary(SqlBinaryOperator::Or, left, right, ClrType::Bool, self.bool_mapping()),
        }
    }

    /// Logical negation. Unless relational nulls are requested, the result is true exactly when
    /// `expr` is not: comparisons, `IN` and `LIKE` over nullable operands gain `IS NULL` arms, and
    /// negations are pushed through `AND`/`OR` so each comparison is guarded on its own.
    pub fn not(&self, expr: SqlExpression) -> SqlExpression {
        if let Some(b) = expr.as_bool_constant() {
            return self.bool_constant(!b);
        }
        match expr {
            SqlExpression::Unary {
                op: SqlUnaryOperator::Not,
                operand,
                ..
            } => *operand,
            SqlExpression::Unary {
                op: SqlUnaryOperator::IsNull,
                operand,
                ..
            } => self.is_not_null(*operand),
            SqlExpression::Unary {
                op: SqlUnaryOperator::IsNotNull,
                operand,
                ..
            } => self.is_null(*operand),
            SqlExpression::Exists { subquery, negated } => SqlExpression::Exists {
                subquery,
                negated: !negated,
            },
            SqlExpression::Binary {
                op: SqlBinaryOperator::Or,
                left,
                right,
                ..
            } if !self.relational_nulls => {
                let guarded = {
                    let guards = self.nullable_operands(&left);
                    null_checked_operands(&right).is_some_and(|checked| {
                        !guards.is_empty() && guards.len() == checked.len() && guards.iter().all(|g| checked.contains(g))
                    })
                };
                if guarded {
                    self.raw_negation(*left)
                } else {
                    self.and(self.not(*left), self.not(*right))
                }
            }
            SqlExpression::Binary {
                op: SqlBinaryOperator::And,
                left,
                right,
                ..
            } if !self.relational_nulls => self.or(self.not(*left), self.not(*right)),
            other => {
                let guards = if self.relational_nulls {
                    Vec::new()
                } else {
                    self.nullable_operands(&other).into_iter().cloned().collect()
                };
                let negated = self.raw_negation(other);
                match guards.into_iter().map(|g| self.is_null(g)).reduce(|a, b| self.or(a, b)) {
                    Some(any_null) => self.or(negated, any_null),
                    None => negated,
                }
            }
        }
    }

    /// Operands of a comparison, `IN` or `LIKE` whose null makes the predicate unknown.
    fn nullable_operands<'e>(&self, expr: &'e SqlExpression) -> Vec<&'e SqlExpression> {
        let operands: Vec<&SqlExpression> = match expr {
            SqlExpression::Binary { op, left, right, .. } if op.is_comparison() => vec![left.as_ref(), right.as_ref()],
            SqlExpression::In { item, .. } => vec![item.as_ref()],
            SqlExpression::Like { item, pattern, .. } => vec![item.as_ref(), pattern.as_ref()],
            _ => Vec::new(),
        };
        operands.into_iter().filter(|e| e.is_nullable()).collect()
    }

    /// The negation of a single predicate under three-valued logic.
    fn raw_negation(&self, expr: SqlExpression) -> SqlExpression {
        match expr {
            SqlExpression::In { item, values, negated } => SqlExpression::In {
                item,
                values,
                negated: !negated,
            },
            SqlExpression::Binary {
                op,
                left,
                right,
                ty,
                mapping,
            } if op.is_comparison() => match op.negated() {
                Some(negated) => SqlExpression::Binary {
                    op: negated,
                    left,
                    right,
                    ty,
                    mapping,
                },
                None => self.wrap_not(SqlExpression::Binary {
                    op,
                    left,
                    right,
                    ty,
                    mapping,
                }),
            },
            other => self.wrap_not(other),
        }
    }

    fn wrap_not(&self, expr: SqlExpression) -> SqlExpression {
        SqlExpression::Unary {
            op: SqlUnaryOperator::Not,
            operand: Box::new(expr),
            ty: ClrType::Bool,
            mapping: self.bool_mapping(),
        }
    }

    pub fn is_null(&self, expr: SqlExpression) -> SqlExpression {
        match &expr {
            SqlExpression::Constant { value, .. } => self.bool_constant(value.is_null()),
            SqlExpression::Column { nullable: false, .. } => self.bool_constant(false),
            _ => SqlExpression::Unary {
                op: SqlUnaryOperator::IsNull,
                operand: Box::new(expr),
                ty: ClrType::Bool,
                mapping: self.bool_mapping(),
            },
        }
    }

    pub fn is_not_null(&self, expr: SqlExpression) -> SqlExpression {
        match &expr {
            SqlExpression::Constant { value, .. } => self.bool_constant(!value.is_null()),
            SqlExpression::Column { nullable: false, .. } => self.bool_constant(true),
            _ => SqlExpression::Unary {
                op: SqlUnaryOperator::IsNotNull,
                operand: Box::new(expr),
                ty: ClrType::Bool,
                mapping: self.bool_mapping(),
            },
        }
    }

    pub fn negate(&self, expr: SqlExpression) -> SqlExpression {
        let ty = expr.ty();
        let mapping = expr.type_mapping().cloned();
        SqlExpression::Unary {
            op: SqlUnaryOperator::Negate,
            operand: Box::new(expr),
            ty,
            mapping,
        }
    }

    /// Explicit `CAST` to the default mapping of `ty`; a no-op when the type already matches.
    pub fn convert(&self, expr: SqlExpression, ty: ClrType) -> SqlExpression {
        if expr.ty() == ty {
            return expr;
        }
        let mapping = self.find_mapping(&ty);
        let nullable = expr.ty().is_nullable_wrapper();
        let ty = if nullable { ty.make_nullable() } else { ty };
        let operand = self.apply_default_type_mapping(expr);
        SqlExpression::Unary {
            op: SqlUnaryOperator::Convert,
            operand: Box::new(operand),
            ty,
            mapping,
        }
    }

    pub fn function(&self, name: &str, args: Vec<SqlExpression>, ty: ClrType, nullable: bool) -> SqlExpression {
        let mapping = self.find_mapping(&ty);
        self.function_with_mapping(name, args, ty, nullable, mapping)
    }

    pub fn function_with_mapping(
        &self,
        name: &str,
        args: Vec<SqlExpression>,
        ty: ClrType,
        nullable: bool,
        mapping: Option<TypeMapping>,
    ) -> SqlExpression {
        let args = args.into_iter().map(|a| self.apply_default_type_mapping(a)).collect();
        SqlExpression::Function {
            name: name.to_string(),
            args,
            niladic: false,
            nullable,
            ty,
            mapping,
        }
    }

    pub fn niladic(&self, name: &str, ty: ClrType) -> SqlExpression {
        let mapping = self.find_mapping(&ty);
        SqlExpression::Function {
            name: name.to_string(),
            args: Vec::new(),
            niladic: true,
            nullable: false,
            ty,
            mapping,
        }
    }

    /// `COALESCE(left, right)`, typed like `right` when `right` cannot be null.
    pub fn coalesce(&self, left: SqlExpression, right: SqlExpression) -> SqlExpression {
        let (l, r) = self.unify(left, right);
        let nullable = r.is_nullable();
        let base = l.ty().unwrap_nullable().clone();
        let ty = if nullable { base.make_nullable() } else { base };
        let mapping = l.type_mapping().or(r.type_mapping()).cloned();
        SqlExpression::Function {
            name: "COALESCE".into(),
            args: vec![l, r],
            niladic: false,
            nullable,
            ty,
            mapping,
        }
    }

    pub fn count(&self) -> SqlExpression {
        self.function("COUNT", vec![SqlExpression::Fragment("*".into())], ClrType::Int32, false)
    }

    pub fn case(
        &self,
        operand: Option<SqlExpression>,
        whens: Vec<CaseWhen>,
        else_result: Option<SqlExpression>,
    ) -> SqlExpression {
        let mut results = whens.iter().map(|w| &w.result).chain(else_result.iter());
        let mapping = results.clone().find_map(|r| r.type_mapping().cloned());
        let first_ty = results
            .find(|r| !r.is_null_constant())
            .map(SqlExpression::ty)
            .unwrap_or(ClrType::Object);
        let nullable = else_result.is_none() || whens.iter().map(|w| &w.result).chain(else_result.iter()).any(|r| r.is_nullable());
        let ty = if nullable { first_ty.make_nullable() } else { first_ty };
        let mapping = mapping.or_else(|| self.find_mapping(&ty));
        SqlExpression::Case {
            operand: operand.map(Box::new),
            whens: whens
                .into_iter()
                .map(|w| CaseWhen {
                    test: w.test,
                    result: self.apply_type_mapping(w.result, mapping.as_ref()),
                })
                .collect(),
            else_result: else_result.map(|e| Box::new(self.apply_type_mapping(e, mapping.as_ref()))),
            ty,
            mapping,
        }
    }

    pub fn like(&self, item: SqlExpression, pattern: SqlExpression, escape: Option<SqlExpression>) -> SqlExpression {
        let (item, pattern) = self.unify(item, pattern);
        SqlExpression::Like {
            item: Box::new(item),
            pattern: Box::new(pattern),
            escape: escape.map(|e| Box::new(self.apply_default_type_mapping(e))),
        }
    }

    pub fn in_list(&self, item: SqlExpression, values: Vec<SqlExpression>, negated: bool) -> SqlExpression {
        if values.is_empty() {
            return self.bool_constant(negated);
        }
        let item = self.apply_default_type_mapping(item);
        let mapping = item.type_mapping().cloned();
        let values = values
            .into_iter()
            .map(|v| self.apply_type_mapping(v, mapping.as_ref()))
            .collect();
        SqlExpression::In {
            item: Box::new(item),
            values: InValues::List(values),
            negated,
        }
    }

    pub fn exists(&self, subquery: SelectExpression, negated: bool) -> SqlExpression {
        SqlExpression::Exists {
            subquery: Box::new(subquery),
            negated,
        }
    }

    pub fn scalar_subquery(&self, subquery: SelectExpression, ty: ClrType, mapping: Option<TypeMapping>) -> SqlExpression {
        SqlExpression::ScalarSubquery {
            subquery: Box::new(subquery),
            ty,
            mapping,
        }
    }
}

fn with_mapping(expr: SqlExpression, m: Option<TypeMapping>) -> SqlExpression {
    match expr {
        SqlExpression::Constant { value, ty, .. } => SqlExpression::Constant { value, ty, mapping: m },
        SqlExpression::Parameter { name, ty, .. } => SqlExpression::Parameter { name, ty, mapping: m },
        SqlExpression::Function {
            name,
            args,
            niladic,
            nullable,
            ty,
            ..
        } => SqlExpression::Function {
            name,
            args,
            niladic,
            nullable,
            ty,
            mapping: m,
        },
        other => other,
    }
}

/// The operands of an `OR` chain made only of `IS NULL` tests.
fn null_checked_operands(expr: &SqlExpression) -> Option<Vec<&SqlExpression>> {
    match expr {
        SqlExpression::Unary {
            op: SqlUnaryOperator::IsNull,
            operand,
            ..
        } => Some(vec![operand.as_ref()]),
        SqlExpression::Binary {
            op: SqlBinaryOperator::Or,
            left,
            right,
            ..
        } => {
            let mut checked = null_checked_operands(left)?;
            checked.extend(null_checked_operands(right)?);
            Some(checked)
        }
        _ => None,
    }
}

fn is_string(expr: &SqlExpression) -> bool {
    matches!(expr.ty().unwrap_nullable(), ClrType::String)
}

/// A bare `null` literal typed as `object` compares equal to anything nullable.
fn is_null_typed(expr: &SqlExpression) -> bool {
    expr.is_null_constant() && matches!(expr.ty(), ClrType::Object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RelationalTypeMappingSource;

    fn factory(relational_nulls: bool) -> SqlExpressionFactory {
        SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(Dialect::Sqlite)), relational_nulls)
    }

    fn column(name: &str, ty: ClrType, nullable: bool) -> SqlExpression {
        SqlExpression::Column {
            name: name.into(),
            table: "b".into(),
            ty,
            mapping: RelationalTypeMappingSource::new(Dialect::Sqlite).find_mapping(&ClrType::Int32, None),
            nullable,
        }
    }

    #[test]
    fn constant_adopts_column_mapping() {
        let f = factory(false);
        let col = column("Rating", ClrType::Int32, false);
        let cmp = f.binary(SqlBinaryOperator::GreaterThan, col.clone(), f.constant(Value::Int(3), ClrType::Int32));
        let SqlExpression::Binary { right, .. } = cmp else {
            panic!("expected a comparison");
        };
        assert_eq!(right.type_mapping(), col.type_mapping());
    }

    #[test]
    fn narrower_numeric_operand_is_widened() {
        let f = factory(false);
        let int = column("Rating", ClrType::Int32, false);
        let real = SqlExpression::Column {
            name: "Score".into(),
            table: "b".into(),
            ty: ClrType::Float64,
            mapping: f.find_mapping(&ClrType::Float64),
            nullable: false,
        };
        let sum = f.binary(SqlBinaryOperator::Add, int, real);
        let SqlExpression::Binary { left, ty, .. } = sum else {
            panic!("expected an addition");
        };
        assert_eq!(ty, ClrType::Float64);
        assert!(matches!(
            *left,
            SqlExpression::Unary {
                op: SqlUnaryOperator::Convert,
                ..
            }
        ));
    }

    #[test]
    fn equality_of_two_nullable_operands_is_null_safe() {
        let f = factory(false);
        let a = column("A", ClrType::Int32.make_nullable(), true);
        let b = column("B", ClrType::Int32.make_nullable(), true);
        let eq = f.equal(a.clone(), b.clone());
        assert!(matches!(eq, SqlExpression::Binary { op: SqlBinaryOperator::Or, .. }));

        let relational = factory(true).equal(a, b);
        assert!(matches!(relational, SqlExpression::Binary { op: SqlBinaryOperator::Equal, .. }));
    }

    #[test]
    fn comparison_with_null_literal_becomes_is_null() {
        let f = factory(false);
        let a = column("A", ClrType::Int32.make_nullable(), true);
        let eq = f.equal(a, f.constant(Value::Null, ClrType::Object));
        assert!(matches!(eq, SqlExpression::Unary { op: SqlUnaryOperator::IsNull, .. }));
    }

    #[test]
    fn equals_across_types_folds_to_false() {
        let f = factory(false);
        let a = column("A", ClrType::Int32, false);
        let s = f.constant(Value::from("x"), ClrType::String);
        assert_eq!(f.equals_method(a, s).as_bool_constant(), Some(false));
    }

    #[test]
    fn logical_operators_fold_constants() {
        let f = factory(false);
        let p = f.is_null(column("A", ClrType::Int32.make_nullable(), true));
        assert_eq!(f.and(f.bool_constant(true), p.clone()), p);
        assert_eq!(f.or(p.clone(), f.bool_constant(true)).as_bool_constant(), Some(true));
        assert_eq!(f.not(f.not(p.clone())), p);
    }

    #[test]
    fn not_flips_comparisons_of_non_nullable_operands() {
        let f = factory(false);
        let lt = f.binary(
            SqlBinaryOperator::LessThan,
            column("A", ClrType::Int32, false),
            f.constant(Value::Int(1), ClrType::Int32),
        );
        assert!(matches!(
            f.not(lt),
            SqlExpression::Binary {
                op: SqlBinaryOperator::GreaterThanOrEqual,
                ..
            }
        ));
    }

    #[test]
    fn negated_nullable_equality_matches_inequality() {
        let f = factory(false);
        let rating = column("Rating", ClrType::Int32.make_nullable(), true);
        let three = || f.constant(Value::Int(3), ClrType::Int32);
        let negated = f.not(f.equal(rating.clone(), three()));
        assert_eq!(negated, f.not_equal(rating.clone(), three()));
        assert_eq!(f.not(negated), f.equal(rating, three()));
    }

    #[test]
    fn negated_nullable_ordering_keeps_null_rows() {
        let f = factory(false);
        let rating = column("Rating", ClrType::Int32.make_nullable(), true);
        let gt = f.binary(SqlBinaryOperator::GreaterThan, rating.clone(), f.constant(Value::Int(3), ClrType::Int32));
        let SqlExpression::Binary {
            op: SqlBinaryOperator::Or,
            left,
            right,
            ..
        } = f.not(gt.clone())
        else {
            panic!("expected a null-guarded disjunction");
        };
        assert!(matches!(
            *left,
            SqlExpression::Binary {
                op: SqlBinaryOperator::LessThanOrEqual,
                ..
            }
        ));
        assert_eq!(*right, f.is_null(rating));
        assert_eq!(f.not(f.not(gt.clone())), gt);

        let relational = factory(true);
        assert!(matches!(relational.not(gt), SqlExpression::Binary { op: SqlBinaryOperator::LessThanOrEqual, .. }));
    }

    #[test]
    fn negation_of_two_nullable_operands_flips_the_expansion() {
        let f = factory(false);
        let a = column("A", ClrType::Int32.make_nullable(), true);
        let b = column("B", ClrType::Int32.make_nullable(), true);
        assert_eq!(f.not(f.equal(a.clone(), b.clone())), f.not_equal(a.clone(), b.clone()));
        assert_eq!(f.not(f.not_equal(a.clone(), b.clone())), f.equal(a, b));
    }

    #[test]
    fn negation_is_pushed_through_conjunctions() {
        let f = factory(false);
        let a = column("A", ClrType::Int32.make_nullable(), true);
        let b = column("B", ClrType::Int32, false);
        let one = || f.constant(Value::Int(1), ClrType::Int32);
        let both = f.and(
            f.binary(SqlBinaryOperator::LessThan, a.clone(), one()),
            f.binary(SqlBinaryOperator::LessThan, b.clone(), one()),
        );
        let expected = f.or(
            f.or(
                f.binary(SqlBinaryOperator::GreaterThanOrEqual, a.clone(), one()),
                f.is_null(a),
            ),
            f.binary(SqlBinaryOperator::GreaterThanOrEqual, b, one()),
        );
        assert_eq!(f.not(both), expected);
    }
}
