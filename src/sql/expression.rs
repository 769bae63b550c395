//! The relational SQL expression tree. Nodes are immutable values; every scalar node carries its
//! CLR type and (once inferred) its type mapping.

use super::select::SelectExpression;
use crate::storage::TypeMapping;
use crate::value::{ClrType, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SqlBinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    BitAnd,
    BitOr,
    And,
    Or,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl SqlBinaryOperator {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            SqlBinaryOperator::Equal
                | SqlBinaryOperator::NotEqual
                | SqlBinaryOperator::LessThan
                | SqlBinaryOperator::LessThanOrEqual
                | SqlBinaryOperator::GreaterThan
                | SqlBinaryOperator::GreaterThanOrEqual
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, SqlBinaryOperator::And | SqlBinaryOperator::Or)
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            SqlBinaryOperator::Add
                | SqlBinaryOperator::Subtract
                | SqlBinaryOperator::Multiply
                | SqlBinaryOperator::Divide
                | SqlBinaryOperator::Modulo
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(self, SqlBinaryOperator::BitAnd | SqlBinaryOperator::BitOr)
    }

    /// The comparison that holds exactly when `self` does not (for non-null operands).
    pub fn negated(self) -> Option<SqlBinaryOperator> {
        use SqlBinaryOperator::*;
        Some(match self {
            Equal => NotEqual,
            NotEqual => Equal,
            LessThan => GreaterThanOrEqual,
            LessThanOrEqual => GreaterThan,
            GreaterThan => LessThanOrEqual,
            GreaterThanOrEqual => LessThan,
            _ => return None,
        })
    }

    /// The comparison with its operands swapped (`a < b` is `b > a`).
    pub fn mirrored(self) -> SqlBinaryOperator {
        use SqlBinaryOperator::*;
        match self {
            LessThan => GreaterThan,
            LessThanOrEqual => GreaterThanOrEqual,
            GreaterThan => LessThan,
            GreaterThanOrEqual => LessThanOrEqual,
            other => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SqlUnaryOperator {
    Not,
    Negate,
    IsNull,
    IsNotNull,
    /// `CAST(operand AS <store type of the node's mapping>)`
    Convert,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaseWhen {
    pub test: SqlExpression,
    pub result: SqlExpression,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InValues {
    List(Vec<SqlExpression>),
    Subquery(Box<SelectExpression>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SqlExpression {
    Column {
        name: String,
        table: String,
        ty: ClrType,
        mapping: Option<TypeMapping>,
        nullable: bool,
    },
    Constant {
        value: Value,
        ty: ClrType,
        mapping: Option<TypeMapping>,
    },
    /// A query parameter; `name` is the invariant (query-level) name.
    Parameter {
        name: String,
        ty: ClrType,
        mapping: Option<TypeMapping>,
    },
    Binary {
        op: SqlBinaryOperator,
        left: Box<SqlExpression>,
        right: Box<SqlExpression>,
        ty: ClrType,
        mapping: Option<TypeMapping>,
    },
    Unary {
        op: SqlUnaryOperator,
        operand: Box<SqlExpression>,
        ty: ClrType,
        mapping: Option<TypeMapping>,
    },
    Function {
        name: String,
        args: Vec<SqlExpression>,
        /// Rendered without parentheses (`CURRENT_TIMESTAMP`).
        niladic: bool,
        nullable: bool,
        ty: ClrType,
        mapping: Option<TypeMapping>,
    },
    Case {
        operand: Option<Box<SqlExpression>>,
        whens: Vec<CaseWhen>,
        else_result: Option<Box<SqlExpression>>,
        ty: ClrType,
        mapping: Option<TypeMapping>,
    },
    Like {
        item: Box<SqlExpression>,
        pattern: Box<SqlExpression>,
        escape: Option<Box<SqlExpression>>,
    },
    In {
        item: Box<SqlExpression>,
        values: InValues,
        negated: bool,
    },
    Exists {
        subquery: Box<SelectExpression>,
        negated: bool,
    },
    ScalarSubquery {
        subquery: Box<SelectExpression>,
        ty: ClrType,
        mapping: Option<TypeMapping>,
    },
    /// Verbatim SQL text (`*`, `(SELECT 1)`).
    Fragment(String),
}

impl SqlExpression {
    pub fn ty(&self) -> ClrType {
        match self {
            SqlExpression::Column { ty, .. }
            | SqlExpression::Constant { ty, .. }
            | SqlExpression::Parameter { ty, .. }
            | SqlExpression::Binary { ty, .. }
            | SqlExpression::Unary { ty, .. }
            | SqlExpression::Function { ty, .. }
            | SqlExpression::Case { ty, .. }
            | SqlExpression::ScalarSubquery { ty, .. } => ty.clone(),
            SqlExpression::Like { .. } | SqlExpression::In { .. } | SqlExpression::Exists { .. } => ClrType::Bool,
            SqlExpression::Fragment(_) => ClrType::Object,
        }
    }

    pub fn type_mapping(&self) -> Option<&TypeMapping> {
        match self {
            SqlExpression::Column { mapping, .. }
            | SqlExpression::Constant { mapping, .. }
            | SqlExpression::Parameter { mapping, .. }
            | SqlExpression::Binary { mapping, .. }
            | SqlExpression::Unary { mapping, .. }
            | SqlExpression::Function { mapping, .. }
            | SqlExpression::Case { mapping, .. }
            | SqlExpression::ScalarSubquery { mapping, .. } => mapping.as_ref(),
            _ => None,
        }
    }

    /// Whether the expression can evaluate to SQL `NULL`.
    pub fn is_nullable(&self) -> bool {
        match self {
            SqlExpression::Column { nullable, .. } => *nullable,
            SqlExpression::Constant { value, .. } => value.is_null(),
            SqlExpression::Parameter { ty, .. } => ty.can_be_null(),
            SqlExpression::Binary { op, left, right, .. } => {
                if op.is_comparison() || op.is_logical() {
                    false
                } else {
                    left.is_nullable() || right.is_nullable()
                }
            }
            SqlExpression::Unary { op, operand, .. } => match op {
                SqlUnaryOperator::IsNull | SqlUnaryOperator::IsNotNull => false,
                _ => operand.is_nullable(),
            },
            SqlExpression::Function { nullable, .. } => *nullable,
            SqlExpression::Case { whens, else_result, .. } => {
                else_result.as_ref().map_or(true, |e| e.is_nullable()) || whens.iter().any(|w| w.result.is_nullable())
            }
            SqlExpression::ScalarSubquery { .. } => true,
            SqlExpression::Like { .. } | SqlExpression::In { .. } | SqlExpression::Exists { .. } => false,
            SqlExpression::Fragment(_) => true,
        }
    }

    /// Whether the node is a search condition (as opposed to a boolean value).
    pub fn is_predicate(&self) -> bool {
        match self {
            SqlExpression::Binary { op, .. } => op.is_comparison() || op.is_logical(),
            SqlExpression::Unary { op, .. } => matches!(
                op,
                SqlUnaryOperator::Not | SqlUnaryOperator::IsNull | SqlUnaryOperator::IsNotNull
            ),
            SqlExpression::Like { .. } | SqlExpression::In { .. } | SqlExpression::Exists { .. } => true,
            _ => false,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, SqlExpression::Constant { .. })
    }

    pub fn is_null_constant(&self) -> bool {
        matches!(self, SqlExpression::Constant { value, .. } if value.is_null())
    }

    pub fn as_bool_constant(&self) -> Option<bool> {
        match self {
            SqlExpression::Constant { value: Value::Bool(b), .. } => Some(*b),
            _ => None,
        }
    }

    /// Table alias of a column node.
    pub fn table_alias(&self) -> Option<&str> {
        match self {
            SqlExpression::Column { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Suggested projection alias: a column's own name, otherwise `fallback`.
    pub fn alias_hint<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self {
            SqlExpression::Column { name, .. } => name,
            _ => fallback,
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let SqlExpression::Function { name, .. } = e {
                if is_aggregate_function(name) {
                    found = true;
                }
            }
        });
        found
    }

    /// Whether any column of the expression refers to `alias`.
    pub fn references_table(&self, alias: &str) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if e.table_alias() == Some(alias) {
                found = true;
            }
        });
        found
    }

    /// Pre-order walk over this expression. Subqueries are not entered.
    pub fn visit(&self, f: &mut impl FnMut(&SqlExpression)) {
        f(self);
        match self {
            SqlExpression::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            SqlExpression::Unary { operand, .. } => operand.visit(f),
            SqlExpression::Function { args, .. } => args.iter().for_each(|a| a.visit(f)),
            SqlExpression::Case {
                operand,
                whens,
                else_result,
                ..
            } => {
                if let Some(o) = operand {
                    o.visit(f);
                }
                for w in whens {
                    w.test.visit(f);
                    w.result.visit(f);
                }
                if let Some(e) = else_result {
                    e.visit(f);
                }
            }
            SqlExpression::Like { item, pattern, escape } => {
                item.visit(f);
                pattern.visit(f);
                if let Some(e) = escape {
                    e.visit(f);
                }
            }
            SqlExpression::In { item, values, .. } => {
                item.visit(f);
                if let InValues::List(values) = values {
                    values.iter().for_each(|v| v.visit(f));
                }
            }
            _ => {}
        }
    }

    /// Bottom-up rewrite. Subqueries are not entered.
    pub fn transform(self, f: &mut impl FnMut(SqlExpression) -> SqlExpression) -> SqlExpression {
        let rebuilt = match self {
            SqlExpression::Binary {
                op,
                left,
                right,
                ty,
                mapping,
            } => SqlExpression::Binary {
                op,
                left: Box::new(left.transform(f)),
                right: Box::new(right.transform(f)),
                ty,
                mapping,
            },
            SqlExpression::Unary { op, operand, ty, mapping } => SqlExpression::Unary {
                op,
                operand: Box::new(operand.transform(f)),
                ty,
                mapping,
            },
            SqlExpression::Function {
                name,
                args,
                niladic,
                nullable,
                ty,
                mapping,
            } => SqlExpression::Function {
                name,
                args: args.into_iter().map(|a| a.transform(f)).collect(),
                niladic,
                nullable,
                ty,
                mapping,
            },
            SqlExpression::Case {
                operand,
                whens,
                else_result,
                ty,
                mapping,
            } => SqlExpression::Case {
                operand: operand.map(|o| Box::new(o.transform(f))),
                whens: whens
                    .into_iter()
                    .map(|w| CaseWhen {
                        test: w.test.transform(f),
                        result: w.result.transform(f),
                    })
                    .collect(),
                else_result: else_result.map(|e| Box::new(e.transform(f))),
                ty,
                mapping,
            },
            SqlExpression::Like { item, pattern, escape } => SqlExpression::Like {
                item: Box::new(item.transform(f)),
                pattern: Box::new(pattern.transform(f)),
                escape: escape.map(|e| Box::new(e.transform(f))),
            },
            SqlExpression::In { item, values, negated } => SqlExpression::In {
                item: Box::new(item.transform(f)),
                values: match values {
                    InValues::List(values) => InValues::List(values.into_iter().map(|v| v.transform(f)).collect()),
                    other => other,
                },
                negated,
            },
            other => other,
        };
        f(rebuilt)
    }

    /// Marks a column as nullable (used when its table becomes the optional side of an outer join).
    pub fn make_nullable(self) -> SqlExpression {
        match self {
            SqlExpression::Column {
                name, table, ty, mapping, ..
            } => SqlExpression::Column {
                name,
                table,
                ty: ty.make_nullable(),
                mapping,
                nullable: true,
            },
            other => other,
        }
    }
}

pub(crate) fn is_aggregate_function(name: &str) -> bool {
    matches!(
        name.to_ascii_uppercase().as_str(),
        "COUNT" | "COUNT_BIG" | "SUM" | "AVG" | "MIN" | "MAX"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, table: &str, nullable: bool) -> SqlExpression {
        SqlExpression::Column {
            name: name.into(),
            table: table.into(),
            ty: ClrType::Int32,
            mapping: None,
            nullable,
        }
    }

    #[test]
    fn comparisons_are_predicates_and_not_nullable() {
        let cmp = SqlExpression::Binary {
            op: SqlBinaryOperator::Equal,
            left: Box::new(column("Id", "b", true)),
            right: Box::new(column("BlogId", "p", true)),
            ty: ClrType::Bool,
            mapping: None,
        };
        assert!(cmp.is_predicate());
        assert!(!cmp.is_nullable());
        assert!(cmp.references_table("p"));
        assert!(!cmp.references_table("t"));
    }

    #[test]
    fn transform_rewrites_bottom_up() {
        let sum = SqlExpression::Binary {
            op: SqlBinaryOperator::Add,
            left: Box::new(column("A", "b", false)),
            right: Box::new(column("B", "b", false)),
            ty: ClrType::Int32,
            mapping: None,
        };
        let moved = sum.transform(&mut |e| match e {
            SqlExpression::Column {
                name, ty, mapping, nullable, ..
            } => SqlExpression::Column {
                name,
                table: "t".into(),
                ty,
                mapping,
                nullable,
            },
            other => other,
        });
        assert!(moved.references_table("t"));
        assert!(!moved.references_table("b"));
    }

    #[test]
    fn negated_comparisons() {
        assert_eq!(SqlBinaryOperator::LessThan.negated(), Some(SqlBinaryOperator::GreaterThanOrEqual));
        assert_eq!(SqlBinaryOperator::Add.negated(), None);
        assert_eq!(SqlBinaryOperator::LessThan.mirrored(), SqlBinaryOperator::GreaterThan);
    }
}
