//! Renders a finished `SelectExpression` into SQL text and an ordered parameter list.
//!
//! A generator is created per compiled query and consumed by [`QuerySqlGenerator::generate`];
//! output depends only on the tree and the dialect.

use super::dialect::{dialect_for, Paging, SqlDialect};
use super::expression::{InValues, SqlBinaryOperator, SqlExpression, SqlUnaryOperator};
use super::select::{JoinKind, SelectExpression, TableItem, TableSource};
use crate::error::{QueryError, Result};
use crate::options::Dialect;
use crate::storage::TypeMapping;
use crate::value::{ClrType, Value};
use std::collections::HashMap;
use std::sync::Arc;

const INDENT: &str = "    ";

#[derive(Clone, Debug, PartialEq)]
pub struct CommandParameter {
    /// Placeholder as written in the SQL text (`@__minRating_0`, `$1`).
    pub placeholder: String,
    /// Name of the query parameter the value comes from.
    pub invariant_name: String,
    pub ty: ClrType,
    pub mapping: Option<TypeMapping>,
}

/// SQL text plus the parameters it references, in placeholder order.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationalCommandTemplate {
    pub sql: String,
    pub parameters: Vec<CommandParameter>,
}

#[derive(Clone, Debug)]
pub struct QuerySqlGeneratorFactory {
    dialect: Arc<dyn SqlDialect>,
}

impl QuerySqlGeneratorFactory {
    pub fn new(dialect: Dialect) -> Self {
        QuerySqlGeneratorFactory {
            dialect: dialect_for(dialect),
        }
    }

    pub fn with_dialect(dialect: Arc<dyn SqlDialect>) -> Self {
        QuerySqlGeneratorFactory { dialect }
    }

    pub fn create(&self) -> QuerySqlGenerator {
        QuerySqlGenerator {
            dialect: self.dialect.clone(),
            sql: String::new(),
            indent: 0,
            parameters: Vec::new(),
            placeholders: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Context {
    Value,
    Predicate,
}

pub struct QuerySqlGenerator {
    dialect: Arc<dyn SqlDialect>,
    sql: String,
    indent: usize,
    parameters: Vec<CommandParameter>,
    placeholders: HashMap<String, usize>,
}

impl QuerySqlGenerator {
    pub fn generate(mut self, select: &SelectExpression) -> Result<RelationalCommandTemplate> {
        self.visit_select(select)?;
        Ok(RelationalCommandTemplate {
            sql: self.sql,
            parameters: self.parameters,
        })
    }

    fn append(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn new_line(&mut self) {
        self.sql.push('\n');
        for _ in 0..self.indent {
            self.sql.push_str(INDENT);
        }
    }

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn visit_select(&mut self, select: &SelectExpression) -> Result<()> {
        let paging = self.dialect.paging();
        self.append("SELECT ");
        if select.distinct {
            self.append("DISTINCT ");
        }
        if paging == Paging::TopOrOffsetFetch && select.offset.is_none() {
            if let Some(limit) = &select.limit {
                self.append("TOP(");
                self.visit(limit, Context::Value)?;
                self.append(") ");
            }
        }
        if select.projection.is_empty() {
            self.append("1");
        } else {
            for (i, p) in select.projection.iter().enumerate() {
                if i > 0 {
                    self.append(", ");
                }
                self.visit(&p.expression, Context::Value)?;
                let same_name = matches!(&p.expression, SqlExpression::Column { name, .. } if *name == p.alias);
                if !same_name {
                    self.append(" AS ");
                    let alias = self.quote(&p.alias);
                    self.append(&alias);
                }
            }
        }

        if !select.tables.is_empty() {
            self.new_line();
            self.append("FROM ");
            for (i, table) in select.tables.iter().enumerate() {
                if i > 0 {
                    self.new_line();
                }
                self.visit_table(table)?;
            }
        }

        if let Some(predicate) = &select.predicate {
            self.new_line();
            self.append("WHERE ");
            self.visit(predicate, Context::Predicate)?;
        }
        if !select.group_by.is_empty() {
            self.new_line();
            self.append("GROUP BY ");
            self.visit_list(&select.group_by)?;
        }
        if let Some(having) = &select.having {
            self.new_line();
            self.append("HAVING ");
            self.visit(having, Context::Predicate)?;
        }

        if !select.orderings.is_empty() {
            self.new_line();
            self.append("ORDER BY ");
            for (i, o) in select.orderings.iter().enumerate() {
                if i > 0 {
                    self.append(", ");
                }
                self.visit(&o.expression, Context::Value)?;
                if !o.ascending {
                    self.append(" DESC");
                }
            }
        } else if paging == Paging::TopOrOffsetFetch && select.offset.is_some() {
            self.new_line();
            self.append("ORDER BY (SELECT 1)");
        }

        match paging {
            Paging::LimitOffset { unbounded } => {
                if select.limit.is_some() || select.offset.is_some() {
                    self.new_line();
                }
                match (&select.limit, unbounded) {
                    (Some(limit), _) => {
                        self.append("LIMIT ");
                        self.visit(limit, Context::Value)?;
                    }
                    (None, Some(unbounded)) if select.offset.is_some() => {
                        self.append("LIMIT ");
                        self.append(unbounded);
                    }
                    _ => {}
                }
                if let Some(offset) = &select.offset {
                    if select.limit.is_some() || unbounded.is_some() {
                        self.append(" ");
                    }
                    self.append("OFFSET ");
                    self.visit(offset, Context::Value)?;
                }
            }
            Paging::TopOrOffsetFetch => {
                if let Some(offset) = &select.offset {
                    self.new_line();
                    self.append("OFFSET ");
                    self.visit(offset, Context::Value)?;
                    self.append(" ROWS");
                    if let Some(limit) = &select.limit {
                        self.append(" FETCH NEXT ");
                        self.visit(limit, Context::Value)?;
                        self.append(" ROWS ONLY");
                    }
                }
            }
        }
        Ok(())
    }

    fn visit_table(&mut self, table: &TableItem) -> Result<()> {
        if let Some((kind, on)) = &table.join {
            self.append(match kind {
                JoinKind::Inner => "INNER JOIN ",
                JoinKind::LeftOuter => "LEFT JOIN ",
                JoinKind::Cross => "CROSS JOIN ",
            });
            self.visit_table_source(&table.source, &table.alias)?;
            if let Some(on) = on {
                self.append(" ON ");
                self.visit(on, Context::Predicate)?;
            }
            Ok(())
        } else {
            self.visit_table_source(&table.source, &table.alias)
        }
    }

    fn visit_table_source(&mut self, source: &TableSource, alias: &str) -> Result<()> {
        match source {
            TableSource::Table { name, schema } => {
                let table = self.dialect.delimit_table(name, schema.as_deref());
                self.append(&table);
            }
            TableSource::Subquery(inner) => {
                self.append("(");
                self.indent += 1;
                self.new_line();
                self.visit_select(inner)?;
                self.indent -= 1;
                self.new_line();
                self.append(")");
            }
            TableSource::FromSql { sql, args } => {
                self.append("(");
                self.indent += 1;
                self.new_line();
                self.visit_raw_sql(sql, args)?;
                self.indent -= 1;
                self.new_line();
                self.append(")");
            }
        }
        self.append(" AS ");
        let alias = self.quote(alias);
        self.append(&alias);
        Ok(())
    }

    /// Copies raw SQL, replacing `{n}` holes with the rendered arguments. `{{`/`}}` escape braces.
    fn visit_raw_sql(&mut self, sql: &str, args: &[SqlExpression]) -> Result<()> {
        let mut chars = sql.chars().peekable();
        let multiline = sql.contains('\n');
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    self.sql.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    self.sql.push('}');
                }
                '{' => {
                    let mut digits = String::new();
                    for d in chars.by_ref() {
                        if d == '}' {
                            break;
                        }
                        digits.push(d);
                    }
                    let index: usize = digits.trim().parse().map_err(|_| {
                        QueryError::InvalidOperation(format!("invalid argument placeholder '{{{}}}' in raw SQL", digits))
                    })?;
                    let arg = args.get(index).ok_or_else(|| {
                        QueryError::InvalidOperation(format!(
                            "raw SQL references argument {{{}}} but only {} were supplied",
                            index,
                            args.len()
                        ))
                    })?;
                    self.visit(arg, Context::Value)?;
                }
                '\n' if multiline => self.new_line(),
                '\r' => {}
                other => self.sql.push(other),
            }
        }
        Ok(())
    }

    fn visit_list(&mut self, items: &[SqlExpression]) -> Result<()> {
        for (i, e) in items.iter().enumerate() {
            if i > 0 {
                self.append(", ");
            }
            self.visit(e, Context::Value)?;
        }
        Ok(())
    }

    fn visit(&mut self, expr: &SqlExpression, context: Context) -> Result<()> {
        if !self.dialect.supports_bool_predicates() {
            match context {
                Context::Predicate if !expr.is_predicate() => {
                    if let Some(b) = expr.as_bool_constant() {
                        self.append(self.dialect.bool_predicate(b));
                        return Ok(());
                    }
                    self.visit_node(expr)?;
                    self.append(" = ");
                    let literal = self.bool_literal(expr.type_mapping(), true)?;
                    self.append(&literal);
                    return Ok(());
                }
                Context::Value if expr.is_predicate() => {
                    self.append("CASE WHEN ");
                    self.visit_node(expr)?;
                    let yes = self.bool_literal(expr.type_mapping(), true)?;
                    let no = self.bool_literal(expr.type_mapping(), false)?;
                    self.append(&format!(" THEN {} ELSE {} END", yes, no));
                    return Ok(());
                }
                _ => {}
            }
        }
        self.visit_node(expr)
    }

    fn bool_literal(&self, mapping: Option<&TypeMapping>, value: bool) -> Result<String> {
        match mapping {
            Some(m) if matches!(m.clr_type, ClrType::Bool) => m.generate_sql_literal(&Value::Bool(value)),
            _ => Ok(self.dialect.fallback_literal(&Value::Bool(value))),
        }
    }

    fn visit_node(&mut self, expr: &SqlExpression) -> Result<()> {
        match expr {
            SqlExpression::Column { name, table, .. } => {
                let sql = format!("{}.{}", self.quote(table), self.quote(name));
                self.append(&sql);
            }
            SqlExpression::Constant { value, mapping, .. } => {
                let literal = match mapping {
                    Some(m) => m.generate_sql_literal(value)?,
                    None => self.dialect.fallback_literal(value),
                };
                self.append(&literal);
            }
            SqlExpression::Parameter { name, ty, mapping } => {
                let ordinal = match self.placeholders.get(name) {
                    Some(i) => *i,
                    None => {
                        let i = self.parameters.len();
                        self.parameters.push(CommandParameter {
                            placeholder: self.dialect.parameter_placeholder(name, i),
                            invariant_name: name.clone(),
                            ty: ty.clone(),
                            mapping: mapping.clone(),
                        });
                        self.placeholders.insert(name.clone(), i);
                        i
                    }
                };
                let placeholder = self.parameters[ordinal].placeholder.clone();
                self.append(&placeholder);
            }
            SqlExpression::Binary {
                op, left, right, ty, ..
            } => {
                let operand_context = if op.is_logical() {
                    Context::Predicate
                } else {
                    Context::Value
                };
                self.visit_operand(*op, left, false, operand_context)?;
                let token = match op {
                    SqlBinaryOperator::Add if matches!(ty.unwrap_nullable(), ClrType::String) => {
                        self.dialect.concat_operator()
                    }
                    other => operator_token(*other),
                };
                self.append(" ");
                self.append(token);
                self.append(" ");
                self.visit_operand(*op, right, true, operand_context)?;
            }
            SqlExpression::Unary { op, operand, mapping, .. } => match op {
                SqlUnaryOperator::Not => {
                    self.append("NOT (");
                    self.visit(operand, Context::Predicate)?;
                    self.append(")");
                }
                SqlUnaryOperator::Negate => {
                    self.append("-");
                    self.visit_wrapped(operand, precedence(operand) < 80)?;
                }
                SqlUnaryOperator::IsNull | SqlUnaryOperator::IsNotNull => {
                    self.visit_wrapped(operand, precedence(operand) <= 40)?;
                    self.append(if *op == SqlUnaryOperator::IsNull {
                        " IS NULL"
                    } else {
                        " IS NOT NULL"
                    });
                }
                SqlUnaryOperator::Convert => {
                    let store_type = mapping.as_ref().map(|m| m.store_type.clone()).ok_or_else(|| {
                        QueryError::InvalidOperation(format!("no store type known for a conversion to {}", expr.ty()))
                    })?;
                    self.append("CAST(");
                    self.visit(operand, Context::Value)?;
                    self.append(" AS ");
                    self.append(&store_type);
                    self.append(")");
                }
            },
            SqlExpression::Function { name, args, niladic, .. } => {
                self.append(name);
                if !*niladic {
                    self.append("(");
                    self.visit_list(args)?;
                    self.append(")");
                }
            }
            SqlExpression::Case {
                operand,
                whens,
                else_result,
                ..
            } => {
                self.append("CASE");
                let test_context = match operand {
                    Some(operand) => {
                        self.append(" ");
                        self.visit(operand, Context::Value)?;
                        Context::Value
                    }
                    None => Context::Predicate,
                };
                self.indent += 1;
                for w in whens {
                    self.new_line();
                    self.append("WHEN ");
                    self.visit(&w.test, test_context)?;
                    self.append(" THEN ");
                    self.visit(&w.result, Context::Value)?;
                }
                if let Some(e) = else_result {
                    self.new_line();
                    self.append("ELSE ");
                    self.visit(e, Context::Value)?;
                }
                self.indent -= 1;
                self.new_line();
                self.append("END");
            }
            SqlExpression::Like { item, pattern, escape } => {
                self.visit(item, Context::Value)?;
                self.append(" LIKE ");
                self.visit(pattern, Context::Value)?;
                if let Some(escape) = escape {
                    self.append(" ESCAPE ");
                    self.visit(escape, Context::Value)?;
                }
            }
            SqlExpression::In { item, values, negated } => {
                self.visit(item, Context::Value)?;
                self.append(if *negated { " NOT IN (" } else { " IN (" });
                match values {
                    InValues::List(values) => self.visit_list(values)?,
                    InValues::Subquery(select) => {
                        self.indent += 1;
                        self.new_line();
                        self.visit_select(select)?;
                        self.indent -= 1;
                        self.new_line();
                    }
                }
                self.append(")");
            }
            SqlExpression::Exists { subquery, negated } => {
                if *negated {
                    self.append("NOT ");
                }
                self.append("EXISTS (");
                self.indent += 1;
                self.new_line();
                self.visit_select(subquery)?;
                self.indent -= 1;
                self.append(")");
            }
            SqlExpression::ScalarSubquery { subquery, .. } => {
                self.append("(");
                self.indent += 1;
                self.new_line();
                self.visit_select(subquery)?;
                self.indent -= 1;
                self.append(")");
            }
            SqlExpression::Fragment(sql) => self.append(sql),
        }
        Ok(())
    }

    fn visit_operand(
        &mut self,
        parent: SqlBinaryOperator,
        operand: &SqlExpression,
        right: bool,
        context: Context,
    ) -> Result<()> {
        let wrap = needs_parentheses(parent, operand, right);
        if wrap {
            self.append("(");
        }
        self.visit(operand, context)?;
        if wrap {
            self.append(")");
        }
        Ok(())
    }

    fn visit_wrapped(&mut self, expr: &SqlExpression, wrap: bool) -> Result<()> {
        if wrap {
            self.append("(");
        }
        self.visit(expr, Context::Value)?;
        if wrap {
            self.append(")");
        }
        Ok(())
    }
}

fn operator_token(op: SqlBinaryOperator) -> &'static str {
    match op {
        SqlBinaryOperator::Add => "+",
        SqlBinaryOperator::Subtract => "-",
        SqlBinaryOperator::Multiply => "*",
        SqlBinaryOperator::Divide => "/",
        SqlBinaryOperator::Modulo => "%",
        SqlBinaryOperator::BitAnd => "&",
        SqlBinaryOperator::BitOr => "|",
        SqlBinaryOperator::And => "AND",
        SqlBinaryOperator::Or => "OR",
        SqlBinaryOperator::Equal => "=",
        SqlBinaryOperator::NotEqual => "<>",
        SqlBinaryOperator::LessThan => "<",
        SqlBinaryOperator::LessThanOrEqual => "<=",
        SqlBinaryOperator::GreaterThan => ">",
        SqlBinaryOperator::GreaterThanOrEqual => ">=",
    }
}

fn operator_precedence(op: SqlBinaryOperator) -> u8 {
    match op {
        SqlBinaryOperator::Or => 10,
        SqlBinaryOperator::And => 20,
        SqlBinaryOperator::BitOr => 50,
        SqlBinaryOperator::BitAnd => 55,
        SqlBinaryOperator::Add | SqlBinaryOperator::Subtract => 60,
        SqlBinaryOperator::Multiply | SqlBinaryOperator::Divide | SqlBinaryOperator::Modulo => 70,
        _ => 40,
    }
}

fn precedence(expr: &SqlExpression) -> u8 {
    match expr {
        SqlExpression::Binary { op, .. } => operator_precedence(*op),
        SqlExpression::Unary { op, .. } => match op {
            SqlUnaryOperator::Not => 30,
            SqlUnaryOperator::IsNull | SqlUnaryOperator::IsNotNull => 40,
            SqlUnaryOperator::Negate => 80,
            SqlUnaryOperator::Convert => 100,
        },
        SqlExpression::Like { .. } | SqlExpression::In { .. } => 40,
        _ => 100,
    }
}

fn needs_parentheses(parent: SqlBinaryOperator, child: &SqlExpression, right: bool) -> bool {
    let p = operator_precedence(parent);
    let c = precedence(child);
    if let SqlExpression::Binary { op, .. } = child {
        if parent == SqlBinaryOperator::Or && *op == SqlBinaryOperator::And {
            return true;
        }
        if c == p {
            let associative = *op == parent
                && matches!(
                    parent,
                    SqlBinaryOperator::And
                        | SqlBinaryOperator::Or
                        | SqlBinaryOperator::Add
                        | SqlBinaryOperator::Multiply
                        | SqlBinaryOperator::BitAnd
                        | SqlBinaryOperator::BitOr
                );
            return !associative && (right || parent.is_comparison());
        }
    }
    c < p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::select::{Ordering, SelectExpression};
    use crate::sql::SqlExpressionFactory;
    use crate::storage::RelationalTypeMappingSource;

    fn column(name: &str, ty: ClrType) -> SqlExpression {
        SqlExpression::Column {
            name: name.into(),
            table: "b".into(),
            ty,
            mapping: None,
            nullable: false,
        }
    }

    fn blogs(dialect: Dialect) -> (SelectExpression, SqlExpressionFactory) {
        let f = SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(dialect)), false);
        let mut select = SelectExpression::from_table("Blogs", None, "b".into());
        select.add_to_projection(column("Id", ClrType::Int32), "Id");
        select.add_to_projection(column("Name", ClrType::String), "Name");
        (select, f)
    }

    #[test]
    fn renders_projection_and_from() {
        let (select, _) = blogs(Dialect::Sqlite);
        let command = QuerySqlGeneratorFactory::new(Dialect::Sqlite).create().generate(&select).unwrap();
        assert_eq!(command.sql, "SELECT \"b\".\"Id\", \"b\".\"Name\"\nFROM \"Blogs\" AS \"b\"");
        assert!(command.parameters.is_empty());
    }

    #[test]
    fn parameters_are_deduplicated_by_name() {
        let (mut select, f) = blogs(Dialect::Postgres);
        let p = f.parameter("minRating", ClrType::Int32);
        let pred = f.or(
            f.binary(SqlBinaryOperator::GreaterThan, column("Rating", ClrType::Int32), p.clone()),
            f.binary(SqlBinaryOperator::LessThan, column("Views", ClrType::Int32), p),
        );
        select.predicate = Some(pred);
        let command = QuerySqlGeneratorFactory::new(Dialect::Postgres).create().generate(&select).unwrap();
        assert!(command.sql.contains("WHERE \"b\".\"Rating\" > $1 OR \"b\".\"Views\" < $1"));
        assert_eq!(command.parameters.len(), 1);
        assert_eq!(command.parameters[0].invariant_name, "minRating");
    }

    #[test]
    fn sql_server_uses_top_and_bit_predicates() {
        let (mut select, f) = blogs(Dialect::SqlServer);
        select.predicate = Some(f.apply_default_type_mapping(column("IsActive", ClrType::Bool)));
        select.limit = Some(f.apply_default_type_mapping(f.constant(Value::Int(5), ClrType::Int32)));
        let command = QuerySqlGeneratorFactory::new(Dialect::SqlServer).create().generate(&select).unwrap();
        assert!(command.sql.starts_with("SELECT TOP(5) [b].[Id], [b].[Name]"));
        assert!(command.sql.contains("WHERE [b].[IsActive] = CAST(1 AS bit)"));
    }

    #[test]
    fn offset_without_limit_per_dialect() {
        let (mut select, f) = blogs(Dialect::Sqlite);
        select.offset = Some(f.apply_default_type_mapping(f.constant(Value::Int(10), ClrType::Int32)));
        let sqlite = QuerySqlGeneratorFactory::new(Dialect::Sqlite).create().generate(&select).unwrap();
        assert!(sqlite.sql.ends_with("LIMIT -1 OFFSET 10"));
        let mssql = QuerySqlGeneratorFactory::new(Dialect::SqlServer).create().generate(&select).unwrap();
        assert!(mssql.sql.ends_with("ORDER BY (SELECT 1)\nOFFSET 10 ROWS"));
    }

    #[test]
    fn and_inside_or_is_parenthesized() {
        let (mut select, f) = blogs(Dialect::Sqlite);
        let a = f.is_null(SqlExpression::Column {
            name: "A".into(),
            table: "b".into(),
            ty: ClrType::String,
            mapping: None,
            nullable: true,
        });
        let b = f.binary(SqlBinaryOperator::Equal, column("Id", ClrType::Int32), f.constant(Value::Int(1), ClrType::Int32));
        let c = f.binary(SqlBinaryOperator::Equal, column("Id", ClrType::Int32), f.constant(Value::Int(2), ClrType::Int32));
        select.predicate = Some(f.or(f.and(a, b), c));
        let command = QuerySqlGeneratorFactory::new(Dialect::Sqlite).create().generate(&select).unwrap();
        assert!(command
            .sql
            .contains("WHERE (\"b\".\"A\" IS NULL AND \"b\".\"Id\" = 1) OR \"b\".\"Id\" = 2"));
    }

    #[test]
    fn subtraction_keeps_right_operand_grouping() {
        let (mut select, f) = blogs(Dialect::Sqlite);
        let inner = f.binary(SqlBinaryOperator::Subtract, column("B", ClrType::Int32), column("C", ClrType::Int32));
        let outer = f.binary(SqlBinaryOperator::Subtract, column("A", ClrType::Int32), inner);
        select.projection.clear();
        select.add_to_projection(outer, "Diff");
        select.orderings.push(Ordering {
            expression: column("A", ClrType::Int32),
            ascending: false,
        });
        let command = QuerySqlGeneratorFactory::new(Dialect::Sqlite).create().generate(&select).unwrap();
        assert!(command.sql.starts_with("SELECT \"b\".\"A\" - (\"b\".\"B\" - \"b\".\"C\") AS \"Diff\""));
        assert!(command.sql.ends_with("ORDER BY \"b\".\"A\" DESC"));
    }

    #[test]
    fn raw_sql_arguments_become_parameters() {
        let f = SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(Dialect::Sqlite)), false);
        let source = TableSource::FromSql {
            sql: "SELECT * FROM \"Blogs\" WHERE \"Rating\" > {0}".into(),
            args: vec![f.parameter("p0", ClrType::Int32)],
        };
        let select = SelectExpression::from_source(source, "b".into());
        let command = QuerySqlGeneratorFactory::new(Dialect::Sqlite).create().generate(&select).unwrap();
        assert!(command.sql.contains("WHERE \"Rating\" > @__p0_0\n) AS \"b\""));
    }
}
