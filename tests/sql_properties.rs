mod common;

use architect_orm::query::{lambda, param, var};
use architect_orm::sql::{QuerySqlGeneratorFactory, SelectExpression, SqlExpression, SqlExpressionFactory};
use architect_orm::storage::{RelationalTypeMappingSource, TypeMappingSource};
use architect_orm::{ClrType, Dialect, Expr, Query, QueryCompiler, QueryOptions, Value};
use proptest::prelude::*;
use std::sync::Arc;

fn factory(relational_nulls: bool) -> SqlExpressionFactory {
    SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(Dialect::Sqlite)), relational_nulls)
}

fn column(name: &str, ty: ClrType, nullable: bool) -> SqlExpression {
    let mapping = RelationalTypeMappingSource::new(Dialect::Sqlite).find_mapping(&ty, None);
    SqlExpression::Column {
        name: name.into(),
        table: "b".into(),
        ty: if nullable { ty.make_nullable() } else { ty },
        mapping,
        nullable,
    }
}

fn render_predicate(predicate: SqlExpression) -> String {
    let mut select = SelectExpression::from_table("Blogs", None, "b".into());
    select.add_to_projection(column("Id", ClrType::Int32, false), "Id");
    select.predicate = Some(predicate);
    QuerySqlGeneratorFactory::new(Dialect::Sqlite)
        .create()
        .generate(&select)
        .unwrap()
        .sql
}

/// The null checks a rendered predicate performs, in sorted order.
fn null_checks(sql: &str) -> Vec<String> {
    let predicate = sql.split("WHERE ").nth(1).unwrap_or_default();
    let mut checks: Vec<String> = predicate
        .split(" OR ")
        .flat_map(|part| part.split(" AND "))
        .map(|part| part.trim_matches(|c| c == '(' || c == ')').to_string())
        .filter(|part| part.contains(" IS "))
        .collect();
    checks.sort();
    checks
}

fn scalar_type() -> impl Strategy<Value = ClrType> {
    prop::sample::select(vec![
        ClrType::Int32,
        ClrType::Int64,
        ClrType::String,
        ClrType::Bool,
        ClrType::Float64,
        ClrType::Guid,
        ClrType::DateTime,
    ])
}

fn dialect() -> impl Strategy<Value = Dialect> {
    prop::sample::select(vec![Dialect::Sqlite, Dialect::Postgres, Dialect::SqlServer])
}

proptest! {
    #[test]
    fn comparison_expansion_does_not_depend_on_operand_order(
        a_nullable in any::<bool>(),
        b_nullable in any::<bool>(),
        equal in any::<bool>(),
        relational_nulls in any::<bool>(),
    ) {
        let f = factory(relational_nulls);
        let a = column("A", ClrType::Int32, a_nullable);
        let b = column("B", ClrType::Int32, b_nullable);
        let (ab, ba) = if equal {
            (f.equal(a.clone(), b.clone()), f.equal(b, a))
        } else {
            (f.not_equal(a.clone(), b.clone()), f.not_equal(b, a))
        };
        let (ab, ba) = (render_predicate(ab), render_predicate(ba));
        prop_assert_eq!(null_checks(&ab), null_checks(&ba));
        prop_assert_eq!(ab.matches(" OR ").count(), ba.matches(" OR ").count());
        prop_assert_eq!(ab.matches(" AND ").count(), ba.matches(" AND ").count());
        if relational_nulls || !(a_nullable || b_nullable) {
            prop_assert!(null_checks(&ab).is_empty());
        }
    }

    #[test]
    fn equals_across_types_is_false(
        left in scalar_type(),
        right in scalar_type(),
        left_nullable in any::<bool>(),
        right_nullable in any::<bool>(),
    ) {
        let f = factory(false);
        let result = f.equals_method(
            column("L", left.clone(), left_nullable),
            column("R", right.clone(), right_nullable),
        );
        let is_false = matches!(result, SqlExpression::Constant { value: Value::Bool(false), .. });
        prop_assert_eq!(is_false, left != right);
    }

    #[test]
    fn rendering_is_deterministic(
        name in "[a-z][a-z0-9]{0,7}",
        threshold in any::<i32>(),
        take in 1i32..50,
        dialect in dialect(),
    ) {
        let q = Query::from("Blog")
            .filter(lambda(&["b"], var("b").member("Id").gt(param(&name, ClrType::Int32))))
            .filter(lambda(&["b"], var("b").member("Id").ne(Expr::int(threshold))))
            .order_by(lambda(&["b"], var("b").member("Name")))
            .take(Expr::int(take));
        let compile = || {
            let options = QueryOptions::default().with_dialect(dialect);
            QueryCompiler::new(Arc::new(common::blogging()), options).compile(&q).unwrap().command
        };
        let (first, second) = (compile(), compile());
        prop_assert_eq!(&first.sql, &second.sql);
        let names = |c: &architect_orm::sql::RelationalCommandTemplate| {
            c.parameters.iter().map(|p| (p.placeholder.clone(), p.invariant_name.clone())).collect::<Vec<_>>()
        };
        prop_assert_eq!(names(&first), names(&second));
        prop_assert_eq!(first.parameters.len(), 1);
    }
}
