//! Relational SQL expression tree, its construction factory and the per-dialect generator.

pub mod dialect;
pub mod expression;
pub mod factory;
pub mod generator;
pub mod params;
pub mod select;

pub use dialect::{dialect_for, Paging, PostgresDialect, SqlDialect, SqlServerDialect, SqliteDialect};
pub use expression::{CaseWhen, InValues, SqlBinaryOperator, SqlExpression, SqlUnaryOperator};
pub use factory::SqlExpressionFactory;
pub use generator::{CommandParameter, QuerySqlGenerator, QuerySqlGeneratorFactory, RelationalCommandTemplate};
pub use params::PgBindValue;
pub use select::{
    AliasGenerator, EntityProjection, JoinKind, MappedProjection, Ordering, ProjectionExpression, ProjectionMember,
    SelectExpression, TableItem, TableSource,
};
