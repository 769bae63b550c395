//! Built-in method and member translators.

mod datetime;
mod db_function;
mod equals;
mod math;
mod string;

pub use datetime::DateTimeTranslator;
pub use db_function::{DbFunction, DbFunctionTranslator, FunctionTranslation};
pub use equals::{EqualsTranslator, HasFlagTranslator};
pub use math::MathTranslator;
pub use string::StringTranslator;

use crate::sql::SqlExpression;

fn any_nullable<'a>(exprs: impl IntoIterator<Item = &'a SqlExpression>) -> bool {
    exprs.into_iter().any(SqlExpression::is_nullable)
}
