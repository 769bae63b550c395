//! Date/time members and methods. Each dialect reproduces the platform semantics with its own
//! primitives: `strftime` on SQLite, `date_part`/intervals on PostgreSQL, `DATEPART`/`DATEADD`
//! on SQL Server.

use super::any_nullable;
use crate::options::Dialect;
use crate::query::{DeclaringType, MethodRef};
use crate::sql::{SqlBinaryOperator, SqlExpression, SqlExpressionFactory};
use crate::translate::registry::{MemberTranslator, MethodCallTranslator};
use crate::value::{ClrType, Value};

const SQLITE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%f";

pub struct DateTimeTranslator {
    dialect: Dialect,
}

impl DateTimeTranslator {
    pub fn new(dialect: Dialect) -> Self {
        DateTimeTranslator { dialect }
    }

    fn text(&self, f: &SqlExpressionFactory, s: &str) -> SqlExpression {
        f.constant(Value::Text(s.to_string()), ClrType::String)
    }

    fn int_result(&self, f: &SqlExpressionFactory, expr: SqlExpression, nullable: bool) -> SqlExpression {
        let ty = if nullable { ClrType::Int32.make_nullable() } else { ClrType::Int32 };
        f.convert(expr, ty)
    }

    /// `rtrim(rtrim(strftime(format, args...), '0'), '.')`: drops the trailing fractional seconds
    /// `strftime('%f')` always emits, so values compare equal to stored text.
    fn sqlite_datetime(&self, f: &SqlExpressionFactory, args: Vec<SqlExpression>, ty: ClrType) -> SqlExpression {
        let nullable = any_nullable(&args);
        let mut strftime_args = vec![self.text(f, SQLITE_DATETIME_FORMAT)];
        strftime_args.extend(args);
        let formatted = f.function("strftime", strftime_args, ClrType::String, nullable);
        let zeros = f.function("rtrim", vec![formatted, self.text(f, "0")], ClrType::String, nullable);
        let trimmed = f.function("rtrim", vec![zeros, self.text(f, ".")], ClrType::String, nullable);
        let mapping = f.find_mapping(&ty);
        match trimmed {
            SqlExpression::Function {
                name, args, niladic, ..
            } => SqlExpression::Function {
                name,
                args,
                niladic,
                nullable,
                ty: if nullable { ty.make_nullable() } else { ty },
                mapping,
            },
            other => other,
        }
    }

    fn sqlite_part(&self, f: &SqlExpressionFactory, x: SqlExpression, format: &str) -> SqlExpression {
        let nullable = x.is_nullable();
        let part = f.function("strftime", vec![self.text(f, format), x], ClrType::String, nullable);
        self.int_result(f, part, nullable)
    }

    fn postgres_part(&self, f: &SqlExpressionFactory, x: SqlExpression, field: &str) -> SqlExpression {
        let nullable = x.is_nullable();
        let part = f.function("date_part", vec![self.text(f, field), x], ClrType::Float64, nullable);
        self.int_result(f, part, nullable)
    }

    fn sqlserver_part(&self, f: &SqlExpressionFactory, x: SqlExpression, datepart: &str) -> SqlExpression {
        let nullable = x.is_nullable();
        let ty = if nullable { ClrType::Int32.make_nullable() } else { ClrType::Int32 };
        f.function("DATEPART", vec![f.fragment(datepart), x], ty, nullable)
    }

    fn member(&self, f: &SqlExpressionFactory, x: SqlExpression, member: &str) -> Option<SqlExpression> {
        let date_ty = x.ty().unwrap_nullable().clone();
        let one = || f.constant(Value::Int(1), ClrType::Int32);
        let thousand = || f.constant(Value::Int(1000), ClrType::Int32);
        match self.dialect {
            Dialect::Sqlite => {
                let format = match member {
                    "Year" => "%Y",
                    "Month" => "%m",
                    "Day" => "%d",
                    "Hour" => "%H",
                    "Minute" => "%M",
                    "Second" => "%S",
                    "DayOfYear" => "%j",
                    "DayOfWeek" => "%w",
                    "Millisecond" => {
                        let nullable = x.is_nullable();
                        let seconds = f.function("strftime", vec![self.text(f, "%f"), x], ClrType::String, nullable);
                        let millis = f.binary(
                            SqlBinaryOperator::Multiply,
                            f.convert(seconds, ClrType::Float64),
                            f.constant(Value::Float(1000.0), ClrType::Float64),
                        );
                        let millis = self.int_result(f, millis, nullable);
                        return Some(f.binary(SqlBinaryOperator::Modulo, millis, thousand()));
                    }
                    "Ticks" => {
                        let nullable = x.is_nullable();
                        let julian = f.function("julianday", vec![x], ClrType::Float64, nullable);
                        let since_epoch = f.binary(
                            SqlBinaryOperator::Subtract,
                            julian,
                            f.constant(Value::Float(1_721_425.5), ClrType::Float64),
                        );
                        let ticks = f.binary(
                            SqlBinaryOperator::Multiply,
                            since_epoch,
                            f.constant(Value::Float(864_000_000_000.0), ClrType::Float64),
                        );
                        let ty = if nullable { ClrType::Int64.make_nullable() } else { ClrType::Int64 };
                        return Some(f.convert(ticks, ty));
                    }
                    "Date" => {
                        return Some(self.sqlite_datetime(f, vec![x, self.text(f, "start of day")], date_ty));
                    }
                    _ => return None,
                };
                Some(self.sqlite_part(f, x, format))
            }
            Dialect::Postgres => {
                let field = match member {
                    "Year" => "year",
                    "Month" => "month",
                    "Day" => "day",
                    "Hour" => "hour",
                    "Minute" => "minute",
                    "DayOfYear" => "doy",
                    "DayOfWeek" => "dow",
                    "Second" => {
                        let nullable = x.is_nullable();
                        let part = f.function("date_part", vec![self.text(f, "second"), x], ClrType::Float64, nullable);
                        let floored = f.function("floor", vec![part], ClrType::Float64, nullable);
                        return Some(self.int_result(f, floored, nullable));
                    }
                    "Millisecond" => {
                        let nullable = x.is_nullable();
                        let part =
                            f.function("date_part", vec![self.text(f, "milliseconds"), x], ClrType::Float64, nullable);
                        let floored = f.function("floor", vec![part], ClrType::Float64, nullable);
                        let millis = self.int_result(f, floored, nullable);
                        return Some(f.binary(SqlBinaryOperator::Modulo, millis, thousand()));
                    }
                    "Date" => {
                        let nullable = x.is_nullable();
                        let mapping = x.type_mapping().cloned();
                        return Some(f.function_with_mapping(
                            "date_trunc",
                            vec![self.text(f, "day"), x.clone()],
                            x.ty(),
                            nullable,
                            mapping,
                        ));
                    }
                    _ => return None,
                };
                Some(self.postgres_part(f, x, field))
            }
            Dialect::SqlServer => {
                let datepart = match member {
                    "Year" => "year",
                    "Month" => "month",
                    "Day" => "day",
                    "Hour" => "hour",
                    "Minute" => "minute",
                    "Second" => "second",
                    "Millisecond" => "millisecond",
                    "DayOfYear" => "dayofyear",
                    "DayOfWeek" => {
                        let weekday = self.sqlserver_part(f, x, "weekday");
                        return Some(f.binary(SqlBinaryOperator::Subtract, weekday, one()));
                    }
                    "Date" => {
                        let nullable = x.is_nullable();
                        let mapping = x.type_mapping().cloned();
                        let ty = x.ty();
                        return Some(f.function_with_mapping("CONVERT", vec![f.fragment("date"), x], ty, nullable, mapping));
                    }
                    _ => return None,
                };
                Some(self.sqlserver_part(f, x, datepart))
            }
        }
    }

    fn now(&self, f: &SqlExpressionFactory, member: &str) -> Option<SqlExpression> {
        let ty = ClrType::DateTime;
        match (self.dialect, member) {
            (Dialect::Sqlite, "Now") => Some(self.sqlite_datetime(f, vec![self.text(f, "now"), self.text(f, "localtime")], ty)),
            (Dialect::Sqlite, "UtcNow") => Some(self.sqlite_datetime(f, vec![self.text(f, "now")], ty)),
            (Dialect::Sqlite, "Today") => Some(self.sqlite_datetime(
                f,
                vec![self.text(f, "now"), self.text(f, "localtime"), self.text(f, "start of day")],
                ty,
            )),
            (Dialect::Postgres, "Now") => Some(f.function("now", vec![], ty, false)),
            (Dialect::Postgres, "UtcNow") => {
                let now = f.function("now", vec![], ty.clone(), false);
                Some(f.function("timezone", vec![self.text(f, "UTC"), now], ty, false))
            }
            (Dialect::Postgres, "Today") => {
                let now = f.function("now", vec![], ty.clone(), false);
                Some(f.function("date_trunc", vec![self.text(f, "day"), now], ty, false))
            }
            (Dialect::SqlServer, "Now") => Some(f.function("GETDATE", vec![], ty, false)),
            (Dialect::SqlServer, "UtcNow") => Some(f.function("GETUTCDATE", vec![], ty, false)),
            (Dialect::SqlServer, "Today") => {
                let now = f.function("GETDATE", vec![], ty.clone(), false);
                Some(f.function("CONVERT", vec![f.fragment("date"), now], ty, false))
            }
            _ => None,
        }
    }

    fn add(&self, f: &SqlExpressionFactory, x: SqlExpression, method: &str, amount: SqlExpression) -> Option<SqlExpression> {
        let unit = match method {
            "AddYears" => "years",
            "AddMonths" => "months",
            "AddDays" => "days",
            "AddHours" => "hours",
            "AddMinutes" => "minutes",
            "AddSeconds" => "seconds",
            _ => return None,
        };
        let ty = x.ty();
        match self.dialect {
            Dialect::Sqlite => {
                let modifier = f.binary(
                    SqlBinaryOperator::Add,
                    f.convert(amount, ClrType::String),
                    self.text(f, &format!(" {}", unit)),
                );
                let date_ty = ty.unwrap_nullable().clone();
                Some(self.sqlite_datetime(f, vec![x, modifier], date_ty))
            }
            Dialect::Postgres => {
                let mapping = x.type_mapping().cloned();
                let amount = f.apply_default_type_mapping(amount);
                let interval = SqlExpression::Binary {
                    op: SqlBinaryOperator::Multiply,
                    left: Box::new(amount),
                    right: Box::new(f.fragment(&format!("INTERVAL '1 {}'", unit))),
                    ty: ty.clone(),
                    mapping: mapping.clone(),
                };
                Some(SqlExpression::Binary {
                    op: SqlBinaryOperator::Add,
                    left: Box::new(x),
                    right: Box::new(interval),
                    ty,
                    mapping,
                })
            }
            Dialect::SqlServer => {
                let datepart = unit.trim_end_matches('s');
                let nullable = x.is_nullable() || amount.is_nullable();
                let mapping = x.type_mapping().cloned();
                let amount = f.convert(amount, ClrType::Int32);
                Some(f.function_with_mapping("DATEADD", vec![f.fragment(datepart), amount, x], ty, nullable, mapping))
            }
        }
    }
}

fn is_date(expr: &SqlExpression) -> bool {
    matches!(expr.ty().unwrap_nullable(), ClrType::DateTime | ClrType::Date)
}

impl MemberTranslator for DateTimeTranslator {
    fn translate(
        &self,
        f: &SqlExpressionFactory,
        instance: Option<&SqlExpression>,
        declaring: &DeclaringType,
        member: &str,
    ) -> Option<SqlExpression> {
        if *declaring != DeclaringType::DateTime {
            return None;
        }
        match instance {
            Some(x) if is_date(x) => self.member(f, x.clone(), member),
            Some(_) => None,
            None => self.now(f, member),
        }
    }
}

impl MethodCallTranslator for DateTimeTranslator {
    fn translate(
        &self,
        f: &SqlExpressionFactory,
        instance: Option<&SqlExpression>,
        method: &MethodRef,
        args: &[SqlExpression],
    ) -> Option<SqlExpression> {
        if method.declaring != DeclaringType::DateTime {
            return None;
        }
        match (instance, args) {
            (Some(x), [amount]) if is_date(x) => self.add(f, x.clone(), &method.name, amount.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RelationalTypeMappingSource;
    use std::sync::Arc;
    use test_case::test_case;

    fn published() -> SqlExpression {
        SqlExpression::Column {
            name: "Published".into(),
            table: "p".into(),
            ty: ClrType::DateTime,
            mapping: None,
            nullable: false,
        }
    }

    fn member(dialect: Dialect, name: &str) -> Option<SqlExpression> {
        let f = SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(dialect)), false);
        MemberTranslator::translate(
            &DateTimeTranslator::new(dialect),
            &f,
            Some(&published()),
            &DeclaringType::DateTime,
            name,
        )
    }

    fn function_names(expr: &SqlExpression) -> Vec<String> {
        let mut names = Vec::new();
        expr.visit(&mut |e| {
            if let SqlExpression::Function { name, .. } = e {
                names.push(name.clone());
            }
        });
        names
    }

    #[test_case(Dialect::Sqlite, "strftime")]
    #[test_case(Dialect::Postgres, "date_part")]
    #[test_case(Dialect::SqlServer, "DATEPART")]
    fn year_uses_dialect_primitive(dialect: Dialect, expected: &str) {
        let year = member(dialect, "Year").expect("Year translates");
        assert_eq!(year.ty(), ClrType::Int32);
        assert!(function_names(&year).iter().any(|n| n == expected));
    }

    #[test]
    fn sqlite_date_trims_fractional_seconds() {
        let date = member(Dialect::Sqlite, "Date").expect("Date translates");
        let names = function_names(&date);
        assert_eq!(names.first().map(String::as_str), Some("rtrim"));
        assert!(names.iter().any(|n| n == "strftime"));
    }

    #[test]
    fn ticks_only_on_sqlite() {
        assert!(member(Dialect::Sqlite, "Ticks").is_some());
        assert!(member(Dialect::Postgres, "Ticks").is_none());
        assert!(member(Dialect::SqlServer, "Ticks").is_none());
    }

    #[test]
    fn sqlserver_add_days_uses_dateadd() {
        let f = SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(Dialect::SqlServer)), false);
        let added = MethodCallTranslator::translate(
            &DateTimeTranslator::new(Dialect::SqlServer),
            &f,
            Some(&published()),
            &MethodRef::new(DeclaringType::DateTime, "AddDays"),
            &[f.constant(Value::Int(3), ClrType::Int32)],
        );
        assert!(matches!(added, Some(SqlExpression::Function { ref name, .. }) if name == "DATEADD"));
    }
}
