use super::any_nullable;
use crate::options::Dialect;
use crate::query::{DeclaringType, MethodRef};
use crate::sql::{SqlBinaryOperator, SqlExpression, SqlExpressionFactory};
use crate::translate::registry::{MemberTranslator, MethodCallTranslator};
use crate::value::{ClrType, Value};

const LIKE_ESCAPE: char = '\\';

/// String methods, `string.Length` and `ToString()`.
pub struct StringTranslator {
    dialect: Dialect,
}

impl StringTranslator {
    pub fn new(dialect: Dialect) -> Self {
        StringTranslator { dialect }
    }

    fn name(&self, sqlite: &'static str, postgres: &'static str, sqlserver: &'static str) -> &'static str {
        match self.dialect {
            Dialect::Sqlite => sqlite,
            Dialect::Postgres => postgres,
            Dialect::SqlServer => sqlserver,
        }
    }

    fn string_fn(&self, f: &SqlExpressionFactory, name: &str, args: Vec<SqlExpression>) -> SqlExpression {
        let nullable = any_nullable(&args);
        let mapping = args.first().and_then(|a| a.type_mapping().cloned());
        f.function_with_mapping(name, args, ClrType::String, nullable, mapping)
    }

    fn int_fn(&self, f: &SqlExpressionFactory, name: &str, args: Vec<SqlExpression>) -> SqlExpression {
        let nullable = any_nullable(&args);
        let ty = if nullable { ClrType::Int32.make_nullable() } else { ClrType::Int32 };
        f.function(name, args, ty, nullable)
    }

    fn length(&self, f: &SqlExpressionFactory, s: SqlExpression) -> SqlExpression {
        self.int_fn(f, self.name("length", "length", "LEN"), vec![s])
    }

    /// 1-based position of `needle` in `haystack`, 0 when absent.
    fn position(&self, f: &SqlExpressionFactory, haystack: SqlExpression, needle: SqlExpression) -> SqlExpression {
        match self.dialect {
            Dialect::Sqlite => self.int_fn(f, "instr", vec![haystack, needle]),
            Dialect::Postgres => self.int_fn(f, "strpos", vec![haystack, needle]),
            Dialect::SqlServer => self.int_fn(f, "CHARINDEX", vec![needle, haystack]),
        }
    }

    fn one(&self, f: &SqlExpressionFactory) -> SqlExpression {
        f.constant(Value::Int(1), ClrType::Int32)
    }

    fn empty(&self, f: &SqlExpressionFactory) -> SqlExpression {
        f.constant(Value::Text(String::new()), ClrType::String)
    }

    /// `LIKE` with a pattern built from a constant, escaping wildcard characters.
    fn like_constant(
        &self,
        f: &SqlExpressionFactory,
        item: SqlExpression,
        prefix: &str,
        text: &str,
        suffix: &str,
    ) -> SqlExpression {
        let needs_escape = text.contains(|c: char| matches!(c, '%' | '_') || c == LIKE_ESCAPE);
        let escaped: String = text
            .chars()
            .flat_map(|c| {
                if matches!(c, '%' | '_') || c == LIKE_ESCAPE {
                    vec![LIKE_ESCAPE, c]
                } else {
                    vec![c]
                }
            })
            .collect();
        let pattern = f.constant(Value::Text(format!("{}{}{}", prefix, escaped, suffix)), ClrType::String);
        let escape = needs_escape.then(|| f.constant(Value::Text(LIKE_ESCAPE.to_string()), ClrType::String));
        f.like(item, pattern, escape)
    }

    fn starts_with(&self, f: &SqlExpressionFactory, item: SqlExpression, prefix: SqlExpression) -> SqlExpression {
        if let SqlExpression::Constant { value: Value::Text(text), .. } = &prefix {
            return self.like_constant(f, item, "", text, "%");
        }
        let length = self.length(f, prefix.clone());
        let head = match self.dialect {
            Dialect::Sqlite => self.string_fn(f, "substr", vec![item, self.one(f), length]),
            _ => self.string_fn(f, "LEFT", vec![item, length]),
        };
        f.or(f.equal(head, prefix.clone()), f.equal(prefix, self.empty(f)))
    }

    fn ends_with(&self, f: &SqlExpressionFactory, item: SqlExpression, suffix: SqlExpression) -> SqlExpression {
        if let SqlExpression::Constant { value: Value::Text(text), .. } = &suffix {
            return self.like_constant(f, item, "%", text, "");
        }
        let length = self.length(f, suffix.clone());
        let tail = match self.dialect {
            Dialect::Sqlite => self.string_fn(f, "substr", vec![item, f.negate(length)]),
            _ => self.string_fn(f, "RIGHT", vec![item, length]),
        };
        f.or(f.equal(tail, suffix.clone()), f.equal(suffix, self.empty(f)))
    }

    fn contains(&self, f: &SqlExpressionFactory, item: SqlExpression, needle: SqlExpression) -> SqlExpression {
        if let SqlExpression::Constant { value: Value::Text(text), .. } = &needle {
            return self.like_constant(f, item, "%", text, "%");
        }
        let found = f.binary(
            SqlBinaryOperator::GreaterThan,
            self.position(f, item, needle.clone()),
            f.constant(Value::Int(0), ClrType::Int32),
        );
        f.or(found, f.equal(needle, self.empty(f)))
    }

    fn trim(&self, f: &SqlExpressionFactory, method: &str, item: SqlExpression, args: &[SqlExpression]) -> Option<SqlExpression> {
        let (sqlite, postgres) = match method {
            "Trim" => ("trim", "btrim"),
            "TrimStart" => ("ltrim", "ltrim"),
            "TrimEnd" => ("rtrim", "rtrim"),
            _ => return None,
        };
        match (self.dialect, args) {
            (Dialect::SqlServer, []) => Some(match method {
                "Trim" => {
                    let right = self.string_fn(f, "RTRIM", vec![item]);
                    self.string_fn(f, "LTRIM", vec![right])
                }
                "TrimStart" => self.string_fn(f, "LTRIM", vec![item]),
                _ => self.string_fn(f, "RTRIM", vec![item]),
            }),
            (Dialect::SqlServer, _) => None,
            (Dialect::Sqlite, []) => Some(self.string_fn(f, sqlite, vec![item])),
            (Dialect::Postgres, []) => Some(self.string_fn(f, postgres, vec![item])),
            (Dialect::Sqlite, [chars]) if chars.is_constant() => Some(self.string_fn(f, sqlite, vec![item, chars.clone()])),
            (Dialect::Postgres, [chars]) if chars.is_constant() => {
                Some(self.string_fn(f, postgres, vec![item, chars.clone()]))
            }
            _ => None,
        }
    }

    fn substring(&self, f: &SqlExpressionFactory, item: SqlExpression, args: &[SqlExpression]) -> Option<SqlExpression> {
        let start = f.binary(SqlBinaryOperator::Add, args.first()?.clone(), self.one(f));
        let name = self.name("substr", "substring", "SUBSTRING");
        match (args.get(1), self.dialect) {
            (Some(length), _) => Some(self.string_fn(f, name, vec![item, start, length.clone()])),
            (None, Dialect::SqlServer) => {
                let length = self.length(f, item.clone());
                Some(self.string_fn(f, name, vec![item, start, length]))
            }
            (None, _) => Some(self.string_fn(f, name, vec![item, start])),
        }
    }
}

impl MethodCallTranslator for StringTranslator {
    fn translate(
        &self,
        f: &SqlExpressionFactory,
        instance: Option<&SqlExpression>,
        method: &MethodRef,
        args: &[SqlExpression],
    ) -> Option<SqlExpression> {
        if method.name == "ToString" && args.is_empty() {
            return Some(f.convert(instance?.clone(), ClrType::String));
        }
        if method.declaring != DeclaringType::String {
            return None;
        }
        let Some(item) = instance.cloned() else {
            return match (method.name.as_str(), args) {
                ("IsNullOrEmpty", [s]) => Some(f.or(f.is_null(s.clone()), f.equal(s.clone(), self.empty(f)))),
                ("IsNullOrWhiteSpace", [s]) => {
                    let trimmed = self.trim(f, "Trim", s.clone(), &[])?;
                    Some(f.or(f.is_null(s.clone()), f.equal(trimmed, self.empty(f))))
                }
                ("Concat", [first, rest @ ..]) => Some(
                    rest.iter()
                        .fold(first.clone(), |acc, a| f.binary(SqlBinaryOperator::Add, acc, a.clone())),
                ),
                _ => None,
            };
        };
        match (method.name.as_str(), args) {
            ("Contains", [needle]) => Some(self.contains(f, item, needle.clone())),
            ("StartsWith", [prefix]) => Some(self.starts_with(f, item, prefix.clone())),
            ("EndsWith", [suffix]) => Some(self.ends_with(f, item, suffix.clone())),
            ("ToUpper", []) => Some(self.string_fn(f, self.name("upper", "upper", "UPPER"), vec![item])),
            ("ToLower", []) => Some(self.string_fn(f, self.name("lower", "lower", "LOWER"), vec![item])),
            ("Trim" | "TrimStart" | "TrimEnd", _) => self.trim(f, &method.name, item, args),
            ("Substring", [_] | [_, _]) => self.substring(f, item, args),
            ("Replace", [from, to]) => Some(self.string_fn(
                f,
                self.name("replace", "replace", "REPLACE"),
                vec![item, from.clone(), to.clone()],
            )),
            ("IndexOf", [needle]) => Some(f.binary(
                SqlBinaryOperator::Subtract,
                self.position(f, item, needle.clone()),
                self.one(f),
            )),
            _ => None,
        }
    }
}

impl MemberTranslator for StringTranslator {
    fn translate(
        &self,
        f: &SqlExpressionFactory,
        instance: Option<&SqlExpression>,
        declaring: &DeclaringType,
        member: &str,
    ) -> Option<SqlExpression> {
        match (declaring, member, instance) {
            (DeclaringType::String, "Length", Some(s)) => Some(self.length(f, s.clone())),
            (DeclaringType::String, "Empty", None) => Some(self.empty(f)),
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

    fn name_column() -> SqlExpression {
        SqlExpression::Column {
            name: "Name".into(),
            table: "b".into(),
            ty: ClrType::String,
            mapping: None,
            nullable: true,
        }
    }

    fn translate(dialect: Dialect, method: &str, args: Vec<SqlExpression>) -> Option<SqlExpression> {
        let f = SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(dialect)), false);
        MethodCallTranslator::translate(
            &StringTranslator::new(dialect),
            &f,
            Some(&name_column()),
            &MethodRef::new(DeclaringType::String, method),
            &args,
        )
    }

    #[test]
    fn constant_prefix_becomes_escaped_like() {
        let arg = SqlExpression::Constant {
            value: Value::from("50%_"),
            ty: ClrType::String,
            mapping: None,
        };
        let Some(SqlExpression::Like { pattern, escape, .. }) = translate(Dialect::Sqlite, "StartsWith", vec![arg]) else {
            panic!("expected LIKE");
        };
        assert!(matches!(*pattern, SqlExpression::Constant { value: Value::Text(ref p), .. } if p == "50\\%\\_%"));
        assert!(escape.is_some());
    }

    #[test_case(Dialect::Sqlite, "upper")]
    #[test_case(Dialect::Postgres, "upper")]
    #[test_case(Dialect::SqlServer, "UPPER")]
    fn to_upper_per_dialect(dialect: Dialect, expected: &str) {
        let translated = translate(dialect, "ToUpper", vec![]);
        assert!(matches!(translated, Some(SqlExpression::Function { ref name, .. }) if name == expected));
    }

    #[test]
    fn unknown_string_method_declines() {
        assert!(translate(Dialect::Sqlite, "PadLeft", vec![]).is_none());
    }
}
