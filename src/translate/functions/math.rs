use super::any_nullable;
use crate::options::Dialect;
use crate::query::{DeclaringType, MethodRef};
use crate::sql::{SqlExpression, SqlExpressionFactory};
use crate::translate::registry::MethodCallTranslator;
use crate::value::ClrType;

/// `Math.*` functions.
pub struct MathTranslator {
    dialect: Dialect,
}

impl MathTranslator {
    pub fn new(dialect: Dialect) -> Self {
        MathTranslator { dialect }
    }

    fn name(&self, sqlite: &'static str, other: &'static str) -> &'static str {
        match self.dialect {
            Dialect::Sqlite => sqlite,
            Dialect::Postgres | Dialect::SqlServer => other,
        }
    }

    /// A function returning the type (and mapping) of its first argument.
    fn same_type(&self, f: &SqlExpressionFactory, name: &str, args: Vec<SqlExpression>) -> Option<SqlExpression> {
        let first = f.apply_default_type_mapping(args.first()?.clone());
        let ty = first.ty();
        let mapping = first.type_mapping().cloned();
        let nullable = any_nullable(&args);
        Some(f.function_with_mapping(name, args, ty, nullable, mapping))
    }

    fn typed(&self, f: &SqlExpressionFactory, name: &str, args: Vec<SqlExpression>, ty: ClrType) -> SqlExpression {
        let nullable = any_nullable(&args);
        let ty = if nullable { ty.make_nullable() } else { ty };
        f.function(name, args, ty, nullable)
    }

    /// `Math.Max`/`Math.Min`: both operands are unified first so the result carries one mapping.
    fn extremum(&self, f: &SqlExpressionFactory, max: bool, a: &SqlExpression, b: &SqlExpression) -> SqlExpression {
        let (a, b) = f.unify(a.clone(), b.clone());
        let name = match (self.dialect, max) {
            (Dialect::Sqlite, true) => "max",
            (Dialect::Sqlite, false) => "min",
            (_, true) => "GREATEST",
            (_, false) => "LEAST",
        };
        let ty = a.ty();
        let mapping = a.type_mapping().or(b.type_mapping()).cloned();
        let nullable = a.is_nullable() || b.is_nullable();
        f.function_with_mapping(name, vec![a, b], ty, nullable, mapping)
    }

    fn round(&self, f: &SqlExpressionFactory, args: &[SqlExpression]) -> Option<SqlExpression> {
        match (self.dialect, args) {
            (Dialect::SqlServer, [x]) => {
                let zero = f.constant(crate::value::Value::Int(0), ClrType::Int32);
                self.same_type(f, "ROUND", vec![x.clone(), zero])
            }
            (Dialect::Postgres, [x, digits]) => {
                let numeric = f.convert(x.clone(), ClrType::Decimal);
                let rounded = self.typed(f, "ROUND", vec![numeric, digits.clone()], ClrType::Decimal);
                Some(f.convert(rounded, x.ty().unwrap_nullable().clone()))
            }
            (_, [x]) => self.same_type(f, self.name("round", "ROUND"), vec![x.clone()]),
            (_, [x, digits]) => self.same_type(f, self.name("round", "ROUND"), vec![x.clone(), digits.clone()]),
            _ => None,
        }
    }
}

impl MethodCallTranslator for MathTranslator {
    fn translate(
        &self,
        f: &SqlExpressionFactory,
        _instance: Option<&SqlExpression>,
        method: &MethodRef,
        args: &[SqlExpression],
    ) -> Option<SqlExpression> {
        if method.declaring != DeclaringType::Math {
            return None;
        }
        match (method.name.as_str(), args) {
            ("Abs", [x]) => self.same_type(f, self.name("abs", "ABS"), vec![x.clone()]),
            ("Ceiling", [x]) => self.same_type(f, self.name("ceiling", "CEILING"), vec![x.clone()]),
            ("Floor", [x]) => self.same_type(f, self.name("floor", "FLOOR"), vec![x.clone()]),
            ("Round", _) => self.round(f, args),
            ("Max", [a, b]) => Some(self.extremum(f, true, a, b)),
            ("Min", [a, b]) => Some(self.extremum(f, false, a, b)),
            ("Pow", [x, y]) => Some(self.typed(
                f,
                self.name("pow", "POWER"),
                vec![x.clone(), y.clone()],
                ClrType::Float64,
            )),
            ("Sqrt", [x]) => Some(self.typed(f, self.name("sqrt", "SQRT"), vec![x.clone()], ClrType::Float64)),
            ("Sign", [x]) => Some(self.typed(f, self.name("sign", "SIGN"), vec![x.clone()], ClrType::Int32)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RelationalTypeMappingSource;
    use crate::value::Value;
    use std::sync::Arc;

    fn factory(dialect: Dialect) -> SqlExpressionFactory {
        SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(dialect)), false)
    }

    #[test]
    fn max_unifies_operand_types() {
        let f = factory(Dialect::Sqlite);
        let int_column = SqlExpression::Column {
            name: "Rating".into(),
            table: "b".into(),
            ty: ClrType::Int32,
            mapping: f.find_mapping(&ClrType::Int32),
            nullable: false,
        };
        let double = f.constant(Value::Float(2.5), ClrType::Float64);
        let translated = MathTranslator::new(Dialect::Sqlite)
            .translate(&f, None, &MethodRef::new(DeclaringType::Math, "Max"), &[int_column, double])
            .expect("Max translates");
        let SqlExpression::Function { name, args, ty, .. } = translated else {
            panic!("expected a function");
        };
        assert_eq!(name, "max");
        assert_eq!(ty, ClrType::Float64);
        assert!(args.iter().all(|a| a.ty().unwrap_nullable() == &ClrType::Float64));
    }

    #[test]
    fn postgres_uses_greatest() {
        let f = factory(Dialect::Postgres);
        let a = f.constant(Value::Int(1), ClrType::Int32);
        let b = f.constant(Value::Int(2), ClrType::Int32);
        let translated = MathTranslator::new(Dialect::Postgres).translate(
            &f,
            None,
            &MethodRef::new(DeclaringType::Math, "Max"),
            &[a, b],
        );
        assert!(matches!(translated, Some(SqlExpression::Function { ref name, .. }) if name == "GREATEST"));
    }
}
