use crate::query::{DeclaringType, MethodRef};
use crate::sql::{SqlBinaryOperator, SqlExpression, SqlExpressionFactory};
use crate::translate::registry::MethodCallTranslator;

/// `a.Equals(b)` and `object.Equals(a, b)`. Operands of different types never compare equal.
pub struct EqualsTranslator;

impl MethodCallTranslator for EqualsTranslator {
    fn translate(
        &self,
        factory: &SqlExpressionFactory,
        instance: Option<&SqlExpression>,
        method: &MethodRef,
        args: &[SqlExpression],
    ) -> Option<SqlExpression> {
        if method.name != "Equals" {
            return None;
        }
        let (left, right) = match (instance, args) {
            (Some(i), [other]) => (i, other),
            (None, [a, b]) => (a, b),
            _ => return None,
        };
        Some(factory.equals_method(left.clone(), right.clone()))
    }
}

/// `flags.HasFlag(flag)` as `(flags & flag) = flag`, for operands of the same enum type.
pub struct HasFlagTranslator;

impl MethodCallTranslator for HasFlagTranslator {
    fn translate(
        &self,
        factory: &SqlExpressionFactory,
        instance: Option<&SqlExpression>,
        method: &MethodRef,
        args: &[SqlExpression],
    ) -> Option<SqlExpression> {
        if !method.is(&DeclaringType::Enum, "HasFlag") {
            return None;
        }
        let instance = instance?;
        let [flag] = args else {
            return None;
        };
        let same_enum = match (instance.ty().as_enum(), flag.ty().as_enum()) {
            (Some(a), Some(b)) => a.name == b.name,
            _ => false,
        };
        if !same_enum {
            return None;
        }
        let masked = factory.binary(SqlBinaryOperator::BitAnd, instance.clone(), flag.clone());
        Some(factory.equal(masked, flag.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Dialect;
    use crate::storage::RelationalTypeMappingSource;
    use crate::value::{ClrType, EnumType, Value};
    use std::sync::Arc;

    fn factory() -> SqlExpressionFactory {
        SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(Dialect::Sqlite)), false)
    }

    fn flags(name: &str) -> ClrType {
        ClrType::Enum(Arc::new(EnumType {
            name: name.into(),
            underlying: ClrType::Int32,
            flags: true,
            members: vec![("Read".into(), 1), ("Write".into(), 2)],
        }))
    }

    fn column(ty: ClrType) -> SqlExpression {
        SqlExpression::Column {
            name: "Access".into(),
            table: "u".into(),
            ty,
            mapping: None,
            nullable: false,
        }
    }

    #[test]
    fn has_flag_masks_and_compares() {
        let f = factory();
        let method = MethodRef::new(DeclaringType::Enum, "HasFlag");
        let flag = f.constant(Value::Int(2), flags("Access"));
        let translated = HasFlagTranslator
            .translate(&f, Some(&column(flags("Access"))), &method, &[flag])
            .expect("same enum type translates");
        let SqlExpression::Binary { op, left, .. } = translated else {
            panic!("expected a comparison");
        };
        assert_eq!(op, SqlBinaryOperator::Equal);
        assert!(matches!(*left, SqlExpression::Binary { op: SqlBinaryOperator::BitAnd, .. }));
    }

    #[test]
    fn has_flag_declines_mismatched_enums() {
        let f = factory();
        let method = MethodRef::new(DeclaringType::Enum, "HasFlag");
        let flag = f.constant(Value::Int(2), flags("Color"));
        assert!(HasFlagTranslator
            .translate(&f, Some(&column(flags("Access"))), &method, &[flag])
            .is_none());
    }

    #[test]
    fn equals_across_types_is_false() {
        let f = factory();
        let method = MethodRef::new(DeclaringType::Object, "Equals");
        let a = column(ClrType::Int32);
        let b = f.constant(Value::from("1"), ClrType::String);
        let translated = EqualsTranslator.translate(&f, None, &method, &[a, b]);
        assert_eq!(translated.and_then(|e| e.as_bool_constant()), Some(false));
    }
}
