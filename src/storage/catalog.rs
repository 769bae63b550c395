//! Static per-dialect type-mapping catalogs.

use super::mapping::*;
use crate::model::{Property, ValueConverter};
use crate::options::Dialect;
use crate::value::ClrType;
use regex::Regex;
use std::sync::Arc;

/// Looks up type mappings for CLR types and explicit store types.
pub trait TypeMappingSource: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Canonical mapping for `clr_type`, or the mapping of an explicit `store_type`.
    fn find_mapping(&self, clr_type: &ClrType, store_type: Option<&str>) -> Option<TypeMapping>;

    /// Mapping for a property, applying its configured converter (or the catalog's default one).
    fn find_mapping_for_property(&self, property: &Property) -> Option<TypeMapping> {
        let model_type = property.clr_type.unwrap_nullable().clone();
        match &property.converter {
            Some(converter) => {
                let provider = converter.provider_type(&model_type);
                let base = self.find_mapping(&provider, property.store_type.as_deref())?;
                Some(Arc::new(base.with_converter(model_type, converter.clone())))
            }
            None => self.find_mapping(&model_type, property.store_type.as_deref()),
        }
    }
}

const STORE_TYPE_PATTERN: &str =
    r"^\s*([A-Za-z][A-Za-z0-9_ ]*?)\s*(?:\(\s*(max|MAX|\d+)\s*(?:,\s*(\d+)\s*)?\))?\s*$";

struct CatalogEntry {
    clr_type: ClrType,
    /// Store type names this entry answers to; the first one is canonical.
    store_types: &'static [&'static str],
    canonical: &'static str,
    literal: LiteralStyle,
    default_converter: Option<ValueConverter>,
}

/// Catalog-backed mapping source for one dialect.
pub struct RelationalTypeMappingSource {
    dialect: Dialect,
    entries: Vec<CatalogEntry>,
    store_type_pattern: Option<Regex>,
}

impl RelationalTypeMappingSource {
    pub fn new(dialect: Dialect) -> Self {
        let entries = match dialect {
            Dialect::Sqlite => sqlite_catalog(),
            Dialect::Postgres => postgres_catalog(),
            Dialect::SqlServer => sqlserver_catalog(),
        };
        RelationalTypeMappingSource {
            dialect,
            entries,
            store_type_pattern: Regex::new(STORE_TYPE_PATTERN).ok(),
        }
    }

    fn build(&self, entry: &CatalogEntry, clr_type: &ClrType) -> RelationalTypeMapping {
        let mut mapping = RelationalTypeMapping::new(entry.clr_type.clone(), entry.canonical, entry.literal.clone());
        if let Some(base) = self.parse_store_type(entry.canonical) {
            mapping.store_type_base = base.0;
            mapping.size = base.1;
            mapping.precision = base.1;
            mapping.scale = base.2;
        }
        match (&entry.default_converter, clr_type) {
            (_, ClrType::Enum(_)) => mapping.with_clr_type(clr_type.clone()),
            (Some(conv), _) => mapping.with_converter(clr_type.clone(), conv.clone()),
            (None, _) => mapping,
        }
    }

    /// Splits `decimal(18,2)` into base name and facets.
    fn parse_store_type(&self, store_type: &str) -> Option<(String, Option<u32>, Option<u32>)> {
        let caps = self.store_type_pattern.as_ref()?.captures(store_type)?;
        let base = caps.get(1)?.as_str().trim().to_lowercase();
        let first = caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok());
        let second = caps.get(3).and_then(|m| m.as_str().parse::<u32>().ok());
        Some((base, first, second))
    }

    fn entry_for_clr(&self, clr_type: &ClrType) -> Option<&CatalogEntry> {
        let lookup = match clr_type.unwrap_nullable() {
            ClrType::Enum(e) => e.underlying.clone(),
            other => other.clone(),
        };
        self.entries.iter().find(|e| e.clr_type == lookup)
    }
}

impl TypeMappingSource for RelationalTypeMappingSource {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn find_mapping(&self, clr_type: &ClrType, store_type: Option<&str>) -> Option<TypeMapping> {
        let clr = clr_type.unwrap_nullable();
        let Some(store_type) = store_type else {
            let entry = self.entry_for_clr(clr)?;
            return Some(Arc::new(self.build(entry, clr)));
        };
        let (base, first, second) = self.parse_store_type(store_type)?;
        let lookup = match clr {
            ClrType::Enum(e) => e.underlying.clone(),
            other => other.clone(),
        };
        let entry = self
            .entries
            .iter()
            .find(|e| e.clr_type == lookup && e.store_types.iter().any(|s| s.eq_ignore_ascii_case(&base)))
            .or_else(|| self.entry_for_clr(clr))?;
        let mut mapping = self.build(entry, clr);
        mapping.store_type = store_type.trim().to_string();
        mapping.store_type_base = base;
        mapping.size = first;
        mapping.precision = first;
        mapping.scale = second;
        Some(Arc::new(mapping))
    }
}

fn entry(
    clr_type: ClrType,
    store_types: &'static [&'static str],
    literal: LiteralStyle,
    default_converter: Option<ValueConverter>,
) -> CatalogEntry {
    CatalogEntry {
        clr_type,
        canonical: store_types[0],
        store_types,
        literal,
        default_converter,
    }
}

fn sqlite_catalog() -> Vec<CatalogEntry> {
    let text = LiteralStyle::Text { national: false };
    vec![
        entry(ClrType::Bool, &["INTEGER"], LiteralStyle::Integer, Some(ValueConverter::BoolToInt)),
        entry(ClrType::Int16, &["INTEGER"], LiteralStyle::Integer, None),
        entry(ClrType::Int32, &["INTEGER", "int"], LiteralStyle::Integer, None),
        entry(ClrType::Int64, &["INTEGER", "bigint"], LiteralStyle::Integer, None),
        entry(ClrType::Float64, &["REAL", "double", "float"], LiteralStyle::Real, None),
        entry(ClrType::Decimal, &["TEXT", "decimal", "numeric"], text.clone(), None),
        entry(ClrType::String, &["TEXT", "varchar", "nvarchar", "char"], text.clone(), None),
        entry(ClrType::Bytes, &["BLOB"], LiteralStyle::Blob(BlobLiteral::XQuoted), None),
        entry(ClrType::Guid, &["TEXT"], text.clone(), Some(ValueConverter::GuidToString)),
        entry(
            ClrType::DateTime,
            &["TEXT", "datetime"],
            LiteralStyle::DateTime {
                prefix: "",
                format: "%Y-%m-%d %H:%M:%S%.f",
            },
            None,
        ),
        entry(ClrType::Date, &["TEXT", "date"], LiteralStyle::Date { prefix: "" }, None),
        entry(ClrType::Json, &["TEXT", "json"], LiteralStyle::Json { suffix: "" }, None),
    ]
}

fn postgres_catalog() -> Vec<CatalogEntry> {
    let text = LiteralStyle::Text { national: false };
    vec![
        entry(ClrType::Bool, &["boolean", "bool"], LiteralStyle::Bool(BoolLiteral::Keyword), None),
        entry(ClrType::Int16, &["smallint", "int2"], LiteralStyle::Integer, None),
        entry(ClrType::Int32, &["integer", "int", "int4", "serial"], LiteralStyle::Integer, None),
        entry(ClrType::Int64, &["bigint", "int8", "bigserial"], LiteralStyle::Integer, None),
        entry(ClrType::Float64, &["double precision", "float8"], LiteralStyle::Real, None),
        entry(ClrType::Decimal, &["numeric", "decimal", "money"], LiteralStyle::Decimal, None),
        entry(ClrType::String, &["text", "varchar", "character varying", "char", "citext"], text, None),
        entry(ClrType::Bytes, &["bytea"], LiteralStyle::Blob(BlobLiteral::Bytea), None),
        entry(ClrType::Guid, &["uuid"], LiteralStyle::Guid { suffix: "::uuid" }, None),
        entry(
            ClrType::DateTime,
            &["timestamp without time zone", "timestamp", "timestamptz", "timestamp with time zone"],
            LiteralStyle::DateTime {
                prefix: "TIMESTAMP ",
                format: "%Y-%m-%dT%H:%M:%S%.f",
            },
            None,
        ),
        entry(ClrType::Date, &["date"], LiteralStyle::Date { prefix: "DATE " }, None),
        entry(ClrType::Json, &["jsonb", "json"], LiteralStyle::Json { suffix: "::jsonb" }, None),
    ]
}

fn sqlserver_catalog() -> Vec<CatalogEntry> {
    let ntext = LiteralStyle::Text { national: true };
    vec![
        entry(ClrType::Bool, &["bit"], LiteralStyle::Bool(BoolLiteral::BitCast), None),
        entry(ClrType::Int16, &["smallint"], LiteralStyle::Integer, None),
        entry(ClrType::Int32, &["int"], LiteralStyle::Integer, None),
        entry(ClrType::Int64, &["bigint"], LiteralStyle::Integer, None),
        entry(ClrType::Float64, &["float", "real"], LiteralStyle::Real, None),
        entry(ClrType::Decimal, &["decimal(18,2)", "decimal", "numeric", "money"], LiteralStyle::Decimal, None),
        entry(ClrType::String, &["nvarchar(max)", "nvarchar", "nchar", "ntext"], ntext.clone(), None),
        entry(ClrType::String, &["varchar", "char", "text"], LiteralStyle::Text { national: false }, None),
        entry(ClrType::Bytes, &["varbinary(max)", "varbinary", "binary"], LiteralStyle::Blob(BlobLiteral::HexPrefixed), None),
        entry(ClrType::Guid, &["uniqueidentifier"], LiteralStyle::Guid { suffix: "" }, None),
        entry(
            ClrType::DateTime,
            &["datetime2", "datetime", "smalldatetime"],
            LiteralStyle::DateTime {
                prefix: "",
                format: "%Y-%m-%dT%H:%M:%S%.7f",
            },
            None,
        ),
        entry(ClrType::Date, &["date"], LiteralStyle::Date { prefix: "" }, None),
        entry(ClrType::Json, &["nvarchar(max)", "nvarchar"], ntext, None),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{EnumType, Value};
    use test_case::test_case;

    #[test_case(Dialect::Sqlite, ClrType::Int32, "INTEGER")]
    #[test_case(Dialect::Postgres, ClrType::Guid, "uuid")]
    #[test_case(Dialect::SqlServer, ClrType::String, "nvarchar(max)")]
    #[test_case(Dialect::SqlServer, ClrType::Decimal, "decimal(18,2)")]
    fn canonical_store_types(dialect: Dialect, clr: ClrType, store: &str) {
        let source = RelationalTypeMappingSource::new(dialect);
        assert_eq!(source.find_mapping(&clr, None).unwrap().store_type, store);
    }

    #[test]
    fn explicit_store_type_keeps_facets() {
        let source = RelationalTypeMappingSource::new(Dialect::SqlServer);
        let m = source.find_mapping(&ClrType::String, Some("varchar(100)")).unwrap();
        assert_eq!(m.store_type, "varchar(100)");
        assert_eq!(m.store_type_base, "varchar");
        assert_eq!(m.size, Some(100));
        assert_eq!(m.generate_sql_literal(&Value::from("a")).unwrap(), "'a'");
        let d = source.find_mapping(&ClrType::Decimal, Some("decimal(10, 4)")).unwrap();
        assert_eq!((d.precision, d.scale), (Some(10), Some(4)));
    }

    #[test]
    fn sqlite_bool_uses_default_converter() {
        let source = RelationalTypeMappingSource::new(Dialect::Sqlite);
        let m = source.find_mapping(&ClrType::Bool.make_nullable(), None).unwrap();
        assert_eq!(m.provider_type(), ClrType::Int32);
        assert_eq!(m.generate_sql_literal(&Value::Bool(true)).unwrap(), "1");
    }

    #[test]
    fn enums_map_to_underlying_integer() {
        let e = Arc::new(EnumType {
            name: "Color".into(),
            underlying: ClrType::Int64,
            flags: false,
            members: vec![("Red".into(), 1)],
        });
        let source = RelationalTypeMappingSource::new(Dialect::Postgres);
        let m = source.find_mapping(&ClrType::Enum(e.clone()), None).unwrap();
        assert_eq!(m.store_type, "bigint");
        assert_eq!(m.clr_type, ClrType::Enum(e));
        assert_eq!(m.generate_sql_literal(&Value::Int(1)).unwrap(), "1");
    }
}
