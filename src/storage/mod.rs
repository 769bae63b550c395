//! Store type mappings per dialect.

pub mod catalog;
pub mod mapping;

pub use catalog::{RelationalTypeMappingSource, TypeMappingSource};
pub use mapping::{BlobLiteral, BoolLiteral, LiteralStyle, RelationalTypeMapping, TypeMapping};
