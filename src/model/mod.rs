//! Metadata model: how entity types, properties and relationships map to tables and columns.

pub mod builder;
pub mod converter;
pub mod loader;
#[allow(clippy::module_inception)]
pub mod model;
pub mod types;
pub mod validator;

pub use builder::{ModelBuilder, PropertyDef};
pub use converter::{CustomConverter, ValueConverter};
pub use loader::{from_json, resolve};
pub use model::*;
pub use types::*;
