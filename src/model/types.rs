//! Raw model configuration types matching the JSON model document.

use super::model::ValueGenerated;
use crate::case::NamingConvention;
use serde::{Deserialize, Deserializer, Serialize};

/// A property list given either as one name or as an ordered list of names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyListConfig {
    Single(String),
    Composite(Vec<String>),
}

impl PropertyListConfig {
    pub fn names(&self) -> Vec<&str> {
        match self {
            PropertyListConfig::Single(s) => vec![s.as_str()],
            PropertyListConfig::Composite(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnumValueConfig {
    /// Member whose value is its position in the list.
    Name(String),
    Valued { name: String, value: i64 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnumConfig {
    pub name: String,
    #[serde(default = "default_underlying")]
    pub underlying: String,
    #[serde(default)]
    pub flags: bool,
    pub values: Vec<EnumValueConfig>,
}

fn default_underlying() -> String {
    "int".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropertyConfig {
    pub name: String,
    /// Built-in type name (`int`, `string`, `DateTime?`, ...) or a declared enum name.
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub nullable: Option<bool>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub store_type: Option<String>,
    #[serde(default)]
    pub value_generated: ValueGenerated,
    #[serde(default)]
    pub shadow: bool,
    /// Built-in converter name: `enum_to_string`, `bool_to_int` or `guid_to_string`.
    #[serde(default)]
    pub converter: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    pub property: String,
    #[serde(rename = "type", default = "default_discriminator_type")]
    pub type_: String,
    #[serde(default)]
    pub column: Option<String>,
}

fn default_discriminator_type() -> String {
    "string".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OwnerConfig {
    pub entity: String,
    pub navigation: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    #[serde(default)]
    pub runtime_type: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub keyless: bool,
    #[serde(default)]
    pub primary_key: Option<PropertyListConfig>,
    #[serde(default)]
    pub alternate_keys: Vec<PropertyListConfig>,
    /// Declared on the root of a hierarchy.
    #[serde(default)]
    pub discriminator: Option<DiscriminatorConfig>,
    #[serde(default, deserialize_with = "deserialize_discriminator_value")]
    pub discriminator_value: Option<serde_json::Value>,
    #[serde(default)]
    pub owner: Option<OwnerConfig>,
    #[serde(default)]
    pub properties: Vec<PropertyConfig>,
}

/// Discriminator values are scalars; `null` means "not set".
fn deserialize_discriminator_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(_) | serde_json::Value::Number(_) | serde_json::Value::Bool(_) => Ok(Some(v)),
        other => Err(serde::de::Error::custom(format!(
            "discriminator_value must be a string, number or boolean; got {}",
            type_name_of_json(&other)
        ))),
    }
}

fn type_name_of_json(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationshipConfig {
    pub dependent: String,
    pub properties: PropertyListConfig,
    pub principal: String,
    /// Defaults to the principal's primary key.
    #[serde(default)]
    pub principal_key: Option<PropertyListConfig>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Dependent -> principal navigation.
    #[serde(default)]
    pub navigation: Option<String>,
    /// Principal -> dependent navigation (a collection unless `unique`).
    #[serde(default)]
    pub inverse: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    pub entity: String,
    pub properties: PropertyListConfig,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unique: bool,
}

/// The whole model document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub naming: NamingConvention,
    #[serde(default)]
    pub default_schema: Option<String>,
    #[serde(default)]
    pub enums: Vec<EnumConfig>,
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub relationships: Vec<RelationshipConfig>,
    #[serde(default)]
    pub indexes: Vec<IndexConfig>,
}
