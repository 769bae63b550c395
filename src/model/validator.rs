//! Model validation: referential integrity of the configuration document before it is resolved,
//! and whole-model consistency checks when the model is finalized.

use super::model::Model;
use super::types::ModelConfig;
use crate::error::ModelError;
use regex::Regex;
use std::collections::{HashMap, HashSet};

const IDENTIFIER: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn check_identifier(re: &Regex, kind: &str, name: &str) -> Result<(), ModelError> {
    if re.is_match(name) {
        Ok(())
    } else {
        Err(ModelError::InvalidName(format!("{} name '{}' is not a valid identifier", kind, name)))
    }
}

pub fn validate_config(config: &ModelConfig) -> Result<(), ModelError> {
    let ident = Regex::new(IDENTIFIER).map_err(|e| ModelError::Validation(e.to_string()))?;
    let mut enum_names = HashSet::new();
    for e in &config.enums {
        check_identifier(&ident, "enum", &e.name)?;
        if !enum_names.insert(e.name.as_str()) {
            return Err(ModelError::Validation(format!("duplicate enum '{}'", e.name)));
        }
        if e.values.is_empty() {
            return Err(ModelError::Validation(format!("enum '{}' has no members", e.name)));
        }
    }

    let mut entities = HashMap::new();
    for e in &config.entities {
        check_identifier(&ident, "entity type", &e.name)?;
        if entities.insert(e.name.as_str(), e).is_some() {
            return Err(ModelError::DuplicateEntityType(e.name.clone()));
        }
        for p in &e.properties {
            check_identifier(&ident, "property", &p.name)?;
        }
    }

    for e in &config.entities {
        if let Some(base) = &e.base {
            if !entities.contains_key(base.as_str()) {
                return Err(ModelError::MissingReference {
                    kind: "base entity type",
                    name: base.clone(),
                });
            }
            if e.discriminator.is_some() {
                return Err(ModelError::Validation(format!(
                    "entity type '{}' derives from '{}'; the discriminator belongs on the root",
                    e.name, base
                )));
            }
            if e.primary_key.is_some() || !e.alternate_keys.is_empty() {
                return Err(ModelError::DerivedKey {
                    entity: e.name.clone(),
                    root: base.clone(),
                });
            }
        }
        if let Some(owner) = &e.owner {
            if !entities.contains_key(owner.entity.as_str()) {
                return Err(ModelError::MissingReference {
                    kind: "owner entity type",
                    name: owner.entity.clone(),
                });
            }
            check_identifier(&ident, "navigation", &owner.navigation)?;
        }
        if e.keyless && (e.primary_key.is_some() || !e.alternate_keys.is_empty()) {
            return Err(ModelError::KeylessWithKey { entity: e.name.clone() });
        }
    }

    for r in &config.relationships {
        for name in [&r.dependent, &r.principal] {
            if !entities.contains_key(name.as_str()) {
                return Err(ModelError::MissingReference {
                    kind: "entity type",
                    name: name.clone(),
                });
            }
        }
        for nav in r.navigation.iter().chain(r.inverse.iter()) {
            check_identifier(&ident, "navigation", nav)?;
        }
    }

    for ix in &config.indexes {
        if !entities.contains_key(ix.entity.as_str()) {
            return Err(ModelError::MissingReference {
                kind: "entity type",
                name: ix.entity.clone(),
            });
        }
    }
    Ok(())
}

/// Checks run when a model is finalized.
pub fn validate_model(model: &Model) -> Result<(), ModelError> {
    for id in model.entity_type_ids() {
        let et = model.entity_type(id);
        if et.base.is_none() && !et.keyless && et.primary_key.is_none() {
            return Err(ModelError::Validation(format!(
                "entity type '{}' requires a primary key or must be marked keyless",
                et.name
            )));
        }

        if et.base.is_none() && !et.direct_derived.is_empty() {
            let discriminator = et.discriminator_property.ok_or_else(|| {
                ModelError::Validation(format!(
                    "hierarchy rooted at '{}' has derived types but no discriminator",
                    et.name
                ))
            })?;
            let disc_ty = &model.property(discriminator).clr_type;
            let mut seen = Vec::new();
            for t in model.concrete_types(id) {
                let concrete = model.entity_type(t);
                let value = concrete.discriminator_value.as_ref().ok_or_else(|| {
                    ModelError::Validation(format!(
                        "entity type '{}' has no discriminator value",
                        concrete.name
                    ))
                })?;
                if !value.conforms_to(disc_ty) {
                    return Err(ModelError::Validation(format!(
                        "discriminator value {} of '{}' is not assignable to the discriminator property of type {}",
                        value, concrete.name, disc_ty
                    )));
                }
                if seen.contains(value) {
                    return Err(ModelError::Validation(format!(
                        "discriminator value {} of '{}' is used by another type in the hierarchy",
                        value, concrete.name
                    )));
                }
                seen.push(value.clone());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{EntityConfig, PropertyConfig, PropertyListConfig};

    fn entity(name: &str) -> EntityConfig {
        serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
    }

    #[test]
    fn rejects_duplicate_entity_types() {
        let config = ModelConfig {
            entities: vec![entity("Blog"), entity("Blog")],
            ..Default::default()
        };
        assert_eq!(
            validate_config(&config),
            Err(ModelError::DuplicateEntityType("Blog".into()))
        );
    }

    #[test]
    fn rejects_missing_base_type() {
        let mut derived = entity("RssBlog");
        derived.base = Some("Blog".into());
        let config = ModelConfig {
            entities: vec![derived],
            ..Default::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(ModelError::MissingReference { kind: "base entity type", .. })
        ));
    }

    #[test]
    fn rejects_invalid_property_names() {
        let mut blog = entity("Blog");
        blog.properties.push(PropertyConfig {
            name: "bad name".into(),
            type_: "int".into(),
            nullable: None,
            column: None,
            store_type: None,
            value_generated: Default::default(),
            shadow: false,
            converter: None,
        });
        blog.primary_key = Some(PropertyListConfig::Single("bad name".into()));
        let config = ModelConfig {
            entities: vec![blog],
            ..Default::default()
        };
        assert!(matches!(validate_config(&config), Err(ModelError::InvalidName(_))));
    }
}
