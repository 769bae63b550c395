//! Builds a finalized [`Model`] from the JSON model document.

use super::builder::{ModelBuilder, PropertyDef};
use super::converter::ValueConverter;
use super::model::*;
use super::types::*;
use super::validator::validate_config;
use crate::case::NamingConvention;
use crate::error::ModelError;
use crate::value::{ClrType, EnumType, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Parses and resolves a JSON model document.
pub fn from_json(json: &str) -> Result<Model, ModelError> {
    let config: ModelConfig = serde_json::from_str(json).map_err(|e| ModelError::Load(e.to_string()))?;
    resolve(&config)
}

/// Build the model from configuration (validates first).
pub fn resolve(config: &ModelConfig) -> Result<Model, ModelError> {
    validate_config(config)?;
    let naming = config.naming;
    let enums = resolve_enums(&config.enums)?;

    let mut b = ModelBuilder::new();
    b.default_schema(config.default_schema.clone());

    let mut ids = HashMap::new();
    for e in &config.entities {
        let table = e.table.clone().unwrap_or_else(|| naming.apply(&e.name));
        let id = b.add_entity_type(&e.name, Some(&table))?;
        if let Some(schema) = &e.schema {
            b.set_table(id, &table, Some(schema.as_str()));
        }
        ids.insert(e.name.as_str(), id);
    }
    let lookup = |name: &str| -> Result<EntityTypeId, ModelError> {
        ids.get(name).copied().ok_or_else(|| ModelError::MissingReference {
            kind: "entity type",
            name: name.to_string(),
        })
    };

    for e in &config.entities {
        if let Some(base) = &e.base {
            b.set_base_type(lookup(&e.name)?, Some(lookup(base)?))?;
        }
    }

    for e in &config.entities {
        let id = lookup(&e.name)?;
        let shares_owner_table = e.owner.is_some() && e.table.is_none();
        for p in &e.properties {
            let ty = parse_type(&p.type_, &enums)?;
            let default_column = match (&e.owner, shares_owner_table) {
                (Some(owner), true) => naming.apply(&format!("{}_{}", owner.navigation, p.name)),
                _ => naming.apply(&p.name),
            };
            let mut def = PropertyDef::new(&p.name, ty.clone()).generated(p.value_generated);
            def.column = Some(p.column.clone().unwrap_or(default_column));
            def.store_type = p.store_type.clone();
            def.nullable = p.nullable;
            def.shadow = p.shadow;
            if let Some(name) = &p.converter {
                def.converter = Some(ValueConverter::by_name(name, &ty).ok_or_else(|| {
                    ModelError::Load(format!(
                        "converter '{}' does not apply to property '{}.{}' of type {}",
                        name, e.name, p.name, ty
                    ))
                })?);
            }
            b.add_property(id, def)?;
        }
        if let Some(d) = &e.discriminator {
            let prop = match b.model().find_declared_property(id, &d.property) {
                Some(p) => p,
                None => {
                    let ty = parse_type(&d.type_, &enums)?;
                    let column = d.column.clone().unwrap_or_else(|| naming.apply(&d.property));
                    b.add_property(id, PropertyDef::new(&d.property, ty).nullable(false).column(column).shadow())?
                }
            };
            b.set_discriminator(id, prop)?;
        }
        if e.keyless {
            b.set_keyless(id, true)?;
        }
        if let Some(rt) = &e.runtime_type {
            if e.owner.is_none() {
                b.set_runtime_type(id, rt, None)?;
            }
        }
    }

    for e in config.entities.iter().filter(|e| e.owner.is_none()) {
        let id = lookup(&e.name)?;
        if let Some(pk) = &e.primary_key {
            let props = find_properties(&b, id, pk)?;
            b.set_primary_key(id, &props)?;
        }
        for ak in &e.alternate_keys {
            let props = find_properties(&b, id, ak)?;
            b.add_key(id, &props)?;
        }
    }

    let mut pending: Vec<&EntityConfig> = config.entities.iter().filter(|e| e.owner.is_some()).collect();
    while !pending.is_empty() {
        let before = pending.len();
        let mut deferred = Vec::new();
        for e in pending {
            let owner_cfg = match &e.owner {
                Some(o) => o,
                None => continue,
            };
            let owner = lookup(&owner_cfg.entity)?;
            if b.model().primary_key(owner).is_none() {
                deferred.push(e);
                continue;
            }
            resolve_owned(&mut b, lookup(&e.name)?, owner, e, owner_cfg, naming)?;
        }
        if deferred.len() == before {
            return Err(ModelError::Load(format!(
                "owned entity type '{}' has an owner without a primary key",
                deferred[0].name
            )));
        }
        pending = deferred;
    }

    for e in &config.entities {
        if let Some(v) = &e.discriminator_value {
            let id = lookup(&e.name)?;
            let root = b.model().root_type(id);
            let prop = b.model().discriminator_property(root).ok_or_else(|| {
                ModelError::Validation(format!(
                    "entity type '{}' has a discriminator value but its hierarchy has no discriminator",
                    e.name
                ))
            })?;
            let ty = b.model().property(prop).clr_type.clone();
            let value = Value::from_json(v, &ty).ok_or_else(|| {
                ModelError::Validation(format!(
                    "discriminator value {} of '{}' is not assignable to the discriminator property of type {}",
                    v, e.name, ty
                ))
            })?;
            b.set_discriminator_value(id, value);
        }
    }

    for r in &config.relationships {
        let dependent = lookup(&r.dependent)?;
        let principal = lookup(&r.principal)?;
        let principal_key = match &r.principal_key {
            Some(list) => {
                let props = find_properties(&b, principal, list)?;
                b.model().find_key(principal, &props).ok_or_else(|| ModelError::MissingReference {
                    kind: "key",
                    name: format!("{} {{{}}}", r.principal, list.names().join(", ")),
                })?
            }
            None => b.model().primary_key(principal).ok_or_else(|| ModelError::MissingReference {
                kind: "primary key",
                name: r.principal.clone(),
            })?,
        };
        let props = find_properties(&b, dependent, &r.properties)?;
        let fk = b.add_foreign_key(dependent, &props, principal_key, r.unique, r.required)?;
        if let Some(nav) = &r.navigation {
            b.add_navigation(fk, nav, true, false)?;
        }
        if let Some(inv) = &r.inverse {
            b.add_navigation(fk, inv, false, !r.unique)?;
        }
    }

    for ix in &config.indexes {
        let id = lookup(&ix.entity)?;
        let props = find_properties(&b, id, &ix.properties)?;
        b.add_index(id, &props, ix.name.as_deref(), ix.unique)?;
    }

    b.finalize()
}

/// Owned types get a shadow primary key mirroring the owner's key, linked to the owner by a
/// unique ownership foreign key. When the owned type has no table of its own the key columns
/// are the owner's key columns (table splitting).
fn resolve_owned(
    b: &mut ModelBuilder,
    id: EntityTypeId,
    owner: EntityTypeId,
    e: &EntityConfig,
    owner_cfg: &OwnerConfig,
    naming: NamingConvention,
) -> Result<(), ModelError> {
    let shares_owner_table = e.table.is_none();
    if shares_owner_table {
        let table = b.model().table_name(owner).to_string();
        let schema = b.model().entity_type(b.model().root_type(owner)).schema.clone();
        b.set_table(id, &table, schema.as_deref());
    }
    if let Some(rt) = &e.runtime_type {
        b.set_runtime_type(
            id,
            rt,
            Some(DefiningNavigation {
                owner,
                navigation: owner_cfg.navigation.clone(),
            }),
        )?;
    }
    let owner_pk = b.model().primary_key(owner).ok_or_else(|| ModelError::MissingReference {
        kind: "primary key",
        name: owner_cfg.entity.clone(),
    })?;
    let owner_pk_props = b.model().key(owner_pk).properties.clone();

    let key_props = match &e.primary_key {
        Some(list) => find_properties(b, id, list)?,
        None => {
            let mut props = Vec::with_capacity(owner_pk_props.len());
            let owner_name = b.model().entity_name(owner).to_string();
            for p in &owner_pk_props {
                let owner_prop = b.model().property(*p).clone();
                let name = format!("{}{}", owner_name, owner_prop.name);
                let column = if shares_owner_table {
                    owner_prop.column.clone()
                } else {
                    naming.apply(&name)
                };
                let def = PropertyDef::new(name, owner_prop.clr_type.unwrap_nullable().clone())
                    .nullable(false)
                    .column(column)
                    .shadow();
                props.push(b.add_property(id, def)?);
            }
            props
        }
    };
    b.set_primary_key(id, &key_props)?;
    for ak in &e.alternate_keys {
        let props = find_properties(b, id, ak)?;
        b.add_key(id, &props)?;
    }
    let fk = b.add_foreign_key(id, &key_props, owner_pk, true, true)?;
    b.set_ownership(fk, true);
    b.add_navigation(fk, &owner_cfg.navigation, false, false)?;
    Ok(())
}

fn find_properties(
    b: &ModelBuilder,
    entity: EntityTypeId,
    list: &PropertyListConfig,
) -> Result<Vec<PropertyId>, ModelError> {
    list.names()
        .into_iter()
        .map(|name| {
            b.model().find_property(entity, name).ok_or_else(|| ModelError::MissingReference {
                kind: "property",
                name: format!("{}.{}", b.model().entity_name(entity), name),
            })
        })
        .collect()
}

fn resolve_enums(configs: &[EnumConfig]) -> Result<HashMap<String, Arc<EnumType>>, ModelError> {
    let mut out = HashMap::new();
    for c in configs {
        let underlying = ClrType::parse(&c.underlying)
            .filter(|t| t.is_integer())
            .ok_or_else(|| {
                ModelError::Load(format!(
                    "enum '{}' has non-integral underlying type '{}'",
                    c.name, c.underlying
                ))
            })?;
        let members = c
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| match v {
                EnumValueConfig::Name(n) => {
                    let value = if c.flags { 1i64 << i } else { i as i64 };
                    (n.clone(), value)
                }
                EnumValueConfig::Valued { name, value } => (name.clone(), *value),
            })
            .collect();
        out.insert(
            c.name.clone(),
            Arc::new(EnumType {
                name: c.name.clone(),
                underlying,
                flags: c.flags,
                members,
            }),
        );
    }
    Ok(out)
}

fn parse_type(name: &str, enums: &HashMap<String, Arc<EnumType>>) -> Result<ClrType, ModelError> {
    if let Some(ty) = ClrType::parse(name) {
        return Ok(ty);
    }
    let (base, nullable) = match name.trim().strip_suffix('?') {
        Some(inner) => (inner, true),
        None => (name.trim(), false),
    };
    let ty = enums
        .get(base)
        .map(|e| ClrType::Enum(e.clone()))
        .ok_or_else(|| ModelError::MissingReference {
            kind: "type",
            name: name.to_string(),
        })?;
    Ok(if nullable { ty.make_nullable() } else { ty })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOGGING: &str = r#"{
        "naming": "snake_case",
        "enums": [
            { "name": "PostStatus", "values": ["Draft", "Published", "Archived"] },
            { "name": "Permissions", "flags": true, "values": ["Read", "Write", { "name": "Admin", "value": 16 }] }
        ],
        "entities": [
            { "name": "Blog", "table": "Blogs", "primary_key": "Id",
              "discriminator": { "property": "BlogType" },
              "discriminator_value": "Blog",
              "properties": [
                { "name": "Id", "type": "int", "value_generated": "on_add" },
                { "name": "Url", "type": "string", "nullable": false },
                { "name": "Rating", "type": "int?" }
              ] },
            { "name": "RssBlog", "base": "Blog", "discriminator_value": "RssBlog",
              "properties": [ { "name": "FeedUrl", "type": "string" } ] },
            { "name": "Post", "primary_key": "Id", "alternate_keys": [["BlogId", "Title"]],
              "properties": [
                { "name": "Id", "type": "int" },
                { "name": "Title", "type": "string", "nullable": false },
                { "name": "Status", "type": "PostStatus", "converter": "enum_to_string" },
                { "name": "BlogId", "type": "int" }
              ] },
            { "name": "Address", "runtime_type": "Address",
              "owner": { "entity": "Blog", "navigation": "Location" },
              "properties": [ { "name": "City", "type": "string" } ] }
        ],
        "relationships": [
            { "dependent": "Post", "properties": "BlogId", "principal": "Blog",
              "navigation": "Blog", "inverse": "Posts" }
        ],
        "indexes": [ { "entity": "Post", "properties": "Title", "unique": true } ]
    }"#;

    #[test]
    fn resolves_blogging_model() {
        let m = from_json(BLOGGING).unwrap();
        let blog = m.find_entity_type("Blog").unwrap();
        let post = m.find_entity_type("Post").unwrap();
        let rss = m.find_entity_type("RssBlog").unwrap();

        assert_eq!(m.table_name(rss), "Blogs");
        assert_eq!(m.table_name(post), "post");
        let rating = m.find_property(blog, "Rating").unwrap();
        assert_eq!(m.property(rating).column, "rating");
        assert!(m.property(rating).nullable);

        assert_eq!(m.find_property(rss, "Url"), m.find_property(blog, "Url"));
        assert!(m.find_property(blog, "FeedUrl").is_none());
        assert!(m.find_property_in_hierarchy(blog, "FeedUrl").is_some());
        assert_eq!(m.derived_types(blog), vec![rss]);
        assert_eq!(m.discriminator_value(rss), Some(&Value::Text("RssBlog".into())));

        let posts = m.find_navigation(blog, "Posts").unwrap();
        assert!(m.is_collection(posts));
        assert_eq!(m.navigation_target(posts), post);
        let back = m.find_navigation(post, "Blog").unwrap();
        assert_eq!(m.inverse(back), Some(posts));
        assert_eq!(m.keys(post).len(), 2);
        assert_eq!(m.indexes(post).len(), 1);
    }

    #[test]
    fn flags_enum_members_are_powers_of_two() {
        let enums = resolve_enums(&[serde_json::from_value(serde_json::json!({
            "name": "Permissions", "flags": true, "values": ["Read", "Write", "Delete"]
        }))
        .unwrap()])
        .unwrap();
        let perms = &enums["Permissions"];
        assert_eq!(perms.member_value("Delete"), Some(4));
    }

    #[test]
    fn owned_type_splits_owner_table() {
        let m = from_json(BLOGGING).unwrap();
        let blog = m.find_entity_type("Blog").unwrap();
        let address = m.find_entity_type_by_runtime("Address", Some((blog, "Location"))).unwrap();
        assert!(m.find_entity_type_by_runtime("Address", None).is_none());
        assert_eq!(m.table_name(address), "Blogs");
        let city = m.find_property(address, "City").unwrap();
        assert_eq!(m.property(city).column, "location_city");
        let link = m.find_shared_table_link(address).unwrap();
        assert_eq!(m.foreign_key(link).principal_type, blog);
        assert!(m.foreign_key(link).ownership);
        let key_prop = m.find_property(address, "BlogId").unwrap();
        assert!(m.property(key_prop).shadow);
        assert_eq!(m.property(key_prop).column, "id");
    }

    #[test]
    fn unknown_converter_fails_to_load() {
        let json = r#"{ "entities": [ { "name": "A", "primary_key": "Id",
            "properties": [ { "name": "Id", "type": "int", "converter": "guid_to_string" } ] } ] }"#;
        assert!(matches!(from_json(json), Err(ModelError::Load(_))));
    }
}
