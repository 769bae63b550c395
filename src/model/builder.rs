//! Mutation API for the metadata model. Every structural change is checked immediately and
//! rejected with a [`ModelError`] naming the offending items; secondary indexes are kept in
//! step with each mutation.

use super::converter::ValueConverter;
use super::model::*;
use super::validator::validate_model;
use crate::error::ModelError;
use crate::value::{ClrType, Value};

/// Definition of a scalar property to add to an entity type.
#[derive(Clone, Debug)]
pub struct PropertyDef {
    pub name: String,
    pub clr_type: ClrType,
    pub nullable: Option<bool>,
    pub column: Option<String>,
    pub store_type: Option<String>,
    pub value_generated: ValueGenerated,
    pub converter: Option<ValueConverter>,
    pub shadow: bool,
}

impl PropertyDef {
    pub fn new(name: impl Into<String>, clr_type: ClrType) -> Self {
        PropertyDef {
            name: name.into(),
            clr_type,
            nullable: None,
            column: None,
            store_type: None,
            value_generated: ValueGenerated::Never,
            converter: None,
            shadow: false,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn store_type(mut self, store_type: impl Into<String>) -> Self {
        self.store_type = Some(store_type.into());
        self
    }

    /// Reference types only: marks the property as required (`false`) or optional.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    pub fn generated(mut self, value_generated: ValueGenerated) -> Self {
        self.value_generated = value_generated;
        self
    }

    pub fn converter(mut self, converter: ValueConverter) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn shadow(mut self) -> Self {
        self.shadow = true;
        self
    }
}

#[derive(Debug, Default)]
pub struct ModelBuilder {
    model: Model,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_schema(&mut self, schema: Option<String>) -> &mut Self {
        self.model.default_schema = schema;
        self
    }

    /// Read access to the model under construction.
    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn add_entity_type(&mut self, name: &str, table: Option<&str>) -> Result<EntityTypeId, ModelError> {
        if name.trim().is_empty() {
            return Err(ModelError::InvalidName("entity type name cannot be empty".into()));
        }
        if self.model.by_name.contains_key(name) {
            return Err(ModelError::DuplicateEntityType(name.to_string()));
        }
        let id = EntityTypeId(self.model.entity_types.len());
        self.model.entity_types.push(EntityType {
            name: name.to_string(),
            runtime_type: None,
            defining: None,
            base: None,
            table: table.unwrap_or(name).to_string(),
            schema: None,
            keyless: false,
            discriminator_property: None,
            discriminator_value: None,
            properties: Vec::new(),
            primary_key: None,
            keys: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            navigations: Vec::new(),
            direct_derived: Vec::new(),
        });
        self.model.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn set_table(&mut self, entity: EntityTypeId, table: &str, schema: Option<&str>) -> &mut Self {
        let et = &mut self.model.entity_types[entity.0];
        et.table = table.to_string();
        et.schema = schema.map(str::to_string);
        self
    }

    /// Sets the runtime type, optionally with the defining navigation of an owned type.
    pub fn set_runtime_type(
        &mut self,
        entity: EntityTypeId,
        runtime_type: &str,
        defining: Option<DefiningNavigation>,
    ) -> Result<(), ModelError> {
        let key = (runtime_type.to_string(), defining.clone());
        if let Some(existing) = self.model.by_runtime.get(&key) {
            if *existing != entity {
                return Err(ModelError::Validation(format!(
                    "runtime type '{}' is already mapped to entity type '{}'",
                    runtime_type,
                    self.model.entity_name(*existing)
                )));
            }
        }
        let et = &mut self.model.entity_types[entity.0];
        if let Some(old) = et.runtime_type.take() {
            let old_key = (old, et.defining.clone());
            self.model.by_runtime.remove(&old_key);
        }
        let et = &mut self.model.entity_types[entity.0];
        et.runtime_type = Some(runtime_type.to_string());
        et.defining = defining;
        self.model.by_runtime.insert(key, entity);
        Ok(())
    }

    fn check_name_free(&self, entity: EntityTypeId, name: &str) -> Result<(), ModelError> {
        let m = &self.model;
        let mut scope = m.base_chain(entity);
        scope.extend(m.derived_types(entity));
        for t in scope {
            if m.find_declared_property(t, name).is_some() {
                return Err(ModelError::DuplicateProperty {
                    entity: m.entity_name(entity).to_string(),
                    property: name.to_string(),
                });
            }
            if m.find_declared_navigation(t, name).is_some() {
                return Err(ModelError::DuplicateNavigation {
                    entity: m.entity_name(entity).to_string(),
                    navigation: name.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn add_property(&mut self, entity: EntityTypeId, def: PropertyDef) -> Result<PropertyId, ModelError> {
        if def.name.trim().is_empty() {
            return Err(ModelError::InvalidName(format!(
                "property name on '{}' cannot be empty",
                self.model.entity_name(entity)
            )));
        }
        self.check_name_free(entity, &def.name)?;
        let (clr_type, nullable) = match def.nullable {
            Some(true) => (def.clr_type.clone().make_nullable(), true),
            Some(false) if def.clr_type.is_nullable_wrapper() => {
                (def.clr_type.unwrap_nullable().clone(), false)
            }
            Some(false) => (def.clr_type.clone(), false),
            None => (def.clr_type.clone(), def.clr_type.can_be_null()),
        };
        let id = PropertyId(self.model.properties.len());
        self.model.properties.push(Property {
            column: def.column.unwrap_or_else(|| def.name.clone()),
            name: def.name,
            declaring: entity,
            clr_type,
            nullable,
            value_generated: def.value_generated,
            store_type: def.store_type,
            converter: def.converter,
            shadow: def.shadow,
            keys: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        });
        self.model.entity_types[entity.0].properties.push(id);
        Ok(id)
    }

    fn check_properties(
        &self,
        entity: EntityTypeId,
        properties: &[PropertyId],
        kind: &'static str,
    ) -> Result<(), ModelError> {
        let m = &self.model;
        if properties.is_empty() {
            return Err(ModelError::EmptyPropertyList {
                kind,
                entity: m.entity_name(entity).to_string(),
            });
        }
        let chain = m.base_chain(entity);
        for p in properties {
            let prop = m.property(*p);
            if !chain.contains(&prop.declaring) {
                return Err(ModelError::Validation(format!(
                    "property '{}' used in a {} of '{}' is declared on unrelated entity type '{}'",
                    prop.name,
                    kind,
                    m.entity_name(entity),
                    m.entity_name(prop.declaring)
                )));
            }
        }
        Ok(())
    }

    /// Adds an alternate key.
    pub fn add_key(&mut self, entity: EntityTypeId, properties: &[PropertyId]) -> Result<KeyId, ModelError> {
        self.check_properties(entity, properties, "key")?;
        let m = &self.model;
        let et = m.entity_type(entity);
        if et.keyless {
            return Err(ModelError::KeylessWithKey { entity: et.name.clone() });
        }
        if et.base.is_some() {
            return Err(ModelError::DerivedKey {
                entity: et.name.clone(),
                root: m.entity_name(m.root_type(entity)).to_string(),
            });
        }
        if m.find_key(entity, properties).is_some() {
            return Err(ModelError::DuplicateKey {
                entity: et.name.clone(),
                properties: m.property_names(properties),
            });
        }
        for p in properties {
            let prop = m.property(*p);
            if prop.nullable {
                return Err(ModelError::NullableKeyProperty {
                    entity: et.name.clone(),
                    property: prop.name.clone(),
                });
            }
        }
        let id = KeyId(self.model.keys.len());
        self.model.keys.push(Some(Key {
            declaring: entity,
            properties: properties.to_vec(),
            referencing: Vec::new(),
        }));
        for p in properties {
            self.model.properties[p.0].keys.push(id);
        }
        self.model.entity_types[entity.0].keys.push(id);
        Ok(id)
    }

    /// Sets the primary key, creating the key when it does not exist yet. A previous primary
    /// key stays on the type as an alternate key.
    pub fn set_primary_key(&mut self, entity: EntityTypeId, properties: &[PropertyId]) -> Result<KeyId, ModelError> {
        let key = match self.model.find_key(entity, properties) {
            Some(k) => k,
            None => self.add_key(entity, properties)?,
        };
        self.model.entity_types[entity.0].primary_key = Some(key);
        Ok(key)
    }

    pub fn remove_key(&mut self, key: KeyId) -> Result<(), ModelError> {
        let m = &self.model;
        let k = m.key(key);
        if let Some(fk) = k.referencing.first() {
            return Err(ModelError::KeyInUse {
                entity: m.entity_name(k.declaring).to_string(),
                properties: m.property_names(&k.properties),
                dependent: m.entity_name(m.foreign_key(*fk).declaring).to_string(),
            });
        }
        let declaring = k.declaring;
        let properties = k.properties.clone();
        for p in &properties {
            self.model.properties[p.0].keys.retain(|x| *x != key);
        }
        let et = &mut self.model.entity_types[declaring.0];
        et.keys.retain(|x| *x != key);
        if et.primary_key == Some(key) {
            et.primary_key = None;
        }
        self.model.keys[key.0] = None;
        Ok(())
    }

    pub fn add_foreign_key(
        &mut self,
        dependent: EntityTypeId,
        properties: &[PropertyId],
        principal_key: KeyId,
        unique: bool,
        required: bool,
    ) -> Result<ForeignKeyId, ModelError> {
        self.check_properties(dependent, properties, "foreign key")?;
        let m = &self.model;
        let pk = m.key(principal_key);
        let principal_type = pk.declaring;
        if pk.properties.len() != properties.len() {
            return Err(ModelError::Validation(format!(
                "foreign key {{{}}} on '{}' has {} properties but the principal key {{{}}} on '{}' has {}",
                m.property_names(properties),
                m.entity_name(dependent),
                properties.len(),
                m.property_names(&pk.properties),
                m.entity_name(principal_type),
                pk.properties.len()
            )));
        }
        for (d, p) in properties.iter().zip(&pk.properties) {
            let (dt, pt) = (&m.property(*d).clr_type, &m.property(*p).clr_type);
            if dt.unwrap_nullable() != pt.unwrap_nullable() {
                return Err(ModelError::Validation(format!(
                    "foreign key property '{}.{}' of type {} is incompatible with principal key property '{}.{}' of type {}",
                    m.entity_name(dependent),
                    m.property(*d).name,
                    dt,
                    m.entity_name(principal_type),
                    m.property(*p).name,
                    pt
                )));
            }
        }
        if m.find_foreign_key(dependent, properties, principal_key).is_some() {
            return Err(ModelError::DuplicateForeignKey {
                entity: m.entity_name(dependent).to_string(),
                properties: m.property_names(properties),
                principal: m.entity_name(principal_type).to_string(),
            });
        }
        let id = ForeignKeyId(self.model.foreign_keys.len());
        self.model.foreign_keys.push(Some(ForeignKey {
            declaring: dependent,
            properties: properties.to_vec(),
            principal_type,
            principal_key,
            unique,
            required,
            ownership: false,
            dependent_to_principal: None,
            principal_to_dependent: None,
        }));
        for p in properties {
            self.model.properties[p.0].foreign_keys.push(id);
        }
        if let Some(k) = self.model.keys[principal_key.0].as_mut() {
            k.referencing.push(id);
        }
        self.model.entity_types[dependent.0].foreign_keys.push(id);
        Ok(id)
    }

    pub fn set_ownership(&mut self, fk: ForeignKeyId, ownership: bool) -> &mut Self {
        if let Some(f) = self.model.foreign_keys[fk.0].as_mut() {
            f.ownership = ownership;
        }
        self
    }

    pub fn remove_foreign_key(&mut self, fk: ForeignKeyId) -> Result<(), ModelError> {
        let f = self.model.foreign_key(fk).clone();
        if f.dependent_to_principal.is_some() || f.principal_to_dependent.is_some() {
            return Err(ModelError::Validation(format!(
                "foreign key {{{}}} on '{}' still has navigations",
                self.model.property_names(&f.properties),
                self.model.entity_name(f.declaring)
            )));
        }
        for p in &f.properties {
            self.model.properties[p.0].foreign_keys.retain(|x| *x != fk);
        }
        if let Some(k) = self.model.keys[f.principal_key.0].as_mut() {
            k.referencing.retain(|x| *x != fk);
        }
        self.model.entity_types[f.declaring.0].foreign_keys.retain(|x| *x != fk);
        self.model.foreign_keys[fk.0] = None;
        Ok(())
    }

    /// Adds a navigation over `fk`. A dependent-side navigation must be a reference; a
    /// principal-side navigation is a collection exactly when the foreign key is not unique.
    pub fn add_navigation(
        &mut self,
        fk: ForeignKeyId,
        name: &str,
        on_dependent: bool,
        collection: bool,
    ) -> Result<NavigationId, ModelError> {
        let f = self.model.foreign_key(fk).clone();
        let declaring = if on_dependent { f.declaring } else { f.principal_type };
        let entity = self.model.entity_name(declaring).to_string();
        if name.trim().is_empty() {
            return Err(ModelError::InvalidName(format!("navigation name on '{}' cannot be empty", entity)));
        }
        let incompatible = |reason: &str| ModelError::IncompatibleNavigation {
            entity: entity.clone(),
            navigation: name.to_string(),
            reason: reason.to_string(),
        };
        if on_dependent && collection {
            return Err(incompatible("a navigation from the dependent to the principal must be a reference"));
        }
        if !on_dependent && collection == f.unique {
            return Err(incompatible(if f.unique {
                "the relationship is one-to-one, the navigation must be a reference"
            } else {
                "the relationship is one-to-many, the navigation must be a collection"
            }));
        }
        let slot = if on_dependent { f.dependent_to_principal } else { f.principal_to_dependent };
        if slot.is_some() {
            return Err(incompatible("the relationship already has a navigation in this direction"));
        }
        self.check_name_free(declaring, name)?;
        let id = NavigationId(self.model.navigations.len());
        self.model.navigations.push(Navigation {
            name: name.to_string(),
            declaring,
            foreign_key: fk,
            on_dependent,
        });
        self.model.entity_types[declaring.0].navigations.push(id);
        if let Some(f) = self.model.foreign_keys[fk.0].as_mut() {
            if on_dependent {
                f.dependent_to_principal = Some(id);
            } else {
                f.principal_to_dependent = Some(id);
            }
        }
        Ok(id)
    }

    pub fn add_index(
        &mut self,
        entity: EntityTypeId,
        properties: &[PropertyId],
        name: Option<&str>,
        unique: bool,
    ) -> Result<IndexId, ModelError> {
        self.check_properties(entity, properties, "index")?;
        let m = &self.model;
        if m.find_index(entity, properties).is_some() {
            return Err(ModelError::DuplicateIndex {
                entity: m.entity_name(entity).to_string(),
                properties: m.property_names(properties),
            });
        }
        let id = IndexId(self.model.indexes.len());
        self.model.indexes.push(Some(Index {
            declaring: entity,
            properties: properties.to_vec(),
            name: name.map(str::to_string),
            unique,
        }));
        for p in properties {
            self.model.properties[p.0].indexes.push(id);
        }
        self.model.entity_types[entity.0].indexes.push(id);
        Ok(id)
    }

    pub fn remove_index(&mut self, index: IndexId) {
        if let Some(ix) = self.model.indexes[index.0].take() {
            for p in &ix.properties {
                self.model.properties[p.0].indexes.retain(|x| *x != index);
            }
            self.model.entity_types[ix.declaring.0].indexes.retain(|x| *x != index);
        }
    }

    /// Sets or clears the base type. A type that declares keys cannot become derived, and the
    /// new chain must be acyclic with no member-name clashes.
    pub fn set_base_type(&mut self, entity: EntityTypeId, base: Option<EntityTypeId>) -> Result<(), ModelError> {
        let m = &self.model;
        if let Some(base) = base {
            let invalid = |reason: &str| ModelError::InvalidBaseType {
                entity: m.entity_name(entity).to_string(),
                base: m.entity_name(base).to_string(),
                reason: reason.to_string(),
            };
            if base == entity {
                return Err(invalid("an entity type cannot derive from itself"));
            }
            if m.base_chain(base).contains(&entity) {
                return Err(invalid("the inheritance chain would be circular"));
            }
            if !m.entity_type(entity).keys.is_empty() {
                return Err(invalid("the entity type declares keys; keys belong on the root type"));
            }
            if m.entity_type(entity).keyless != m.entity_type(m.root_type(base)).keyless {
                return Err(invalid("keyless and keyed types cannot share a hierarchy"));
            }
            if m.is_owned(entity) != m.is_owned(base) {
                return Err(invalid("owned and non-owned types cannot share a hierarchy"));
            }
            let base_chain = m.base_chain(base);
            for p in &m.entity_type(entity).properties {
                let name = &m.property(*p).name;
                if base_chain.iter().any(|t| m.find_declared_property(*t, name).is_some()) {
                    return Err(ModelError::DuplicateProperty {
                        entity: m.entity_name(entity).to_string(),
                        property: name.clone(),
                    });
                }
            }
        }
        if let Some(old) = self.model.entity_types[entity.0].base {
            self.model.entity_types[old.0].direct_derived.retain(|x| *x != entity);
        }
        self.model.entity_types[entity.0].base = base;
        if let Some(base) = base {
            self.model.entity_types[base.0].direct_derived.push(entity);
        }
        Ok(())
    }

    pub fn set_keyless(&mut self, entity: EntityTypeId, keyless: bool) -> Result<(), ModelError> {
        let et = self.model.entity_type(entity);
        if keyless && !et.keys.is_empty() {
            return Err(ModelError::KeylessWithKey { entity: et.name.clone() });
        }
        if et.base.is_some() {
            return Err(ModelError::Validation(format!(
                "keyless must be configured on the root of the hierarchy of '{}'",
                et.name
            )));
        }
        self.model.entity_types[entity.0].keyless = keyless;
        Ok(())
    }

    /// Sets the discriminator property on a hierarchy root.
    pub fn set_discriminator(&mut self, root: EntityTypeId, property: PropertyId) -> Result<(), ModelError> {
        let m = &self.model;
        if m.entity_type(root).base.is_some() {
            return Err(ModelError::Validation(format!(
                "the discriminator of '{}' must be configured on the root type '{}'",
                m.entity_name(root),
                m.entity_name(m.root_type(root))
            )));
        }
        if m.property(property).declaring != root {
            return Err(ModelError::Validation(format!(
                "discriminator property '{}' is not declared on '{}'",
                m.property(property).name,
                m.entity_name(root)
            )));
        }
        self.model.entity_types[root.0].discriminator_property = Some(property);
        Ok(())
    }

    pub fn set_discriminator_value(&mut self, entity: EntityTypeId, value: Value) -> &mut Self {
        self.model.entity_types[entity.0].discriminator_value = Some(value);
        self
    }

    /// Validates the whole model and freezes it.
    pub fn finalize(self) -> Result<Model, ModelError> {
        validate_model(&self.model)?;
        tracing::debug!(
            entity_types = self.model.entity_type_count(),
            properties = self.model.property_count(),
            "model finalized"
        );
        Ok(self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blog_and_post() -> (ModelBuilder, EntityTypeId, EntityTypeId, PropertyId, PropertyId) {
        let mut b = ModelBuilder::new();
        let blog = b.add_entity_type("Blog", Some("Blogs")).unwrap();
        let blog_id = b.add_property(blog, PropertyDef::new("Id", ClrType::Int32)).unwrap();
        b.set_primary_key(blog, &[blog_id]).unwrap();
        let post = b.add_entity_type("Post", Some("Posts")).unwrap();
        let post_id = b.add_property(post, PropertyDef::new("Id", ClrType::Int32)).unwrap();
        b.set_primary_key(post, &[post_id]).unwrap();
        let fk_prop = b.add_property(post, PropertyDef::new("BlogId", ClrType::Int32)).unwrap();
        (b, blog, post, blog_id, fk_prop)
    }

    #[test]
    fn duplicate_key_is_rejected_with_names() {
        let (mut b, blog, _, blog_id, _) = blog_and_post();
        let err = b.add_key(blog, &[blog_id]).unwrap_err();
        assert_eq!(
            err,
            ModelError::DuplicateKey {
                entity: "Blog".into(),
                properties: "Id".into()
            }
        );
    }

    #[test]
    fn key_in_use_cannot_be_removed() {
        let (mut b, blog, post, _, fk_prop) = blog_and_post();
        let pk = b.model().primary_key(blog).unwrap();
        let fk = b.add_foreign_key(post, &[fk_prop], pk, false, true).unwrap();
        assert!(matches!(b.remove_key(pk), Err(ModelError::KeyInUse { .. })));
        b.remove_foreign_key(fk).unwrap();
        b.remove_key(pk).unwrap();
        assert_eq!(b.model().primary_key(blog), None);
        assert!(b.model().property(b.model().find_property(blog, "Id").unwrap()).containing_keys().is_empty());
    }

    #[test]
    fn nullable_key_property_is_rejected() {
        let mut b = ModelBuilder::new();
        let e = b.add_entity_type("Tag", None).unwrap();
        let p = b
            .add_property(e, PropertyDef::new("Code", ClrType::String))
            .unwrap();
        assert!(matches!(
            b.set_primary_key(e, &[p]),
            Err(ModelError::NullableKeyProperty { .. })
        ));
    }

    #[test]
    fn derived_type_cannot_declare_key() {
        let (mut b, blog, _, _, _) = blog_and_post();
        let rss = b.add_entity_type("RssBlog", None).unwrap();
        b.set_base_type(rss, Some(blog)).unwrap();
        let url = b
            .add_property(rss, PropertyDef::new("FeedUrl", ClrType::String).nullable(false))
            .unwrap();
        assert!(matches!(b.add_key(rss, &[url]), Err(ModelError::DerivedKey { .. })));
        assert_eq!(b.model().primary_key(rss), b.model().primary_key(blog));
    }

    #[test]
    fn circular_base_type_is_rejected() {
        let mut b = ModelBuilder::new();
        let a = b.add_entity_type("A", None).unwrap();
        let c = b.add_entity_type("C", None).unwrap();
        b.set_base_type(c, Some(a)).unwrap();
        assert!(matches!(
            b.set_base_type(a, Some(c)),
            Err(ModelError::InvalidBaseType { .. })
        ));
    }

    #[test]
    fn keyless_type_cannot_define_keys() {
        let mut b = ModelBuilder::new();
        let e = b.add_entity_type("Report", None).unwrap();
        let p = b.add_property(e, PropertyDef::new("Total", ClrType::Int64)).unwrap();
        b.set_keyless(e, true).unwrap();
        assert!(matches!(
            b.add_key(e, &[p]),
            Err(ModelError::KeylessWithKey { .. })
        ));
    }

    #[test]
    fn collection_navigation_requires_non_unique_foreign_key() {
        let (mut b, blog, post, _, fk_prop) = blog_and_post();
        let pk = b.model().primary_key(blog).unwrap();
        let fk = b.add_foreign_key(post, &[fk_prop], pk, true, true).unwrap();
        assert!(matches!(
            b.add_navigation(fk, "Posts", false, true),
            Err(ModelError::IncompatibleNavigation { .. })
        ));
        assert!(matches!(
            b.add_navigation(fk, "Blog", true, true),
            Err(ModelError::IncompatibleNavigation { .. })
        ));
        b.add_navigation(fk, "Post", false, false).unwrap();
    }

    #[test]
    fn navigation_name_cannot_shadow_property() {
        let (mut b, blog, post, _, fk_prop) = blog_and_post();
        let pk = b.model().primary_key(blog).unwrap();
        let fk = b.add_foreign_key(post, &[fk_prop], pk, false, true).unwrap();
        assert!(matches!(
            b.add_navigation(fk, "BlogId", true, false),
            Err(ModelError::DuplicateProperty { .. })
        ));
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let (mut b, _, post, _, fk_prop) = blog_and_post();
        b.add_index(post, &[fk_prop], None, false).unwrap();
        assert!(matches!(
            b.add_index(post, &[fk_prop], Some("IX_Other"), true),
            Err(ModelError::DuplicateIndex { .. })
        ));
    }
}
