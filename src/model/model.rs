//! The finalized metadata model: an arena of entity types, properties, keys, foreign keys,
//! indexes and navigations addressed by typed ids.
//!
//! All lookups are side-effect free and report absence with `None`. Back-references
//! (property -> keys/foreign keys/indexes, key -> referencing foreign keys, base -> derived
//! types) are secondary indexes maintained by [`ModelBuilder`](super::ModelBuilder) on every
//! mutation.

use super::converter::ValueConverter;
use crate::value::{ClrType, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) usize);

        impl $name {
            pub fn index(self) -> usize {
                self.0
            }
        }
    };
}

arena_id!(
    /// Identifies an entity type within one [`Model`].
    EntityTypeId
);
arena_id!(PropertyId);
arena_id!(KeyId);
arena_id!(ForeignKeyId);
arena_id!(IndexId);
arena_id!(NavigationId);

/// When the store generates a property's value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueGenerated {
    #[default]
    Never,
    OnAdd,
    OnAddOrUpdate,
}

/// The owning side of an owned (weak) entity type: the owner and the navigation that defines it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DefiningNavigation {
    pub owner: EntityTypeId,
    pub navigation: String,
}

#[derive(Clone, Debug)]
pub struct EntityType {
    pub name: String,
    pub runtime_type: Option<String>,
    pub defining: Option<DefiningNavigation>,
    pub base: Option<EntityTypeId>,
    pub table: String,
    pub schema: Option<String>,
    pub keyless: bool,
    /// Discriminator property, declared on the root of a hierarchy.
    pub discriminator_property: Option<PropertyId>,
    pub discriminator_value: Option<Value>,
    pub(crate) properties: Vec<PropertyId>,
    pub(crate) primary_key: Option<KeyId>,
    pub(crate) keys: Vec<KeyId>,
    pub(crate) foreign_keys: Vec<ForeignKeyId>,
    pub(crate) indexes: Vec<IndexId>,
    pub(crate) navigations: Vec<NavigationId>,
    pub(crate) direct_derived: Vec<EntityTypeId>,
}

#[derive(Clone, Debug)]
pub struct Property {
    pub name: String,
    pub declaring: EntityTypeId,
    pub clr_type: ClrType,
    pub nullable: bool,
    pub value_generated: ValueGenerated,
    pub column: String,
    pub store_type: Option<String>,
    pub converter: Option<ValueConverter>,
    /// Mapped but without a member on the runtime object; only visible in snapshots.
    pub shadow: bool,
    pub(crate) keys: Vec<KeyId>,
    pub(crate) foreign_keys: Vec<ForeignKeyId>,
    pub(crate) indexes: Vec<IndexId>,
}

impl Property {
    pub fn containing_keys(&self) -> &[KeyId] {
        &self.keys
    }

    pub fn containing_foreign_keys(&self) -> &[ForeignKeyId] {
        &self.foreign_keys
    }

    pub fn containing_indexes(&self) -> &[IndexId] {
        &self.indexes
    }
}

#[derive(Clone, Debug)]
pub struct Key {
    pub declaring: EntityTypeId,
    pub properties: Vec<PropertyId>,
    pub(crate) referencing: Vec<ForeignKeyId>,
}

impl Key {
    pub fn referencing_foreign_keys(&self) -> &[ForeignKeyId] {
        &self.referencing
    }
}

#[derive(Clone, Debug)]
pub struct ForeignKey {
    /// The dependent entity type.
    pub declaring: EntityTypeId,
    pub properties: Vec<PropertyId>,
    pub principal_type: EntityTypeId,
    pub principal_key: KeyId,
    /// One-to-one when set, one-to-many otherwise.
    pub unique: bool,
    pub required: bool,
    /// The principal owns the dependent (owned types).
    pub ownership: bool,
    pub dependent_to_principal: Option<NavigationId>,
    pub principal_to_dependent: Option<NavigationId>,
}

#[derive(Clone, Debug)]
pub struct Index {
    pub declaring: EntityTypeId,
    pub properties: Vec<PropertyId>,
    pub name: Option<String>,
    pub unique: bool,
}

#[derive(Clone, Debug)]
pub struct Navigation {
    pub name: String,
    pub declaring: EntityTypeId,
    pub foreign_key: ForeignKeyId,
    /// Declared on the dependent side (points at the principal).
    pub on_dependent: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Model {
    pub(crate) entity_types: Vec<EntityType>,
    pub(crate) properties: Vec<Property>,
    pub(crate) keys: Vec<Option<Key>>,
    pub(crate) foreign_keys: Vec<Option<ForeignKey>>,
    pub(crate) indexes: Vec<Option<Index>>,
    pub(crate) navigations: Vec<Navigation>,
    pub(crate) by_name: HashMap<String, EntityTypeId>,
    pub(crate) by_runtime: HashMap<(String, Option<DefiningNavigation>), EntityTypeId>,
    pub default_schema: Option<String>,
}

impl Model {
    /// # Panics
    ///
    /// Panics if `id` does not belong to this model.
    pub fn entity_type(&self, id: EntityTypeId) -> &EntityType {
        &self.entity_types[id.0]
    }

    /// # Panics
    ///
    /// Panics if `id` does not belong to this model.
    pub fn property(&self, id: PropertyId) -> &Property {
        &self.properties[id.0]
    }

    /// # Panics
    ///
    /// Panics if `id` does not belong to this model or the key was removed.
    pub fn key(&self, id: KeyId) -> &Key {
        self.keys[id.0].as_ref().expect("invalid key id")
    }

    /// # Panics
    ///
    /// Panics if `id` does not belong to this model or the foreign key was removed.
    pub fn foreign_key(&self, id: ForeignKeyId) -> &ForeignKey {
        self.foreign_keys[id.0].as_ref().expect("invalid foreign key id")
    }

    /// # Panics
    ///
    /// Panics if `id` does not belong to this model or the index was removed.
    pub fn index(&self, id: IndexId) -> &Index {
        self.indexes[id.0].as_ref().expect("invalid index id")
    }

    /// # Panics
    ///
    /// Panics if `id` does not belong to this model.
    pub fn navigation(&self, id: NavigationId) -> &Navigation {
        &self.navigations[id.0]
    }

    pub fn entity_type_ids(&self) -> impl Iterator<Item = EntityTypeId> + '_ {
        (0..self.entity_types.len()).map(EntityTypeId)
    }

    pub fn find_entity_type(&self, name: &str) -> Option<EntityTypeId> {
        self.by_name.get(name).copied()
    }

    /// Finds an entity type by its runtime type. Owned types sharing a runtime type are told
    /// apart by their defining navigation.
    pub fn find_entity_type_by_runtime(
        &self,
        runtime_type: &str,
        defining: Option<(EntityTypeId, &str)>,
    ) -> Option<EntityTypeId> {
        let defining = defining.map(|(owner, navigation)| DefiningNavigation {
            owner,
            navigation: navigation.to_string(),
        });
        self.by_runtime
            .get(&(runtime_type.to_string(), defining))
            .copied()
    }

    pub fn entity_name(&self, id: EntityTypeId) -> &str {
        &self.entity_type(id).name
    }

    /// The type itself followed by its base types, nearest first.
    pub fn base_chain(&self, id: EntityTypeId) -> Vec<EntityTypeId> {
        let mut chain = vec![id];
        let mut current = self.entity_type(id).base;
        while let Some(base) = current {
            if chain.contains(&base) {
                break;
            }
            chain.push(base);
            current = self.entity_type(base).base;
        }
        chain
    }

    pub fn root_type(&self, id: EntityTypeId) -> EntityTypeId {
        *self.base_chain(id).last().unwrap_or(&id)
    }

    pub fn is_assignable_from(&self, base: EntityTypeId, derived: EntityTypeId) -> bool {
        self.base_chain(derived).contains(&base)
    }

    pub fn direct_derived_types(&self, id: EntityTypeId) -> &[EntityTypeId] {
        &self.entity_type(id).direct_derived
    }

    /// All transitively derived types, depth first.
    pub fn derived_types(&self, id: EntityTypeId) -> Vec<EntityTypeId> {
        let mut out = Vec::new();
        let mut stack: Vec<EntityTypeId> = self.entity_type(id).direct_derived.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.entity_type(next).direct_derived.iter().rev().copied());
        }
        out
    }

    /// The type and all its derived types: every runtime type a query over `id` can return.
    pub fn concrete_types(&self, id: EntityTypeId) -> Vec<EntityTypeId> {
        let mut out = vec![id];
        out.extend(self.derived_types(id));
        out
    }

    fn inherited<T: Copy>(&self, id: EntityTypeId, declared: impl Fn(&EntityType) -> &[T]) -> Vec<T> {
        let mut chain = self.base_chain(id);
        chain.reverse();
        chain
            .into_iter()
            .flat_map(|t| declared(self.entity_type(t)).iter().copied())
            .collect()
    }

    fn on_derived<T: Copy>(&self, id: EntityTypeId, declared: impl Fn(&EntityType) -> &[T]) -> Vec<T> {
        self.derived_types(id)
            .into_iter()
            .flat_map(|t| declared(self.entity_type(t)).iter().copied())
            .collect()
    }

    pub fn declared_properties(&self, id: EntityTypeId) -> &[PropertyId] {
        &self.entity_type(id).properties
    }

    /// Properties of the type including inherited ones, root first.
    pub fn properties(&self, id: EntityTypeId) -> Vec<PropertyId> {
        self.inherited(id, |e| &e.properties)
    }

    pub fn derived_properties(&self, id: EntityTypeId) -> Vec<PropertyId> {
        self.on_derived(id, |e| &e.properties)
    }

    /// Every property stored for the hierarchy rows a query over `id` can return.
    pub fn hierarchy_properties(&self, id: EntityTypeId) -> Vec<PropertyId> {
        let mut props = self.properties(id);
        props.extend(self.derived_properties(id));
        props
    }

    pub fn declared_keys(&self, id: EntityTypeId) -> &[KeyId] {
        &self.entity_type(id).keys
    }

    pub fn keys(&self, id: EntityTypeId) -> Vec<KeyId> {
        self.inherited(id, |e| &e.keys)
    }

    pub fn declared_foreign_keys(&self, id: EntityTypeId) -> &[ForeignKeyId] {
        &self.entity_type(id).foreign_keys
    }

    pub fn foreign_keys(&self, id: EntityTypeId) -> Vec<ForeignKeyId> {
        self.inherited(id, |e| &e.foreign_keys)
    }

    pub fn derived_foreign_keys(&self, id: EntityTypeId) -> Vec<ForeignKeyId> {
        self.on_derived(id, |e| &e.foreign_keys)
    }

    pub fn declared_indexes(&self, id: EntityTypeId) -> &[IndexId] {
        &self.entity_type(id).indexes
    }

    pub fn indexes(&self, id: EntityTypeId) -> Vec<IndexId> {
        self.inherited(id, |e| &e.indexes)
    }

    pub fn derived_indexes(&self, id: EntityTypeId) -> Vec<IndexId> {
        self.on_derived(id, |e| &e.indexes)
    }

    pub fn declared_navigations(&self, id: EntityTypeId) -> &[NavigationId] {
        &self.entity_type(id).navigations
    }

    pub fn navigations(&self, id: EntityTypeId) -> Vec<NavigationId> {
        self.inherited(id, |e| &e.navigations)
    }

    pub fn derived_navigations(&self, id: EntityTypeId) -> Vec<NavigationId> {
        self.on_derived(id, |e| &e.navigations)
    }

    pub fn find_declared_property(&self, id: EntityTypeId, name: &str) -> Option<PropertyId> {
        self.entity_type(id)
            .properties
            .iter()
            .copied()
            .find(|p| self.property(*p).name == name)
    }

    /// Finds a property on the type or one of its base types.
    pub fn find_property(&self, id: EntityTypeId, name: &str) -> Option<PropertyId> {
        self.base_chain(id)
            .into_iter()
            .find_map(|t| self.find_declared_property(t, name))
    }

    /// Finds a property on the type, its base types or its derived types.
    pub fn find_property_in_hierarchy(&self, id: EntityTypeId, name: &str) -> Option<PropertyId> {
        self.find_property(id, name).or_else(|| {
            self.derived_types(id)
                .into_iter()
                .find_map(|t| self.find_declared_property(t, name))
        })
    }

    pub fn find_declared_navigation(&self, id: EntityTypeId, name: &str) -> Option<NavigationId> {
        self.entity_type(id)
            .navigations
            .iter()
            .copied()
            .find(|n| self.navigation(*n).name == name)
    }

    pub fn find_navigation(&self, id: EntityTypeId, name: &str) -> Option<NavigationId> {
        self.base_chain(id)
            .into_iter()
            .find_map(|t| self.find_declared_navigation(t, name))
    }

    /// Primary key of the type (declared on the hierarchy root).
    pub fn primary_key(&self, id: EntityTypeId) -> Option<KeyId> {
        self.entity_type(self.root_type(id)).primary_key
    }

    pub fn find_key(&self, id: EntityTypeId, properties: &[PropertyId]) -> Option<KeyId> {
        self.keys(id)
            .into_iter()
            .find(|k| self.key(*k).properties == properties)
    }

    pub fn find_foreign_key(
        &self,
        id: EntityTypeId,
        properties: &[PropertyId],
        principal_key: KeyId,
    ) -> Option<ForeignKeyId> {
        self.foreign_keys(id).into_iter().find(|fk| {
            let fk = self.foreign_key(*fk);
            fk.properties == properties && fk.principal_key == principal_key
        })
    }

    pub fn find_index(&self, id: EntityTypeId, properties: &[PropertyId]) -> Option<IndexId> {
        self.indexes(id)
            .into_iter()
            .find(|i| self.index(*i).properties == properties)
    }

    /// The primary key the property belongs to, if any.
    pub fn find_containing_primary_key(&self, property: PropertyId) -> Option<KeyId> {
        let declaring = self.property(property).declaring;
        let pk = self.primary_key(declaring)?;
        self.key(pk).properties.contains(&property).then_some(pk)
    }

    /// Foreign keys (anywhere in the model) whose principal is the type or one of its bases.
    pub fn referencing_foreign_keys(&self, id: EntityTypeId) -> Vec<ForeignKeyId> {
        let chain = self.base_chain(id);
        (0..self.foreign_keys.len())
            .filter_map(|i| self.foreign_keys[i].as_ref().map(|fk| (ForeignKeyId(i), fk)))
            .filter(|(_, fk)| chain.contains(&fk.principal_type))
            .map(|(id, _)| id)
            .collect()
    }

    /// Table of the type; derived types share the table of their root.
    pub fn table_name(&self, id: EntityTypeId) -> &str {
        &self.entity_type(self.root_type(id)).table
    }

    pub fn schema(&self, id: EntityTypeId) -> Option<&str> {
        self.entity_type(self.root_type(id))
            .schema
            .as_deref()
            .or(self.default_schema.as_deref())
    }

    /// For table splitting: the foreign key linking this type's primary key to the primary key of
    /// another type mapped to the same table and schema.
    pub fn find_shared_table_link(&self, id: EntityTypeId) -> Option<ForeignKeyId> {
        let pk = self.primary_key(id)?;
        let pk_props = &self.key(pk).properties;
        self.foreign_keys(id).into_iter().find(|fk_id| {
            let fk = self.foreign_key(*fk_id);
            &fk.properties == pk_props
                && fk.principal_type != id
                && Some(fk.principal_key) == self.primary_key(fk.principal_type)
                && self.table_name(fk.principal_type) == self.table_name(id)
                && self.schema(fk.principal_type) == self.schema(id)
        })
    }

    pub fn discriminator_property(&self, id: EntityTypeId) -> Option<PropertyId> {
        self.entity_type(self.root_type(id)).discriminator_property
    }

    pub fn discriminator_value(&self, id: EntityTypeId) -> Option<&Value> {
        self.entity_type(id).discriminator_value.as_ref()
    }

    /// Maps a discriminator value read from the store to the concrete type within the
    /// hierarchy of `id`.
    pub fn find_by_discriminator(&self, id: EntityTypeId, value: &Value) -> Option<EntityTypeId> {
        self.concrete_types(id)
            .into_iter()
            .find(|t| self.entity_type(*t).discriminator_value.as_ref() == Some(value))
    }

    pub fn is_owned(&self, id: EntityTypeId) -> bool {
        self.entity_type(id).defining.is_some()
    }

    /// Type reached by following the navigation.
    pub fn navigation_target(&self, id: NavigationId) -> EntityTypeId {
        let nav = self.navigation(id);
        let fk = self.foreign_key(nav.foreign_key);
        if nav.on_dependent {
            fk.principal_type
        } else {
            fk.declaring
        }
    }

    /// A principal-side navigation over a non-unique foreign key.
    pub fn is_collection(&self, id: NavigationId) -> bool {
        let nav = self.navigation(id);
        !nav.on_dependent && !self.foreign_key(nav.foreign_key).unique
    }

    /// The navigation on the other end of the relationship.
    pub fn inverse(&self, id: NavigationId) -> Option<NavigationId> {
        let nav = self.navigation(id);
        let fk = self.foreign_key(nav.foreign_key);
        if nav.on_dependent {
            fk.principal_to_dependent
        } else {
            fk.dependent_to_principal
        }
    }

    pub fn entity_type_count(&self) -> usize {
        self.entity_types.len()
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub(crate) fn property_names(&self, props: &[PropertyId]) -> String {
        props
            .iter()
            .map(|p| self.property(*p).name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
