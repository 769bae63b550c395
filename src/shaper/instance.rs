//! Materialized results: entity instances and the shaped values queries yield.

use crate::case::to_camel_case;
use crate::model::EntityTypeId;
use crate::value::Value;
use indexmap::IndexMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// One materialized entity. Holds the values of its CLR-visible properties; shadow property
/// values live only in the tracking snapshot.
pub struct EntityInstance {
    entity_type: EntityTypeId,
    type_name: String,
    values: IndexMap<String, Value>,
    navigations: Mutex<IndexMap<String, ShapedValue>>,
}

impl EntityInstance {
    pub fn new(entity_type: EntityTypeId, type_name: impl Into<String>, values: IndexMap<String, Value>) -> Self {
        EntityInstance {
            entity_type,
            type_name: type_name.into(),
            values,
            navigations: Mutex::new(IndexMap::new()),
        }
    }

    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    fn navs(&self) -> MutexGuard<'_, IndexMap<String, ShapedValue>> {
        self.navigations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Value of a loaded navigation.
    pub fn navigation(&self, name: &str) -> Option<ShapedValue> {
        self.navs().get(name).cloned()
    }

    pub fn loaded_navigations(&self) -> Vec<String> {
        self.navs().keys().cloned().collect()
    }

    pub fn set_navigation(&self, name: &str, value: ShapedValue) {
        self.navs().insert(name.to_string(), value);
    }

    /// Marks a collection navigation as loaded (empty if nothing was added yet).
    pub fn ensure_collection(&self, name: &str) {
        self.navs()
            .entry(name.to_string())
            .or_insert_with(|| ShapedValue::Collection(Vec::new()));
    }

    /// Appends to a collection navigation unless the same instance is already there.
    pub fn add_to_collection(&self, name: &str, item: Arc<EntityInstance>) {
        let mut navs = self.navs();
        let entry = navs
            .entry(name.to_string())
            .or_insert_with(|| ShapedValue::Collection(Vec::new()));
        if let ShapedValue::Collection(items) = entry {
            let present = items
                .iter()
                .any(|i| matches!(i, ShapedValue::Entity(e) if Arc::ptr_eq(e, &item)));
            if !present {
                items.push(ShapedValue::Entity(item));
            }
        }
    }
}

impl fmt::Debug for EntityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(&self.type_name)
            .field("values", &self.values)
            .field("navigations", &self.loaded_navigations())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum ShapedValue {
    Null,
    Scalar(Value),
    Entity(Arc<EntityInstance>),
    /// Anonymous object: members in construction order.
    Object(Vec<(String, ShapedValue)>),
    Collection(Vec<ShapedValue>),
    Grouping {
        key: Box<ShapedValue>,
        elements: Vec<ShapedValue>,
    },
}

impl PartialEq for ShapedValue {
    /// Entities compare by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ShapedValue::Null, ShapedValue::Null) => true,
            (ShapedValue::Scalar(a), ShapedValue::Scalar(b)) => a == b,
            (ShapedValue::Entity(a), ShapedValue::Entity(b)) => Arc::ptr_eq(a, b),
            (ShapedValue::Object(a), ShapedValue::Object(b)) => a == b,
            (ShapedValue::Collection(a), ShapedValue::Collection(b)) => a == b,
            (ShapedValue::Grouping { key: ka, elements: ea }, ShapedValue::Grouping { key: kb, elements: eb }) => {
                ka == kb && ea == eb
            }
            _ => false,
        }
    }
}

impl ShapedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ShapedValue::Null | ShapedValue::Scalar(Value::Null))
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ShapedValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Arc<EntityInstance>> {
        match self {
            ShapedValue::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&[ShapedValue]> {
        match self {
            ShapedValue::Collection(items) => Some(items),
            ShapedValue::Grouping { elements, .. } => Some(elements),
            _ => None,
        }
    }

    /// Member of an object, property of an entity (as a scalar) or loaded navigation.
    pub fn field(&self, name: &str) -> Option<ShapedValue> {
        match self {
            ShapedValue::Object(members) => members.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone()),
            ShapedValue::Entity(e) => e
                .get(name)
                .map(|v| ShapedValue::Scalar(v.clone()))
                .or_else(|| e.navigation(name)),
            ShapedValue::Grouping { key, .. } if name == "Key" => Some((**key).clone()),
            _ => None,
        }
    }

    /// Renders the value as JSON; `camel_case` lower-cases the leading letter of member names.
    pub fn to_json(&self, camel_case: bool) -> serde_json::Value {
        let mut visiting = Vec::new();
        self.to_json_inner(camel_case, &mut visiting)
    }

    fn to_json_inner(&self, camel_case: bool, visiting: &mut Vec<*const EntityInstance>) -> serde_json::Value {
        let key = |name: &str| {
            if camel_case {
                to_camel_case(name)
            } else {
                name.to_string()
            }
        };
        match self {
            ShapedValue::Null => serde_json::Value::Null,
            ShapedValue::Scalar(v) => v.to_json(),
            ShapedValue::Entity(e) => {
                let ptr = Arc::as_ptr(e);
                if visiting.contains(&ptr) {
                    return serde_json::Value::Null;
                }
                visiting.push(ptr);
                let mut obj = serde_json::Map::new();
                for (name, value) in e.values() {
                    obj.insert(key(name), value.to_json());
                }
                for name in e.loaded_navigations() {
                    if let Some(nav) = e.navigation(&name) {
                        obj.insert(key(&name), nav.to_json_inner(camel_case, visiting));
                    }
                }
                visiting.pop();
                serde_json::Value::Object(obj)
            }
            ShapedValue::Object(members) => serde_json::Value::Object(
                members
                    .iter()
                    .map(|(n, v)| (key(n), v.to_json_inner(camel_case, visiting)))
                    .collect(),
            ),
            ShapedValue::Collection(items) => {
                serde_json::Value::Array(items.iter().map(|i| i.to_json_inner(camel_case, visiting)).collect())
            }
            ShapedValue::Grouping { key: k, elements } => {
                let mut obj = serde_json::Map::new();
                obj.insert(key("Key"), k.to_json_inner(camel_case, visiting));
                obj.insert(
                    key("Elements"),
                    serde_json::Value::Array(elements.iter().map(|i| i.to_json_inner(camel_case, visiting)).collect()),
                );
                serde_json::Value::Object(obj)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blog(id: i64) -> Arc<EntityInstance> {
        let mut values = IndexMap::new();
        values.insert("Id".to_string(), Value::Int(id));
        values.insert("Name".to_string(), Value::from("ADO.NET"));
        Arc::new(EntityInstance::new(EntityTypeId(0), "Blog", values))
    }

    #[test]
    fn collection_navigation_ignores_duplicates() {
        let b = blog(1);
        let p = blog(2);
        b.add_to_collection("Posts", p.clone());
        b.add_to_collection("Posts", p);
        assert_eq!(b.navigation("Posts").and_then(|n| n.as_collection().map(|c| c.len())), Some(1));
    }

    #[test]
    fn renders_camel_case_json_without_cycles() {
        let b = blog(1);
        b.set_navigation("Self", ShapedValue::Entity(b.clone()));
        assert_eq!(
            ShapedValue::Entity(b).to_json(true),
            json!({ "id": 1, "name": "ADO.NET", "self": null })
        );
    }

    #[test]
    fn entities_compare_by_identity() {
        assert_ne!(ShapedValue::Entity(blog(1)), ShapedValue::Entity(blog(1)));
        let b = blog(1);
        assert_eq!(ShapedValue::Entity(b.clone()), ShapedValue::Entity(b));
    }
}
