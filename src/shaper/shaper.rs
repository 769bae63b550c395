//! Shape descriptors: how one result is read from a row, built by the compiler from the projection
//! mapping and the ordinals of the final projection list.

use crate::error::{QueryError, Result};
use crate::model::{EntityTypeId, Model, PropertyId};
use crate::options::TrackingBehavior;
use crate::query::Lambda;
use crate::storage::TypeMapping;
use crate::value::ClrType;

/// A single column read: ordinal, expected type, and the mapping whose converter turns the store
/// value into the model value.
#[derive(Clone, Debug, PartialEq)]
pub struct ScalarSlot {
    pub ordinal: usize,
    pub ty: ClrType,
    pub mapping: Option<TypeMapping>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PropertySlot {
    pub property: PropertyId,
    pub name: String,
    pub shadow: bool,
    pub slot: ScalarSlot,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntityShaper {
    pub entity_type: EntityTypeId,
    /// One slot per property of the hierarchy.
    pub properties: Vec<PropertySlot>,
    /// Ordinals of the primary-key columns; empty for keyless types.
    pub key: Vec<usize>,
    pub discriminator: Option<ScalarSlot>,
    /// On the optional side of an outer join.
    pub nullable: bool,
    pub includes: Vec<IncludeShaper>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IncludeShaper {
    pub navigation: String,
    pub target: IncludeTarget,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IncludeTarget {
    Reference(Box<EntityShaper>),
    Collection(Box<CollectionShaper>),
}

/// Elements gathered from consecutive rows of one parent. `identifier` holds the element's
/// identifying ordinals; rows where all of them are null carry no element.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectionShaper {
    pub identifier: Vec<usize>,
    pub element: Box<Shaper>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Shaper {
    Scalar(ScalarSlot),
    Entity(EntityShaper),
    /// Anonymous object: members in construction order.
    Object(Vec<(String, Shaper)>),
    /// Raw column values of an entity, as an ordered collection of scalars.
    Values(Vec<ScalarSlot>),
    Collection(CollectionShaper),
    Grouping {
        key: Box<Shaper>,
        elements: CollectionShaper,
    },
    /// Projection evaluated after materialization; `selector` receives the shaped input.
    Client { input: Box<Shaper>, selector: Lambda },
}

impl Shaper {
    /// Whether results span several rows (a collection appears anywhere in the shape).
    pub fn spans_rows(&self) -> bool {
        match self {
            Shaper::Scalar(_) | Shaper::Values(_) => false,
            Shaper::Entity(e) => e.spans_rows(),
            Shaper::Object(members) => members.iter().any(|(_, s)| s.spans_rows()),
            Shaper::Collection(_) | Shaper::Grouping { .. } => true,
            Shaper::Client { input, .. } => input.spans_rows(),
        }
    }

    pub fn entities(&self) -> Vec<&EntityShaper> {
        let mut out = Vec::new();
        self.collect_entities(&mut out);
        out
    }

    fn collect_entities<'a>(&'a self, out: &mut Vec<&'a EntityShaper>) {
        match self {
            Shaper::Scalar(_) | Shaper::Values(_) => {}
            Shaper::Entity(e) => e.collect_entities(out),
            Shaper::Object(members) => members.iter().for_each(|(_, s)| s.collect_entities(out)),
            Shaper::Collection(c) => c.element.collect_entities(out),
            Shaper::Grouping { key, elements } => {
                key.collect_entities(out);
                elements.element.collect_entities(out);
            }
            Shaper::Client { input, .. } => input.collect_entities(out),
        }
    }

    /// Rejects shapes that cannot be materialized under `tracking`.
    pub fn validate(&self, model: &Model, tracking: TrackingBehavior) -> Result<()> {
        if tracking != TrackingBehavior::TrackAll {
            return Ok(());
        }
        match self.entities().into_iter().find(|e| e.key.is_empty()) {
            Some(keyless) => Err(QueryError::InvalidOperation(format!(
                "the entity type '{}' has no primary key and cannot be tracked; use a no-tracking query",
                model.entity_name(keyless.entity_type)
            ))),
            None => Ok(()),
        }
    }
}

impl EntityShaper {
    fn spans_rows(&self) -> bool {
        self.includes.iter().any(|i| match &i.target {
            IncludeTarget::Reference(r) => r.spans_rows(),
            IncludeTarget::Collection(_) => true,
        })
    }

    fn collect_entities<'a>(&'a self, out: &mut Vec<&'a EntityShaper>) {
        out.push(self);
        for include in &self.includes {
            match &include.target {
                IncludeTarget::Reference(r) => r.collect_entities(out),
                IncludeTarget::Collection(c) => c.element.collect_entities(out),
            }
        }
    }
}
