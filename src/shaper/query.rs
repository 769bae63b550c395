//! The materializing sequence: pulls rows from a cursor and yields shaped results, resolving
//! entity identity and gathering collections from consecutive rows.

use super::cursor::{AsyncRowCursor, RowCursor, ValueBuffer};
use super::instance::{EntityInstance, ShapedValue};
use super::shaper::{CollectionShaper, EntityShaper, IncludeTarget, ScalarSlot, Shaper};
use super::tracking::{EntityEntry, EntityKey, IdentityScope, StateManager};
use crate::error::{QueryError, Result};
use crate::model::Model;
use crate::options::TrackingBehavior;
use crate::query::{Evaluator, Lambda, QueryParameters};
use crate::translate::CompiledQuery;
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shapes rows from a synchronous cursor. `scope` receives tracked entities and is required for
/// tracking queries; no-tracking queries ignore it.
pub fn shape<'a, C: RowCursor>(
    cursor: C,
    query: &'a CompiledQuery,
    parameters: &'a QueryParameters,
    scope: Option<Box<dyn IdentityScope + 'a>>,
) -> Result<ShapedQuery<'a, C>> {
    ShapedQuery::new(cursor, query, parameters, scope)
}

/// Like [`shape`], for cursors read with [`ShapedQuery::next_async`].
pub fn shape_async<'a, C: AsyncRowCursor>(
    cursor: C,
    query: &'a CompiledQuery,
    parameters: &'a QueryParameters,
    scope: Option<Box<dyn IdentityScope + 'a>>,
) -> Result<ShapedQuery<'a, C>> {
    ShapedQuery::new(cursor, query, parameters, scope)
}

pub struct ShapedQuery<'a, C> {
    cursor: C,
    materializer: Materializer<'a>,
    finished: bool,
}

impl<'a, C> ShapedQuery<'a, C> {
    fn new(
        cursor: C,
        query: &'a CompiledQuery,
        parameters: &'a QueryParameters,
        scope: Option<Box<dyn IdentityScope + 'a>>,
    ) -> Result<Self> {
        query.shaper.validate(&query.model, query.tracking)?;
        let scope: Option<Box<dyn IdentityScope + 'a>> = match query.tracking {
            TrackingBehavior::TrackAll => Some(scope.ok_or_else(|| {
                QueryError::InvalidOperation("a tracking query needs an identity scope".into())
            })?),
            TrackingBehavior::NoTracking => None,
            TrackingBehavior::NoTrackingWithIdentityResolution => Some(Box::new(StateManager::new())),
        };
        Ok(ShapedQuery {
            cursor,
            materializer: Materializer {
                model: &query.model,
                shaper: &query.shaper,
                identifier: &query.identifier,
                spans_rows: query.shaper.spans_rows(),
                filters: &query.client_filters,
                evaluator: Evaluator::new(parameters, &query.client_functions),
                scope,
                pending: IndexMap::new(),
                current: None,
            },
            finished: false,
        })
    }

    fn step(&mut self, row: Result<Option<ValueBuffer>>) -> Option<Result<ShapedValue>> {
        let produced = match row {
            Ok(Some(row)) => self.materializer.push_row(row),
            Ok(None) => {
                self.finished = true;
                self.materializer.finish()
            }
            Err(e) => Err(e),
        };
        match produced {
            Ok(Some(v)) => Some(Ok(v)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl<C: RowCursor> Iterator for ShapedQuery<'_, C> {
    type Item = Result<ShapedValue>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let row = self.cursor.read();
            if let Some(item) = self.step(row) {
                return Some(item);
            }
        }
        None
    }
}

impl<C: AsyncRowCursor> ShapedQuery<'_, C> {
    /// Next result; cancellation is observed before each row read.
    pub async fn next_async(&mut self, cancel: &CancellationToken) -> Option<Result<ShapedValue>> {
        while !self.finished {
            if cancel.is_cancelled() {
                self.finished = true;
                return Some(Err(QueryError::Cancelled));
            }
            let row = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(QueryError::Cancelled),
                row = self.cursor.read_async() => row,
            };
            if let Some(item) = self.step(row) {
                return Some(item);
            }
        }
        None
    }

    pub async fn collect_async(mut self, cancel: &CancellationToken) -> Result<Vec<ShapedValue>> {
        let mut out = Vec::new();
        while let Some(item) = self.next_async(cancel).await {
            out.push(item?);
        }
        Ok(out)
    }
}

/// A result under construction; mirrors the structure of its [`Shaper`].
enum Building {
    Done(ShapedValue),
    /// `includes` is aligned with the shaper's includes (empty when the entity is null).
    Entity {
        instance: Option<Arc<EntityInstance>>,
        includes: Vec<Building>,
    },
    Object(Vec<Building>),
    Collection(IndexMap<Vec<Value>, Building>),
    Grouping {
        key: ShapedValue,
        elements: IndexMap<Vec<Value>, Building>,
    },
    Client(Box<Building>),
}

struct Materializer<'a> {
    model: &'a Model,
    shaper: &'a Shaper,
    identifier: &'a [usize],
    spans_rows: bool,
    filters: &'a [Lambda],
    evaluator: Evaluator<'a>,
    scope: Option<Box<dyn IdentityScope + 'a>>,
    /// Entries of the result under construction; they reach `scope` once that result completes.
    pending: IndexMap<EntityKey, EntityEntry>,
    /// Result spanning the rows read so far, with its identifier values.
    current: Option<(Vec<Value>, Building)>,
}

impl Materializer<'_> {
    fn push_row(&mut self, row: ValueBuffer) -> Result<Option<ShapedValue>> {
        if !self.spans_rows {
            let b = self.build(self.shaper, &row)?;
            return self.complete(b);
        }
        let id = read_raw(&row, self.identifier)?;
        match self.current.take() {
            Some((current_id, mut b)) if current_id == id => {
                self.accumulate(self.shaper, &mut b, &row)?;
                self.current = Some((current_id, b));
                Ok(None)
            }
            previous => {
                let done = match previous {
                    Some((_, done)) => self.complete(done)?,
                    None => None,
                };
                let b = self.build(self.shaper, &row)?;
                self.current = Some((id, b));
                Ok(done)
            }
        }
    }

    fn finish(&mut self) -> Result<Option<ShapedValue>> {
        match self.current.take() {
            Some((_, b)) => self.complete(b),
            None => Ok(None),
        }
    }

    /// Registers the entries of a finished result, finalizes it and applies the client-side filters.
    fn complete(&mut self, b: Building) -> Result<Option<ShapedValue>> {
        if let Some(scope) = self.scope.as_mut() {
            for (_, entry) in self.pending.drain(..) {
                scope.start_tracking(entry);
            }
        }
        let value = self.finalize(self.shaper, b)?;
        for filter in self.filters {
            if !self.evaluator.test(filter, value.clone())? {
                return Ok(None);
            }
        }
        Ok(Some(value))
    }

    fn build(&mut self, shaper: &Shaper, row: &ValueBuffer) -> Result<Building> {
        Ok(match shaper {
            Shaper::Scalar(slot) => Building::Done(to_shaped(self.read(row, slot, "<projection>", "value")?)),
            Shaper::Entity(es) => self.build_entity(es, row)?,
            Shaper::Object(members) => Building::Object(
                members
                    .iter()
                    .map(|(_, s)| self.build(s, row))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Shaper::Values(slots) => Building::Done(ShapedValue::Collection(
                slots
                    .iter()
                    .map(|s| self.read(row, s, "<values>", "value").map(ShapedValue::Scalar))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Shaper::Collection(cs) => {
                let mut items = IndexMap::new();
                self.add_element(cs, &mut items, row)?;
                Building::Collection(items)
            }
            Shaper::Grouping { key, elements: cs } => {
                let key_building = self.build(key, row)?;
                let key = self.finalize(key, key_building)?;
                let mut elements = IndexMap::new();
                self.add_element(cs, &mut elements, row)?;
                Building::Grouping { key, elements }
            }
            Shaper::Client { input, .. } => Building::Client(Box::new(self.build(input, row)?)),
        })
    }

    fn build_entity(&mut self, es: &EntityShaper, row: &ValueBuffer) -> Result<Building> {
        let instance = self.materialize(es, row)?;
        let mut includes = Vec::new();
        if instance.is_some() {
            for include in &es.includes {
                includes.push(match &include.target {
                    IncludeTarget::Reference(target) => self.build_entity(target, row)?,
                    IncludeTarget::Collection(cs) => {
                        let mut items = IndexMap::new();
                        self.add_element(cs, &mut items, row)?;
                        Building::Collection(items)
                    }
                });
            }
        }
        Ok(Building::Entity { instance, includes })
    }

    fn add_element(
        &mut self,
        cs: &CollectionShaper,
        items: &mut IndexMap<Vec<Value>, Building>,
        row: &ValueBuffer,
    ) -> Result<()> {
        let id = read_raw(row, &cs.identifier)?;
        if id.iter().all(Value::is_null) {
            return Ok(());
        }
        match items.get_mut(&id) {
            Some(existing) => self.accumulate(&cs.element, existing, row),
            None => {
                let b = self.build(&cs.element, row)?;
                items.insert(id, b);
                Ok(())
            }
        }
    }

    /// Feeds a further row of the same result into its collections.
    fn accumulate(&mut self, shaper: &Shaper, b: &mut Building, row: &ValueBuffer) -> Result<()> {
        match (shaper, b) {
            (Shaper::Entity(es), b) => self.accumulate_entity(es, b, row),
            (Shaper::Object(members), Building::Object(parts)) => {
                for ((_, s), part) in members.iter().zip(parts.iter_mut()) {
                    self.accumulate(s, part, row)?;
                }
                Ok(())
            }
            (Shaper::Collection(cs), Building::Collection(items)) => self.add_element(cs, items, row),
            (Shaper::Grouping { elements: cs, .. }, Building::Grouping { elements, .. }) => {
                self.add_element(cs, elements, row)
            }
            (Shaper::Client { input, .. }, Building::Client(inner)) => self.accumulate(input, inner, row),
            _ => Ok(()),
        }
    }

    fn accumulate_entity(&mut self, es: &EntityShaper, b: &mut Building, row: &ValueBuffer) -> Result<()> {
        let Building::Entity { includes, .. } = b else {
            return Ok(());
        };
        for (include, part) in es.includes.iter().zip(includes.iter_mut()) {
            match (&include.target, part) {
                (IncludeTarget::Reference(target), part) => self.accumulate_entity(target, part, row)?,
                (IncludeTarget::Collection(cs), Building::Collection(items)) => self.add_element(cs, items, row)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn finalize(&self, shaper: &Shaper, b: Building) -> Result<ShapedValue> {
        Ok(match (shaper, b) {
            (_, Building::Done(v)) => v,
            (Shaper::Entity(es), b) => self.finalize_entity(es, b)?,
            (Shaper::Object(members), Building::Object(parts)) => ShapedValue::Object(
                members
                    .iter()
                    .zip(parts)
                    .map(|((name, s), part)| Ok((name.clone(), self.finalize(s, part)?)))
                    .collect::<Result<Vec<_>>>()?,
            ),
            (Shaper::Collection(cs), Building::Collection(items)) => ShapedValue::Collection(
                items
                    .into_values()
                    .map(|item| self.finalize(&cs.element, item))
                    .collect::<Result<Vec<_>>>()?,
            ),
            (Shaper::Grouping { elements: cs, .. }, Building::Grouping { key, elements }) => ShapedValue::Grouping {
                key: Box::new(key),
                elements: elements
                    .into_values()
                    .map(|item| self.finalize(&cs.element, item))
                    .collect::<Result<Vec<_>>>()?,
            },
            (Shaper::Client { input, selector }, Building::Client(inner)) => {
                let value = self.finalize(input, *inner)?;
                let args = match value {
                    ShapedValue::Object(members) if selector.params.len() > 1 => {
                        members.into_iter().map(|(_, v)| v).collect()
                    }
                    value => vec![value],
                };
                self.evaluator.apply(selector, args)?
            }
            _ => {
                return Err(QueryError::InvalidOperation(
                    "result under construction does not match its shape".into(),
                ))
            }
        })
    }

    fn finalize_entity(&self, es: &EntityShaper, b: Building) -> Result<ShapedValue> {
        let Building::Entity {
            instance: Some(instance),
            includes,
        } = b
        else {
            return Ok(ShapedValue::Null);
        };
        for (include, part) in es.includes.iter().zip(includes) {
            match &include.target {
                IncludeTarget::Reference(target) => {
                    let value = self.finalize_entity(target, part)?;
                    instance.set_navigation(&include.navigation, value);
                }
                IncludeTarget::Collection(cs) => {
                    instance.ensure_collection(&include.navigation);
                    if let Building::Collection(items) = part {
                        for item in items.into_values() {
                            if let ShapedValue::Entity(e) = self.finalize(&cs.element, item)? {
                                instance.add_to_collection(&include.navigation, e);
                            }
                        }
                    }
                }
            }
        }
        Ok(ShapedValue::Entity(instance))
    }

    /// Reads (or resolves) the entity of `es` from the row; `None` for an outer-join miss.
    fn materialize(&mut self, es: &EntityShaper, row: &ValueBuffer) -> Result<Option<Arc<EntityInstance>>> {
        let model = self.model;
        let declared_name = model.entity_name(es.entity_type);
        let key = read_raw(row, &es.key)?;
        if key.iter().any(Value::is_null) {
            return if es.nullable {
                Ok(None)
            } else {
                Err(QueryError::data(declared_name, "the primary key value read from the store is null"))
            };
        }
        if key.is_empty() && es.nullable && es.properties.iter().all(|p| row.is_null(p.slot.ordinal)) {
            return Ok(None);
        }

        let concrete = match &es.discriminator {
            Some(slot) => {
                let value = self.read(row, slot, declared_name, "discriminator")?;
                model.find_by_discriminator(es.entity_type, &value).ok_or_else(|| {
                    QueryError::data(
                        declared_name,
                        format!("unable to materialize an entity with discriminator value {}", value),
                    )
                })?
            }
            None => es.entity_type,
        };
        let identity = (!key.is_empty()).then(|| EntityKey {
            root: model.root_type(concrete),
            values: key,
        });
        if let (Some(scope), Some(identity)) = (self.scope.as_ref(), identity.as_ref()) {
            if let Some(existing) = scope.try_get(identity) {
                return Ok(Some(existing));
            }
            if let Some(entry) = self.pending.get(identity) {
                return Ok(Some(entry.instance.clone()));
            }
        }

        let concrete_name = model.entity_name(concrete);
        let own: HashSet<_> = model.properties(concrete).into_iter().collect();
        let mut values = IndexMap::new();
        let mut snapshot = IndexMap::new();
        for p in es.properties.iter().filter(|p| own.contains(&p.property)) {
            let v = self.read(row, &p.slot, concrete_name, &p.name)?;
            if !p.shadow {
                values.insert(p.name.clone(), v.clone());
            }
            snapshot.insert(p.name.clone(), v);
        }
        let instance = Arc::new(EntityInstance::new(concrete, concrete_name, values));
        if let (Some(_), Some(key)) = (self.scope.as_ref(), identity) {
            self.pending.insert(
                key.clone(),
                EntityEntry {
                    entity_type: concrete,
                    key,
                    instance: instance.clone(),
                    snapshot,
                },
            );
        }
        Ok(Some(instance))
    }

    /// Reads a column and converts it to the slot's model type.
    fn read(&self, row: &ValueBuffer, slot: &ScalarSlot, owner: &str, member: &str) -> Result<Value> {
        let raw = row.value(slot.ordinal)?;
        if raw.is_null() {
            return if slot.ty.can_be_null() {
                Ok(Value::Null)
            } else {
                Err(QueryError::data(
                    owner,
                    format!("'{}' of type {} cannot be null, but the store returned null", member, slot.ty),
                ))
            };
        }
        let value = match &slot.mapping {
            Some(m) => m.from_provider(raw)?,
            None => raw.clone(),
        };
        value.clone().coerce_to(&slot.ty).ok_or_else(|| {
            QueryError::data(
                owner,
                format!(
                    "'{}' expects {} but the store returned {} value {}",
                    member,
                    slot.ty,
                    value.kind_name(),
                    value
                ),
            )
        })
    }
}

fn read_raw(row: &ValueBuffer, ordinals: &[usize]) -> Result<Vec<Value>> {
    ordinals.iter().map(|o| row.value(*o).cloned()).collect()
}

fn to_shaped(v: Value) -> ShapedValue {
    if v.is_null() {
        ShapedValue::Null
    } else {
        ShapedValue::Scalar(v)
    }
}
