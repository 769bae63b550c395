//! Entity projections over tables and navigation expansion into joins.

use crate::error::{QueryError, Result};
use crate::model::{EntityTypeId, Model, NavigationId, PropertyId};
use crate::sql::{AliasGenerator, EntityProjection, JoinKind, SelectExpression, SqlExpression, SqlExpressionFactory, TableSource};
use crate::storage::TypeMappingSource;
use indexmap::IndexMap;

/// Columns of every hierarchy property of `entity_type`, read from the table aliased `alias`.
pub(crate) fn entity_projection(
    model: &Model,
    mappings: &dyn TypeMappingSource,
    entity_type: EntityTypeId,
    alias: &str,
    nullable: bool,
) -> EntityProjection {
    let own = model.properties(entity_type);
    let columns: IndexMap<PropertyId, SqlExpression> = model
        .hierarchy_properties(entity_type)
        .into_iter()
        .map(|id| {
            let p = model.property(id);
            let column_nullable = nullable || p.nullable || !own.contains(&id);
            let ty = if column_nullable {
                p.clr_type.clone().make_nullable()
            } else {
                p.clr_type.clone()
            };
            let column = SqlExpression::Column {
                name: p.column.clone(),
                table: alias.to_string(),
                ty,
                mapping: mappings.find_mapping_for_property(p),
                nullable: column_nullable,
            };
            (id, column)
        })
        .collect();
    EntityProjection {
        entity_type,
        table_alias: alias.to_string(),
        columns,
        nullable,
    }
}

/// Primary-key columns of the projected entity; empty for keyless types.
pub(crate) fn key_columns(model: &Model, entity: &EntityProjection) -> Vec<SqlExpression> {
    model
        .primary_key(entity.entity_type)
        .map(|k| {
            model
                .key(k)
                .properties
                .iter()
                .filter_map(|p| entity.column(*p).cloned())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn property_column(model: &Model, entity: &EntityProjection, property: PropertyId) -> Result<SqlExpression> {
    entity.column(property).cloned().ok_or_else(|| {
        QueryError::InvalidOperation(format!(
            "property '{}' is not mapped in the projection of '{}'",
            model.property(property).name,
            model.entity_name(entity.entity_type)
        ))
    })
}

/// `discriminator IN (...)` restricting a hierarchy query to `entity_type` and its derived types.
/// `None` when the type is the root of its hierarchy or has no discriminator.
pub(crate) fn discriminator_filter(
    model: &Model,
    factory: &SqlExpressionFactory,
    entity: &EntityProjection,
    entity_type: EntityTypeId,
) -> Option<SqlExpression> {
    if model.root_type(entity_type) == entity_type {
        return None;
    }
    let property = model.discriminator_property(entity_type)?;
    let column = entity.column(property)?.clone();
    let ty = model.property(property).clr_type.clone();
    let values = model
        .concrete_types(entity_type)
        .into_iter()
        .filter_map(|t| model.discriminator_value(t).cloned())
        .map(|v| factory.constant(v, ty.clone()))
        .collect();
    Some(factory.in_list(column, values, false))
}

/// Joins the principal or dependent reached through a reference navigation, reusing an earlier
/// join of the same navigation from the same table, and the owner's alias when both types share a
/// table.
pub(crate) fn expand_reference(
    model: &Model,
    factory: &SqlExpressionFactory,
    aliases: &mut AliasGenerator,
    select: &mut SelectExpression,
    owner: &EntityProjection,
    navigation: NavigationId,
) -> Result<EntityProjection> {
    if let Some(cached) = select.cached_navigation(&owner.table_alias, navigation) {
        return Ok(cached.clone());
    }
    let nav = model.navigation(navigation);
    let fk = model.foreign_key(nav.foreign_key);
    let target = model.navigation_target(navigation);

    let shares_table = model.find_shared_table_link(target) == Some(nav.foreign_key)
        || model.find_shared_table_link(owner.entity_type) == Some(nav.foreign_key);
    if shares_table {
        let projected = entity_projection(model, factory.type_mappings(), target, &owner.table_alias, owner.nullable);
        select.cache_navigation(&owner.table_alias, navigation, projected.clone());
        return Ok(projected);
    }

    let optional = owner.nullable || !nav.on_dependent || !fk.required;
    let alias = aliases.next(model.entity_name(target));
    let projected = entity_projection(model, factory.type_mappings(), target, &alias, optional);
    let principal_key = &model.key(fk.principal_key).properties;
    let (principal, dependent) = if nav.on_dependent {
        (&projected, owner)
    } else {
        (owner, &projected)
    };
    let mut on: Option<SqlExpression> = None;
    for (pk, dk) in principal_key.iter().zip(&fk.properties) {
        let eq = factory.equal(
            property_column(model, principal, *pk)?,
            property_column(model, dependent, *dk)?,
        );
        on = Some(match on {
            Some(prev) => factory.and(prev, eq),
            None => eq,
        });
    }
    if let Some(filter) = discriminator_filter(model, factory, &projected, target) {
        on = on.map(|o| factory.and(o, filter));
    }
    let kind = if optional { JoinKind::LeftOuter } else { JoinKind::Inner };
    select.add_join(
        kind,
        TableSource::Table {
            name: model.table_name(target).to_string(),
            schema: model.schema(target).map(str::to_string),
        },
        alias,
        on,
    );
    select.cache_navigation(&owner.table_alias, navigation, projected.clone());
    Ok(projected)
}

/// Correlation between an owner and the dependents of one of its collection navigations:
/// `owner.key = dependent.fk` for every key part.
pub(crate) fn collection_correlation(
    model: &Model,
    factory: &SqlExpressionFactory,
    owner: &EntityProjection,
    dependent: &EntityProjection,
    navigation: NavigationId,
) -> Result<SqlExpression> {
    let fk = model.foreign_key(model.navigation(navigation).foreign_key);
    let mut on: Option<SqlExpression> = None;
    for (pk, dk) in model.key(fk.principal_key).properties.iter().zip(&fk.properties) {
        let eq = factory.equal(
            property_column(model, owner, *pk)?,
            property_column(model, dependent, *dk)?,
        );
        on = Some(match on {
            Some(prev) => factory.and(prev, eq),
            None => eq,
        });
    }
    on.ok_or_else(|| QueryError::InvalidOperation("foreign key without properties".into()))
}
