//! `SELECT` expressions, their table sources and the projection mapping that binds result-shape
//! members to SQL.

use super::expression::SqlExpression;
use crate::model::{EntityTypeId, NavigationId, PropertyId};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Path of member names identifying one leaf (or subtree) of the requested result shape.
/// The root is the empty path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectionMember(Vec<String>);

impl ProjectionMember {
    pub fn root() -> Self {
        ProjectionMember(Vec::new())
    }

    pub fn append(&self, member: &str) -> Self {
        let mut path = self.0.clone();
        path.push(member.to_string());
        ProjectionMember(path)
    }

    /// Re-roots `other` under `self`.
    pub fn prepend_to(&self, other: &ProjectionMember) -> Self {
        let mut path = self.0.clone();
        path.extend(other.0.iter().cloned());
        ProjectionMember(path)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }
}

impl fmt::Display for ProjectionMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.0.join("."))
        }
    }
}

/// The columns an entity is read from: one expression per hierarchy property.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityProjection {
    pub entity_type: EntityTypeId,
    pub table_alias: String,
    pub columns: IndexMap<PropertyId, SqlExpression>,
    /// On the optional side of an outer join; a null key means "no entity".
    pub nullable: bool,
}

impl EntityProjection {
    pub fn column(&self, property: PropertyId) -> Option<&SqlExpression> {
        self.columns.get(&property)
    }

    pub fn make_nullable(mut self) -> Self {
        self.nullable = true;
        self.columns = self
            .columns
            .into_iter()
            .map(|(p, c)| (p, c.make_nullable()))
            .collect();
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MappedProjection {
    Scalar(SqlExpression),
    Entity(EntityProjection),
    /// An ordered run of raw column values (entity values buffer).
    Values(Vec<SqlExpression>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProjectionExpression {
    pub expression: SqlExpression,
    pub alias: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Ordering {
    pub expression: SqlExpression,
    pub ascending: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    Cross,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TableSource {
    Table { name: String, schema: Option<String> },
    Subquery(Box<SelectExpression>),
    /// Caller-supplied SQL with `{0}`, `{1}`… argument holes.
    FromSql { sql: String, args: Vec<SqlExpression> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableItem {
    pub source: TableSource,
    pub alias: String,
    /// `None` for the first (FROM) table.
    pub join: Option<(JoinKind, Option<SqlExpression>)>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelectExpression {
    pub tables: Vec<TableItem>,
    pub projection: Vec<ProjectionExpression>,
    pub predicate: Option<SqlExpression>,
    pub group_by: Vec<SqlExpression>,
    pub having: Option<SqlExpression>,
    pub orderings: Vec<Ordering>,
    pub limit: Option<SqlExpression>,
    pub offset: Option<SqlExpression>,
    pub distinct: bool,
    pub(crate) projection_mapping: IndexMap<ProjectionMember, MappedProjection>,
    /// Expressions that identify one result row; collection shaping orders and groups by them.
    pub(crate) identifier: Vec<SqlExpression>,
    pub(crate) navigation_joins: HashMap<(String, NavigationId), EntityProjection>,
}

impl SelectExpression {
    pub fn from_table(name: &str, schema: Option<&str>, alias: String) -> Self {
        SelectExpression {
            tables: vec![TableItem {
                source: TableSource::Table {
                    name: name.to_string(),
                    schema: schema.map(str::to_string),
                },
                alias,
                join: None,
            }],
            ..Default::default()
        }
    }

    pub fn from_source(source: TableSource, alias: String) -> Self {
        SelectExpression {
            tables: vec![TableItem {
                source,
                alias,
                join: None,
            }],
            ..Default::default()
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    pub fn add_join(&mut self, kind: JoinKind, source: TableSource, alias: String, on: Option<SqlExpression>) {
        self.tables.push(TableItem {
            source,
            alias,
            join: Some((kind, on)),
        });
    }

    pub fn mapping(&self) -> &IndexMap<ProjectionMember, MappedProjection> {
        &self.projection_mapping
    }

    pub fn mapping_mut(&mut self) -> &mut IndexMap<ProjectionMember, MappedProjection> {
        &mut self.projection_mapping
    }

    pub fn replace_mapping(&mut self, mapping: IndexMap<ProjectionMember, MappedProjection>) {
        self.projection_mapping = mapping;
    }

    pub fn identifier(&self) -> &[SqlExpression] {
        &self.identifier
    }

    pub fn set_identifier(&mut self, identifier: Vec<SqlExpression>) {
        self.identifier = identifier;
    }

    pub fn cached_navigation(&self, table_alias: &str, navigation: NavigationId) -> Option<&EntityProjection> {
        self.navigation_joins.get(&(table_alias.to_string(), navigation))
    }

    pub fn cache_navigation(&mut self, table_alias: &str, navigation: NavigationId, target: EntityProjection) {
        self.navigation_joins.insert((table_alias.to_string(), navigation), target);
    }

    /// Adds `expression` to the projection list (reusing an equal entry) and returns its ordinal.
    pub fn add_to_projection(&mut self, expression: SqlExpression, alias_hint: &str) -> usize {
        if let Some(i) = self.projection.iter().position(|p| p.expression == expression) {
            return i;
        }
        let alias = self.unique_projection_alias(expression.alias_hint(alias_hint));
        self.projection.push(ProjectionExpression { expression, alias });
        self.projection.len() - 1
    }

    fn unique_projection_alias(&self, hint: &str) -> String {
        let taken = |a: &str| self.projection.iter().any(|p| p.alias == a);
        if !taken(hint) {
            return hint.to_string();
        }
        (0..)
            .map(|i| format!("{}{}", hint, i))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| hint.to_string())
    }

    /// Turns this select into `SELECT … FROM (<this>) AS alias`, lifting the projection mapping,
    /// the identifier and the orderings through the new subquery boundary.
    pub fn push_down(&mut self, alias: String) {
        let mut inner = std::mem::take(self);
        let mapping = std::mem::take(&mut inner.projection_mapping);
        let identifier = std::mem::take(&mut inner.identifier);
        let orderings = if inner.is_limited() {
            inner.orderings.clone()
        } else {
            std::mem::take(&mut inner.orderings)
        };
        inner.navigation_joins.clear();

        self.tables = vec![TableItem {
            source: TableSource::Subquery(Box::new(inner)),
            alias,
            join: None,
        }];
        let mapping: IndexMap<_, _> = mapping
            .into_iter()
            .map(|(member, mapped)| {
                let hint = member.last().unwrap_or("c").to_string();
                let lifted = self.lift_mapped(mapped, &hint);
                (member, lifted)
            })
            .collect();
        let identifier: Vec<_> = identifier.into_iter().map(|e| self.lift(e, "c")).collect();
        let orderings: Vec<_> = orderings
            .into_iter()
            .map(|o| Ordering {
                expression: self.lift(o.expression, "c"),
                ascending: o.ascending,
            })
            .collect();
        self.projection_mapping = mapping;
        self.identifier = identifier;
        self.orderings = orderings;
    }

    /// Projects `expression` out of the subquery this select was pushed down onto and returns the
    /// outer column referring to it. Constants and parameters need no projection.
    pub fn lift(&mut self, expression: SqlExpression, alias_hint: &str) -> SqlExpression {
        if matches!(expression, SqlExpression::Constant { .. } | SqlExpression::Parameter { .. }) {
            return expression;
        }
        let Some(TableItem {
            source: TableSource::Subquery(inner),
            alias,
            ..
        }) = self.tables.first_mut()
        else {
            return expression;
        };
        let ty = expression.ty();
        let mapping = expression.type_mapping().cloned();
        let nullable = expression.is_nullable();
        let index = inner.add_to_projection(expression, alias_hint);
        SqlExpression::Column {
            name: inner.projection[index].alias.clone(),
            table: alias.clone(),
            ty,
            mapping,
            nullable,
        }
    }

    pub fn lift_mapped(&mut self, mapped: MappedProjection, alias_hint: &str) -> MappedProjection {
        match mapped {
            MappedProjection::Scalar(e) => MappedProjection::Scalar(self.lift(e, alias_hint)),
            MappedProjection::Entity(entity) => MappedProjection::Entity(self.lift_entity(entity)),
            MappedProjection::Values(values) => {
                MappedProjection::Values(values.into_iter().map(|v| self.lift(v, alias_hint)).collect())
            }
        }
    }

    pub fn lift_entity(&mut self, entity: EntityProjection) -> EntityProjection {
        let alias = self.tables.first().map(|t| t.alias.clone()).unwrap_or_default();
        let columns = entity
            .columns
            .into_iter()
            .map(|(p, c)| {
                let hint = c.alias_hint("c").to_string();
                (p, self.lift(c, &hint))
            })
            .collect();
        EntityProjection {
            entity_type: entity.entity_type,
            table_alias: alias,
            columns,
            nullable: entity.nullable,
        }
    }

    /// Aliases of every table reachable from this select, including nested subqueries.
    pub fn table_aliases(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        for t in &self.tables {
            out.insert(t.alias.clone());
            if let TableSource::Subquery(inner) = &t.source {
                out.extend(inner.table_aliases());
            }
        }
        out
    }
}

/// Hands out table aliases unique within one compiled query (`b`, `b0`, `t`, `t0`).
#[derive(Debug, Default)]
pub struct AliasGenerator {
    used: HashSet<String>,
}

impl AliasGenerator {
    pub fn next(&mut self, hint: &str) -> String {
        let base = hint
            .chars()
            .find(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_lowercase().to_string())
            .unwrap_or_else(|| "t".to_string());
        let mut candidate = base.clone();
        let mut i = 0;
        while self.used.contains(&candidate) {
            candidate = format!("{}{}", base, i);
            i += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ClrType;

    fn col(name: &str, table: &str) -> SqlExpression {
        SqlExpression::Column {
            name: name.into(),
            table: table.into(),
            ty: ClrType::Int32,
            mapping: None,
            nullable: false,
        }
    }

    #[test]
    fn aliases_are_unique_per_query() {
        let mut aliases = AliasGenerator::default();
        assert_eq!(aliases.next("Blogs"), "b");
        assert_eq!(aliases.next("Blog"), "b0");
        assert_eq!(aliases.next("Blog"), "b1");
        assert_eq!(aliases.next("_1"), "t");
    }

    #[test]
    fn projection_deduplicates_and_uniquifies_aliases() {
        let mut select = SelectExpression::from_table("Blogs", None, "b".into());
        assert_eq!(select.add_to_projection(col("Id", "b"), "Id"), 0);
        assert_eq!(select.add_to_projection(col("Id", "b"), "Id"), 0);
        assert_eq!(select.add_to_projection(col("Id", "p"), "Id"), 1);
        assert_eq!(select.projection[1].alias, "Id0");
    }

    #[test]
    fn push_down_lifts_mapping_and_keeps_limited_orderings() {
        let mut select = SelectExpression::from_table("Blogs", None, "b".into());
        select
            .mapping_mut()
            .insert(ProjectionMember::root().append("Name"), MappedProjection::Scalar(col("Name", "b")));
        select.orderings.push(Ordering {
            expression: col("Name", "b"),
            ascending: true,
        });
        select.limit = Some(SqlExpression::Fragment("10".into()));
        select.push_down("t".into());

        let TableSource::Subquery(inner) = &select.tables[0].source else {
            panic!("expected a subquery source");
        };
        assert_eq!(inner.orderings.len(), 1);
        assert_eq!(inner.projection.len(), 1);
        assert_eq!(select.orderings[0].expression, col("Name", "t"));
        assert_eq!(
            select.mapping().get(&ProjectionMember::root().append("Name")),
            Some(&MappedProjection::Scalar(col("Name", "t")))
        );
    }

    #[test]
    fn member_paths_display() {
        assert_eq!(ProjectionMember::root().to_string(), "<root>");
        assert_eq!(ProjectionMember::root().append("Blog").append("Name").to_string(), "Blog.Name");
    }
}
