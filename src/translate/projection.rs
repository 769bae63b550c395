//! Binding of `Select` bodies onto the projection mapping.

use super::shape::{PendingCollection, ShapeExpr};
use super::visitor::{unmapped, Bound, Visitor};
use crate::error::{QueryError, Result};
use crate::query::{DeclaringType, Expr, Lambda};
use crate::sql::{MappedProjection, ProjectionMember};
use indexmap::IndexMap;
use tracing::warn;

pub(crate) type Mapping = IndexMap<ProjectionMember, MappedProjection>;

/// Binds `selector` applied to `args`, returning the new element shape and the mapping it refers
/// to. The caller installs the mapping; the select's current mapping is only read.
pub(crate) fn bind_projection(visitor: &mut Visitor<'_>, selector: &Lambda, args: Vec<Bound>) -> Result<(ShapeExpr, Mapping)> {
    let params: Vec<(String, Bound)> = selector.params.iter().cloned().zip(args.iter().cloned()).collect();
    visitor.with_bindings(selector, args, |visitor| {
        let mut binder = ProjectionBinder {
            visitor,
            params,
            mapping: IndexMap::new(),
        };
        let shape = binder.bind(&selector.body, ProjectionMember::root())?;
        Ok((shape, binder.mapping))
    })
}

struct ProjectionBinder<'v, 'a> {
    visitor: &'v mut Visitor<'a>,
    params: Vec<(String, Bound)>,
    mapping: Mapping,
}

impl ProjectionBinder<'_, '_> {
    fn bind(&mut self, expr: &Expr, path: ProjectionMember) -> Result<ShapeExpr> {
        if let Expr::New { members } = expr {
            let mut shapes = Vec::with_capacity(members.len());
            for (name, member) in members {
                shapes.push((name.clone(), self.bind(member, path.append(name))?));
            }
            return Ok(ShapeExpr::Object(shapes));
        }
        if let Some(target) = entity_values_target(expr) {
            if let Some(Bound::Entity(entity)) = self.visitor.visit(target)? {
                let columns = entity.columns.values().cloned().collect();
                self.mapping.insert(path.clone(), MappedProjection::Values(columns));
                return Ok(ShapeExpr::Values(path));
            }
        }
        match self.visitor.visit(expr)? {
            Some(bound) => self.project(bound, path, expr),
            None => self.client_leaf(expr, path),
        }
    }

    fn project(&mut self, bound: Bound, path: ProjectionMember, expr: &Expr) -> Result<ShapeExpr> {
        match bound {
            Bound::Sql(sql) => {
                self.mapping.insert(path.clone(), MappedProjection::Scalar(sql));
                Ok(ShapeExpr::Scalar(path))
            }
            Bound::Entity(entity) => {
                self.mapping.insert(path.clone(), MappedProjection::Entity(entity));
                Ok(ShapeExpr::Entity(path))
            }
            Bound::Collection(c) => {
                let owner = path.append("$owner");
                self.mapping.insert(owner.clone(), MappedProjection::Entity(c.owner));
                Ok(ShapeExpr::Collection(Box::new(PendingCollection {
                    owner,
                    navigation: c.navigation,
                    predicates: c.predicates,
                    selector: c.selector,
                })))
            }
            Bound::Shape(shape) => self.reproject(shape, path),
            Bound::Group(_) => Err(QueryError::translation_with(
                expr,
                "a grouping can only be read through its key and aggregates",
            )),
        }
    }

    /// Copies the mapping entries `shape` refers to under `path`.
    fn reproject(&mut self, shape: ShapeExpr, path: ProjectionMember) -> Result<ShapeExpr> {
        let current = self.visitor.select().mapping();
        match shape {
            ShapeExpr::Scalar(m) | ShapeExpr::Entity(m) | ShapeExpr::Values(m) => {
                let mapped = current.get(&m).cloned().ok_or_else(|| unmapped(&m))?;
                let shape = match mapped {
                    MappedProjection::Scalar(_) => ShapeExpr::Scalar(path.clone()),
                    MappedProjection::Entity(_) => ShapeExpr::Entity(path.clone()),
                    MappedProjection::Values(_) => ShapeExpr::Values(path.clone()),
                };
                self.mapping.insert(path, mapped);
                Ok(shape)
            }
            ShapeExpr::Object(members) => {
                let mut shapes = Vec::with_capacity(members.len());
                for (name, member) in members {
                    let child = path.append(&name);
                    shapes.push((name, self.reproject(member, child)?));
                }
                Ok(ShapeExpr::Object(shapes))
            }
            ShapeExpr::Collection(mut pending) => {
                let mapped = current.get(&pending.owner).cloned().ok_or_else(|| unmapped(&pending.owner))?;
                let owner = path.append("$owner");
                self.mapping.insert(owner.clone(), mapped);
                pending.owner = owner;
                Ok(ShapeExpr::Collection(pending))
            }
            ShapeExpr::Client { input, selector } => Ok(ShapeExpr::Client {
                input: Box::new(self.reproject(*input, path)?),
                selector,
            }),
            ShapeExpr::Grouping { .. } => Err(QueryError::InvalidOperation(
                "a grouping cannot be projected as a value".into(),
            )),
        }
    }

    /// An untranslatable leaf: project what it reads and compute it after materialization.
    fn client_leaf(&mut self, expr: &Expr, path: ProjectionMember) -> Result<ShapeExpr> {
        if !self.visitor.context().options.client_evaluation {
            return Err(QueryError::translation(expr));
        }
        warn!(expression = %expr, "projection evaluated on the client");
        let input_path = path.append("$input");
        let params = self.params.clone();
        let input = match params.as_slice() {
            [(_, bound)] => self.project(bound.clone(), input_path, expr)?,
            _ => {
                let mut members = Vec::with_capacity(params.len());
                for (name, bound) in params {
                    let shape = self.project(bound, input_path.append(&name), expr)?;
                    members.push((name, shape));
                }
                ShapeExpr::Object(members)
            }
        };
        Ok(ShapeExpr::Client {
            input: Box::new(input),
            selector: Lambda {
                params: self.params.iter().map(|(n, _)| n.clone()).collect(),
                body: expr.clone(),
            },
        })
    }
}

/// The entity whose raw column values `expr` asks for: `DbFunctions.EntityValues(e)` or a boxed
/// array of members of one entity.
fn entity_values_target(expr: &Expr) -> Option<&Expr> {
    match expr {
        Expr::Call {
            target: None,
            method,
            args,
        } if method.is(&DeclaringType::DbFunctions, "EntityValues") && args.len() == 1 => Some(&args[0]),
        Expr::Convert { operand, .. } => {
            let Expr::NewArray { elements, .. } = operand.as_ref() else {
                return None;
            };
            let mut targets = elements.iter().map(|e| match e.strip_object_convert() {
                Expr::Member { target, .. } => Some(target.as_ref()),
                _ => None,
            });
            let first = targets.next()??;
            targets.all(|t| t == Some(first)).then_some(first)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::from_json;
    use crate::options::{Dialect, QueryOptions};
    use crate::query::{lambda, new_object, static_call, var};
    use crate::sql::{AliasGenerator, SelectExpression, SqlExpressionFactory};
    use crate::storage::RelationalTypeMappingSource;
    use crate::translate::navigation::entity_projection;
    use crate::translate::registry::TranslatorRegistry;
    use crate::translate::visitor::tests::BLOGGING;
    use crate::translate::visitor::CompileContext;
    use crate::value::ClrType;
    use std::sync::Arc;

    fn with_blog<R>(client_evaluation: bool, f: impl FnOnce(&mut Visitor<'_>, Bound) -> R) -> R {
        let model = from_json(BLOGGING).unwrap();
        let factory = SqlExpressionFactory::new(Arc::new(RelationalTypeMappingSource::new(Dialect::Sqlite)), false);
        let registry = TranslatorRegistry::new(Dialect::Sqlite);
        let options = QueryOptions {
            client_evaluation,
            ..QueryOptions::default()
        };
        let cx = CompileContext {
            model: &model,
            factory: &factory,
            registry: &registry,
            options: &options,
        };
        let blog_type = model.find_entity_type("Blog").unwrap();
        let mut aliases = AliasGenerator::default();
        let alias = aliases.next("Blog");
        let mut select = SelectExpression::from_table("Blogs", None, alias.clone());
        let blog = entity_projection(&model, factory.type_mappings(), blog_type, &alias, false);
        let mut visitor = Visitor::new(cx, &mut aliases, &mut select);
        f(&mut visitor, Bound::Entity(blog))
    }

    #[test]
    fn object_members_map_to_paths() {
        with_blog(true, |visitor, blog| {
            let selector = lambda(
                &["b"],
                new_object(vec![("Id", var("b").member("Id")), ("Name", var("b").member("Name"))]),
            );
            let (shape, mapping) = bind_projection(visitor, &selector, vec![blog]).unwrap();
            let root = ProjectionMember::root();
            assert_eq!(shape.scalar_members(), vec![&root.append("Id"), &root.append("Name")]);
            assert_eq!(mapping.len(), 2);
        });
    }

    #[test]
    fn collection_projection_maps_owner() {
        with_blog(true, |visitor, blog| {
            let selector = lambda(&["b"], new_object(vec![("Posts", var("b").member("Posts"))]));
            let (shape, mapping) = bind_projection(visitor, &selector, vec![blog]).unwrap();
            assert!(shape.has_collection());
            let owner = ProjectionMember::root().append("Posts").append("$owner");
            assert!(matches!(mapping.get(&owner), Some(MappedProjection::Entity(_))));
        });
    }

    #[test]
    fn untranslatable_leaf_is_client_evaluated() {
        let call = |b: Expr| b.member("Name").call(DeclaringType::Custom("Slug".into()), "Make", vec![]);
        with_blog(true, |visitor, blog| {
            let selector = lambda(&["b"], call(var("b")));
            let (shape, _) = bind_projection(visitor, &selector, vec![blog]).unwrap();
            assert!(matches!(shape, ShapeExpr::Client { ref input, .. } if matches!(**input, ShapeExpr::Entity(_))));
        });
        with_blog(false, |visitor, blog| {
            let selector = lambda(&["b"], call(var("b")));
            let err = bind_projection(visitor, &selector, vec![blog]).unwrap_err();
            assert_eq!(err.code(), "translation_error");
        });
    }

    #[test]
    fn entity_values_projects_every_column() {
        with_blog(true, |visitor, blog| {
            let selector = lambda(&["b"], static_call(DeclaringType::DbFunctions, "EntityValues", vec![var("b")]));
            let (shape, mapping) = bind_projection(visitor, &selector, vec![blog]).unwrap();
            assert_eq!(shape, ShapeExpr::Values(ProjectionMember::root()));
            assert!(matches!(mapping.get(&ProjectionMember::root()), Some(MappedProjection::Values(v)) if v.len() == 3));
        });

        with_blog(true, |visitor, blog| {
            let boxed = Expr::NewArray {
                element: ClrType::Object,
                elements: vec![
                    var("b").member("Id").convert(ClrType::Object),
                    var("b").member("Name").convert(ClrType::Object),
                ],
            }
            .convert(ClrType::Object);
            let (shape, _) = bind_projection(visitor, &lambda(&["b"], boxed), vec![blog]).unwrap();
            assert!(matches!(shape, ShapeExpr::Values(_)));
        });
    }
}
