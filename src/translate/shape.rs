//! Compile-time shape templates. A template describes the current element of a query in terms of
//! projection members; it is resolved against the select's projection mapping and only turned into
//! a [`Shaper`](crate::shaper::Shaper) with ordinals once the final projection is known.

use crate::model::NavigationId;
use crate::query::Lambda;
use crate::sql::ProjectionMember;

#[derive(Clone, Debug, PartialEq)]
pub enum ShapeExpr {
    Scalar(ProjectionMember),
    Entity(ProjectionMember),
    Object(Vec<(String, ShapeExpr)>),
    /// Raw column values of the entity mapped at the member.
    Values(ProjectionMember),
    /// A collection navigation projected as a nested sequence; joined when the query is finished.
    Collection(Box<PendingCollection>),
    Grouping {
        key: Box<ShapeExpr>,
        element: Box<ShapeExpr>,
    },
    /// Computed after materialization from the shaped `input`.
    Client { input: Box<ShapeExpr>, selector: Lambda },
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingCollection {
    /// Member the owning entity is mapped at.
    pub owner: ProjectionMember,
    pub navigation: NavigationId,
    pub predicates: Vec<Lambda>,
    pub selector: Option<Lambda>,
}

impl ShapeExpr {
    /// Moves every member this shape refers to under `prefix`.
    pub fn reroot(self, prefix: &ProjectionMember) -> ShapeExpr {
        match self {
            ShapeExpr::Scalar(m) => ShapeExpr::Scalar(prefix.prepend_to(&m)),
            ShapeExpr::Entity(m) => ShapeExpr::Entity(prefix.prepend_to(&m)),
            ShapeExpr::Values(m) => ShapeExpr::Values(prefix.prepend_to(&m)),
            ShapeExpr::Object(members) => {
                ShapeExpr::Object(members.into_iter().map(|(n, s)| (n, s.reroot(prefix))).collect())
            }
            ShapeExpr::Collection(mut c) => {
                c.owner = prefix.prepend_to(&c.owner);
                ShapeExpr::Collection(c)
            }
            ShapeExpr::Grouping { key, element } => ShapeExpr::Grouping {
                key: Box::new(key.reroot(prefix)),
                element: Box::new(element.reroot(prefix)),
            },
            ShapeExpr::Client { input, selector } => ShapeExpr::Client {
                input: Box::new(input.reroot(prefix)),
                selector,
            },
        }
    }

    pub fn has_collection(&self) -> bool {
        match self {
            ShapeExpr::Scalar(_) | ShapeExpr::Entity(_) | ShapeExpr::Values(_) => false,
            ShapeExpr::Object(members) => members.iter().any(|(_, s)| s.has_collection()),
            ShapeExpr::Collection(_) | ShapeExpr::Grouping { .. } => true,
            ShapeExpr::Client { input, .. } => input.has_collection(),
        }
    }

    pub fn has_client(&self) -> bool {
        match self {
            ShapeExpr::Scalar(_) | ShapeExpr::Entity(_) | ShapeExpr::Values(_) | ShapeExpr::Collection(_) => false,
            ShapeExpr::Object(members) => members.iter().any(|(_, s)| s.has_client()),
            ShapeExpr::Grouping { key, element } => key.has_client() || element.has_client(),
            ShapeExpr::Client { .. } => true,
        }
    }

    /// Members of the scalar leaves, in shape order.
    pub fn scalar_members(&self) -> Vec<&ProjectionMember> {
        let mut out = Vec::new();
        self.collect_scalars(&mut out);
        out
    }

    fn collect_scalars<'a>(&'a self, out: &mut Vec<&'a ProjectionMember>) {
        match self {
            ShapeExpr::Scalar(m) => out.push(m),
            ShapeExpr::Object(members) => members.iter().for_each(|(_, s)| s.collect_scalars(out)),
            ShapeExpr::Grouping { key, .. } => key.collect_scalars(out),
            ShapeExpr::Client { input, .. } => input.collect_scalars(out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reroot_prefixes_every_member() {
        let shape = ShapeExpr::Object(vec![
            ("Id".into(), ShapeExpr::Scalar(ProjectionMember::root().append("Id"))),
            ("Blog".into(), ShapeExpr::Entity(ProjectionMember::root().append("Blog"))),
        ]);
        let prefix = ProjectionMember::root().append("$inner");
        let moved = shape.reroot(&prefix);
        assert_eq!(
            moved.scalar_members(),
            vec![&ProjectionMember::root().append("$inner").append("Id")]
        );
        let ShapeExpr::Object(members) = moved else {
            panic!("expected an object shape");
        };
        assert_eq!(
            members[1].1,
            ShapeExpr::Entity(ProjectionMember::root().append("$inner").append("Blog"))
        );
    }
}
