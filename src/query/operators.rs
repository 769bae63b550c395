//! Query operator pipelines: a source, a chain of operators and a terminal.

use super::expr::{Expr, Lambda};
use crate::options::TrackingBehavior;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QuerySource {
    /// All rows of an entity type (and its derived types).
    Entity(String),
    /// Caller-supplied SQL composed as a subquery; `{0}`, `{1}`… refer to `args`.
    FromSql { entity: String, sql: String, args: Vec<Expr> },
}

impl QuerySource {
    pub fn entity_name(&self) -> &str {
        match self {
            QuerySource::Entity(name) => name,
            QuerySource::FromSql { entity, .. } => entity,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryOperator {
    Where(Lambda),
    Select(Lambda),
    OrderBy { key: Lambda, descending: bool },
    ThenBy { key: Lambda, descending: bool },
    Skip(Expr),
    Take(Expr),
    Distinct,
    /// Eager-loads a dotted navigation path (`Posts`, `Posts.Author`).
    Include(String),
    /// Inner join on equal keys; `result` receives `(outer, inner)`.
    Join {
        inner: Box<Query>,
        outer_key: Lambda,
        inner_key: Lambda,
        result: Lambda,
    },
    GroupBy { key: Lambda },
    /// Restricts a hierarchy query to one derived type.
    OfType(String),
}

impl QueryOperator {
    pub fn name(&self) -> &'static str {
        match self {
            QueryOperator::Where(_) => "Where",
            QueryOperator::Select(_) => "Select",
            QueryOperator::OrderBy { .. } => "OrderBy",
            QueryOperator::ThenBy { .. } => "ThenBy",
            QueryOperator::Skip(_) => "Skip",
            QueryOperator::Take(_) => "Take",
            QueryOperator::Distinct => "Distinct",
            QueryOperator::Include(_) => "Include",
            QueryOperator::Join { .. } => "Join",
            QueryOperator::GroupBy { .. } => "GroupBy",
            QueryOperator::OfType(_) => "OfType",
        }
    }
}

impl fmt::Display for QueryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOperator::Where(l) | QueryOperator::Select(l) | QueryOperator::GroupBy { key: l } => {
                write!(f, "{}({})", self.name(), l)
            }
            QueryOperator::OrderBy { key, descending } | QueryOperator::ThenBy { key, descending } => {
                write!(f, "{}{}({})", self.name(), if *descending { "Descending" } else { "" }, key)
            }
            QueryOperator::Skip(e) | QueryOperator::Take(e) => write!(f, "{}({})", self.name(), e),
            QueryOperator::Distinct => f.write_str("Distinct()"),
            QueryOperator::Include(path) => write!(f, "Include(\"{}\")", path),
            QueryOperator::Join {
                inner,
                outer_key,
                inner_key,
                result,
            } => write!(f, "Join({}, {}, {}, {})", inner.source.entity_name(), outer_key, inner_key, result),
            QueryOperator::OfType(t) => write!(f, "OfType<{}>()", t),
        }
    }
}

/// How the sequence is consumed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Terminal {
    #[default]
    ToList,
    First { or_default: bool },
    Single { or_default: bool },
    Count,
    Any,
    All(Lambda),
    Min,
    Max,
    Sum,
    Average,
}

impl Terminal {
    pub fn name(&self) -> &'static str {
        match self {
            Terminal::ToList => "ToList",
            Terminal::First { or_default: false } => "First",
            Terminal::First { or_default: true } => "FirstOrDefault",
            Terminal::Single { or_default: false } => "Single",
            Terminal::Single { or_default: true } => "SingleOrDefault",
            Terminal::Count => "Count",
            Terminal::Any => "Any",
            Terminal::All(_) => "All",
            Terminal::Min => "Min",
            Terminal::Max => "Max",
            Terminal::Sum => "Sum",
            Terminal::Average => "Average",
        }
    }

    /// Terminals that compute one value on the server.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Terminal::Count | Terminal::Any | Terminal::All(_) | Terminal::Min | Terminal::Max | Terminal::Sum | Terminal::Average
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Query {
    pub source: QuerySource,
    pub operators: Vec<QueryOperator>,
    pub terminal: Terminal,
    /// Overrides the context's default tracking behavior.
    pub tracking: Option<TrackingBehavior>,
}

impl Query {
    pub fn from(entity: &str) -> Self {
        Query {
            source: QuerySource::Entity(entity.to_string()),
            operators: Vec::new(),
            terminal: Terminal::ToList,
            tracking: None,
        }
    }

    pub fn from_sql(entity: &str, sql: &str, args: Vec<Expr>) -> Self {
        Query {
            source: QuerySource::FromSql {
                entity: entity.to_string(),
                sql: sql.to_string(),
                args,
            },
            operators: Vec::new(),
            terminal: Terminal::ToList,
            tracking: None,
        }
    }

    fn push(mut self, op: QueryOperator) -> Self {
        self.operators.push(op);
        self
    }

    pub fn filter(self, predicate: Lambda) -> Self {
        self.push(QueryOperator::Where(predicate))
    }

    pub fn select(self, selector: Lambda) -> Self {
        self.push(QueryOperator::Select(selector))
    }

    pub fn order_by(self, key: Lambda) -> Self {
        self.push(QueryOperator::OrderBy { key, descending: false })
    }

    pub fn order_by_descending(self, key: Lambda) -> Self {
        self.push(QueryOperator::OrderBy { key, descending: true })
    }

    pub fn then_by(self, key: Lambda) -> Self {
        self.push(QueryOperator::ThenBy { key, descending: false })
    }

    pub fn then_by_descending(self, key: Lambda) -> Self {
        self.push(QueryOperator::ThenBy { key, descending: true })
    }

    pub fn skip(self, count: Expr) -> Self {
        self.push(QueryOperator::Skip(count))
    }

    pub fn take(self, count: Expr) -> Self {
        self.push(QueryOperator::Take(count))
    }

    pub fn distinct(self) -> Self {
        self.push(QueryOperator::Distinct)
    }

    pub fn include(self, path: &str) -> Self {
        self.push(QueryOperator::Include(path.to_string()))
    }

    pub fn join(self, inner: Query, outer_key: Lambda, inner_key: Lambda, result: Lambda) -> Self {
        self.push(QueryOperator::Join {
            inner: Box::new(inner),
            outer_key,
            inner_key,
            result,
        })
    }

    pub fn group_by(self, key: Lambda) -> Self {
        self.push(QueryOperator::GroupBy { key })
    }

    pub fn of_type(self, entity: &str) -> Self {
        self.push(QueryOperator::OfType(entity.to_string()))
    }

    pub fn as_no_tracking(mut self) -> Self {
        self.tracking = Some(TrackingBehavior::NoTracking);
        self
    }

    pub fn as_no_tracking_with_identity_resolution(mut self) -> Self {
        self.tracking = Some(TrackingBehavior::NoTrackingWithIdentityResolution);
        self
    }

    pub fn as_tracking(mut self) -> Self {
        self.tracking = Some(TrackingBehavior::TrackAll);
        self
    }

    pub fn with_terminal(mut self, terminal: Terminal) -> Self {
        self.terminal = terminal;
        self
    }

    /// `Count(predicate)` and friends: the predicate becomes a trailing `Where`.
    pub fn with_predicate_terminal(self, predicate: Option<Lambda>, terminal: Terminal) -> Self {
        let q = match predicate {
            Some(p) => self.filter(p),
            None => self,
        };
        q.with_terminal(terminal)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            QuerySource::Entity(name) => write!(f, "DbSet<{}>()", name)?,
            QuerySource::FromSql { entity, sql, .. } => write!(f, "DbSet<{}>().FromSql(\"{}\")", entity, sql)?,
        }
        for op in &self.operators {
            write!(f, ".{}", op)?;
        }
        match &self.terminal {
            Terminal::All(l) => write!(f, ".All({})", l),
            other => write!(f, ".{}()", other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::{lambda, var};

    #[test]
    fn builds_and_displays_a_pipeline() {
        let q = Query::from("Blog")
            .filter(lambda(&["b"], var("b").member("Rating").gt(Expr::int(3))))
            .order_by(lambda(&["b"], var("b").member("Name")))
            .take(Expr::int(10))
            .with_terminal(Terminal::Count);
        assert_eq!(
            q.to_string(),
            "DbSet<Blog>().Where(b => (b.Rating > 3)).OrderBy(b => b.Name).Take(10).Count()"
        );
        assert!(q.terminal.is_scalar());
    }

    #[test]
    fn identical_pipelines_are_equal() {
        let a = Query::from("Blog").include("Posts").as_no_tracking();
        let b = Query::from("Blog").include("Posts").as_no_tracking();
        assert_eq!(a, b);
    }
}
