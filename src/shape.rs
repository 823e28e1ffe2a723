//! Shape definitions: the (relation, filter, optional subquery) triple a
//! consumer materializes into a durable log.

use std::fmt;
use std::hash::{Hash, Hasher};

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::change::Value;
use crate::relation::Relation;

/// A stable, content-addressed identifier for a [`Shape`].
///
/// Two processes that construct the same shape definition agree on its
/// handle without coordination, since it's derived purely from the shape's
/// own content (mirrors `backend::replication::sharded_tables` keying tables
/// by their own definition rather than an externally assigned id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeHandle(pub String);

impl fmt::Display for ShapeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ShapeHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Comparison used by a [`Predicate::Simple`] column test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// A shape's `WHERE` predicate.
///
/// The Filter can only evaluate [`Predicate::Simple`] directly; everything
/// else is treated conservatively as "always satisfiable", per the rule
/// that false positives are allowed but false negatives are not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// No predicate: every row in the relation is in the shape.
    None,
    /// A directly evaluable `column OP literal` comparison.
    Simple {
        column: String,
        op: ComparisonOp,
        value: Value,
    },
    /// `column IN (SELECT inner_key_column ... FROM <inner shape's relation>)`.
    /// Makes this shape an outer subquery shape dependent on `inner`.
    Subquery {
        column: String,
        inner: ShapeHandle,
        inner_key_column: String,
    },
    /// Arbitrary SQL text the Filter cannot evaluate structurally.
    Opaque(String),
}

impl Predicate {
    fn content_key(&self) -> String {
        match self {
            Predicate::None => "none".to_string(),
            Predicate::Simple { column, op, value } => {
                format!("simple:{column}:{op:?}:{value}")
            }
            Predicate::Subquery {
                column,
                inner,
                inner_key_column,
            } => format!("subquery:{column}:{inner}:{inner_key_column}"),
            Predicate::Opaque(text) => format!("opaque:{text}"),
        }
    }
}

/// An immutable, content-addressed shape definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub relation: Relation,
    pub predicate: Predicate,
    /// Other shapes this shape's predicate subquery reads from.
    pub shape_dependencies: Vec<ShapeHandle>,
    handle: ShapeHandle,
}

impl Shape {
    pub fn new(relation: Relation, predicate: Predicate, shape_dependencies: Vec<ShapeHandle>) -> Self {
        let handle = Self::compute_handle(&relation, &predicate, &shape_dependencies);
        Self {
            relation,
            predicate,
            shape_dependencies,
            handle,
        }
    }

    pub fn without_predicate(relation: Relation) -> Self {
        Self::new(relation, Predicate::None, vec![])
    }

    fn compute_handle(relation: &Relation, predicate: &Predicate, deps: &[ShapeHandle]) -> ShapeHandle {
        let mut hasher = FnvHasher::default();
        relation.hash(&mut hasher);
        predicate.content_key().hash(&mut hasher);
        for dep in deps {
            dep.hash(&mut hasher);
        }
        ShapeHandle(format!("{:016x}", hasher.finish()))
    }

    pub fn handle(&self) -> &ShapeHandle {
        &self.handle
    }

    /// The predicate has an `IN (SELECT ...)` form referring to another shape.
    pub fn is_subquery_shape(&self) -> bool {
        matches!(self.predicate, Predicate::Subquery { .. })
    }

    /// `shape_dependencies` is non-empty.
    pub fn has_dependencies(&self) -> bool {
        !self.shape_dependencies.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_handle_is_deterministic() {
        let a = Shape::without_predicate(Relation::public("users"));
        let b = Shape::without_predicate(Relation::public("users"));
        assert_eq!(a.handle(), b.handle());
    }

    #[test]
    fn test_handle_differs_by_relation() {
        let a = Shape::without_predicate(Relation::public("users"));
        let b = Shape::without_predicate(Relation::public("orders"));
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn test_is_subquery_shape() {
        let inner = Shape::without_predicate(Relation::public("x"));
        let outer = Shape::new(
            Relation::public("y"),
            Predicate::Subquery {
                column: "y_id".into(),
                inner: inner.handle().clone(),
                inner_key_column: "x_id".into(),
            },
            vec![inner.handle().clone()],
        );
        assert!(outer.is_subquery_shape());
        assert!(outer.has_dependencies());
        assert!(!inner.is_subquery_shape());
        assert!(!inner.has_dependencies());
    }
}
