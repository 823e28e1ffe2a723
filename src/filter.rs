//! Maps an incoming [`Change`] to the set of subscribers whose shape matches.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::change::{Change, Tuple, Value};
use crate::relation::Relation;
use crate::shape::{ComparisonOp, Predicate, Shape, ShapeHandle};
use crate::subscriber::SubscriberId;

#[derive(Default)]
struct Inner {
    /// relation -> subscribers whose shape is defined on that relation, or
    /// who depend on a shape defined on that relation.
    by_relation: HashMap<Relation, HashSet<SubscriberId>>,
    shapes: HashMap<SubscriberId, Shape>,
    /// Every relation a subscriber is indexed under, own or inherited from a
    /// dependency, so `remove_shape` can clean up all of them.
    registered_relations: HashMap<SubscriberId, Vec<Relation>>,
    /// handle -> relation for every shape ever added, so a later outer shape
    /// can resolve its `shape_dependencies` to relations. Subscribers are
    /// always added in dependency order, so an inner shape's entry exists
    /// here before any outer shape that depends on it is added.
    relation_of_handle: HashMap<ShapeHandle, Relation>,
}

/// Indexes shapes by affected relation / predicate so that for any change
/// event the Dispatcher can cheaply ask "who cares about this".
///
/// Predicate evaluation is conservative: it may return false positives
/// (a subscriber gets a change its shape doesn't actually match, which the
/// Consumer discards) but must never return false negatives.
#[derive(Default)]
pub struct Filter {
    inner: RwLock<Inner>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes `subscriber` under its own relation and, for a subquery
    /// shape, under each of its dependencies' relations too — a change on
    /// the inner relation alone must still reach the outer subscriber so it
    /// can detect a row entering or leaving its join.
    pub fn add_shape(&self, subscriber: SubscriberId, shape: Shape) {
        let mut inner = self.inner.write();
        inner
            .relation_of_handle
            .insert(shape.handle().clone(), shape.relation.clone());

        let mut relations: HashSet<Relation> = HashSet::from([shape.relation.clone()]);
        for dep in &shape.shape_dependencies {
            if let Some(dep_relation) = inner.relation_of_handle.get(dep) {
                relations.insert(dep_relation.clone());
            }
        }

        for relation in &relations {
            inner
                .by_relation
                .entry(relation.clone())
                .or_default()
                .insert(subscriber);
        }
        inner
            .registered_relations
            .insert(subscriber, relations.into_iter().collect());
        inner.shapes.insert(subscriber, shape);
    }

    pub fn remove_shape(&self, subscriber: SubscriberId) {
        let mut inner = self.inner.write();
        inner.shapes.remove(&subscriber);
        let Some(relations) = inner.registered_relations.remove(&subscriber) else {
            return;
        };
        for relation in relations {
            if let Some(set) = inner.by_relation.get_mut(&relation) {
                set.remove(&subscriber);
                if set.is_empty() {
                    inner.by_relation.remove(&relation);
                }
            }
        }
    }

    pub fn shape(&self, subscriber: SubscriberId) -> Option<Shape> {
        self.inner.read().shapes.get(&subscriber).cloned()
    }

    /// All subscribers whose shape could be affected by `change`.
    pub fn affected_shapes(&self, change: &Change) -> HashSet<SubscriberId> {
        let inner = self.inner.read();
        let Some(candidates) = inner.by_relation.get(change.relation()) else {
            return HashSet::new();
        };

        candidates
            .iter()
            .copied()
            .filter(|subscriber| {
                let shape = inner
                    .shapes
                    .get(subscriber)
                    .expect("by_relation/shapes out of sync");
                satisfiable(&shape.predicate, change)
            })
            .collect()
    }
}

/// Conservative predicate evaluation: only [`Predicate::Simple`] is
/// actually evaluated against the change's tuple data. Anything else
/// (subquery, opaque SQL, or a column missing from the tuple) is treated
/// as "affected" rather than risk a false negative.
fn satisfiable(predicate: &Predicate, change: &Change) -> bool {
    match predicate {
        Predicate::None => true,
        Predicate::Subquery { .. } | Predicate::Opaque(_) => true, // conservative: never structurally evaluated
        Predicate::Simple { column, op, value } => {
            let (old, new) = tuples_of(change);
            [old, new]
                .into_iter()
                .flatten()
                .any(|tuple| tuple_satisfies(tuple, column, *op, value))
                // A tuple-less change (truncate, relation) can't be
                // evaluated; conservatively treat it as affecting the shape.
                || (old.is_none() && new.is_none())
        }
    }
}

fn tuples_of(change: &Change) -> (Option<&Tuple>, Option<&Tuple>) {
    match change {
        Change::Insert { new, .. } => (None, Some(new)),
        Change::Update { old, new, .. } => (old.as_ref(), Some(new)),
        Change::Delete { old, .. } => (Some(old), None),
        Change::Truncate { .. } | Change::Relation { .. } => (None, None),
    }
}

fn tuple_satisfies(tuple: &Tuple, column: &str, op: ComparisonOp, value: &Value) -> bool {
    let Some(actual) = tuple.get(column) else {
        // Column absent from this tuple: can't evaluate, so don't rule it out.
        return true;
    };
    let Some(ordering) = compare(actual, value) else {
        return true;
    };
    match op {
        ComparisonOp::Eq => ordering == std::cmp::Ordering::Equal,
        ComparisonOp::Ne => ordering != std::cmp::Ordering::Equal,
        ComparisonOp::Lt => ordering == std::cmp::Ordering::Less,
        ComparisonOp::Lte => ordering != std::cmp::Ordering::Greater,
        ComparisonOp::Gt => ordering == std::cmp::Ordering::Greater,
        ComparisonOp::Gte => ordering != std::cmp::Ordering::Less,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sub(id: u64) -> SubscriberId {
        SubscriberId::new(id, 0)
    }

    fn insert(relation: Relation, column: &str, value: Value) -> Change {
        let mut tuple = Tuple::new();
        tuple.insert(column.to_string(), value);
        Change::Insert {
            relation,
            op_index: 0,
            new: tuple,
        }
    }

    #[test]
    fn test_no_subscribers_no_match() {
        let filter = Filter::new();
        let change = insert(Relation::public("users"), "id", Value::Int(1));
        assert!(filter.affected_shapes(&change).is_empty());
    }

    #[test]
    fn test_matches_by_relation() {
        let filter = Filter::new();
        filter.add_shape(sub(1), Shape::without_predicate(Relation::public("users")));
        filter.add_shape(sub(2), Shape::without_predicate(Relation::public("orders")));

        let change = insert(Relation::public("users"), "id", Value::Int(1));
        let affected = filter.affected_shapes(&change);
        assert_eq!(affected, HashSet::from([sub(1)]));
    }

    #[test]
    fn test_simple_predicate_filters_out_non_matching_rows() {
        let filter = Filter::new();
        let shape = Shape::new(
            Relation::public("orders"),
            Predicate::Simple {
                column: "status".into(),
                op: ComparisonOp::Eq,
                value: Value::Text("open".into()),
            },
            vec![],
        );
        filter.add_shape(sub(1), shape);

        let matching = insert(Relation::public("orders"), "status", Value::Text("open".into()));
        assert_eq!(filter.affected_shapes(&matching), HashSet::from([sub(1)]));

        let non_matching = insert(
            Relation::public("orders"),
            "status",
            Value::Text("closed".into()),
        );
        assert!(filter.affected_shapes(&non_matching).is_empty());
    }

    #[test]
    fn test_opaque_predicate_is_conservative() {
        let filter = Filter::new();
        let shape = Shape::new(
            Relation::public("orders"),
            Predicate::Opaque("total > (select avg(total) from orders)".into()),
            vec![],
        );
        filter.add_shape(sub(1), shape);

        let change = insert(Relation::public("orders"), "total", Value::Int(1));
        assert_eq!(filter.affected_shapes(&change), HashSet::from([sub(1)]));
    }

    #[test]
    fn test_remove_shape() {
        let filter = Filter::new();
        filter.add_shape(sub(1), Shape::without_predicate(Relation::public("users")));
        filter.remove_shape(sub(1));

        let change = insert(Relation::public("users"), "id", Value::Int(1));
        assert!(filter.affected_shapes(&change).is_empty());
    }

    #[test]
    fn test_subquery_subscriber_also_indexed_under_inner_relation() {
        use crate::shape::Shape;

        let filter = Filter::new();
        let inner = Shape::without_predicate(Relation::public("x"));
        filter.add_shape(sub(1), inner.clone());

        let outer = Shape::new(
            Relation::public("y"),
            Predicate::Subquery {
                column: "y_id".into(),
                inner: inner.handle().clone(),
                inner_key_column: "x_id".into(),
            },
            vec![inner.handle().clone()],
        );
        filter.add_shape(sub(2), outer);

        let change = insert(Relation::public("x"), "x_id", Value::Int(1));
        assert_eq!(filter.affected_shapes(&change), HashSet::from([sub(1), sub(2)]));

        filter.remove_shape(sub(2));
        assert_eq!(filter.affected_shapes(&change), HashSet::from([sub(1)]));
    }

    #[test]
    fn test_truncate_is_conservative() {
        let filter = Filter::new();
        let shape = Shape::new(
            Relation::public("orders"),
            Predicate::Simple {
                column: "status".into(),
                op: ComparisonOp::Eq,
                value: Value::Text("open".into()),
            },
            vec![],
        );
        filter.add_shape(sub(1), shape);

        let change = Change::Truncate {
            relation: Relation::public("orders"),
            op_index: 0,
        };
        assert_eq!(filter.affected_shapes(&change), HashSet::from([sub(1)]));
    }
}
