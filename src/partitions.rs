//! Partition -> logical parent relation routing.

use fnv::FnvHashMap as HashMap;
use parking_lot::RwLock;

use crate::change::Change;
use crate::relation::Relation;

/// Holds `partition_relation -> parent_relation` and rewrites incoming
/// changes so a change on a partition is re-labelled as a change on the
/// logical parent.
///
/// Pure function of the currently known partition map: the map itself is
/// only ever updated by a `relation` schema-change event that carries a
/// `parent`, mirroring `backend::replication::buffer::Buffer`'s
/// oid-keyed relation bookkeeping (`HashMap<i32, Relation>` built up purely
/// from observed `Relation` messages).
#[derive(Default)]
pub struct Partitions {
    parents: RwLock<HashMap<Relation, Relation>>,
}

impl Partitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parent(&self, partition: Relation, parent: Relation) {
        self.parents.write().insert(partition, parent);
    }

    pub fn remove_partition(&self, partition: &Relation) {
        self.parents.write().remove(partition);
    }

    pub fn parent_of(&self, relation: &Relation) -> Option<Relation> {
        self.parents.read().get(relation).cloned()
    }

    /// Rewrite `change`'s relation to its logical parent if it's a known
    /// partition, and fold any `relation` schema-change event carrying a
    /// `parent` into the map.
    pub fn handle_event(&self, change: Change) -> Change {
        if let Change::Relation {
            relation,
            parent: Some(parent),
            ..
        } = &change
        {
            self.set_parent(relation.clone(), parent.clone());
        }

        match self.parent_of(change.relation()) {
            Some(parent) => change.with_relation(parent),
            None => change,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rewrites_partition_to_parent() {
        let partitions = Partitions::new();
        partitions.set_parent(Relation::public("orders_2024"), Relation::public("orders"));

        let change = Change::Insert {
            relation: Relation::public("orders_2024"),
            op_index: 0,
            new: Default::default(),
        };
        let rewritten = partitions.handle_event(change);
        assert_eq!(rewritten.relation(), &Relation::public("orders"));
    }

    #[test]
    fn test_unknown_relation_passes_through() {
        let partitions = Partitions::new();
        let change = Change::Insert {
            relation: Relation::public("users"),
            op_index: 0,
            new: Default::default(),
        };
        let rewritten = partitions.handle_event(change);
        assert_eq!(rewritten.relation(), &Relation::public("users"));
    }

    #[test]
    fn test_relation_event_registers_parent() {
        let partitions = Partitions::new();
        let event = Change::Relation {
            relation: Relation::public("orders_2025"),
            op_index: 0,
            parent: Some(Relation::public("orders")),
        };
        partitions.handle_event(event);

        let change = Change::Insert {
            relation: Relation::public("orders_2025"),
            op_index: 1,
            new: Default::default(),
        };
        assert_eq!(
            partitions.handle_event(change).relation(),
            &Relation::public("orders")
        );
    }

    #[test]
    fn test_remove_partition() {
        let partitions = Partitions::new();
        partitions.set_parent(Relation::public("orders_2024"), Relation::public("orders"));
        partitions.remove_partition(&Relation::public("orders_2024"));
        assert_eq!(partitions.parent_of(&Relation::public("orders_2024")), None);
    }
}
