//! The wire-independent change/transaction/offset data model.
//!
//! This is the typed shape the out-of-scope Postgres replication layer is
//! expected to hand us — see [`crate::producer::LogCollector`] for the
//! upstream contract that produces these types.

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::relation::Relation;

/// A single column value. Deliberately small: this core never interprets
/// column values beyond equality/ordering for predicate evaluation and
/// primary-key extraction, so there's no need to track Postgres OIDs here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

// Manual `Eq`/`Hash` so a `Value` can key the Materializer's row-set
// (`HashMap<Value, Tuple>`, see `crate::materializer::RowSet`) despite the
// `Float` variant. Hashing `f64` by its bit pattern is consistent with
// `PartialEq`'s derived `==` as long as nobody keys a row-set by `NaN`,
// which a primary-key/join column never legitimately is.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "\\x{}", hex_encode(b)),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// An ordered column-name -> value mapping for one row.
pub type Tuple = IndexMap<String, Value>;

/// A total order on stored changes: `(txn_lsn, op_index)`.
///
/// Encodes externally as `"<txn_lsn>_<op_index>"`: a 16-digit zero-padded
/// hex LSN and a decimal operation index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub txn_lsn: u64,
    pub op_index: u32,
}

impl Offset {
    pub const ZERO: Offset = Offset {
        txn_lsn: 0,
        op_index: 0,
    };

    pub fn new(txn_lsn: u64, op_index: u32) -> Self {
        Self { txn_lsn, op_index }
    }

    pub fn encode(&self) -> String {
        format!("{:016x}_{}", self.txn_lsn, self.op_index)
    }

    pub fn parse(s: &str) -> Result<Self, OffsetParseError> {
        let (lsn, idx) = s.split_once('_').ok_or(OffsetParseError::MissingSeparator)?;
        let txn_lsn = u64::from_str_radix(lsn, 16).map_err(|_| OffsetParseError::BadLsn)?;
        let op_index: u32 = idx.parse().map_err(|_| OffsetParseError::BadIndex)?;
        Ok(Self { txn_lsn, op_index })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OffsetParseError {
    #[error("offset missing '_' separator")]
    MissingSeparator,
    #[error("offset LSN is not valid hex")]
    BadLsn,
    #[error("offset op_index is not a valid decimal integer")]
    BadIndex,
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Offset {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.txn_lsn, self.op_index).cmp(&(other.txn_lsn, other.op_index))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// One row-level operation produced by the replication stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Insert {
        relation: Relation,
        op_index: u32,
        new: Tuple,
    },
    Update {
        relation: Relation,
        op_index: u32,
        old: Option<Tuple>,
        new: Tuple,
    },
    Delete {
        relation: Relation,
        op_index: u32,
        old: Tuple,
    },
    Truncate {
        relation: Relation,
        op_index: u32,
    },
    /// Schema change: either a plain relation announcement, or (when
    /// `parent` is set) a partition-to-parent mapping update.
    Relation {
        relation: Relation,
        op_index: u32,
        parent: Option<Relation>,
    },
}

impl Change {
    pub fn relation(&self) -> &Relation {
        match self {
            Change::Insert { relation, .. }
            | Change::Update { relation, .. }
            | Change::Delete { relation, .. }
            | Change::Truncate { relation, .. }
            | Change::Relation { relation, .. } => relation,
        }
    }

    pub fn op_index(&self) -> u32 {
        match self {
            Change::Insert { op_index, .. }
            | Change::Update { op_index, .. }
            | Change::Delete { op_index, .. }
            | Change::Truncate { op_index, .. }
            | Change::Relation { op_index, .. } => *op_index,
        }
    }

    /// Re-point this change at a (possibly different) relation, preserving
    /// everything else. Used by [`crate::partitions::Partitions`] to rewrite
    /// a partition-table change onto its logical parent.
    pub fn with_relation(mut self, relation: Relation) -> Self {
        match &mut self {
            Change::Insert { relation: r, .. }
            | Change::Update { relation: r, .. }
            | Change::Delete { relation: r, .. }
            | Change::Truncate { relation: r, .. }
            | Change::Relation { relation: r, .. } => *r = relation,
        }
        self
    }

    pub fn offset(&self, txn_lsn: u64) -> Offset {
        Offset::new(txn_lsn, self.op_index())
    }
}

/// An ordered, nonempty list of [`Change`]s with a single commit LSN.
///
/// Used internally to reconstruct the whole-transaction view that
/// `write_unit = txn` consumers require at commit time; see
/// [`crate::consumer::Consumer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub commit_lsn: u64,
    pub changes: Vec<Change>,
}

impl Transaction {
    pub fn new(commit_lsn: u64, changes: Vec<Change>) -> Self {
        Self { commit_lsn, changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_offset_encode() {
        let offset = Offset::new(0xABCD, 7);
        assert_eq!(offset.encode(), "000000000000abcd_7");
    }

    #[test]
    fn test_offset_roundtrip() {
        let offset = Offset::new(123456, 42);
        let encoded = offset.encode();
        let decoded = Offset::parse(&encoded).unwrap();
        assert_eq!(offset, decoded);
    }

    #[test]
    fn test_offset_ordering() {
        let a = Offset::new(1, 5);
        let b = Offset::new(1, 6);
        let c = Offset::new(2, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_offset_parse_errors() {
        assert_eq!(
            Offset::parse("no-separator-here"),
            Err(OffsetParseError::MissingSeparator)
        );
        assert_eq!(Offset::parse("zzzz_1"), Err(OffsetParseError::BadLsn));
        assert_eq!(Offset::parse("1_zz"), Err(OffsetParseError::BadIndex));
    }

    #[test]
    fn test_change_relation_rewrite() {
        let change = Change::Insert {
            relation: Relation::public("orders_2024"),
            op_index: 0,
            new: Tuple::new(),
        };
        let rewritten = change.with_relation(Relation::public("orders"));
        assert_eq!(rewritten.relation(), &Relation::public("orders"));
    }
}
