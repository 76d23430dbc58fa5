//! Property-based test generators using proptest.
//!
//! Strategies produce OIDs from a small pool (so operations collide), object
//! states that may embed persistent references, and sequences of storage
//! operations for model-checking a storage.

use objdb_codec::{PersistentRef, Value};
use objdb_core::Oid;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for OIDs in `1..=pool`.
pub fn oid_strategy(pool: u64) -> impl Strategy<Value = Oid> + Clone {
    (1..=pool.max(1)).prop_map(Oid::from_u64)
}

/// Strategy for opaque payload bytes.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> + Clone {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// Strategy for persistent references to OIDs in `0..=pool`.
pub fn reference_strategy(pool: u64) -> impl Strategy<Value = PersistentRef> {
    let oid = (0..=pool).prop_map(|n| Oid::from_u64(n).to_bytes());
    prop_oneof![
        3 => oid.clone().prop_map(PersistentRef::Bare),
        1 => oid.clone().prop_map(|oid| PersistentRef::Classed {
            oid,
            module: "objdb.testing".to_string(),
            name: "Leaf".to_string(),
        }),
        1 => oid.prop_map(PersistentRef::Weak),
    ]
}

/// Strategy for scalar values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        "[a-z0-9 ]{0,16}".prop_map(Value::Text),
    ]
}

/// Strategy for object states: nested arrays and maps of scalars and
/// references to OIDs in `0..=pool`.
pub fn state_strategy(pool: u64) -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        4 => scalar_strategy(),
        1 => reference_strategy(pool).prop_map(|r| r.to_value()),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..6).prop_map(|fields| {
                Value::map(fields.into_iter().map(|(k, v)| (Value::Text(k), v)).collect())
            }),
        ]
    })
}

/// Strong reference targets of `state`, in any order.
pub fn strong_targets(state: &Value) -> Vec<Oid> {
    let mut out = Vec::new();
    collect_targets(state, &mut out);
    out
}

fn collect_targets(value: &Value, out: &mut Vec<Oid>) {
    if let Some(reference) = value.as_reference() {
        if !reference.is_weak() {
            out.push(Oid::new(reference.oid()));
        }
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_targets(item, out)),
        Value::Map(pairs) => pairs.iter().for_each(|(k, v)| {
            collect_targets(k, out);
            collect_targets(v, out);
        }),
        Value::Tag(_, inner) => collect_targets(inner, out),
        _ => {}
    }
}

/// One step of a storage workload.
#[derive(Debug, Clone)]
pub enum StorageOperation {
    /// Commit new revisions of these objects in one transaction.
    Commit {
        /// Objects and payloads.
        writes: BTreeMap<Oid, Vec<u8>>,
    },
    /// Stage the same writes, then abort.
    Abort {
        /// Objects and payloads.
        writes: BTreeMap<Oid, Vec<u8>>,
    },
}

/// Strategy for storage operations over OIDs in `1..=pool`.
pub fn storage_operation_strategy(pool: u64) -> impl Strategy<Value = StorageOperation> {
    let writes = prop::collection::btree_map(oid_strategy(pool), payload_strategy(), 1..4);
    prop_oneof![
        4 => writes.clone().prop_map(|writes| StorageOperation::Commit { writes }),
        1 => writes.prop_map(|writes| StorageOperation::Abort { writes }),
    ]
}

/// Strategy for a sequence of storage operations.
pub fn operation_sequence_strategy(
    pool: u64,
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<StorageOperation>> {
    prop::collection::vec(storage_operation_strategy(pool), min_ops..max_ops)
}

/// Case counts for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 500,
        }
    }
}

impl PropTestConfig {
    /// Few cases, for tests that touch the file system.
    #[must_use]
    pub fn on_disk() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 50,
        }
    }

    /// Converts to a proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
