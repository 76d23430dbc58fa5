//! Application-level conflict resolution.
//!
//! When two transactions write the same object from the same base revision,
//! the second `store` may still succeed if a resolver is registered for the
//! object's class. The resolver sees three states with persistent references
//! left as tagged values, so it can compare them without loading anything.

use crate::error::CoreResult;
use crate::serialize::{decode_class, decode_record, encode_record, ClassInfo};
use crate::types::Oid;
use objdb_codec::Value;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The three states handed to a resolver.
#[derive(Debug)]
pub struct ConflictInput<'a> {
    /// Object in conflict.
    pub oid: Oid,
    /// Its class.
    pub class: &'a ClassInfo,
    /// State both writers started from, if the object existed.
    pub ancestor: Option<&'a Value>,
    /// State committed by the other transaction.
    pub committed: &'a Value,
    /// State this transaction wants to write.
    pub new: &'a Value,
}

/// A merge function. Returns `None` to refuse the merge.
pub type ResolverFn = dyn Fn(&ConflictInput<'_>) -> Option<Value> + Send + Sync;

/// Registry of resolvers keyed by class.
#[derive(Default)]
pub struct ConflictResolvers {
    resolvers: RwLock<HashMap<ClassInfo, Arc<ResolverFn>>>,
}

impl ConflictResolvers {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the resolver for `class`.
    pub fn register<F>(&self, class: ClassInfo, resolver: F)
    where
        F: Fn(&ConflictInput<'_>) -> Option<Value> + Send + Sync + 'static,
    {
        self.resolvers.write().insert(class, Arc::new(resolver));
    }

    /// Removes the resolver for `class`.
    pub fn unregister(&self, class: &ClassInfo) -> bool {
        self.resolvers.write().remove(class).is_some()
    }

    /// True if `class` has a resolver.
    pub fn contains(&self, class: &ClassInfo) -> bool {
        self.resolvers.read().contains_key(class)
    }

    /// Number of registered resolvers.
    pub fn len(&self) -> usize {
        self.resolvers.read().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.resolvers.read().is_empty()
    }

    /// Attempts to merge `new` with `committed`.
    ///
    /// Returns the merged payload, or `None` when no resolver applies or the
    /// resolver refuses. Payloads that do not decode as object records are
    /// never resolvable.
    pub fn resolve(
        &self,
        oid: Oid,
        ancestor: Option<&[u8]>,
        committed: &[u8],
        new: &[u8],
    ) -> CoreResult<Option<Vec<u8>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let Ok(class) = decode_class(new) else {
            return Ok(None);
        };
        let Some(resolver) = self.resolvers.read().get(&class).cloned() else {
            return Ok(None);
        };

        let (_, new_state) = decode_record(new)?;
        let (committed_class, committed_state) = decode_record(committed)?;
        if committed_class != class {
            debug!(%oid, %class, %committed_class, "class changed under conflict; not resolving");
            return Ok(None);
        }
        let ancestor_state = match ancestor {
            Some(payload) => Some(decode_record(payload)?.1),
            None => None,
        };

        let input = ConflictInput {
            oid,
            class: &class,
            ancestor: ancestor_state.as_ref(),
            committed: &committed_state,
            new: &new_state,
        };
        match resolver(&input) {
            Some(merged) => {
                debug!(%oid, %class, "conflict resolved");
                Ok(Some(encode_record(&class, &merged)))
            }
            None => {
                debug!(%oid, %class, "resolver refused conflict");
                Ok(None)
            }
        }
    }
}

impl fmt::Debug for ConflictResolvers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolvers = self.resolvers.read();
        let mut classes: Vec<String> = resolvers.keys().map(ToString::to_string).collect();
        classes.sort();
        f.debug_struct("ConflictResolvers")
            .field("classes", &classes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> ClassInfo {
        ClassInfo::new("app", "Counter")
    }

    fn payload(n: i64) -> Vec<u8> {
        encode_record(
            &counter(),
            &Value::map(vec![(Value::text("n"), Value::Integer(n))]),
        )
    }

    fn n(value: &Value) -> i64 {
        value.get("n").and_then(Value::as_integer).unwrap_or(0)
    }

    fn register_additive(resolvers: &ConflictResolvers) {
        resolvers.register(counter(), |input| {
            let base = input.ancestor.map(n).unwrap_or(0);
            let merged = n(input.committed) + n(input.new) - base;
            Some(Value::map(vec![(Value::text("n"), Value::Integer(merged))]))
        });
    }

    #[test]
    fn merges_with_registered_resolver() {
        let resolvers = ConflictResolvers::new();
        register_additive(&resolvers);

        let merged = resolvers
            .resolve(Oid::from_u64(1), Some(&payload(10)), &payload(11), &payload(15))
            .unwrap()
            .unwrap();
        assert_eq!(merged, payload(16));
    }

    #[test]
    fn no_resolver_means_no_merge() {
        let resolvers = ConflictResolvers::new();
        assert!(resolvers
            .resolve(Oid::from_u64(1), None, &payload(1), &payload(2))
            .unwrap()
            .is_none());
        assert!(resolvers
            .resolve(Oid::from_u64(1), None, b"raw", b"bytes")
            .unwrap()
            .is_none());
    }

    #[test]
    fn refusal_is_not_an_error() {
        let resolvers = ConflictResolvers::new();
        resolvers.register(counter(), |_| None);
        assert!(resolvers
            .resolve(Oid::from_u64(1), None, &payload(1), &payload(2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn register_and_unregister() {
        let resolvers = ConflictResolvers::new();
        register_additive(&resolvers);
        assert!(resolvers.contains(&counter()));
        assert_eq!(resolvers.len(), 1);
        assert!(resolvers.unregister(&counter()));
        assert!(resolvers.is_empty());
    }
}
