//! Dynamic CBOR value type.

use crate::encoder::to_canonical_cbor;
use crate::reference::PersistentRef;
use std::cmp::Ordering;

/// A dynamic CBOR value.
///
/// Object state is held as a `Value` tree. Persistent references appear as
/// [`Value::Tag`] nodes carrying [`crate::PERSISTENT_REF_TAG`], so conflict
/// resolvers can compare them structurally without loading the referenced
/// objects. Floats are not supported.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (supports full i64 range).
    Integer(i64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Text string (UTF-8).
    Text(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Map of key-value pairs (keys are sorted for canonical encoding).
    Map(Vec<(Value, Value)>),
    /// Tagged value (CBOR major type 6).
    Tag(u64, Box<Value>),
}

impl Value {
    /// Create a map value with sorted keys.
    pub fn map(mut pairs: Vec<(Value, Value)>) -> Self {
        pairs.sort_by(|a, b| a.0.cmp_canonical(&b.0));
        Value::Map(pairs)
    }

    /// Create an empty map.
    pub fn empty_map() -> Self {
        Value::Map(Vec::new())
    }

    /// Create a text value.
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Compare two values by their canonical encodings.
    ///
    /// Shorter encodings sort first; equal lengths compare bytewise
    /// (RFC 8949 §4.2.1 "length-first" ordering).
    pub fn cmp_canonical(&self, other: &Self) -> Ordering {
        let a = to_canonical_cbor(self);
        let b = to_canonical_cbor(other);
        a.len().cmp(&b.len()).then_with(|| a.cmp(&b))
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as a map, if it is one.
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Interpret this value as a persistent reference.
    pub fn as_reference(&self) -> Option<PersistentRef> {
        PersistentRef::from_value(self).ok()
    }

    /// Look up a text key in this map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_text() == Some(key))
            .map(|(_, v)| v)
    }

    /// Insert or replace a text key in this map value, keeping keys sorted.
    ///
    /// Returns `false` if this value is not a map.
    pub fn insert(&mut self, key: &str, value: Value) -> bool {
        let Value::Map(pairs) = self else {
            return false;
        };
        if let Some(slot) = pairs.iter_mut().find(|(k, _)| k.as_text() == Some(key)) {
            slot.1 = value;
        } else {
            pairs.push((Value::text(key), value));
            pairs.sort_by(|a, b| a.0.cmp_canonical(&b.0));
        }
        true
    }

    /// Remove a text key from this map value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let Value::Map(pairs) = self else {
            return None;
        };
        let index = pairs.iter().position(|(k, _)| k.as_text() == Some(key))?;
        Some(pairs.remove(index).1)
    }

    /// Collects every strong persistent reference in this tree, in order.
    pub fn references(&self) -> Vec<[u8; 8]> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<[u8; 8]>) {
        match self {
            Value::Tag(tag, inner) if *tag == crate::PERSISTENT_REF_TAG => {
                match PersistentRef::from_value(self) {
                    Ok(r) if !r.is_weak() => out.push(r.oid()),
                    Ok(_) => {}
                    Err(_) => inner.collect_references(out),
                }
            }
            Value::Tag(_, inner) => inner.collect_references(out),
            Value::Array(items) => items.iter().for_each(|v| v.collect_references(out)),
            Value::Map(pairs) => {
                for (k, v) in pairs {
                    k.collect_references(out);
                    v.collect_references(out);
                }
            }
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_keys_are_sorted_length_first() {
        let map = Value::map(vec![
            (Value::text("abc"), Value::Integer(1)),
            (Value::text("b"), Value::Integer(2)),
            (Value::text("a"), Value::Integer(3)),
        ]);
        let keys: Vec<_> = map
            .as_map()
            .unwrap()
            .iter()
            .map(|(k, _)| k.as_text().unwrap().to_string())
            .collect();
        assert_eq!(keys, ["a", "b", "abc"]);
    }

    #[test]
    fn integer_ordering() {
        let mut values = vec![
            Value::Integer(-1),
            Value::Integer(300),
            Value::Integer(0),
            Value::Integer(-2),
            Value::Integer(2),
        ];
        values.sort_by(Value::cmp_canonical);
        assert_eq!(
            values,
            [
                Value::Integer(0),
                Value::Integer(2),
                Value::Integer(-1),
                Value::Integer(-2),
                Value::Integer(300),
            ]
        );
    }

    #[test]
    fn insert_and_remove_keep_map_sorted() {
        let mut map = Value::empty_map();
        assert!(map.insert("zeta", Value::Integer(1)));
        assert!(map.insert("a", Value::Integer(2)));
        assert!(map.insert("zeta", Value::Integer(3)));
        assert_eq!(map.get("zeta"), Some(&Value::Integer(3)));
        assert_eq!(map.as_map().unwrap()[0].0, Value::text("a"));

        assert_eq!(map.remove("a"), Some(Value::Integer(2)));
        assert_eq!(map.get("a"), None);
        assert!(!Value::Null.clone().insert("x", Value::Null));
    }

    #[test]
    fn references_skip_weak_and_descend_into_containers() {
        let strong = PersistentRef::Bare([0, 0, 0, 0, 0, 0, 0, 7]).to_value();
        let classed = PersistentRef::Classed {
            oid: [0, 0, 0, 0, 0, 0, 0, 9],
            module: "app".into(),
            name: "Node".into(),
        }
        .to_value();
        let weak = PersistentRef::Weak([0, 0, 0, 0, 0, 0, 0, 8]).to_value();
        let state = Value::map(vec![
            (Value::text("next"), strong),
            (Value::text("items"), Value::Array(vec![weak, classed])),
        ]);

        assert_eq!(
            state.references(),
            vec![[0, 0, 0, 0, 0, 0, 0, 7], [0, 0, 0, 0, 0, 0, 0, 9]]
        );
    }

    #[test]
    fn value_accessors() {
        assert!(Value::Null.is_null());
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Integer(42).as_integer(), Some(42));
        assert_eq!(Value::text("hi").as_text(), Some("hi"));
        assert_eq!(Value::Bytes(vec![1, 2]).as_bytes(), Some(&[1, 2][..]));
        assert_eq!(Value::from(()), Value::Null);
        assert!(Value::Integer(1).as_reference().is_none());
    }
}
