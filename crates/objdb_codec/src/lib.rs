//! # objdb codec
//!
//! Canonical CBOR for objdb object payloads.
//!
//! Every object record stores two concatenated CBOR items: a class section
//! (`[module, name]`) followed by the object state. Persistent references
//! inside either section are tagged values (see [`PersistentRef`]), which the
//! streaming [`scan_references`] function extracts without materialising the
//! state.
//!
//! ## Canonical CBOR Rules
//!
//! - Maps are sorted by key (length-first, then bytewise on encoded keys)
//! - Integers and lengths use shortest encoding
//! - No floats, no indefinite-length items
//! - Strings must be UTF-8
//!
//! ## Usage
//!
//! ```
//! use objdb_codec::{from_cbor, to_canonical_cbor, Value};
//!
//! let value = Value::map(vec![(Value::text("count"), Value::Integer(42))]);
//! let bytes = to_canonical_cbor(&value);
//! assert_eq!(from_cbor(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod reference;
mod scan;
mod value;

pub use decoder::{from_cbor, CanonicalDecoder};
pub use encoder::{to_canonical_cbor, CanonicalEncoder};
pub use error::{CodecError, CodecResult};
pub use reference::{PersistentRef, PERSISTENT_REF_TAG};
pub use scan::{scan_references, ReferenceScanner};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_state_roundtrip() {
        let value = Value::map(vec![
            (
                Value::text("users"),
                Value::Array(vec![
                    Value::map(vec![
                        (Value::text("name"), Value::text("Alice")),
                        (Value::text("age"), Value::Integer(30)),
                    ]),
                    PersistentRef::Bare([0, 0, 0, 0, 0, 0, 0, 2]).to_value(),
                ]),
            ),
            (Value::text("count"), Value::Integer(-2)),
            (Value::text("blob"), Value::Bytes(vec![0, 255])),
        ]);
        let bytes = to_canonical_cbor(&value);
        assert_eq!(from_cbor(&bytes).unwrap(), value);
    }

    #[test]
    fn encoding_is_deterministic_across_insertion_order() {
        let a = Value::Map(vec![
            (Value::text("z"), Value::Integer(1)),
            (Value::text("a"), Value::Integer(2)),
        ]);
        let b = Value::Map(vec![
            (Value::text("a"), Value::Integer(2)),
            (Value::text("z"), Value::Integer(1)),
        ]);
        assert_eq!(to_canonical_cbor(&a), to_canonical_cbor(&b));
    }
}
