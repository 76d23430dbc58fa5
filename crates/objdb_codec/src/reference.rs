//! Persistent references embedded in object state.
//!
//! A reference is a CBOR tag [`PERSISTENT_REF_TAG`] wrapping one of:
//!
//! | Form    | Tagged content                         |
//! |---------|----------------------------------------|
//! | bare    | `bstr(8)` oid                          |
//! | classed | `[bstr(8) oid, [module, name]]`        |
//! | weak    | any other array whose first item is an oid |
//!
//! Weak references never keep their target alive and are skipped by the
//! reference scanner.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// CBOR tag number marking a persistent reference.
pub const PERSISTENT_REF_TAG: u64 = 28521;

/// A decoded persistent reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PersistentRef {
    /// Reference carrying only the target oid.
    Bare([u8; 8]),
    /// Reference that also names the target's class, so a ghost can be
    /// created without loading the target.
    Classed {
        /// Target oid.
        oid: [u8; 8],
        /// Module of the target class.
        module: String,
        /// Name of the target class.
        name: String,
    },
    /// Weak reference.
    Weak([u8; 8]),
}

impl PersistentRef {
    /// The referenced oid.
    pub fn oid(&self) -> [u8; 8] {
        match self {
            Self::Bare(oid) | Self::Weak(oid) | Self::Classed { oid, .. } => *oid,
        }
    }

    /// True for weak references.
    pub fn is_weak(&self) -> bool {
        matches!(self, Self::Weak(_))
    }

    /// Encodes this reference as a tagged value.
    pub fn to_value(&self) -> Value {
        let inner = match self {
            Self::Bare(oid) => Value::Bytes(oid.to_vec()),
            Self::Classed { oid, module, name } => Value::Array(vec![
                Value::Bytes(oid.to_vec()),
                Value::Array(vec![Value::text(module.as_str()), Value::text(name.as_str())]),
            ]),
            Self::Weak(oid) => Value::Array(vec![Value::Bytes(oid.to_vec())]),
        };
        Value::Tag(PERSISTENT_REF_TAG, Box::new(inner))
    }

    /// Decodes a tagged value into a reference.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedReference`] if `value` is not a
    /// persistent-reference tag or its content has none of the known shapes.
    pub fn from_value(value: &Value) -> CodecResult<Self> {
        let Value::Tag(PERSISTENT_REF_TAG, inner) = value else {
            return Err(CodecError::malformed_reference("not a reference tag"));
        };
        match inner.as_ref() {
            Value::Bytes(bytes) => oid_from_slice(bytes).map(Self::Bare),
            Value::Array(items) => {
                let oid = items
                    .first()
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| CodecError::malformed_reference("array without leading oid"))
                    .and_then(oid_from_slice)?;
                match items.as_slice() {
                    [_, Value::Array(class)] => match class.as_slice() {
                        [Value::Text(module), Value::Text(name)] => Ok(Self::Classed {
                            oid,
                            module: module.clone(),
                            name: name.clone(),
                        }),
                        _ => Ok(Self::Weak(oid)),
                    },
                    _ => Ok(Self::Weak(oid)),
                }
            }
            _ => Err(CodecError::malformed_reference(
                "expected byte string or array",
            )),
        }
    }
}

pub(crate) fn oid_from_slice(bytes: &[u8]) -> CodecResult<[u8; 8]> {
    <[u8; 8]>::try_from(bytes).map_err(|_| {
        CodecError::malformed_reference(format!("oid must be 8 bytes, got {}", bytes.len()))
    })
}
