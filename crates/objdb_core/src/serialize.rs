//! Object record payloads.
//!
//! A payload is two concatenated canonical CBOR items: the class section
//! `[module, name]` and the state. The storage layer never looks inside a
//! payload except to scan references during pack and verify.

use crate::error::{CoreError, CoreResult};
use crate::types::Oid;
use objdb_codec::{scan_references, CanonicalDecoder, CanonicalEncoder, Value};
use std::fmt;

/// Class identity of a persistent object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassInfo {
    /// Module path.
    pub module: String,
    /// Class name within the module.
    pub name: String,
}

impl ClassInfo {
    /// Creates a class identity.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// The class of the root object created by a fresh database.
    #[must_use]
    pub fn persistent_mapping() -> Self {
        Self::new("persistent.mapping", "PersistentMapping")
    }

    fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::text(self.module.as_str()),
            Value::text(self.name.as_str()),
        ])
    }

    fn from_value(value: &Value) -> CoreResult<Self> {
        match value.as_array() {
            Some([Value::Text(module), Value::Text(name)]) => Ok(Self::new(module, name)),
            _ => Err(CoreError::storage_system(
                "object record does not start with a [module, name] class section",
            )),
        }
    }
}

impl fmt::Display for ClassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.name)
    }
}

/// Serializes an object record.
#[must_use]
pub fn encode_record(class: &ClassInfo, state: &Value) -> Vec<u8> {
    let mut encoder = CanonicalEncoder::new();
    encoder.encode(&class.to_value());
    encoder.encode(state);
    encoder.into_bytes()
}

/// Splits a payload into its class and state.
pub fn decode_record(payload: &[u8]) -> CoreResult<(ClassInfo, Value)> {
    let mut decoder = CanonicalDecoder::new(payload);
    let class = ClassInfo::from_value(&decoder.decode()?)?;
    let state = decoder.decode()?;
    decoder.finish()?;
    Ok((class, state))
}

/// Reads only the class section of a payload.
pub fn decode_class(payload: &[u8]) -> CoreResult<ClassInfo> {
    let mut decoder = CanonicalDecoder::new(payload);
    ClassInfo::from_value(&decoder.decode()?)
}

/// Extracts the strong references of a payload without decoding its state.
pub fn references(payload: &[u8]) -> CoreResult<Vec<Oid>> {
    Ok(scan_references(payload)?.into_iter().map(Oid::new).collect())
}
