//! Canonical CBOR encoder.

use crate::value::Value;

/// Encode a value to canonical CBOR bytes.
///
/// Output follows RFC 8949 §4.2.1 deterministic encoding:
/// - Map keys are sorted by their encoded form (length-first, then bytewise)
/// - Integers and lengths use the shortest possible encoding
/// - No indefinite-length items
///
/// Identical values therefore always produce identical bytes, which is what
/// lets the file storage compare payloads byte-for-byte.
pub fn to_canonical_cbor(value: &Value) -> Vec<u8> {
    let mut encoder = CanonicalEncoder::new();
    encoder.encode(value);
    encoder.into_bytes()
}

/// A canonical CBOR encoder.
///
/// Several items may be written back to back; object payloads are two
/// concatenated items (class section, then state section).
#[derive(Debug, Default)]
pub struct CanonicalEncoder {
    buffer: Vec<u8>,
}

impl CanonicalEncoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new encoder with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Append one encoded value.
    pub fn encode(&mut self, value: &Value) {
        match value {
            Value::Null => self.buffer.push(0xf6),
            Value::Bool(false) => self.buffer.push(0xf4),
            Value::Bool(true) => self.buffer.push(0xf5),
            Value::Integer(n) => self.encode_integer(*n),
            Value::Bytes(b) => {
                self.write_head(2, b.len() as u64);
                self.buffer.extend_from_slice(b);
            }
            Value::Text(s) => {
                self.write_head(3, s.len() as u64);
                self.buffer.extend_from_slice(s.as_bytes());
            }
            Value::Array(items) => {
                self.write_head(4, items.len() as u64);
                for item in items {
                    self.encode(item);
                }
            }
            Value::Map(pairs) => self.encode_map(pairs),
            Value::Tag(tag, inner) => {
                self.write_head(6, *tag);
                self.encode(inner);
            }
        }
    }

    /// Consume this encoder and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get a reference to the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    #[allow(clippy::cast_sign_loss)]
    fn encode_integer(&mut self, n: i64) {
        if n >= 0 {
            self.write_head(0, n as u64);
        } else {
            // -1 - n never overflows for negative n.
            self.write_head(1, (-1 - n) as u64);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_head(&mut self, major_type: u8, arg: u64) {
        let mt = major_type << 5;
        if arg < 24 {
            self.buffer.push(mt | arg as u8);
        } else if arg <= u64::from(u8::MAX) {
            self.buffer.push(mt | 24);
            self.buffer.push(arg as u8);
        } else if arg <= u64::from(u16::MAX) {
            self.buffer.push(mt | 25);
            self.buffer.extend_from_slice(&(arg as u16).to_be_bytes());
        } else if arg <= u64::from(u32::MAX) {
            self.buffer.push(mt | 26);
            self.buffer.extend_from_slice(&(arg as u32).to_be_bytes());
        } else {
            self.buffer.push(mt | 27);
            self.buffer.extend_from_slice(&arg.to_be_bytes());
        }
    }

    fn encode_map(&mut self, pairs: &[(Value, Value)]) {
        let mut encoded: Vec<(Vec<u8>, &Value)> = pairs
            .iter()
            .map(|(k, v)| (to_canonical_cbor(k), v))
            .collect();
        encoded.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));

        self.write_head(5, pairs.len() as u64);
        for (key, value) in encoded {
            self.buffer.extend_from_slice(&key);
            self.encode(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_simple_values() {
        assert_eq!(to_canonical_cbor(&Value::Null), [0xf6]);
        assert_eq!(to_canonical_cbor(&Value::Bool(false)), [0xf4]);
        assert_eq!(to_canonical_cbor(&Value::Bool(true)), [0xf5]);
    }

    #[test]
    fn encode_integers_shortest_form() {
        assert_eq!(to_canonical_cbor(&Value::Integer(23)), [0x17]);
        assert_eq!(to_canonical_cbor(&Value::Integer(24)), [0x18, 24]);
        assert_eq!(to_canonical_cbor(&Value::Integer(256)), [0x19, 0x01, 0x00]);
        assert_eq!(
            to_canonical_cbor(&Value::Integer(65536)),
            [0x1a, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            to_canonical_cbor(&Value::Integer(i64::MAX)),
            [0x1b, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn encode_negative_integers() {
        assert_eq!(to_canonical_cbor(&Value::Integer(-1)), [0x20]);
        assert_eq!(to_canonical_cbor(&Value::Integer(-25)), [0x38, 24]);
        assert_eq!(
            to_canonical_cbor(&Value::Integer(i64::MIN)),
            [0x3b, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn encode_strings() {
        assert_eq!(to_canonical_cbor(&Value::Bytes(vec![1, 2, 3])), [0x43, 1, 2, 3]);
        assert_eq!(to_canonical_cbor(&Value::text("a")), [0x61, b'a']);
    }

    #[test]
    fn encode_map_sorted_by_encoded_key() {
        let map = Value::Map(vec![
            (Value::text("bb"), Value::Integer(2)),
            (Value::text("a"), Value::Integer(1)),
            (Value::Integer(1), Value::Integer(0)),
        ]);
        assert_eq!(
            to_canonical_cbor(&map),
            [0xa3, 0x01, 0x00, 0x61, b'a', 0x01, 0x62, b'b', b'b', 0x02]
        );
    }

    #[test]
    fn encode_tag() {
        let tagged = Value::Tag(28521, Box::new(Value::Bytes(vec![0; 8])));
        let bytes = to_canonical_cbor(&tagged);
        assert_eq!(&bytes[..4], &[0xd9, 0x6f, 0x69, 0x48]);
        assert_eq!(bytes.len(), 4 + 8);
    }

    #[test]
    fn concatenated_items() {
        let mut encoder = CanonicalEncoder::with_capacity(8);
        encoder.encode(&Value::Integer(1));
        encoder.encode(&Value::Null);
        assert_eq!(encoder.as_bytes(), [0x01, 0xf6]);
    }
}
