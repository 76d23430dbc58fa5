//! Canonical CBOR decoder.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Maximum allowed element count for arrays and maps.
pub(crate) const MAX_CONTAINER_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Maximum allowed byte/string length.
pub(crate) const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

/// Maximum nesting of arrays, maps and tags.
pub(crate) const MAX_DEPTH: usize = 256;

/// Decode exactly one value from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid canonical CBOR, contain
/// forbidden constructs (floats, indefinite-length), or carry trailing bytes.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = CanonicalDecoder::new(bytes);
    let value = decoder.decode()?;
    decoder.finish()?;
    Ok(value)
}

/// A canonical CBOR decoder.
///
/// Validates shortest-form integers and sorted map keys, and rejects
/// forbidden constructs. Call [`CanonicalDecoder::decode`] repeatedly to
/// read concatenated items.
#[derive(Debug, Clone)]
pub struct CanonicalDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

/// The head of one CBOR item: major type plus its argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Head {
    pub major: u8,
    pub info: u8,
    pub arg: u64,
}

impl<'a> CanonicalDecoder<'a> {
    /// Create a new decoder for the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    /// Decode the next value.
    pub fn decode(&mut self) -> CodecResult<Value> {
        let head = self.read_head()?;
        match head.major {
            0 => i64::try_from(head.arg)
                .map(Value::Integer)
                .map_err(|_| CodecError::unsupported_type("unsigned integer above i64::MAX")),
            1 => i64::try_from(head.arg)
                .map(|n| Value::Integer(-1 - n))
                .map_err(|_| CodecError::unsupported_type("negative integer below i64::MIN")),
            2 => Ok(Value::Bytes(self.read_string(head.arg)?.to_vec())),
            3 => {
                let bytes = self.read_string(head.arg)?;
                let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::Text(text.to_string()))
            }
            4 => {
                let len = check_count(head.arg)?;
                self.enter()?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.decode()?);
                }
                self.leave();
                Ok(Value::Array(items))
            }
            5 => self.decode_map(head.arg),
            6 => {
                self.enter()?;
                let inner = self.decode()?;
                self.leave();
                Ok(Value::Tag(head.arg, Box::new(inner)))
            }
            _ => decode_simple(head.info),
        }
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Get remaining bytes.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    /// Current byte offset into the input.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Fails unless every input byte has been consumed.
    pub fn finish(&self) -> CodecResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes {
                remaining: self.data.len() - self.pos,
            })
        }
    }

    pub(crate) fn enter(&mut self) -> CodecResult<()> {
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::NestingTooDeep {
                max_depth: MAX_DEPTH,
            });
        }
        self.depth += 1;
        Ok(())
    }

    pub(crate) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let bytes = self.data.get(self.pos..end).ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(bytes)
    }

    /// Reads an item head, rejecting non-shortest and indefinite forms.
    ///
    /// Simple values and floats (major 7) are returned with `arg` zero so the
    /// caller decides how to treat them.
    pub(crate) fn read_head(&mut self) -> CodecResult<Head> {
        let initial = self.read_byte()?;
        let major = initial >> 5;
        let info = initial & 0x1f;
        if major == 7 {
            return Ok(Head { major, info, arg: 0 });
        }
        let arg = match info {
            0..=23 => u64::from(info),
            24 => {
                let v = u64::from(self.read_byte()?);
                canonical(v, 24)?
            }
            25 => {
                let b = self.read_bytes(2)?;
                canonical(u64::from(u16::from_be_bytes([b[0], b[1]])), 0x100)?
            }
            26 => {
                let b = self.read_bytes(4)?;
                canonical(u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])), 0x1_0000)?
            }
            27 => {
                let b = self.read_bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                canonical(u64::from_be_bytes(raw), 0x1_0000_0000)?
            }
            31 => return Err(CodecError::IndefiniteLengthForbidden),
            _ => return Err(CodecError::invalid_structure("reserved additional info")),
        };
        Ok(Head { major, info, arg })
    }

    pub(crate) fn read_string(&mut self, len: u64) -> CodecResult<&'a [u8]> {
        if len > MAX_BYTES_LENGTH {
            return Err(CodecError::SizeLimitExceeded {
                claimed: len,
                max_allowed: MAX_BYTES_LENGTH,
            });
        }
        self.read_bytes(len as usize)
    }

    fn decode_map(&mut self, count: u64) -> CodecResult<Value> {
        let len = check_count(count)?;
        self.enter()?;
        let mut pairs = Vec::with_capacity(len.min(1024));
        let mut prev_key: Option<&'a [u8]> = None;
        for _ in 0..len {
            let key_start = self.pos;
            let key = self.decode()?;
            let data = self.data;
            let key_bytes = &data[key_start..self.pos];
            if let Some(prev) = prev_key {
                let order = prev.len().cmp(&key_bytes.len()).then_with(|| prev.cmp(key_bytes));
                if order != std::cmp::Ordering::Less {
                    return Err(CodecError::invalid_structure(
                        "non-canonical: map keys not in sorted order",
                    ));
                }
            }
            prev_key = Some(key_bytes);
            let value = self.decode()?;
            pairs.push((key, value));
        }
        self.leave();
        Ok(Value::Map(pairs))
    }
}

pub(crate) fn check_count(count: u64) -> CodecResult<usize> {
    if count > MAX_CONTAINER_ELEMENTS {
        return Err(CodecError::SizeLimitExceeded {
            claimed: count,
            max_allowed: MAX_CONTAINER_ELEMENTS,
        });
    }
    Ok(count as usize)
}

fn canonical(value: u64, minimum: u64) -> CodecResult<u64> {
    if value < minimum {
        return Err(CodecError::invalid_structure(
            "non-canonical: value could be encoded in fewer bytes",
        ));
    }
    Ok(value)
}

fn decode_simple(info: u8) -> CodecResult<Value> {
    match info {
        20 => Ok(Value::Bool(false)),
        21 => Ok(Value::Bool(true)),
        22 | 23 => Ok(Value::Null),
        25..=27 => Err(CodecError::FloatForbidden),
        31 => Err(CodecError::invalid_structure("break without indefinite")),
        _ => Err(CodecError::unsupported_type(format!("simple value {info}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::to_canonical_cbor;

    #[test]
    fn decode_scalars() {
        assert_eq!(from_cbor(&[0xf6]).unwrap(), Value::Null);
        assert_eq!(from_cbor(&[0xf5]).unwrap(), Value::Bool(true));
        assert_eq!(from_cbor(&[0x17]).unwrap(), Value::Integer(23));
        assert_eq!(from_cbor(&[0x19, 0x01, 0x00]).unwrap(), Value::Integer(256));
        assert_eq!(from_cbor(&[0x38, 99]).unwrap(), Value::Integer(-100));
        assert_eq!(from_cbor(&[0x43, 1, 2, 3]).unwrap(), Value::Bytes(vec![1, 2, 3]));
        assert_eq!(from_cbor(&[0x61, b'a']).unwrap(), Value::text("a"));
    }

    #[test]
    fn decode_extreme_integers() {
        let max = to_canonical_cbor(&Value::Integer(i64::MAX));
        let min = to_canonical_cbor(&Value::Integer(i64::MIN));
        assert_eq!(from_cbor(&max).unwrap(), Value::Integer(i64::MAX));
        assert_eq!(from_cbor(&min).unwrap(), Value::Integer(i64::MIN));
        assert!(matches!(
            from_cbor(&[0x1b, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(CodecError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn decode_tag_keeps_number() {
        let bytes = [0xd9, 0x6f, 0x69, 0x41, 0x07];
        assert_eq!(
            from_cbor(&bytes).unwrap(),
            Value::Tag(28521, Box::new(Value::Bytes(vec![7])))
        );
    }

    #[test]
    fn decode_concatenated_items() {
        let mut decoder = CanonicalDecoder::new(&[0x01, 0x82, 0x02, 0x03]);
        assert_eq!(decoder.decode().unwrap(), Value::Integer(1));
        assert_eq!(decoder.position(), 1);
        assert_eq!(
            decoder.decode().unwrap(),
            Value::Array(vec![Value::Integer(2), Value::Integer(3)])
        );
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn from_cbor_rejects_trailing_bytes() {
        assert_eq!(
            from_cbor(&[0x01, 0x02]),
            Err(CodecError::TrailingBytes { remaining: 1 })
        );
    }

    #[test]
    fn reject_float() {
        assert_eq!(from_cbor(&[0xf9, 0x00, 0x00]), Err(CodecError::FloatForbidden));
        assert_eq!(
            from_cbor(&[0xfb, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(CodecError::FloatForbidden)
        );
    }

    #[test]
    fn reject_indefinite_length() {
        assert_eq!(
            from_cbor(&[0x5f, 0x41, b'a', 0xff]),
            Err(CodecError::IndefiniteLengthForbidden)
        );
        assert_eq!(
            from_cbor(&[0x9f, 0x01, 0xff]),
            Err(CodecError::IndefiniteLengthForbidden)
        );
    }

    #[test]
    fn reject_non_shortest_encoding() {
        assert!(matches!(
            from_cbor(&[0x18, 23]),
            Err(CodecError::InvalidStructure { .. })
        ));
        assert!(matches!(
            from_cbor(&[0x19, 0x00, 0xff]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_unsorted_map_keys() {
        assert!(matches!(
            from_cbor(&[0xa2, 0x61, b'b', 0x01, 0x61, b'a', 0x02]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_excessive_nesting() {
        let mut bytes = vec![0x81; MAX_DEPTH + 1];
        bytes.push(0x00);
        assert_eq!(
            from_cbor(&bytes),
            Err(CodecError::NestingTooDeep {
                max_depth: MAX_DEPTH
            })
        );
    }

    #[test]
    fn reject_oversized_claims() {
        assert!(matches!(
            from_cbor(&[0x9b, 0x7f, 0, 0, 0, 0, 0, 0, 0]),
            Err(CodecError::SizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn unexpected_eof() {
        assert_eq!(from_cbor(&[]), Err(CodecError::UnexpectedEof));
        assert_eq!(from_cbor(&[0x19, 0x01]), Err(CodecError::UnexpectedEof));
        assert_eq!(from_cbor(&[0x45, 1, 2]), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn invalid_utf8_rejected() {
        assert_eq!(from_cbor(&[0x62, 0xff, 0xfe]), Err(CodecError::InvalidUtf8));
    }
}
