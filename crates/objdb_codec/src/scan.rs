//! Streaming reference scanner.
//!
//! Walks raw payload bytes item by item and reports the oid of every strong
//! persistent reference, without building a [`crate::Value`] tree. The
//! scanner runs no user code and resolves no classes, so it is safe on
//! untrusted input: every length is bounds-checked and nesting is capped.

use crate::decoder::{check_count, CanonicalDecoder};
use crate::error::{CodecError, CodecResult};
use crate::reference::{oid_from_slice, PERSISTENT_REF_TAG};

/// Returns the oids referenced by a payload, in order of appearance.
///
/// The payload may hold several concatenated items (an object record is a
/// class section followed by a state section); all of them are scanned.
/// Duplicates are preserved.
///
/// # Errors
///
/// Fails on truncated or structurally invalid CBOR, and on a
/// persistent-reference tag whose content has no recognised shape.
///
/// # Example
///
/// ```
/// use objdb_codec::{scan_references, to_canonical_cbor, PersistentRef, Value};
///
/// let state = Value::Array(vec![PersistentRef::Bare([0, 0, 0, 0, 0, 0, 0, 3]).to_value()]);
/// let payload = to_canonical_cbor(&state);
/// assert_eq!(scan_references(&payload).unwrap(), vec![[0, 0, 0, 0, 0, 0, 0, 3]]);
/// ```
pub fn scan_references(payload: &[u8]) -> CodecResult<Vec<[u8; 8]>> {
    let mut scanner = ReferenceScanner::new(payload);
    let mut out = Vec::new();
    while !scanner.is_done() {
        scanner.scan_item(&mut out)?;
    }
    Ok(out)
}

/// Cursor over a payload that collects references as it skips items.
#[derive(Debug)]
pub struct ReferenceScanner<'a> {
    decoder: CanonicalDecoder<'a>,
}

impl<'a> ReferenceScanner<'a> {
    /// Creates a scanner positioned at the start of `payload`.
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            decoder: CanonicalDecoder::new(payload),
        }
    }

    /// True once every byte has been consumed.
    pub fn is_done(&self) -> bool {
        self.decoder.is_empty()
    }

    /// Skips one complete item, appending strong references found inside.
    ///
    /// # Errors
    ///
    /// See [`scan_references`].
    pub fn scan_item(&mut self, out: &mut Vec<[u8; 8]>) -> CodecResult<()> {
        self.walk(out, true)
    }

    fn walk(&mut self, out: &mut Vec<[u8; 8]>, collect: bool) -> CodecResult<()> {
        let head = self.decoder.read_head()?;
        match head.major {
            0 | 1 => Ok(()),
            2 | 3 => self.decoder.read_string(head.arg).map(|_| ()),
            4 => {
                let len = check_count(head.arg)?;
                self.nested(|s| (0..len).try_for_each(|_| s.walk(out, collect)))
            }
            5 => {
                let len = check_count(head.arg)?;
                self.nested(|s| (0..len * 2).try_for_each(|_| s.walk(out, collect)))
            }
            6 if head.arg == PERSISTENT_REF_TAG => self.nested(|s| s.reference(out, collect)),
            6 => self.nested(|s| s.walk(out, collect)),
            _ => self.skip_simple(head.info),
        }
    }

    fn nested(&mut self, f: impl FnOnce(&mut Self) -> CodecResult<()>) -> CodecResult<()> {
        self.decoder.enter()?;
        f(self)?;
        self.decoder.leave();
        Ok(())
    }

    /// Reads the content of a persistent-reference tag.
    fn reference(&mut self, out: &mut Vec<[u8; 8]>, collect: bool) -> CodecResult<()> {
        let head = self.decoder.read_head()?;
        match head.major {
            2 => {
                let oid = oid_from_slice(self.decoder.read_string(head.arg)?)?;
                if collect {
                    out.push(oid);
                }
                Ok(())
            }
            4 => {
                let len = check_count(head.arg)?;
                if len == 0 {
                    return Err(CodecError::malformed_reference("array without leading oid"));
                }
                let first = self.decoder.read_head()?;
                if first.major != 2 {
                    return Err(CodecError::malformed_reference("array without leading oid"));
                }
                let oid = oid_from_slice(self.decoder.read_string(first.arg)?)?;
                if len == 2 && self.at_class_pair() && collect {
                    out.push(oid);
                }
                // Class pairs and the tail of a weak reference hold no
                // strong references of their own.
                (1..len).try_for_each(|_| self.walk(out, false))
            }
            _ => Err(CodecError::malformed_reference(
                "expected byte string or array",
            )),
        }
    }

    /// Looks ahead for a `[module, name]` pair without consuming input.
    fn at_class_pair(&self) -> bool {
        let mut probe = self.decoder.clone();
        let text = |probe: &mut CanonicalDecoder<'a>| -> CodecResult<bool> {
            let head = probe.read_head()?;
            probe.read_string(head.arg)?;
            Ok(head.major == 3)
        };
        matches!(probe.read_head(), Ok(head) if head.major == 4 && head.arg == 2)
            && matches!(text(&mut probe), Ok(true))
            && matches!(text(&mut probe), Ok(true))
    }

    fn skip_simple(&mut self, info: u8) -> CodecResult<()> {
        let extra = match info {
            0..=23 => 0,
            24 => 1,
            25 => 2,
            26 => 4,
            27 => 8,
            _ => return Err(CodecError::invalid_structure("unexpected break or reserved value")),
        };
        self.decoder.read_bytes(extra).map(|_| ())
    }
}
