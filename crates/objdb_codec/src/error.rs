//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while decoding or scanning CBOR.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Float values are forbidden in canonical CBOR.
    #[error("float values are forbidden in canonical CBOR")]
    FloatForbidden,

    /// Indefinite-length items are forbidden.
    #[error("indefinite-length items are forbidden")]
    IndefiniteLengthForbidden,

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Unexpected end of input.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Invalid CBOR structure.
    #[error("invalid CBOR structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// Unsupported CBOR type.
    #[error("unsupported CBOR type: {type_name}")]
    UnsupportedType {
        /// Name of the unsupported type.
        type_name: String,
    },

    /// A length or count prefix exceeds the decoder's allocation limit.
    #[error("declared size {claimed} exceeds limit {max_allowed}")]
    SizeLimitExceeded {
        /// The size claimed by the input.
        claimed: u64,
        /// The maximum the decoder accepts.
        max_allowed: u64,
    },

    /// Containers nest deeper than the decoder allows.
    #[error("nesting depth exceeds {max_depth}")]
    NestingTooDeep {
        /// The maximum nesting depth.
        max_depth: usize,
    },

    /// A persistent-reference tag wraps something that is not a reference.
    #[error("malformed persistent reference: {message}")]
    MalformedReference {
        /// Description of the problem.
        message: String,
    },

    /// Bytes remain after the expected number of items.
    #[error("{remaining} trailing bytes after payload")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        remaining: usize,
    },
}

impl CodecError {
    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Create an unsupported type error.
    pub fn unsupported_type(type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            type_name: type_name.into(),
        }
    }

    /// Create a malformed reference error.
    pub fn malformed_reference(message: impl Into<String>) -> Self {
        Self::MalformedReference {
            message: message.into(),
        }
    }
}
