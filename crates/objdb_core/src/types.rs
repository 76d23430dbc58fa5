//! Object and transaction identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Object identifier.
///
/// Eight opaque bytes, ordered as a big-endian integer. OID 0 is the root
/// object. Identifiers are never reused within a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Oid([u8; 8]);

impl Oid {
    /// The root object.
    pub const ROOT: Oid = Oid([0; 8]);

    /// Creates an OID from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Creates an OID from an integer.
    #[must_use]
    pub const fn from_u64(n: u64) -> Self {
        Self(n.to_be_bytes())
    }

    /// Returns the OID as an integer.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Returns the raw bytes by value.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0
    }

    /// Returns the next OID.
    #[must_use]
    pub const fn next(self) -> Self {
        Self::from_u64(self.as_u64() + 1)
    }
}

impl From<[u8; 8]> for Oid {
    fn from(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.as_u64())
    }
}

/// Transaction identifier.
///
/// Encodes a UTC commit timestamp (see [`crate::timestamp`]). TIDs are
/// strictly increasing in commit order within a storage. The zero TID means
/// "no prior revision".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Tid([u8; 8]);

impl Tid {
    /// The zero TID.
    pub const ZERO: Tid = Tid([0; 8]);

    /// The largest TID.
    pub const MAX: Tid = Tid([0xff; 8]);

    /// Creates a TID from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Creates a TID from an integer.
    #[must_use]
    pub const fn from_u64(n: u64) -> Self {
        Self(n.to_be_bytes())
    }

    /// Returns the TID as an integer.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Returns the raw bytes by value.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0
    }

    /// True for the zero TID.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.as_u64() == 0
    }

    /// Returns the smallest TID greater than this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self::from_u64(self.as_u64().saturating_add(1))
    }

    /// Returns the largest TID smaller than this one.
    #[must_use]
    pub const fn prev(self) -> Self {
        Self::from_u64(self.as_u64().saturating_sub(1))
    }

    /// Returns `self` if it is greater than `floor`, otherwise `floor.next()`.
    #[must_use]
    pub fn later_than(self, floor: Tid) -> Self {
        if self > floor {
            self
        } else {
            floor.next()
        }
    }
}

impl From<[u8; 8]> for Tid {
    fn from(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.as_u64())
    }
}

/// Parses `0x`-prefixed hex or plain decimal.
fn parse_u64(s: &str) -> Result<u64, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

impl FromStr for Oid {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_u64(s).map(Self::from_u64)
    }
}

impl FromStr for Tid {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_u64(s).map(Self::from_u64)
    }
}
