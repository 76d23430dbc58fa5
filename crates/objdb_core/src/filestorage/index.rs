//! In-memory object index and its on-disk sidecar.
//!
//! The index maps every OID to the offset of its newest record. It is always
//! derivable by scanning the log; the sidecar only saves that scan on the
//! next open.
//!
//! ## Sidecar format
//!
//! ```text
//! "FSIX" sha256(body):32 body
//! body := CBOR { version, pos, last_tid, max_oid, entries: [(oid, offset)] }
//! ```
//!
//! A sidecar whose checksum, version or position does not check out is
//! ignored and the index is rebuilt.

use super::files::write_atomic;
use crate::error::{CoreError, CoreResult};
use crate::types::{Oid, Tid};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

const SIDECAR_MAGIC: &[u8; 4] = b"FSIX";
const SIDECAR_VERSION: u32 = 1;
const CHECKSUM_LEN: usize = 32;

/// OID to newest-record offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsIndex {
    positions: BTreeMap<Oid, u64>,
}

impl FsIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the newest record for `oid`.
    #[must_use]
    pub fn get(&self, oid: Oid) -> Option<u64> {
        self.positions.get(&oid).copied()
    }

    /// Points `oid` at `pos`.
    pub fn insert(&mut self, oid: Oid, pos: u64) {
        self.positions.insert(oid, pos);
    }

    /// True if `oid` has a record.
    #[must_use]
    pub fn contains(&self, oid: Oid) -> bool {
        self.positions.contains_key(&oid)
    }

    /// Number of objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// True if no object is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Largest indexed OID.
    #[must_use]
    pub fn max_oid(&self) -> Option<Oid> {
        self.positions.keys().next_back().copied()
    }

    /// Entries in OID order.
    pub fn iter(&self) -> impl Iterator<Item = (Oid, u64)> + '_ {
        self.positions.iter().map(|(oid, pos)| (*oid, *pos))
    }
}

/// Index state as of a committed log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot {
    /// Offset just past the last transaction covered.
    pub pos: u64,
    /// TID of that transaction (zero for an empty log).
    pub last_tid: Tid,
    /// Highest OID handed out.
    pub max_oid: Oid,
    /// The index itself.
    pub index: FsIndex,
}

#[derive(Serialize, Deserialize)]
struct SidecarBody {
    version: u32,
    pos: u64,
    last_tid: Tid,
    max_oid: Oid,
    entries: Vec<(Oid, u64)>,
}

impl IndexSnapshot {
    /// Writes the sidecar atomically.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let body = SidecarBody {
            version: SIDECAR_VERSION,
            pos: self.pos,
            last_tid: self.last_tid,
            max_oid: self.max_oid,
            entries: self.index.iter().collect(),
        };
        let mut encoded = Vec::new();
        ciborium::into_writer(&body, &mut encoded)
            .map_err(|e| CoreError::storage(format!("failed to encode index sidecar: {e}")))?;

        let mut data = Vec::with_capacity(SIDECAR_MAGIC.len() + CHECKSUM_LEN + encoded.len());
        data.extend_from_slice(SIDECAR_MAGIC);
        data.extend_from_slice(&Sha256::digest(&encoded));
        data.extend_from_slice(&encoded);
        write_atomic(path, &data)
    }

    /// Reads a sidecar. `Ok(None)` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but is damaged or from another version.
    pub fn load(path: &Path) -> CoreResult<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let header_len = SIDECAR_MAGIC.len() + CHECKSUM_LEN;
        if data.len() < header_len || &data[..SIDECAR_MAGIC.len()] != SIDECAR_MAGIC {
            return Err(CoreError::storage("index sidecar has no magic"));
        }
        let (checksum, encoded) = data[SIDECAR_MAGIC.len()..].split_at(CHECKSUM_LEN);
        if Sha256::digest(encoded).as_slice() != checksum {
            return Err(CoreError::storage("index sidecar checksum mismatch"));
        }
        let body: SidecarBody = ciborium::from_reader(encoded)
            .map_err(|e| CoreError::storage(format!("failed to decode index sidecar: {e}")))?;
        if body.version != SIDECAR_VERSION {
            return Err(CoreError::storage(format!(
                "index sidecar version {} is not supported",
                body.version
            )));
        }
        let mut index = FsIndex::new();
        for (oid, pos) in body.entries {
            index.insert(oid, pos);
        }
        Ok(Some(Self {
            pos: body.pos,
            last_tid: body.last_tid,
            max_oid: body.max_oid,
            index,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> IndexSnapshot {
        let mut index = FsIndex::new();
        index.insert(Oid::ROOT, 27);
        index.insert(Oid::from_u64(5), 400);
        IndexSnapshot {
            pos: 512,
            last_tid: Tid::from_u64(77),
            max_oid: Oid::from_u64(5),
            index,
        }
    }

    #[test]
    fn index_basics() {
        let mut index = FsIndex::new();
        assert!(index.is_empty());
        index.insert(Oid::from_u64(3), 10);
        index.insert(Oid::from_u64(1), 20);
        index.insert(Oid::from_u64(3), 30);
        assert_eq!(index.get(Oid::from_u64(3)), Some(30));
        assert_eq!(index.len(), 2);
        assert_eq!(index.max_oid(), Some(Oid::from_u64(3)));
        assert_eq!(
            index.iter().collect::<Vec<_>>(),
            vec![(Oid::from_u64(1), 20), (Oid::from_u64(3), 30)]
        );
    }

    #[test]
    fn sidecar_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Data.fs.index");
        let snapshot = sample();
        snapshot.save(&path).unwrap();
        assert_eq!(IndexSnapshot::load(&path).unwrap(), Some(snapshot));
    }

    #[test]
    fn missing_sidecar_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(IndexSnapshot::load(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn corrupted_sidecar_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Data.fs.index");
        sample().save(&path).unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();
        assert!(IndexSnapshot::load(&path).is_err());

        fs::write(&path, b"junk").unwrap();
        assert!(IndexSnapshot::load(&path).is_err());
    }
}
