// Copyright 2026 cellar Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The index snapshot of the block layout.
//!
//! The snapshot captures every live entry's bookkeeping and span tables up to a sequence
//! watermark. Recovery loads the snapshot and replays only block-file records with a higher
//! sequence; a clean shutdown leaves nothing to replay. The file is replaced atomically
//! (write-to-temp, fsync, rename), so a crash can never tear it: at worst the previous
//! snapshot stays in effect and the replay covers more records.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read as _, Write as _},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    engine::{block::serde::{Checksummer, Sequence, Span}, LayoutKind, Preamble, INDEX_FILE},
    entry::{EntryId, STREAM_COUNT},
    error::{Error, Result},
};

/// A persisted extent: `offset` in the entry's address space, span into a block file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct SnapshotSpan {
    pub offset: u64,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotEntry {
    pub id: EntryId,
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    pub stream_lens: [u64; STREAM_COUNT],
    pub last_used: u64,
    pub last_modified: u64,
    pub streams: Vec<Vec<SnapshotSpan>>,
    pub sparse: Vec<SnapshotSpan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    /// Records with a sequence at or below this are fully reflected in the snapshot.
    pub watermark: Sequence,
    /// Next sequential entry id, for the deterministic-id mode.
    pub next_id: u64,
    /// Block files retained at snapshot time.
    pub files: Vec<u32>,
    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            watermark: 0,
            next_id: 1,
            files: Vec::new(),
            entries: Vec::new(),
        }
    }
}

/// Load the snapshot of `dir`. `None` when no index file exists.
///
/// Any structural failure (bad preamble, wrong layout kind, checksum mismatch, undecodable
/// body) is [`Error::Corruption`].
pub(crate) fn load(dir: &Path) -> Result<Option<(Preamble, Snapshot)>> {
    let path = dir.join(INDEX_FILE);
    let mut data = Vec::new();
    match File::open(&path) {
        Ok(mut file) => {
            file.read_to_end(&mut data)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    if data.len() < Preamble::LEN + 8 {
        return Err(Error::corruption("index file truncated"));
    }
    let preamble = Preamble::read(&data[..Preamble::LEN])?;
    if preamble.kind != LayoutKind::Block {
        return Err(Error::corruption("index layout kind is not block"));
    }

    let body = &data[Preamble::LEN..data.len() - 8];
    let expected = u64::from_be_bytes(data[data.len() - 8..].try_into().unwrap());
    let checksum = Checksummer::checksum64(body);
    if checksum != expected {
        return Err(Error::corruption(format!(
            "index checksum mismatch, expected: {expected:#x}, got: {checksum:#x}"
        )));
    }

    let snapshot: Snapshot =
        bincode::deserialize(body).map_err(|e| Error::corruption(format!("index body undecodable: {e}")))?;
    Ok(Some((preamble, snapshot)))
}

/// Atomically replace the snapshot of `dir`.
pub(crate) fn store(dir: &Path, dirty: bool, snapshot: &Snapshot) -> Result<()> {
    let body = bincode::serialize(snapshot).map_err(Error::other)?;

    let mut data = Vec::with_capacity(Preamble::LEN + body.len() + 8);
    Preamble {
        kind: LayoutKind::Block,
        dirty,
    }
    .write(&mut data);
    data.extend_from_slice(&body);
    data.extend_from_slice(&Checksummer::checksum64(&body).to_be_bytes());

    let tmp = dir.join(format!("{INDEX_FILE}.tmp"));
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, dir.join(INDEX_FILE))?;
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());

        let snapshot = Snapshot {
            watermark: 17,
            next_id: 4,
            files: vec![1, 2],
            entries: vec![SnapshotEntry {
                id: 3,
                key: b"key".to_vec(),
                stream_lens: [5, 0, 0],
                last_used: 100,
                last_modified: 90,
                streams: vec![
                    vec![SnapshotSpan {
                        offset: 0,
                        span: Span {
                            file: 1,
                            pos: 64,
                            len: 5,
                        },
                    }],
                    vec![],
                    vec![],
                ],
                sparse: vec![],
            }],
        };
        store(dir.path(), true, &snapshot).unwrap();

        let (preamble, loaded) = load(dir.path()).unwrap().unwrap();
        assert!(preamble.dirty);
        assert_eq!(preamble.kind, LayoutKind::Block);
        assert_eq!(loaded.watermark, 17);
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].key, b"key".to_vec());
    }

    #[test]
    fn test_snapshot_detects_bit_flip() {
        let dir = tempfile::tempdir().unwrap();
        store(dir.path(), false, &Snapshot::empty()).unwrap();

        let path = dir.path().join(INDEX_FILE);
        let mut data = fs::read(&path).unwrap();
        let at = Preamble::LEN + 2;
        data[at] ^= 0xff;
        fs::write(&path, &data).unwrap();

        assert!(load(dir.path()).unwrap_err().is_corruption());
    }
}
