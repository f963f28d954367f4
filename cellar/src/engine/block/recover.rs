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

//! Read-only rebuild of a block-layout directory.
//!
//! Loads the index snapshot, scans every block file, and replays records above the snapshot
//! watermark in sequence order. A record that fails framing or checksum validation is a torn
//! tail: everything from it to the end of that file is treated as never written (fully rolled
//! back). Used by both engine init and the standalone integrity checker; never writes.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use hashbrown::HashMap;

use super::serde::{Checksummer, RecordHeader, RecordKind, Sequence, Span};
use crate::{
    entry::{EntryId, STREAM_COUNT},
    error::{Error, Result},
    extent::{apply_stream_write, ExtentMap},
};

const BLOCK_FILE_PREFIX: &str = "data_";

pub(crate) fn file_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{BLOCK_FILE_PREFIX}{id:08x}"))
}

/// Ids of all block files in `dir`, ascending.
pub(crate) fn list_block_files(dir: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for dent in fs::read_dir(dir)? {
        let dent = dent?;
        let name = dent.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(hex) = name.strip_prefix(BLOCK_FILE_PREFIX) {
            if let Ok(id) = u32::from_str_radix(hex, 16) {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Physical accounting of one block file.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FileInfo {
    pub len: u64,
    /// Bytes referenced by live span tables.
    pub live: u64,
    /// Highest record sequence the file holds.
    pub max_seq: Sequence,
}

#[derive(Debug)]
pub(crate) struct ScannedRecord {
    pub header: RecordHeader,
    /// Key bytes; empty except for create records.
    pub key: Bytes,
    /// Where the record payload lives.
    pub span: Span,
}

/// Rebuilt logical state of one entry.
#[derive(Debug)]
pub(crate) struct RebuiltEntry {
    pub key: Bytes,
    pub stream_lens: [u64; STREAM_COUNT],
    pub last_used: u64,
    pub last_modified: u64,
    pub streams: [ExtentMap<Span>; STREAM_COUNT],
    pub sparse: ExtentMap<Span>,
}

impl RebuiltEntry {
    fn new(key: Bytes, time: u64) -> Self {
        Self {
            key,
            stream_lens: [0; STREAM_COUNT],
            last_used: time,
            last_modified: time,
            streams: Default::default(),
            sparse: ExtentMap::new(),
        }
    }

    pub fn sparse_len(&self) -> u64 {
        self.sparse.total()
    }

    pub fn bytes(&self) -> u64 {
        self.stream_lens.iter().sum::<u64>() + self.sparse_len()
    }

    pub fn spans(&self) -> impl Iterator<Item = Span> + '_ {
        self.streams
            .iter()
            .flat_map(|map| map.iter().map(|(_, span)| *span))
            .chain(self.sparse.iter().map(|(_, span)| *span))
    }
}

/// The rebuilt state of a block-layout directory.
#[derive(Debug)]
pub(crate) struct Rebuilt {
    /// Dirty flag of the loaded snapshot: `true` means the previous instance did not close
    /// cleanly and records were (potentially) replayed.
    pub dirty: bool,
    pub watermark: Sequence,
    /// Highest sequence observed anywhere.
    pub sequence: Sequence,
    pub next_id: u64,
    pub entries: HashMap<EntryId, RebuiltEntry>,
    pub files: BTreeMap<u32, FileInfo>,
    /// Records replayed above the watermark.
    pub replayed: usize,
    /// Files whose tail was discarded as torn.
    pub torn_files: usize,
}

/// Scan one block file.
///
/// Returns the parsed records, the validated length (everything beyond it failed framing or
/// checksum validation and is treated as never written), and whether such a torn tail was
/// discarded.
pub(crate) fn scan_file(dir: &Path, id: u32) -> Result<(Vec<ScannedRecord>, u64, bool)> {
    let path = file_path(dir, id);
    let file = File::open(&path)?;
    let len = file.metadata()?.len();
    let header_len = RecordHeader::serialized_len() as u64;

    let mut records = Vec::new();
    let mut pos = 0u64;
    let mut torn = false;

    while pos < len {
        if pos + header_len > len {
            torn = true;
            break;
        }
        let mut head = vec![0u8; header_len as usize];
        file.read_exact_at(&mut head, pos)?;
        let header = match RecordHeader::read(&head[..]) {
            Ok(header) => header,
            Err(_) => {
                torn = true;
                break;
            }
        };

        let body_len = header.key_len as u64 + header.payload_len as u64;
        if pos + header_len + body_len > len {
            torn = true;
            break;
        }
        let mut body = vec![0u8; body_len as usize];
        file.read_exact_at(&mut body, pos + header_len)?;
        if Checksummer::checksum64(&body) != header.checksum {
            torn = true;
            break;
        }

        let key = Bytes::copy_from_slice(&body[..header.key_len as usize]);
        let span = Span {
            file: id,
            pos: pos + header_len + header.key_len as u64,
            len: header.payload_len as u64,
        };
        pos += header_len + body_len;
        records.push(ScannedRecord { header, key, span });
    }

    if torn {
        tracing::warn!(
            file = %path.display(),
            pos,
            "discarding torn tail of block file"
        );
    }
    Ok((records, pos, torn))
}

fn live_sub(files: &mut BTreeMap<u32, FileInfo>, span: Span) {
    let info = files.get_mut(&span.file).unwrap();
    info.live = info.live.saturating_sub(span.len);
}

/// Rebuild the logical state of `dir`. `None` when no index file exists (fresh directory).
pub(crate) fn rebuild(dir: &Path) -> Result<Option<Rebuilt>> {
    let Some((preamble, snapshot)) = super::snapshot::load(dir)? else {
        return Ok(None);
    };

    // Scan every block file first. The validated length bounds what any span may reference;
    // everything beyond it failed validation and counts as never written.
    let mut files: BTreeMap<u32, FileInfo> = BTreeMap::new();
    let mut replay: Vec<ScannedRecord> = Vec::new();
    let mut sequence = snapshot.watermark;
    let mut torn_files = 0;
    for id in list_block_files(dir)? {
        let (records, validated_len, torn) = scan_file(dir, id)?;
        let mut info = FileInfo {
            len: validated_len,
            live: 0,
            max_seq: 0,
        };
        if torn {
            torn_files += 1;
        }
        for record in records {
            info.max_seq = info.max_seq.max(record.header.sequence);
            sequence = sequence.max(record.header.sequence);
            if record.header.sequence > snapshot.watermark {
                replay.push(record);
            }
        }
        files.insert(id, info);
    }

    // Seed entries from the snapshot, validating every span against the validated file ranges.
    let mut entries: HashMap<EntryId, RebuiltEntry> = HashMap::new();
    let mut next_id = snapshot.next_id;
    for se in &snapshot.entries {
        let mut entry = RebuiltEntry::new(Bytes::copy_from_slice(&se.key), se.last_modified);
        entry.stream_lens = se.stream_lens;
        entry.last_used = se.last_used;
        entry.last_modified = se.last_modified;
        for (stream, spans) in se.streams.iter().enumerate() {
            if stream >= STREAM_COUNT {
                return Err(Error::corruption("snapshot entry has too many streams"));
            }
            for ss in spans {
                entry.streams[stream].insert(ss.offset, ss.span);
            }
        }
        for ss in &se.sparse {
            entry.sparse.insert(ss.offset, ss.span);
        }

        for span in entry.spans() {
            let Some(info) = files.get_mut(&span.file) else {
                return Err(Error::corruption(format!(
                    "entry {} references missing block file {}",
                    se.id, span.file
                )));
            };
            if span.pos + span.len > info.len {
                return Err(Error::corruption(format!(
                    "entry {} span exceeds the validated bounds of block file {}",
                    se.id, span.file
                )));
            }
            info.live += span.len;
        }

        next_id = next_id.max(se.id + 1);
        if entries.insert(se.id, entry).is_some() {
            return Err(Error::corruption(format!("duplicate entry id {} in snapshot", se.id)));
        }
    }

    // Replay records above the watermark in sequence order.
    replay.sort_by_key(|record| record.header.sequence);
    let replayed = replay.len();
    for record in replay {
        let header = record.header;
        match header.kind {
            RecordKind::Create => {
                next_id = next_id.max(header.id + 1);
                entries.insert(header.id, RebuiltEntry::new(record.key, header.time));
            }
            RecordKind::Write => {
                let Some(entry) = entries.get_mut(&header.id) else {
                    // A write that landed after the entry's doom; its payload is dead.
                    continue;
                };
                if header.stream as usize >= STREAM_COUNT {
                    return Err(Error::corruption("record stream index out of range"));
                }
                let displaced = apply_stream_write(
                    &mut entry.streams,
                    &mut entry.stream_lens,
                    header.stream as usize,
                    header.offset,
                    record.span,
                    header.truncate,
                );
                entry.last_used = header.time;
                entry.last_modified = header.time;
                files.get_mut(&record.span.file).unwrap().live += record.span.len;
                for span in displaced {
                    live_sub(&mut files, span);
                }
            }
            RecordKind::WriteSparse => {
                let Some(entry) = entries.get_mut(&header.id) else {
                    continue;
                };
                let displaced = entry.sparse.insert(header.offset, record.span);
                entry.last_used = header.time;
                entry.last_modified = header.time;
                files.get_mut(&record.span.file).unwrap().live += record.span.len;
                for span in displaced {
                    live_sub(&mut files, span);
                }
            }
            RecordKind::Doom => {
                if let Some(entry) = entries.remove(&header.id) {
                    for span in entry.spans() {
                        live_sub(&mut files, span);
                    }
                }
            }
        }
    }

    if preamble.dirty {
        tracing::debug!(
            replayed,
            entries = entries.len(),
            "recovered block cache from unclean shutdown"
        );
    }

    Ok(Some(Rebuilt {
        dirty: preamble.dirty,
        watermark: snapshot.watermark,
        sequence,
        next_id,
        entries,
        files,
        replayed,
        torn_files,
    }))
}
