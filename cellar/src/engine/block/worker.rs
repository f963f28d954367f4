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

//! The block engine's single-writer worker.
//!
//! The worker owns the index, the id generator, and every block-file handle; submissions drain
//! strictly in order, so per-entry operations complete in issue order. File IO runs inline on
//! the backend's worker runtime.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    os::unix::fs::FileExt,
    path::PathBuf,
};

use bytes::Bytes;
use itertools::Itertools;

use super::{
    recover::{self, FileInfo},
    serde::{Checksummer, RecordHeader, RecordKind, Sequence, Span},
    snapshot::{self, Snapshot, SnapshotEntry, SnapshotSpan},
};
use crate::{
    clock,
    engine::{DirLock, IdGenerator, WorkerClient, WorkerEntry, WorkerOps},
    entry::{Entry, EntryId, EntryStat, SparseRead, STREAM_COUNT},
    error::{Error, Result},
    eviction::EvictionConfig,
    extent::{apply_stream_write, ExtentMap},
    index::{EntryMeta, Index, Slot},
};

/// Block engine configuration, assembled by the builder.
#[derive(Debug, Clone)]
pub(crate) struct BlockConfig {
    pub dir: PathBuf,
    pub max_size: u64,
    pub eviction: EvictionConfig,
    pub deterministic_ids: bool,
    /// Fsync block files before completing a mutation.
    pub flush: bool,
    /// Rotation threshold for block files.
    pub file_capacity: u64,
    pub evict_candidates: usize,
}

/// On-disk span tables of one entry.
#[derive(Debug, Default)]
pub(crate) struct BlockSlot {
    pub streams: [ExtentMap<Span>; STREAM_COUNT],
    pub sparse: ExtentMap<Span>,
}

impl BlockSlot {
    fn spans(&self) -> Vec<Span> {
        self.streams
            .iter()
            .flat_map(|map| map.iter().map(|(_, span)| *span))
            .chain(self.sparse.iter().map(|(_, span)| *span))
            .collect()
    }
}

#[derive(Debug)]
struct BlockFile {
    file: File,
    info: FileInfo,
}

pub(crate) struct WorkerState {
    config: BlockConfig,
    client: WorkerClient,
    _lock: DirLock,

    index: Index<BlockSlot>,
    files: BTreeMap<u32, BlockFile>,
    active: u32,
    sequence: Sequence,
    /// Highest sequence covered by the persisted snapshot.
    watermark: Sequence,
    ids: IdGenerator,
}

impl WorkerState {
    /// Open the directory: lock, recover, write a fresh snapshot, drop dead files.
    pub fn open(config: BlockConfig, client: WorkerClient) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let lock = DirLock::acquire(&config.dir)?;

        let mut state = match recover::rebuild(&config.dir)? {
            None => {
                // Fresh directory. Stray block files have no index covering them; drop them.
                for id in recover::list_block_files(&config.dir)? {
                    tracing::warn!(file = id, "removing stray block file from uninitialized directory");
                    let _ = fs::remove_file(recover::file_path(&config.dir, id));
                }
                Self {
                    index: Index::new(config.max_size, &config.eviction, config.evict_candidates),
                    files: BTreeMap::new(),
                    active: 0,
                    sequence: 0,
                    watermark: 0,
                    ids: IdGenerator::new(config.deterministic_ids),
                    client,
                    _lock: lock,
                    config,
                }
            }
            Some(rebuilt) => {
                let mut ids = IdGenerator::new(config.deterministic_ids);
                ids.resume(rebuilt.next_id.saturating_sub(1));

                let mut index = Index::new(config.max_size, &config.eviction, config.evict_candidates);
                // Re-seed the recency policy oldest-first so eviction order survives reopen.
                let entries = rebuilt
                    .entries
                    .into_iter()
                    .sorted_by_key(|(_, entry)| entry.last_used)
                    .collect_vec();
                for (id, entry) in entries {
                    let sparse_len = entry.sparse_len();
                    let mut meta = EntryMeta::new(entry.key);
                    meta.stream_lens = entry.stream_lens;
                    meta.sparse_len = sparse_len;
                    meta.last_used = entry.last_used;
                    meta.last_modified = entry.last_modified;
                    index.insert(id, Slot {
                        meta,
                        data: BlockSlot {
                            streams: entry.streams,
                            sparse: entry.sparse,
                        },
                    });
                }

                let mut files = BTreeMap::new();
                for (id, info) in rebuilt.files {
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(recover::file_path(&config.dir, id))?;
                    files.insert(id, BlockFile { file, info });
                }

                Self {
                    index,
                    files,
                    active: 0,
                    sequence: rebuilt.sequence,
                    watermark: rebuilt.watermark,
                    ids,
                    client,
                    _lock: lock,
                    config,
                }
            }
        };

        // Always append to a fresh file, snapshot the recovered state, and shed dead files.
        state.rotate()?;
        state.checkpoint(true)?;
        state.sweep();

        tracing::debug!(
            dir = %state.config.dir.display(),
            entries = state.index.entry_count(),
            size = state.index.current_size(),
            "block engine ready"
        );
        Ok(state)
    }

    /// Doom by id; idempotent for already doomed entries.
    fn doom_id(&mut self, id: EntryId) -> Result<()> {
        let Some(slot) = self.index.slot(id) else {
            return Err(Error::NotFound);
        };
        if slot.meta.doomed {
            return Ok(());
        }
        self.append(RecordKind::Doom, id, 0, false, 0, &[], &[])?;
        self.index.doom(id);
        if self.index.slot(id).is_some_and(|slot| slot.meta.handles == 0) {
            self.reclaim(id)?;
        }
        Ok(())
    }

    /// Doom without a tombstone record, for entries whose storage is already failing.
    fn doom_in_memory(&mut self, id: EntryId) {
        if self.index.doom(id) && self.index.slot(id).is_some_and(|slot| slot.meta.handles == 0) {
            if let Err(e) = self.reclaim(id) {
                tracing::warn!(id, "reclaim after in-memory doom failed: {e}");
            }
        }
    }
}

impl WorkerOps for WorkerState {
    fn open_key(&mut self, key: &Bytes) -> Result<Option<Entry>> {
        let Some(id) = self.index.lookup(key) else {
            return Ok(None);
        };
        self.index.acquire(id);
        self.index.touch(id);
        Ok(Some(WorkerEntry::entry(id, key.clone(), self.client.clone())))
    }

    fn open_id(&mut self, id: EntryId) -> Result<Option<Entry>> {
        let Some(slot) = self.index.slot(id) else {
            return Ok(None);
        };
        if slot.meta.doomed {
            return Ok(None);
        }
        let key = slot.meta.key.clone();
        self.index.acquire(id);
        self.index.touch(id);
        Ok(Some(WorkerEntry::entry(id, key, self.client.clone())))
    }

    fn create(&mut self, key: Bytes) -> Result<Entry> {
        if self.index.lookup(&key).is_some() {
            return Err(Error::AlreadyExists);
        }
        let mut id = self.ids.next();
        while self.index.contains(id) {
            id = self.ids.next();
        }
        self.append(RecordKind::Create, id, 0, false, 0, &key, &[])?;
        self.index.insert(id, Slot {
            meta: EntryMeta::new(key.clone()),
            data: BlockSlot::default(),
        });
        self.index.acquire(id);
        Ok(WorkerEntry::entry(id, key, self.client.clone()))
    }

    fn doom_key(&mut self, key: &Bytes) -> Result<()> {
        let Some(id) = self.index.lookup(key) else {
            return Err(Error::NotFound);
        };
        self.doom_id(id)
    }

    fn doom_range(&mut self, begin: u64, end: u64) -> Result<()> {
        let victims = self.index.doom_range(begin, end);
        for id in victims {
            if let Err(e) = self.append(RecordKind::Doom, id, 0, false, 0, &[], &[]) {
                tracing::warn!(id, "failed to persist doom tombstone: {e}");
            }
            if self.index.slot(id).is_some_and(|slot| slot.meta.handles == 0) {
                self.reclaim(id)?;
            }
        }
        Ok(())
    }

    fn release(&mut self, id: EntryId) {
        if self.index.release(id) {
            if let Err(e) = self.reclaim(id) {
                tracing::warn!(id, "reclaim on release failed: {e}");
            }
        } else if self.index.over_budget() {
            // A handle that blocked eviction is gone; give eviction another chance.
            if let Err(e) = self.maybe_evict() {
                tracing::warn!("eviction on release failed: {e}");
            }
        }
    }

    fn set_max_size(&mut self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Err(Error::config("max size must be positive"));
        }
        self.index.set_max_size(bytes);
        self.maybe_evict()
    }

    fn entry_read(&mut self, id: EntryId, stream: usize, offset: u64, len: usize) -> Result<Bytes> {
        let Some(slot) = self.index.slot(id) else {
            return Err(Error::NotFound);
        };
        let stream_len = slot.meta.stream_lens[stream];
        if offset >= stream_len || len == 0 {
            self.index.stamp_used(id);
            return Ok(Bytes::new());
        }
        let end = stream_len.min(offset + len as u64);
        let slices = slot.data.streams[stream].slices(offset, end - offset);

        let mut out = vec![0u8; (end - offset) as usize];
        for (at, span) in slices {
            let buf = &mut out[(at - offset) as usize..][..span.len as usize];
            if let Err(e) = self.read_span(&span, buf) {
                tracing::warn!(id, "stream read failed, dooming entry: {e}");
                self.doom_in_memory(id);
                return Err(e);
            }
        }
        self.index.stamp_used(id);
        Ok(out.into())
    }

    fn entry_write(&mut self, id: EntryId, stream: usize, offset: u64, buf: Bytes, truncate: bool) -> Result<()> {
        if !self.index.contains(id) {
            return Err(Error::NotFound);
        }
        let span = match self.append(RecordKind::Write, id, stream as u8, truncate, offset, &[], &buf) {
            Ok(span) => span,
            Err(e) => {
                tracing::warn!(id, "stream write failed, dooming entry: {e}");
                self.doom_in_memory(id);
                return Err(e);
            }
        };

        let time = clock::now_nanos();
        let slot = self.index.slot_mut(id).unwrap();
        let old_bytes = slot.meta.bytes();
        let displaced = apply_stream_write(
            &mut slot.data.streams,
            &mut slot.meta.stream_lens,
            stream,
            offset,
            span,
            truncate,
        );
        slot.meta.last_used = time;
        slot.meta.last_modified = time;
        self.index.resize(id, old_bytes);

        self.live_add(span);
        for freed in displaced {
            self.live_sub(freed);
        }
        self.reclaim_dead_files()?;
        self.maybe_evict()
    }

    fn entry_read_sparse(&mut self, id: EntryId, offset: u64, len: usize) -> Result<SparseRead> {
        let Some(slot) = self.index.slot(id) else {
            return Err(Error::NotFound);
        };
        let slices = slot.data.sparse.slices(offset, len as u64);
        let ranges = slot.data.sparse.ranges(offset, len as u64);

        let mut out = vec![0u8; len];
        for (at, span) in slices {
            let buf = &mut out[(at - offset) as usize..][..span.len as usize];
            if let Err(e) = self.read_span(&span, buf) {
                tracing::warn!(id, "sparse read failed, dooming entry: {e}");
                self.doom_in_memory(id);
                return Err(e);
            }
        }
        self.index.stamp_used(id);
        Ok(SparseRead {
            buf: out.into(),
            ranges,
        })
    }

    fn entry_write_sparse(&mut self, id: EntryId, offset: u64, buf: Bytes) -> Result<()> {
        if !self.index.contains(id) {
            return Err(Error::NotFound);
        }
        let span = match self.append(RecordKind::WriteSparse, id, 0, false, offset, &[], &buf) {
            Ok(span) => span,
            Err(e) => {
                tracing::warn!(id, "sparse write failed, dooming entry: {e}");
                self.doom_in_memory(id);
                return Err(e);
            }
        };

        let time = clock::now_nanos();
        let slot = self.index.slot_mut(id).unwrap();
        let old_bytes = slot.meta.bytes();
        let displaced = slot.data.sparse.insert(offset, span);
        slot.meta.sparse_len = slot.data.sparse.total();
        slot.meta.last_used = time;
        slot.meta.last_modified = time;
        self.index.resize(id, old_bytes);

        self.live_add(span);
        for freed in displaced {
            self.live_sub(freed);
        }
        self.reclaim_dead_files()?;
        self.maybe_evict()
    }

    fn entry_stat(&mut self, id: EntryId) -> Result<EntryStat> {
        self.index.slot(id).map(|slot| slot.meta.stat()).ok_or(Error::NotFound)
    }

    fn entry_doom(&mut self, id: EntryId) -> Result<()> {
        self.doom_id(id)
    }

    fn list(&mut self) -> Result<Vec<EntryId>> {
        Ok(self.index.live_ids())
    }

    fn count(&mut self) -> Result<usize> {
        Ok(self.index.entry_count())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.index.current_size())
    }

    fn close(&mut self) -> Result<()> {
        self.checkpoint(false)?;
        self.sweep();
        tracing::debug!(dir = %self.config.dir.display(), "block engine closed");
        Ok(())
    }
}

impl WorkerState {
    fn read_span(&self, span: &Span, buf: &mut [u8]) -> Result<()> {
        let file = self
            .files
            .get(&span.file)
            .ok_or_else(|| Error::corruption(format!("span references missing block file {}", span.file)))?;
        file.file.read_exact_at(buf, span.pos)?;
        Ok(())
    }

    /// Append one record to the active block file, rotating at the capacity threshold.
    fn append(
        &mut self,
        kind: RecordKind,
        id: EntryId,
        stream: u8,
        truncate: bool,
        offset: u64,
        key: &[u8],
        payload: &[u8],
    ) -> Result<Span> {
        let header_len = RecordHeader::serialized_len() as u64;
        let total = header_len + key.len() as u64 + payload.len() as u64;

        let active_len = self.files.get(&self.active).map(|f| f.info.len).unwrap_or(0);
        if active_len > 0 && active_len + total > self.config.file_capacity {
            self.rotate()?;
        }

        self.sequence += 1;
        let header = RecordHeader {
            kind,
            sequence: self.sequence,
            id,
            stream,
            truncate,
            offset,
            time: clock::now_nanos(),
            key_len: key.len() as u32,
            payload_len: payload.len() as u32,
            checksum: Checksummer::checksum64_pair(key, payload),
        };

        let mut buf = Vec::with_capacity(total as usize);
        header.write(&mut buf);
        buf.extend_from_slice(key);
        buf.extend_from_slice(payload);

        let flush = self.config.flush;
        let file = self.files.get_mut(&self.active).unwrap();
        file.file.write_all_at(&buf, file.info.len)?;
        if flush {
            file.file.sync_data()?;
        }

        let span = Span {
            file: self.active,
            pos: file.info.len + header_len + key.len() as u64,
            len: payload.len() as u64,
        };
        file.info.len += total;
        file.info.max_seq = header.sequence;
        Ok(span)
    }

    fn rotate(&mut self) -> Result<()> {
        let next = self.files.keys().next_back().map(|id| id + 1).unwrap_or(1);
        let path = recover::file_path(&self.config.dir, next);
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        self.files.insert(next, BlockFile {
            file,
            info: FileInfo::default(),
        });
        self.active = next;
        Ok(())
    }

    fn live_add(&mut self, span: Span) {
        if span.len == 0 {
            return;
        }
        if let Some(file) = self.files.get_mut(&span.file) {
            file.info.live += span.len;
        }
    }

    fn live_sub(&mut self, span: Span) {
        if span.len == 0 {
            return;
        }
        if let Some(file) = self.files.get_mut(&span.file) {
            file.info.live = file.info.live.saturating_sub(span.len);
        }
    }

    fn maybe_evict(&mut self) -> Result<()> {
        if !self.index.over_budget() {
            return Ok(());
        }
        let victims = self.index.evict();
        for id in victims {
            if let Err(e) = self.append(RecordKind::Doom, id, 0, false, 0, &[], &[]) {
                tracing::warn!(id, "failed to persist eviction tombstone: {e}");
            }
            // Eviction never picks entries with live handles.
            self.reclaim(id)?;
        }
        Ok(())
    }

    /// Drop a doomed, unreferenced entry's storage.
    fn reclaim(&mut self, id: EntryId) -> Result<()> {
        if let Some(slot) = self.index.remove(id) {
            for span in slot.data.spans() {
                self.live_sub(span);
            }
            self.reclaim_dead_files()?;
        }
        Ok(())
    }

    /// Delete block files with no live bytes.
    ///
    /// A dead file whose records are not yet covered by the snapshot pins a checkpoint first:
    /// deleting it earlier could lose tombstones or writes that recovery still replays.
    fn reclaim_dead_files(&mut self) -> Result<()> {
        let pending = self
            .files
            .iter()
            .any(|(id, f)| *id != self.active && f.info.live == 0 && f.info.max_seq > self.watermark);
        if pending {
            self.checkpoint(true)?;
        }
        self.sweep();
        Ok(())
    }

    fn sweep(&mut self) {
        let dead = self
            .files
            .iter()
            .filter(|(id, f)| **id != self.active && f.info.live == 0 && f.info.max_seq <= self.watermark)
            .map(|(id, _)| *id)
            .collect_vec();
        for id in dead {
            self.files.remove(&id);
            let path = recover::file_path(&self.config.dir, id);
            match fs::remove_file(&path) {
                Ok(()) => tracing::trace!(file = id, "removed dead block file"),
                Err(e) => tracing::warn!(file = id, "failed to remove dead block file: {e}"),
            }
        }
    }

    /// Persist the full index state; afterwards recovery replays nothing below `sequence`.
    fn checkpoint(&mut self, dirty: bool) -> Result<()> {
        let entries = self
            .index
            .iter_slots()
            .filter(|(_, slot)| !slot.meta.doomed)
            .map(|(id, slot)| SnapshotEntry {
                id,
                key: slot.meta.key.to_vec(),
                stream_lens: slot.meta.stream_lens,
                last_used: slot.meta.last_used,
                last_modified: slot.meta.last_modified,
                streams: slot
                    .data
                    .streams
                    .iter()
                    .map(|map| {
                        map.iter()
                            .map(|(offset, span)| SnapshotSpan { offset, span: *span })
                            .collect()
                    })
                    .collect(),
                sparse: slot
                    .data
                    .sparse
                    .iter()
                    .map(|(offset, span)| SnapshotSpan { offset, span: *span })
                    .collect(),
            })
            .collect();

        let snapshot = Snapshot {
            watermark: self.sequence,
            next_id: self.ids.peek_next(),
            files: self.files.keys().copied().collect(),
            entries,
        };
        snapshot::store(&self.config.dir, dirty, &snapshot)?;
        self.watermark = self.sequence;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::engine::WorkerClient;

    fn config(dir: &Path) -> BlockConfig {
        BlockConfig {
            dir: dir.to_path_buf(),
            max_size: 1024 * 1024,
            eviction: EvictionConfig::default(),
            deterministic_ids: true,
            flush: true,
            // Small enough that a few writes force rotation.
            file_capacity: 256,
            evict_candidates: 8,
        }
    }

    #[test_log::test]
    fn test_worker_round_trip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let (client, _rx) = WorkerClient::unbounded();
            let mut worker = WorkerState::open(config(dir.path()), client).unwrap();
            let entry = worker.create(Bytes::from_static(b"k")).unwrap();
            let id = entry.id();
            worker.entry_write(id, 0, 0, Bytes::from_static(b"hello"), false).unwrap();
            worker.entry_write(id, 0, 0, Bytes::from_static(b"HE"), false).unwrap();
            assert_eq!(&worker.entry_read(id, 0, 0, 64).unwrap()[..], b"HEllo");
            worker.release(id);
            worker.close().unwrap();
        }

        {
            let (client, _rx) = WorkerClient::unbounded();
            let mut worker = WorkerState::open(config(dir.path()), client).unwrap();
            let entry = worker.open_key(&Bytes::from_static(b"k")).unwrap().unwrap();
            let id = entry.id();
            assert_eq!(&worker.entry_read(id, 0, 0, 64).unwrap()[..], b"HEllo");
            assert_eq!(worker.count().unwrap(), 1);
            worker.release(id);
            worker.close().unwrap();
        }
    }

    #[test_log::test]
    fn test_worker_recovers_without_close() {
        let dir = tempfile::tempdir().unwrap();

        {
            let (client, _rx) = WorkerClient::unbounded();
            let mut worker = WorkerState::open(config(dir.path()), client).unwrap();
            let entry = worker.create(Bytes::from_static(b"k")).unwrap();
            let id = entry.id();
            worker.entry_write(id, 0, 0, Bytes::from_static(b"persisted"), false).unwrap();
            worker.release(id);
            // No close: the snapshot stays at the post-open watermark and recovery replays.
        }

        let (client, _rx) = WorkerClient::unbounded();
        let mut worker = WorkerState::open(config(dir.path()), client).unwrap();
        let entry = worker.open_key(&Bytes::from_static(b"k")).unwrap().unwrap();
        let id = entry.id();
        assert_eq!(&worker.entry_read(id, 0, 0, 64).unwrap()[..], b"persisted");
        worker.release(id);
        worker.close().unwrap();
    }

    #[test_log::test]
    fn test_worker_rotates_and_reclaims_files() {
        let dir = tempfile::tempdir().unwrap();

        let (client, _rx) = WorkerClient::unbounded();
        let mut worker = WorkerState::open(config(dir.path()), client).unwrap();
        let mut ids = Vec::new();
        for i in 0..8u8 {
            let entry = worker.create(Bytes::from(vec![b'k', i])).unwrap();
            let id = entry.id();
            worker.entry_write(id, 0, 0, Bytes::from(vec![i; 100]), false).unwrap();
            worker.release(id);
            ids.push(id);
        }
        assert!(worker.files.len() > 1, "writes should have rotated block files");

        for id in ids {
            worker.entry_doom(id).unwrap();
        }
        // Everything is doomed and unreferenced; only the active file should remain.
        assert_eq!(worker.count().unwrap(), 0);
        assert_eq!(worker.files.len(), 1);
        assert_eq!(
            recover::list_block_files(dir.path()).unwrap().len(),
            worker.files.len()
        );
        worker.close().unwrap();
    }
}
