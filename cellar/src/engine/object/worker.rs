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

//! The object engine's single-writer worker.
//!
//! Every mutation rewrites the affected entry file via a temp file and an atomic rename, so an
//! entry file is always either the complete previous or the complete next version. A doom
//! renames the file into the trash namespace before completing; the trash file is unlinked once
//! the last handle drops, and stray trash is swept at init.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read as _, Write as _},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    clock,
    engine::{
        block::serde::Checksummer, DirLock, IdGenerator, LayoutKind, Preamble, WorkerClient, WorkerEntry, WorkerOps,
        INDEX_FILE,
    },
    entry::{Entry, EntryId, EntryStat, SparseRead, STREAM_COUNT},
    error::{Error, Result},
    eviction::EvictionConfig,
    extent::{apply_stream_write, ExtentMap},
    index::{EntryMeta, Index, Slot},
};

const OBJECT_MAGIC: u32 = 0xCE11_0B1E;
const OBJECT_VERSION: u32 = 1;

pub(crate) const ENTRY_PREFIX: &str = "e_";
pub(crate) const TRASH_PREFIX: &str = "t_";

/// Object engine configuration, assembled by the builder.
#[derive(Debug, Clone)]
pub(crate) struct ObjectConfig {
    pub dir: PathBuf,
    pub max_size: u64,
    pub eviction: EvictionConfig,
    pub deterministic_ids: bool,
    /// Fsync entry files before completing a mutation.
    pub flush: bool,
    pub evict_candidates: usize,
}

fn entry_path(dir: &Path, id: EntryId) -> PathBuf {
    dir.join(format!("{ENTRY_PREFIX}{id:016x}"))
}

fn trash_path(dir: &Path, id: EntryId) -> PathBuf {
    dir.join(format!("{TRASH_PREFIX}{id:016x}"))
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectExtent {
    offset: u64,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

/// The full serialized state of one entry.
#[derive(Debug, Serialize, Deserialize)]
struct ObjectRecord {
    id: EntryId,
    #[serde(with = "serde_bytes")]
    key: Vec<u8>,
    stream_lens: [u64; STREAM_COUNT],
    last_used: u64,
    last_modified: u64,
    streams: Vec<Vec<ObjectExtent>>,
    sparse: Vec<ObjectExtent>,
}

/// In-memory content of an open entry.
#[derive(Debug, Default)]
struct Resident {
    streams: [ExtentMap<Bytes>; STREAM_COUNT],
    sparse: ExtentMap<Bytes>,
}

impl Resident {
    fn from_record(record: &ObjectRecord) -> Self {
        let mut resident = Self::default();
        for (stream, extents) in record.streams.iter().enumerate().take(STREAM_COUNT) {
            for extent in extents {
                resident.streams[stream].insert(extent.offset, Bytes::copy_from_slice(&extent.data));
            }
        }
        for extent in &record.sparse {
            resident.sparse.insert(extent.offset, Bytes::copy_from_slice(&extent.data));
        }
        resident
    }
}

/// Per-entry payload: content is resident only while the entry is open.
#[derive(Debug, Default)]
pub(crate) struct ObjectSlot {
    resident: Option<Resident>,
}

pub(crate) struct ObjectWorker {
    config: ObjectConfig,
    client: WorkerClient,
    _lock: DirLock,

    index: Index<ObjectSlot>,
    ids: IdGenerator,
}

impl ObjectWorker {
    /// Open the directory: lock, sweep leftovers, scan entry files.
    pub fn open(config: ObjectConfig, client: WorkerClient) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let lock = DirLock::acquire(&config.dir)?;

        match Preamble::load(&config.dir)? {
            None => {}
            Some(preamble) if preamble.kind == LayoutKind::Object => {
                if preamble.dirty {
                    tracing::debug!(dir = %config.dir.display(), "object cache was not closed cleanly");
                }
            }
            Some(_) => return Err(Error::corruption("index layout kind is not object")),
        }

        let mut index = Index::new(config.max_size, &config.eviction, config.evict_candidates);
        let mut ids = IdGenerator::new(config.deterministic_ids);
        let mut highest = 0u64;

        for dent in fs::read_dir(&config.dir)? {
            let dent = dent?;
            let name = dent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(TRASH_PREFIX) || name.ends_with(".tmp") {
                tracing::debug!(file = name, "sweeping leftover object file");
                let _ = fs::remove_file(dent.path());
                continue;
            }
            let Some(hex) = name.strip_prefix(ENTRY_PREFIX) else {
                continue;
            };
            let Ok(id) = u64::from_str_radix(hex, 16) else {
                continue;
            };

            let record = read_record(&dent.path())?;
            if record.id != id {
                return Err(Error::corruption(format!("entry file {name} holds record for id {}", record.id)));
            }
            let key = Bytes::copy_from_slice(&record.key);
            if index.lookup(&key).is_some() {
                return Err(Error::corruption("duplicate key across entry files"));
            }

            let mut meta = EntryMeta::new(key);
            meta.stream_lens = record.stream_lens;
            meta.sparse_len = record.sparse.iter().map(|extent| extent.data.len() as u64).sum();
            meta.last_used = record.last_used;
            meta.last_modified = record.last_modified;
            index.insert(id, Slot {
                meta,
                data: ObjectSlot::default(),
            });
            highest = highest.max(id);
        }
        ids.resume(highest);

        store_preamble(&config.dir, true)?;

        tracing::debug!(
            dir = %config.dir.display(),
            entries = index.entry_count(),
            size = index.current_size(),
            "object engine ready"
        );
        Ok(Self {
            config,
            client,
            _lock: lock,
            index,
            ids,
        })
    }

    fn ensure_resident(&mut self, id: EntryId) -> Result<()> {
        {
            let Some(slot) = self.index.slot(id) else {
                return Err(Error::NotFound);
            };
            if slot.data.resident.is_some() {
                return Ok(());
            }
        }
        let path = entry_path(&self.config.dir, id);
        match read_record(&path) {
            Ok(record) => {
                self.index.slot_mut(id).unwrap().data.resident = Some(Resident::from_record(&record));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(id, "failed to load entry file, dooming entry: {e}");
                self.doom_in_memory(id);
                Err(e)
            }
        }
    }

    /// Rewrite the entry file from its resident content.
    fn persist(&mut self, id: EntryId) -> Result<()> {
        let Some(slot) = self.index.slot(id) else {
            return Err(Error::NotFound);
        };
        let resident = slot
            .data
            .resident
            .as_ref()
            .ok_or(Error::Misuse("persisting an entry that is not resident"))?;

        let record = ObjectRecord {
            id,
            key: slot.meta.key.to_vec(),
            stream_lens: slot.meta.stream_lens,
            last_used: slot.meta.last_used,
            last_modified: slot.meta.last_modified,
            streams: resident
                .streams
                .iter()
                .map(|map| {
                    map.iter()
                        .map(|(offset, data)| ObjectExtent {
                            offset,
                            data: data.to_vec(),
                        })
                        .collect()
                })
                .collect(),
            sparse: resident
                .sparse
                .iter()
                .map(|(offset, data)| ObjectExtent {
                    offset,
                    data: data.to_vec(),
                })
                .collect(),
        };

        if let Err(e) = write_record(&self.config.dir, &record, self.config.flush) {
            tracing::warn!(id, "failed to rewrite entry file, dooming entry: {e}");
            self.doom_in_memory(id);
            return Err(e);
        }
        Ok(())
    }

    /// Doom by id; idempotent for already doomed entries.
    fn doom_id(&mut self, id: EntryId) -> Result<()> {
        let Some(slot) = self.index.slot(id) else {
            return Err(Error::NotFound);
        };
        if slot.meta.doomed {
            return Ok(());
        }
        // Move the file out of the live namespace before the doom completes; a crash after this
        // point leaves only a trash file, which init sweeps.
        if let Err(e) = fs::rename(entry_path(&self.config.dir, id), trash_path(&self.config.dir, id)) {
            tracing::warn!(id, "failed to move doomed entry file to trash: {e}");
        }
        self.index.doom(id);
        if self.index.slot(id).is_some_and(|slot| slot.meta.handles == 0) {
            self.reclaim(id);
        }
        Ok(())
    }

    /// Doom without touching the file, for entries whose storage is already failing.
    fn doom_in_memory(&mut self, id: EntryId) {
        let _ = fs::rename(entry_path(&self.config.dir, id), trash_path(&self.config.dir, id));
        if self.index.doom(id) && self.index.slot(id).is_some_and(|slot| slot.meta.handles == 0) {
            self.reclaim(id);
        }
    }

    fn reclaim(&mut self, id: EntryId) {
        if self.index.remove(id).is_some() {
            let path = trash_path(&self.config.dir, id);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(id, "failed to remove trash file: {e}");
                }
            }
        }
    }

    fn maybe_evict(&mut self) {
        if !self.index.over_budget() {
            return;
        }
        for id in self.index.evict() {
            if let Err(e) = fs::rename(entry_path(&self.config.dir, id), trash_path(&self.config.dir, id)) {
                tracing::warn!(id, "failed to move evicted entry file to trash: {e}");
            }
            // Eviction never picks entries with live handles.
            self.reclaim(id);
        }
    }
}

impl WorkerOps for ObjectWorker {
    fn open_key(&mut self, key: &Bytes) -> Result<Option<Entry>> {
        let Some(id) = self.index.lookup(key) else {
            return Ok(None);
        };
        self.ensure_resident(id)?;
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
        self.ensure_resident(id)?;
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

        self.index.insert(id, Slot {
            meta: EntryMeta::new(key.clone()),
            data: ObjectSlot {
                resident: Some(Resident::default()),
            },
        });
        if let Err(e) = self.persist(id) {
            // The entry never made it to disk; undo the insertion entirely.
            self.index.doom(id);
            self.index.remove(id);
            return Err(e);
        }
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
        for id in self.index.doom_range(begin, end) {
            if let Err(e) = fs::rename(entry_path(&self.config.dir, id), trash_path(&self.config.dir, id)) {
                tracing::warn!(id, "failed to move doomed entry file to trash: {e}");
            }
            if self.index.slot(id).is_some_and(|slot| slot.meta.handles == 0) {
                self.reclaim(id);
            }
        }
        Ok(())
    }

    fn list(&mut self) -> Result<Vec<EntryId>> {
        Ok(self.index.live_ids())
    }

    fn set_max_size(&mut self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Err(Error::config("max size must be positive"));
        }
        self.index.set_max_size(bytes);
        self.maybe_evict();
        Ok(())
    }

    fn count(&mut self) -> Result<usize> {
        Ok(self.index.entry_count())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.index.current_size())
    }

    fn entry_read(&mut self, id: EntryId, stream: usize, offset: u64, len: usize) -> Result<Bytes> {
        self.ensure_resident(id)?;
        let slot = self.index.slot(id).ok_or(Error::NotFound)?;
        let resident = slot.data.resident.as_ref().unwrap();
        let stream_len = slot.meta.stream_lens[stream];
        let out = if offset >= stream_len || len == 0 {
            Bytes::new()
        } else {
            let end = stream_len.min(offset + len as u64);
            resident.streams[stream].assemble(offset, (end - offset) as usize)
        };
        self.index.stamp_used(id);
        Ok(out)
    }

    fn entry_write(&mut self, id: EntryId, stream: usize, offset: u64, buf: Bytes, truncate: bool) -> Result<()> {
        self.ensure_resident(id)?;
        let slot = self.index.slot_mut(id).unwrap();
        let old_bytes = slot.meta.bytes();
        let resident = slot.data.resident.as_mut().unwrap();
        apply_stream_write(
            &mut resident.streams,
            &mut slot.meta.stream_lens,
            stream,
            offset,
            buf,
            truncate,
        );
        let now = clock::now_nanos();
        slot.meta.last_used = now;
        slot.meta.last_modified = now;
        self.index.resize(id, old_bytes);

        self.persist(id)?;
        self.maybe_evict();
        Ok(())
    }

    fn entry_read_sparse(&mut self, id: EntryId, offset: u64, len: usize) -> Result<SparseRead> {
        self.ensure_resident(id)?;
        let slot = self.index.slot(id).ok_or(Error::NotFound)?;
        let resident = slot.data.resident.as_ref().unwrap();
        let buf = resident.sparse.assemble(offset, len);
        let ranges = resident.sparse.ranges(offset, len as u64);
        self.index.stamp_used(id);
        Ok(SparseRead { buf, ranges })
    }

    fn entry_write_sparse(&mut self, id: EntryId, offset: u64, buf: Bytes) -> Result<()> {
        self.ensure_resident(id)?;
        let slot = self.index.slot_mut(id).unwrap();
        let old_bytes = slot.meta.bytes();
        let resident = slot.data.resident.as_mut().unwrap();
        resident.sparse.insert(offset, buf);
        slot.meta.sparse_len = resident.sparse.total();
        let now = clock::now_nanos();
        slot.meta.last_used = now;
        slot.meta.last_modified = now;
        self.index.resize(id, old_bytes);

        self.persist(id)?;
        self.maybe_evict();
        Ok(())
    }

    fn entry_stat(&mut self, id: EntryId) -> Result<EntryStat> {
        self.index.slot(id).map(|slot| slot.meta.stat()).ok_or(Error::NotFound)
    }

    fn entry_doom(&mut self, id: EntryId) -> Result<()> {
        self.doom_id(id)
    }

    fn release(&mut self, id: EntryId) {
        if self.index.release(id) {
            self.reclaim(id);
            return;
        }
        // Content stays resident only while handles are open.
        if let Some(slot) = self.index.slot_mut(id) {
            if slot.meta.handles == 0 {
                slot.data.resident = None;
            }
        }
        if self.index.over_budget() {
            self.maybe_evict();
        }
    }

    fn close(&mut self) -> Result<()> {
        store_preamble(&self.config.dir, false)?;
        tracing::debug!(dir = %self.config.dir.display(), "object engine closed");
        Ok(())
    }
}

/// Read and validate one entry file.
pub(crate) fn read_object_header(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 16 {
        return Err(Error::corruption("entry file truncated"));
    }
    let magic = u32::from_be_bytes(data[0..4].try_into().unwrap());
    if magic != OBJECT_MAGIC {
        return Err(Error::corruption(format!(
            "entry file magic mismatch, expected: {OBJECT_MAGIC:#x}, got: {magic:#x}"
        )));
    }
    let version = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if version != OBJECT_VERSION {
        return Err(Error::corruption(format!(
            "entry file version mismatch, expected: {OBJECT_VERSION}, got: {version}"
        )));
    }
    let body = &data[8..data.len() - 8];
    let expected = u64::from_be_bytes(data[data.len() - 8..].try_into().unwrap());
    let checksum = Checksummer::checksum64(body);
    if checksum != expected {
        return Err(Error::corruption(format!(
            "entry file checksum mismatch, expected: {expected:#x}, got: {checksum:#x}"
        )));
    }
    Ok(body)
}

fn read_record(path: &Path) -> Result<ObjectRecord> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    let body = read_object_header(&data)?;
    bincode::deserialize(body).map_err(|e| Error::corruption(format!("entry file undecodable: {e}")))
}

/// Validate one entry file and report its id and budgeted bytes. Used by the integrity checker.
pub(crate) fn inspect_entry_file(path: &Path) -> Result<(EntryId, u64)> {
    let record = read_record(path)?;
    let bytes = record.stream_lens.iter().sum::<u64>()
        + record.sparse.iter().map(|extent| extent.data.len() as u64).sum::<u64>();
    Ok((record.id, bytes))
}

fn write_record(dir: &Path, record: &ObjectRecord, flush: bool) -> Result<()> {
    let body = bincode::serialize(record).map_err(Error::other)?;
    let mut data = Vec::with_capacity(body.len() + 16);
    data.extend_from_slice(&OBJECT_MAGIC.to_be_bytes());
    data.extend_from_slice(&OBJECT_VERSION.to_be_bytes());
    data.extend_from_slice(&body);
    data.extend_from_slice(&Checksummer::checksum64(&body).to_be_bytes());

    let path = entry_path(dir, record.id);
    let tmp = path.with_extension("tmp");
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
    file.write_all(&data)?;
    if flush {
        file.sync_all()?;
    }
    drop(file);
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Write the 12-byte index preamble for the object layout.
pub(crate) fn store_preamble(dir: &Path, dirty: bool) -> Result<()> {
    let mut data = Vec::with_capacity(Preamble::LEN);
    Preamble {
        kind: LayoutKind::Object,
        dirty,
    }
    .write(&mut data);

    let path = dir.join(INDEX_FILE);
    let tmp = dir.join(format!("{INDEX_FILE}.tmp"));
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, &path)?;
    Ok(())
}
