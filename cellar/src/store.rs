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

//! The cache facade and its builder.
//!
//! The builder selects exactly one engine variant from configuration, drives its async init,
//! and hands back a ready [`Cache`] or the first terminal failure. It never blocks the calling
//! context; filesystem preflight runs on the blocking pool.

use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use cellar_common::asyncify::asyncify;

use crate::{
    backend::Backend,
    engine::{
        block::{new_block_engine, worker::BlockConfig},
        mem::{MemConfig, MemEngine},
        object::{new_object_engine, worker::ObjectConfig},
        LayoutKind, Preamble,
    },
    entry::{Entry, EntryId},
    error::{Error, Result},
    eviction::EvictionConfig,
    runtime::{Runtime, RuntimeOptions},
};

const DEFAULT_MAX_SIZE: u64 = 256 * 1024 * 1024;
const DEFAULT_FILE_CAPACITY: u64 = 16 * 1024 * 1024;
const DEFAULT_EVICT_CANDIDATES: usize = 32;

/// Which engine variant a cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Disk-backed block-log engine. The default choice for persistent caches.
    Block,
    /// Memory-only engine; nothing survives the process.
    Memory,
    /// Alternate disk layout with one file per entry.
    Object,
}

/// Builder for a [`Cache`].
///
/// ```ignore
/// let cache = CacheBuilder::new(CacheKind::Block)
///     .with_dir("/tmp/cache")
///     .with_max_size(64 * 1024 * 1024)
///     .build()
///     .await?;
/// ```
#[derive(Debug)]
pub struct CacheBuilder {
    kind: CacheKind,
    dir: Option<PathBuf>,
    max_size: u64,
    eviction: EvictionConfig,
    deterministic_ids: bool,
    flush: bool,
    force: bool,
    file_capacity: u64,
    evict_candidates: usize,
    runtime: RuntimeOptions,
}

impl CacheBuilder {
    /// Start building a cache of the given kind.
    pub fn new(kind: CacheKind) -> Self {
        Self {
            kind,
            dir: None,
            max_size: DEFAULT_MAX_SIZE,
            eviction: EvictionConfig::default(),
            deterministic_ids: false,
            flush: true,
            force: false,
            file_capacity: DEFAULT_FILE_CAPACITY,
            evict_candidates: DEFAULT_EVICT_CANDIDATES,
            runtime: RuntimeOptions::default(),
        }
    }

    /// The directory holding the cache. Required for disk kinds, ignored by the memory kind.
    ///
    /// One live cache instance owns the directory exclusively, enforced by an advisory lock.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// The size budget in bytes.
    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    /// Select and configure the eviction policy.
    pub fn with_eviction(mut self, eviction: impl Into<EvictionConfig>) -> Self {
        self.eviction = eviction.into();
        self
    }

    /// Assign entry ids sequentially instead of randomly, for reproducible tests.
    pub fn with_deterministic_ids(mut self, deterministic: bool) -> Self {
        self.deterministic_ids = deterministic;
        self
    }

    /// Fsync disk writes before delivering their completions. Defaults to on.
    ///
    /// With flush off, the crash-recovery contract holds for abrupt process termination but not
    /// for an OS crash or power loss.
    pub fn with_flush(mut self, flush: bool) -> Self {
        self.flush = flush;
        self
    }

    /// Destroy an incompatible pre-existing layout instead of failing.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Rotation threshold for the block engine's data files.
    pub fn with_file_capacity(mut self, bytes: u64) -> Self {
        self.file_capacity = bytes;
        self
    }

    /// Bound on candidates examined per eviction pass.
    pub fn with_evict_candidates(mut self, candidates: usize) -> Self {
        self.evict_candidates = candidates;
        self
    }

    /// How the disk engines obtain their worker execution context.
    pub fn with_runtime(mut self, runtime: RuntimeOptions) -> Self {
        self.runtime = runtime;
        self
    }

    /// Construct the selected engine, drive its init, and return the ready cache.
    ///
    /// A corrupted same-kind layout is discarded and rebuilt empty once; an incompatible layout
    /// kind is a terminal failure unless [`CacheBuilder::with_force`] is set.
    pub async fn build(self) -> Result<Cache> {
        if self.max_size == 0 {
            return Err(Error::config("max size must be positive"));
        }
        let kind = self.kind;

        if kind == CacheKind::Memory {
            let backend: Arc<dyn Backend> = Arc::new(MemEngine::new(MemConfig {
                max_size: self.max_size,
                eviction: self.eviction.clone(),
                deterministic_ids: self.deterministic_ids,
                evict_candidates: self.evict_candidates,
            }));
            backend.init().await?;
            return Ok(Cache { backend, kind });
        }

        let dir = self
            .dir
            .clone()
            .ok_or_else(|| Error::config("disk cache requires a directory"))?;

        {
            let dir = dir.clone();
            let force = self.force;
            asyncify(move || preflight(&dir, kind, force)).await?;
        }

        let runtime = Runtime::build(&self.runtime)?;

        let backend = self.make_disk_backend(runtime.clone())?;
        match backend.init().await {
            Ok(()) => Ok(Cache { backend, kind }),
            Err(e) if e.is_corruption() => {
                tracing::warn!(
                    dir = %dir.display(),
                    "cache is corrupted, discarding and rebuilding empty: {e}"
                );
                {
                    let dir = dir.clone();
                    asyncify(move || wipe_dir(&dir)).await?;
                }
                let backend = self.make_disk_backend(runtime)?;
                backend.init().await?;
                Ok(Cache { backend, kind })
            }
            Err(e) => Err(e),
        }
    }

    fn make_disk_backend(&self, runtime: Runtime) -> Result<Arc<dyn Backend>> {
        let dir = self.dir.clone().expect("checked by build");
        let backend: Arc<dyn Backend> = match self.kind {
            CacheKind::Block => Arc::new(new_block_engine(
                BlockConfig {
                    dir,
                    max_size: self.max_size,
                    eviction: self.eviction.clone(),
                    deterministic_ids: self.deterministic_ids,
                    flush: self.flush,
                    file_capacity: self.file_capacity,
                    evict_candidates: self.evict_candidates,
                },
                runtime,
            )),
            CacheKind::Object => Arc::new(new_object_engine(
                ObjectConfig {
                    dir,
                    max_size: self.max_size,
                    eviction: self.eviction.clone(),
                    deterministic_ids: self.deterministic_ids,
                    flush: self.flush,
                    evict_candidates: self.evict_candidates,
                },
                runtime,
            )?),
            CacheKind::Memory => unreachable!("memory caches are built directly"),
        };
        Ok(backend)
    }
}

fn preflight(dir: &Path, kind: CacheKind, force: bool) -> Result<()> {
    if dir.exists() && !dir.is_dir() {
        return Err(Error::config(format!("cache path is not a directory: {}", dir.display())));
    }
    fs::create_dir_all(dir)?;
    let want = match kind {
        CacheKind::Block => LayoutKind::Block,
        CacheKind::Object => LayoutKind::Object,
        CacheKind::Memory => return Ok(()),
    };
    match Preamble::load(dir) {
        Ok(None) => Ok(()),
        Ok(Some(preamble)) if preamble.kind == want => Ok(()),
        Ok(Some(preamble)) => {
            if force {
                tracing::warn!(
                    dir = %dir.display(),
                    "destroying incompatible {:?} cache layout", preamble.kind
                );
                wipe_dir(dir)
            } else {
                Err(Error::corruption(format!(
                    "existing cache layout {:?} is incompatible with {:?}",
                    preamble.kind, kind
                )))
            }
        }
        // An unreadable preamble is ordinary corruption; init will fail and trigger the rebuild.
        Err(e) if e.is_corruption() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove the contents of `dir`, keeping the directory itself.
fn wipe_dir(dir: &Path) -> Result<()> {
    for dent in fs::read_dir(dir)? {
        let dent = dent?;
        if dent.file_type()?.is_dir() {
            fs::remove_dir_all(dent.path())?;
        } else {
            fs::remove_file(dent.path())?;
        }
    }
    Ok(())
}

/// A ready cache over exactly one engine variant.
///
/// Cloning shares the backend. Dropping without [`Cache::close`] is an abrupt termination from
/// the cache's point of view: committed disk writes survive, and the next open recovers.
#[derive(Debug, Clone)]
pub struct Cache {
    backend: Arc<dyn Backend>,
    kind: CacheKind,
}

impl Cache {
    /// The engine variant behind this cache.
    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    /// Open the live entry with the given key. `None` on a miss or a doomed entry.
    pub async fn open_entry(&self, key: impl AsRef<[u8]>) -> Result<Option<Entry>> {
        self.backend.open_entry(Bytes::copy_from_slice(key.as_ref())).await
    }

    /// Create a new entry. Fails with [`Error::AlreadyExists`] when a live entry holds the key.
    pub async fn create_entry(&self, key: impl AsRef<[u8]>) -> Result<Entry> {
        self.backend.create_entry(Bytes::copy_from_slice(key.as_ref())).await
    }

    /// Doom the live entry with the given key.
    pub async fn doom_entry(&self, key: impl AsRef<[u8]>) -> Result<()> {
        self.backend.doom_entry(Bytes::copy_from_slice(key.as_ref())).await
    }

    /// Doom every live entry.
    pub async fn doom_all_entries(&self) -> Result<()> {
        self.backend.doom_entries_between(UNIX_EPOCH, far_future()).await
    }

    /// Doom every live entry whose last-modified time falls in `[begin, end)`.
    pub async fn doom_entries_between(&self, begin: SystemTime, end: SystemTime) -> Result<()> {
        self.backend.doom_entries_between(begin, end).await
    }

    /// Doom every live entry modified at or after `begin`.
    pub async fn doom_entries_since(&self, begin: SystemTime) -> Result<()> {
        self.backend.doom_entries_between(begin, far_future()).await
    }

    /// Enumerate live entries.
    ///
    /// The iterator snapshots the live set when first polled: entries created afterwards are
    /// not yielded, entries doomed afterwards are skipped. Doomed entries are never yielded.
    pub fn iter(&self) -> EntryIter {
        EntryIter {
            backend: self.backend.clone(),
            ids: None,
        }
    }

    /// Replace the size budget, evicting immediately if the new budget is exceeded.
    pub async fn set_max_size(&self, bytes: u64) -> Result<()> {
        self.backend.set_max_size(bytes).await
    }

    /// Number of live, non-doomed entries.
    pub async fn entry_count(&self) -> Result<usize> {
        self.backend.entry_count().await
    }

    /// Total bytes currently charged against the budget.
    pub async fn current_size(&self) -> Result<u64> {
        self.backend.current_size().await
    }

    /// Wait until all previously submitted work has finished.
    pub async fn wait(&self) {
        self.backend.wait().await;
    }

    /// Drain pending work, persist a clean shutdown state, and release the directory.
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

fn far_future() -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(u64::MAX)
}

/// Cursor over a snapshot of the live entries.
#[derive(Debug)]
pub struct EntryIter {
    backend: Arc<dyn Backend>,
    ids: Option<VecDeque<EntryId>>,
}

impl EntryIter {
    /// The next live entry, or `None` at the end of the enumeration.
    pub async fn next_entry(&mut self) -> Result<Option<Entry>> {
        if self.ids.is_none() {
            self.ids = Some(self.backend.list_entries().await?.into());
        }
        let ids = self.ids.as_mut().unwrap();
        while let Some(id) = ids.pop_front() {
            if let Some(entry) = self.backend.open_entry_by_id(id).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}
