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

//! The memory-only engine.
//!
//! Implements the identical contract with no persistence: init completes immediately, every
//! future is ready at first poll, and there is no worker. The index, doom bookkeeping, and
//! eviction logic are the same as the disk engines', operating on in-memory buffers.

use std::{sync::Arc, time::SystemTime};

use bytes::Bytes;
use futures_core::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;

use crate::{
    backend::Backend,
    clock,
    engine::{IdGenerator, Lifecycle},
    entry::{Entry, EntryId, EntryOps, EntryStat, SparseRead, STREAM_COUNT},
    error::{Error, Result},
    eviction::EvictionConfig,
    extent::{apply_stream_write, ExtentMap},
    index::{EntryMeta, Index, Slot},
};

/// Memory engine configuration, assembled by the builder.
#[derive(Debug, Clone)]
pub(crate) struct MemConfig {
    pub max_size: u64,
    pub eviction: EvictionConfig,
    pub deterministic_ids: bool,
    pub evict_candidates: usize,
}

/// In-memory buffers of one entry.
#[derive(Debug, Default)]
struct MemSlot {
    streams: [ExtentMap<Bytes>; STREAM_COUNT],
    sparse: ExtentMap<Bytes>,
}

struct MemState {
    index: Index<MemSlot>,
    ids: IdGenerator,
}

impl MemState {
    fn maybe_evict(&mut self) {
        while self.index.over_budget() {
            let victims = self.index.evict();
            if victims.is_empty() {
                break;
            }
            for id in victims {
                // Eviction never picks entries with live handles; drop the buffers now.
                self.index.remove(id);
            }
        }
    }

    fn release(&mut self, id: EntryId) {
        if self.index.release(id) {
            self.index.remove(id);
        } else if self.index.over_budget() {
            self.maybe_evict();
        }
    }
}

/// Memory-only engine.
#[derive(Debug, Clone)]
pub(crate) struct MemEngine {
    inner: Arc<MemEngineInner>,
}

#[derive(Debug)]
struct MemEngineInner {
    lifecycle: Lifecycle,
    state: Arc<Mutex<MemState>>,
}

impl std::fmt::Debug for MemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemState")
            .field("entries", &self.index.entry_count())
            .finish()
    }
}

impl MemEngine {
    pub fn new(config: MemConfig) -> Self {
        Self {
            inner: Arc::new(MemEngineInner {
                lifecycle: Lifecycle::new(),
                state: Arc::new(Mutex::new(MemState {
                    index: Index::new(config.max_size, &config.eviction, config.evict_candidates),
                    ids: IdGenerator::new(config.deterministic_ids),
                })),
            }),
        }
    }
}

impl Backend for MemEngine {
    fn init(&self) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            this.inner.lifecycle.start_init()?;
            this.inner.lifecycle.finish_init();
            Ok(())
        }
        .boxed()
    }

    fn open_entry(&self, key: Bytes) -> BoxFuture<'static, Result<Option<Entry>>> {
        let this = self.clone();
        async move {
            this.inner.lifecycle.guard()?;
            let mut state = this.inner.state.lock();
            let Some(id) = state.index.lookup(&key) else {
                return Ok(None);
            };
            state.index.acquire(id);
            state.index.touch(id);
            Ok(Some(MemEntry::entry(id, key, this.inner.state.clone())))
        }
        .boxed()
    }

    fn create_entry(&self, key: Bytes) -> BoxFuture<'static, Result<Entry>> {
        let this = self.clone();
        async move {
            this.inner.lifecycle.guard()?;
            let mut state = this.inner.state.lock();
            if state.index.lookup(&key).is_some() {
                return Err(Error::AlreadyExists);
            }
            let mut id = state.ids.next();
            while state.index.contains(id) {
                id = state.ids.next();
            }
            state.index.insert(id, Slot {
                meta: EntryMeta::new(key.clone()),
                data: MemSlot::default(),
            });
            state.index.acquire(id);
            Ok(MemEntry::entry(id, key, this.inner.state.clone()))
        }
        .boxed()
    }

    fn doom_entry(&self, key: Bytes) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            this.inner.lifecycle.guard()?;
            let mut state = this.inner.state.lock();
            let Some(id) = state.index.lookup(&key) else {
                return Err(Error::NotFound);
            };
            state.index.doom(id);
            if state.index.slot(id).is_some_and(|slot| slot.meta.handles == 0) {
                state.index.remove(id);
            }
            Ok(())
        }
        .boxed()
    }

    fn doom_entries_between(&self, begin: SystemTime, end: SystemTime) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let begin = clock::to_nanos(begin);
        let end = clock::to_nanos(end);
        async move {
            this.inner.lifecycle.guard()?;
            let mut state = this.inner.state.lock();
            for id in state.index.doom_range(begin, end) {
                if state.index.slot(id).is_some_and(|slot| slot.meta.handles == 0) {
                    state.index.remove(id);
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn list_entries(&self) -> BoxFuture<'static, Result<Vec<EntryId>>> {
        let this = self.clone();
        async move {
            this.inner.lifecycle.guard()?;
            Ok(this.inner.state.lock().index.live_ids())
        }
        .boxed()
    }

    fn open_entry_by_id(&self, id: EntryId) -> BoxFuture<'static, Result<Option<Entry>>> {
        let this = self.clone();
        async move {
            this.inner.lifecycle.guard()?;
            let mut state = this.inner.state.lock();
            let Some(slot) = state.index.slot(id) else {
                return Ok(None);
            };
            if slot.meta.doomed {
                return Ok(None);
            }
            let key = slot.meta.key.clone();
            state.index.acquire(id);
            state.index.touch(id);
            Ok(Some(MemEntry::entry(id, key, this.inner.state.clone())))
        }
        .boxed()
    }

    fn set_max_size(&self, bytes: u64) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            this.inner.lifecycle.guard()?;
            if bytes == 0 {
                return Err(Error::config("max size must be positive"));
            }
            let mut state = this.inner.state.lock();
            state.index.set_max_size(bytes);
            state.maybe_evict();
            Ok(())
        }
        .boxed()
    }

    fn entry_count(&self) -> BoxFuture<'static, Result<usize>> {
        let this = self.clone();
        async move {
            this.inner.lifecycle.guard()?;
            Ok(this.inner.state.lock().index.entry_count())
        }
        .boxed()
    }

    fn current_size(&self) -> BoxFuture<'static, Result<u64>> {
        let this = self.clone();
        async move {
            this.inner.lifecycle.guard()?;
            Ok(this.inner.state.lock().index.current_size())
        }
        .boxed()
    }

    fn wait(&self) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }

    fn close(&self) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            this.inner.lifecycle.guard()?;
            this.inner.lifecycle.close();
            Ok(())
        }
        .boxed()
    }
}

/// Entry handle over the shared in-memory state.
#[derive(Debug)]
struct MemEntry {
    id: EntryId,
    key: Bytes,
    state: Arc<Mutex<MemState>>,
}

impl MemEntry {
    fn entry(id: EntryId, key: Bytes, state: Arc<Mutex<MemState>>) -> Entry {
        Entry::new(Arc::new(Self { id, key, state }))
    }
}

impl Drop for MemEntry {
    fn drop(&mut self) {
        self.state.lock().release(self.id);
    }
}

impl EntryOps for MemEntry {
    fn id(&self) -> EntryId {
        self.id
    }

    fn key(&self) -> &Bytes {
        &self.key
    }

    fn read(&self, stream: usize, offset: u64, len: usize) -> BoxFuture<'static, Result<Bytes>> {
        let state = self.state.clone();
        let id = self.id;
        async move {
            let mut state = state.lock();
            let Some(slot) = state.index.slot(id) else {
                return Err(Error::NotFound);
            };
            let stream_len = slot.meta.stream_lens[stream];
            let out = if offset >= stream_len || len == 0 {
                Bytes::new()
            } else {
                let end = stream_len.min(offset + len as u64);
                slot.data.streams[stream].assemble(offset, (end - offset) as usize)
            };
            state.index.stamp_used(id);
            Ok(out)
        }
        .boxed()
    }

    fn write(&self, stream: usize, offset: u64, buf: Bytes, truncate: bool) -> BoxFuture<'static, Result<()>> {
        let state = self.state.clone();
        let id = self.id;
        async move {
            let mut state = state.lock();
            let Some(slot) = state.index.slot_mut(id) else {
                return Err(Error::NotFound);
            };
            let old_bytes = slot.meta.bytes();
            apply_stream_write(
                &mut slot.data.streams,
                &mut slot.meta.stream_lens,
                stream,
                offset,
                buf,
                truncate,
            );
            let now = clock::now_nanos();
            slot.meta.last_used = now;
            slot.meta.last_modified = now;
            state.index.resize(id, old_bytes);
            state.maybe_evict();
            Ok(())
        }
        .boxed()
    }

    fn read_sparse(&self, offset: u64, len: usize) -> BoxFuture<'static, Result<SparseRead>> {
        let state = self.state.clone();
        let id = self.id;
        async move {
            let mut state = state.lock();
            let Some(slot) = state.index.slot(id) else {
                return Err(Error::NotFound);
            };
            let buf = slot.data.sparse.assemble(offset, len);
            let ranges = slot.data.sparse.ranges(offset, len as u64);
            state.index.stamp_used(id);
            Ok(SparseRead { buf, ranges })
        }
        .boxed()
    }

    fn write_sparse(&self, offset: u64, buf: Bytes) -> BoxFuture<'static, Result<()>> {
        let state = self.state.clone();
        let id = self.id;
        async move {
            let mut state = state.lock();
            let Some(slot) = state.index.slot_mut(id) else {
                return Err(Error::NotFound);
            };
            let old_bytes = slot.meta.bytes();
            slot.data.sparse.insert(offset, buf);
            slot.meta.sparse_len = slot.data.sparse.total();
            let now = clock::now_nanos();
            slot.meta.last_used = now;
            slot.meta.last_modified = now;
            state.index.resize(id, old_bytes);
            state.maybe_evict();
            Ok(())
        }
        .boxed()
    }

    fn stat(&self) -> BoxFuture<'static, Result<EntryStat>> {
        let state = self.state.clone();
        let id = self.id;
        async move {
            let state = state.lock();
            state.index.slot(id).map(|slot| slot.meta.stat()).ok_or(Error::NotFound)
        }
        .boxed()
    }

    fn doom(&self) -> BoxFuture<'static, Result<()>> {
        let state = self.state.clone();
        let id = self.id;
        async move {
            let mut state = state.lock();
            state.index.doom(id);
            Ok(())
        }
        .boxed()
    }
}
