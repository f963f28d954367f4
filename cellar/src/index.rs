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

//! Backend-owned entry index.
//!
//! One index instance lives inside each backend's worker context and is never touched from
//! another context. It owns key lookup, doom bookkeeping, the size ledger, and the recency
//! policy; engines own the slot payload `T` (in-memory buffers or on-disk span tables).

use bytes::Bytes;
use cellar_common::strict_assert;
use hashbrown::HashMap;

use crate::{
    clock,
    entry::{EntryId, EntryStat, STREAM_COUNT},
    eviction::{build_policy, Eviction, EvictionConfig},
};

/// Per-entry bookkeeping shared by all engines.
#[derive(Debug, Clone)]
pub(crate) struct EntryMeta {
    pub key: Bytes,
    pub stream_lens: [u64; STREAM_COUNT],
    pub sparse_len: u64,
    /// Nanoseconds since the unix epoch.
    pub last_used: u64,
    pub last_modified: u64,
    pub doomed: bool,
    /// Live open handles. Storage is reclaimed only when doomed and this reaches zero.
    pub handles: u32,
}

impl EntryMeta {
    pub fn new(key: Bytes) -> Self {
        let now = clock::now_nanos();
        Self {
            key,
            stream_lens: [0; STREAM_COUNT],
            sparse_len: 0,
            last_used: now,
            last_modified: now,
            doomed: false,
            handles: 0,
        }
    }

    /// Bytes charged against the cache budget.
    pub fn bytes(&self) -> u64 {
        self.stream_lens.iter().sum::<u64>() + self.sparse_len
    }

    pub fn stat(&self) -> EntryStat {
        EntryStat {
            stream_lens: self.stream_lens,
            sparse_len: self.sparse_len,
            last_used: clock::to_system_time(self.last_used),
            last_modified: clock::to_system_time(self.last_modified),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Slot<T> {
    pub meta: EntryMeta,
    pub data: T,
}

pub(crate) struct Index<T> {
    slots: HashMap<EntryId, Slot<T>>,
    /// Live (non-doomed) keys only.
    keys: HashMap<Bytes, EntryId>,
    policy: Box<dyn Eviction>,
    current_size: u64,
    max_size: u64,
    /// Bound on candidates examined per eviction pass.
    evict_candidates: usize,
}

impl<T> Index<T> {
    pub fn new(max_size: u64, eviction: &EvictionConfig, evict_candidates: usize) -> Self {
        Self {
            slots: HashMap::new(),
            keys: HashMap::new(),
            policy: build_policy(eviction, max_size),
            current_size: 0,
            max_size,
            evict_candidates,
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<EntryId> {
        self.keys.get(key).copied()
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Track a freshly created live entry with empty payload accounting.
    pub fn insert(&mut self, id: EntryId, slot: Slot<T>) {
        strict_assert!(!self.slots.contains_key(&id));
        strict_assert!(!slot.meta.doomed);
        let bytes = slot.meta.bytes();
        self.current_size += bytes;
        self.keys.insert(slot.meta.key.clone(), id);
        self.policy.push(id, bytes);
        self.slots.insert(id, slot);
    }

    pub fn slot(&self, id: EntryId) -> Option<&Slot<T>> {
        self.slots.get(&id)
    }

    pub fn slot_mut(&mut self, id: EntryId) -> Option<&mut Slot<T>> {
        self.slots.get_mut(&id)
    }

    pub fn acquire(&mut self, id: EntryId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.meta.handles += 1;
        }
    }

    /// Drop one handle. Returns `true` when the entry is doomed and now unreferenced,
    /// i.e. the engine must reclaim its storage.
    pub fn release(&mut self, id: EntryId) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        strict_assert!(slot.meta.handles > 0);
        slot.meta.handles = slot.meta.handles.saturating_sub(1);
        slot.meta.doomed && slot.meta.handles == 0
    }

    /// Record a use: refresh the recency position and the last-used stamp.
    ///
    /// Called on open, the reuse signal for the recency policies. Stream IO through an
    /// already-open handle stamps times via [`Index::stamp_used`] without reordering.
    pub fn touch(&mut self, id: EntryId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.meta.last_used = clock::now_nanos();
            if !slot.meta.doomed {
                self.policy.touch(id);
            }
        }
    }

    /// Refresh the last-used stamp without touching the recency policy.
    pub fn stamp_used(&mut self, id: EntryId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.meta.last_used = clock::now_nanos();
        }
    }

    /// Re-account an entry whose payload sizes changed; `old_bytes` is the value of
    /// `meta.bytes()` before the mutation.
    pub fn resize(&mut self, id: EntryId, old_bytes: u64) {
        let Some(slot) = self.slots.get(&id) else {
            return;
        };
        if slot.meta.doomed {
            // Doomed entries are no longer charged against the budget.
            return;
        }
        let new_bytes = slot.meta.bytes();
        self.current_size = self.current_size - old_bytes + new_bytes;
        self.policy.update_weight(id, new_bytes);
    }

    /// Doom the entry: remove it from lookup, enumeration, recency, and the size ledger.
    ///
    /// Returns `false` if the entry is absent or already doomed. The slot itself stays until the
    /// engine reclaims storage and calls [`Index::remove`].
    pub fn doom(&mut self, id: EntryId) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        if slot.meta.doomed {
            return false;
        }
        slot.meta.doomed = true;
        let bytes = slot.meta.bytes();
        self.current_size -= bytes;
        self.keys.remove(&slot.meta.key);
        self.policy.remove(id);
        true
    }

    /// Final removal of a doomed, unreferenced slot.
    pub fn remove(&mut self, id: EntryId) -> Option<Slot<T>> {
        let slot = self.slots.remove(&id)?;
        strict_assert!(slot.meta.doomed);
        strict_assert!(slot.meta.handles == 0);
        Some(slot)
    }

    /// Doom every live entry whose `last_modified` stamp falls in `[begin, end)`.
    ///
    /// Returns the doomed ids; the caller reclaims the unreferenced ones.
    pub fn doom_range(&mut self, begin: u64, end: u64) -> Vec<EntryId> {
        let ids: Vec<EntryId> = self
            .keys
            .values()
            .copied()
            .filter(|id| {
                self.slots
                    .get(id)
                    .is_some_and(|slot| (begin..end).contains(&slot.meta.last_modified))
            })
            .collect();
        ids.into_iter().filter(|&id| self.doom(id)).collect()
    }

    /// One bounded eviction pass.
    ///
    /// Walks the recency order from the least-recently-used end, dooming handle-free entries
    /// until the budget is honored, the candidate bound is hit, or the policy runs dry. Entries
    /// with live handles are skipped and re-enter the policy.
    pub fn evict(&mut self) -> Vec<EntryId> {
        let mut victims = Vec::new();
        let mut skipped: Vec<(EntryId, u64)> = Vec::new();
        let mut budget = self.evict_candidates;

        while self.current_size > self.max_size && budget > 0 {
            budget -= 1;
            let Some(id) = self.policy.pop() else {
                break;
            };
            let Some(slot) = self.slots.get(&id) else {
                continue;
            };
            if slot.meta.handles > 0 {
                skipped.push((id, slot.meta.bytes()));
                continue;
            }
            if self.doom(id) {
                victims.push(id);
            }
        }

        for (id, weight) in skipped {
            self.policy.push(id, weight);
        }
        if !victims.is_empty() {
            tracing::trace!(victims = victims.len(), current = self.current_size, "evicted entries");
        }
        victims
    }

    /// Ids of all live entries, ascending, for snapshot-style enumeration.
    pub fn live_ids(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self.keys.values().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn entry_count(&self) -> usize {
        self.keys.len()
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn over_budget(&self) -> bool {
        self.current_size > self.max_size
    }

    pub fn set_max_size(&mut self, bytes: u64) {
        self.max_size = bytes;
        self.policy.set_capacity(bytes);
    }

    /// Iterate every slot, doomed ones included, for snapshot persistence.
    pub fn iter_slots(&self) -> impl Iterator<Item = (EntryId, &Slot<T>)> {
        self.slots.iter().map(|(id, slot)| (*id, slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> Index<()> {
        Index::new(100, &EvictionConfig::default(), 8)
    }

    fn insert(index: &mut Index<()>, id: EntryId, key: &str) {
        index.insert(id, Slot {
            meta: EntryMeta::new(Bytes::copy_from_slice(key.as_bytes())),
            data: (),
        });
    }

    fn grow(index: &mut Index<()>, id: EntryId, bytes: u64) {
        let slot = index.slot_mut(id).unwrap();
        let old = slot.meta.bytes();
        slot.meta.stream_lens[0] += bytes;
        index.resize(id, old);
    }

    #[test]
    fn test_lookup_and_doom() {
        let mut index = index();
        insert(&mut index, 1, "a");
        grow(&mut index, 1, 10);
        assert_eq!(index.lookup(b"a"), Some(1));
        assert_eq!(index.entry_count(), 1);
        assert_eq!(index.current_size(), 10);

        assert!(index.doom(1));
        assert_eq!(index.lookup(b"a"), None);
        assert_eq!(index.entry_count(), 0);
        // Size bookkeeping drops immediately, even before reclaim.
        assert_eq!(index.current_size(), 0);
        assert!(index.contains(1));
        // Second doom is a no-op.
        assert!(!index.doom(1));

        assert!(index.remove(1).is_some());
        assert!(!index.contains(1));
    }

    #[test]
    fn test_release_signals_reclaim() {
        let mut index = index();
        insert(&mut index, 1, "a");
        index.acquire(1);
        index.acquire(1);
        assert!(index.doom(1));
        assert!(!index.release(1));
        assert!(index.release(1));
    }

    #[test]
    fn test_evict_lru_order() {
        let mut index = index();
        for id in 1..=5 {
            insert(&mut index, id, &format!("k{id}"));
            grow(&mut index, id, 30);
        }
        // 150 bytes against a 100-byte budget: the two oldest go.
        let victims = index.evict();
        assert_eq!(victims, vec![1, 2]);
        assert_eq!(index.current_size(), 90);
        assert_eq!(index.entry_count(), 3);
    }

    #[test]
    fn test_evict_skips_held_entries() {
        let mut index = index();
        for id in 1..=5 {
            insert(&mut index, id, &format!("k{id}"));
            grow(&mut index, id, 30);
        }
        index.acquire(1);
        let victims = index.evict();
        assert_eq!(victims, vec![2, 3]);
        assert_eq!(index.current_size(), 90);
        // The held entry survives, re-enters the policy at the recent end, and stays evictable.
        index.release(1);
        grow(&mut index, 4, 60);
        let victims = index.evict();
        assert_eq!(victims, vec![4]);
        assert_eq!(index.current_size(), 60);
    }

    #[test]
    fn test_doom_range() {
        let mut index = index();
        insert(&mut index, 1, "a");
        insert(&mut index, 2, "b");
        let t1 = index.slot(1).unwrap().meta.last_modified;
        // Push entry 2 strictly after t1, then doom everything since t1 + 1.
        index.slot_mut(2).unwrap().meta.last_modified = t1 + 10;
        let doomed = index.doom_range(t1 + 1, u64::MAX);
        assert_eq!(doomed, vec![2]);
        assert_eq!(index.lookup(b"a"), Some(1));
        assert_eq!(index.lookup(b"b"), None);
    }
}
