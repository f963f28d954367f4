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

use std::collections::BTreeMap;

use cellar_common::strict_assert;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use super::Eviction;
use crate::entry::EntryId;

/// Lru eviction algorithm config.
///
/// The legacy policy keeps a single recency list and carries no tunables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LruConfig {}

#[derive(Debug)]
struct LruState {
    tick: u64,
}

/// The legacy single-list recency policy.
///
/// Entries are ordered by a monotonic use tick; the victim is always the entry with the oldest
/// tick.
#[derive(Debug)]
pub struct Lru {
    tick: u64,
    order: BTreeMap<u64, EntryId>,
    index: HashMap<EntryId, LruState>,
}

impl Lru {
    /// Create a policy instance. The capacity is unused by the single-list policy.
    pub fn new(_capacity: u64, _config: &LruConfig) -> Self {
        Self {
            tick: 0,
            order: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

impl Eviction for Lru {
    fn push(&mut self, id: EntryId, _weight: u64) {
        strict_assert!(!self.index.contains_key(&id));
        let tick = self.next_tick();
        self.order.insert(tick, id);
        self.index.insert(id, LruState { tick });
    }

    fn touch(&mut self, id: EntryId) {
        let tick = self.next_tick();
        if let Some(state) = self.index.get_mut(&id) {
            self.order.remove(&state.tick);
            state.tick = tick;
            self.order.insert(tick, id);
        }
    }

    // Weights only matter to policies that partition capacity.
    fn update_weight(&mut self, _id: EntryId, _weight: u64) {}

    fn remove(&mut self, id: EntryId) {
        if let Some(state) = self.index.remove(&id) {
            self.order.remove(&state.tick);
        }
    }

    fn pop(&mut self) -> Option<EntryId> {
        let (_, id) = self.order.pop_first()?;
        self.index.remove(&id);
        Some(id)
    }

    fn set_capacity(&mut self, _capacity: u64) {}

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump(lru: &Lru) -> Vec<EntryId> {
        lru.order.values().copied().collect()
    }

    #[test]
    fn test_lru_order() {
        let mut lru = Lru::new(100, &LruConfig::default());

        lru.push(1, 10);
        lru.push(2, 10);
        lru.push(3, 10);
        assert_eq!(dump(&lru), vec![1, 2, 3]);

        lru.touch(1);
        assert_eq!(dump(&lru), vec![2, 3, 1]);

        assert_eq!(lru.pop(), Some(2));
        assert_eq!(dump(&lru), vec![3, 1]);

        lru.remove(1);
        assert_eq!(dump(&lru), vec![3]);
        assert_eq!(lru.len(), 1);

        assert_eq!(lru.pop(), Some(3));
        assert_eq!(lru.pop(), None);
    }

    #[test]
    fn test_lru_touch_missing() {
        let mut lru = Lru::new(100, &LruConfig::default());
        lru.touch(42);
        lru.remove(42);
        assert_eq!(lru.pop(), None);
    }
}
