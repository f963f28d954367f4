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

/// Segmented eviction algorithm config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentedConfig {
    /// The fraction of the total capacity reserved for the protected segment.
    ///
    /// # Panic
    ///
    /// Panics if the value is not in [0, 1.0].
    pub protected_ratio: f64,
}

impl Default for SegmentedConfig {
    fn default() -> Self {
        Self { protected_ratio: 0.8 }
    }
}

#[derive(Debug)]
struct SegState {
    tick: u64,
    weight: u64,
    protected: bool,
}

/// The scan-resistant probation/protected recency policy.
///
/// New entries enter the probation segment. A reuse promotes to the protected segment; protected
/// overflow demotes its oldest entries back to probation. Victims drain probation first, so a
/// one-pass scan over many cold entries cannot flush entries that have shown reuse.
#[derive(Debug)]
pub struct Segmented {
    tick: u64,
    probation: BTreeMap<u64, EntryId>,
    protected: BTreeMap<u64, EntryId>,
    index: HashMap<EntryId, SegState>,

    protected_weight: u64,
    protected_capacity: u64,

    config: SegmentedConfig,
}

impl Segmented {
    /// Create a policy instance for the given total capacity.
    pub fn new(capacity: u64, config: &SegmentedConfig) -> Self {
        assert!(
            (0.0..=1.0).contains(&config.protected_ratio),
            "protected_ratio must be in 0.0..=1.0, given: {}",
            config.protected_ratio
        );
        Self {
            tick: 0,
            probation: BTreeMap::new(),
            protected: BTreeMap::new(),
            index: HashMap::new(),
            protected_weight: 0,
            protected_capacity: (capacity as f64 * config.protected_ratio) as u64,
            config: config.clone(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn may_overflow_protected(&mut self) {
        while self.protected_weight > self.protected_capacity {
            let Some((_, id)) = self.protected.pop_first() else {
                break;
            };
            let tick = self.next_tick();
            let state = self.index.get_mut(&id).unwrap();
            strict_assert!(state.protected);
            state.protected = false;
            state.tick = tick;
            self.protected_weight -= state.weight;
            self.probation.insert(tick, id);
        }
    }
}

impl Eviction for Segmented {
    fn push(&mut self, id: EntryId, weight: u64) {
        strict_assert!(!self.index.contains_key(&id));
        let tick = self.next_tick();
        self.probation.insert(tick, id);
        self.index.insert(id, SegState {
            tick,
            weight,
            protected: false,
        });
    }

    fn touch(&mut self, id: EntryId) {
        let tick = self.next_tick();
        let Some(state) = self.index.get_mut(&id) else {
            return;
        };
        if state.protected {
            self.protected.remove(&state.tick);
            state.tick = tick;
            self.protected.insert(tick, id);
        } else {
            // Promotion on first reuse.
            self.probation.remove(&state.tick);
            state.tick = tick;
            state.protected = true;
            self.protected_weight += state.weight;
            self.protected.insert(tick, id);
            self.may_overflow_protected();
        }
    }

    fn update_weight(&mut self, id: EntryId, weight: u64) {
        let Some(state) = self.index.get_mut(&id) else {
            return;
        };
        if state.protected {
            self.protected_weight = self.protected_weight - state.weight + weight;
        }
        state.weight = weight;
        self.may_overflow_protected();
    }

    fn remove(&mut self, id: EntryId) {
        if let Some(state) = self.index.remove(&id) {
            if state.protected {
                self.protected.remove(&state.tick);
                self.protected_weight -= state.weight;
            } else {
                self.probation.remove(&state.tick);
            }
        }
    }

    fn pop(&mut self) -> Option<EntryId> {
        let (_, id) = self.probation.pop_first().or_else(|| self.protected.pop_first())?;
        let state = self.index.remove(&id).unwrap();
        if state.protected {
            self.protected_weight -= state.weight;
        }
        Some(id)
    }

    fn set_capacity(&mut self, capacity: u64) {
        self.protected_capacity = (capacity as f64 * self.config.protected_ratio) as u64;
        self.may_overflow_protected();
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump(seg: &Segmented) -> (Vec<EntryId>, Vec<EntryId>) {
        (
            seg.probation.values().copied().collect(),
            seg.protected.values().copied().collect(),
        )
    }

    #[test]
    fn test_segmented_promotion() {
        let mut seg = Segmented::new(100, &SegmentedConfig { protected_ratio: 0.5 });

        seg.push(1, 10);
        seg.push(2, 10);
        seg.push(3, 10);
        assert_eq!(dump(&seg), (vec![1, 2, 3], vec![]));

        // First reuse promotes.
        seg.touch(2);
        assert_eq!(dump(&seg), (vec![1, 3], vec![2]));

        // Probation drains first.
        assert_eq!(seg.pop(), Some(1));
        assert_eq!(seg.pop(), Some(3));
        assert_eq!(seg.pop(), Some(2));
        assert_eq!(seg.pop(), None);
        assert_eq!(seg.protected_weight, 0);
    }

    #[test]
    fn test_segmented_protected_overflow() {
        // Protected capacity = 20, entries weigh 10.
        let mut seg = Segmented::new(40, &SegmentedConfig { protected_ratio: 0.5 });

        seg.push(1, 10);
        seg.push(2, 10);
        seg.push(3, 10);
        seg.touch(1);
        seg.touch(2);
        assert_eq!(dump(&seg), (vec![3], vec![1, 2]));

        // A third promotion overflows the protected segment and demotes its oldest.
        seg.touch(3);
        assert_eq!(dump(&seg), (vec![1], vec![2, 3]));
        assert_eq!(seg.protected_weight, 20);
    }

    #[test]
    fn test_segmented_shrink_capacity() {
        let mut seg = Segmented::new(40, &SegmentedConfig { protected_ratio: 0.5 });
        seg.push(1, 10);
        seg.push(2, 10);
        seg.touch(1);
        seg.touch(2);
        assert_eq!(dump(&seg), (vec![], vec![1, 2]));

        seg.set_capacity(20);
        assert_eq!(dump(&seg), (vec![1], vec![2]));
    }

    #[test]
    fn test_segmented_remove() {
        let mut seg = Segmented::new(100, &SegmentedConfig::default());
        seg.push(1, 10);
        seg.push(2, 10);
        seg.touch(1);
        seg.remove(1);
        seg.remove(2);
        assert_eq!(seg.pop(), None);
        assert_eq!(seg.protected_weight, 0);
        assert_eq!(seg.len(), 0);
    }
}
