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

//! Recency policies for victim selection.
//!
//! A policy only maintains ordering; doom bookkeeping, size accounting, and the bounded candidate
//! scan live in the index. Policies run inside a backend's single worker context and need no
//! internal synchronization.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::entry::EntryId;

mod lru;
mod segmented;

pub use lru::{Lru, LruConfig};
pub use segmented::{Segmented, SegmentedConfig};

/// Eviction policy ordering contract.
///
/// `pop` yields the current best victim candidate and removes it from the policy; the caller
/// re-pushes candidates it decides to keep.
pub(crate) trait Eviction: Send + Sync + 'static + Debug {
    /// Track a new entry.
    fn push(&mut self, id: EntryId, weight: u64);

    /// Record a use of the entry.
    fn touch(&mut self, id: EntryId);

    /// Update the tracked weight of the entry.
    fn update_weight(&mut self, id: EntryId, weight: u64);

    /// Stop tracking the entry. Absent ids are ignored.
    fn remove(&mut self, id: EntryId);

    /// Remove and return the best victim candidate, least-recently-used first.
    fn pop(&mut self) -> Option<EntryId>;

    /// Inform the policy of a new total capacity.
    fn set_capacity(&mut self, capacity: u64);

    /// Number of tracked entries.
    fn len(&self) -> usize;
}

/// Eviction algorithm selector and per-algorithm config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EvictionConfig {
    /// The legacy single-list policy.
    Lru(LruConfig),
    /// The scan-resistant probation/protected policy.
    Segmented(SegmentedConfig),
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self::Lru(LruConfig::default())
    }
}

impl From<LruConfig> for EvictionConfig {
    fn from(config: LruConfig) -> Self {
        Self::Lru(config)
    }
}

impl From<SegmentedConfig> for EvictionConfig {
    fn from(config: SegmentedConfig) -> Self {
        Self::Segmented(config)
    }
}

pub(crate) fn build_policy(config: &EvictionConfig, capacity: u64) -> Box<dyn Eviction> {
    match config {
        EvictionConfig::Lru(config) => Box::new(Lru::new(capacity, config)),
        EvictionConfig::Segmented(config) => Box::new(Segmented::new(capacity, config)),
    }
}
