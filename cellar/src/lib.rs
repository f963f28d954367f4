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

//! cellar - a size-bounded persistent entry cache with pluggable storage engines.
//!
//! A cache stores opaque byte streams keyed by opaque strings. Each entry carries a small fixed
//! set of indexed data streams plus an optional sparse byte-range region. Three interchangeable
//! engines implement the same entry-lifecycle contract:
//!
//! - [`CacheKind::Block`]: disk-backed block-log engine with crash recovery,
//! - [`CacheKind::Memory`]: memory-only engine with no persistence,
//! - [`CacheKind::Object`]: alternate disk layout with one file per entry.
//!
//! Disk engines serialize all work through one dedicated worker context per instance; total
//! size is kept under a budget by LRU-style eviction with two selectable policies. The
//! [`check`] module validates an on-disk directory without opening a backend.

/// The backend capability contract.
pub mod backend;
/// Standalone integrity checking of cache directories.
pub mod check;
/// Entry handles and stream/sparse IO types.
pub mod entry;
/// Error and result types.
pub mod error;
/// Eviction policies and their configuration.
pub mod eviction;
/// The cache facade and builder.
pub mod store;

mod clock;
mod engine;
mod extent;
mod index;
mod runtime;

/// The commonly used types, re-exported.
pub mod prelude;

pub use backend::Backend;
pub use check::{check_dir, CheckReport};
pub use engine::LayoutKind;
pub use entry::{Entry, EntryId, EntryStat, SparseRead, STREAM_COUNT};
pub use error::{Error, Result};
pub use eviction::{EvictionConfig, LruConfig, SegmentedConfig};
pub use runtime::RuntimeOptions;
pub use store::{Cache, CacheBuilder, CacheKind, EntryIter};
