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

use std::{fmt::Debug, time::SystemTime};

use bytes::Bytes;
use futures_core::future::BoxFuture;

use crate::{
    entry::{Entry, EntryId},
    error::Result,
};

/// The entry-lifecycle contract implemented by every storage engine.
///
/// The variant is selected exactly once by the builder; afterwards all access goes through this
/// capability surface. Operations may complete inline or be deferred to the backend's worker
/// context; callers must treat both the same and must not assume a completion runs recursively
/// within the call that issued it. Every operation resolves exactly once. There is no
/// cancellation: once dispatched, an operation runs to completion.
pub trait Backend: Send + Sync + 'static + Debug {
    /// Initialize the backend. Must complete before any other operation.
    ///
    /// Fails with [`crate::Error::Corruption`] on a structurally inconsistent or
    /// version-mismatched layout, and with [`crate::Error::Misuse`] when called more than once.
    fn init(&self) -> BoxFuture<'static, Result<()>>;

    /// Open the live entry with the given key. Never yields a doomed entry.
    fn open_entry(&self, key: Bytes) -> BoxFuture<'static, Result<Option<Entry>>>;

    /// Create a new entry.
    ///
    /// Fails with [`crate::Error::AlreadyExists`] when a live entry holds the key. A doomed
    /// predecessor with pending reclamation does not block creation; the new entry gets fresh
    /// storage and never aliases the old record.
    fn create_entry(&self, key: Bytes) -> BoxFuture<'static, Result<Entry>>;

    /// Doom the live entry with the given key.
    ///
    /// Fails with [`crate::Error::NotFound`] on a miss. Size bookkeeping drops immediately even
    /// while live handles remain.
    fn doom_entry(&self, key: Bytes) -> BoxFuture<'static, Result<()>>;

    /// Doom every live entry whose last-modified time falls in `[begin, end)`.
    fn doom_entries_between(&self, begin: SystemTime, end: SystemTime) -> BoxFuture<'static, Result<()>>;

    /// Snapshot the ids of all live entries, in enumeration order.
    ///
    /// Enumeration is snapshot-at-creation: entries created afterwards are not yielded and
    /// entries doomed afterwards are skipped when opened.
    fn list_entries(&self) -> BoxFuture<'static, Result<Vec<EntryId>>>;

    /// Open a live entry by id; `None` when it has vanished or been doomed since listing.
    fn open_entry_by_id(&self, id: EntryId) -> BoxFuture<'static, Result<Option<Entry>>>;

    /// Replace the size budget.
    ///
    /// Zero is rejected with [`crate::Error::Config`]. A ceiling below the current size triggers
    /// an immediate eviction pass.
    fn set_max_size(&self, bytes: u64) -> BoxFuture<'static, Result<()>>;

    /// Number of live, non-doomed entries.
    fn entry_count(&self) -> BoxFuture<'static, Result<usize>>;

    /// Total bytes currently charged against the budget.
    fn current_size(&self) -> BoxFuture<'static, Result<u64>>;

    /// Wait for all submitted work to finish.
    fn wait(&self) -> BoxFuture<'static, ()>;

    /// Drain pending work, persist a clean shutdown state, and release the directory.
    ///
    /// Later operations fail with [`crate::Error::Closed`].
    fn close(&self) -> BoxFuture<'static, Result<()>>;
}
