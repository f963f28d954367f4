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

use std::{fmt::Debug, ops::Range, sync::Arc, time::SystemTime};

use bytes::Bytes;
use futures_core::future::BoxFuture;

use crate::error::{Error, Result};

fn check_stream(stream: usize) -> Result<()> {
    if stream >= STREAM_COUNT {
        return Err(Error::Misuse("stream index out of range"));
    }
    Ok(())
}

/// Identifier of an entry within one backend instance.
///
/// Ids are stable across reopen for disk backends. With the deterministic-id flag they are
/// assigned sequentially, otherwise randomly.
pub type EntryId = u64;

/// Number of indexed data streams per entry.
pub const STREAM_COUNT: usize = 3;

/// A point-in-time view of an entry's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStat {
    /// Logical length of each data stream.
    pub stream_lens: [u64; STREAM_COUNT],
    /// Total bytes held by sparse extents.
    pub sparse_len: u64,
    /// Last time the entry was opened or read.
    pub last_used: SystemTime,
    /// Last time the entry was written.
    pub last_modified: SystemTime,
}

impl EntryStat {
    /// Total bytes charged against the cache budget for this entry.
    pub fn bytes(&self) -> u64 {
        self.stream_lens.iter().sum::<u64>() + self.sparse_len
    }
}

/// Result of a sparse read.
///
/// The buffer always spans the full requested range; bytes outside `ranges` were never written
/// and read as zeroes. Overlapping an unwritten sub-range is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseRead {
    /// The requested range, written extents verbatim, gaps zero-filled.
    pub buf: Bytes,
    /// Absolute sub-ranges actually covered by written extents, ascending, coalesced.
    pub ranges: Vec<Range<u64>>,
}

impl SparseRead {
    /// Number of bytes in the buffer that were actually written.
    pub fn valid_bytes(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }
}

/// Engine-side operations behind an entry handle.
pub(crate) trait EntryOps: Send + Sync + Debug {
    fn id(&self) -> EntryId;
    fn key(&self) -> &Bytes;
    fn read(&self, stream: usize, offset: u64, len: usize) -> BoxFuture<'static, Result<Bytes>>;
    fn write(&self, stream: usize, offset: u64, buf: Bytes, truncate: bool) -> BoxFuture<'static, Result<()>>;
    fn read_sparse(&self, offset: u64, len: usize) -> BoxFuture<'static, Result<SparseRead>>;
    fn write_sparse(&self, offset: u64, buf: Bytes) -> BoxFuture<'static, Result<()>>;
    fn stat(&self) -> BoxFuture<'static, Result<EntryStat>>;
    fn doom(&self) -> BoxFuture<'static, Result<()>>;
}

/// A reference-counted handle to a cache entry.
///
/// Handles share the underlying record: cloning is cheap, and the entry's storage is reclaimed
/// only once it is doomed and the last handle is dropped. A doomed entry stays fully readable
/// through handles that were open when it was doomed.
#[derive(Debug, Clone)]
pub struct Entry {
    ops: Arc<dyn EntryOps>,
}

impl Entry {
    pub(crate) fn new(ops: Arc<dyn EntryOps>) -> Self {
        Self { ops }
    }

    /// The entry id.
    pub fn id(&self) -> EntryId {
        self.ops.id()
    }

    /// The entry key.
    pub fn key(&self) -> &Bytes {
        self.ops.key()
    }

    /// Read up to `len` bytes from the stream at `offset`.
    ///
    /// Returns the bytes between `offset` and the stream end; gaps between written extents read
    /// as zeroes. Reads at or beyond the stream end return an empty buffer.
    pub async fn read(&self, stream: usize, offset: u64, len: usize) -> Result<Bytes> {
        check_stream(stream)?;
        self.ops.read(stream, offset, len).await
    }

    /// Write `buf` into the stream at `offset`.
    ///
    /// With `truncate`, the stream length becomes `offset + buf.len()` and trailing bytes are
    /// discarded; otherwise the stream only ever grows.
    pub async fn write(&self, stream: usize, offset: u64, buf: impl Into<Bytes>, truncate: bool) -> Result<()> {
        check_stream(stream)?;
        self.ops.write(stream, offset, buf.into(), truncate).await
    }

    /// Read `len` bytes of the sparse region at `offset`.
    pub async fn read_sparse(&self, offset: u64, len: usize) -> Result<SparseRead> {
        self.ops.read_sparse(offset, len).await
    }

    /// Write `buf` into the sparse region at `offset`.
    ///
    /// Extents may be disjoint; overlapping writes supersede byte-for-byte.
    pub async fn write_sparse(&self, offset: u64, buf: impl Into<Bytes>) -> Result<()> {
        self.ops.write_sparse(offset, buf.into()).await
    }

    /// Current sizes and timestamps of the entry.
    pub async fn stat(&self) -> Result<EntryStat> {
        self.ops.stat().await
    }

    /// Doom the entry: irreversible logical deletion.
    ///
    /// The entry disappears from lookup and enumeration immediately; this handle keeps reading
    /// until dropped. Dooming an already doomed entry is a no-op.
    pub async fn doom(&self) -> Result<()> {
        self.ops.doom().await
    }
}
