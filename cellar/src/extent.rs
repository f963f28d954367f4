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

use std::{collections::BTreeMap, ops::Range};

use bytes::Bytes;

/// A contiguous piece of stored bytes that can be split at a byte boundary.
///
/// The extent map never inspects chunk contents; it only needs lengths and splits. The memory
/// engine stores [`Bytes`] chunks, the block engine stores spans pointing into block files.
pub(crate) trait Chunk: Clone {
    /// Length of the chunk in bytes.
    fn chunk_len(&self) -> u64;

    /// Split into the parts before and from `at`.
    ///
    /// `at` must be in `1..chunk_len()`.
    fn chunk_split(&self, at: u64) -> (Self, Self);
}

impl Chunk for Bytes {
    fn chunk_len(&self) -> u64 {
        self.len() as u64
    }

    fn chunk_split(&self, at: u64) -> (Self, Self) {
        let mut right = self.clone();
        let left = right.split_to(at as usize);
        (left, right)
    }
}

/// Disjoint extents over a sparse 64-bit byte address space.
///
/// Used for entry stream layouts, sparse regions, and the block engine's on-disk span tables.
/// Extents never overlap; a newly inserted extent supersedes overlapped bytes and the displaced
/// pieces are handed back to the caller for space accounting.
#[derive(Debug, Clone)]
pub(crate) struct ExtentMap<T> {
    map: BTreeMap<u64, T>,
}

impl<T> Default for ExtentMap<T> {
    fn default() -> Self {
        Self { map: BTreeMap::new() }
    }
}

impl<T> ExtentMap<T>
where
    T: Chunk,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes covered by all extents.
    pub fn total(&self) -> u64 {
        self.map.values().map(Chunk::chunk_len).sum()
    }

    /// Insert a chunk at `offset`, superseding any overlapped bytes.
    ///
    /// Returns the displaced pieces.
    pub fn insert(&mut self, offset: u64, chunk: T) -> Vec<T> {
        let len = chunk.chunk_len();
        if len == 0 {
            return Vec::new();
        }
        let end = offset + len;

        let mut starts: Vec<u64> = self.map.range(offset..end).map(|(start, _)| *start).collect();
        if let Some((&start, existing)) = self.map.range(..offset).next_back() {
            if start + existing.chunk_len() > offset {
                starts.insert(0, start);
            }
        }

        let mut displaced = Vec::with_capacity(starts.len());
        for start in starts {
            let existing = self.map.remove(&start).unwrap();
            let existing_end = start + existing.chunk_len();

            let rest = if start < offset {
                let (left, rest) = existing.chunk_split(offset - start);
                self.map.insert(start, left);
                rest
            } else {
                existing
            };
            let rest_start = start.max(offset);

            let mid = if existing_end > end {
                let (mid, right) = rest.chunk_split(end - rest_start);
                self.map.insert(end, right);
                mid
            } else {
                rest
            };
            displaced.push(mid);
        }

        self.map.insert(offset, chunk);
        displaced
    }

    /// Drop every byte at or beyond `at`, splitting a straddling extent.
    ///
    /// Returns the removed pieces.
    pub fn truncate(&mut self, at: u64) -> Vec<T> {
        let starts: Vec<u64> = self.map.range(at..).map(|(start, _)| *start).collect();
        let mut removed: Vec<T> = starts
            .into_iter()
            .map(|start| self.map.remove(&start).unwrap())
            .collect();
        if let Some((&start, existing)) = self.map.range(..at).next_back() {
            if start + existing.chunk_len() > at {
                let existing = self.map.remove(&start).unwrap();
                let (left, right) = existing.chunk_split(at - start);
                self.map.insert(start, left);
                removed.push(right);
            }
        }
        removed
    }

    /// The pieces covering `[offset, offset + len)`, clipped to the requested range,
    /// in ascending offset order.
    pub fn slices(&self, offset: u64, len: u64) -> Vec<(u64, T)> {
        if len == 0 {
            return Vec::new();
        }
        let end = offset + len;

        let mut starts: Vec<u64> = self.map.range(offset..end).map(|(start, _)| *start).collect();
        if let Some((&start, existing)) = self.map.range(..offset).next_back() {
            if start + existing.chunk_len() > offset {
                starts.insert(0, start);
            }
        }

        starts
            .into_iter()
            .map(|start| {
                let chunk = self.map.get(&start).unwrap();
                let chunk_end = start + chunk.chunk_len();
                let clip_start = start.max(offset);
                let clip_end = chunk_end.min(end);

                let mut piece = chunk.clone();
                if clip_start > start {
                    piece = piece.chunk_split(clip_start - start).1;
                }
                if chunk_end > clip_end {
                    piece = piece.chunk_split(clip_end - clip_start).0;
                }
                (clip_start, piece)
            })
            .collect()
    }

    /// The covered sub-ranges of `[offset, offset + len)`, with adjacent extents coalesced.
    pub fn ranges(&self, offset: u64, len: u64) -> Vec<Range<u64>> {
        let mut ranges: Vec<Range<u64>> = Vec::new();
        for (start, piece) in self.slices(offset, len) {
            let end = start + piece.chunk_len();
            match ranges.last_mut() {
                Some(last) if last.end == start => last.end = end,
                _ => ranges.push(start..end),
            }
        }
        ranges
    }

    /// Iterate all extents in ascending offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.map.iter().map(|(offset, chunk)| (*offset, chunk))
    }
}

impl ExtentMap<Bytes> {
    /// Assemble `[offset, offset + len)` into one buffer, zero-filling uncovered gaps.
    pub fn assemble(&self, offset: u64, len: usize) -> Bytes {
        let mut out = vec![0u8; len];
        for (start, piece) in self.slices(offset, len as u64) {
            let at = (start - offset) as usize;
            out[at..at + piece.len()].copy_from_slice(&piece);
        }
        out.into()
    }
}

/// Apply one stream write to a stream's extent map and length table.
///
/// With `truncate`, the stream length becomes the write end and trailing extents are dropped;
/// otherwise the stream only grows. Returns the displaced pieces for space accounting.
pub(crate) fn apply_stream_write<T: Chunk, const N: usize>(
    streams: &mut [ExtentMap<T>; N],
    lens: &mut [u64; N],
    stream: usize,
    offset: u64,
    chunk: T,
    truncate: bool,
) -> Vec<T> {
    let map = &mut streams[stream];
    let end = offset + chunk.chunk_len();
    let mut displaced = map.insert(offset, chunk);
    if truncate {
        displaced.extend(map.truncate(end));
        lens[stream] = end;
    } else {
        lens[stream] = lens[stream].max(end);
    }
    displaced
}
