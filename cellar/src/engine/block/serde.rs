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

use std::hash::Hasher;

use bytes::{Buf, BufMut};
use twox_hash::XxHash64;

use crate::{
    entry::EntryId,
    error::{Error, Result},
    extent::Chunk,
};

const RECORD_MAGIC: u32 = 0xCE11_A200;
const RECORD_MAGIC_MASK: u32 = 0xFFFF_FF00;

pub type Sequence = u64;

#[derive(Debug)]
pub struct Checksummer;

impl Checksummer {
    pub fn checksum64(buf: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(buf);
        hasher.finish()
    }

    /// Checksum of `a` followed by `b` without concatenating.
    pub fn checksum64_pair(a: &[u8], b: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(a);
        hasher.write(b);
        hasher.finish()
    }
}

/// A span of payload bytes inside a block file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) struct Span {
    pub file: u32,
    pub pos: u64,
    pub len: u64,
}

impl Chunk for Span {
    fn chunk_len(&self) -> u64 {
        self.len
    }

    fn chunk_split(&self, at: u64) -> (Self, Self) {
        (
            Self {
                file: self.file,
                pos: self.pos,
                len: at,
            },
            Self {
                file: self.file,
                pos: self.pos + at,
                len: self.len - at,
            },
        )
    }
}

/// What a block-file record does when replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    /// New entry; the record carries the key as its tail.
    Create = 1,
    /// Stream write; the record carries the payload.
    Write = 2,
    /// Sparse write; the record carries the payload.
    WriteSparse = 3,
    /// Tombstone.
    Doom = 4,
}

impl TryFrom<u8> for RecordKind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Create),
            2 => Ok(Self::Write),
            3 => Ok(Self::WriteSparse),
            4 => Ok(Self::Doom),
            _ => Err(Error::corruption(format!("unknown record kind: {v}"))),
        }
    }
}

/// Fixed-size head of every block-file record.
///
/// The record body is `key (key_len bytes) | payload (payload_len bytes)`; the checksum covers
/// the body. A record whose magic or checksum fails to validate is a torn tail and is rolled
/// back on recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub kind: RecordKind,
    pub sequence: Sequence,
    pub id: EntryId,
    /// Stream index for `Write` records, 0 otherwise.
    pub stream: u8,
    /// Truncate flag for `Write` records.
    pub truncate: bool,
    /// Target offset for `Write`/`WriteSparse` records.
    pub offset: u64,
    /// Wall-clock nanoseconds, used to restore entry timestamps on replay.
    pub time: u64,
    pub key_len: u32,
    pub payload_len: u32,
    pub checksum: u64,
}

impl RecordHeader {
    /// | magic+kind 4B | stream 1B | truncate 1B | pad 2B | sequence 8B | id 8B | offset 8B |
    /// | time 8B | key_len 4B | payload_len 4B | checksum 8B |
    pub const fn serialized_len() -> usize {
        4 + 1 + 1 + 2 + 8 + 8 + 8 + 8 + 4 + 4 + 8
    }

    pub fn write(&self, mut buf: impl BufMut) {
        buf.put_u32(RECORD_MAGIC | self.kind as u32);
        buf.put_u8(self.stream);
        buf.put_u8(self.truncate as u8);
        buf.put_u16(0);
        buf.put_u64(self.sequence);
        buf.put_u64(self.id);
        buf.put_u64(self.offset);
        buf.put_u64(self.time);
        buf.put_u32(self.key_len);
        buf.put_u32(self.payload_len);
        buf.put_u64(self.checksum);
    }

    pub fn read(mut buf: impl Buf) -> Result<Self> {
        let v = buf.get_u32();
        let magic = v & RECORD_MAGIC_MASK;
        if magic != RECORD_MAGIC {
            return Err(Error::corruption(format!(
                "record magic mismatch, expected: {RECORD_MAGIC:#x}, got: {magic:#x}"
            )));
        }
        let kind = RecordKind::try_from(v as u8)?;
        let stream = buf.get_u8();
        let truncate = buf.get_u8() != 0;
        buf.get_u16();
        let sequence = buf.get_u64();
        let id = buf.get_u64();
        let offset = buf.get_u64();
        let time = buf.get_u64();
        let key_len = buf.get_u32();
        let payload_len = buf.get_u32();
        let checksum = buf.get_u64();
        Ok(Self {
            kind,
            sequence,
            id,
            stream,
            truncate,
            offset,
            time,
            key_len,
            payload_len,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header_round_trip() {
        let header = RecordHeader {
            kind: RecordKind::Write,
            sequence: 42,
            id: 7,
            stream: 2,
            truncate: true,
            offset: 4096,
            time: 123_456_789,
            key_len: 3,
            payload_len: 100,
            checksum: 0xdead_beef,
        };
        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(buf.len(), RecordHeader::serialized_len());
        assert_eq!(RecordHeader::read(&buf[..]).unwrap(), header);
    }

    #[test]
    fn test_record_header_rejects_bad_magic() {
        let header = RecordHeader {
            kind: RecordKind::Doom,
            sequence: 1,
            id: 1,
            stream: 0,
            truncate: false,
            offset: 0,
            time: 0,
            key_len: 0,
            payload_len: 0,
            checksum: 0,
        };
        let mut buf = Vec::new();
        header.write(&mut buf);
        buf[1] ^= 0x01;
        assert!(RecordHeader::read(&buf[..]).unwrap_err().is_corruption());
    }

    #[test]
    fn test_span_split() {
        let span = Span {
            file: 1,
            pos: 100,
            len: 10,
        };
        let (left, right) = span.chunk_split(4);
        assert_eq!(left, Span {
            file: 1,
            pos: 100,
            len: 4
        });
        assert_eq!(right, Span {
            file: 1,
            pos: 104,
            len: 6
        });
    }
}
