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

//! Contract tests run against every engine variant.

use std::path::Path;

use cellar::prelude::*;

const ALL_KINDS: [CacheKind; 3] = [CacheKind::Block, CacheKind::Memory, CacheKind::Object];

async fn open_cache(kind: CacheKind, dir: &Path, max_size: u64) -> Cache {
    CacheBuilder::new(kind)
        .with_dir(dir)
        .with_max_size(max_size)
        .with_deterministic_ids(true)
        .build()
        .await
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_stream_round_trip() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 1024 * 1024).await;

        let entry = cache.create_entry("greeting").await.unwrap();
        entry.write(0, 0, &b"hello world"[..], false).await.unwrap();
        entry.write(1, 0, &b"meta"[..], false).await.unwrap();

        assert_eq!(&entry.read(0, 0, 1024).await.unwrap()[..], b"hello world");
        assert_eq!(&entry.read(0, 6, 5).await.unwrap()[..], b"world");
        assert_eq!(&entry.read(1, 0, 1024).await.unwrap()[..], b"meta");
        assert!(entry.read(2, 0, 16).await.unwrap().is_empty());
        assert!(entry.read(0, 100, 16).await.unwrap().is_empty());
        drop(entry);

        let entry = cache.open_entry("greeting").await.unwrap().unwrap();
        assert_eq!(&entry.read(0, 0, 11).await.unwrap()[..], b"hello world");
        let stat = entry.stat().await.unwrap();
        assert_eq!(stat.stream_lens, [11, 4, 0]);
        assert_eq!(stat.bytes(), 15);
        drop(entry);

        assert_eq!(cache.entry_count().await.unwrap(), 1);
        assert_eq!(cache.current_size().await.unwrap(), 15);
        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_stream_truncate_and_overwrite() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 1024 * 1024).await;

        let entry = cache.create_entry("t").await.unwrap();
        entry.write(0, 0, &b"hello world"[..], false).await.unwrap();

        // Overwrite without truncate keeps the tail.
        entry.write(0, 0, &b"HELLO"[..], false).await.unwrap();
        assert_eq!(&entry.read(0, 0, 64).await.unwrap()[..], b"HELLO world");

        // Truncate discards everything past the write end.
        entry.write(0, 5, &b"!"[..], true).await.unwrap();
        assert_eq!(&entry.read(0, 0, 64).await.unwrap()[..], b"HELLO!");
        assert_eq!(entry.stat().await.unwrap().stream_lens[0], 6);

        // A gap past the end reads as zeroes.
        entry.write(0, 8, &b"xy"[..], false).await.unwrap();
        assert_eq!(&entry.read(0, 0, 64).await.unwrap()[..], b"HELLO!\0\0xy");

        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_sparse_round_trip() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 1024 * 1024).await;

        let entry = cache.create_entry("sparse").await.unwrap();
        entry.write_sparse(0, vec![1u8; 50]).await.unwrap();
        entry.write_sparse(100, vec![2u8; 50]).await.unwrap();

        let read = entry.read_sparse(0, 150).await.unwrap();
        assert_eq!(read.buf.len(), 150);
        assert_eq!(read.ranges, vec![0..50, 100..150]);
        assert_eq!(read.valid_bytes(), 100);
        assert_eq!(&read.buf[..50], &[1u8; 50][..]);
        assert_eq!(&read.buf[50..100], &[0u8; 50][..]);
        assert_eq!(&read.buf[100..150], &[2u8; 50][..]);

        // Reading only a hole is not an error and reports zero valid bytes.
        let hole = entry.read_sparse(60, 20).await.unwrap();
        assert!(hole.ranges.is_empty());
        assert_eq!(hole.valid_bytes(), 0);

        assert_eq!(entry.stat().await.unwrap().sparse_len, 100);
        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_create_collision_and_doom() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 1024 * 1024).await;

        let entry = cache.create_entry("a").await.unwrap();
        entry.write(0, 0, &b"old"[..], false).await.unwrap();

        // Creating over a live key fails.
        assert!(matches!(cache.create_entry("a").await, Err(Error::AlreadyExists)));

        // Dooming removes the key immediately, even with the handle still open.
        cache.doom_entry("a").await.unwrap();
        assert!(cache.open_entry("a").await.unwrap().is_none());
        assert_eq!(cache.entry_count().await.unwrap(), 0);
        assert_eq!(cache.current_size().await.unwrap(), 0);

        // The open handle still reads the doomed entry.
        assert_eq!(&entry.read(0, 0, 16).await.unwrap()[..], b"old");

        // Creating over the doomed key succeeds with fresh storage.
        let fresh = cache.create_entry("a").await.unwrap();
        fresh.write(0, 0, &b"new"[..], false).await.unwrap();
        assert_eq!(&fresh.read(0, 0, 16).await.unwrap()[..], b"new");
        assert_eq!(&entry.read(0, 0, 16).await.unwrap()[..], b"old");

        // Dooming a missing key reports the miss.
        assert!(matches!(cache.doom_entry("missing").await, Err(Error::NotFound)));

        drop(entry);
        drop(fresh);
        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_enumeration_skips_doomed() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 1024 * 1024).await;

        for key in ["k0", "k1", "k2"] {
            let entry = cache.create_entry(key).await.unwrap();
            entry.write(0, 0, &b"x"[..], false).await.unwrap();
        }
        cache.doom_entry("k1").await.unwrap();

        let mut keys = Vec::new();
        let mut iter = cache.iter();
        while let Some(entry) = iter.next_entry().await.unwrap() {
            keys.push(entry.key().to_vec());
        }
        keys.sort();
        assert_eq!(keys, vec![b"k0".to_vec(), b"k2".to_vec()]);

        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_doom_entries_between() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 1024 * 1024).await;

        let before = std::time::SystemTime::now();
        for key in ["old0", "old1"] {
            let entry = cache.create_entry(key).await.unwrap();
            entry.write(0, 0, &b"x"[..], false).await.unwrap();
        }
        cache.wait().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let cut = std::time::SystemTime::now();
        let entry = cache.create_entry("new0").await.unwrap();
        entry.write(0, 0, &b"x"[..], false).await.unwrap();
        drop(entry);

        // [before, cut) catches only the old entries.
        cache.doom_entries_between(before, cut).await.unwrap();
        assert!(cache.open_entry("old0").await.unwrap().is_none());
        assert!(cache.open_entry("old1").await.unwrap().is_none());
        assert!(cache.open_entry("new0").await.unwrap().is_some());

        // doom-since catches the rest.
        cache.doom_entries_since(before).await.unwrap();
        assert_eq!(cache.entry_count().await.unwrap(), 0);

        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_doom_all_entries() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 1024 * 1024).await;
        for i in 0..5 {
            let entry = cache.create_entry(format!("k{i}")).await.unwrap();
            entry.write(0, 0, vec![0u8; 10], false).await.unwrap();
        }
        cache.doom_all_entries().await.unwrap();
        assert_eq!(cache.entry_count().await.unwrap(), 0);
        assert_eq!(cache.current_size().await.unwrap(), 0);
        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_lru_eviction_keeps_budget() {
    // Scenario: budget 1000, twenty 100-byte entries with no intervening reads. The earliest
    // created entries go first and the budget holds once work settles.
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 1000).await;

        for i in 0..20 {
            let entry = cache.create_entry(format!("k{i:02}")).await.unwrap();
            entry.write(0, 0, vec![i as u8; 100], false).await.unwrap();
            drop(entry);
        }
        cache.wait().await;

        assert!(cache.entry_count().await.unwrap() <= 10);
        assert!(cache.current_size().await.unwrap() <= 1000);
        assert!(cache.open_entry("k00").await.unwrap().is_none());
        assert!(cache.open_entry("k19").await.unwrap().is_some());

        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_set_max_size_evicts_immediately() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 10_000).await;

        for i in 0..10 {
            let entry = cache.create_entry(format!("k{i}")).await.unwrap();
            entry.write(0, 0, vec![0u8; 100], false).await.unwrap();
            drop(entry);
        }
        assert_eq!(cache.entry_count().await.unwrap(), 10);

        cache.set_max_size(500).await.unwrap();
        cache.wait().await;
        assert!(cache.current_size().await.unwrap() <= 500);
        assert!(cache.entry_count().await.unwrap() <= 5);

        assert!(matches!(cache.set_max_size(0).await, Err(Error::Config(_))));

        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_segmented_policy_resists_scans() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheBuilder::new(kind)
            .with_dir(dir.path())
            .with_max_size(1000)
            .with_eviction(SegmentedConfig { protected_ratio: 0.5 })
            .build()
            .await
            .unwrap();

        for i in 0..10 {
            let entry = cache.create_entry(format!("k{i}")).await.unwrap();
            entry.write(0, 0, vec![0u8; 100], false).await.unwrap();
            drop(entry);
        }
        // Reopening records a reuse and promotes out of probation.
        drop(cache.open_entry("k0").await.unwrap().unwrap());
        drop(cache.open_entry("k1").await.unwrap().unwrap());

        // New entries push the cache over budget; victims come from probation.
        for i in 10..12 {
            let entry = cache.create_entry(format!("k{i}")).await.unwrap();
            entry.write(0, 0, vec![0u8; 100], false).await.unwrap();
            drop(entry);
        }
        cache.wait().await;

        assert!(cache.open_entry("k0").await.unwrap().is_some());
        assert!(cache.open_entry("k1").await.unwrap().is_some());
        assert!(cache.open_entry("k2").await.unwrap().is_none());
        assert!(cache.open_entry("k3").await.unwrap().is_none());

        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_eviction_skips_open_handles() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 300).await;

        let held = cache.create_entry("held").await.unwrap();
        held.write(0, 0, vec![0u8; 100], false).await.unwrap();

        for i in 0..4 {
            let entry = cache.create_entry(format!("k{i}")).await.unwrap();
            entry.write(0, 0, vec![0u8; 100], false).await.unwrap();
            drop(entry);
        }
        cache.wait().await;

        // The held entry survives even as the oldest; budget is restored from the others.
        assert!(cache.open_entry("held").await.unwrap().is_some());
        assert!(cache.current_size().await.unwrap() <= 300);

        drop(held);
        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_memory_cache_has_no_persistence() {
    let cache = CacheBuilder::new(CacheKind::Memory)
        .with_max_size(1024)
        .build()
        .await
        .unwrap();
    let entry = cache.create_entry("a").await.unwrap();
    entry.write(0, 0, &b"hello"[..], false).await.unwrap();
    drop(entry);
    cache.close().await.unwrap();

    let cache = CacheBuilder::new(CacheKind::Memory)
        .with_max_size(1024)
        .build()
        .await
        .unwrap();
    assert!(cache.open_entry("a").await.unwrap().is_none());
    assert_eq!(cache.entry_count().await.unwrap(), 0);
    cache.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_operations_after_close_fail() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 1024).await;
        cache.close().await.unwrap();

        assert!(matches!(cache.open_entry("a").await, Err(Error::Closed)));
        assert!(matches!(cache.create_entry("a").await, Err(Error::Closed)));
        assert!(matches!(cache.close().await, Err(Error::Closed)));
    }
}

#[test_log::test(tokio::test)]
async fn test_deterministic_ids() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(CacheKind::Block, dir.path(), 1024 * 1024).await;
    let a = cache.create_entry("a").await.unwrap();
    let b = cache.create_entry("b").await.unwrap();
    assert_eq!(a.id(), 1);
    assert_eq!(b.id(), 2);
    drop((a, b));
    cache.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_stream_index_out_of_range() {
    let cache = CacheBuilder::new(CacheKind::Memory)
        .with_max_size(1024)
        .build()
        .await
        .unwrap();
    let entry = cache.create_entry("a").await.unwrap();
    assert!(matches!(
        entry.write(STREAM_COUNT, 0, &b"x"[..], false).await,
        Err(Error::Misuse(_))
    ));
    drop(entry);
    cache.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_second_instance_is_rejected() {
    for kind in [CacheKind::Block, CacheKind::Object] {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(kind, dir.path(), 1024).await;

        let second = CacheBuilder::new(kind)
            .with_dir(dir.path())
            .with_max_size(1024)
            .build()
            .await;
        assert!(matches!(second, Err(Error::Misuse(_))));

        cache.close().await.unwrap();
    }
}
