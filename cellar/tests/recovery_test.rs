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

//! Crash-recovery and integrity-checker tests for the disk engines.
//!
//! The simulated abrupt termination is flush-then-discard: quiesce the submission queue with
//! `wait`, then drop every handle without an orderly close, then reopen the same directory.

use std::{path::Path, time::Duration};

use cellar::prelude::*;

const DISK_KINDS: [CacheKind; 2] = [CacheKind::Block, CacheKind::Object];

fn builder(kind: CacheKind, dir: &Path) -> CacheBuilder {
    CacheBuilder::new(kind)
        .with_dir(dir)
        .with_max_size(1024 * 1024)
        .with_deterministic_ids(true)
}

/// Reopen a directory whose previous owner was just dropped.
///
/// The dropped instance releases its advisory lock asynchronously while its worker winds down,
/// so a prompt reopen may briefly see the directory as locked.
async fn reopen(kind: CacheKind, dir: &Path) -> Cache {
    for _ in 0..100 {
        match builder(kind, dir).build().await {
            Ok(cache) => return cache,
            Err(Error::Misuse(_)) => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(e) => panic!("reopen failed: {e}"),
        }
    }
    panic!("cache directory stayed locked");
}

#[test_log::test(tokio::test)]
async fn test_reopen_after_clean_close() {
    // Scenario: create "a", write "hello", close, reopen the same directory, read it back.
    for kind in DISK_KINDS {
        let dir = tempfile::tempdir().unwrap();

        let cache = builder(kind, dir.path()).build().await.unwrap();
        let entry = cache.create_entry("a").await.unwrap();
        entry.write(0, 0, &b"hello"[..], false).await.unwrap();
        drop(entry);
        cache.close().await.unwrap();

        let report = check_dir(dir.path()).unwrap();
        assert_eq!(report.entries, 1);
        assert_eq!(report.total_size, 5);
        assert!(report.warnings.is_empty(), "unexpected warnings: {:?}", report.warnings);

        let cache = builder(kind, dir.path()).build().await.unwrap();
        let entry = cache.open_entry("a").await.unwrap().unwrap();
        assert_eq!(&entry.read(0, 0, 5).await.unwrap()[..], b"hello");
        drop(entry);
        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_crash_recovery_keeps_completed_writes() {
    for kind in DISK_KINDS {
        let dir = tempfile::tempdir().unwrap();

        let cache = builder(kind, dir.path()).build().await.unwrap();
        let entry = cache.create_entry("streams").await.unwrap();
        entry.write(0, 0, &b"hello"[..], false).await.unwrap();
        entry.write(1, 0, &b"meta"[..], false).await.unwrap();
        drop(entry);

        let entry = cache.create_entry("sparse").await.unwrap();
        entry.write_sparse(0, vec![7u8; 50]).await.unwrap();
        entry.write_sparse(100, vec![8u8; 50]).await.unwrap();
        drop(entry);

        let doomed = cache.create_entry("doomed").await.unwrap();
        doomed.write(0, 0, &b"gone"[..], false).await.unwrap();
        cache.doom_entry("doomed").await.unwrap();
        drop(doomed);

        // Flush to quiescence, then discard every reference without an orderly close.
        cache.wait().await;
        drop(cache);

        // The checker must pass before any further operation.
        let report = check_dir(dir.path()).unwrap();
        assert_eq!(report.entries, 2);

        let cache = reopen(kind, dir.path()).await;
        let entry = cache.open_entry("streams").await.unwrap().unwrap();
        assert_eq!(&entry.read(0, 0, 64).await.unwrap()[..], b"hello");
        assert_eq!(&entry.read(1, 0, 64).await.unwrap()[..], b"meta");
        drop(entry);

        let entry = cache.open_entry("sparse").await.unwrap().unwrap();
        let read = entry.read_sparse(0, 150).await.unwrap();
        assert_eq!(read.ranges, vec![0..50, 100..150]);
        assert_eq!(&read.buf[..50], &[7u8; 50][..]);
        assert_eq!(&read.buf[100..150], &[8u8; 50][..]);
        drop(entry);

        // The doom survived the crash too.
        assert!(cache.open_entry("doomed").await.unwrap().is_none());

        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_crash_recovery_after_overwrites() {
    for kind in DISK_KINDS {
        let dir = tempfile::tempdir().unwrap();

        let cache = builder(kind, dir.path()).build().await.unwrap();
        let entry = cache.create_entry("a").await.unwrap();
        entry.write(0, 0, &b"aaaaaaaaaa"[..], false).await.unwrap();
        entry.write(0, 3, &b"BBBB"[..], false).await.unwrap();
        entry.write(0, 8, &b"!"[..], true).await.unwrap();
        drop(entry);

        cache.wait().await;
        drop(cache);

        check_dir(dir.path()).unwrap();

        let cache = reopen(kind, dir.path()).await;
        let entry = cache.open_entry("a").await.unwrap().unwrap();
        assert_eq!(&entry.read(0, 0, 64).await.unwrap()[..], b"aaaBBBBa!");
        drop(entry);
        cache.close().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_torn_tail_is_rolled_back() {
    let dir = tempfile::tempdir().unwrap();

    let cache = builder(CacheKind::Block, dir.path()).build().await.unwrap();
    let entry = cache.create_entry("a").await.unwrap();
    entry.write(0, 0, &b"stable"[..], false).await.unwrap();
    drop(entry);
    cache.wait().await;
    drop(cache);

    // Simulate a write torn by the crash: garbage appended past the last committed record.
    let mut data_files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|dent| {
            let dent = dent.unwrap();
            let name = dent.file_name().to_str().unwrap().to_string();
            name.starts_with("data_").then_some(dent.path())
        })
        .collect();
    data_files.sort();
    let tail = data_files.last().unwrap();
    let mut contents = std::fs::read(tail).unwrap();
    contents.extend_from_slice(&[0xAB; 37]);
    std::fs::write(tail, &contents).unwrap();

    // The checker reports the rollback as a warning, not a failure.
    let report = check_dir(dir.path()).unwrap();
    assert_eq!(report.entries, 1);
    assert!(report.warnings.iter().any(|w| w.contains("torn")));

    let cache = reopen(CacheKind::Block, dir.path()).await;
    let entry = cache.open_entry("a").await.unwrap().unwrap();
    assert_eq!(&entry.read(0, 0, 64).await.unwrap()[..], b"stable");
    drop(entry);
    cache.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_corrupted_index_is_rebuilt_empty() {
    for kind in DISK_KINDS {
        let dir = tempfile::tempdir().unwrap();

        let cache = builder(kind, dir.path()).build().await.unwrap();
        let entry = cache.create_entry("a").await.unwrap();
        entry.write(0, 0, &b"hello"[..], false).await.unwrap();
        drop(entry);
        cache.close().await.unwrap();

        // Break the index format marker.
        let index = dir.path().join("index");
        let mut contents = std::fs::read(&index).unwrap();
        contents[0] ^= 0xff;
        std::fs::write(&index, &contents).unwrap();

        assert!(check_dir(dir.path()).is_err());

        // The builder discards the broken state and serves an empty cache.
        let cache = builder(kind, dir.path()).build().await.unwrap();
        assert_eq!(cache.entry_count().await.unwrap(), 0);
        assert!(cache.open_entry("a").await.unwrap().is_none());
        cache.close().await.unwrap();

        check_dir(dir.path()).unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_incompatible_layout_requires_force() {
    let dir = tempfile::tempdir().unwrap();

    let cache = builder(CacheKind::Block, dir.path()).build().await.unwrap();
    let entry = cache.create_entry("a").await.unwrap();
    entry.write(0, 0, &b"hello"[..], false).await.unwrap();
    drop(entry);
    cache.close().await.unwrap();

    // Opening the block directory as an object cache is a terminal failure without force.
    let incompatible = builder(CacheKind::Object, dir.path()).build().await;
    assert!(matches!(incompatible, Err(Error::Corruption { .. })));

    // With force, the old contents are destroyed and a fresh cache of the new kind comes up.
    let cache = builder(CacheKind::Object, dir.path())
        .with_force(true)
        .build()
        .await
        .unwrap();
    assert_eq!(cache.kind(), CacheKind::Object);
    assert_eq!(cache.entry_count().await.unwrap(), 0);
    cache.close().await.unwrap();

    let report = check_dir(dir.path()).unwrap();
    assert_eq!(report.kind, LayoutKind::Object);
}

#[test_log::test(tokio::test)]
async fn test_eviction_order_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let cache = builder(CacheKind::Block, dir.path()).build().await.unwrap();
    for i in 0..10 {
        let entry = cache.create_entry(format!("k{i}")).await.unwrap();
        entry.write(0, 0, vec![0u8; 100], false).await.unwrap();
        drop(entry);
    }
    // Refresh k0 so it is no longer the eviction head.
    drop(cache.open_entry("k0").await.unwrap().unwrap());
    cache.close().await.unwrap();

    let cache = builder(CacheKind::Block, dir.path()).build().await.unwrap();
    cache.set_max_size(500).await.unwrap();
    cache.wait().await;

    assert!(cache.open_entry("k0").await.unwrap().is_some());
    assert!(cache.open_entry("k1").await.unwrap().is_none());
    cache.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_checker_rejects_missing_directory_state() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(check_dir(dir.path()), Err(Error::NotFound)));
}

#[test_log::test(tokio::test)]
async fn test_object_construction_validates_path() {
    // Construction fails on an unusable path before any lock is taken or file is scanned;
    // the same path becomes buildable once the obstruction is gone.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache");
    std::fs::write(&path, b"in the way").unwrap();

    let blocked = builder(CacheKind::Object, &path).build().await;
    assert!(matches!(blocked, Err(Error::Config(_))));

    std::fs::remove_file(&path).unwrap();
    let cache = builder(CacheKind::Object, &path).build().await.unwrap();
    cache.close().await.unwrap();
}
