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

//! Standalone integrity checker for on-disk cache directories.
//!
//! Validates structural consistency without an open backend: format markers, checksums, span
//! bounds, and cross-entry aliasing. Torn tails from an abrupt termination are fully rolled
//! back by design and reported as warnings, not failures; anything that leaves the state
//! ambiguous is [`Error::Corruption`]. The memory backend has no directory and is vacuously
//! consistent.

use std::{fs, path::Path};

use itertools::Itertools;

use crate::{
    engine::{block::recover, object::worker as object, LayoutKind, Preamble},
    error::{Error, Result},
};

/// Outcome of a successful check.
#[derive(Debug)]
pub struct CheckReport {
    /// Layout found in the directory.
    pub kind: LayoutKind,
    /// Live entries.
    pub entries: usize,
    /// Bytes those entries charge against the budget.
    pub total_size: u64,
    /// Non-fatal findings, e.g. rolled-back torn tails or unswept trash files.
    pub warnings: Vec<String>,
}

/// Validate the cache directory at `dir`.
///
/// Fails with [`Error::NotFound`] when no cache lives there and [`Error::Corruption`] on any
/// structural inconsistency.
pub fn check_dir(dir: impl AsRef<Path>) -> Result<CheckReport> {
    let dir = dir.as_ref();
    let Some(preamble) = Preamble::load(dir)? else {
        return Err(Error::NotFound);
    };
    match preamble.kind {
        LayoutKind::Block => check_block(dir),
        LayoutKind::Object => check_object(dir, preamble.dirty),
    }
}

fn check_block(dir: &Path) -> Result<CheckReport> {
    let rebuilt = recover::rebuild(dir)?.expect("preamble was readable");

    let mut warnings = Vec::new();
    if rebuilt.dirty {
        warnings.push(format!(
            "unclean shutdown; replayed {} records above the snapshot watermark",
            rebuilt.replayed
        ));
    }
    if rebuilt.torn_files > 0 {
        warnings.push(format!(
            "{} block file(s) had torn tails, rolled back",
            rebuilt.torn_files
        ));
    }

    // No two entries may reference overlapping bytes of a block file.
    let mut spans = rebuilt
        .entries
        .iter()
        .flat_map(|(id, entry)| entry.spans().map(move |span| (span.file, span.pos, span.len, *id)))
        .filter(|(_, _, len, _)| *len > 0)
        .collect_vec();
    spans.sort_unstable();
    for window in spans.windows(2) {
        let (file_a, pos_a, len_a, id_a) = window[0];
        let (file_b, pos_b, _, id_b) = window[1];
        if file_a == file_b && pos_a + len_a > pos_b && id_a != id_b {
            return Err(Error::corruption(format!(
                "entries {id_a} and {id_b} alias bytes of block file {file_a}"
            )));
        }
    }

    let entries = rebuilt.entries.len();
    let total_size = rebuilt.entries.values().map(|entry| entry.bytes()).sum();
    Ok(CheckReport {
        kind: LayoutKind::Block,
        entries,
        total_size,
        warnings,
    })
}

fn check_object(dir: &Path, dirty: bool) -> Result<CheckReport> {
    let mut warnings = Vec::new();
    if dirty {
        warnings.push("unclean shutdown".to_string());
    }

    let mut entries = 0usize;
    let mut total_size = 0u64;
    for dent in fs::read_dir(dir)? {
        let dent = dent?;
        let name = dent.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(object::TRASH_PREFIX) {
            warnings.push(format!("unswept trash file {name}"));
            continue;
        }
        if name.ends_with(".tmp") {
            warnings.push(format!("leftover temp file {name}"));
            continue;
        }
        let Some(hex) = name.strip_prefix(object::ENTRY_PREFIX) else {
            continue;
        };
        let Ok(id) = u64::from_str_radix(hex, 16) else {
            continue;
        };

        let (record_id, bytes) = object::inspect_entry_file(&dent.path())?;
        if record_id != id {
            return Err(Error::corruption(format!(
                "entry file {name} holds record for id {record_id}"
            )));
        }
        entries += 1;
        total_size += bytes;
    }

    Ok(CheckReport {
        kind: LayoutKind::Object,
        entries,
        total_size,
        warnings,
    })
}
