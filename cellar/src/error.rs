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

/// Error type returned by all cellar operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The entry does not exist or has been doomed.
    #[error("entry not found")]
    NotFound,
    /// A live entry with the same key already exists.
    #[error("entry already exists")]
    AlreadyExists,
    /// The on-disk state is structurally inconsistent.
    ///
    /// The cache at this path must be discarded and rebuilt; partial repair is never attempted.
    #[error("cache corrupted: {reason}")]
    Corruption {
        /// What failed to validate.
        reason: String,
    },
    /// An underlying read or write failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A configuration value was rejected.
    #[error("config error: {0}")]
    Config(String),
    /// An API contract violation, e.g. re-initializing a ready backend.
    ///
    /// Misuse is fatal in debug builds via `strict_assert!` at the call site.
    #[error("misuse: {0}")]
    Misuse(&'static str),
    /// The backend has been closed; pending and later operations are rejected.
    #[error("cache closed")]
    Closed,
    /// Any other error.
    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Helper for creating a [`Error::Corruption`] error.
    pub fn corruption(reason: impl Into<String>) -> Self {
        Self::Corruption { reason: reason.into() }
    }

    /// Helper for creating a [`Error::Config`] error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Helper for wrapping any error as [`Error::Other`].
    pub fn other(e: impl Into<anyhow::Error>) -> Self {
        Self::Other(e.into())
    }

    /// Returns `true` if the error is [`Error::Corruption`].
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result type for cellar.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Error>();
    }

    #[test]
    fn test_io_error_conversion() {
        let e: Error = std::io::Error::other("boom").into();
        assert!(matches!(e, Error::Io(_)));
    }
}
