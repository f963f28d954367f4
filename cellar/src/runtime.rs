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

use std::sync::Arc;

use cellar_common::runtime::{BackgroundShutdownRuntime, SingletonHandle};
use tokio::runtime::Handle;

use crate::error::Result;

/// How a disk backend obtains its worker execution context.
#[derive(Debug, Clone)]
pub enum RuntimeOptions {
    /// Run the worker on the calling runtime.
    Disabled,
    /// Run the worker on a dedicated runtime owned by the backend instance.
    Dedicated {
        /// Worker threads for the dedicated runtime. One is enough for the serialized worker.
        worker_threads: usize,
    },
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::Dedicated { worker_threads: 1 }
    }
}

#[derive(Debug)]
struct RuntimeInner {
    // Keeps the dedicated runtime alive for as long as any handle is around.
    _dedicated: Option<BackgroundShutdownRuntime>,

    worker_handle: SingletonHandle,
}

/// The worker execution context of one backend instance.
#[derive(Debug, Clone)]
pub(crate) struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn build(options: &RuntimeOptions) -> Result<Self> {
        let dedicated = match options {
            RuntimeOptions::Disabled => None,
            RuntimeOptions::Dedicated { worker_threads } => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads((*worker_threads).max(1))
                    .thread_name("cellar-worker")
                    .enable_all()
                    .build()?;
                Some(BackgroundShutdownRuntime::from(runtime))
            }
        };
        let worker_handle = dedicated
            .as_ref()
            .map(|rt| rt.handle().clone())
            .unwrap_or_else(Handle::current);
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                _dedicated: dedicated,
                worker_handle: worker_handle.into(),
            }),
        })
    }

    pub fn worker(&self) -> &SingletonHandle {
        &self.inner.worker_handle
    }
}
