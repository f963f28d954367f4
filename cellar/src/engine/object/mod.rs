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

//! The alternate-layout engine: one file per entry.
//!
//! Construction and init are deliberately two phases: [`ObjectEngine::new`] validates the
//! directory path and can fail (and be retried) independently of the asynchronous init, which
//! locks and scans the directory.

pub(crate) mod worker;

use self::worker::{ObjectConfig, ObjectWorker};
use crate::{
    engine::{DiskEngine, WorkerClient, WorkerFactory},
    error::{Error, Result},
    runtime::Runtime,
};

/// File-per-entry engine over the object layout.
pub(crate) type ObjectEngine = DiskEngine<ObjectFactory>;

#[derive(Debug, Clone)]
pub(crate) struct ObjectFactory {
    config: ObjectConfig,
}

/// Construct the engine, validating the target path.
///
/// Path problems (the target exists but is not a directory, or cannot be created) fail here,
/// before any lock is taken or any file is scanned; storage-format failures surface later from
/// init.
pub(crate) fn new_object_engine(config: ObjectConfig, runtime: Runtime) -> Result<ObjectEngine> {
    if config.dir.exists() && !config.dir.is_dir() {
        return Err(Error::config(format!(
            "object cache path is not a directory: {}",
            config.dir.display()
        )));
    }
    std::fs::create_dir_all(&config.dir)?;
    Ok(DiskEngine::new(ObjectFactory { config }, runtime))
}

impl WorkerFactory for ObjectFactory {
    type Worker = ObjectWorker;

    fn open(&self, client: WorkerClient) -> Result<Self::Worker> {
        ObjectWorker::open(self.config.clone(), client)
    }
}
