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

//! The disk-backed block-log engine.
//!
//! Entry content lives as self-framing records appended to shared block files; an atomically
//! replaced index snapshot plus sequence-ordered replay gives crash recovery. All mutating work
//! funnels through one worker task owned by the backend instance.

pub(crate) mod recover;
pub(crate) mod serde;
pub(crate) mod snapshot;
pub(crate) mod worker;

use self::worker::{BlockConfig, WorkerState};
use crate::{
    engine::{DiskEngine, WorkerClient, WorkerFactory},
    error::Result,
    runtime::Runtime,
};

/// Disk-backed engine over the block-log layout.
pub(crate) type BlockEngine = DiskEngine<BlockFactory>;

/// Construct the engine. Directory validation happens at init, together with recovery.
pub(crate) fn new_block_engine(config: BlockConfig, runtime: Runtime) -> BlockEngine {
    DiskEngine::new(BlockFactory { config }, runtime)
}

#[derive(Debug, Clone)]
pub(crate) struct BlockFactory {
    config: BlockConfig,
}

impl WorkerFactory for BlockFactory {
    type Worker = WorkerState;

    fn open(&self, client: WorkerClient) -> Result<Self::Worker> {
        WorkerState::open(self.config.clone(), client)
    }
}
