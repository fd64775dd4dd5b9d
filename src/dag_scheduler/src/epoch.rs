// Copyright 2024 RisingWave Labs
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

//! Failure Epoch Tracker (§4.4): two monotone epoch maps gating late cluster events.

use std::collections::HashMap;

use crate::ids::{Epoch, ExecutorId};

#[derive(Default)]
pub struct FailureEpochTracker {
    executor_failure_epoch: HashMap<ExecutorId, Epoch>,
    shuffle_file_lost_epoch: HashMap<ExecutorId, Epoch>,
}

impl FailureEpochTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executor_failure_epoch(&self, executor: ExecutorId) -> Epoch {
        self.executor_failure_epoch.get(&executor).copied().unwrap_or(0)
    }

    pub fn shuffle_file_lost_epoch(&self, executor: ExecutorId) -> Epoch {
        self.shuffle_file_lost_epoch.get(&executor).copied().unwrap_or(0)
    }

    /// Records a loss of `executor` at `epoch`. `file_lost` additionally bumps
    /// `shuffle_file_lost_epoch` — callers pass `false` for an "executor lost" signal
    /// under an external shuffle service, deferring file unregistration until a fetch
    /// failure actually proves the data gone (§4.4).
    ///
    /// Returns `true` if this call advanced the executor-failure epoch (i.e. was not a
    /// stale replay).
    pub fn record_loss(&mut self, executor: ExecutorId, epoch: Epoch, file_lost: bool) -> bool {
        let advanced = {
            let entry = self.executor_failure_epoch.entry(executor).or_insert(0);
            if *entry < epoch {
                *entry = epoch;
                true
            } else {
                false
            }
        };
        if file_lost {
            let entry = self.shuffle_file_lost_epoch.entry(executor).or_insert(0);
            if *entry < epoch {
                *entry = epoch;
            }
        }
        advanced
    }

    /// Clears tracked epochs for `executor` on an `ExecutorAdded` event, so a
    /// subsequently re-added executor starts fresh.
    pub fn clear_executor(&mut self, executor: ExecutorId) {
        self.executor_failure_epoch.remove(&executor);
        self.shuffle_file_lost_epoch.remove(&executor);
    }

    /// Whether a task launched at `task_epoch` on `executor` should be treated as lost
    /// regardless of its reported outcome, because the executor's stored failure epoch
    /// has since caught up or passed it.
    pub fn is_stale(&self, executor: ExecutorId, task_epoch: Epoch) -> bool {
        self.executor_failure_epoch(executor) >= task_epoch
    }
}
