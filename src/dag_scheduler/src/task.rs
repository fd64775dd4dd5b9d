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

//! Task objects and completion-reason taxonomy (§4.6 step 5, §4.7).
//!
//! Tasks themselves are not executed here — the task scheduler collaborator does that —
//! this module only defines what a task carries and how its outcome is reported back.

use crate::dataset::TaskLocation;
use crate::ids::{AttemptNumber, Epoch, ExecutorId, PartitionId, StageId};

/// Stage-kind-specific task payload.
#[derive(Clone, Debug)]
pub enum TaskKind {
    ShuffleMap,
    Result { output_id: usize },
}

/// One unit of work handed to the task scheduler.
#[derive(Clone, Debug)]
pub struct Task {
    pub stage_id: StageId,
    pub stage_attempt_id: AttemptNumber,
    pub partition: PartitionId,
    pub preferred_locations: Vec<TaskLocation>,
    pub launch_epoch: Epoch,
    pub barrier: bool,
    pub kind: TaskKind,
}

/// A batch of tasks for one stage attempt, submitted to the task scheduler together.
#[derive(Clone, Debug)]
pub struct TaskSet {
    pub stage_id: StageId,
    pub stage_attempt_id: AttemptNumber,
    pub tasks: Vec<Task>,
}

/// Why a task completed. Named after the reasons the Completion Handler (§4.7)
/// dispatches on.
#[derive(Clone, Debug)]
pub enum TaskEndReason {
    Success,
    /// The task could not fetch shuffle input from `bm_address` (host of `executor`).
    FetchFailed {
        executor: ExecutorId,
        host: String,
        shuffle_id: crate::ids::ShuffleId,
        map_id: u64,
        message: String,
    },
    ExceptionFailure {
        message: String,
    },
    TaskKilled {
        reason: String,
    },
    Resubmitted,
    TaskResultLost,
    TaskCommitDenied,
    ExecutorLostFailure {
        executor: ExecutorId,
    },
    UnknownReason,
}

impl TaskEndReason {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskEndReason::Success)
    }

    /// Reasons that update driver-side accumulators, per §4.7's bullet list.
    pub fn updates_accumulators(&self) -> bool {
        matches!(
            self,
            TaskEndReason::Success | TaskEndReason::ExceptionFailure { .. } | TaskEndReason::TaskKilled { .. }
        )
    }
}

/// A completed task's full report, as posted into a [`crate::event::SchedulerEvent::Completion`].
#[derive(Clone, Debug)]
pub struct CompletionEvent {
    pub task: Task,
    pub reason: TaskEndReason,
    pub executor: ExecutorId,
    /// Serialized per-partition result, present on `Success` of a `ResultTask`.
    pub result: Option<Vec<u8>>,
    /// Map output handle, present on `Success` of a `ShuffleMapTask`.
    pub map_output_id: Option<u64>,
    /// Which physical attempt of `task.partition` this report is for. Retries and
    /// speculative relaunches of the same logical task within one stage attempt are the
    /// task scheduler's concern (it owns placement and retries), so it is the one that
    /// stamps this; `task.stage_attempt_id` only counts stage-level resubmissions and
    /// would alias every relaunch within an attempt onto the same number.
    pub attempt_number: AttemptNumber,
}