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

//! Trait seams for every downward/external collaborator this crate does not own. Each is
//! object-safe so the core can be driven by in-memory fakes in tests without a real
//! cluster; production wiring of the concrete implementations lives outside this crate.

use crate::cache::BlockLocationSource;
use crate::ids::{AttemptNumber, Epoch, ExecutorId, JobId, PartitionId, ShuffleId, StageId};
use crate::task::TaskSet;

/// The lower-level task scheduler that actually places tasks on workers. We only hand it
/// task sets and ask it to cancel/kill; placement and retries are its concern.
pub trait TaskScheduler: Send + Sync {
    fn submit_tasks(&self, task_set: TaskSet);
    fn cancel_tasks(&self, stage_id: StageId, interrupt_thread: bool);
    fn kill_all_task_attempts(&self, stage_id: StageId, interrupt_thread: bool, reason: &str);
    fn kill_task_attempt(&self, stage_id: StageId, partition: PartitionId, interrupt_thread: bool, reason: &str);
    /// Current cluster-wide concurrent task slot count, consulted for barrier-stage
    /// admission. Resource acquisition itself is this collaborator's concern; this is a
    /// read-only snapshot.
    fn max_concurrent_task_slots(&self) -> usize;
}

/// Per-shuffle map-output location metadata, persisted cluster-wide. This crate only
/// calls through this seam; the tracker implementation lives elsewhere.
pub trait MapOutputTracker: Send + Sync {
    fn register_shuffle(&self, shuffle_id: ShuffleId, num_maps: usize);
    fn register_map_output(&self, shuffle_id: ShuffleId, map_id: u64, executor: ExecutorId);
    fn unregister_map_output(&self, shuffle_id: ShuffleId, map_id: u64);
    fn unregister_all_map_output(&self, shuffle_id: ShuffleId);
    fn remove_outputs_on_host(&self, host: &str);
    fn remove_outputs_on_executor(&self, executor: ExecutorId);
    fn contains_shuffle(&self, shuffle_id: ShuffleId) -> bool;
    fn increment_epoch(&self);
    fn get_epoch(&self) -> Epoch;
}

/// Tracks cached dataset partition locations cluster-wide. Supertrait of
/// [`BlockLocationSource`] (which the Cache-Location Index consumes directly) plus the
/// mutation hooks the event loop drives on executor/worker loss.
pub trait BlockManagerMaster: BlockLocationSource {
    fn remove_executor(&self, executor: ExecutorId);
}

/// Coordinates output-commit races between speculative task attempts. The scheduler only
/// notifies it of stage/task lifecycle; the commit protocol itself is its concern.
pub trait CommitCoordinator: Send + Sync {
    fn stage_start(&self, stage_id: StageId, attempt: AttemptNumber);
    fn stage_end(&self, stage_id: StageId, attempt: AttemptNumber);
    fn task_completed(
        &self,
        stage_id: StageId,
        attempt: AttemptNumber,
        partition: PartitionId,
        task_attempt_number: AttemptNumber,
        successful: bool,
    );
}

/// Lifecycle notifications mirroring a job-event listener bus (`JobStart` / `JobEnd` /
/// `StageSubmitted` / … events). This is the in-process seam a caller or test plugs into;
/// a real telemetry sink is the embedding binary's concern.
#[derive(Clone, Debug)]
pub enum ListenerEvent {
    JobStart { job_id: JobId, call_site: String },
    JobEnd { job_id: JobId, success: bool, message: Option<String> },
    StageSubmitted { stage_id: StageId, attempt: AttemptNumber },
    StageCompleted { stage_id: StageId, attempt: AttemptNumber, failed: bool },
    TaskStart { stage_id: StageId, partition: PartitionId },
    TaskGettingResult { stage_id: StageId, partition: PartitionId },
    TaskEnd { stage_id: StageId, partition: PartitionId, success: bool },
    SpeculativeTaskSubmitted { stage_id: StageId, partition: PartitionId },
}

pub trait SchedulerListener: Send + Sync {
    fn on_event(&self, event: ListenerEvent);
}

/// Default no-op listener; production wiring of a real sink is the caller's concern.
#[derive(Default)]
pub struct NoopListener;

impl SchedulerListener for NoopListener {
    fn on_event(&self, _event: ListenerEvent) {}
}