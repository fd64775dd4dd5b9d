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

//! Public job-handle types returned from `submit_job` / `submit_map_stage` (§6).
//!
//! A [`JobWaiter<T>`] is a thin handle over a oneshot completion channel plus a clone of
//! the event-posting sender, so cancellation can be requested without blocking on the
//! event loop. The scheduler itself stores completion as a type-erased closure
//! ([`JobCompletion`]) so `ResultStage` jobs and `MapStage` jobs can share one
//! `HashMap<JobId, JobCompletion>` despite differing success payloads.

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::error::{SchedulerError, SchedulerResult};
use crate::event::SchedulerEvent;
use crate::ids::{ExecutorId, JobId};

/// Per-map-output statistics returned by a bare map-stage job, mirroring the upstream
/// `MapOutputStatistics` collaborator type closely enough for callers to reason about
/// shuffle output sizes without touching the map-output tracker directly.
#[derive(Clone, Debug, Default)]
pub struct MapOutputStatistics {
    pub shuffle_id: crate::ids::ShuffleId,
    pub bytes_by_partition: Vec<u64>,
}

/// The terminal outcome of a job, before it has been routed to the right typed waiter.
pub enum JobTerminal {
    ResultSuccess(Vec<Vec<u8>>),
    MapStageSuccess(MapOutputStatistics),
    Failure(SchedulerError),
}

pub(crate) type JobCompletion = Box<dyn FnOnce(JobTerminal) + Send>;

/// A handle to a submitted job: await its result, or request cancellation.
pub struct JobWaiter<T> {
    job_id: JobId,
    rx: oneshot::Receiver<SchedulerResult<T>>,
    event_tx: UnboundedSender<SchedulerEvent>,
}

impl<T> JobWaiter<T> {
    pub(crate) fn new(
        job_id: JobId,
        rx: oneshot::Receiver<SchedulerResult<T>>,
        event_tx: UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Self { job_id, rx, event_tx }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Waits for the job to finish, one way or another.
    pub async fn wait(self) -> SchedulerResult<T> {
        self.rx.await.unwrap_or(Err(SchedulerError::SchedulerStopped))
    }

    /// Requests cancellation; does not block. The job may still complete successfully if
    /// the cancellation loses the race with its last task.
    pub fn cancel(&self, reason: Option<String>) {
        let _ = self.event_tx.send(SchedulerEvent::JobCancelled {
            job_id: self.job_id,
            reason,
        });
    }
}

/// Convenience alias matching the executor-id type used in cluster-facing events, kept
/// here so downstream binaries importing `job::*` don't need a separate `ids` import for
/// the common case of constructing fake executors.
pub type Executor = ExecutorId;

/// Accumulates partial per-partition results into a running approximate value, mirroring
/// the upstream `ApproximateEvaluator`. The core scheduler has no streaming feed of
/// individual result payloads to a caller (results are delivered as a batch on job
/// completion, see [`JobTerminal::ResultSuccess`]); callers that want genuine partial
/// results merge them in as they observe task completions through their own
/// [`crate::collaborators::SchedulerListener`] implementation, and `run_approximate_job`
/// only arbitrates the race against the timeout and reads back whatever the evaluator has
/// accumulated so far.
pub trait ApproximateEvaluator<T>: Send {
    fn current_result(&self) -> T;
}