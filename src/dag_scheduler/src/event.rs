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

//! Event Loop wire type (§4.5): the single enum every external caller and internal timer
//! posts onto the scheduler's unbounded channel. All scheduler state mutation happens in
//! response to one of these, dispatched one at a time by the consumer task in
//! [`crate::scheduler`].

use crate::dataset::DatasetGraph;
use crate::ids::{DatasetId, ExecutorId, JobId, PartitionId};
use crate::job::JobCompletion;
use crate::task::CompletionEvent;

/// Why an executor or worker was lost, as reported by the cluster manager collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutorLossReason {
    /// The executor process died but the worker/host may still be reachable (e.g. an
    /// external shuffle service can still serve its files).
    ExecutorLost,
    /// The whole worker/host is gone; shuffle files on it are certainly gone too.
    WorkerLost,
}

pub enum SchedulerEvent {
    JobSubmitted {
        job_id: JobId,
        graph: DatasetGraph,
        rdd: DatasetId,
        partitions: Vec<PartitionId>,
        call_site: String,
        group_id: Option<String>,
        completion: JobCompletion,
    },
    MapStageSubmitted {
        job_id: JobId,
        graph: DatasetGraph,
        shuffle_id: crate::ids::ShuffleId,
        producer: DatasetId,
        call_site: String,
        group_id: Option<String>,
        completion: JobCompletion,
    },
    StageCancelled {
        stage_id: crate::ids::StageId,
        reason: Option<String>,
    },
    JobCancelled {
        job_id: JobId,
        reason: Option<String>,
    },
    JobGroupCancelled {
        group_id: String,
    },
    AllJobsCancelled,
    ExecutorAdded {
        executor: ExecutorId,
    },
    ExecutorLost {
        executor: ExecutorId,
        host: String,
        reason: ExecutorLossReason,
        external_shuffle_service: bool,
        epoch: crate::ids::Epoch,
    },
    WorkerRemoved {
        host: String,
    },
    BeginEvent {
        stage_id: crate::ids::StageId,
        partition: PartitionId,
    },
    GettingResultEvent {
        stage_id: crate::ids::StageId,
        partition: PartitionId,
    },
    SpeculativeTaskSubmitted {
        stage_id: crate::ids::StageId,
        partition: PartitionId,
    },
    Completion(Box<CompletionEvent>),
    TaskSetFailed {
        stage_id: crate::ids::StageId,
        reason: String,
    },
    ResubmitFailedStages,
    BarrierAdmissionRetry {
        stage_id: crate::ids::StageId,
    },
    KillTaskAttempt {
        stage_id: crate::ids::StageId,
        partition: PartitionId,
        interrupt_thread: bool,
        reason: String,
    },
}

impl std::fmt::Debug for SchedulerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::fmt::Display for SchedulerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SchedulerEvent::JobSubmitted { .. } => "JobSubmitted",
            SchedulerEvent::MapStageSubmitted { .. } => "MapStageSubmitted",
            SchedulerEvent::StageCancelled { .. } => "StageCancelled",
            SchedulerEvent::JobCancelled { .. } => "JobCancelled",
            SchedulerEvent::JobGroupCancelled { .. } => "JobGroupCancelled",
            SchedulerEvent::AllJobsCancelled => "AllJobsCancelled",
            SchedulerEvent::ExecutorAdded { .. } => "ExecutorAdded",
            SchedulerEvent::ExecutorLost { .. } => "ExecutorLost",
            SchedulerEvent::WorkerRemoved { .. } => "WorkerRemoved",
            SchedulerEvent::BeginEvent { .. } => "BeginEvent",
            SchedulerEvent::GettingResultEvent { .. } => "GettingResultEvent",
            SchedulerEvent::SpeculativeTaskSubmitted { .. } => "SpeculativeTaskSubmitted",
            SchedulerEvent::Completion(_) => "CompletionEvent",
            SchedulerEvent::TaskSetFailed { .. } => "TaskSetFailed",
            SchedulerEvent::ResubmitFailedStages => "ResubmitFailedStages",
            SchedulerEvent::BarrierAdmissionRetry { .. } => "BarrierAdmissionRetry",
            SchedulerEvent::KillTaskAttempt { .. } => "KillTaskAttempt",
        };
        write!(f, "{name}")
    }
}