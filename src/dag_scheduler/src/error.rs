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

//! Error taxonomy for the DAG scheduler core.
//!
//! Mirrors the shape used throughout this codebase's subsystem error modules: a small
//! closed enum of *kinds* rather than a single catch-all, with `anyhow::Error` reserved
//! for the handful of true collaborator boundaries (dataset `compute`, task closure
//! serialization) that cannot themselves be enumerated here.

use thiserror::Error;

use crate::ids::{DatasetId, StageId};

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("partition index {requested} out of range, dataset has {available} partitions")]
    InvalidPartition { requested: usize, available: usize },

    #[error("cannot submit a map stage for a dataset with no partitions")]
    EmptyMapStageDataset,

    #[error("barrier stage topology violation: {0}")]
    BarrierTopologyViolation(String),

    #[error("failed to compute dataset {dataset_id:?}")]
    DatasetComputeFailed {
        dataset_id: DatasetId,
        #[source]
        source: anyhow::Error,
    },

    #[error("task closure serialization failed: {0}")]
    ClosureSerializationFailed(String),

    #[error("stage {stage_id:?} aborted: {reason}")]
    StageAborted { stage_id: StageId, reason: String },

    #[error("scheduler has been shut down")]
    SchedulerStopped,

    #[error("job cancelled: {}", reason.as_deref().unwrap_or("no reason given"))]
    JobCancelled { reason: Option<String> },
}

impl SchedulerError {
    /// Whether the condition is purely informational (surfaced to a job listener) as
    /// opposed to a bug-shaped internal inconsistency. Used by the demo CLI to decide
    /// exit codes; the core itself never branches on this.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, SchedulerError::SchedulerStopped)
    }
}