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

//! Stage and job records: the mutable state the registry and event loop own.

use std::collections::HashSet;

use crate::dataset::DeterminismLevel;
use crate::ids::{DatasetId, JobId, PartitionId, ShuffleId, StageId};

/// Where a stage currently sits relative to the submission pipeline. Exactly one of these
/// holds at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    /// Not yet submitted, or waiting on parent stages to become available.
    Waiting,
    /// Has an active attempt with tasks outstanding.
    Running,
    /// Queued for resubmission after a recoverable failure.
    Failed,
    /// Neither waiting, running, nor queued for retry.
    None,
}

/// One execution attempt of a stage. `StageInfo` in the upstream system; kept minimal
/// here since most of its fields (metrics, accumulables) are telemetry the listener bus
/// owns, not scheduler state.
#[derive(Clone, Debug)]
pub struct StageAttempt {
    pub attempt_number: crate::ids::AttemptNumber,
    pub num_tasks: usize,
}

/// Stage-kind-specific data. A `ShuffleMapStage` produces materialized shuffle output
/// consumed by a later stage; a `ResultStage` is terminal and drives an [`ActiveJob`] to
/// completion.
#[derive(Debug)]
pub enum StageKind {
    ShuffleMap {
        shuffle_id: ShuffleId,
        /// Partitions of the current attempt whose output has not yet been registered.
        pending_partitions: HashSet<PartitionId>,
        /// Partitions with a currently-registered map output, persisted across attempts.
        /// A new attempt only recomputes `num_tasks - registered_partitions.len()`
        /// partitions, not the whole stage, unless the whole shuffle is unregistered.
        registered_partitions: HashSet<PartitionId>,
        /// Jobs that submitted this as a standalone map stage (via `submitMapStage`),
        /// distinct from `jobIds` which tracks every job needing this stage as an
        /// ancestor.
        map_stage_jobs: Vec<JobId>,
        determinism: DeterminismLevel,
    },
    Result {
        /// Partition indices of `rdd` this stage must compute, in job-submission order.
        partitions: Vec<PartitionId>,
        active_job: Option<JobId>,
    },
}

/// A unit of task-parallel work with no internal shuffle boundary.
#[derive(Debug)]
pub struct Stage {
    pub stage_id: StageId,
    pub rdd: DatasetId,
    pub parents: Vec<StageId>,
    pub first_job_id: JobId,
    pub num_tasks: usize,
    pub job_ids: HashSet<JobId>,
    pub failed_attempt_ids: HashSet<crate::ids::AttemptNumber>,
    pub attempts: Vec<StageAttempt>,
    pub state: StageState,
    pub kind: StageKind,
    /// Count of barrier-admission rejections due to insufficient concurrent task slots
    /// (§4.6b). Only meaningful for barrier stages; unused otherwise.
    pub barrier_admission_failures: u32,
}

impl Stage {
    pub fn new_shuffle_map(
        stage_id: StageId,
        rdd: DatasetId,
        parents: Vec<StageId>,
        first_job_id: JobId,
        num_tasks: usize,
        shuffle_id: ShuffleId,
        determinism: DeterminismLevel,
    ) -> Self {
        Self {
            stage_id,
            rdd,
            parents,
            first_job_id,
            num_tasks,
            job_ids: HashSet::new(),
            failed_attempt_ids: HashSet::new(),
            attempts: Vec::new(),
            state: StageState::None,
            kind: StageKind::ShuffleMap {
                shuffle_id,
                pending_partitions: HashSet::new(),
                registered_partitions: HashSet::new(),
                map_stage_jobs: Vec::new(),
                determinism,
            },
            barrier_admission_failures: 0,
        }
    }

    pub fn new_result(
        stage_id: StageId,
        rdd: DatasetId,
        parents: Vec<StageId>,
        first_job_id: JobId,
        partitions: Vec<PartitionId>,
    ) -> Self {
        let num_tasks = partitions.len();
        Self {
            stage_id,
            rdd,
            parents,
            first_job_id,
            num_tasks,
            job_ids: HashSet::new(),
            failed_attempt_ids: HashSet::new(),
            attempts: Vec::new(),
            state: StageState::None,
            kind: StageKind::Result {
                partitions,
                active_job: None,
            },
            barrier_admission_failures: 0,
        }
    }

    pub fn is_shuffle_map(&self) -> bool {
        matches!(self.kind, StageKind::ShuffleMap { .. })
    }

    pub fn shuffle_id(&self) -> Option<ShuffleId> {
        match &self.kind {
            StageKind::ShuffleMap { shuffle_id, .. } => Some(*shuffle_id),
            StageKind::Result { .. } => None,
        }
    }

    pub fn determinism(&self) -> DeterminismLevel {
        match &self.kind {
            StageKind::ShuffleMap { determinism, .. } => *determinism,
            StageKind::Result { .. } => DeterminismLevel::Determinate,
        }
    }

    pub fn current_attempt_number(&self) -> Option<crate::ids::AttemptNumber> {
        self.attempts.last().map(|a| a.attempt_number)
    }

    pub fn latest_attempt(&self) -> Option<&StageAttempt> {
        self.attempts.last()
    }

    pub fn start_new_attempt(&mut self, num_tasks: usize) -> crate::ids::AttemptNumber {
        let attempt_number = self.attempts.len() as crate::ids::AttemptNumber;
        self.attempts.push(StageAttempt {
            attempt_number,
            num_tasks,
        });
        attempt_number
    }

    /// True once every partition has a registered map output. Meaningless (always true)
    /// for a `ResultStage`.
    pub fn is_available(&self) -> bool {
        match &self.kind {
            StageKind::ShuffleMap {
                registered_partitions,
                ..
            } => registered_partitions.len() == self.num_tasks,
            StageKind::Result { .. } => true,
        }
    }

    /// Partitions still needing a successful map output: everything not already
    /// registered. Persists the "only recompute what's missing" behavior across attempts
    /// (§4.6, §8 scenario 2).
    pub fn missing_partitions(&self) -> Vec<PartitionId> {
        match &self.kind {
            StageKind::ShuffleMap {
                registered_partitions,
                ..
            } => (0..self.num_tasks)
                .filter(|p| !registered_partitions.contains(p))
                .collect(),
            StageKind::Result { .. } => Vec::new(),
        }
    }

    /// Missing-partition count for a `ShuffleMapStage`; the caller is responsible for the
    /// analogous computation against an `ActiveJob` for a `ResultStage`, since that state
    /// lives on the job rather than the stage.
    pub fn num_missing_partitions(&self) -> usize {
        match &self.kind {
            StageKind::ShuffleMap {
                registered_partitions,
                ..
            } => self.num_tasks - registered_partitions.len(),
            StageKind::Result { .. } => 0,
        }
    }

    /// Marks `partition`'s map output registered. Returns `false` if it was already
    /// registered (idempotent against duplicate/late completions).
    pub fn register_partition(&mut self, partition: PartitionId) -> bool {
        match &mut self.kind {
            StageKind::ShuffleMap {
                registered_partitions,
                ..
            } => registered_partitions.insert(partition),
            StageKind::Result { .. } => false,
        }
    }

    /// Unregisters a single partition's map output (a specific `mapId` lost).
    pub fn unregister_partition(&mut self, partition: PartitionId) {
        if let StageKind::ShuffleMap {
            registered_partitions,
            ..
        } = &mut self.kind
        {
            registered_partitions.remove(&partition);
        }
    }

    /// Unregisters every partition's map output (a whole shuffle, or a whole host, lost).
    pub fn unregister_all_partitions(&mut self) {
        if let StageKind::ShuffleMap {
            registered_partitions,
            ..
        } = &mut self.kind
        {
            registered_partitions.clear();
        }
    }
}

/// A user job driving a single `ResultStage` (or a bare map stage) to completion.
pub struct ActiveJob {
    pub job_id: JobId,
    pub final_stage: StageId,
    pub call_site: String,
    pub group_id: Option<String>,
    pub num_partitions: usize,
    pub finished: Vec<bool>,
    pub num_finished: usize,
}

impl ActiveJob {
    pub fn new(job_id: JobId, final_stage: StageId, call_site: String, num_partitions: usize) -> Self {
        Self {
            job_id,
            final_stage,
            call_site,
            group_id: None,
            num_partitions,
            finished: vec![false; num_partitions],
            num_finished: 0,
        }
    }

    pub fn with_group(mut self, group_id: Option<String>) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn is_done(&self) -> bool {
        self.num_finished == self.num_partitions
    }

    /// Marks `output_id` finished; returns `true` if this call was the one that made it
    /// finished (idempotent against duplicate completions, per §8's exactly-once property).
    pub fn mark_finished(&mut self, output_id: usize) -> bool {
        if let Some(slot) = self.finished.get_mut(output_id) {
            if !*slot {
                *slot = true;
                self.num_finished += 1;
                return true;
            }
        }
        false
    }
}
