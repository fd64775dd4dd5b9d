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

//! Stage Submission Engine (§4.6): selects runnable stages, builds task-sets with
//! per-partition preferred locations, hands them to the task scheduler.

use crate::collaborators::ListenerEvent;
use crate::dataset::{PersistenceLevel, TaskLocation};
use crate::ids::{DatasetId, PartitionId, StageId};
use crate::lineage;
use crate::scheduler::DagScheduler;
use crate::stage::StageKind;
use crate::task::{Task, TaskKind, TaskSet};

enum BarrierAdmission {
    Ok,
    /// Admission failed for a reason that may resolve itself (not enough concurrent task
    /// slots yet); worth retrying up to the configured failure budget.
    RetryableFailure(String),
    /// Admission failed for a reason that will never resolve itself; fail the job now.
    Fatal(String),
}

impl DagScheduler {
    /// `submitStage` (§4.6): resolve the earliest active job owning `stage_id`, recurse
    /// into missing parents, or hand off to `submit_missing_tasks` once runnable.
    pub(crate) fn submit_stage(&mut self, stage_id: StageId) {
        let job_id = match self.earliest_active_job_for(stage_id) {
            Some(id) => id,
            None => {
                self.abort_stage(stage_id, "no active job depends on this stage");
                return;
            }
        };

        match self.registry.stage(stage_id).map(|s| s.state) {
            Some(crate::stage::StageState::Waiting)
            | Some(crate::stage::StageState::Running)
            | Some(crate::stage::StageState::Failed) => return,
            None => return,
            Some(crate::stage::StageState::None) => {}
        }

        match self.check_barrier_admission(stage_id) {
            BarrierAdmission::Ok => {}
            BarrierAdmission::Fatal(reason) => {
                self.abort_stage(stage_id, &reason);
                return;
            }
            BarrierAdmission::RetryableFailure(reason) => {
                self.handle_barrier_admission_retry(stage_id, &reason);
                return;
            }
        }

        let mut missing = self.registry.missing_parent_stages(stage_id);
        missing.sort();
        if !missing.is_empty() {
            if let Some(stage) = self.registry.stage_mut(stage_id) {
                stage.state = crate::stage::StageState::Waiting;
            }
            for parent_id in missing {
                self.submit_stage(parent_id);
            }
            return;
        }

        self.submit_missing_tasks(stage_id, job_id);
    }

    fn earliest_active_job_for(&self, stage_id: StageId) -> Option<crate::ids::JobId> {
        self.registry
            .jobs_for_stage(stage_id)
            .into_iter()
            .filter(|j| self.active_jobs.contains_key(j))
            .min()
    }

    /// Barrier-stage admission checks (§4.6). Only scans the stage's own dataset and its
    /// in-stage narrow ancestors; does not descend past shuffle boundaries.
    fn check_barrier_admission(&self, stage_id: StageId) -> BarrierAdmission {
        let Some(stage) = self.registry.stage(stage_id) else {
            return BarrierAdmission::Ok;
        };
        let Some(rdd_node) = self.graph.get(stage.rdd) else {
            return BarrierAdmission::Ok;
        };
        if !rdd_node.barrier {
            return BarrierAdmission::Ok;
        }

        // (a) dynamic resource allocation makes the executor set unstable, incompatible
        // with gang-scheduling.
        if self.config.dynamic_resource_allocation_enabled {
            return BarrierAdmission::Fatal(format!(
                "barrier stage {stage_id} rejected: dynamic resource allocation is enabled"
            ));
        }

        // (b) not enough concurrent task slots cluster-wide yet; retryable.
        if stage.num_tasks > self.task_scheduler.max_concurrent_task_slots() {
            return BarrierAdmission::RetryableFailure(format!(
                "barrier stage {stage_id} needs {} concurrent slots, cluster currently offers fewer",
                stage.num_tasks
            ));
        }

        // (c) in-stage topology: every narrow ancestor must share the partition count,
        // and none may itself have >=2 barrier-shuffle parents.
        for dataset_id in lineage::datasets_within_stage(&self.graph, stage.rdd) {
            let Some(node) = self.graph.get(dataset_id) else { continue };
            if node.num_partitions != rdd_node.num_partitions {
                return BarrierAdmission::Fatal(format!(
                    "barrier stage {stage_id} has an in-stage ancestor dataset {dataset_id:?} with a differing partition count"
                ));
            }
            let barrier_shuffle_parents = node
                .dependencies
                .iter()
                .filter(|d| matches!(d, crate::dataset::Dependency::Shuffle { .. }))
                .filter(|d| {
                    self.graph
                        .get(d.parent())
                        .map(|p| p.barrier)
                        .unwrap_or(false)
                })
                .count();
            if barrier_shuffle_parents >= 2 {
                return BarrierAdmission::Fatal(format!(
                    "barrier stage {stage_id} has dataset {dataset_id:?} with >=2 barrier-shuffle parents"
                ));
            }
        }
        BarrierAdmission::Ok
    }

    fn handle_barrier_admission_retry(&mut self, stage_id: StageId, reason: &str) {
        let exceeded = match self.registry.stage_mut(stage_id) {
            Some(stage) => {
                stage.barrier_admission_failures += 1;
                stage.barrier_admission_failures >= self.config.barrier_max_concurrent_tasks_check_max_failures
            }
            None => return,
        };
        if exceeded {
            self.abort_stage(
                stage_id,
                &format!("barrier admission retries exhausted: {reason}"),
            );
            return;
        }
        tracing::warn!(%stage_id, reason, "barrier stage admission deferred, will retry");
        crate::timer::schedule(
            self.event_tx.clone(),
            self.config.barrier_max_concurrent_tasks_check_interval(),
            crate::event::SchedulerEvent::BarrierAdmissionRetry { stage_id },
        );
    }

    /// `submitMissingTasks` (§4.6): move to running, build tasks for missing partitions,
    /// hand off to the task scheduler.
    fn submit_missing_tasks(&mut self, stage_id: StageId, job_id: crate::ids::JobId) {
        let partitions_to_compute = self.partitions_to_compute(stage_id);

        let attempt_number = match self.registry.stage_mut(stage_id) {
            Some(stage) => {
                stage.state = crate::stage::StageState::Running;
                if let StageKind::ShuffleMap {
                    pending_partitions, ..
                } = &mut stage.kind
                {
                    pending_partitions.clear();
                    pending_partitions.extend(partitions_to_compute.iter().copied());
                }
                stage.start_new_attempt(partitions_to_compute.len())
            }
            None => return,
        };
        self.commit_coordinator.stage_start(stage_id, attempt_number);
        self.listener.on_event(ListenerEvent::StageSubmitted {
            stage_id,
            attempt: attempt_number,
        });
        tracing::info!(%stage_id, attempt_number, tasks = partitions_to_compute.len(), "stage running");

        if partitions_to_compute.is_empty() {
            self.mark_stage_finished_with_no_tasks(stage_id);
            return;
        }

        let rdd = match self.registry.stage(stage_id) {
            Some(s) => s.rdd,
            None => return,
        };
        let barrier = self.graph.get(rdd).map(|n| n.barrier).unwrap_or(false);
        let epoch = self.map_output_tracker.get_epoch();

        let mut tasks = Vec::with_capacity(partitions_to_compute.len());
        for partition in &partitions_to_compute {
            let locations = self.preferred_locations(rdd, *partition);
            let kind = match self.registry.stage(stage_id).map(|s| s.is_shuffle_map()) {
                Some(true) => TaskKind::ShuffleMap,
                _ => {
                    let output_id = self
                        .registry
                        .stage(stage_id)
                        .and_then(|s| match &s.kind {
                            StageKind::Result { partitions, .. } => {
                                partitions.iter().position(|p| p == partition)
                            }
                            _ => None,
                        })
                        .unwrap_or(*partition);
                    TaskKind::Result { output_id }
                }
            };
            tasks.push(Task {
                stage_id,
                stage_attempt_id: attempt_number,
                partition: *partition,
                preferred_locations: locations,
                launch_epoch: epoch,
                barrier,
                kind,
            });
        }

        let _ = job_id;
        self.task_scheduler.submit_tasks(TaskSet {
            stage_id,
            stage_attempt_id: attempt_number,
            tasks,
        });
    }

    fn mark_stage_finished_with_no_tasks(&mut self, stage_id: StageId) {
        self.mark_stage_finished(stage_id);
        self.after_shuffle_map_finished(stage_id);
    }

    fn partitions_to_compute(&self, stage_id: StageId) -> Vec<PartitionId> {
        let Some(stage) = self.registry.stage(stage_id) else {
            return Vec::new();
        };
        match &stage.kind {
            StageKind::ShuffleMap { .. } => stage.missing_partitions(),
            StageKind::Result {
                partitions,
                active_job,
            } => {
                let Some(job_id) = active_job else {
                    return partitions.clone();
                };
                let Some(job) = self.active_jobs.get(job_id) else {
                    return partitions.clone();
                };
                partitions
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !job.finished[*i])
                    .map(|(_, p)| *p)
                    .collect()
            }
        }
    }

    pub(crate) fn preferred_locations(&self, dataset_id: DatasetId, partition: PartitionId) -> Vec<TaskLocation> {
        let cache = &self.cache;
        let graph = &self.graph;
        let block_manager = self.block_manager.as_ref();
        lineage::preferred_locations(graph, dataset_id, partition, &|id: DatasetId, p: PartitionId| {
            let node = graph.get(id)?;
            let has_persistence = !matches!(node.persistence, PersistenceLevel::None);
            cache.get(id, p, node.num_partitions, has_persistence, block_manager)
        })
    }

    pub(crate) fn mark_stage_finished(&mut self, stage_id: StageId) {
        if let Some(stage) = self.registry.stage_mut(stage_id) {
            stage.state = crate::stage::StageState::None;
        }
        let attempt = self
            .registry
            .stage(stage_id)
            .and_then(|s| s.current_attempt_number())
            .unwrap_or(0);
        self.commit_coordinator.stage_end(stage_id, attempt);
        self.listener.on_event(ListenerEvent::StageCompleted {
            stage_id,
            attempt,
            failed: false,
        });
        tracing::info!(%stage_id, attempt, "stage finished");
    }

    /// Called after a `ShuffleMapStage` finishes (with tasks or without any at all) to
    /// submit any waiting children whose parents are now satisfied and to complete
    /// bare-map-stage jobs riding on it.
    pub(crate) fn after_shuffle_map_finished(&mut self, stage_id: StageId) {
        let Some(stage) = self.registry.stage(stage_id) else {
            return;
        };
        if !stage.is_shuffle_map() {
            return;
        }
        let shuffle_id = stage.shuffle_id();
        let map_stage_jobs = match &stage.kind {
            StageKind::ShuffleMap { map_stage_jobs, .. } => map_stage_jobs.clone(),
            _ => Vec::new(),
        };
        for job_id in map_stage_jobs {
            if let Some(sid) = shuffle_id {
                let stats = self.map_output_statistics(sid);
                self.complete_job(job_id, crate::job::JobTerminal::MapStageSuccess(stats));
            }
        }

        let waiting_children: Vec<StageId> = self
            .registry
            .all_stage_ids()
            .into_iter()
            .filter(|id| {
                self.registry
                    .stage(*id)
                    .map(|s| {
                        s.state == crate::stage::StageState::Waiting && s.parents.contains(&stage_id)
                    })
                    .unwrap_or(false)
            })
            .collect();
        for child in waiting_children {
            self.submit_stage(child);
        }
    }
}