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

//! Completion handling: the state machine reacting to task success/failure, shuffle
//! registration, fetch-failure recovery, and stage/job termination.

use crate::collaborators::ListenerEvent;
use crate::event::SchedulerEvent;
use crate::ids::StageId;
use crate::job::JobTerminal;
use crate::scheduler::DagScheduler;
use crate::stage::StageKind;
use crate::task::{CompletionEvent, TaskEndReason, TaskKind};

impl DagScheduler {
    pub(crate) fn on_completion(&mut self, event: CompletionEvent) {
        let CompletionEvent {
            task,
            reason,
            executor,
            result,
            map_output_id,
            attempt_number,
        } = event;

        self.commit_coordinator.task_completed(
            task.stage_id,
            task.stage_attempt_id,
            task.partition,
            attempt_number,
            reason.is_success(),
        );

        if self.registry.stage(task.stage_id).is_none() {
            self.listener.on_event(ListenerEvent::TaskEnd {
                stage_id: task.stage_id,
                partition: task.partition,
                success: reason.is_success(),
            });
            return;
        }

        // Accumulator updates are driven by the closure-serialization/broadcast
        // collaborator, owned outside this crate; `reason.updates_accumulators()` records
        // which outcomes would feed them in a full implementation.
        let _ = reason.updates_accumulators();

        self.listener.on_event(ListenerEvent::TaskEnd {
            stage_id: task.stage_id,
            partition: task.partition,
            success: reason.is_success(),
        });

        if task.barrier && !reason.is_success() {
            self.handle_barrier_task_failure(task.stage_id, &reason);
            return;
        }

        match reason {
            TaskEndReason::Success => match task.kind {
                TaskKind::Result { output_id } => {
                    self.handle_result_success(task.stage_id, output_id, result.unwrap_or_default())
                }
                TaskKind::ShuffleMap => {
                    self.handle_shuffle_map_success(task.stage_id, task.partition, task.launch_epoch, executor, map_output_id)
                }
            },
            TaskEndReason::FetchFailed {
                executor: failed_exec,
                host,
                shuffle_id,
                map_id,
                message,
            } => self.handle_fetch_failed(task.stage_id, task.stage_attempt_id, failed_exec, host, shuffle_id, map_id, message),
            TaskEndReason::Resubmitted => {
                if let Some(stage) = self.registry.stage_mut(task.stage_id) {
                    if let StageKind::ShuffleMap {
                        pending_partitions, ..
                    } = &mut stage.kind
                    {
                        pending_partitions.insert(task.partition);
                    }
                }
            }
            TaskEndReason::ExceptionFailure { .. }
            | TaskEndReason::TaskKilled { .. }
            | TaskEndReason::TaskResultLost
            | TaskEndReason::TaskCommitDenied
            | TaskEndReason::ExecutorLostFailure { .. }
            | TaskEndReason::UnknownReason => {
                // The lower-level task scheduler owns retry policy for these outcomes;
                // no DAG-level state change.
            }
        }
    }

    fn handle_result_success(&mut self, stage_id: StageId, output_id: usize, result: Vec<u8>) {
        let Some(job_id) = self.registry.stage(stage_id).and_then(|s| match &s.kind {
            StageKind::Result { active_job, .. } => *active_job,
            _ => None,
        }) else {
            return;
        };
        let Some(job) = self.active_jobs.get_mut(&job_id) else {
            return;
        };
        if !job.mark_finished(output_id) {
            // Duplicate completion of an already-finished output index; ignored to keep
            // job completion exactly-once.
            return;
        }
        let is_done = job.is_done();

        // Results are accumulated per job rather than delivered one at a time to a
        // streaming listener, since this crate has no analogue of the upstream
        // `JobListener::taskSucceeded` streaming callback; the full vector is delivered
        // on `complete_job`.
        self.stash_result(job_id, output_id, result);

        if is_done {
            self.mark_stage_finished(stage_id);
            let results = self.take_results(job_id);
            self.complete_job(job_id, JobTerminal::ResultSuccess(results));
        }
    }

    fn stash_result(&mut self, job_id: crate::ids::JobId, output_id: usize, result: Vec<u8>) {
        let entry = self.pending_results.entry(job_id).or_default();
        if entry.len() <= output_id {
            entry.resize(output_id + 1, Vec::new());
        }
        entry[output_id] = result;
    }

    fn take_results(&mut self, job_id: crate::ids::JobId) -> Vec<Vec<u8>> {
        self.pending_results.remove(&job_id).unwrap_or_default()
    }

    fn handle_shuffle_map_success(
        &mut self,
        stage_id: StageId,
        partition: crate::ids::PartitionId,
        launch_epoch: crate::ids::Epoch,
        executor: crate::ids::ExecutorId,
        map_output_id: Option<u64>,
    ) {
        let Some(stage) = self.registry.stage_mut(stage_id) else {
            return;
        };
        let StageKind::ShuffleMap {
            shuffle_id,
            pending_partitions,
            ..
        } = &mut stage.kind
        else {
            return;
        };
        pending_partitions.remove(&partition);
        let shuffle_id = *shuffle_id;

        if self.epochs.is_stale(executor, launch_epoch) {
            tracing::warn!(%stage_id, partition, %executor, "discarding stale shuffle map output");
        } else {
            stage.register_partition(partition);
            if let Some(map_id) = map_output_id {
                self.map_output_tracker.register_map_output(shuffle_id, map_id, executor);
            }
        }

        let still_pending = match self.registry.stage(stage_id) {
            Some(s) => match &s.kind {
                StageKind::ShuffleMap {
                    pending_partitions, ..
                } => !pending_partitions.is_empty(),
                _ => false,
            },
            None => return,
        };
        let is_running = matches!(
            self.registry.stage(stage_id).map(|s| s.state),
            Some(crate::stage::StageState::Running)
        );

        if !still_pending && is_running {
            self.mark_stage_finished(stage_id);
            self.map_output_tracker.increment_epoch();
            self.cache.clear();

            let available = self.registry.stage(stage_id).map(|s| s.is_available()).unwrap_or(false);
            if !available {
                tracing::warn!(%stage_id, "some map outputs discarded as stale, resubmitting");
                self.submit_stage(stage_id);
            } else {
                self.after_shuffle_map_finished(stage_id);
            }
        }
    }

    fn handle_fetch_failed(
        &mut self,
        stage_id: StageId,
        stage_attempt_id: crate::ids::AttemptNumber,
        failed_executor: crate::ids::ExecutorId,
        host: String,
        shuffle_id: crate::ids::ShuffleId,
        map_id: u64,
        message: String,
    ) {
        let current_attempt = self.registry.stage(stage_id).and_then(|s| s.current_attempt_number());
        if current_attempt != Some(stage_attempt_id) {
            tracing::debug!(%stage_id, stage_attempt_id, "fetch failure from a prior stage attempt ignored");
            return;
        }

        let mut should_abort_stage = false;
        if let Some(stage) = self.registry.stage_mut(stage_id) {
            stage.failed_attempt_ids.insert(stage_attempt_id);
            if stage.failed_attempt_ids.len() as u32 >= self.config.max_consecutive_stage_attempts
                || self.config.disable_stage_retry_for_test
            {
                should_abort_stage = true;
            }
        }

        self.mark_stage_finished(stage_id);

        let Some(producer_stage_id) = self.registry.shuffle_map_stage_id(shuffle_id) else {
            if should_abort_stage {
                self.abort_stage(
                    stage_id,
                    &format!("reached maximum allowable number of times: {}", self.config.max_consecutive_stage_attempts),
                );
            }
            return;
        };
        let producer_is_barrier = self
            .registry
            .stage(producer_stage_id)
            .and_then(|s| self.graph.get(s.rdd))
            .map(|n| n.barrier)
            .unwrap_or(false);

        if producer_is_barrier {
            self.map_output_tracker.unregister_all_map_output(shuffle_id);
            if let Some(producer) = self.registry.stage_mut(producer_stage_id) {
                producer.unregister_all_partitions();
            }
        } else if self.config.unregister_output_on_host_on_fetch_failure {
            self.map_output_tracker.remove_outputs_on_host(&host);
            // The host may have served partitions for this shuffle beyond just `map_id`;
            // since the tracker doesn't report which ones, conservatively treat the whole
            // producer stage as needing recomputation rather than under-invalidating.
            if let Some(producer) = self.registry.stage_mut(producer_stage_id) {
                producer.unregister_all_partitions();
            }
        } else {
            self.map_output_tracker.unregister_map_output(shuffle_id, map_id);
            if let Some(producer) = self.registry.stage_mut(producer_stage_id) {
                producer.unregister_partition(map_id as crate::ids::PartitionId);
            }
        }

        let failed_stage_is_barrier_result = self
            .registry
            .stage(stage_id)
            .map(|s| matches!(s.kind, StageKind::Result { .. }))
            .unwrap_or(false)
            && self
                .registry
                .stage(stage_id)
                .and_then(|s| self.graph.get(s.rdd))
                .map(|n| n.barrier)
                .unwrap_or(false);
        if failed_stage_is_barrier_result {
            self.abort_stage(stage_id, "barrier result stage cannot roll back committed partitions");
            return;
        }

        if should_abort_stage {
            self.abort_stage(
                stage_id,
                &format!(
                    "{stage_id} reached the maximum allowable number of times: {} consecutive stage attempts",
                    self.config.max_consecutive_stage_attempts
                ),
            );
            return;
        }

        let first_to_enqueue = self.failed_stages.insert(stage_id);
        self.failed_stages.insert(producer_stage_id);

        if first_to_enqueue {
            let producer_determinism = self
                .registry
                .stage(producer_stage_id)
                .map(|s| s.determinism())
                .unwrap_or(crate::dataset::DeterminismLevel::Determinate);
            if matches!(producer_determinism, crate::dataset::DeterminismLevel::Indeterminate) {
                self.rollback_indeterminate_successors(producer_stage_id);
            }
            self.schedule_resubmit();
        }

        self.epochs.record_loss(failed_executor, self.map_output_tracker.get_epoch(), true);
        tracing::warn!(%stage_id, %shuffle_id, map_id, %host, message, "fetch failure, scheduling resubmission");
    }

    /// Indeterminate-output rollback: abort every successor of `producer_stage_id`
    /// reachable from an active job's final stage that has produced some, but not all, of
    /// its output — that partial output cannot be reproduced identically once the
    /// indeterminate producer is recomputed. We abort rather than attempt a partial
    /// rollback of the already-committed output.
    fn rollback_indeterminate_successors(&mut self, producer_stage_id: StageId) {
        let final_stages: Vec<StageId> = self.active_jobs.values().map(|j| j.final_stage).collect();
        let mut successors = std::collections::HashSet::new();
        for final_stage in final_stages {
            let mut lineage = self.registry.ancestors_of(final_stage);
            lineage.push(final_stage);
            if !lineage.contains(&producer_stage_id) {
                continue;
            }
            for candidate in lineage {
                if candidate != producer_stage_id && self.registry.ancestors_of(candidate).contains(&producer_stage_id) {
                    successors.insert(candidate);
                }
            }
        }
        let mut successors: Vec<StageId> = successors.into_iter().collect();
        successors.sort();

        for stage_id in successors {
            let has_partial_output = match self.registry.stage(stage_id) {
                Some(stage) => match &stage.kind {
                    StageKind::ShuffleMap { .. } => {
                        let missing = stage.num_missing_partitions();
                        missing > 0 && missing < stage.num_tasks
                    }
                    StageKind::Result { active_job, .. } => active_job
                        .and_then(|j| self.active_jobs.get(&j))
                        .map(|job| job.num_finished > 0 && job.num_finished < job.num_partitions)
                        .unwrap_or(false),
                },
                None => false,
            };
            if has_partial_output {
                self.abort_stage(
                    stage_id,
                    "indeterminate upstream output must be recomputed but this stage has already produced partial, unreproducible output",
                );
            }
        }
    }

    fn handle_barrier_task_failure(&mut self, stage_id: StageId, reason: &TaskEndReason) {
        let Some(stage) = self.registry.stage_mut(stage_id) else {
            return;
        };
        stage.state = crate::stage::StageState::Failed;
        let attempt = stage.current_attempt_number().unwrap_or(0);
        stage.failed_attempt_ids.insert(attempt);
        let exceeded = stage.failed_attempt_ids.len() as u32 >= self.config.max_consecutive_stage_attempts;
        let is_shuffle_map = stage.is_shuffle_map();
        let shuffle_id = stage.shuffle_id();
        let is_barrier_result = matches!(stage.kind, StageKind::Result { .. });

        self.task_scheduler.kill_all_task_attempts(
            stage_id,
            true,
            &format!("barrier stage task failed: {reason:?}"),
        );

        if is_shuffle_map {
            if let Some(sid) = shuffle_id {
                self.map_output_tracker.unregister_all_map_output(sid);
            }
        }

        if is_barrier_result || exceeded {
            self.abort_stage(stage_id, "barrier stage task failure");
            return;
        }

        self.failed_stages.insert(stage_id);
        self.schedule_resubmit();
    }

    pub(crate) fn on_resubmit_failed_stages(&mut self) {
        self.resubmit_scheduled.store(false, std::sync::atomic::Ordering::SeqCst);
        let mut stages: Vec<StageId> = self.failed_stages.drain().collect();
        stages.sort_by_key(|id| {
            self.registry
                .stage(*id)
                .map(|s| s.first_job_id)
                .unwrap_or(crate::ids::JobId(u64::MAX))
        });
        for stage_id in stages {
            if self.registry.stage(stage_id).is_some() {
                self.submit_stage(stage_id);
            }
        }
    }

    fn schedule_resubmit(&self) {
        if self
            .resubmit_scheduled
            .compare_exchange(false, true, std::sync::atomic::Ordering::SeqCst, std::sync::atomic::Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        crate::timer::schedule(
            self.event_tx.clone(),
            self.config.resubmit_timeout(),
            SchedulerEvent::ResubmitFailedStages,
        );
    }
}