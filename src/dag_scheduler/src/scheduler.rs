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

//! `DagScheduler`: the event loop and public API.
//!
//! All scheduler state (registry, cache index, epoch tracker, active jobs) is owned
//! exclusively by the task that drains `rx`; nothing outside this module ever touches it
//! directly. Callers interact through a cheap, cloneable [`DagSchedulerHandle`] that only
//! holds a sender and an atomic job-id counter — the same split `CompactionScheduler`
//! uses between the struct owning cluster state and the `CompactionRequestChannel`
//! producers post through.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cache::CacheLocationIndex;
use crate::collaborators::{
    BlockManagerMaster, CommitCoordinator, ListenerEvent, MapOutputTracker, SchedulerListener, TaskScheduler,
};
use crate::config::SchedulerConfig;
use crate::dataset::DatasetGraph;
use crate::epoch::FailureEpochTracker;
use crate::error::{SchedulerError, SchedulerResult};
use crate::event::{ExecutorLossReason, SchedulerEvent};
use crate::ids::{DatasetId, JobId, PartitionId, ShuffleId, StageId};
use crate::job::{JobCompletion, JobTerminal, JobWaiter, MapOutputStatistics};
use crate::stage::ActiveJob;

/// Everything the event loop needs to do its work. Constructed once at
/// [`DagScheduler::spawn`] time and never shared outside the consumer task.
pub struct DagScheduler {
    pub(crate) config: SchedulerConfig,
    pub(crate) graph: DatasetGraph,
    pub(crate) registry: crate::registry::StageRegistry,
    pub(crate) cache: CacheLocationIndex,
    pub(crate) epochs: FailureEpochTracker,
    pub(crate) active_jobs: HashMap<JobId, ActiveJob>,
    pub(crate) job_completions: HashMap<JobId, JobCompletion>,
    pub(crate) pending_results: HashMap<JobId, Vec<Vec<u8>>>,
    pub(crate) failed_stages: HashSet<StageId>,
    pub(crate) resubmit_scheduled: AtomicBool,
    pub(crate) task_scheduler: Arc<dyn TaskScheduler>,
    pub(crate) map_output_tracker: Arc<dyn MapOutputTracker>,
    pub(crate) block_manager: Arc<dyn BlockManagerMaster>,
    pub(crate) commit_coordinator: Arc<dyn CommitCoordinator>,
    pub(crate) listener: Arc<dyn SchedulerListener>,
    pub(crate) event_tx: UnboundedSender<SchedulerEvent>,
}

/// Cheap, cloneable handle callers use to submit jobs and post cluster events. Does not
/// itself own any scheduler state.
#[derive(Clone)]
pub struct DagSchedulerHandle {
    event_tx: UnboundedSender<SchedulerEvent>,
    next_job_id: Arc<AtomicU64>,
}

/// Dependencies the scheduler core needs from its downward collaborators.
pub struct SchedulerDeps {
    pub task_scheduler: Arc<dyn TaskScheduler>,
    pub map_output_tracker: Arc<dyn MapOutputTracker>,
    pub block_manager: Arc<dyn BlockManagerMaster>,
    pub commit_coordinator: Arc<dyn CommitCoordinator>,
    pub listener: Arc<dyn SchedulerListener>,
}

impl DagScheduler {
    /// Spawns the event loop as a dedicated tokio task and returns a handle to it.
    pub fn spawn(config: SchedulerConfig, deps: SchedulerDeps) -> (DagSchedulerHandle, JoinHandle<()>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let scheduler = DagScheduler {
            config,
            graph: DatasetGraph::new(),
            registry: crate::registry::StageRegistry::new(),
            cache: CacheLocationIndex::new(),
            epochs: FailureEpochTracker::new(),
            active_jobs: HashMap::new(),
            job_completions: HashMap::new(),
            pending_results: HashMap::new(),
            failed_stages: HashSet::new(),
            resubmit_scheduled: AtomicBool::new(false),
            task_scheduler: deps.task_scheduler,
            map_output_tracker: deps.map_output_tracker,
            block_manager: deps.block_manager,
            commit_coordinator: deps.commit_coordinator,
            listener: deps.listener,
            event_tx: event_tx.clone(),
        };
        let handle = DagSchedulerHandle {
            event_tx,
            next_job_id: Arc::new(AtomicU64::new(0)),
        };
        let join = tokio::spawn(scheduler.run(event_rx));
        (handle, join)
    }

    async fn run(mut self, mut rx: UnboundedReceiver<SchedulerEvent>) {
        tracing::info!("dag scheduler event loop started");
        while let Some(event) = rx.recv().await {
            tracing::debug!(event = %event, "dispatching scheduler event");
            self.handle_event(event);
        }
        self.clean_up_after_scheduler_stop();
        tracing::info!("dag scheduler event loop stopped");
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::JobSubmitted {
                job_id,
                graph,
                rdd,
                partitions,
                call_site,
                group_id,
                completion,
            } => self.on_job_submitted(job_id, graph, rdd, partitions, call_site, group_id, completion),
            SchedulerEvent::MapStageSubmitted {
                job_id,
                graph,
                shuffle_id,
                producer,
                call_site,
                group_id,
                completion,
            } => self.on_map_stage_submitted(job_id, graph, shuffle_id, producer, call_site, group_id, completion),
            SchedulerEvent::StageCancelled { stage_id, reason } => self.on_stage_cancelled(stage_id, reason),
            SchedulerEvent::JobCancelled { job_id, reason } => {
                self.fail_job(job_id, reason.unwrap_or_else(|| "job cancelled".to_string()))
            }
            SchedulerEvent::JobGroupCancelled { group_id } => self.on_job_group_cancelled(group_id),
            SchedulerEvent::AllJobsCancelled => self.on_all_jobs_cancelled(),
            SchedulerEvent::ExecutorAdded { executor } => {
                self.epochs.clear_executor(executor);
            }
            SchedulerEvent::ExecutorLost {
                executor,
                host,
                reason,
                external_shuffle_service,
                epoch,
            } => self.on_executor_lost(executor, host, reason, external_shuffle_service, epoch),
            SchedulerEvent::WorkerRemoved { host } => {
                self.map_output_tracker.remove_outputs_on_host(&host);
                self.cache.clear();
            }
            SchedulerEvent::BeginEvent { stage_id, partition } => {
                self.listener.on_event(ListenerEvent::TaskStart { stage_id, partition });
            }
            SchedulerEvent::GettingResultEvent { stage_id, partition } => {
                self.listener
                    .on_event(ListenerEvent::TaskGettingResult { stage_id, partition });
            }
            SchedulerEvent::SpeculativeTaskSubmitted { stage_id, partition } => {
                self.listener
                    .on_event(ListenerEvent::SpeculativeTaskSubmitted { stage_id, partition });
            }
            SchedulerEvent::Completion(event) => self.on_completion(*event),
            SchedulerEvent::TaskSetFailed { stage_id, reason } => {
                self.abort_stage(stage_id, &reason);
            }
            SchedulerEvent::ResubmitFailedStages => self.on_resubmit_failed_stages(),
            SchedulerEvent::BarrierAdmissionRetry { stage_id } => {
                if self.registry.stage(stage_id).is_some() {
                    self.submit_stage(stage_id);
                }
            }
            SchedulerEvent::KillTaskAttempt {
                stage_id,
                partition,
                interrupt_thread,
                reason,
            } => {
                self.task_scheduler
                    .kill_task_attempt(stage_id, partition, interrupt_thread, &reason);
            }
        }
    }

    fn on_job_submitted(
        &mut self,
        job_id: JobId,
        graph: DatasetGraph,
        rdd: DatasetId,
        partitions: Vec<PartitionId>,
        call_site: String,
        group_id: Option<String>,
        completion: JobCompletion,
    ) {
        self.graph.merge(graph);
        self.job_completions.insert(job_id, completion);
        self.cache.clear();

        let stage_id = match self.registry.create_result_stage(&self.graph, rdd, partitions, job_id) {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(%job_id, error = %err, "result stage construction failed");
                self.complete_job(job_id, JobTerminal::Failure(err));
                return;
            }
        };

        for (new_shuffle_id, num_maps) in self.registry.drain_newly_created_shuffles() {
            self.map_output_tracker.register_shuffle(new_shuffle_id, num_maps);
        }

        self.registry.update_job_id_stage_id_maps(job_id, stage_id);
        let num_partitions = match self.registry.stage(stage_id) {
            Some(stage) => stage.num_tasks,
            None => 0,
        };
        let active_job = ActiveJob::new(job_id, stage_id, call_site.clone(), num_partitions).with_group(group_id);
        if let Some(stage) = self.registry.stage_mut(stage_id) {
            if let crate::stage::StageKind::Result { active_job: slot, .. } = &mut stage.kind {
                *slot = Some(job_id);
            }
        }
        self.active_jobs.insert(job_id, active_job);

        tracing::info!(%job_id, %stage_id, %call_site, "job submitted");
        self.listener.on_event(ListenerEvent::JobStart { job_id, call_site });
        self.submit_stage(stage_id);
    }

    fn on_map_stage_submitted(
        &mut self,
        job_id: JobId,
        graph: DatasetGraph,
        shuffle_id: ShuffleId,
        producer: DatasetId,
        call_site: String,
        group_id: Option<String>,
        completion: JobCompletion,
    ) {
        self.graph.merge(graph);
        self.job_completions.insert(job_id, completion);
        self.cache.clear();

        let stage_id =
            match self.registry.get_or_create_shuffle_map_stage(&self.graph, shuffle_id, producer, job_id) {
            Ok(id) => id,
            Err(err) => {
                self.complete_job(job_id, JobTerminal::Failure(err));
                return;
            }
        };
        for (new_shuffle_id, num_maps) in self.registry.drain_newly_created_shuffles() {
            self.map_output_tracker.register_shuffle(new_shuffle_id, num_maps);
        }

        self.registry.update_job_id_stage_id_maps(job_id, stage_id);
        if let Some(stage) = self.registry.stage_mut(stage_id) {
            if let crate::stage::StageKind::ShuffleMap { map_stage_jobs, .. } = &mut stage.kind {
                map_stage_jobs.push(job_id);
            }
        }

        let already_available = self.registry.stage(stage_id).map(|s| s.is_available()).unwrap_or(false);
        self.listener.on_event(ListenerEvent::JobStart {
            job_id,
            call_site: call_site.clone(),
        });
        if already_available {
            tracing::info!(%job_id, %stage_id, "map stage already available, finishing job immediately");
            let stats = self.map_output_statistics(shuffle_id);
            self.complete_job(job_id, JobTerminal::MapStageSuccess(stats));
            return;
        }
        let _ = group_id;
        self.submit_stage(stage_id);
    }

    fn map_output_statistics(&self, shuffle_id: ShuffleId) -> MapOutputStatistics {
        // The real statistics (bytes per reduce partition) live in the map-output
        // tracker, which this crate does not own; we surface the shuffle id
        // so callers can look them up there.
        MapOutputStatistics {
            shuffle_id,
            bytes_by_partition: Vec::new(),
        }
    }

    pub(crate) fn complete_job(&mut self, job_id: JobId, terminal: JobTerminal) {
        self.active_jobs.remove(&job_id);
        self.pending_results.remove(&job_id);
        let removed_stages = self.registry.cleanup_for_job(job_id);
        for stage_id in removed_stages {
            self.failed_stages.remove(&stage_id);
        }
        let (success, message) = match &terminal {
            JobTerminal::ResultSuccess(_) | JobTerminal::MapStageSuccess(_) => (true, None),
            JobTerminal::Failure(err) => (false, Some(err.to_string())),
        };
        if success {
            tracing::info!(%job_id, "job succeeded");
        } else {
            tracing::warn!(%job_id, message = message.as_deref().unwrap_or(""), "job failed");
        }
        self.listener.on_event(ListenerEvent::JobEnd {
            job_id,
            success,
            message,
        });
        if let Some(completion) = self.job_completions.remove(&job_id) {
            completion(terminal);
        }
    }

    pub(crate) fn fail_job(&mut self, job_id: JobId, reason: String) {
        if !self.active_jobs.contains_key(&job_id) {
            return;
        }
        self.task_scheduler.cancel_tasks(
            self.active_jobs
                .get(&job_id)
                .map(|j| j.final_stage)
                .unwrap_or(StageId(0)),
            true,
        );
        self.complete_job(job_id, JobTerminal::Failure(SchedulerError::JobCancelled { reason: Some(reason) }));
    }

    fn on_stage_cancelled(&mut self, stage_id: StageId, reason: Option<String>) {
        let jobs = self.registry.jobs_for_stage(stage_id);
        let reason = reason.unwrap_or_else(|| format!("stage {stage_id} cancelled"));
        for job_id in jobs {
            self.fail_job(job_id, reason.clone());
        }
    }

    fn on_job_group_cancelled(&mut self, group_id: String) {
        let ids: Vec<JobId> = self
            .active_jobs
            .values()
            .filter(|j| j.group_id.as_deref() == Some(group_id.as_str()))
            .map(|j| j.job_id)
            .collect();
        for job_id in ids {
            self.fail_job(job_id, format!("part of cancelled job group {group_id}"));
        }
    }

    fn on_all_jobs_cancelled(&mut self) {
        let ids: Vec<JobId> = self.active_jobs.keys().copied().collect();
        for job_id in ids {
            self.fail_job(job_id, "all jobs cancelled".to_string());
        }
    }

    fn on_executor_lost(
        &mut self,
        executor: crate::ids::ExecutorId,
        host: String,
        reason: ExecutorLossReason,
        external_shuffle_service: bool,
        epoch: crate::ids::Epoch,
    ) {
        // A bare "executor lost" under an external shuffle service does not imply
        // the shuffle files are gone; only a worker-level loss (or no shuffle service)
        // does.
        let file_lost = matches!(reason, ExecutorLossReason::WorkerLost) || !external_shuffle_service;
        let advanced = self.epochs.record_loss(executor, epoch, file_lost);
        if !advanced {
            tracing::debug!(%executor, epoch, "stale executor-lost event ignored");
            return;
        }
        tracing::warn!(%executor, %host, file_lost, "executor lost");
        if file_lost {
            self.map_output_tracker.remove_outputs_on_executor(executor);
        }
        self.block_manager.remove_executor(executor);
        self.cache.clear();
    }

    fn clean_up_after_scheduler_stop(&mut self) {
        let ids: Vec<JobId> = self.active_jobs.keys().copied().collect();
        for job_id in ids {
            self.complete_job(
                job_id,
                JobTerminal::Failure(SchedulerError::SchedulerStopped),
            );
        }
    }

    pub(crate) fn abort_stage(&mut self, stage_id: StageId, reason: &str) {
        tracing::error!(%stage_id, reason, "aborting stage");
        let jobs = self.registry.jobs_for_stage(stage_id);
        self.task_scheduler.cancel_tasks(stage_id, true);
        self.listener.on_event(ListenerEvent::StageCompleted {
            stage_id,
            attempt: self
                .registry
                .stage(stage_id)
                .and_then(|s| s.current_attempt_number())
                .unwrap_or(0),
            failed: true,
        });
        for job_id in jobs {
            self.fail_job(job_id, format!("stage {stage_id} aborted: {reason}"));
        }
    }
}

impl DagSchedulerHandle {
    fn alloc_job_id(&self) -> JobId {
        JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Submits a job computing `partitions` of `rdd`. Fails fast (before posting any
    /// event) if a requested partition index is out of range.
    pub fn submit_job(
        &self,
        graph: DatasetGraph,
        rdd: DatasetId,
        num_dataset_partitions: usize,
        partitions: Vec<PartitionId>,
        call_site: impl Into<String>,
        group_id: Option<String>,
    ) -> SchedulerResult<JobWaiter<Vec<Vec<u8>>>> {
        for p in &partitions {
            if *p >= num_dataset_partitions {
                return Err(SchedulerError::InvalidPartition {
                    requested: *p,
                    available: num_dataset_partitions,
                });
            }
        }
        let job_id = self.alloc_job_id();
        let (tx, rx) = oneshot::channel();
        let num_partitions = partitions.len();
        let completion: JobCompletion = Box::new(move |terminal| {
            let result = match terminal {
                JobTerminal::ResultSuccess(results) => Ok(results),
                JobTerminal::Failure(err) => Err(err),
                JobTerminal::MapStageSuccess(_) => unreachable!("result job completed as a map stage"),
            };
            let _ = tx.send(result);
        });
        let _ = num_partitions;
        self.event_tx
            .send(SchedulerEvent::JobSubmitted {
                job_id,
                graph,
                rdd,
                partitions,
                call_site: call_site.into(),
                group_id,
                completion,
            })
            .map_err(|_| SchedulerError::SchedulerStopped)?;
        Ok(JobWaiter::new(job_id, rx, self.event_tx.clone()))
    }

    /// Submits a bare map-stage job: runs only the stage producing `shuffle_id`'s output.
    pub fn submit_map_stage(
        &self,
        graph: DatasetGraph,
        shuffle_id: ShuffleId,
        producer: DatasetId,
        call_site: impl Into<String>,
        group_id: Option<String>,
    ) -> SchedulerResult<JobWaiter<MapOutputStatistics>> {
        let num_partitions = graph.get(producer).map(|n| n.num_partitions).unwrap_or(0);
        if num_partitions == 0 {
            return Err(SchedulerError::EmptyMapStageDataset);
        }
        let job_id = self.alloc_job_id();
        let (tx, rx) = oneshot::channel();
        let completion: JobCompletion = Box::new(move |terminal| {
            let result = match terminal {
                JobTerminal::MapStageSuccess(stats) => Ok(stats),
                JobTerminal::Failure(err) => Err(err),
                JobTerminal::ResultSuccess(_) => unreachable!("map stage job completed as a result job"),
            };
            let _ = tx.send(result);
        });
        self.event_tx
            .send(SchedulerEvent::MapStageSubmitted {
                job_id,
                graph,
                shuffle_id,
                producer,
                call_site: call_site.into(),
                group_id,
                completion,
            })
            .map_err(|_| SchedulerError::SchedulerStopped)?;
        Ok(JobWaiter::new(job_id, rx, self.event_tx.clone()))
    }

    pub fn cancel_job(&self, job_id: JobId, reason: Option<String>) {
        let _ = self.event_tx.send(SchedulerEvent::JobCancelled { job_id, reason });
    }

    pub fn cancel_job_group(&self, group_id: impl Into<String>) {
        let _ = self.event_tx.send(SchedulerEvent::JobGroupCancelled {
            group_id: group_id.into(),
        });
    }

    pub fn cancel_all_jobs(&self) {
        let _ = self.event_tx.send(SchedulerEvent::AllJobsCancelled);
    }

    pub fn cancel_stage(&self, stage_id: StageId, reason: Option<String>) {
        let _ = self.event_tx.send(SchedulerEvent::StageCancelled { stage_id, reason });
    }

    pub fn kill_task_attempt(&self, stage_id: StageId, partition: PartitionId, interrupt_thread: bool, reason: impl Into<String>) {
        let _ = self.event_tx.send(SchedulerEvent::KillTaskAttempt {
            stage_id,
            partition,
            interrupt_thread,
            reason: reason.into(),
        });
    }

    pub fn post(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// `runJob`: submits the job and blocks until it completes, logging the job id and
    /// elapsed wall time either way. Callers get the error back via the normal `Result`
    /// path rather than a caller-stack-trace-annotated rethrow, since that annotation is
    /// a JVM-specific concern `?` already subsumes in Rust.
    pub async fn run_job(
        &self,
        graph: DatasetGraph,
        rdd: DatasetId,
        num_dataset_partitions: usize,
        partitions: Vec<PartitionId>,
        call_site: impl Into<String>,
    ) -> SchedulerResult<Vec<Vec<u8>>> {
        let call_site = call_site.into();
        let start = std::time::Instant::now();
        let waiter = self.submit_job(graph, rdd, num_dataset_partitions, partitions, call_site.clone(), None)?;
        let job_id = waiter.job_id();
        let result = waiter.wait().await;
        let elapsed = start.elapsed();
        match &result {
            Ok(_) => tracing::info!(%job_id, %call_site, ?elapsed, "job finished"),
            Err(err) => tracing::error!(%job_id, %call_site, ?elapsed, error = %err, "job failed"),
        }
        result
    }

    /// `runApproximateJob`: races [`Self::run_job`] against `timeout`. On timeout, returns
    /// `evaluator.current_result()` rather than the job's eventual output; the job itself
    /// keeps running to completion in the background (cancel it explicitly via the
    /// returned job id if that is not wanted).
    pub async fn run_approximate_job<T>(
        &self,
        graph: DatasetGraph,
        rdd: DatasetId,
        num_dataset_partitions: usize,
        partitions: Vec<PartitionId>,
        call_site: impl Into<String>,
        evaluator: &dyn crate::job::ApproximateEvaluator<T>,
        timeout: std::time::Duration,
    ) -> SchedulerResult<T> {
        let call_site = call_site.into();
        match tokio::time::timeout(
            timeout,
            self.run_job(graph, rdd, num_dataset_partitions, partitions, call_site.clone()),
        )
        .await
        {
            Ok(result) => result.map(|_| evaluator.current_result()),
            Err(_) => {
                tracing::warn!(%call_site, ?timeout, "approximate job timed out, returning partial result");
                Ok(evaluator.current_result())
            }
        }
    }
}