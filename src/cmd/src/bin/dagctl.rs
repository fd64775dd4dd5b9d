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

//! `dagctl`: a demonstration harness for the DAG scheduler core.
//!
//! Builds a toy three-stage dataset lineage (two shuffle boundaries), submits it as a job
//! against an in-memory fake cluster, prints the stage/task lifecycle events as they stream
//! from a [`SchedulerListener`], and exits with the job's result or failure. This binary
//! carries no scheduling logic of its own: it only wires the `dagsched` crate's public API
//! to fakes standing in for the task scheduler, map-output tracker, block manager, and
//! commit coordinator, exactly as a real embedding binary would wire it to the real ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use clap::Parser;
use dagsched::cache::{BlockLocationSource, NoPersistence};
use dagsched::collaborators::{
    BlockManagerMaster, CommitCoordinator, ListenerEvent, MapOutputTracker, SchedulerListener, TaskScheduler,
};
use dagsched::dataset::{DatasetGraph, DatasetNode, Dependency, TaskLocation};
use dagsched::ids::{AttemptNumber, DatasetId, Epoch, ExecutorId, PartitionId, ShuffleId, StageId};
use dagsched::task::{CompletionEvent, TaskEndReason, TaskKind, TaskSet};
use dagsched::{DagScheduler, DagSchedulerHandle, SchedulerConfig, SchedulerDeps};

#[derive(Parser, Debug)]
#[command(name = "dagctl", about = "Demo harness for the dagsched DAG scheduler")]
struct Args {
    /// Number of partitions in the toy job's final dataset.
    #[arg(long, default_value_t = 4)]
    partitions: usize,

    /// Optional TOML config file overriding `SchedulerConfig::default()`.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

/// Fires every submitted task back as an immediate success, simulating a cluster that
/// never loses a task. Holds the scheduler handle via a `OnceLock` because the handle only
/// exists after `DagScheduler::spawn`, which itself needs this fake already constructed.
struct ImmediateSuccessTaskScheduler {
    handle: OnceLock<DagSchedulerHandle>,
    next_map_id: AtomicU64,
}

impl ImmediateSuccessTaskScheduler {
    fn new() -> Self {
        Self {
            handle: OnceLock::new(),
            next_map_id: AtomicU64::new(0),
        }
    }

    fn set_handle(&self, handle: DagSchedulerHandle) {
        let _ = self.handle.set(handle);
    }
}

impl TaskScheduler for ImmediateSuccessTaskScheduler {
    fn submit_tasks(&self, task_set: TaskSet) {
        let Some(handle) = self.handle.get().cloned() else {
            return;
        };
        for task in task_set.tasks {
            let map_output_id = match task.kind {
                TaskKind::ShuffleMap => Some(self.next_map_id.fetch_add(1, Ordering::SeqCst)),
                TaskKind::Result { .. } => None,
            };
            let result = match &task.kind {
                TaskKind::Result { output_id } => Some(format!("partition-{output_id}-done").into_bytes()),
                TaskKind::ShuffleMap => None,
            };
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                handle.post(dagsched::event::SchedulerEvent::Completion(Box::new(CompletionEvent {
                    task,
                    reason: TaskEndReason::Success,
                    executor: ExecutorId(0),
                    result,
                    map_output_id,
                    attempt_number: 0,
                })));
            });
        }
    }

    fn cancel_tasks(&self, _stage_id: StageId, _interrupt_thread: bool) {}

    fn kill_all_task_attempts(&self, _stage_id: StageId, _interrupt_thread: bool, _reason: &str) {}

    fn kill_task_attempt(&self, _stage_id: StageId, _partition: PartitionId, _interrupt_thread: bool, _reason: &str) {}

    fn max_concurrent_task_slots(&self) -> usize {
        usize::MAX
    }
}

#[derive(Default)]
struct InMemoryMapOutputTracker {
    epoch: AtomicU64,
    shuffles: Mutex<HashMap<ShuffleId, usize>>,
}

impl MapOutputTracker for InMemoryMapOutputTracker {
    fn register_shuffle(&self, shuffle_id: ShuffleId, num_maps: usize) {
        self.shuffles.lock().unwrap().insert(shuffle_id, num_maps);
    }

    fn register_map_output(&self, _shuffle_id: ShuffleId, _map_id: u64, _executor: ExecutorId) {}

    fn unregister_map_output(&self, _shuffle_id: ShuffleId, _map_id: u64) {}

    fn unregister_all_map_output(&self, _shuffle_id: ShuffleId) {}

    fn remove_outputs_on_host(&self, _host: &str) {}

    fn remove_outputs_on_executor(&self, _executor: ExecutorId) {}

    fn contains_shuffle(&self, shuffle_id: ShuffleId) -> bool {
        self.shuffles.lock().unwrap().contains_key(&shuffle_id)
    }

    fn increment_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn get_epoch(&self) -> Epoch {
        self.epoch.load(Ordering::SeqCst)
    }
}

struct NoopBlockManagerMaster;

impl BlockLocationSource for NoopBlockManagerMaster {
    fn locations_for(&self, dataset_id: DatasetId, num_partitions: usize) -> Vec<Vec<TaskLocation>> {
        NoPersistence.locations_for(dataset_id, num_partitions)
    }
}

impl BlockManagerMaster for NoopBlockManagerMaster {
    fn remove_executor(&self, _executor: ExecutorId) {}
}

struct NoopCommitCoordinator;

impl CommitCoordinator for NoopCommitCoordinator {
    fn stage_start(&self, _stage_id: StageId, _attempt: AttemptNumber) {}
    fn stage_end(&self, _stage_id: StageId, _attempt: AttemptNumber) {}
    fn task_completed(
        &self,
        _stage_id: StageId,
        _attempt: AttemptNumber,
        _partition: PartitionId,
        _task_attempt_number: AttemptNumber,
        _successful: bool,
    ) {
    }
}

/// Prints every lifecycle notification as it streams in, the same role the real listener
/// bus (telemetry sink) would play in production.
struct PrintingListener;

impl SchedulerListener for PrintingListener {
    fn on_event(&self, event: ListenerEvent) {
        match event {
            ListenerEvent::JobStart { job_id, call_site } => {
                println!("[job {job_id}] started at {call_site}");
            }
            ListenerEvent::JobEnd { job_id, success, message } => {
                println!(
                    "[job {job_id}] finished: success={success}{}",
                    message.map(|m| format!(" ({m})")).unwrap_or_default()
                );
            }
            ListenerEvent::StageSubmitted { stage_id, attempt } => {
                println!("[stage {stage_id}] submitted attempt {attempt}");
            }
            ListenerEvent::StageCompleted { stage_id, attempt, failed } => {
                println!("[stage {stage_id}] attempt {attempt} completed (failed={failed})");
            }
            ListenerEvent::TaskStart { stage_id, partition } => {
                println!("[stage {stage_id}] task {partition} started");
            }
            ListenerEvent::TaskEnd { stage_id, partition, success } => {
                println!("[stage {stage_id}] task {partition} ended (success={success})");
            }
            ListenerEvent::TaskGettingResult { stage_id, partition } => {
                println!("[stage {stage_id}] task {partition} fetching result");
            }
            ListenerEvent::SpeculativeTaskSubmitted { stage_id, partition } => {
                println!("[stage {stage_id}] speculative attempt submitted for task {partition}");
            }
        }
    }
}

/// Builds `DS0 --shuffle--> DS1 --shuffle--> DS2`, each with `partitions` partitions, the
/// same toy lineage `tests/scenarios.rs` scenario 1 drives.
fn build_toy_lineage(partitions: usize) -> (DatasetGraph, DatasetId) {
    let mut graph = DatasetGraph::new();
    let ds0 = DatasetId(0);
    let ds1 = DatasetId(1);
    let ds2 = DatasetId(2);
    let shuffle0 = ShuffleId(0);
    let shuffle1 = ShuffleId(1);

    graph.insert(DatasetNode::new(ds0, partitions));
    graph.insert(DatasetNode::new(ds1, partitions).with_dependency(Dependency::Shuffle {
        shuffle_id: shuffle0,
        parent: ds0,
        num_partitions: partitions,
    }));
    graph.insert(DatasetNode::new(ds2, partitions).with_dependency(Dependency::Shuffle {
        shuffle_id: shuffle1,
        parent: ds1,
        num_partitions: partitions,
    }));
    (graph, ds2)
}

fn load_config(path: Option<std::path::PathBuf>) -> anyhow::Result<SchedulerConfig> {
    let Some(path) = path else {
        return Ok(SchedulerConfig::default());
    };
    let raw = std::fs::read_to_string(&path)?;
    Ok(toml::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_config(args.config)?;

    let task_scheduler = Arc::new(ImmediateSuccessTaskScheduler::new());
    let deps = SchedulerDeps {
        task_scheduler: task_scheduler.clone(),
        map_output_tracker: Arc::new(InMemoryMapOutputTracker::default()),
        block_manager: Arc::new(NoopBlockManagerMaster),
        commit_coordinator: Arc::new(NoopCommitCoordinator),
        listener: Arc::new(PrintingListener),
    };

    let (handle, _join) = DagScheduler::spawn(config, deps);
    task_scheduler.set_handle(handle.clone());

    let (graph, final_dataset) = build_toy_lineage(args.partitions);
    let partitions: Vec<PartitionId> = (0..args.partitions).collect();
    let waiter = handle.submit_job(graph, final_dataset, args.partitions, partitions, "dagctl demo job", None)?;

    match waiter.wait().await {
        Ok(results) => {
            println!("job succeeded with {} results", results.len());
            Ok(())
        }
        Err(err) => {
            eprintln!("job failed: {err}");
            std::process::exit(1);
        }
    }
}
