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

//! Shared fakes and harness wiring for scenario tests. Every collaborator trait gets an
//! in-memory stand-in here instead of a mock framework, the same way the core's own demo
//! binary wires its own fakes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dagsched::cache::BlockLocationSource;
use dagsched::collaborators::{
    BlockManagerMaster, CommitCoordinator, ListenerEvent, MapOutputTracker, SchedulerListener, TaskScheduler,
};
use dagsched::dataset::TaskLocation;
use dagsched::ids::{AttemptNumber, DatasetId, Epoch, ExecutorId, PartitionId, ShuffleId, StageId};
use dagsched::task::{CompletionEvent, Task, TaskEndReason, TaskSet};
use dagsched::{DagScheduler, DagSchedulerHandle, SchedulerConfig, SchedulerDeps};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

/// Hands every submitted task set back to the test over a channel instead of executing it,
/// so scenarios can drive task completions by hand and observe exactly what was submitted.
pub struct ChannelTaskScheduler {
    tx: mpsc::UnboundedSender<TaskSet>,
    cancelled: Mutex<Vec<StageId>>,
    killed: Mutex<Vec<StageId>>,
    max_slots: AtomicU64,
}

impl ChannelTaskScheduler {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<TaskSet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                cancelled: Mutex::new(Vec::new()),
                killed: Mutex::new(Vec::new()),
                max_slots: AtomicU64::new(u64::MAX),
            }),
            rx,
        )
    }

    pub fn set_max_slots(&self, slots: usize) {
        self.max_slots.store(slots as u64, Ordering::SeqCst);
    }

    pub fn cancelled_stages(&self) -> Vec<StageId> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl TaskScheduler for ChannelTaskScheduler {
    fn submit_tasks(&self, task_set: TaskSet) {
        let _ = self.tx.send(task_set);
    }

    fn cancel_tasks(&self, stage_id: StageId, _interrupt_thread: bool) {
        self.cancelled.lock().unwrap().push(stage_id);
    }

    fn kill_all_task_attempts(&self, stage_id: StageId, _interrupt_thread: bool, _reason: &str) {
        self.killed.lock().unwrap().push(stage_id);
    }

    fn kill_task_attempt(&self, _stage_id: StageId, _partition: PartitionId, _interrupt_thread: bool, _reason: &str) {}

    fn max_concurrent_task_slots(&self) -> usize {
        self.max_slots.load(Ordering::SeqCst) as usize
    }
}

#[derive(Default)]
struct MapOutputInner {
    registered_shuffles: HashSet<ShuffleId>,
    map_outputs: HashMap<ShuffleId, HashMap<u64, ExecutorId>>,
    removed_hosts: Vec<String>,
    removed_executors: Vec<ExecutorId>,
}

pub struct FakeMapOutputTracker {
    inner: Mutex<MapOutputInner>,
    epoch: AtomicU64,
}

impl FakeMapOutputTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MapOutputInner::default()),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn removed_executors(&self) -> Vec<ExecutorId> {
        self.inner.lock().unwrap().removed_executors.clone()
    }

    pub fn removed_hosts(&self) -> Vec<String> {
        self.inner.lock().unwrap().removed_hosts.clone()
    }

    pub fn registered_map_output_count(&self, shuffle_id: ShuffleId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .map_outputs
            .get(&shuffle_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl MapOutputTracker for FakeMapOutputTracker {
    fn register_shuffle(&self, shuffle_id: ShuffleId, _num_maps: usize) {
        self.inner.lock().unwrap().registered_shuffles.insert(shuffle_id);
    }

    fn register_map_output(&self, shuffle_id: ShuffleId, map_id: u64, executor: ExecutorId) {
        self.inner
            .lock()
            .unwrap()
            .map_outputs
            .entry(shuffle_id)
            .or_default()
            .insert(map_id, executor);
    }

    fn unregister_map_output(&self, shuffle_id: ShuffleId, map_id: u64) {
        if let Some(outputs) = self.inner.lock().unwrap().map_outputs.get_mut(&shuffle_id) {
            outputs.remove(&map_id);
        }
    }

    fn unregister_all_map_output(&self, shuffle_id: ShuffleId) {
        self.inner.lock().unwrap().map_outputs.remove(&shuffle_id);
    }

    fn remove_outputs_on_host(&self, host: &str) {
        self.inner.lock().unwrap().removed_hosts.push(host.to_string());
    }

    fn remove_outputs_on_executor(&self, executor: ExecutorId) {
        self.inner.lock().unwrap().removed_executors.push(executor);
    }

    fn contains_shuffle(&self, shuffle_id: ShuffleId) -> bool {
        self.inner.lock().unwrap().registered_shuffles.contains(&shuffle_id)
    }

    fn increment_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn get_epoch(&self) -> Epoch {
        self.epoch.load(Ordering::SeqCst)
    }
}

pub struct FakeBlockManagerMaster {
    removed: Mutex<Vec<ExecutorId>>,
}

impl FakeBlockManagerMaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            removed: Mutex::new(Vec::new()),
        })
    }

    pub fn removed_executors(&self) -> Vec<ExecutorId> {
        self.removed.lock().unwrap().clone()
    }
}

impl BlockLocationSource for FakeBlockManagerMaster {
    fn locations_for(&self, _dataset_id: DatasetId, num_partitions: usize) -> Vec<Vec<TaskLocation>> {
        vec![Vec::new(); num_partitions]
    }
}

impl BlockManagerMaster for FakeBlockManagerMaster {
    fn remove_executor(&self, executor: ExecutorId) {
        self.removed.lock().unwrap().push(executor);
    }
}

pub struct FakeCommitCoordinator;

impl CommitCoordinator for FakeCommitCoordinator {
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

pub struct CapturingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl CapturingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl SchedulerListener for CapturingListener {
    fn on_event(&self, event: ListenerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Everything a scenario test needs: the handle to drive, the channel task sets land on,
/// and handles to every fake collaborator for post-hoc assertions.
pub struct Harness {
    pub handle: DagSchedulerHandle,
    pub task_rx: UnboundedReceiver<TaskSet>,
    pub task_scheduler: Arc<ChannelTaskScheduler>,
    pub map_output_tracker: Arc<FakeMapOutputTracker>,
    pub block_manager: Arc<FakeBlockManagerMaster>,
    pub listener: Arc<CapturingListener>,
    #[allow(dead_code)]
    pub join: JoinHandle<()>,
}

pub fn spawn_harness(config: SchedulerConfig) -> Harness {
    let (task_scheduler, task_rx) = ChannelTaskScheduler::new();
    let map_output_tracker = FakeMapOutputTracker::new();
    let block_manager = FakeBlockManagerMaster::new();
    let listener = CapturingListener::new();

    let deps = SchedulerDeps {
        task_scheduler: task_scheduler.clone(),
        map_output_tracker: map_output_tracker.clone(),
        block_manager: block_manager.clone(),
        commit_coordinator: Arc::new(FakeCommitCoordinator),
        listener: listener.clone(),
    };
    let (handle, join) = DagScheduler::spawn(config, deps);

    Harness {
        handle,
        task_rx,
        task_scheduler,
        map_output_tracker,
        block_manager,
        listener,
        join,
    }
}

/// Pulls the next submitted task set, panicking with a clear message if the channel closed.
pub async fn next_task_set(rx: &mut UnboundedReceiver<TaskSet>) -> TaskSet {
    rx.recv().await.expect("scheduler stopped without submitting an expected task set")
}

pub fn success_event(task: &Task, executor: ExecutorId, map_output_id: Option<u64>, result: Option<Vec<u8>>) -> dagsched::event::SchedulerEvent {
    dagsched::event::SchedulerEvent::Completion(Box::new(CompletionEvent {
        task: task.clone(),
        reason: TaskEndReason::Success,
        executor,
        result,
        map_output_id,
        attempt_number: 0,
    }))
}

pub fn fetch_failed_event(
    task: &Task,
    executor: ExecutorId,
    host: &str,
    shuffle_id: ShuffleId,
    map_id: u64,
) -> dagsched::event::SchedulerEvent {
    dagsched::event::SchedulerEvent::Completion(Box::new(CompletionEvent {
        task: task.clone(),
        reason: TaskEndReason::FetchFailed {
            executor,
            host: host.to_string(),
            shuffle_id,
            map_id,
            message: "fetch failed".to_string(),
        },
        executor,
        result: None,
        map_output_id: None,
        attempt_number: 0,
    }))
}
