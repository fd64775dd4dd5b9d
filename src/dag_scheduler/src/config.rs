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

//! Typed, serde-deserializable configuration for the DAG scheduler core.
//!
//! The scheduler never reads environment variables or files itself: it is handed an
//! already-resolved [`SchedulerConfig`] at construction time. Layering a config file and
//! environment overrides on top of [`SchedulerConfig::default`] is the embedding binary's
//! job (the `dagctl` demo CLI shows the pattern).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables recognized by the scheduler core (§6 of the design doc this crate implements).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Abort a stage once it has failed this many consecutive attempts due to fetch
    /// failures. The upstream system's default is 4.
    pub max_consecutive_stage_attempts: u32,

    /// When `true`, a fetch failure against a host running an external shuffle service
    /// unregisters every map output on that host rather than just the failing map id.
    pub unregister_output_on_host_on_fetch_failure: bool,

    /// Interval, in seconds, between barrier-stage admission retries while waiting for
    /// enough concurrent task slots.
    pub barrier_max_concurrent_tasks_check_interval_sec: u64,

    /// Number of barrier-admission retries before the job submitting the barrier stage is
    /// failed outright.
    pub barrier_max_concurrent_tasks_check_max_failures: u32,

    /// Debounce window, in milliseconds, used to coalesce a burst of fetch failures into a
    /// single `ResubmitFailedStages` event.
    pub resubmit_timeout_ms: u64,

    /// Disables stage retry outright; intended for deterministic tests only (`test.noStageRetry`).
    pub disable_stage_retry_for_test: bool,

    /// Mirrors the cluster manager's dynamic resource allocation toggle. Barrier stages
    /// are rejected outright when this is on, since gang-scheduling assumes a fixed
    /// executor set (§4.6).
    pub dynamic_resource_allocation_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_stage_attempts: 4,
            unregister_output_on_host_on_fetch_failure: false,
            barrier_max_concurrent_tasks_check_interval_sec: 15,
            barrier_max_concurrent_tasks_check_max_failures: 40,
            resubmit_timeout_ms: 200,
            disable_stage_retry_for_test: false,
            dynamic_resource_allocation_enabled: false,
        }
    }
}

impl SchedulerConfig {
    pub fn barrier_max_concurrent_tasks_check_interval(&self) -> Duration {
        Duration::from_secs(self.barrier_max_concurrent_tasks_check_interval_sec)
    }

    pub fn resubmit_timeout(&self) -> Duration {
        Duration::from_millis(self.resubmit_timeout_ms)
    }
}