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

//! Stage-oriented DAG scheduler for a distributed data-parallel compute engine.
//!
//! This crate implements the control plane that decomposes a lazy dataset lineage graph
//! into shuffle-bounded [`stage::Stage`]s, submits their tasks to a lower-level task
//! scheduler, tracks materialized shuffle outputs, and recovers from lost intermediate
//! data by resubmitting affected stages. The lower-level task scheduler, map-output
//! tracker, block manager, commit coordinator, and telemetry sink are external
//! collaborators reached only through the traits in [`collaborators`]; this crate owns
//! none of their implementations.
//!
//! Entry point: [`scheduler::DagScheduler::spawn`] starts the event loop and returns a
//! cheap, cloneable [`scheduler::DagSchedulerHandle`] for submitting jobs and posting
//! cluster events.

pub mod cache;
pub mod collaborators;
mod completion;
pub mod config;
pub mod dataset;
pub mod epoch;
pub mod error;
pub mod event;
pub mod ids;
pub mod job;
pub mod lineage;
pub mod registry;
pub mod scheduler;
pub mod stage;
mod submission;
pub mod task;
mod timer;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{DagScheduler, DagSchedulerHandle, SchedulerDeps};