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

//! Stage Registry (§4.2): owns the canonical stage set, the shuffle-id → stage mapping,
//! and job↔stage membership. Lives entirely on the event loop; nothing here is
//! thread-safe by itself, which is fine because only the event loop ever touches it.

use std::collections::{HashMap, HashSet};

use crate::dataset::DatasetGraph;
use crate::error::{SchedulerError, SchedulerResult};
use crate::ids::{DatasetId, JobId, PartitionId, ShuffleId, StageId};
use crate::lineage;
use crate::stage::{Stage, StageKind};

#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<StageId, Stage>,
    shuffle_to_stage: HashMap<ShuffleId, StageId>,
    next_stage_id: u64,
    /// Shuffle ids (and their map-output count) allocated a stage since the last drain,
    /// so the event loop can call `registerShuffle` on the map-output tracker exactly
    /// once per shuffle, at the point the source registers it alongside stage creation.
    newly_created_shuffles: Vec<(ShuffleId, usize)>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_stage_id(&mut self) -> StageId {
        let id = StageId(self.next_stage_id);
        self.next_stage_id += 1;
        id
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(&id)
    }

    pub fn stage_mut(&mut self, id: StageId) -> Option<&mut Stage> {
        self.stages.get_mut(&id)
    }

    pub fn contains_shuffle(&self, shuffle_id: ShuffleId) -> bool {
        self.shuffle_to_stage.contains_key(&shuffle_id)
    }

    pub fn shuffle_map_stage_id(&self, shuffle_id: ShuffleId) -> Option<StageId> {
        self.shuffle_to_stage.get(&shuffle_id).copied()
    }

    pub fn all_stage_ids(&self) -> Vec<StageId> {
        self.stages.keys().copied().collect()
    }

    /// Resolves (creating any missing ancestors, deepest-first) the canonical
    /// `ShuffleMapStage` for `shuffle_id`, producing its output from `producer`. The stage's
    /// task count is `producer`'s own partition count, not the shuffle's declared output
    /// width — those can differ (e.g. a repartition), and it's the map side that runs one
    /// task per source partition.
    pub fn get_or_create_shuffle_map_stage(
        &mut self,
        graph: &DatasetGraph,
        shuffle_id: ShuffleId,
        producer: DatasetId,
        first_job_id: JobId,
    ) -> SchedulerResult<StageId> {
        if let Some(existing) = self.shuffle_to_stage.get(&shuffle_id) {
            return Ok(*existing);
        }

        // Create missing ancestor shuffle stages first, deepest first.
        let missing = lineage::missing_ancestor_shuffles(graph, producer, |sid| {
            self.shuffle_to_stage.contains_key(&sid)
        });
        for (ancestor_shuffle_id, ancestor_producer) in missing {
            // A prior iteration may have created this ancestor already as a side effect
            // (shared sub-lineage); skip if so.
            if self.shuffle_to_stage.contains_key(&ancestor_shuffle_id) {
                continue;
            }
            self.create_shuffle_map_stage_record(graph, ancestor_shuffle_id, ancestor_producer, first_job_id)?;
        }

        if let Some(existing) = self.shuffle_to_stage.get(&shuffle_id) {
            return Ok(*existing);
        }
        self.create_shuffle_map_stage_record(graph, shuffle_id, producer, first_job_id)
    }

    fn create_shuffle_map_stage_record(
        &mut self,
        graph: &DatasetGraph,
        shuffle_id: ShuffleId,
        producer: DatasetId,
        first_job_id: JobId,
    ) -> SchedulerResult<StageId> {
        let node = graph.get(producer).ok_or(SchedulerError::DatasetComputeFailed {
            dataset_id: producer,
            source: anyhow::anyhow!("dataset {:?} not registered in the lineage graph", producer),
        })?;
        let num_tasks = node.num_partitions;
        let determinism = node.determinism;
        let parents = self.parent_stage_ids(graph, producer, first_job_id)?;
        let stage_id = self.alloc_stage_id();
        let stage =
            Stage::new_shuffle_map(stage_id, producer, parents, first_job_id, num_tasks, shuffle_id, determinism);
        self.stages.insert(stage_id, stage);
        self.shuffle_to_stage.insert(shuffle_id, stage_id);
        self.newly_created_shuffles.push((shuffle_id, num_tasks));
        Ok(stage_id)
    }

    /// Drains and returns every shuffle id that has had a producing stage allocated since
    /// the last call, for the event loop to forward to the map-output tracker.
    pub fn drain_newly_created_shuffles(&mut self) -> Vec<(ShuffleId, usize)> {
        std::mem::take(&mut self.newly_created_shuffles)
    }

    /// Resolves the parent stages of `rdd` via its immediate shuffle dependencies,
    /// creating producing stages as needed.
    pub fn parent_stage_ids(
        &mut self,
        graph: &DatasetGraph,
        rdd: DatasetId,
        first_job_id: JobId,
    ) -> SchedulerResult<Vec<StageId>> {
        let mut parents = Vec::new();
        for (shuffle_id, parent_dataset) in lineage::shuffle_dependencies_immediate(graph, rdd) {
            let stage_id =
                self.get_or_create_shuffle_map_stage(graph, shuffle_id, parent_dataset, first_job_id)?;
            parents.push(stage_id);
        }
        parents.sort();
        parents.dedup();
        Ok(parents)
    }

    pub fn create_result_stage(
        &mut self,
        graph: &DatasetGraph,
        rdd: DatasetId,
        partitions: Vec<PartitionId>,
        first_job_id: JobId,
    ) -> SchedulerResult<StageId> {
        let node = graph.get(rdd).ok_or(SchedulerError::DatasetComputeFailed {
            dataset_id: rdd,
            source: anyhow::anyhow!("dataset {:?} not registered in the lineage graph", rdd),
        })?;
        for p in &partitions {
            if *p >= node.num_partitions {
                return Err(SchedulerError::InvalidPartition {
                    requested: *p,
                    available: node.num_partitions,
                });
            }
        }
        let parents = self.parent_stage_ids(graph, rdd, first_job_id)?;
        let stage_id = self.alloc_stage_id();
        let stage = Stage::new_result(stage_id, rdd, parents, first_job_id, partitions);
        self.stages.insert(stage_id, stage);
        Ok(stage_id)
    }

    /// Transitively adds `job_id` to `stage_id`'s `job_ids` and to every ancestor's not
    /// already containing it.
    pub fn update_job_id_stage_id_maps(&mut self, job_id: JobId, stage_id: StageId) {
        let mut stack = vec![stage_id];
        while let Some(id) = stack.pop() {
            let Some(stage) = self.stages.get_mut(&id) else { continue };
            if !stage.job_ids.insert(job_id) {
                continue;
            }
            stack.extend(stage.parents.iter().copied());
        }
    }

    /// Removes `job_id` from every stage's `job_ids`; any stage left with an empty set is
    /// deleted (and its shuffle-id mapping with it, if applicable). Returns the ids of
    /// stages removed.
    pub fn cleanup_for_job(&mut self, job_id: JobId) -> Vec<StageId> {
        let mut removed = Vec::new();
        let stage_ids: Vec<StageId> = self.stages.keys().copied().collect();
        for id in stage_ids {
            if let Some(stage) = self.stages.get_mut(&id) {
                stage.job_ids.remove(&job_id);
                if let StageKind::ShuffleMap { map_stage_jobs, .. } = &mut stage.kind {
                    map_stage_jobs.retain(|j| *j != job_id);
                }
                if stage.job_ids.is_empty() {
                    removed.push(id);
                }
            }
        }
        for id in &removed {
            if let Some(stage) = self.stages.remove(id) {
                if let Some(shuffle_id) = stage.shuffle_id() {
                    self.shuffle_to_stage.remove(&shuffle_id);
                }
            }
        }
        removed
    }

    /// Stages whose output `stage_id` is not yet available, computed by walking from
    /// `stage.rdd` over narrow edges and resolving shuffle edges to their producing
    /// `ShuffleMapStage`. Subgraphs that are already fully cached may be skipped by a
    /// caller via `is_cached`; here we conservatively always descend, matching the
    /// source's behavior of only pruning on cache hits at the dataset-compute layer, not
    /// the stage-missing layer.
    pub fn missing_parent_stages(&self, stage_id: StageId) -> Vec<StageId> {
        let Some(stage) = self.stages.get(&stage_id) else {
            return Vec::new();
        };
        let mut missing = HashSet::new();
        let mut result = Vec::new();
        for &parent_id in &stage.parents {
            if let Some(parent) = self.stages.get(&parent_id) {
                if !parent.is_available() && missing.insert(parent_id) {
                    result.push(parent_id);
                }
            }
        }
        result.sort();
        result
    }

    pub fn jobs_for_stage(&self, stage_id: StageId) -> HashSet<JobId> {
        self.stages
            .get(&stage_id)
            .map(|s| s.job_ids.clone())
            .unwrap_or_default()
    }

    pub fn ancestors_of(&self, stage_id: StageId) -> Vec<StageId> {
        let mut seen = HashSet::new();
        let mut stack = vec![stage_id];
        let mut result = Vec::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if id != stage_id {
                result.push(id);
            }
            if let Some(stage) = self.stages.get(&id) {
                stack.extend(stage.parents.iter().copied());
            }
        }
        result
    }
}
