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

//! The dataset lineage model the scheduler plans over.
//!
//! Datasets themselves, their `compute` semantics, and partitioner implementations are
//! external collaborators owned outside this crate: this module only defines the shape the scheduler needs to
//! see — parent dependencies, persistence, placement hints, and determinism — plus the
//! small immutable [`DatasetGraph`] arena the rest of the crate traverses by id instead of
//! by owning reference.

use std::collections::HashMap;

use crate::ids::{DatasetId, PartitionId, ShuffleId};

/// How confidently recomputing a dataset's output reproduces the previous run's output.
///
/// Gates the indeterminate-output rollback in completion handling: only `Indeterminate`
/// producers can force a successor stage with partial output to be aborted rather than
/// resubmitted in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeterminismLevel {
    /// Recomputation yields byte-identical output.
    Determinate,
    /// Recomputation yields the same multiset of records, order may differ.
    Unordered,
    /// Recomputation may differ in content, not just order.
    Indeterminate,
}

/// Whether a dataset's partitions may be found cached on executors, and where to ask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistenceLevel {
    None,
    MemoryOnly,
    DiskOnly,
    MemoryAndDisk,
}

/// A hint pairing a task with a host/executor already holding one of its inputs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskLocation {
    pub host: String,
    pub executor_id: Option<crate::ids::ExecutorId>,
}

impl TaskLocation {
    pub fn new(host: impl Into<String>, executor_id: Option<crate::ids::ExecutorId>) -> Self {
        Self {
            host: host.into(),
            executor_id,
        }
    }
}

/// A typed parent dependency edge between datasets.
#[derive(Clone, Debug)]
pub enum Dependency {
    /// Each child partition depends on a bounded set of parent partitions; no stage
    /// boundary. `get_parents` maps a child partition back to the parent partitions it
    /// reads.
    Narrow {
        parent: DatasetId,
        get_parents: NarrowParentsFn,
    },
    /// An all-to-all repartition; induces a stage boundary and materialized map outputs.
    Shuffle {
        shuffle_id: ShuffleId,
        parent: DatasetId,
        /// Number of partitions the shuffle's output (and hence the consuming stage) has.
        num_partitions: usize,
    },
}

impl Dependency {
    pub fn parent(&self) -> DatasetId {
        match self {
            Dependency::Narrow { parent, .. } => *parent,
            Dependency::Shuffle { parent, .. } => *parent,
        }
    }

    pub fn as_shuffle(&self) -> Option<(ShuffleId, DatasetId, usize)> {
        match self {
            Dependency::Shuffle {
                shuffle_id,
                parent,
                num_partitions,
            } => Some((*shuffle_id, *parent, *num_partitions)),
            Dependency::Narrow { .. } => None,
        }
    }
}

/// `get_parents(childPartition) -> [parentPartition]` for a narrow dependency. Boxed
/// because each narrow edge may compute this differently (one-to-one, range, pruning).
pub type NarrowParentsFn = std::sync::Arc<dyn Fn(PartitionId) -> Vec<PartitionId> + Send + Sync>;

/// A single node in the dataset lineage graph, as the scheduler needs to see it.
#[derive(Clone)]
pub struct DatasetNode {
    pub id: DatasetId,
    pub num_partitions: usize,
    pub dependencies: Vec<Dependency>,
    pub persistence: PersistenceLevel,
    /// Per-partition placement preferences declared by the dataset itself (e.g. a source
    /// reading from a particular host). `None` if the dataset has none.
    pub preferred_locations: Option<std::sync::Arc<dyn Fn(PartitionId) -> Vec<TaskLocation> + Send + Sync>>,
    pub barrier: bool,
    pub determinism: DeterminismLevel,
}

impl std::fmt::Debug for DatasetNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetNode")
            .field("id", &self.id)
            .field("num_partitions", &self.num_partitions)
            .field("dependencies", &self.dependencies)
            .field("persistence", &self.persistence)
            .field("barrier", &self.barrier)
            .field("determinism", &self.determinism)
            .finish()
    }
}

impl DatasetNode {
    pub fn new(id: DatasetId, num_partitions: usize) -> Self {
        Self {
            id,
            num_partitions,
            dependencies: Vec::new(),
            persistence: PersistenceLevel::None,
            preferred_locations: None,
            barrier: false,
            determinism: DeterminismLevel::Determinate,
        }
    }

    pub fn with_dependency(mut self, dep: Dependency) -> Self {
        self.dependencies.push(dep);
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceLevel) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_barrier(mut self, barrier: bool) -> Self {
        self.barrier = barrier;
        self
    }

    pub fn with_determinism(mut self, determinism: DeterminismLevel) -> Self {
        self.determinism = determinism;
        self
    }

    pub fn shuffle_dependencies(&self) -> impl Iterator<Item = (ShuffleId, DatasetId, usize)> + '_ {
        self.dependencies.iter().filter_map(|d| d.as_shuffle())
    }

    pub fn narrow_parents(&self) -> impl Iterator<Item = DatasetId> + '_ {
        self.dependencies.iter().filter_map(|d| match d {
            Dependency::Narrow { parent, .. } => Some(*parent),
            Dependency::Shuffle { .. } => None,
        })
    }
}

/// An immutable arena of dataset nodes, keyed by [`DatasetId`].
///
/// Built once per job submission (callers register the lineage they want computed) and
/// shared read-only thereafter; the scheduler never mutates a dataset node after
/// registration.
#[derive(Clone, Default)]
pub struct DatasetGraph {
    nodes: HashMap<DatasetId, DatasetNode>,
}

impl DatasetGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: DatasetNode) {
        self.nodes.insert(node.id, node);
    }

    pub fn get(&self, id: DatasetId) -> Option<&DatasetNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: DatasetId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Folds `other`'s nodes into this graph. Each job submission carries only the slice
    /// of lineage it touched; the scheduler accumulates every node it has ever seen here
    /// so ancestor lookups for a shared stage keep working across jobs. Nodes already
    /// present are left untouched — dataset definitions are immutable once registered.
    pub fn merge(&mut self, other: DatasetGraph) {
        for (id, node) in other.nodes {
            self.nodes.entry(id).or_insert(node);
        }
    }
}