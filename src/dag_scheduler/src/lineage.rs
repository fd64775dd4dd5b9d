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

//! Pure traversals over the dataset lineage graph (§4.1).
//!
//! Every traversal here is iterative (explicit work stack) rather than recursive, so a
//! pathologically deep narrow-dependency chain cannot blow the call stack. None of these
//! functions mutate anything; they take a [`DatasetGraph`] and, where relevant, a view of
//! the registry's known shuffle ids.

use std::collections::{HashSet, VecDeque};

use crate::dataset::{DatasetGraph, Dependency, TaskLocation};
use crate::ids::{DatasetId, PartitionId, ShuffleId};

/// Shuffle dependencies crossed while walking narrow ancestors from `dataset_id`,
/// stopping descent at each shuffle edge. This is the direct boundary-detection step used
/// when deciding a stage's parents. The `DatasetId` returned is the shuffle's producer
/// (the dataset whose own partitions become the map stage's tasks); the shuffle's declared
/// `num_partitions` is the reduce side's width and is not part of this result.
pub fn shuffle_dependencies_immediate(graph: &DatasetGraph, dataset_id: DatasetId) -> Vec<(ShuffleId, DatasetId)> {
    let mut result = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![dataset_id];

    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(node) = graph.get(id) else { continue };
        for dep in &node.dependencies {
            match dep {
                Dependency::Shuffle { shuffle_id, parent, .. } => result.push((*shuffle_id, *parent)),
                Dependency::Narrow { parent, .. } => stack.push(*parent),
            }
        }
    }
    result
}

/// Shuffle dependencies transitively reachable from `dataset_id` that `is_registered`
/// reports as not yet known to the Stage Registry, ordered deepest-first so ancestors are
/// created before the stages that depend on them.
pub fn missing_ancestor_shuffles(
    graph: &DatasetGraph,
    dataset_id: DatasetId,
    is_registered: impl Fn(ShuffleId) -> bool,
) -> Vec<(ShuffleId, DatasetId)> {
    let mut missing = Vec::new();
    let mut visited_shuffles = HashSet::new();
    let mut visited_datasets = HashSet::new();
    let mut stack = vec![dataset_id];

    // First pass: DFS collecting shuffle edges in post-order-ish traversal order, then we
    // reverse so deeper dependencies (pushed later as we descend) precede their consumers.
    let mut order = Vec::new();
    while let Some(id) = stack.pop() {
        if !visited_datasets.insert(id) {
            continue;
        }
        let Some(node) = graph.get(id) else { continue };
        for dep in &node.dependencies {
            match dep {
                Dependency::Shuffle { shuffle_id, parent, .. } => {
                    if visited_shuffles.insert(*shuffle_id) {
                        order.push((*shuffle_id, *parent));
                    }
                    stack.push(*parent);
                }
                Dependency::Narrow { parent, .. } => stack.push(*parent),
            }
        }
    }

    // `order` was appended in discovery order (shallow shuffles discovered before the deep
    // ones they sit behind, since we push parents and keep popping). Reverse it so deepest
    // comes first.
    order.reverse();
    for (shuffle_id, parent) in order {
        if !is_registered(shuffle_id) {
            missing.push((shuffle_id, parent));
        }
    }
    missing
}

/// `true` iff `predicate` holds for every dataset reachable from `dataset_id` via narrow
/// edges (shuffle edges are not descended). Short-circuits on the first failure.
pub fn traverse_within_stage_all(
    graph: &DatasetGraph,
    dataset_id: DatasetId,
    predicate: impl Fn(DatasetId) -> bool,
) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![dataset_id];

    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if !predicate(id) {
            return false;
        }
        let Some(node) = graph.get(id) else { continue };
        for parent in node.narrow_parents() {
            stack.push(parent);
        }
    }
    true
}

/// All datasets narrow-reachable from `dataset_id`, included, without crossing a shuffle
/// edge. Used by barrier-admission checks (§4.6) to inspect in-stage ancestors.
pub fn datasets_within_stage(graph: &DatasetGraph, dataset_id: DatasetId) -> Vec<DatasetId> {
    let mut seen = HashSet::new();
    let mut stack = vec![dataset_id];
    let mut result = Vec::new();

    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        result.push(id);
        let Some(node) = graph.get(id) else { continue };
        for parent in node.narrow_parents() {
            stack.push(parent);
        }
    }
    result
}

/// Recursive-with-memoization preferred-location lookup (§4.1 step 4). `cached_locations`
/// should answer from the Cache-Location Index; `visited` guards against revisiting a
/// `(dataset, partition)` pair in datasets with shared narrow ancestors.
pub fn preferred_locations(
    graph: &DatasetGraph,
    dataset_id: DatasetId,
    partition: PartitionId,
    cached_locations: &impl Fn(DatasetId, PartitionId) -> Option<Vec<TaskLocation>>,
) -> Vec<TaskLocation> {
    let mut visited = HashSet::new();
    preferred_locations_inner(graph, dataset_id, partition, cached_locations, &mut visited)
}

fn preferred_locations_inner(
    graph: &DatasetGraph,
    dataset_id: DatasetId,
    partition: PartitionId,
    cached_locations: &impl Fn(DatasetId, PartitionId) -> Option<Vec<TaskLocation>>,
    visited: &mut HashSet<(DatasetId, PartitionId)>,
) -> Vec<TaskLocation> {
    if !visited.insert((dataset_id, partition)) {
        return Vec::new();
    }

    if let Some(locs) = cached_locations(dataset_id, partition) {
        if !locs.is_empty() {
            return locs;
        }
    }

    let Some(node) = graph.get(dataset_id) else {
        return Vec::new();
    };

    if let Some(f) = &node.preferred_locations {
        let locs = f(partition);
        if !locs.is_empty() {
            return locs;
        }
    }

    // Descend the first narrow dependency only, recursing on the first parent partition
    // that yields a non-empty result.
    if let Some(Dependency::Narrow { parent, get_parents }) = node
        .dependencies
        .iter()
        .find(|d| matches!(d, Dependency::Narrow { .. }))
    {
        for parent_partition in get_parents(partition) {
            let locs =
                preferred_locations_inner(graph, *parent, parent_partition, cached_locations, visited);
            if !locs.is_empty() {
                return locs;
            }
        }
    }

    Vec::new()
}

/// Breadth-first collection of every dataset id reachable from `dataset_id`, narrow or
/// shuffle edges alike. Used by the demo CLI and tests to sanity-check a constructed
/// graph; not on the scheduler's hot path.
pub fn all_reachable_datasets(graph: &DatasetGraph, dataset_id: DatasetId) -> Vec<DatasetId> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([dataset_id]);
    let mut result = Vec::new();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        result.push(id);
        if let Some(node) = graph.get(id) {
            for dep in &node.dependencies {
                queue.push_back(dep.parent());
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dataset::{DatasetNode, PersistenceLevel};

    fn one_to_one() -> crate::dataset::NarrowParentsFn {
        Arc::new(|p: PartitionId| vec![p])
    }

    /// DS0 --shuffle(0)--> DS1 --shuffle(1)--> DS2, each 2 partitions.
    fn linear_three_stage_graph() -> (DatasetGraph, DatasetId, DatasetId, DatasetId) {
        let mut graph = DatasetGraph::new();
        let ds0 = DatasetId(0);
        let ds1 = DatasetId(1);
        let ds2 = DatasetId(2);
        graph.insert(DatasetNode::new(ds0, 2));
        graph.insert(DatasetNode::new(ds1, 2).with_dependency(Dependency::Shuffle {
            shuffle_id: ShuffleId(0),
            parent: ds0,
            num_partitions: 2,
        }));
        graph.insert(DatasetNode::new(ds2, 2).with_dependency(Dependency::Shuffle {
            shuffle_id: ShuffleId(1),
            parent: ds1,
            num_partitions: 2,
        }));
        (graph, ds0, ds1, ds2)
    }

    #[test]
    fn shuffle_dependencies_immediate_stops_at_first_boundary() {
        let (graph, _ds0, ds1, ds2) = linear_three_stage_graph();
        // From ds2, only shuffle(1) is immediate; shuffle(0) sits behind it.
        let deps = shuffle_dependencies_immediate(&graph, ds2);
        assert_eq!(deps, vec![(ShuffleId(1), ds1)]);
    }

    #[test]
    fn shuffle_dependencies_immediate_descends_narrow_edges() {
        let mut graph = DatasetGraph::new();
        let ds0 = DatasetId(0);
        let ds1 = DatasetId(1); // narrow child of ds0
        let ds2 = DatasetId(2); // shuffle child of ds1
        graph.insert(DatasetNode::new(ds0, 2));
        graph.insert(DatasetNode::new(ds1, 2).with_dependency(Dependency::Narrow {
            parent: ds0,
            get_parents: one_to_one(),
        }));
        graph.insert(DatasetNode::new(ds2, 2).with_dependency(Dependency::Shuffle {
            shuffle_id: ShuffleId(7),
            parent: ds1,
            num_partitions: 2,
        }));
        // Querying from ds1 (the narrow child), the shuffle edge is still immediate: no
        // shuffle boundary sits between ds1 and its own shuffle dependency.
        let deps = shuffle_dependencies_immediate(&graph, ds2);
        assert_eq!(deps, vec![(ShuffleId(7), ds1)]);
    }

    #[test]
    fn missing_ancestor_shuffles_orders_deepest_first() {
        let (graph, ds0, _ds1, ds2) = linear_three_stage_graph();
        let missing = missing_ancestor_shuffles(&graph, ds2, |_| false);
        let ids: Vec<ShuffleId> = missing.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![ShuffleId(0), ShuffleId(1)]);
        assert_eq!(missing[0].1, ds0);
    }

    #[test]
    fn missing_ancestor_shuffles_skips_already_registered() {
        let (graph, _ds0, _ds1, ds2) = linear_three_stage_graph();
        let missing = missing_ancestor_shuffles(&graph, ds2, |id| id == ShuffleId(0));
        let ids: Vec<ShuffleId> = missing.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![ShuffleId(1)]);
    }

    #[test]
    fn traverse_within_stage_all_short_circuits_on_first_failure() {
        let mut graph = DatasetGraph::new();
        let ds0 = DatasetId(0);
        let ds1 = DatasetId(1);
        graph.insert(DatasetNode::new(ds0, 1));
        graph.insert(DatasetNode::new(ds1, 1).with_dependency(Dependency::Narrow {
            parent: ds0,
            get_parents: one_to_one(),
        }));
        assert!(traverse_within_stage_all(&graph, ds1, |_| true));
        assert!(!traverse_within_stage_all(&graph, ds1, |id| id != ds0));
    }

    #[test]
    fn traverse_within_stage_all_does_not_cross_shuffle_edges() {
        let (graph, _ds0, ds1, _ds2) = linear_three_stage_graph();
        // ds1 has a shuffle parent (ds0); the predicate should never see ds0.
        assert!(traverse_within_stage_all(&graph, ds1, |id| id != DatasetId(0)));
    }

    #[test]
    fn preferred_locations_prefers_cache_over_declared_preferences() {
        let mut graph = DatasetGraph::new();
        let ds0 = DatasetId(0);
        graph.insert(DatasetNode::new(ds0, 1).with_persistence(PersistenceLevel::MemoryOnly));
        let cache_hit = crate::dataset::TaskLocation::new("cached-host", None);
        let cache_hit2 = cache_hit.clone();
        let locs = preferred_locations(&graph, ds0, 0, &move |_, _| Some(vec![cache_hit2.clone()]));
        assert_eq!(locs, vec![cache_hit]);
    }

    #[test]
    fn preferred_locations_falls_back_to_first_narrow_parent() {
        let mut graph = DatasetGraph::new();
        let ds0 = DatasetId(0);
        let ds1 = DatasetId(1);
        let mut source = DatasetNode::new(ds0, 1);
        source.preferred_locations = Some(Arc::new(|_: PartitionId| {
            vec![crate::dataset::TaskLocation::new("source-host", None)]
        }));
        graph.insert(source);
        graph.insert(DatasetNode::new(ds1, 1).with_dependency(Dependency::Narrow {
            parent: ds0,
            get_parents: one_to_one(),
        }));
        let locs = preferred_locations(&graph, ds1, 0, &|_, _| None);
        assert_eq!(locs, vec![crate::dataset::TaskLocation::new("source-host", None)]);
    }

    #[test]
    fn preferred_locations_empty_when_nothing_known() {
        let mut graph = DatasetGraph::new();
        let ds0 = DatasetId(0);
        graph.insert(DatasetNode::new(ds0, 1));
        let locs = preferred_locations(&graph, ds0, 0, &|_, _| None);
        assert!(locs.is_empty());
    }
}