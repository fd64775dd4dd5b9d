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

//! Cache-location index: a lazily populated dataset-id → per-partition candidate
//! locations table. Reads may come from the event loop or from a concurrent
//! task-submission path, so the whole table sits behind a single `parking_lot::Mutex`
//! rather than being owned outright by the event loop, mirroring how
//! `CompactionRequestChannel` guards its dedup set with one mutex rather than
//! fine-grained per-entry locks.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::dataset::TaskLocation;
use crate::ids::{DatasetId, PartitionId};

/// Answers block-manager location lookups. Implemented by the real block manager master
/// client in production and by an in-memory fake in tests.
pub trait BlockLocationSource: Send + Sync {
    /// Returns candidate locations for every partition of `dataset_id`, indexed by
    /// partition id, in one batched call.
    fn locations_for(&self, dataset_id: DatasetId, num_partitions: usize) -> Vec<Vec<TaskLocation>>;
}

/// A source that never reports any cached locations, for datasets with no persistence.
pub struct NoPersistence;

impl BlockLocationSource for NoPersistence {
    fn locations_for(&self, _dataset_id: DatasetId, num_partitions: usize) -> Vec<Vec<TaskLocation>> {
        vec![Vec::new(); num_partitions]
    }
}

#[derive(Default)]
struct CacheTable {
    entries: HashMap<DatasetId, Vec<Vec<TaskLocation>>>,
}

pub struct CacheLocationIndex {
    table: Mutex<CacheTable>,
}

impl Default for CacheLocationIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheLocationIndex {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(CacheTable::default()),
        }
    }

    /// Returns the cached locations for `(dataset_id, partition)`, populating the whole
    /// dataset's row via `source` on first access if it has persistence, or a row of
    /// empty vectors otherwise.
    pub fn get(
        &self,
        dataset_id: DatasetId,
        partition: PartitionId,
        num_partitions: usize,
        has_persistence: bool,
        source: &dyn BlockLocationSource,
    ) -> Option<Vec<TaskLocation>> {
        let mut table = self.table.lock();
        if !table.entries.contains_key(&dataset_id) {
            let row = if has_persistence {
                source.locations_for(dataset_id, num_partitions)
            } else {
                vec![Vec::new(); num_partitions]
            };
            table.entries.insert(dataset_id, row);
        }
        table
            .entries
            .get(&dataset_id)
            .and_then(|row| row.get(partition))
            .cloned()
    }

    pub fn clear(&self) {
        self.table.lock().entries.clear();
    }
}