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

//! Integer-id newtypes for the dataset/stage/job/shuffle arenas.
//!
//! The source models datasets and stages as a set of mutually-referencing objects. Here
//! they are records in arenas keyed by these ids; parent edges are id vectors rather than
//! owning references, so traversals are work-list iterations instead of graph walks over
//! `Rc`/`Arc` cycles.

use std::fmt;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }
    };
}

id_newtype!(DatasetId);
id_newtype!(StageId);
id_newtype!(JobId);
id_newtype!(ShuffleId);
id_newtype!(ExecutorId);

pub type PartitionId = usize;
pub type AttemptNumber = u32;
pub type Epoch = u64;