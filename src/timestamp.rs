// Copyright 2023 The SeamDB Authors.
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

//! State timestamps and branch versions.

use std::fmt::{self, Display, Formatter};

use static_assertions::assert_impl_all;
use uuid::Uuid;

/// Dense, totally ordered timestamp of one write stream. The primary
/// stamps consecutive writes with consecutive timestamps, so `next` and
/// `pred` step through the stream with no gaps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateTimestamp(u64);

assert_impl_all!(StateTimestamp: Send, Sync, Copy);

impl StateTimestamp {
    pub const ZERO: Self = Self(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn into_raw(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn pred(self) -> Self {
        assert!(self.0 > 0, "zero timestamp has no predecessor");
        Self(self.0 - 1)
    }
}

impl Display for StateTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one lineage of store state. Timestamps are comparable only
/// within a single branch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BranchId(Uuid);

impl BranchId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Display for BranchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-region store metainfo: which branch the resident data belongs to
/// and how far along that branch it is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Version {
    pub branch: BranchId,
    pub timestamp: StateTimestamp,
}

impl Version {
    pub fn new(branch: BranchId, timestamp: StateTimestamp) -> Self {
        Self { branch, timestamp }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.timestamp)
    }
}
