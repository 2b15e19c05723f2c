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

//! End-timestamp tracking for a backfilled region.
//!
//! A write can reach the client twice: once through the stream from the
//! dispatcher and once folded into the backfill from the backfiller. The
//! backfill brings different parts of the keyspace to different
//! timestamps, so the map here records, per key prefix, how far the
//! backfilled state got; a stream write still applies only where the
//! backfilled state is strictly older than it.

use crate::range::{Key, Region, RegionMap, RightBound};
use crate::timestamp::{StateTimestamp, Version};

/// Steps `(left_key, timestamp)` over one contiguous backfilled region,
/// sorted strictly ascending by key with non-decreasing timestamps.
#[derive(Clone, Debug, Default)]
pub struct BackfillEndTimestamps {
    region: Option<Region>,
    max_timestamp: StateTimestamp,
    steps: Vec<(Key, StateTimestamp)>,
}

impl BackfillEndTimestamps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads one backfill chunk's per-range versions. Chunk timestamps
    /// that regress along the key order are a protocol violation.
    pub fn from_chunk(chunk: &RegionMap<Version>) -> Self {
        let region = chunk.domain();
        let mut steps: Vec<(Key, StateTimestamp)> = Vec::new();
        let mut max_timestamp = StateTimestamp::ZERO;
        chunk.visit(&region, |sub, version| {
            if let Some((_, last)) = steps.last() {
                assert!(*last <= version.timestamp, "backfill timestamps regress at {sub:?}");
            }
            steps.push((sub.keys.start.clone(), version.timestamp));
            max_timestamp = version.timestamp;
        });
        assert!(!steps.is_empty(), "backfill chunk with no versions");
        Self { region: Some(region), max_timestamp, steps }
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_none()
    }

    /// Greatest backfill end timestamp seen so far; `ZERO` while empty.
    /// A write above it applies to the whole backfilled region.
    pub fn max_timestamp(&self) -> StateTimestamp {
        self.max_timestamp
    }

    /// The sub-region whose backfilled state is strictly older than
    /// `timestamp`: where a stream write at `timestamp` still needs to be
    /// applied.
    pub fn region_for_timestamp(&self, timestamp: StateTimestamp) -> Region {
        let Some(region) = &self.region else {
            return Region::universe().to_empty();
        };
        let mut region = region.clone();
        for (key, step) in &self.steps {
            if *step >= timestamp {
                region.keys.end = RightBound::key(key.clone());
                break;
            }
        }
        region
    }

    /// Concatenates an adjacent map to the right of this one. A shared
    /// boundary timestamp is deduplicated at the join point.
    pub fn combine(&mut self, next: BackfillEndTimestamps) {
        if next.region.is_none() {
            return;
        }
        let Some(region) = &mut self.region else {
            *self = next;
            return;
        };
        let next_region = next.region.unwrap();
        assert_eq!(region.hash, next_region.hash, "combining maps from different hash shards");
        assert_eq!(
            region.keys.end,
            RightBound::key(next_region.keys.start.clone()),
            "combining non-adjacent backfill maps"
        );
        region.keys.end = next_region.keys.end;
        let last = self.steps.last().expect("non-empty map has steps").1;
        let first = next.steps.first().expect("non-empty map has steps").1;
        assert!(last <= first, "backfill timestamps regress across chunks");
        let skip = usize::from(last == first);
        self.steps.extend(next.steps.into_iter().skip(skip));
        self.max_timestamp = self.max_timestamp.max(next.max_timestamp);
    }
}
