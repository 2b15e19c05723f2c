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

//! Construction-time partition of the assigned region.

use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};

use super::queue::StreamQueue;
use super::replica::Replica;
use crate::range::{KeyRange, Region, RightBound};
use crate::signal::{Interrupted, Interruptor};

/// Everything the write router consults under the region lock: the three
/// sub-regions, the installed queue, and the replica once it exists.
///
/// The regions partition the assigned region at all times, contiguously
/// and in order: `streaming` leftmost, `queueing` in the middle,
/// `discarding` rightmost, any of them possibly empty.
pub struct TrackerState {
    assigned: Region,
    pub streaming: Region,
    pub queueing: Region,
    pub discarding: Region,
    pub queue: Option<StreamQueue>,
    pub replica: Option<Arc<Replica>>,
}

impl TrackerState {
    /// Starts queueing what was being discarded.
    pub fn begin_phase(&mut self) {
        assert!(self.queueing.is_empty(), "phase began while still queueing");
        self.queueing = std::mem::replace(&mut self.discarding, self.assigned.to_empty());
        self.validate();
    }

    /// Shrinks the queueing region to what the backfill actually reached
    /// and goes back to discarding the rest.
    pub fn end_phase(&mut self, reached: RightBound) {
        self.queueing.keys.end = reached.clone();
        self.discarding = match reached.as_key() {
            None => self.assigned.to_empty(),
            Some(key) => {
                let rest = KeyRange::new(key.to_vec(), self.assigned.keys.end.clone());
                self.assigned.with_keys(rest)
            },
        };
        self.validate();
    }

    /// Hands the drained queueing region over to streaming.
    pub fn promote(&mut self) {
        self.streaming.keys.end = self.queueing.keys.end.clone();
        self.queueing = self.assigned.to_empty();
        self.validate();
    }

    fn validate(&self) {
        let mut cursor = RightBound::key(self.assigned.keys.start.clone());
        for region in [&self.streaming, &self.queueing, &self.discarding] {
            if region.is_empty() {
                continue;
            }
            assert_eq!(region.hash, self.assigned.hash, "partition region left the hash shard");
            assert_eq!(
                RightBound::key(region.keys.start.clone()),
                cursor,
                "partition regions not contiguous"
            );
            cursor = region.keys.end.clone();
        }
        assert_eq!(cursor, self.assigned.keys.end, "partition regions do not cover the assigned region");
    }
}

/// The region lock. Construction takes it exclusively for partition
/// transitions and queue swaps; the write router takes it shared for the
/// duration of a routing decision and its state snapshot.
pub struct Tracker {
    state: Arc<RwLock<TrackerState>>,
}

impl Tracker {
    /// Starts with nothing streaming or queueing: the whole assigned
    /// region is discarded until the first backfill phase.
    pub fn new(assigned: Region) -> Self {
        assert!(!assigned.is_empty(), "tracker over empty region");
        let streaming = assigned.with_keys(KeyRange::new(
            assigned.keys.start.clone(),
            RightBound::key(assigned.keys.start.clone()),
        ));
        let state = TrackerState {
            streaming,
            queueing: assigned.to_empty(),
            discarding: assigned.clone(),
            assigned,
            queue: None,
            replica: None,
        };
        Self { state: Arc::new(RwLock::new(state)) }
    }

    pub async fn read(&self, interruptor: &Interruptor) -> Result<RwLockReadGuard<'_, TrackerState>, Interrupted> {
        interruptor.run(self.state.read()).await
    }

    pub async fn write_owned(&self, interruptor: &Interruptor) -> Result<OwnedRwLockWriteGuard<TrackerState>, Interrupted> {
        interruptor.run(self.state.clone().write_owned()).await
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::range::HashRange;

    fn region(start: &[u8], end: RightBound) -> Region {
        Region::new(HashRange::universe(), KeyRange::new(start.to_vec(), end))
    }

    #[tokio::test]
    async fn test_phase_transitions() {
        let assigned = region(b"a", RightBound::key(b"z".to_vec()));
        let tracker = Tracker::new(assigned.clone());
        let never = Interruptor::never();

        let mut state = tracker.write_owned(&never).await.unwrap();
        assert_that!(state.streaming.is_empty()).is_true();
        assert_that!(state.queueing.is_empty()).is_true();
        assert_that!(state.discarding).is_equal_to(assigned.clone());

        state.begin_phase();
        assert_that!(state.queueing).is_equal_to(assigned.clone());
        assert_that!(state.discarding.is_empty()).is_true();

        state.end_phase(RightBound::key(b"m".to_vec()));
        assert_that!(state.queueing.keys).is_equal_to(KeyRange::new(b"a".to_vec(), RightBound::key(b"m".to_vec())));
        assert_that!(state.discarding.keys).is_equal_to(KeyRange::new(b"m".to_vec(), RightBound::key(b"z".to_vec())));

        state.promote();
        assert_that!(state.streaming.keys).is_equal_to(KeyRange::new(b"a".to_vec(), RightBound::key(b"m".to_vec())));
        assert_that!(state.queueing.is_empty()).is_true();

        state.begin_phase();
        state.end_phase(RightBound::key(b"z".to_vec()));
        assert_that!(state.discarding.is_empty()).is_true();
        state.promote();
        assert_that!(state.streaming).is_equal_to(assigned.clone());
    }

    #[tokio::test]
    async fn test_unbounded_region() {
        let assigned = region(b"", RightBound::unbounded());
        let tracker = Tracker::new(assigned.clone());
        let never = Interruptor::never();

        let mut state = tracker.write_owned(&never).await.unwrap();
        state.begin_phase();
        state.end_phase(RightBound::unbounded());
        assert_that!(state.discarding.is_empty()).is_true();
        state.promote();
        assert_that!(state.streaming).is_equal_to(assigned);
    }

    #[tokio::test]
    #[should_panic(expected = "still queueing")]
    async fn test_begin_while_queueing() {
        let tracker = Tracker::new(region(b"a", RightBound::key(b"z".to_vec())));
        let mut state = tracker.write_owned(&Interruptor::never()).await.unwrap();
        state.begin_phase();
        state.begin_phase();
    }
}
