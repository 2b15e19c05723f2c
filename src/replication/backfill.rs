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

//! Backfiller-facing interface of the construction loop.

use anyhow::Result;
use async_trait::async_trait;

use crate::range::{RegionMap, RightBound};
use crate::signal::Interruptor;
use crate::timestamp::Version;

/// Tunables of one backfill.
#[derive(Clone, Debug)]
pub struct BackfillConfig {
    /// Queue size at which the backfillee is told to pause for a drain.
    pub write_queue_count: usize,
    /// Ack release rate during a drain, in `(0, 1]`. Values beneath one
    /// guarantee the queue drains against any stream rate.
    pub write_queue_trickle_fraction: f64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self { write_queue_count: 300, write_queue_trickle_fraction: 0.5 }
    }
}

impl BackfillConfig {
    pub fn validate(&self) {
        assert!(self.write_queue_count >= 1, "write_queue_count must be at least 1");
        let fraction = self.write_queue_trickle_fraction;
        assert!(fraction > 0.0 && fraction <= 1.0, "write_queue_trickle_fraction {fraction} outside (0, 1]");
    }
}

/// Receives backfill progress. Chunks arrive in strict lexicographic
/// order; returning `false` pauses the backfill after the current chunk.
pub trait BackfillCallback: Send {
    fn on_chunk(&mut self, chunk: RegionMap<Version>) -> bool;
}

/// Pull side of a backfill against one backfiller peer. Implementations
/// install chunk data into the local store and report each chunk's
/// per-range end versions to the callback. Peer loss surfaces as an
/// error.
#[async_trait]
pub trait Backfillee: Send {
    /// Streams chunks whose keys start at `start`, until the region is
    /// exhausted, the callback declines more, or `interruptor` pulses.
    async fn go(
        &mut self,
        callback: &mut dyn BackfillCallback,
        start: RightBound,
        interruptor: &Interruptor,
    ) -> Result<()>;
}
