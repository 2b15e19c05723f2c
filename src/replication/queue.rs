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

//! Queue holding stream writes while a backfill phase runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ignore_result::Ignore;
use static_assertions::assert_impl_all;
use tokio::sync::oneshot;

use crate::store::{OrderCheckpoint, OrderToken, Write};
use crate::timestamp::StateTimestamp;

/// Upper bound on concurrently applying queue entries during a drain.
pub const MAX_CONCURRENT_STREAM_QUEUE_ITEMS: usize = 16;

/// One queued stream write. `has_write` is false when the write has no
/// effect on the queueing region; the entry still advances the metainfo.
#[derive(Debug)]
pub struct QueueEntry {
    pub has_write: bool,
    pub write: Write,
    pub timestamp: StateTimestamp,
    pub order_token: OrderToken,
}

enum AckStrategy {
    /// Release the ack as soon as the entry is admitted.
    Immediate,
    /// Hold acks back and release them at `fraction` per drained entry.
    /// Because the fraction is beneath one, writes are acked strictly
    /// slower than they drain and the queue must eventually empty.
    Trickle {
        fraction: f64,
        due: f64,
        pending: VecDeque<oneshot::Sender<()>>,
    },
}

struct QueueState {
    entries: VecDeque<QueueEntry>,
    acks: AckStrategy,
    checkpoint: OrderCheckpoint,
}

/// Single-consumer queue of stream writes with a swappable ack strategy.
/// Entries are pushed by the write router under the region lock and
/// popped by the drainer.
#[derive(Clone)]
pub struct StreamQueue {
    state: Arc<Mutex<QueueState>>,
}

assert_impl_all!(StreamQueue: Send, Sync);

impl Default for StreamQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamQueue {
    pub fn new() -> Self {
        let state = QueueState {
            entries: VecDeque::new(),
            acks: AckStrategy::Immediate,
            checkpoint: OrderCheckpoint::new(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admits an entry and returns the throttle the pushing write waits
    /// on before acking the primary.
    pub fn push(&self, mut entry: QueueEntry) -> oneshot::Receiver<()> {
        let (release, throttle) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        entry.order_token = state.checkpoint.check_through(entry.order_token);
        state.entries.push_back(entry);
        match &mut state.acks {
            AckStrategy::Immediate => release.send(()).ignore(),
            AckStrategy::Trickle { due, pending, .. } => {
                if *due >= 1.0 {
                    *due -= 1.0;
                    release.send(()).ignore();
                } else {
                    pending.push_back(release);
                }
            },
        }
        throttle
    }

    pub fn pop(&self) -> Option<QueueEntry> {
        self.state.lock().unwrap().entries.pop_front()
    }

    /// Switches to trickled acks for the drain.
    pub fn begin_trickle(&self, fraction: f64) {
        assert!(fraction > 0.0 && fraction <= 1.0, "trickle fraction {fraction} outside (0, 1]");
        let mut state = self.state.lock().unwrap();
        assert!(matches!(state.acks, AckStrategy::Immediate), "trickle began twice");
        state.acks = AckStrategy::Trickle { fraction, due: 0.0, pending: VecDeque::new() };
    }

    /// Accounts one drained entry, releasing a held ack when the
    /// accumulator crosses one.
    pub fn finish_entry(&self) {
        let mut state = self.state.lock().unwrap();
        if let AckStrategy::Trickle { fraction, due, pending } = &mut state.acks {
            *due += *fraction;
            if *due >= 1.0 {
                if let Some(release) = pending.pop_front() {
                    *due -= 1.0;
                    release.send(()).ignore();
                }
            }
        }
    }

    /// Releases every held ack and returns to immediate acking. Called
    /// once the drain left the queue empty.
    pub fn release_all(&self) {
        let mut state = self.state.lock().unwrap();
        if let AckStrategy::Trickle { pending, .. } = &mut state.acks {
            for release in pending.drain(..) {
                release.send(()).ignore();
            }
        }
        state.acks = AckStrategy::Immediate;
    }
}
