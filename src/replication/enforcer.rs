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

//! Total-order delivery gate for timestamped writes.

use std::collections::BTreeSet;
use std::sync::Mutex;

use anyhow::Result;
use tokio::sync::watch;

use crate::signal::Interruptor;
use crate::timestamp::StateTimestamp;

struct EnforcerState {
    prefix: StateTimestamp,
    completed: BTreeSet<StateTimestamp>,
}

/// Orders concurrently arriving writes by timestamp.
///
/// If `A.timestamp < B.timestamp`, `complete(A)` happens before any
/// `wait_all_before` covering `A` returns, so `B`'s handler observes
/// shared state no older than `A` left it. Writers call
/// `wait_all_before(t.pred())` before touching shared state and
/// `complete(t)` once their snapshot is taken.
///
/// Internally synchronized; ordered above the region lock, which means it
/// is taken first and its operations never suspend while the region lock
/// is held exclusively.
pub struct TimestampEnforcer {
    state: Mutex<EnforcerState>,
    prefix: watch::Sender<StateTimestamp>,
}

impl TimestampEnforcer {
    /// `initial` is the stream begin timestamp: everything at or beneath
    /// it counts as already delivered.
    pub fn new(initial: StateTimestamp) -> Self {
        Self {
            state: Mutex::new(EnforcerState { prefix: initial, completed: BTreeSet::new() }),
            prefix: watch::channel(initial).0,
        }
    }

    /// Marks `timestamp` delivered. Completing a timestamp twice is a
    /// protocol violation.
    pub fn complete(&self, timestamp: StateTimestamp) {
        let mut state = self.state.lock().unwrap();
        assert!(timestamp > state.prefix, "timestamp {timestamp} completed twice");
        assert!(state.completed.insert(timestamp), "timestamp {timestamp} completed twice");
        loop {
            let next = state.prefix.next();
            if !state.completed.remove(&next) {
                break;
            }
            state.prefix = next;
        }
        self.prefix.send_replace(state.prefix);
    }

    /// Greatest timestamp such that everything from the initial timestamp
    /// through it has been completed.
    pub fn latest_all_before_completed(&self) -> StateTimestamp {
        *self.prefix.borrow()
    }

    /// Pends until every timestamp through `timestamp` has been
    /// completed. Cancellation leaves the completed set untouched.
    pub async fn wait_all_before(&self, timestamp: StateTimestamp, interruptor: &Interruptor) -> Result<()> {
        let mut prefix = self.prefix.subscribe();
        interruptor.run(prefix.wait_for(|&now| now >= timestamp)).await?.expect("enforcer alive");
        Ok(())
    }
}
