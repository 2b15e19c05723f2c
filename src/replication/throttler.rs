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

//! Process-wide backfill admission.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use hashbrown::hash_map::HashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::PeerId;
use crate::signal::Interruptor;

/// Serializes backfills fanning into one backfiller peer so concurrent
/// replica constructions do not trample each other. Passed in as a
/// capability at client construction.
pub struct BackfillThrottler {
    per_peer: usize,
    semaphores: Mutex<HashMap<PeerId, Arc<Semaphore>>>,
}

impl Default for BackfillThrottler {
    fn default() -> Self {
        Self::new(1)
    }
}

impl BackfillThrottler {
    pub fn new(per_peer: usize) -> Self {
        assert!(per_peer >= 1, "backfill throttler with no capacity");
        Self { per_peer, semaphores: Mutex::new(HashMap::new()) }
    }

    /// Pends for an admission slot against `peer`. The slot is released
    /// when the returned lock drops.
    pub async fn lock(&self, peer: PeerId, interruptor: &Interruptor) -> Result<BackfillLock> {
        let semaphore = {
            let mut semaphores = self.semaphores.lock().unwrap();
            semaphores.entry(peer).or_insert_with(|| Arc::new(Semaphore::new(self.per_peer))).clone()
        };
        let permit = interruptor.run(semaphore.acquire_owned()).await?.expect("throttler semaphore never closes");
        Ok(BackfillLock { peer, _permit: permit })
    }
}

pub struct BackfillLock {
    peer: PeerId,
    _permit: OwnedSemaphorePermit,
}

impl BackfillLock {
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::signal::interruption;

    #[tokio::test]
    async fn test_serializes_per_peer() {
        let throttler = Arc::new(BackfillThrottler::new(1));
        let peer = PeerId::new_random();
        let never = Interruptor::never();

        let first = throttler.lock(peer, &never).await.unwrap();
        let second = tokio::spawn({
            let throttler = throttler.clone();
            async move { throttler.lock(peer, &Interruptor::never()).await }
        });
        tokio::task::yield_now().await;
        assert_that!(second.is_finished()).is_false();

        // A different peer is admitted straight away.
        throttler.lock(PeerId::new_random(), &never).await.unwrap();

        drop(first);
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_interruptible() {
        let throttler = BackfillThrottler::new(1);
        let peer = PeerId::new_random();
        let _held = throttler.lock(peer, &Interruptor::never()).await.unwrap();

        let (trigger, interruptor) = interruption();
        trigger.pulse();
        assert_that!(throttler.lock(peer, &interruptor).await.is_err()).is_true();
    }
}
