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

//! Cancellation signal threaded through every suspension point.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Pulse side of an interruption signal. Dropping the trigger without
/// pulsing interrupts waiters as well, so teardown never strands them.
#[derive(Debug)]
pub struct Trigger {
    sender: Arc<watch::Sender<bool>>,
}

impl Trigger {
    pub fn pulse(&self) {
        self.sender.send_replace(true);
    }

    pub fn interruptor(&self) -> Interruptor {
        Interruptor { _owner: None, receiver: self.sender.subscribe() }
    }
}

/// Wait side of an interruption signal. Cheap to clone; observed at the
/// next suspension point.
#[derive(Clone, Debug)]
pub struct Interruptor {
    _owner: Option<Arc<watch::Sender<bool>>>,
    receiver: watch::Receiver<bool>,
}

pub fn interruption() -> (Trigger, Interruptor) {
    let (sender, receiver) = watch::channel(false);
    let sender = Arc::new(sender);
    let interruptor = Interruptor { _owner: None, receiver };
    (Trigger { sender }, interruptor)
}

impl Interruptor {
    /// An interruptor that never pulses. Handy for steady-state callers
    /// with no cancellation scope.
    pub fn never() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { _owner: Some(Arc::new(sender)), receiver }
    }

    pub fn is_pulsed(&self) -> bool {
        *self.receiver.borrow()
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        match self.is_pulsed() {
            true => Err(Interrupted),
            false => Ok(()),
        }
    }

    /// Runs `future` to completion unless the signal pulses first.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, Interrupted> {
        let mut receiver = self.receiver.clone();
        if *receiver.borrow_and_update() {
            return Err(Interrupted);
        }
        tokio::select! {
            output = future => Ok(output),
            _ = receiver.wait_for(|pulsed| *pulsed) => Err(Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[tokio::test]
    async fn test_interruption() {
        let (trigger, interruptor) = interruption();
        assert_that!(interruptor.is_pulsed()).is_false();
        assert_that!(interruptor.run(async { 7 }).await).is_equal_to(Ok(7));

        trigger.pulse();
        assert_that!(interruptor.is_pulsed()).is_true();
        assert_that!(interruptor.check()).is_equal_to(Err(Interrupted));
        assert_that!(interruptor.run(std::future::pending::<()>()).await).is_equal_to(Err(Interrupted));
    }

    #[tokio::test]
    async fn test_interrupts_pending_wait() {
        let (trigger, interruptor) = interruption();
        let waiter = tokio::spawn(async move { interruptor.run(std::future::pending::<()>()).await });
        trigger.pulse();
        assert_that!(waiter.await.unwrap()).is_equal_to(Err(Interrupted));
    }

    #[tokio::test]
    async fn test_trigger_drop_interrupts() {
        let (trigger, interruptor) = interruption();
        drop(trigger);
        assert_that!(interruptor.run(std::future::pending::<()>()).await).is_equal_to(Err(Interrupted));
    }

    #[tokio::test]
    async fn test_never() {
        let interruptor = Interruptor::never();
        assert_that!(interruptor.run(async { 1 }).await).is_equal_to(Ok(1));
    }
}
