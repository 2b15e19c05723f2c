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

//! Typed point-to-point mailboxes.
//!
//! A mailbox owns the receive side of a message stream; any number of
//! addresses feed it. Sends are best effort and fire-and-forget: a message
//! to a dropped mailbox vanishes silently. Peer death is not reported at
//! this layer.

use std::fmt::{self, Debug, Formatter};

use ignore_result::Ignore;
use tokio::sync::mpsc;

pub struct Mailbox<T> {
    sender: mpsc::UnboundedSender<T>,
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T: Send> Mailbox<T> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { sender, receiver }
    }

    pub fn address(&self) -> Address<T> {
        Address { sender: self.sender.clone() }
    }

    /// Receives the next message. The mailbox itself holds an address, so
    /// this pends while no message is outstanding; callers race it with
    /// their interruptor.
    pub async fn recv(&mut self) -> T {
        self.receiver.recv().await.expect("mailbox holds a sender")
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

impl<T: Send> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Address<T> {
    sender: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Address<T> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone() }
    }
}

impl<T: Send> Address<T> {
    pub fn send(&self, message: T) {
        self.sender.send(message).ignore()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Completes once the owning mailbox is dropped.
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

impl<T> Debug for Address<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Address<{}>", std::any::type_name::<T>())
    }
}
