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

//! Registration handle with the primary's registrar.

use super::{ClientBcard, RegistrarRequest, ServerId};
use crate::mailbox::Address;

/// Keeps one client registered for the primary's write stream. Dropping
/// it deregisters. Peer loss is observable here and nowhere else: mailbox
/// sends are fire-and-forget.
#[derive(Debug)]
pub struct Registrant {
    registrar: Address<RegistrarRequest>,
    server: ServerId,
}

impl Registrant {
    pub fn new(registrar: Address<RegistrarRequest>, bcard: ClientBcard) -> Self {
        let server = bcard.server;
        registrar.send(RegistrarRequest::Register(bcard));
        Self { registrar, server }
    }

    pub fn server(&self) -> ServerId {
        self.server
    }

    pub fn is_peer_gone(&self) -> bool {
        self.registrar.is_closed()
    }

    /// Completes when the primary goes away.
    pub async fn peer_gone(&self) {
        self.registrar.closed().await
    }
}

impl Drop for Registrant {
    fn drop(&mut self) {
        self.registrar.send(RegistrarRequest::Deregister(self.server));
    }
}
