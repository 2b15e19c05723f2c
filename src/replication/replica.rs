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

//! Steady-state serving path of a constructed replica.

use std::sync::Arc;

use anyhow::Result;

use super::enforcer::TimestampEnforcer;
use crate::signal::Interruptor;
use crate::store::{Durability, Metainfo, OrderToken, Read, ReadResponse, Store, Write, WriteResponse};
use crate::timestamp::{BranchId, StateTimestamp, Version};

/// Serves reads and writes against the local store once construction has
/// fully synchronized it. Keeps its own timestamp ordering: it never
/// trusts callers to arrive in order.
pub struct Replica {
    store: Arc<dyn Store>,
    branch: BranchId,
    enforcer: TimestampEnforcer,
}

impl Replica {
    /// `current` is the timestamp the whole store region is at.
    pub fn new(store: Arc<dyn Store>, branch: BranchId, current: StateTimestamp) -> Self {
        Self { store, branch, enforcer: TimestampEnforcer::new(current) }
    }

    pub fn current(&self) -> StateTimestamp {
        self.enforcer.latest_all_before_completed()
    }

    pub async fn do_write(
        &self,
        write: Write,
        timestamp: StateTimestamp,
        order_token: OrderToken,
        durability: Durability,
        interruptor: &Interruptor,
    ) -> Result<WriteResponse> {
        self.enforcer.wait_all_before(timestamp.pred(), interruptor).await?;
        let token = self.store.new_write_token();
        self.enforcer.complete(timestamp);
        let region = self.store.get_region();
        let new_metainfo = Metainfo::new(region, Version::new(self.branch, timestamp));
        self.store.write(new_metainfo, write, durability, timestamp, order_token, token, interruptor).await
    }

    /// Serves `read` no earlier than `min_timestamp`: pends until every
    /// write through it has been applied.
    pub async fn do_read(
        &self,
        read: Read,
        min_timestamp: StateTimestamp,
        interruptor: &Interruptor,
    ) -> Result<ReadResponse> {
        self.enforcer.wait_all_before(min_timestamp, interruptor).await?;
        let token = self.store.new_read_token();
        self.store.read(read, token, interruptor).await
    }
}
