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

//! Durable store engine interface consumed by the replication core.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::range::{Key, Region, RegionMap};
use crate::signal::Interruptor;
use crate::timestamp::{StateTimestamp, Version};

/// Store metainfo: which `(branch, timestamp)` each sub-region of the
/// resident data is at.
pub type Metainfo = RegionMap<Version>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Durability {
    /// Acknowledged before reaching disk. Every construction-time write
    /// uses this so an aborted construction commits nothing.
    Soft,
    Hard,
}

/// Dispatch-order marker stamped by the primary. Checkpoints assert that
/// tokens pass through a pipeline stage in non-decreasing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderToken(u64);

impl OrderToken {
    /// Sidesteps order checking: for operations outside any dispatch
    /// pipeline, like the end-of-construction metainfo read.
    pub const IGNORE: Self = Self(u64::MAX);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn into_raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct OrderCheckpoint {
    last: spin::Mutex<Option<OrderToken>>,
}

impl OrderCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_through(&self, token: OrderToken) -> OrderToken {
        if token == OrderToken::IGNORE {
            return token;
        }
        let mut last = self.last.lock();
        if let Some(last) = *last {
            assert!(last <= token, "order token {token:?} regressed beneath {last:?}");
        }
        *last = Some(token);
        token
    }
}

/// FIFO write slot. Single use: the slot is consumed by the store
/// operation it serializes.
#[derive(Debug)]
pub struct WriteToken(pub(crate) u64);

/// FIFO read slot.
#[derive(Debug)]
pub struct ReadToken(pub(crate) u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteOp {
    pub key: Key,
    /// `None` erases the key.
    pub value: Option<Vec<u8>>,
}

/// A batch of independent single-key operations carried by one stream
/// timestamp. A write may span sub-regions; `shard` restricts it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Write {
    pub ops: Vec<WriteOp>,
}

impl Write {
    pub fn put(key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Self {
        Self { ops: vec![WriteOp { key: key.into(), value: Some(value.into()) }] }
    }

    pub fn erase(key: impl Into<Key>) -> Self {
        Self { ops: vec![WriteOp { key: key.into(), value: None }] }
    }

    pub fn batch(ops: impl IntoIterator<Item = WriteOp>) -> Self {
        Self { ops: ops.into_iter().collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Restricts this write to `region`. Returns `None` when nothing of
    /// it lands there.
    pub fn shard(&self, region: &Region) -> Option<Write> {
        let ops: Vec<_> = self.ops.iter().filter(|op| region.contains_key(&op.key)).cloned().collect();
        match ops.is_empty() {
            true => None,
            false => Some(Write { ops }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteResponse {
    pub applied: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Read {
    pub key: Key,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadResponse {
    pub value: Option<(StateTimestamp, Vec<u8>)>,
}

/// The store engine operations the replication core consumes.
///
/// Token allocation is synchronous and establishes the serialization
/// order: operations reach the engine in token order regardless of the
/// order their tasks get around to calling in.
#[async_trait]
pub trait Store: Send + Sync {
    fn get_region(&self) -> Region;

    fn new_write_token(&self) -> WriteToken;

    fn new_read_token(&self) -> ReadToken;

    /// Applies `write` at `timestamp` and moves the metainfo of
    /// `new_metainfo`'s domain to it.
    async fn write(
        &self,
        new_metainfo: Metainfo,
        write: Write,
        durability: Durability,
        timestamp: StateTimestamp,
        order_token: OrderToken,
        token: WriteToken,
        interruptor: &Interruptor,
    ) -> Result<WriteResponse>;

    /// Moves metainfo without touching data: the "advance only" half of a
    /// write whose restriction to the target region came up empty.
    async fn set_metainfo(
        &self,
        new_metainfo: Metainfo,
        order_token: OrderToken,
        token: WriteToken,
        durability: Durability,
        interruptor: &Interruptor,
    ) -> Result<()>;

    async fn get_metainfo(
        &self,
        order_token: OrderToken,
        token: ReadToken,
        region: &Region,
        interruptor: &Interruptor,
    ) -> Result<Metainfo>;

    async fn read(&self, read: Read, token: ReadToken, interruptor: &Interruptor) -> Result<ReadResponse>;

    /// Pends while the store is constructing a secondary index; a
    /// backfill may not start or resume until it finishes.
    async fn wait_until_ok_to_receive_backfill(&self, interruptor: &Interruptor) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::range::{HashRange, KeyRange, RightBound};

    #[test]
    fn test_write_shard() {
        let write = Write::batch([
            WriteOp { key: b"b".to_vec(), value: Some(b"1".to_vec()) },
            WriteOp { key: b"d".to_vec(), value: None },
        ]);
        let region = Region::new(
            HashRange::universe(),
            KeyRange::new(b"a".to_vec(), RightBound::key(b"c".to_vec())),
        );
        let sharded = write.shard(&region).unwrap();
        assert_that!(sharded.ops.len()).is_equal_to(1);
        assert_that!(sharded.ops[0].key.as_slice()).is_equal_to(b"b".as_slice());

        let empty = Region::new(HashRange::universe(), KeyRange::empty());
        assert_that!(write.shard(&empty).is_none()).is_true();
    }

    #[test]
    fn test_order_checkpoint() {
        let checkpoint = OrderCheckpoint::new();
        checkpoint.check_through(OrderToken::from_raw(1));
        checkpoint.check_through(OrderToken::from_raw(1));
        checkpoint.check_through(OrderToken::from_raw(3));
    }

    #[test]
    #[should_panic(expected = "regressed")]
    fn test_order_checkpoint_regression() {
        let checkpoint = OrderCheckpoint::new();
        checkpoint.check_through(OrderToken::from_raw(3));
        checkpoint.check_through(OrderToken::from_raw(2));
    }
}
