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

//! Remote replica construction and write routing.
//!
//! The client here is the receive side of a live backfill interleaved
//! with a continuous replication stream: it registers for the primary's
//! write stream, pulls a bulk snapshot from a backfiller peer phase by
//! phase, and guarantees every write lands on the local store exactly
//! once despite the overlap between the two sources.

pub mod backfill;
pub mod client;
pub mod enforcer;
pub mod queue;
pub mod registrant;
pub mod replica;
pub mod status;
pub mod throttler;
pub mod timestamps;
pub mod tracker;

use std::fmt::{self, Display, Formatter};

use uuid::Uuid;

pub use self::backfill::{BackfillCallback, BackfillConfig, Backfillee};
pub use self::client::RemoteReplicatorClient;
pub use self::enforcer::TimestampEnforcer;
pub use self::queue::{QueueEntry, StreamQueue, MAX_CONCURRENT_STREAM_QUEUE_ITEMS};
pub use self::registrant::Registrant;
pub use self::replica::Replica;
pub use self::status::{wait_for_table_readiness, TableReadiness, TableState};
pub use self::throttler::{BackfillLock, BackfillThrottler};
pub use self::timestamps::BackfillEndTimestamps;
use crate::mailbox::Address;
use crate::range::Region;
use crate::store::{Durability, OrderToken, Read, ReadResponse, Write, WriteResponse};
use crate::timestamp::{BranchId, StateTimestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(Uuid);

impl ServerId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One timestamped write from the primary's dispatcher. Acked once it has
/// reached its resting place for the current construction phase: applied,
/// queued, or discarded.
#[derive(Debug)]
pub struct AsyncWriteRequest {
    pub write: Write,
    pub timestamp: StateTimestamp,
    pub order_token: OrderToken,
    pub ack: Address<()>,
}

/// A synchronous write routed through the replica with the requested
/// durability. Only sent after the ready signal.
#[derive(Debug)]
pub struct SyncWriteRequest {
    pub write: Write,
    pub timestamp: StateTimestamp,
    pub order_token: OrderToken,
    pub durability: Durability,
    pub ack: Address<WriteResponse>,
}

#[derive(Debug)]
pub struct ReadRequest {
    pub read: Read,
    pub min_timestamp: StateTimestamp,
    pub ack: Address<ReadResponse>,
}

/// The primary's reply to a registration: where the write stream begins
/// and where to announce construction completion.
#[derive(Debug)]
pub struct ClientIntro {
    pub streaming_begin_timestamp: StateTimestamp,
    pub ready: Address<()>,
}

/// Business card a client publishes when registering with the primary.
#[derive(Debug)]
pub struct ClientBcard {
    pub server: ServerId,
    pub intro: Address<ClientIntro>,
    pub write_async: Address<AsyncWriteRequest>,
    pub write_sync: Address<SyncWriteRequest>,
    pub read: Address<ReadRequest>,
}

#[derive(Debug)]
pub enum RegistrarRequest {
    Register(ClientBcard),
    Deregister(ServerId),
}

/// Asks the backfiller peer to catch up past `timestamp` before the next
/// backfill phase, so the phase's end timestamps come out at or beyond it.
#[derive(Debug)]
pub struct SynchronizeRequest {
    pub timestamp: StateTimestamp,
    pub ack: Address<()>,
}

/// What a client needs to know about the primary.
#[derive(Clone, Debug)]
pub struct PrimaryBcard {
    pub branch: BranchId,
    pub region: Region,
    pub registrar: Address<RegistrarRequest>,
}

/// What a client needs to know about the backfiller peer.
#[derive(Clone, Debug)]
pub struct ReplicaBcard {
    pub peer: PeerId,
    pub synchronize: Address<SynchronizeRequest>,
}
