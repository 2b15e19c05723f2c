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

//! In-memory store engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use super::{Durability, Metainfo, OrderToken, Read, ReadResponse, ReadToken, Store, Write, WriteResponse, WriteToken};
use crate::range::{Key, Region};
use crate::signal::Interruptor;
use crate::timestamp::{StateTimestamp, Version};

/// Admits token holders strictly in allocation order. A token abandoned
/// mid-wait (interruption) leaves the gate stuck; the store must be
/// discarded along with its client afterwards.
struct TokenGate {
    issued: AtomicU64,
    serving: watch::Sender<u64>,
}

impl TokenGate {
    fn new() -> Self {
        Self { issued: AtomicU64::new(0), serving: watch::channel(0).0 }
    }

    fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst)
    }

    async fn enter(&self, token: u64, interruptor: &Interruptor) -> Result<GatePass<'_>> {
        let mut serving = self.serving.subscribe();
        interruptor.run(serving.wait_for(|&now| now == token)).await?.expect("gate sender alive");
        Ok(GatePass { gate: self, token })
    }
}

struct GatePass<'a> {
    gate: &'a TokenGate,
    token: u64,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate.serving.send_replace(self.token + 1);
    }
}

struct StoreState {
    data: BTreeMap<Key, (StateTimestamp, Vec<u8>)>,
    metainfo: Metainfo,
    /// Every stream-applied op, in apply order. Lets tests pin down
    /// exactly-once behavior.
    history: Vec<(StateTimestamp, Key)>,
}

/// In-memory store honoring the token-order serialization contract.
/// Durability is accepted and ignored; nothing here outlives the process.
pub struct MemoryStore {
    region: Region,
    state: Mutex<StoreState>,
    write_gate: TokenGate,
    read_gate: TokenGate,
    backfill_ready: watch::Sender<bool>,
}

impl MemoryStore {
    pub fn new(region: Region) -> Self {
        let metainfo = Metainfo::new(region.clone(), Version::default());
        let state = StoreState { data: BTreeMap::new(), metainfo, history: Vec::new() };
        Self {
            region,
            state: Mutex::new(state),
            write_gate: TokenGate::new(),
            read_gate: TokenGate::new(),
            backfill_ready: watch::channel(true).0,
        }
    }

    /// Marks a secondary index build in progress: backfills pend until
    /// [Self::resume_backfill].
    pub fn pause_backfill(&self) {
        self.backfill_ready.send_replace(false);
    }

    pub fn resume_backfill(&self) {
        self.backfill_ready.send_replace(true);
    }

    /// Installs backfilled items and their end-timestamp versions. This is
    /// the backfill ingest path; it bypasses write tokens and leaves no
    /// trace in the stream history.
    pub fn apply_backfill_chunk(&self, items: impl IntoIterator<Item = (Key, Vec<u8>)>, versions: Metainfo) {
        let mut state = self.state.lock().unwrap();
        let domain = versions.domain();
        assert!(self.region.contains(&domain), "backfill chunk {domain:?} beyond store region {:?}", self.region);
        for (key, value) in items {
            assert!(domain.contains_key(&key), "backfill item {key:?} outside chunk {domain:?}");
            let timestamp = versions.lookup(&key).timestamp;
            state.data.insert(key, (timestamp, value));
        }
        versions.visit(&domain, |region, version| state.metainfo.update(region, *version));
    }

    pub fn value(&self, key: &[u8]) -> Option<(StateTimestamp, Vec<u8>)> {
        self.state.lock().unwrap().data.get(key).cloned()
    }

    pub fn write_history(&self) -> Vec<(StateTimestamp, Key)> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn metainfo(&self) -> Metainfo {
        self.state.lock().unwrap().metainfo.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn get_region(&self) -> Region {
        self.region.clone()
    }

    fn new_write_token(&self) -> WriteToken {
        WriteToken(self.write_gate.issue())
    }

    fn new_read_token(&self) -> ReadToken {
        ReadToken(self.read_gate.issue())
    }

    async fn write(
        &self,
        new_metainfo: Metainfo,
        write: Write,
        _durability: Durability,
        timestamp: StateTimestamp,
        _order_token: OrderToken,
        token: WriteToken,
        interruptor: &Interruptor,
    ) -> Result<WriteResponse> {
        let _pass = self.write_gate.enter(token.0, interruptor).await?;
        let mut state = self.state.lock().unwrap();
        let domain = new_metainfo.domain();
        assert!(self.region.contains(&domain), "write metainfo {domain:?} beyond store region {:?}", self.region);
        let (_, version) = new_metainfo.iter().next().expect("metainfo has a segment");
        assert_eq!(version.timestamp, timestamp, "metainfo version disagrees with write timestamp");
        let expect = Version::new(version.branch, timestamp.pred());
        state.metainfo.visit(&domain, |region, actual| {
            assert_eq!(*actual, expect, "expected version {expect} beneath write at {timestamp} for {region:?}");
        });
        for op in &write.ops {
            assert!(domain.contains_key(&op.key), "write op {:?} outside metainfo domain {domain:?}", op.key);
            match &op.value {
                Some(value) => {
                    state.data.insert(op.key.clone(), (timestamp, value.clone()));
                },
                None => {
                    state.data.remove(&op.key);
                },
            }
            state.history.push((timestamp, op.key.clone()));
        }
        new_metainfo.visit(&domain, |region, version| state.metainfo.update(region, *version));
        Ok(WriteResponse { applied: write.ops.len() })
    }

    async fn set_metainfo(
        &self,
        new_metainfo: Metainfo,
        _order_token: OrderToken,
        token: WriteToken,
        _durability: Durability,
        interruptor: &Interruptor,
    ) -> Result<()> {
        let _pass = self.write_gate.enter(token.0, interruptor).await?;
        let mut state = self.state.lock().unwrap();
        let domain = new_metainfo.domain();
        assert!(self.region.contains(&domain), "metainfo {domain:?} beyond store region {:?}", self.region);
        new_metainfo.visit(&domain, |region, version| state.metainfo.update(region, *version));
        Ok(())
    }

    async fn get_metainfo(
        &self,
        _order_token: OrderToken,
        token: ReadToken,
        region: &Region,
        interruptor: &Interruptor,
    ) -> Result<Metainfo> {
        let _pass = self.read_gate.enter(token.0, interruptor).await?;
        let state = self.state.lock().unwrap();
        Ok(state.metainfo.clip(region))
    }

    async fn read(&self, read: Read, token: ReadToken, interruptor: &Interruptor) -> Result<ReadResponse> {
        let _pass = self.read_gate.enter(token.0, interruptor).await?;
        let state = self.state.lock().unwrap();
        Ok(ReadResponse { value: state.data.get(&read.key).cloned() })
    }

    async fn wait_until_ok_to_receive_backfill(&self, interruptor: &Interruptor) -> Result<()> {
        let mut ready = self.backfill_ready.subscribe();
        interruptor.run(ready.wait_for(|&ready| ready)).await?.expect("backfill sender alive");
        Ok(())
    }
}
