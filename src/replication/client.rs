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

//! Remote replica client: staged backfill interleaved with the live
//! write stream.
//!
//! Construction proceeds phase by phase. Each phase starts queueing the
//! not-yet-backfilled remainder, synchronizes the backfiller past the
//! stream position, backfills until the queue fills, then drains the
//! queue under trickled acks and promotes the drained range to
//! streaming. Stream writes arriving meanwhile are split across the
//! partition: applied directly where streaming, queued where queueing,
//! dropped where discarding. The backfill-end-timestamp map keeps the
//! overlap between the two sources from applying any write twice.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::{watch, OwnedRwLockWriteGuard, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace};

use super::backfill::{BackfillCallback, BackfillConfig, Backfillee};
use super::enforcer::TimestampEnforcer;
use super::queue::{QueueEntry, StreamQueue, MAX_CONCURRENT_STREAM_QUEUE_ITEMS};
use super::registrant::Registrant;
use super::replica::Replica;
use super::throttler::BackfillThrottler;
use super::timestamps::BackfillEndTimestamps;
use super::tracker::{Tracker, TrackerState};
use super::{
    AsyncWriteRequest,
    ClientBcard,
    ClientIntro,
    PrimaryBcard,
    ReadRequest,
    ReplicaBcard,
    ServerId,
    SynchronizeRequest,
    SyncWriteRequest,
};
use crate::mailbox::Mailbox;
use crate::range::{Region, RegionMap, RightBound};
use crate::signal::{interruption, Interruptor, Trigger};
use crate::store::{Durability, Metainfo, OrderToken, Store, WriteToken};
use crate::timestamp::{BranchId, Version};

/// State the write router consults on every message, shared between the
/// construction sequence and the handler tasks. Handlers hold this and
/// never the client itself, so teardown cannot cycle.
struct RouterShared {
    store: Arc<dyn Store>,
    branch: BranchId,
    tracker: Tracker,
    registered: watch::Sender<bool>,
    enforcer: OnceLock<Arc<TimestampEnforcer>>,
}

impl RouterShared {
    fn enforcer(&self) -> Arc<TimestampEnforcer> {
        self.enforcer.get().expect("write routed before registration").clone()
    }

    async fn wait_registered(&self, interruptor: &Interruptor) -> Result<()> {
        let mut registered = self.registered.subscribe();
        interruptor.run(registered.wait_for(|&registered| registered)).await?.expect("router shared alive");
        Ok(())
    }
}

/// Brings a secondary replica of one `(branch, region)` pair from empty
/// to synchronized with the primary, then routes its write stream.
///
/// [RemoteReplicatorClient::start] returns once the whole region is
/// streaming and the primary has been told it may send reads and sync
/// writes. The client keeps serving until dropped; [Self::shutdown]
/// revokes the handlers and joins them first.
pub struct RemoteReplicatorClient {
    shared: Arc<RouterShared>,
    registrant: Registrant,
    teardown: Trigger,
    handlers: Vec<JoinHandle<()>>,
}

impl RemoteReplicatorClient {
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        throttler: Arc<BackfillThrottler>,
        config: BackfillConfig,
        server: ServerId,
        primary: PrimaryBcard,
        replica_peer: ReplicaBcard,
        backfillee: Box<dyn Backfillee>,
        store: Arc<dyn Store>,
        interruptor: &Interruptor,
    ) -> Result<Self> {
        config.validate();
        let region = store.get_region();
        assert_eq!(primary.region, region, "primary bcard region disagrees with the store region");

        let shared = Arc::new(RouterShared {
            store,
            branch: primary.branch,
            tracker: Tracker::new(region),
            registered: watch::channel(false).0,
            enforcer: OnceLock::new(),
        });

        let (teardown, handler_interruptor) = interruption();
        let intro_mailbox = Mailbox::new();
        let write_async_mailbox = Mailbox::new();
        let write_sync_mailbox = Mailbox::new();
        let read_mailbox = Mailbox::new();
        let bcard = ClientBcard {
            server,
            intro: intro_mailbox.address(),
            write_async: write_async_mailbox.address(),
            write_sync: write_sync_mailbox.address(),
            read: read_mailbox.address(),
        };
        let handlers = vec![
            spawn_router(shared.clone(), write_async_mailbox, handler_interruptor.clone(), handle_write_async),
            spawn_router(shared.clone(), write_sync_mailbox, handler_interruptor.clone(), handle_write_sync),
            spawn_router(shared.clone(), read_mailbox, handler_interruptor, handle_read),
        ];

        // Construction aborts on the caller's signal or on primary loss,
        // whichever pulses first.
        let (abort, construction_interruptor) = interruption();
        let watcher = tokio::spawn({
            let registrar = primary.registrar.clone();
            let caller = interruptor.clone();
            async move {
                tokio::select! {
                    _ = registrar.closed() => {},
                    _ = caller.run(std::future::pending::<()>()) => {},
                }
                abort.pulse();
            }
        });

        let result = Self::construct(
            &shared,
            &throttler,
            &config,
            &primary,
            &replica_peer,
            backfillee,
            bcard,
            intro_mailbox,
            &construction_interruptor,
        )
        .await;
        watcher.abort();
        let registrant = result?;
        Ok(Self { shared, registrant, teardown, handlers })
    }

    #[allow(clippy::too_many_arguments)]
    async fn construct(
        shared: &Arc<RouterShared>,
        throttler: &BackfillThrottler,
        config: &BackfillConfig,
        primary: &PrimaryBcard,
        replica_peer: &ReplicaBcard,
        mut backfillee: Box<dyn Backfillee>,
        bcard: ClientBcard,
        mut intro_mailbox: Mailbox<ClientIntro>,
        interruptor: &Interruptor,
    ) -> Result<Registrant> {
        let store = &shared.store;
        let region = store.get_region();
        let branch = shared.branch;

        // Admission against the backfiller peer is held for the whole
        // construction.
        let _backfill_lock = throttler.lock(replica_peer.peer, interruptor).await?;
        store.wait_until_ok_to_receive_backfill(interruptor).await?;

        let registrant = Registrant::new(primary.registrar.clone(), bcard);
        let intro = interruptor.run(intro_mailbox.recv()).await?;
        let enforcer = Arc::new(TimestampEnforcer::new(intro.streaming_begin_timestamp));
        shared.enforcer.set(enforcer.clone()).unwrap_or_else(|_| panic!("timestamp enforcer installed twice"));
        shared.registered.send_replace(true);
        debug!("replica {} registered; stream begins at {}", registrant.server(), intro.streaming_begin_timestamp);

        // From here the stream is live, discarded in full until the first
        // phase starts queueing.
        let mut guard = Some(shared.tracker.write_owned(interruptor).await?);
        while guard.as_ref().unwrap().streaming.keys.end != region.keys.end {
            guard = None;
            // Between phases nothing is queued, so this is the spot to
            // wait out a secondary index build.
            store.wait_until_ok_to_receive_backfill(interruptor).await?;

            let mut state = shared.tracker.write_owned(interruptor).await?;
            state.begin_phase();
            let queue = StreamQueue::new();
            state.queue = Some(queue.clone());
            let backfill_start = enforcer.latest_all_before_completed();
            let queueing_left = state.queueing.keys.start.clone();
            drop(state);

            // The backfiller must get past the stream position before it
            // snapshots, so this phase's end timestamps come out at or
            // beyond `backfill_start`.
            let mut synchronized = Mailbox::new();
            replica_peer
                .synchronize
                .send(SynchronizeRequest { timestamp: backfill_start, ack: synchronized.address() });
            interruptor.run(synchronized.recv()).await?;

            trace!("backfilling from {queueing_left:?}; stream at {backfill_start}");
            let mut progress = BackfillProgress {
                queue: queue.clone(),
                limit: config.write_queue_count,
                bets: BackfillEndTimestamps::new(),
                right: RightBound::key(queueing_left.clone()),
            };
            backfillee.go(&mut progress, RightBound::key(queueing_left), interruptor).await?;
            let BackfillProgress { bets, right: reached, .. } = progress;

            // Once every stream write the map covers sits in the queue,
            // draining against the map alone is sound.
            enforcer.wait_all_before(bets.max_timestamp(), interruptor).await?;

            let mut state = shared.tracker.write_owned(interruptor).await?;
            state.end_phase(reached);
            queue.begin_trickle(config.write_queue_trickle_fraction);
            drop(state);

            let mut slot = None;
            Self::drain_stream_queue(store, branch, &queue, &bets, &shared.tracker, &mut slot, interruptor).await?;
            let mut state = slot.expect("drain concludes holding the lock");
            assert!(queue.is_empty(), "drain concluded with queued writes");

            // Back to unthrottled admission; release whatever the trickle
            // still holds.
            queue.release_all();
            state.queue = None;
            state.promote();
            debug!("streaming extended through {:?}", state.streaming.keys.end);
            guard = Some(state);
        }
        let mut state = guard.take().expect("loop leaves the lock held");

        // The store must now be uniformly at the stream position on the
        // right branch; anything else is a protocol violation.
        let token = store.new_read_token();
        let metainfo = store.get_metainfo(OrderToken::IGNORE, token, &region, interruptor).await?;
        let expect = Version::new(branch, enforcer.latest_all_before_completed());
        metainfo.visit(&region, |sub, actual| {
            assert_eq!(*actual, expect, "construction left {sub:?} at {actual}, expected {expect}");
        });

        state.replica = Some(Arc::new(Replica::new(store.clone(), branch, enforcer.latest_all_before_completed())));
        drop(state);

        // Fully caught up: tell the primary to send reads and sync
        // writes.
        intro.ready.send(());
        debug!("replica {} construction complete", registrant.server());
        Ok(registrant)
    }

    /// Applies queued entries to the store with bounded concurrency.
    /// Concludes only while holding the region lock over an empty queue,
    /// which is what lets the caller promote the drained range. The lock
    /// is handed back through `slot`.
    async fn drain_stream_queue(
        store: &Arc<dyn Store>,
        branch: BranchId,
        queue: &StreamQueue,
        bets: &BackfillEndTimestamps,
        tracker: &Tracker,
        slot: &mut Option<OwnedRwLockWriteGuard<TrackerState>>,
        interruptor: &Interruptor,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_STREAM_QUEUE_ITEMS));
        let mut tasks = Vec::new();
        loop {
            if queue.is_empty() {
                // Entries may race in while we wait for the lock, so
                // check again once it is held.
                if slot.is_none() {
                    *slot = Some(tracker.write_owned(interruptor).await?);
                }
                if queue.is_empty() {
                    break;
                }
            }
            let permit = interruptor.run(semaphore.clone().acquire_owned()).await?.expect("semaphore never closes");
            let mut entry = queue.pop().expect("queue is non-empty");

            // Apply only where the backfilled state is older than this
            // write; elsewhere the backfill already includes it.
            let applicable = bets.region_for_timestamp(entry.timestamp);
            if entry.has_write {
                match entry.write.shard(&applicable) {
                    Some(write) => entry.write = write,
                    None => entry.has_write = false,
                }
            }
            if applicable.is_empty() {
                queue.finish_entry();
                continue;
            }

            // Allocate before spawning: the caller's order here is the
            // store-side serialization order of the queued writes.
            let token = store.new_write_token();
            tasks.push(tokio::spawn({
                let store = store.clone();
                let queue = queue.clone();
                let interruptor = interruptor.clone();
                async move {
                    // Runs to completion even while the drainer tears
                    // down; only interruption cuts a write short, and the
                    // trickle account is skipped then.
                    match apply_write_or_metainfo(&store, branch, &applicable, entry, token, &interruptor).await {
                        Ok(()) => queue.finish_entry(),
                        Err(err) => trace!("queued write abandoned: {err:?}"),
                    }
                    drop(permit);
                }
            }));
        }
        for joined in join_all(tasks).await {
            joined.unwrap();
        }
        interruptor.check()?;
        Ok(())
    }

    /// The steady-state replica. Available once `start` returned.
    pub async fn replica(&self) -> Arc<Replica> {
        let state = self.shared.tracker.read(&Interruptor::never()).await.expect("never interrupted");
        state.replica.clone().expect("construction finished")
    }

    pub fn server(&self) -> ServerId {
        self.registrant.server()
    }

    pub fn is_primary_gone(&self) -> bool {
        self.registrant.is_peer_gone()
    }

    /// Revokes the mailbox handlers and joins them, in-flight requests
    /// included: each router joins its outstanding per-message tasks
    /// before retiring, so nothing still touches the store or the
    /// replica once this returns.
    pub async fn shutdown(mut self) {
        self.teardown.pulse();
        for handler in self.handlers.drain(..) {
            let _ = handler.await;
        }
    }
}

impl Drop for RemoteReplicatorClient {
    fn drop(&mut self) {
        self.teardown.pulse();
    }
}

/// Accumulates backfill chunks for one phase: the reached bound, the
/// end-timestamp map, and the stop signal once the queue fills.
struct BackfillProgress {
    queue: StreamQueue,
    limit: usize,
    bets: BackfillEndTimestamps,
    right: RightBound,
}

impl BackfillCallback for BackfillProgress {
    fn on_chunk(&mut self, chunk: RegionMap<Version>) -> bool {
        let domain = chunk.domain();
        assert_eq!(RightBound::key(domain.keys.start.clone()), self.right, "backfill chunks out of order");
        self.right = domain.keys.end.clone();
        self.bets.combine(BackfillEndTimestamps::from_chunk(&chunk));
        self.queue.len() < self.limit
    }
}

/// Applies the entry's write at its timestamp, or just advances the
/// metainfo when the write came up empty. `region` must be non-empty.
async fn apply_write_or_metainfo(
    store: &Arc<dyn Store>,
    branch: BranchId,
    region: &Region,
    entry: QueueEntry,
    token: WriteToken,
    interruptor: &Interruptor,
) -> Result<()> {
    let new_metainfo = Metainfo::new(region.clone(), Version::new(branch, entry.timestamp));
    if entry.has_write {
        store
            .write(new_metainfo, entry.write, Durability::Soft, entry.timestamp, entry.order_token, token, interruptor)
            .await?;
    } else {
        store.set_metainfo(new_metainfo, entry.order_token, token, Durability::Soft, interruptor).await?;
    }
    Ok(())
}

fn spawn_router<T, F, Fut>(
    shared: Arc<RouterShared>,
    mut mailbox: Mailbox<T>,
    interruptor: Interruptor,
    handle: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(Arc<RouterShared>, T, Interruptor) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        // One task per message: the enforcer orders them, and a write
        // pending on its throttle must not hold up the ones behind it.
        let mut tasks = JoinSet::new();
        while let Ok(request) = interruptor.run(mailbox.recv()).await {
            let task = handle(shared.clone(), request, interruptor.clone());
            tasks.spawn(async move {
                if let Err(err) = task.await {
                    debug!("replication request dropped: {err:?}");
                }
            });
            while tasks.try_join_next().is_some() {}
        }
        // Revoked: in-flight handlers observe the teardown signal at
        // their next suspension point; join them before retiring so
        // nothing outlives the client.
        while tasks.join_next().await.is_some() {}
    })
}

async fn handle_write_async(
    shared: Arc<RouterShared>,
    request: AsyncWriteRequest,
    interruptor: Interruptor,
) -> Result<()> {
    let AsyncWriteRequest { write, timestamp, order_token, ack } = request;
    shared.wait_registered(&interruptor).await?;
    let enforcer = shared.enforcer();
    enforcer.wait_all_before(timestamp.pred(), &interruptor).await?;

    let state = shared.tracker.read(&interruptor).await?;
    if let Some(replica) = state.replica.clone() {
        // Post-construction fast path: everything goes to the replica.
        enforcer.complete(timestamp);
        drop(state);
        replica.do_write(write, timestamp, order_token, Durability::Soft, &interruptor).await?;
        ack.send(());
        return Ok(());
    }

    // Constructing: split the write across the partition. The streaming
    // shard applies directly, the queueing shard is queued, and the
    // discarding shard is dropped on the floor.
    let streaming = state.streaming.clone();
    let mut streaming_shard = None;
    let mut streaming_token = None;
    if !streaming.is_empty() {
        streaming_shard = write.shard(&streaming);
        streaming_token = Some(shared.store.new_write_token());
    }
    let throttle = match &state.queue {
        Some(queue) => {
            assert!(!state.queueing.is_empty(), "queue installed over an empty queueing region");
            let queued = write.shard(&state.queueing);
            Some(queue.push(QueueEntry {
                has_write: queued.is_some(),
                write: queued.unwrap_or_default(),
                timestamp,
                order_token,
            }))
        },
        // No queue means we are between phases (or construction just
        // failed); whatever falls outside streaming is discarded.
        None => None,
    };
    enforcer.complete(timestamp);
    drop(state);

    if !streaming.is_empty() {
        let entry = QueueEntry {
            has_write: streaming_shard.is_some(),
            write: streaming_shard.unwrap_or_default(),
            timestamp,
            order_token,
        };
        let token = streaming_token.expect("token taken under the lock");
        apply_write_or_metainfo(&shared.store, shared.branch, &streaming, entry, token, &interruptor).await?;
    }
    if let Some(throttle) = throttle {
        // This wait is the backpressure: the dispatcher caps its
        // in-flight writes, so holding the ack back slows the stream to
        // beneath the drain rate.
        let _ = interruptor.run(throttle).await?;
    }
    ack.send(());
    Ok(())
}

async fn handle_write_sync(
    shared: Arc<RouterShared>,
    request: SyncWriteRequest,
    interruptor: Interruptor,
) -> Result<()> {
    let SyncWriteRequest { write, timestamp, order_token, durability, ack } = request;
    // The dispatcher never interleaves sync writes with async ones, but
    // nothing here relies on that: sync writes pass the enforcer too.
    let state = shared.tracker.read(&interruptor).await?;
    let replica = state.replica.clone().expect("sync write before construction finished");
    shared.enforcer().complete(timestamp);
    drop(state);
    let response = replica.do_write(write, timestamp, order_token, durability, &interruptor).await?;
    ack.send(response);
    Ok(())
}

async fn handle_read(shared: Arc<RouterShared>, request: ReadRequest, interruptor: Interruptor) -> Result<()> {
    let ReadRequest { read, min_timestamp, ack } = request;
    let state = shared.tracker.read(&interruptor).await?;
    let replica = state.replica.clone().expect("read before construction finished");
    drop(state);
    let response = replica.do_read(read, min_timestamp, &interruptor).await?;
    ack.send(response);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use assertor::*;
    use async_trait::async_trait;
    use tracing_test::traced_test;

    use super::*;
    use crate::mailbox::Address;
    use crate::range::{HashRange, Key, KeyRange};
    use crate::replication::{PeerId, RegistrarRequest};
    use crate::signal::{interruption, Interrupted};
    use crate::store::memory::MemoryStore;
    use crate::store::{Read, ReadResponse, Write, WriteOp, WriteResponse};
    use crate::timestamp::StateTimestamp;

    fn ts(raw: u64) -> StateTimestamp {
        StateTimestamp::from_raw(raw)
    }

    fn region(start: &[u8], end: &[u8]) -> Region {
        Region::new(HashRange::universe(), KeyRange::new(start.to_vec(), RightBound::key(end.to_vec())))
    }

    fn put(key: &[u8], value: &[u8]) -> WriteOp {
        WriteOp { key: key.to_vec(), value: Some(value.to_vec()) }
    }

    struct Chunk {
        versions: Metainfo,
        items: Vec<(Key, Vec<u8>)>,
    }

    fn chunk(branch: BranchId, parts: &[(&[u8], &[u8], u64)], items: &[(&[u8], &[u8])]) -> Chunk {
        let domain = region(parts.first().unwrap().0, parts.last().unwrap().1);
        let mut versions = Metainfo::new(domain.clone(), Version::new(branch, ts(parts[0].2)));
        for (start, end, raw) in parts {
            versions.update(&region(start, end), Version::new(branch, ts(*raw)));
        }
        let items = items.iter().map(|(key, value)| (key.to_vec(), value.to_vec())).collect();
        Chunk { versions, items }
    }

    /// Feeds scripted chunk phases into the store, one phase per `go`
    /// call, the way a real backfiller stops where the callback declines
    /// or its snapshot runs out.
    struct ScriptedBackfillee {
        dest: Arc<MemoryStore>,
        phases: VecDeque<Vec<Chunk>>,
        hang_when_done: bool,
        progress: Option<Address<()>>,
    }

    #[async_trait]
    impl Backfillee for ScriptedBackfillee {
        async fn go(
            &mut self,
            callback: &mut dyn BackfillCallback,
            start: RightBound,
            interruptor: &Interruptor,
        ) -> Result<()> {
            let phase = self.phases.pop_front().expect("no scripted phase left");
            let mut cursor = start;
            for chunk in phase {
                interruptor.check()?;
                let domain = chunk.versions.domain();
                assert_that!(RightBound::key(domain.keys.start.clone())).is_equal_to(cursor.clone());
                cursor = domain.keys.end.clone();
                self.dest.apply_backfill_chunk(chunk.items, chunk.versions.clone());
                let more = callback.on_chunk(chunk.versions);
                if let Some(progress) = &self.progress {
                    progress.send(());
                }
                if !more {
                    return Ok(());
                }
            }
            if self.phases.is_empty() && self.hang_when_done {
                interruptor.run(std::future::pending::<()>()).await?;
            }
            Ok(())
        }
    }

    /// Stands in for the dispatcher: accepts one registration, stamps
    /// writes with consecutive timestamps, and caps in-flight writes at
    /// one by awaiting each ack.
    struct TestPrimary {
        branch: BranchId,
        region: Region,
        registrar: Mailbox<RegistrarRequest>,
        ready: Mailbox<()>,
        acks: Mailbox<()>,
        timestamp: StateTimestamp,
        order: u64,
        client: Option<ClientBcard>,
    }

    impl TestPrimary {
        fn new(branch: BranchId, region: Region, begin: StateTimestamp) -> Self {
            Self {
                branch,
                region,
                registrar: Mailbox::new(),
                ready: Mailbox::new(),
                acks: Mailbox::new(),
                timestamp: begin,
                order: 0,
                client: None,
            }
        }

        fn bcard(&self) -> PrimaryBcard {
            PrimaryBcard { branch: self.branch, region: self.region.clone(), registrar: self.registrar.address() }
        }

        async fn accept(&mut self) {
            match self.registrar.recv().await {
                RegistrarRequest::Register(bcard) => {
                    bcard.intro.send(ClientIntro {
                        streaming_begin_timestamp: self.timestamp,
                        ready: self.ready.address(),
                    });
                    self.client = Some(bcard);
                },
                request => panic!("expected registration, got {request:?}"),
            }
        }

        fn next_stamp(&mut self) -> (StateTimestamp, OrderToken) {
            self.timestamp = self.timestamp.next();
            self.order += 1;
            (self.timestamp, OrderToken::from_raw(self.order))
        }

        async fn write(&mut self, write: Write) -> StateTimestamp {
            let (timestamp, order_token) = self.next_stamp();
            let client = self.client.as_ref().expect("no registered client");
            client.write_async.send(AsyncWriteRequest { write, timestamp, order_token, ack: self.acks.address() });
            self.acks.recv().await;
            timestamp
        }

        async fn write_sync(&mut self, write: Write, durability: Durability) -> (StateTimestamp, WriteResponse) {
            let (timestamp, order_token) = self.next_stamp();
            let mut response = Mailbox::new();
            let client = self.client.as_ref().expect("no registered client");
            client.write_sync.send(SyncWriteRequest {
                write,
                timestamp,
                order_token,
                durability,
                ack: response.address(),
            });
            (timestamp, response.recv().await)
        }

        async fn read(&mut self, key: &[u8], min_timestamp: StateTimestamp) -> ReadResponse {
            let mut response = Mailbox::new();
            let client = self.client.as_ref().expect("no registered client");
            client.read.send(ReadRequest { read: Read { key: key.to_vec() }, min_timestamp, ack: response.address() });
            response.recv().await
        }
    }

    struct Scenario {
        region: Region,
        store: Arc<MemoryStore>,
        primary: TestPrimary,
        synchronize: Mailbox<SynchronizeRequest>,
        construction: JoinHandle<Result<RemoteReplicatorClient>>,
    }

    fn launch(
        branch: BranchId,
        begin: u64,
        phases: Vec<Vec<Chunk>>,
        hang_when_done: bool,
        progress: Option<Address<()>>,
        interruptor: Interruptor,
    ) -> Scenario {
        let region = region(b"a", b"e");
        let store = Arc::new(MemoryStore::new(region.clone()));
        let primary = TestPrimary::new(branch, region.clone(), ts(begin));
        let synchronize = Mailbox::new();
        let replica_peer = ReplicaBcard { peer: PeerId::new_random(), synchronize: synchronize.address() };
        let backfillee =
            Box::new(ScriptedBackfillee { dest: store.clone(), phases: phases.into(), hang_when_done, progress });
        let construction = tokio::spawn({
            let primary_bcard = primary.bcard();
            let store: Arc<dyn Store> = store.clone();
            async move {
                RemoteReplicatorClient::start(
                    Arc::new(BackfillThrottler::default()),
                    BackfillConfig::default(),
                    ServerId::new_random(),
                    primary_bcard,
                    replica_peer,
                    backfillee,
                    store,
                    &interruptor,
                )
                .await
            }
        });
        Scenario { region, store, primary, synchronize, construction }
    }

    fn assert_metainfo_uniform(store: &MemoryStore, region: &Region, expect: Version) {
        store.metainfo().visit(region, |_, actual| {
            assert_that!(*actual).is_equal_to(expect);
        });
    }

    #[tokio::test]
    #[traced_test]
    async fn test_full_backfill_without_stream() {
        let branch = BranchId::new_random();
        let phases = vec![vec![chunk(branch, &[(b"a", b"e", 10)], &[(b"a", b"a@10"), (b"c", b"c@10")])]];
        let mut scenario = launch(branch, 10, phases, false, None, Interruptor::never());

        scenario.primary.accept().await;
        let request = scenario.synchronize.recv().await;
        assert_that!(request.timestamp).is_equal_to(ts(10));
        request.ack.send(());

        scenario.primary.ready.recv().await;
        let client = scenario.construction.await.unwrap().unwrap();
        assert_metainfo_uniform(&scenario.store, &scenario.region, Version::new(branch, ts(10)));
        assert_that!(scenario.store.value(b"a")).is_equal_to(Some((ts(10), b"a@10".to_vec())));
        assert_that!(scenario.store.write_history()).is_equal_to(vec![]);

        // Steady state: async and sync writes route through the replica,
        // reads see everything through their minimum timestamp.
        let t11 = scenario.primary.write(Write::batch([put(b"b", b"b@11")])).await;
        assert_that!(t11).is_equal_to(ts(11));
        let (t12, response) = scenario.primary.write_sync(Write::batch([put(b"c", b"c@12")]), Durability::Hard).await;
        assert_that!(response.applied).is_equal_to(1);
        let read = scenario.primary.read(b"b", t12).await;
        assert_that!(read.value).is_equal_to(Some((t11, b"b@11".to_vec())));
        assert_that!(client.replica().await.current()).is_equal_to(t12);
        assert_that!(client.is_primary_gone()).is_false();

        client.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stream_write_ahead_of_backfill() {
        let branch = BranchId::new_random();
        // The backfill of [c, e) at 2 already folds in the write at 1;
        // the queued copy must clip to nothing while the part of the
        // keyspace backfilled at 0 still takes later stream writes.
        let phases = vec![vec![
            chunk(branch, &[(b"a", b"c", 0)], &[]),
            chunk(branch, &[(b"c", b"e", 2)], &[(b"c", b"c@1")]),
        ]];
        let mut scenario = launch(branch, 0, phases, false, None, Interruptor::never());

        scenario.primary.accept().await;
        let request = scenario.synchronize.recv().await;
        assert_that!(request.timestamp).is_equal_to(ts(0));
        let t1 = scenario.primary.write(Write::batch([put(b"c", b"c@1")])).await;
        let t2 = scenario.primary.write(Write::batch([put(b"a", b"a@2")])).await;
        assert_that!((t1, t2)).is_equal_to((ts(1), ts(2)));
        request.ack.send(());

        scenario.primary.ready.recv().await;
        let client = scenario.construction.await.unwrap().unwrap();

        // The write at 1 reached the store through the backfill alone;
        // the write at 2 reached it through the queue alone.
        assert_that!(scenario.store.write_history()).is_equal_to(vec![(ts(2), b"a".to_vec())]);
        assert_that!(scenario.store.value(b"c").unwrap().1).is_equal_to(b"c@1".to_vec());
        assert_that!(scenario.store.value(b"a").unwrap().1).is_equal_to(b"a@2".to_vec());
        assert_metainfo_uniform(&scenario.store, &scenario.region, Version::new(branch, ts(2)));

        client.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stream_write_inside_backfilled_range() {
        let branch = BranchId::new_random();
        let phases = vec![vec![
            chunk(branch, &[(b"a", b"c", 5)], &[(b"b", b"b@4")]),
            chunk(branch, &[(b"c", b"e", 5)], &[(b"d", b"d@5")]),
        ]];
        let mut scenario = launch(branch, 3, phases, false, None, Interruptor::never());

        scenario.primary.accept().await;
        let request = scenario.synchronize.recv().await;
        assert_that!(request.timestamp).is_equal_to(ts(3));
        scenario.primary.write(Write::batch([put(b"b", b"b@4")])).await;
        scenario.primary.write(Write::batch([put(b"d", b"d@5")])).await;
        request.ack.send(());

        scenario.primary.ready.recv().await;
        let client = scenario.construction.await.unwrap().unwrap();

        // Both stream writes were already folded into the backfill; the
        // enforcer completed them but nothing touched the store again.
        assert_that!(scenario.store.write_history()).is_equal_to(vec![]);
        assert_that!(scenario.store.value(b"b").unwrap().1).is_equal_to(b"b@4".to_vec());
        assert_that!(scenario.store.value(b"d").unwrap().1).is_equal_to(b"d@5".to_vec());
        assert_metainfo_uniform(&scenario.store, &scenario.region, Version::new(branch, ts(5)));

        client.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_cross_region_write() {
        let branch = BranchId::new_random();
        let phases = vec![
            vec![chunk(branch, &[(b"a", b"c", 6)], &[(b"b", b"b@6")])],
            vec![chunk(branch, &[(b"c", b"e", 6)], &[])],
        ];
        let mut scenario = launch(branch, 6, phases, false, None, Interruptor::never());

        scenario.primary.accept().await;
        let request = scenario.synchronize.recv().await;
        request.ack.send(());

        // Phase two: streaming is [a, c), queueing is [c, e). A write
        // spanning both splits: b applies immediately, d goes through the
        // queue. Each lands exactly once.
        let request = scenario.synchronize.recv().await;
        let t7 = scenario.primary.write(Write::batch([put(b"b", b"b@7"), put(b"d", b"d@7")])).await;
        assert_that!(t7).is_equal_to(ts(7));
        request.ack.send(());

        scenario.primary.ready.recv().await;
        let client = scenario.construction.await.unwrap().unwrap();

        assert_that!(scenario.store.write_history())
            .is_equal_to(vec![(ts(7), b"b".to_vec()), (ts(7), b"d".to_vec())]);
        assert_that!(scenario.store.value(b"b")).is_equal_to(Some((ts(7), b"b@7".to_vec())));
        assert_that!(scenario.store.value(b"d")).is_equal_to(Some((ts(7), b"d@7".to_vec())));
        assert_metainfo_uniform(&scenario.store, &scenario.region, Version::new(branch, ts(7)));

        client.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_interruption_mid_backfill() {
        let branch = BranchId::new_random();
        let phases = vec![vec![chunk(branch, &[(b"a", b"c", 0)], &[(b"b", b"b@0")])]];
        let mut progress = Mailbox::new();
        let (trigger, interruptor) = interruption();
        let mut scenario = launch(branch, 0, phases, true, Some(progress.address()), interruptor);

        scenario.primary.accept().await;
        let request = scenario.synchronize.recv().await;
        request.ack.send(());

        // One chunk lands, then the backfiller stalls; pull the plug.
        progress.recv().await;
        trigger.pulse();

        let result = scenario.construction.await.unwrap();
        let err = match result {
            Ok(_) => panic!("construction survived interruption"),
            Err(err) => err,
        };
        assert_that!(err.downcast_ref::<Interrupted>().is_some()).is_true();

        // Nothing was promised to the primary: no ready signal, no
        // replica, and the uncovered remainder still has its stale
        // metainfo.
        assert_that!(scenario.primary.ready.try_recv().is_none()).is_true();
        assert_that!(*scenario.store.metainfo().lookup(b"d")).is_equal_to(Version::default());
        assert_that!(*scenario.store.metainfo().lookup(b"b")).is_equal_to(Version::new(branch, ts(0)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_primary_loss_fails_construction() {
        let branch = BranchId::new_random();
        let mut scenario = launch(branch, 0, vec![], false, None, Interruptor::never());

        scenario.primary.accept().await;
        // The primary dies before the backfill can even synchronize.
        let request = scenario.synchronize.recv().await;
        drop(scenario.primary);

        let result = scenario.construction.await.unwrap();
        assert_that!(result.is_err()).is_true();
        drop(request);
    }
}
