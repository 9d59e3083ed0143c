//! Sticky-key dispatcher.
//!
//! The control core of a key-shared subscription. One spawned task owns
//! the read loop: it decides between normal and replay reads, groups each
//! batch by the consumer the selector picks, admits the longest prefix
//! each consumer may receive (permits, pending-replay hash fence,
//! recently-joined fence), hands the admitted batches to the transports
//! with no lock held, and parks everything else in the redelivery tracker.
//!
//! Ordering guarantees are per sticky key: the key's current owner sees
//! its entries in position order, and a consumer that joins mid-stream is
//! fenced at the position it missed until the mark-delete pointer catches
//! up. Across keys there is no ordering.
//!
//! All dispatcher state lives behind one mutex taken only for short
//! synchronous sections; the async send boundary is never crossed while
//! holding it.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::SubscriptionOptions;
use crate::error::DispatchError;
use crate::log::{Cursor, Entry, Position, PositionRangeSet, ReadType};

use super::recently_joined::RecentlyJoinedTable;
use super::redelivery::RedeliveryTracker;
use super::registry::{effective_permits, Consumer, ConsumerRegistry};
use super::selector::{sticky_key_hash, HashRange, StickyKeySelector};

/// Dispatch counters, exported via [`DispatcherStats::snapshot`].
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub batches_read: AtomicU64,
    pub replay_reads: AtomicU64,
    pub batches_discarded: AtomicU64,
    pub entries_dispatched: AtomicU64,
    pub entries_redelivered: AtomicU64,
    pub fence_truncations: AtomicU64,
    pub send_failures: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            batches_read: self.batches_read.load(Ordering::Relaxed),
            replay_reads: self.replay_reads.load(Ordering::Relaxed),
            batches_discarded: self.batches_discarded.load(Ordering::Relaxed),
            entries_dispatched: self.entries_dispatched.load(Ordering::Relaxed),
            entries_redelivered: self.entries_redelivered.load(Ordering::Relaxed),
            fence_truncations: self.fence_truncations.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub batches_read: u64,
    pub replay_reads: u64,
    pub batches_discarded: u64,
    pub entries_dispatched: u64,
    pub entries_redelivered: u64,
    pub fence_truncations: u64,
    pub send_failures: u64,
}

/// Mutable dispatcher state, single-owner behind the mutex.
pub(crate) struct DispatcherCore {
    pub(crate) selector: StickyKeySelector,
    pub(crate) registry: ConsumerRegistry,
    pub(crate) redelivery: RedeliveryTracker,
    pub(crate) recently_joined: RecentlyJoinedTable,
    pub(crate) last_sent: Option<Position>,
    pub(crate) individually_sent: PositionRangeSet,
    /// Set when a cycle delivered nothing; the next read skips replay-first
    /// once so the loop cannot spin on undeliverable replays.
    pub(crate) skip_next_replay: bool,
    /// Set while a skipped-replay normal read is in flight: the replay
    /// precedence check stands down for exactly that batch.
    pub(crate) bypass_replay_precedence: bool,
}

/// What the next read should be.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadDecision {
    Normal,
    Replay(BTreeSet<Position>),
    /// No consumers or no permits; wait for a wakeup.
    Idle,
}

/// Outcome of one processed batch.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    Dispatched,
    Idle,
}

struct SendJob {
    consumer: Arc<dyn Consumer>,
    entries: Vec<Arc<Entry>>,
}

enum Assembly {
    Sends(Vec<SendJob>),
    /// Batch returned to redelivery; an older replay must go first.
    Discarded,
    /// Everything was deferred.
    Nothing,
}

/// Key-shared dispatcher for one subscription.
#[derive(Clone)]
pub struct StickyKeyDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    subscription: String,
    cursor: Arc<dyn Cursor>,
    options: SubscriptionOptions,
    core: Mutex<DispatcherCore>,
    wake: Notify,
    closed: AtomicBool,
    running: AtomicBool,
    stats: DispatcherStats,
}

impl StickyKeyDispatcher {
    pub fn new(
        subscription: impl Into<String>,
        cursor: Arc<dyn Cursor>,
        options: SubscriptionOptions,
    ) -> Self {
        let selector = StickyKeySelector::for_mode(
            options.key_shared_mode,
            options.use_consistent_hashing,
            options.consistent_hashing_replica_points,
        );
        Self {
            inner: Arc::new(DispatcherInner {
                subscription: subscription.into(),
                cursor,
                options,
                core: Mutex::new(DispatcherCore {
                    selector,
                    registry: ConsumerRegistry::new(),
                    redelivery: RedeliveryTracker::new(),
                    recently_joined: RecentlyJoinedTable::new(),
                    last_sent: None,
                    individually_sent: PositionRangeSet::new(),
                    skip_next_replay: false,
                    bypass_replay_precedence: false,
                }),
                wake: Notify::new(),
                closed: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stats: DispatcherStats::default(),
            }),
        }
    }

    /// Spawn the read loop. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run().await });
    }

    /// Stop dispatching. Set before anything else so in-flight send
    /// completions become no-ops.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.wake.notify_one();
        info!(subscription = %self.inner.subscription, "dispatcher closing");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register a consumer and return the fence position it missed, if
    /// any. A selector rejection rolls the registration back.
    pub fn add_consumer(
        &self,
        consumer: Arc<dyn Consumer>,
    ) -> Result<Option<Position>, DispatchError> {
        if self.is_closed() {
            consumer.disconnect();
            return Err(DispatchError::CursorClosed);
        }
        let name = consumer.name().to_string();
        let claims = consumer.claimed_hash_ranges();

        let mut core = self.inner.core.lock();
        core.registry.add(consumer)?;
        if let Err(e) = core.selector.add_consumer(&name, claims.as_deref()) {
            core.registry.remove(&name);
            return Err(e);
        }

        let fence = core
            .last_sent
            .or_else(|| self.inner.cursor.mark_delete_position());
        if core.registry.len() > 1 {
            if let Some(fence) = fence {
                let backlog = self.inner.cursor.entries_since_first_unacked();
                let consumers = core.registry.len();
                if (self.inner.options.join_fence_predicate)(backlog, consumers) {
                    core.recently_joined.insert(&name, fence);
                    debug!(
                        subscription = %self.inner.subscription,
                        consumer = %name,
                        %fence,
                        "consumer joined behind unacked entries; fenced"
                    );
                }
            }
        }
        drop(core);
        self.inner.wake.notify_one();
        Ok(fence)
    }

    /// Unregister a consumer: selector first so nothing routes to it,
    /// then registry, then its fence.
    pub fn remove_consumer(&self, name: &str) -> Result<(), DispatchError> {
        let mut core = self.inner.core.lock();
        core.selector.remove_consumer(name);
        let removed = core.registry.remove(name);
        core.recently_joined.remove(name);
        if removed.is_none() {
            return Err(DispatchError::InvalidArgument(format!(
                "unknown consumer {name}"
            )));
        }
        if core.registry.len() == 1 {
            // A lone consumer owns every key; fences are moot.
            core.recently_joined.clear();
        }
        if core.registry.is_empty() {
            core.last_sent = None;
            core.individually_sent.clear();
        }
        drop(core);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// The cursor's mark-delete pointer moved: retire passed fences and
    /// read more.
    pub fn on_mark_delete_advanced(&self, mark_delete: Position) {
        let retired = self
            .inner
            .core
            .lock()
            .recently_joined
            .retire_up_to(mark_delete);
        if retired > 0 {
            debug!(
                subscription = %self.inner.subscription,
                %mark_delete,
                retired,
                "retired recently-joined fences"
            );
        }
        self.inner.wake.notify_one();
    }

    /// Wake the read loop (new entries appended, permits granted, ...).
    pub fn notify(&self) {
        self.inner.wake.notify_one();
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn last_sent_position(&self) -> Option<Position> {
        self.inner.core.lock().last_sent
    }

    /// Hash ranges currently owned per consumer.
    pub fn consumer_hash_ranges(&self) -> std::collections::HashMap<String, Vec<HashRange>> {
        self.inner.core.lock().selector.consumer_ranges()
    }

    /// Entries currently waiting for replay.
    pub fn pending_redeliveries(&self) -> usize {
        self.inner.core.lock().redelivery.len()
    }

    #[cfg(test)]
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut DispatcherCore) -> R) -> R {
        f(&mut self.inner.core.lock())
    }

    #[cfg(test)]
    pub(crate) fn decide_read_now(&self) -> ReadDecision {
        self.inner.decide_read()
    }

    #[cfg(test)]
    pub(crate) async fn process_now(
        &self,
        entries: Vec<Arc<Entry>>,
        read_type: ReadType,
    ) -> Result<Progress, DispatchError> {
        self.inner.process_batch(entries, read_type).await
    }

    #[cfg(test)]
    pub(crate) async fn run_cycle(&self) -> Result<Progress, DispatchError> {
        self.inner.read_cycle().await
    }
}

impl DispatcherInner {
    async fn run(self: Arc<Self>) {
        info!(subscription = %self.subscription, "key-shared dispatcher running");
        while !self.closed.load(Ordering::Acquire) {
            match self.read_cycle().await {
                Ok(Progress::Dispatched) => {}
                Ok(Progress::Idle) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.options.idle_poll()) => {}
                    }
                }
                Err(DispatchError::CursorClosed) => {
                    info!(subscription = %self.subscription, "cursor closed; stopping");
                    break;
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        subscription = %self.subscription,
                        error = %e,
                        "read cycle failed; retrying"
                    );
                    tokio::time::sleep(self.options.idle_poll()).await;
                }
                Err(e) => {
                    error!(
                        subscription = %self.subscription,
                        error = %e,
                        "fatal dispatch error; terminating"
                    );
                    break;
                }
            }
        }
        self.running.store(false, Ordering::Release);
        info!(subscription = %self.subscription, "key-shared dispatcher stopped");
    }

    fn decide_read(&self) -> ReadDecision {
        let mut core = self.core.lock();
        if core.registry.is_empty() || core.registry.total_effective_permits() == 0 {
            return ReadDecision::Idle;
        }
        if !core.redelivery.is_empty() {
            if core.skip_next_replay {
                core.skip_next_replay = false;
                core.bypass_replay_precedence = true;
            } else {
                return ReadDecision::Replay(core.redelivery.drain(self.options.replay_batch_size));
            }
        }
        ReadDecision::Normal
    }

    async fn read_cycle(&self) -> Result<Progress, DispatchError> {
        match self.decide_read() {
            ReadDecision::Idle => Ok(Progress::Idle),
            ReadDecision::Replay(positions) => {
                let batch = self.cursor.replay_entries(&positions).await?;
                self.stats.replay_reads.fetch_add(1, Ordering::Relaxed);
                if !batch.unreplayable.is_empty() {
                    let mut core = self.core.lock();
                    for &p in &batch.unreplayable {
                        core.redelivery.remove(p);
                    }
                }
                self.process_batch(batch.entries, ReadType::Replay).await
            }
            ReadDecision::Normal => {
                let entries = self.cursor.read_entries(self.options.read_batch_size).await?;
                self.process_batch(entries, ReadType::Normal).await
            }
        }
    }

    async fn process_batch(
        &self,
        entries: Vec<Arc<Entry>>,
        read_type: ReadType,
    ) -> Result<Progress, DispatchError> {
        if entries.is_empty() {
            // Nothing came back; a stale precedence bypass must not leak
            // into a later batch.
            self.core.lock().bypass_replay_precedence = false;
            return Ok(Progress::Idle);
        }
        self.stats.batches_read.fetch_add(1, Ordering::Relaxed);

        let assembly = {
            let mut core = self.core.lock();
            if core.registry.is_empty() {
                // Nowhere to park the batch; drop our references and let a
                // rewound cursor serve it again once someone subscribes.
                drop(core);
                drop(entries);
                self.cursor.rewind();
                return Ok(Progress::Idle);
            }
            self.assemble(&mut core, entries, read_type)?
        };

        let jobs = match assembly {
            Assembly::Discarded => return Ok(Progress::Dispatched),
            Assembly::Nothing => return Ok(Progress::Idle),
            Assembly::Sends(jobs) => jobs,
        };

        // Concurrent sends, lock released.
        let results = join_all(jobs.into_iter().map(|job| async move {
            let result = job.consumer.send_entries(job.entries.clone()).await;
            (job, result)
        }))
        .await;

        for (job, result) in results {
            match result {
                Ok(()) => {
                    self.stats
                        .entries_dispatched
                        .fetch_add(job.entries.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    if self.closed.load(Ordering::Acquire) {
                        continue;
                    }
                    warn!(
                        subscription = %self.subscription,
                        consumer = job.consumer.name(),
                        error = %e,
                        "send failed; scheduling redelivery"
                    );
                    let mut core = self.core.lock();
                    for entry in &job.entries {
                        core.redelivery
                            .add(entry.position, sticky_key_hash(&entry.sticky_key));
                    }
                    self.stats
                        .entries_redelivered
                        .fetch_add(job.entries.len() as u64, Ordering::Relaxed);
                }
            }
        }
        Ok(Progress::Dispatched)
    }

    /// Steps 2-9 of the per-batch algorithm, under the core lock.
    fn assemble(
        &self,
        core: &mut DispatcherCore,
        entries: Vec<Arc<Entry>>,
        read_type: ReadType,
    ) -> Result<Assembly, DispatchError> {
        let out_of_order = self.options.allow_out_of_order_delivery;

        // Replay precedence: a deferred entry older than this whole batch
        // must be delivered first or per-key order breaks. Stands down for
        // one batch after the loop got stuck on undeliverable replays; the
        // per-key hash fence below still holds then.
        let bypass_precedence = core.bypass_replay_precedence;
        core.bypass_replay_precedence = false;
        if !out_of_order && read_type == ReadType::Normal && !bypass_precedence {
            if let (Some(first_replay), Some(first_read)) = (
                core.redelivery.first_position(),
                entries.first().map(|e| e.position),
            ) {
                if first_replay < first_read {
                    for entry in &entries {
                        core.redelivery
                            .add(entry.position, sticky_key_hash(&entry.sticky_key));
                    }
                    self.stats.batches_discarded.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        subscription = %self.subscription,
                        %first_replay,
                        %first_read,
                        "older replay pending; batch deferred"
                    );
                    return Ok(Assembly::Discarded);
                }
            }
        }

        // Seed the last-sent tracking from the cursor once it can tell.
        // Without a mark-delete position dispatch still proceeds; the
        // recently-joined fences alone guard ordering.
        if !out_of_order && core.last_sent.is_none() {
            if let Some(mark_delete) = self.cursor.mark_delete_position() {
                core.last_sent = Some(mark_delete);
                core.individually_sent.clear();
                let sent = &mut core.individually_sent;
                self.cursor.individually_deleted_intervals(&mut |interval| {
                    if interval.hi > mark_delete {
                        sent.add_open_closed(interval.lo.max(mark_delete), interval.hi);
                    }
                    true
                });
            }
        }

        // Group by selected consumer, remembering each group's hashes.
        struct Group {
            consumer: Arc<dyn Consumer>,
            entries: Vec<(Arc<Entry>, u32)>,
            hashes: HashSet<u32>,
        }
        let mut groups: IndexMap<String, Group> = IndexMap::new();
        for entry in entries {
            let hash = sticky_key_hash(&entry.sticky_key);
            let owner = core.selector.select(hash).map(str::to_string).and_then(|name| {
                core.registry
                    .get(&name)
                    .cloned()
                    .map(|consumer| (name, consumer))
            });
            match owner {
                Some((name, consumer)) => {
                    let group = groups.entry(name).or_insert_with(|| Group {
                        consumer,
                        entries: Vec::new(),
                        hashes: HashSet::new(),
                    });
                    group.entries.push((entry, hash));
                    group.hashes.insert(hash);
                }
                None => {
                    core.redelivery.add(entry.position, hash);
                    self.stats.entries_redelivered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let min_fence = core.recently_joined.min_fence();
        let mut jobs: Vec<SendJob> = Vec::new();
        for (name, group) in groups {
            let permits = effective_permits(group.consumer.as_ref());
            let mut take = group.entries.len().min(permits);

            // Ordering fence: older entries for one of these keys are
            // waiting in redelivery; they must be replayed first.
            if !out_of_order
                && read_type == ReadType::Normal
                && take > 0
                && core.redelivery.contains_any_hash(&group.hashes)
            {
                take = 0;
            }

            // Recently-joined fence: only the prefix at or below the fence
            // may pass. Replay reads use the oldest fence of the table.
            if !out_of_order && take > 0 {
                if let Some(fence) = core.recently_joined.fence_of(&name) {
                    let fence = match read_type {
                        ReadType::Normal => fence,
                        ReadType::Replay => min_fence.map_or(fence, |m| fence.min(m)),
                    };
                    let admissible = group.entries[..take]
                        .iter()
                        .take_while(|(e, _)| e.position <= fence)
                        .count();
                    if admissible < take {
                        self.stats.fence_truncations.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            subscription = %self.subscription,
                            consumer = %name,
                            %fence,
                            "recently-joined fence deferred entries"
                        );
                    }
                    take = admissible;
                }
            }

            // Whatever was not admitted waits for replay.
            if group.entries.len() > take {
                for (entry, hash) in &group.entries[take..] {
                    core.redelivery.add(entry.position, *hash);
                }
                self.stats
                    .entries_redelivered
                    .fetch_add((group.entries.len() - take) as u64, Ordering::Relaxed);
            }

            if take == 0 {
                continue;
            }

            // The batch is committed once the lock drops, so record it now:
            // replayed positions leave the tracker and positions above the
            // last-sent pointer are remembered as individually sent.
            let mut batch = Vec::with_capacity(take);
            for (entry, _) in group.entries.into_iter().take(take) {
                if read_type == ReadType::Replay {
                    core.redelivery.remove(entry.position);
                }
                if !out_of_order {
                    if let Some(last_sent) = core.last_sent {
                        if entry.position > last_sent {
                            core.individually_sent
                                .add_open_closed(entry.position.open_lower_bound(), entry.position);
                        }
                    }
                }
                batch.push(entry);
            }
            jobs.push(SendJob {
                consumer: group.consumer,
                entries: batch,
            });
        }

        if !out_of_order {
            self.advance_last_sent(core)?;
        }

        if jobs.is_empty() {
            if core.recently_joined.is_empty() {
                core.skip_next_replay = true;
            }
            return Ok(Assembly::Nothing);
        }
        Ok(Assembly::Sends(jobs))
    }

    /// Promote `last_sent` over every sent interval that is contiguous
    /// with it in the durable log, across ledger boundaries.
    fn advance_last_sent(&self, core: &mut DispatcherCore) -> Result<(), DispatchError> {
        let Some(mut last_sent) = core.last_sent else {
            return Ok(());
        };
        loop {
            let Some(first) = core.individually_sent.first_range() else {
                break;
            };
            let contiguous = first.lo <= last_sent
                || self
                    .cursor
                    .next_valid_position(last_sent)
                    .is_some_and(|q| q > first.lo && q <= first.hi);
            if !contiguous {
                break;
            }
            last_sent = last_sent.max(first.hi);
            core.individually_sent.remove_at_most(last_sent);
        }
        if let Some(first) = core.individually_sent.first_range() {
            if first.lo < last_sent {
                return Err(DispatchError::InvariantViolation(format!(
                    "sent interval {first} overlaps last sent position {last_sent}"
                )));
            }
        }
        core.last_sent = Some(last_sent);
        Ok(())
    }
}
