use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::clock::Clock;
use crate::error::AggregateError;
use crate::metric::{ForwardMetadata, ForwardedMetric, MetricUnion, StagedMetadatas, TimedMetadata, TimedMetric};

/// Tick outcome for one metric category (standard or forwarded).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickCategoryResult {
    /// Series entries still alive after the sweep.
    pub active_entries: usize,
    /// Series entries expired by the sweep.
    pub expired_entries: usize,
    /// Live aggregation elements keyed by resolution nanos.
    pub active_elems: HashMap<i64, usize>,
}

impl TickCategoryResult {
    fn merge(&mut self, other: TickCategoryResult) {
        self.active_entries += other.active_entries;
        self.expired_entries += other.expired_entries;
        for (resolution, count) in other.active_elems {
            *self.active_elems.entry(resolution).or_insert(0) += count;
        }
    }
}

/// Composite result of ticking one or more shards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickResult {
    pub standard: TickCategoryResult,
    pub forwarded: TickCategoryResult,
}

impl TickResult {
    pub fn merge(&mut self, other: TickResult) {
        self.standard.merge(other.standard);
        self.forwarded.merge(other.forwarded);
    }
}

/// The per-shard aggregation machinery: hash tables of series state, rollup
/// pipelines, and resend lists. Opaque to the dispatcher; implementations
/// live outside this crate.
pub trait MetricStore: Send + Sync {
    fn add_untimed(
        &self,
        metric: &MetricUnion,
        metadatas: &StagedMetadatas,
    ) -> Result<(), AggregateError>;

    fn add_timed(&self, metric: &TimedMetric, metadata: &TimedMetadata)
        -> Result<(), AggregateError>;

    fn add_timed_with_staged_metadatas(
        &self,
        metric: &TimedMetric,
        metadatas: &StagedMetadatas,
    ) -> Result<(), AggregateError>;

    fn add_forwarded(
        &self,
        metric: &ForwardedMetric,
        metadata: &ForwardMetadata,
    ) -> Result<(), AggregateError>;

    /// Sweeps expired state, spending roughly `budget` of wall time.
    fn tick(&self, budget: Duration) -> TickResult;

    fn close(&self);
}

/// Creates the aggregation store backing a newly owned shard.
pub trait StoreFactory: Send + Sync {
    fn create(&self, shard_id: u32) -> Arc<dyn MetricStore>;
}

/// Closed-open window `[cutover, cutoff)` within which a shard accepts writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritableRange {
    pub cutover_nanos: i64,
    pub cutoff_nanos: i64,
}

const NO_REDIRECT: i64 = -1;

struct ShardState {
    closed: bool,
}

/// A hash-partition of metric-id space owned by this instance.
///
/// The handle enforces write-window admission and delegates the actual
/// aggregation to its store. Writes hold the shard read lock for their full
/// duration, so `close` (which takes the write lock) drains in-flight writes
/// before shutting the store down.
pub struct AggregatorShard {
    id: u32,
    clock: Arc<dyn Clock>,
    // A fresh shard is writable for all time until a placement narrows it.
    cutover_nanos: AtomicI64,
    cutoff_nanos: AtomicI64,
    redirect_to: AtomicI64,
    state: RwLock<ShardState>,
    store: Arc<dyn MetricStore>,
}

impl AggregatorShard {
    pub fn new(id: u32, store: Arc<dyn MetricStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            id,
            clock,
            cutover_nanos: AtomicI64::new(i64::MIN),
            cutoff_nanos: AtomicI64::new(i64::MAX),
            redirect_to: AtomicI64::new(NO_REDIRECT),
            state: RwLock::new(ShardState { closed: false }),
            store,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_redirect_to_shard_id(&self, target: Option<u32>) {
        let encoded = target.map_or(NO_REDIRECT, i64::from);
        self.redirect_to.store(encoded, Ordering::Release);
    }

    pub fn redirect_to_shard_id(&self) -> Option<u32> {
        match self.redirect_to.load(Ordering::Acquire) {
            NO_REDIRECT => None,
            id => Some(id as u32),
        }
    }

    pub fn set_writable_range(&self, range: WritableRange) {
        self.cutover_nanos.store(range.cutover_nanos, Ordering::Release);
        self.cutoff_nanos.store(range.cutoff_nanos, Ordering::Release);
    }

    pub fn cutover_nanos(&self) -> i64 {
        self.cutover_nanos.load(Ordering::Acquire)
    }

    pub fn cutoff_nanos(&self) -> i64 {
        self.cutoff_nanos.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        let now = self.clock.now_nanos();
        self.cutover_nanos() <= now && now < self.cutoff_nanos()
    }

    pub fn is_cutoff(&self) -> bool {
        self.clock.now_nanos() >= self.cutoff_nanos()
    }

    fn check_writable(&self, state: &ShardState) -> Result<(), AggregateError> {
        if state.closed {
            return Err(AggregateError::ShardClosed);
        }
        if !self.is_writable() {
            return Err(AggregateError::ShardNotWriteable);
        }
        Ok(())
    }

    pub fn add_untimed(
        &self,
        metric: &MetricUnion,
        metadatas: &StagedMetadatas,
    ) -> Result<(), AggregateError> {
        let state = self.state.read();
        self.check_writable(&state)?;
        self.store.add_untimed(metric, metadatas)
    }

    pub fn add_timed(
        &self,
        metric: &TimedMetric,
        metadata: &TimedMetadata,
    ) -> Result<(), AggregateError> {
        let state = self.state.read();
        self.check_writable(&state)?;
        self.store.add_timed(metric, metadata)
    }

    pub fn add_timed_with_staged_metadatas(
        &self,
        metric: &TimedMetric,
        metadatas: &StagedMetadatas,
    ) -> Result<(), AggregateError> {
        let state = self.state.read();
        self.check_writable(&state)?;
        self.store.add_timed_with_staged_metadatas(metric, metadatas)
    }

    pub fn add_forwarded(
        &self,
        metric: &ForwardedMetric,
        metadata: &ForwardMetadata,
    ) -> Result<(), AggregateError> {
        let state = self.state.read();
        self.check_writable(&state)?;
        self.store.add_forwarded(metric, metadata)
    }

    /// Sweeps the shard's store, spending roughly `budget` of wall time.
    pub fn tick(&self, budget: Duration) -> TickResult {
        self.store.tick(budget)
    }

    /// Blocks until in-flight writes drain, then closes the store.
    /// Subsequent writes fail with `ShardClosed`. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.store.close();
    }
}
