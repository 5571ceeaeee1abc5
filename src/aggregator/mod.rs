pub mod filter;
mod metrics;
pub mod options;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::AggregatorConfig;
use crate::election::{ElectionManager, ElectionState};
use crate::error::AggregateError;
use crate::flush::{FlushManager, FlushStatus, FlushTimesChecker, FlushTimesManager};
use crate::handler::{AdminClient, FlushHandler, PassthroughWriter};
use crate::metric::{
    ChunkedMetricWithStoragePolicy, ForwardMetadata, ForwardedMetric, MetricType, MetricUnion,
    PipelineMetadata, StagedMetadatas, TimedMetadata, TimedMetric,
};
use crate::placement::{Instance, Placement, PlacementError, PlacementManager, ShardAssignment};
use crate::shard::{AggregatorShard, StoreFactory, TickResult, WritableRange};
use crate::sharding::ShardFn;

use self::filter::RollupAllowlist;
use self::metrics::AggregatorMetrics;
use self::options::AggregatorOptions;

const UNINITIALIZED_SHARD_SET_ID: u32 = 0;

/// Run-time status of the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStatus {
    pub flush_status: FlushStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotOpen,
    Open,
    Closed,
}

/// Everything guarded by the aggregator lock.
struct State {
    lifecycle: Lifecycle,
    /// Owned shard ids, ascending.
    shard_ids: Vec<u32>,
    /// Sparse table indexed by shard id; length is max(active id) + 1.
    shards: Vec<Option<Arc<AggregatorShard>>>,
    /// Last reconciled placement; compared by Arc identity.
    placement: Option<Arc<Placement>>,
    shard_set_id: u32,
    shard_set_open: bool,
}

struct Inner {
    cfg: AggregatorConfig,
    clock: Arc<dyn Clock>,
    shard_fn: ShardFn,
    placement_manager: Arc<dyn PlacementManager>,
    flush_times_manager: Arc<dyn FlushTimesManager>,
    flush_times_checker: FlushTimesChecker,
    election_manager: Arc<dyn ElectionManager>,
    flush_manager: Arc<dyn FlushManager>,
    flush_handler: Arc<dyn FlushHandler>,
    passthrough_writer: Arc<dyn PassthroughWriter>,
    admin_client: Option<Arc<dyn AdminClient>>,
    store_factory: Arc<dyn StoreFactory>,
    allowlist: RollupAllowlist,
    state: RwLock<State>,
    /// Published for lock-free hashing on the ingest path.
    cur_num_shards: AtomicI32,
    shards_pending_close: AtomicI32,
    cancel: CancellationToken,
    metrics: AggregatorMetrics,
}

/// Sharded, cluster-aware dispatch core of the aggregation engine.
///
/// Owns the subset of hash-partitioned shards assigned to this instance by
/// the cluster placement, routes ingest onto them, reconciles placement
/// changes, and runs the background tick that expires idle shard state.
pub struct Aggregator {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Aggregator {
    pub fn new(opts: AggregatorOptions) -> anyhow::Result<Self> {
        opts.config.validate()?;

        let metrics = AggregatorMetrics::new(
            &opts.config.metrics_namespace,
            &opts.registry,
            Arc::clone(&opts.max_allowed_forwarding_delay_fn),
        )?;
        let flush_times_checker =
            FlushTimesChecker::new(&opts.config.metrics_namespace, &opts.registry)?;
        let allowlist = RollupAllowlist::new(&opts.config.resend_enabled_rollup_patterns);

        Ok(Self {
            inner: Arc::new(Inner {
                allowlist,
                clock: opts.clock,
                shard_fn: opts.shard_fn,
                placement_manager: opts.placement_manager,
                flush_times_manager: opts.flush_times_manager,
                flush_times_checker,
                election_manager: opts.election_manager,
                flush_manager: opts.flush_manager,
                flush_handler: opts.flush_handler,
                passthrough_writer: opts.passthrough_writer,
                admin_client: opts.admin_client,
                store_factory: opts.store_factory,
                cfg: opts.config,
                state: RwLock::new(State {
                    lifecycle: Lifecycle::NotOpen,
                    shard_ids: Vec::new(),
                    shards: Vec::new(),
                    placement: None,
                    shard_set_id: UNINITIALIZED_SHARD_SET_ID,
                    shard_set_open: false,
                }),
                cur_num_shards: AtomicI32::new(0),
                shards_pending_close: AtomicI32::new(0),
                cancel: CancellationToken::new(),
                metrics,
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Opens the aggregator: reconciles the initial placement and starts the
    /// background workers. Must be called from within a tokio runtime.
    pub async fn open(&self) -> Result<(), AggregateError> {
        let inner = &self.inner;
        let mut state = inner.state.write();
        if state.lifecycle != Lifecycle::NotOpen {
            return Err(AggregateError::AlreadyOpenOrClosed);
        }

        inner.placement_manager.open()?;
        let placement = inner.placement_manager.placement()?;
        inner.process_placement_locked(&mut state, placement)?;

        let mut workers = self.workers.lock();
        if !inner.cfg.check_interval.is_zero() {
            workers.push(tokio::spawn(tick_worker(Arc::clone(inner))));
        }
        workers.push(tokio::spawn(placement_worker(Arc::clone(inner))));
        drop(workers);

        state.lifecycle = Lifecycle::Open;
        info!(
            instance_id = %inner.placement_manager.instance_id(),
            num_shards = inner.cur_num_shards.load(Ordering::Acquire),
            owned_shards = state.shard_ids.len(),
            "aggregator opened",
        );
        Ok(())
    }

    /// Adds an untimed metric with staged metadatas.
    ///
    /// The metadatas are rewritten in place (reset transforms, resend
    /// demotion) and the active entry's pipelines are partitioned between
    /// the timed and untimed paths; the caller's pipelines vector is
    /// restored before return so it can be pooled.
    pub fn add_untimed(
        &self,
        union: &MetricUnion,
        metadatas: &mut StagedMetadatas,
    ) -> Result<(), AggregateError> {
        let inner = &self.inner;
        let started = Instant::now();
        inner.update_staged_metadatas(metadatas);

        if let Err(err) = inner.check_metric_type(union) {
            inner
                .metrics
                .add_untimed
                .report_error(&err, inner.election_manager.election_state());
            return Err(err);
        }
        let shard = match inner.shard_for(&union.id) {
            Ok(shard) => shard,
            Err(err) => {
                inner
                    .metrics
                    .add_untimed
                    .report_error(&err, inner.election_manager.election_state());
                return Err(err);
            }
        };

        let result = if metadatas.is_empty() {
            shard.add_untimed(union, metadatas)
        } else {
            let split = inner.partition_resend_enabled(&mut metadatas[0].pipelines);
            let mut untimed_pipelines = metadatas[0].pipelines.split_off(split);
            let result =
                inner.dispatch_partitioned(&shard, union, metadatas, split, &mut untimed_pipelines);
            // Restore the caller's pipelines allocation and length.
            metadatas[0].pipelines.append(&mut untimed_pipelines);
            result
        };

        match result {
            Ok(()) => {
                inner.metrics.add_untimed.report_success(started);
                Ok(())
            }
            Err(err) => {
                inner
                    .metrics
                    .add_untimed
                    .report_error(&err, inner.election_manager.election_state());
                Err(err)
            }
        }
    }

    /// Adds a timed metric with metadata.
    pub fn add_timed(
        &self,
        metric: &TimedMetric,
        metadata: &TimedMetadata,
    ) -> Result<(), AggregateError> {
        let inner = &self.inner;
        let started = Instant::now();
        inner.metrics.timed.inc();

        let result = inner
            .shard_for(&metric.id)
            .and_then(|shard| shard.add_timed(metric, metadata));
        match result {
            Ok(()) => {
                inner.metrics.add_timed.report_success(started);
                Ok(())
            }
            Err(err) => {
                inner
                    .metrics
                    .add_timed
                    .report_error(&err, inner.election_manager.election_state());
                Err(err)
            }
        }
    }

    /// Adds a timed metric with staged metadatas, applying the same
    /// in-place metadata rewrite as the untimed path.
    pub fn add_timed_with_staged_metadatas(
        &self,
        metric: &TimedMetric,
        metadatas: &mut StagedMetadatas,
    ) -> Result<(), AggregateError> {
        let inner = &self.inner;
        let started = Instant::now();
        inner.update_staged_metadatas(metadatas);
        inner.metrics.timed.inc();

        let result = inner
            .shard_for(&metric.id)
            .and_then(|shard| shard.add_timed_with_staged_metadatas(metric, metadatas));
        match result {
            Ok(()) => {
                inner.metrics.add_timed.report_success(started);
                Ok(())
            }
            Err(err) => {
                inner
                    .metrics
                    .add_timed
                    .report_error(&err, inner.election_manager.election_state());
                Err(err)
            }
        }
    }

    /// Adds a partial aggregate forwarded from a peer, recording its
    /// forwarding delay on success.
    pub fn add_forwarded(
        &self,
        metric: &ForwardedMetric,
        metadata: &ForwardMetadata,
    ) -> Result<(), AggregateError> {
        let inner = &self.inner;
        let started = Instant::now();
        inner.metrics.forwarded.inc();

        let result = inner
            .shard_for(&metric.id)
            .and_then(|shard| shard.add_forwarded(metric, metadata));
        match result {
            Ok(()) => {
                let call_end = inner.clock.now_nanos();
                inner.metrics.add_forwarded.report_success(started);
                let delay = Duration::from_nanos((call_end - metric.time_nanos).max(0) as u64);
                inner.metrics.forwarding_latency.record(
                    metadata.storage_policy.resolution,
                    metadata.num_forwarded_times,
                    delay,
                );
                Ok(())
            }
            Err(err) => {
                inner
                    .metrics
                    .add_forwarded
                    .report_error(&err, inner.election_manager.election_state());
                Err(err)
            }
        }
    }

    /// Hands a passthrough sample to the downstream writer. On a follower
    /// this is a silent no-op: followers acknowledge but never write.
    pub fn add_passthrough(
        &self,
        metric: &TimedMetric,
        storage_policy: crate::metric::StoragePolicy,
    ) -> Result<(), AggregateError> {
        let inner = &self.inner;
        let started = Instant::now();
        inner.metrics.passthrough.inc();

        if inner.election_manager.election_state() == ElectionState::Follower {
            inner.metrics.add_passthrough.report_follower_noop();
            return Ok(());
        }

        let sample = ChunkedMetricWithStoragePolicy {
            id: metric.id.clone(),
            time_nanos: metric.time_nanos,
            value: metric.value,
            annotation: metric.annotation.clone(),
            storage_policy,
        };

        let state = inner.state.read();
        if state.lifecycle != Lifecycle::Open {
            return Err(AggregateError::NotOpenOrClosed);
        }

        match inner.passthrough_writer.write(sample) {
            Ok(()) => {
                inner.metrics.add_passthrough.ingest.report_success(started);
                Ok(())
            }
            Err(err) => {
                inner
                    .metrics
                    .add_passthrough
                    .ingest
                    .report_error(&err, inner.election_manager.election_state());
                Err(err)
            }
        }
    }

    /// Withdraws this instance from leader election, bounded by the
    /// configured resign timeout.
    pub fn resign(&self) -> Result<(), AggregateError> {
        self.inner
            .election_manager
            .resign(self.inner.cfg.resign_timeout)
            .map_err(AggregateError::from)
    }

    /// Run-time status snapshot.
    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            flush_status: self.inner.flush_manager.status(),
        }
    }

    /// Closes the aggregator: stops the workers, closes every owned shard,
    /// tears down the shard-set binding, and shuts down the flush handler,
    /// passthrough writer, and admin client.
    pub async fn close(&self) -> Result<(), AggregateError> {
        {
            let mut state = self.inner.state.write();
            if state.lifecycle != Lifecycle::Open {
                return Err(AggregateError::NotOpenOrClosed);
            }
            state.lifecycle = Lifecycle::Closed;
        }
        self.inner.cancel.cancel();

        // Join the workers without holding the lock: they take it themselves.
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock();
            guard.drain(..).collect()
        };
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "aggregator worker join failed");
            }
        }

        let mut state = self.inner.state.write();
        for shard_id in state.shard_ids.clone() {
            if let Some(shard) = state.shards.get(shard_id as usize).and_then(Clone::clone) {
                shard.close();
            }
        }
        if state.shard_set_open {
            self.inner.close_shard_set_locked(&mut state)?;
            state.shard_set_id = UNINITIALIZED_SHARD_SET_ID;
            state.shard_set_open = false;
        }
        self.inner.flush_handler.close();
        self.inner.passthrough_writer.close();
        if let Some(admin_client) = &self.inner.admin_client {
            admin_client.close();
        }
        info!("aggregator closed");
        Ok(())
    }

    /// Shards currently pending asynchronous close.
    pub fn shards_pending_close(&self) -> i32 {
        self.inner.shards_pending_close.load(Ordering::Acquire)
    }
}

impl Inner {
    fn should_process_placement(state: &State, new_placement: &Arc<Placement>) -> bool {
        match &state.placement {
            None => true,
            Some(current) => !Arc::ptr_eq(current, new_placement),
        }
    }

    /// Reconciles a newly observed placement under the write lock. No-op if
    /// the snapshot is the one already reconciled.
    fn process_placement_locked(
        self: &Arc<Self>,
        state: &mut State,
        new_placement: Arc<Placement>,
    ) -> Result<(), AggregateError> {
        if !Self::should_process_placement(state, &new_placement) {
            return Ok(());
        }
        self.metrics.placement.changed.inc();

        let instance = match self.placement_manager.instance_from(&new_placement) {
            Ok(instance) => Some(instance.clone()),
            Err(PlacementError::InstanceNotFound) => {
                // Without this log it is hard to debug why the instance is
                // receiving metrics it does not own.
                error!(
                    instance_id = %self.placement_manager.instance_id(),
                    placement_instance_ids = ?new_placement.instance_ids(),
                    "aggregator instance id must appear in placement: \
                     no shards assigned since not found with current instance id",
                );
                None
            }
            Err(PlacementError::Other(e)) => return Err(AggregateError::Internal(e)),
        };

        let new_shard_set = instance
            .as_ref()
            .map(|i| i.shards.clone())
            .unwrap_or_default();
        self.update_shards_locked(state, new_placement, new_shard_set);
        self.update_shard_set_id_locked(state, instance.as_ref())?;

        self.metrics.placement.updated.inc();
        Ok(())
    }

    /// Rebuilds the shard table from the new shard set, reusing live handles
    /// and queueing departed shards for asynchronous close.
    fn update_shards_locked(
        self: &Arc<Self>,
        state: &mut State,
        new_placement: Arc<Placement>,
        mut new_shard_set: Vec<ShardAssignment>,
    ) {
        new_shard_set.sort_by_key(|a| a.id);

        let closing: Vec<Arc<AggregatorShard>> = state
            .shards
            .iter()
            .flatten()
            .filter(|shard| !new_shard_set.iter().any(|a| a.id == shard.id()))
            .cloned()
            .collect();

        let mut incoming: Vec<Option<Arc<AggregatorShard>>> = match new_shard_set.last() {
            Some(max) => vec![None; max.id as usize + 1],
            None => Vec::new(),
        };
        let mut new_shard_ids = Vec::with_capacity(new_shard_set.len());
        for assignment in &new_shard_set {
            let idx = assignment.id as usize;
            new_shard_ids.push(assignment.id);

            let shard = match state.shards.get(idx).and_then(Clone::clone) {
                Some(existing) => existing,
                None => {
                    self.metrics.shards.add.inc();
                    Arc::new(AggregatorShard::new(
                        assignment.id,
                        self.store_factory.create(assignment.id),
                        Arc::clone(&self.clock),
                    ))
                }
            };

            shard.set_redirect_to_shard_id(assignment.redirect_to);
            if !self.cfg.writes_ignore_cutoff_cutover {
                shard.set_writable_range(WritableRange {
                    cutover_nanos: assignment.cutover_nanos,
                    cutoff_nanos: assignment.cutoff_nanos,
                });
            }
            incoming[idx] = Some(shard);
        }

        state.shard_ids = new_shard_ids;
        state.shards = incoming;
        self.cur_num_shards
            .store(new_placement.num_shards as i32, Ordering::Release);
        state.placement = Some(new_placement);
        self.close_shards_async(closing);
    }

    /// Re-evaluates the shard-set binding after a placement change: clears
    /// it when the instance left the placement, binds or re-binds otherwise.
    fn update_shard_set_id_locked(
        self: &Arc<Self>,
        state: &mut State,
        instance: Option<&Instance>,
    ) -> Result<(), AggregateError> {
        match instance {
            None => self.clear_shard_set_id_locked(state),
            Some(instance) => self.reset_shard_set_id_locked(state, instance),
        }
    }

    fn clear_shard_set_id_locked(
        self: &Arc<Self>,
        state: &mut State,
    ) -> Result<(), AggregateError> {
        self.metrics.shard_set.clear.inc();
        if !state.shard_set_open {
            return Ok(());
        }
        self.close_shard_set_locked(state)?;
        state.shard_set_id = UNINITIALIZED_SHARD_SET_ID;
        state.shard_set_open = false;
        Ok(())
    }

    fn reset_shard_set_id_locked(
        self: &Arc<Self>,
        state: &mut State,
        instance: &Instance,
    ) -> Result<(), AggregateError> {
        self.metrics.shard_set.reset.inc();
        if !state.shard_set_open {
            let shard_set_id = instance.shard_set_id;
            self.open_shard_set_locked(shard_set_id)?;
            state.shard_set_id = shard_set_id;
            state.shard_set_open = true;
            return Ok(());
        }
        if instance.shard_set_id == state.shard_set_id {
            self.metrics.shard_set.same.inc();
            return Ok(());
        }
        self.metrics.shard_set.changed.inc();
        self.close_shard_set_locked(state)?;
        let new_shard_set_id = instance.shard_set_id;
        self.open_shard_set_locked(new_shard_set_id)?;
        state.shard_set_id = new_shard_set_id;
        state.shard_set_open = true;
        Ok(())
    }

    // Startup order reflects dependency direction: flush times must exist
    // before elections, elections before flush scheduling.
    fn open_shard_set_locked(&self, shard_set_id: u32) -> Result<(), AggregateError> {
        self.metrics.shard_set.open.inc();
        self.flush_times_manager.open(shard_set_id)?;
        self.election_manager.open(shard_set_id)?;
        self.flush_manager.open()?;
        Ok(())
    }

    // Teardown runs in the reverse dependency order, Close then Reset each.
    fn close_shard_set_locked(&self, _state: &mut State) -> Result<(), AggregateError> {
        self.metrics.shard_set.close.inc();
        self.flush_manager.close()?;
        self.flush_manager.reset()?;
        self.election_manager.close()?;
        self.election_manager.reset()?;
        self.flush_times_manager.close()?;
        self.flush_times_manager.reset()?;
        Ok(())
    }

    /// Resolves the owning shard for a metric id: lock-free hash, then a
    /// read-locked table lookup following at most one redirect hop. The
    /// returned handle stays valid after the lock is released because shards
    /// close asynchronously, only after leaving the table.
    fn shard_for(&self, id: &[u8]) -> Result<Arc<AggregatorShard>, AggregateError> {
        let num_shards = self.cur_num_shards.load(Ordering::Acquire);
        let shard_id = if num_shards > 0 {
            (self.shard_fn)(id, num_shards as u32)
        } else {
            0
        };

        let state = self.state.read();
        let mut shard = state.shards.get(shard_id as usize).and_then(Option::as_ref);
        if let Some(found) = shard {
            if let Some(redirect_id) = found.redirect_to_shard_id() {
                shard = state
                    .shards
                    .get(redirect_id as usize)
                    .and_then(Option::as_ref);
            }
        }
        shard.cloned().ok_or(AggregateError::ShardNotOwned)
    }

    /// Rewrites staged metadatas in place: reset transforms when configured,
    /// and resend demotion for pipelines outside the rollup allowlist.
    fn update_staged_metadatas(&self, metadatas: &mut StagedMetadatas) {
        for staged in metadatas.iter_mut() {
            for pipeline in staged.pipelines.iter_mut() {
                if self.cfg.add_to_reset {
                    pipeline.pipeline = pipeline.pipeline.with_resets();
                }
                if !self.allowlist.resend_enabled(pipeline) {
                    pipeline.resend_enabled = false;
                }
            }
        }
    }

    /// Partitions `pipelines` in place so that `[0, returned)` holds the
    /// resend-enabled pipelines. Order within the groups is not preserved.
    fn partition_resend_enabled(&self, pipelines: &mut [PipelineMetadata]) -> usize {
        let mut start = 0;
        let mut end = pipelines.len();
        while start < end {
            if self.allowlist.resend_enabled(&pipelines[start]) {
                start += 1;
            } else {
                end -= 1;
                pipelines.swap(start, end);
            }
        }
        start
    }

    /// Submits the timed and untimed pipeline groups to the shard. On entry
    /// `metadatas[0].pipelines` holds the timed group and `untimed_pipelines`
    /// the rest; both are left that way for the caller to restore.
    fn dispatch_partitioned(
        &self,
        shard: &Arc<AggregatorShard>,
        union: &MetricUnion,
        metadatas: &mut StagedMetadatas,
        split: usize,
        untimed_pipelines: &mut Vec<PipelineMetadata>,
    ) -> Result<(), AggregateError> {
        if split > 0 {
            if union.metric_type != MetricType::Gauge {
                return Err(AggregateError::TimedConversion(union.metric_type));
            }
            let timed_metric = TimedMetric {
                metric_type: MetricType::Gauge,
                id: union.id.clone(),
                time_nanos: union.client_time_nanos,
                value: union.gauge_val,
                annotation: union.annotation.clone(),
            };
            self.metrics.untimed_to_timed.inc();
            shard.add_timed_with_staged_metadatas(&timed_metric, metadatas)?;
        }
        if !untimed_pipelines.is_empty() {
            std::mem::swap(&mut metadatas[0].pipelines, untimed_pipelines);
            let result = shard.add_untimed(union, metadatas);
            std::mem::swap(&mut metadatas[0].pipelines, untimed_pipelines);
            result?;
        }
        Ok(())
    }

    fn check_metric_type(&self, union: &MetricUnion) -> Result<(), AggregateError> {
        match union.metric_type {
            MetricType::Counter => {
                self.metrics.counters.inc();
                Ok(())
            }
            MetricType::Timer => {
                self.metrics.timer_batches.inc();
                self.metrics.timers.inc_by(union.batch_timer_val.len() as f64);
                Ok(())
            }
            MetricType::Gauge => {
                self.metrics.gauges.inc();
                Ok(())
            }
            MetricType::Unknown => Err(AggregateError::InvalidMetricType),
        }
    }

    /// Splits the table into shards to keep and shards whose data is fully
    /// flushed past cutoff; the latter are removed from the table here and
    /// must be closed outside the lock.
    fn owned_shards(
        self: &Arc<Self>,
    ) -> (Vec<Arc<AggregatorShard>>, Vec<Arc<AggregatorShard>>) {
        let mut state = self.state.write();
        if state.shard_ids.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let flush_times = match self.flush_times_manager.get() {
            Ok(flush_times) => Some(flush_times),
            Err(e) => {
                self.metrics.tick.flush_times_errors.inc();
                debug!(error = %e, "failed to fetch flush times");
                None
            }
        };

        let shard_ids = std::mem::take(&mut state.shard_ids);
        let mut owned = Vec::with_capacity(shard_ids.len());
        let mut to_close = Vec::new();
        let mut kept_ids = Vec::with_capacity(shard_ids.len());
        for shard_id in shard_ids {
            let Some(shard) = state.shards.get(shard_id as usize).and_then(Clone::clone) else {
                continue;
            };
            // A shard may close only when it is no longer writable, has been
            // cut off (a not-yet-cut-over shard may still be warming up), and
            // everything up to its cutoff has been flushed.
            let can_close = !shard.is_writable()
                && shard.is_cutoff()
                && flush_times
                    .as_ref()
                    .map(|ft| {
                        self.flush_times_checker
                            .has_flushed(shard_id, shard.cutoff_nanos(), ft)
                    })
                    .unwrap_or(false);
            if can_close {
                state.shards[shard_id as usize] = None;
                to_close.push(shard);
            } else {
                kept_ids.push(shard_id);
                owned.push(shard);
            }
        }
        state.shard_ids = kept_ids;
        (owned, to_close)
    }

    /// Closes shards on background tasks so in-flight writes can drain
    /// without blocking the caller; each shard's close waits on its own
    /// read-locked writers.
    fn close_shards_async(self: &Arc<Self>, shards: Vec<Arc<AggregatorShard>>) {
        let pending = self
            .shards_pending_close
            .fetch_add(shards.len() as i32, Ordering::AcqRel)
            + shards.len() as i32;
        self.metrics.shards.pending_close.set(f64::from(pending));

        for shard in shards {
            let inner = Arc::clone(self);
            tokio::task::spawn_blocking(move || {
                shard.close();
                let pending = inner.shards_pending_close.fetch_sub(1, Ordering::AcqRel) - 1;
                inner.metrics.shards.pending_close.set(f64::from(pending));
                inner.metrics.shards.close.inc();
            });
        }
    }

    async fn interruptible_sleep(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn tick_once(self: &Arc<Self>) {
        let (owned, to_close) = self.owned_shards();
        self.close_shards_async(to_close);

        self.metrics.shards.owned.set(owned.len() as f64);
        self.metrics.shards.pending_close.set(f64::from(
            self.shards_pending_close.load(Ordering::Acquire),
        ));
        if owned.is_empty() {
            self.interruptible_sleep(self.cfg.check_interval).await;
            return;
        }

        let start = self.clock.now_nanos();
        let per_shard_budget = self.cfg.check_interval / owned.len() as u32;
        let mut result = TickResult::default();
        for shard in &owned {
            result.merge(shard.tick(per_shard_budget));
        }
        let elapsed = Duration::from_nanos((self.clock.now_nanos() - start).max(0) as u64);
        self.metrics.tick.report(&result, elapsed);
        if elapsed < self.cfg.check_interval {
            self.interruptible_sleep(self.cfg.check_interval - elapsed).await;
        }
    }
}

/// Periodic maintenance sweep over the owned shards.
async fn tick_worker(inner: Arc<Inner>) {
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }
        inner.tick_once().await;
    }
}

/// Watches for placement changes and reconciles them. Cheap identity check
/// under the read lock first; the write section re-checks the gate, so two
/// racing updates serialize and the second becomes a no-op.
async fn placement_worker(inner: Arc<Inner>) {
    let notify = inner.placement_manager.change_notifier();
    let mut ticker = tokio::time::interval(inner.cfg.placement_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Consume the immediate first tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
            _ = notify.notified() => {}
        }

        let placement = match inner.placement_manager.placement() {
            Ok(placement) => placement,
            Err(e) => {
                inner.metrics.placement.update_failures.inc();
                debug!(error = %e, "placement fetch failed");
                continue;
            }
        };

        {
            let state = inner.state.read();
            if !Inner::should_process_placement(&state, &placement) {
                continue;
            }
        }

        let mut state = inner.state.write();
        if let Err(e) = inner.process_placement_locked(&mut state, placement) {
            inner.metrics.placement.update_failures.inc();
            warn!(error = %e, "placement update failed");
        }
    }
}
