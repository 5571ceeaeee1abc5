use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shardagg::aggregator::options::AggregatorOptions;
use shardagg::aggregator::Aggregator;
use shardagg::clock::ManualClock;
use shardagg::election::{ElectionManager, ElectionState};
use shardagg::error::AggregateError;
use shardagg::flush::{FlushManager, FlushStatus, FlushTimes, FlushTimesManager, ShardFlushTimes};
use shardagg::handler::{FlushHandler, PassthroughWriter};
use shardagg::metric::{
    ChunkedMetricWithStoragePolicy, ForwardMetadata, ForwardedMetric, MetricType, MetricUnion,
    StagedMetadatas, StoragePolicy, TimedMetadata, TimedMetric,
};
use shardagg::placement::{Instance, Placement, ShardAssignment, StaticPlacementManager};
use shardagg::shard::{MetricStore, StoreFactory, TickResult};
use shardagg::AggregatorConfig;

const INSTANCE_ID: &str = "agg-blackbox-01";

fn first_byte_shard_fn(id: &[u8], num_shards: u32) -> u32 {
    if num_shards == 0 {
        return 0;
    }
    id.first().map(|b| u32::from(*b)).unwrap_or(0) % num_shards
}

#[derive(Default)]
struct CountingStore {
    writes: AtomicUsize,
    closed: AtomicBool,
}

impl MetricStore for CountingStore {
    fn add_untimed(
        &self,
        _metric: &MetricUnion,
        _metadatas: &StagedMetadatas,
    ) -> Result<(), AggregateError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn add_timed(
        &self,
        _metric: &TimedMetric,
        _metadata: &TimedMetadata,
    ) -> Result<(), AggregateError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn add_timed_with_staged_metadatas(
        &self,
        _metric: &TimedMetric,
        _metadatas: &StagedMetadatas,
    ) -> Result<(), AggregateError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn add_forwarded(
        &self,
        _metric: &ForwardedMetric,
        _metadata: &ForwardMetadata,
    ) -> Result<(), AggregateError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn tick(&self, _budget: Duration) -> TickResult {
        TickResult::default()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CountingStoreFactory {
    stores: Mutex<HashMap<u32, Arc<CountingStore>>>,
}

impl CountingStoreFactory {
    fn store(&self, shard_id: u32) -> Option<Arc<CountingStore>> {
        self.stores.lock().expect("lock").get(&shard_id).cloned()
    }
}

impl StoreFactory for CountingStoreFactory {
    fn create(&self, shard_id: u32) -> Arc<dyn MetricStore> {
        let store = Arc::new(CountingStore::default());
        self.stores
            .lock()
            .expect("lock")
            .insert(shard_id, Arc::clone(&store));
        store
    }
}

struct FixedElectionManager {
    state: Mutex<ElectionState>,
}

impl FixedElectionManager {
    fn new(state: ElectionState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl ElectionManager for FixedElectionManager {
    fn open(&self, _shard_set_id: u32) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn resign(&self, _timeout: Duration) -> anyhow::Result<()> {
        *self.state.lock().expect("lock") = ElectionState::Follower;
        Ok(())
    }

    fn election_state(&self) -> ElectionState {
        *self.state.lock().expect("lock")
    }
}

#[derive(Default)]
struct NoopFlushManager;

impl FlushManager for NoopFlushManager {
    fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn status(&self) -> FlushStatus {
        FlushStatus::default()
    }
}

struct FixedFlushTimesManager {
    flush_times: Mutex<Arc<FlushTimes>>,
}

impl FixedFlushTimesManager {
    fn new(flush_times: FlushTimes) -> Self {
        Self {
            flush_times: Mutex::new(Arc::new(flush_times)),
        }
    }
}

impl FlushTimesManager for FixedFlushTimesManager {
    fn open(&self, _shard_set_id: u32) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn get(&self) -> anyhow::Result<Arc<FlushTimes>> {
        Ok(Arc::clone(&self.flush_times.lock().expect("lock")))
    }
}

#[derive(Default)]
struct SinkWriter {
    writes: Mutex<Vec<ChunkedMetricWithStoragePolicy>>,
}

impl PassthroughWriter for SinkWriter {
    fn write(&self, metric: ChunkedMetricWithStoragePolicy) -> Result<(), AggregateError> {
        self.writes.lock().expect("lock").push(metric);
        Ok(())
    }

    fn close(&self) {}
}

#[derive(Default)]
struct NoopFlushHandler;

impl FlushHandler for NoopFlushHandler {
    fn close(&self) {}
}

fn assignment(id: u32) -> ShardAssignment {
    ShardAssignment::always_writable(id)
}

fn placement_of(num_shards: u32, shards: Vec<ShardAssignment>) -> Placement {
    Placement {
        num_shards,
        instances: vec![Instance {
            id: INSTANCE_ID.to_string(),
            shard_set_id: 1,
            shards,
        }],
    }
}

fn storage_policy() -> StoragePolicy {
    StoragePolicy::new(Duration::from_secs(10), Duration::from_secs(3600))
}

fn timed(id: &[u8]) -> TimedMetric {
    TimedMetric {
        metric_type: MetricType::Gauge,
        id: id.to_vec(),
        time_nanos: 500,
        value: 1.0,
        annotation: Vec::new(),
    }
}

struct TestBed {
    aggregator: Aggregator,
    placement_manager: Arc<StaticPlacementManager>,
    stores: Arc<CountingStoreFactory>,
    writer: Arc<SinkWriter>,
    clock: Arc<ManualClock>,
    registry: prometheus::Registry,
}

fn test_bed(placement: Placement, election_state: ElectionState, flush_times: FlushTimes) -> TestBed {
    let placement_manager = Arc::new(StaticPlacementManager::new(INSTANCE_ID, placement));
    let stores = Arc::new(CountingStoreFactory::default());
    let writer = Arc::new(SinkWriter::default());
    let clock = ManualClock::new(1_000);

    let config = AggregatorConfig {
        check_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let mut opts = AggregatorOptions::new(
        config,
        placement_manager.clone(),
        Arc::new(FixedFlushTimesManager::new(flush_times)),
        Arc::new(FixedElectionManager::new(election_state)),
        Arc::new(NoopFlushManager),
        Arc::new(NoopFlushHandler),
        writer.clone(),
        stores.clone(),
    );
    opts.clock = clock.clone();
    opts.shard_fn = first_byte_shard_fn;
    let registry = opts.registry.clone();

    TestBed {
        aggregator: Aggregator::new(opts).expect("aggregator"),
        placement_manager,
        stores,
        writer,
        clock,
        registry,
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_lifecycle_with_rebalance() {
    let bed = test_bed(
        placement_of(4, vec![assignment(0), assignment(1), assignment(2), assignment(3)]),
        ElectionState::Leader,
        FlushTimes::default(),
    );
    bed.aggregator.open().await.expect("open");

    // Ingest lands on the shard the id hashes to.
    bed.aggregator
        .add_timed(&timed(&[1]), &TimedMetadata {
            storage_policy: storage_policy(),
        })
        .expect("timed");
    bed.aggregator
        .add_forwarded(
            &ForwardedMetric {
                metric_type: MetricType::Gauge,
                id: vec![2],
                time_nanos: 500,
                values: vec![1.0, 2.0],
                annotation: Vec::new(),
            },
            &ForwardMetadata {
                storage_policy: storage_policy(),
                num_forwarded_times: 2,
            },
        )
        .expect("forwarded");
    let mut metadatas: StagedMetadatas = Vec::new();
    bed.aggregator
        .add_untimed(
            &MetricUnion {
                metric_type: MetricType::Counter,
                id: vec![3],
                counter_val: 9,
                ..Default::default()
            },
            &mut metadatas,
        )
        .expect("untimed");

    assert_eq!(
        bed.stores.store(1).expect("store").writes.load(Ordering::SeqCst),
        1
    );
    assert_eq!(
        bed.stores.store(2).expect("store").writes.load(Ordering::SeqCst),
        1
    );
    assert_eq!(
        bed.stores.store(3).expect("store").writes.load(Ordering::SeqCst),
        1
    );

    // Leader passthrough reaches the writer.
    bed.aggregator
        .add_passthrough(&timed(b"sample"), storage_policy())
        .expect("passthrough");
    assert_eq!(bed.writer.writes.lock().expect("lock").len(), 1);

    // Rebalance: shards 2 and 3 leave, shard 0 now redirects to 1.
    let mut redirected = assignment(0);
    redirected.redirect_to = Some(1);
    bed.placement_manager
        .update(placement_of(4, vec![redirected, assignment(1)]));

    let stores = Arc::clone(&bed.stores);
    wait_until("departed shards to close", move || {
        stores.store(2).map(|s| s.closed.load(Ordering::SeqCst)).unwrap_or(false)
            && stores.store(3).map(|s| s.closed.load(Ordering::SeqCst)).unwrap_or(false)
    })
    .await;

    let aggregator = &bed.aggregator;
    wait_until("pending close to settle", || {
        aggregator.shards_pending_close() == 0
    })
    .await;

    // Departed shards reject ingest without blocking on their close.
    assert!(matches!(
        bed.aggregator.add_timed(&timed(&[2]), &TimedMetadata {
            storage_policy: storage_policy(),
        }),
        Err(AggregateError::ShardNotOwned)
    ));

    // Redirected shard serves its traffic through the target.
    let before = bed.stores.store(1).expect("store").writes.load(Ordering::SeqCst);
    bed.aggregator
        .add_timed(&timed(&[0]), &TimedMetadata {
            storage_policy: storage_policy(),
        })
        .expect("redirected");
    assert_eq!(
        bed.stores.store(1).expect("store").writes.load(Ordering::SeqCst),
        before + 1
    );
    assert_eq!(
        bed.stores.store(0).expect("store").writes.load(Ordering::SeqCst),
        0
    );

    bed.aggregator.close().await.expect("close");
    assert!(bed.stores.store(0).expect("store").closed.load(Ordering::SeqCst));
    assert!(bed.stores.store(1).expect("store").closed.load(Ordering::SeqCst));

    // The registry carries the engine's instrumentation.
    let families: Vec<String> = bed
        .registry
        .gather()
        .into_iter()
        .map(|f| f.get_name().to_string())
        .collect();
    assert!(families.iter().any(|n| n == "shardagg_add_timed_success_total"));
    assert!(families.iter().any(|n| n == "shardagg_shards_owned"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follower_acknowledges_passthrough_without_writing() {
    let bed = test_bed(
        placement_of(2, vec![assignment(0), assignment(1)]),
        ElectionState::Follower,
        FlushTimes::default(),
    );
    bed.aggregator.open().await.expect("open");

    bed.aggregator
        .add_passthrough(&timed(b"sample"), storage_policy())
        .expect("follower ack");
    assert!(bed.writer.writes.lock().expect("lock").is_empty());

    bed.aggregator.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tick_drains_fully_flushed_shard() {
    let mut ending = assignment(1);
    ending.cutover_nanos = 0;
    ending.cutoff_nanos = 5_000;

    let mut shard_times = ShardFlushTimes::default();
    shard_times
        .standard_by_resolution
        .insert(10_000_000_000, 9_000);
    let mut flush_times = FlushTimes::default();
    flush_times.by_shard.insert(1, shard_times);

    let bed = test_bed(
        placement_of(2, vec![assignment(0), ending]),
        ElectionState::Leader,
        flush_times,
    );
    bed.aggregator.open().await.expect("open");

    bed.clock.set(6_000);
    let stores = Arc::clone(&bed.stores);
    wait_until("cutoff shard to drain", move || {
        stores.store(1).map(|s| s.closed.load(Ordering::SeqCst)).unwrap_or(false)
    })
    .await;

    assert!(matches!(
        bed.aggregator.add_timed(&timed(&[1]), &TimedMetadata {
            storage_policy: storage_policy(),
        }),
        Err(AggregateError::ShardNotOwned)
    ));

    bed.aggregator.close().await.expect("close");
}
