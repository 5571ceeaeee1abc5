use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use prometheus::{Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry};
use tracing::warn;

use crate::election::ElectionState;
use crate::error::AggregateError;
use crate::shard::{TickCategoryResult, TickResult};

use super::options::MaxAllowedForwardingDelayFn;

const LATENCY_BUCKET_VERSION: &str = "2";
const NUM_FORWARDING_LATENCY_BUCKETS: usize = 40;
const MAX_LATENCY_BUCKET_LIMIT_SCALE_FACTOR: u32 = 2;

/// Success-latency buckets for ingest calls, in seconds.
const INGEST_LATENCY_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
];

fn role_label(state: ElectionState) -> &'static str {
    if state.is_leader() {
        "leader"
    } else {
        "non-leader"
    }
}

/// Maps an admission error onto the closed reason set used as a metric label.
fn error_reason(err: &AggregateError) -> &'static str {
    match err {
        AggregateError::ShardNotOwned => "shard-not-owned",
        AggregateError::ShardNotWriteable => "shard-not-writeable",
        AggregateError::ValueRateLimitExceeded => "value-rate-limit-exceeded",
        AggregateError::NewMetricRateLimitExceeded => "new-metric-rate-limit-exceeded",
        AggregateError::ArrivedTooLate => "arrived-too-late",
        AggregateError::InvalidMetricType => "invalid-metric-types",
        AggregateError::TooFarInTheFuture => "too-far-in-the-future",
        AggregateError::TooFarInThePast => "too-far-in-the-past",
        _ => "not-categorized",
    }
}

/// Success counter/latency plus role-and-reason tagged error counters for
/// one ingest call site.
pub(crate) struct IngestMetrics {
    success: Counter,
    success_latency: Histogram,
    errors: CounterVec,
}

impl IngestMetrics {
    fn new(namespace: &str, site: &str, registry: &Registry) -> Result<Self> {
        let success = Counter::with_opts(
            Opts::new(
                format!("{site}_success_total"),
                format!("Successful {site} calls."),
            )
            .namespace(namespace),
        )?;
        let success_latency = Histogram::with_opts(
            HistogramOpts::new(
                format!("{site}_success_latency_seconds"),
                format!("Latency of successful {site} calls."),
            )
            .namespace(namespace)
            .buckets(INGEST_LATENCY_BUCKETS.to_vec()),
        )?;
        let errors = CounterVec::new(
            Opts::new(
                format!("{site}_errors_total"),
                format!("Failed {site} calls by election role and reason."),
            )
            .namespace(namespace),
            &["role", "reason"],
        )?;
        registry.register(Box::new(success.clone()))?;
        registry.register(Box::new(success_latency.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            success,
            success_latency,
            errors,
        })
    }

    pub fn report_success(&self, started: Instant) {
        self.success.inc();
        self.success_latency.observe(started.elapsed().as_secs_f64());
    }

    pub fn report_error(&self, err: &AggregateError, state: ElectionState) {
        self.errors
            .with_label_values(&[role_label(state), error_reason(err)])
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn test_error_count(&self, role: &str, reason: &str) -> f64 {
        self.errors.with_label_values(&[role, reason]).get()
    }
}

/// Lazily built forwarding-latency histograms keyed by resolution and hop
/// count, with linear buckets scaled to the maximum allowed delay.
pub(crate) struct ForwardingLatencyMetrics {
    namespace: String,
    registry: Registry,
    max_allowed_forwarding_delay_fn: MaxAllowedForwardingDelayFn,
    histograms: RwLock<HashMap<(Duration, usize), Histogram>>,
}

impl ForwardingLatencyMetrics {
    fn new(
        namespace: &str,
        registry: &Registry,
        max_allowed_forwarding_delay_fn: MaxAllowedForwardingDelayFn,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            registry: registry.clone(),
            max_allowed_forwarding_delay_fn,
            histograms: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, resolution: Duration, num_forwarded_times: usize, delay: Duration) {
        let key = (resolution, num_forwarded_times);
        {
            let histograms = self.histograms.read();
            if let Some(histogram) = histograms.get(&key) {
                histogram.observe(delay.as_secs_f64());
                return;
            }
        }

        let mut histograms = self.histograms.write();
        // Re-check: another writer may have built it while we waited.
        if let Some(histogram) = histograms.get(&key) {
            let histogram = histogram.clone();
            drop(histograms);
            histogram.observe(delay.as_secs_f64());
            return;
        }

        let histogram = match self.build_histogram(resolution, num_forwarded_times) {
            Ok(h) => h,
            Err(e) => {
                warn!(
                    error = %e,
                    ?resolution,
                    num_forwarded_times,
                    "failed to build forwarding latency histogram",
                );
                return;
            }
        };
        histograms.insert(key, histogram.clone());
        drop(histograms);
        histogram.observe(delay.as_secs_f64());
    }

    fn build_histogram(&self, resolution: Duration, num_forwarded_times: usize) -> Result<Histogram> {
        let max_allowed = (self.max_allowed_forwarding_delay_fn)(resolution, num_forwarded_times);
        let limit = max_allowed * MAX_LATENCY_BUCKET_LIMIT_SCALE_FACTOR;
        let mut width = limit.as_secs_f64() / NUM_FORWARDING_LATENCY_BUCKETS as f64;
        if width <= 0.0 {
            width = 0.001;
        }
        let buckets = prometheus::linear_buckets(0.0, width, NUM_FORWARDING_LATENCY_BUCKETS)?;

        let histogram = Histogram::with_opts(
            HistogramOpts::new(
                "add_forwarded_forwarding_latency_seconds",
                "Delay between a forwarded metric's timestamp and its arrival.",
            )
            .namespace(self.namespace.clone())
            .const_label("bucket_version", LATENCY_BUCKET_VERSION)
            .const_label("resolution", format!("{resolution:?}"))
            .const_label("num_forwarded_times", num_forwarded_times.to_string())
            .buckets(buckets),
        )?;
        self.registry.register(Box::new(histogram.clone()))?;
        Ok(histogram)
    }

    #[cfg(test)]
    pub(crate) fn histogram_count(&self) -> usize {
        self.histograms.read().len()
    }
}

/// Follower passthrough calls succeed without writing; this counts them.
pub(crate) struct PassthroughMetrics {
    pub ingest: IngestMetrics,
    follower_noop: Counter,
}

impl PassthroughMetrics {
    fn new(namespace: &str, registry: &Registry) -> Result<Self> {
        let follower_noop = Counter::with_opts(
            Opts::new(
                "add_passthrough_follower_noop_total",
                "Passthrough calls acknowledged without writing because this instance follows.",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(follower_noop.clone()))?;

        Ok(Self {
            ingest: IngestMetrics::new(namespace, "add_passthrough", registry)?,
            follower_noop,
        })
    }

    pub fn report_follower_noop(&self) {
        self.follower_noop.inc();
    }

    #[cfg(test)]
    pub(crate) fn test_follower_noop_count(&self) -> f64 {
        self.follower_noop.get()
    }
}

pub(crate) struct PlacementMetrics {
    pub changed: Counter,
    pub updated: Counter,
    pub update_failures: Counter,
}

impl PlacementMetrics {
    fn new(namespace: &str, registry: &Registry) -> Result<Self> {
        let changed = Counter::with_opts(
            Opts::new(
                "placement_changed_total",
                "Placement snapshots observed to differ from the current one.",
            )
            .namespace(namespace),
        )?;
        let updated = Counter::with_opts(
            Opts::new(
                "placement_updated_total",
                "Placement reconciliations completed.",
            )
            .namespace(namespace),
        )?;
        let update_failures = Counter::with_opts(
            Opts::new(
                "placement_update_failures_total",
                "Placement fetches or reconciliations that failed.",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(changed.clone()))?;
        registry.register(Box::new(updated.clone()))?;
        registry.register(Box::new(update_failures.clone()))?;

        Ok(Self {
            changed,
            updated,
            update_failures,
        })
    }
}

pub(crate) struct ShardsMetrics {
    pub add: Counter,
    pub close: Counter,
    pub owned: Gauge,
    pub pending_close: Gauge,
}

impl ShardsMetrics {
    fn new(namespace: &str, registry: &Registry) -> Result<Self> {
        let add = Counter::with_opts(
            Opts::new("shards_add_total", "Shard handles created.").namespace(namespace),
        )?;
        let close = Counter::with_opts(
            Opts::new("shards_close_total", "Shard handles closed.").namespace(namespace),
        )?;
        let owned = Gauge::with_opts(
            Opts::new("shards_owned", "Shards currently owned.").namespace(namespace),
        )?;
        let pending_close = Gauge::with_opts(
            Opts::new("shards_pending_close", "Shards waiting on asynchronous close.")
                .namespace(namespace),
        )?;
        registry.register(Box::new(add.clone()))?;
        registry.register(Box::new(close.clone()))?;
        registry.register(Box::new(owned.clone()))?;
        registry.register(Box::new(pending_close.clone()))?;

        Ok(Self {
            add,
            close,
            owned,
            pending_close,
        })
    }
}

pub(crate) struct ShardSetMetrics {
    pub open: Counter,
    pub close: Counter,
    pub clear: Counter,
    pub reset: Counter,
    pub same: Counter,
    pub changed: Counter,
}

impl ShardSetMetrics {
    fn new(namespace: &str, registry: &Registry) -> Result<Self> {
        let make = |name: &str, help: &str| -> Result<Counter> {
            let counter =
                Counter::with_opts(Opts::new(format!("shard_set_{name}_total"), help).namespace(namespace))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            open: make("open", "Shard-set bindings opened.")?,
            close: make("close", "Shard-set bindings closed.")?,
            clear: make("clear", "Shard-set binding cleared (instance left placement).")?,
            reset: make("reset", "Shard-set binding re-evaluated against a placement.")?,
            same: make("same", "Re-evaluations that kept the existing shard set.")?,
            changed: make("changed", "Re-evaluations that moved to a different shard set.")?,
        })
    }
}

pub(crate) struct TickCategoryMetrics {
    active_entries: Gauge,
    expired_entries: Counter,
    active_elems: GaugeVec,
}

impl TickCategoryMetrics {
    fn new(namespace: &str, metric_type: &str, registry: &Registry) -> Result<Self> {
        let active_entries = Gauge::with_opts(
            Opts::new("tick_active_entries", "Live series entries after the sweep.")
                .namespace(namespace)
                .const_label("metric_type", metric_type),
        )?;
        let expired_entries = Counter::with_opts(
            Opts::new("tick_expired_entries_total", "Series entries expired by sweeps.")
                .namespace(namespace)
                .const_label("metric_type", metric_type),
        )?;
        let active_elems = GaugeVec::new(
            Opts::new("tick_active_elems", "Live aggregation elements by resolution.")
                .namespace(namespace)
                .const_label("metric_type", metric_type),
            &["resolution"],
        )?;
        registry.register(Box::new(active_entries.clone()))?;
        registry.register(Box::new(expired_entries.clone()))?;
        registry.register(Box::new(active_elems.clone()))?;

        Ok(Self {
            active_entries,
            expired_entries,
            active_elems,
        })
    }

    fn report(&self, result: &TickCategoryResult) {
        self.active_entries.set(result.active_entries as f64);
        self.expired_entries.inc_by(result.expired_entries as f64);
        for (resolution_nanos, count) in &result.active_elems {
            let resolution = format!("{:?}", Duration::from_nanos(*resolution_nanos as u64));
            self.active_elems
                .with_label_values(&[resolution.as_str()])
                .set(*count as f64);
        }
    }
}

pub(crate) struct TickMetrics {
    pub flush_times_errors: Counter,
    duration: Histogram,
    standard: TickCategoryMetrics,
    forwarded: TickCategoryMetrics,
}

impl TickMetrics {
    fn new(namespace: &str, registry: &Registry) -> Result<Self> {
        let flush_times_errors = Counter::with_opts(
            Opts::new(
                "tick_flush_times_errors_total",
                "Failures fetching persisted flush times during a tick.",
            )
            .namespace(namespace),
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new("tick_duration_seconds", "Wall time per full tick sweep.")
                .namespace(namespace)
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;
        registry.register(Box::new(flush_times_errors.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            flush_times_errors,
            duration,
            standard: TickCategoryMetrics::new(namespace, "standard", registry)?,
            forwarded: TickCategoryMetrics::new(namespace, "forwarded", registry)?,
        })
    }

    pub fn report(&self, result: &TickResult, elapsed: Duration) {
        self.duration.observe(elapsed.as_secs_f64());
        self.standard.report(&result.standard);
        self.forwarded.report(&result.forwarded);
    }
}

/// The full instrumentation tree for the aggregator, keyed by call site,
/// election role, and error reason.
pub(crate) struct AggregatorMetrics {
    pub counters: Counter,
    pub timers: Counter,
    pub timer_batches: Counter,
    pub gauges: Counter,
    pub timed: Counter,
    pub forwarded: Counter,
    pub passthrough: Counter,
    pub untimed_to_timed: Counter,

    pub add_untimed: IngestMetrics,
    pub add_timed: IngestMetrics,
    pub add_forwarded: IngestMetrics,
    pub add_passthrough: PassthroughMetrics,
    pub forwarding_latency: ForwardingLatencyMetrics,

    pub placement: PlacementMetrics,
    pub shards: ShardsMetrics,
    pub shard_set: ShardSetMetrics,
    pub tick: TickMetrics,
}

impl AggregatorMetrics {
    pub fn new(
        namespace: &str,
        registry: &Registry,
        max_allowed_forwarding_delay_fn: MaxAllowedForwardingDelayFn,
    ) -> Result<Self> {
        let make = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::with_opts(Opts::new(name, help).namespace(namespace))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            counters: make("counters_total", "Untimed counter metrics admitted.")?,
            timers: make("timers_total", "Individual timer values admitted.")?,
            timer_batches: make("timer_batches_total", "Untimed batch-timer metrics admitted.")?,
            gauges: make("gauges_total", "Untimed gauge metrics admitted.")?,
            timed: make("timed_total", "Timed metrics received.")?,
            forwarded: make("forwarded_total", "Forwarded metrics received.")?,
            passthrough: make("passthrough_total", "Passthrough metrics received.")?,
            untimed_to_timed: make(
                "untimed_to_timed_total",
                "Untimed gauges converted onto the timed path by resend partitioning.",
            )?,
            add_untimed: IngestMetrics::new(namespace, "add_untimed", registry)?,
            add_timed: IngestMetrics::new(namespace, "add_timed", registry)?,
            add_forwarded: IngestMetrics::new(namespace, "add_forwarded", registry)?,
            add_passthrough: PassthroughMetrics::new(namespace, registry)?,
            forwarding_latency: ForwardingLatencyMetrics::new(
                namespace,
                registry,
                max_allowed_forwarding_delay_fn,
            ),
            placement: PlacementMetrics::new(namespace, registry)?,
            shards: ShardsMetrics::new(namespace, registry)?,
            shard_set: ShardSetMetrics::new(namespace, registry)?,
            tick: TickMetrics::new(namespace, registry)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn metrics() -> AggregatorMetrics {
        let delay_fn: MaxAllowedForwardingDelayFn =
            Arc::new(|resolution, num_forwarded_times| resolution * num_forwarded_times as u32);
        AggregatorMetrics::new("shardagg_test", &Registry::new(), delay_fn).expect("metrics")
    }

    #[test]
    fn test_all_metrics_register() {
        let m = metrics();
        m.counters.inc();
        m.add_timed.report_success(Instant::now());
        m.add_timed
            .report_error(&AggregateError::ShardNotOwned, ElectionState::Leader);
    }

    #[test]
    fn test_error_reason_mapping() {
        assert_eq!(error_reason(&AggregateError::ShardNotOwned), "shard-not-owned");
        assert_eq!(
            error_reason(&AggregateError::ShardNotWriteable),
            "shard-not-writeable"
        );
        assert_eq!(
            error_reason(&AggregateError::ValueRateLimitExceeded),
            "value-rate-limit-exceeded"
        );
        assert_eq!(
            error_reason(&AggregateError::NewMetricRateLimitExceeded),
            "new-metric-rate-limit-exceeded"
        );
        assert_eq!(error_reason(&AggregateError::ArrivedTooLate), "arrived-too-late");
        assert_eq!(
            error_reason(&AggregateError::InvalidMetricType),
            "invalid-metric-types"
        );
        assert_eq!(
            error_reason(&AggregateError::TooFarInTheFuture),
            "too-far-in-the-future"
        );
        assert_eq!(
            error_reason(&AggregateError::TooFarInThePast),
            "too-far-in-the-past"
        );
        assert_eq!(
            error_reason(&AggregateError::ShardClosed),
            "not-categorized"
        );
        assert_eq!(
            error_reason(&AggregateError::Internal(anyhow::anyhow!("x"))),
            "not-categorized"
        );
    }

    #[test]
    fn test_role_label() {
        assert_eq!(role_label(ElectionState::Leader), "leader");
        assert_eq!(role_label(ElectionState::Follower), "non-leader");
        assert_eq!(role_label(ElectionState::PendingFollower), "non-leader");
    }

    #[test]
    fn test_forwarding_latency_histograms_are_cached_per_key() {
        let m = metrics();
        let resolution = Duration::from_secs(10);

        m.forwarding_latency.record(resolution, 1, Duration::from_millis(5));
        m.forwarding_latency.record(resolution, 1, Duration::from_millis(7));
        assert_eq!(m.forwarding_latency.histogram_count(), 1);

        m.forwarding_latency.record(resolution, 2, Duration::from_millis(5));
        m.forwarding_latency
            .record(Duration::from_secs(60), 1, Duration::from_millis(5));
        assert_eq!(m.forwarding_latency.histogram_count(), 3);
    }

    #[test]
    fn test_tick_report_accepts_composite_result() {
        let m = metrics();
        let mut result = TickResult::default();
        result.standard.active_entries = 10;
        result.standard.expired_entries = 2;
        result.standard.active_elems.insert(10_000_000_000, 4);
        result.forwarded.active_entries = 1;

        m.tick.report(&result, Duration::from_millis(12));
        m.tick.report(&result, Duration::from_millis(15));
    }
}
