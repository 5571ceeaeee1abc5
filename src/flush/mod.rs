use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use prometheus::{Counter, Opts, Registry};

use crate::election::ElectionState;

/// Snapshot of the flush subsystem's view of this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushStatus {
    pub election_state: ElectionState,
    /// Whether this instance is allowed to lead flushing right now.
    pub can_lead: bool,
}

/// Schedules flushes for the shard set this instance participates in.
pub trait FlushManager: Send + Sync {
    fn open(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn reset(&self) -> Result<()>;

    fn status(&self) -> FlushStatus;
}

/// Per-shard flush progress for forwarded lanes at one resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedFlushTimes {
    /// num_forwarded_times -> flushed-through nanos.
    pub by_num_forwarded_times: HashMap<usize, i64>,
}

/// Flush progress for one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardFlushTimes {
    /// resolution nanos -> flushed-through nanos.
    pub standard_by_resolution: HashMap<i64, i64>,
    /// resolution nanos -> forwarded lanes.
    pub forwarded_by_resolution: HashMap<i64, ForwardedFlushTimes>,
}

/// Persisted flush progress for every shard in the shard set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushTimes {
    pub by_shard: HashMap<u32, ShardFlushTimes>,
}

/// Persists and retrieves per-shard flush progress for a shard set.
pub trait FlushTimesManager: Send + Sync {
    fn open(&self, shard_set_id: u32) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn reset(&self) -> Result<()>;

    fn get(&self) -> Result<Arc<FlushTimes>>;
}

/// Decides whether a shard's data has been fully flushed through its cutoff,
/// which gates removing the shard during tick.
pub struct FlushTimesChecker {
    no_flush_times: Counter,
    not_fully_flushed: Counter,
}

impl FlushTimesChecker {
    pub fn new(namespace: &str, registry: &Registry) -> Result<Self> {
        let no_flush_times = Counter::with_opts(
            Opts::new(
                "tick_shard_check_no_flush_times_total",
                "Shard close checks skipped because the shard has no recorded flush times.",
            )
            .namespace(namespace),
        )?;
        let not_fully_flushed = Counter::with_opts(
            Opts::new(
                "tick_shard_check_not_fully_flushed_total",
                "Shard close checks rejected because some lane has not flushed through cutoff.",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(no_flush_times.clone()))?;
        registry.register(Box::new(not_fully_flushed.clone()))?;

        Ok(Self {
            no_flush_times,
            not_fully_flushed,
        })
    }

    /// True iff every standard resolution and every forwarded lane recorded
    /// for `shard_id` has flushed through `cutoff_nanos`.
    pub fn has_flushed(&self, shard_id: u32, cutoff_nanos: i64, flush_times: &FlushTimes) -> bool {
        let Some(shard_times) = flush_times.by_shard.get(&shard_id) else {
            self.no_flush_times.inc();
            return false;
        };

        for flushed_through in shard_times.standard_by_resolution.values() {
            if *flushed_through < cutoff_nanos {
                self.not_fully_flushed.inc();
                return false;
            }
        }
        for lanes in shard_times.forwarded_by_resolution.values() {
            for flushed_through in lanes.by_num_forwarded_times.values() {
                if *flushed_through < cutoff_nanos {
                    self.not_fully_flushed.inc();
                    return false;
                }
            }
        }
        true
    }
}
