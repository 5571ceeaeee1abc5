use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;

use crate::clock::{Clock, SystemClock};
use crate::config::AggregatorConfig;
use crate::election::ElectionManager;
use crate::flush::{FlushManager, FlushTimesManager};
use crate::handler::{AdminClient, FlushHandler, PassthroughWriter};
use crate::placement::PlacementManager;
use crate::shard::StoreFactory;
use crate::sharding::{fnv1a_shard_fn, ShardFn};

/// Upper bound on how late a forwarded metric may arrive, given its
/// resolution and how many hops it has traversed. Drives the scale of the
/// forwarding-latency histogram buckets.
pub type MaxAllowedForwardingDelayFn = Arc<dyn Fn(Duration, usize) -> Duration + Send + Sync>;

fn default_max_allowed_forwarding_delay_fn() -> MaxAllowedForwardingDelayFn {
    Arc::new(|resolution, num_forwarded_times| resolution * num_forwarded_times.max(1) as u32)
}

/// Everything the aggregator needs: plain configuration plus the
/// collaborator subsystems it coordinates but does not implement.
pub struct AggregatorOptions {
    pub config: AggregatorConfig,
    pub placement_manager: Arc<dyn PlacementManager>,
    pub flush_times_manager: Arc<dyn FlushTimesManager>,
    pub election_manager: Arc<dyn ElectionManager>,
    pub flush_manager: Arc<dyn FlushManager>,
    pub flush_handler: Arc<dyn FlushHandler>,
    pub passthrough_writer: Arc<dyn PassthroughWriter>,
    pub admin_client: Option<Arc<dyn AdminClient>>,
    pub store_factory: Arc<dyn StoreFactory>,
    pub clock: Arc<dyn Clock>,
    pub shard_fn: ShardFn,
    pub max_allowed_forwarding_delay_fn: MaxAllowedForwardingDelayFn,
    pub registry: Registry,
}

impl AggregatorOptions {
    /// Assembles options with the default clock, shard function, forwarding
    /// delay function, and a fresh metrics registry. Override the public
    /// fields before constructing the aggregator where needed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AggregatorConfig,
        placement_manager: Arc<dyn PlacementManager>,
        flush_times_manager: Arc<dyn FlushTimesManager>,
        election_manager: Arc<dyn ElectionManager>,
        flush_manager: Arc<dyn FlushManager>,
        flush_handler: Arc<dyn FlushHandler>,
        passthrough_writer: Arc<dyn PassthroughWriter>,
        store_factory: Arc<dyn StoreFactory>,
    ) -> Self {
        Self {
            config,
            placement_manager,
            flush_times_manager,
            election_manager,
            flush_manager,
            flush_handler,
            passthrough_writer,
            admin_client: None,
            store_factory,
            clock: Arc::new(SystemClock),
            shard_fn: fnv1a_shard_fn,
            max_allowed_forwarding_delay_fn: default_max_allowed_forwarding_delay_fn(),
            registry: Registry::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_forwarding_delay_scales_with_hops() {
        let f = default_max_allowed_forwarding_delay_fn();
        let resolution = Duration::from_secs(10);
        assert_eq!(f(resolution, 1), Duration::from_secs(10));
        assert_eq!(f(resolution, 3), Duration::from_secs(30));
        // Zero hops still yields a non-degenerate bound.
        assert_eq!(f(resolution, 0), Duration::from_secs(10));
    }
}
