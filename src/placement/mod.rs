use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::Notify;

/// One shard assigned to an instance, with its write window and optional
/// rebalance redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssignment {
    pub id: u32,
    /// Writes are accepted from this instant (nanos since epoch).
    pub cutover_nanos: i64,
    /// Writes are rejected from this instant onward.
    pub cutoff_nanos: i64,
    /// If set, ingest addressed to this shard is served by the target shard.
    pub redirect_to: Option<u32>,
}

impl ShardAssignment {
    /// An assignment that is writable for all time, with no redirect.
    pub fn always_writable(id: u32) -> Self {
        Self {
            id,
            cutover_nanos: i64::MIN,
            cutoff_nanos: i64::MAX,
            redirect_to: None,
        }
    }
}

/// A single instance's membership in the placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    /// Election/flush group this instance belongs to. Zero is reserved for
    /// "uninitialized" and must not appear in a valid placement.
    pub shard_set_id: u32,
    /// Assigned shards, ascending by shard id.
    pub shards: Vec<ShardAssignment>,
}

/// Immutable cluster-wide assignment of shards to instances.
///
/// The placement manager must allocate a fresh `Arc<Placement>` for every
/// topology change: the aggregator detects change via `Arc::ptr_eq`, never
/// by structural comparison.
#[derive(Debug, Clone, Default)]
pub struct Placement {
    /// Total shards in the hash space.
    pub num_shards: u32,
    pub instances: Vec<Instance>,
}

impl Placement {
    /// Looks up an instance by id.
    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    /// All instance ids, for diagnostics.
    pub fn instance_ids(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.id.as_str()).collect()
    }
}

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("instance not found in placement")]
    InstanceNotFound,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Watches cluster topology on behalf of one instance.
pub trait PlacementManager: Send + Sync {
    /// Starts watching for placement changes.
    fn open(&self) -> Result<()>;

    /// Latest observed placement snapshot.
    fn placement(&self) -> Result<Arc<Placement>>;

    /// This instance's entry in the given placement.
    fn instance_from<'a>(&self, placement: &'a Placement)
        -> Result<&'a Instance, PlacementError>;

    /// The id this process registered under.
    fn instance_id(&self) -> String;

    /// Notified on every placement change. The notification is a wakeup
    /// hint only; consumers re-fetch and compare snapshots themselves.
    fn change_notifier(&self) -> Arc<Notify>;
}

/// Placement manager over an in-process snapshot, updated by the embedder.
///
/// Useful for single-process deployments and as the test double for the
/// aggregator's reconciliation path.
pub struct StaticPlacementManager {
    instance_id: String,
    current: parking_lot::RwLock<Arc<Placement>>,
    notify: Arc<Notify>,
}

impl StaticPlacementManager {
    pub fn new(instance_id: impl Into<String>, placement: Placement) -> Self {
        Self {
            instance_id: instance_id.into(),
            current: parking_lot::RwLock::new(Arc::new(placement)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Publishes a new placement snapshot and wakes the watcher. Uses a
    /// stored permit so an update delivered while the watcher is busy is
    /// picked up on its next wait.
    pub fn update(&self, placement: Placement) {
        *self.current.write() = Arc::new(placement);
        self.notify.notify_one();
    }
}

impl PlacementManager for StaticPlacementManager {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn placement(&self) -> Result<Arc<Placement>> {
        Ok(Arc::clone(&self.current.read()))
    }

    fn instance_from<'a>(
        &self,
        placement: &'a Placement,
    ) -> Result<&'a Instance, PlacementError> {
        placement
            .instance(&self.instance_id)
            .ok_or(PlacementError::InstanceNotFound)
    }

    fn instance_id(&self) -> String {
        self.instance_id.clone()
    }

    fn change_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}
