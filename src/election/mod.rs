use std::time::Duration;

use anyhow::Result;

/// Role of this instance within its shard set's leader election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElectionState {
    /// This instance flushes aggregates downstream.
    Leader,
    /// This instance aggregates but does not flush.
    #[default]
    Follower,
    /// Lost leadership but still draining before becoming a follower.
    PendingFollower,
}

impl ElectionState {
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionState::Leader)
    }
}

/// Campaigns for per-shard-set leadership on behalf of this instance.
///
/// `open` binds the manager to a shard set; `close` + `reset` return it to
/// a reusable idle state so a later placement can re-bind it.
pub trait ElectionManager: Send + Sync {
    fn open(&self, shard_set_id: u32) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn reset(&self) -> Result<()>;

    /// Withdraws from the current campaign, waiting at most `timeout`.
    fn resign(&self, timeout: Duration) -> Result<()>;

    fn election_state(&self) -> ElectionState;
}
