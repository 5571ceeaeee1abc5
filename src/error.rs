use thiserror::Error;

use crate::metric::MetricType;

/// Errors surfaced by the aggregator facade and its shards.
///
/// Admission errors are returned to the caller unchanged and counted under
/// the per-call-site error taxonomy; lifecycle errors indicate misuse of the
/// open/close state machine and are not retriable.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// The aggregator has not been opened yet, or has already been closed.
    #[error("aggregator is not open or closed")]
    NotOpenOrClosed,

    /// Open was called more than once, or after Close.
    #[error("aggregator is already open or closed")]
    AlreadyOpenOrClosed,

    /// The untimed metric union carries an unsupported metric type.
    #[error("invalid metric type")]
    InvalidMetricType,

    /// The metric hashed to a shard this instance does not own.
    #[error("aggregator shard is not owned")]
    ShardNotOwned,

    /// The target shard exists but is outside its writable window.
    #[error("aggregator shard is not writeable")]
    ShardNotWriteable,

    /// The target shard has been closed.
    #[error("aggregator shard is closed")]
    ShardClosed,

    /// Per-value write rate limit exceeded in the shard's store.
    #[error("write value rate limit is exceeded")]
    ValueRateLimitExceeded,

    /// New-series creation rate limit exceeded in the shard's store.
    #[error("write new metric rate limit is exceeded")]
    NewMetricRateLimitExceeded,

    /// The datapoint arrived after its aggregation window was flushed.
    #[error("metric arrived too late")]
    ArrivedTooLate,

    /// Timed metric timestamp is beyond the accepted future bound.
    #[error("metric timestamp is too far in the future")]
    TooFarInTheFuture,

    /// Timed metric timestamp is beyond the accepted past bound.
    #[error("metric timestamp is too far in the past")]
    TooFarInThePast,

    /// An untimed metric with resend-enabled pipelines must be a gauge to be
    /// converted onto the timed path.
    #[error("cannot convert a {0} to a timed metric")]
    TimedConversion(MetricType),

    /// Uncategorized collaborator failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            AggregateError::ShardNotOwned.to_string(),
            "aggregator shard is not owned"
        );
        assert_eq!(
            AggregateError::TimedConversion(MetricType::Counter).to_string(),
            "cannot convert a counter to a timed metric"
        );
    }

    #[test]
    fn test_internal_wraps_anyhow() {
        let err: AggregateError = anyhow::anyhow!("kv store unreachable").into();
        assert!(err.to_string().contains("kv store unreachable"));
    }
}
