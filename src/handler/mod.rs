use crate::error::AggregateError;
use crate::metric::ChunkedMetricWithStoragePolicy;

/// Downstream consumer of flushed aggregate buffers, owned by the engine
/// only for lifecycle purposes.
pub trait FlushHandler: Send + Sync {
    fn close(&self);
}

/// Writes passthrough samples straight to storage, bypassing aggregation.
pub trait PassthroughWriter: Send + Sync {
    fn write(&self, metric: ChunkedMetricWithStoragePolicy) -> Result<(), AggregateError>;

    fn close(&self);
}

/// Optional client for administrative traffic to peer aggregators; the
/// engine owns only its shutdown.
pub trait AdminClient: Send + Sync {
    fn close(&self);
}
