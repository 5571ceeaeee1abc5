use std::fmt;
use std::time::Duration;

/// Raw metric identifier as received from clients.
pub type MetricId = Vec<u8>;

/// Type tag for untimed metric unions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricType {
    #[default]
    Unknown,
    Counter,
    Timer,
    Gauge,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricType::Unknown => "unknown",
            MetricType::Counter => "counter",
            MetricType::Timer => "timer",
            MetricType::Gauge => "gauge",
        };
        f.write_str(s)
    }
}

/// Untimed metric union: exactly one of the value fields is meaningful,
/// selected by `metric_type`.
#[derive(Debug, Clone, Default)]
pub struct MetricUnion {
    pub metric_type: MetricType,
    pub id: MetricId,
    pub counter_val: i64,
    pub batch_timer_val: Vec<f64>,
    pub gauge_val: f64,
    /// Client-reported time, used when converting to the timed path.
    pub client_time_nanos: i64,
    pub annotation: Vec<u8>,
}

/// A metric that already carries its aggregation timestamp.
#[derive(Debug, Clone, Default)]
pub struct TimedMetric {
    pub metric_type: MetricType,
    pub id: MetricId,
    pub time_nanos: i64,
    pub value: f64,
    pub annotation: Vec<u8>,
}

/// A partial aggregate forwarded from a peer aggregator.
#[derive(Debug, Clone, Default)]
pub struct ForwardedMetric {
    pub metric_type: MetricType,
    pub id: MetricId,
    pub time_nanos: i64,
    pub values: Vec<f64>,
    pub annotation: Vec<u8>,
}

/// Resolution and retention for stored aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoragePolicy {
    pub resolution: Duration,
    pub retention: Duration,
}

impl StoragePolicy {
    pub fn new(resolution: Duration, retention: Duration) -> Self {
        Self {
            resolution,
            retention,
        }
    }
}

/// Metadata accompanying a timed metric.
#[derive(Debug, Clone, Copy)]
pub struct TimedMetadata {
    pub storage_policy: StoragePolicy,
}

/// Metadata accompanying a forwarded metric.
#[derive(Debug, Clone)]
pub struct ForwardMetadata {
    pub storage_policy: StoragePolicy,
    /// How many hops this aggregate has been forwarded through.
    pub num_forwarded_times: usize,
}

/// A single transformation applied within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationType {
    Absolute,
    PerSecond,
    Increase,
    Add,
    Reset,
}

/// Rollup step: re-aggregates the metric under a new id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupOp {
    pub id: Vec<u8>,
}

/// One operation in an aggregation pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOp {
    Transformation(TransformationType),
    Rollup(RollupOp),
}

/// Ordered sequence of transformations applied to a metric before storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    pub operations: Vec<PipelineOp>,
}

impl Pipeline {
    /// Returns a copy with every increase transform replaced by a reset
    /// transform, so downstream consumers see explicit zero datapoints
    /// instead of monotonic deltas.
    pub fn with_resets(&self) -> Pipeline {
        let operations = self
            .operations
            .iter()
            .map(|op| match op {
                PipelineOp::Transformation(TransformationType::Increase) => {
                    PipelineOp::Transformation(TransformationType::Reset)
                }
                other => other.clone(),
            })
            .collect();
        Pipeline { operations }
    }

    /// First rollup id in the pipeline, if any.
    pub fn first_rollup_id(&self) -> Option<&[u8]> {
        self.operations.iter().find_map(|op| match op {
            PipelineOp::Rollup(r) => Some(r.id.as_slice()),
            PipelineOp::Transformation(_) => None,
        })
    }
}

/// A pipeline plus the policies and flags governing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineMetadata {
    pub pipeline: Pipeline,
    pub storage_policies: Vec<StoragePolicy>,
    /// Permits late re-emission of previously flushed aggregates.
    pub resend_enabled: bool,
}

/// One versioned entry in a staged-metadata stack.
#[derive(Debug, Clone, Default)]
pub struct StagedMetadata {
    pub cutover_nanos: i64,
    pub tombstoned: bool,
    pub pipelines: Vec<PipelineMetadata>,
}

/// Versioned stack of pipeline metadata; the first entry is the active one.
pub type StagedMetadatas = Vec<StagedMetadata>;

/// Passthrough sample handed directly to the downstream writer.
#[derive(Debug, Clone)]
pub struct ChunkedMetricWithStoragePolicy {
    pub id: MetricId,
    pub time_nanos: i64,
    pub value: f64,
    pub annotation: Vec<u8>,
    pub storage_policy: StoragePolicy,
}
