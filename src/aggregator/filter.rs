use regex::bytes::Regex;
use tracing::error;

use crate::metric::PipelineMetadata;

/// Compiled allowlist of rollup ids whose pipelines may keep resend enabled.
///
/// Patterns that fail to compile are logged and skipped so one bad entry
/// cannot take down construction.
pub struct RollupAllowlist {
    patterns: Vec<Regex>,
}

impl RollupAllowlist {
    pub fn new(exprs: &[String]) -> Self {
        let mut patterns = Vec::with_capacity(exprs.len());
        for expr in exprs {
            match Regex::new(expr) {
                Ok(compiled) => patterns.push(compiled),
                Err(e) => {
                    error!(error = %e, pattern = %expr, "failed to compile resend rollup pattern");
                }
            }
        }
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// A pipeline is resend-enabled iff its flag is set and its first rollup
    /// id matches at least one pattern. Only the first rollup is examined;
    /// pipelines carry at most one in practice.
    pub fn resend_enabled(&self, pipeline: &PipelineMetadata) -> bool {
        if !pipeline.resend_enabled {
            return false;
        }
        if self.patterns.is_empty() {
            return false;
        }
        let Some(rollup_id) = pipeline.pipeline.first_rollup_id() else {
            return false;
        };
        self.patterns.iter().any(|p| p.is_match(rollup_id))
    }
}
