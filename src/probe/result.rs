//! Measurement result types.

use super::target::TargetKey;

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Numbers extracted from one iperf3 run.
///
/// TCP runs leave the packet/jitter fields at zero; UDP runs leave
/// `retransmits` at zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThroughputStats {
    pub sent_seconds: f64,
    pub sent_bytes: f64,
    pub sent_bits_per_second: f64,
    pub received_seconds: f64,
    pub received_bytes: f64,
    pub received_bits_per_second: f64,
    pub retransmits: f64,
    pub sent_packets: f64,
    pub lost_packets: f64,
    pub lost_percent: f64,
    pub jitter_ms: f64,
}

/// Outcome of one probe execution. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct MeasurementResult {
    pub target: TargetKey,
    /// Present when the run succeeded.
    pub stats: Option<ThroughputStats>,
    /// Present when the run failed.
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
}

impl MeasurementResult {
    pub fn success(target: TargetKey, stats: ThroughputStats, duration: Duration) -> Self {
        Self {
            target,
            stats: Some(stats),
            error: None,
            completed_at: Utc::now(),
            duration,
        }
    }

    pub fn failure(target: TargetKey, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            target,
            stats: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.stats.is_some()
    }
}
