//! Probe module for bandwidth measurements.
//!
//! A [`MeasurementRunner`] executes one measurement; [`measure`] wraps any
//! runner with the target's hard timeout and folds every outcome into a
//! [`MeasurementResult`].

mod iperf3;
mod result;
mod target;

pub use iperf3::*;
pub use result::*;
pub use target::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to start iperf3: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("command failed: {0}")]
    Command(String),
    #[error("iperf3 error: {0}")]
    Tool(String),
    #[error("failed to parse iperf3 output: {0}")]
    Parse(String),
}

/// Executes a single measurement against a target.
///
/// Implementations may run past `target.timeout`; [`measure`] enforces it by
/// dropping the returned future, so anything holding an external process
/// must release it on drop.
#[async_trait]
pub trait MeasurementRunner: Send + Sync {
    async fn run(&self, target: &TargetSpec) -> Result<ThroughputStats, ProbeError>;
}

/// Run one measurement bounded by the target's timeout.
///
/// Never fails: errors and timeouts become a failed result.
pub async fn measure(runner: &dyn MeasurementRunner, target: &TargetSpec) -> MeasurementResult {
    let key = target.key();
    let start = Instant::now();

    let outcome = match tokio::time::timeout(target.timeout, runner.run(target)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ProbeError::Timeout(target.timeout)),
    };
    let elapsed = start.elapsed();

    match outcome {
        Ok(stats) => MeasurementResult::success(key, stats, elapsed),
        Err(e) => MeasurementResult::failure(key, e.to_string(), elapsed),
    }
}
