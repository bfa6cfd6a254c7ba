//! iperf3 runner: invokes the iperf3 client and parses its JSON report.

use super::{MeasurementRunner, ProbeError, Protocol, TargetSpec, ThroughputStats};

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Runs measurements with the local iperf3 binary.
#[derive(Debug, Clone)]
pub struct Iperf3Runner {
    binary: PathBuf,
}

impl Iperf3Runner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl MeasurementRunner for Iperf3Runner {
    async fn run(&self, target: &TargetSpec) -> Result<ThroughputStats, ProbeError> {
        tracing::debug!(
            "Running {} {}",
            self.binary.display(),
            build_args(target).join(" ")
        );

        // kill_on_drop: a timed-out or cancelled run drops this future and
        // takes the child down with it.
        let output = Command::new(&self.binary)
            .args(build_args(target))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_report(&stdout, target.protocol) {
            Ok(stats) if output.status.success() => Ok(stats),
            Err(ProbeError::Tool(msg)) => Err(ProbeError::Tool(msg)),
            _ if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(ProbeError::Command(format!(
                    "iperf3 exited with {}: {}",
                    output.status,
                    stderr.trim()
                )))
            }
            other => other,
        }
    }
}

/// Build the iperf3 client arguments for a target.
pub fn build_args(target: &TargetSpec) -> Vec<String> {
    let mut args = vec![
        "-J".to_string(),
        "-c".to_string(),
        target.host.clone(),
        "-p".to_string(),
        target.port.to_string(),
        "-t".to_string(),
        target.period.as_secs().max(1).to_string(),
    ];

    if target.reverse_mode {
        args.push("-R".to_string());
    }
    if target.protocol == Protocol::Udp {
        args.push("-u".to_string());
    }
    if let Some(bitrate) = &target.bitrate {
        args.push("-b".to_string());
        args.push(bitrate.clone());
    }

    args
}

#[derive(Debug, Default, Deserialize)]
struct Report {
    #[serde(default)]
    end: Option<ReportEnd>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReportEnd {
    sum_sent: Option<ReportSum>,
    sum_received: Option<ReportSum>,
    sum: Option<ReportSum>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ReportSum {
    seconds: f64,
    bytes: f64,
    bits_per_second: f64,
    retransmits: f64,
    jitter_ms: f64,
    lost_packets: f64,
    packets: f64,
    lost_percent: f64,
}

/// Parse iperf3's `-J` output into throughput stats.
pub fn parse_report(output: &str, protocol: Protocol) -> Result<ThroughputStats, ProbeError> {
    let report: Report =
        serde_json::from_str(output).map_err(|e| ProbeError::Parse(e.to_string()))?;

    if let Some(error) = report.error {
        return Err(ProbeError::Tool(error));
    }

    let end = report
        .end
        .ok_or_else(|| ProbeError::Parse("report has no end section".to_string()))?;

    // Older iperf3 releases only emit `sum` for UDP runs.
    let sent = end.sum_sent.clone().or_else(|| end.sum.clone());
    let received = end.sum_received.clone().or_else(|| end.sum.clone());
    let (sent, received) = match (sent, received) {
        (Some(sent), Some(received)) => (sent, received),
        _ => return Err(ProbeError::Parse("report has no summary".to_string())),
    };

    let mut stats = ThroughputStats {
        sent_seconds: sent.seconds,
        sent_bytes: sent.bytes,
        sent_bits_per_second: sent.bits_per_second,
        received_seconds: received.seconds,
        received_bytes: received.bytes,
        received_bits_per_second: received.bits_per_second,
        ..Default::default()
    };

    match protocol {
        Protocol::Tcp => stats.retransmits = sent.retransmits,
        Protocol::Udp => {
            let sum = end.sum.unwrap_or(received);
            stats.sent_packets = sum.packets;
            stats.lost_packets = sum.lost_packets;
            stats.lost_percent = sum.lost_percent;
            stats.jitter_ms = sum.jitter_ms;
        }
    }

    Ok(stats)
}
