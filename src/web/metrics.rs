//! Prometheus text exposition of measurement results.

use crate::probe::{MeasurementResult, Protocol};

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

const LABELS: &[&str] = &["target", "port", "protocol", "reverse_mode"];

/// Content type of [`encode_results`] output.
pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}

struct Families {
    up: GaugeVec,
    sent_seconds: GaugeVec,
    sent_bytes: GaugeVec,
    sent_bits_per_second: GaugeVec,
    received_seconds: GaugeVec,
    received_bytes: GaugeVec,
    received_bits_per_second: GaugeVec,
    retransmits: GaugeVec,
    sent_packets: GaugeVec,
    lost_packets: GaugeVec,
    lost_percent: GaugeVec,
    jitter_ms: GaugeVec,
    probe_duration_seconds: GaugeVec,
    last_run_timestamp_seconds: GaugeVec,
}

impl Families {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let gauge = |name: &str, help: &str| -> Result<GaugeVec, prometheus::Error> {
            let vec = GaugeVec::new(Opts::new(name, help), LABELS)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        Ok(Self {
            up: gauge("iperf3_up", "Was the last iperf3 probe successful (1 for success, 0 for failure).")?,
            sent_seconds: gauge("iperf3_sent_seconds", "Total seconds spent sending packets.")?,
            sent_bytes: gauge("iperf3_sent_bytes", "Total sent bytes for the last test run.")?,
            sent_bits_per_second: gauge("iperf3_sent_bits_per_second", "Sender bitrate for the last test run.")?,
            received_seconds: gauge("iperf3_received_seconds", "Total seconds spent receiving packets.")?,
            received_bytes: gauge("iperf3_received_bytes", "Total received bytes for the last test run.")?,
            received_bits_per_second: gauge(
                "iperf3_received_bits_per_second",
                "Receiver bitrate for the last test run.",
            )?,
            retransmits: gauge("iperf3_retransmits", "Total retransmits for the last TCP test run.")?,
            sent_packets: gauge("iperf3_sent_packets", "Total sent packets for the last UDP test run.")?,
            lost_packets: gauge("iperf3_lost_packets", "Total lost packets for the last UDP test run.")?,
            lost_percent: gauge("iperf3_lost_percent", "Percentage of packets lost for the last UDP test run.")?,
            jitter_ms: gauge("iperf3_jitter_ms", "Jitter in milliseconds for the last UDP test run.")?,
            probe_duration_seconds: gauge(
                "iperf3_probe_duration_seconds",
                "Wall-clock duration of the last probe, including failures.",
            )?,
            last_run_timestamp_seconds: gauge(
                "iperf3_last_run_timestamp_seconds",
                "Unix time at which the last probe completed.",
            )?,
        })
    }

    fn observe(&self, result: &MeasurementResult) {
        let target = &result.target;
        let port = target.port.to_string();
        let reverse = target.reverse_mode.to_string();
        let labels = [
            target.host.as_str(),
            port.as_str(),
            target.protocol.as_str(),
            reverse.as_str(),
        ];

        self.probe_duration_seconds
            .with_label_values(&labels)
            .set(result.duration.as_secs_f64());
        self.last_run_timestamp_seconds
            .with_label_values(&labels)
            .set(result.completed_at.timestamp_millis() as f64 / 1000.0);

        let stats = match &result.stats {
            Some(stats) => stats,
            None => {
                self.up.with_label_values(&labels).set(0.0);
                return;
            }
        };

        self.up.with_label_values(&labels).set(1.0);
        self.sent_seconds.with_label_values(&labels).set(stats.sent_seconds);
        self.sent_bytes.with_label_values(&labels).set(stats.sent_bytes);
        self.sent_bits_per_second
            .with_label_values(&labels)
            .set(stats.sent_bits_per_second);
        self.received_seconds
            .with_label_values(&labels)
            .set(stats.received_seconds);
        self.received_bytes.with_label_values(&labels).set(stats.received_bytes);
        self.received_bits_per_second
            .with_label_values(&labels)
            .set(stats.received_bits_per_second);

        match target.protocol {
            Protocol::Tcp => self.retransmits.with_label_values(&labels).set(stats.retransmits),
            Protocol::Udp => {
                self.sent_packets.with_label_values(&labels).set(stats.sent_packets);
                self.lost_packets.with_label_values(&labels).set(stats.lost_packets);
                self.lost_percent.with_label_values(&labels).set(stats.lost_percent);
                self.jitter_ms.with_label_values(&labels).set(stats.jitter_ms);
            }
        }
    }
}

/// Encode results in the Prometheus text format.
///
/// A fresh registry is built per call so targets that disappear from the
/// input disappear from the output.
pub fn encode_results<'a, I>(results: I) -> Result<String, prometheus::Error>
where
    I: IntoIterator<Item = &'a MeasurementResult>,
{
    let registry = Registry::new();
    let families = Families::register(&registry)?;

    for result in results {
        families.observe(result);
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
