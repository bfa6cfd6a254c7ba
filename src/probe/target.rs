//! Probe target types.

use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// Default iperf3 server port.
pub const DEFAULT_PORT: u16 = 5201;
/// Default length of one measurement run.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(5);
/// Default time between the starts of two scheduled runs.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);
/// Default hard ceiling on one measurement's execution.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport protocol used by iperf3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol {:?}, expected tcp or udp", other)),
        }
    }
}

/// Identity of a target. Two specs with the same key measure the same thing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub reverse_mode: bool,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.protocol)?;
        if self.reverse_mode {
            f.write_str("/reverse")?;
        }
        Ok(())
    }
}

/// One probe target with all defaults applied. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub reverse_mode: bool,
    /// iperf3 `-b` value, e.g. `100M` or `1G/20`.
    pub bitrate: Option<String>,
    pub period: Duration,
    /// Zero means the target is never scheduled.
    pub interval: Duration,
    pub timeout: Duration,
}

impl TargetSpec {
    /// Create a spec for `host` with every other field at its default.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            protocol: Protocol::Tcp,
            reverse_mode: false,
            bitrate: None,
            period: DEFAULT_PERIOD,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn key(&self) -> TargetKey {
        TargetKey {
            host: self.host.clone(),
            port: self.port,
            protocol: self.protocol,
            reverse_mode: self.reverse_mode,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        !self.interval.is_zero()
    }
}

/// Check a bitrate against iperf3's `#[KMG][/#]` grammar.
pub fn validate_bitrate(bitrate: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[0-9]+(\.[0-9]+)?[KMGkmg]?(/[0-9]+)?$").unwrap()
    });
    re.is_match(bitrate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_applies_defaults() {
        let spec = TargetSpec::new("iperf.example.com");
        assert_eq!(spec.port, 5201);
        assert_eq!(spec.protocol, Protocol::Tcp);
        assert!(!spec.reverse_mode);
        assert_eq!(spec.bitrate, None);
        assert_eq!(spec.period, Duration::from_secs(5));
        assert_eq!(spec.interval, Duration::from_secs(3600));
        assert_eq!(spec.timeout, Duration::from_secs(30));
        assert!(spec.is_scheduled());
    }

    #[test]
    fn test_key_ignores_timing_fields() {
        let a = TargetSpec::new("host");
        let mut b = TargetSpec::new("host");
        b.period = Duration::from_secs(10);
        b.bitrate = Some("10M".to_string());
        assert_eq!(a.key(), b.key());

        b.reverse_mode = true;
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_key_display() {
        let mut spec = TargetSpec::new("10.0.0.1");
        spec.protocol = Protocol::Udp;
        assert_eq!(spec.key().to_string(), "10.0.0.1:5201/udp");
        spec.reverse_mode = true;
        assert_eq!(spec.key().to_string(), "10.0.0.1:5201/udp/reverse");
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_validate_bitrate() {
        for ok in ["100", "100M", "1G/20", "1.5g", "512K/4"] {
            assert!(validate_bitrate(ok), "{} should be valid", ok);
        }
        for bad in ["", "M", "100T", "10M/", "fast", "1G/x"] {
            assert!(!validate_bitrate(bad), "{} should be invalid", bad);
        }
    }
}
