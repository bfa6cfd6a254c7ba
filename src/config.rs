//! Configuration module for the exporter.
//!
//! Settings come from command-line flags (each with an environment
//! variable), optionally overridden by a TOML file that also lists the
//! targets to probe on a schedule.

use crate::probe::{validate_bitrate, Protocol, TargetSpec, DEFAULT_INTERVAL, DEFAULT_PERIOD, DEFAULT_PORT};

use clap::{Parser, ValueEnum};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Logfmt,
    Json,
}

/// Command-line flags.
#[derive(Debug, Clone, Parser)]
#[command(name = "iperf3_exporter", version, about = "Prometheus exporter for iperf3 probes")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "IPERF3_EXPORTER_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Address (or bare port) to listen on
    #[arg(long, env = "IPERF3_EXPORTER_LISTEN_ADDRESS", default_value = "0.0.0.0:9579")]
    pub listen_address: String,

    /// Path under which to expose metrics
    #[arg(long, default_value = "/metrics")]
    pub metrics_path: String,

    /// Path under which to expose the probe endpoint
    #[arg(long, default_value = "/probe")]
    pub probe_path: String,

    /// Timeout for each iperf3 run
    #[arg(long = "iperf3-timeout", env = "IPERF3_EXPORTER_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// iperf3 binary to execute
    #[arg(long = "iperf3-path", env = "IPERF3_EXPORTER_IPERF3_PATH", default_value = "iperf3")]
    pub iperf3_path: PathBuf,

    /// Only log messages with the given severity or above: debug, info, warn, error
    #[arg(long, env = "IPERF3_EXPORTER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output format of log messages
    #[arg(long, env = "IPERF3_EXPORTER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Logfmt)]
    pub log_format: LogFormat,
}

/// Contents of the configuration file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen_address: Option<String>,
    pub metrics_path: Option<String>,
    pub probe_path: Option<String>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub timeout: Option<Duration>,
    pub iperf3_path: Option<PathBuf>,
    #[serde(default)]
    pub logging: FileLogging,
    #[serde(default)]
    pub targets: Vec<FileTarget>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileLogging {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

/// A `[[targets]]` entry before defaults are applied.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileTarget {
    pub host: String,
    pub port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub reverse_mode: Option<bool>,
    pub bitrate: Option<String>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub period: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub interval: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub timeout: Option<Duration>,
}

impl FileTarget {
    fn into_spec(self, default_timeout: Duration) -> TargetSpec {
        TargetSpec {
            host: self.host.trim().to_string(),
            port: self.port.unwrap_or(DEFAULT_PORT),
            protocol: self.protocol.unwrap_or_default(),
            reverse_mode: self.reverse_mode.unwrap_or(false),
            bitrate: self.bitrate,
            period: self.period.unwrap_or(DEFAULT_PERIOD),
            interval: self.interval.unwrap_or(DEFAULT_INTERVAL),
            timeout: self.timeout.unwrap_or(default_timeout),
        }
    }
}

impl FileConfig {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }
}

/// Logging settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Runtime configuration with every default applied and validated.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub listen_address: SocketAddr,
    pub metrics_path: String,
    pub probe_path: String,
    /// Default timeout for targets and on-demand probes.
    pub timeout: Duration,
    pub iperf3_path: PathBuf,
    pub logging: LoggingConfig,
    pub targets: Vec<TargetSpec>,
}

impl ExporterConfig {
    /// Load configuration from the command line, environment and config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::from_path(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    /// Combine flags with a parsed file; file values win.
    pub fn merge(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let timeout = file.timeout.unwrap_or(cli.timeout);
        let listen_address = file.listen_address.unwrap_or(cli.listen_address);

        let cfg = Self {
            listen_address: parse_listen_address(&listen_address)?,
            metrics_path: file.metrics_path.unwrap_or(cli.metrics_path),
            probe_path: file.probe_path.unwrap_or(cli.probe_path),
            timeout,
            iperf3_path: file.iperf3_path.unwrap_or(cli.iperf3_path),
            logging: LoggingConfig {
                level: file.logging.level.unwrap_or(cli.log_level),
                format: file.logging.format.unwrap_or(cli.log_format),
            },
            targets: file
                .targets
                .into_iter()
                .map(|t| t.into_spec(timeout))
                .collect(),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [("metrics path", &self.metrics_path), ("probe path", &self.probe_path)] {
            if !path.starts_with('/') {
                return Err(invalid(format!("{} must start with '/', got {:?}", name, path)));
            }
        }
        if self.metrics_path == self.probe_path || self.metrics_path == "/" || self.probe_path == "/" {
            return Err(invalid("metrics and probe paths must be distinct and not '/'"));
        }

        if self.timeout.is_zero() {
            return Err(invalid("timeout must be greater than 0"));
        }

        if !["debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid(format!(
                "log level must be one of debug, info, warn, error, got {:?}",
                self.logging.level
            )));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            validate_target(target)?;
            if !seen.insert(target.key()) {
                return Err(invalid(format!("duplicate target {}", target.key())));
            }
        }

        Ok(())
    }
}

fn validate_target(target: &TargetSpec) -> Result<(), ConfigError> {
    if target.host.is_empty() {
        return Err(invalid("target host cannot be empty"));
    }
    if target.port == 0 {
        return Err(invalid(format!("target {}: port must be 1-65535", target.host)));
    }
    if let Some(bitrate) = &target.bitrate {
        if !validate_bitrate(bitrate) {
            return Err(invalid(format!(
                "target {}: invalid bitrate {:?}, expected #[KMG][/#]",
                target.host, bitrate
            )));
        }
    }
    if target.period.is_zero() {
        return Err(invalid(format!("target {}: period must be greater than 0", target.host)));
    }
    if target.timeout.is_zero() {
        return Err(invalid(format!("target {}: timeout must be greater than 0", target.host)));
    }
    if target.timeout < target.period {
        tracing::warn!(
            "Target {}: timeout {:?} is shorter than period {:?}, runs will be cut short",
            target.key(),
            target.timeout,
            target.period
        );
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Accepts `host:port`, `:port` or a bare port.
fn parse_listen_address(addr: &str) -> Result<SocketAddr, ConfigError> {
    let addr = addr.trim();
    let port = addr.strip_prefix(':').unwrap_or(addr);
    if let Ok(port) = port.parse::<u16>() {
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }
    addr.parse()
        .map_err(|_| invalid(format!("invalid listen address {:?}", addr)))
}

/// Parse a duration such as `5s`, `1m30s`, `250ms` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| format!("invalid duration {:?}", s));
    }

    static FULL: OnceLock<Regex> = OnceLock::new();
    static PART: OnceLock<Regex> = OnceLock::new();
    let full = FULL.get_or_init(|| {
        Regex::new(r"^(?:[0-9]+(?:\.[0-9]+)?(?:ns|us|µs|ms|s|m|h))+$").unwrap()
    });
    let part = PART.get_or_init(|| {
        Regex::new(r"(?P<val>[0-9]+(?:\.[0-9]+)?)(?P<unit>ns|us|µs|ms|s|m|h)").unwrap()
    });

    if !full.is_match(s) {
        return Err(format!("invalid duration {:?}", s));
    }

    let mut total = 0.0;
    for caps in part.captures_iter(s) {
        let val: f64 = caps["val"]
            .parse()
            .map_err(|_| format!("invalid duration {:?}", s))?;
        let scale = match &caps["unit"] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            _ => 3600.0,
        };
        total += val * scale;
    }

    Duration::try_from_secs_f64(total).map_err(|_| format!("invalid duration {:?}", s))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Fractional(f64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawDuration::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(RawDuration::Fractional(secs)) => parse_duration(&secs.to_string())
            .map(Some)
            .map_err(D::Error::custom),
        Some(RawDuration::Text(text)) => parse_duration(&text).map(Some).map_err(D::Error::custom),
    }
}
