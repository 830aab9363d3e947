use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// A time server to probe
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Host name or IP literal
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Target {
    /// Creates a new target
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Target {
            host: host.into(),
            port,
        }
    }

    /// Parses `host`, `host:port`, `[v6]` or `[v6]:port`, falling back to
    /// `default_port` when none is given.
    pub fn parse(input: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::config("server address cannot be empty"));
        }

        if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::config(format!("unterminated IPv6 literal: {}", input)))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p)?,
                None if tail.is_empty() => default_port,
                None => return Err(Error::config(format!("invalid server address: {}", input))),
            };
            return Ok(Target::new(host, port));
        }

        // A bare IPv6 literal has more than one colon and no port.
        match input.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => Ok(Target::new(host, parse_port(port)?)),
            _ => Ok(Target::new(input, default_port)),
        }
    }
}

fn parse_port(s: &str) -> Result<u16> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(Error::config(format!(
            "port must be between 1 and 65535, got {:?}",
            s
        ))),
        Ok(p) => Ok(p),
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Target::parse(s, super::DEFAULT_PORT)
    }
}

/// How targets within one round are probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// One target after another, in list order
    #[default]
    Sequential,
    /// All targets of a round at once, each on its own connection
    Concurrent,
}

/// How samples are grouped into aggregation results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    /// One result per target
    PerTarget,
    /// A single result over every target's samples
    #[default]
    Combined,
}

/// Configuration for a client synchronization run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Servers to probe
    pub targets: Vec<Target>,
    /// Probes per target
    pub count: usize,
    /// Pause between rounds
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub interval: Duration,
    /// Response timeout for a single probe
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub timeout: Duration,
    /// Largest median offset that may be applied
    pub max_offset_ms: f64,
    /// Offsets up to this magnitude are slewed, larger ones stepped
    pub slew_threshold_ms: f64,
    /// Decide but never touch the clock
    pub dry_run: bool,
    /// Sequential or concurrent probing across targets
    pub mode: ProbeMode,
    /// Per-target or combined statistics
    pub grouping: Grouping,
    /// Overall limit on the measurement phase
    #[serde(serialize_with = "super::serde::serialize_opt_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_opt_duration")]
    pub deadline: Option<Duration>,
    /// Bytes of padding appended to each request
    pub padding: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            targets: Vec::new(),
            count: super::DEFAULT_PROBE_COUNT,
            interval: Duration::from_millis(500),
            timeout: super::DEFAULT_PROBE_TIMEOUT,
            max_offset_ms: 1000.0,
            slew_threshold_ms: 500.0,
            dry_run: false,
            mode: ProbeMode::default(),
            grouping: Grouping::default(),
            deadline: None,
            padding: 0,
        }
    }
}

impl ClientConfig {
    /// Checks that the configuration is usable for a run
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(Error::config("at least one server must be specified"));
        }
        if let Some(t) = self.targets.iter().find(|t| t.host.is_empty() || t.port == 0) {
            return Err(Error::config(format!("invalid server address: {:?}", t.host)));
        }
        if self.count == 0 || self.count > super::MAX_PROBES {
            return Err(Error::config(format!(
                "count must be between 1 and {}",
                super::MAX_PROBES
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::config("probe timeout must be positive"));
        }
        if !self.max_offset_ms.is_finite() || self.max_offset_ms <= 0.0 {
            return Err(Error::config("max offset must be a positive number of milliseconds"));
        }
        if !self.slew_threshold_ms.is_finite() || self.slew_threshold_ms < 0.0 {
            return Err(Error::config("slew threshold must be a non-negative number of milliseconds"));
        }
        if cfg!(target_os = "linux") && self.slew_threshold_ms > super::MAX_SLEW_MS {
            return Err(Error::config(format!(
                "slew threshold cannot exceed {}ms, the kernel's slew limit",
                super::MAX_SLEW_MS
            )));
        }
        if self.padding > super::MAX_PADDING {
            return Err(Error::config(format!(
                "padding must not exceed {} bytes",
                super::MAX_PADDING
            )));
        }
        Ok(())
    }
}

/// Configuration for a TSQ server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// PEM certificate chain
    pub cert_path: PathBuf,
    /// PEM private key
    pub key_path: PathBuf,
    /// Limit on the TLS handshake and on each wait for a request
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: format!("0.0.0.0:{}", super::DEFAULT_PORT),
            cert_path: PathBuf::from("cert.pem"),
            key_path: PathBuf::from("key.pem"),
            idle_timeout: super::DEFAULT_IDLE_TIMEOUT,
        }
    }
}
