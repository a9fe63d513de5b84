//! Mapping file loading and validation

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Where the bridge looks for its mappings when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/remote-service-proxy.json";

/// Relay read deadline used to poll for peer termination
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Relay read buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Mapping #{index} has an empty name")]
    EmptyName { index: usize },

    #[error("Duplicate mapping name: {0}")]
    DuplicateName(String),

    #[error("Mapping '{mapping}': invalid {field} '{value}'")]
    InvalidPort {
        mapping: String,
        field: &'static str,
        value: String,
    },

    #[error("Mapping '{mapping}': service_ip '{value}' is not an IPv4 address (only IPv4 targets are supported)")]
    InvalidTarget { mapping: String, value: String },

    #[error("Mapping '{mapping}': {field} must be set")]
    MissingHost {
        mapping: String,
        field: &'static str,
    },

    #[error("Mapping '{mapping}': {field} must be greater than zero")]
    InvalidTuning {
        mapping: String,
        field: &'static str,
    },

    #[error("No enabled mappings in configuration")]
    NoMappings,
}

/// Port as written in a config file. Older files store ports
/// as strings, newer ones may use plain numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{}", n),
            PortValue::Text(s) => f.write_str(s),
        }
    }
}

/// On-disk mapping record
#[derive(Debug, Clone, Deserialize)]
struct RawMapping {
    name: String,
    socks5_ip: String,
    socks5_port: PortValue,
    service_ip: String,
    service_port: PortValue,
    #[serde(default)]
    listen_addr: String,
    listen_port: PortValue,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_buffer_size")]
    buffer_size: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// A validated mapping: listen locally, dial the upstream, CONNECT to the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingConfig {
    pub name: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub target_host: Ipv4Addr,
    pub target_port: u16,
    pub listen_host: String,
    pub listen_port: u16,
    pub enabled: bool,
    pub poll_interval: Duration,
    pub buffer_size: usize,
}

impl MappingConfig {
    /// Build a mapping with default relay tuning
    pub fn new(
        name: impl Into<String>,
        upstream: (impl Into<String>, u16),
        target: SocketAddrV4,
        listen: (impl Into<String>, u16),
    ) -> Self {
        Self {
            name: name.into(),
            upstream_host: upstream.0.into(),
            upstream_port: upstream.1,
            target_host: *target.ip(),
            target_port: target.port(),
            listen_host: listen.0.into(),
            listen_port: listen.1,
            enabled: true,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// `listen_host:listen_port`, bracketing IPv6 literals
    pub fn listen_address(&self) -> String {
        join_host_port(&self.listen_host, self.listen_port)
    }

    /// `upstream_host:upstream_port`, bracketing IPv6 literals
    pub fn upstream_address(&self) -> String {
        join_host_port(&self.upstream_host, self.upstream_port)
    }

    pub fn target(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.target_host, self.target_port)
    }

    fn from_raw(raw: RawMapping) -> Result<Self, ConfigError> {
        let name = raw.name.trim().to_string();

        let upstream_port = parse_port(&name, "socks5_port", &raw.socks5_port, false)?;
        let target_port = parse_port(&name, "service_port", &raw.service_port, false)?;
        let listen_port = parse_port(&name, "listen_port", &raw.listen_port, true)?;

        let target_host =
            raw.service_ip
                .trim()
                .parse::<Ipv4Addr>()
                .map_err(|_| ConfigError::InvalidTarget {
                    mapping: name.clone(),
                    value: raw.service_ip.clone(),
                })?;

        let upstream_host = raw.socks5_ip.trim().to_string();
        if upstream_host.is_empty() {
            return Err(ConfigError::MissingHost {
                mapping: name,
                field: "socks5_ip",
            });
        }

        if raw.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidTuning {
                mapping: name,
                field: "poll_interval_ms",
            });
        }
        if raw.buffer_size == 0 {
            return Err(ConfigError::InvalidTuning {
                mapping: name,
                field: "buffer_size",
            });
        }

        Ok(Self {
            name,
            upstream_host,
            upstream_port,
            target_host,
            target_port,
            // An empty listen address binds every interface
            listen_host: match raw.listen_addr.trim() {
                "" => "0.0.0.0".to_string(),
                host => host.to_string(),
            },
            listen_port,
            enabled: raw.enabled,
            poll_interval: Duration::from_millis(raw.poll_interval_ms),
            buffer_size: raw.buffer_size,
        })
    }
}

impl fmt::Display for MappingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> socks5://{} -> {}",
            self.name,
            self.listen_address(),
            self.upstream_address(),
            self.target()
        )
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn parse_port(
    mapping: &str,
    field: &'static str,
    value: &PortValue,
    allow_zero: bool,
) -> Result<u16, ConfigError> {
    let invalid = || ConfigError::InvalidPort {
        mapping: mapping.to_string(),
        field,
        value: value.to_string(),
    };

    let port = match value {
        PortValue::Number(n) => u16::try_from(*n).map_err(|_| invalid())?,
        PortValue::Text(s) => s.trim().parse::<u16>().map_err(|_| invalid())?,
    };

    if port == 0 && !allow_zero {
        return Err(invalid());
    }

    Ok(port)
}

fn validate(raw: Vec<RawMapping>) -> Result<Vec<MappingConfig>, ConfigError> {
    let mut seen = HashSet::new();
    let mut mappings = Vec::with_capacity(raw.len());

    for (index, entry) in raw.into_iter().enumerate() {
        if entry.name.trim().is_empty() {
            return Err(ConfigError::EmptyName { index });
        }

        let mapping = MappingConfig::from_raw(entry)?;
        if !seen.insert(mapping.name.clone()) {
            return Err(ConfigError::DuplicateName(mapping.name));
        }

        debug!("Loaded mapping {}", mapping);
        mappings.push(mapping);
    }

    if !mappings.iter().any(|m| m.enabled) {
        return Err(ConfigError::NoMappings);
    }

    Ok(mappings)
}

/// Parse and validate a JSON mapping list
pub fn parse_json(content: &str) -> Result<Vec<MappingConfig>, ConfigError> {
    let raw: Vec<RawMapping> = serde_json::from_str(content)?;
    validate(raw)
}

/// Parse and validate a YAML mapping list
pub fn parse_yaml(content: &str) -> Result<Vec<MappingConfig>, ConfigError> {
    let raw: Vec<RawMapping> = serde_yaml::from_str(content)?;
    validate(raw)
}

/// Load mappings from disk. Files ending in `.yml` or `.yaml` are read as
/// YAML, everything else as JSON.
pub fn load(path: &Path) -> Result<Vec<MappingConfig>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yml") | Some("yaml") => parse_yaml(&content),
        _ => parse_json(&content),
    }
}
