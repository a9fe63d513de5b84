//! Mapping configuration
//!
//! A configuration file is an ordered list of mappings. Each mapping names a
//! local listen address, the SOCKS5 upstream to dial, and the IPv4 target the
//! upstream is asked to CONNECT to.

mod mapping;

pub use mapping::{
    load, parse_json, parse_yaml, ConfigError, MappingConfig, DEFAULT_BUFFER_SIZE,
    DEFAULT_CONFIG_PATH, DEFAULT_POLL_INTERVAL_MS,
};
