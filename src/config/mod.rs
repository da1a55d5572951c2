//! Configuration
//!
//! Layered loading: built-in defaults, then an optional TOML file, then
//! `PROXY_DETECTOR__SECTION__KEY` environment variables.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:25565"
//! upstream = "127.0.0.1:25566"
//! idle_timeout = 30
//! max_connections = 10000
//!
//! [detector]
//! enabled = true
//! whitelist = "whitelist.conf"
//! parse_tls_info = false
//! max_header_size = 536
//! ```

mod detector;
mod server;

pub use detector::DetectorConfig;
pub use server::ServerConfig;

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::proxy::MIN_DETECTION_BYTES;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "PROXY_DETECTOR";

/// Errors from loading or validating configuration
#[derive(Debug)]
pub enum ConfigError {
    /// File or environment source could not be read or deserialised
    Load(::config::ConfigError),
    /// Values parsed but are not usable
    Invalid(Vec<String>),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Load(e) => write!(f, "failed to load configuration: {}", e),
            ConfigError::Invalid(problems) => {
                write!(f, "invalid configuration: ")?;
                for (i, problem) in problems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", problem)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Load(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<::config::ConfigError> for ConfigError {
    fn from(e: ::config::ConfigError) -> Self {
        ConfigError::Load(e)
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub detector: DetectorConfig,
}

impl Config {
    /// Load from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from_str(text, ::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.server.bind.parse::<SocketAddr>().is_err() {
            problems.push(format!("server.bind '{}' is not a socket address", self.server.bind));
        }
        if self.server.upstream.trim().is_empty() {
            problems.push("server.upstream must not be empty".to_string());
        }
        if self.server.max_connections == 0 {
            problems.push("server.max_connections must be greater than 0".to_string());
        }
        if self.detector.max_header_size < MIN_DETECTION_BYTES {
            problems.push(format!(
                "detector.max_header_size must be at least {}",
                MIN_DETECTION_BYTES
            ));
        }
        if self.detector.whitelist.as_os_str().is_empty() {
            problems.push("detector.whitelist must name a file".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
