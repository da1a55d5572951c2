//! Front-end listener configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Listener and relay settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the front-end accepts clients on
    pub bind: String,

    /// Host server that released traffic is relayed to
    pub upstream: String,

    /// Seconds without client reads before a connection is dropped.
    /// 0 disables the timeout.
    pub idle_timeout: u64,

    /// Maximum concurrent client connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:25565".to_string(),
            upstream: "127.0.0.1:25566".to_string(),
            idle_timeout: 30,
            max_connections: 10000,
        }
    }
}

impl ServerConfig {
    /// Get idle timeout as Duration, `None` when disabled
    pub fn idle_timeout_duration(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }
}
