//! Detector Configuration
//!
//! Configuration types for PROXY protocol v1/v2 detection and the source
//! whitelist.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::proxy::{DecodeOptions, MAX_HEADER_SIZE};

/// PROXY protocol detection settings for the front-end listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Install the detector on every new connection
    pub enabled: bool,

    /// Path of the persisted whitelist rule file.
    /// Created with loopback-only rules if missing.
    pub whitelist: PathBuf,

    /// Trust TLS termination info from PROXY v2 TLVs.
    /// When true, parse PP2_TYPE_SSL TLVs for SNI and client cert CN.
    pub parse_tls_info: bool,

    /// Largest PROXY v2 header accepted, in bytes.
    /// Default: 536 (16-byte prefix plus room for TLVs)
    pub max_header_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            whitelist: PathBuf::from("whitelist.conf"),
            parse_tls_info: false,
            max_header_size: MAX_HEADER_SIZE,
        }
    }
}

impl DetectorConfig {
    /// Settings handed to the header decoder stage
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            max_header_size: self.max_header_size,
            parse_tls_info: self.parse_tls_info,
        }
    }
}
