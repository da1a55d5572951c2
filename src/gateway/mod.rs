//! Connection Gateway
//!
//! Decides, per connection, whether a PROXY header may override the
//! observed peer address.
//!
//! # State machine
//! ```text
//! Sniffing ──Invalid──────────────▶ Plain
//!    │
//!    └─Detected─▶ Evaluating ──untrusted──▶ Rejected (closed)
//!                     │
//!                     └─trusted──▶ Upgraded (decoder + address stage)
//! ```
//!
//! # Chain layout after an upgrade
//! ```text
//! timeout → haproxy-decoder → haproxy-handler → ...
//! ```
//! Both added stages remove themselves once the header is consumed.

mod detector;
mod rewrite;
mod stages;

pub use detector::DetectorStage;
pub use rewrite::{
    install_detector, rewrite_chain, BaseInitializer, ChainInitializer, DetectorInitializer,
};
pub use stages::{AddressSubstitutionStage, DecoderStage, IdleTimeoutStage};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::pipeline::Stage;
use crate::proxy::DecodeOptions;
use crate::whitelist::{RejectionWarnings, WhitelistPolicy};

/// Name of the sniffing stage
pub const DETECTOR_STAGE: &str = "haproxy-detector";
/// Name of the one-shot header decoder stage
pub const DECODER_STAGE: &str = "haproxy-decoder";
/// Name of the one-shot address substitution stage
pub const HANDLER_STAGE: &str = "haproxy-handler";
/// Name of the host's idle-timeout stage, used as an insertion anchor
pub const TIMEOUT_STAGE: &str = "timeout";

/// Where a connection stands in the detection sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Sniffing,
    Evaluating,
    Plain,
    Rejected,
    Upgraded,
}

impl GatewayState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GatewayState::Plain | GatewayState::Rejected | GatewayState::Upgraded
        )
    }
}

struct Shared {
    policy: ArcSwap<WhitelistPolicy>,
    warnings: RejectionWarnings,
    decode: DecodeOptions,
}

/// Trust configuration shared by every connection's detector.
///
/// Cheap to clone. The whitelist is swapped as a whole on reload; a
/// detector evaluating concurrently sees either the old or the new policy.
#[derive(Clone)]
pub struct ConnectionGateway {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGateway")
            .field("policy", &self.policy())
            .field("decode", &self.shared.decode)
            .finish()
    }
}

impl ConnectionGateway {
    pub fn new(policy: WhitelistPolicy, decode: DecodeOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                policy: ArcSwap::from_pointee(policy),
                warnings: RejectionWarnings::new(),
                decode,
            }),
        }
    }

    /// Replace the active whitelist.
    pub fn reload(&self, policy: WhitelistPolicy) {
        policy.log_posture();
        self.shared.policy.store(Arc::new(policy));
    }

    pub fn policy(&self) -> Arc<WhitelistPolicy> {
        self.shared.policy.load_full()
    }

    pub fn decode_options(&self) -> DecodeOptions {
        self.shared.decode
    }

    pub fn is_trusted(&self, peer: SocketAddr) -> bool {
        self.shared.policy.load().allows_peer(peer)
    }

    /// Deduplicated warning for a rejected source.
    pub fn rejection_warning(&self, addr: IpAddr) -> Option<String> {
        self.shared.warnings.warning_for(addr)
    }

    /// A fresh detector stage. `handler` is the address stage to install on
    /// upgrade; a new one is created when `None`.
    pub fn detector(&self, handler: Option<Box<dyn Stage>>) -> DetectorStage {
        DetectorStage::new(self.clone(), handler)
    }

    pub fn decoder(&self) -> DecoderStage {
        DecoderStage::new(self.shared.decode)
    }
}
