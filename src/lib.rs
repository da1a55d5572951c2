//! proxy-detector
//!
//! A front-end that accepts direct clients and clients forwarded through a
//! PROXY-protocol-speaking load balancer on the same port. A PROXY header is
//! only honoured when the transport peer is on the source whitelist.
//!
//! # Layout
//! - `proxy`: signature sniffing and header decoding
//! - `whitelist`: CIDR rule file, matching and rejection warnings
//! - `pipeline`: per-connection named stage chain
//! - `gateway`: detection state machine and chain rewiring
//! - `server`: tokio TCP front-end relaying to an upstream host
//! - `config`: layered configuration

pub mod config;
pub mod gateway;
pub mod pipeline;
pub mod proxy;
pub mod server;
pub mod whitelist;

pub use config::Config;
pub use gateway::ConnectionGateway;
pub use server::{Server, ServerError};
pub use whitelist::{Whitelist, WhitelistPolicy};
