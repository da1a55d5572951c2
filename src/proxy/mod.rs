//! PROXY Protocol Module
//!
//! Signature sniffing and header decoding for HAProxy PROXY protocol v1/v2.
//! The sniffer only classifies the start of a stream; the parser decodes a
//! header once a connection has been trusted to send one.

mod parser;
mod sniffer;

pub use parser::{
    decode_header, DecodeOptions, ProxyError, ProxyHeader, ProxyTlsInfo, MAX_HEADER_SIZE,
};
pub use sniffer::{
    DetectionState, ProtocolSniffer, ProxyVersion, MIN_DETECTION_BYTES, PROXY_V1_SIGNATURE,
    PROXY_V2_SIGNATURE,
};
