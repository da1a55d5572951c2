//! PROXY Protocol Sniffer
//!
//! Classifies the first bytes of a connection as "PROXY header present",
//! "absent" or "undecided" without consuming anything.

use std::fmt;

/// PROXY v1 signature: "PROXY "
pub const PROXY_V1_SIGNATURE: &[u8] = b"PROXY ";

/// PROXY v2 signature (12 bytes)
pub const PROXY_V2_SIGNATURE: &[u8] = b"\r\n\r\n\x00\r\nQUIT\n";

/// Bytes required before any verdict is given.
///
/// Waiting for this much data keeps a partially-arrived signature from
/// being misread as plain traffic.
pub const MIN_DETECTION_BYTES: usize = 16;

/// PROXY protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyVersion {
    V1,
    V2,
}

impl fmt::Display for ProxyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyVersion::V1 => write!(f, "v1"),
            ProxyVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Outcome of a single detection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    /// Not enough bytes to decide; present the same bytes again later.
    NeedMoreData,
    /// No header will ever be found in this stream.
    Invalid,
    /// The stream starts with a PROXY signature.
    Detected(ProxyVersion),
}

/// Stateless, single-shot PROXY signature detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolSniffer;

impl ProtocolSniffer {
    pub fn new() -> Self {
        Self
    }

    /// Perform one detection attempt over the buffered bytes.
    ///
    /// The buffer is only read. A read that falls outside the buffer is
    /// reported as `NeedMoreData`, since at this layer it cannot be told
    /// apart from a header that has not fully arrived.
    pub fn attempt(&self, buf: &[u8]) -> DetectionState {
        if buf.len() < MIN_DETECTION_BYTES {
            return DetectionState::NeedMoreData;
        }

        match probe(buf, PROXY_V2_SIGNATURE) {
            Some(true) => return DetectionState::Detected(ProxyVersion::V2),
            Some(false) => {}
            None => return DetectionState::NeedMoreData,
        }

        match probe(buf, PROXY_V1_SIGNATURE) {
            Some(true) => DetectionState::Detected(ProxyVersion::V1),
            Some(false) => DetectionState::Invalid,
            None => DetectionState::NeedMoreData,
        }
    }
}

/// `None` when the buffer is too short to compare against `signature`.
fn probe(buf: &[u8], signature: &[u8]) -> Option<bool> {
    buf.get(..signature.len()).map(|head| head == signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v2_header_ipv4() -> Vec<u8> {
        let mut buf = PROXY_V2_SIGNATURE.to_vec();
        // version 2, PROXY command; TCP over IPv4; 12 address bytes
        buf.extend_from_slice(&[0x21, 0x11, 0x00, 0x0C]);
        buf.extend_from_slice(&[192, 168, 1, 1, 10, 0, 0, 1]);
        buf.extend_from_slice(&12345u16.to_be_bytes());
        buf.extend_from_slice(&80u16.to_be_bytes());
        buf
    }

    #[test]
    fn test_proxy_v1_signature() {
        assert_eq!(PROXY_V1_SIGNATURE, b"PROXY ");
    }

    #[test]
    fn test_proxy_v2_signature() {
        assert_eq!(
            PROXY_V2_SIGNATURE,
            &[0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A]
        );
    }

    #[test]
    fn detects_v1() {
        let header = b"PROXY TCP4 192.168.1.1 10.0.0.1 12345 80\r\n";
        assert_eq!(
            ProtocolSniffer::new().attempt(header),
            DetectionState::Detected(ProxyVersion::V1)
        );
    }

    #[test]
    fn detects_v2() {
        assert_eq!(
            ProtocolSniffer::new().attempt(&v2_header_ipv4()),
            DetectionState::Detected(ProxyVersion::V2)
        );
    }

    #[test]
    fn plain_traffic_is_invalid() {
        let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(ProtocolSniffer::new().attempt(request), DetectionState::Invalid);
    }

    #[test]
    fn v2_signature_prefix_alone_waits() {
        // Full signature but below the detection threshold
        assert_eq!(
            ProtocolSniffer::new().attempt(PROXY_V2_SIGNATURE),
            DetectionState::NeedMoreData
        );
    }

    #[test]
    fn exactly_threshold_bytes_is_decided() {
        let buf = [0x16u8; MIN_DETECTION_BYTES];
        assert_eq!(ProtocolSniffer::new().attempt(&buf), DetectionState::Invalid);
    }

    proptest! {
        #[test]
        fn short_input_always_needs_more(buf in proptest::collection::vec(any::<u8>(), 0..MIN_DETECTION_BYTES)) {
            let before = buf.clone();
            prop_assert_eq!(ProtocolSniffer::new().attempt(&buf), DetectionState::NeedMoreData);
            prop_assert_eq!(buf, before);
        }

        #[test]
        fn non_signature_input_is_invalid(mut buf in proptest::collection::vec(any::<u8>(), MIN_DETECTION_BYTES..64)) {
            // Break both signatures on their first byte
            buf[0] = b'X';
            prop_assert_eq!(ProtocolSniffer::new().attempt(&buf), DetectionState::Invalid);
        }
    }
}
