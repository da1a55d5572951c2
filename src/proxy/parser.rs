//! PROXY Protocol Parser
//!
//! Decodes PROXY v1 (text) and v2 (binary) headers from a buffer that may
//! still be filling up. Completeness is decided here; validation of the
//! header contents is delegated to the `ppp` crate.

use std::net::{IpAddr, SocketAddr};

use super::sniffer::{ProxyVersion, PROXY_V1_SIGNATURE, PROXY_V2_SIGNATURE};

/// Fixed part of a v2 header: signature, version/command, family, length.
const V2_PREFIX_LEN: usize = 16;

/// Longest legal v1 line, CRLF included.
const V1_MAX_LEN: usize = 107;

/// Default upper bound for a buffered v2 header
pub const MAX_HEADER_SIZE: usize = 536;

/// A fully decoded PROXY header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Original client address; `None` for UNKNOWN/LOCAL/unix headers
    pub source: Option<SocketAddr>,

    /// Address the client originally connected to
    pub destination: Option<SocketAddr>,

    /// TLS termination info from PROXY v2 TLVs (if present and requested)
    pub tls_info: Option<ProxyTlsInfo>,

    /// Protocol version used (v1 or v2)
    pub version: ProxyVersion,
}

/// TLS termination information from PROXY v2 TLVs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyTlsInfo {
    /// Server Name Indication (SNI) from PP2_TYPE_AUTHORITY
    pub sni: Option<String>,

    /// Client certificate Common Name (CN) from PP2_SUBTYPE_SSL_CN
    pub client_cert_cn: Option<String>,

    /// Whether client provided a verified certificate
    pub client_cert_verified: bool,
}

/// Errors that can occur during PROXY header decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Invalid or malformed PROXY header
    InvalidHeader(String),
    /// Declared or observed header length exceeds the configured bound
    HeaderTooLarge(usize),
    /// No PROXY signature at the start of the buffer
    NotProxyProtocol,
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::InvalidHeader(msg) => write!(f, "invalid PROXY header: {}", msg),
            ProxyError::HeaderTooLarge(len) => write!(f, "PROXY header too large: {} bytes", len),
            ProxyError::NotProxyProtocol => write!(f, "no PROXY protocol signature"),
        }
    }
}

impl std::error::Error for ProxyError {}

/// Decoder settings
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    pub max_header_size: usize,
    pub parse_tls_info: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_header_size: MAX_HEADER_SIZE,
            parse_tls_info: false,
        }
    }
}

/// Try to decode a PROXY header from the start of `buf`.
///
/// Returns `Ok(None)` while the header is still incomplete, and
/// `Ok(Some((header, consumed)))` once it has been fully parsed, where
/// `consumed` is the number of leading bytes that belong to the header.
pub fn decode_header(
    buf: &[u8],
    options: DecodeOptions,
) -> Result<Option<(ProxyHeader, usize)>, ProxyError> {
    if buf.starts_with(PROXY_V2_SIGNATURE) {
        decode_v2(buf, options)
    } else if buf.starts_with(PROXY_V1_SIGNATURE) {
        decode_v1(buf)
    } else if PROXY_V2_SIGNATURE.starts_with(buf) || PROXY_V1_SIGNATURE.starts_with(buf) {
        Ok(None)
    } else {
        Err(ProxyError::NotProxyProtocol)
    }
}

/// Decode a PROXY v1 (text) header
fn decode_v1(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyError> {
    let window = &buf[..buf.len().min(V1_MAX_LEN)];
    let header_end = match window.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => pos + 2,
        None if buf.len() >= V1_MAX_LEN => {
            return Err(ProxyError::InvalidHeader("v1 header too long".to_string()))
        }
        None => return Ok(None),
    };

    let header = ppp::v1::Header::try_from(&buf[..header_end])
        .map_err(|e| ProxyError::InvalidHeader(format!("v1 parse error: {:?}", e)))?;

    let (source, destination) = match header.addresses {
        ppp::v1::Addresses::Tcp4(addrs) => (
            Some(SocketAddr::new(IpAddr::V4(addrs.source_address), addrs.source_port)),
            Some(SocketAddr::new(
                IpAddr::V4(addrs.destination_address),
                addrs.destination_port,
            )),
        ),
        ppp::v1::Addresses::Tcp6(addrs) => (
            Some(SocketAddr::new(IpAddr::V6(addrs.source_address), addrs.source_port)),
            Some(SocketAddr::new(
                IpAddr::V6(addrs.destination_address),
                addrs.destination_port,
            )),
        ),
        // UNKNOWN: the receiver keeps the transport addresses
        ppp::v1::Addresses::Unknown => (None, None),
    };

    Ok(Some((
        ProxyHeader {
            source,
            destination,
            tls_info: None, // V1 doesn't support TLVs
            version: ProxyVersion::V1,
        },
        header_end,
    )))
}

/// Decode a PROXY v2 (binary) header
fn decode_v2(
    buf: &[u8],
    options: DecodeOptions,
) -> Result<Option<(ProxyHeader, usize)>, ProxyError> {
    if buf.len() < V2_PREFIX_LEN {
        return Ok(None);
    }

    // Length is in bytes 14-15 (big-endian u16)
    let header_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let total_len = V2_PREFIX_LEN + header_len;
    if total_len > options.max_header_size {
        return Err(ProxyError::HeaderTooLarge(total_len));
    }
    if buf.len() < total_len {
        return Ok(None);
    }

    let header = ppp::v2::Header::try_from(&buf[..total_len])
        .map_err(|e| ProxyError::InvalidHeader(format!("v2 parse error: {:?}", e)))?;

    let (source, destination) = match &header.addresses {
        ppp::v2::Addresses::IPv4(addrs) => (
            Some(SocketAddr::new(IpAddr::V4(addrs.source_address), addrs.source_port)),
            Some(SocketAddr::new(
                IpAddr::V4(addrs.destination_address),
                addrs.destination_port,
            )),
        ),
        ppp::v2::Addresses::IPv6(addrs) => (
            Some(SocketAddr::new(IpAddr::V6(addrs.source_address), addrs.source_port)),
            Some(SocketAddr::new(
                IpAddr::V6(addrs.destination_address),
                addrs.destination_port,
            )),
        ),
        // LOCAL command, UNSPEC family or unix sockets
        ppp::v2::Addresses::Unix(_) | ppp::v2::Addresses::Unspecified => (None, None),
    };

    let tls_info = if options.parse_tls_info {
        extract_tls_info(&header)
    } else {
        None
    };

    Ok(Some((
        ProxyHeader {
            source,
            destination,
            tls_info,
            version: ProxyVersion::V2,
        },
        total_len,
    )))
}

/// Extract TLS information from PROXY v2 TLVs
fn extract_tls_info(header: &ppp::v2::Header) -> Option<ProxyTlsInfo> {
    let mut info = ProxyTlsInfo::default();

    for tlv in header.tlvs().flatten() {
        match tlv.kind {
            // PP2_TYPE_AUTHORITY
            0x02 => {
                if let Ok(s) = std::str::from_utf8(&tlv.value) {
                    info.sni = Some(s.to_string());
                }
            }
            // PP2_TYPE_SSL
            0x20 => {
                if let Some((cn, verified)) = parse_ssl_tlv(&tlv.value) {
                    info.client_cert_cn = cn;
                    info.client_cert_verified = verified;
                }
            }
            // PP2_SUBTYPE_SSL_CN as a standalone TLV
            0x22 => {
                if let Ok(s) = std::str::from_utf8(&tlv.value) {
                    info.client_cert_cn = Some(s.to_string());
                }
            }
            _ => {}
        }
    }

    if info == ProxyTlsInfo::default() {
        None
    } else {
        Some(info)
    }
}

/// Parse PP2_TYPE_SSL TLV value to extract client cert CN
/// Returns (Option<CN>, client_verified)
fn parse_ssl_tlv(value: &[u8]) -> Option<(Option<String>, bool)> {
    // PP2_TYPE_SSL structure:
    // - 1 byte: client bitfield (bit 2 = PP2_CLIENT_CERT_CONN)
    // - 4 bytes: verify result
    // - remaining: sub-TLVs
    if value.len() < 5 {
        return None;
    }

    let client_verified = (value[0] & 0x04) != 0;
    let mut cn = None;

    let mut offset = 5;
    while offset + 3 <= value.len() {
        let sub_type = value[offset];
        let sub_len = u16::from_be_bytes([value[offset + 1], value[offset + 2]]) as usize;
        offset += 3;

        if offset + sub_len > value.len() {
            break;
        }

        // PP2_SUBTYPE_SSL_CN
        if sub_type == 0x02 {
            if let Ok(s) = std::str::from_utf8(&value[offset..offset + sub_len]) {
                cn = Some(s.to_string());
            }
        }

        offset += sub_len;
    }

    Some((cn, client_verified))
}
