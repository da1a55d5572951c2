//! One-shot stages installed by the chain rewrite, and the idle anchor.

use bytes::BytesMut;
use tracing::{debug, info, warn};

use super::HANDLER_STAGE;
use crate::pipeline::{ChainError, Inbound, Stage, StageChain, StageContext};
use crate::proxy::{decode_header, DecodeOptions};

/// Buffers bytes until a full PROXY header is available, emits it as
/// [`Inbound::Header`], passes the remaining bytes on and leaves the chain.
#[derive(Debug)]
pub struct DecoderStage {
    options: DecodeOptions,
    cumulation: BytesMut,
}

impl DecoderStage {
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            options,
            cumulation: BytesMut::new(),
        }
    }
}

impl Stage for DecoderStage {
    fn on_read(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), ChainError> {
        let bytes = match msg {
            Inbound::Bytes(bytes) => bytes,
            other => {
                ctx.forward(other);
                return Ok(());
            }
        };
        // Header bytes are in flight; the stream must not be sniffed again
        ctx.connection().settle_detection();
        self.cumulation.unsplit(bytes);

        match decode_header(&self.cumulation, self.options) {
            Ok(None) => Ok(()),
            Ok(Some((header, consumed))) => {
                let _ = self.cumulation.split_to(consumed);
                debug!(
                    connection_id = %ctx.connection().id(),
                    version = %header.version,
                    source = ?header.source,
                    "PROXY header decoded"
                );
                ctx.forward(Inbound::Header(header));
                ctx.remove_self()?;
                let rest = self.cumulation.split();
                if !rest.is_empty() {
                    ctx.forward(Inbound::Bytes(rest));
                }
                Ok(())
            }
            Err(e) => {
                // Fail open: keep the transport address and pass the bytes on
                warn!(
                    connection_id = %ctx.connection().id(),
                    peer_addr = %ctx.connection().peer_addr(),
                    error = %e,
                    "Malformed PROXY header, treating connection as plain"
                );
                ctx.remove_self()?;
                if ctx.pipeline().contains(HANDLER_STAGE) {
                    ctx.pipeline().remove(HANDLER_STAGE)?;
                }
                let rest = self.cumulation.split();
                ctx.forward(Inbound::Bytes(rest));
                Ok(())
            }
        }
    }
}

/// Overwrites the connection's peer address with the header's source,
/// then leaves the chain. Fires at most once.
#[derive(Debug, Default)]
pub struct AddressSubstitutionStage;

impl AddressSubstitutionStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for AddressSubstitutionStage {
    fn on_read(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), ChainError> {
        let header = match msg {
            Inbound::Header(header) => header,
            other => {
                ctx.forward(other);
                return Ok(());
            }
        };

        let conn = ctx.connection();
        match header.source {
            Some(real) => {
                info!(
                    connection_id = %conn.id(),
                    "Set real remote address via proxy {} -> {}",
                    conn.peer_addr(),
                    real
                );
                conn.set_peer_addr(real);
            }
            None => debug!(
                connection_id = %conn.id(),
                version = %header.version,
                "PROXY header carries no source address, keeping transport address"
            ),
        }
        conn.set_proxy_header(header);
        ctx.remove_self()
    }
}

/// Host anchor stage that records read activity for the idle timeout.
#[derive(Debug, Default)]
pub struct IdleTimeoutStage;

impl IdleTimeoutStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for IdleTimeoutStage {
    fn on_read(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), ChainError> {
        if matches!(msg, Inbound::Bytes(_)) {
            ctx.connection().touch();
        }
        ctx.forward(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::DECODER_STAGE;
    use crate::pipeline::{Connection, StageChain};
    use crate::proxy::{ProxyHeader, ProxyVersion};
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;

    fn upgraded_connection() -> Connection {
        let mut conn = Connection::new(
            "10.0.0.2:40000".parse().unwrap(),
            "10.0.0.1:25565".parse().unwrap(),
        );
        let chain = conn.pipeline_mut();
        chain
            .add_last(DECODER_STAGE, Box::new(DecoderStage::new(DecodeOptions::default())))
            .unwrap();
        chain
            .add_last(HANDLER_STAGE, Box::new(AddressSubstitutionStage::new()))
            .unwrap();
        conn
    }

    #[test]
    fn header_split_across_reads() {
        let mut conn = upgraded_connection();
        conn.read(BytesMut::from(&b"PROXY TCP4 203.0.113.5 10.0"[..]));
        assert_eq!(conn.pipeline().names(), vec![DECODER_STAGE, HANDLER_STAGE]);
        assert!(conn.take_released().is_empty());

        conn.read(BytesMut::from(&b".0.1 51000 25565\r\nhello"[..]));
        assert!(conn.pipeline().is_empty());
        assert_eq!(
            conn.state().peer_addr(),
            "203.0.113.5:51000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(&conn.take_released()[..], b"hello");
    }

    #[test]
    fn later_bytes_pass_through_untouched() {
        let mut conn = upgraded_connection();
        conn.read(BytesMut::from(&b"PROXY TCP6 2001:db8::9 ::1 443 25565\r\n"[..]));
        conn.read(BytesMut::from(&b"PROXY TCP4 1.1.1.1 1.1.1.1 1 1\r\n"[..]));
        assert_eq!(
            conn.state().peer_addr(),
            "[2001:db8::9]:443".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            &conn.take_released()[..],
            b"PROXY TCP4 1.1.1.1 1.1.1.1 1 1\r\n"
        );
    }

    #[test]
    fn malformed_header_fails_open() {
        let mut conn = upgraded_connection();
        let raw = b"PROXY TCP4 nonsense here 1 2\r\npayload";
        conn.read(BytesMut::from(&raw[..]));

        assert!(conn.is_open());
        assert!(conn.pipeline().is_empty());
        assert_eq!(
            conn.state().peer_addr(),
            "10.0.0.2:40000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(&conn.take_released()[..], &raw[..]);
    }

    #[test]
    fn header_without_source_keeps_address() {
        let mut conn = Connection::new(
            "10.0.0.2:40000".parse().unwrap(),
            "10.0.0.1:25565".parse().unwrap(),
        );
        conn.pipeline_mut()
            .add_last(HANDLER_STAGE, Box::new(AddressSubstitutionStage::new()))
            .unwrap();
        let header = ProxyHeader {
            source: None,
            destination: None,
            tls_info: None,
            version: ProxyVersion::V2,
        };
        conn.fire(Inbound::Header(header.clone()));

        assert_eq!(
            conn.state().peer_addr(),
            "10.0.0.2:40000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(conn.state().proxy_header(), Some(&header));
        assert!(conn.pipeline().is_empty());
    }
}
