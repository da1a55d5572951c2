//! Sniffing stage placed at the front of every connection.

use bytes::BytesMut;
use tracing::{debug, error, info, trace, warn};

use super::{rewrite_chain, AddressSubstitutionStage, ConnectionGateway, GatewayState, DECODER_STAGE};
use crate::pipeline::{ChainError, Inbound, Pipeline, Stage, StageContext};
use crate::proxy::{DetectionState, ProtocolSniffer};

type RewriteFn = fn(&mut Pipeline, &ConnectionGateway, Box<dyn Stage>) -> Result<(), ChainError>;

/// Holds back inbound bytes until the sniffer can classify the stream, then
/// either steps aside, closes the connection, or rewrites the chain.
pub struct DetectorStage {
    gateway: ConnectionGateway,
    sniffer: ProtocolSniffer,
    cumulation: BytesMut,
    handler: Option<Box<dyn Stage>>,
    state: GatewayState,
    rewrite: RewriteFn,
}

impl std::fmt::Debug for DetectorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorStage")
            .field("state", &self.state)
            .field("buffered", &self.cumulation.len())
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl DetectorStage {
    pub fn new(gateway: ConnectionGateway, handler: Option<Box<dyn Stage>>) -> Self {
        Self {
            gateway,
            sniffer: ProtocolSniffer::new(),
            cumulation: BytesMut::new(),
            handler,
            state: GatewayState::Sniffing,
            rewrite: rewrite_chain::<Pipeline>,
        }
    }

    #[cfg(test)]
    fn with_rewrite(mut self, rewrite: RewriteFn) -> Self {
        self.rewrite = rewrite;
        self
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    fn transition(&mut self, ctx: &mut StageContext<'_>, next: GatewayState) {
        debug!(
            connection_id = %ctx.connection().id(),
            from = ?self.state,
            to = ?next,
            "Detector state change"
        );
        self.state = next;
        if next.is_terminal() {
            ctx.connection().settle_detection();
        }
    }

    fn evaluate(&mut self, ctx: &mut StageContext<'_>) -> Result<(), ChainError> {
        let peer = ctx.connection().peer_addr();

        if !self.gateway.is_trusted(peer) {
            self.transition(ctx, GatewayState::Rejected);
            if let Some(message) = self.gateway.rejection_warning(peer.ip()) {
                warn!(connection_id = %ctx.connection().id(), "{}", message);
            }
            debug!(
                connection_id = %ctx.connection().id(),
                peer_addr = %peer,
                discarded = self.cumulation.len(),
                "Untrusted PROXY header sender, closing connection"
            );
            self.cumulation.clear();
            ctx.close();
            return Ok(());
        }

        let handler = self
            .handler
            .take()
            .unwrap_or_else(|| Box::new(AddressSubstitutionStage::new()));
        if let Err(e) = (self.rewrite)(ctx.pipeline(), &self.gateway, handler) {
            // Trust was already granted; never let the header through undecoded
            error!(
                connection_id = %ctx.connection().id(),
                peer_addr = %peer,
                error = %e,
                "Failed to install PROXY decoder, closing connection"
            );
            self.cumulation.clear();
            ctx.close();
            return Ok(());
        }

        self.transition(ctx, GatewayState::Upgraded);
        info!(
            connection_id = %ctx.connection().id(),
            peer_addr = %peer,
            "Accepted PROXY header from trusted source"
        );
        let buffered = self.cumulation.split();
        ctx.forward_to(DECODER_STAGE, Inbound::Bytes(buffered));
        Ok(())
    }
}

impl Stage for DetectorStage {
    fn on_read(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), ChainError> {
        let bytes = match msg {
            Inbound::Bytes(bytes) => bytes,
            other => {
                ctx.forward(other);
                return Ok(());
            }
        };

        if self.state.is_terminal() {
            // Still linked after a decision only if removal failed; pass through
            ctx.forward(Inbound::Bytes(bytes));
            return Ok(());
        }

        self.cumulation.unsplit(bytes);

        match self.sniffer.attempt(&self.cumulation) {
            DetectionState::NeedMoreData => {
                trace!(
                    connection_id = %ctx.connection().id(),
                    buffered = self.cumulation.len(),
                    "Waiting for more bytes"
                );
                Ok(())
            }
            DetectionState::Invalid => {
                self.transition(ctx, GatewayState::Plain);
                ctx.remove_self()?;
                let buffered = self.cumulation.split();
                ctx.forward(Inbound::Bytes(buffered));
                Ok(())
            }
            DetectionState::Detected(version) => {
                debug!(
                    connection_id = %ctx.connection().id(),
                    %version,
                    "PROXY signature detected"
                );
                self.transition(ctx, GatewayState::Evaluating);
                self.evaluate(ctx)
            }
        }
    }
}
