//! Chain rewiring and detector installation.
//!
//! Both entry points are idempotent: stages already present by name are left
//! alone instead of raising [`ChainError::DuplicateName`].

use std::sync::Arc;

use tracing::{debug, trace};

use super::{
    ConnectionGateway, IdleTimeoutStage, DECODER_STAGE, DETECTOR_STAGE, HANDLER_STAGE,
    TIMEOUT_STAGE,
};
use crate::pipeline::{ChainError, Connection, ConnectionId, Stage, StageChain};

/// Swap the detector for a decoder and make sure `handler` follows it.
///
/// When the decoder cannot be used as an anchor the pair is placed after the
/// idle-timeout stage, or at the very front, decoder first in both cases.
pub fn rewrite_chain<C>(
    chain: &mut C,
    gateway: &ConnectionGateway,
    handler: Box<dyn Stage>,
) -> Result<(), ChainError>
where
    C: StageChain + ?Sized,
{
    if chain.contains(DETECTOR_STAGE) {
        match chain.replace(DETECTOR_STAGE, DECODER_STAGE, Box::new(gateway.decoder())) {
            Ok(_) => {}
            Err(ChainError::DuplicateName(_)) => {
                // A decoder from an earlier rewrite is already linked
                chain.remove(DETECTOR_STAGE)?;
            }
            Err(e) => return Err(e),
        }
    }

    match (chain.contains(DECODER_STAGE), chain.contains(HANDLER_STAGE)) {
        (true, true) => {
            trace!("PROXY stages already installed");
        }
        (true, false) => {
            chain.add_after(DECODER_STAGE, HANDLER_STAGE, handler)?;
        }
        (false, true) => {
            chain.add_before(HANDLER_STAGE, DECODER_STAGE, Box::new(gateway.decoder()))?;
        }
        (false, false) => {
            debug!("Decoder stage missing, falling back to positional insert");
            if chain.contains(TIMEOUT_STAGE) {
                chain.add_after(TIMEOUT_STAGE, DECODER_STAGE, Box::new(gateway.decoder()))?;
                chain.add_after(DECODER_STAGE, HANDLER_STAGE, handler)?;
            } else {
                chain.add_first(HANDLER_STAGE, handler)?;
                chain.add_first(DECODER_STAGE, Box::new(gateway.decoder()))?;
            }
        }
    }
    Ok(())
}

/// Put a detector into a live connection's chain.
///
/// Returns `Ok(false)` when nothing was done: the connection is closed,
/// already has a detector, or detection has settled (the stream was judged
/// plain, rejected or upgraded, or a decoder has started consuming a header).
/// An idle decoder left by the host is removed, and an address stage left by
/// the host is handed to the detector for reuse.
pub fn install_detector(
    conn: &mut Connection,
    gateway: &ConnectionGateway,
) -> Result<bool, ChainError> {
    if !conn.is_open() {
        return Ok(false);
    }
    if conn.state().detection_settled() {
        trace!(connection_id = %conn.id(), "Detection already settled");
        return Ok(false);
    }
    let id = conn.id();
    let chain = conn.pipeline_mut();
    if chain.contains(DETECTOR_STAGE) {
        trace!(connection_id = %id, "Detector already installed");
        return Ok(false);
    }

    if chain.contains(DECODER_STAGE) {
        chain.remove(DECODER_STAGE)?;
    }
    let handler = if chain.contains(HANDLER_STAGE) {
        chain.remove(HANDLER_STAGE)?
    } else {
        None
    };

    let detector = Box::new(gateway.detector(handler));
    if chain.contains(TIMEOUT_STAGE) {
        chain.add_after(TIMEOUT_STAGE, DETECTOR_STAGE, detector)?;
    } else {
        chain.add_first(DETECTOR_STAGE, detector)?;
    }
    debug!(connection_id = %id, chain = ?chain, "Detector installed");
    Ok(true)
}

/// Host hook that prepares the chain of every new connection.
pub trait ChainInitializer: Send + Sync + 'static {
    fn init_chain(&self, conn: &mut Connection) -> Result<(), ChainError>;

    /// Called once the connection's task has finished.
    fn connection_closed(&self, _id: ConnectionId) {}
}

impl<T: ChainInitializer + ?Sized> ChainInitializer for Arc<T> {
    fn init_chain(&self, conn: &mut Connection) -> Result<(), ChainError> {
        (**self).init_chain(conn)
    }

    fn connection_closed(&self, id: ConnectionId) {
        (**self).connection_closed(id)
    }
}

/// Installs the idle-timeout anchor and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseInitializer;

impl ChainInitializer for BaseInitializer {
    fn init_chain(&self, conn: &mut Connection) -> Result<(), ChainError> {
        let chain = conn.pipeline_mut();
        if !chain.contains(TIMEOUT_STAGE) {
            chain.add_first(TIMEOUT_STAGE, Box::new(IdleTimeoutStage::new()))?;
        }
        Ok(())
    }
}

/// Wraps a host initializer and adds a detector to every chain it builds.
#[derive(Debug)]
pub struct DetectorInitializer<I> {
    delegate: I,
    gateway: ConnectionGateway,
}

impl<I: ChainInitializer> DetectorInitializer<I> {
    pub fn new(delegate: I, gateway: ConnectionGateway) -> Self {
        Self { delegate, gateway }
    }
}

impl<I: ChainInitializer> ChainInitializer for DetectorInitializer<I> {
    fn init_chain(&self, conn: &mut Connection) -> Result<(), ChainError> {
        self.delegate.init_chain(conn)?;
        install_detector(conn, &self.gateway)?;
        Ok(())
    }

    fn connection_closed(&self, id: ConnectionId) {
        self.delegate.connection_closed(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::AddressSubstitutionStage;
    use crate::pipeline::{Inbound, StageContext};
    use crate::proxy::DecodeOptions;
    use crate::whitelist::WhitelistPolicy;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;

    impl Stage for Noop {
        fn on_read(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), ChainError> {
            ctx.forward(msg);
            Ok(())
        }
    }

    /// Host chain that only tracks names.
    #[derive(Default)]
    struct NameChain {
        names: Vec<String>,
    }

    impl NameChain {
        fn with(names: &[&str]) -> Self {
            Self {
                names: names.iter().map(|n| n.to_string()).collect(),
            }
        }

        fn pos(&self, name: &str) -> Result<usize, ChainError> {
            self.names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| ChainError::NoSuchStage(name.to_string()))
        }

        fn insert(&mut self, at: usize, name: &str) -> Result<(), ChainError> {
            if self.names.iter().any(|n| n == name) {
                return Err(ChainError::DuplicateName(name.to_string()));
            }
            self.names.insert(at, name.to_string());
            Ok(())
        }
    }

    impl StageChain for NameChain {
        fn contains(&self, name: &str) -> bool {
            self.pos(name).is_ok()
        }

        fn names(&self) -> Vec<String> {
            self.names.clone()
        }

        fn add_first(&mut self, name: &str, _: Box<dyn Stage>) -> Result<(), ChainError> {
            self.insert(0, name)
        }

        fn add_last(&mut self, name: &str, _: Box<dyn Stage>) -> Result<(), ChainError> {
            let end = self.names.len();
            self.insert(end, name)
        }

        fn add_before(&mut self, anchor: &str, name: &str, _: Box<dyn Stage>) -> Result<(), ChainError> {
            let at = self.pos(anchor)?;
            self.insert(at, name)
        }

        fn add_after(&mut self, anchor: &str, name: &str, _: Box<dyn Stage>) -> Result<(), ChainError> {
            let at = self.pos(anchor)?;
            self.insert(at + 1, name)
        }

        fn replace(
            &mut self,
            old: &str,
            name: &str,
            _: Box<dyn Stage>,
        ) -> Result<Option<Box<dyn Stage>>, ChainError> {
            let at = self.pos(old)?;
            if old != name && self.names.iter().any(|n| n == name) {
                return Err(ChainError::DuplicateName(name.to_string()));
            }
            self.names[at] = name.to_string();
            Ok(None)
        }

        fn remove(&mut self, name: &str) -> Result<Option<Box<dyn Stage>>, ChainError> {
            let at = self.pos(name)?;
            self.names.remove(at);
            Ok(None)
        }
    }

    fn gateway() -> ConnectionGateway {
        ConnectionGateway::new(WhitelistPolicy::Disabled, DecodeOptions::default())
    }

    #[test]
    fn rewrite_replaces_detector_in_place() {
        let mut chain = NameChain::with(&[TIMEOUT_STAGE, DETECTOR_STAGE, "handler"]);
        rewrite_chain(&mut chain, &gateway(), Box::new(Noop)).unwrap();
        assert_eq!(
            chain.names(),
            vec![TIMEOUT_STAGE, DECODER_STAGE, HANDLER_STAGE, "handler"]
        );
    }

    #[test]
    fn rewrite_twice_installs_one_of_each() {
        let gw = gateway();
        let mut chain = NameChain::with(&[TIMEOUT_STAGE, DETECTOR_STAGE]);
        rewrite_chain(&mut chain, &gw, Box::new(Noop)).unwrap();
        rewrite_chain(&mut chain, &gw, Box::new(Noop)).unwrap();
        assert_eq!(chain.names(), vec![TIMEOUT_STAGE, DECODER_STAGE, HANDLER_STAGE]);
    }

    #[test]
    fn rewrite_with_existing_decoder_drops_detector() {
        let mut chain = NameChain::with(&[DETECTOR_STAGE, DECODER_STAGE, "handler"]);
        rewrite_chain(&mut chain, &gateway(), Box::new(Noop)).unwrap();
        assert_eq!(chain.names(), vec![DECODER_STAGE, HANDLER_STAGE, "handler"]);
    }

    #[test]
    fn rewrite_with_existing_handler_adds_decoder_before_it() {
        let mut chain = NameChain::with(&[TIMEOUT_STAGE, HANDLER_STAGE]);
        rewrite_chain(&mut chain, &gateway(), Box::new(Noop)).unwrap();
        assert_eq!(chain.names(), vec![TIMEOUT_STAGE, DECODER_STAGE, HANDLER_STAGE]);
    }

    #[test]
    fn fallback_after_timeout_keeps_decoder_first() {
        let mut chain = NameChain::with(&["framer", TIMEOUT_STAGE, "handler"]);
        rewrite_chain(&mut chain, &gateway(), Box::new(Noop)).unwrap();

        let names = chain.names();
        let decoder = names.iter().position(|n| n == DECODER_STAGE).unwrap();
        let handler = names.iter().position(|n| n == HANDLER_STAGE).unwrap();
        let timeout = names.iter().position(|n| n == TIMEOUT_STAGE).unwrap();
        assert_eq!(handler, decoder + 1);
        assert!(decoder > timeout);
        assert!(handler < names.iter().position(|n| n == "handler").unwrap());
    }

    #[test]
    fn fallback_without_timeout_inserts_at_front() {
        let mut chain = NameChain::with(&["framer", "handler"]);
        rewrite_chain(&mut chain, &gateway(), Box::new(Noop)).unwrap();
        assert_eq!(
            chain.names(),
            vec![DECODER_STAGE, HANDLER_STAGE, "framer", "handler"]
        );
    }

    fn live_connection() -> Connection {
        Connection::new(
            "127.0.0.1:4000".parse().unwrap(),
            "127.0.0.1:25565".parse().unwrap(),
        )
    }

    #[test]
    fn install_detector_after_timeout() {
        let gw = gateway();
        let mut conn = live_connection();
        BaseInitializer.init_chain(&mut conn).unwrap();
        conn.pipeline_mut().add_last("handler", Box::new(Noop)).unwrap();

        assert!(install_detector(&mut conn, &gw).unwrap());
        assert_eq!(
            conn.pipeline().names(),
            vec![TIMEOUT_STAGE, DETECTOR_STAGE, "handler"]
        );
    }

    #[test]
    fn install_detector_twice_leaves_one() {
        let gw = gateway();
        let mut conn = live_connection();
        assert!(install_detector(&mut conn, &gw).unwrap());
        assert!(!install_detector(&mut conn, &gw).unwrap());
        assert_eq!(conn.pipeline().names(), vec![DETECTOR_STAGE]);
    }

    #[test]
    fn install_detector_skips_closed_connections() {
        let mut conn = live_connection();
        conn.state_mut().close();
        assert!(!install_detector(&mut conn, &gateway()).unwrap());
        assert!(conn.pipeline().is_empty());
    }

    #[test]
    fn install_detector_replaces_host_decoder_and_reuses_handler() {
        let gw = gateway();
        let mut conn = live_connection();
        let chain = conn.pipeline_mut();
        chain.add_last(DECODER_STAGE, Box::new(gw.decoder())).unwrap();
        chain
            .add_last(HANDLER_STAGE, Box::new(AddressSubstitutionStage::new()))
            .unwrap();
        chain.add_last("handler", Box::new(Noop)).unwrap();

        install_detector(&mut conn, &gw).unwrap();
        assert_eq!(conn.pipeline().names(), vec![DETECTOR_STAGE, "handler"]);

        // Plain traffic: the reused stage is never linked
        conn.read(BytesMut::from(&b"GET / HTTP/1.1\r\n\r\n"[..]));
        assert_eq!(conn.pipeline().names(), vec!["handler"]);

        let mut proxied = live_connection();
        proxied.pipeline_mut()
            .add_last(HANDLER_STAGE, Box::new(AddressSubstitutionStage::new()))
            .unwrap();
        install_detector(&mut proxied, &gw).unwrap();
        proxied.read(BytesMut::from(&b"PROXY TCP4 192.0.2.1 192.0.2.2 1000 2000\r\n"[..]));
        assert!(proxied.pipeline().is_empty());
        assert_eq!(
            proxied.state().peer_addr(),
            "192.0.2.1:1000".parse::<std::net::SocketAddr>().unwrap()
        );
    }

    #[test]
    fn install_detector_skips_plain_connection() {
        let gw = gateway();
        let mut conn = live_connection();
        BaseInitializer.init_chain(&mut conn).unwrap();
        install_detector(&mut conn, &gw).unwrap();
        conn.read(BytesMut::from(&b"GET / HTTP/1.1\r\n\r\n"[..]));
        assert_eq!(conn.pipeline().names(), vec![TIMEOUT_STAGE]);

        assert!(!install_detector(&mut conn, &gw).unwrap());
        assert_eq!(conn.pipeline().names(), vec![TIMEOUT_STAGE]);

        // A header-shaped line later in the stream is just data
        let _ = conn.take_released();
        conn.read(BytesMut::from(&b"PROXY TCP4 6.6.6.6 1.1.1.1 666 80\r\n"[..]));
        assert_eq!(
            &conn.take_released()[..],
            b"PROXY TCP4 6.6.6.6 1.1.1.1 666 80\r\n"
        );
        assert_eq!(
            conn.state().peer_addr(),
            "127.0.0.1:4000".parse::<std::net::SocketAddr>().unwrap()
        );
    }

    #[test]
    fn install_detector_keeps_decoder_mid_header() {
        let gw = gateway();
        let mut conn = live_connection();
        BaseInitializer.init_chain(&mut conn).unwrap();
        install_detector(&mut conn, &gw).unwrap();
        conn.read(BytesMut::from(&b"PROXY TCP4 198.51.100.7 10.0"[..]));
        assert_eq!(
            conn.pipeline().names(),
            vec![TIMEOUT_STAGE, DECODER_STAGE, HANDLER_STAGE]
        );

        assert!(!install_detector(&mut conn, &gw).unwrap());
        assert_eq!(
            conn.pipeline().names(),
            vec![TIMEOUT_STAGE, DECODER_STAGE, HANDLER_STAGE]
        );

        conn.read(BytesMut::from(&b".0.1 51000 25565\r\nhello"[..]));
        assert_eq!(conn.pipeline().names(), vec![TIMEOUT_STAGE]);
        assert_eq!(
            conn.state().peer_addr(),
            "198.51.100.7:51000".parse::<std::net::SocketAddr>().unwrap()
        );
        assert_eq!(&conn.take_released()[..], b"hello");
    }

    #[test]
    fn install_detector_keeps_host_decoder_that_has_data() {
        let gw = gateway();
        let mut conn = live_connection();
        let chain = conn.pipeline_mut();
        chain.add_last(DECODER_STAGE, Box::new(gw.decoder())).unwrap();
        chain
            .add_last(HANDLER_STAGE, Box::new(AddressSubstitutionStage::new()))
            .unwrap();
        conn.read(BytesMut::from(&b"PROXY TCP4 192.0.2.1 "[..]));

        assert!(!install_detector(&mut conn, &gw).unwrap());
        assert_eq!(conn.pipeline().names(), vec![DECODER_STAGE, HANDLER_STAGE]);

        conn.read(BytesMut::from(&b"192.0.2.2 1000 2000\r\n"[..]));
        assert!(conn.pipeline().is_empty());
        assert_eq!(
            conn.state().peer_addr(),
            "192.0.2.1:1000".parse::<std::net::SocketAddr>().unwrap()
        );
    }

    struct CountingInitializer {
        closed: Arc<AtomicUsize>,
    }

    impl ChainInitializer for CountingInitializer {
        fn init_chain(&self, conn: &mut Connection) -> Result<(), ChainError> {
            BaseInitializer.init_chain(conn)?;
            conn.pipeline_mut().add_last("handler", Box::new(Noop))
        }

        fn connection_closed(&self, _id: ConnectionId) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn decorator_runs_delegate_then_installs_detector() {
        let closed = Arc::new(AtomicUsize::new(0));
        let init = DetectorInitializer::new(
            CountingInitializer {
                closed: closed.clone(),
            },
            gateway(),
        );
        let mut conn = live_connection();
        init.init_chain(&mut conn).unwrap();
        assert_eq!(
            conn.pipeline().names(),
            vec![TIMEOUT_STAGE, DETECTOR_STAGE, "handler"]
        );

        init.connection_closed(conn.id());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
