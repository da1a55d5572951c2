//! Connection Stage Pipeline
//!
//! An ordered chain of named stages that inbound data flows through. Stages
//! may rewrite the chain while they run, including removing or replacing
//! themselves.
//!
//! # Data Flow
//! ```text
//! socket read
//!     → Pipeline::fire_read (head)
//!     → stage 1 → stage 2 → ... (each forwards through StageContext)
//!     → tail: bytes released to the host application
//! ```
//!
//! Messages forwarded by a stage that has since left the chain continue at
//! its replacement, or at the stage that followed it when it was removed.
//! Delivery is depth-first: a forwarded message reaches the tail before the
//! next message from the same stage starts.

mod connection;

pub use connection::{Connection, ConnectionId, ConnectionState};

use std::fmt;

use bytes::BytesMut;
use compact_str::CompactString;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::proxy::ProxyHeader;

/// A message travelling down the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Raw bytes from the transport (or bytes a stage passes on)
    Bytes(BytesMut),
    /// A decoded PROXY header
    Header(ProxyHeader),
}

/// Errors from structural chain operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// A stage with this name is already in the chain
    DuplicateName(String),
    /// No stage with this name is in the chain
    NoSuchStage(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::DuplicateName(name) => write!(f, "duplicate stage name: {}", name),
            ChainError::NoSuchStage(name) => write!(f, "no such stage: {}", name),
        }
    }
}

impl std::error::Error for ChainError {}

/// One processing step of a connection.
pub trait Stage: Send + 'static {
    /// Handle an inbound message. Anything not forwarded through `ctx` is
    /// consumed by this stage.
    fn on_read(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), ChainError>;
}

/// Structural operations a host chain offers, addressed by stage name.
///
/// Removing or replacing a stage that is currently running returns `None`
/// instead of the stage: the running stage is dropped once it returns.
pub trait StageChain {
    fn contains(&self, name: &str) -> bool;

    fn names(&self) -> Vec<String>;

    fn add_first(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<(), ChainError>;

    fn add_last(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<(), ChainError>;

    fn add_before(
        &mut self,
        anchor: &str,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<(), ChainError>;

    fn add_after(
        &mut self,
        anchor: &str,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<(), ChainError>;

    fn replace(
        &mut self,
        old: &str,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<Option<Box<dyn Stage>>, ChainError>;

    fn remove(&mut self, name: &str) -> Result<Option<Box<dyn Stage>>, ChainError>;
}

type EntryId = u64;

struct Entry {
    id: EntryId,
    name: CompactString,
    /// `None` while the stage is running
    stage: Option<Box<dyn Stage>>,
}

/// Where a forwarded message should be delivered next.
#[derive(Debug, Clone, Copy)]
enum Hop {
    /// To this entry itself
    At(EntryId),
    /// To whatever follows this entry
    After(EntryId),
}

/// The per-connection stage chain.
#[derive(Default)]
pub struct Pipeline {
    entries: Vec<Entry>,
    next_id: EntryId,
    /// Departed entry → where its traffic continues (`None` = tail)
    departed: SmallVec<[(EntryId, Option<EntryId>); 4]>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| e.name.as_str()))
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    fn position_of(&self, id: EntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    fn id_of(&self, name: &str) -> Option<EntryId> {
        self.position(name).map(|i| self.entries[i].id)
    }

    fn insert_at(
        &mut self,
        index: usize,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<(), ChainError> {
        if self.contains(name) {
            return Err(ChainError::DuplicateName(name.to_string()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            index,
            Entry {
                id,
                name: CompactString::from(name),
                stage: Some(stage),
            },
        );
        Ok(())
    }

    fn depart(&mut self, index: usize, continue_at: Option<EntryId>) -> Option<Box<dyn Stage>> {
        let entry = self.entries.remove(index);
        self.departed.push((entry.id, continue_at));
        entry.stage
    }

    /// Resolve a hop to an index into `entries`, or `None` for the tail.
    fn resolve(&self, hop: Hop) -> Option<usize> {
        let (mut id, after) = match hop {
            Hop::At(id) => (id, false),
            Hop::After(id) => (id, true),
        };
        if let Some(pos) = self.position_of(id) {
            let pos = if after { pos + 1 } else { pos };
            return (pos < self.entries.len()).then_some(pos);
        }
        // Follow departures; the chain of departures is finite since ids are
        // never reused.
        loop {
            let next = self
                .departed
                .iter()
                .rev()
                .find(|(gone, _)| *gone == id)
                .and_then(|(_, to)| *to)?;
            if let Some(pos) = self.position_of(next) {
                return Some(pos);
            }
            id = next;
        }
    }

    /// Feed a message in at the head of the chain.
    pub fn fire_read(&mut self, conn: &mut ConnectionState, msg: Inbound) {
        // Hops are resolved when popped: earlier deliveries may rewrite the chain
        let mut stack: SmallVec<[(Option<Hop>, Inbound); 4]> = SmallVec::new();
        stack.push((None, msg));

        while let Some((hop, msg)) = stack.pop() {
            if conn.is_closed() {
                trace!(connection_id = %conn.id(), "Connection closed, dropping inbound data");
                return;
            }

            let target = match hop {
                None => (!self.entries.is_empty()).then_some(0),
                Some(hop) => self.resolve(hop),
            };
            let Some(index) = target else {
                deliver_to_tail(conn, msg);
                continue;
            };

            let id = self.entries[index].id;
            let name = self.entries[index].name.clone();
            let Some(mut stage) = self.entries[index].stage.take() else {
                warn!(stage = %name, "Stage re-entered while running; message dropped");
                continue;
            };

            let mut ctx = StageContext {
                pipeline: self,
                connection: conn,
                current: id,
                name: name.clone(),
                forwarded: SmallVec::new(),
            };
            let result = stage.on_read(&mut ctx, msg);
            let forwarded = std::mem::take(&mut ctx.forwarded);

            match self.position_of(id) {
                Some(pos) => self.entries[pos].stage = Some(stage),
                None => debug!(stage = %name, "Stage left the chain"),
            }

            if let Err(e) = result {
                warn!(
                    connection_id = %conn.id(),
                    stage = %name,
                    error = %e,
                    "Stage failed, closing connection"
                );
                conn.close();
                return;
            }

            // Reverse so the first forwarded message is delivered first
            for (hop, msg) in forwarded.into_iter().rev() {
                stack.push((Some(hop), msg));
            }
        }
    }
}

fn deliver_to_tail(conn: &mut ConnectionState, msg: Inbound) {
    match msg {
        Inbound::Bytes(bytes) => conn.release(bytes),
        Inbound::Header(header) => {
            debug!(connection_id = %conn.id(), ?header, "PROXY header reached the end of the chain unused")
        }
    }
}

impl StageChain for Pipeline {
    fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.to_string()).collect()
    }

    fn add_first(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<(), ChainError> {
        self.insert_at(0, name, stage)
    }

    fn add_last(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<(), ChainError> {
        let end = self.entries.len();
        self.insert_at(end, name, stage)
    }

    fn add_before(
        &mut self,
        anchor: &str,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<(), ChainError> {
        let pos = self
            .position(anchor)
            .ok_or_else(|| ChainError::NoSuchStage(anchor.to_string()))?;
        self.insert_at(pos, name, stage)
    }

    fn add_after(
        &mut self,
        anchor: &str,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<(), ChainError> {
        let pos = self
            .position(anchor)
            .ok_or_else(|| ChainError::NoSuchStage(anchor.to_string()))?;
        self.insert_at(pos + 1, name, stage)
    }

    fn replace(
        &mut self,
        old: &str,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<Option<Box<dyn Stage>>, ChainError> {
        let pos = self
            .position(old)
            .ok_or_else(|| ChainError::NoSuchStage(old.to_string()))?;
        if old != name && self.contains(name) {
            return Err(ChainError::DuplicateName(name.to_string()));
        }
        let new_id = self.next_id;
        let previous = self.depart(pos, Some(new_id));
        self.insert_at(pos, name, stage)?;
        Ok(previous)
    }

    fn remove(&mut self, name: &str) -> Result<Option<Box<dyn Stage>>, ChainError> {
        let pos = self
            .position(name)
            .ok_or_else(|| ChainError::NoSuchStage(name.to_string()))?;
        let successor = self.entries.get(pos + 1).map(|e| e.id);
        Ok(self.depart(pos, successor))
    }
}

/// A stage's view of its connection and chain while it runs.
pub struct StageContext<'a> {
    pipeline: &'a mut Pipeline,
    connection: &'a mut ConnectionState,
    current: EntryId,
    name: CompactString,
    forwarded: SmallVec<[(Hop, Inbound); 2]>,
}

impl<'a> StageContext<'a> {
    /// Name the running stage was registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&mut self) -> &mut Pipeline {
        &mut *self.pipeline
    }

    pub fn connection(&mut self) -> &mut ConnectionState {
        &mut *self.connection
    }

    /// Pass a message to the stage after this one.
    pub fn forward(&mut self, msg: Inbound) {
        self.forwarded.push((Hop::After(self.current), msg));
    }

    /// Deliver a message to the named stage itself, falling back to
    /// [`forward`](Self::forward) if it is not in the chain.
    pub fn forward_to(&mut self, name: &str, msg: Inbound) {
        let hop = match self.pipeline.id_of(name) {
            Some(id) => Hop::At(id),
            None => Hop::After(self.current),
        };
        self.forwarded.push((hop, msg));
    }

    /// Take the running stage out of the chain.
    pub fn remove_self(&mut self) -> Result<(), ChainError> {
        let name = self.name.clone();
        self.pipeline.remove(&name).map(|_| ())
    }

    /// Close the transport. Nothing further is delivered.
    pub fn close(&mut self) {
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;

    /// Forwards everything, tagging bytes with its marker.
    struct Tag(&'static [u8]);

    impl Stage for Tag {
        fn on_read(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), ChainError> {
            match msg {
                Inbound::Bytes(mut b) => {
                    b.extend_from_slice(self.0);
                    ctx.forward(Inbound::Bytes(b));
                }
                other => ctx.forward(other),
            }
            Ok(())
        }
    }

    /// Removes itself on first read, forwarding the data.
    struct OneShot;

    impl Stage for OneShot {
        fn on_read(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), ChainError> {
            ctx.remove_self()?;
            ctx.forward(msg);
            Ok(())
        }
    }

    /// Replaces itself with a `Tag` on first read.
    struct Swap;

    impl Stage for Swap {
        fn on_read(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), ChainError> {
            let name = ctx.name().to_string();
            ctx.pipeline().replace(&name, "swapped", Box::new(Tag(b"S")))?;
            ctx.forward(msg);
            Ok(())
        }
    }

    fn state() -> ConnectionState {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        ConnectionState::new(addr, "127.0.0.1:25565".parse().unwrap())
    }

    fn bytes(b: &[u8]) -> Inbound {
        Inbound::Bytes(BytesMut::from(b))
    }

    #[test]
    fn positional_inserts() {
        let mut p = Pipeline::new();
        p.add_last("b", Box::new(Tag(b"b"))).unwrap();
        p.add_first("a", Box::new(Tag(b"a"))).unwrap();
        p.add_after("b", "d", Box::new(Tag(b"d"))).unwrap();
        p.add_before("d", "c", Box::new(Tag(b"c"))).unwrap();
        assert_eq!(p.names(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn duplicate_and_missing_names() {
        let mut p = Pipeline::new();
        p.add_last("a", Box::new(Tag(b"a"))).unwrap();
        assert_eq!(
            p.add_last("a", Box::new(Tag(b"a"))),
            Err(ChainError::DuplicateName("a".into()))
        );
        assert_eq!(
            p.add_after("missing", "x", Box::new(Tag(b"x"))),
            Err(ChainError::NoSuchStage("missing".into()))
        );
        assert!(matches!(p.remove("missing"), Err(ChainError::NoSuchStage(_))));
        p.add_last("b", Box::new(Tag(b"b"))).unwrap();
        assert!(matches!(
            p.replace("a", "b", Box::new(Tag(b"x"))),
            Err(ChainError::DuplicateName(_))
        ));
        assert_eq!(p.names(), vec!["a", "b"]);
    }

    #[test]
    fn bytes_flow_in_order_to_tail() {
        let mut p = Pipeline::new();
        p.add_last("a", Box::new(Tag(b"a"))).unwrap();
        p.add_last("b", Box::new(Tag(b"b"))).unwrap();
        let mut conn = state();
        p.fire_read(&mut conn, bytes(b"x"));
        assert_eq!(&conn.take_released()[..], b"xab");
    }

    #[test]
    fn removed_stage_continues_at_successor() {
        let mut p = Pipeline::new();
        p.add_last("once", Box::new(OneShot)).unwrap();
        p.add_last("b", Box::new(Tag(b"b"))).unwrap();
        let mut conn = state();

        p.fire_read(&mut conn, bytes(b"1"));
        assert_eq!(p.names(), vec!["b"]);
        p.fire_read(&mut conn, bytes(b"2"));
        assert_eq!(&conn.take_released()[..], b"1b2b");
    }

    #[test]
    fn replaced_stage_continues_at_replacement() {
        let mut p = Pipeline::new();
        p.add_last("swap", Box::new(Swap)).unwrap();
        p.add_last("b", Box::new(Tag(b"b"))).unwrap();
        let mut conn = state();

        p.fire_read(&mut conn, bytes(b"1"));
        assert_eq!(p.names(), vec!["swapped", "b"]);
        assert_eq!(&conn.take_released()[..], b"1Sb");
    }

    #[test]
    fn closed_connection_releases_nothing() {
        struct Closer;
        impl Stage for Closer {
            fn on_read(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), ChainError> {
                ctx.forward(msg);
                ctx.close();
                Ok(())
            }
        }

        let mut p = Pipeline::new();
        p.add_last("closer", Box::new(Closer)).unwrap();
        let mut conn = state();
        p.fire_read(&mut conn, bytes(b"secret"));
        assert!(conn.is_closed());
        assert!(conn.take_released().is_empty());
    }

    #[test]
    fn stage_error_closes_connection() {
        struct Broken;
        impl Stage for Broken {
            fn on_read(&mut self, _: &mut StageContext<'_>, _: Inbound) -> Result<(), ChainError> {
                Err(ChainError::NoSuchStage("anchor".into()))
            }
        }

        let mut p = Pipeline::new();
        p.add_last("broken", Box::new(Broken)).unwrap();
        let mut conn = state();
        p.fire_read(&mut conn, bytes(b"x"));
        assert!(conn.is_closed());
    }
}
