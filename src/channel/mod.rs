//! Coordinator/worker communication channel.
//!
//! Every transport feeds one inbound queue owned by [`CommunicationChannel`].
//! A [`Connector`] hands out connections: in-memory links for in-process
//! workers and tests, or socket connections accepted by [`transport`].
//! Commands flow back through a per-connection outbound queue.
//!
//! Delivery is at-most-once. Nothing is buffered across a disconnect.

pub mod protocol;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{Error, Result};

pub use protocol::{Assignment, CoordinatorCommand, OperatorRequest, WorkerMessage};

/// One logical connection. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An event arriving at the coordinator.
#[derive(Debug)]
pub enum Inbound {
    /// Consumed by [`CommunicationChannel::recv`]; never returned.
    Connected {
        conn: ConnectionId,
        outbound: mpsc::UnboundedSender<CoordinatorCommand>,
    },
    Message {
        conn: ConnectionId,
        message: WorkerMessage,
    },
    Operator {
        conn: ConnectionId,
        request: OperatorRequest,
    },
    /// A frame could not be decoded. The connection is dropped.
    Malformed { conn: ConnectionId, error: String },
    Disconnected { conn: ConnectionId },
}

/// Coordinator side of the channel.
pub struct CommunicationChannel {
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    outbound: HashMap<ConnectionId, mpsc::UnboundedSender<CoordinatorCommand>>,
    connector: Connector,
}

impl CommunicationChannel {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_rx,
            outbound: HashMap::new(),
            connector: Connector {
                inbound_tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
        }
    }

    /// Handle for opening new connections into this channel.
    pub fn connector(&self) -> Connector {
        self.connector.clone()
    }

    /// Next event, in delivery order per connection.
    ///
    /// Returns `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Inbound> {
        loop {
            let event = self.inbound_rx.recv().await?;
            if let Some(event) = self.accept(event) {
                return Some(event);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Inbound> {
        loop {
            let event = self.inbound_rx.try_recv().ok()?;
            if let Some(event) = self.accept(event) {
                return Some(event);
            }
        }
    }

    fn accept(&mut self, event: Inbound) -> Option<Inbound> {
        match event {
            Inbound::Connected { conn, outbound } => {
                crate::mlog_trace!("channel: {} connected", conn);
                self.outbound.insert(conn, outbound);
                None
            }
            Inbound::Disconnected { conn } => {
                self.outbound.remove(&conn);
                Some(Inbound::Disconnected { conn })
            }
            other => Some(other),
        }
    }

    /// Queue a command for one connection.
    ///
    /// # Errors
    /// `Error::Channel` if the connection is unknown or already gone.
    pub fn send(&self, conn: ConnectionId, command: CoordinatorCommand) -> Result<()> {
        let outbound = self
            .outbound
            .get(&conn)
            .ok_or_else(|| Error::Channel(format!("{} is not connected", conn)))?;
        outbound
            .send(command)
            .map_err(|_| Error::Channel(format!("{} closed", conn)))
    }

    pub fn is_connected(&self, conn: ConnectionId) -> bool {
        self.outbound
            .get(&conn)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Stop sending to a connection. Its writer side shuts down.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.outbound.remove(&conn);
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut conns: Vec<ConnectionId> = self.outbound.keys().copied().collect();
        conns.sort();
        conns
    }

    /// Drop every outbound queue and stop accepting events.
    pub fn close(&mut self) {
        self.outbound.clear();
        self.inbound_rx.close();
    }
}

impl Default for CommunicationChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens connections into a [`CommunicationChannel`]. Cheap to clone.
#[derive(Clone)]
pub struct Connector {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    next_id: Arc<AtomicU64>,
}

impl Connector {
    /// Register a new connection and return its outbound command queue.
    pub fn open(&self) -> (ConnectionId, mpsc::UnboundedReceiver<CoordinatorCommand>) {
        let conn = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbound, commands) = mpsc::unbounded_channel();
        let _ = self.inbound_tx.send(Inbound::Connected { conn, outbound });
        (conn, commands)
    }

    /// Open an in-memory connection for an in-process worker.
    ///
    /// Dropping the link's sender reports the connection as disconnected.
    pub fn connect(&self) -> WorkerLink {
        let (conn, commands) = self.open();
        let (tx, mut messages) = mpsc::unbounded_channel::<WorkerMessage>();
        let connector = self.clone();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                connector.deliver(conn, message);
            }
            connector.disconnected(conn);
        });
        WorkerLink { tx, rx: commands }
    }

    /// Inject an operator request without a socket, e.g. on Ctrl-C.
    pub fn request(&self, request: OperatorRequest) {
        let conn = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.operator(conn, request);
    }

    fn deliver(&self, conn: ConnectionId, message: WorkerMessage) {
        let _ = self.inbound_tx.send(Inbound::Message { conn, message });
    }

    fn operator(&self, conn: ConnectionId, request: OperatorRequest) {
        let _ = self.inbound_tx.send(Inbound::Operator { conn, request });
    }

    fn malformed(&self, conn: ConnectionId, error: String) {
        let _ = self.inbound_tx.send(Inbound::Malformed { conn, error });
    }

    fn disconnected(&self, conn: ConnectionId) {
        let _ = self.inbound_tx.send(Inbound::Disconnected { conn });
    }
}

/// Worker side of one connection, independent of transport.
pub struct WorkerLink {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    rx: mpsc::UnboundedReceiver<CoordinatorCommand>,
}

impl WorkerLink {
    pub fn send(&self, message: WorkerMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::Channel("coordinator connection closed".to_string()))
    }

    /// Clone of the sending half, for reporting from spawned tasks.
    pub fn sender(&self) -> mpsc::UnboundedSender<WorkerMessage> {
        self.tx.clone()
    }

    /// Next command. `None` once the coordinator drops the connection.
    pub async fn recv(&mut self) -> Option<CoordinatorCommand> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CoordinatorCommand> {
        self.rx.try_recv().ok()
    }
}
