//! Client side of a peer connection
//!
//! A [`Transport`] moves opaque frames; [`ClientPeer`] layers request/response correlation
//! on top of it. Every request gets a locally generated id and waits on a oneshot channel
//! until the matching response arrives. When the connection closes, every outstanding
//! request fails with [`BlockchainError::Disconnected`].

use crate::error::{BlockchainError, Result};
use crate::network::message::{PeerEvent, PeerMessage, RpcMethod, RpcResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

const CLIENT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum TransportEvent {
    Frame(Vec<u8>),
    /// The remote end went away; no further frames follow
    Closed,
}

/// Frame-level connection to one remote node
#[async_trait]
pub trait Transport: Send + Sync {
    fn address(&self) -> &str;

    /// Opens the connection and hands back the stream of inbound frames
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>>;

    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    async fn disconnect(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Open,
    Close,
    Event(PeerEvent),
}

/// RPC view of a remote node
#[async_trait]
pub trait Peer: Send + Sync {
    fn address(&self) -> &str;

    async fn open(&self) -> Result<()>;

    async fn close(&self);

    async fn is_open(&self) -> bool;

    async fn request(&self, method: RpcMethod) -> Result<RpcResult>;

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<RpcResult>>>;

#[derive(Default)]
struct Connection {
    open: bool,
    pending: PendingMap,
}

pub struct ClientPeer {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<ClientEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ClientPeer {
    pub fn new(transport: Arc<dyn Transport>) -> ClientPeer {
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        ClientPeer {
            transport,
            next_id: AtomicU64::new(1),
            conn: Arc::new(Mutex::new(Connection::default())),
            events,
            reader: Mutex::new(None),
        }
    }

    pub async fn pending_requests(&self) -> usize {
        self.conn.lock().await.pending.len()
    }

    async fn read_frames(
        address: String,
        mut inbound: mpsc::Receiver<TransportEvent>,
        conn: Arc<Mutex<Connection>>,
        events: broadcast::Sender<ClientEvent>,
    ) {
        while let Some(TransportEvent::Frame(frame)) = inbound.recv().await {
            let message = match PeerMessage::from_frame(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping malformed frame from {address}: {e}");
                    continue;
                }
            };
            match message {
                PeerMessage::Response { id, result } => {
                    let waiter = conn.lock().await.pending.remove(&id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(result.map_err(BlockchainError::from));
                        }
                        None => debug!("Response {id} from {address} has no waiting request"),
                    }
                }
                PeerMessage::Event(event) => {
                    let _ = events.send(ClientEvent::Event(event));
                }
                PeerMessage::Request { id, method } => {
                    debug!("Ignoring {} request {id} from server {address}", method.name());
                }
            }
        }
        Self::shutdown(&address, &conn, &events).await;
    }

    // Idempotent; only the first call after an open emits `Close`
    async fn shutdown(
        address: &str,
        conn: &Mutex<Connection>,
        events: &broadcast::Sender<ClientEvent>,
    ) {
        let mut conn = conn.lock().await;
        if !conn.open {
            return;
        }
        conn.open = false;
        let rejected = conn.pending.len();
        for (_, waiter) in conn.pending.drain() {
            let _ = waiter.send(Err(BlockchainError::Disconnected));
        }
        drop(conn);
        info!("Connection to {address} closed ({rejected} request(s) rejected)");
        let _ = events.send(ClientEvent::Close);
    }
}

#[async_trait]
impl Peer for ClientPeer {
    fn address(&self) -> &str {
        self.transport.address()
    }

    async fn open(&self) -> Result<()> {
        let mut reader = self.reader.lock().await;
        if self.conn.lock().await.open {
            return Ok(());
        }
        let inbound = self.transport.connect().await?;
        self.conn.lock().await.open = true;

        let task = tokio::spawn(Self::read_frames(
            self.address().to_string(),
            inbound,
            Arc::clone(&self.conn),
            self.events.clone(),
        ));
        if let Some(old) = reader.replace(task) {
            old.abort();
        }
        info!("Connected to {}", self.address());
        let _ = self.events.send(ClientEvent::Open);
        Ok(())
    }

    async fn close(&self) {
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        self.transport.disconnect().await;
        Self::shutdown(self.address(), &self.conn, &self.events).await;
    }

    async fn is_open(&self) -> bool {
        self.conn.lock().await.open
    }

    async fn request(&self, method: RpcMethod) -> Result<RpcResult> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut conn = self.conn.lock().await;
            if !conn.open {
                return Err(BlockchainError::Disconnected);
            }
            conn.pending.insert(id, tx);
        }

        debug!("Sending {} request {id} to {}", method.name(), self.address());
        let sent = match (PeerMessage::Request { id, method }).to_frame() {
            Ok(frame) => self.transport.send(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.conn.lock().await.pending.remove(&id);
            return Err(e);
        }
        rx.await.map_err(|_| BlockchainError::Disconnected)?
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}
