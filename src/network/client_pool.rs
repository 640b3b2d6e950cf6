use crate::core::{Balance, SignedBlock, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{PeerEvent, Properties, RpcMethod, RpcResult};
use crate::network::peer::{ClientEvent, Peer};
use crate::utils::{Decode, Encode};
use crate::wallet::PublicKey;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

const POOL_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// The active peer (re)connected
    Open,
    /// The active peer went away
    Close,
    Block(SignedBlock),
    Tx(Transaction),
}

/// Failover set of upstream peers.
///
/// Requests go to the active peer; a transient failure moves on to the next one, and
/// [`BlockchainError::EndOfClients`] is returned once every peer has failed the request.
/// Only the active peer's block and transaction notifications are passed on.
pub struct ClientPeerPool {
    peers: Vec<Arc<dyn Peer>>,
    active: Mutex<Option<usize>>,
    reconnect_delay: Duration,
    events: broadcast::Sender<PoolEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientPeerPool {
    pub fn new(peers: Vec<Arc<dyn Peer>>, reconnect_delay: Duration) -> ClientPeerPool {
        let (events, _) = broadcast::channel(POOL_EVENT_CAPACITY);
        ClientPeerPool {
            peers,
            active: Mutex::new(None),
            reconnect_delay,
            events,
            tasks: Mutex::new(vec![]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub async fn active_address(&self) -> Option<String> {
        let active = *self.active.lock().await;
        active.map(|idx| self.peers[idx].address().to_string())
    }

    /// Starts watching every peer and connects to the first reachable one.
    ///
    /// An empty pool starts without error; otherwise `EndOfClients` means no peer answered.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut tasks = self.tasks.lock().await;
            if tasks.is_empty() {
                for idx in 0..self.peers.len() {
                    let events = self.peers[idx].subscribe();
                    tasks.push(tokio::spawn(Arc::clone(self).watch(idx, events)));
                }
            }
        }
        if self.peers.is_empty() {
            return Ok(());
        }
        self.connect_any(0).await.map(|_| ())
    }

    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        for peer in &self.peers {
            peer.close().await;
        }
        *self.active.lock().await = None;
    }

    // Tries each peer once starting at `first`; the one that opens becomes active
    async fn connect_any(&self, first: usize) -> Result<usize> {
        let count = self.peers.len();
        for offset in 0..count {
            let idx = (first + offset) % count;
            if self.activate(idx).await.is_ok() {
                return Ok(idx);
            }
        }
        *self.active.lock().await = None;
        Err(BlockchainError::EndOfClients)
    }

    async fn activate(&self, idx: usize) -> Result<()> {
        let peer = &self.peers[idx];
        // Marked active first so the watcher forwards the `Open` it is about to see
        let previous = self.active.lock().await.replace(idx);
        if peer.is_open().await {
            return Ok(());
        }
        match peer.open().await {
            Ok(()) => {
                if previous != Some(idx) {
                    info!("Active peer is now {}", peer.address());
                }
                Ok(())
            }
            Err(e) => {
                warn!("Could not connect to {}: {e}", peer.address());
                Err(e)
            }
        }
    }

    async fn is_active(&self, idx: usize) -> bool {
        *self.active.lock().await == Some(idx)
    }

    async fn watch(self: Arc<Self>, idx: usize, mut events: broadcast::Receiver<ClientEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {skipped} event(s) from {}", self.peers[idx].address());
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            match event {
                ClientEvent::Open => {
                    if let Err(e) = self.peers[idx].request(RpcMethod::SubscribeBlock).await {
                        warn!("Subscription to {} failed: {e}", self.peers[idx].address());
                    }
                    if self.is_active(idx).await {
                        let _ = self.events.send(PoolEvent::Open);
                    }
                }
                ClientEvent::Close => {
                    if self.is_active(idx).await {
                        let _ = self.events.send(PoolEvent::Close);
                        let pool = Arc::clone(&self);
                        tokio::spawn(async move { pool.reconnect(idx).await });
                    }
                }
                ClientEvent::Event(event) => {
                    if !self.is_active(idx).await {
                        continue;
                    }
                    if let Some(event) = self.decode_event(idx, event) {
                        let _ = self.events.send(event);
                    }
                }
            }
        }
    }

    fn decode_event(&self, idx: usize, event: PeerEvent) -> Option<PoolEvent> {
        let decoded = match event {
            PeerEvent::Block(bytes) => SignedBlock::from_bytes(&bytes).map(PoolEvent::Block),
            PeerEvent::Tx(bytes) => Transaction::from_bytes(&bytes).map(PoolEvent::Tx),
        };
        match decoded {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Undecodable event from {}: {e}", self.peers[idx].address());
                None
            }
        }
    }

    // Keeps cycling through the peers until one accepts a connection
    async fn reconnect(&self, lost: usize) {
        loop {
            tokio::time::sleep(self.reconnect_delay).await;
            if self.tasks.lock().await.is_empty() {
                return;
            }
            let active = *self.active.lock().await;
            if active.is_some() && active != Some(lost) {
                return;
            }
            match self.connect_any(lost).await {
                Ok(idx) => {
                    debug!("Reconnected through {}", self.peers[idx].address());
                    return;
                }
                Err(_) => warn!(
                    "No peer reachable, retrying in {:?}",
                    self.reconnect_delay
                ),
            }
        }
    }

    /// Sends `method` to the active peer, failing over on transient errors
    pub async fn request(&self, method: RpcMethod) -> Result<RpcResult> {
        let count = self.peers.len();
        if count == 0 {
            return Err(BlockchainError::EndOfClients);
        }
        let first = self.active.lock().await.unwrap_or(0);
        for offset in 0..count {
            let idx = (first + offset) % count;
            let peer = &self.peers[idx];
            if !peer.is_open().await && self.activate(idx).await.is_err() {
                continue;
            }
            match peer.request(method.clone()).await {
                Ok(result) => {
                    if !self.is_active(idx).await {
                        *self.active.lock().await = Some(idx);
                    }
                    return Ok(result);
                }
                Err(e) if e.is_transient() => {
                    warn!("{} to {} failed: {e}", method.name(), peer.address());
                }
                Err(e) => return Err(e),
            }
        }
        Err(BlockchainError::EndOfClients)
    }

    pub async fn get_properties(&self) -> Result<Properties> {
        match self.request(RpcMethod::GetProperties).await? {
            RpcResult::Properties(props) => Ok(props),
            other => Err(unexpected("get_properties", &other)),
        }
    }

    pub async fn get_block(&self, height: u64) -> Result<Option<SignedBlock>> {
        match self.request(RpcMethod::GetBlock { height }).await? {
            RpcResult::Block(Some(bytes)) => SignedBlock::from_bytes(&bytes).map(Some),
            RpcResult::Block(None) => Ok(None),
            other => Err(unexpected("get_block", &other)),
        }
    }

    pub async fn get_block_range(&self, min: u64, max: u64) -> Result<Vec<SignedBlock>> {
        match self.request(RpcMethod::GetBlockRange { min, max }).await? {
            RpcResult::BlockRange(blocks) => blocks
                .iter()
                .map(|bytes| SignedBlock::from_bytes(bytes))
                .collect(),
            other => Err(unexpected("get_block_range", &other)),
        }
    }

    pub async fn get_balance(&self, key: &PublicKey) -> Result<Balance> {
        let address = key.to_wif();
        match self.request(RpcMethod::GetBalance { address }).await? {
            RpcResult::Balance(info) => info.to_balance(),
            other => Err(unexpected("get_balance", &other)),
        }
    }

    pub async fn get_total_fee(&self, key: &PublicKey) -> Result<Balance> {
        let address = key.to_wif();
        match self.request(RpcMethod::GetTotalFee { address }).await? {
            RpcResult::TotalFee(info) => info.to_balance(),
            other => Err(unexpected("get_total_fee", &other)),
        }
    }

    pub async fn broadcast(&self, tx: &Transaction) -> Result<()> {
        match self.request(RpcMethod::Broadcast { tx: tx.to_bytes() }).await? {
            RpcResult::Broadcast => Ok(()),
            other => Err(unexpected("broadcast", &other)),
        }
    }
}

fn unexpected(method: &str, result: &RpcResult) -> BlockchainError {
    BlockchainError::Network(format!("unexpected response to {method}: {result:?}"))
}
