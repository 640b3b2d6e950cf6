use crate::core::{Blockchain, SignedBlock, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{
    codes, BalanceInfo, BondInfo, PeerEvent, PeerMessage, Properties, RpcError, RpcMethod,
    RpcResult,
};
use crate::storage::TxPool;
use crate::utils::Encode;
use crate::wallet::PublicKey;
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

/// Largest span `get_block_range` serves in one response
pub const MAX_BLOCK_RANGE: u64 = 100;

struct Connection {
    outbound: mpsc::Sender<Vec<u8>>,
    subscribed: bool,
}

/// Serves the peer RPC methods for every connected client.
///
/// Transports hand inbound frames to [`RpcServer::handle_frame`] and drain the outbound
/// channel they registered with [`RpcServer::accept`]. Subscriptions belong to the
/// connection and disappear with it.
pub struct RpcServer {
    chain: Arc<Blockchain>,
    pool: Arc<TxPool>,
    block_interval: Duration,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<u64, Connection>>,
    relays: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcServer {
    pub fn new(chain: Arc<Blockchain>, pool: Arc<TxPool>, block_interval: Duration) -> RpcServer {
        RpcServer {
            chain,
            pool,
            block_interval,
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            relays: Mutex::new(vec![]),
        }
    }

    /// Starts relaying new blocks and admitted transactions to subscribers
    pub async fn start(self: &Arc<Self>) {
        let mut relays = self.relays.lock().await;
        if !relays.is_empty() {
            return;
        }
        let server = Arc::clone(self);
        let blocks = self.chain.subscribe();
        relays.push(tokio::spawn(async move {
            server
                .relay(blocks, |block: SignedBlock| PeerEvent::Block(block.to_bytes()))
                .await
        }));
        let server = Arc::clone(self);
        let txs = self.pool.subscribe();
        relays.push(tokio::spawn(async move {
            server
                .relay(txs, |tx: Transaction| PeerEvent::Tx(tx.to_bytes()))
                .await
        }));
        info!("RPC server started");
    }

    /// Stops relaying and drops every connection
    pub async fn stop(&self) {
        for relay in self.relays.lock().await.drain(..) {
            relay.abort();
        }
        self.close_all().await;
    }

    async fn relay<T: Clone>(
        &self,
        mut source: broadcast::Receiver<T>,
        to_event: impl Fn(T) -> PeerEvent,
    ) {
        loop {
            match source.recv().await {
                Ok(item) => self.publish(to_event(item)).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber relay lagged, {skipped} event(s) lost");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn publish(&self, event: PeerEvent) {
        let frame = match PeerMessage::Event(event).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode event: {e}");
                return;
            }
        };
        let targets: Vec<(u64, mpsc::Sender<Vec<u8>>)> = self
            .connections
            .lock()
            .await
            .iter()
            .filter(|(_, conn)| conn.subscribed)
            .map(|(id, conn)| (*id, conn.outbound.clone()))
            .collect();
        for (id, outbound) in targets {
            if outbound.try_send(frame.clone()).is_err() {
                warn!("Connection {id} is not keeping up, event dropped");
            }
        }
    }

    /// Registers a connection; frames for it are written to `outbound`
    pub async fn accept(&self, outbound: mpsc::Sender<Vec<u8>>) -> u64 {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().await.insert(
            id,
            Connection {
                outbound,
                subscribed: false,
            },
        );
        debug!("Accepted connection {id}");
        id
    }

    /// Forgets a connection along with its subscription
    pub async fn disconnect(&self, conn_id: u64) {
        if self.connections.lock().await.remove(&conn_id).is_some() {
            debug!("Connection {conn_id} closed");
        }
    }

    pub async fn close_all(&self) {
        let closed = self.connections.lock().await.drain().count();
        if closed > 0 {
            info!("Closed {closed} connection(s)");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .filter(|conn| conn.subscribed)
            .count()
    }

    /// Handles one inbound frame, answering requests on the connection's outbound channel
    pub async fn handle_frame(&self, conn_id: u64, frame: &[u8]) -> Result<()> {
        let (id, method) = match PeerMessage::from_frame(frame)? {
            PeerMessage::Request { id, method } => (id, method),
            other => {
                debug!("Connection {conn_id} sent a non-request frame: {other:?}");
                return Ok(());
            }
        };
        debug!("Connection {conn_id} requested {} ({id})", method.name());
        let result = self.dispatch(conn_id, method).await;
        let reply = PeerMessage::Response { id, result }.to_frame()?;

        let outbound = self
            .connections
            .lock()
            .await
            .get(&conn_id)
            .map(|conn| conn.outbound.clone())
            .ok_or(BlockchainError::Disconnected)?;
        outbound
            .send(reply)
            .await
            .map_err(|_| BlockchainError::Disconnected)
    }

    async fn dispatch(
        &self,
        conn_id: u64,
        method: RpcMethod,
    ) -> std::result::Result<RpcResult, RpcError> {
        let result = match method {
            RpcMethod::GetProperties => self.properties().await.map(RpcResult::Properties),
            RpcMethod::GetBlock { height } => self
                .chain
                .get_block(height)
                .await
                .map(|block| RpcResult::Block(block.map(|b| b.to_bytes()))),
            RpcMethod::GetBlockRange { min, max } => return self.block_range(min, max).await,
            RpcMethod::GetBalance { address } => {
                let key = parse_address(&address)?;
                self.chain
                    .get_balance(&key, &[])
                    .map(|balance| RpcResult::Balance(BalanceInfo::from(&balance)))
            }
            RpcMethod::GetTotalFee { address } => {
                let key = parse_address(&address)?;
                self.chain
                    .get_total_fee(&key)
                    .map(|fee| RpcResult::TotalFee(BalanceInfo::from(&fee)))
            }
            RpcMethod::Broadcast { tx } => {
                return match self.pool.push(&tx).await {
                    Ok(tx) => {
                        info!("Accepted broadcast transaction {}", tx.hash_hex());
                        Ok(RpcResult::Broadcast)
                    }
                    Err(e) => Err(RpcError::new(codes::TX_REJECTED, e.to_string())),
                };
            }
            RpcMethod::SubscribeBlock => {
                if let Some(conn) = self.connections.lock().await.get_mut(&conn_id) {
                    conn.subscribed = true;
                }
                Ok(RpcResult::Subscribed)
            }
        };
        result.map_err(|e| {
            warn!("Request from connection {conn_id} failed: {e}");
            RpcError::new(codes::INTERNAL_ERROR, e.to_string())
        })
    }

    async fn properties(&self) -> Result<Properties> {
        let head = self.chain.get_chain_head().await;
        let supply = self.chain.get_token_supply()?;
        let bonds = self.chain.get_bonds().await;
        Ok(Properties {
            height: head.as_ref().map(SignedBlock::get_height),
            head_hash: head.map(|h| HEXLOWER.encode(&h.hash())),
            token_supply: BalanceInfo::from(&supply),
            bonds: bonds.iter().map(BondInfo::from).collect(),
            block_interval_secs: self.block_interval.as_secs(),
        })
    }

    async fn block_range(&self, min: u64, max: u64) -> std::result::Result<RpcResult, RpcError> {
        if min > max || max - min >= MAX_BLOCK_RANGE {
            return Err(RpcError::new(
                codes::INVALID_PARAMS,
                format!("range {min}..={max} must be ordered and span at most {MAX_BLOCK_RANGE}"),
            ));
        }
        match self.chain.get_chain_height().await {
            Some(height) if max <= height => {}
            height => {
                return Err(RpcError::new(
                    codes::RANGE_OUTSIDE_HEIGHT,
                    format!("max {max} is past chain height {height:?}"),
                ))
            }
        }
        let blocks = self
            .chain
            .get_block_range(min, max)
            .await
            .map_err(|e| RpcError::new(codes::INTERNAL_ERROR, e.to_string()))?;
        Ok(RpcResult::BlockRange(
            blocks.iter().map(|block| block.to_bytes()).collect(),
        ))
    }
}

fn parse_address(address: &str) -> std::result::Result<PublicKey, RpcError> {
    PublicKey::from_wif(address).map_err(|e| RpcError::new(codes::INVALID_PARAMS, e.to_string()))
}
