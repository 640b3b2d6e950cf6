// Catch-up and live relay of network history.
// On start, and whenever the upstream connection is re-established, I pull block ranges
// from the peer pool until the local head matches the network height. Ranges are indexed
// with the relaxed SYNC skip flags, so blocks replayed here are trusted to have been
// validated by whoever first accepted them. After catch-up, block and transaction
// notifications from the active peer go through the producer and the pool like local ones.

use crate::core::{Blockchain, Producer, SignedBlock, SkipFlags, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::client_pool::{ClientPeerPool, PoolEvent};
use crate::storage::TxPool;
use crate::utils::Encode;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Blocks requested per range
pub const SYNC_BATCH_SIZE: u64 = 100;
/// Retries of one range during startup while the whole pool is unreachable.
/// Later catch-ups retry until a peer answers.
pub const MAX_RANGE_RETRIES: u32 = 10;

pub struct Synchronizer {
    chain: Arc<Blockchain>,
    pool: Arc<TxPool>,
    producer: Arc<Producer>,
    peers: Arc<ClientPeerPool>,
    retry_delay: Duration,
    // Held for a whole catch-up and for every relayed block
    lock: Mutex<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Synchronizer {
    pub fn new(
        chain: Arc<Blockchain>,
        pool: Arc<TxPool>,
        producer: Arc<Producer>,
        peers: Arc<ClientPeerPool>,
        retry_delay: Duration,
    ) -> Synchronizer {
        Synchronizer {
            chain,
            pool,
            producer,
            peers,
            retry_delay,
            lock: Mutex::new(()),
            listener: Mutex::new(None),
        }
    }

    /// Connects upstream, catches up and starts following the network.
    ///
    /// Any failure here aborts startup; later failures only restart the catch-up.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let events = self.peers.subscribe();
        self.peers.start().await?;
        self.sync_with_retries(Some(MAX_RANGE_RETRIES)).await?;

        let task = tokio::spawn(Arc::clone(self).listen(events));
        if let Some(old) = self.listener.lock().await.replace(task) {
            old.abort();
        }
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
        }
        self.peers.stop().await;
    }

    /// Pulls every block the network has beyond the local head.
    ///
    /// The producer is paused for the duration and restarted afterwards, even on failure.
    pub async fn sync(&self) -> Result<usize> {
        self.sync_with_retries(None).await
    }

    async fn sync_with_retries(&self, max_retries: Option<u32>) -> Result<usize> {
        let _guard = self.lock.lock().await;
        if self.peers.is_empty() {
            self.producer.start().await;
            return Ok(0);
        }

        self.producer.stop().await;
        let result = self.catch_up(max_retries).await;
        let reloaded = self.chain.reload_head().await;
        self.producer.start().await;

        let synced = result?;
        reloaded?;
        Ok(synced)
    }

    async fn catch_up(&self, max_retries: Option<u32>) -> Result<usize> {
        let target = match self.peers.get_properties().await?.height {
            Some(height) => height,
            None => {
                info!("Upstream has no genesis block yet, nothing to sync");
                return Ok(0);
            }
        };

        let mut synced = 0;
        let mut retries = 0;
        loop {
            let next = self.chain.get_chain_height().await.map_or(0, |h| h + 1);
            if next > target {
                break;
            }
            let max = (next + SYNC_BATCH_SIZE - 1).min(target);
            let blocks = match self.peers.get_block_range(next, max).await {
                Ok(blocks) => {
                    retries = 0;
                    blocks
                }
                Err(BlockchainError::EndOfClients)
                    if max_retries.map_or(true, |limit| retries < limit) =>
                {
                    retries += 1;
                    warn!(
                        "No peer served blocks {next}..={max}, retry {retries} in {:?}",
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if blocks.is_empty() {
                return Err(BlockchainError::Network(format!(
                    "peer returned no blocks for {next}..={max}"
                )));
            }
            synced += self.chain.index_blocks(blocks, SkipFlags::SYNC).await?;
            debug!("Synced up to block {max} of {target}");
        }

        if synced > 0 {
            info!("Synchronized {synced} block(s), height is now {target}");
        }
        Ok(synced)
    }

    async fn listen(self: Arc<Self>, mut events: broadcast::Receiver<PoolEvent>) {
        loop {
            match events.recv().await {
                Ok(PoolEvent::Block(block)) => self.handle_block(block).await,
                Ok(PoolEvent::Tx(tx)) => self.handle_tx(tx).await,
                Ok(PoolEvent::Open) => self.resync("upstream connection opened").await,
                Ok(PoolEvent::Close) => debug!("Upstream connection closed"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {skipped} network event(s)");
                    self.resync("event stream lagged").await;
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    async fn resync(&self, reason: &str) {
        debug!("Re-synchronizing: {reason}");
        if let Err(e) = self.sync().await {
            if e.is_fatal() {
                error!("Synchronization failed: {e}");
            } else {
                warn!("Synchronization failed, waiting for the next upstream event: {e}");
            }
        }
    }

    /// Applies a block relayed by the active peer
    pub async fn handle_block(&self, block: SignedBlock) {
        let guard = self.lock.lock().await;
        let next = self.chain.get_chain_height().await.map_or(0, |h| h + 1);
        let height = block.get_height();
        if height < next {
            debug!("Already have block {height}");
            return;
        }
        if height > next {
            drop(guard);
            self.resync(&format!("relayed block {height} is ahead of {next}"))
                .await;
            return;
        }

        match self.producer.handle_block(block).await {
            Ok(()) => info!("Accepted block {height} from the network"),
            Err(e) if e.is_fatal() => error!("Failed to store block {height}: {e}"),
            Err(e) => warn!("Rejected block {height}: {e}"),
        }
    }

    /// Queues a transaction relayed by the active peer
    pub async fn handle_tx(&self, tx: Transaction) {
        match self.pool.push(&tx.to_bytes()).await {
            Ok(tx) => debug!("Queued relayed transaction {}", tx.hash_hex()),
            Err(BlockchainError::DuplicateTransaction) => {}
            Err(e) => debug!("Dropped relayed transaction {}: {e}", tx.hash_hex()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProducerConfig;
    use crate::network::loopback::LoopbackTransport;
    use crate::network::message::{RpcMethod, RpcResult};
    use crate::network::peer::{ClientEvent, ClientPeer, Peer};
    use crate::network::server::RpcServer;
    use crate::testnet::test_utils::{
        empty_chain, extend_chain, extend_chain_with, genesis_chain, next_block, TestChain,
    };
    use crate::wallet::KeyPair;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Follower {
        chain: Arc<Blockchain>,
        sync: Arc<Synchronizer>,
        _dir: tempfile::TempDir,
    }

    // Fails a set number of range requests before passing them through
    struct FlakyPeer {
        inner: Arc<dyn Peer>,
        range_failures: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Peer for FlakyPeer {
        fn address(&self) -> &str {
            self.inner.address()
        }

        async fn open(&self) -> Result<()> {
            self.inner.open().await
        }

        async fn close(&self) {
            self.inner.close().await
        }

        async fn is_open(&self) -> bool {
            self.inner.is_open().await
        }

        async fn request(&self, method: RpcMethod) -> Result<RpcResult> {
            if let RpcMethod::GetBlockRange { .. } = method {
                let failing = self
                    .range_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(BlockchainError::Disconnected);
                }
            }
            self.inner.request(method).await
        }

        fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
            self.inner.subscribe()
        }
    }

    fn follow(upstream: &TestChain) -> (Follower, Arc<RpcServer>) {
        build_follower(upstream, |peer| peer)
    }

    fn follow_flaky(upstream: &TestChain) -> (Follower, Arc<AtomicU32>) {
        let range_failures = Arc::new(AtomicU32::new(0));
        let counter = range_failures.clone();
        let (follower, _server) = build_follower(upstream, move |inner| {
            Arc::new(FlakyPeer {
                inner,
                range_failures: counter,
            }) as Arc<dyn Peer>
        });
        (follower, range_failures)
    }

    fn build_follower(
        upstream: &TestChain,
        wrap: impl FnOnce(Arc<dyn Peer>) -> Arc<dyn Peer>,
    ) -> (Follower, Arc<RpcServer>) {
        let upstream_pool = Arc::new(TxPool::new(upstream.chain.clone(), 10));
        let server = Arc::new(RpcServer::new(
            upstream.chain.clone(),
            upstream_pool,
            Duration::from_secs(1),
        ));

        let (chain, dir) = empty_chain();
        let pool = Arc::new(TxPool::new(chain.clone(), 10));
        let producer = Arc::new(Producer::new(
            chain.clone(),
            pool.clone(),
            None,
            ProducerConfig {
                regtest: true,
                ..ProducerConfig::default()
            },
        ));
        let peer: Arc<dyn Peer> = Arc::new(ClientPeer::new(Arc::new(LoopbackTransport::new(
            server.clone(),
            "upstream",
        ))));
        let peer = wrap(peer);
        let peers = Arc::new(ClientPeerPool::new(vec![peer], Duration::from_millis(50)));
        let sync = Arc::new(Synchronizer::new(
            chain.clone(),
            pool,
            producer,
            peers,
            Duration::from_millis(10),
        ));
        (
            Follower {
                chain,
                sync,
                _dir: dir,
            },
            server,
        )
    }

    #[tokio::test]
    async fn test_catch_up_copies_history() {
        let upstream = genesis_chain("1 GOLD").await;
        // Longer than one range, stamped past the clock
        extend_chain_with(&upstream, 150, SkipFlags::SKIP_TIME).await;
        let (follower, _server) = follow(&upstream);

        follower.sync.start().await.unwrap();
        assert_eq!(follower.chain.get_chain_height().await, Some(150));
        assert_eq!(
            follower.chain.get_block(120).await.unwrap(),
            upstream.chain.get_block(120).await.unwrap()
        );
        assert_eq!(
            follower.chain.get_bonds().await,
            upstream.chain.get_bonds().await
        );
        follower.sync.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_pool_retries_the_same_range() {
        let upstream = genesis_chain("1 GOLD").await;
        extend_chain(&upstream, 5).await;
        let (follower, range_failures) = follow_flaky(&upstream);

        range_failures.store(3, Ordering::SeqCst);
        follower.sync.start().await.unwrap();
        assert_eq!(range_failures.load(Ordering::SeqCst), 0);
        assert_eq!(follower.chain.get_chain_height().await, Some(5));

        // After startup there is no retry limit
        extend_chain(&upstream, 3).await;
        range_failures.store(MAX_RANGE_RETRIES + 5, Ordering::SeqCst);
        assert_eq!(follower.sync.sync().await.unwrap(), 3);
        assert_eq!(range_failures.load(Ordering::SeqCst), 0);
        assert_eq!(
            follower.chain.get_block(8).await.unwrap(),
            upstream.chain.get_block(8).await.unwrap()
        );
        follower.sync.stop().await;
    }

    #[tokio::test]
    async fn test_startup_gives_up_after_retry_limit() {
        let upstream = genesis_chain("1 GOLD").await;
        let (follower, range_failures) = follow_flaky(&upstream);
        range_failures.store(MAX_RANGE_RETRIES + 1, Ordering::SeqCst);

        assert_eq!(
            follower.sync.start().await.unwrap_err(),
            BlockchainError::EndOfClients
        );
        assert_eq!(follower.chain.get_chain_height().await, None);
        follower.sync.stop().await;
    }

    #[tokio::test]
    async fn test_relayed_blocks_extend_or_trigger_resync() {
        let upstream = genesis_chain("1 GOLD").await;
        extend_chain(&upstream, 2).await;
        let (follower, _server) = follow(&upstream);
        follower.sync.start().await.unwrap();

        // Next block in line is applied directly
        extend_chain(&upstream, 1).await;
        let block = upstream.chain.get_block(3).await.unwrap().unwrap();
        follower.sync.handle_block(block.clone()).await;
        assert_eq!(follower.chain.get_chain_height().await, Some(3));

        // Replays are ignored
        follower.sync.handle_block(block).await;
        assert_eq!(follower.chain.get_chain_height().await, Some(3));

        // A gap makes the follower fetch what it missed
        extend_chain(&upstream, 2).await;
        let ahead = upstream.chain.get_block(5).await.unwrap().unwrap();
        follower.sync.handle_block(ahead).await;
        assert_eq!(follower.chain.get_chain_height().await, Some(5));
        follower.sync.stop().await;
    }

    #[tokio::test]
    async fn test_relayed_block_from_wrong_minter_is_rejected() {
        let upstream = genesis_chain("1 GOLD").await;
        let (follower, _server) = follow(&upstream);
        follower.sync.start().await.unwrap();

        let outsider = KeyPair::generate().unwrap();
        let head = upstream.chain.get_chain_head().await.unwrap();
        let forged = next_block(&upstream.chain, &outsider, vec![], head.get_timestamp() + 1).await;
        follower.sync.handle_block(forged).await;
        assert_eq!(follower.chain.get_chain_height().await, Some(0));
        follower.sync.stop().await;
    }
}
