//! In-process transport that plugs a [`ClientPeer`](crate::network::ClientPeer) straight
//! into an [`RpcServer`] without sockets. Used by tests and by several nodes sharing one
//! process.

use crate::error::{BlockchainError, Result};
use crate::network::peer::{Transport, TransportEvent};
use crate::network::server::RpcServer;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const LOOPBACK_CHANNEL_CAPACITY: usize = 1024;

struct Session {
    conn_id: u64,
    pump: JoinHandle<()>,
}

pub struct LoopbackTransport {
    server: Arc<RpcServer>,
    address: String,
    session: Mutex<Option<Session>>,
}

impl LoopbackTransport {
    pub fn new(server: Arc<RpcServer>, address: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            server,
            address: address.into(),
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            self.server.disconnect(old.conn_id).await;
            old.pump.abort();
        }

        let (outbound, mut from_server) = mpsc::channel(LOOPBACK_CHANNEL_CAPACITY);
        let conn_id = self.server.accept(outbound).await;
        let (to_client, inbound) = mpsc::channel(LOOPBACK_CHANNEL_CAPACITY);

        // Ends once the server drops the connection
        let pump = tokio::spawn(async move {
            while let Some(frame) = from_server.recv().await {
                if to_client.send(TransportEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }
            let _ = to_client.send(TransportEvent::Closed).await;
        });
        *session = Some(Session { conn_id, pump });
        Ok(inbound)
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        let conn_id = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.conn_id)
            .ok_or(BlockchainError::Disconnected)?;
        let server = Arc::clone(&self.server);
        // Served off the caller's task
        tokio::spawn(async move {
            if let Err(e) = server.handle_frame(conn_id, &frame).await {
                debug!("Loopback connection {conn_id} dropped a frame: {e}");
            }
        });
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            self.server.disconnect(session.conn_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{RpcMethod, RpcResult};
    use crate::network::peer::{ClientEvent, ClientPeer, Peer};
    use crate::storage::TxPool;
    use crate::testnet::test_utils::genesis_chain;
    use std::time::Duration;

    #[tokio::test]
    async fn test_server_close_rejects_and_emits_close() {
        let test = genesis_chain("1 GOLD").await;
        let pool = Arc::new(TxPool::new(test.chain.clone(), 10));
        let server = Arc::new(RpcServer::new(
            test.chain.clone(),
            pool,
            Duration::from_secs(3),
        ));
        let peer = ClientPeer::new(Arc::new(LoopbackTransport::new(server.clone(), "node-a")));
        let mut events = peer.subscribe();
        peer.open().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Open);

        match peer.request(RpcMethod::GetProperties).await.unwrap() {
            RpcResult::Properties(props) => assert_eq!(props.height, Some(0)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.connection_count().await, 1);

        server.close_all().await;
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Close);
        assert_eq!(
            peer.request(RpcMethod::GetProperties).await.unwrap_err(),
            BlockchainError::Disconnected
        );
    }
}
