//! Length-prefixed frames over TCP
//!
//! Each frame is a `u32` big-endian byte length followed by one encoded `PeerMessage`.

use crate::error::{BlockchainError, Result};
use crate::network::peer::{Transport, TransportEvent};
use crate::network::server::RpcServer;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const FRAME_CHANNEL_CAPACITY: usize = 1024;

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(BlockchainError::Network(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    let len = u32::try_from(frame.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| BlockchainError::Network(format!("frame of {} bytes is too large", frame.len())))?;
    writer.write_u32(len).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

pub struct TcpTransport {
    address: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>) -> TcpTransport {
        TcpTransport {
            address: address.into(),
            writer: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            BlockchainError::Network(format!("Failed to connect to {}: {e}", self.address))
        })?;
        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        let (events, inbound) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let address = self.address.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if events.send(TransportEvent::Frame(frame)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Read from {address} failed: {e}");
                        break;
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed).await;
        });
        Ok(inbound)
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(BlockchainError::Disconnected)?;
        if let Err(e) = write_frame(stream, &frame).await {
            *writer = None;
            return Err(BlockchainError::Network(format!(
                "Failed to send to {}: {e}",
                self.address
            )));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Accepts TCP clients on `addr` and serves them from `server`
pub async fn listen(server: Arc<RpcServer>, addr: &str) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;
    info!("Server listening on {addr}");

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {peer_addr}");
                    tokio::spawn(serve_connection(Arc::clone(&server), stream));
                }
                Err(e) => error!("Error accepting connection: {e}"),
            }
        }
    }))
}

async fn serve_connection(server: Arc<RpcServer>, stream: TcpStream) {
    let peer_addr = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
    let (mut reader, mut writer) = stream.into_split();
    let (outbound, mut to_write) = mpsc::channel::<Vec<u8>>(FRAME_CHANNEL_CAPACITY);
    let conn_id = server.accept(outbound).await;

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = to_write.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("Write to connection failed: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if let Err(e) = server.handle_frame(conn_id, &frame).await {
                    warn!("Bad request from {peer_addr}: {e}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Connection from {peer_addr} failed: {e}");
                break;
            }
        }
    }
    server.disconnect(conn_id).await;
    let _ = writer_task.await;
    debug!("Connection from {peer_addr} closed");
}
