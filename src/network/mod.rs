//! Peer-to-peer plumbing
//!
//! Nodes talk through a correlated request/response protocol (`message`) carried by a
//! pluggable frame transport (`peer`, with `loopback` and `tcp` implementations).
//! `server` answers requests from the local ledger, `client_pool` fails over between
//! upstream peers and `synchronizer` keeps the local chain caught up with them.

pub mod client_pool;
pub mod loopback;
pub mod message;
pub mod peer;
pub mod server;
pub mod synchronizer;
pub mod tcp;

pub use client_pool::{ClientPeerPool, PoolEvent};
pub use loopback::LoopbackTransport;
pub use message::{
    codes, BalanceInfo, BondInfo, PeerEvent, PeerMessage, Properties, RpcError, RpcMethod,
    RpcResult,
};
pub use peer::{ClientEvent, ClientPeer, Peer, Transport, TransportEvent};
pub use server::{RpcServer, MAX_BLOCK_RANGE};
pub use synchronizer::{Synchronizer, MAX_RANGE_RETRIES, SYNC_BATCH_SIZE};
pub use tcp::{listen, TcpTransport};
