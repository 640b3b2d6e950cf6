// Peer RPC envelope.
// One frame carries one `PeerMessage`. Requests and responses share a correlation id chosen
// by the requesting side; unsolicited events carry none. Blocks and transactions travel as
// their consensus encoding so a relayed block is byte-identical to the one that was minted.

use crate::core::{Balance, Bond};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes a server answers with
pub mod codes {
    pub const INVALID_PARAMS: &str = "invalid_params";
    pub const RANGE_OUTSIDE_HEIGHT: &str = "range_outside_height";
    pub const TX_REJECTED: &str = "tx_rejected";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RpcMethod {
    GetProperties,
    GetBlock { height: u64 },
    GetBlockRange { min: u64, max: u64 },
    GetBalance { address: String },
    GetTotalFee { address: String },
    Broadcast { tx: Vec<u8> },
    SubscribeBlock,
}

impl RpcMethod {
    pub fn name(&self) -> &'static str {
        match self {
            RpcMethod::GetProperties => "get_properties",
            RpcMethod::GetBlock { .. } => "get_block",
            RpcMethod::GetBlockRange { .. } => "get_block_range",
            RpcMethod::GetBalance { .. } => "get_balance",
            RpcMethod::GetTotalFee { .. } => "get_total_fee",
            RpcMethod::Broadcast { .. } => "broadcast",
            RpcMethod::SubscribeBlock => "subscribe_block",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BondInfo {
    pub minter: String,
    pub staker: String,
    pub stake_amt: String,
}

impl From<&Bond> for BondInfo {
    fn from(bond: &Bond) -> Self {
        BondInfo {
            minter: bond.minter.to_wif(),
            staker: bond.staker.to_wif(),
            stake_amt: bond.stake_amt.to_string(),
        }
    }
}

/// Per-symbol amounts in canonical text form
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub gold: String,
    pub silver: String,
}

impl From<&Balance> for BalanceInfo {
    fn from(balance: &Balance) -> Self {
        BalanceInfo {
            gold: balance.gold.to_string(),
            silver: balance.silver.to_string(),
        }
    }
}

impl BalanceInfo {
    pub fn to_balance(&self) -> Result<Balance> {
        Balance::new(self.gold.parse()?, self.silver.parse()?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Properties {
    /// `None` until the node has a genesis block
    pub height: Option<u64>,
    pub head_hash: Option<String>,
    pub token_supply: BalanceInfo,
    pub bonds: Vec<BondInfo>,
    pub block_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RpcResult {
    Properties(Properties),
    /// Encoded `SignedBlock`, absent past the head
    Block(Option<Vec<u8>>),
    BlockRange(Vec<Vec<u8>>),
    Balance(BalanceInfo),
    TotalFee(BalanceInfo),
    Broadcast,
    Subscribed,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcError {
    pub fn new(code: &str, message: impl Into<String>) -> RpcError {
        RpcError {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<RpcError> for BlockchainError {
    fn from(err: RpcError) -> Self {
        BlockchainError::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum PeerEvent {
    Block(Vec<u8>),
    Tx(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum PeerMessage {
    Request {
        id: u64,
        method: RpcMethod,
    },
    Response {
        id: u64,
        result: std::result::Result<RpcResult, RpcError>,
    },
    Event(PeerEvent),
}

impl PeerMessage {
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn from_frame(frame: &[u8]) -> Result<PeerMessage> {
        deserialize(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_frame_keeps_error() {
        let message = PeerMessage::Response {
            id: 42,
            result: Err(RpcError::new(codes::RANGE_OUTSIDE_HEIGHT, "max 12 > height 10")),
        };
        let decoded = PeerMessage::from_frame(&message.to_frame().unwrap()).unwrap();
        assert_eq!(decoded, message);

        let err: BlockchainError = match decoded {
            PeerMessage::Response { result: Err(e), .. } => e.into(),
            other => panic!("unexpected {other:?}"),
        };
        assert!(matches!(err, BlockchainError::Rpc { ref code, .. } if code == "range_outside_height"));
    }

    #[test]
    fn test_garbage_frame_rejected() {
        assert!(PeerMessage::from_frame(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_balance_info_parses_back() {
        let info = BalanceInfo {
            gold: "1.5 GOLD".to_string(),
            silver: "0 SILVER".to_string(),
        };
        let balance = info.to_balance().unwrap();
        assert_eq!(BalanceInfo::from(&balance), info);
        let wrong = BalanceInfo {
            gold: "1 SILVER".to_string(),
            silver: "0 SILVER".to_string(),
        };
        assert!(wrong.to_balance().is_err());
    }
}
