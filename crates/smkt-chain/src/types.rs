//! # Chain Data Types
//!
//! The subset of chain structures the market reads: tipsets and their
//! blocks, head-change notifications, unsigned messages and their
//! receipts, miner info and market escrow balances.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use smkt_core::{Address, ChainEpoch, Cid, PeerId, RegisteredProof, TokenAmount};

use crate::error::ChainError;

/// An actor method number.
pub type MethodNum = u64;

/// The set of block cids identifying a tipset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TipsetKey(pub Vec<Cid>);

/// A block header. Only the fields the market reads are modelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// The miner that produced the block.
    pub miner: Address,
    /// The block's epoch.
    pub height: ChainEpoch,
    /// Cids of the messages included in the block.
    pub messages: Vec<Cid>,
}

impl BlockHeader {
    /// Content identifier of the header.
    pub fn cid(&self) -> Result<Cid, ChainError> {
        Ok(Cid::of(self)?)
    }
}

/// A set of blocks at one height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tipset {
    /// The tipset epoch.
    pub height: ChainEpoch,
    /// Blocks in the tipset.
    pub blocks: Vec<BlockHeader>,
}

impl Tipset {
    /// The key of the tipset: the cids of its blocks.
    pub fn key(&self) -> Result<TipsetKey, ChainError> {
        self.blocks
            .iter()
            .map(BlockHeader::cid)
            .collect::<Result<Vec<_>, _>>()
            .map(TipsetKey)
    }
}

/// Direction of a head change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadChangeType {
    /// The current head, sent once on subscription.
    Current,
    /// A tipset was applied to the canonical chain.
    Apply,
    /// A tipset was reverted from the canonical chain.
    Revert,
}

/// One entry of a head-change notification batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadChange {
    /// Apply, revert or current.
    pub kind: HeadChangeType,
    /// The affected tipset.
    pub tipset: Tipset,
}

/// A message as executed by the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedMessage {
    /// Receiving actor.
    pub to: Address,
    /// Sending account.
    pub from: Address,
    /// Sender nonce.
    pub nonce: u64,
    /// Tokens transferred with the call.
    pub value: TokenAmount,
    /// Invoked method.
    pub method: MethodNum,
    /// Encoded method parameters.
    pub params: Vec<u8>,
}

impl UnsignedMessage {
    /// Content identifier of the message.
    pub fn cid(&self) -> Result<Cid, ChainError> {
        Ok(Cid::of(self)?)
    }

    /// Decode the method parameters.
    pub fn decode_params<T: DeserializeOwned>(&self) -> Result<T, ChainError> {
        decode(self.method, &self.params)
    }
}

/// Encode method parameters or return values.
pub fn encode<T: Serialize>(method: MethodNum, value: &T) -> Result<Vec<u8>, ChainError> {
    serde_json::to_vec(value).map_err(|e| ChainError::Codec {
        method,
        reason: e.to_string(),
    })
}

/// Decode method parameters or return values.
pub fn decode<T: DeserializeOwned>(method: MethodNum, bytes: &[u8]) -> Result<T, ChainError> {
    serde_json::from_slice(bytes).map_err(|e| ChainError::Codec {
        method,
        reason: e.to_string(),
    })
}

/// Exit code of an executed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExitCode(pub u32);

impl ExitCode {
    /// Successful execution.
    pub const OK: ExitCode = ExitCode(0);
    /// The actor rejected an argument.
    pub const ILLEGAL_ARGUMENT: ExitCode = ExitCode(16);
    /// The sender could not cover the call.
    pub const INSUFFICIENT_FUNDS: ExitCode = ExitCode(19);

    /// Whether the message succeeded.
    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of an executed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    /// Exit code.
    pub exit_code: ExitCode,
    /// Encoded return value.
    pub return_value: Vec<u8>,
    /// Gas consumed.
    pub gas_used: i64,
}

/// Where and how a message landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgLookup {
    /// The message.
    pub message: Cid,
    /// Its receipt.
    pub receipt: MessageReceipt,
    /// The tipset the message was executed in.
    pub tipset: TipsetKey,
    /// Height of that tipset.
    pub height: ChainEpoch,
}

/// Miner actor information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerInfo {
    /// Owner account.
    pub owner: Address,
    /// Worker account that signs the miner's messages.
    pub worker: Address,
    /// Network identity advertised on chain.
    pub peer_id: Option<PeerId>,
    /// Proof type of the miner's sectors.
    pub seal_proof: RegisteredProof,
}

impl MinerInfo {
    /// Sector size in bytes.
    pub fn sector_size(&self) -> u64 {
        self.seal_proof.sector_size()
    }
}

/// Escrow balance of a participant in the storage market actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketBalance {
    /// Total escrowed funds.
    pub escrow: TokenAmount,
    /// Funds locked by active or pending deals.
    pub locked: TokenAmount,
}

impl MarketBalance {
    /// Escrow not locked by deals.
    pub fn available(&self) -> TokenAmount {
        self.escrow - self.locked
    }
}
