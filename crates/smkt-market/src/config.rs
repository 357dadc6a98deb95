//! Provider and client configuration.
//!
//! Both load from `SMKT_*` environment variables with defaults suited to
//! a local test network. Explicit construction is the norm in tests.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use smkt_core::{Address, ChainEpoch, PaddedPieceSize, PeerId, PeerInfo, RegisteredProof, TokenAmount};

use crate::error::ConfigError;

/// Default interval between engine ticks.
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

/// Configuration of a storage provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Miner actor address.
    pub actor: Address,
    /// Network identity announced to clients.
    pub peer: PeerInfo,
    /// Proof type used to compute piece commitments.
    pub seal_proof: RegisteredProof,
    /// Interval between engine ticks.
    pub tick_interval: Duration,
    /// Initial ask price per GiB per epoch.
    pub ask_price: TokenAmount,
    /// Initial ask price per GiB per epoch for verified deals.
    pub ask_verified_price: TokenAmount,
    /// Epochs an ask stays valid.
    pub ask_duration: ChainEpoch,
    /// Smallest accepted padded piece.
    pub min_piece_size: PaddedPieceSize,
    /// Largest accepted padded piece.
    pub max_piece_size: PaddedPieceSize,
    /// Directory for staged pieces. `None` keeps them in memory.
    pub staging_dir: Option<PathBuf>,
}

impl ProviderConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables:
    /// - `SMKT_PROVIDER_ADDRESS` (default: `t01000`)
    /// - `SMKT_PROVIDER_PEER_ID` (default: `provider`)
    /// - `SMKT_PROVIDER_LISTEN` (default: `/memory/provider`)
    /// - `SMKT_SEAL_PROOF` (default: `StackedDrg2KiBV1`)
    /// - `SMKT_TICK_MS` (default: 50)
    /// - `SMKT_ASK_PRICE` (default: 0)
    /// - `SMKT_ASK_VERIFIED_PRICE` (default: 0)
    /// - `SMKT_ASK_DURATION` (default: 100000)
    /// - `SMKT_MIN_PIECE_SIZE` (default: 256)
    /// - `SMKT_MAX_PIECE_SIZE` (default: sector size of the proof)
    /// - `SMKT_STAGING_DIR` (default: unset, in-memory staging)
    pub fn from_env() -> Result<Self, ConfigError> {
        let seal_proof: RegisteredProof = env_parse("SMKT_SEAL_PROOF", RegisteredProof::StackedDrg2KiBV1)?;
        let peer_id = PeerId::new(env_or("SMKT_PROVIDER_PEER_ID", "provider"))?;
        Ok(Self {
            actor: env_parse("SMKT_PROVIDER_ADDRESS", Address::from_id(1000))?,
            peer: PeerInfo::new(peer_id, env_or("SMKT_PROVIDER_LISTEN", "/memory/provider")),
            seal_proof,
            tick_interval: Duration::from_millis(env_parse("SMKT_TICK_MS", 50u64)?),
            ask_price: env_parse("SMKT_ASK_PRICE", TokenAmount::ZERO)?,
            ask_verified_price: env_parse("SMKT_ASK_VERIFIED_PRICE", TokenAmount::ZERO)?,
            ask_duration: env_parse("SMKT_ASK_DURATION", 100_000)?,
            min_piece_size: PaddedPieceSize::new(env_parse("SMKT_MIN_PIECE_SIZE", 256u64)?)?,
            max_piece_size: PaddedPieceSize::new(env_parse(
                "SMKT_MAX_PIECE_SIZE",
                seal_proof.sector_size(),
            )?)?,
            staging_dir: std::env::var("SMKT_STAGING_DIR").ok().map(PathBuf::from),
        })
    }

    /// A configuration for `actor` with in-memory staging and a fast tick.
    pub fn local(actor: Address, peer: PeerInfo) -> Result<Self, ConfigError> {
        let seal_proof = RegisteredProof::StackedDrg2KiBV1;
        Ok(Self {
            actor,
            peer,
            seal_proof,
            tick_interval: Duration::from_millis(10),
            ask_price: TokenAmount::ZERO,
            ask_verified_price: TokenAmount::ZERO,
            ask_duration: 100_000,
            min_piece_size: PaddedPieceSize::new(128)?,
            max_piece_size: PaddedPieceSize::new(seal_proof.sector_size())?,
            staging_dir: None,
        })
    }
}

/// Configuration of a storage client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client account that pays for deals.
    pub address: Address,
    /// Wallet that funds escrow top-ups.
    pub wallet: Address,
    /// Network identity.
    pub peer: PeerInfo,
    /// Proof type used to compute piece commitments.
    pub seal_proof: RegisteredProof,
    /// Interval between engine ticks.
    pub tick_interval: Duration,
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables:
    /// - `SMKT_CLIENT_ADDRESS` (default: `t0100`)
    /// - `SMKT_CLIENT_WALLET` (default: the client address)
    /// - `SMKT_CLIENT_PEER_ID` (default: `client`)
    /// - `SMKT_SEAL_PROOF` (default: `StackedDrg2KiBV1`)
    /// - `SMKT_TICK_MS` (default: 50)
    pub fn from_env() -> Result<Self, ConfigError> {
        let address = env_parse("SMKT_CLIENT_ADDRESS", Address::from_id(100))?;
        let peer_id = PeerId::new(env_or("SMKT_CLIENT_PEER_ID", "client"))?;
        Ok(Self {
            address,
            wallet: env_parse("SMKT_CLIENT_WALLET", address)?,
            peer: PeerInfo::new(peer_id, "/memory/client"),
            seal_proof: env_parse("SMKT_SEAL_PROOF", RegisteredProof::StackedDrg2KiBV1)?,
            tick_interval: Duration::from_millis(env_parse("SMKT_TICK_MS", 50u64)?),
        })
    }

    /// A configuration for `address` paying from its own wallet.
    pub fn local(address: Address, peer: PeerInfo) -> Self {
        Self {
            address,
            wallet: address,
            peer,
            seal_proof: RegisteredProof::StackedDrg2KiBV1,
            tick_interval: Duration::from_millis(10),
        }
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(var.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_uses_default_when_var_absent() {
        let v: u64 = env_parse("SMKT_NONEXISTENT_VAR_4821", 7).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn env_parse_rejects_malformed_value() {
        std::env::set_var("SMKT_TEST_BAD_ADDRESS", "not-an-address");
        let result: Result<Address, _> = env_parse("SMKT_TEST_BAD_ADDRESS", Address::from_id(1));
        std::env::remove_var("SMKT_TEST_BAD_ADDRESS");
        assert!(matches!(result, Err(ConfigError::Invalid(var, _)) if var == "SMKT_TEST_BAD_ADDRESS"));
    }

    #[test]
    fn local_provider_config_accepts_whole_sector() {
        let peer = PeerInfo::new(PeerId::new("p").unwrap(), "/memory/p");
        let cfg = ProviderConfig::local(Address::from_id(1000), peer).unwrap();
        assert_eq!(cfg.max_piece_size.bytes(), 2048);
        assert!(cfg.staging_dir.is_none());
    }

    #[test]
    fn local_client_config_pays_from_own_wallet() {
        let peer = PeerInfo::new(PeerId::new("c").unwrap(), "/memory/c");
        let cfg = ClientConfig::local(Address::from_id(100), peer);
        assert_eq!(cfg.wallet, cfg.address);
    }
}
