//! # Actor Methods
//!
//! Method numbers and parameter types for the two builtin actors the
//! deal lifecycle talks to. Parameters are encoded with
//! [`types::encode`](crate::types::encode).

/// The storage market actor.
pub mod market {
    use serde::{Deserialize, Serialize};

    use smkt_core::{Address, ChainEpoch, Cid, DealId, PaddedPieceSize, TokenAmount};

    use crate::error::ChainError;
    use crate::types::MethodNum;

    /// Singleton address of the storage market actor.
    pub const ADDRESS: Address = Address::from_id(5);

    /// Deposit escrow for an address. Params: the beneficiary [`Address`].
    pub const ADD_BALANCE: MethodNum = 2;
    /// Withdraw unlocked escrow.
    pub const WITHDRAW_BALANCE: MethodNum = 3;
    /// Publish signed deals. Params: [`PublishStorageDealsParams`].
    pub const PUBLISH_STORAGE_DEALS: MethodNum = 4;

    /// Immutable terms of a storage deal.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DealProposal {
        /// Commitment of the piece to store.
        pub piece_cid: Cid,
        /// Padded size of the piece.
        pub piece_size: PaddedPieceSize,
        /// Whether the client is using verified data cap.
        pub verified_deal: bool,
        /// Paying party.
        pub client: Address,
        /// Storing party.
        pub provider: Address,
        /// Free-form client label.
        pub label: String,
        /// Epoch by which the sector holding the piece must be proven.
        pub start_epoch: ChainEpoch,
        /// Epoch at which the deal expires.
        pub end_epoch: ChainEpoch,
        /// Price per epoch for the whole piece.
        pub storage_price_per_epoch: TokenAmount,
        /// Collateral the provider locks.
        pub provider_collateral: TokenAmount,
        /// Collateral the client locks.
        pub client_collateral: TokenAmount,
    }

    impl DealProposal {
        /// Deal length in epochs.
        pub fn duration(&self) -> ChainEpoch {
            self.end_epoch - self.start_epoch
        }

        /// Total price over the deal's duration.
        pub fn total_storage_fee(&self) -> TokenAmount {
            let epochs = u64::try_from(self.duration()).unwrap_or(0);
            self.storage_price_per_epoch.mul(epochs)
        }

        /// Escrow the client must have available.
        pub fn client_balance_requirement(&self) -> TokenAmount {
            self.client_collateral + self.total_storage_fee()
        }

        /// Escrow the provider must have available.
        pub fn provider_balance_requirement(&self) -> TokenAmount {
            self.provider_collateral
        }

        /// The proposal reference both parties compute independently.
        pub fn cid(&self) -> Result<Cid, ChainError> {
            Ok(Cid::of(self)?)
        }
    }

    /// A proposal with the client's signature.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClientDealProposal {
        /// The terms.
        pub proposal: DealProposal,
        /// Client signature over the canonical proposal bytes.
        pub client_signature: Vec<u8>,
    }

    impl ClientDealProposal {
        /// Cid of the inner proposal.
        pub fn proposal_cid(&self) -> Result<Cid, ChainError> {
            self.proposal.cid()
        }
    }

    /// Parameters of [`PUBLISH_STORAGE_DEALS`].
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PublishStorageDealsParams {
        /// Deals to publish, all from one provider.
        pub deals: Vec<ClientDealProposal>,
    }

    /// Return value of [`PUBLISH_STORAGE_DEALS`].
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PublishStorageDealsReturn {
        /// On-chain ids, in the order the deals were submitted.
        pub ids: Vec<DealId>,
    }
}

/// The storage miner actor.
pub mod miner {
    use serde::{Deserialize, Serialize};

    use smkt_core::{ChainEpoch, Cid, DealId, RegisteredProof, SectorNumber};

    use crate::types::MethodNum;

    /// Pre-commit a sector. Params: [`SectorPreCommitInfo`].
    pub const PRE_COMMIT_SECTOR: MethodNum = 6;
    /// Prove a pre-committed sector. Params: [`ProveCommitSectorParams`].
    pub const PROVE_COMMIT_SECTOR: MethodNum = 7;

    /// Parameters of [`PRE_COMMIT_SECTOR`].
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SectorPreCommitInfo {
        /// Seal proof type.
        pub seal_proof: RegisteredProof,
        /// Sector being committed.
        pub sector_number: SectorNumber,
        /// Replica commitment.
        pub sealed_cid: Cid,
        /// Epoch of the seal randomness.
        pub seal_rand_epoch: ChainEpoch,
        /// Deals packed in the sector.
        pub deal_ids: Vec<DealId>,
        /// Sector expiration.
        pub expiration: ChainEpoch,
    }

    /// Parameters of [`PROVE_COMMIT_SECTOR`].
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ProveCommitSectorParams {
        /// Sector being proven.
        pub sector_number: SectorNumber,
        /// Opaque seal proof.
        pub proof: Vec<u8>,
    }
}

#[cfg(test)]
mod tests {
    use super::market::DealProposal;
    use smkt_core::{Address, Cid, PaddedPieceSize, TokenAmount};

    fn proposal() -> DealProposal {
        DealProposal {
            piece_cid: Cid::digest(b"piece"),
            piece_size: PaddedPieceSize::new(2048).unwrap(),
            verified_deal: false,
            client: Address::from_id(100),
            provider: Address::from_id(1000),
            label: "demo".into(),
            start_epoch: 100,
            end_epoch: 1100,
            storage_price_per_epoch: TokenAmount::from_atto(3),
            provider_collateral: TokenAmount::from_atto(50),
            client_collateral: TokenAmount::from_atto(7),
        }
    }

    #[test]
    fn fees_and_requirements() {
        let p = proposal();
        assert_eq!(p.duration(), 1000);
        assert_eq!(p.total_storage_fee().atto(), 3000);
        assert_eq!(p.client_balance_requirement().atto(), 3007);
        assert_eq!(p.provider_balance_requirement().atto(), 50);
    }

    #[test]
    fn negative_duration_costs_nothing() {
        let mut p = proposal();
        p.end_epoch = 50;
        assert!(p.total_storage_fee().is_zero());
    }

    #[test]
    fn proposal_cid_is_stable_and_term_sensitive() {
        let p = proposal();
        assert_eq!(p.cid().unwrap(), proposal().cid().unwrap());
        let mut q = proposal();
        q.label = "other".into();
        assert_ne!(p.cid().unwrap(), q.cid().unwrap());
    }
}
