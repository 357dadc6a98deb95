//! Deal status shared by the provider and client charts.

use serde::{Deserialize, Serialize};
use smkt_fsm::MachineState;

/// The state of a storage deal.
///
/// Provider and client charts draw their states from this one enum so a
/// response can name the sender's state. The three client-only states
/// never appear in the provider chart, and the provider-only states never
/// appear in the client chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageDealStatus {
    /// Registered, nothing dispatched yet.
    Unknown,
    /// Client: making sure its escrow covers the deal.
    EnsureClientFunds,
    /// Client: waiting for its escrow top-up to land.
    ClientFunding,
    /// Client: escrow sufficient, proposal being sent.
    FundsEnsured,
    /// Provider: checking the proposal. Client: waiting for the decision.
    Validating,
    /// Provider accepted the proposal.
    ProposalAccepted,
    /// Waiting for the client to import data out of band.
    WaitingForData,
    /// Pulling the payload from the client.
    Transferring,
    /// Checking the received piece against the proposal.
    VerifyData,
    /// Making sure the provider's collateral covers the deal.
    EnsureProviderFunds,
    /// Waiting for the collateral top-up to land.
    ProviderFunding,
    /// Broadcasting the publish message.
    Publish,
    /// Waiting for the publish message to land.
    Publishing,
    /// Published on chain, handing the piece to sealing.
    Staged,
    /// Waiting for the sector to be proven on chain.
    Sealing,
    /// The sector holding the deal is proven.
    Active,
    /// Finished successfully.
    Completed,
    /// Recording a failure and notifying the counter-party.
    Failing,
    /// Finished with an error.
    Error,
}

impl StorageDealStatus {
    /// Every status, in chart order.
    pub const ALL: [StorageDealStatus; 19] = [
        Self::Unknown,
        Self::EnsureClientFunds,
        Self::ClientFunding,
        Self::FundsEnsured,
        Self::Validating,
        Self::ProposalAccepted,
        Self::WaitingForData,
        Self::Transferring,
        Self::VerifyData,
        Self::EnsureProviderFunds,
        Self::ProviderFunding,
        Self::Publish,
        Self::Publishing,
        Self::Staged,
        Self::Sealing,
        Self::Active,
        Self::Completed,
        Self::Failing,
        Self::Error,
    ];

    /// Returns the canonical status name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::EnsureClientFunds => "ENSURE_CLIENT_FUNDS",
            Self::ClientFunding => "CLIENT_FUNDING",
            Self::FundsEnsured => "FUNDS_ENSURED",
            Self::Validating => "VALIDATING",
            Self::ProposalAccepted => "PROPOSAL_ACCEPTED",
            Self::WaitingForData => "WAITING_FOR_DATA",
            Self::Transferring => "TRANSFERRING",
            Self::VerifyData => "VERIFY_DATA",
            Self::EnsureProviderFunds => "ENSURE_PROVIDER_FUNDS",
            Self::ProviderFunding => "PROVIDER_FUNDING",
            Self::Publish => "PUBLISH",
            Self::Publishing => "PUBLISHING",
            Self::Staged => "STAGED",
            Self::Sealing => "SEALING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failing => "FAILING",
            Self::Error => "ERROR",
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether a counter-party reporting this status has given up on the deal.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failing | Self::Error)
    }
}

impl std::fmt::Display for StorageDealStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl MachineState for StorageDealStatus {
    fn is_terminal(&self) -> bool {
        StorageDealStatus::is_terminal(self)
    }
}
