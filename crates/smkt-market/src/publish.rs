//! Reading the outcome of a publish-storage-deals message.
//!
//! Both parties need the on-chain deal id: the provider to hand the deal
//! to sealing, the client to watch for activation. Each finds its
//! proposal among the message's parameters and takes the id at the same
//! position in the return value.

use smkt_chain::actors::market::{PublishStorageDealsParams, PublishStorageDealsReturn, PUBLISH_STORAGE_DEALS};
use smkt_chain::types::decode;
use smkt_chain::{ChainApi, ChainError, ExitCode};
use smkt_core::{Cid, DealId};

/// Where a publish message stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Not yet executed.
    Pending,
    /// Executed and failed.
    Failed(ExitCode),
    /// Executed; the deal got this id.
    Published(DealId),
}

/// Look up the deal id `proposal` received in `publish`.
pub fn lookup_published_deal(
    chain: &dyn ChainApi,
    publish: &Cid,
    proposal: &Cid,
) -> Result<PublishOutcome, ChainError> {
    let Some(lookup) = chain.state_search_msg(publish)? else {
        return Ok(PublishOutcome::Pending);
    };
    if !lookup.receipt.exit_code.is_success() {
        return Ok(PublishOutcome::Failed(lookup.receipt.exit_code));
    }

    let params: PublishStorageDealsParams = chain.chain_get_message(publish)?.decode_params()?;
    let mut index = None;
    for (i, deal) in params.deals.iter().enumerate() {
        if deal.proposal_cid()? == *proposal {
            index = Some(i);
            break;
        }
    }
    let index = index.ok_or_else(|| ChainError::Codec {
        method: PUBLISH_STORAGE_DEALS,
        reason: format!("proposal {} is not in publish message {}", proposal.short(), publish.short()),
    })?;

    let ret: PublishStorageDealsReturn = decode(PUBLISH_STORAGE_DEALS, &lookup.receipt.return_value)?;
    ret.ids
        .get(index)
        .copied()
        .map(PublishOutcome::Published)
        .ok_or_else(|| ChainError::Codec {
            method: PUBLISH_STORAGE_DEALS,
            reason: format!("publish return has {} ids, wanted index {index}", ret.ids.len()),
        })
}
