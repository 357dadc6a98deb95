//! # Mock Chain
//!
//! An in-memory [`ChainApi`] for tests and the demo node.
//!
//! Pushed messages are assigned a nonce, stored by cid and, with
//! auto-landing on (the default), executed immediately in a fresh tipset
//! whose `Apply` change is broadcast to every `chain_notify` subscriber.
//! With auto-landing off, messages wait until [`MockChain::land_pending`].
//!
//! Only the storage market methods the deal charts use are executed:
//! `AddBalance` credits escrow, `PublishStorageDeals` checks and locks both
//! parties' escrow and assigns deal ids. Every other message succeeds with
//! no effect. Wallets are unlimited unless given a balance.
//!
//! ## Warning
//!
//! No signatures, gas accounting or consensus. This is a deterministic
//! stand-in for a chain node, not a simulator of one.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use smkt_core::{Address, Cid, DealId, TokenAmount};

use crate::actors::market::{self, ClientDealProposal, PublishStorageDealsParams, PublishStorageDealsReturn};
use crate::api::ChainApi;
use crate::error::ChainError;
use crate::types::{
    decode, encode, BlockHeader, ExitCode, HeadChange, HeadChangeType, MarketBalance,
    MessageReceipt, MinerInfo, MsgLookup, Tipset, TipsetKey, UnsignedMessage,
};

const GAS_PER_MESSAGE: i64 = 1_000;

struct ChainState {
    tipsets: Vec<Tipset>,
    messages: HashMap<Cid, UnsignedMessage>,
    lookups: HashMap<Cid, MsgLookup>,
    miners: HashMap<Address, MinerInfo>,
    escrow: HashMap<Address, MarketBalance>,
    wallets: HashMap<Address, TokenAmount>,
    nonces: HashMap<Address, u64>,
    pending: Vec<Cid>,
    subscribers: Vec<UnboundedSender<Vec<HeadChange>>>,
    next_deal_id: u64,
    auto_land: bool,
    unavailable: bool,
    fail_next_publish: bool,
}

impl ChainState {
    fn head(&self) -> Tipset {
        self.tipsets.last().cloned().unwrap_or_else(genesis)
    }

    fn check(&self) -> Result<(), ChainError> {
        if self.unavailable {
            return Err(ChainError::Unavailable("mock chain offline".into()));
        }
        Ok(())
    }

    fn push(&mut self, mut msg: UnsignedMessage) -> Result<Cid, ChainError> {
        if let Some(balance) = self.wallets.get_mut(&msg.from) {
            if *balance < msg.value {
                return Err(ChainError::InsufficientFunds {
                    wallet: msg.from,
                    needed: msg.value.to_string(),
                    available: balance.to_string(),
                });
            }
            *balance = *balance - msg.value;
        }
        let nonce = self.nonces.entry(msg.from).or_insert(0);
        msg.nonce = *nonce;
        *nonce += 1;

        let cid = msg.cid()?;
        self.messages.insert(cid, msg);
        tracing::debug!(message = %cid.short(), "mock chain: message pushed");
        if self.auto_land {
            self.land(vec![cid])?;
        } else {
            self.pending.push(cid);
        }
        Ok(cid)
    }

    fn land(&mut self, cids: Vec<Cid>) -> Result<Tipset, ChainError> {
        let height = self.head().height + 1;
        let tipset = Tipset {
            height,
            blocks: vec![BlockHeader {
                miner: Address::from_id(0),
                height,
                messages: cids.clone(),
            }],
        };
        let key = tipset.key()?;
        for cid in cids {
            let Some(msg) = self.messages.get(&cid).cloned() else {
                continue;
            };
            let receipt = self.execute(&msg);
            self.lookups.insert(
                cid,
                MsgLookup {
                    message: cid,
                    receipt,
                    tipset: key.clone(),
                    height,
                },
            );
        }
        self.tipsets.push(tipset.clone());
        self.notify(HeadChangeType::Apply, tipset.clone());
        Ok(tipset)
    }

    fn execute(&mut self, msg: &UnsignedMessage) -> MessageReceipt {
        if msg.to != market::ADDRESS {
            return receipt(ExitCode::OK, Vec::new());
        }
        match msg.method {
            market::ADD_BALANCE => match decode::<Address>(msg.method, &msg.params) {
                Ok(beneficiary) => {
                    let entry = self.escrow.entry(beneficiary).or_default();
                    entry.escrow = entry.escrow + msg.value;
                    receipt(ExitCode::OK, Vec::new())
                }
                Err(_) => receipt(ExitCode::ILLEGAL_ARGUMENT, Vec::new()),
            },
            market::PUBLISH_STORAGE_DEALS => self.publish(msg),
            _ => receipt(ExitCode::OK, Vec::new()),
        }
    }

    fn publish(&mut self, msg: &UnsignedMessage) -> MessageReceipt {
        if std::mem::take(&mut self.fail_next_publish) {
            return receipt(ExitCode::ILLEGAL_ARGUMENT, Vec::new());
        }
        let Ok(params) = decode::<PublishStorageDealsParams>(msg.method, &msg.params) else {
            return receipt(ExitCode::ILLEGAL_ARGUMENT, Vec::new());
        };

        for deal in &params.deals {
            let p = &deal.proposal;
            let client = self.escrow.get(&p.client).copied().unwrap_or_default();
            let provider = self.escrow.get(&p.provider).copied().unwrap_or_default();
            if client.available() < p.client_balance_requirement()
                || provider.available() < p.provider_balance_requirement()
            {
                return receipt(ExitCode::INSUFFICIENT_FUNDS, Vec::new());
            }
        }

        let mut ids = Vec::with_capacity(params.deals.len());
        for deal in &params.deals {
            let p = &deal.proposal;
            let client = self.escrow.entry(p.client).or_default();
            client.locked = client.locked + p.client_balance_requirement();
            let provider = self.escrow.entry(p.provider).or_default();
            provider.locked = provider.locked + p.provider_balance_requirement();
            ids.push(DealId(self.next_deal_id));
            self.next_deal_id += 1;
        }

        match encode(msg.method, &PublishStorageDealsReturn { ids }) {
            Ok(bytes) => receipt(ExitCode::OK, bytes),
            Err(_) => receipt(ExitCode::ILLEGAL_ARGUMENT, Vec::new()),
        }
    }

    fn notify(&mut self, kind: HeadChangeType, tipset: Tipset) {
        let batch = vec![HeadChange { kind, tipset }];
        self.subscribers.retain(|tx| tx.send(batch.clone()).is_ok());
    }
}

fn genesis() -> Tipset {
    Tipset {
        height: 0,
        blocks: vec![BlockHeader {
            miner: Address::from_id(0),
            height: 0,
            messages: Vec::new(),
        }],
    }
}

fn receipt(exit_code: ExitCode, return_value: Vec<u8>) -> MessageReceipt {
    MessageReceipt {
        exit_code,
        return_value,
        gas_used: GAS_PER_MESSAGE,
    }
}

/// In-memory chain node.
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockChain")
            .field("height", &state.head().height)
            .field("messages", &state.messages.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl MockChain {
    /// A chain at genesis with auto-landing on.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                tipsets: vec![genesis()],
                messages: HashMap::new(),
                lookups: HashMap::new(),
                miners: HashMap::new(),
                escrow: HashMap::new(),
                wallets: HashMap::new(),
                nonces: HashMap::new(),
                pending: Vec::new(),
                subscribers: Vec::new(),
                next_deal_id: 1,
                auto_land: true,
                unavailable: false,
                fail_next_publish: false,
            }),
        }
    }

    // ── Setup ────────────────────────────────────────────────────────

    /// Register a miner actor.
    pub fn add_miner(&self, miner: Address, info: MinerInfo) {
        self.state.lock().miners.insert(miner, info);
    }

    /// Overwrite the market escrow of `address`.
    pub fn set_escrow(&self, address: Address, balance: MarketBalance) {
        self.state.lock().escrow.insert(address, balance);
    }

    /// Give `wallet` a finite balance. Wallets without one are unlimited.
    pub fn set_wallet_balance(&self, wallet: Address, amount: TokenAmount) {
        self.state.lock().wallets.insert(wallet, amount);
    }

    /// Land pushed messages immediately (`true`) or hold them until
    /// [`land_pending`](Self::land_pending).
    pub fn set_auto_land(&self, on: bool) {
        self.state.lock().auto_land = on;
    }

    /// Make every API call fail with [`ChainError::Unavailable`].
    pub fn set_unavailable(&self, offline: bool) {
        self.state.lock().unavailable = offline;
    }

    /// Make the next publish message fail with a non-zero exit code.
    pub fn fail_next_publish(&self) {
        self.state.lock().fail_next_publish = true;
    }

    // ── Chain progression ────────────────────────────────────────────

    /// Land every held message in one tipset.
    pub fn land_pending(&self) -> Result<Tipset, ChainError> {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        state.land(pending)
    }

    /// Store `messages` and land them together in one tipset.
    pub fn apply_messages(&self, messages: Vec<UnsignedMessage>) -> Result<Tipset, ChainError> {
        let mut state = self.state.lock();
        let mut cids = Vec::with_capacity(messages.len());
        for msg in messages {
            let cid = msg.cid()?;
            state.messages.insert(cid, msg);
            cids.push(cid);
        }
        state.land(cids)
    }

    /// Store a message without landing it. Returns its cid.
    pub fn store_message(&self, msg: UnsignedMessage) -> Result<Cid, ChainError> {
        let cid = msg.cid()?;
        self.state.lock().messages.insert(cid, msg);
        Ok(cid)
    }

    /// Land a block listing `cids` verbatim. Cids with no stored message
    /// are included but not executed.
    pub fn apply_cids(&self, cids: Vec<Cid>) -> Result<Tipset, ChainError> {
        self.state.lock().land(cids)
    }

    /// Revert the head tipset. Genesis is never reverted.
    pub fn revert_head(&self) -> Option<Tipset> {
        let mut state = self.state.lock();
        if state.tipsets.len() <= 1 {
            return None;
        }
        let reverted = state.tipsets.pop()?;
        if let Ok(key) = reverted.key() {
            state.lookups.retain(|_, l| l.tipset != key);
        }
        state.notify(HeadChangeType::Revert, reverted.clone());
        Some(reverted)
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Current head height.
    pub fn height(&self) -> i64 {
        self.state.lock().head().height
    }

    /// Live `chain_notify` subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Messages pushed but not yet landed.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl ChainApi for MockChain {
    fn chain_head(&self) -> Result<Tipset, ChainError> {
        let state = self.state.lock();
        state.check()?;
        Ok(state.head())
    }

    fn state_miner_info(&self, miner: &Address, _tsk: &TipsetKey) -> Result<MinerInfo, ChainError> {
        let state = self.state.lock();
        state.check()?;
        state
            .miners
            .get(miner)
            .cloned()
            .ok_or(ChainError::MinerNotFound(*miner))
    }

    fn market_ensure_available(
        &self,
        address: &Address,
        wallet: &Address,
        amount: TokenAmount,
        _tsk: &TipsetKey,
    ) -> Result<Option<Cid>, ChainError> {
        let mut state = self.state.lock();
        state.check()?;
        let available = state.escrow.get(address).copied().unwrap_or_default().available();
        if available >= amount {
            return Ok(None);
        }
        let msg = UnsignedMessage {
            to: market::ADDRESS,
            from: *wallet,
            nonce: 0,
            value: amount - available,
            method: market::ADD_BALANCE,
            params: encode(market::ADD_BALANCE, address)?,
        };
        state.push(msg).map(Some)
    }

    fn market_get_balance(&self, address: &Address, _tsk: &TipsetKey) -> Result<MarketBalance, ChainError> {
        let state = self.state.lock();
        state.check()?;
        Ok(state.escrow.get(address).copied().unwrap_or_default())
    }

    fn market_add_balance(
        &self,
        wallet: &Address,
        address: &Address,
        amount: TokenAmount,
    ) -> Result<Cid, ChainError> {
        let mut state = self.state.lock();
        state.check()?;
        let msg = UnsignedMessage {
            to: market::ADDRESS,
            from: *wallet,
            nonce: 0,
            value: amount,
            method: market::ADD_BALANCE,
            params: encode(market::ADD_BALANCE, address)?,
        };
        state.push(msg)
    }

    fn publish_storage_deals(
        &self,
        worker: &Address,
        deals: Vec<ClientDealProposal>,
    ) -> Result<Cid, ChainError> {
        let mut state = self.state.lock();
        state.check()?;
        let msg = UnsignedMessage {
            to: market::ADDRESS,
            from: *worker,
            nonce: 0,
            value: TokenAmount::ZERO,
            method: market::PUBLISH_STORAGE_DEALS,
            params: encode(market::PUBLISH_STORAGE_DEALS, &PublishStorageDealsParams { deals })?,
        };
        state.push(msg)
    }

    fn state_search_msg(&self, message: &Cid) -> Result<Option<MsgLookup>, ChainError> {
        let state = self.state.lock();
        state.check()?;
        Ok(state.lookups.get(message).cloned())
    }

    fn chain_get_message(&self, message: &Cid) -> Result<UnsignedMessage, ChainError> {
        let state = self.state.lock();
        state.check()?;
        state
            .messages
            .get(message)
            .cloned()
            .ok_or(ChainError::MessageNotFound(*message))
    }

    fn chain_notify(&self) -> Result<UnboundedReceiver<Vec<HeadChange>>, ChainError> {
        let mut state = self.state.lock();
        state.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let current = vec![HeadChange {
            kind: HeadChangeType::Current,
            tipset: state.head(),
        }];
        if tx.send(current).is_ok() {
            state.subscribers.push(tx);
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smkt_core::{PaddedPieceSize, RegisteredProof};

    use crate::actors::market::DealProposal;

    fn deal(client: Address, provider: Address) -> ClientDealProposal {
        ClientDealProposal {
            proposal: DealProposal {
                piece_cid: Cid::digest(b"piece"),
                piece_size: PaddedPieceSize::new(2048).unwrap(),
                verified_deal: false,
                client,
                provider,
                label: String::new(),
                start_epoch: 10,
                end_epoch: 20,
                storage_price_per_epoch: TokenAmount::from_atto(1),
                provider_collateral: TokenAmount::from_atto(5),
                client_collateral: TokenAmount::ZERO,
            },
            client_signature: Vec::new(),
        }
    }

    #[test]
    fn ensure_available_tops_up_only_when_short() {
        let chain = MockChain::new();
        let provider = Address::from_id(1000);
        let worker = Address::from_id(1001);
        let tsk = chain.chain_head().unwrap().key().unwrap();

        let cid = chain
            .market_ensure_available(&provider, &worker, TokenAmount::from_atto(10), &tsk)
            .unwrap()
            .expect("top-up message");
        let lookup = chain.state_search_msg(&cid).unwrap().unwrap();
        assert!(lookup.receipt.exit_code.is_success());
        assert_eq!(chain.market_get_balance(&provider, &tsk).unwrap().escrow.atto(), 10);

        let again = chain
            .market_ensure_available(&provider, &worker, TokenAmount::from_atto(10), &tsk)
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn held_messages_have_no_receipt_until_landed() {
        let chain = MockChain::new();
        chain.set_auto_land(false);
        let cid = chain
            .market_add_balance(&Address::from_id(1), &Address::from_id(2), TokenAmount::from_atto(3))
            .unwrap();
        assert!(chain.state_search_msg(&cid).unwrap().is_none());
        assert_eq!(chain.pending_count(), 1);
        chain.land_pending().unwrap();
        assert!(chain.state_search_msg(&cid).unwrap().is_some());
    }

    #[test]
    fn publish_assigns_ids_and_locks_escrow() {
        let chain = MockChain::new();
        let (client, provider) = (Address::from_id(100), Address::from_id(1000));
        chain.set_escrow(client, MarketBalance { escrow: TokenAmount::from_atto(100), locked: TokenAmount::ZERO });
        chain.set_escrow(provider, MarketBalance { escrow: TokenAmount::from_atto(100), locked: TokenAmount::ZERO });

        let cid = chain
            .publish_storage_deals(&Address::from_id(1001), vec![deal(client, provider)])
            .unwrap();
        let lookup = chain.state_search_msg(&cid).unwrap().unwrap();
        assert!(lookup.receipt.exit_code.is_success());
        let ret: PublishStorageDealsReturn =
            decode(market::PUBLISH_STORAGE_DEALS, &lookup.receipt.return_value).unwrap();
        assert_eq!(ret.ids, vec![DealId(1)]);

        let tsk = chain.chain_head().unwrap().key().unwrap();
        assert_eq!(chain.market_get_balance(&client, &tsk).unwrap().locked.atto(), 10);
        assert_eq!(chain.market_get_balance(&provider, &tsk).unwrap().locked.atto(), 5);
    }

    #[test]
    fn publish_without_escrow_fails_on_chain() {
        let chain = MockChain::new();
        let cid = chain
            .publish_storage_deals(
                &Address::from_id(1001),
                vec![deal(Address::from_id(100), Address::from_id(1000))],
            )
            .unwrap();
        let lookup = chain.state_search_msg(&cid).unwrap().unwrap();
        assert_eq!(lookup.receipt.exit_code, ExitCode::INSUFFICIENT_FUNDS);
    }

    #[test]
    fn offline_chain_fails_calls() {
        let chain = MockChain::new();
        chain.add_miner(
            Address::from_id(1000),
            MinerInfo {
                owner: Address::from_id(1001),
                worker: Address::from_id(1001),
                peer_id: None,
                seal_proof: RegisteredProof::StackedDrg2KiBV1,
            },
        );
        chain.set_unavailable(true);
        assert!(matches!(chain.chain_head(), Err(ChainError::Unavailable(_))));
        chain.set_unavailable(false);
        assert!(chain.chain_head().is_ok());
    }

    #[test]
    fn limited_wallet_rejects_overspend() {
        let chain = MockChain::new();
        let wallet = Address::from_id(9);
        chain.set_wallet_balance(wallet, TokenAmount::from_atto(5));
        let err = chain
            .market_add_balance(&wallet, &Address::from_id(1), TokenAmount::from_atto(6))
            .unwrap_err();
        assert!(matches!(err, ChainError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn notify_sends_current_then_applies() {
        let chain = MockChain::new();
        let mut rx = chain.chain_notify().unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first[0].kind, HeadChangeType::Current);

        chain.apply_cids(Vec::new()).unwrap();
        let next = rx.recv().await.unwrap();
        assert_eq!(next[0].kind, HeadChangeType::Apply);
        assert_eq!(next[0].tipset.height, 1);

        chain.revert_head().unwrap();
        let reverted = rx.recv().await.unwrap();
        assert_eq!(reverted[0].kind, HeadChangeType::Revert);
        assert_eq!(chain.height(), 0);
    }
}
