//! Scripted in-memory chain for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::onchain::adapter::{ChainAdapter, ProviderError};
use crate::onchain::types::{CandidateTx, RawAmount, TxReceipt, WithdrawParams};

#[derive(Default)]
struct State {
    head: u64,
    txs: Vec<CandidateTx>,
    receipts: HashMap<B256, TxReceipt>,
    receipt_failures: HashMap<B256, u32>,
    receipt_calls: HashMap<B256, u32>,
    fail_head: bool,
    native: Option<RawAmount>,
    tokens: HashMap<Address, RawAmount>,
    failing_tokens: Vec<Address>,
    fetch_ranges: Vec<(u64, u64)>,
}

#[derive(Default)]
pub struct MockChain {
    state: Mutex<State>,
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        let chain = Self::default();
        chain.set_head(head);
        chain
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn fail_head(&self, fail: bool) {
        self.state.lock().unwrap().fail_head = fail;
    }

    /// Add a withdraw call to `to` with the given parameters, returning its hash.
    pub fn push_withdraw(&self, seed: u8, to: Address, block: u64, params: &WithdrawParams) -> B256 {
        self.push_raw(seed, to, block, params.encode_call())
    }

    pub fn push_raw(&self, seed: u8, to: Address, block: u64, input: Bytes) -> B256 {
        let hash = B256::repeat_byte(seed);
        self.state.lock().unwrap().txs.push(CandidateTx {
            hash,
            block_number: block,
            block_timestamp: 1_700_000_000 + block * 2,
            from: Some(Address::repeat_byte(0xee)),
            to: Some(to),
            input,
        });
        hash
    }

    pub fn set_receipt(&self, hash: B256, success: bool, block: u64) {
        self.set_receipt_status(hash, Some(success), block);
    }

    pub fn set_receipt_status(&self, hash: B256, status: Option<bool>, block: u64) {
        self.state.lock().unwrap().receipts.insert(
            hash,
            TxReceipt {
                hash,
                status,
                block_number: Some(block),
                block_timestamp: None,
                gas_used: 21_000,
            },
        );
    }

    /// The next `times` receipt lookups for `hash` fail transiently.
    pub fn fail_receipt(&self, hash: B256, times: u32) {
        self.state.lock().unwrap().receipt_failures.insert(hash, times);
    }

    pub fn receipt_calls(&self, hash: B256) -> u32 {
        self.state
            .lock()
            .unwrap()
            .receipt_calls
            .get(&hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn fetch_ranges(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().fetch_ranges.clone()
    }

    pub fn set_native_balance(&self, value: U256) {
        self.state.lock().unwrap().native = Some(RawAmount::new(value, 18));
    }

    pub fn set_token_balance(&self, token: Address, value: U256, decimals: u8) {
        self.state
            .lock()
            .unwrap()
            .tokens
            .insert(token, RawAmount::new(value, decimals));
    }

    pub fn fail_token(&self, token: Address) {
        self.state.lock().unwrap().failing_tokens.push(token);
    }
}

#[async_trait]
impl ChainAdapter for MockChain {
    async fn get_transactions_to(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<CandidateTx>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.fetch_ranges.push((from_block, to_block));
        Ok(state
            .txs
            .iter()
            .filter(|tx| tx.to == Some(address))
            .filter(|tx| (from_block..=to_block).contains(&tx.block_number))
            .cloned()
            .collect())
    }

    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        *state.receipt_calls.entry(tx_hash).or_default() += 1;
        if let Some(left) = state.receipt_failures.get_mut(&tx_hash) {
            if *left > 0 {
                *left -= 1;
                return Err(ProviderError::Transient("connection reset".to_string()));
            }
        }
        Ok(state.receipts.get(&tx_hash).cloned())
    }

    async fn get_token_balance(
        &self,
        _holder: Address,
        token: Address,
    ) -> Result<RawAmount, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.failing_tokens.contains(&token) {
            return Err(ProviderError::Transient("execution reverted".to_string()));
        }
        state
            .tokens
            .get(&token)
            .copied()
            .ok_or_else(|| ProviderError::Malformed("unknown token".to_string()))
    }

    async fn get_native_balance(&self, _holder: Address) -> Result<RawAmount, ProviderError> {
        let state = self.state.lock().unwrap();
        state
            .native
            .ok_or_else(|| ProviderError::Transient("no native balance scripted".to_string()))
    }

    async fn get_head_block_number(&self) -> Result<u64, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.fail_head {
            return Err(ProviderError::Transient("head unavailable".to_string()));
        }
        Ok(state.head)
    }
}
