//! JSON-RPC implementation of `ChainAdapter` over an alloy HTTP provider.
//!
//! EVM nodes have no "transactions to address" query and the contract emits
//! no event on a reverted withdraw, so the adapter walks full blocks and
//! filters on the destination. Blocks are fetched with bounded concurrency.

use std::future::IntoFuture;
use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{TransactionInput, TransactionRequest};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use crate::onchain::abi;
use crate::onchain::adapter::{ChainAdapter, ProviderError};
use crate::onchain::types::{CandidateTx, RawAmount, TxReceipt};

/// Native assets on every supported chain use 18 decimals.
const NATIVE_DECIMALS: u8 = 18;

/// Blocks fetched in parallel while scanning a range.
const BLOCK_FETCH_CONCURRENCY: usize = 8;

pub struct RpcChainAdapter {
    chain: String,
    provider: RootProvider,
    timeout: Duration,
}

impl RpcChainAdapter {
    pub fn connect(chain: &str, url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let provider = RootProvider::new_http(url.parse()?);
        Ok(Self {
            chain: chain.to_string(),
            provider,
            timeout,
        })
    }

    /// Bound `fut` by the configured RPC timeout and map transport errors.
    async fn timed<T, E, F>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(ProviderError::from_message(e.to_string())),
            Err(_) => Err(ProviderError::Timeout(self.timeout.as_secs())),
        }
    }

    async fn block_candidates(
        &self,
        address: Address,
        number: u64,
    ) -> Result<Vec<CandidateTx>, ProviderError> {
        let block = self
            .timed(
                self.provider
                    .get_block_by_number(BlockNumberOrTag::Number(number))
                    .full(),
            )
            .await?
            .ok_or_else(|| ProviderError::Transient(format!("block {number} not available yet")))?;

        let timestamp = block.header.timestamp;
        let found: Vec<CandidateTx> = block
            .transactions
            .txns()
            .filter(|tx| alloy::consensus::Transaction::to(*tx) == Some(address))
            .map(|tx| CandidateTx {
                hash: alloy::network::TransactionResponse::tx_hash(tx),
                block_number: number,
                block_timestamp: timestamp,
                from: Some(alloy::network::TransactionResponse::from(tx)),
                to: alloy::consensus::Transaction::to(tx),
                input: alloy::consensus::Transaction::input(tx).clone(),
            })
            .collect();

        if !found.is_empty() {
            debug!(chain = %self.chain, block = number, count = found.len(), "calls to monitored contract");
        }
        Ok(found)
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>) -> Result<Bytes, ProviderError> {
        let request = TransactionRequest::default()
            .to(to)
            .input(TransactionInput::new(Bytes::from(data)));
        self.timed(self.provider.call(request)).await
    }
}

#[async_trait]
impl ChainAdapter for RpcChainAdapter {
    async fn get_transactions_to(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<CandidateTx>, ProviderError> {
        if from_block > to_block {
            return Ok(Vec::new());
        }
        let per_block: Vec<Vec<CandidateTx>> = stream::iter(from_block..=to_block)
            .map(|n| self.block_candidates(address, n))
            .buffered(BLOCK_FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(per_block.into_iter().flatten().collect())
    }

    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ProviderError> {
        let receipt = self
            .timed(self.provider.get_transaction_receipt(tx_hash))
            .await?;
        Ok(receipt.map(|r| TxReceipt {
            hash: tx_hash,
            status: Some(r.status()),
            block_number: r.block_number,
            block_timestamp: None,
            gas_used: r.gas_used,
        }))
    }

    async fn get_token_balance(
        &self,
        holder: Address,
        token: Address,
    ) -> Result<RawAmount, ProviderError> {
        let raw = self.eth_call(token, abi::balance_of_call(holder)).await?;
        let word = abi::word(&raw, 0).ok_or_else(|| {
            ProviderError::Malformed(format!("balanceOf returned {} bytes", raw.len()))
        })?;
        let value = abi::word_to_u256(&word);

        let raw = self.eth_call(token, abi::decimals_call()).await?;
        let decimals = abi::word(&raw, 0)
            .and_then(|w| abi::word_to_u8(&w))
            .ok_or_else(|| ProviderError::Malformed("decimals() is not a uint8".to_string()))?;

        Ok(RawAmount::new(value, decimals))
    }

    async fn get_native_balance(&self, holder: Address) -> Result<RawAmount, ProviderError> {
        let value: U256 = self.timed(self.provider.get_balance(holder)).await?;
        Ok(RawAmount::new(value, NATIVE_DECIMALS))
    }

    async fn get_head_block_number(&self) -> Result<u64, ProviderError> {
        self.timed(self.provider.get_block_number()).await
    }
}
