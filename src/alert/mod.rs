//! Alert values produced by the monitors and handed to the dispatcher.

pub mod gate;

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::onchain::types::hex_hash;

/// `{explorer}/tx/{hash}`
pub fn tx_link(explorer: &str, hash: &B256) -> String {
    format!("{}/tx/{}", explorer.trim_end_matches('/'), hex_hash(hash))
}

/// `{explorer}/address/{address}`
pub fn address_link(explorer: &str, address: &Address) -> String {
    format!("{}/address/{}", explorer.trim_end_matches('/'), address)
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedWithdrawAlert {
    pub chain_id: u64,
    pub chain_name: String,
    pub contract: Address,
    pub tx_hash: B256,
    pub block_number: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub withdraw_id: Option<U256>,
    pub trader: Option<Address>,
    pub amount: Option<Decimal>,
    /// Why the arguments could not be decoded, if they could not.
    pub decode_error: Option<String>,
    pub explorer_link: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LowBalanceAlert {
    pub chain_id: u64,
    pub chain_name: String,
    pub contract: Address,
    pub token_symbol: String,
    /// `None` for the native asset.
    pub token_address: Option<Address>,
    pub balance: Decimal,
    pub threshold: Decimal,
    pub critical: bool,
    pub explorer_link: String,
}

/// A call that has stayed Pending longer than the staleness window.
#[derive(Debug, Clone, Serialize)]
pub struct StuckAlert {
    pub chain_id: u64,
    pub chain_name: String,
    pub tx_hash: B256,
    pub block_number: u64,
    pub pending_hours: i64,
    pub explorer_link: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationErrorAlert {
    pub chain_id: u64,
    pub chain_name: String,
    pub tx_hash: B256,
    pub reason: String,
    pub explorer_link: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum Alert {
    FailedWithdraw(FailedWithdrawAlert),
    LowBalance(LowBalanceAlert),
    Stuck(StuckAlert),
    ClassificationError(ClassificationErrorAlert),
}

impl Alert {
    pub fn chain_id(&self) -> u64 {
        match self {
            Alert::FailedWithdraw(a) => a.chain_id,
            Alert::LowBalance(a) => a.chain_id,
            Alert::Stuck(a) => a.chain_id,
            Alert::ClassificationError(a) => a.chain_id,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Alert::FailedWithdraw(_) => "FAILED_WITHDRAW",
            Alert::LowBalance(_) => "LOW_BALANCE",
            Alert::Stuck(_) => "STUCK",
            Alert::ClassificationError(_) => "CLASSIFICATION_ERROR",
        }
    }
}
