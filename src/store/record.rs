//! Persistent record types for the withdraw-call ledger.

use alloy::primitives::B256;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::onchain::classifier::Classification;
use crate::onchain::types::{scale_amount, CandidateTx, WithdrawParams};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Seen on chain, receipt not yet known.
    Pending,
    Success,
    Failed,
    /// The provider returned a receipt we could not interpret.
    ClassificationError,
}

impl CallStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, CallStatus::Success | CallStatus::Failed)
    }

    /// Statuses whose receipt is fetched again on every cycle.
    pub fn needs_receipt(&self) -> bool {
        matches!(self, CallStatus::Pending | CallStatus::ClassificationError)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallStatus::Pending => write!(f, "pending"),
            CallStatus::Success => write!(f, "success"),
            CallStatus::Failed => write!(f, "failed"),
            CallStatus::ClassificationError => write!(f, "classification_error"),
        }
    }
}

/// One observed call to the monitored withdraw function.
/// `(chain_id, tx_hash)` is the primary key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallRecord {
    pub chain_id: u64,
    pub tx_hash: B256,
    pub block_number: u64,
    /// Unix seconds.
    pub block_timestamp: u64,
    /// `None` when the call data could not be decoded.
    pub params: Option<WithdrawParams>,
    pub status: CallStatus,
    pub first_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
    /// First failed delivery of the failed-withdrawal alert. The retry window
    /// runs from here, never from resolution.
    #[serde(default)]
    pub first_dispatch_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub alert_abandoned: bool,
    pub error: Option<String>,
}

impl CallRecord {
    /// Build a Pending record for a classified transaction. `None` for non-matches.
    pub fn from_classification(
        chain_id: u64,
        tx: &CandidateTx,
        classification: Classification,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let (params, error) = match classification {
            Classification::NotAMatch => return None,
            Classification::Matched(params) => (Some(params), None),
            Classification::MatchedUndecodable(reason) => (None, Some(reason)),
        };
        Some(Self {
            chain_id,
            tx_hash: tx.hash,
            block_number: tx.block_number,
            block_timestamp: tx.block_timestamp,
            params,
            status: CallStatus::Pending,
            first_seen_at: now,
            resolved_at: None,
            notified_at: None,
            first_dispatch_attempt_at: None,
            alert_abandoned: false,
            error,
        })
    }

    pub fn block_time(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.block_timestamp)
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    /// Withdrawal amount in human units, if the call decoded and fits a `Decimal`.
    pub fn amount(&self, decimals: u8) -> Option<Decimal> {
        self.params
            .as_ref()
            .and_then(|p| scale_amount(p.amount, decimals))
    }

    /// A failed call whose alert has not been delivered or given up on.
    pub fn awaits_alert(&self) -> bool {
        self.status == CallStatus::Failed && self.notified_at.is_none() && !self.alert_abandoned
    }

    /// Safe to prune once past the retention window.
    pub fn is_settled(&self) -> bool {
        match self.status {
            CallStatus::Pending => false,
            CallStatus::Success | CallStatus::ClassificationError => true,
            CallStatus::Failed => self.notified_at.is_some() || self.alert_abandoned,
        }
    }

    /// Ordering key used by range queries and alert dispatch.
    pub fn sort_key(&self) -> (u64, B256) {
        (self.block_number, self.tx_hash)
    }
}

/// Result of applying a receipt status to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Status did not change.
    Unchanged,
    /// Moved out of Pending to a non-alerting status.
    Resolved,
    /// Became Failed and has never been alerted.
    NewlyFailed,
    /// A resolved status changed, typically after a reorg.
    Flipped { from: CallStatus },
}

/// Everything persisted for one chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainLedgerSnapshot {
    pub chain_id: u64,
    pub watermark: Option<u64>,
    pub records: Vec<CallRecord>,
}
