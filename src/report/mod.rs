//! Daily rollup of withdraw calls and balances.
//!
//! Building a report only reads the ledger and the balance book, so two
//! builds over the same state serialize identically.

use std::sync::Arc;

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::alert::tx_link;
use crate::balance::BalanceBook;
use crate::config::ChainConfig;
use crate::store::record::{CallRecord, CallStatus};
use crate::store::LedgerStore;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatusTally {
    pub count: u64,
    /// Sum over calls whose amount decoded.
    pub amount_sum: Decimal,
    /// Calls counted above whose amount is unknown.
    pub amount_unknown: u64,
}

impl StatusTally {
    fn add(&mut self, amount: Option<Decimal>) {
        self.count += 1;
        match amount {
            Some(a) => self.amount_sum += a,
            None => self.amount_unknown += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailedEntry {
    pub tx_hash: B256,
    pub block_number: u64,
    pub trader: Option<Address>,
    pub amount: Option<Decimal>,
    pub notified: bool,
    pub explorer_link: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BalanceLine {
    pub token_symbol: String,
    pub token_address: Option<Address>,
    pub amount: Decimal,
    pub threshold: Decimal,
    pub below_threshold: bool,
    pub critical: bool,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChainSummary {
    pub chain_id: u64,
    pub chain_name: String,
    pub success: StatusTally,
    pub failed: StatusTally,
    /// Calls still Pending or in ClassificationError.
    pub pending_count: u64,
    /// Calls of any status whose amount could not be decoded.
    pub amount_unknown_count: u64,
    pub failed_list: Vec<FailedEntry>,
    pub balances: Vec<BalanceLine>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReportTotals {
    pub success_count: u64,
    pub success_amount_sum: Decimal,
    pub failed_count: u64,
    pub failed_amount_sum: Decimal,
    pub pending_count: u64,
    pub amount_unknown_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DailyReport {
    pub date: NaiveDate,
    /// End of the reported day; balances are taken nearest to it.
    pub cutoff: DateTime<Utc>,
    pub chains: Vec<ChainSummary>,
    pub totals: ReportTotals,
}

pub struct ReportAggregator {
    chains: Vec<ChainConfig>,
    ledger: Arc<LedgerStore>,
    book: Arc<BalanceBook>,
    critical_ratio: Decimal,
}

impl ReportAggregator {
    pub fn new(
        chains: Vec<ChainConfig>,
        ledger: Arc<LedgerStore>,
        book: Arc<BalanceBook>,
        critical_ratio: Decimal,
    ) -> Self {
        Self {
            chains,
            ledger,
            book,
            critical_ratio,
        }
    }

    /// Report for the last complete UTC day before `now`.
    pub async fn build_for_previous_day(&self, now: DateTime<Utc>) -> DailyReport {
        let today = now.date_naive();
        let date = today.pred_opt().unwrap_or(today);
        self.build(date).await
    }

    pub async fn build(&self, date: NaiveDate) -> DailyReport {
        let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
        let cutoff = start + Duration::days(1);

        let mut chains = Vec::with_capacity(self.chains.len());
        let mut totals = ReportTotals::default();
        for chain in &self.chains {
            let records = self.ledger.query_range(chain.chain_id, start, cutoff).await;
            let summary = self.summarize(chain, &records, cutoff);

            totals.success_count += summary.success.count;
            totals.success_amount_sum += summary.success.amount_sum;
            totals.failed_count += summary.failed.count;
            totals.failed_amount_sum += summary.failed.amount_sum;
            totals.pending_count += summary.pending_count;
            totals.amount_unknown_count += summary.amount_unknown_count;
            chains.push(summary);
        }

        debug!(date = %date, chains = chains.len(), "built daily report");
        DailyReport {
            date,
            cutoff,
            chains,
            totals,
        }
    }

    fn summarize(&self, chain: &ChainConfig, records: &[CallRecord], cutoff: DateTime<Utc>) -> ChainSummary {
        let mut success = StatusTally::default();
        let mut failed = StatusTally::default();
        let mut pending_count = 0;
        let mut amount_unknown_count = 0;
        let mut failed_list = Vec::new();

        for record in records {
            let amount = record.amount(chain.amount_decimals);
            if amount.is_none() {
                amount_unknown_count += 1;
            }
            match record.status {
                CallStatus::Success => success.add(amount),
                CallStatus::Failed => {
                    failed.add(amount);
                    failed_list.push(FailedEntry {
                        tx_hash: record.tx_hash,
                        block_number: record.block_number,
                        trader: record.params.as_ref().map(|p| p.trader),
                        amount,
                        notified: record.notified_at.is_some(),
                        explorer_link: tx_link(&chain.explorer_url, &record.tx_hash),
                    });
                }
                CallStatus::Pending | CallStatus::ClassificationError => pending_count += 1,
            }
        }

        ChainSummary {
            chain_id: chain.chain_id,
            chain_name: chain.name.clone(),
            success,
            failed,
            pending_count,
            amount_unknown_count,
            failed_list,
            balances: self.balances(chain, cutoff),
        }
    }

    fn balances(&self, chain: &ChainConfig, cutoff: DateTime<Utc>) -> Vec<BalanceLine> {
        let mut symbols: Vec<&str> = chain.tokens.iter().map(|t| t.symbol.as_str()).collect();
        if chain.native_low_balance_threshold.is_some() {
            symbols.push(chain.native_symbol.as_str());
        }
        symbols
            .into_iter()
            .filter_map(|symbol| self.book.nearest(chain.chain_id, symbol, cutoff))
            .map(|s| BalanceLine {
                below_threshold: s.is_below_threshold(),
                critical: s.is_critical(self.critical_ratio),
                token_symbol: s.token_symbol,
                token_address: s.token_address,
                amount: s.amount,
                threshold: s.threshold,
                observed_at: s.observed_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::BalanceSnapshot;
    use crate::config::TokenConfig;
    use crate::onchain::classifier::Classification;
    use crate::onchain::types::{CandidateTx, WithdrawParams};
    use crate::store::backend::MemoryBackend;
    use alloy::primitives::{Bytes, U256};
    use chrono::TimeZone;

    fn chain(chain_id: u64, name: &str) -> ChainConfig {
        ChainConfig {
            chain_id,
            name: name.into(),
            rpc_alias: None,
            rpc_url: "http://localhost:8545".into(),
            explorer_url: "https://explorer.example".into(),
            contract_address: Address::repeat_byte(0x11),
            native_symbol: "ETH".into(),
            native_low_balance_threshold: None,
            amount_decimals: 18,
            tokens: vec![TokenConfig {
                symbol: "USDT".into(),
                contract_address: Address::repeat_byte(0x55),
                low_balance_threshold: Decimal::from(10_000),
            }],
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    fn at(hour: u32) -> u64 {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap().timestamp() as u64
    }

    async fn add_call(
        ledger: &LedgerStore,
        chain_id: u64,
        seed: u8,
        ts: u64,
        amount: Option<u64>,
        status: CallStatus,
    ) {
        let tx = CandidateTx {
            hash: B256::repeat_byte(seed),
            block_number: 1_000 + seed as u64,
            block_timestamp: ts,
            from: None,
            to: Some(Address::repeat_byte(0x11)),
            input: Bytes::new(),
        };
        let classification = match amount {
            Some(whole) => Classification::Matched(WithdrawParams {
                id: U256::from(seed),
                trader: Address::repeat_byte(0x22),
                amount: U256::from(whole) * U256::from(10u64).pow(U256::from(18u8)),
                v: 27,
                r: B256::ZERO,
                s: B256::ZERO,
            }),
            None => Classification::MatchedUndecodable("call data too short".into()),
        };
        let record = CallRecord::from_classification(chain_id, &tx, classification, Utc::now()).unwrap();
        ledger.upsert_candidate(record).await;
        if status != CallStatus::Pending {
            ledger
                .resolve(chain_id, tx.hash, status, None, None, Utc::now())
                .await
                .unwrap();
        }
    }

    async fn scenario() -> ReportAggregator {
        let ledger = Arc::new(LedgerStore::new(Arc::new(MemoryBackend::new())));
        add_call(&ledger, 1, 1, at(3), Some(100), CallStatus::Success).await;
        add_call(&ledger, 1, 2, at(9), Some(250), CallStatus::Success).await;
        add_call(&ledger, 1, 3, at(15), Some(50), CallStatus::Failed).await;
        add_call(&ledger, 1, 4, at(20), None, CallStatus::Pending).await;
        // outside the day
        add_call(&ledger, 1, 5, at(0) - 1, Some(999), CallStatus::Failed).await;
        add_call(&ledger, 56, 6, at(12), Some(7), CallStatus::Failed).await;

        let book = Arc::new(BalanceBook::new());
        book.record(BalanceSnapshot {
            chain_id: 1,
            token_symbol: "USDT".into(),
            token_address: Some(Address::repeat_byte(0x55)),
            contract_address: Address::repeat_byte(0x11),
            amount: Decimal::from(8_500),
            threshold: Decimal::from(10_000),
            observed_at: Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap(),
        });

        ReportAggregator::new(
            vec![chain(1, "Ethereum"), chain(56, "BNB Chain")],
            ledger,
            book,
            Decimal::new(5, 1),
        )
    }

    #[tokio::test]
    async fn test_report_scenario_counts() {
        let report = scenario().await.build(day()).await;
        let a = &report.chains[0];
        assert_eq!(a.chain_name, "Ethereum");
        assert_eq!(a.success.count, 2);
        assert_eq!(a.success.amount_sum, Decimal::from(350));
        assert_eq!(a.failed.count, 1);
        assert_eq!(a.failed.amount_sum, Decimal::from(50));
        assert_eq!(a.pending_count, 1);
        assert_eq!(a.amount_unknown_count, 1);
        assert_eq!(a.failed_list.len(), 1);
        assert_eq!(a.balances.len(), 1);
        assert!(a.balances[0].below_threshold);
        assert!(!a.balances[0].critical);

        let b = &report.chains[1];
        assert_eq!(b.failed.count, 1);
        assert_eq!(b.failed.amount_sum, Decimal::from(7));
        assert!(b.balances.is_empty());

        assert_eq!(report.totals.success_count, 2);
        assert_eq!(report.totals.failed_count, 2);
        assert_eq!(report.totals.failed_amount_sum, Decimal::from(57));
        assert_eq!(report.totals.amount_unknown_count, 1);
    }

    #[tokio::test]
    async fn test_build_is_pure() {
        let agg = scenario().await;
        let first = serde_json::to_string(&agg.build(day()).await).unwrap();
        let second = serde_json::to_string(&agg.build(day()).await).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_previous_day() {
        let agg = scenario().await;
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let report = agg.build_for_previous_day(now).await;
        assert_eq!(report.date, day());
        assert_eq!(report.cutoff, Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());
    }
}
