//! Per-chain withdraw-call monitor.
//!
//! One `poll_once` cycle runs Fetch → Classify → ResolveStatus → Persist →
//! Alert against a single chain:
//!
//! - Fetch rescans `reorg_overlap_blocks` below the last scanned height so a
//!   shallow reorg is picked up again; re-observation is a ledger no-op.
//! - The watermark never passes the lowest still-Pending call, so a restart
//!   rescans from there.
//! - Failed-withdrawal alerts are marked notified only after delivery and are
//!   retried on later cycles until the staleness window closes.
//! - A cycle holds the backend lock for its chain and reloads the ledger first,
//!   so separate processes sharing a backend never alert twice.

use std::sync::Arc;

use alloy::primitives::B256;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::alert::gate::{AlertGate, AlertKey, AlertKind};
use crate::alert::{tx_link, Alert, ClassificationErrorAlert, FailedWithdrawAlert, StuckAlert};
use crate::config::ChainConfig;
use crate::notify::Dispatcher;
use crate::onchain::adapter::{ChainAdapter, ProviderError};
use crate::onchain::classifier;
use crate::onchain::retry::RetryPolicy;
use crate::onchain::types::hex_hash;
use crate::store::record::{CallRecord, CallStatus, ResolveOutcome};
use crate::store::{LedgerError, LedgerStore};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub reorg_overlap_blocks: u64,
    pub initial_block_range: u64,
    pub max_block_range: u64,
    pub stale_pending: Duration,
    /// Upper bound on one cycle; a crashed holder's lock frees after this.
    pub lock_ttl: std::time::Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            reorg_overlap_blocks: 12,
            initial_block_range: 1000,
            max_block_range: 500,
            stale_pending: Duration::hours(3),
            lock_ttl: std::time::Duration::from_secs(600),
        }
    }
}

/// Counters for one completed cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub chain_id: u64,
    pub head: u64,
    /// Scanned range, `None` when already caught up.
    pub range: Option<(u64, u64)>,
    pub candidates: usize,
    pub new_records: usize,
    pub resolved: usize,
    pub newly_failed: usize,
    pub still_pending: usize,
    pub receipt_errors: usize,
    pub alerts_sent: usize,
    pub alerts_failed: usize,
    pub watermark: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum PollOutcome {
    Completed(PollReport),
    /// Another cycle for this chain was still running, here or in another
    /// process sharing the ledger backend.
    Skipped,
}

/// In-process scan progress. Lost on restart, after which the persisted
/// watermark takes over.
#[derive(Debug, Default)]
struct ScanState {
    cursor: Option<u64>,
}

pub struct TransactionMonitor {
    chain: ChainConfig,
    adapter: Arc<dyn ChainAdapter>,
    ledger: Arc<LedgerStore>,
    gate: Arc<AlertGate>,
    dispatcher: Arc<Dispatcher>,
    retry: RetryPolicy,
    settings: MonitorSettings,
    cycle: Mutex<ScanState>,
}

impl TransactionMonitor {
    pub fn new(
        chain: ChainConfig,
        adapter: Arc<dyn ChainAdapter>,
        ledger: Arc<LedgerStore>,
        gate: Arc<AlertGate>,
        dispatcher: Arc<Dispatcher>,
        retry: RetryPolicy,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            chain,
            adapter,
            ledger,
            gate,
            dispatcher,
            retry,
            settings,
            cycle: Mutex::new(ScanState::default()),
        }
    }

    pub fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    pub async fn poll_once(&self) -> Result<PollOutcome, MonitorError> {
        self.poll_once_at(Utc::now()).await
    }

    pub async fn poll_once_at(&self, now: DateTime<Utc>) -> Result<PollOutcome, MonitorError> {
        let Ok(mut scan) = self.cycle.try_lock() else {
            warn!(chain = %self.chain.name, "previous poll still running, skipping cycle");
            return Ok(PollOutcome::Skipped);
        };

        let chain_id = self.chain.chain_id;
        if !self.ledger.try_lock_chain(chain_id, self.settings.lock_ttl).await? {
            warn!(chain = %self.chain.name, "ledger locked by another process, skipping cycle");
            return Ok(PollOutcome::Skipped);
        }

        let result = self.run_cycle(&mut scan, now).await;
        if let Err(e) = self.ledger.unlock_chain(chain_id).await {
            warn!(chain = %self.chain.name, error = %e, "failed to release ledger lock");
        }
        result.map(PollOutcome::Completed)
    }

    async fn run_cycle(&self, scan: &mut ScanState, now: DateTime<Utc>) -> Result<PollReport, MonitorError> {
        let chain_id = self.chain.chain_id;
        // another process may have written since our last cycle
        self.ledger.load(chain_id).await?;

        let mut report = PollReport {
            chain_id,
            ..Default::default()
        };

        // Fetch
        report.head = self
            .retry
            .run("head_block", || self.adapter.get_head_block_number())
            .await?;
        let watermark = self.ledger.watermark(chain_id).await;
        report.range = self.scan_range(watermark, scan.cursor, report.head);

        // Classify
        if let Some((from, to)) = report.range {
            let contract = self.chain.contract_address;
            let txs = self
                .retry
                .run("transactions", || self.adapter.get_transactions_to(contract, from, to))
                .await?;
            report.candidates = txs.len();
            for tx in &txs {
                let classification = classifier::classify(contract, tx);
                if let Some(record) = CallRecord::from_classification(chain_id, tx, classification, now) {
                    if let Some(reason) = &record.error {
                        warn!(chain = %self.chain.name, tx = %tx.hash, reason = %reason, "withdraw call arguments not decodable");
                    }
                    if self.ledger.upsert_candidate(record).await {
                        report.new_records += 1;
                    }
                }
            }
            scan.cursor = Some(scan.cursor.map_or(to, |c| c.max(to)));
        }

        // ResolveStatus
        let newly_malformed = self.resolve_pending(&mut report, now).await?;

        // Persist
        if let Some((_, to)) = report.range {
            let pending = self.ledger.pending(chain_id).await;
            let lowest_pending = pending
                .iter()
                .filter(|r| r.status == CallStatus::Pending)
                .map(|r| r.block_number)
                .min();
            let mark = match lowest_pending {
                Some(b) => to.min(b.saturating_sub(1)),
                None => to,
            };
            self.ledger.set_watermark(chain_id, mark.min(report.head)).await;
        }
        report.watermark = self.ledger.watermark(chain_id).await;
        self.ledger.flush(chain_id).await?;

        // Alert
        self.dispatch_failures(&mut report, now).await;
        self.warn_stuck(now).await;
        for record in &newly_malformed {
            self.warn_malformed(record, now).await;
        }
        self.ledger.flush(chain_id).await?;

        info!(
            chain = %self.chain.name,
            head = report.head,
            range = ?report.range,
            candidates = report.candidates,
            new = report.new_records,
            resolved = report.resolved,
            failed = report.newly_failed,
            pending = report.still_pending,
            alerts = report.alerts_sent,
            watermark = ?report.watermark,
            "poll cycle complete"
        );
        Ok(report)
    }

    /// Inclusive block range for this cycle, or `None` when caught up.
    fn scan_range(&self, watermark: Option<u64>, cursor: Option<u64>, head: u64) -> Option<(u64, u64)> {
        let s = &self.settings;
        let base = match (watermark, cursor) {
            (Some(w), Some(c)) => Some(w.max(c)),
            (w, c) => w.or(c),
        };
        let start = match base {
            Some(b) => (b + 1).saturating_sub(s.reorg_overlap_blocks),
            None => head.saturating_sub(s.initial_block_range),
        };
        if start > head {
            return None;
        }
        let end = head.min(start.saturating_add(s.max_block_range.max(1) - 1));
        Some((start, end))
    }

    /// Fetch receipts for every unresolved record. Returns the records newly
    /// marked as classification errors.
    async fn resolve_pending(
        &self,
        report: &mut PollReport,
        now: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>, MonitorError> {
        let chain_id = self.chain.chain_id;
        let mut newly_malformed = Vec::new();

        for record in self.ledger.pending(chain_id).await {
            let hash = record.tx_hash;
            let receipt = self
                .retry
                .run("receipt", || self.adapter.get_receipt(hash))
                .await;

            let (status, receipt) = match receipt {
                Ok(Some(r)) => match r.status {
                    Some(true) => (CallStatus::Success, r),
                    Some(false) => (CallStatus::Failed, r),
                    None => {
                        self.mark_malformed(&record, "receipt carries no status", &mut newly_malformed)
                            .await?;
                        report.receipt_errors += 1;
                        continue;
                    }
                },
                Ok(None) => {
                    debug!(chain = %self.chain.name, tx = %hash, "receipt not available yet");
                    report.still_pending += 1;
                    continue;
                }
                Err(ProviderError::Malformed(reason)) => {
                    self.mark_malformed(&record, &reason, &mut newly_malformed).await?;
                    report.receipt_errors += 1;
                    continue;
                }
                Err(e) => {
                    warn!(chain = %self.chain.name, tx = %hash, error = %e, "receipt fetch failed, will retry next cycle");
                    report.still_pending += 1;
                    continue;
                }
            };

            let outcome = self
                .ledger
                .resolve(chain_id, hash, status, receipt.block_number, receipt.block_timestamp, now)
                .await?;
            if outcome != ResolveOutcome::Unchanged {
                self.clear_warnings(&hash);
            }
            match outcome {
                ResolveOutcome::Unchanged => {}
                ResolveOutcome::Resolved => report.resolved += 1,
                ResolveOutcome::NewlyFailed => {
                    report.resolved += 1;
                    report.newly_failed += 1;
                    warn!(
                        chain = %self.chain.name,
                        tx = %hash,
                        block = receipt.block_number.unwrap_or(record.block_number),
                        gas_used = receipt.gas_used,
                        "FAILED WITHDRAWAL"
                    );
                }
                ResolveOutcome::Flipped { from } => {
                    report.resolved += 1;
                    warn!(chain = %self.chain.name, tx = %hash, from = %from, to = %status, "status changed after reorg");
                }
            }
        }
        Ok(newly_malformed)
    }

    /// Resolved records can never be stuck or unreadable again.
    fn clear_warnings(&self, hash: &B256) {
        let chain_id = self.chain.chain_id;
        for kind in [AlertKind::Stuck, AlertKind::ClassificationError] {
            self.gate.clear(&AlertKey::new(chain_id, kind, hex_hash(hash)));
        }
    }

    async fn mark_malformed(
        &self,
        record: &CallRecord,
        reason: &str,
        newly: &mut Vec<CallRecord>,
    ) -> Result<(), MonitorError> {
        let chain_id = self.chain.chain_id;
        error!(chain = %self.chain.name, tx = %record.tx_hash, reason = %reason, "unreadable receipt");
        if self
            .ledger
            .mark_classification_error(chain_id, record.tx_hash, reason)
            .await?
        {
            if let Some(updated) = self.ledger.get(chain_id, record.tx_hash).await {
                newly.push(updated);
            }
        }
        Ok(())
    }

    /// Deliver every undelivered failed-withdrawal alert, oldest first.
    ///
    /// Every candidate gets a delivery attempt before it can be abandoned; the
    /// retry window counts from its first failed attempt.
    async fn dispatch_failures(&self, report: &mut PollReport, now: DateTime<Utc>) {
        let chain_id = self.chain.chain_id;
        for record in self.ledger.alert_candidates(chain_id).await {
            let alert = Alert::FailedWithdraw(self.failed_alert(&record));
            if self.dispatcher.dispatch(&alert).await.is_ok() {
                self.ledger.mark_notified(chain_id, record.tx_hash, now).await;
                report.alerts_sent += 1;
                continue;
            }

            report.alerts_failed += 1;
            let first = self
                .ledger
                .mark_dispatch_failed(chain_id, record.tx_hash, now)
                .await
                .unwrap_or(now);
            if now.signed_duration_since(first) > self.settings.stale_pending
                && self.ledger.mark_alert_abandoned(chain_id, record.tx_hash).await
            {
                error!(
                    chain = %self.chain.name,
                    tx = %record.tx_hash,
                    first_attempt = %first,
                    "giving up on failed-withdrawal alert, still listed in the daily report"
                );
            }
            // remaining alerts wait for the next cycle
            break;
        }
    }

    fn failed_alert(&self, record: &CallRecord) -> FailedWithdrawAlert {
        let params = record.params.as_ref();
        FailedWithdrawAlert {
            chain_id: record.chain_id,
            chain_name: self.chain.name.clone(),
            contract: self.chain.contract_address,
            tx_hash: record.tx_hash,
            block_number: record.block_number,
            block_time: record.block_time(),
            withdraw_id: params.map(|p| p.id),
            trader: params.map(|p| p.trader),
            amount: record.amount(self.chain.amount_decimals),
            decode_error: if params.is_none() { record.error.clone() } else { None },
            explorer_link: tx_link(&self.chain.explorer_url, &record.tx_hash),
        }
    }

    async fn warn_stuck(&self, now: DateTime<Utc>) {
        let chain_id = self.chain.chain_id;
        for record in self.ledger.pending(chain_id).await {
            if record.status != CallStatus::Pending {
                continue;
            }
            let age = now.signed_duration_since(record.first_seen_at);
            if age <= self.settings.stale_pending {
                continue;
            }
            let key = AlertKey::new(chain_id, AlertKind::Stuck, hex_hash(&record.tx_hash));
            if !self.gate.try_fire(&key, now) {
                continue;
            }
            let alert = Alert::Stuck(StuckAlert {
                chain_id,
                chain_name: self.chain.name.clone(),
                tx_hash: record.tx_hash,
                block_number: record.block_number,
                pending_hours: age.num_hours(),
                explorer_link: tx_link(&self.chain.explorer_url, &record.tx_hash),
            });
            if self.dispatcher.dispatch(&alert).await.is_err() {
                self.gate.clear(&key);
            }
        }
    }

    async fn warn_malformed(&self, record: &CallRecord, now: DateTime<Utc>) {
        let chain_id = self.chain.chain_id;
        let key = AlertKey::new(chain_id, AlertKind::ClassificationError, hex_hash(&record.tx_hash));
        if !self.gate.try_fire(&key, now) {
            return;
        }
        let alert = Alert::ClassificationError(ClassificationErrorAlert {
            chain_id,
            chain_name: self.chain.name.clone(),
            tx_hash: record.tx_hash,
            reason: record.error.clone().unwrap_or_default(),
            explorer_link: tx_link(&self.chain.explorer_url, &record.tx_hash),
        });
        if self.dispatcher.dispatch(&alert).await.is_err() {
            self.gate.clear(&key);
        }
    }
}
