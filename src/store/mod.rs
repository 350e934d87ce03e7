//! Per-chain ledger of observed withdraw calls.
//!
//! State lives in memory, partitioned per chain, and is written through to a
//! `LedgerBackend` whenever the monitor flushes a chain. Different chains
//! never contend; mutations on one chain are serialized by its mutex.

pub mod backend;
pub mod record;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::backend::LedgerBackend;
use crate::store::record::{CallRecord, CallStatus, ChainLedgerSnapshot, ResolveOutcome};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("no record for {tx_hash} on chain {chain_id}")]
    UnknownRecord { chain_id: u64, tx_hash: B256 },
    #[error("ledger backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Default)]
struct ChainLedger {
    watermark: Option<u64>,
    records: HashMap<B256, CallRecord>,
}

impl ChainLedger {
    fn snapshot(&self, chain_id: u64) -> ChainLedgerSnapshot {
        let mut records: Vec<CallRecord> = self.records.values().cloned().collect();
        records.sort_by_key(|r| r.sort_key());
        ChainLedgerSnapshot {
            chain_id,
            watermark: self.watermark,
            records,
        }
    }

    fn sorted<F>(&self, keep: F) -> Vec<CallRecord>
    where
        F: Fn(&CallRecord) -> bool,
    {
        let mut out: Vec<CallRecord> = self.records.values().filter(|r| keep(r)).cloned().collect();
        out.sort_by_key(|r| r.sort_key());
        out
    }
}

/// Point-in-time counters for one chain, used by the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerStatus {
    pub chain_id: u64,
    pub watermark: Option<u64>,
    pub records: usize,
    pub pending: usize,
    pub classification_errors: usize,
    pub unnotified_failures: usize,
    pub abandoned_alerts: usize,
    pub last_notified_at: Option<DateTime<Utc>>,
}

static STORE_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct LedgerStore {
    chains: DashMap<u64, Arc<Mutex<ChainLedger>>>,
    backend: Arc<dyn LedgerBackend>,
    /// Identity used for backend chain locks, unique per store instance.
    owner: String,
}

impl LedgerStore {
    pub fn new(backend: Arc<dyn LedgerBackend>) -> Self {
        let owner = format!(
            "pid-{}-{}",
            std::process::id(),
            STORE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            chains: DashMap::new(),
            backend,
            owner,
        }
    }

    pub fn backend_name(&self) -> String {
        self.backend.describe()
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn chain(&self, chain_id: u64) -> Arc<Mutex<ChainLedger>> {
        self.chains
            .entry(chain_id)
            .or_insert_with(|| Arc::new(Mutex::new(ChainLedger::default())))
            .clone()
    }

    // --- Durability ---

    /// Replace the in-memory state of `chain_id` with the backend snapshot, if any.
    pub async fn load(&self, chain_id: u64) -> Result<(), LedgerError> {
        let chain = self.chain(chain_id);
        let mut ledger = chain.lock().await;
        match self.backend.load(chain_id).await? {
            Some(snapshot) => {
                ledger.watermark = snapshot.watermark;
                ledger.records = snapshot
                    .records
                    .into_iter()
                    .filter(|r| r.chain_id == chain_id)
                    .map(|r| (r.tx_hash, r))
                    .collect();
                info!(
                    chain_id,
                    watermark = ?ledger.watermark,
                    records = ledger.records.len(),
                    "loaded ledger"
                );
            }
            None => debug!(chain_id, "no stored ledger, starting fresh"),
        }
        Ok(())
    }

    pub async fn flush(&self, chain_id: u64) -> Result<(), LedgerError> {
        let chain = self.chain(chain_id);
        let ledger = chain.lock().await;
        self.backend.store(&ledger.snapshot(chain_id)).await?;
        Ok(())
    }

    /// Take the backend lock for `chain_id`. `false` means another process
    /// is working on the chain.
    pub async fn try_lock_chain(&self, chain_id: u64, ttl: Duration) -> Result<bool, LedgerError> {
        let locked = self.backend.try_lock(chain_id, &self.owner, ttl).await?;
        if !locked {
            debug!(chain_id, owner = %self.owner, "chain ledger held elsewhere");
        }
        Ok(locked)
    }

    pub async fn unlock_chain(&self, chain_id: u64) -> Result<(), LedgerError> {
        self.backend.unlock(chain_id, &self.owner).await?;
        Ok(())
    }

    // --- Records ---

    /// Insert `record` if its hash is unseen. Returns `true` on insert.
    pub async fn upsert_candidate(&self, record: CallRecord) -> bool {
        let chain = self.chain(record.chain_id);
        let mut ledger = chain.lock().await;
        if ledger.records.contains_key(&record.tx_hash) {
            return false;
        }
        debug!(chain_id = record.chain_id, tx = %record.tx_hash, block = record.block_number, "new withdraw call");
        ledger.records.insert(record.tx_hash, record);
        true
    }

    pub async fn get(&self, chain_id: u64, tx_hash: B256) -> Option<CallRecord> {
        let chain = self.chain(chain_id);
        let ledger = chain.lock().await;
        ledger.records.get(&tx_hash).cloned()
    }

    /// Apply a receipt status. Block number and timestamp are refreshed from
    /// the receipt when present.
    pub async fn resolve(
        &self,
        chain_id: u64,
        tx_hash: B256,
        status: CallStatus,
        block_number: Option<u64>,
        block_timestamp: Option<u64>,
        at: DateTime<Utc>,
    ) -> Result<ResolveOutcome, LedgerError> {
        let chain = self.chain(chain_id);
        let mut ledger = chain.lock().await;
        let record = ledger
            .records
            .get_mut(&tx_hash)
            .ok_or(LedgerError::UnknownRecord { chain_id, tx_hash })?;

        if let Some(n) = block_number {
            record.block_number = n;
        }
        if let Some(ts) = block_timestamp {
            record.block_timestamp = ts;
        }

        let from = record.status;
        if from == status {
            return Ok(ResolveOutcome::Unchanged);
        }

        record.status = status;
        record.resolved_at = if status == CallStatus::Pending { None } else { Some(at) };
        if from == CallStatus::ClassificationError {
            record.error = None;
        }

        let outcome = if status == CallStatus::Failed && record.notified_at.is_none() {
            ResolveOutcome::NewlyFailed
        } else if from.is_resolved() {
            warn!(chain_id, tx = %tx_hash, from = %from, to = %status, "call status flipped");
            ResolveOutcome::Flipped { from }
        } else {
            ResolveOutcome::Resolved
        };
        Ok(outcome)
    }

    /// Record that the receipt for `tx_hash` could not be interpreted.
    /// Returns `true` if the record was not already in that state.
    pub async fn mark_classification_error(
        &self,
        chain_id: u64,
        tx_hash: B256,
        reason: &str,
    ) -> Result<bool, LedgerError> {
        let chain = self.chain(chain_id);
        let mut ledger = chain.lock().await;
        let record = ledger
            .records
            .get_mut(&tx_hash)
            .ok_or(LedgerError::UnknownRecord { chain_id, tx_hash })?;
        let newly = record.status != CallStatus::ClassificationError;
        record.status = CallStatus::ClassificationError;
        record.error = Some(reason.to_string());
        Ok(newly)
    }

    /// First write wins. Returns `true` if this call set the timestamp.
    pub async fn mark_notified(&self, chain_id: u64, tx_hash: B256, at: DateTime<Utc>) -> bool {
        let chain = self.chain(chain_id);
        let mut ledger = chain.lock().await;
        match ledger.records.get_mut(&tx_hash) {
            Some(record) if record.notified_at.is_none() => {
                record.notified_at = Some(at);
                true
            }
            _ => false,
        }
    }

    /// Record a failed delivery attempt. Returns the time of the first one.
    pub async fn mark_dispatch_failed(
        &self,
        chain_id: u64,
        tx_hash: B256,
        at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let chain = self.chain(chain_id);
        let mut ledger = chain.lock().await;
        let record = ledger.records.get_mut(&tx_hash)?;
        Some(*record.first_dispatch_attempt_at.get_or_insert(at))
    }

    pub async fn mark_alert_abandoned(&self, chain_id: u64, tx_hash: B256) -> bool {
        let chain = self.chain(chain_id);
        let mut ledger = chain.lock().await;
        match ledger.records.get_mut(&tx_hash) {
            Some(record) if !record.alert_abandoned => {
                record.alert_abandoned = true;
                true
            }
            _ => false,
        }
    }

    // --- Queries ---

    /// Records with `block_timestamp` in `[from, to)`, ordered by block then hash.
    pub async fn query_range(
        &self,
        chain_id: u64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<CallRecord> {
        let (from, to) = (from.timestamp(), to.timestamp());
        let chain = self.chain(chain_id);
        let ledger = chain.lock().await;
        ledger.sorted(|r| {
            let ts = i64::try_from(r.block_timestamp).unwrap_or(i64::MAX);
            ts >= from && ts < to
        })
    }

    /// Records still waiting on a definitive receipt.
    pub async fn pending(&self, chain_id: u64) -> Vec<CallRecord> {
        let chain = self.chain(chain_id);
        let ledger = chain.lock().await;
        ledger.sorted(|r| r.status.needs_receipt())
    }

    /// Failed calls whose alert has not been delivered or abandoned.
    pub async fn alert_candidates(&self, chain_id: u64) -> Vec<CallRecord> {
        let chain = self.chain(chain_id);
        let ledger = chain.lock().await;
        ledger.sorted(|r| r.awaits_alert())
    }

    pub async fn watermark(&self, chain_id: u64) -> Option<u64> {
        let chain = self.chain(chain_id);
        let ledger = chain.lock().await;
        ledger.watermark
    }

    /// Advance the watermark. It never moves backwards; returns the stored value.
    pub async fn set_watermark(&self, chain_id: u64, height: u64) -> u64 {
        let chain = self.chain(chain_id);
        let mut ledger = chain.lock().await;
        let next = ledger.watermark.map_or(height, |w| w.max(height));
        ledger.watermark = Some(next);
        next
    }

    /// Drop settled records on `chain_id` whose block is older than `cutoff`.
    pub async fn prune_chain_older_than(&self, chain_id: u64, cutoff: DateTime<Utc>) -> usize {
        let cutoff = cutoff.timestamp();
        let chain = self.chain(chain_id);
        let mut ledger = chain.lock().await;
        let before = ledger.records.len();
        ledger.records.retain(|_, r| {
            let old = i64::try_from(r.block_timestamp).map_or(false, |ts| ts < cutoff);
            !(old && r.is_settled())
        });
        let removed = before - ledger.records.len();
        if removed > 0 {
            debug!(chain_id, pruned = removed, "pruned settled records");
        }
        removed
    }

    pub async fn status(&self, chain_id: u64) -> LedgerStatus {
        let chain = self.chain(chain_id);
        let ledger = chain.lock().await;
        let records = ledger.records.values();
        let count = |status: CallStatus| records.clone().filter(|r| r.status == status).count();
        LedgerStatus {
            chain_id,
            watermark: ledger.watermark,
            records: ledger.records.len(),
            pending: count(CallStatus::Pending),
            classification_errors: count(CallStatus::ClassificationError),
            unnotified_failures: records.clone().filter(|r| r.awaits_alert()).count(),
            abandoned_alerts: records.clone().filter(|r| r.alert_abandoned).count(),
            last_notified_at: records.clone().filter_map(|r| r.notified_at).max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onchain::classifier::Classification;
    use crate::onchain::types::CandidateTx;
    use crate::store::backend::{FileBackend, MemoryBackend};
    use alloy::primitives::{Address, Bytes};
    use chrono::TimeZone;

    const CHAIN: u64 = 1;

    fn store() -> LedgerStore {
        LedgerStore::new(Arc::new(MemoryBackend::new()))
    }

    fn record(seed: u8, block: u64, ts: u64) -> CallRecord {
        let tx = CandidateTx {
            hash: B256::repeat_byte(seed),
            block_number: block,
            block_timestamp: ts,
            from: None,
            to: Some(Address::repeat_byte(0x11)),
            input: Bytes::new(),
        };
        CallRecord::from_classification(
            CHAIN,
            &tx,
            Classification::MatchedUndecodable("empty".into()),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let s = store();
        assert!(s.upsert_candidate(record(1, 10, 100)).await);
        assert!(!s.upsert_candidate(record(1, 10, 100)).await);
        assert_eq!(s.pending(CHAIN).await.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_outcomes() {
        let s = store();
        let now = Utc::now();
        let a = B256::repeat_byte(1);
        let b = B256::repeat_byte(2);
        s.upsert_candidate(record(1, 10, 100)).await;
        s.upsert_candidate(record(2, 11, 100)).await;

        let out = s.resolve(CHAIN, a, CallStatus::Success, Some(12), None, now).await.unwrap();
        assert_eq!(out, ResolveOutcome::Resolved);
        assert_eq!(s.get(CHAIN, a).await.unwrap().block_number, 12);

        let out = s.resolve(CHAIN, a, CallStatus::Success, None, None, now).await.unwrap();
        assert_eq!(out, ResolveOutcome::Unchanged);

        let out = s.resolve(CHAIN, b, CallStatus::Failed, None, None, now).await.unwrap();
        assert_eq!(out, ResolveOutcome::NewlyFailed);
        assert!(s.mark_notified(CHAIN, b, now).await);
        assert!(!s.mark_notified(CHAIN, b, now).await);

        // reorg: a notified failure that later succeeds is a flip, not a new alert
        let out = s.resolve(CHAIN, b, CallStatus::Success, None, None, now).await.unwrap();
        assert_eq!(out, ResolveOutcome::Flipped { from: CallStatus::Failed });

        // a success that turns into an unnotified failure must alert
        let out = s.resolve(CHAIN, a, CallStatus::Failed, None, None, now).await.unwrap();
        assert_eq!(out, ResolveOutcome::NewlyFailed);
    }

    #[tokio::test]
    async fn test_resolve_unknown_record() {
        let s = store();
        let err = s
            .resolve(CHAIN, B256::repeat_byte(9), CallStatus::Failed, None, None, Utc::now())
            .await;
        assert!(matches!(err, Err(LedgerError::UnknownRecord { .. })));
    }

    #[tokio::test]
    async fn test_watermark_is_monotonic() {
        let s = store();
        assert_eq!(s.watermark(CHAIN).await, None);
        assert_eq!(s.set_watermark(CHAIN, 100).await, 100);
        assert_eq!(s.set_watermark(CHAIN, 90).await, 100);
        assert_eq!(s.watermark(CHAIN).await, Some(100));
    }

    #[tokio::test]
    async fn test_query_range_is_half_open_and_ordered() {
        let s = store();
        s.upsert_candidate(record(3, 20, 200)).await;
        s.upsert_candidate(record(2, 20, 150)).await;
        s.upsert_candidate(record(1, 10, 100)).await;
        s.upsert_candidate(record(4, 30, 300)).await;

        let from = Utc.timestamp_opt(100, 0).unwrap();
        let to = Utc.timestamp_opt(300, 0).unwrap();
        let got: Vec<B256> = s.query_range(CHAIN, from, to).await.iter().map(|r| r.tx_hash).collect();
        assert_eq!(
            got,
            vec![B256::repeat_byte(1), B256::repeat_byte(2), B256::repeat_byte(3)]
        );
    }

    #[tokio::test]
    async fn test_prune_keeps_unsettled() {
        let s = store();
        let now = Utc::now();
        for seed in 1..=3 {
            s.upsert_candidate(record(seed, 10, 100)).await;
        }
        s.resolve(CHAIN, B256::repeat_byte(1), CallStatus::Success, None, None, now).await.unwrap();
        s.resolve(CHAIN, B256::repeat_byte(2), CallStatus::Failed, None, None, now).await.unwrap();

        let removed = s.prune_chain_older_than(CHAIN, Utc.timestamp_opt(1_000, 0).unwrap()).await;
        assert_eq!(removed, 1);
        assert!(s.get(CHAIN, B256::repeat_byte(2)).await.is_some());
        assert!(s.get(CHAIN, B256::repeat_byte(3)).await.is_some());
    }

    #[tokio::test]
    async fn test_flush_and_reload_through_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn LedgerBackend> = Arc::new(FileBackend::new(dir.path()).unwrap());
        let now = Utc::now();

        let s = LedgerStore::new(backend.clone());
        s.upsert_candidate(record(1, 10, 100)).await;
        s.resolve(CHAIN, B256::repeat_byte(1), CallStatus::Failed, None, None, now).await.unwrap();
        s.set_watermark(CHAIN, 42).await;
        s.flush(CHAIN).await.unwrap();

        let restarted = LedgerStore::new(backend);
        restarted.load(CHAIN).await.unwrap();
        assert_eq!(restarted.watermark(CHAIN).await, Some(42));
        let candidates = restarted.alert_candidates(CHAIN).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].status, CallStatus::Failed);
    }

    #[tokio::test]
    async fn test_chain_lock_is_per_store() {
        let backend: Arc<dyn LedgerBackend> = Arc::new(MemoryBackend::new());
        let daemon = LedgerStore::new(backend.clone());
        let manual = LedgerStore::new(backend);
        let ttl = Duration::from_secs(60);
        assert_ne!(daemon.owner(), manual.owner());

        assert!(daemon.try_lock_chain(CHAIN, ttl).await.unwrap());
        assert!(!manual.try_lock_chain(CHAIN, ttl).await.unwrap());
        daemon.unlock_chain(CHAIN).await.unwrap();
        assert!(manual.try_lock_chain(CHAIN, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_failure_keeps_first_attempt() {
        let s = store();
        let hash = B256::repeat_byte(1);
        let first = Utc.timestamp_opt(1_000, 0).unwrap();
        let later = Utc.timestamp_opt(2_000, 0).unwrap();
        assert_eq!(s.mark_dispatch_failed(CHAIN, hash, first).await, None);

        s.upsert_candidate(record(1, 10, 100)).await;
        assert_eq!(s.mark_dispatch_failed(CHAIN, hash, first).await, Some(first));
        assert_eq!(s.mark_dispatch_failed(CHAIN, hash, later).await, Some(first));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let s = store();
        let now = Utc::now();
        s.upsert_candidate(record(1, 10, 100)).await;
        s.upsert_candidate(record(2, 11, 100)).await;
        s.resolve(CHAIN, B256::repeat_byte(2), CallStatus::Failed, None, None, now).await.unwrap();
        let st = s.status(CHAIN).await;
        assert_eq!(st.records, 2);
        assert_eq!(st.pending, 1);
        assert_eq!(st.unnotified_failures, 1);
        assert_eq!(st.last_notified_at, None);
    }
}
