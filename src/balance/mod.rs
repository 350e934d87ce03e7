//! Balance checks for the monitored contract's token and native holdings.
//!
//! Every check records a `BalanceSnapshot` in the shared `BalanceBook`. The
//! latest snapshot per token drives alerting; the bounded history lets the
//! daily report show balances as of the report cutoff.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::alert::gate::{AlertGate, AlertKey, AlertKind};
use crate::alert::{address_link, Alert, LowBalanceAlert};
use crate::config::ChainConfig;
use crate::notify::Dispatcher;
use crate::onchain::adapter::{ChainAdapter, ProviderError};
use crate::onchain::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub chain_id: u64,
    pub token_symbol: String,
    /// `None` for the native asset.
    pub token_address: Option<Address>,
    pub contract_address: Address,
    pub amount: Decimal,
    pub threshold: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    pub fn is_below_threshold(&self) -> bool {
        self.amount < self.threshold
    }

    pub fn is_critical(&self, ratio: Decimal) -> bool {
        self.amount < self.threshold * ratio
    }
}

/// Snapshot history keyed by `(chain_id, token_symbol)`, oldest first.
#[derive(Default)]
pub struct BalanceBook {
    history: RwLock<HashMap<(u64, String), VecDeque<BalanceSnapshot>>>,
}

impl BalanceBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, snapshot: BalanceSnapshot) {
        let key = (snapshot.chain_id, snapshot.token_symbol.clone());
        let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
        let entries = history.entry(key).or_default();
        // keep observation order even if clocks hiccup
        let pos = entries
            .iter()
            .rposition(|s| s.observed_at <= snapshot.observed_at)
            .map_or(0, |i| i + 1);
        entries.insert(pos, snapshot);
    }

    pub fn latest(&self, chain_id: u64, token_symbol: &str) -> Option<BalanceSnapshot> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        history
            .get(&(chain_id, token_symbol.to_string()))
            .and_then(|h| h.back().cloned())
    }

    /// Snapshot observed closest to `at`. Ties go to the earlier observation.
    pub fn nearest(&self, chain_id: u64, token_symbol: &str, at: DateTime<Utc>) -> Option<BalanceSnapshot> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        history
            .get(&(chain_id, token_symbol.to_string()))?
            .iter()
            .min_by_key(|s| (s.observed_at - at).num_milliseconds().abs())
            .cloned()
    }

    /// Latest snapshot of every token on `chain_id`, ordered by symbol.
    pub fn latest_for_chain(&self, chain_id: u64) -> Vec<BalanceSnapshot> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<BalanceSnapshot> = history
            .iter()
            .filter(|((id, _), _)| *id == chain_id)
            .filter_map(|(_, h)| h.back().cloned())
            .collect();
        out.sort_by(|a, b| a.token_symbol.cmp(&b.token_symbol));
        out
    }

    /// Drop snapshots older than `cutoff`, always keeping the latest per token.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for entries in history.values_mut() {
            while entries.len() > 1 && entries.front().is_some_and(|s| s.observed_at < cutoff) {
                entries.pop_front();
                removed += 1;
            }
        }
        removed
    }
}

/// One asset to check: a configured token, or the native asset (`token = None`).
#[derive(Debug, Clone)]
struct Target {
    symbol: String,
    token: Option<Address>,
    threshold: Decimal,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BalanceCheckReport {
    pub checked: usize,
    pub below_threshold: usize,
    pub alerts_sent: usize,
    pub failures: usize,
}

pub struct BalanceMonitor {
    chain: ChainConfig,
    adapter: Arc<dyn ChainAdapter>,
    book: Arc<BalanceBook>,
    gate: Arc<AlertGate>,
    dispatcher: Arc<Dispatcher>,
    retry: RetryPolicy,
    critical_ratio: Decimal,
}

impl BalanceMonitor {
    pub fn new(
        chain: ChainConfig,
        adapter: Arc<dyn ChainAdapter>,
        book: Arc<BalanceBook>,
        gate: Arc<AlertGate>,
        dispatcher: Arc<Dispatcher>,
        retry: RetryPolicy,
        critical_ratio: Decimal,
    ) -> Self {
        Self {
            chain,
            adapter,
            book,
            gate,
            dispatcher,
            retry,
            critical_ratio,
        }
    }

    fn targets(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = self
            .chain
            .tokens
            .iter()
            .map(|t| Target {
                symbol: t.symbol.clone(),
                token: Some(t.contract_address),
                threshold: t.low_balance_threshold,
            })
            .collect();
        if let Some(threshold) = self.chain.native_low_balance_threshold {
            targets.push(Target {
                symbol: self.chain.native_symbol.clone(),
                token: None,
                threshold,
            });
        }
        targets
    }

    pub async fn check(&self) -> BalanceCheckReport {
        self.check_at(Utc::now()).await
    }

    /// Fetch and record every balance without touching the alert gate.
    /// Used when a one-off command needs fresh figures but must not alert.
    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> BalanceCheckReport {
        let mut report = BalanceCheckReport::default();
        for target in self.targets() {
            if let Some(snapshot) = self.observe(&target, now, &mut report).await {
                if snapshot.is_below_threshold() {
                    report.below_threshold += 1;
                }
            }
        }
        debug!(chain = %self.chain.name, checked = report.checked, "balances recorded");
        report
    }

    async fn observe(
        &self,
        target: &Target,
        now: DateTime<Utc>,
        report: &mut BalanceCheckReport,
    ) -> Option<BalanceSnapshot> {
        let amount = match self.fetch(target).await {
            Ok(amount) => amount,
            Err(e) => {
                error!(chain = %self.chain.name, token = %target.symbol, error = %e, "balance fetch failed");
                report.failures += 1;
                return None;
            }
        };
        report.checked += 1;

        let snapshot = BalanceSnapshot {
            chain_id: self.chain.chain_id,
            token_symbol: target.symbol.clone(),
            token_address: target.token,
            contract_address: self.chain.contract_address,
            amount,
            threshold: target.threshold,
            observed_at: now,
        };
        self.book.record(snapshot.clone());
        Some(snapshot)
    }

    pub async fn check_at(&self, now: DateTime<Utc>) -> BalanceCheckReport {
        let mut report = BalanceCheckReport::default();
        for target in self.targets() {
            let Some(snapshot) = self.observe(&target, now, &mut report).await else {
                continue;
            };
            let amount = snapshot.amount;

            let key = AlertKey::new(self.chain.chain_id, AlertKind::LowBalance, target.symbol.as_str());
            if !snapshot.is_below_threshold() {
                if self.gate.clear(&key) {
                    info!(chain = %self.chain.name, token = %target.symbol, balance = %amount, "balance recovered");
                }
                continue;
            }

            report.below_threshold += 1;
            warn!(
                chain = %self.chain.name,
                token = %target.symbol,
                balance = %amount,
                threshold = %target.threshold,
                "LOW BALANCE"
            );
            if !self.gate.try_fire(&key, now) {
                continue;
            }

            let alert = Alert::LowBalance(LowBalanceAlert {
                chain_id: self.chain.chain_id,
                chain_name: self.chain.name.clone(),
                contract: self.chain.contract_address,
                token_symbol: target.symbol.clone(),
                token_address: target.token,
                balance: amount,
                threshold: target.threshold,
                critical: snapshot.is_critical(self.critical_ratio),
                explorer_link: address_link(&self.chain.explorer_url, &self.chain.contract_address),
            });
            match self.dispatcher.dispatch(&alert).await {
                Ok(()) => report.alerts_sent += 1,
                Err(_) => {
                    // let the next check try again
                    self.gate.clear(&key);
                }
            }
        }

        info!(
            chain = %self.chain.name,
            checked = report.checked,
            below = report.below_threshold,
            alerts = report.alerts_sent,
            failures = report.failures,
            "balance check complete"
        );
        report
    }

    async fn fetch(&self, target: &Target) -> Result<Decimal, ProviderError> {
        let holder = self.chain.contract_address;
        let raw = match target.token {
            Some(token) => {
                self.retry
                    .run("token_balance", || self.adapter.get_token_balance(holder, token))
                    .await?
            }
            None => {
                self.retry
                    .run("native_balance", || self.adapter.get_native_balance(holder))
                    .await?
            }
        };
        raw.to_decimal().ok_or_else(|| {
            ProviderError::Malformed(format!("balance {} does not fit a decimal", raw.value))
        })
    }
}
