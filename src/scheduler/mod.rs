//! Wires the per-chain monitors together and drives them on a schedule.
//!
//! `Service` owns the shared state (ledger, balance book, alert gate,
//! dispatcher) and exposes one-shot operations used by the CLI commands.
//! `run` spawns one poll task and one balance task per chain plus a daily
//! report task, then waits for ctrl-c.

use std::sync::Arc;

use anyhow::bail;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::alert::gate::{AlertGate, GateEntry};
use crate::balance::{BalanceBook, BalanceCheckReport, BalanceMonitor, BalanceSnapshot};
use crate::config::Config;
use crate::notify::{Dispatcher, Notifier, NotifyError, StartupInfo};
use crate::onchain::adapter::ChainAdapter;
use crate::onchain::monitor::{MonitorError, MonitorSettings, PollOutcome, TransactionMonitor};
use crate::report::{DailyReport, ReportAggregator};
use crate::store::backend::LedgerBackend;
use crate::store::{LedgerStatus, LedgerStore};

/// First instant strictly after `now` whose UTC wall-clock time is `at`.
pub fn next_report_at(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub name: String,
    #[serde(flatten)]
    pub ledger: LedgerStatus,
    /// Latest delivered failed-withdrawal alert or gated warning.
    pub last_alert_at: Option<DateTime<Utc>>,
    pub balances: Vec<BalanceSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub ledger_backend: String,
    pub chains: Vec<ChainStatus>,
    pub alert_gate: Vec<GateEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainCheck {
    pub chain_id: u64,
    pub name: String,
    pub head: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityCheck {
    pub chains: Vec<ChainCheck>,
    pub notifier: String,
    pub notifier_identity: Option<String>,
    pub notifier_error: Option<String>,
}

impl ConnectivityCheck {
    pub fn is_healthy(&self) -> bool {
        self.notifier_error.is_none() && self.chains.iter().all(|c| c.error.is_none())
    }
}

pub struct Service {
    config: Config,
    ledger: Arc<LedgerStore>,
    book: Arc<BalanceBook>,
    gate: Arc<AlertGate>,
    dispatcher: Arc<Dispatcher>,
    adapters: Vec<Arc<dyn ChainAdapter>>,
    monitors: Vec<Arc<TransactionMonitor>>,
    balances: Vec<Arc<BalanceMonitor>>,
    aggregator: ReportAggregator,
    /// Components currently failing, so an outage raises one error notice.
    failing: DashMap<String, DateTime<Utc>>,
}

impl Service {
    /// `adapters[i]` serves `config.chains[i]`.
    pub fn new(
        config: Config,
        adapters: Vec<Arc<dyn ChainAdapter>>,
        backend: Arc<dyn LedgerBackend>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        if adapters.len() != config.chains.len() {
            bail!(
                "{} chain adapters for {} configured chains",
                adapters.len(),
                config.chains.len()
            );
        }

        let m = &config.monitoring;
        let ledger = Arc::new(LedgerStore::new(backend));
        let book = Arc::new(BalanceBook::new());
        let gate = Arc::new(AlertGate::new(m.cooldowns()));
        let dispatcher = Arc::new(Dispatcher::new(notifier, config.dispatch.policy()));
        let retry = config.retry.policy();
        let settings = MonitorSettings {
            reorg_overlap_blocks: m.reorg_overlap_blocks,
            initial_block_range: m.initial_block_range,
            max_block_range: m.max_block_range,
            stale_pending: m.stale_pending(),
            lock_ttl: m.ledger_lock_ttl(),
        };

        let mut monitors = Vec::with_capacity(adapters.len());
        let mut balances = Vec::with_capacity(adapters.len());
        for (chain, adapter) in config.chains.iter().zip(&adapters) {
            monitors.push(Arc::new(TransactionMonitor::new(
                chain.clone(),
                adapter.clone(),
                ledger.clone(),
                gate.clone(),
                dispatcher.clone(),
                retry.clone(),
                settings.clone(),
            )));
            balances.push(Arc::new(BalanceMonitor::new(
                chain.clone(),
                adapter.clone(),
                book.clone(),
                gate.clone(),
                dispatcher.clone(),
                retry.clone(),
                m.critical_ratio,
            )));
        }

        let aggregator = ReportAggregator::new(
            config.chains.clone(),
            ledger.clone(),
            book.clone(),
            m.critical_ratio,
        );

        Ok(Self {
            config,
            ledger,
            book,
            gate,
            dispatcher,
            adapters,
            monitors,
            balances,
            aggregator,
            failing: DashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Restore every chain's ledger from the backend.
    pub async fn load(&self) -> anyhow::Result<()> {
        for chain in &self.config.chains {
            self.ledger.load(chain.chain_id).await?;
        }
        Ok(())
    }

    /// Write every chain's ledger back, skipping chains another process holds.
    pub async fn flush_all(&self) {
        let ttl = self.config.monitoring.ledger_lock_ttl();
        for chain in &self.config.chains {
            let id = chain.chain_id;
            match self.ledger.try_lock_chain(id, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(chain = %chain.name, "ledger locked by another process, not flushing");
                    continue;
                }
                Err(e) => {
                    error!(chain = %chain.name, error = %e, "ledger lock failed");
                    continue;
                }
            }
            if let Err(e) = self.ledger.flush(id).await {
                error!(chain = %chain.name, error = %e, "ledger flush failed");
            }
            if let Err(e) = self.ledger.unlock_chain(id).await {
                warn!(chain = %chain.name, error = %e, "failed to release ledger lock");
            }
        }
    }

    /// One monitoring pass over every chain, chains in parallel.
    pub async fn poll_all(&self) -> Vec<(String, Result<PollOutcome, MonitorError>)> {
        let results = join_all(self.monitors.iter().map(|m| m.poll_once())).await;
        let mut out = Vec::with_capacity(results.len());
        for (monitor, result) in self.monitors.iter().zip(results) {
            let name = monitor.chain().name.clone();
            self.track_poll(&name, &result).await;
            out.push((name, result));
        }
        out
    }

    pub async fn check_balances(&self) -> Vec<(String, BalanceCheckReport)> {
        let reports = join_all(self.balances.iter().map(|b| b.check())).await;
        self.by_chain(reports)
    }

    /// Record current balances for the report without raising alerts.
    pub async fn snapshot_balances(&self) -> Vec<(String, BalanceCheckReport)> {
        let now = Utc::now();
        let reports = join_all(self.balances.iter().map(|b| b.snapshot_at(now))).await;
        self.by_chain(reports)
    }

    fn by_chain<T>(&self, values: Vec<T>) -> Vec<(String, T)> {
        self.config
            .chains
            .iter()
            .map(|c| c.name.clone())
            .zip(values)
            .collect()
    }

    pub async fn build_report(&self, date: NaiveDate) -> DailyReport {
        self.aggregator.build(date).await
    }

    pub async fn send_report(&self, report: &DailyReport) -> Result<(), NotifyError> {
        self.dispatcher.send_report(report).await
    }

    /// Send the report, raising a system error notice when it cannot be delivered.
    pub async fn deliver_report(&self, report: &DailyReport) -> Result<(), NotifyError> {
        const COMPONENT: &str = "DailyReporter";
        match self.send_report(report).await {
            Ok(()) => {
                self.mark_recovered(COMPONENT);
                Ok(())
            }
            Err(e) => {
                error!(date = %report.date, error = %e, "daily report not delivered");
                self.mark_failing(COMPONENT, &format!("daily report for {} not delivered: {e}", report.date))
                    .await;
                Err(e)
            }
        }
    }

    /// Drop ledger records, balance history and alert gate entries older than
    /// the retention window.
    pub async fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - self.config.monitoring.retention();
        let ttl = self.config.monitoring.ledger_lock_ttl();
        let mut records = 0;
        for chain in &self.config.chains {
            let id = chain.chain_id;
            match self.ledger.try_lock_chain(id, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(chain = %chain.name, "ledger locked by another process, prune deferred");
                    continue;
                }
                Err(e) => {
                    error!(chain = %chain.name, error = %e, "ledger lock failed, prune deferred");
                    continue;
                }
            }
            match self.ledger.load(id).await {
                Ok(()) => {
                    records += self.ledger.prune_chain_older_than(id, cutoff).await;
                    if let Err(e) = self.ledger.flush(id).await {
                        error!(chain = %chain.name, error = %e, "ledger flush failed");
                    }
                }
                Err(e) => error!(chain = %chain.name, error = %e, "ledger reload failed, prune deferred"),
            }
            if let Err(e) = self.ledger.unlock_chain(id).await {
                warn!(chain = %chain.name, error = %e, "failed to release ledger lock");
            }
        }
        let snapshots = self.book.prune_older_than(cutoff);
        let gate_entries = self.gate.prune_older_than(cutoff);
        info!(records, snapshots, gate_entries, cutoff = %cutoff, "pruned history");
    }

    pub async fn status(&self) -> ServiceStatus {
        let mut chains = Vec::with_capacity(self.config.chains.len());
        for chain in &self.config.chains {
            let ledger = self.ledger.status(chain.chain_id).await;
            let last_alert_at = ledger.last_notified_at.max(self.gate.last_fired(chain.chain_id));
            chains.push(ChainStatus {
                name: chain.name.clone(),
                ledger,
                last_alert_at,
                balances: self.book.latest_for_chain(chain.chain_id),
            });
        }
        ServiceStatus {
            ledger_backend: self.ledger.backend_name(),
            chains,
            alert_gate: self.gate.entries(),
        }
    }

    /// Head block per chain and a notifier probe.
    pub async fn check(&self) -> ConnectivityCheck {
        let heads = join_all(self.adapters.iter().map(|a| a.get_head_block_number())).await;
        let chains = self
            .config
            .chains
            .iter()
            .zip(heads)
            .map(|(chain, head)| ChainCheck {
                chain_id: chain.chain_id,
                name: chain.name.clone(),
                head: head.as_ref().ok().copied(),
                error: head.err().map(|e| e.to_string()),
            })
            .collect();

        let notifier = self.dispatcher.notifier();
        let probe = notifier.probe().await;
        ConnectivityCheck {
            chains,
            notifier: notifier.name().to_string(),
            notifier_identity: probe.as_ref().ok().cloned(),
            notifier_error: probe.err().map(|e| e.to_string()),
        }
    }

    pub fn startup_info(&self, now: DateTime<Utc>) -> StartupInfo {
        StartupInfo {
            chains: self.config.chains.iter().map(|c| c.name.clone()).collect(),
            poll_interval_minutes: self.config.monitoring.poll_interval_minutes,
            balance_check_interval_minutes: self.config.monitoring.balance_check_interval_minutes,
            report_time_utc: self.config.monitoring.report_time_utc.clone(),
            started_at: now,
        }
    }

    async fn track_poll(&self, chain: &str, result: &Result<PollOutcome, MonitorError>) {
        let component = format!("TransactionMonitor/{chain}");
        match result {
            Ok(_) => self.mark_recovered(&component),
            Err(e) => {
                error!(chain = %chain, error = %e, "poll cycle failed, watermark unchanged");
                self.mark_failing(&component, &e.to_string()).await;
            }
        }
    }

    async fn mark_failing(&self, component: &str, message: &str) {
        if self.failing.insert(component.to_string(), Utc::now()).is_some() {
            return;
        }
        if let Err(e) = self.dispatcher.notify_error(component, message).await {
            warn!(component, error = %e, "error notice not delivered");
        }
    }

    fn mark_recovered(&self, component: &str) {
        if let Some((_, since)) = self.failing.remove(component) {
            info!(component, since = %since, "component recovered");
        }
    }

    /// Run until ctrl-c. Ledgers are loaded first and flushed on the way out.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let report_time = self.config.monitoring.report_time()?;
        self.load().await?;

        info!(
            chains = self.config.chains.len(),
            backend = %self.ledger.backend_name(),
            poll_minutes = self.config.monitoring.poll_interval_minutes,
            balance_minutes = self.config.monitoring.balance_check_interval_minutes,
            report_time = %report_time,
            "scheduler starting"
        );
        if let Err(e) = self.dispatcher.notify_startup(&self.startup_info(Utc::now())).await {
            warn!(error = %e, "startup notice not delivered");
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for i in 0..self.monitors.len() {
            tasks.push(tokio::spawn(self.clone().poll_loop(i)));
            tasks.push(tokio::spawn(self.clone().balance_loop(i)));
        }
        tasks.push(tokio::spawn(self.clone().report_loop(report_time)));

        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
        for task in &tasks {
            task.abort();
        }
        self.flush_all().await;
        info!("scheduler stopped");
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>, index: usize) {
        let monitor = self.monitors[index].clone();
        let mut interval = tokio::time::interval(self.config.monitoring.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let name = monitor.chain().name.clone();
            let result = monitor.poll_once().await;
            self.track_poll(&name, &result).await;
        }
    }

    async fn balance_loop(self: Arc<Self>, index: usize) {
        let monitor = self.balances[index].clone();
        let name = self.config.chains[index].name.clone();
        let component = format!("BalanceMonitor/{name}");
        let mut interval = tokio::time::interval(self.config.monitoring.balance_check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let report = monitor.check().await;
            if report.checked == 0 && report.failures > 0 {
                self.mark_failing(&component, &format!("all {} balance fetches failed", report.failures))
                    .await;
            } else {
                self.mark_recovered(&component);
            }
        }
    }

    async fn report_loop(self: Arc<Self>, at: NaiveTime) {
        loop {
            let now = Utc::now();
            let next = next_report_at(now, at);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next = %next, "next daily report scheduled");
            tokio::time::sleep(wait).await;

            let report = self.aggregator.build_for_previous_day(Utc::now()).await;
            // failures are already logged and notified
            let _ = self.deliver_report(&report).await;
            self.prune(Utc::now()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use crate::onchain::mock::MockChain;
    use crate::onchain::types::WithdrawParams;
    use crate::store::backend::MemoryBackend;
    use alloy::primitives::{Address, B256, U256};
    use chrono::TimeZone;

    const CONFIG: &str = r#"
[retry]
max_attempts = 2
base_delay_ms = 0
max_delay_ms = 0

[dispatch]
max_attempts = 1
base_delay_ms = 0

[[chains]]
chain_id = 1
name = "Ethereum"
rpc_url = "http://localhost:8545"
explorer_url = "https://etherscan.io"
contract_address = "0x1111111111111111111111111111111111111111"

[[chains]]
chain_id = 56
name = "BNB Chain"
rpc_url = "http://localhost:8546"
explorer_url = "https://bscscan.com"
contract_address = "0x2222222222222222222222222222222222222222"
native_symbol = "BNB"
native_low_balance_threshold = "5"
"#;

    struct Fixture {
        eth: Arc<MockChain>,
        bsc: Arc<MockChain>,
        notifier: Arc<RecordingNotifier>,
        backend: Arc<dyn LedgerBackend>,
        service: Service,
    }

    fn fixture() -> Fixture {
        let config = Config::parse(CONFIG).unwrap();
        let eth = Arc::new(MockChain::new(100));
        let bsc = Arc::new(MockChain::new(200));
        let notifier = RecordingNotifier::new();
        let adapters: Vec<Arc<dyn ChainAdapter>> = vec![eth.clone(), bsc.clone()];
        let backend: Arc<dyn LedgerBackend> = Arc::new(MemoryBackend::new());
        let service = Service::new(config, adapters, backend.clone(), notifier.clone()).unwrap();
        Fixture {
            eth,
            bsc,
            notifier,
            backend,
            service,
        }
    }

    fn params() -> WithdrawParams {
        WithdrawParams {
            id: U256::from(9u8),
            trader: Address::repeat_byte(0x22),
            amount: U256::from(1_000u64),
            v: 28,
            r: B256::repeat_byte(0x01),
            s: B256::repeat_byte(0x02),
        }
    }

    fn system_errors(n: &RecordingNotifier) -> usize {
        n.sent().iter().filter(|m| m.contains("SYSTEM ERROR")).count()
    }

    #[test]
    fn test_next_report_at() {
        let at = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2026, 3, 1, 8, 59, 0).unwrap();
        let exactly = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 17, 30, 0).unwrap();
        assert_eq!(next_report_at(before, at), exactly);
        assert_eq!(next_report_at(exactly, at), exactly + Duration::days(1));
        assert_eq!(next_report_at(after, at), exactly + Duration::days(1));
    }

    #[test]
    fn test_adapter_count_must_match_chains() {
        let config = Config::parse(CONFIG).unwrap();
        let only_one: Vec<Arc<dyn ChainAdapter>> = vec![Arc::new(MockChain::new(1))];
        let result = Service::new(
            config,
            only_one,
            Arc::new(MemoryBackend::new()),
            RecordingNotifier::new(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failing_chain_does_not_block_others() {
        let f = fixture();
        let contract: Address = "0x2222222222222222222222222222222222222222".parse().unwrap();
        let hash = f.bsc.push_withdraw(1, contract, 190, &params());
        f.bsc.set_receipt(hash, false, 190);
        f.eth.fail_head(true);

        let results = f.service.poll_all().await;
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_err());
        assert!(matches!(results[1].1, Ok(PollOutcome::Completed(_))));

        let sent = f.notifier.sent();
        assert!(sent.iter().any(|m| m.contains("FAILED WITHDRAWAL DETECTED")));
        assert!(sent.iter().any(|m| m.contains("TransactionMonitor/Ethereum")));
    }

    #[tokio::test]
    async fn test_outage_raises_one_error_notice() {
        let f = fixture();
        f.eth.fail_head(true);
        f.service.poll_all().await;
        f.service.poll_all().await;
        assert_eq!(system_errors(&f.notifier), 1);

        f.eth.fail_head(false);
        f.service.poll_all().await;
        f.eth.fail_head(true);
        f.service.poll_all().await;
        assert_eq!(system_errors(&f.notifier), 2);
    }

    #[tokio::test]
    async fn test_status_reflects_ledger_and_balances() {
        let f = fixture();
        let contract: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        f.eth.push_withdraw(1, contract, 95, &params());
        f.bsc.set_native_balance(U256::from(10u64) * U256::from(10u64).pow(U256::from(18u8)));

        f.service.poll_all().await;
        let balances = f.service.check_balances().await;
        assert_eq!(balances[0].1.checked, 0);
        assert_eq!(balances[1].1.checked, 1);

        let status = f.service.status().await;
        assert_eq!(status.ledger_backend, "memory");
        assert_eq!(status.chains[0].ledger.pending, 1);
        assert_eq!(status.chains[0].ledger.watermark, Some(94));
        assert_eq!(status.chains[1].ledger.watermark, Some(200));
        assert_eq!(status.chains[1].balances.len(), 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["chains"][0]["name"], "Ethereum");
        assert_eq!(json["chains"][0]["pending"], 1);
    }

    #[tokio::test]
    async fn test_report_is_sent() {
        let f = fixture();
        let date = Utc::now().date_naive();
        let report = f.service.build_report(date).await;
        assert_eq!(report.chains.len(), 2);
        f.service.send_report(&report).await.unwrap();
        assert!(f.notifier.sent()[0].contains("DAILY WITHDRAWAL REPORT"));
    }

    #[tokio::test]
    async fn test_undelivered_report_raises_error_notice() {
        let f = fixture();
        let report = f.service.build_report(Utc::now().date_naive()).await;
        f.notifier.fail_next(1);

        assert!(f.service.deliver_report(&report).await.is_err());
        let sent = f.notifier.sent();
        assert_eq!(system_errors(&f.notifier), 1);
        assert!(sent[0].contains("DailyReporter"));

        f.service.deliver_report(&report).await.unwrap();
        f.notifier.fail_next(1);
        assert!(f.service.deliver_report(&report).await.is_err());
        // recovered in between, so the second outage notifies again
        assert_eq!(system_errors(&f.notifier), 2);
    }

    #[tokio::test]
    async fn test_report_snapshot_does_not_alert() {
        let f = fixture();
        f.bsc.set_native_balance(U256::from(10u64).pow(U256::from(18u8)));

        let snapshots = f.service.snapshot_balances().await;
        assert_eq!(snapshots[1].1.below_threshold, 1);
        assert!(f.notifier.sent().is_empty());
        assert_eq!(f.service.status().await.chains[1].balances.len(), 1);
        assert!(f.service.status().await.alert_gate.is_empty());

        let checks = f.service.check_balances().await;
        assert_eq!(checks[1].1.alerts_sent, 1);
    }

    #[tokio::test]
    async fn test_prune_drops_old_gate_entries() {
        let f = fixture();
        f.bsc.set_native_balance(U256::from(1u8));
        f.service.check_balances().await;
        assert_eq!(f.service.status().await.alert_gate.len(), 1);

        f.service.prune(Utc::now() + Duration::days(3)).await;
        assert!(f.service.status().await.alert_gate.is_empty());
    }

    #[tokio::test]
    async fn test_prune_waits_for_ledger_lock() {
        let f = fixture();
        let contract: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let hash = f.eth.push_withdraw(1, contract, 95, &params());
        f.eth.set_receipt(hash, true, 95);
        f.service.poll_all().await;

        let other = LedgerStore::new(f.backend.clone());
        assert!(other.try_lock_chain(1, std::time::Duration::from_secs(60)).await.unwrap());
        f.service.prune(Utc::now()).await;
        assert_eq!(f.service.status().await.chains[0].ledger.records, 1);

        other.unlock_chain(1).await.unwrap();
        f.service.prune(Utc::now()).await;
        assert_eq!(f.service.status().await.chains[0].ledger.records, 0);
    }

    #[tokio::test]
    async fn test_check_reports_heads_and_notifier() {
        let f = fixture();
        f.bsc.fail_head(true);
        let check = f.service.check().await;
        assert_eq!(check.chains[0].head, Some(100));
        assert!(check.chains[1].error.is_some());
        assert!(check.notifier_error.is_none());
        assert!(!check.is_healthy());
    }
}
