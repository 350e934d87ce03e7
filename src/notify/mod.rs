//! Notification delivery.
//!
//! A `Notifier` sends one message and nothing more. The `Dispatcher` renders
//! alerts and reports, bounds every send with a timeout and retries failed
//! deliveries with exponential backoff. Whether a failed-withdrawal alert is
//! attempted again on a later cycle is decided by the ledger, not here.

pub mod render;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::alert::Alert;
use crate::report::DailyReport;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),
    #[error("notification API rejected message (status {status}): {description}")]
    Api { status: u16, description: String },
    #[error("notification send timed out after {0}s")]
    Timeout(u64),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// A delivery channel. Implementations do not retry internally.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), NotifyError>;

    /// Connectivity check for the `check` command. Returns a short identity.
    async fn probe(&self) -> Result<String, NotifyError> {
        Ok(self.name().to_string())
    }

    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub send_timeout: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// What the startup notice reports.
#[derive(Debug, Clone)]
pub struct StartupInfo {
    pub chains: Vec<String>,
    pub poll_interval_minutes: u64,
    pub balance_check_interval_minutes: u64,
    pub report_time_utc: String,
    pub started_at: DateTime<Utc>,
}

pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, policy: DispatchPolicy) -> Self {
        Self { notifier, policy }
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub async fn dispatch(&self, alert: &Alert) -> Result<(), NotifyError> {
        let text = render::alert(alert);
        let result = self.send_text(&text).await;
        match &result {
            Ok(()) => info!(kind = alert.label(), chain_id = alert.chain_id(), "alert delivered"),
            Err(e) => warn!(kind = alert.label(), chain_id = alert.chain_id(), error = %e, "alert not delivered"),
        }
        result
    }

    pub async fn send_report(&self, report: &DailyReport) -> Result<(), NotifyError> {
        let text = render::report(report);
        self.send_text(&text).await?;
        info!(date = %report.date, chains = report.chains.len(), "daily report delivered");
        Ok(())
    }

    pub async fn notify_startup(&self, info: &StartupInfo) -> Result<(), NotifyError> {
        self.send_text(&render::startup(info)).await
    }

    pub async fn notify_error(&self, component: &str, message: &str) -> Result<(), NotifyError> {
        self.send_text(&render::system_error(component, message, Utc::now()))
            .await
    }

    /// Send with timeout and bounded retry.
    pub async fn send_text(&self, text: &str) -> Result<(), NotifyError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last = String::new();
        for attempt in 0..attempts {
            let sent = tokio::time::timeout(self.policy.send_timeout, self.notifier.send(text)).await;
            let err = match sent {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => NotifyError::Timeout(self.policy.send_timeout.as_secs()),
            };
            warn!(
                notifier = self.notifier.name(),
                attempt = attempt + 1,
                max_attempts = attempts,
                error = %err,
                "notification send failed"
            );
            last = err.to_string();

            if attempt + 1 < attempts {
                let wait = self.policy.base_delay.saturating_mul(2u32.saturating_pow(attempt));
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }
        Err(NotifyError::Exhausted { attempts, last })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_retries_then_delivers() {
        let rec = RecordingNotifier::new();
        let d = Dispatcher::new(rec.clone(), instant_policy(3));
        rec.fail_next(2);
        d.send_text("hello").await.unwrap();
        assert_eq!(rec.attempts(), 3);
        assert_eq!(rec.sent(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let rec = RecordingNotifier::new();
        let d = Dispatcher::new(rec.clone(), instant_policy(2));
        rec.set_down(true);
        let err = d.send_text("hello").await.unwrap_err();
        assert!(matches!(err, NotifyError::Exhausted { attempts: 2, .. }));
        assert_eq!(rec.attempts(), 2);
        assert!(rec.sent().is_empty());
    }
}
