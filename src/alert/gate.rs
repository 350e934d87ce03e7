//! Cooldown suppression for recurring-condition alerts.
//!
//! Failed-withdrawal alerts are deduplicated by the ledger (`notified_at`)
//! and never pass through here.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

/// Kinds of alert subject to cooldown suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlertKind {
    LowBalance,
    Stuck,
    ClassificationError,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::LowBalance => write!(f, "LOW_BALANCE"),
            AlertKind::Stuck => write!(f, "STUCK"),
            AlertKind::ClassificationError => write!(f, "CLASSIFICATION_ERROR"),
        }
    }
}

/// Chain + kind + subject (token symbol or tx hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub chain_id: u64,
    pub kind: AlertKind,
    pub subject: String,
}

impl AlertKey {
    pub fn new(chain_id: u64, kind: AlertKind, subject: impl Into<String>) -> Self {
        Self {
            chain_id,
            kind,
            subject: subject.into(),
        }
    }
}

impl std::fmt::Display for AlertKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.chain_id, self.kind, self.subject)
    }
}

#[derive(Debug, Clone)]
pub struct Cooldowns {
    pub low_balance: Duration,
    pub stuck: Duration,
    pub classification_error: Duration,
}

impl Cooldowns {
    fn of(&self, kind: AlertKind) -> Duration {
        match kind {
            AlertKind::LowBalance => self.low_balance,
            AlertKind::Stuck => self.stuck,
            AlertKind::ClassificationError => self.classification_error,
        }
    }
}

/// One suppression entry, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct GateEntry {
    pub key: String,
    pub last_sent_at: DateTime<Utc>,
}

/// Shared across chain tasks. In-memory only; losing it at most repeats an alert.
pub struct AlertGate {
    cooldowns: Cooldowns,
    last_sent: DashMap<AlertKey, DateTime<Utc>>,
}

impl AlertGate {
    pub fn new(cooldowns: Cooldowns) -> Self {
        Self {
            cooldowns,
            last_sent: DashMap::new(),
        }
    }

    /// Atomically check the cooldown for `key` and, if it has elapsed (or the
    /// key was never fired), record `now` and return `true`.
    pub fn try_fire(&self, key: &AlertKey, now: DateTime<Utc>) -> bool {
        let cooldown = self.cooldowns.of(key.kind);
        match self.last_sent.entry(key.clone()) {
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
            Entry::Occupied(mut e) => {
                if now.signed_duration_since(*e.get()) >= cooldown {
                    e.insert(now);
                    true
                } else {
                    debug!(key = %key, "alert suppressed (cooldown)");
                    false
                }
            }
        }
    }

    /// Forget `key`; the next `try_fire` passes immediately.
    pub fn clear(&self, key: &AlertKey) -> bool {
        self.last_sent.remove(key).is_some()
    }

    pub fn entries(&self) -> Vec<GateEntry> {
        let mut out: Vec<GateEntry> = self
            .last_sent
            .iter()
            .map(|e| GateEntry {
                key: e.key().to_string(),
                last_sent_at: *e.value(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Drop entries last fired before `cutoff`. Returns how many went.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.last_sent.len();
        self.last_sent.retain(|_, sent_at| *sent_at >= cutoff);
        before - self.last_sent.len()
    }

    /// Last time any alert fired for `chain_id`.
    pub fn last_fired(&self, chain_id: u64) -> Option<DateTime<Utc>> {
        self.last_sent
            .iter()
            .filter(|e| e.key().chain_id == chain_id)
            .map(|e| *e.value())
            .max()
    }
}
