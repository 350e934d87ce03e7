//! Chain access and withdraw-call tracking.
//!
//! - `adapter`: the `ChainAdapter` trait every chain backend implements
//! - `rpc`: JSON-RPC adapter over an alloy HTTP provider
//! - `classifier`: recognises `withdraw(...)` calls and decodes their arguments
//! - `monitor`: per-chain poll cycle feeding the ledger and alerts
//! - `retry`: bounded backoff for provider calls

pub mod abi;
pub mod adapter;
pub mod classifier;
pub mod monitor;
pub mod retry;
pub mod rpc;
pub mod types;

#[cfg(test)]
pub mod mock;

pub use adapter::{ChainAdapter, ProviderError};
pub use monitor::{MonitorSettings, PollOutcome, PollReport, TransactionMonitor};
