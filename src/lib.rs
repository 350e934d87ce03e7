//! Failed `withdraw(...)` call monitor for EVM chains.
//!
//! Modules are shared between the `withdraw-watch` binary and the tests.

pub mod alert;
pub mod balance;
pub mod config;
pub mod notify;
pub mod onchain;
pub mod report;
pub mod scheduler;
pub mod store;
