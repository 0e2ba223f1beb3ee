//! A single-writer proof-of-work ledger.
//!
//! [`blockchain`] holds the chain, its consensus rules, persistence and the
//! miner. [`sync`] reconciles chains between peers under the longest valid
//! chain rule. [`config`] reads node settings from the environment.

pub mod blockchain;
pub mod config;
pub mod sync;
