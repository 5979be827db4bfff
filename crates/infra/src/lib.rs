//! Infrastructure layer of the channel sync engine: stores, channel access,
//! orchestration and scheduling.
//!
//! Every store has an in-memory implementation (tests, single-process runs)
//! and a Postgres one behind the same trait.

pub mod channel;
pub mod config;
pub mod db;
pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;
pub mod queue;
pub mod rates;
pub mod reservations;
pub mod scheduler;
pub mod sync_log;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod testing;
