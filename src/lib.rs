//! Agent Queue: leased job queue with a self-healing step worker.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod ledger;
pub mod queue;
pub mod safety;
pub mod store;
pub mod worker;
pub mod workspace;
