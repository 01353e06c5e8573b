//! Persistence layer: libSQL-backed storage for jobs, events and artifacts.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlJobStore;
pub use traits::{ClaimOutcome, JobStore, ReclaimedJob};
