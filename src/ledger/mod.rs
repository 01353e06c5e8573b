//! Append-only event and artifact ledger.

pub mod artifacts;
pub mod events;

pub use artifacts::{ArtifactStorage, StoredBlob};
pub use events::{EventBus, EventUpdate};
