//! Shared data models

pub mod entry;
pub mod mutation;

pub use entry::{EntryId, EntryPayload, LogEntry, OwnerId};
pub use mutation::{EntryMutation, MutationKind, MutationOutcome, MutationResult};
