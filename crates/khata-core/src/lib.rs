//! khata-core - Core library for Khata
//!
//! This crate contains the shared models, the server-side record store,
//! the delta sync engine, and the client shadow store used by the Khata
//! server and CLI.

pub mod error;
pub mod models;
pub mod shadow;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
pub use models::{EntryId, EntryPayload, LogEntry, OwnerId};
