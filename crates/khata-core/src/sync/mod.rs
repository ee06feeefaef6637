//! Delta synchronization engine
//!
//! Push: a batch of client mutations is committed one independent atomic
//! operation per record, with optimistic concurrency on the version
//! counter and fingerprint-based idempotent retries. Pull: a keyset
//! paginated feed of everything that changed after a client watermark,
//! tombstones included. The session type orchestrates push-then-pull on
//! the client side.

pub mod committer;
pub mod fetcher;
pub mod protocol;
pub mod resolver;
pub mod session;

pub use committer::{commit_batch, CommitContext};
pub use fetcher::{fetch_delta, DeltaPage, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
pub use resolver::{resolve, Resolution};
pub use session::{SessionError, SessionState, SyncReport, SyncSession, SyncTransport, TransportError};
