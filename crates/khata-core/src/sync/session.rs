//! Client-side sync session
//!
//! Orchestrates one push-then-pull interaction:
//! `Idle → Pushing → Pulling → Idle`, with `Failed` reachable from either
//! active state on transport failure. Per-record conflicts or rejections
//! in the push phase never block the pull phase; the pull cursor is
//! advanced only after a page has been durably applied to the shadow
//! store, so an aborted session never skips entries on resume.

use thiserror::Error;

use crate::models::{EntryId, MutationOutcome};
use crate::shadow::ShadowStore;

use super::fetcher::DEFAULT_PAGE_SIZE;
use super::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};

/// Whole-call failure: the push or pull never reached the engine.
///
/// Because commits are idempotent, restarting a session after a failed
/// push is always safe.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Carrier for push/pull calls; HTTP in production, a fake in tests
pub trait SyncTransport {
    fn push(
        &self,
        request: &PushRequest,
    ) -> impl std::future::Future<Output = Result<PushResponse, TransportError>>;
    fn pull(
        &self,
        request: &PullRequest,
    ) -> impl std::future::Future<Output = Result<PullResponse, TransportError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Pushing,
    Pulling,
    Failed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport-level failure; dirty records are retained unchanged and
    /// the whole session may be restarted later
    #[error("sync transport failed: {0}")]
    Transport(#[from] TransportError),
    /// Local shadow store failure
    #[error(transparent)]
    Shadow(#[from] crate::error::Error),
}

/// Tallies for one completed session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub accepted: usize,
    pub conflicts: usize,
    /// Entries whose local edit lost to the server copy; surfaced so the
    /// user can decide whether to re-apply the change
    pub conflicted_ids: Vec<EntryId>,
    pub rejected: usize,
    pub transient: usize,
    pub pulled_entries: usize,
    pub pulled_pages: usize,
}

/// One client sync interaction against a transport and a shadow store
pub struct SyncSession<'a, T, S> {
    transport: &'a T,
    shadow: &'a S,
    page_size: usize,
    state: SessionState,
}

impl<'a, T: SyncTransport, S: ShadowStore> SyncSession<'a, T, S> {
    pub const fn new(transport: &'a T, shadow: &'a S) -> Self {
        Self {
            transport,
            shadow,
            page_size: DEFAULT_PAGE_SIZE,
            state: SessionState::Idle,
        }
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Run one full session: push all dirty records, then pull to
    /// convergence.
    pub async fn run(&mut self) -> Result<SyncReport, SessionError> {
        let mut report = SyncReport::default();

        self.state = SessionState::Pushing;
        let mutations = self.shadow.pending_mutations()?;
        if !mutations.is_empty() {
            report.pushed = mutations.len();
            let request = PushRequest { mutations };
            let response = match self.transport.push(&request).await {
                Ok(response) => response,
                Err(error) => {
                    self.state = SessionState::Failed;
                    return Err(error.into());
                }
            };

            for result in &response.results {
                match &result.outcome {
                    MutationOutcome::Accepted { .. } => report.accepted += 1,
                    MutationOutcome::Conflict { server_record } => {
                        report.conflicts += 1;
                        report.conflicted_ids.push(server_record.id);
                    }
                    MutationOutcome::Rejected { .. } => report.rejected += 1,
                    MutationOutcome::TransientError => report.transient += 1,
                }
                self.shadow.apply_push_result(result)?;
            }
            tracing::debug!(
                pushed = report.pushed,
                accepted = report.accepted,
                conflicts = report.conflicts,
                "push phase complete"
            );
        }

        // Partial push failures never block the pull phase
        self.state = SessionState::Pulling;
        loop {
            let request = PullRequest {
                cursor: self.shadow.cursor()?,
                page_size: Some(self.page_size),
            };
            let page = match self.transport.pull(&request).await {
                Ok(page) => page,
                Err(error) => {
                    self.state = SessionState::Failed;
                    return Err(error.into());
                }
            };

            // Durable local application and cursor advance are one unit;
            // a session cancelled mid-page resumes from the old cursor
            self.shadow
                .apply_page(&page.entries, page.next_cursor.as_ref())?;
            report.pulled_entries += page.entries.len();
            report.pulled_pages += 1;

            if !page.has_more {
                break;
            }
        }

        self.state = SessionState::Idle;
        Ok(report)
    }
}
