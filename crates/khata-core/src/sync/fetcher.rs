//! Delta fetcher (pull side)
//!
//! Serves every record changed after a client watermark in a stable
//! total order, paginated. The ordering key is `(last_modified, id)`
//! ascending; the id component breaks stamp ties so pagination never
//! skips or duplicates a record.

use crate::error::Result;
use crate::models::{LogEntry, OwnerId};
use crate::store::{Cursor, RecordStore};

/// Page size applied when the client does not ask for one
pub const DEFAULT_PAGE_SIZE: usize = 100;
/// Upper bound on a single page
pub const MAX_PAGE_SIZE: usize = 500;

/// One page of the delta feed
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaPage {
    pub entries: Vec<LogEntry>,
    /// Watermark to resume from; unchanged when the page is empty
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

/// Fetch the next page of changes after `cursor` for `owner`.
///
/// Tombstones are included like any other mutation so clients can purge
/// them locally. Any mutation committed before the pull started is
/// guaranteed to appear before the cursor reaches "now"; mutations
/// committed concurrently surface in this pull or the next, never lost.
pub fn fetch_delta(
    store: &dyn RecordStore,
    owner: &OwnerId,
    cursor: Option<&Cursor>,
    page_size: usize,
) -> Result<DeltaPage> {
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

    // Over-fetch by one to learn whether more pages remain
    let mut entries = store.scan_after(owner, cursor, page_size + 1)?;
    let has_more = entries.len() > page_size;
    entries.truncate(page_size);

    let next_cursor = entries
        .last()
        .map(|entry| Cursor {
            last_modified: entry.last_modified,
            last_id: entry.id,
        })
        .or_else(|| cursor.copied());

    Ok(DeltaPage {
        entries,
        next_cursor,
        has_more,
    })
}
