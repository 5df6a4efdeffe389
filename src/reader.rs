//! # Reader
//!
//! Forward and backward paging over concrete streams and `$all`.
//!
//! A read's cursor key depends on the target: stream version for a concrete
//! stream, global sequence for `$all`. The events themselves always carry
//! their *original* stream identity and `event_number` — reading through a
//! link or through `$all` changes only [`RecordedEvent::position`].
//!
//! Deleted-state mapping: a soft-deleted stream reads as
//! [`Error::StreamDeleted`]; a hard-deleted (tombstoned) name also reads as
//! `StreamDeleted` until it is recreated; a name with no history reads as
//! [`Error::StreamNotFound`]. `$all` never fails for deletion reasons — hard
//! deleted events are simply gone from it.

use futures::stream::{self, Stream};

use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::{DeletedState, Position, RecordedEvent, StreamUuid};

// =============================================================================
// Target Resolution
// =============================================================================

/// A read target after deleted-state policy has been applied.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReadTarget {
    /// The global log.
    All,
    /// A concrete, live stream.
    Stream(i64),
}

/// Resolves a stream identity for reading.
pub(crate) async fn resolve_for_read(
    storage: &Storage,
    stream_uuid: &StreamUuid,
) -> Result<ReadTarget> {
    if stream_uuid.is_all() {
        return Ok(ReadTarget::All);
    }

    let state = storage.fetch_stream_state(stream_uuid).await?;
    match state.row {
        Some(row) if row.deleted_state == DeletedState::Live => Ok(ReadTarget::Stream(row.stream_id)),
        Some(_) => Err(Error::StreamDeleted {
            stream_uuid: stream_uuid.as_str().to_string(),
        }),
        None if state.tombstoned => Err(Error::StreamDeleted {
            stream_uuid: stream_uuid.as_str().to_string(),
        }),
        None => Err(Error::StreamNotFound {
            stream_uuid: stream_uuid.as_str().to_string(),
        }),
    }
}

// =============================================================================
// Page Reads
// =============================================================================

/// Reads up to `count` events at or after `from`, in ascending position
/// order.
pub(crate) async fn read_forward(
    storage: &Storage,
    stream_uuid: &StreamUuid,
    from: Position,
    count: usize,
) -> Result<Vec<RecordedEvent>> {
    match resolve_for_read(storage, stream_uuid).await? {
        ReadTarget::All => storage.read_all_slice(from, count, true).await,
        ReadTarget::Stream(stream_id) => {
            storage.read_stream_slice(stream_id, from, count, true).await
        }
    }
}

/// Reads up to `count` events at or before `from`, in descending position
/// order. [`Position::END`] starts at the head.
pub(crate) async fn read_backward(
    storage: &Storage,
    stream_uuid: &StreamUuid,
    from: Position,
    count: usize,
) -> Result<Vec<RecordedEvent>> {
    match resolve_for_read(storage, stream_uuid).await? {
        ReadTarget::All => storage.read_all_slice(from, count, false).await,
        ReadTarget::Stream(stream_id) => {
            storage
                .read_stream_slice(stream_id, from, count, false)
                .await
        }
    }
}

// =============================================================================
// Lazy Paging
// =============================================================================

/// A lazy, finite, restartable sequence of events.
///
/// Pages through the target `batch_size` events at a time and ends when a
/// page comes back empty. [`position`](Self::position) exposes the cursor of
/// the last yielded event, so a pager can be rebuilt from where a previous
/// one stopped.
pub struct EventPager {
    storage: Storage,
    stream_uuid: StreamUuid,
    next_from: Position,
    batch_size: usize,
    buffer: std::vec::IntoIter<RecordedEvent>,
    last_position: Position,
    done: bool,
}

impl EventPager {
    pub(crate) fn new(
        storage: Storage,
        stream_uuid: StreamUuid,
        from: Position,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            stream_uuid,
            next_from: from,
            batch_size,
            buffer: Vec::new().into_iter(),
            last_position: Position::ORIGIN,
            done: false,
        }
    }

    /// Position of the most recently yielded event.
    pub fn position(&self) -> Position {
        self.last_position
    }

    /// Yields the next event, fetching a new page when the buffer empties.
    ///
    /// Returns `None` once the sequence is exhausted; the page that was the
    /// head when it was read is the end of the sequence.
    pub async fn next(&mut self) -> Option<Result<RecordedEvent>> {
        loop {
            if self.done {
                return None;
            }

            if let Some(event) = self.buffer.next() {
                self.last_position = event.position;
                self.next_from = event.position.next();
                return Some(Ok(event));
            }

            match read_forward(
                &self.storage,
                &self.stream_uuid,
                self.next_from,
                self.batch_size,
            )
            .await
            {
                Ok(page) if page.is_empty() => {
                    self.done = true;
                    return None;
                }
                Ok(page) => {
                    self.buffer = page.into_iter();
                }
                Err(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
            }
        }
    }

    /// Adapts the pager into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<RecordedEvent>> {
        stream::unfold(self, |mut pager| async move {
            pager.next().await.map(|item| (item, pager))
        })
    }
}
