//! # Append Engine & Linker
//!
//! The write path. Both appending new events and linking existing ones run
//! the same protocol inside one transaction:
//!
//! 1. acquire the stream's advisory lock
//! 2. read the stream row and tombstone state
//! 3. validate the caller's [`ExpectedVersion`]
//! 4. assign identities and positions (appends reserve a contiguous global
//!    sequence range; links never do)
//! 5. persist, bump the stream version, queue the commit notification
//! 6. commit
//!
//! A batch is atomic: all events land, adjacent in both stream order and
//! global order, or none do. An empty batch still validates the expectation
//! and is otherwise a no-op.
//!
//! The expected-version check itself is pure ([`validate_expected_version`])
//! so the whole conflict matrix is unit-testable without a database.

use tracing::debug;

use crate::error::{Error, Result};
use crate::notifications::{NotificationKind, StoreNotification};
use crate::storage::{PreparedEvent, Storage, StreamState};
use crate::types::{
    AppendResult, DeletedState, EventData, EventId, ExpectedVersion, GlobalSequence, StreamUuid,
    StreamVersion,
};

// =============================================================================
// Expected-Version Protocol
// =============================================================================

/// Validates a write against the stream's state and returns the current
/// version on success.
///
/// Soft-deleted streams reject every write. A hard-delete tombstone rejects
/// any expectation that is not a recreation from version 0
/// ([`ExpectedVersion::allows_recreation`]).
pub(crate) fn validate_expected_version(
    stream_uuid: &StreamUuid,
    state: &StreamState,
    expected: ExpectedVersion,
) -> Result<u64> {
    if let Some(row) = &state.row {
        if row.deleted_state == DeletedState::SoftDeleted {
            return Err(Error::StreamDeleted {
                stream_uuid: stream_uuid.as_str().to_string(),
            });
        }
        return check_expected(stream_uuid, expected, row.stream_version, true);
    }

    if state.tombstoned && !expected.allows_recreation() {
        return Err(Error::StreamDeleted {
            stream_uuid: stream_uuid.as_str().to_string(),
        });
    }

    check_expected(stream_uuid, expected, 0, false)
}

/// The pure expectation matrix, independent of deletion state.
pub(crate) fn check_expected(
    stream_uuid: &StreamUuid,
    expected: ExpectedVersion,
    current: u64,
    exists: bool,
) -> Result<u64> {
    match expected {
        ExpectedVersion::Any => Ok(current),
        ExpectedVersion::NoStream => {
            if exists {
                Err(Error::StreamExists {
                    stream_uuid: stream_uuid.as_str().to_string(),
                })
            } else {
                Ok(0)
            }
        }
        ExpectedVersion::StreamExists => {
            if exists && current >= 1 {
                Ok(current)
            } else {
                Err(Error::StreamNotFound {
                    stream_uuid: stream_uuid.as_str().to_string(),
                })
            }
        }
        ExpectedVersion::Exact(version) => {
            if version == current {
                Ok(current)
            } else {
                Err(Error::WrongExpectedVersion {
                    stream_uuid: stream_uuid.as_str().to_string(),
                    expected,
                    actual: current,
                })
            }
        }
    }
}

/// Rejects identities that may not be written to.
pub(crate) fn validate_writable_stream(stream_uuid: &StreamUuid) -> Result<()> {
    if stream_uuid.as_str().is_empty() {
        return Err(Error::InvalidStreamUuid {
            stream_uuid: String::new(),
            reason: "stream identity must be non-empty",
        });
    }
    if stream_uuid.as_str().starts_with('$') {
        return Err(Error::InvalidStreamUuid {
            stream_uuid: stream_uuid.as_str().to_string(),
            reason: "names beginning with '$' are reserved",
        });
    }
    Ok(())
}

// =============================================================================
// Event Preparation
// =============================================================================

/// Assigns identity and positions to a batch.
///
/// Versions continue from `current_version`; sequences fill the reserved
/// contiguous range starting at `first_sequence`.
fn prepare_events(
    events: Vec<EventData>,
    current_version: u64,
    first_sequence: u64,
) -> Vec<PreparedEvent> {
    events
        .into_iter()
        .enumerate()
        .map(|(i, event)| PreparedEvent {
            event_id: EventId::generate(),
            stream_version: current_version + 1 + i as u64,
            global_sequence: first_sequence + i as u64,
            event_type: event.event_type,
            data: event.data,
            metadata: event.metadata,
            causation_id: event.causation_id,
            correlation_id: event.correlation_id,
        })
        .collect()
}

/// Result for a validated batch that wrote nothing.
fn empty_result(current: u64) -> AppendResult {
    AppendResult {
        first_version: StreamVersion::NONE,
        last_version: StreamVersion::from_raw(current),
        first_sequence: None,
        last_sequence: None,
    }
}

// =============================================================================
// Append
// =============================================================================

/// Appends a batch of events to a stream under optimistic concurrency.
pub(crate) async fn append(
    storage: &Storage,
    stream_uuid: &StreamUuid,
    expected: ExpectedVersion,
    events: Vec<EventData>,
) -> Result<AppendResult> {
    validate_writable_stream(stream_uuid)?;

    let mut tx = storage.begin().await?;
    storage.lock_stream(&mut tx, stream_uuid.lock_key()).await?;

    let state = storage.stream_state(&mut tx, stream_uuid).await?;
    let current = validate_expected_version(stream_uuid, &state, expected)?;

    if events.is_empty() {
        // Validated no-op; the dropped transaction rolls back the lock.
        return Ok(empty_result(current));
    }

    let stream_id = match &state.row {
        Some(row) => row.stream_id,
        None => {
            if state.tombstoned {
                storage.clear_tombstone(&mut tx, stream_uuid).await?;
            }
            storage.insert_stream(&mut tx, stream_uuid).await?
        }
    };

    let count = events.len() as u64;
    let last_sequence = storage.reserve_global(&mut tx, count).await?;
    let first_sequence = last_sequence - count + 1;

    let prepared = prepare_events(events, current, first_sequence);
    storage.insert_events(&mut tx, stream_id, &prepared).await?;

    let new_version = current + count;
    storage
        .update_stream_version(&mut tx, stream_id, new_version)
        .await?;

    storage
        .notify(
            &mut tx,
            &StoreNotification {
                stream_uuid: stream_uuid.as_str().to_string(),
                from_version: current + 1,
                to_version: new_version,
                from_sequence: first_sequence,
                to_sequence: last_sequence,
                kind: NotificationKind::Appended,
            },
        )
        .await?;

    tx.commit().await?;
    debug!(
        stream = %stream_uuid,
        from = current + 1,
        to = new_version,
        "appended {count} event(s)"
    );

    Ok(AppendResult {
        first_version: StreamVersion::from_raw(current + 1),
        last_version: StreamVersion::from_raw(new_version),
        first_sequence: Some(GlobalSequence::from_raw(first_sequence)),
        last_sequence: Some(GlobalSequence::from_raw(last_sequence)),
    })
}

// =============================================================================
// Link
// =============================================================================

/// Links existing events into a target stream without copying payloads.
///
/// Runs the append protocol against the target, but inserts references and
/// reserves no global sequence numbers. Fails with
/// [`Error::EventNotFound`] for an unknown id and [`Error::DuplicateLink`]
/// when the target already contains one of the events.
pub(crate) async fn link(
    storage: &Storage,
    stream_uuid: &StreamUuid,
    expected: ExpectedVersion,
    event_ids: &[EventId],
) -> Result<AppendResult> {
    validate_writable_stream(stream_uuid)?;

    let mut tx = storage.begin().await?;
    storage.lock_stream(&mut tx, stream_uuid.lock_key()).await?;

    let state = storage.stream_state(&mut tx, stream_uuid).await?;
    let current = validate_expected_version(stream_uuid, &state, expected)?;

    if event_ids.is_empty() {
        return Ok(empty_result(current));
    }

    let sources = storage.link_sources(&mut tx, event_ids).await?;
    // Preserve the caller's ordering; the query returns rows in any order.
    let mut ordered = Vec::with_capacity(event_ids.len());
    for event_id in event_ids {
        match sources.iter().find(|s| s.event_id == *event_id) {
            Some(source) => ordered.push(source.clone()),
            None => {
                return Err(Error::EventNotFound {
                    event_id: *event_id,
                })
            }
        }
    }

    let stream_id = match &state.row {
        Some(row) => row.stream_id,
        None => {
            if state.tombstoned {
                storage.clear_tombstone(&mut tx, stream_uuid).await?;
            }
            storage.insert_stream(&mut tx, stream_uuid).await?
        }
    };

    if let Some(duplicate) = storage
        .existing_links(&mut tx, stream_id, event_ids)
        .await?
        .first()
    {
        return Err(Error::DuplicateLink {
            stream_uuid: stream_uuid.as_str().to_string(),
            event_id: *duplicate,
        });
    }

    for (i, source) in ordered.iter().enumerate() {
        storage
            .insert_link(&mut tx, stream_id, current + 1 + i as u64, source)
            .await?;
    }

    let count = ordered.len() as u64;
    let new_version = current + count;
    storage
        .update_stream_version(&mut tx, stream_id, new_version)
        .await?;

    let from_sequence = ordered.iter().map(|s| s.global_sequence).min().unwrap_or(0);
    let to_sequence = ordered.iter().map(|s| s.global_sequence).max().unwrap_or(0);
    storage
        .notify(
            &mut tx,
            &StoreNotification {
                stream_uuid: stream_uuid.as_str().to_string(),
                from_version: current + 1,
                to_version: new_version,
                from_sequence,
                to_sequence,
                kind: NotificationKind::Linked,
            },
        )
        .await?;

    tx.commit().await?;
    debug!(
        stream = %stream_uuid,
        from = current + 1,
        to = new_version,
        "linked {count} event(s)"
    );

    Ok(AppendResult {
        first_version: StreamVersion::from_raw(current + 1),
        last_version: StreamVersion::from_raw(new_version),
        first_sequence: None,
        last_sequence: None,
    })
}

// =============================================================================
// Tests
// =============================================================================
