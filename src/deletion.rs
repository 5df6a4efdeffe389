//! # Deletion Manager
//!
//! Soft and hard stream deletion, both behind the same expected-version
//! protocol as appends.
//!
//! - **Soft delete** flips the stream row's `deleted_state`. The stream then
//!   rejects appends, links, and direct reads, but its events remain in
//!   `$all` and in every stream that linked them.
//! - **Hard delete** physically removes the stream's events, every link row
//!   pointing at them anywhere in the store, and the stream row itself, then
//!   records a tombstone. The tombstone keeps readers of cached positions on
//!   `StreamDeleted` instead of silently resuming, until the name is
//!   recreated from version 0. Hard deletion is irreversible and therefore
//!   gated behind a configuration opt-in.
//!
//! Both paths emit a commit notification so subscribers can reconcile: a
//! hard delete tells `$all` subscribers to drop in-flight deliveries from the
//! removed stream.

use tracing::info;

use crate::error::{Error, Result};
use crate::notifications::{NotificationKind, StoreNotification};
use crate::storage::Storage;
use crate::types::{DeletedState, DeleteMode, ExpectedVersion, StreamUuid};
use crate::writer::{check_expected, validate_writable_stream};

/// Deletes a stream.
///
/// `hard_deletes_enabled` carries the store-level opt-in; without it a hard
/// delete fails with [`Error::HardDeletesDisabled`] before touching the
/// database.
pub(crate) async fn delete(
    storage: &Storage,
    stream_uuid: &StreamUuid,
    expected: ExpectedVersion,
    mode: DeleteMode,
    hard_deletes_enabled: bool,
) -> Result<()> {
    validate_writable_stream(stream_uuid)?;
    if mode == DeleteMode::Hard && !hard_deletes_enabled {
        return Err(Error::HardDeletesDisabled);
    }

    let mut tx = storage.begin().await?;
    storage.lock_stream(&mut tx, stream_uuid.lock_key()).await?;

    let state = storage.stream_state(&mut tx, stream_uuid).await?;
    let row = match state.row {
        Some(row) => row,
        None if state.tombstoned => {
            return Err(Error::StreamDeleted {
                stream_uuid: stream_uuid.as_str().to_string(),
            })
        }
        None => {
            return Err(Error::StreamNotFound {
                stream_uuid: stream_uuid.as_str().to_string(),
            })
        }
    };

    // A soft-deleted stream rejects a second soft delete but may still be
    // hard deleted to purge its events.
    if row.deleted_state == DeletedState::SoftDeleted && mode == DeleteMode::Soft {
        return Err(Error::StreamDeleted {
            stream_uuid: stream_uuid.as_str().to_string(),
        });
    }

    let version = check_expected(stream_uuid, expected, row.stream_version, true)?;

    match mode {
        DeleteMode::Soft => {
            storage
                .set_deleted_state(&mut tx, row.stream_id, DeletedState::SoftDeleted)
                .await?;
            storage
                .notify(
                    &mut tx,
                    &StoreNotification {
                        stream_uuid: stream_uuid.as_str().to_string(),
                        from_version: version,
                        to_version: version,
                        from_sequence: 0,
                        to_sequence: 0,
                        kind: NotificationKind::SoftDeleted,
                    },
                )
                .await?;
            tx.commit().await?;
            info!(stream = %stream_uuid, "stream soft deleted");
        }
        DeleteMode::Hard => {
            let originals = storage.original_events(&mut tx, row.stream_id).await?;
            let event_ids: Vec<_> = originals.iter().map(|(id, _)| *id).collect();
            let from_sequence = originals.iter().map(|(_, seq)| *seq).min().unwrap_or(0);
            let to_sequence = originals.iter().map(|(_, seq)| *seq).max().unwrap_or(0);

            storage
                .delete_event_references(&mut tx, row.stream_id)
                .await?;
            if !event_ids.is_empty() {
                storage.delete_events(&mut tx, &event_ids).await?;
            }
            storage.delete_stream_row(&mut tx, row.stream_id).await?;
            storage.insert_tombstone(&mut tx, stream_uuid).await?;

            storage
                .notify(
                    &mut tx,
                    &StoreNotification {
                        stream_uuid: stream_uuid.as_str().to_string(),
                        from_version: 1,
                        to_version: version,
                        from_sequence,
                        to_sequence,
                        kind: NotificationKind::HardDeleted,
                    },
                )
                .await?;
            tx.commit().await?;
            info!(
                stream = %stream_uuid,
                events = event_ids.len(),
                "stream hard deleted"
            );
        }
    }

    Ok(())
}
