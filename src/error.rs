//! # Error Handling
//!
//! A single [`Error`] enum covers every failure mode in the store, which keeps
//! function signatures uniform and lets callers match on the kinds they care
//! about and propagate the rest.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical response |
//! |----------|----------|------------------|
//! | Concurrency | `WrongExpectedVersion` | Re-read the stream, retry with the fresh version |
//! | Stream state | `StreamNotFound`, `StreamDeleted`, `StreamExists` | Caller decides: recreate, abandon, or report |
//! | Linking | `EventNotFound`, `DuplicateLink` | Fix the event-id set and retry |
//! | Configuration | `HardDeletesDisabled`, `InvalidStreamUuid` | Programming or deployment error |
//! | Subscription | `SubscriptionConflict`, `SubscriptionClosed` | Back off or resubscribe |
//! | Infrastructure | `Database`, `SchemaVersionMismatch`, `Timeout` | Fail fast, investigate |
//! | Payload | `Serializer` | Surfaced to the consumer, becomes a nack |

use thiserror::Error;

use crate::types::{EventId, ExpectedVersion};

/// All errors that can occur in store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Optimistic concurrency conflict: the stream was modified since last read.
    ///
    /// The caller supplied an [`ExpectedVersion`] that does not match the
    /// stream's current version. Re-read the stream, re-apply business logic,
    /// and retry with the observed version.
    #[error("wrong expected version on stream '{stream_uuid}': expected {expected}, but found {actual}")]
    WrongExpectedVersion {
        /// The stream where the conflict occurred.
        stream_uuid: String,
        /// The version the caller expected.
        expected: ExpectedVersion,
        /// The actual current version.
        actual: u64,
    },

    /// Read or delete of a stream that never existed.
    #[error("stream '{stream_uuid}' not found")]
    StreamNotFound { stream_uuid: String },

    /// The stream was soft deleted, or hard deleted and not yet recreated.
    ///
    /// For a hard-deleted stream the caller may recreate it from version 0;
    /// a soft-deleted stream rejects all further appends, links, and direct
    /// reads.
    #[error("stream '{stream_uuid}' has been deleted")]
    StreamDeleted { stream_uuid: String },

    /// An append with [`ExpectedVersion::NoStream`] found the stream present.
    #[error("stream '{stream_uuid}' already exists")]
    StreamExists { stream_uuid: String },

    /// A link referenced an `event_id` that is not in the store.
    #[error("event {event_id} not found")]
    EventNotFound { event_id: EventId },

    /// A link would insert an event already present in the target stream.
    ///
    /// An event may be linked into many streams, but into a given stream at
    /// most once.
    #[error("event {event_id} is already linked into stream '{stream_uuid}'")]
    DuplicateLink {
        stream_uuid: String,
        event_id: EventId,
    },

    /// Hard deletion was attempted without the configuration opt-in.
    ///
    /// Set [`StoreConfig::enable_hard_deletes`](crate::config::StoreConfig)
    /// to permit physical removal of events.
    #[error("hard deletes are not enabled for this store")]
    HardDeletesDisabled,

    /// A caller-supplied stream identity was rejected.
    ///
    /// Stream identities must be non-empty, and names beginning with `$` are
    /// reserved (only `$all` may be read or subscribed to, never appended to).
    #[error("invalid stream identity '{stream_uuid}': {reason}")]
    InvalidStreamUuid {
        stream_uuid: String,
        reason: &'static str,
    },

    /// The configured `schema_prefix` is not a safe SQL identifier.
    ///
    /// Prefixes are embedded into DDL and query text and must match
    /// `[a-z_][a-z0-9_]*`.
    #[error("invalid schema prefix '{prefix}'")]
    InvalidSchemaPrefix { prefix: String },

    /// Payload encode/decode failure at the serializer boundary.
    ///
    /// On the consumer side this is a delivery-phase error; the delivery
    /// should be nacked.
    #[error("serializer error: {0}")]
    Serializer(String),

    /// The database rejected a query or the connection was lost.
    ///
    /// Appends and checkpoints fail fast on transport errors; subscriptions
    /// fall back to polling once connectivity returns.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The schema on disk is not the version this build expects.
    ///
    /// Run the administrative [`schema::initialize`](crate::schema::initialize)
    /// operation before opening the store.
    #[error("schema version mismatch: database has version {found}, this build requires {expected}")]
    SchemaVersionMismatch { found: i64, expected: i64 },

    /// Too many consumers are waiting on one subscription.
    ///
    /// A subscription holds one active consumer plus a bounded FIFO of
    /// pending consumers awaiting failover promotion.
    #[error("subscription '{name}' on stream '{stream_uuid}' has too many pending consumers")]
    SubscriptionConflict { stream_uuid: String, name: String },

    /// The subscription worker has stopped; the handle is no longer usable.
    #[error("subscription has shut down")]
    SubscriptionClosed,

    /// An operation exceeded its configured timeout.
    #[error("operation '{operation}' timed out")]
    Timeout { operation: &'static str },
}

impl Error {
    /// True for conflicts the caller can resolve by re-reading and retrying.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            Error::WrongExpectedVersion { .. } | Error::StreamExists { .. }
        )
    }
}

/// A `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let conflict = Error::WrongExpectedVersion {
            stream_uuid: "account-42".to_string(),
            expected: ExpectedVersion::Exact(5),
            actual: 7,
        };
        assert_eq!(
            conflict.to_string(),
            "wrong expected version on stream 'account-42': expected 5, but found 7"
        );

        let deleted = Error::StreamDeleted {
            stream_uuid: "account-42".to_string(),
        };
        assert_eq!(deleted.to_string(), "stream 'account-42' has been deleted");

        let mismatch = Error::SchemaVersionMismatch {
            found: 0,
            expected: 1,
        };
        assert_eq!(
            mismatch.to_string(),
            "schema version mismatch: database has version 0, this build requires 1"
        );
    }

    #[test]
    fn concurrency_conflicts_are_classified() {
        assert!(Error::WrongExpectedVersion {
            stream_uuid: "s".into(),
            expected: ExpectedVersion::NoStream,
            actual: 3,
        }
        .is_concurrency_conflict());

        assert!(Error::StreamExists {
            stream_uuid: "s".into()
        }
        .is_concurrency_conflict());
        assert!(!Error::HardDeletesDisabled.is_concurrency_conflict());
    }
}
