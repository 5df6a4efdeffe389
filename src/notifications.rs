//! # Notification Bus
//!
//! Fans out "events appended" signals to subscription workers. The bus is a
//! single process-wide object with explicit startup and teardown; it owns a
//! dedicated `LISTEN` connection and a broadcast channel, and no durable
//! state — everything it carries can be reconstructed from the log.
//!
//! ```text
//! append tx ──pg_notify──► PostgreSQL ──LISTEN──► listener task ──broadcast──► workers
//! ```
//!
//! Delivery is best-effort and advisory. Workers treat notifications as hints
//! to wake and read the log, never as authoritative content: a lost or lagged
//! notification is covered by each worker's periodic head poll, and a
//! sequence gap in a notification sends the worker back to catch-up.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::StreamUuid;

/// Capacity of the broadcast channel between the listener task and workers.
///
/// Workers that lag past this many undrained notifications miss some; the
/// poll fallback and gap detection absorb the loss.
pub const BUS_CAPACITY: usize = 1024;

/// Backoff before retrying a failed `LISTEN` receive.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// Notification Payload
// =============================================================================

/// What kind of commit a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// New events were appended to a stream.
    Appended,
    /// Existing events were linked into a stream.
    Linked,
    /// A stream was soft deleted.
    SoftDeleted,
    /// A stream and its events were hard deleted.
    HardDeleted,
}

/// The payload carried on the store's `NOTIFY` channel.
///
/// Ranges are inclusive. For `Linked`, the sequence range covers the linked
/// events' *original* global sequences. For deletions, the version range is
/// the stream's final version and the sequence range covers the removed
/// events (zeroes when the stream was empty).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreNotification {
    pub stream_uuid: String,
    pub from_version: u64,
    pub to_version: u64,
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub kind: NotificationKind,
}

impl StoreNotification {
    /// Serializes for `pg_notify`. Payloads stay far below the 8000-byte
    /// notification limit: ranges, not events.
    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serializer(e.to_string()))
    }

    /// Parses a received payload.
    pub fn from_payload(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| Error::Serializer(e.to_string()))
    }

    /// Whether a subscriber of `stream` should wake for this notification.
    ///
    /// `$all` subscribers care about appends (new global positions) and hard
    /// deletions (in-flight reconciliation); links and soft deletions leave
    /// the global order untouched. Concrete-stream subscribers wake for
    /// anything naming their stream.
    pub fn concerns(&self, stream: &StreamUuid) -> bool {
        if stream.is_all() {
            matches!(
                self.kind,
                NotificationKind::Appended | NotificationKind::HardDeleted
            )
        } else {
            self.stream_uuid == stream.as_str()
        }
    }
}

// =============================================================================
// The Bus
// =============================================================================

/// Owns the `LISTEN` connection and broadcasts decoded notifications.
pub struct NotificationBus {
    sender: broadcast::Sender<StoreNotification>,
    shutdown: watch::Sender<bool>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    channel: String,
}

impl NotificationBus {
    /// Connects a dedicated listener and starts the fan-out task.
    pub async fn start(pool: &PgPool, channel: &str) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(channel).await?;

        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let fanout = sender.clone();
        let channel_name = channel.to_string();
        let listener_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            match StoreNotification::from_payload(notification.payload()) {
                                Ok(decoded) => {
                                    debug!(
                                        stream = %decoded.stream_uuid,
                                        kind = ?decoded.kind,
                                        "commit notification"
                                    );
                                    // No receivers is fine; send only fails then.
                                    let _ = fanout.send(decoded);
                                }
                                Err(error) => {
                                    warn!(channel = %channel_name, %error, "undecodable notification dropped");
                                }
                            }
                        }
                        Err(error) => {
                            // PgListener re-establishes the connection on the
                            // next recv; back off so a dead database does not
                            // spin this task.
                            warn!(channel = %channel_name, %error, "notification listener error, retrying");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
            }
        });

        Ok(Self {
            sender,
            shutdown,
            listener_task: Mutex::new(Some(listener_task)),
            channel: channel.to_string(),
        })
    }

    /// Registers a new receiver. Receivers see notifications sent after this
    /// call; history comes from the log, not the bus.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreNotification> {
        self.sender.subscribe()
    }

    /// The `NOTIFY` channel this bus listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Number of attached receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Stops the listener task and waits for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.listener_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn appended(stream: &str, from_seq: u64, to_seq: u64) -> StoreNotification {
        StoreNotification {
            stream_uuid: stream.to_string(),
            from_version: 1,
            to_version: 2,
            from_sequence: from_seq,
            to_sequence: to_seq,
            kind: NotificationKind::Appended,
        }
    }

    #[test]
    fn payload_round_trip() {
        let original = appended("account-1", 10, 11);
        let payload = original.to_payload().unwrap();
        let decoded = StoreNotification::from_payload(&payload).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let mut n = appended("s", 1, 1);
        n.kind = NotificationKind::HardDeleted;
        assert!(n.to_payload().unwrap().contains("\"hard_deleted\""));
    }

    #[test]
    fn malformed_payload_is_a_serializer_error() {
        assert!(matches!(
            StoreNotification::from_payload("{oops"),
            Err(Error::Serializer(_))
        ));
    }

    #[test]
    fn all_subscribers_wake_for_appends_and_hard_deletes_only() {
        let all = StreamUuid::all();

        assert!(appended("account-1", 1, 1).concerns(&all));

        let mut hard = appended("account-1", 1, 1);
        hard.kind = NotificationKind::HardDeleted;
        assert!(hard.concerns(&all));

        let mut linked = appended("account-1", 1, 1);
        linked.kind = NotificationKind::Linked;
        assert!(!linked.concerns(&all));

        let mut soft = appended("account-1", 1, 1);
        soft.kind = NotificationKind::SoftDeleted;
        assert!(!soft.concerns(&all));
    }

    #[test]
    fn concrete_subscribers_wake_for_their_stream_only() {
        let mine = StreamUuid::new("account-1");
        assert!(appended("account-1", 1, 1).concerns(&mine));
        assert!(!appended("account-2", 1, 1).concerns(&mine));

        let mut linked = appended("account-1", 1, 1);
        linked.kind = NotificationKind::Linked;
        assert!(linked.concerns(&mine));
    }
}
