//! # The Store Handle
//!
//! [`EventStore`] is the public entry point: a cloneable handle over the
//! connection pool, the notification bus, and the subscription registry.
//!
//! Opening a store verifies the schema version (it never creates schema —
//! that is the administrative [`schema::initialize`](crate::schema::initialize)
//! step) and starts the notification listener. Appends and reads are wrapped
//! in the configured per-operation timeouts; an append that has begun its
//! transaction is not cancelled by the timeout racing it — the outcome is the
//! transaction's outcome, the caller just stops waiting.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::{StoreConfig, SubscriptionOptions};
use crate::deletion;
use crate::error::{Error, Result};
use crate::notifications::NotificationBus;
use crate::reader::{self, EventPager};
use crate::schema;
use crate::storage::Storage;
use crate::subscription::{self, ControlMessage, Subscription, SubscriptionRegistry};
use crate::types::{
    AppendResult, DeleteMode, EventData, EventId, ExpectedVersion, Position, RecordedEvent,
    StreamUuid,
};
use crate::writer;

/// The event store: append, read, link, delete, subscribe.
///
/// Cheap to clone; all clones share the pool, bus, and registry. Shut down
/// with [`shutdown`](Self::shutdown) to stop the notification listener
/// cleanly.
#[derive(Clone)]
pub struct EventStore {
    storage: Storage,
    config: Arc<StoreConfig>,
    bus: Arc<NotificationBus>,
    registry: Arc<SubscriptionRegistry>,
}

impl EventStore {
    /// Connects to PostgreSQL, verifies the schema version, and starts the
    /// notification listener.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        schema::validate_prefix(&config.schema_prefix)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        schema::verify_version(&pool, &config.schema_prefix).await?;

        let channel = config.notification_channel();
        let bus = NotificationBus::start(&pool, &channel).await?;
        let storage = Storage::new(pool, &config.schema_prefix, channel);

        info!(schema = %config.schema_prefix, "event store ready");
        Ok(Self {
            storage,
            config: Arc::new(config),
            bus: Arc::new(bus),
            registry: Arc::new(SubscriptionRegistry::new()),
        })
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        deadline: Duration,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { operation }),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Appends events to a stream under optimistic concurrency.
    ///
    /// The batch is atomic and contiguous in both stream and global order.
    /// An empty batch validates `expected` and writes nothing.
    pub async fn append(
        &self,
        stream_uuid: impl Into<StreamUuid>,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<AppendResult> {
        let stream_uuid = stream_uuid.into();
        self.timed(
            "append",
            self.config.append_timeout,
            writer::append(&self.storage, &stream_uuid, expected, events),
        )
        .await
    }

    /// Links existing events into a stream without copying payloads.
    pub async fn link(
        &self,
        stream_uuid: impl Into<StreamUuid>,
        expected: ExpectedVersion,
        event_ids: &[EventId],
    ) -> Result<AppendResult> {
        let stream_uuid = stream_uuid.into();
        self.timed(
            "link",
            self.config.append_timeout,
            writer::link(&self.storage, &stream_uuid, expected, event_ids),
        )
        .await
    }

    /// Deletes a stream, softly or hard.
    ///
    /// Hard deletion requires
    /// [`enable_hard_deletes`](StoreConfig::enable_hard_deletes) and removes
    /// the stream's events from `$all` and from every stream that linked
    /// them; afterwards the name may be recreated from version 0.
    pub async fn delete_stream(
        &self,
        stream_uuid: impl Into<StreamUuid>,
        expected: ExpectedVersion,
        mode: DeleteMode,
    ) -> Result<()> {
        let stream_uuid = stream_uuid.into();
        self.timed(
            "delete_stream",
            self.config.append_timeout,
            deletion::delete(
                &self.storage,
                &stream_uuid,
                expected,
                mode,
                self.config.enable_hard_deletes,
            ),
        )
        .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads up to `count` events forward from `from`.
    ///
    /// The cursor is a stream version for a concrete stream and a global
    /// sequence for `$all`.
    pub async fn read_forward(
        &self,
        stream_uuid: impl Into<StreamUuid>,
        from: Position,
        count: usize,
    ) -> Result<Vec<RecordedEvent>> {
        let stream_uuid = stream_uuid.into();
        self.timed(
            "read_forward",
            self.config.read_timeout,
            reader::read_forward(&self.storage, &stream_uuid, from, count),
        )
        .await
    }

    /// Reads up to `count` events backward from `from`;
    /// [`Position::END`] starts at the head.
    pub async fn read_backward(
        &self,
        stream_uuid: impl Into<StreamUuid>,
        from: Position,
        count: usize,
    ) -> Result<Vec<RecordedEvent>> {
        let stream_uuid = stream_uuid.into();
        self.timed(
            "read_backward",
            self.config.read_timeout,
            reader::read_backward(&self.storage, &stream_uuid, from, count),
        )
        .await
    }

    /// Reads `$all` forward from a global sequence cursor.
    pub async fn read_all_forward(
        &self,
        from: Position,
        count: usize,
    ) -> Result<Vec<RecordedEvent>> {
        self.read_forward(StreamUuid::all(), from, count).await
    }

    /// Reads `$all` backward from a global sequence cursor.
    pub async fn read_all_backward(
        &self,
        from: Position,
        count: usize,
    ) -> Result<Vec<RecordedEvent>> {
        self.read_backward(StreamUuid::all(), from, count).await
    }

    /// Lazily pages a stream (or `$all`) forward from `from`, using the
    /// store's `read_batch_size`. The sequence is finite: it ends at the
    /// head observed while paging, and is restartable from
    /// [`EventPager::position`].
    pub fn stream_forward(&self, stream_uuid: impl Into<StreamUuid>, from: Position) -> EventPager {
        EventPager::new(
            self.storage.clone(),
            stream_uuid.into(),
            from,
            self.config.read_batch_size,
        )
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Creates or resumes the persistent subscription `(stream, name)` and
    /// attaches this consumer.
    ///
    /// The first `subscribe` for a name persists the subscription row with
    /// the position derived from `options.start_from`; later calls resume
    /// from the stored checkpoint. If another consumer is active, this one
    /// queues for single-active failover.
    pub async fn subscribe(
        &self,
        stream_uuid: impl Into<StreamUuid>,
        name: impl Into<String>,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        subscription::spawn_subscription(
            self.storage.clone(),
            &self.bus,
            Arc::clone(&self.registry),
            stream_uuid.into(),
            name.into(),
            options,
            self.config.read_batch_size,
        )
        .await
    }

    /// Requests redelivery of every parked event to the attached consumer.
    ///
    /// Returns the number of parked events at the time of the request. Fails
    /// with [`Error::SubscriptionClosed`] when no consumer is attached and
    /// [`Error::StreamNotFound`] when the subscription does not exist.
    pub async fn replay_parked(
        &self,
        stream_uuid: impl Into<StreamUuid>,
        name: &str,
    ) -> Result<usize> {
        let stream_uuid = stream_uuid.into();
        let row = self
            .storage
            .find_subscription(&stream_uuid, name)
            .await?
            .ok_or_else(|| Error::StreamNotFound {
                stream_uuid: stream_uuid.as_str().to_string(),
            })?;

        let parked = self.storage.parked(row.subscription_id).await?.len();
        let key = (stream_uuid.as_str().to_string(), name.to_string());
        let control = self
            .registry
            .active_control(&key)
            .ok_or(Error::SubscriptionClosed)?;
        control
            .send(ControlMessage::ReplayParked)
            .await
            .map_err(|_| Error::SubscriptionClosed)?;
        Ok(parked)
    }

    /// Removes a subscription row, its checkpoint, and its parked events.
    ///
    /// Any attached consumer keeps running until it disconnects; delete
    /// after unsubscribing.
    pub async fn delete_subscription(
        &self,
        stream_uuid: impl Into<StreamUuid>,
        name: &str,
    ) -> Result<()> {
        let stream_uuid = stream_uuid.into();
        self.storage.delete_subscription(&stream_uuid, name).await
    }

    // =========================================================================
    // Payloads
    // =========================================================================

    /// Builds an [`EventData`] by encoding `payload` with the store's
    /// configured codec; `event_type` doubles as the codec's type name.
    pub fn event_data<T: serde::Serialize>(
        &self,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<EventData> {
        crate::codec::event_data(self.config.serializer.as_ref(), event_type, payload)
    }

    /// Decodes a recorded event's payload with the store's configured codec.
    pub fn decode_event<T: serde::de::DeserializeOwned>(
        &self,
        event: &RecordedEvent,
    ) -> Result<T> {
        crate::codec::decode(
            self.config.serializer.as_ref(),
            &event.data,
            &event.event_type,
        )
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// The store's configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Stops the notification listener and closes the pool.
    ///
    /// Active subscription workers notice the closed bus and fall back to
    /// polling until their consumers detach; detach consumers first for a
    /// quiet shutdown.
    pub async fn shutdown(&self) {
        self.bus.shutdown().await;
        self.storage.pool().close().await;
        info!(schema = %self.config.schema_prefix, "event store shut down");
    }
}
