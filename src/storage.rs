//! # Storage Adapter
//!
//! Every SQL statement in the store lives here, behind transactional
//! primitives the engines compose:
//!
//! - transaction-scoped operations take `&mut PgConnection` and run inside a
//!   transaction the caller owns (begin/commit/rollback stay with the append,
//!   link, and deletion engines)
//! - pool-scoped reads take the pooled connection directly
//!
//! Concurrent appends to one stream serialize on
//! `pg_advisory_xact_lock(stream.lock_key())`; other streams are unaffected.
//! Commit notifications go out via `pg_notify` *inside* the transaction, so
//! PostgreSQL delivers them if and only if the transaction commits, in commit
//! order.
//!
//! Row structs ([`EventRow`], [`SubscriptionRow`], …) map the SQL schema and
//! stay separate from the domain types; conversion happens at this boundary
//! and nowhere else.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::Result;
use crate::notifications::StoreNotification;
use crate::types::{
    DeletedState, EventId, GlobalSequence, Position, RecordedEvent, StreamUuid, StreamVersion,
    SubscriptionState,
};

// =============================================================================
// Row Shapes
// =============================================================================

/// The `streams` row for a resolved stream.
#[derive(Debug, Clone)]
pub struct StreamRow {
    pub stream_id: i64,
    pub stream_version: u64,
    pub deleted_state: DeletedState,
}

/// Everything the expected-version protocol needs to know about a stream,
/// fetched under the stream's advisory lock.
#[derive(Debug, Clone)]
pub struct StreamState {
    /// The stream row, if one exists.
    pub row: Option<StreamRow>,
    /// True if the name carries a hard-delete tombstone.
    pub tombstoned: bool,
}

impl StreamState {
    /// The current version: 0 when the stream does not exist.
    pub fn current_version(&self) -> u64 {
        self.row.as_ref().map(|r| r.stream_version).unwrap_or(0)
    }
}

/// An event fully prepared for insertion: identity and positions assigned.
#[derive(Debug, Clone)]
pub struct PreparedEvent {
    pub event_id: EventId,
    pub stream_version: u64,
    pub global_sequence: u64,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
    pub causation_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
}

/// The original placement of an event being linked.
#[derive(Debug, Clone)]
pub struct LinkSource {
    pub event_id: EventId,
    pub global_sequence: u64,
    pub original_stream_id: i64,
    pub original_stream_version: u64,
}

/// A subscription checkpoint row.
#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub subscription_id: i64,
    pub last_seen: u64,
}

/// A parked delivery awaiting manual replay.
#[derive(Debug, Clone)]
pub struct ParkedRow {
    pub position: u64,
    pub reason: Option<String>,
}

/// SQL shape of one readable event; converted to [`RecordedEvent`] at this
/// boundary.
#[derive(Debug, FromRow)]
struct EventRow {
    position: i64,
    event_id: Uuid,
    event_number: i64,
    stream_uuid: String,
    event_type: String,
    data: Vec<u8>,
    metadata: Option<Vec<u8>>,
    causation_id: Option<Uuid>,
    correlation_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    global_sequence: i64,
}

impl EventRow {
    fn into_recorded(self) -> RecordedEvent {
        RecordedEvent {
            event_id: EventId::from_uuid(self.event_id),
            event_number: StreamVersion::from_raw(self.event_number as u64),
            stream_uuid: StreamUuid::new(self.stream_uuid),
            event_type: self.event_type,
            data: self.data,
            metadata: self.metadata,
            causation_id: self.causation_id,
            correlation_id: self.correlation_id,
            created_at: self.created_at,
            global_sequence: GlobalSequence::from_raw(self.global_sequence as u64),
            position: Position::from_raw(self.position as u64),
        }
    }
}

/// Clamps a cursor to the signed range the database stores.
fn db_pos(position: u64) -> i64 {
    position.min(i64::MAX as u64) as i64
}

// =============================================================================
// Prepared Query Text
// =============================================================================

/// Query strings with the schema prefix baked in, built once per store.
struct Queries {
    select_stream: String,
    select_tombstone: String,
    insert_stream: String,
    update_stream_version: String,
    set_deleted_state: String,
    delete_stream: String,
    clear_tombstone: String,
    insert_tombstone: String,
    reserve_global: String,
    insert_event: String,
    insert_stream_entry: String,
    select_link_sources: String,
    select_existing_links: String,
    select_original_events: String,
    delete_event_references: String,
    delete_events: String,
    read_stream_forward: String,
    read_stream_backward: String,
    read_all_forward: String,
    read_all_backward: String,
    stream_event_at: String,
    all_event_at: String,
    all_head: String,
    ensure_subscription: String,
    select_subscription: String,
    checkpoint: String,
    set_subscription_state: String,
    delete_subscription: String,
    insert_parked: String,
    select_parked: String,
    delete_parked: String,
}

impl Queries {
    fn new(p: &str) -> Self {
        let read_columns = |position: &str| {
            format!(
                "SELECT {position} AS position,
                        e.event_id,
                        se.original_stream_version AS event_number,
                        os.stream_uuid,
                        e.event_type,
                        e.data,
                        e.metadata,
                        e.causation_id,
                        e.correlation_id,
                        e.created_at,
                        e.global_sequence"
            )
        };

        // Stream reads join back to the original stream for identity; $all
        // reads restrict stream_events to original placements so links never
        // duplicate an event in the global order.
        let stream_read_body = format!(
            "FROM {p}.stream_events se
             JOIN {p}.events e ON e.event_id = se.event_id
             JOIN {p}.streams os ON os.stream_id = se.original_stream_id
             WHERE se.stream_id = $1"
        );
        let all_read_body = format!(
            "FROM {p}.events e
             JOIN {p}.stream_events se
               ON se.event_id = e.event_id AND se.stream_id = se.original_stream_id
             JOIN {p}.streams os ON os.stream_id = se.original_stream_id"
        );

        Self {
            select_stream: format!(
                "SELECT stream_id, stream_version, deleted_state
                 FROM {p}.streams WHERE stream_uuid = $1"
            ),
            select_tombstone: format!("SELECT 1 FROM {p}.tombstones WHERE stream_uuid = $1"),
            insert_stream: format!(
                "INSERT INTO {p}.streams (stream_uuid) VALUES ($1) RETURNING stream_id"
            ),
            update_stream_version: format!(
                "UPDATE {p}.streams SET stream_version = $2 WHERE stream_id = $1"
            ),
            set_deleted_state: format!(
                "UPDATE {p}.streams SET deleted_state = $2 WHERE stream_id = $1"
            ),
            delete_stream: format!("DELETE FROM {p}.streams WHERE stream_id = $1"),
            clear_tombstone: format!("DELETE FROM {p}.tombstones WHERE stream_uuid = $1"),
            insert_tombstone: format!(
                "INSERT INTO {p}.tombstones (stream_uuid) VALUES ($1)
                 ON CONFLICT (stream_uuid) DO UPDATE SET deleted_at = now()"
            ),
            reserve_global: format!(
                "UPDATE {p}.global_counter SET value = value + $1 WHERE id = 1 RETURNING value"
            ),
            insert_event: format!(
                "INSERT INTO {p}.events
                 (event_id, event_type, data, metadata, causation_id, correlation_id, global_sequence)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)"
            ),
            insert_stream_entry: format!(
                "INSERT INTO {p}.stream_events
                 (stream_id, stream_version, event_id, original_stream_id, original_stream_version)
                 VALUES ($1, $2, $3, $4, $5)"
            ),
            select_link_sources: format!(
                "SELECT e.event_id, e.global_sequence,
                        se.original_stream_id, se.original_stream_version
                 FROM {p}.events e
                 JOIN {p}.stream_events se
                   ON se.event_id = e.event_id AND se.stream_id = se.original_stream_id
                 WHERE e.event_id = ANY($1)"
            ),
            select_existing_links: format!(
                "SELECT event_id FROM {p}.stream_events
                 WHERE stream_id = $1 AND event_id = ANY($2)"
            ),
            select_original_events: format!(
                "SELECT e.event_id, e.global_sequence
                 FROM {p}.events e
                 JOIN {p}.stream_events se
                   ON se.event_id = e.event_id AND se.stream_id = se.original_stream_id
                 WHERE se.stream_id = $1"
            ),
            delete_event_references: format!(
                "DELETE FROM {p}.stream_events WHERE original_stream_id = $1"
            ),
            delete_events: format!("DELETE FROM {p}.events WHERE event_id = ANY($1)"),
            read_stream_forward: format!(
                "{} {} AND se.stream_version >= $2
                 ORDER BY se.stream_version LIMIT $3",
                read_columns("se.stream_version"),
                stream_read_body
            ),
            read_stream_backward: format!(
                "{} {} AND se.stream_version <= $2
                 ORDER BY se.stream_version DESC LIMIT $3",
                read_columns("se.stream_version"),
                stream_read_body
            ),
            read_all_forward: format!(
                "{} {} WHERE e.global_sequence >= $1
                 ORDER BY e.global_sequence LIMIT $2",
                read_columns("e.global_sequence"),
                all_read_body
            ),
            read_all_backward: format!(
                "{} {} WHERE e.global_sequence <= $1
                 ORDER BY e.global_sequence DESC LIMIT $2",
                read_columns("e.global_sequence"),
                all_read_body
            ),
            stream_event_at: format!(
                "{} {} AND se.stream_version = $2",
                read_columns("se.stream_version"),
                stream_read_body
            ),
            all_event_at: format!(
                "{} {} WHERE e.global_sequence = $1",
                read_columns("e.global_sequence"),
                all_read_body
            ),
            all_head: format!("SELECT COALESCE(MAX(global_sequence), 0) FROM {p}.events"),
            ensure_subscription: format!(
                "INSERT INTO {p}.subscriptions (stream_uuid, subscription_name, last_seen)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (stream_uuid, subscription_name) DO NOTHING"
            ),
            select_subscription: format!(
                "SELECT subscription_id, last_seen FROM {p}.subscriptions
                 WHERE stream_uuid = $1 AND subscription_name = $2"
            ),
            checkpoint: format!(
                "UPDATE {p}.subscriptions SET last_seen = GREATEST(last_seen, $2)
                 WHERE subscription_id = $1"
            ),
            set_subscription_state: format!(
                "UPDATE {p}.subscriptions SET state = $2 WHERE subscription_id = $1"
            ),
            delete_subscription: format!(
                "DELETE FROM {p}.subscriptions
                 WHERE stream_uuid = $1 AND subscription_name = $2"
            ),
            insert_parked: format!(
                "INSERT INTO {p}.subscription_parked (subscription_id, position, reason)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (subscription_id, position) DO NOTHING"
            ),
            select_parked: format!(
                "SELECT position, reason FROM {p}.subscription_parked
                 WHERE subscription_id = $1 ORDER BY position"
            ),
            delete_parked: format!(
                "DELETE FROM {p}.subscription_parked
                 WHERE subscription_id = $1 AND position = $2"
            ),
        }
    }
}

// =============================================================================
// Storage
// =============================================================================

/// The storage adapter: a pooled connection plus prefix-qualified query text.
///
/// Cheap to clone; clones share the pool and query set.
#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
    queries: Arc<Queries>,
    channel: String,
}

impl Storage {
    /// Wraps a pool for a store living under `prefix`.
    ///
    /// The prefix must already be validated (see
    /// [`schema::validate_prefix`](crate::schema::validate_prefix)).
    pub fn new(pool: PgPool, prefix: &str, channel: String) -> Self {
        Self {
            pool,
            queries: Arc::new(Queries::new(prefix)),
            channel,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begins a transaction. Commit and rollback belong to the caller.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    // =========================================================================
    // Stream State (transactional)
    // =========================================================================

    /// Serializes this transaction against other writers of the same stream.
    ///
    /// The lock is transaction-scoped: PostgreSQL releases it at commit or
    /// rollback.
    pub async fn lock_stream(&self, conn: &mut PgConnection, lock_key: i64) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_key)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Fetches the stream row and tombstone flag for the expected-version
    /// protocol. Call with the advisory lock held.
    pub async fn stream_state(
        &self,
        conn: &mut PgConnection,
        stream_uuid: &StreamUuid,
    ) -> Result<StreamState> {
        let row = sqlx::query(&self.queries.select_stream)
            .bind(stream_uuid.as_str())
            .fetch_optional(&mut *conn)
            .await?
            .map(|r| StreamRow {
                stream_id: r.get(0),
                stream_version: r.get::<i64, _>(1) as u64,
                deleted_state: DeletedState::parse(r.get::<&str, _>(2))
                    .unwrap_or(DeletedState::Live),
            });

        let tombstoned = if row.is_some() {
            false
        } else {
            sqlx::query(&self.queries.select_tombstone)
                .bind(stream_uuid.as_str())
                .fetch_optional(&mut *conn)
                .await?
                .is_some()
        };

        Ok(StreamState { row, tombstoned })
    }

    /// Creates a stream row at version 0 and returns its id.
    pub async fn insert_stream(
        &self,
        conn: &mut PgConnection,
        stream_uuid: &StreamUuid,
    ) -> Result<i64> {
        let row = sqlx::query(&self.queries.insert_stream)
            .bind(stream_uuid.as_str())
            .fetch_one(conn)
            .await?;
        Ok(row.get(0))
    }

    /// Removes the hard-delete marker when a stream name is recreated.
    pub async fn clear_tombstone(
        &self,
        conn: &mut PgConnection,
        stream_uuid: &StreamUuid,
    ) -> Result<()> {
        sqlx::query(&self.queries.clear_tombstone)
            .bind(stream_uuid.as_str())
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Bumps the stream's persisted version.
    pub async fn update_stream_version(
        &self,
        conn: &mut PgConnection,
        stream_id: i64,
        version: u64,
    ) -> Result<()> {
        sqlx::query(&self.queries.update_stream_version)
            .bind(stream_id)
            .bind(version as i64)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Sets the stream's deletion state.
    pub async fn set_deleted_state(
        &self,
        conn: &mut PgConnection,
        stream_id: i64,
        state: DeletedState,
    ) -> Result<()> {
        sqlx::query(&self.queries.set_deleted_state)
            .bind(stream_id)
            .bind(state.as_str())
            .execute(conn)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Append / Link Primitives (transactional)
    // =========================================================================

    /// Reserves a contiguous block of `count` global sequence numbers and
    /// returns the last one.
    ///
    /// The counter row lock serializes reservation with every concurrent
    /// append until commit, which is what keeps the committed sequence
    /// gap-free: a rolled-back transaction rolls its reservation back too.
    pub async fn reserve_global(&self, conn: &mut PgConnection, count: u64) -> Result<u64> {
        let row = sqlx::query(&self.queries.reserve_global)
            .bind(count as i64)
            .fetch_one(conn)
            .await?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    /// Persists prepared events and their original stream placements.
    pub async fn insert_events(
        &self,
        conn: &mut PgConnection,
        stream_id: i64,
        events: &[PreparedEvent],
    ) -> Result<()> {
        for event in events {
            sqlx::query(&self.queries.insert_event)
                .bind(event.event_id.as_uuid())
                .bind(&event.event_type)
                .bind(&event.data)
                .bind(event.metadata.as_deref())
                .bind(event.causation_id)
                .bind(event.correlation_id)
                .bind(event.global_sequence as i64)
                .execute(&mut *conn)
                .await?;

            sqlx::query(&self.queries.insert_stream_entry)
                .bind(stream_id)
                .bind(event.stream_version as i64)
                .bind(event.event_id.as_uuid())
                .bind(stream_id)
                .bind(event.stream_version as i64)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Resolves the original placement of every event id being linked.
    ///
    /// Ids absent from the result do not exist in the store.
    pub async fn link_sources(
        &self,
        conn: &mut PgConnection,
        event_ids: &[EventId],
    ) -> Result<Vec<LinkSource>> {
        let ids: Vec<Uuid> = event_ids.iter().map(|id| id.as_uuid()).collect();
        let rows = sqlx::query(&self.queries.select_link_sources)
            .bind(&ids)
            .fetch_all(conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| LinkSource {
                event_id: EventId::from_uuid(r.get(0)),
                global_sequence: r.get::<i64, _>(1) as u64,
                original_stream_id: r.get(2),
                original_stream_version: r.get::<i64, _>(3) as u64,
            })
            .collect())
    }

    /// Returns the subset of `event_ids` already present in the target
    /// stream.
    pub async fn existing_links(
        &self,
        conn: &mut PgConnection,
        stream_id: i64,
        event_ids: &[EventId],
    ) -> Result<Vec<EventId>> {
        let ids: Vec<Uuid> = event_ids.iter().map(|id| id.as_uuid()).collect();
        let rows = sqlx::query(&self.queries.select_existing_links)
            .bind(stream_id)
            .bind(&ids)
            .fetch_all(conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| EventId::from_uuid(r.get(0)))
            .collect())
    }

    /// Inserts one link row into a target stream.
    pub async fn insert_link(
        &self,
        conn: &mut PgConnection,
        stream_id: i64,
        stream_version: u64,
        source: &LinkSource,
    ) -> Result<()> {
        sqlx::query(&self.queries.insert_stream_entry)
            .bind(stream_id)
            .bind(stream_version as i64)
            .bind(source.event_id.as_uuid())
            .bind(source.original_stream_id)
            .bind(source.original_stream_version as i64)
            .execute(conn)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Hard Deletion Primitives (transactional)
    // =========================================================================

    /// Lists the stream's original events with their global sequences.
    pub async fn original_events(
        &self,
        conn: &mut PgConnection,
        stream_id: i64,
    ) -> Result<Vec<(EventId, u64)>> {
        let rows = sqlx::query(&self.queries.select_original_events)
            .bind(stream_id)
            .fetch_all(conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (EventId::from_uuid(r.get(0)), r.get::<i64, _>(1) as u64))
            .collect())
    }

    /// Removes every `stream_events` row referencing this stream's original
    /// events: the original placements and every link in other streams.
    pub async fn delete_event_references(
        &self,
        conn: &mut PgConnection,
        stream_id: i64,
    ) -> Result<()> {
        sqlx::query(&self.queries.delete_event_references)
            .bind(stream_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Physically removes event rows.
    pub async fn delete_events(
        &self,
        conn: &mut PgConnection,
        event_ids: &[EventId],
    ) -> Result<()> {
        let ids: Vec<Uuid> = event_ids.iter().map(|id| id.as_uuid()).collect();
        sqlx::query(&self.queries.delete_events)
            .bind(&ids)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Removes the stream row (links held *by* this stream cascade away).
    pub async fn delete_stream_row(&self, conn: &mut PgConnection, stream_id: i64) -> Result<()> {
        sqlx::query(&self.queries.delete_stream)
            .bind(stream_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Records a hard-delete tombstone for the stream name.
    pub async fn insert_tombstone(
        &self,
        conn: &mut PgConnection,
        stream_uuid: &StreamUuid,
    ) -> Result<()> {
        sqlx::query(&self.queries.insert_tombstone)
            .bind(stream_uuid.as_str())
            .execute(conn)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Notification Emission (transactional)
    // =========================================================================

    /// Queues a commit notification on the store's channel.
    ///
    /// `pg_notify` inside the transaction means delivery happens only on
    /// commit, in commit order.
    pub async fn notify(
        &self,
        conn: &mut PgConnection,
        notification: &StoreNotification,
    ) -> Result<()> {
        let payload = notification.to_payload()?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(conn)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Reads (pooled)
    // =========================================================================

    /// Fetches stream state outside any transaction, for reads.
    pub async fn fetch_stream_state(&self, stream_uuid: &StreamUuid) -> Result<StreamState> {
        let mut conn = self.pool.acquire().await?;
        self.stream_state(&mut conn, stream_uuid).await
    }


    /// Reads a page of a concrete stream in version order.
    pub async fn read_stream_slice(
        &self,
        stream_id: i64,
        from: Position,
        count: usize,
        forward: bool,
    ) -> Result<Vec<RecordedEvent>> {
        let query = if forward {
            &self.queries.read_stream_forward
        } else {
            &self.queries.read_stream_backward
        };
        let rows: Vec<EventRow> = sqlx::query_as(query)
            .bind(stream_id)
            .bind(db_pos(from.as_raw()))
            .bind(count as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EventRow::into_recorded).collect())
    }

    /// Reads a page of `$all` in global sequence order.
    pub async fn read_all_slice(
        &self,
        from: Position,
        count: usize,
        forward: bool,
    ) -> Result<Vec<RecordedEvent>> {
        let query = if forward {
            &self.queries.read_all_forward
        } else {
            &self.queries.read_all_backward
        };
        let rows: Vec<EventRow> = sqlx::query_as(query)
            .bind(db_pos(from.as_raw()))
            .bind(count as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EventRow::into_recorded).collect())
    }

    /// Reads the single event at an exact stream position, if present.
    pub async fn stream_event_at(
        &self,
        stream_id: i64,
        position: Position,
    ) -> Result<Option<RecordedEvent>> {
        let row: Option<EventRow> = sqlx::query_as(&self.queries.stream_event_at)
            .bind(stream_id)
            .bind(db_pos(position.as_raw()))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EventRow::into_recorded))
    }

    /// Reads the single event at an exact global sequence, if present.
    pub async fn all_event_at(&self, position: Position) -> Result<Option<RecordedEvent>> {
        let row: Option<EventRow> = sqlx::query_as(&self.queries.all_event_at)
            .bind(db_pos(position.as_raw()))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EventRow::into_recorded))
    }

    /// The highest committed global sequence, 0 when the store is empty.
    pub async fn all_head(&self) -> Result<u64> {
        let head: i64 = sqlx::query_scalar(&self.queries.all_head)
            .fetch_one(&self.pool)
            .await?;
        Ok(head as u64)
    }

    // =========================================================================
    // Subscription Rows (pooled)
    // =========================================================================

    /// Creates the subscription row on first use, then returns it.
    ///
    /// An existing row wins: `initial_last_seen` (derived from the caller's
    /// `start_from`) only applies to a brand-new subscription.
    pub async fn ensure_subscription(
        &self,
        stream_uuid: &StreamUuid,
        name: &str,
        initial_last_seen: u64,
    ) -> Result<SubscriptionRow> {
        sqlx::query(&self.queries.ensure_subscription)
            .bind(stream_uuid.as_str())
            .bind(name)
            .bind(initial_last_seen as i64)
            .execute(&self.pool)
            .await?;

        let row = sqlx::query(&self.queries.select_subscription)
            .bind(stream_uuid.as_str())
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(SubscriptionRow {
            subscription_id: row.get(0),
            last_seen: row.get::<i64, _>(1) as u64,
        })
    }

    /// Looks up a subscription row without creating it.
    pub async fn find_subscription(
        &self,
        stream_uuid: &StreamUuid,
        name: &str,
    ) -> Result<Option<SubscriptionRow>> {
        let row = sqlx::query(&self.queries.select_subscription)
            .bind(stream_uuid.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| SubscriptionRow {
            subscription_id: r.get(0),
            last_seen: r.get::<i64, _>(1) as u64,
        }))
    }

    /// Persists a checkpoint. Idempotent and monotonic: `GREATEST` makes a
    /// replayed or reordered write a no-op, so `last_seen` never regresses.
    pub async fn checkpoint(&self, subscription_id: i64, last_seen: Position) -> Result<()> {
        sqlx::query(&self.queries.checkpoint)
            .bind(subscription_id)
            .bind(db_pos(last_seen.as_raw()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persists the subscription's lifecycle state.
    pub async fn set_subscription_state(
        &self,
        subscription_id: i64,
        state: SubscriptionState,
    ) -> Result<()> {
        sqlx::query(&self.queries.set_subscription_state)
            .bind(subscription_id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes a subscription row; parked rows cascade away.
    pub async fn delete_subscription(&self, stream_uuid: &StreamUuid, name: &str) -> Result<()> {
        sqlx::query(&self.queries.delete_subscription)
            .bind(stream_uuid.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Parks a position for manual replay.
    pub async fn park(
        &self,
        subscription_id: i64,
        position: Position,
        reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query(&self.queries.insert_parked)
            .bind(subscription_id)
            .bind(db_pos(position.as_raw()))
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lists parked positions in order.
    pub async fn parked(&self, subscription_id: i64) -> Result<Vec<ParkedRow>> {
        let rows = sqlx::query(&self.queries.select_parked)
            .bind(subscription_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ParkedRow {
                position: r.get::<i64, _>(0) as u64,
                reason: r.get(1),
            })
            .collect())
    }

    /// Removes one parked position after successful replay.
    pub async fn unpark(&self, subscription_id: i64, position: Position) -> Result<()> {
        sqlx::query(&self.queries.delete_parked)
            .bind(subscription_id)
            .bind(db_pos(position.as_raw()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_pos_clamps_the_end_sentinel() {
        assert_eq!(db_pos(0), 0);
        assert_eq!(db_pos(42), 42);
        assert_eq!(db_pos(u64::MAX), i64::MAX);
    }

    #[test]
    fn queries_are_fully_prefixed() {
        let queries = Queries::new("es_test");
        for sql in [
            &queries.select_stream,
            &queries.insert_stream,
            &queries.reserve_global,
            &queries.insert_event,
            &queries.insert_stream_entry,
            &queries.read_stream_forward,
            &queries.read_all_backward,
            &queries.ensure_subscription,
            &queries.checkpoint,
            &queries.insert_parked,
        ] {
            assert!(sql.contains("es_test."), "missing prefix in: {sql}");
            assert!(!sql.contains("{prefix}"), "unrendered prefix in: {sql}");
        }
    }

    #[test]
    fn all_reads_are_restricted_to_original_placements() {
        let queries = Queries::new("es");
        assert!(queries
            .read_all_forward
            .contains("se.stream_id = se.original_stream_id"));
        assert!(queries
            .read_all_backward
            .contains("se.stream_id = se.original_stream_id"));
    }
}
