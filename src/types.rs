//! # Domain Types
//!
//! Core types for the event store: stream identities, versions, the global
//! sequence, events in their "input" ([`EventData`]) and "output"
//! ([`RecordedEvent`]) forms, and the subscription vocabulary.
//!
//! Positions come in three flavors and the newtype pattern keeps them apart:
//!
//! - [`StreamVersion`]: 1-based position within a single stream, no gaps on
//!   the original stream
//! - [`GlobalSequence`]: the total-order key across all events, assigned once
//!   at original append and never on link
//! - [`Position`]: a subscription or read cursor — a stream version when
//!   following a concrete stream, a global sequence when following [`$all`]
//!
//! [`$all`]: StreamUuid::all

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

// =============================================================================
// Stream Identity
// =============================================================================

/// A caller-supplied, non-empty identifier for an event stream.
///
/// Streams are the unit of ordering and optimistic concurrency. Names
/// beginning with `$` are reserved by the store; the only reserved name with
/// caller-visible behavior is [`$all`](StreamUuid::all), the virtual stream
/// of every live event in global commit order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamUuid(String);

/// The name of the virtual all-events stream.
pub const ALL_STREAM: &str = "$all";

impl StreamUuid {
    /// Creates a stream identity from a string.
    pub fn new(uuid: impl Into<String>) -> Self {
        Self(uuid.into())
    }

    /// The virtual `$all` stream.
    pub fn all() -> Self {
        Self(ALL_STREAM.to_string())
    }

    /// Returns the string form of this identity.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this is the virtual `$all` stream.
    pub fn is_all(&self) -> bool {
        self.0 == ALL_STREAM
    }

    /// Advisory lock key for this stream.
    ///
    /// Appends to the same stream serialize on `pg_advisory_xact_lock` keyed
    /// by this hash, while appends to other streams proceed in parallel. XXH3
    /// is stable across platforms and versions, so the keyspace is consistent
    /// for every writer attached to the same database.
    pub fn lock_key(&self) -> i64 {
        xxhash_rust::xxh3::xxh3_64(self.0.as_bytes()) as i64
    }
}

impl fmt::Display for StreamUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamUuid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamUuid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Event Identity
// =============================================================================

/// The unique identifier of a recorded event, assigned at append.
///
/// Links reference events by this id without copying payloads, and the id is
/// preserved no matter which stream the event is read through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random event id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Positions
// =============================================================================

/// A 1-based position within a single stream.
///
/// Stream versions count events: a stream at version N holds events numbered
/// 1..=N. Version 0 means "no events" and doubles as the version of a stream
/// that does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamVersion(u64);

impl StreamVersion {
    /// The version of an empty or absent stream.
    pub const NONE: StreamVersion = StreamVersion(0);

    /// The first event's version.
    pub const FIRST: StreamVersion = StreamVersion(1);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn add(&self, count: u64) -> Self {
        Self(self.0 + count)
    }

    /// True if this represents "no events" (version 0).
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A position in the global event log.
///
/// Strictly increasing, assigned at commit to each distinct event. Events in
/// a single append occupy a contiguous range. Links never consume a sequence
/// number, so a linked event appears in `$all` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GlobalSequence(u64);

impl GlobalSequence {
    /// The first assigned sequence number (0 is the "before anything" cursor).
    pub const FIRST: GlobalSequence = GlobalSequence(1);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for GlobalSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A read or subscription cursor.
///
/// For a concrete stream this is a [`StreamVersion`]; for `$all` it is a
/// [`GlobalSequence`]. A subscription's checkpoint (`last_seen`) is a
/// `Position` and only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position(u64);

impl Position {
    /// The cursor before the first event.
    pub const ORIGIN: Position = Position(0);

    /// Sentinel for backward reads starting at the head.
    pub const END: Position = Position(u64::MAX);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<StreamVersion> for Position {
    fn from(v: StreamVersion) -> Self {
        Position(v.as_raw())
    }
}

impl From<GlobalSequence> for Position {
    fn from(s: GlobalSequence) -> Self {
        Position(s.as_raw())
    }
}

// =============================================================================
// Expected Version
// =============================================================================

/// The version a caller believes a stream has, checked at append/link/delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check; append regardless of the current version.
    Any,
    /// The stream must not exist (and must not be soft deleted).
    NoStream,
    /// The stream must exist with at least one event and must not be deleted.
    StreamExists,
    /// The stream's current version must equal this value exactly.
    ///
    /// `Exact(0)` expects an empty or not-yet-created stream and will create
    /// it, which makes it interchangeable with [`NoStream`] for creation.
    Exact(u64),
}

impl ExpectedVersion {
    /// True if this expectation permits recreating a hard-deleted stream
    /// from version 0.
    pub fn allows_recreation(&self) -> bool {
        matches!(
            self,
            ExpectedVersion::Any | ExpectedVersion::NoStream | ExpectedVersion::Exact(0)
        )
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::NoStream => write!(f, "no stream"),
            ExpectedVersion::StreamExists => write!(f, "stream exists"),
            ExpectedVersion::Exact(v) => write!(f, "{v}"),
        }
    }
}

// =============================================================================
// Deleted State
// =============================================================================

/// The deletion state persisted on a stream row.
///
/// Hard deletion removes the stream row entirely and records a tombstone, so
/// it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletedState {
    /// The stream is readable and appendable.
    Live,
    /// The stream rejects appends, links, and direct reads; its events remain
    /// visible through `$all` and through streams that linked them.
    SoftDeleted,
}

impl DeletedState {
    /// Database text representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletedState::Live => "live",
            DeletedState::SoftDeleted => "soft_deleted",
        }
    }

    /// Parses the database text representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(DeletedState::Live),
            "soft_deleted" => Some(DeletedState::SoftDeleted),
            _ => None,
        }
    }
}

/// Which deletion protocol to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Logical hide: the stream stops accepting operations but its events
    /// survive in `$all` and in linking streams.
    Soft,
    /// Physical removal of the stream's events, every link to them, and the
    /// stream row itself. Requires the configuration opt-in.
    Hard,
}

// =============================================================================
// Events
// =============================================================================

/// An event to be appended: the "input" form, before the store assigns
/// identity and position.
///
/// Payload and metadata are opaque bytes; the store never interprets them.
/// Use the [`codec`](crate::codec) helpers to encode typed values.
#[derive(Debug, Clone)]
pub struct EventData {
    /// Free-form name of the payload shape, e.g. `"AccountOpened"`.
    pub event_type: String,

    /// The event payload.
    pub data: Vec<u8>,

    /// Optional metadata: correlation context, actor info, anything that
    /// does not belong in the domain payload.
    pub metadata: Option<Vec<u8>>,

    /// Optional id of the event or command that caused this event.
    pub causation_id: Option<Uuid>,

    /// Optional id correlating this event with a wider workflow.
    pub correlation_id: Option<Uuid>,
}

impl EventData {
    /// Creates an event with a type and raw payload bytes.
    pub fn new(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
            metadata: None,
            causation_id: None,
            correlation_id: None,
        }
    }

    /// Attaches metadata bytes.
    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Attaches a causation id.
    pub fn with_causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Attaches a correlation id.
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// A stored event with full identity and position information: the "output"
/// form returned by reads and subscriptions.
///
/// `stream_uuid` and `event_number` always describe the event's *original*
/// stream, even when the event was reached through a link or through `$all`.
/// The cursor key in the stream it was read from is [`position`](Self::position).
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Unique event identity, stable across links.
    pub event_id: EventId,

    /// 1-based position in the event's original stream.
    pub event_number: StreamVersion,

    /// The event's original stream.
    pub stream_uuid: StreamUuid,

    /// Free-form name of the payload shape.
    pub event_type: String,

    /// The event payload.
    pub data: Vec<u8>,

    /// Metadata bytes, if any were appended.
    pub metadata: Option<Vec<u8>>,

    /// Causation id, if any.
    pub causation_id: Option<Uuid>,

    /// Correlation id, if any.
    pub correlation_id: Option<Uuid>,

    /// Commit timestamp.
    pub created_at: DateTime<Utc>,

    /// The total-order key across all events.
    pub global_sequence: GlobalSequence,

    /// Cursor position in the stream this event was read from: equals
    /// `event_number` for a direct read, the link target's version when read
    /// via a link, and `global_sequence` when read via `$all`.
    pub position: Position,
}

impl RecordedEvent {
    /// Alias of [`event_number`](Self::event_number) for the original stream.
    pub fn stream_version(&self) -> StreamVersion {
        self.event_number
    }
}

// =============================================================================
// Append Results
// =============================================================================

/// The outcome of a successful append or link.
#[derive(Debug, Clone)]
pub struct AppendResult {
    /// Stream version of the first written entry. `StreamVersion::NONE` for
    /// an empty batch.
    pub first_version: StreamVersion,

    /// Stream version of the last written entry; the stream's new current
    /// version.
    pub last_version: StreamVersion,

    /// Global sequence of the first appended event. `None` for links (which
    /// never consume sequence numbers) and empty batches.
    pub first_sequence: Option<GlobalSequence>,

    /// Global sequence of the last appended event.
    pub last_sequence: Option<GlobalSequence>,
}

impl AppendResult {
    /// Number of entries written by this operation.
    pub fn event_count(&self) -> u64 {
        if self.first_version.is_none() {
            0
        } else {
            self.last_version.as_raw() - self.first_version.as_raw() + 1
        }
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Where a subscription begins when its named checkpoint does not exist yet.
///
/// Once the subscription row exists, later subscribers with the same
/// `(stream, name)` resume from the stored checkpoint and this value is
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Deliver every event from the beginning of the stream.
    Origin,
    /// Deliver only events committed after the subscription is created.
    Current,
    /// Deliver events after this explicit position.
    Position(Position),
}

/// Consumer verdict on a delivery that should not be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Redeliver immediately; parks automatically once `max_retries` is
    /// exceeded.
    Retry,
    /// Advance past the event without invoking the consumer again.
    Skip,
    /// Remove from the in-flight window and record for manual replay.
    Park,
}

/// Opaque token identifying one delivery to one consumer.
///
/// Acks and nacks reference deliveries by token; a redelivery carries a fresh
/// token, so stale tokens from superseded deliveries are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryToken(u64);

impl DeliveryToken {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a subscription, persisted on its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, consumer not yet attached.
    Initial,
    /// Paging historical events from the log.
    CatchingUp,
    /// At the head, delivering live events.
    Subscribed,
    /// No consumer attached; the checkpoint is retained.
    Disconnected,
    /// Administratively halted.
    Paused,
}

impl SubscriptionState {
    /// Database text representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Initial => "initial",
            SubscriptionState::CatchingUp => "catching_up",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Disconnected => "disconnected",
            SubscriptionState::Paused => "paused",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
