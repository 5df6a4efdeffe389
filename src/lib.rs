//! # tidelog — a PostgreSQL-backed event store
//!
//! An append-only, strongly ordered log of domain events organized into
//! named streams, with durable ack-based subscriptions. Built for
//! applications practicing event sourcing.
//!
//! - **Streams and optimistic concurrency**: appends carry an
//!   [`ExpectedVersion`]; concurrent appenders to one stream serialize on a
//!   per-stream advisory lock while other streams proceed in parallel.
//! - **The `$all` stream**: every live event in a single total order, keyed
//!   by a gap-free global sequence assigned at commit.
//! - **Links**: include an event in other streams by reference; one payload,
//!   one global position, any number of memberships.
//! - **Persistent subscriptions**: named, resumable cursors with catch-up
//!   from the log, live delivery driven by `LISTEN`/`NOTIFY`, a bounded
//!   in-flight window, retry/skip/park nacks, and single-active-consumer
//!   failover.
//! - **Soft and hard deletion**: logical hide versus physical removal with
//!   `$all` reconciliation, the latter behind a configuration opt-in.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         EventStore (api)                          │
//! │             append · link · read · delete · subscribe             │
//! └───────┬───────────────┬──────────────┬───────────────┬───────────┘
//!         │               │              │               │
//!         ▼               ▼              ▼               ▼
//!    ┌─────────┐    ┌──────────┐   ┌──────────┐   ┌──────────────┐
//!    │ writer  │    │ deletion │   │  reader  │   │ subscription │
//!    │ (B, D)  │    │   (E)    │   │   (C)    │   │ workers (G)  │
//!    └────┬────┘    └────┬─────┘   └────┬─────┘   └──────┬───────┘
//!         │              │              │                │ ▲ wake
//!         ▼              ▼              ▼                ▼ │
//!    ┌──────────────────────────────────────────┐   ┌──────────────┐
//!    │             storage adapter              │   │ notification │
//!    │  advisory locks · transactions · NOTIFY  │──►│  bus (F)     │
//!    └────────────────────┬─────────────────────┘   └──────────────┘
//!                         ▼
//!                   ┌────────────┐
//!                   │ PostgreSQL │
//!                   └────────────┘
//! ```
//!
//! The database is the single source of truth. The bus and the subscription
//! registry are advisory, in-memory, and reconstructable from it.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use tidelog::{
//!     EventData, EventStore, ExpectedVersion, Position, StoreConfig, SubscriptionOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> tidelog::Result<()> {
//!     let config = StoreConfig::new("postgres://localhost/app");
//!
//!     // One-time administrative step (deploy task, not the hot path):
//!     let pool = sqlx::PgPool::connect(&config.url).await?;
//!     tidelog::schema::initialize(&pool, &config.schema_prefix).await?;
//!
//!     let store = EventStore::connect(config).await?;
//!
//!     store
//!         .append(
//!             "account-1",
//!             ExpectedVersion::NoStream,
//!             vec![EventData::new("AccountOpened", br#"{"owner":"ada"}"#.to_vec())],
//!         )
//!         .await?;
//!
//!     let mut subscription = store
//!         .subscribe("$all", "auditor", SubscriptionOptions::default())
//!         .await?;
//!     while let Some(delivery) = subscription.next().await {
//!         println!("{} at {}", delivery.event.event_type, delivery.event.position);
//!         subscription.ack(delivery.token).await?;
//!     }
//!
//!     store.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Invariants
//!
//! 1. Per stream, event numbers are exactly `1..=N`: no gaps, no duplicates.
//! 2. The global sequence strictly increases in commit order and is gap-free
//!    at commit boundaries.
//! 3. A subscription's checkpoint never regresses; it advances only over the
//!    contiguous acked prefix.
//! 4. At most one consumer per subscription is active at a time.
//! 5. Hard deletion leaves no trace in `$all`; soft deletion leaves `$all`
//!    untouched.

/// The public store handle.
pub mod api;

/// Payload codec boundary: the [`Serializer`] capability and typed helpers.
pub mod codec;

/// Store and subscription configuration.
pub mod config;

/// Soft/hard stream deletion.
mod deletion;

/// Crate-wide error type.
pub mod error;

/// Commit notification payloads and the `LISTEN`/`NOTIFY` bus.
pub mod notifications;

/// Forward/backward reads and lazy paging.
pub mod reader;

/// DDL and administrative schema operations.
pub mod schema;

/// SQL statements, transactions, and advisory locking.
mod storage;

/// Persistent subscriptions: workers, in-flight window, failover.
pub mod subscription;

/// Domain types: identities, positions, events, expected versions.
pub mod types;

/// The append engine and linker.
mod writer;

pub use api::EventStore;
pub use codec::{JsonSerializer, Serializer};
pub use config::{StoreConfig, SubscriptionOptions};
pub use error::{Error, Result};
pub use reader::EventPager;
pub use subscription::{run_handler, Delivery, EventHandler, Subscription};

pub use types::{
    AppendResult, DeleteMode, DeliveryToken, EventData, EventId, ExpectedVersion, GlobalSequence,
    NackAction, Position, RecordedEvent, StartFrom, StreamUuid, StreamVersion, ALL_STREAM,
};

pub use notifications::{NotificationKind, StoreNotification};
