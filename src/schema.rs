//! # PostgreSQL Schema
//!
//! DDL for all store tables and the administrative operations that manage
//! them. Schema creation is a separate administrative step ([`initialize`]);
//! the store itself only [verifies](verify_version) at open and refuses to
//! start when the on-disk version is below what this build expects.
//!
//! ## Table Overview
//!
//! ```text
//! streams                    stream_events                  events
//! ┌─────────────────┐        ┌─────────────────────────┐    ┌──────────────────┐
//! │ stream_id (PK)  │◄───────│ stream_id               │    │ event_id (PK)    │
//! │ stream_uuid (U) │        │ stream_version          │───►│ event_type       │
//! │ stream_version  │◄───────│ event_id                │    │ data / metadata  │
//! │ deleted_state   │        │ original_stream_id      │    │ causation_id     │
//! │ created_at      │        │ original_stream_version │    │ correlation_id   │
//! └─────────────────┘        │ PK (stream_id, version) │    │ global_seq (U)   │
//!                            └─────────────────────────┘    └──────────────────┘
//!
//! subscriptions              subscription_parked     tombstones   global_counter
//! ┌───────────────────────┐  ┌────────────────────┐  ┌─────────┐  ┌────────────┐
//! │ PK (stream_uuid,name) │◄─│ subscription_id    │  │ uuid PK │  │ single row │
//! │ subscription_id (U)   │  │ position           │  └─────────┘  └────────────┘
//! │ last_seen / state     │  │ PK (sub, position) │
//! └───────────────────────┘  └────────────────────┘
//! ```
//!
//! Every event row lives once in `events`; `stream_events` holds one row per
//! stream membership. The row where `stream_id = original_stream_id` is the
//! event's original placement, every other row is a link. `$all` is not a
//! table: it is the `events` table ordered by `global_sequence`.
//!
//! All tables live under a configurable schema prefix so several stores can
//! share one database.

use sqlx::{Executor, PgPool, Row};
use tracing::info;

use crate::error::{Error, Result};

/// Current schema version. Bumped on breaking schema changes.
pub const SCHEMA_VERSION: i64 = 1;

// =============================================================================
// DDL Statements
// =============================================================================
// Templates use `{prefix}` for the schema name; `render` substitutes it after
// the prefix has been validated as a safe identifier.

/// One row per stream. `stream_version` counts the entries in the stream,
/// links included, and never decreases. Hard deletion removes the row.
const CREATE_STREAMS: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}.streams (
    stream_id      BIGSERIAL PRIMARY KEY,
    stream_uuid    TEXT NOT NULL UNIQUE,
    stream_version BIGINT NOT NULL DEFAULT 0,
    deleted_state  TEXT NOT NULL DEFAULT 'live',
    created_at     TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// One row per distinct event. `global_sequence` is the total-order key,
/// reserved from `global_counter` inside the append transaction.
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}.events (
    event_id        UUID PRIMARY KEY,
    event_type      TEXT NOT NULL,
    data            BYTEA NOT NULL,
    metadata        BYTEA,
    causation_id    UUID,
    correlation_id  UUID,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    global_sequence BIGINT NOT NULL UNIQUE
)
"#;

/// Stream membership. The original placement has
/// `stream_id = original_stream_id`; link rows reference the same `event_id`
/// from other streams without copying the payload.
const CREATE_STREAM_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}.stream_events (
    stream_id               BIGINT NOT NULL REFERENCES {prefix}.streams (stream_id) ON DELETE CASCADE,
    stream_version          BIGINT NOT NULL,
    event_id                UUID NOT NULL REFERENCES {prefix}.events (event_id),
    original_stream_id      BIGINT NOT NULL,
    original_stream_version BIGINT NOT NULL,
    PRIMARY KEY (stream_id, stream_version),
    UNIQUE (stream_id, event_id)
)
"#;

/// Supports cascade removal of link rows when a source stream is hard
/// deleted.
const CREATE_STREAM_EVENTS_ORIGINAL_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS stream_events_original
ON {prefix}.stream_events (original_stream_id)
"#;

/// Durable subscription checkpoints, keyed by (stream, name).
const CREATE_SUBSCRIPTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}.subscriptions (
    subscription_id   BIGSERIAL UNIQUE,
    stream_uuid       TEXT NOT NULL,
    subscription_name TEXT NOT NULL,
    last_seen         BIGINT NOT NULL DEFAULT 0,
    state             TEXT NOT NULL DEFAULT 'initial',
    created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (stream_uuid, subscription_name)
)
"#;

/// Deliveries that exhausted their retry budget, held for manual replay.
const CREATE_SUBSCRIPTION_PARKED: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}.subscription_parked (
    subscription_id BIGINT NOT NULL REFERENCES {prefix}.subscriptions (subscription_id) ON DELETE CASCADE,
    position        BIGINT NOT NULL,
    reason          TEXT,
    parked_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (subscription_id, position)
)
"#;

/// Hard-delete markers. A tombstoned name reads as deleted rather than
/// absent until it is recreated from version 0.
const CREATE_TOMBSTONES: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}.tombstones (
    stream_uuid TEXT PRIMARY KEY,
    deleted_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// The global sequence reservation row.
///
/// A plain counter row instead of a `SEQUENCE`: the row lock serializes
/// commits, `UPDATE .. RETURNING` hands a batch a contiguous range, and a
/// rolled-back transaction releases its range without leaving a gap.
const CREATE_GLOBAL_COUNTER: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}.global_counter (
    id    INT PRIMARY KEY CHECK (id = 1),
    value BIGINT NOT NULL
)
"#;

const SEED_GLOBAL_COUNTER: &str = r#"
INSERT INTO {prefix}.global_counter (id, value) VALUES (1, 0)
ON CONFLICT (id) DO NOTHING
"#;

/// Store metadata, carrying the schema version.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS {prefix}.store_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Prefix Handling
// =============================================================================

/// Validates that a schema prefix is a safe SQL identifier.
///
/// Prefixes are substituted into DDL and query text, so only
/// `[a-z_][a-z0-9_]*` is accepted.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    let mut chars = prefix.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if head_ok && tail_ok && prefix.len() <= 48 {
        Ok(())
    } else {
        Err(Error::InvalidSchemaPrefix {
            prefix: prefix.to_string(),
        })
    }
}

fn render(template: &str, prefix: &str) -> String {
    template.replace("{prefix}", prefix)
}

// =============================================================================
// Administrative Operations
// =============================================================================

/// Creates the store schema, tables, and seed rows.
///
/// Idempotent: every statement is `IF NOT EXISTS` / `ON CONFLICT DO NOTHING`,
/// so re-running against an initialized store is a no-op. Run this as a
/// deployment step before opening the store.
pub async fn initialize(pool: &PgPool, prefix: &str) -> Result<()> {
    validate_prefix(prefix)?;

    let mut tx = pool.begin().await?;
    tx.execute(format!("CREATE SCHEMA IF NOT EXISTS {prefix}").as_str())
        .await?;

    for template in [
        CREATE_METADATA,
        CREATE_STREAMS,
        CREATE_EVENTS,
        CREATE_STREAM_EVENTS,
        CREATE_STREAM_EVENTS_ORIGINAL_INDEX,
        CREATE_SUBSCRIPTIONS,
        CREATE_SUBSCRIPTION_PARKED,
        CREATE_TOMBSTONES,
        CREATE_GLOBAL_COUNTER,
        SEED_GLOBAL_COUNTER,
    ] {
        tx.execute(render(template, prefix).as_str()).await?;
    }

    sqlx::query(&render(
        "INSERT INTO {prefix}.store_metadata (key, value) VALUES ('schema_version', $1)
         ON CONFLICT (key) DO NOTHING",
        prefix,
    ))
    .bind(SCHEMA_VERSION.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!(schema = prefix, version = SCHEMA_VERSION, "store schema initialized");
    Ok(())
}

/// Verifies the on-disk schema version.
///
/// Called at store open. A missing schema reads as version 0. The store
/// refuses to start when the version is below [`SCHEMA_VERSION`].
pub async fn verify_version(pool: &PgPool, prefix: &str) -> Result<()> {
    validate_prefix(prefix)?;

    let table: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
        .bind(format!("{prefix}.store_metadata"))
        .fetch_one(pool)
        .await?;

    let found: i64 = match table {
        None => 0,
        Some(_) => {
            let row = sqlx::query(&render(
                "SELECT value FROM {prefix}.store_metadata WHERE key = 'schema_version'",
                prefix,
            ))
            .fetch_optional(pool)
            .await?;
            row.map(|r| {
                r.get::<String, _>(0)
                    .parse::<i64>()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
        }
    };

    if found < SCHEMA_VERSION {
        return Err(Error::SchemaVersionMismatch {
            found,
            expected: SCHEMA_VERSION,
        });
    }
    Ok(())
}

/// Drops the store schema and everything in it.
///
/// Intended for tests and teardown; there is no undo.
pub async fn drop_schema(pool: &PgPool, prefix: &str) -> Result<()> {
    validate_prefix(prefix)?;
    pool.execute(format!("DROP SCHEMA IF EXISTS {prefix} CASCADE").as_str())
        .await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
