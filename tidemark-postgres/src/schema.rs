//! DDL for the adapter's tables.
//!
//! Applied statement by statement so the setup works on plain connections
//! without a migration harness. Every statement is idempotent.

/// The full schema, in dependency order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // The single monotonic counter every event draws its sequence from.
    "CREATE SEQUENCE IF NOT EXISTS tidemark_sequence",
    r"
    CREATE TABLE IF NOT EXISTS tidemark_streams (
        stream_key      varchar(255) PRIMARY KEY,
        version         bigint       NOT NULL,
        aggregate_type  varchar(255),
        tenant          varchar(100) NOT NULL DEFAULT '*DEFAULT*',
        is_archived     boolean      NOT NULL DEFAULT false,
        created         timestamptz  NOT NULL DEFAULT now(),
        last_timestamp  timestamptz  NOT NULL DEFAULT now()
    )",
    r"
    CREATE TABLE IF NOT EXISTS tidemark_events (
        seq_id      bigint       PRIMARY KEY,
        id          uuid         NOT NULL,
        stream_key  varchar(255) NOT NULL REFERENCES tidemark_streams (stream_key),
        version     bigint       NOT NULL,
        type        varchar(255) NOT NULL,
        data        bytea        NOT NULL,
        format      varchar(16)  NOT NULL DEFAULT 'json',
        tenant      varchar(100) NOT NULL DEFAULT '*DEFAULT*',
        timestamp   timestamptz  NOT NULL DEFAULT now(),
        CONSTRAINT tidemark_events_stream_version UNIQUE (stream_key, version)
    )",
    "CREATE INDEX IF NOT EXISTS tidemark_events_stream_idx ON tidemark_events (stream_key, version)",
    // One row per shard, keyed by the shard identity string ('orders:2').
    r"
    CREATE TABLE IF NOT EXISTS tidemark_progression (
        name          varchar(512) PRIMARY KEY,
        last_seq_id   bigint       NOT NULL DEFAULT 0,
        last_updated  timestamptz  NOT NULL DEFAULT now()
    )",
    r"
    CREATE TABLE IF NOT EXISTS tidemark_dead_letters (
        id           uuid         PRIMARY KEY,
        projection   varchar(255) NOT NULL,
        shard_name   varchar(512) NOT NULL,
        seq_id       bigint       NOT NULL,
        stream_key   varchar(255) NOT NULL,
        error        text         NOT NULL,
        recorded_at  timestamptz  NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS tidemark_dead_letters_projection_idx ON tidemark_dead_letters (projection)",
    r"
    CREATE TABLE IF NOT EXISTS tidemark_snapshots (
        stream_key  varchar(255) PRIMARY KEY,
        version     bigint       NOT NULL,
        data        jsonb        NOT NULL,
        updated     timestamptz  NOT NULL DEFAULT now()
    )",
];
