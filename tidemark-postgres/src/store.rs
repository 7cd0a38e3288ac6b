//! [`EventStore`] implementation over the adapter's tables.

use crate::{map_sqlx_error, PostgresStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use tidemark::errors::{StoreError, StoreResult};
use tidemark::event::{DomainEvent, EventPage, StoredEvent};
use tidemark::projection::DeadLetter;
use tidemark::sequence::SequenceBlock;
use tidemark::store::{EventStore, GapReport, LockGuard, StreamLock};
use tidemark::stream::{
    ActionKind, ExpectedVersion, SaveOutcome, Snapshot, StoreStatistics, StreamState, StreamWrite,
};
use tidemark::types::{ProjectionName, Sequence, ShardName, StreamKey, TenantId, Version};
use tracing::{debug, instrument, warn};

/// Session advisory lock on one stream, held by a dedicated pooled
/// connection. Dropping the guard unlocks; a crashed process releases it
/// when its session dies.
struct PgStreamLock {
    // Mutex only to make the guard shareable; nothing locks it after
    // construction until drop.
    conn: tokio::sync::Mutex<Option<sqlx::pool::PoolConnection<Postgres>>>,
    stream: String,
}

impl std::fmt::Debug for PgStreamLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStreamLock")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl StreamLock for PgStreamLock {}

impl Drop for PgStreamLock {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.get_mut().take() {
            let stream = self.stream.clone();
            // The connection goes back to the pool after unlocking; if no
            // runtime is left, dropping it closes the session and the lock
            // dies with it.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let released =
                        sqlx::query("SELECT pg_advisory_unlock(hashtextextended($1, 0))")
                            .bind(&stream)
                            .execute(&mut *conn)
                            .await;
                    if let Err(error) = released {
                        warn!(stream = %stream, error = %error, "advisory unlock failed");
                    }
                });
            }
        }
    }
}

fn version_from_row(row: &PgRow, column: &str) -> StoreResult<Version> {
    let raw: i64 = row.try_get(column).map_err(map_sqlx_error)?;
    Ok(Version::new(raw.max(0) as u64))
}

fn sequence_from_i64(raw: i64) -> StoreResult<Sequence> {
    Sequence::try_new(raw).map_err(|e| StoreError::TransactionRollback(e.to_string()))
}

fn stream_key_from_row(row: &PgRow) -> StoreResult<StreamKey> {
    let raw: String = row.try_get("stream_key").map_err(map_sqlx_error)?;
    StreamKey::try_new(raw).map_err(|e| StoreError::TransactionRollback(e.to_string()))
}

fn tenant_from_row(row: &PgRow) -> StoreResult<TenantId> {
    let raw: String = row.try_get("tenant").map_err(map_sqlx_error)?;
    TenantId::try_new(raw).map_err(|e| StoreError::TransactionRollback(e.to_string()))
}

impl<E: DomainEvent> PostgresStore<E> {
    fn stored_event_from_row(&self, row: &PgRow) -> StoreResult<StoredEvent<E>> {
        let data: Vec<u8> = row.try_get("data").map_err(map_sqlx_error)?;
        let payload = self.format.codec().deserialize(&data)?;
        let raw_seq: i64 = row.try_get("seq_id").map_err(map_sqlx_error)?;
        let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(map_sqlx_error)?;
        let type_name: String = row.try_get("type").map_err(map_sqlx_error)?;
        Ok(StoredEvent {
            sequence: sequence_from_i64(raw_seq)?,
            stream: stream_key_from_row(row)?,
            version: version_from_row(row, "version")?,
            type_name,
            payload,
            timestamp,
            tenant: tenant_from_row(row)?,
        })
    }

    /// Marks a stream as archived. Its events stop appearing in page reads;
    /// direct stream reads still see them.
    pub async fn archive_stream(&self, stream: &StreamKey) -> StoreResult<()> {
        let updated =
            sqlx::query("UPDATE tidemark_streams SET is_archived = true WHERE stream_key = $1")
                .bind(stream.as_ref())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::StreamNotFound(stream.clone()));
        }
        Ok(())
    }

    /// Applies one write's stream-row operation inside `tx`.
    ///
    /// Returns the conflict if the guard failed, `None` if the row is now in
    /// place for the write's events. A missing stream on append aborts the
    /// batch outright; that is a caller bug, not a race to aggregate.
    async fn apply_stream_row(
        tx: &mut Transaction<'_, Postgres>,
        write: &StreamWrite<E>,
    ) -> StoreResult<Option<StoreError>> {
        let final_version = write
            .events
            .last()
            .map_or_else(Version::zero, |e| e.version);

        match write.kind {
            ActionKind::Start => {
                let inserted = sqlx::query(
                    "INSERT INTO tidemark_streams (stream_key, version, aggregate_type, tenant)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (stream_key) DO NOTHING",
                )
                .bind(write.stream.as_ref())
                .bind(final_version.get() as i64)
                .bind(write.aggregate_type.as_deref())
                .bind(write.tenant.as_ref())
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx_error)?;
                if inserted.rows_affected() == 0 {
                    return Ok(Some(StoreError::StreamCollision(write.stream.clone())));
                }
            }
            ActionKind::Append => {
                // The session resolves `Any` to a literal before the store
                // sees it; an `Any` that still arrives here skips the guard.
                let expected = match write.expected {
                    ExpectedVersion::Exact(v) => Some(v),
                    ExpectedVersion::NoStream => Some(Version::zero()),
                    ExpectedVersion::Any => None,
                };
                let updated = match expected {
                    Some(expected) => sqlx::query(
                        "UPDATE tidemark_streams
                         SET version = $1, last_timestamp = now()
                         WHERE stream_key = $2 AND version = $3",
                    )
                    .bind(final_version.get() as i64)
                    .bind(write.stream.as_ref())
                    .bind(expected.get() as i64)
                    .execute(&mut **tx)
                    .await
                    .map_err(map_sqlx_error)?,
                    None => sqlx::query(
                        "UPDATE tidemark_streams
                         SET version = $1, last_timestamp = now()
                         WHERE stream_key = $2",
                    )
                    .bind(final_version.get() as i64)
                    .bind(write.stream.as_ref())
                    .execute(&mut **tx)
                    .await
                    .map_err(map_sqlx_error)?,
                };
                if updated.rows_affected() == 0 {
                    // Zero rows: either the stream does not exist or the
                    // version moved. An existence check disambiguates.
                    let row = sqlx::query(
                        "SELECT version FROM tidemark_streams WHERE stream_key = $1",
                    )
                    .bind(write.stream.as_ref())
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(map_sqlx_error)?;
                    return match row {
                        None => Err(StoreError::StreamNotFound(write.stream.clone())),
                        Some(row) => Ok(Some(StoreError::ConcurrencyConflict {
                            aggregate_type: write
                                .aggregate_type
                                .clone()
                                .unwrap_or_else(|| "stream".to_string()),
                            stream: write.stream.clone(),
                            expected: expected.unwrap_or_else(Version::zero),
                            actual: version_from_row(&row, "version")?,
                        })),
                    };
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<E: DomainEvent> EventStore for PostgresStore<E> {
    type Event = E;

    #[instrument(name = "postgres.save", skip(self, batch), fields(writes = batch.len()))]
    async fn save(&self, batch: Vec<StreamWrite<E>>) -> StoreResult<SaveOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut conflicts = Vec::new();
        let mut outcome = SaveOutcome::new();

        for write in &batch {
            if let Some(conflict) = Self::apply_stream_row(&mut tx, write).await? {
                conflicts.push(conflict);
                continue;
            }

            let codec = self.format.codec();
            for event in &write.events {
                let data = codec.serialize(&event.event.payload)?;
                sqlx::query(
                    "INSERT INTO tidemark_events
                         (seq_id, id, stream_key, version, type, data, format, tenant, timestamp)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(event.sequence.get())
                .bind(event.event.id)
                .bind(write.stream.as_ref())
                .bind(event.version.get() as i64)
                .bind(&event.event.type_name)
                .bind(&data)
                .bind(self.format.to_string())
                .bind(write.tenant.as_ref())
                .bind(event.event.timestamp)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            }
            if let Some(final_version) = write.final_version() {
                outcome.insert(write.stream.clone(), final_version);
            }
        }

        if !conflicts.is_empty() {
            drop(tx);
            return Err(if conflicts.len() == 1 {
                conflicts.swap_remove(0)
            } else {
                StoreError::ConflictBatch { conflicts }
            });
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(streams = outcome.len(), "batch committed");
        Ok(outcome)
    }

    async fn stream_state(&self, stream: &StreamKey) -> StoreResult<Option<StreamState>> {
        let row = sqlx::query(
            "SELECT stream_key, version, aggregate_type, tenant, is_archived, created, last_timestamp
             FROM tidemark_streams WHERE stream_key = $1",
        )
        .bind(stream.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|row| {
            Ok(StreamState {
                stream: stream_key_from_row(&row)?,
                version: version_from_row(&row, "version")?,
                aggregate_type: row.try_get("aggregate_type").map_err(map_sqlx_error)?,
                created: row.try_get("created").map_err(map_sqlx_error)?,
                last_timestamp: row.try_get("last_timestamp").map_err(map_sqlx_error)?,
                is_archived: row.try_get("is_archived").map_err(map_sqlx_error)?,
                tenant: tenant_from_row(&row)?,
            })
        })
        .transpose()
    }

    async fn read_stream(
        &self,
        stream: &StreamKey,
        after: Version,
    ) -> StoreResult<Vec<StoredEvent<E>>> {
        let rows = sqlx::query(
            "SELECT seq_id, stream_key, version, type, data, tenant, timestamp
             FROM tidemark_events
             WHERE stream_key = $1 AND version > $2
             ORDER BY version",
        )
        .bind(stream.as_ref())
        .bind(after.get() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(|row| self.stored_event_from_row(row)).collect()
    }

    async fn read_page(
        &self,
        floor: Sequence,
        ceiling: Sequence,
        limit: usize,
    ) -> StoreResult<EventPage<E>> {
        let rows = sqlx::query(
            "SELECT e.seq_id, e.stream_key, e.version, e.type, e.data, e.tenant, e.timestamp
             FROM tidemark_events e
             JOIN tidemark_streams s ON s.stream_key = e.stream_key
             WHERE e.seq_id > $1 AND e.seq_id <= $2 AND NOT s.is_archived
             ORDER BY e.seq_id
             LIMIT $3",
        )
        .bind(floor.get())
        .bind(ceiling.get())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let events = rows
            .iter()
            .map(|row| self.stored_event_from_row(row))
            .collect::<StoreResult<Vec<_>>>()?;
        // A truncated page covers only up to its last event.
        let covered = if events.len() == limit {
            events.last().map_or(ceiling, |e| e.sequence)
        } else {
            ceiling
        };
        Ok(EventPage::new(floor, covered, events))
    }

    async fn reserve_sequences(&self, count: usize) -> StoreResult<SequenceBlock> {
        if count == 0 {
            return Ok(SequenceBlock::default());
        }
        let rows = sqlx::query(
            "SELECT nextval('tidemark_sequence') AS seq FROM generate_series(1, $1)",
        )
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let numbers = rows
            .iter()
            .map(|row| {
                let raw: i64 = row.try_get("seq").map_err(map_sqlx_error)?;
                sequence_from_i64(raw)
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(SequenceBlock::new(numbers))
    }

    async fn gap_report(&self, after: Sequence) -> StoreResult<GapReport> {
        let max_row = sqlx::query("SELECT coalesce(max(seq_id), 0) AS max_seq FROM tidemark_events")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let max_raw: i64 = max_row.try_get("max_seq").map_err(map_sqlx_error)?;
        let max_sequence = sequence_from_i64(max_raw)?;

        if max_sequence <= after {
            return Ok(GapReport {
                max_sequence,
                first_gap: None,
            });
        }

        let gap_row = sqlx::query(
            "SELECT n FROM generate_series($1::bigint + 1, $2::bigint) AS n
             LEFT JOIN tidemark_events e ON e.seq_id = n
             WHERE e.seq_id IS NULL
             ORDER BY n
             LIMIT 1",
        )
        .bind(after.get())
        .bind(max_sequence.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let first_gap = gap_row
            .map(|row| {
                let raw: i64 = row.try_get("n").map_err(map_sqlx_error)?;
                sequence_from_i64(raw)
            })
            .transpose()?;
        Ok(GapReport {
            max_sequence,
            first_gap,
        })
    }

    async fn load_progress(&self, shard: &ShardName) -> StoreResult<Option<Sequence>> {
        let row = sqlx::query("SELECT last_seq_id FROM tidemark_progression WHERE name = $1")
            .bind(shard.identity())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|row| {
            let raw: i64 = row.try_get("last_seq_id").map_err(map_sqlx_error)?;
            sequence_from_i64(raw)
        })
        .transpose()
    }

    async fn store_progress(&self, shard: &ShardName, sequence: Sequence) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO tidemark_progression (name, last_seq_id, last_updated)
             VALUES ($1, $2, now())
             ON CONFLICT (name)
             DO UPDATE SET last_seq_id = excluded.last_seq_id, last_updated = now()",
        )
        .bind(shard.identity())
        .bind(sequence.get())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn delete_progress_for(&self, projection: &ProjectionName) -> StoreResult<()> {
        sqlx::query("DELETE FROM tidemark_progression WHERE name LIKE $1 || ':%'")
            .bind(projection.as_ref())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn record_dead_letter(&self, dead_letter: DeadLetter) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO tidemark_dead_letters
                 (id, projection, shard_name, seq_id, stream_key, error, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(uuid::Uuid::now_v7())
        .bind(dead_letter.projection.as_ref())
        .bind(dead_letter.shard.identity())
        .bind(dead_letter.sequence.get())
        .bind(dead_letter.stream.as_ref())
        .bind(&dead_letter.error)
        .bind(dead_letter.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn dead_letters_for(&self, projection: &ProjectionName) -> StoreResult<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT shard_name, seq_id, stream_key, error, recorded_at
             FROM tidemark_dead_letters
             WHERE projection = $1
             ORDER BY seq_id",
        )
        .bind(projection.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| {
                let identity: String = row.try_get("shard_name").map_err(map_sqlx_error)?;
                let index = identity
                    .rsplit(':')
                    .next()
                    .and_then(|i| i.parse::<u16>().ok())
                    .unwrap_or(0);
                let raw_seq: i64 = row.try_get("seq_id").map_err(map_sqlx_error)?;
                Ok(DeadLetter {
                    projection: projection.clone(),
                    shard: ShardName::new(projection.clone(), index),
                    sequence: sequence_from_i64(raw_seq)?,
                    stream: stream_key_from_row(row)?,
                    error: row.try_get("error").map_err(map_sqlx_error)?,
                    recorded_at: row.try_get("recorded_at").map_err(map_sqlx_error)?,
                })
            })
            .collect()
    }

    async fn delete_dead_letters_for(&self, projection: &ProjectionName) -> StoreResult<()> {
        sqlx::query("DELETE FROM tidemark_dead_letters WHERE projection = $1")
            .bind(projection.as_ref())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn try_lock_stream(&self, stream: &StreamKey) -> StoreResult<Option<LockGuard>> {
        // The lock must live on one dedicated session; pool checkout pins it.
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        let row = sqlx::query("SELECT pg_try_advisory_lock(hashtextextended($1, 0)) AS locked")
            .bind(stream.as_ref())
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        let locked: bool = row.try_get("locked").map_err(map_sqlx_error)?;
        if locked {
            Ok(Some(Box::new(PgStreamLock {
                conn: tokio::sync::Mutex::new(Some(conn)),
                stream: stream.as_ref().to_string(),
            })))
        } else {
            Ok(None)
        }
    }

    async fn load_snapshot(&self, stream: &StreamKey) -> StoreResult<Option<Snapshot>> {
        let row = sqlx::query(
            "SELECT stream_key, version, data FROM tidemark_snapshots WHERE stream_key = $1",
        )
        .bind(stream.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.map(|row| {
            let data: serde_json::Value = row.try_get("data").map_err(map_sqlx_error)?;
            Ok(Snapshot {
                stream: stream_key_from_row(&row)?,
                version: version_from_row(&row, "version")?,
                data,
            })
        })
        .transpose()
    }

    async fn store_snapshot(&self, snapshot: Snapshot) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO tidemark_snapshots (stream_key, version, data, updated)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (stream_key)
             DO UPDATE SET version = excluded.version, data = excluded.data, updated = now()",
        )
        .bind(snapshot.stream.as_ref())
        .bind(snapshot.version.get() as i64)
        .bind(&snapshot.data)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn statistics(&self) -> StoreResult<StoreStatistics> {
        let row = sqlx::query(
            "SELECT
                 (SELECT count(*) FROM tidemark_events) AS event_count,
                 (SELECT count(*) FROM tidemark_streams) AS stream_count,
                 (SELECT coalesce(max(seq_id), 0) FROM tidemark_events) AS max_seq",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let event_count: i64 = row.try_get("event_count").map_err(map_sqlx_error)?;
        let stream_count: i64 = row.try_get("stream_count").map_err(map_sqlx_error)?;
        let max_raw: i64 = row.try_get("max_seq").map_err(map_sqlx_error)?;
        Ok(StoreStatistics {
            event_count: event_count.max(0) as u64,
            stream_count: stream_count.max(0) as u64,
            max_sequence: sequence_from_i64(max_raw)?,
        })
    }

    fn database_identifier(&self) -> String {
        self.name.clone()
    }
}
