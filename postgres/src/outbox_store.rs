//! Durable outbox store on a single `PostgreSQL` table.

use carrier_core::envelope::{Envelope, Headers};
use carrier_core::outbox::{OutboxError, OutboxFuture, OutboxRecord, OutboxStatus, OutboxStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// Postgres error code for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

/// [`OutboxStore`] backed by a `PostgreSQL` table.
///
/// All writes are single statements, so a record is never observable in a
/// half-updated state. `claim_batch` selects with `FOR UPDATE SKIP LOCKED`:
/// concurrent processors skip each other's rows instead of blocking, which
/// is what makes multi-replica polling safe.
pub struct PostgresOutboxStore {
    pool: PgPool,
    lease: ChronoDuration,
}

impl PostgresOutboxStore {
    /// Default lease window for claimed records.
    pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

    /// Create a store with the default lease window.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::with_lease(pool, Self::DEFAULT_LEASE)
    }

    /// Create a store with an explicit lease window.
    #[must_use]
    pub fn with_lease(pool: PgPool, lease: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)] // Lease windows are far below i64::MAX millis
        let lease = ChronoDuration::milliseconds(lease.as_millis() as i64);
        Self { pool, lease }
    }

    /// Create the `outbox_records` table and its claim index if absent.
    ///
    /// Idempotent; call once at startup.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<(), OutboxError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS outbox_records (
                id UUID PRIMARY KEY,
                event_type TEXT NOT NULL,
                payload BYTEA NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                headers JSONB NOT NULL DEFAULT '[]'::jsonb,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INT NOT NULL DEFAULT 0,
                last_error TEXT,
                available_at TIMESTAMPTZ NOT NULL,
                claimed_at TIMESTAMPTZ
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(e.to_string()))?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_outbox_records_claimable
            ON outbox_records (status, available_at)
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(e.to_string()))?;

        tracing::info!("Outbox schema ensured");
        Ok(())
    }

    /// Snapshot a record by id (operator/test visibility).
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] if no record exists, or
    /// [`OutboxError::Storage`] if the query fails.
    pub async fn get(&self, id: Uuid) -> Result<OutboxRecord, OutboxError> {
        let row = sqlx::query(
            r"
            SELECT id, event_type, payload, occurred_at, headers,
                   status, attempts, last_error, available_at, claimed_at
            FROM outbox_records
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(e.to_string()))?
        .ok_or(OutboxError::NotFound(id))?;

        Self::row_to_record(&row)
    }

    /// Count of records in a given status, for monitoring.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the query fails.
    pub async fn count_by_status(&self, status: OutboxStatus) -> Result<i64, OutboxError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox_records WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(count)
    }

    fn is_unique_violation(error: &sqlx::Error) -> bool {
        error
            .as_database_error()
            .and_then(sqlx::error::DatabaseError::code)
            .is_some_and(|code| code == UNIQUE_VIOLATION)
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord, OutboxError> {
        let status_str: String = row.get("status");
        let status = OutboxStatus::parse(&status_str)?;

        let headers_json: serde_json::Value = row.get("headers");
        let headers: Headers = serde_json::from_value(headers_json)
            .map_err(|e| OutboxError::Storage(format!("invalid headers column: {e}")))?;

        let attempts: i32 = row.get("attempts");

        Ok(OutboxRecord {
            envelope: Envelope {
                id: row.get("id"),
                event_type: row.get("event_type"),
                payload: row.get("payload"),
                occurred_at: row.get("occurred_at"),
                headers,
            },
            status,
            attempts: u32::try_from(attempts).unwrap_or(0),
            last_error: row.get("last_error"),
            available_at: row.get("available_at"),
            claimed_at: row.get("claimed_at"),
        })
    }

    /// Restore claim ordering: `RETURNING` does not guarantee row order.
    fn sort_claimed(records: &mut [OutboxRecord]) {
        records.sort_by_key(|r| (r.available_at, r.id()));
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn append(&self, record: OutboxRecord) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            let headers = serde_json::to_value(&record.envelope.headers)
                .map_err(|e| OutboxError::Storage(format!("headers not serializable: {e}")))?;

            let result = sqlx::query(
                r"
                INSERT INTO outbox_records (
                    id, event_type, payload, occurred_at, headers,
                    status, attempts, last_error, available_at, claimed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ",
            )
            .bind(record.id())
            .bind(&record.envelope.event_type)
            .bind(&record.envelope.payload)
            .bind(record.envelope.occurred_at)
            .bind(headers)
            .bind(record.status.as_str())
            .bind(i64::from(record.attempts))
            .bind(&record.last_error)
            .bind(record.available_at)
            .bind(record.claimed_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {
                    tracing::debug!(
                        record_id = %record.id(),
                        event_type = %record.envelope.event_type,
                        "Outbox record appended"
                    );
                    metrics::counter!("outbox.appended").increment(1);
                    Ok(())
                }
                Err(e) if Self::is_unique_violation(&e) => {
                    Err(OutboxError::DuplicateId(record.id()))
                }
                Err(e) => Err(OutboxError::Storage(e.to_string())),
            }
        })
    }

    fn claim_batch(&self, max: usize, now: DateTime<Utc>) -> OutboxFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            let lease_cutoff = now - self.lease;
            #[allow(clippy::cast_possible_wrap)] // Batch sizes are far below i64::MAX
            let rows = sqlx::query(
                r"
                UPDATE outbox_records
                SET status = 'dispatching', claimed_at = $1
                WHERE id IN (
                    SELECT id FROM outbox_records
                    WHERE (status = 'pending' AND available_at <= $1)
                       OR (status = 'dispatching'
                           AND (claimed_at IS NULL OR claimed_at <= $2))
                    ORDER BY available_at ASC, id ASC
                    LIMIT $3
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, event_type, payload, occurred_at, headers,
                          status, attempts, last_error, available_at, claimed_at
                ",
            )
            .bind(now)
            .bind(lease_cutoff)
            .bind(max as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(e.to_string()))?;

            let mut claimed = rows
                .iter()
                .map(Self::row_to_record)
                .collect::<Result<Vec<_>, _>>()?;
            Self::sort_claimed(&mut claimed);

            if !claimed.is_empty() {
                tracing::debug!(count = claimed.len(), "Outbox records claimed");
            }
            Ok(claimed)
        })
    }

    fn mark_dispatched(&self, id: Uuid) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox_records
                SET status = 'dispatched', attempts = attempts + 1, claimed_at = NULL
                WHERE id = $1
                ",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(OutboxError::NotFound(id));
            }
            Ok(())
        })
    }

    fn mark_failed(
        &self,
        id: Uuid,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            let result = match retry_at {
                Some(at) => {
                    sqlx::query(
                        r"
                        UPDATE outbox_records
                        SET status = 'pending',
                            attempts = attempts + 1,
                            last_error = $1,
                            available_at = $2,
                            claimed_at = NULL
                        WHERE id = $3
                        ",
                    )
                    .bind(&error)
                    .bind(at)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                }
                None => {
                    sqlx::query(
                        r"
                        UPDATE outbox_records
                        SET status = 'failed',
                            attempts = attempts + 1,
                            last_error = $1,
                            claimed_at = NULL
                        WHERE id = $2
                        ",
                    )
                    .bind(&error)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                }
            }
            .map_err(|e| OutboxError::Storage(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(OutboxError::NotFound(id));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use carrier_core::envelope::Headers;

    // Behavior against a live database is covered by external integration
    // environments; these tests pin the pure pieces.

    #[test]
    fn store_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<PostgresOutboxStore>();
        assert_sync::<PostgresOutboxStore>();
    }

    #[test]
    fn sort_claimed_orders_by_available_at_then_id() {
        let now = Utc::now();

        let mut a = OutboxRecord::new(Envelope::new("A", vec![], Headers::new()));
        a.available_at = now;
        let mut b = OutboxRecord::new(Envelope::new("B", vec![], Headers::new()));
        b.available_at = now - ChronoDuration::seconds(5);
        let mut c = OutboxRecord::new(Envelope::new("C", vec![], Headers::new()));
        c.available_at = now;

        let b_id = b.id();
        // a and c share available_at; v7 ids tie-break in creation order
        let (first_tied, second_tied) = (a.id(), c.id());

        let mut records = vec![c, a, b];
        PostgresOutboxStore::sort_claimed(&mut records);

        assert_eq!(records[0].id(), b_id);
        assert_eq!(records[1].id(), first_tied.min(second_tied));
        assert_eq!(records[2].id(), first_tied.max(second_tied));
    }

    #[test]
    fn headers_round_trip_through_json_column_shape() {
        let mut headers = Headers::new();
        headers.insert("trace-id", "t-1");
        headers.insert("tenant", "acme");

        let json = serde_json::to_value(&headers).unwrap();
        let back: Headers = serde_json::from_value(json).unwrap();
        assert_eq!(back, headers);
    }
}
