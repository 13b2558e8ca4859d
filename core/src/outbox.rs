//! Transactional outbox: records, store contract, in-memory reference store.
//!
//! An [`OutboxRecord`] wraps an [`Envelope`] with delivery bookkeeping:
//! status, attempt count, last error, and the earliest time the next attempt
//! is allowed. Business code appends records inside the same unit of work as
//! its domain writes; the outbox processor (in `carrier-runtime`) is the only
//! writer of `status`/`attempts`/`available_at` afterwards.
//!
//! # Claim/lease discipline
//!
//! [`OutboxStore::claim_batch`] must be safe under concurrent callers:
//! a record handed to one caller is invisible to others until the caller
//! finalizes it or its lease expires. A claimed-but-never-finalized record
//! (crashed processor) becomes claimable again once the lease window has
//! passed, preserving at-least-once delivery.
//!
//! Claim ordering is `available_at` ascending with `id` ascending as the
//! stable tie-break — oldest-eligible-first, deterministic. Envelope ids are
//! UUIDv7, so the tie-break follows creation order.

use crate::envelope::Envelope;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by outbox store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// A record with this envelope id already exists.
    #[error("outbox record {0} already exists")]
    DuplicateId(Uuid),

    /// No record with this id exists.
    #[error("outbox record {0} not found")]
    NotFound(Uuid),

    /// The underlying storage failed.
    #[error("outbox storage error: {0}")]
    Storage(String),
}

/// Delivery status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Awaiting delivery (or awaiting retry once `available_at` is due).
    Pending,
    /// Claimed by a processor; protected by a lease.
    Dispatching,
    /// Confirmed published. Terminal; compaction is an external concern.
    Dispatched,
    /// Delivery gave up. Terminal; surfaced for operator attention.
    Failed,
}

impl OutboxStatus {
    /// Storage string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatching => "dispatching",
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
        }
    }

    /// Parse a storage string representation.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the string is not a known status.
    pub fn parse(s: &str) -> Result<Self, OutboxError> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatching" => Ok(Self::Dispatching),
            "dispatched" => Ok(Self::Dispatched),
            "failed" => Ok(Self::Failed),
            _ => Err(OutboxError::Storage(format!("invalid outbox status: {s}"))),
        }
    }
}

/// An envelope plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// The envelope to deliver.
    pub envelope: Envelope,
    /// Current delivery status.
    pub status: OutboxStatus,
    /// Number of delivery attempts made so far.
    pub attempts: u32,
    /// Last failure reason, if any attempt has failed.
    pub last_error: Option<String>,
    /// Earliest time the record is eligible for the next attempt.
    pub available_at: DateTime<Utc>,
    /// When the record was last claimed; lease bookkeeping.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Create a fresh `Pending` record, eligible immediately.
    #[must_use]
    pub fn new(envelope: Envelope) -> Self {
        let available_at = envelope.occurred_at;
        Self {
            envelope,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            available_at,
            claimed_at: None,
        }
    }

    /// The envelope id, which is also the record id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.envelope.id
    }
}

/// Boxed future alias used by the store contract.
pub type OutboxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, OutboxError>> + Send + 'a>>;

/// Durable append-only log of pending envelopes with delivery status.
///
/// The delivery engine depends only on this contract; any durable store
/// supporting insert, indexed lookup by status + `available_at`, atomic
/// conditional claim, and update-by-id can implement it. Methods return
/// explicit boxed futures so the trait stays dyn-compatible
/// (`Arc<dyn OutboxStore>`).
pub trait OutboxStore: Send + Sync {
    /// Insert a new record.
    ///
    /// Fails with [`OutboxError::DuplicateId`] if the envelope id was
    /// appended before.
    fn append(&self, record: OutboxRecord) -> OutboxFuture<'_, ()>;

    /// Atomically claim up to `max` records due at `now`.
    ///
    /// Eligible records are `Pending` with `available_at <= now`, plus
    /// `Dispatching` records whose lease has expired. Claimed records move
    /// to `Dispatching` and are not returned to other callers until
    /// finalized or lease-expired. Results are ordered by `available_at`
    /// ascending, `id` ascending.
    fn claim_batch(&self, max: usize, now: DateTime<Utc>) -> OutboxFuture<'_, Vec<OutboxRecord>>;

    /// Record a confirmed publish. Increments `attempts`; terminal.
    fn mark_dispatched(&self, id: Uuid) -> OutboxFuture<'_, ()>;

    /// Record a failed attempt. Increments `attempts` and stores `error`.
    ///
    /// With `retry_at = Some(t)` the record reverts to `Pending`, eligible
    /// at `t`. With `retry_at = None` the record becomes terminally
    /// `Failed`.
    fn mark_failed(
        &self,
        id: Uuid,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> OutboxFuture<'_, ()>;
}

/// In-memory reference implementation of [`OutboxStore`].
///
/// Suitable for tests and single-process deployments; the SQL-row
/// implementation for multi-replica use lives in `carrier-postgres`.
pub struct InMemoryOutboxStore {
    records: Mutex<HashMap<Uuid, OutboxRecord>>,
    lease: ChronoDuration,
}

impl InMemoryOutboxStore {
    /// Default lease window for claimed records.
    pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

    /// Create a store with the default lease window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lease(Self::DEFAULT_LEASE)
    }

    /// Create a store with an explicit lease window.
    #[must_use]
    pub fn with_lease(lease: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)] // Lease windows are far below i64::MAX millis
        let lease = ChronoDuration::milliseconds(lease.as_millis() as i64);
        Self {
            records: Mutex::new(HashMap::new()),
            lease,
        }
    }

    /// Snapshot a record by id (test/operator visibility).
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<OutboxRecord> {
        self.lock().get(&id).cloned()
    }

    /// Number of records in any status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, OutboxRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn append(&self, record: OutboxRecord) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            let mut records = self.lock();
            if records.contains_key(&record.id()) {
                return Err(OutboxError::DuplicateId(record.id()));
            }
            tracing::debug!(
                record_id = %record.id(),
                event_type = %record.envelope.event_type,
                "Outbox record appended"
            );
            records.insert(record.id(), record);
            Ok(())
        })
    }

    fn claim_batch(&self, max: usize, now: DateTime<Utc>) -> OutboxFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            let mut records = self.lock();

            let mut eligible: Vec<Uuid> = records
                .values()
                .filter(|r| match r.status {
                    OutboxStatus::Pending => r.available_at <= now,
                    OutboxStatus::Dispatching => {
                        // Lease expired: the previous claimant is presumed dead
                        r.claimed_at.is_none_or(|claimed| claimed + self.lease <= now)
                    }
                    OutboxStatus::Dispatched | OutboxStatus::Failed => false,
                })
                .map(OutboxRecord::id)
                .collect();

            eligible.sort_by_key(|id| {
                records
                    .get(id)
                    .map(|r| (r.available_at, r.id()))
                    .unwrap_or((now, *id))
            });
            eligible.truncate(max);

            let mut claimed = Vec::with_capacity(eligible.len());
            for id in eligible {
                if let Some(record) = records.get_mut(&id) {
                    record.status = OutboxStatus::Dispatching;
                    record.claimed_at = Some(now);
                    claimed.push(record.clone());
                }
            }
            Ok(claimed)
        })
    }

    fn mark_dispatched(&self, id: Uuid) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            let mut records = self.lock();
            let record = records.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
            record.status = OutboxStatus::Dispatched;
            record.attempts += 1;
            record.claimed_at = None;
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
            let mut records = self.lock();
            let record = records.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
            record.attempts += 1;
            record.last_error = Some(error);
            record.claimed_at = None;
            match retry_at {
                Some(at) => {
                    record.status = OutboxStatus::Pending;
                    record.available_at = at;
                }
                None => {
                    record.status = OutboxStatus::Failed;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::envelope::Headers;

    fn record(event_type: &str) -> OutboxRecord {
        OutboxRecord::new(Envelope::new(event_type, vec![], Headers::new()))
    }

    #[test]
    fn status_storage_roundtrip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Dispatching,
            OutboxStatus::Dispatched,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OutboxStatus::parse("bogus").is_err());
    }

    #[tokio::test]
    async fn append_rejects_duplicate_ids() {
        let store = InMemoryOutboxStore::new();
        let rec = record("OrderPlaced");
        let id = rec.id();

        store.append(rec.clone()).await.unwrap();
        assert_eq!(
            store.append(rec).await,
            Err(OutboxError::DuplicateId(id))
        );
    }

    #[tokio::test]
    async fn claim_is_exclusive_within_lease() {
        let store = InMemoryOutboxStore::with_lease(Duration::from_secs(60));
        store.append(record("A")).await.unwrap();

        let now = Utc::now();
        let first = store.claim_batch(10, now).await.unwrap();
        assert_eq!(first.len(), 1);

        // Second caller within the lease window sees nothing
        let second = store.claim_batch(10, now).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn expired_lease_makes_record_claimable_again() {
        let store = InMemoryOutboxStore::with_lease(Duration::from_secs(30));
        store.append(record("A")).await.unwrap();

        let now = Utc::now();
        assert_eq!(store.claim_batch(10, now).await.unwrap().len(), 1);

        let after_lease = now + ChronoDuration::seconds(31);
        let reclaimed = store.claim_batch(10, after_lease).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, OutboxStatus::Dispatching);
    }

    #[tokio::test]
    async fn claim_orders_by_available_at_then_id() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();

        let mut early = record("A");
        early.available_at = now - ChronoDuration::seconds(10);
        let mut late = record("B");
        late.available_at = now - ChronoDuration::seconds(1);
        let early_id = early.id();

        // Insert in reverse eligibility order
        store.append(late).await.unwrap();
        store.append(early).await.unwrap();

        let claimed = store.claim_batch(10, now).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id(), early_id);
    }

    #[tokio::test]
    async fn claim_respects_available_at() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();

        let mut rec = record("A");
        rec.available_at = now + ChronoDuration::seconds(60);
        store.append(rec).await.unwrap();

        assert!(store.claim_batch(10, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_failed_with_retry_reverts_to_pending() {
        let store = InMemoryOutboxStore::new();
        let rec = record("A");
        let id = rec.id();
        store.append(rec).await.unwrap();

        let now = Utc::now();
        store.claim_batch(1, now).await.unwrap();

        let retry_at = now + ChronoDuration::seconds(5);
        store
            .mark_failed(id, "broker down".to_string(), Some(retry_at))
            .await
            .unwrap();

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.available_at, retry_at);
        assert_eq!(stored.last_error.as_deref(), Some("broker down"));
    }

    #[tokio::test]
    async fn mark_failed_terminal_stays_failed() {
        let store = InMemoryOutboxStore::new();
        let rec = record("A");
        let id = rec.id();
        store.append(rec).await.unwrap();

        store
            .mark_failed(id, "payload invalid".to_string(), None)
            .await
            .unwrap();

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        // Terminal records are never claimed again
        assert!(
            store
                .claim_batch(10, Utc::now() + ChronoDuration::days(1))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn mark_dispatched_counts_the_successful_attempt() {
        let store = InMemoryOutboxStore::new();
        let rec = record("A");
        let id = rec.id();
        store.append(rec).await.unwrap();

        store.claim_batch(1, Utc::now()).await.unwrap();
        store.mark_dispatched(id).await.unwrap();

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Dispatched);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn finalizing_unknown_record_is_not_found() {
        let store = InMemoryOutboxStore::new();
        let id = Uuid::now_v7();
        assert_eq!(
            store.mark_dispatched(id).await,
            Err(OutboxError::NotFound(id))
        );
    }
}
