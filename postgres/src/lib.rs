//! `PostgreSQL` outbox store for the Carrier event delivery engine.
//!
//! Implements the [`OutboxStore`](carrier_core::OutboxStore) contract on a
//! single `outbox_records` table. Claims use `FOR UPDATE SKIP LOCKED`, so
//! any number of processor replicas can poll the same table without handing
//! the same record to two of them.
//!
//! # Example
//!
//! ```ignore
//! use carrier_postgres::PostgresOutboxStore;
//!
//! async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresOutboxStore::new(pool);
//!     store.ensure_schema().await?;
//!     Ok(())
//! }
//! ```

mod outbox_store;

pub use outbox_store::PostgresOutboxStore;
