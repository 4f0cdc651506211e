//! Repository contract over the durable store.
//!
//! The pipeline never talks SQL directly; it consumes this trait. Production
//! wires [`postgres::PgStore`]; tests run against [`memory::MemoryStore`]
//! with identical semantics, most importantly the unique constraints that
//! make swap processing idempotent.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;

use models::{
    IcyLockedTreasury, NewProcessedTransaction, NewSwapRequest, OnchainBtcTransaction,
    OnchainIcySwapTransaction, OnchainIcyTransaction, ProcessedBtcTransaction, SwapRequest,
    TransactionFilter,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint (idempotency key) rejected the write.
    #[error("duplicate record")]
    Duplicate,
    #[error("record not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate,
            _ => StoreError::Database(error),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Round-trips the connection for `/health/db`.
    async fn ping(&self) -> Result<(), StoreError>;

    // ICY transfer ingestion. The newest persisted row doubles as the
    // indexer cursor; there is no separate cursor table.
    async fn latest_icy_transfer(&self) -> Result<Option<OnchainIcyTransaction>, StoreError>;
    /// Idempotent batch insert: duplicate `internal_id`s are skipped.
    /// Returns the number of rows actually written.
    async fn insert_icy_transfers(
        &self,
        rows: &[OnchainIcyTransaction],
    ) -> Result<u64, StoreError>;

    // Swap-contract event ingestion.
    async fn latest_icy_swap(&self) -> Result<Option<OnchainIcySwapTransaction>, StoreError>;
    async fn insert_icy_swaps(
        &self,
        rows: &[OnchainIcySwapTransaction],
    ) -> Result<u64, StoreError>;
    async fn icy_swap_by_tx(
        &self,
        tx_hash: &str,
    ) -> Result<Option<OnchainIcySwapTransaction>, StoreError>;

    // BTC wallet transaction ingestion.
    async fn latest_btc_transaction(&self) -> Result<Option<OnchainBtcTransaction>, StoreError>;
    async fn insert_btc_transactions(
        &self,
        rows: &[OnchainBtcTransaction],
    ) -> Result<u64, StoreError>;

    // Swap requests.
    /// In one transaction: rejects with [`StoreError::Duplicate`] if the
    /// processed ledger already references `icy_tx`, then inserts a pending
    /// request (the unique index on `icy_tx` closes the race).
    async fn create_swap_request(&self, request: NewSwapRequest)
    -> Result<SwapRequest, StoreError>;
    /// Pending requests, oldest first.
    async fn pending_swap_requests(&self) -> Result<Vec<SwapRequest>, StoreError>;
    async fn complete_swap_request(&self, icy_tx: &str) -> Result<(), StoreError>;

    // Processed-payout ledger.
    async fn processed_by_icy_tx(
        &self,
        icy_tx: &str,
    ) -> Result<Option<ProcessedBtcTransaction>, StoreError>;
    /// Inserts a pending ledger row; [`StoreError::Duplicate`] when another
    /// worker already claimed this `icy_transaction_hash`.
    async fn insert_processed_pending(
        &self,
        row: NewProcessedTransaction,
    ) -> Result<i64, StoreError>;
    /// `pending → completed`; terminal rows are never updated.
    async fn mark_processed_completed(
        &self,
        id: i64,
        btc_tx_hash: &str,
        network_fee: i64,
    ) -> Result<(), StoreError>;
    /// `pending → failed`; terminal rows are never updated.
    async fn mark_processed_failed(&self, id: i64, error: &str) -> Result<(), StoreError>;
    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<(i64, Vec<ProcessedBtcTransaction>), StoreError>;

    // Treasury addresses excluded from circulated supply.
    async fn locked_treasuries(&self) -> Result<Vec<IcyLockedTreasury>, StoreError>;
    async fn upsert_locked_treasury(&self, address: &str) -> Result<(), StoreError>;
}
