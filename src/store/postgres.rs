//! Postgres-backed repository over `sqlx`.
//!
//! Idempotency rides the schema: unique indexes on `swap_requests.icy_tx`,
//! `onchain_btc_processed_transactions.icy_transaction_hash` and
//! `onchain_icy_swap_transactions.transaction_hash`, with ingestion inserts
//! using `ON CONFLICT DO NOTHING` so replays are harmless.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};

use super::models::{
    IcyLockedTreasury, NewProcessedTransaction, NewSwapRequest, OnchainBtcTransaction,
    OnchainIcySwapTransaction, OnchainIcyTransaction, ProcessedBtcTransaction, SwapRequest,
    TransactionFilter, status,
};
use super::{Store, StoreError};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))
    }

    fn push_transaction_filters<'a>(
        builder: &mut QueryBuilder<'a, Postgres>,
        filter: &'a TransactionFilter,
    ) {
        if let Some(btc_address) = &filter.btc_address {
            builder.push(" AND p.btc_address = ").push_bind(btc_address);
        }
        if let Some(evm_address) = &filter.evm_address {
            builder.push(" AND s.from_address = ").push_bind(evm_address);
        }
        if let Some(wanted) = &filter.status {
            builder.push(" AND p.status = ").push_bind(wanted);
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn latest_icy_transfer(&self) -> Result<Option<OnchainIcyTransaction>, StoreError> {
        let row = sqlx::query_as::<_, OnchainIcyTransaction>(
            "SELECT internal_id, transaction_hash, direction, counterparty, amount,
                    block_number, block_time, created_at
             FROM onchain_icy_transactions
             ORDER BY block_number DESC, internal_id DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_icy_transfers(
        &self,
        rows: &[OnchainIcyTransaction],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for row in rows {
            let result = sqlx::query(
                "INSERT INTO onchain_icy_transactions
                     (internal_id, transaction_hash, direction, counterparty, amount,
                      block_number, block_time, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (internal_id) DO NOTHING",
            )
            .bind(&row.internal_id)
            .bind(&row.transaction_hash)
            .bind(&row.direction)
            .bind(&row.counterparty)
            .bind(&row.amount)
            .bind(row.block_number)
            .bind(row.block_time)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn latest_icy_swap(&self) -> Result<Option<OnchainIcySwapTransaction>, StoreError> {
        let row = sqlx::query_as::<_, OnchainIcySwapTransaction>(
            "SELECT transaction_hash, from_address, icy_amount, btc_address, btc_amount,
                    block_number, created_at
             FROM onchain_icy_swap_transactions
             ORDER BY block_number DESC, transaction_hash DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_icy_swaps(
        &self,
        rows: &[OnchainIcySwapTransaction],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for row in rows {
            let result = sqlx::query(
                "INSERT INTO onchain_icy_swap_transactions
                     (transaction_hash, from_address, icy_amount, btc_address, btc_amount,
                      block_number, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (transaction_hash) DO NOTHING",
            )
            .bind(&row.transaction_hash)
            .bind(&row.from_address)
            .bind(&row.icy_amount)
            .bind(&row.btc_address)
            .bind(row.btc_amount)
            .bind(row.block_number)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn icy_swap_by_tx(
        &self,
        tx_hash: &str,
    ) -> Result<Option<OnchainIcySwapTransaction>, StoreError> {
        let row = sqlx::query_as::<_, OnchainIcySwapTransaction>(
            "SELECT transaction_hash, from_address, icy_amount, btc_address, btc_amount,
                    block_number, created_at
             FROM onchain_icy_swap_transactions
             WHERE transaction_hash = $1",
        )
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn latest_btc_transaction(&self) -> Result<Option<OnchainBtcTransaction>, StoreError> {
        let row = sqlx::query_as::<_, OnchainBtcTransaction>(
            "SELECT internal_id, direction, counterparty, amount, fee, block_time, created_at
             FROM onchain_btc_transactions
             ORDER BY block_time DESC NULLS LAST, created_at DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_btc_transactions(
        &self,
        rows: &[OnchainBtcTransaction],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for row in rows {
            let result = sqlx::query(
                "INSERT INTO onchain_btc_transactions
                     (internal_id, direction, counterparty, amount, fee, block_time, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (internal_id) DO NOTHING",
            )
            .bind(&row.internal_id)
            .bind(&row.direction)
            .bind(&row.counterparty)
            .bind(row.amount)
            .bind(row.fee)
            .bind(row.block_time)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn create_swap_request(
        &self,
        request: NewSwapRequest,
    ) -> Result<SwapRequest, StoreError> {
        let mut tx = self.pool.begin().await?;
        let processed: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM onchain_btc_processed_transactions WHERE icy_transaction_hash = $1",
        )
        .bind(&request.icy_tx)
        .fetch_optional(&mut *tx)
        .await?;
        if processed.is_some() {
            return Err(StoreError::Duplicate);
        }
        let row = sqlx::query_as::<_, SwapRequest>(
            "INSERT INTO swap_requests (icy_amount, btc_address, icy_tx, status)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (icy_tx) DO NOTHING
             RETURNING id, icy_amount, btc_address, icy_tx, status, processed_at, created_at",
        )
        .bind(&request.icy_amount)
        .bind(&request.btc_address)
        .bind(&request.icy_tx)
        .bind(status::PENDING)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::Duplicate)?;
        tx.commit().await?;
        Ok(row)
    }

    async fn pending_swap_requests(&self) -> Result<Vec<SwapRequest>, StoreError> {
        let rows = sqlx::query_as::<_, SwapRequest>(
            "SELECT id, icy_amount, btc_address, icy_tx, status, processed_at, created_at
             FROM swap_requests
             WHERE status = $1
             ORDER BY created_at ASC",
        )
        .bind(status::PENDING)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn complete_swap_request(&self, icy_tx: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE swap_requests
             SET status = $2, processed_at = now()
             WHERE icy_tx = $1 AND status = $3",
        )
        .bind(icy_tx)
        .bind(status::COMPLETED)
        .bind(status::PENDING)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn processed_by_icy_tx(
        &self,
        icy_tx: &str,
    ) -> Result<Option<ProcessedBtcTransaction>, StoreError> {
        let row = sqlx::query_as::<_, ProcessedBtcTransaction>(
            "SELECT id, icy_transaction_hash, swap_transaction_hash, btc_transaction_hash,
                    btc_address, amount, service_fee, network_fee, status, error,
                    processed_at, created_at, updated_at
             FROM onchain_btc_processed_transactions
             WHERE icy_transaction_hash = $1",
        )
        .bind(icy_tx)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_processed_pending(
        &self,
        row: NewProcessedTransaction,
    ) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO onchain_btc_processed_transactions
                 (icy_transaction_hash, swap_transaction_hash, btc_address, amount,
                  service_fee, status)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(&row.icy_transaction_hash)
        .bind(&row.swap_transaction_hash)
        .bind(&row.btc_address)
        .bind(row.amount)
        .bind(row.service_fee)
        .bind(status::PENDING)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn mark_processed_completed(
        &self,
        id: i64,
        btc_tx_hash: &str,
        network_fee: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE onchain_btc_processed_transactions
             SET status = $2, btc_transaction_hash = $3, network_fee = $4,
                 processed_at = now(), updated_at = now()
             WHERE id = $1 AND status = $5",
        )
        .bind(id)
        .bind(status::COMPLETED)
        .bind(btc_tx_hash)
        .bind(network_fee)
        .bind(status::PENDING)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_processed_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE onchain_btc_processed_transactions
             SET status = $2, error = $3, updated_at = now()
             WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(status::FAILED)
        .bind(error)
        .bind(status::PENDING)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<(i64, Vec<ProcessedBtcTransaction>), StoreError> {
        let mut count_builder = QueryBuilder::<Postgres>::new(
            "SELECT count(*)
             FROM onchain_btc_processed_transactions p
             LEFT JOIN onchain_icy_swap_transactions s
                    ON s.transaction_hash = p.swap_transaction_hash
             WHERE true",
        );
        Self::push_transaction_filters(&mut count_builder, filter);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT p.id, p.icy_transaction_hash, p.swap_transaction_hash,
                    p.btc_transaction_hash, p.btc_address, p.amount, p.service_fee,
                    p.network_fee, p.status, p.error, p.processed_at, p.created_at,
                    p.updated_at
             FROM onchain_btc_processed_transactions p
             LEFT JOIN onchain_icy_swap_transactions s
                    ON s.transaction_hash = p.swap_transaction_hash
             WHERE true",
        );
        Self::push_transaction_filters(&mut builder, filter);
        builder
            .push(" ORDER BY p.created_at DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);
        let rows = builder
            .build_query_as::<ProcessedBtcTransaction>()
            .fetch_all(&self.pool)
            .await?;
        Ok((total, rows))
    }

    async fn locked_treasuries(&self) -> Result<Vec<IcyLockedTreasury>, StoreError> {
        let rows = sqlx::query_as::<_, IcyLockedTreasury>(
            "SELECT address, created_at FROM icy_locked_treasuries ORDER BY address",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert_locked_treasury(&self, address: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO icy_locked_treasuries (address)
             VALUES ($1)
             ON CONFLICT (address) DO NOTHING",
        )
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
