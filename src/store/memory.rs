//! In-memory repository with the same constraint semantics as Postgres.
//! Backs the test suites; not wired in production.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;

use super::models::{
    IcyLockedTreasury, NewProcessedTransaction, NewSwapRequest, OnchainBtcTransaction,
    OnchainIcySwapTransaction, OnchainIcyTransaction, ProcessedBtcTransaction, SwapRequest,
    TransactionFilter, status,
};
use super::{Store, StoreError};

#[derive(Default)]
struct Inner {
    icy_transfers: Vec<OnchainIcyTransaction>,
    icy_swaps: Vec<OnchainIcySwapTransaction>,
    btc_transactions: Vec<OnchainBtcTransaction>,
    swap_requests: Vec<SwapRequest>,
    processed: Vec<ProcessedBtcTransaction>,
    locked: Vec<IcyLockedTreasury>,
    next_request_id: i64,
    next_processed_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn latest_icy_transfer(&self) -> Result<Option<OnchainIcyTransaction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .icy_transfers
            .iter()
            .max_by_key(|row| (row.block_number, row.internal_id.clone()))
            .cloned())
    }

    async fn insert_icy_transfers(
        &self,
        rows: &[OnchainIcyTransaction],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut inserted = 0u64;
        for row in rows {
            if inner
                .icy_transfers
                .iter()
                .any(|existing| existing.internal_id == row.internal_id)
            {
                continue;
            }
            inner.icy_transfers.push(row.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn latest_icy_swap(&self) -> Result<Option<OnchainIcySwapTransaction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .icy_swaps
            .iter()
            .max_by_key(|row| (row.block_number, row.transaction_hash.clone()))
            .cloned())
    }

    async fn insert_icy_swaps(
        &self,
        rows: &[OnchainIcySwapTransaction],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut inserted = 0u64;
        for row in rows {
            if inner
                .icy_swaps
                .iter()
                .any(|existing| existing.transaction_hash == row.transaction_hash)
            {
                continue;
            }
            inner.icy_swaps.push(row.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn icy_swap_by_tx(
        &self,
        tx_hash: &str,
    ) -> Result<Option<OnchainIcySwapTransaction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .icy_swaps
            .iter()
            .find(|row| row.transaction_hash == tx_hash)
            .cloned())
    }

    async fn latest_btc_transaction(&self) -> Result<Option<OnchainBtcTransaction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .btc_transactions
            .iter()
            .max_by_key(|row| (row.block_time, row.created_at))
            .cloned())
    }

    async fn insert_btc_transactions(
        &self,
        rows: &[OnchainBtcTransaction],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut inserted = 0u64;
        for row in rows {
            if inner
                .btc_transactions
                .iter()
                .any(|existing| existing.internal_id == row.internal_id)
            {
                continue;
            }
            inner.btc_transactions.push(row.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn create_swap_request(
        &self,
        request: NewSwapRequest,
    ) -> Result<SwapRequest, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let duplicate_processed = inner
            .processed
            .iter()
            .any(|row| row.icy_transaction_hash == request.icy_tx);
        let duplicate_request = inner
            .swap_requests
            .iter()
            .any(|row| row.icy_tx == request.icy_tx);
        if duplicate_processed || duplicate_request {
            return Err(StoreError::Duplicate);
        }
        inner.next_request_id += 1;
        let row = SwapRequest {
            id: inner.next_request_id,
            icy_amount: request.icy_amount,
            btc_address: request.btc_address,
            icy_tx: request.icy_tx,
            status: status::PENDING.to_string(),
            processed_at: None,
            created_at: Utc::now(),
        };
        inner.swap_requests.push(row.clone());
        Ok(row)
    }

    async fn pending_swap_requests(&self) -> Result<Vec<SwapRequest>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<SwapRequest> = inner
            .swap_requests
            .iter()
            .filter(|row| row.status == status::PENDING)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn complete_swap_request(&self, icy_tx: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .swap_requests
            .iter_mut()
            .find(|row| row.icy_tx == icy_tx && row.status == status::PENDING)
            .ok_or(StoreError::NotFound)?;
        row.status = status::COMPLETED.to_string();
        row.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn processed_by_icy_tx(
        &self,
        icy_tx: &str,
    ) -> Result<Option<ProcessedBtcTransaction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .processed
            .iter()
            .find(|row| row.icy_transaction_hash == icy_tx)
            .cloned())
    }

    async fn insert_processed_pending(
        &self,
        row: NewProcessedTransaction,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .processed
            .iter()
            .any(|existing| existing.icy_transaction_hash == row.icy_transaction_hash)
        {
            return Err(StoreError::Duplicate);
        }
        inner.next_processed_id += 1;
        let id = inner.next_processed_id;
        let now = Utc::now();
        inner.processed.push(ProcessedBtcTransaction {
            id,
            icy_transaction_hash: row.icy_transaction_hash,
            swap_transaction_hash: row.swap_transaction_hash,
            btc_transaction_hash: None,
            btc_address: row.btc_address,
            amount: row.amount,
            service_fee: row.service_fee,
            network_fee: None,
            status: status::PENDING.to_string(),
            error: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn mark_processed_completed(
        &self,
        id: i64,
        btc_tx_hash: &str,
        network_fee: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .processed
            .iter_mut()
            .find(|row| row.id == id && row.status == status::PENDING)
            .ok_or(StoreError::NotFound)?;
        row.status = status::COMPLETED.to_string();
        row.btc_transaction_hash = Some(btc_tx_hash.to_string());
        row.network_fee = Some(network_fee);
        row.processed_at = Some(Utc::now());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_processed_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .processed
            .iter_mut()
            .find(|row| row.id == id && row.status == status::PENDING)
            .ok_or(StoreError::NotFound)?;
        row.status = status::FAILED.to_string();
        row.error = Some(error.to_string());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<(i64, Vec<ProcessedBtcTransaction>), StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<ProcessedBtcTransaction> = inner
            .processed
            .iter()
            .filter(|row| {
                if let Some(btc_address) = &filter.btc_address {
                    if &row.btc_address != btc_address {
                        return false;
                    }
                }
                if let Some(wanted) = &filter.status {
                    if &row.status != wanted {
                        return false;
                    }
                }
                if let Some(evm_address) = &filter.evm_address {
                    let matches = inner.icy_swaps.iter().any(|swap| {
                        swap.transaction_hash == row.swap_transaction_hash
                            && &swap.from_address == evm_address
                    });
                    if !matches {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = rows.len() as i64;
        let page = rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect();
        Ok((total, page))
    }

    async fn locked_treasuries(&self) -> Result<Vec<IcyLockedTreasury>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.locked.clone())
    }

    async fn upsert_locked_treasury(&self, address: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.locked.iter().any(|row| row.address == address) {
            inner.locked.push(IcyLockedTreasury {
                address: address.to_string(),
                created_at: Utc::now(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_swap_request_enforces_icy_tx_uniqueness() {
        let store = MemoryStore::new();
        let request = NewSwapRequest {
            icy_amount: "1000000000000000000".to_string(),
            btc_address: "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".to_string(),
            icy_tx: "0xabc".to_string(),
        };
        store.create_swap_request(request.clone()).await.unwrap();
        assert!(matches!(
            store.create_swap_request(request).await,
            Err(StoreError::Duplicate)
        ));
    }

    #[tokio::test]
    async fn processed_ledger_is_at_most_once_per_icy_tx() {
        let store = MemoryStore::new();
        let row = NewProcessedTransaction {
            icy_transaction_hash: "0xabc".to_string(),
            swap_transaction_hash: "0xabc".to_string(),
            btc_address: "bc1q".to_string(),
            amount: 1000,
            service_fee: 10,
        };
        store.insert_processed_pending(row.clone()).await.unwrap();
        assert!(matches!(
            store.insert_processed_pending(row).await,
            Err(StoreError::Duplicate)
        ));
    }

    #[tokio::test]
    async fn terminal_processed_rows_do_not_transition() {
        let store = MemoryStore::new();
        let id = store
            .insert_processed_pending(NewProcessedTransaction {
                icy_transaction_hash: "0xabc".to_string(),
                swap_transaction_hash: "0xabc".to_string(),
                btc_address: "bc1q".to_string(),
                amount: 1000,
                service_fee: 10,
            })
            .await
            .unwrap();
        store.mark_processed_failed(id, "boom").await.unwrap();
        assert!(matches!(
            store.mark_processed_completed(id, "txid", 1).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn ingestion_inserts_are_idempotent() {
        let store = MemoryStore::new();
        let row = OnchainIcySwapTransaction {
            transaction_hash: "0xabc".to_string(),
            from_address: "0xdef".to_string(),
            icy_amount: "10".to_string(),
            btc_address: "bc1q".to_string(),
            btc_amount: 100,
            block_number: 5,
            created_at: Utc::now(),
        };
        assert_eq!(store.insert_icy_swaps(&[row.clone()]).await.unwrap(), 1);
        assert_eq!(store.insert_icy_swaps(&[row]).await.unwrap(), 0);
    }
}
