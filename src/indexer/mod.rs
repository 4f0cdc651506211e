//! Periodic on-chain ingestion.
//!
//! Three independent jobs: BTC wallet transactions, ICY transfers, and ICY
//! swap-contract events. Each reads its cursor (the newest persisted row),
//! asks the chain for everything after it, and inserts idempotently — a
//! replayed batch is absorbed by the unique keys, so reruns are harmless and
//! cursors only ever move forward.

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

use crate::chain::btc::BtcApi;
use crate::chain::btc::esplora::{EsploraError, EsploraTransaction};
use crate::chain::evm::{EvmApi, EvmError};
use crate::store::models::{
    OnchainBtcTransaction, OnchainIcySwapTransaction, OnchainIcyTransaction, direction,
};
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Evm(#[from] EvmError),
    #[error(transparent)]
    Btc(#[from] EsploraError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed cursor row: {0}")]
    Cursor(String),
}

fn block_time_from_unix(seconds: Option<u64>) -> Option<DateTime<Utc>> {
    seconds.and_then(|s| DateTime::from_timestamp(s as i64, 0))
}

/// Ingests ICY ERC-20 transfers touching the treasury.
pub struct IcyTransferIndexer {
    store: Arc<dyn Store>,
    evm: Arc<dyn EvmApi>,
    treasury: Address,
}

impl IcyTransferIndexer {
    pub fn new(store: Arc<dyn Store>, evm: Arc<dyn EvmApi>, treasury: Address) -> Self {
        Self {
            store,
            evm,
            treasury,
        }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<u64, IndexError> {
        let from_tx = match self.store.latest_icy_transfer().await? {
            Some(row) => Some(
                B256::from_str(&row.transaction_hash)
                    .map_err(|_| IndexError::Cursor(row.transaction_hash.clone()))?,
            ),
            None => None,
        };
        let transfers = self.evm.icy_transfers_since(self.treasury, from_tx).await?;

        let now = Utc::now();
        let rows: Vec<OnchainIcyTransaction> = transfers
            .into_iter()
            .map(|t| {
                let (dir, counterparty) = if t.from == self.treasury && t.to == self.treasury {
                    (direction::TRANSFER, t.to)
                } else if t.from == self.treasury {
                    (direction::OUT, t.to)
                } else {
                    (direction::IN, t.from)
                };
                OnchainIcyTransaction {
                    internal_id: format!("{:#x}-{}", t.tx_hash, t.log_index),
                    transaction_hash: format!("{:#x}", t.tx_hash),
                    direction: dir.to_string(),
                    counterparty: format!("{:#x}", counterparty),
                    amount: t.amount.to_string(),
                    block_number: t.block_number as i64,
                    block_time: block_time_from_unix(t.block_time),
                    created_at: now,
                }
            })
            .collect();

        let inserted = self.store.insert_icy_transfers(&rows).await?;
        if inserted > 0 {
            tracing::info!(inserted, "indexed new icy transfers");
        }
        Ok(inserted)
    }
}

/// Ingests decoded swap-contract events.
pub struct IcySwapIndexer {
    store: Arc<dyn Store>,
    evm: Arc<dyn EvmApi>,
}

impl IcySwapIndexer {
    pub fn new(store: Arc<dyn Store>, evm: Arc<dyn EvmApi>) -> Self {
        Self { store, evm }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<u64, IndexError> {
        let from_tx = match self.store.latest_icy_swap().await? {
            Some(row) => Some(
                B256::from_str(&row.transaction_hash)
                    .map_err(|_| IndexError::Cursor(row.transaction_hash.clone()))?,
            ),
            None => None,
        };
        let events = self.evm.swap_events_since(from_tx).await?;

        let now = Utc::now();
        let rows: Vec<OnchainIcySwapTransaction> = events
            .into_iter()
            .map(|e| OnchainIcySwapTransaction {
                transaction_hash: format!("{:#x}", e.tx_hash),
                from_address: format!("{:#x}", e.from_address),
                icy_amount: e.icy_amount.to_string(),
                btc_address: e.btc_address,
                btc_amount: e.btc_sats as i64,
                block_number: e.block_number as i64,
                created_at: now,
            })
            .collect();

        let inserted = self.store.insert_icy_swaps(&rows).await?;
        if inserted > 0 {
            tracing::info!(inserted, "indexed new swap events");
        }
        Ok(inserted)
    }
}

/// Ingests confirmed transactions of the BTC treasury wallet.
pub struct BtcTransactionIndexer {
    store: Arc<dyn Store>,
    btc: Arc<dyn BtcApi>,
    treasury_address: String,
}

impl BtcTransactionIndexer {
    pub fn new(store: Arc<dyn Store>, btc: Arc<dyn BtcApi>, treasury_address: String) -> Self {
        Self {
            store,
            btc,
            treasury_address,
        }
    }

    fn classify(&self, tx: &EsploraTransaction) -> (String, i64, String) {
        let sent: u64 = tx
            .vin
            .iter()
            .filter_map(|vin| vin.prevout.as_ref())
            .filter(|prev| prev.scriptpubkey_address.as_deref() == Some(&self.treasury_address))
            .map(|prev| prev.value)
            .sum();
        let received: u64 = tx
            .vout
            .iter()
            .filter(|out| out.scriptpubkey_address.as_deref() == Some(&self.treasury_address))
            .map(|out| out.value)
            .sum();

        if sent == 0 {
            let counterparty = tx
                .vin
                .iter()
                .filter_map(|vin| vin.prevout.as_ref())
                .filter_map(|prev| prev.scriptpubkey_address.clone())
                .next()
                .unwrap_or_default();
            (direction::IN.to_string(), received as i64, counterparty)
        } else {
            // Net outflow: what left the wallet minus the change that came back.
            let amount = sent.saturating_sub(received).saturating_sub(tx.fee);
            let counterparty = tx
                .vout
                .iter()
                .filter(|out| out.scriptpubkey_address.as_deref() != Some(&self.treasury_address))
                .filter_map(|out| out.scriptpubkey_address.clone())
                .next()
                .unwrap_or_else(|| self.treasury_address.clone());
            let dir = if counterparty == self.treasury_address {
                direction::TRANSFER
            } else {
                direction::OUT
            };
            (dir.to_string(), amount as i64, counterparty)
        }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<u64, IndexError> {
        let from_txid = self
            .store
            .latest_btc_transaction()
            .await?
            .map(|row| row.internal_id);
        let transactions = self
            .btc
            .transactions(&self.treasury_address, from_txid.as_deref())
            .await?;

        let now = Utc::now();
        let mut rows: Vec<OnchainBtcTransaction> = transactions
            .iter()
            // Mempool entries are skipped until they confirm.
            .filter(|tx| tx.status.confirmed)
            .map(|tx| {
                let (dir, amount, counterparty) = self.classify(tx);
                OnchainBtcTransaction {
                    internal_id: tx.txid.clone(),
                    direction: dir,
                    counterparty,
                    amount,
                    fee: tx.fee as i64,
                    block_time: tx
                        .status
                        .block_time
                        .and_then(|s| DateTime::from_timestamp(s, 0)),
                    created_at: now,
                }
            })
            .collect();
        // The explorer lists newest first; persist oldest first so the
        // cursor row is always the newest.
        rows.reverse();

        let inserted = self.store.insert_btc_transactions(&rows).await?;
        if inserted > 0 {
            tracing::info!(inserted, "indexed new btc transactions");
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::btc::esplora::{ConfirmationStatus, Utxo, Vin, Vout};
    use crate::chain::evm::{IcySwapEvent, IcyTransfer, SwapPermit};
    use crate::decimal::FixedDecimal;
    use crate::store::memory::MemoryStore;
    use alloy::primitives::{U256, address, b256};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const TREASURY: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const USER: Address = address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
    const BTC_TREASURY: &str = "bc1qtreasury";

    struct FakeEvm {
        transfers: Vec<IcyTransfer>,
        events: Vec<IcySwapEvent>,
        seen_cursors: Mutex<Vec<Option<B256>>>,
    }

    #[async_trait]
    impl EvmApi for FakeEvm {
        async fn icy_balance_of(&self, _address: Address) -> Result<FixedDecimal, EvmError> {
            Ok(FixedDecimal::zero(18))
        }

        async fn icy_total_supply(&self) -> Result<FixedDecimal, EvmError> {
            Ok(FixedDecimal::zero(18))
        }

        async fn icy_transfers_since(
            &self,
            _watched: Address,
            from_tx: Option<B256>,
        ) -> Result<Vec<IcyTransfer>, EvmError> {
            self.seen_cursors.lock().unwrap().push(from_tx);
            Ok(self.transfers.clone())
        }

        async fn swap_events_since(
            &self,
            from_tx: Option<B256>,
        ) -> Result<Vec<IcySwapEvent>, EvmError> {
            self.seen_cursors.lock().unwrap().push(from_tx);
            Ok(self.events.clone())
        }

        async fn submit_swap(
            &self,
            _icy_amount: U256,
            _btc_address: &str,
            _btc_sats: u64,
        ) -> Result<B256, EvmError> {
            unimplemented!()
        }

        async fn generate_swap_permit(
            &self,
            _icy_amount: U256,
            _btc_address: &str,
            _btc_sats: u64,
        ) -> Result<SwapPermit, EvmError> {
            unimplemented!()
        }
    }

    struct FakeBtc {
        transactions: Vec<EsploraTransaction>,
    }

    #[async_trait]
    impl BtcApi for FakeBtc {
        async fn utxos(&self, _address: &str) -> Result<Vec<Utxo>, EsploraError> {
            Ok(Vec::new())
        }

        async fn balance(&self, _address: &str) -> Result<u64, EsploraError> {
            Ok(0)
        }

        async fn transactions(
            &self,
            _address: &str,
            _from_txid: Option<&str>,
        ) -> Result<Vec<EsploraTransaction>, EsploraError> {
            Ok(self.transactions.clone())
        }

        async fn transaction(&self, _txid: &str) -> Result<EsploraTransaction, EsploraError> {
            Err(EsploraError::Http(404, String::new()))
        }

        async fn fee_estimates(&self) -> Result<BTreeMap<u16, f64>, EsploraError> {
            Ok(BTreeMap::new())
        }

        async fn broadcast(&self, _tx_hex: &str) -> Result<String, EsploraError> {
            unimplemented!()
        }
    }

    fn transfer(tx_byte: u8, from: Address, to: Address, block: u64) -> IcyTransfer {
        IcyTransfer {
            tx_hash: B256::repeat_byte(tx_byte),
            log_index: 0,
            from,
            to,
            amount: U256::from(1_000u64),
            block_number: block,
            block_time: Some(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn transfer_ingestion_is_idempotent_and_directional() {
        let store = Arc::new(MemoryStore::new());
        let evm = Arc::new(FakeEvm {
            transfers: vec![
                transfer(1, USER, TREASURY, 10),
                transfer(2, TREASURY, USER, 11),
            ],
            events: Vec::new(),
            seen_cursors: Mutex::new(Vec::new()),
        });
        let indexer = IcyTransferIndexer::new(store.clone(), evm.clone(), TREASURY);

        assert_eq!(indexer.run_once().await.unwrap(), 2);
        // Replay inserts nothing new.
        assert_eq!(indexer.run_once().await.unwrap(), 0);

        let latest = store.latest_icy_transfer().await.unwrap().unwrap();
        assert_eq!(latest.block_number, 11);
        assert_eq!(latest.direction, direction::OUT);
        assert_eq!(latest.counterparty, format!("{USER:#x}"));
    }

    #[tokio::test]
    async fn transfer_cursor_is_latest_persisted_tx() {
        let store = Arc::new(MemoryStore::new());
        let evm = Arc::new(FakeEvm {
            transfers: vec![transfer(7, USER, TREASURY, 42)],
            events: Vec::new(),
            seen_cursors: Mutex::new(Vec::new()),
        });
        let indexer = IcyTransferIndexer::new(store.clone(), evm.clone(), TREASURY);

        indexer.run_once().await.unwrap();
        indexer.run_once().await.unwrap();

        let cursors = evm.seen_cursors.lock().unwrap();
        assert_eq!(cursors[0], None);
        assert_eq!(cursors[1], Some(B256::repeat_byte(7)));
    }

    #[tokio::test]
    async fn swap_event_ingestion_records_unique_events() {
        let store = Arc::new(MemoryStore::new());
        let event = IcySwapEvent {
            tx_hash: b256!("0x1111111111111111111111111111111111111111111111111111111111111111"),
            from_address: USER,
            icy_amount: U256::from(5_000_000_000_000_000_000u128),
            btc_address: "bc1quser".to_string(),
            btc_sats: 25_000,
            block_number: 99,
        };
        let evm = Arc::new(FakeEvm {
            transfers: Vec::new(),
            events: vec![event],
            seen_cursors: Mutex::new(Vec::new()),
        });
        let indexer = IcySwapIndexer::new(store.clone(), evm);

        assert_eq!(indexer.run_once().await.unwrap(), 1);
        assert_eq!(indexer.run_once().await.unwrap(), 0);

        let stored = store
            .icy_swap_by_tx("0x1111111111111111111111111111111111111111111111111111111111111111")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.btc_amount, 25_000);
        assert_eq!(stored.icy_amount, "5000000000000000000");
    }

    fn btc_tx(txid: &str, confirmed: bool, to_treasury: u64) -> EsploraTransaction {
        EsploraTransaction {
            txid: txid.to_string(),
            fee: 200,
            status: ConfirmationStatus {
                confirmed,
                block_height: confirmed.then_some(800_000),
                block_time: confirmed.then_some(1_700_000_000),
            },
            vin: vec![Vin {
                prevout: Some(Vout {
                    scriptpubkey_address: Some("bc1qsender".to_string()),
                    value: to_treasury + 500,
                }),
            }],
            vout: vec![Vout {
                scriptpubkey_address: Some(BTC_TREASURY.to_string()),
                value: to_treasury,
            }],
        }
    }

    #[tokio::test]
    async fn unconfirmed_btc_transactions_are_never_persisted() {
        let store = Arc::new(MemoryStore::new());
        let btc = Arc::new(FakeBtc {
            transactions: vec![
                btc_tx("confirmed-tx", true, 10_000),
                btc_tx("mempool-tx", false, 20_000),
            ],
        });
        let indexer = BtcTransactionIndexer::new(store.clone(), btc, BTC_TREASURY.to_string());

        assert_eq!(indexer.run_once().await.unwrap(), 1);
        let latest = store.latest_btc_transaction().await.unwrap().unwrap();
        assert_eq!(latest.internal_id, "confirmed-tx");
        assert_eq!(latest.direction, direction::IN);
        assert_eq!(latest.amount, 10_000);
        assert_eq!(latest.counterparty, "bc1qsender");
    }

    #[tokio::test]
    async fn outgoing_btc_amount_excludes_change_and_fee() {
        let store = Arc::new(MemoryStore::new());
        // Wallet spends 100_000, pays 30_000 out, takes 69_800 change, 200 fee.
        let tx = EsploraTransaction {
            txid: "payout-tx".to_string(),
            fee: 200,
            status: ConfirmationStatus {
                confirmed: true,
                block_height: Some(800_001),
                block_time: Some(1_700_000_100),
            },
            vin: vec![Vin {
                prevout: Some(Vout {
                    scriptpubkey_address: Some(BTC_TREASURY.to_string()),
                    value: 100_000,
                }),
            }],
            vout: vec![
                Vout {
                    scriptpubkey_address: Some("bc1qrecipient".to_string()),
                    value: 30_000,
                },
                Vout {
                    scriptpubkey_address: Some(BTC_TREASURY.to_string()),
                    value: 69_800,
                },
            ],
        };
        let btc = Arc::new(FakeBtc {
            transactions: vec![tx],
        });
        let indexer = BtcTransactionIndexer::new(store.clone(), btc, BTC_TREASURY.to_string());
        indexer.run_once().await.unwrap();

        let latest = store.latest_btc_transaction().await.unwrap().unwrap();
        assert_eq!(latest.direction, direction::OUT);
        assert_eq!(latest.amount, 30_000);
        assert_eq!(latest.counterparty, "bc1qrecipient");
        assert_eq!(latest.fee, 200);
    }
}
