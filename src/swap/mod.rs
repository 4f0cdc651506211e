//! Swap fulfillment pipeline.
//!
//! Ingress: `create_swap_request` validates a user submission and stores a
//! pending request, rejecting anything whose ICY burn was already paid out.
//!
//! Worker: `process_pending` walks pending requests oldest-first, matches
//! each against its on-chain swap event, claims the payout slot by inserting
//! into the processed ledger (the unique constraint on the ICY tx hash makes
//! this at-most-once even across concurrent workers), and only then sends
//! BTC. Failures land on the ledger row; the batch never aborts on one
//! request.

use alloy::primitives::U256;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

use crate::chain::btc::address::validate_btc_address;
use crate::chain::btc::wallet::PayoutSender;
use crate::decimal::{FixedDecimal, ICY_SCALE};
use crate::indexer::IcySwapIndexer;
use crate::oracle::{OracleError, OracleService};
use crate::store::models::{
    NewProcessedTransaction, NewSwapRequest, OnchainIcySwapTransaction, SwapRequest, status,
};
use crate::store::{Store, StoreError};

static EVM_TX_HASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("valid tx hash regex"));

const SATS_PER_BTC: f64 = 100_000_000.0;

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("invalid btc address: {0}")]
    Address(String),
    #[error("icy amount must be a positive integer in 18-decimal units")]
    InvalidAmount,
    #[error("icy amount is below the configured minimum")]
    BelowMinimum,
    #[error("icy transaction hash must be 0x-prefixed 32-byte hex")]
    InvalidTxHash,
    #[error("transaction already processed")]
    DuplicateTransaction,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SwapConfig {
    pub min_icy_swap: U256,
    /// Allowed relative deviation between the event BTC amount and the
    /// oracle-derived amount.
    pub slippage_tolerance: f64,
    pub service_fee_rate: f64,
    pub min_satoshi_fee: u64,
    pub btc_network: bitcoin::Network,
}

/// Ratio lookup seam; production delegates to the oracle's SWR cache.
#[async_trait]
pub trait RatioSource: Send + Sync {
    async fn icy_btc_ratio(&self) -> Result<FixedDecimal, OracleError>;
}

#[async_trait]
impl RatioSource for OracleService {
    async fn icy_btc_ratio(&self) -> Result<FixedDecimal, OracleError> {
        self.get_cached_icy_btc_ratio().await
    }
}

/// What happened to one pending request during a worker pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    /// Burn not indexed yet; stays pending for the next tick.
    Deferred,
    /// Terminal ledger failure recorded for manual review.
    Failed,
    /// A concurrent worker holds the payout slot.
    AlreadyClaimed,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSummary {
    pub completed: u64,
    pub deferred: u64,
    pub failed: u64,
    pub skipped: u64,
}

pub struct SwapService {
    store: Arc<dyn Store>,
    ratio: Arc<dyn RatioSource>,
    sender: Arc<dyn PayoutSender>,
    swap_indexer: Arc<IcySwapIndexer>,
    config: SwapConfig,
}

impl SwapService {
    pub fn new(
        store: Arc<dyn Store>,
        ratio: Arc<dyn RatioSource>,
        sender: Arc<dyn PayoutSender>,
        swap_indexer: Arc<IcySwapIndexer>,
        config: SwapConfig,
    ) -> Self {
        Self {
            store,
            ratio,
            sender,
            swap_indexer,
            config,
        }
    }

    /// Validates and stores a user swap submission as a pending request.
    #[instrument(skip(self))]
    pub async fn create_swap_request(
        &self,
        icy_amount: &str,
        btc_address: &str,
        icy_tx: &str,
    ) -> Result<SwapRequest, SwapError> {
        let amount = U256::from_str(icy_amount).map_err(|_| SwapError::InvalidAmount)?;
        if amount.is_zero() {
            return Err(SwapError::InvalidAmount);
        }
        if amount < self.config.min_icy_swap {
            return Err(SwapError::BelowMinimum);
        }
        validate_btc_address(btc_address, self.config.btc_network)
            .map_err(|e| SwapError::Address(e.to_string()))?;
        if !EVM_TX_HASH.is_match(icy_tx) {
            return Err(SwapError::InvalidTxHash);
        }

        self.store
            .create_swap_request(NewSwapRequest {
                icy_amount: amount.to_string(),
                btc_address: btc_address.to_string(),
                icy_tx: icy_tx.to_lowercase(),
            })
            .await
            .map_err(|error| match error {
                StoreError::Duplicate => SwapError::DuplicateTransaction,
                other => SwapError::Store(other),
            })
    }

    /// One worker pass over all pending requests, oldest first. Individual
    /// request errors are recorded and do not abort the batch.
    #[instrument(skip(self))]
    pub async fn process_pending(&self) -> Result<ProcessSummary, SwapError> {
        let mut summary = ProcessSummary::default();
        for request in self.store.pending_swap_requests().await? {
            match self.process_one(&request).await {
                Ok(Outcome::Completed) => summary.completed += 1,
                Ok(Outcome::Deferred) => summary.deferred += 1,
                Ok(Outcome::Failed) => summary.failed += 1,
                Ok(Outcome::AlreadyClaimed) => summary.skipped += 1,
                Err(error) => {
                    summary.deferred += 1;
                    tracing::error!(
                        icy_tx = %request.icy_tx,
                        error = %error,
                        "swap request processing errored, will retry next tick"
                    );
                }
            }
        }
        if summary.completed + summary.failed > 0 {
            tracing::info!(?summary, "swap worker pass finished");
        }
        Ok(summary)
    }

    async fn process_one(&self, request: &SwapRequest) -> Result<Outcome, SwapError> {
        let swap_tx = match self.resolve_swap_event(&request.icy_tx).await? {
            Some(tx) => tx,
            // Burn not visible yet; the next tick will try again.
            None => return Ok(Outcome::Deferred),
        };

        if swap_tx.btc_address != request.btc_address
            || swap_tx.icy_amount != request.icy_amount
        {
            tracing::warn!(
                icy_tx = %request.icy_tx,
                "swap request does not match its on-chain event"
            );
            return self
                .record_failure(request, &swap_tx, "request does not match on-chain swap event")
                .await;
        }

        // Sanity-check the event amount against the oracle rate. No rate
        // means no safe payout; defer rather than guess.
        let ratio = match self.ratio.icy_btc_ratio().await {
            Ok(ratio) => ratio.to_f64(),
            Err(error) => {
                tracing::warn!(error = %error, "conversion ratio unavailable, deferring payout");
                return Ok(Outcome::Deferred);
            }
        };
        if ratio > 0.0 {
            let icy = FixedDecimal::from_raw_str(&swap_tx.icy_amount, ICY_SCALE)
                .map_err(|_| SwapError::InvalidAmount)?
                .to_f64();
            let expected_sats = icy / ratio * SATS_PER_BTC;
            let deviation = (swap_tx.btc_amount as f64 - expected_sats).abs();
            if deviation > expected_sats * self.config.slippage_tolerance {
                tracing::warn!(
                    icy_tx = %request.icy_tx,
                    event_sats = swap_tx.btc_amount,
                    expected_sats,
                    "btc amount outside slippage tolerance"
                );
                return self
                    .record_failure(request, &swap_tx, "btc amount outside slippage tolerance")
                    .await;
            }
        }

        let event_sats = swap_tx.btc_amount.max(0) as u64;
        let service_fee = ((event_sats as f64 * self.config.service_fee_rate).ceil() as u64)
            .max(self.config.min_satoshi_fee);
        let Some(payout_sats) = event_sats.checked_sub(service_fee).filter(|p| *p > 0) else {
            return self
                .record_failure(request, &swap_tx, "amount does not cover the service fee")
                .await;
        };

        // Claim the payout slot. Losing the race is fine; the winner owns it.
        let ledger_id = match self
            .store
            .insert_processed_pending(NewProcessedTransaction {
                icy_transaction_hash: request.icy_tx.clone(),
                swap_transaction_hash: swap_tx.transaction_hash.clone(),
                btc_address: request.btc_address.clone(),
                amount: payout_sats as i64,
                service_fee: service_fee as i64,
            })
            .await
        {
            Ok(id) => id,
            Err(StoreError::Duplicate) => return Ok(Outcome::AlreadyClaimed),
            Err(other) => return Err(other.into()),
        };

        // The send happens outside any DB transaction: a broadcast can
        // succeed even when the status write after it fails, and the ledger
        // row already guards against double payouts.
        match self.sender.send(&request.btc_address, payout_sats).await {
            Ok(outcome) => {
                self.store
                    .mark_processed_completed(ledger_id, &outcome.txid, outcome.fee_sats as i64)
                    .await?;
                self.store.complete_swap_request(&request.icy_tx).await?;
                tracing::info!(
                    icy_tx = %request.icy_tx,
                    btc_tx = %outcome.txid,
                    payout_sats,
                    "swap fulfilled"
                );
                Ok(Outcome::Completed)
            }
            Err(error) => {
                if error.is_fee_related() {
                    tracing::warn!(
                        icy_tx = %request.icy_tx,
                        error = %error,
                        "payout hit a fee limit, ledger row flagged for manual review"
                    );
                } else {
                    tracing::error!(
                        icy_tx = %request.icy_tx,
                        error = %error,
                        "payout failed"
                    );
                }
                self.store
                    .mark_processed_failed(ledger_id, &error.to_string())
                    .await?;
                Ok(Outcome::Failed)
            }
        }
    }

    /// Looks the burn up in the local index, nudging the swap-event indexer
    /// once if it has not been seen yet.
    async fn resolve_swap_event(
        &self,
        icy_tx: &str,
    ) -> Result<Option<OnchainIcySwapTransaction>, SwapError> {
        if let Some(tx) = self.store.icy_swap_by_tx(icy_tx).await? {
            return Ok(Some(tx));
        }
        if let Err(error) = self.swap_indexer.run_once().await {
            tracing::warn!(error = %error, "inline swap-event index pass failed");
        }
        Ok(self.store.icy_swap_by_tx(icy_tx).await?)
    }

    async fn record_failure(
        &self,
        request: &SwapRequest,
        swap_tx: &OnchainIcySwapTransaction,
        reason: &str,
    ) -> Result<Outcome, SwapError> {
        let ledger_id = match self
            .store
            .insert_processed_pending(NewProcessedTransaction {
                icy_transaction_hash: request.icy_tx.clone(),
                swap_transaction_hash: swap_tx.transaction_hash.clone(),
                btc_address: request.btc_address.clone(),
                amount: 0,
                service_fee: 0,
            })
            .await
        {
            Ok(id) => id,
            Err(StoreError::Duplicate) => return Ok(Outcome::AlreadyClaimed),
            Err(other) => return Err(other.into()),
        };
        self.store.mark_processed_failed(ledger_id, reason).await?;
        Ok(Outcome::Failed)
    }

    /// True when the request is already terminal on the ledger.
    pub async fn is_processed(&self, icy_tx: &str) -> Result<bool, SwapError> {
        Ok(self
            .store
            .processed_by_icy_tx(icy_tx)
            .await?
            .map(|row| row.status == status::COMPLETED)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::btc::wallet::{BtcSendError, SendOutcome};
    use crate::chain::evm::{EvmApi, EvmError, IcySwapEvent, IcyTransfer, SwapPermit};
    use crate::decimal::RATIO_SCALE;
    use crate::store::memory::MemoryStore;
    use alloy::primitives::{Address, B256};
    use chrono::Utc;
    use std::sync::Mutex;

    const BTC_ADDR: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
    const ICY_TX: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";
    // 5 ICY in atomic units.
    const FIVE_ICY: &str = "5000000000000000000";

    struct FixedRatio(f64);

    #[async_trait]
    impl RatioSource for FixedRatio {
        async fn icy_btc_ratio(&self) -> Result<FixedDecimal, OracleError> {
            Ok(FixedDecimal::from_f64(self.0, RATIO_SCALE).unwrap())
        }
    }

    struct FakeSender {
        sends: Mutex<Vec<(String, u64)>>,
        result: Option<BtcSendError>,
    }

    impl FakeSender {
        fn ok() -> Self {
            Self {
                sends: Mutex::new(Vec::new()),
                result: None,
            }
        }

        fn failing(error: BtcSendError) -> Self {
            Self {
                sends: Mutex::new(Vec::new()),
                result: Some(error),
            }
        }
    }

    #[async_trait]
    impl PayoutSender for FakeSender {
        async fn send(&self, to: &str, amount_sats: u64) -> Result<SendOutcome, BtcSendError> {
            self.sends.lock().unwrap().push((to.to_string(), amount_sats));
            match &self.result {
                None => Ok(SendOutcome {
                    txid: "BTC-TXID".to_string(),
                    fee_sats: 1_400,
                }),
                Some(BtcSendError::FeeExceedsMaxUsd { fee_usd, max_usd }) => {
                    Err(BtcSendError::FeeExceedsMaxUsd {
                        fee_usd: *fee_usd,
                        max_usd: *max_usd,
                    })
                }
                Some(_) => Err(BtcSendError::Signing("boom".to_string())),
            }
        }
    }

    struct EventEvm {
        events: Vec<IcySwapEvent>,
    }

    #[async_trait]
    impl EvmApi for EventEvm {
        async fn icy_balance_of(&self, _a: Address) -> Result<FixedDecimal, EvmError> {
            Ok(FixedDecimal::zero(18))
        }
        async fn icy_total_supply(&self) -> Result<FixedDecimal, EvmError> {
            Ok(FixedDecimal::zero(18))
        }
        async fn icy_transfers_since(
            &self,
            _w: Address,
            _f: Option<B256>,
        ) -> Result<Vec<IcyTransfer>, EvmError> {
            Ok(Vec::new())
        }
        async fn swap_events_since(
            &self,
            _f: Option<B256>,
        ) -> Result<Vec<IcySwapEvent>, EvmError> {
            Ok(self.events.clone())
        }
        async fn submit_swap(
            &self,
            _i: U256,
            _b: &str,
            _s: u64,
        ) -> Result<B256, EvmError> {
            unimplemented!()
        }
        async fn generate_swap_permit(
            &self,
            _i: U256,
            _b: &str,
            _s: u64,
        ) -> Result<SwapPermit, EvmError> {
            unimplemented!()
        }
    }

    fn config() -> SwapConfig {
        SwapConfig {
            min_icy_swap: U256::from(1_000_000_000_000_000_000u128),
            slippage_tolerance: 0.01,
            service_fee_rate: 0.01,
            min_satoshi_fee: 100,
            btc_network: bitcoin::Network::Bitcoin,
        }
    }

    fn service_with(
        store: Arc<MemoryStore>,
        sender: Arc<FakeSender>,
        ratio: f64,
        events: Vec<IcySwapEvent>,
    ) -> SwapService {
        let indexer = Arc::new(IcySwapIndexer::new(
            store.clone(),
            Arc::new(EventEvm { events }),
        ));
        SwapService::new(
            store,
            Arc::new(FixedRatio(ratio)),
            sender,
            indexer,
            config(),
        )
    }

    async fn seed_event(store: &MemoryStore, icy_amount: &str, btc_sats: i64) {
        store
            .insert_icy_swaps(&[crate::store::models::OnchainIcySwapTransaction {
                transaction_hash: ICY_TX.to_string(),
                from_address: "0xuser".to_string(),
                icy_amount: icy_amount.to_string(),
                btc_address: BTC_ADDR.to_string(),
                btc_amount: btc_sats,
                block_number: 10,
                created_at: Utc::now(),
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_swap_request_validates_and_rejects_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let service = service_with(store.clone(), Arc::new(FakeSender::ok()), 10_000.0, vec![]);

        assert!(matches!(
            service.create_swap_request("0", BTC_ADDR, ICY_TX).await,
            Err(SwapError::InvalidAmount)
        ));
        assert!(matches!(
            service.create_swap_request("1", BTC_ADDR, ICY_TX).await,
            Err(SwapError::BelowMinimum)
        ));
        assert!(matches!(
            service
                .create_swap_request(FIVE_ICY, "not-an-address", ICY_TX)
                .await,
            Err(SwapError::Address(_))
        ));
        assert!(matches!(
            service
                .create_swap_request(FIVE_ICY, BTC_ADDR, "0x123")
                .await,
            Err(SwapError::InvalidTxHash)
        ));

        service
            .create_swap_request(FIVE_ICY, BTC_ADDR, ICY_TX)
            .await
            .unwrap();
        assert!(matches!(
            service.create_swap_request(FIVE_ICY, BTC_ADDR, ICY_TX).await,
            Err(SwapError::DuplicateTransaction)
        ));
    }

    #[tokio::test]
    async fn happy_path_pays_event_amount_minus_service_fee() {
        let store = Arc::new(MemoryStore::new());
        // 5 ICY at 10_000 ICY/BTC → 50_000 sats expected; event matches.
        seed_event(&store, FIVE_ICY, 50_000).await;
        let sender = Arc::new(FakeSender::ok());
        let service = service_with(store.clone(), sender.clone(), 10_000.0, vec![]);

        service
            .create_swap_request(FIVE_ICY, BTC_ADDR, ICY_TX)
            .await
            .unwrap();
        let summary = service.process_pending().await.unwrap();
        assert_eq!(summary.completed, 1);

        // 1% service fee on 50_000 sats.
        let sends = sender.sends.lock().unwrap();
        assert_eq!(sends.as_slice(), &[(BTC_ADDR.to_string(), 49_500u64)]);

        let processed = store.processed_by_icy_tx(ICY_TX).await.unwrap().unwrap();
        assert_eq!(processed.status, status::COMPLETED);
        assert_eq!(processed.btc_transaction_hash.as_deref(), Some("BTC-TXID"));
        assert_eq!(processed.network_fee, Some(1_400));
        assert_eq!(processed.amount, 49_500);
        assert_eq!(processed.service_fee, 500);

        let pending = store.pending_swap_requests().await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unindexed_burn_triggers_inline_index_pass() {
        let store = Arc::new(MemoryStore::new());
        // The event exists on chain but not in the store yet.
        let event = IcySwapEvent {
            tx_hash: B256::from_str(ICY_TX).unwrap(),
            from_address: Address::ZERO,
            icy_amount: U256::from_str(FIVE_ICY).unwrap(),
            btc_address: BTC_ADDR.to_string(),
            btc_sats: 50_000,
            block_number: 10,
        };
        let sender = Arc::new(FakeSender::ok());
        let service = service_with(store.clone(), sender.clone(), 10_000.0, vec![event]);

        service
            .create_swap_request(FIVE_ICY, BTC_ADDR, ICY_TX)
            .await
            .unwrap();
        let summary = service.process_pending().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(sender.sends.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_burn_leaves_request_pending() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(FakeSender::ok());
        let service = service_with(store.clone(), sender.clone(), 10_000.0, vec![]);

        service
            .create_swap_request(FIVE_ICY, BTC_ADDR, ICY_TX)
            .await
            .unwrap();
        let summary = service.process_pending().await.unwrap();
        assert_eq!(summary.deferred, 1);
        assert!(sender.sends.lock().unwrap().is_empty());
        assert_eq!(store.pending_swap_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slippage_violation_records_failed_ledger_row() {
        let store = Arc::new(MemoryStore::new());
        // Expected 50_000 sats; event claims 60_000.
        seed_event(&store, FIVE_ICY, 60_000).await;
        let sender = Arc::new(FakeSender::ok());
        let service = service_with(store.clone(), sender.clone(), 10_000.0, vec![]);

        service
            .create_swap_request(FIVE_ICY, BTC_ADDR, ICY_TX)
            .await
            .unwrap();
        let summary = service.process_pending().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(sender.sends.lock().unwrap().is_empty());

        let processed = store.processed_by_icy_tx(ICY_TX).await.unwrap().unwrap();
        assert_eq!(processed.status, status::FAILED);
        assert!(processed.error.unwrap().contains("slippage"));
    }

    #[tokio::test]
    async fn amount_mismatch_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        seed_event(&store, "4000000000000000000", 50_000).await;
        let sender = Arc::new(FakeSender::ok());
        let service = service_with(store.clone(), sender.clone(), 10_000.0, vec![]);

        service
            .create_swap_request(FIVE_ICY, BTC_ADDR, ICY_TX)
            .await
            .unwrap();
        let summary = service.process_pending().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(sender.sends.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fee_failure_marks_ledger_failed_and_keeps_request_pending() {
        let store = Arc::new(MemoryStore::new());
        seed_event(&store, FIVE_ICY, 50_000).await;
        let sender = Arc::new(FakeSender::failing(BtcSendError::FeeExceedsMaxUsd {
            fee_usd: 14.0,
            max_usd: 10.0,
        }));
        let service = service_with(store.clone(), sender.clone(), 10_000.0, vec![]);

        service
            .create_swap_request(FIVE_ICY, BTC_ADDR, ICY_TX)
            .await
            .unwrap();
        let summary = service.process_pending().await.unwrap();
        assert_eq!(summary.failed, 1);

        let processed = store.processed_by_icy_tx(ICY_TX).await.unwrap().unwrap();
        assert_eq!(processed.status, status::FAILED);
        // The request itself has no failed state; the ledger row carries it.
        assert_eq!(store.pending_swap_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claimed_slot_is_skipped_without_sending() {
        let store = Arc::new(MemoryStore::new());
        seed_event(&store, FIVE_ICY, 50_000).await;
        let sender = Arc::new(FakeSender::ok());
        let service = service_with(store.clone(), sender.clone(), 10_000.0, vec![]);

        service
            .create_swap_request(FIVE_ICY, BTC_ADDR, ICY_TX)
            .await
            .unwrap();
        // A concurrent worker claims the ledger slot between the request
        // landing and our pass.
        store
            .insert_processed_pending(NewProcessedTransaction {
                icy_transaction_hash: ICY_TX.to_string(),
                swap_transaction_hash: ICY_TX.to_string(),
                btc_address: BTC_ADDR.to_string(),
                amount: 49_500,
                service_fee: 500,
            })
            .await
            .unwrap();

        let summary = service.process_pending().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(sender.sends.lock().unwrap().is_empty());
    }
}
