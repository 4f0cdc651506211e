//! Supply oracle: circulated ICY, treasury BTC, and the ICY/BTC conversion
//! ratio, with a two-tier (fresh / stale-while-revalidate) cache in front of
//! the chain reads.
//!
//! "Oracle" here derives the conversion ratio from on-chain supplies; the
//! only external price feed is BTC/USD in [`price`].

pub mod cache;
pub mod price;

use alloy::primitives::Address;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::chain::btc::BtcApi;
use crate::chain::btc::esplora::EsploraError;
use crate::chain::evm::{EvmApi, EvmError};
use crate::decimal::{DecimalError, FixedDecimal, RATIO_SCALE};
use crate::store::{Store, StoreError};
use cache::{CacheLookup, CacheStats, SwrCache};
use price::SatUsdSource;

pub const KEY_CIRCULATED_ICY: &str = "circulated_icy";
pub const KEY_BTC_SUPPLY: &str = "btc_supply";
pub const KEY_ICY_BTC_RATIO: &str = "icy_btc_ratio";

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error(transparent)]
    Evm(#[from] EvmError),
    #[error(transparent)]
    Btc(#[from] EsploraError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Decimal(#[from] DecimalError),
    #[error("oracle fetch timed out")]
    Timeout,
    #[error("malformed treasury address in store: {0}")]
    BadAddress(String),
}

/// Off-chain-issued ICY from the upstream accounting API. Best-effort: any
/// failure here drops the term with a warning instead of failing the read.
pub struct AccountingClient {
    http: reqwest::Client,
    url: Url,
}

#[derive(Debug, Deserialize)]
struct IssuedResponse {
    issued: String,
}

impl AccountingClient {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url })
    }

    /// `GET <url>` answering `{"issued": "<raw 18-decimal integer>"}`.
    async fn issued_icy(&self) -> Result<FixedDecimal, String> {
        let response = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("accounting api returned http {}", response.status()));
        }
        let body: IssuedResponse = response.json().await.map_err(|e| e.to_string())?;
        FixedDecimal::from_raw_str(&body.issued, crate::decimal::ICY_SCALE)
            .map_err(|e| e.to_string())
    }
}

struct OracleInner {
    evm: Arc<dyn EvmApi>,
    btc: Arc<dyn BtcApi>,
    store: Arc<dyn Store>,
    price: Arc<dyn SatUsdSource>,
    accounting: Option<AccountingClient>,
    cache: SwrCache<FixedDecimal>,
    fetch_timeout: Duration,
    btc_treasury_address: String,
}

impl OracleInner {
    /// Circulated ICY = total supply − Σ locked treasury balances − the
    /// off-chain-issued amount (best-effort).
    async fn circulated_icy(&self) -> Result<FixedDecimal, OracleError> {
        let total = self.evm.icy_total_supply().await?;
        let mut circulated = total;
        for treasury in self.store.locked_treasuries().await? {
            let address = Address::from_str(&treasury.address)
                .map_err(|_| OracleError::BadAddress(treasury.address.clone()))?;
            let balance = self.evm.icy_balance_of(address).await?;
            circulated = circulated.sub(&balance)?;
        }
        if let Some(accounting) = &self.accounting {
            match accounting.issued_icy().await {
                Ok(issued) => circulated = circulated.sub(&issued)?,
                Err(error) => {
                    tracing::warn!(error, "accounting api unavailable, dropping off-chain term");
                }
            }
        }
        Ok(circulated)
    }

    async fn btc_supply(&self) -> Result<FixedDecimal, OracleError> {
        let sats = self.btc.balance(&self.btc_treasury_address).await?;
        Ok(FixedDecimal::from_sats(sats))
    }

    async fn icy_btc_ratio(&self) -> Result<FixedDecimal, OracleError> {
        let circulated = self.circulated_icy().await?;
        let btc_supply = self.btc_supply().await?;
        Ok(FixedDecimal::ratio(&circulated, &btc_supply, RATIO_SCALE)?)
    }

    async fn fetch(&self, key: &str) -> Result<FixedDecimal, OracleError> {
        match key {
            KEY_CIRCULATED_ICY => self.circulated_icy().await,
            KEY_BTC_SUPPLY => self.btc_supply().await,
            KEY_ICY_BTC_RATIO => self.icy_btc_ratio().await,
            other => unreachable!("unknown oracle cache key {other}"),
        }
    }

    /// Background revalidation behind the per-key flight lock; a refresh
    /// already in progress is good enough.
    async fn refresh(&self, key: &'static str) {
        let flight = self.cache.flight(key);
        let Ok(_guard) = flight.try_lock() else {
            return;
        };
        if matches!(self.cache.lookup(key), CacheLookup::Fresh(_)) {
            return;
        }
        match tokio::time::timeout(self.fetch_timeout, self.fetch(key)).await {
            Ok(Ok(value)) => self.cache.insert(key, value),
            Ok(Err(error)) => {
                tracing::warn!(key, error = %error, "background oracle refresh failed");
            }
            Err(_) => {
                tracing::warn!(key, "background oracle refresh timed out");
            }
        }
    }
}

pub struct OracleService {
    inner: Arc<OracleInner>,
}

impl OracleService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        evm: Arc<dyn EvmApi>,
        btc: Arc<dyn BtcApi>,
        store: Arc<dyn Store>,
        price: Arc<dyn SatUsdSource>,
        accounting: Option<AccountingClient>,
        btc_treasury_address: String,
        cache_ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(OracleInner {
                evm,
                btc,
                store,
                price,
                accounting,
                cache: SwrCache::new(cache_ttl),
                fetch_timeout,
                btc_treasury_address,
            }),
        }
    }

    pub async fn get_circulated_icy(&self) -> Result<FixedDecimal, OracleError> {
        self.inner.circulated_icy().await
    }

    /// Confirmed satoshi balance of the BTC treasury. An empty treasury is a
    /// zero decimal, not an error.
    pub async fn get_btc_supply(&self) -> Result<FixedDecimal, OracleError> {
        self.inner.btc_supply().await
    }

    /// ICY per BTC at 6-decimal precision; zero when the treasury is empty.
    pub async fn get_realtime_icy_btc(&self) -> Result<FixedDecimal, OracleError> {
        self.inner.icy_btc_ratio().await
    }

    pub async fn get_cached_circulated_icy(&self) -> Result<FixedDecimal, OracleError> {
        self.cached(KEY_CIRCULATED_ICY).await
    }

    pub async fn get_cached_btc_supply(&self) -> Result<FixedDecimal, OracleError> {
        self.cached(KEY_BTC_SUPPLY).await
    }

    pub async fn get_cached_icy_btc_ratio(&self) -> Result<FixedDecimal, OracleError> {
        self.cached(KEY_ICY_BTC_RATIO).await
    }

    /// USD value of one satoshi, via the pricing client's own cache.
    pub async fn satoshi_usd(&self) -> Result<f64, price::PriceError> {
        self.inner.price.satoshi_usd().await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Fresh value if present; otherwise stale value while a background
    /// refresh runs; otherwise a blocking fetch bounded by the configured
    /// timeout. Single-flight per key throughout.
    async fn cached(&self, key: &'static str) -> Result<FixedDecimal, OracleError> {
        match self.inner.cache.lookup(key) {
            CacheLookup::Fresh(value) => Ok(value),
            CacheLookup::Stale(value) => {
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.refresh(key).await });
                Ok(value)
            }
            CacheLookup::Miss => {
                let flight = self.inner.cache.flight(key);
                let _guard = flight.lock().await;
                // Another caller may have landed the value while we waited.
                match self.inner.cache.lookup(key) {
                    CacheLookup::Fresh(value) | CacheLookup::Stale(value) => return Ok(value),
                    CacheLookup::Miss => {}
                }
                let value = tokio::time::timeout(self.inner.fetch_timeout, self.inner.fetch(key))
                    .await
                    .map_err(|_| OracleError::Timeout)??;
                self.inner.cache.insert(key, value);
                Ok(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::btc::esplora::{EsploraTransaction, Utxo};
    use crate::chain::evm::{IcySwapEvent, IcyTransfer, SwapPermit};
    use crate::decimal::ICY_SCALE;
    use crate::oracle::price::PriceError;
    use crate::store::memory::MemoryStore;
    use alloy::primitives::{B256, U256};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU32, Ordering};

    const LOCKED: &str = "0x1000000000000000000000000000000000000001";

    fn icy(units: u64) -> FixedDecimal {
        FixedDecimal::from_raw_u256(
            U256::from(units) * U256::from(10u64).pow(U256::from(18u8)),
            ICY_SCALE,
        )
        .unwrap()
    }

    struct FakeEvm {
        total_supply: FixedDecimal,
        balances: HashMap<Address, FixedDecimal>,
        supply_calls: AtomicU32,
    }

    #[async_trait]
    impl EvmApi for FakeEvm {
        async fn icy_balance_of(&self, address: Address) -> Result<FixedDecimal, EvmError> {
            Ok(self
                .balances
                .get(&address)
                .copied()
                .unwrap_or(FixedDecimal::zero(ICY_SCALE)))
        }

        async fn icy_total_supply(&self) -> Result<FixedDecimal, EvmError> {
            self.supply_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.total_supply)
        }

        async fn icy_transfers_since(
            &self,
            _watched: Address,
            _from_tx: Option<B256>,
        ) -> Result<Vec<IcyTransfer>, EvmError> {
            Ok(Vec::new())
        }

        async fn swap_events_since(
            &self,
            _from_tx: Option<B256>,
        ) -> Result<Vec<IcySwapEvent>, EvmError> {
            Ok(Vec::new())
        }

        async fn submit_swap(
            &self,
            _icy_amount: U256,
            _btc_address: &str,
            _btc_sats: u64,
        ) -> Result<B256, EvmError> {
            Err(EvmError::Contract("not wired".to_string()))
        }

        async fn generate_swap_permit(
            &self,
            _icy_amount: U256,
            _btc_address: &str,
            _btc_sats: u64,
        ) -> Result<SwapPermit, EvmError> {
            Err(EvmError::Signer("not wired".to_string()))
        }
    }

    struct FakeBtc {
        balance_sats: u64,
    }

    #[async_trait]
    impl BtcApi for FakeBtc {
        async fn utxos(&self, _address: &str) -> Result<Vec<Utxo>, EsploraError> {
            Ok(Vec::new())
        }

        async fn balance(&self, _address: &str) -> Result<u64, EsploraError> {
            Ok(self.balance_sats)
        }

        async fn transactions(
            &self,
            _address: &str,
            _from_txid: Option<&str>,
        ) -> Result<Vec<EsploraTransaction>, EsploraError> {
            Ok(Vec::new())
        }

        async fn transaction(&self, _txid: &str) -> Result<EsploraTransaction, EsploraError> {
            Err(EsploraError::Http(404, String::new()))
        }

        async fn fee_estimates(&self) -> Result<BTreeMap<u16, f64>, EsploraError> {
            Ok(BTreeMap::new())
        }

        async fn broadcast(&self, _tx_hex: &str) -> Result<String, EsploraError> {
            Err(EsploraError::Rejected("not wired".to_string()))
        }
    }

    struct NoPrice;

    #[async_trait]
    impl SatUsdSource for NoPrice {
        async fn satoshi_usd(&self) -> Result<f64, PriceError> {
            Err(PriceError::Upstream("not wired".to_string()))
        }
    }

    async fn service(total: u64, locked: u64, btc_sats: u64) -> Arc<OracleService> {
        let store = Arc::new(MemoryStore::new());
        store.upsert_locked_treasury(LOCKED).await.unwrap();
        let mut balances = HashMap::new();
        balances.insert(Address::from_str(LOCKED).unwrap(), icy(locked));
        Arc::new(OracleService::new(
            Arc::new(FakeEvm {
                total_supply: icy(total),
                balances,
                supply_calls: AtomicU32::new(0),
            }),
            Arc::new(FakeBtc {
                balance_sats: btc_sats,
            }),
            store,
            Arc::new(NoPrice),
            None,
            "bc1qtreasury".to_string(),
            Duration::from_secs(300),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn circulated_is_supply_minus_locked_balances() {
        let oracle = service(100, 30, 0).await;
        let circulated = oracle.get_circulated_icy().await.unwrap();
        assert_eq!(circulated, icy(70));
    }

    #[tokio::test]
    async fn empty_btc_treasury_reads_zero_without_error() {
        let oracle = service(100, 0, 0).await;
        let supply = oracle.get_btc_supply().await.unwrap();
        assert!(supply.is_zero());
        // And the derived ratio is zero rather than a division error.
        let ratio = oracle.get_realtime_icy_btc().await.unwrap();
        assert!(ratio.is_zero());
    }

    #[tokio::test]
    async fn ratio_is_icy_per_btc_at_six_decimals() {
        // 70 ICY circulating against 0.5 BTC → 140 ICY per BTC.
        let oracle = service(100, 30, 50_000_000).await;
        let ratio = oracle.get_realtime_icy_btc().await.unwrap();
        assert_eq!(ratio.scale(), RATIO_SCALE);
        assert_eq!(ratio.to_f64(), 140.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_reads_hit_upstream_once_within_ttl() {
        let oracle = service(100, 30, 0).await;
        let first = oracle.get_cached_circulated_icy().await.unwrap();
        let second = oracle.get_cached_circulated_icy().await.unwrap();
        assert_eq!(first, second);
        let stats = oracle.cache_stats();
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_value_is_served_while_revalidating() {
        let oracle = service(100, 30, 0).await;
        let first = oracle.get_cached_circulated_icy().await.unwrap();

        // Past the TTL but inside the stale window.
        tokio::time::advance(Duration::from_secs(301)).await;
        let stale = oracle.get_cached_circulated_icy().await.unwrap();
        assert_eq!(first, stale);

        // Let the background refresh land, then the value is fresh again.
        // Under paused time the sleep only completes once spawned tasks idle.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            oracle.inner.cache.lookup(KEY_CIRCULATED_ICY),
            CacheLookup::Fresh(_)
        ));
    }
}
