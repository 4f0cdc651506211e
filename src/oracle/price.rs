//! BTC/USD pricing with a one-minute TTL cache and single-flight fetch.
//!
//! On upstream failure the last cached value is served (marked stale in the
//! logs) so a pricing outage never stalls swap fulfillment.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

const SATS_PER_BTC: f64 = 100_000_000.0;

#[derive(Debug, thiserror::Error)]
pub enum PriceError {
    #[error("pricing upstream error: {0}")]
    Upstream(String),
    #[error("pricing response malformed: {0}")]
    Decode(String),
}

/// USD value of one satoshi; the tx builder checks its fee cap through this.
#[async_trait]
pub trait SatUsdSource: Send + Sync {
    async fn satoshi_usd(&self) -> Result<f64, PriceError>;
}

/// Upstream quote fetch, separated so tests can substitute the HTTP layer.
#[async_trait]
trait QuoteFetcher: Send + Sync {
    async fn btc_usd(&self) -> Result<f64, PriceError>;
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    bitcoin: UsdQuote,
}

#[derive(Debug, Deserialize)]
struct UsdQuote {
    usd: f64,
}

struct HttpQuoteFetcher {
    http: reqwest::Client,
    url: Url,
}

#[async_trait]
impl QuoteFetcher for HttpQuoteFetcher {
    async fn btc_usd(&self) -> Result<f64, PriceError> {
        let response = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| PriceError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PriceError::Upstream(format!(
                "pricing api returned http {}",
                response.status()
            )));
        }
        let quote: PriceResponse = response
            .json()
            .await
            .map_err(|e| PriceError::Decode(e.to_string()))?;
        Ok(quote.bitcoin.usd)
    }
}

pub struct PriceOracle {
    fetcher: Box<dyn QuoteFetcher>,
    ttl: Duration,
    cached: Mutex<Option<(f64, Instant)>>,
    flight: tokio::sync::Mutex<()>,
}

impl PriceOracle {
    /// `url` must answer with `{"bitcoin": {"usd": <number>}}`.
    pub fn new(url: Url, ttl: Duration, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_fetcher(Box::new(HttpQuoteFetcher { http, url }), ttl))
    }

    fn with_fetcher(fetcher: Box<dyn QuoteFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            cached: Mutex::new(None),
            flight: tokio::sync::Mutex::new(()),
        }
    }

    fn fresh(&self) -> Option<f64> {
        let cached = self.cached.lock().expect("price cache lock");
        cached.and_then(|(price, at)| {
            (Instant::now().duration_since(at) <= self.ttl).then_some(price)
        })
    }

    fn any_cached(&self) -> Option<f64> {
        self.cached.lock().expect("price cache lock").map(|(p, _)| p)
    }
}

#[async_trait]
impl SatUsdSource for PriceOracle {
    async fn satoshi_usd(&self) -> Result<f64, PriceError> {
        if let Some(price) = self.fresh() {
            return Ok(price / SATS_PER_BTC);
        }

        // Single flight: concurrent callers share one upstream fetch; the
        // losers re-check the cache the winner populated.
        let _guard = self.flight.lock().await;
        if let Some(price) = self.fresh() {
            return Ok(price / SATS_PER_BTC);
        }

        match self.fetcher.btc_usd().await {
            Ok(price) => {
                *self.cached.lock().expect("price cache lock") = Some((price, Instant::now()));
                Ok(price / SATS_PER_BTC)
            }
            Err(error) => match self.any_cached() {
                Some(stale) => {
                    tracing::warn!(error = %error, "pricing upstream failed, serving stale value");
                    Ok(stale / SATS_PER_BTC)
                }
                None => Err(error),
            },
        }
    }
}
