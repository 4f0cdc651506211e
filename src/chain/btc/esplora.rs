//! Single-endpoint client for an Esplora-style Bitcoin explorer API
//! (Blockstream shape): UTXOs, balances, address history, fee estimates,
//! transaction broadcast.
//!
//! One client is bound to one base URL; endpoint selection, retries and
//! circuit breaking live a layer up in [`crate::endpoints`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::endpoints::Retryable;

#[derive(Debug, thiserror::Error)]
pub enum EsploraError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("upstream returned http {0}")]
    Server(u16),
    #[error("unexpected http {0}: {1}")]
    Http(u16, String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("no fee rate published for a {0}-block target")]
    NoFeeRate(u16),
    #[error("minimum relay fee not met, upstream requires {min_fee} sats")]
    MinRelayFeeNotMet { min_fee: u64 },
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("all explorer endpoints unavailable")]
    AllEndpointsUnavailable,
}

impl EsploraError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EsploraError::Timeout
        } else {
            EsploraError::Network(e.to_string())
        }
    }

    fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            429 => EsploraError::RateLimited,
            code if status.is_server_error() => EsploraError::Server(code),
            code => EsploraError::Http(code, body),
        }
    }
}

impl Retryable for EsploraError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            EsploraError::Network(_)
                | EsploraError::Timeout
                | EsploraError::RateLimited
                | EsploraError::Server(_)
        )
    }

    fn is_rate_limited(&self) -> bool {
        matches!(self, EsploraError::RateLimited)
    }
}

/// An unspent output as reported by `/address/:addr/utxo`.
#[derive(Debug, Clone, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub status: ConfirmationStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfirmationStatus {
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub block_time: Option<i64>,
}

/// A transaction as reported by `/address/:addr/txs`, trimmed to the fields
/// ingestion cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTransaction {
    pub txid: String,
    #[serde(default)]
    pub fee: u64,
    pub status: ConfirmationStatus,
    #[serde(default)]
    pub vin: Vec<Vin>,
    #[serde(default)]
    pub vout: Vec<Vout>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Vin {
    #[serde(default)]
    pub prevout: Option<Vout>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Vout {
    #[serde(default)]
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

#[derive(Debug, Deserialize)]
struct AddressStats {
    chain_stats: TxoSums,
}

#[derive(Debug, Deserialize)]
struct TxoSums {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

static MIN_RELAY_FEE: Lazy<Regex> = Lazy::new(|| {
    // bitcoind phrasing relayed through Esplora: "min relay fee not met, 100 < 294"
    Regex::new(r"min relay fee not met,?\s*\d+\s*<\s*(\d+)").expect("valid min-relay-fee regex")
});

/// HTTP client for one Esplora endpoint.
#[derive(Debug, Clone)]
pub struct EsploraClient {
    base_url: String,
    http: reqwest::Client,
}

impl EsploraClient {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /address/:addr/utxo`
    pub async fn utxos(&self, address: &str) -> Result<Vec<Utxo>, EsploraError> {
        self.get_json(&format!("{}/address/{}/utxo", self.base_url, address))
            .await
    }

    /// Confirmed balance in satoshi, from `chain_stats` only. Mempool funds
    /// are ignored until they confirm.
    pub async fn balance(&self, address: &str) -> Result<u64, EsploraError> {
        let stats: AddressStats = self
            .get_json(&format!("{}/address/{}", self.base_url, address))
            .await?;
        Ok(stats
            .chain_stats
            .funded_txo_sum
            .saturating_sub(stats.chain_stats.spent_txo_sum))
    }

    /// Address history, newest first, paginated until `from_txid` (exclusive)
    /// or the end of the chain listing.
    pub async fn transactions(
        &self,
        address: &str,
        from_txid: Option<&str>,
    ) -> Result<Vec<EsploraTransaction>, EsploraError> {
        let mut out: Vec<EsploraTransaction> = Vec::new();
        let mut last_seen: Option<String> = None;

        loop {
            let url = match &last_seen {
                None => format!("{}/address/{}/txs", self.base_url, address),
                Some(txid) => {
                    format!("{}/address/{}/txs/chain/{}", self.base_url, address, txid)
                }
            };
            let page: Vec<EsploraTransaction> = self.get_json(&url).await?;
            if page.is_empty() {
                break;
            }
            last_seen = page.last().map(|tx| tx.txid.clone());
            for tx in page {
                if Some(tx.txid.as_str()) == from_txid {
                    return Ok(out);
                }
                out.push(tx);
            }
        }
        Ok(out)
    }

    /// `GET /tx/:txid`
    pub async fn transaction(&self, txid: &str) -> Result<EsploraTransaction, EsploraError> {
        self.get_json(&format!("{}/tx/{}", self.base_url, txid))
            .await
    }

    /// `GET /fee-estimates`: confirmation target (blocks) → sat/vB.
    pub async fn fee_estimates(&self) -> Result<BTreeMap<u16, f64>, EsploraError> {
        let raw: BTreeMap<String, f64> = self
            .get_json(&format!("{}/fee-estimates", self.base_url))
            .await?;
        let mut estimates = BTreeMap::new();
        for (target, rate) in raw {
            let target: u16 = target
                .parse()
                .map_err(|_| EsploraError::Decode(format!("fee target {target:?}")))?;
            estimates.insert(target, rate);
        }
        Ok(estimates)
    }

    /// `POST /tx` with the hex-serialized transaction; returns the txid.
    ///
    /// A rejection body matching bitcoind's "min relay fee not met" phrasing
    /// is parsed into [`EsploraError::MinRelayFeeNotMet`] so the sender can
    /// bump the fee and retry.
    pub async fn broadcast(&self, tx_hex: &str) -> Result<String, EsploraError> {
        let response = self
            .http
            .post(format!("{}/tx", self.base_url))
            .header("content-type", "text/plain")
            .body(tx_hex.to_string())
            .send()
            .await
            .map_err(EsploraError::from_reqwest)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(EsploraError::from_reqwest)?;
        if status.is_success() {
            return Ok(body.trim().to_string());
        }
        if let Some(min_fee) = parse_min_relay_fee(&body) {
            return Err(EsploraError::MinRelayFeeNotMet { min_fee });
        }
        match status.as_u16() {
            429 => Err(EsploraError::RateLimited),
            code if status.is_server_error() => Err(EsploraError::Server(code)),
            _ => Err(EsploraError::Rejected(body.trim().to_string())),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, EsploraError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(EsploraError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EsploraError::from_status(status, body));
        }
        let text = response.text().await.map_err(EsploraError::from_reqwest)?;
        serde_json::from_str(&text)
            .map_err(|e| EsploraError::Decode(format!("{e} in body {text:.200}")))
    }
}

fn parse_min_relay_fee(body: &str) -> Option<u64> {
    MIN_RELAY_FEE
        .captures(body)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
