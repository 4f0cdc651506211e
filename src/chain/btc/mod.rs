//! Bitcoin side of the bridge: Esplora explorer access, payout-address
//! validation, and the treasury wallet that builds and signs payouts.

pub mod address;
pub mod esplora;
pub mod wallet;

use async_trait::async_trait;
use std::collections::BTreeMap;
use url::Url;

use crate::endpoints::{EndpointHealth, EndpointPool, PoolConfig, PoolError};
use esplora::{EsploraClient, EsploraError, EsploraTransaction, Utxo};

/// Explorer operations the rest of the service consumes. Production wires a
/// multi-endpoint [`EsploraPool`]; tests substitute fakes.
#[async_trait]
pub trait BtcApi: Send + Sync {
    async fn utxos(&self, address: &str) -> Result<Vec<Utxo>, EsploraError>;
    async fn balance(&self, address: &str) -> Result<u64, EsploraError>;
    async fn transactions(
        &self,
        address: &str,
        from_txid: Option<&str>,
    ) -> Result<Vec<EsploraTransaction>, EsploraError>;
    async fn transaction(&self, txid: &str) -> Result<EsploraTransaction, EsploraError>;
    async fn fee_estimates(&self) -> Result<BTreeMap<u16, f64>, EsploraError>;
    async fn broadcast(&self, tx_hex: &str) -> Result<String, EsploraError>;
}

fn flatten(error: PoolError<EsploraError>) -> EsploraError {
    match error {
        PoolError::Upstream(inner) => inner,
        PoolError::Timeout => EsploraError::Timeout,
        PoolError::AllEndpointsUnavailable => EsploraError::AllEndpointsUnavailable,
    }
}

/// All configured Esplora endpoints behind breaker/retry selection.
pub struct EsploraPool {
    pool: EndpointPool<EsploraClient>,
}

impl EsploraPool {
    pub fn new(urls: &[Url], config: PoolConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let clients = urls
            .iter()
            .map(|url| {
                let base = url.as_str().trim_end_matches('/').to_string();
                (base.clone(), EsploraClient::new(base, http.clone()))
            })
            .collect();
        Ok(Self {
            pool: EndpointPool::new(clients, config),
        })
    }

    /// Read-only endpoint health snapshot for the health endpoints.
    pub fn endpoint_health(&self) -> Vec<EndpointHealth> {
        self.pool.health()
    }
}

#[async_trait]
impl BtcApi for EsploraPool {
    async fn utxos(&self, address: &str) -> Result<Vec<Utxo>, EsploraError> {
        self.pool
            .run("utxos", |client| async move { client.utxos(address).await })
            .await
            .map_err(flatten)
    }

    async fn balance(&self, address: &str) -> Result<u64, EsploraError> {
        self.pool
            .run("balance", |client| async move {
                client.balance(address).await
            })
            .await
            .map_err(flatten)
    }

    async fn transactions(
        &self,
        address: &str,
        from_txid: Option<&str>,
    ) -> Result<Vec<EsploraTransaction>, EsploraError> {
        self.pool
            .run("transactions", |client| async move {
                client.transactions(address, from_txid).await
            })
            .await
            .map_err(flatten)
    }

    async fn transaction(&self, txid: &str) -> Result<EsploraTransaction, EsploraError> {
        self.pool
            .run("transaction", |client| async move {
                client.transaction(txid).await
            })
            .await
            .map_err(flatten)
    }

    async fn fee_estimates(&self) -> Result<BTreeMap<u16, f64>, EsploraError> {
        self.pool
            .run("fee_estimates", |client| async move {
                client.fee_estimates().await
            })
            .await
            .map_err(flatten)
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String, EsploraError> {
        self.pool
            .run("broadcast", |client| async move {
                client.broadcast(tx_hex).await
            })
            .await
            .map_err(flatten)
    }
}
