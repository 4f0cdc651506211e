//! EVM side of the bridge: the ICY ERC-20 contract, the swap contract, and
//! the service signer.
//!
//! Reads (balances, supply, event logs) and the swap-contract write both go
//! through an Alloy provider composed with the service wallet. Burn
//! authorizations are EIP-712 typed signatures over [`SwapIntent`], bound to
//! the swap contract's domain.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::eip712_domain;
use async_trait::async_trait;
use rand::RngCore;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::instrument;

use crate::decimal::{FixedDecimal, ICY_SCALE};
use crate::endpoints::{EndpointHealth, EndpointPool, PoolConfig, PoolError, Retryable};

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    contract IcyToken {
        event Transfer(address indexed from, address indexed to, uint256 value);
        function balanceOf(address owner) external view returns (uint256);
        function totalSupply() external view returns (uint256);
    }

    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    contract IcySwap {
        event Swap(address indexed from, uint256 icyAmount, string btcAddress, uint256 btcAmount);
        function swap(uint256 icyAmount, string calldata btcAddress, uint256 btcAmount) external;
    }

    /// Typed burn authorization the user submits alongside their swap call.
    #[derive(Debug)]
    struct SwapIntent {
        uint256 icyAmount;
        string btcAddress;
        uint256 btcAmount;
        uint256 nonce;
        uint256 deadline;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EvmError {
    #[error("rpc transport error: {0}")]
    Rpc(String),
    #[error("contract call failed: {0}")]
    Contract(String),
    #[error("signing failed: {0}")]
    Signer(String),
    #[error("transaction {0} not found on chain")]
    MissingTransaction(B256),
    #[error("malformed chain data: {0}")]
    Decode(String),
    #[error("request timed out")]
    Timeout,
    #[error("all rpc endpoints unavailable")]
    AllEndpointsUnavailable,
}

impl Retryable for EvmError {
    fn is_retryable(&self) -> bool {
        matches!(self, EvmError::Rpc(_) | EvmError::Timeout)
    }
}

impl From<alloy::transports::TransportError> for EvmError {
    fn from(error: alloy::transports::TransportError) -> Self {
        EvmError::Rpc(error.to_string())
    }
}

impl From<alloy::contract::Error> for EvmError {
    fn from(error: alloy::contract::Error) -> Self {
        match error {
            alloy::contract::Error::TransportError(transport) => {
                EvmError::Rpc(transport.to_string())
            }
            other => EvmError::Contract(other.to_string()),
        }
    }
}

/// One observed ICY `Transfer` touching the watched treasury address.
#[derive(Debug, Clone)]
pub struct IcyTransfer {
    pub tx_hash: B256,
    pub log_index: u64,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub block_number: u64,
    pub block_time: Option<u64>,
}

/// One decoded swap-contract `Swap` event.
#[derive(Debug, Clone)]
pub struct IcySwapEvent {
    pub tx_hash: B256,
    pub from_address: Address,
    pub icy_amount: U256,
    pub btc_address: String,
    pub btc_sats: u64,
    pub block_number: u64,
}

/// A signed burn authorization returned to the caller of
/// `/swap/generate-signature`.
#[derive(Debug, Clone)]
pub struct SwapPermit {
    pub signature: String,
    pub nonce: U256,
    pub deadline: u64,
}

/// EVM operations the indexer, oracle and swap pipeline consume.
#[async_trait]
pub trait EvmApi: Send + Sync {
    async fn icy_balance_of(&self, address: Address) -> Result<FixedDecimal, EvmError>;
    async fn icy_total_supply(&self) -> Result<FixedDecimal, EvmError>;
    async fn icy_transfers_since(
        &self,
        watched: Address,
        from_tx: Option<B256>,
    ) -> Result<Vec<IcyTransfer>, EvmError>;
    async fn swap_events_since(&self, from_tx: Option<B256>) -> Result<Vec<IcySwapEvent>, EvmError>;
    async fn submit_swap(
        &self,
        icy_amount: U256,
        btc_address: &str,
        btc_sats: u64,
    ) -> Result<B256, EvmError>;
    async fn generate_swap_permit(
        &self,
        icy_amount: U256,
        btc_address: &str,
        btc_sats: u64,
    ) -> Result<SwapPermit, EvmError>;
}

/// Connected EVM node with bound contract handles and the service signer.
pub struct EvmClient {
    provider: DynProvider,
    signer: PrivateKeySigner,
    icy_address: Address,
    swap_address: Address,
    chain_id: u64,
    signature_ttl: Duration,
}

impl EvmClient {
    pub async fn connect(
        rpc_url: &str,
        signer_key: &str,
        icy_address: Address,
        swap_address: Address,
        chain_id: u64,
        signature_ttl: Duration,
    ) -> Result<Self, EvmError> {
        let signer =
            PrivateKeySigner::from_str(signer_key).map_err(|e| EvmError::Signer(e.to_string()))?;
        let wallet = EthereumWallet::from(signer.clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect(rpc_url)
            .await
            .map_err(|e| EvmError::Rpc(format!("failed to connect to {rpc_url}: {e}")))?
            .erased();
        Ok(Self {
            provider,
            signer,
            icy_address,
            swap_address,
            chain_id,
            signature_ttl,
        })
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    fn domain(&self) -> alloy::sol_types::Eip712Domain {
        eip712_domain! {
            name: "IcySwap",
            version: "1",
            chain_id: self.chain_id,
            verifying_contract: self.swap_address,
        }
    }

    async fn block_of(&self, tx_hash: B256) -> Result<u64, EvmError> {
        let tx = self
            .provider
            .get_transaction_by_hash(tx_hash)
            .await?
            .ok_or(EvmError::MissingTransaction(tx_hash))?;
        tx.block_number.ok_or(EvmError::MissingTransaction(tx_hash))
    }

    pub async fn icy_balance_of(&self, address: Address) -> Result<FixedDecimal, EvmError> {
        let contract = IcyToken::new(self.icy_address, &self.provider);
        let balance = contract.balanceOf(address).call().await?;
        FixedDecimal::from_raw_u256(balance, ICY_SCALE).map_err(|e| EvmError::Decode(e.to_string()))
    }

    pub async fn icy_total_supply(&self) -> Result<FixedDecimal, EvmError> {
        let contract = IcyToken::new(self.icy_address, &self.provider);
        let supply = contract.totalSupply().call().await?;
        FixedDecimal::from_raw_u256(supply, ICY_SCALE).map_err(|e| EvmError::Decode(e.to_string()))
    }

    /// ICY `Transfer` events where the watched address is sender or receiver,
    /// from the block of `from_tx` (or genesis) onward. The cursor entry
    /// itself is excluded; ordering is (block, log index).
    #[instrument(skip(self), fields(watched = %watched))]
    pub async fn icy_transfers_since(
        &self,
        watched: Address,
        from_tx: Option<B256>,
    ) -> Result<Vec<IcyTransfer>, EvmError> {
        let from_block = match from_tx {
            Some(tx_hash) => self.block_of(tx_hash).await?,
            None => 0,
        };
        let contract = IcyToken::new(self.icy_address, &self.provider);
        let outgoing = contract
            .Transfer_filter()
            .from_block(from_block)
            .topic1(watched.into_word())
            .query()
            .await?;
        let incoming = contract
            .Transfer_filter()
            .from_block(from_block)
            .topic2(watched.into_word())
            .query()
            .await?;

        let mut transfers: Vec<IcyTransfer> = Vec::new();
        for (event, log) in outgoing.into_iter().chain(incoming) {
            let tx_hash = log
                .transaction_hash
                .ok_or_else(|| EvmError::Decode("log without transaction hash".to_string()))?;
            if Some(tx_hash) == from_tx {
                continue;
            }
            transfers.push(IcyTransfer {
                tx_hash,
                log_index: log.log_index.unwrap_or_default(),
                from: event.from,
                to: event.to,
                amount: event.value,
                block_number: log.block_number.unwrap_or_default(),
                block_time: log.block_timestamp,
            });
        }
        transfers.sort_by_key(|t| (t.block_number, t.log_index));
        // A self-transfer shows up in both topic queries.
        transfers.dedup_by_key(|t| (t.tx_hash, t.log_index));
        Ok(transfers)
    }

    /// Decoded `Swap` events from the block of `from_tx` (or genesis) onward,
    /// excluding the cursor entry itself.
    #[instrument(skip(self))]
    pub async fn swap_events_since(
        &self,
        from_tx: Option<B256>,
    ) -> Result<Vec<IcySwapEvent>, EvmError> {
        let from_block = match from_tx {
            Some(tx_hash) => self.block_of(tx_hash).await?,
            None => 0,
        };
        let contract = IcySwap::new(self.swap_address, &self.provider);
        let logs = contract.Swap_filter().from_block(from_block).query().await?;

        let mut events: Vec<IcySwapEvent> = Vec::new();
        for (event, log) in logs {
            let tx_hash = log
                .transaction_hash
                .ok_or_else(|| EvmError::Decode("log without transaction hash".to_string()))?;
            if Some(tx_hash) == from_tx {
                continue;
            }
            let btc_sats: u64 = event.btcAmount.try_into().map_err(|_| {
                EvmError::Decode(format!("btc amount {} overflows", event.btcAmount))
            })?;
            events.push(IcySwapEvent {
                tx_hash,
                from_address: event.from,
                icy_amount: event.icyAmount,
                btc_address: event.btcAddress,
                btc_sats,
                block_number: log.block_number.unwrap_or_default(),
            });
        }
        events.sort_by_key(|e| e.block_number);
        Ok(events)
    }

    /// Signs and submits a `swap` call with the service key.
    #[instrument(skip(self))]
    pub async fn submit_swap(
        &self,
        icy_amount: U256,
        btc_address: &str,
        btc_sats: u64,
    ) -> Result<B256, EvmError> {
        let contract = IcySwap::new(self.swap_address, &self.provider);
        let pending = contract
            .swap(icy_amount, btc_address.to_string(), U256::from(btc_sats))
            .send()
            .await?;
        Ok(*pending.tx_hash())
    }

    /// Produces an EIP-712 signature authorizing a user's burn of
    /// `icy_amount` in exchange for `btc_sats` to `btc_address`, with a fresh
    /// random nonce and a deadline of now + the configured validity window.
    pub fn generate_swap_permit(
        &self,
        icy_amount: U256,
        btc_address: &str,
        btc_sats: u64,
    ) -> Result<SwapPermit, EvmError> {
        let mut nonce_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = U256::from_be_bytes(nonce_bytes);
        let deadline = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(|e| EvmError::Signer(e.to_string()))?
            .as_secs()
            + self.signature_ttl.as_secs();

        let intent = SwapIntent {
            icyAmount: icy_amount,
            btcAddress: btc_address.to_string(),
            btcAmount: U256::from(btc_sats),
            nonce,
            deadline: U256::from(deadline),
        };
        let signature = self
            .signer
            .sign_typed_data_sync(&intent, &self.domain())
            .map_err(|e| EvmError::Signer(e.to_string()))?;

        Ok(SwapPermit {
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
            nonce,
            deadline,
        })
    }
}

fn flatten(error: PoolError<EvmError>) -> EvmError {
    match error {
        PoolError::Upstream(inner) => inner,
        PoolError::Timeout => EvmError::Timeout,
        PoolError::AllEndpointsUnavailable => EvmError::AllEndpointsUnavailable,
    }
}

/// EVM access routed through the endpoint pool (breakers, retry, back-off).
pub struct EvmRpc {
    pool: EndpointPool<Arc<EvmClient>>,
    /// Signing needs no RPC round-trip; it always uses the primary client.
    primary: Arc<EvmClient>,
}

impl EvmRpc {
    pub fn new(clients: Vec<(String, Arc<EvmClient>)>, config: PoolConfig) -> Self {
        let primary = clients
            .first()
            .map(|(_, client)| client.clone())
            .expect("at least one EVM endpoint is configured");
        Self {
            pool: EndpointPool::new(clients, config),
            primary,
        }
    }

    pub fn endpoint_health(&self) -> Vec<EndpointHealth> {
        self.pool.health()
    }
}

#[async_trait]
impl EvmApi for EvmRpc {
    async fn icy_balance_of(&self, address: Address) -> Result<FixedDecimal, EvmError> {
        self.pool
            .run("icy_balance_of", |client| async move {
                client.icy_balance_of(address).await
            })
            .await
            .map_err(flatten)
    }

    async fn icy_total_supply(&self) -> Result<FixedDecimal, EvmError> {
        self.pool
            .run("icy_total_supply", |client| async move {
                client.icy_total_supply().await
            })
            .await
            .map_err(flatten)
    }

    async fn icy_transfers_since(
        &self,
        watched: Address,
        from_tx: Option<B256>,
    ) -> Result<Vec<IcyTransfer>, EvmError> {
        self.pool
            .run("icy_transfers_since", |client| async move {
                client.icy_transfers_since(watched, from_tx).await
            })
            .await
            .map_err(flatten)
    }

    async fn swap_events_since(&self, from_tx: Option<B256>) -> Result<Vec<IcySwapEvent>, EvmError> {
        self.pool
            .run("swap_events_since", |client| async move {
                client.swap_events_since(from_tx).await
            })
            .await
            .map_err(flatten)
    }

    async fn submit_swap(
        &self,
        icy_amount: U256,
        btc_address: &str,
        btc_sats: u64,
    ) -> Result<B256, EvmError> {
        self.pool
            .run("submit_swap", |client| async move {
                client.submit_swap(icy_amount, btc_address, btc_sats).await
            })
            .await
            .map_err(flatten)
    }

    async fn generate_swap_permit(
        &self,
        icy_amount: U256,
        btc_address: &str,
        btc_sats: u64,
    ) -> Result<SwapPermit, EvmError> {
        self.primary
            .generate_swap_permit(icy_amount, btc_address, btc_sats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use alloy::sol_types::SolStruct;

    fn client_for_signing() -> EvmClient {
        // Connecting is async and network-bound; build the struct directly
        // for the offline signing path.
        let signer = PrivateKeySigner::from_str(
            "0xcafe000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        let wallet = EthereumWallet::from(signer.clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http("http://localhost:8545".parse().unwrap())
            .erased();
        EvmClient {
            provider,
            signer,
            icy_address: address!("0x1111111111111111111111111111111111111111"),
            swap_address: address!("0x2222222222222222222222222222222222222222"),
            chain_id: 8453,
            signature_ttl: Duration::from_secs(600),
        }
    }

    #[test]
    fn swap_permit_signature_recovers_to_service_signer() {
        let client = client_for_signing();
        let permit = client
            .generate_swap_permit(
                U256::from(1_000_000_000_000_000_000u128),
                "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4",
                50_000,
            )
            .unwrap();

        assert!(permit.signature.starts_with("0x"));
        assert_eq!(permit.signature.len(), 132);

        let intent = SwapIntent {
            icyAmount: U256::from(1_000_000_000_000_000_000u128),
            btcAddress: "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".to_string(),
            btcAmount: U256::from(50_000u64),
            nonce: permit.nonce,
            deadline: U256::from(permit.deadline),
        };
        let digest = intent.eip712_signing_hash(&client.domain());
        let raw = hex::decode(permit.signature.trim_start_matches("0x")).unwrap();
        let signature = alloy::primitives::Signature::from_raw(&raw).unwrap();
        let recovered = signature.recover_address_from_prehash(&digest).unwrap();
        assert_eq!(recovered, client.signer_address());
    }

    #[test]
    fn permits_use_distinct_nonces() {
        let client = client_for_signing();
        let a = client
            .generate_swap_permit(U256::from(1u64), "bc1q", 1)
            .unwrap();
        let b = client
            .generate_swap_permit(U256::from(1u64), "bc1q", 1)
            .unwrap();
        assert_ne!(a.nonce, b.nonce);
    }
}
