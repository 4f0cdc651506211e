//! Persisted entities.
//!
//! Monetary columns: ICY amounts are raw 18-decimal integer strings (they do
//! not fit a 64-bit column), BTC amounts are satoshi in `BIGINT`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Row status values shared by swap requests and the processed ledger.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

/// Direction of an observed transfer relative to the watched treasury.
pub mod direction {
    pub const IN: &str = "in";
    pub const OUT: &str = "out";
    /// Treasury-to-treasury movement.
    pub const TRANSFER: &str = "transfer";
}

/// One observed ICY ERC-20 transfer. Immutable once written; keyed by
/// `internal_id` = `<tx_hash>-<log_index>`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OnchainIcyTransaction {
    pub internal_id: String,
    pub transaction_hash: String,
    pub direction: String,
    pub counterparty: String,
    pub amount: String,
    pub block_number: i64,
    pub block_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One decoded swap-contract event; unique on `transaction_hash`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OnchainIcySwapTransaction {
    pub transaction_hash: String,
    pub from_address: String,
    pub icy_amount: String,
    pub btc_address: String,
    pub btc_amount: i64,
    pub block_number: i64,
    pub created_at: DateTime<Utc>,
}

/// One observed Bitcoin wallet transaction; `internal_id` is the txid.
/// Unconfirmed transactions are never persisted.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OnchainBtcTransaction {
    pub internal_id: String,
    pub direction: String,
    pub counterparty: String,
    pub amount: i64,
    pub fee: i64,
    pub block_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A user-submitted swap; unique on `icy_tx`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SwapRequest {
    pub id: i64,
    pub icy_amount: String,
    pub btc_address: String,
    pub icy_tx: String,
    pub status: String,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSwapRequest {
    pub icy_amount: String,
    pub btc_address: String,
    pub icy_tx: String,
}

/// The idempotency ledger tying an ICY burn to a BTC payout; at most one row
/// per `icy_transaction_hash`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProcessedBtcTransaction {
    pub id: i64,
    pub icy_transaction_hash: String,
    pub swap_transaction_hash: String,
    pub btc_transaction_hash: Option<String>,
    pub btc_address: String,
    pub amount: i64,
    pub service_fee: i64,
    pub network_fee: Option<i64>,
    pub status: String,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProcessedTransaction {
    pub icy_transaction_hash: String,
    pub swap_transaction_hash: String,
    pub btc_address: String,
    pub amount: i64,
    pub service_fee: i64,
}

/// An ICY-holding address excluded from circulated supply.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct IcyLockedTreasury {
    pub address: String,
    pub created_at: DateTime<Utc>,
}

/// Paging and filters for the `/transactions` listing.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub limit: i64,
    pub offset: i64,
    pub btc_address: Option<String>,
    pub evm_address: Option<String>,
    pub status: Option<String>,
}
