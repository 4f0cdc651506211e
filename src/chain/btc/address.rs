//! Bitcoin payout-address validation.
//!
//! Accepts Base58Check (`1…` P2PKH, `3…` P2SH) and Bech32 (`bc1…` mainnet,
//! `tb1…` testnet) encodings, and rejects addresses whose embedded network
//! does not match the configured one.

use bitcoin::address::{Address, NetworkUnchecked};
use bitcoin::Network;

#[derive(Debug, thiserror::Error)]
pub enum BtcAddressError {
    #[error("malformed bitcoin address: {0}")]
    Malformed(String),
    #[error("address is valid for a different network (expected {expected})")]
    WrongNetwork { expected: Network },
}

/// Decodes and checksum-verifies `raw`, binding it to `network`.
pub fn validate_btc_address(raw: &str, network: Network) -> Result<Address, BtcAddressError> {
    let unchecked: Address<NetworkUnchecked> = raw
        .parse()
        .map_err(|e| BtcAddressError::Malformed(format!("{e}")))?;
    unchecked
        .require_network(network)
        .map_err(|_| BtcAddressError::WrongNetwork { expected: network })
}
