//! Bitcoin payout construction: WIF-derived P2WPKH wallet, greedy UTXO
//! selection, BIP-143 signing, broadcast with a single fee-bump retry when
//! the network rejects the transaction for not meeting the minimum relay fee.

use async_trait::async_trait;
use bitcoin::address::KnownHrp;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, NetworkKind, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Witness,
};
use std::sync::Arc;

use crate::chain::btc::BtcApi;
use crate::chain::btc::address::{BtcAddressError, validate_btc_address};
use crate::chain::btc::esplora::{EsploraError, Utxo};
use crate::oracle::price::SatUsdSource;

/// Fixed weight estimate for a version-2 P2WPKH transaction, in vbytes.
const TX_OVERHEAD_VBYTES: u64 = 10;
const INPUT_VBYTES: u64 = 68;
const OUTPUT_VBYTES: u64 = 31;

/// Change below this is folded into the fee instead of producing an output
/// the network would refuse to relay.
const DUST_LIMIT_SATS: u64 = 546;

/// Multiplier applied on top of an upstream minimum-fee demand.
const FEE_BUMP_FACTOR: f64 = 1.05;

#[derive(Debug, thiserror::Error)]
pub enum BtcSendError {
    #[error("invalid wallet key: {0}")]
    InvalidKey(String),
    #[error(transparent)]
    Address(#[from] BtcAddressError),
    #[error("no fee rate published for a {0}-block target")]
    NoFeeRate(u16),
    #[error("network fee {fee} sats exceeds payout amount {amount} sats")]
    FeeExceedsAmount { fee: u64, amount: u64 },
    #[error("network fee ${fee_usd:.2} exceeds the configured maximum ${max_usd:.2}")]
    FeeExceedsMaxUsd { fee_usd: f64, max_usd: f64 },
    #[error("insufficient confirmed funds: have {have} sats, need {need} sats")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("fee bump to {needed} sats exceeds available change {change} sats")]
    InsufficientFundsForFeeBump { needed: u64, change: u64 },
    #[error("signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Explorer(#[from] EsploraError),
}

impl BtcSendError {
    /// Fee-class failures are terminal for the payout and flagged for manual
    /// review rather than retried.
    pub fn is_fee_related(&self) -> bool {
        matches!(
            self,
            BtcSendError::NoFeeRate(_)
                | BtcSendError::FeeExceedsAmount { .. }
                | BtcSendError::FeeExceedsMaxUsd { .. }
                | BtcSendError::InsufficientFunds { .. }
                | BtcSendError::InsufficientFundsForFeeBump { .. }
        )
    }
}

const fn estimate_vbytes(inputs: usize, outputs: usize) -> u64 {
    TX_OVERHEAD_VBYTES + INPUT_VBYTES * inputs as u64 + OUTPUT_VBYTES * outputs as u64
}

fn fee_for(rate_sat_vb: f64, inputs: usize, outputs: usize) -> u64 {
    (rate_sat_vb * estimate_vbytes(inputs, outputs) as f64).ceil() as u64
}

/// The treasury's hot wallet: a WIF-imported key and its derived SegWit v0
/// address.
pub struct BtcWallet {
    secp: Secp256k1<All>,
    key: bitcoin::PrivateKey,
    compressed: CompressedPublicKey,
    address: Address,
}

impl BtcWallet {
    pub fn from_wif(wif: &str, network: Network) -> Result<Self, BtcSendError> {
        let key = bitcoin::PrivateKey::from_wif(wif)
            .map_err(|e| BtcSendError::InvalidKey(e.to_string()))?;
        if key.network != NetworkKind::from(network) {
            return Err(BtcSendError::InvalidKey(format!(
                "WIF encodes a key for another network than {network}"
            )));
        }
        let secp = Secp256k1::new();
        let compressed = CompressedPublicKey::from_private_key(&secp, &key)
            .map_err(|e| BtcSendError::InvalidKey(e.to_string()))?;
        let hrp = match network {
            Network::Bitcoin => KnownHrp::Mainnet,
            Network::Regtest => KnownHrp::Regtest,
            _ => KnownHrp::Testnets,
        };
        let address = Address::p2wpkh(&compressed, hrp);
        Ok(Self {
            secp,
            key,
            compressed,
            address,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

#[derive(Debug, Clone)]
struct Selection {
    utxos: Vec<Utxo>,
    total: u64,
    fee: u64,
    change: u64,
}

/// Greedy largest-first selection. The fee target is recomputed on every
/// added input because the transaction grows with it; two outputs (recipient
/// plus change) are assumed throughout.
fn select_utxos(
    mut utxos: Vec<Utxo>,
    amount: u64,
    rate_sat_vb: f64,
) -> Result<Selection, BtcSendError> {
    utxos.sort_by_key(|u| std::cmp::Reverse(u.value));

    let mut selected: Vec<Utxo> = Vec::new();
    let mut total: u64 = 0;
    let mut fee: u64 = 0;
    for utxo in utxos {
        total = total.saturating_add(utxo.value);
        selected.push(utxo);
        fee = fee_for(rate_sat_vb, selected.len(), 2);
        if total >= amount.saturating_add(fee) {
            return Ok(Selection {
                total,
                fee,
                change: total - amount - fee,
                utxos: selected,
            });
        }
    }
    Err(BtcSendError::InsufficientFunds {
        have: total,
        need: amount.saturating_add(fee),
    })
}

struct BuiltTx {
    hex: String,
    /// Actual fee paid, including any dust change folded in.
    fee: u64,
    /// Change that made it into an output (zero when folded).
    change: u64,
}

/// Assembles and signs a version-2 P2WPKH transaction paying `amount` to
/// `recipient` with the remainder (minus `fee`) returned to the wallet.
fn build_and_sign(
    wallet: &BtcWallet,
    selected: &[Utxo],
    total: u64,
    recipient: &Address,
    amount: u64,
    fee: u64,
) -> Result<BuiltTx, BtcSendError> {
    let prev_script = wallet.address.script_pubkey();
    let mut change =
        total
            .checked_sub(amount.saturating_add(fee))
            .ok_or(BtcSendError::InsufficientFunds {
                have: total,
                need: amount.saturating_add(fee),
            })?;

    let mut outputs = vec![TxOut {
        value: Amount::from_sat(amount),
        script_pubkey: recipient.script_pubkey(),
    }];
    let mut paid_fee = fee;
    if change >= DUST_LIMIT_SATS {
        outputs.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: wallet.address.script_pubkey(),
        });
    } else {
        paid_fee += change;
        change = 0;
    }

    let inputs: Vec<TxIn> = selected
        .iter()
        .map(|utxo| {
            let txid: bitcoin::Txid = utxo
                .txid
                .parse()
                .map_err(|e| BtcSendError::Signing(format!("bad utxo txid: {e}")))?;
            Ok(TxIn {
                previous_output: OutPoint {
                    txid,
                    vout: utxo.vout,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
        })
        .collect::<Result<_, BtcSendError>>()?;

    let mut tx = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: inputs,
        output: outputs,
    };

    let mut cache = SighashCache::new(&mut tx);
    for (index, utxo) in selected.iter().enumerate() {
        let sighash = cache
            .p2wpkh_signature_hash(
                index,
                &prev_script,
                Amount::from_sat(utxo.value),
                EcdsaSighashType::All,
            )
            .map_err(|e| BtcSendError::Signing(e.to_string()))?;
        let message = Message::from_digest_slice(&sighash.to_byte_array())
            .map_err(|e| BtcSendError::Signing(e.to_string()))?;
        let signature = wallet.secp.sign_ecdsa(&message, &wallet.key.inner);
        let signature = bitcoin::ecdsa::Signature::sighash_all(signature);
        let witness = cache
            .witness_mut(index)
            .ok_or_else(|| BtcSendError::Signing("witness index out of bounds".to_string()))?;
        *witness = Witness::p2wpkh(&signature, &wallet.compressed.0);
    }

    Ok(BuiltTx {
        hex: hex::encode(serialize(&tx)),
        fee: paid_fee,
        change,
    })
}

/// Result of a broadcast payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub txid: String,
    pub fee_sats: u64,
}

/// Seam the swap processor drives payouts through; implemented by
/// [`BtcSender`] in production and by fakes in tests.
#[async_trait]
pub trait PayoutSender: Send + Sync {
    async fn send(&self, to: &str, amount_sats: u64) -> Result<SendOutcome, BtcSendError>;
}

/// Builds, signs and broadcasts treasury payouts.
pub struct BtcSender {
    wallet: BtcWallet,
    api: Arc<dyn BtcApi>,
    price: Arc<dyn SatUsdSource>,
    network: Network,
    fee_target_blocks: u16,
    max_fee_usd: f64,
}

impl BtcSender {
    pub fn new(
        wallet: BtcWallet,
        api: Arc<dyn BtcApi>,
        price: Arc<dyn SatUsdSource>,
        network: Network,
        fee_target_blocks: u16,
        max_fee_usd: f64,
    ) -> Self {
        Self {
            wallet,
            api,
            price,
            network,
            fee_target_blocks,
            max_fee_usd,
        }
    }

    pub fn wallet_address(&self) -> String {
        self.wallet.address.to_string()
    }

    async fn assert_fee_under_usd_cap(&self, fee_sats: u64) -> Result<(), BtcSendError> {
        match self.price.satoshi_usd().await {
            Ok(sat_usd) => {
                let fee_usd = fee_sats as f64 * sat_usd;
                if fee_usd > self.max_fee_usd {
                    return Err(BtcSendError::FeeExceedsMaxUsd {
                        fee_usd,
                        max_usd: self.max_fee_usd,
                    });
                }
                Ok(())
            }
            Err(error) => {
                // A payout should not stall on the pricing upstream; the
                // satoshi-denominated checks still bound the fee.
                tracing::warn!(error = %error, "skipping USD fee cap, price unavailable");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PayoutSender for BtcSender {
    #[tracing::instrument(skip(self), fields(wallet = %self.wallet.address))]
    async fn send(&self, to: &str, amount_sats: u64) -> Result<SendOutcome, BtcSendError> {
        let recipient = validate_btc_address(to, self.network)?;

        let utxos: Vec<Utxo> = self
            .api
            .utxos(&self.wallet.address.to_string())
            .await?
            .into_iter()
            .filter(|u| u.status.confirmed)
            .collect();

        let estimates = self.api.fee_estimates().await?;
        let rate = estimates
            .get(&self.fee_target_blocks)
            .copied()
            .ok_or(BtcSendError::NoFeeRate(self.fee_target_blocks))?;

        let selection = select_utxos(utxos, amount_sats, rate)?;
        if selection.fee > amount_sats {
            return Err(BtcSendError::FeeExceedsAmount {
                fee: selection.fee,
                amount: amount_sats,
            });
        }
        self.assert_fee_under_usd_cap(selection.fee).await?;

        let built = build_and_sign(
            &self.wallet,
            &selection.utxos,
            selection.total,
            &recipient,
            amount_sats,
            selection.fee,
        )?;

        match self.api.broadcast(&built.hex).await {
            Ok(txid) => {
                tracing::info!(txid, fee_sats = built.fee, "payout broadcast");
                Ok(SendOutcome {
                    txid,
                    fee_sats: built.fee,
                })
            }
            Err(EsploraError::MinRelayFeeNotMet { min_fee }) => {
                let bumped = min_fee.max((built.fee as f64 * FEE_BUMP_FACTOR).ceil() as u64);
                let delta = bumped - built.fee;
                if delta > built.change {
                    return Err(BtcSendError::InsufficientFundsForFeeBump {
                        needed: bumped,
                        change: built.change,
                    });
                }
                self.assert_fee_under_usd_cap(bumped).await?;
                tracing::warn!(
                    rejected_fee = built.fee,
                    bumped_fee = bumped,
                    "relay rejected fee, re-signing with bump"
                );
                let rebuilt = build_and_sign(
                    &self.wallet,
                    &selection.utxos,
                    selection.total,
                    &recipient,
                    amount_sats,
                    bumped,
                )?;
                // One bump only; a second rejection is an upstream problem.
                let txid = self.api.broadcast(&rebuilt.hex).await?;
                tracing::info!(txid, fee_sats = rebuilt.fee, "payout broadcast after fee bump");
                Ok(SendOutcome {
                    txid,
                    fee_sats: rebuilt.fee,
                })
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::btc::esplora::{ConfirmationStatus, EsploraTransaction};
    use crate::oracle::price::PriceError;
    use bitcoin::consensus::encode::deserialize;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    // Private key 1 in WIF; its P2WPKH address is the BIP-173 example.
    const WIF: &str = "KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn";
    const RECIPIENT: &str = "bc1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qccfmv2";

    fn wallet() -> BtcWallet {
        BtcWallet::from_wif(WIF, Network::Bitcoin).unwrap()
    }

    fn confirmed_utxo(txid_byte: u8, vout: u32, value: u64) -> Utxo {
        Utxo {
            txid: format!("{:064x}", txid_byte),
            vout,
            value,
            status: ConfirmationStatus {
                confirmed: true,
                block_height: Some(1),
                block_time: Some(0),
            },
        }
    }

    struct FakeApi {
        utxos: Vec<Utxo>,
        fee_estimates: BTreeMap<u16, f64>,
        broadcast_results: Mutex<Vec<Result<String, EsploraError>>>,
        broadcasts: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn new(utxos: Vec<Utxo>, rate: f64, results: Vec<Result<String, EsploraError>>) -> Self {
            let mut fee_estimates = BTreeMap::new();
            fee_estimates.insert(6, rate);
            Self {
                utxos,
                fee_estimates,
                broadcast_results: Mutex::new(results),
                broadcasts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BtcApi for FakeApi {
        async fn utxos(&self, _address: &str) -> Result<Vec<Utxo>, EsploraError> {
            Ok(self.utxos.clone())
        }

        async fn balance(&self, _address: &str) -> Result<u64, EsploraError> {
            Ok(self.utxos.iter().map(|u| u.value).sum())
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
            Ok(self.fee_estimates.clone())
        }

        async fn broadcast(&self, tx_hex: &str) -> Result<String, EsploraError> {
            self.broadcasts.lock().unwrap().push(tx_hex.to_string());
            self.broadcast_results.lock().unwrap().remove(0)
        }
    }

    struct FakePrice(f64);

    #[async_trait]
    impl SatUsdSource for FakePrice {
        async fn satoshi_usd(&self) -> Result<f64, PriceError> {
            Ok(self.0)
        }
    }

    fn sender(api: &Arc<FakeApi>, sat_usd: f64, max_fee_usd: f64) -> BtcSender {
        BtcSender::new(
            wallet(),
            api.clone(),
            Arc::new(FakePrice(sat_usd)),
            Network::Bitcoin,
            6,
            max_fee_usd,
        )
    }

    #[test]
    fn wif_derives_the_bip173_example_address() {
        assert_eq!(
            wallet().address().to_string(),
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"
        );
    }

    #[test]
    fn selection_is_greedy_largest_first_with_growing_fee() {
        let utxos = vec![
            confirmed_utxo(1, 0, 5_000),
            confirmed_utxo(2, 0, 90_000),
            confirmed_utxo(3, 0, 40_000),
        ];
        let selection = select_utxos(utxos, 100_000, 10.0).unwrap();
        // 90k is not enough on its own; 90k + 40k covers amount plus the
        // two-input fee of (10 + 2*68 + 2*31)*10 = 2080 sats.
        assert_eq!(selection.utxos.len(), 2);
        assert_eq!(selection.utxos[0].value, 90_000);
        assert_eq!(selection.total, 130_000);
        assert_eq!(selection.fee, 2_080);
        assert_eq!(selection.change, 27_920);
    }

    #[test]
    fn selection_reports_insufficient_funds() {
        let err = select_utxos(vec![confirmed_utxo(1, 0, 1_000)], 100_000, 10.0).unwrap_err();
        match err {
            BtcSendError::InsufficientFunds { have, need } => {
                assert_eq!(have, 1_000);
                assert_eq!(need, 100_000 + 1_400);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn happy_path_builds_one_input_two_output_tx() {
        let api = Arc::new(FakeApi::new(
            vec![confirmed_utxo(1, 0, 200_000)],
            10.0,
            vec![Ok("TXID-A".to_string())],
        ));
        let sender = sender(&api, 0.0005, 10.0);

        let outcome = sender.send(RECIPIENT, 50_000).await.unwrap();
        // (10 + 68 + 2*31)*10 = 1400 sats at 10 sat/vB.
        assert_eq!(
            outcome,
            SendOutcome {
                txid: "TXID-A".to_string(),
                fee_sats: 1_400
            }
        );

        let broadcasts = api.broadcasts.lock().unwrap();
        assert_eq!(broadcasts.len(), 1);
        let tx: Transaction = deserialize(&hex::decode(&broadcasts[0]).unwrap()).unwrap();
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0].value.to_sat(), 50_000);
        assert_eq!(tx.output[1].value.to_sat(), 148_600);
        assert!(!tx.input[0].witness.is_empty());
    }

    #[tokio::test]
    async fn min_relay_rejection_bumps_fee_once() {
        let api = Arc::new(FakeApi::new(
            vec![confirmed_utxo(1, 0, 200_000)],
            10.0,
            vec![
                Err(EsploraError::MinRelayFeeNotMet { min_fee: 2_000 }),
                Ok("TXID-B".to_string()),
            ],
        ));
        let sender = sender(&api, 0.0005, 10.0);

        let outcome = sender.send(RECIPIENT, 50_000).await.unwrap();
        assert_eq!(outcome.txid, "TXID-B");
        // Demanded minimum beats 1400 * 1.05.
        assert_eq!(outcome.fee_sats, 2_000);

        let broadcasts = api.broadcasts.lock().unwrap();
        assert_eq!(broadcasts.len(), 2);
        let tx: Transaction = deserialize(&hex::decode(&broadcasts[1]).unwrap()).unwrap();
        // Change absorbed the 600-sat bump.
        assert_eq!(tx.output[1].value.to_sat(), 148_000);
    }

    #[tokio::test]
    async fn fee_bump_beyond_change_fails() {
        // 52_000 in, 50_000 out at 1 sat/vB leaves 1_860 sats change; a
        // 50_000-sat relay minimum cannot be absorbed by it.
        let api = Arc::new(FakeApi::new(
            vec![confirmed_utxo(1, 0, 52_000)],
            1.0,
            vec![Err(EsploraError::MinRelayFeeNotMet { min_fee: 50_000 })],
        ));
        let sender = sender(&api, 0.0005, 1_000.0);
        let err = sender.send(RECIPIENT, 50_000).await.unwrap_err();
        assert!(matches!(
            err,
            BtcSendError::InsufficientFundsForFeeBump { .. }
        ));
    }

    #[tokio::test]
    async fn fee_above_usd_cap_is_rejected() {
        let api = Arc::new(FakeApi::new(vec![confirmed_utxo(1, 0, 200_000)], 10.0, vec![]));
        // 1400 sats * $0.01/sat = $14 > $10.
        let sender = sender(&api, 0.01, 10.0);
        let err = sender.send(RECIPIENT, 50_000).await.unwrap_err();
        assert!(matches!(err, BtcSendError::FeeExceedsMaxUsd { .. }));
        assert!(err.is_fee_related());
    }

    #[tokio::test]
    async fn fee_larger_than_amount_is_rejected() {
        let api = Arc::new(FakeApi::new(vec![confirmed_utxo(1, 0, 200_000)], 10.0, vec![]));
        let sender = sender(&api, 0.0005, 10.0);
        let err = sender.send(RECIPIENT, 1_000).await.unwrap_err();
        assert!(matches!(err, BtcSendError::FeeExceedsAmount { .. }));
    }

    #[tokio::test]
    async fn missing_fee_target_is_an_error() {
        let mut api = FakeApi::new(vec![confirmed_utxo(1, 0, 200_000)], 10.0, vec![]);
        api.fee_estimates.clear();
        let api = Arc::new(api);
        let sender = sender(&api, 0.0005, 10.0);
        let err = sender.send(RECIPIENT, 50_000).await.unwrap_err();
        assert!(matches!(err, BtcSendError::NoFeeRate(6)));
    }

    #[tokio::test]
    async fn exact_cover_with_dust_change_folds_into_fee() {
        // One 51_400-sat UTXO paying 50_000 at fee 1400 leaves zero change:
        // still accepted, change output omitted, fee unchanged.
        let api = Arc::new(FakeApi::new(
            vec![confirmed_utxo(1, 0, 51_400)],
            10.0,
            vec![Ok("TXID-C".to_string())],
        ));
        let sender = sender(&api, 0.0005, 10.0);
        let outcome = sender.send(RECIPIENT, 50_000).await.unwrap();
        assert_eq!(outcome.fee_sats, 1_400);

        let broadcasts = api.broadcasts.lock().unwrap();
        let tx: Transaction = deserialize(&hex::decode(&broadcasts[0]).unwrap()).unwrap();
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value.to_sat(), 50_000);
    }

    #[tokio::test]
    async fn unconfirmed_utxos_are_ignored() {
        let mut mempool_utxo = confirmed_utxo(9, 0, 1_000_000);
        mempool_utxo.status.confirmed = false;
        let api = Arc::new(FakeApi::new(
            vec![mempool_utxo, confirmed_utxo(1, 0, 2_000)],
            10.0,
            vec![],
        ));
        let sender = sender(&api, 0.0005, 10.0);
        let err = sender.send(RECIPIENT, 50_000).await.unwrap_err();
        assert!(matches!(err, BtcSendError::InsufficientFunds { .. }));
    }
}
