//! Batched on-chain payout submission
//!
//! Winners are credited through `addWinnersBalance((address,uint256)[])`
//! on the game contract. Batches go out sequentially and each must mine
//! before the next is sent; a failed batch is logged and skipped so one
//! bad entry cannot hold everyone else's winnings hostage.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::core::utils::{keccak256, parse_units};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, TransactionRequest, U256, U64};
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{error, info};

use crate::config::ChainConfig;
use crate::types::PayoutRecord;

const PAYOUT_FN_SIGNATURE: &[u8] = b"addWinnersBalance((address,uint256)[])";

/// Seam between the scheduler and payout submission
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PayoutSink: Send + Sync {
    /// Credit winners on-chain. Returns the records actually credited,
    /// tx hash filled in; failed batches are dropped from the result.
    async fn disburse(&self, payouts: Vec<PayoutRecord>) -> Vec<PayoutRecord>;
}

/// Number of transactions a disbursement of `total` payouts takes
pub fn batch_count(total: usize, batch_size: usize) -> usize {
    total.div_ceil(batch_size.max(1))
}

/// Scale a token amount to 18-decimal contract units, sub-unit dust dropped
fn to_token_units(amount: Decimal) -> Result<U256> {
    if amount <= Decimal::ZERO {
        anyhow::bail!("non-positive payout amount {}", amount);
    }
    let units = parse_units(amount.round_dp(18).to_string(), 18)
        .map_err(|e| anyhow::anyhow!("unscalable payout amount {}: {}", amount, e))?;
    Ok(units.into())
}

/// Build the full calldata for one batch
fn batch_calldata(payouts: &[PayoutRecord]) -> Result<Vec<u8>> {
    let entries = payouts
        .iter()
        .map(|record| -> Result<Token> {
            let address: Address = record
                .wallet
                .parse()
                .with_context(|| format!("Invalid payout address '{}'", record.wallet))?;
            let amount = to_token_units(record.amount)?;
            Ok(Token::Tuple(vec![
                Token::Address(address),
                Token::Uint(amount),
            ]))
        })
        .collect::<Result<Vec<_>>>()?;

    let selector = &keccak256(PAYOUT_FN_SIGNATURE)[..4];
    let encoded_params = ethers::abi::encode(&[Token::Array(entries)]);

    let mut calldata = selector.to_vec();
    calldata.extend_from_slice(&encoded_params);
    Ok(calldata)
}

/// Signs and submits payout batches with the operator wallet
pub struct PayoutDisburser {
    client: SignerMiddleware<Provider<Http>, LocalWallet>,
    contract: Address,
    cfg: ChainConfig,
}

impl PayoutDisburser {
    pub fn new(cfg: ChainConfig, private_key: &str) -> Result<Self> {
        let provider = Provider::<Http>::try_from(cfg.rpc_url.as_str())
            .context("Failed to build RPC provider")?;
        let chain_id: u64 = cfg
            .network_id
            .parse()
            .context("network_id must be a numeric chain id")?;
        let wallet: LocalWallet = private_key
            .parse::<LocalWallet>()
            .context("Invalid operator private key")?
            .with_chain_id(chain_id);
        let contract: Address = cfg
            .contract_address
            .parse()
            .context("Invalid game contract address")?;

        Ok(Self {
            client: SignerMiddleware::new(provider, wallet),
            contract,
            cfg,
        })
    }

    async fn send_batch(&self, payouts: &[PayoutRecord]) -> Result<String> {
        let calldata = batch_calldata(payouts)?;

        let tx = TransactionRequest::new()
            .to(self.contract)
            .data(calldata)
            .from(self.client.address());

        let gas_estimate = self
            .client
            .estimate_gas(&tx.clone().into(), None)
            .await
            .context("Payout gas estimation failed")?;
        let gas_limit = gas_estimate * 120 / 100;

        let pending_tx = self
            .client
            .send_transaction(tx.gas(gas_limit), None)
            .await
            .context("Payout tx send failed")?;
        let tx_hash = format!("{:?}", pending_tx.tx_hash());
        info!(tx = %tx_hash, winners = payouts.len(), "🔗 Payout batch sent");

        // Winners are only announced once the batch actually mined
        match tokio::time::timeout(
            Duration::from_secs(self.cfg.verify_deadline_secs),
            pending_tx,
        )
        .await
        {
            Ok(Ok(Some(receipt))) => {
                if receipt.status == Some(U64::from(1)) {
                    Ok(tx_hash)
                } else {
                    anyhow::bail!("payout tx reverted: {}", tx_hash)
                }
            }
            Ok(Ok(None)) => anyhow::bail!("payout tx dropped without a receipt: {}", tx_hash),
            Ok(Err(e)) => Err(e).context("Payout tx failed while pending"),
            Err(_) => anyhow::bail!("payout tx not mined before the deadline: {}", tx_hash),
        }
    }
}

#[async_trait]
impl PayoutSink for PayoutDisburser {
    async fn disburse(&self, payouts: Vec<PayoutRecord>) -> Vec<PayoutRecord> {
        let batch_size = self.cfg.payout_batch_size.max(1);
        let total_batches = batch_count(payouts.len(), batch_size);
        let mut paid = Vec::with_capacity(payouts.len());

        for (index, chunk) in payouts.chunks(batch_size).enumerate() {
            match self.send_batch(chunk).await {
                Ok(tx_hash) => {
                    info!(
                        batch = index + 1,
                        total_batches,
                        winners = chunk.len(),
                        tx = %tx_hash,
                        "✅ Payout batch confirmed"
                    );
                    paid.extend(chunk.iter().map(|record| PayoutRecord {
                        tx_hash: Some(tx_hash.clone()),
                        ..record.clone()
                    }));
                }
                Err(e) => {
                    error!(
                        batch = index + 1,
                        total_batches,
                        winners = chunk.len(),
                        error = %e,
                        "Payout batch failed; continuing with the rest"
                    );
                }
            }
        }
        paid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn record(wallet: &str, amount: Decimal) -> PayoutRecord {
        PayoutRecord {
            bet_id: Uuid::new_v4(),
            wallet: wallet.to_string(),
            amount,
            tx_hash: None,
        }
    }

    #[test]
    fn token_units_scale_to_18_decimals() {
        assert_eq!(to_token_units(dec!(1)).unwrap(), U256::exp10(18));
        assert_eq!(
            to_token_units(dec!(242.5)).unwrap(),
            U256::from(2425u64) * U256::exp10(17)
        );
        assert_eq!(
            to_token_units(dec!(0.000000000000000001)).unwrap(),
            U256::one()
        );
    }

    #[test]
    fn sub_unit_dust_is_dropped() {
        // Settlement shares can carry more precision than the token does
        let dusty = Decimal::from(1) / Decimal::from(3);
        let units = to_token_units(dusty).unwrap();
        assert_eq!(units, U256::from(333_333_333_333_333_333u64));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        assert!(to_token_units(Decimal::ZERO).is_err());
        assert!(to_token_units(dec!(-5)).is_err());
    }

    #[test]
    fn calldata_layout_matches_the_abi() {
        let payouts = vec![
            record("0x1000000000000000000000000000000000000001", dec!(10)),
            record("0x1000000000000000000000000000000000000002", dec!(20)),
            record("0x1000000000000000000000000000000000000003", dec!(30)),
        ];
        let calldata = batch_calldata(&payouts).unwrap();

        // selector + offset word + length word + 3 * (address word + amount word)
        assert_eq!(calldata.len(), 4 + 32 + 32 + 3 * 64);
        // Single dynamic argument sits right after its offset word
        assert_eq!(calldata[4 + 31], 0x20);
        // Array length word says 3
        assert_eq!(calldata[4 + 32 + 31], 3);
    }

    #[test]
    fn bad_address_fails_the_whole_batch_encoding() {
        let payouts = vec![record("definitely-not-an-address", dec!(10))];
        assert!(batch_calldata(&payouts).is_err());
    }

    #[test]
    fn batch_count_is_a_ceiling_division() {
        assert_eq!(batch_count(0, 200), 0);
        assert_eq!(batch_count(1, 200), 1);
        assert_eq!(batch_count(200, 200), 1);
        assert_eq!(batch_count(201, 200), 2);
        assert_eq!(batch_count(401, 200), 3);
        // A zero batch size must not divide by zero
        assert_eq!(batch_count(10, 0), 10);
    }
}
