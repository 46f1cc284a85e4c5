//! On-chain plumbing
//!
//! Payment verification for incoming bets and batched payout submission.
//! Both talk JSON-RPC to the same network; the verifier is read-only, the
//! disburser signs with the operator wallet.

pub mod payout;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, TxHash, U64};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::ChainConfig;
use crate::types::GameError;

/// Seam between the scheduler and payment verification
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BetVerifier: Send + Sync {
    /// Check that `tx_hash` is a mined, confirmed payment from `wallet`
    /// to the game contract on the configured network.
    async fn verify_payment(
        &self,
        tx_hash: &str,
        wallet: &str,
    ) -> std::result::Result<(), GameError>;
}

fn confirmations(head: U64, tx_block: U64) -> u64 {
    if head < tx_block {
        return 0; // reorg moved the head behind the tx
    }
    (head - tx_block).as_u64() + 1
}

/// JSON-RPC payment verifier
pub struct ChainVerifier {
    provider: Provider<Http>,
    contract: Address,
    cfg: ChainConfig,
}

impl ChainVerifier {
    pub fn new(cfg: ChainConfig) -> Result<Self> {
        let provider = Provider::<Http>::try_from(cfg.rpc_url.as_str())
            .context("Failed to build RPC provider")?;
        let contract: Address = cfg
            .contract_address
            .parse()
            .context("Invalid game contract address")?;
        Ok(Self {
            provider,
            contract,
            cfg,
        })
    }

    async fn verify_inner(
        &self,
        tx_hash: &str,
        wallet: &str,
    ) -> std::result::Result<(), GameError> {
        // Input validation happens before any RPC round trip
        let hash: TxHash = tx_hash
            .parse()
            .map_err(|_| GameError::Verification(format!("malformed tx hash '{}'", tx_hash)))?;
        let wallet_addr: Address = wallet
            .parse()
            .map_err(|_| GameError::Verification(format!("malformed wallet address '{}'", wallet)))?;

        let version = self
            .provider
            .get_net_version()
            .await
            .map_err(|e| GameError::Verification(format!("net_version query failed: {}", e)))?;
        if version.trim() != self.cfg.network_id {
            return Err(GameError::Verification(format!(
                "wrong network: node reports {}, expected {}",
                version, self.cfg.network_id
            )));
        }

        // The tx must surface in the mempool within a short window
        let mempool_poll = Duration::from_millis(self.cfg.mempool_poll_ms);
        let mempool_deadline = Duration::from_secs(self.cfg.mempool_timeout_secs);
        let started = Instant::now();
        loop {
            match self.provider.get_transaction(hash).await {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if started.elapsed() >= mempool_deadline {
                        return Err(GameError::Verification(
                            "transaction not seen in the mempool".to_string(),
                        ));
                    }
                    tokio::time::sleep(mempool_poll).await;
                }
                Err(e) => {
                    return Err(GameError::Verification(format!(
                        "mempool query failed: {}",
                        e
                    )));
                }
            }
        }

        // Wait for the receipt; the outer deadline bounds this loop
        let receipt = loop {
            match self.provider.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => break receipt,
                Ok(None) => tokio::time::sleep(mempool_poll).await,
                Err(e) => {
                    return Err(GameError::Verification(format!(
                        "receipt query failed: {}",
                        e
                    )));
                }
            }
        };

        if receipt.status != Some(U64::from(1)) {
            return Err(GameError::Verification(
                "funding transaction reverted".to_string(),
            ));
        }
        if receipt.from != wallet_addr {
            return Err(GameError::Verification(
                "sender does not match the betting wallet".to_string(),
            ));
        }
        match receipt.to {
            Some(to) if to == self.contract => {}
            _ => {
                return Err(GameError::Verification(
                    "recipient is not the game contract".to_string(),
                ));
            }
        }

        let tx_block = receipt.block_number.ok_or_else(|| {
            GameError::Verification("receipt carries no block number".to_string())
        })?;

        let confirm_poll = Duration::from_millis(self.cfg.confirm_poll_ms);
        loop {
            let head = self
                .provider
                .get_block_number()
                .await
                .map_err(|e| GameError::Verification(format!("block query failed: {}", e)))?;
            let confirmed = confirmations(head, tx_block);
            if confirmed >= self.cfg.confirmations {
                break;
            }
            debug!(
                tx = %tx_hash,
                confirmed,
                required = self.cfg.confirmations,
                "Waiting for confirmations"
            );
            tokio::time::sleep(confirm_poll).await;
        }

        info!(tx = %tx_hash, wallet = %wallet, "✅ Payment verified");
        Ok(())
    }
}

#[async_trait]
impl BetVerifier for ChainVerifier {
    async fn verify_payment(
        &self,
        tx_hash: &str,
        wallet: &str,
    ) -> std::result::Result<(), GameError> {
        let deadline = Duration::from_secs(self.cfg.verify_deadline_secs);
        match tokio::time::timeout(deadline, self.verify_inner(tx_hash, wallet)).await {
            Ok(result) => result,
            Err(_) => Err(GameError::Verification(
                "confirmation wait exceeded the deadline".to_string(),
            )),
        }
    }
}
