//! Durable wager ledger
//!
//! Rounds and bets land in append-only CSV files under the data directory,
//! one file per day. A round row is written twice: once when the round
//! opens (empty winning side) and once at settlement. Startup replays the
//! round files so `round_history` spans restarts; bets are indexed in
//! memory only for the rounds still in play.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use csv::{ReaderBuilder, WriterBuilder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Bet, GameError, Round, Side};

/// Settled rounds kept in memory for history paging
const HISTORY_CAP: usize = 10_000;

/// One page of settled-round outcomes, newest first
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub items: Vec<Option<Side>>,
    pub has_more: bool,
}

/// Storage seam between the scheduler and durable state
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WagerLedger: Send + Sync {
    /// Register a freshly opened round
    async fn create_round(&self, round: &Round) -> Result<()>;

    /// Record the outcome; the round leaves the open set
    async fn record_result(&self, round_id: Uuid, winning_side: Side) -> Result<()>;

    /// Persist an accepted bet. One bet per wallet per round
    async fn add_bet(&self, bet: &Bet) -> std::result::Result<(), GameError>;

    /// Whether the wallet already holds a bet in the round
    async fn has_bet(&self, round_id: Uuid, wallet: &str) -> Result<bool>;

    /// All bets of a round, in acceptance order
    async fn bets_for_round(&self, round_id: Uuid) -> Result<Vec<Bet>>;

    /// Settled-round outcomes, newest first
    async fn round_history(&self, page: usize) -> Result<HistoryPage>;
}

/// Round row as stored on disk. `winning_side` stays empty until settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoundRow {
    ts: i64,
    round_id: String,
    created_at: i64,
    winning_side: String,
}

/// Bet row as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BetRow {
    ts: i64,
    bet_id: String,
    round_id: String,
    wallet: String,
    amount: Decimal,
    side: String,
    tx_hash: String,
}

impl From<&Bet> for BetRow {
    fn from(bet: &Bet) -> Self {
        Self {
            ts: Utc::now().timestamp_millis(),
            bet_id: bet.id.to_string(),
            round_id: bet.round_id.to_string(),
            wallet: bet.wallet.clone(),
            amount: bet.amount,
            side: bet.side.as_str().to_string(),
            tx_hash: bet.tx_hash.clone(),
        }
    }
}

#[derive(Default)]
struct LedgerState {
    open_rounds: HashMap<Uuid, Round>,
    bets_by_round: HashMap<Uuid, Vec<Bet>>,
    /// Wallet keys are lowercased; addresses differ only in checksum casing
    wallets_by_round: HashMap<Uuid, HashSet<String>>,
    /// Ascending settle order, capped at HISTORY_CAP
    settled: Vec<Option<Side>>,
}

/// CSV-backed ledger
pub struct CsvLedger {
    round_writer: AsyncRwLock<csv::Writer<std::fs::File>>,
    bet_writer: AsyncRwLock<csv::Writer<std::fs::File>>,
    state: AsyncRwLock<LedgerState>,
    page_size: usize,
}

impl CsvLedger {
    pub fn new(data_dir: &str, page_size: usize) -> Result<Self> {
        let data_dir = PathBuf::from(data_dir);
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        fs::create_dir_all(data_dir.join("rounds"))?;
        fs::create_dir_all(data_dir.join("bets"))?;

        let today = Utc::now().format("%Y-%m-%d");
        let round_writer =
            Self::create_writer(&data_dir.join("rounds"), &format!("rounds_{}.csv", today))?;
        let bet_writer =
            Self::create_writer(&data_dir.join("bets"), &format!("bets_{}.csv", today))?;

        let settled = Self::replay_rounds(&data_dir.join("rounds"))?;
        info!(
            data_dir = %data_dir.display(),
            settled_rounds = settled.len(),
            "Ledger loaded"
        );

        Ok(Self {
            round_writer: AsyncRwLock::new(round_writer),
            bet_writer: AsyncRwLock::new(bet_writer),
            state: AsyncRwLock::new(LedgerState {
                settled,
                ..LedgerState::default()
            }),
            page_size,
        })
    }

    fn create_writer(dir: &Path, filename: &str) -> Result<csv::Writer<std::fs::File>> {
        let path = dir.join(filename);
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open CSV file")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }

    /// Rebuild the settled-round timeline from every round file on disk
    fn replay_rounds(dir: &Path) -> Result<Vec<Option<Side>>> {
        let mut files: Vec<PathBuf> = Vec::new();
        if dir.exists() {
            for entry in
                fs::read_dir(dir).with_context(|| format!("Failed reading {}", dir.display()))?
            {
                let path = entry?.path();
                let is_round_csv = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("rounds_") && n.ends_with(".csv"))
                    .unwrap_or(false);
                if path.is_file() && is_round_csv {
                    files.push(path);
                }
            }
        }
        // Dated names sort chronologically
        files.sort();

        let mut settled = Vec::new();
        for path in files {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
            for result in reader.deserialize::<RoundRow>() {
                match result {
                    Ok(row) if !row.winning_side.is_empty() => {
                        settled.push(Side::from_str(&row.winning_side));
                    }
                    Ok(_) => {} // open-round row
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "Skipping malformed round row");
                    }
                }
            }
        }

        if settled.len() > HISTORY_CAP {
            settled.drain(..settled.len() - HISTORY_CAP);
        }
        Ok(settled)
    }
}

#[async_trait]
impl WagerLedger for CsvLedger {
    async fn create_round(&self, round: &Round) -> Result<()> {
        let row = RoundRow {
            ts: Utc::now().timestamp_millis(),
            round_id: round.id.to_string(),
            created_at: round.created_at.timestamp_millis(),
            winning_side: String::new(),
        };
        {
            let mut writer = self.round_writer.write().await;
            writer
                .serialize(&row)
                .context("Failed to write round record")?;
            writer.flush().context("Failed to flush round writer")?;
        }

        let mut state = self.state.write().await;
        state.open_rounds.insert(round.id, round.clone());

        // Bets from earlier rounds are no longer queried once a new one opens
        let LedgerState {
            open_rounds,
            bets_by_round,
            wallets_by_round,
            ..
        } = &mut *state;
        bets_by_round.retain(|id, _| open_rounds.contains_key(id));
        wallets_by_round.retain(|id, _| open_rounds.contains_key(id));
        Ok(())
    }

    async fn record_result(&self, round_id: Uuid, winning_side: Side) -> Result<()> {
        let mut state = self.state.write().await;
        let created_at = state
            .open_rounds
            .get(&round_id)
            .map(|r| r.created_at.timestamp_millis())
            .unwrap_or_default();

        let row = RoundRow {
            ts: Utc::now().timestamp_millis(),
            round_id: round_id.to_string(),
            created_at,
            winning_side: winning_side.as_str().to_string(),
        };
        {
            let mut writer = self.round_writer.write().await;
            writer
                .serialize(&row)
                .context("Failed to write round result")?;
            writer.flush().context("Failed to flush round writer")?;
        }

        state.open_rounds.remove(&round_id);
        state.settled.push(Some(winning_side));
        if state.settled.len() > HISTORY_CAP {
            state.settled.remove(0);
        }
        Ok(())
    }

    async fn add_bet(&self, bet: &Bet) -> std::result::Result<(), GameError> {
        let wallet_key = bet.wallet.to_lowercase();

        let mut state = self.state.write().await;
        let already = state
            .wallets_by_round
            .get(&bet.round_id)
            .map(|wallets| wallets.contains(&wallet_key))
            .unwrap_or(false);
        if already {
            return Err(GameError::DuplicateBet);
        }

        {
            let mut writer = self.bet_writer.write().await;
            writer
                .serialize(BetRow::from(bet))
                .map_err(|e| GameError::Ledger(e.to_string()))?;
            writer
                .flush()
                .map_err(|e| GameError::Ledger(e.to_string()))?;
        }

        // Indexed only after the row is durable
        state
            .wallets_by_round
            .entry(bet.round_id)
            .or_default()
            .insert(wallet_key);
        state
            .bets_by_round
            .entry(bet.round_id)
            .or_default()
            .push(bet.clone());
        Ok(())
    }

    async fn has_bet(&self, round_id: Uuid, wallet: &str) -> Result<bool> {
        let wallet_key = wallet.to_lowercase();
        let state = self.state.read().await;
        Ok(state
            .wallets_by_round
            .get(&round_id)
            .map(|wallets| wallets.contains(&wallet_key))
            .unwrap_or(false))
    }

    async fn bets_for_round(&self, round_id: Uuid) -> Result<Vec<Bet>> {
        let state = self.state.read().await;
        Ok(state
            .bets_by_round
            .get(&round_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn round_history(&self, page: usize) -> Result<HistoryPage> {
        let state = self.state.read().await;
        let total = state.settled.len();
        let items: Vec<Option<Side>> = state
            .settled
            .iter()
            .rev()
            .skip(page.saturating_mul(self.page_size))
            .take(self.page_size)
            .copied()
            .collect();
        let has_more = (page + 1).saturating_mul(self.page_size) < total;
        Ok(HistoryPage { items, has_more })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("coinrace_ledger_{}_{}", test_name, Uuid::new_v4()))
    }

    fn sample_bet(round_id: Uuid, wallet: &str, amount: Decimal) -> Bet {
        Bet {
            id: Uuid::new_v4(),
            round_id,
            wallet: wallet.to_string(),
            amount,
            side: Side::Long,
            tx_hash: format!("0x{:064x}", 0xbeefu64),
        }
    }

    #[tokio::test]
    async fn one_bet_per_wallet_per_round_case_insensitive() {
        let data_dir = temp_data_dir("one_per_wallet");
        let ledger = CsvLedger::new(data_dir.to_str().unwrap(), 10).unwrap();

        let round = Round::open_now();
        ledger.create_round(&round).await.unwrap();

        let first = sample_bet(round.id, "0xAbCd000000000000000000000000000000000001", dec!(10));
        ledger.add_bet(&first).await.unwrap();
        assert!(ledger
            .has_bet(round.id, "0xABCD000000000000000000000000000000000001")
            .await
            .unwrap());

        let second = sample_bet(round.id, "0xabcd000000000000000000000000000000000001", dec!(5));
        match ledger.add_bet(&second).await {
            Err(GameError::DuplicateBet) => {}
            other => panic!("expected DuplicateBet, got {:?}", other),
        }

        // A different round accepts the same wallet again
        let next = Round::open_now();
        ledger.create_round(&next).await.unwrap();
        ledger
            .add_bet(&sample_bet(next.id, &first.wallet, dec!(3)))
            .await
            .unwrap();

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn bets_come_back_in_acceptance_order() {
        let data_dir = temp_data_dir("bet_order");
        let ledger = CsvLedger::new(data_dir.to_str().unwrap(), 10).unwrap();

        let round = Round::open_now();
        ledger.create_round(&round).await.unwrap();
        for (i, wallet) in ["0xaa01", "0xaa02", "0xaa03"].iter().enumerate() {
            ledger
                .add_bet(&sample_bet(round.id, wallet, Decimal::from(i as u64 + 1)))
                .await
                .unwrap();
        }

        let bets = ledger.bets_for_round(round.id).await.unwrap();
        assert_eq!(bets.len(), 3);
        assert_eq!(bets[0].wallet, "0xaa01");
        assert_eq!(bets[2].amount, dec!(3));

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn history_pages_newest_first() {
        let data_dir = temp_data_dir("history_pages");
        let ledger = CsvLedger::new(data_dir.to_str().unwrap(), 10).unwrap();

        for i in 0..25 {
            let round = Round::open_now();
            ledger.create_round(&round).await.unwrap();
            let side = if i == 24 { Side::Short } else { Side::Long };
            ledger.record_result(round.id, side).await.unwrap();
        }

        let page0 = ledger.round_history(0).await.unwrap();
        assert_eq!(page0.items.len(), 10);
        assert_eq!(page0.items[0], Some(Side::Short)); // most recent settle
        assert!(page0.has_more);

        let page2 = ledger.round_history(2).await.unwrap();
        assert_eq!(page2.items.len(), 5);
        assert!(!page2.has_more);

        let page9 = ledger.round_history(9).await.unwrap();
        assert!(page9.items.is_empty());
        assert!(!page9.has_more);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn history_survives_a_restart() {
        let data_dir = temp_data_dir("restart");

        {
            let ledger = CsvLedger::new(data_dir.to_str().unwrap(), 10).unwrap();
            for _ in 0..3 {
                let round = Round::open_now();
                ledger.create_round(&round).await.unwrap();
                ledger.record_result(round.id, Side::Tie).await.unwrap();
            }
        }

        let reloaded = CsvLedger::new(data_dir.to_str().unwrap(), 10).unwrap();
        let page = reloaded.round_history(0).await.unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(page.items.iter().all(|s| *s == Some(Side::Tie)));
        assert!(!page.has_more);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn round_file_carries_open_and_settle_rows() {
        let data_dir = temp_data_dir("round_rows");
        let ledger = CsvLedger::new(data_dir.to_str().unwrap(), 10).unwrap();

        let round = Round::open_now();
        ledger.create_round(&round).await.unwrap();
        ledger.record_result(round.id, Side::Long).await.unwrap();

        let today = Utc::now().format("%Y-%m-%d");
        let path = data_dir.join("rounds").join(format!("rounds_{}.csv", today));
        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert!(lines
            .next()
            .unwrap_or_default()
            .starts_with("ts,round_id,created_at,winning_side"));
        assert_eq!(content.matches(&round.id.to_string()).count(), 2);
        assert!(content.contains(",long"));

        let _ = fs::remove_dir_all(&data_dir);
    }
}
