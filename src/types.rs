//! Core types used throughout CoinRace
//!
//! Defines the round/bet domain model shared by the scheduler, ledger,
//! chain boundary and broadcast layer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which way a wager points over the racing window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
    Tie,
}

impl Side {
    /// Parse from the wire representation ("long" / "short" / "tie")
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "long" => Some(Side::Long),
            "short" => Some(Side::Short),
            "tie" => Some(Side::Tie),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
            Side::Tie => "tie",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Published snapshot of the scheduler state, readable by concurrent callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundState {
    /// Whether `place_bet` is currently accepted
    pub betting_open: bool,
    /// Whether the racing window is in progress
    pub racing: bool,
    /// Id of the current round
    pub round_id: Uuid,
}

/// One cycle of Betting→Racing→Settling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    /// Time-ordered unique id (UUIDv7)
    pub id: Uuid,
    /// When the round was opened
    pub created_at: DateTime<Utc>,
    /// Set once, at settlement
    pub winning_side: Option<Side>,
}

impl Round {
    pub fn open_now() -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v7(uuid::Timestamp::from_unix(
                uuid::NoContext,
                created_at.timestamp() as u64,
                created_at.timestamp_subsec_nanos(),
            )),
            created_at,
            winning_side: None,
        }
    }
}

/// A verified, persisted wager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    /// Unique id
    pub id: Uuid,
    /// Round this bet belongs to (no back pointer; lookups go by query)
    pub round_id: Uuid,
    /// Bettor wallet address, also the payout destination
    pub wallet: String,
    /// Stake amount
    pub amount: Decimal,
    /// Chosen side
    pub side: Side,
    /// Hash of the funding transaction that was verified on-chain
    pub tx_hash: String,
}

/// A price sample from the feed, local arrival time in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub ts: i64,
    pub price: Decimal,
}

impl PricePoint {
    pub fn now(price: Decimal) -> Self {
        Self {
            ts: Utc::now().timestamp_millis(),
            price,
        }
    }
}

/// One winner's computed share, consumed within a single settling phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRecord {
    /// Bet that earned this payout
    pub bet_id: Uuid,
    /// Destination wallet
    pub wallet: String,
    /// Stake plus share of the distributable pool
    pub amount: Decimal,
    /// Hash of the batch transaction, once disbursed
    pub tx_hash: Option<String>,
}

/// Why a bet submission was turned away, in caller-facing terms
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("round already finished")]
    RoundFinished,
    #[error("bets are closed now")]
    BettingClosed,
    #[error("unknown side '{0}'")]
    InvalidSide(String),
    #[error("bet amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("wallet already has a bet in this round")]
    DuplicateBet,
    #[error("payment verification failed: {0}")]
    Verification(String),
    #[error("ledger rejected the bet: {0}")]
    Ledger(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parses_case_insensitively() {
        assert_eq!(Side::from_str("LONG"), Some(Side::Long));
        assert_eq!(Side::from_str("short"), Some(Side::Short));
        assert_eq!(Side::from_str("Tie"), Some(Side::Tie));
        assert_eq!(Side::from_str("sideways"), None);
    }

    #[test]
    fn round_ids_are_time_ordered() {
        let a = Round::open_now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Round::open_now();
        assert!(b.id > a.id, "later round must sort after earlier one");
    }

    #[test]
    fn rejection_reasons_read_as_wire_messages() {
        assert_eq!(GameError::RoundFinished.to_string(), "round already finished");
        assert_eq!(GameError::BettingClosed.to_string(), "bets are closed now");
    }
}
