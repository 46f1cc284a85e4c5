//! Game event broadcasting
//!
//! Fans out named game events to every connected client or to one
//! identified wallet. The push transport itself (SignalR-style hub, raw
//! WebSocket, SSE) lives outside this crate; it subscribes here and
//! filters envelopes by audience.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{RoundState, Side};

/// Who an envelope is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    All,
    /// A single wallet address
    User(String),
}

/// Named events pushed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GameEvent {
    /// Phase and round snapshot (also sent to a user on connect)
    RoundState(RoundState),
    /// Countdown tick, elapsed seconds rounded to 2 decimals
    Timer(f64),
    /// Race position update
    RaceTick(RaceTickPayload),
    /// Latest feed price
    NewPrice(Decimal),
    /// Bet taken for the current round
    BetAccepted(BetAcceptedPayload),
    /// Bet turned away, with the caller-facing reason
    BetRejected(BetRejectedPayload),
    /// Round outcome plus the reopened state
    RoundResult(RoundResultPayload),
    /// A winner's payout amount
    Payout(PayoutPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceTickPayload {
    pub long_x: Decimal,
    pub short_x: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetAcceptedPayload {
    pub bet_id: Uuid,
    pub round_id: Uuid,
    pub side: Side,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetRejectedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResultPayload {
    pub winning_side: Side,
    pub state: RoundState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutPayload {
    pub amount: Decimal,
}

/// An event with its addressing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub to: Audience,
    pub event: GameEvent,
}

/// Channel for pushing game events out to connected clients
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Envelope>,
}

impl Broadcaster {
    /// Create a new broadcaster with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to receive outbound envelopes
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Send an event to all connected clients
    pub fn to_all(&self, event: GameEvent) {
        // Ignore send errors (no receivers is fine)
        let _ = self.tx.send(Envelope {
            to: Audience::All,
            event,
        });
    }

    /// Send an event to one wallet
    pub fn to_user(&self, wallet: &str, event: GameEvent) {
        let _ = self.tx.send(Envelope {
            to: Audience::User(wallet.to_string()),
            event,
        });
    }

    /// Broadcast the published round state
    pub fn round_state(&self, state: RoundState) {
        self.to_all(GameEvent::RoundState(state));
    }

    /// Broadcast a countdown tick
    pub fn timer(&self, elapsed: f64) {
        self.to_all(GameEvent::Timer(elapsed));
    }

    /// Broadcast a race position update
    pub fn race_tick(&self, long_x: Decimal, short_x: Decimal) {
        self.to_all(GameEvent::RaceTick(RaceTickPayload { long_x, short_x }));
    }

    /// Broadcast the latest feed price
    pub fn new_price(&self, price: Decimal) {
        self.to_all(GameEvent::NewPrice(price));
    }

    /// Tell one wallet its bet was taken
    pub fn bet_accepted(&self, wallet: &str, payload: BetAcceptedPayload) {
        self.to_user(wallet, GameEvent::BetAccepted(payload));
    }

    /// Tell one wallet its bet was turned away
    pub fn bet_rejected(&self, wallet: &str, reason: impl Into<String>) {
        self.to_user(
            wallet,
            GameEvent::BetRejected(BetRejectedPayload {
                reason: reason.into(),
            }),
        );
    }

    /// Broadcast the round outcome
    pub fn round_result(&self, winning_side: Side, state: RoundState) {
        self.to_all(GameEvent::RoundResult(RoundResultPayload {
            winning_side,
            state,
        }));
    }

    /// Tell one wallet its payout amount
    pub fn payout(&self, wallet: &str, amount: Decimal) {
        self.to_user(wallet, GameEvent::Payout(PayoutPayload { amount }));
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
