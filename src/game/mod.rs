//! Round orchestration
//!
//! One scheduler task drives the Betting→Racing→Settling cycle forever.
//! Bettors call [`RoundScheduler::place_bet`] concurrently against the
//! published state; the race consumes the live price stream, applies
//! bounded track movement, settles pari-mutuel and hands payouts to the
//! chain. The scheduler never dies with a bad round; it logs and moves on
//! to the next one.

pub mod settlement;
pub mod track;

use anyhow::Result;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broadcast::{BetAcceptedPayload, Broadcaster, GameEvent};
use crate::chain::payout::PayoutSink;
use crate::chain::BetVerifier;
use crate::config::GameConfig;
use crate::feed::PriceFeed;
use crate::game::settlement::{race_outcome, SettlementEngine};
use crate::game::track::PositionTracker;
use crate::ledger::WagerLedger;
use crate::types::{Bet, GameError, PricePoint, Round, RoundState, Side};

const COUNTDOWN_POLL: Duration = Duration::from_millis(50);
const COUNTDOWN_EPSILON: f64 = 0.005;

/// Resolves once shutdown is requested. A dropped sender counts as shutdown
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Feed one fresh sample into the race. Movement starts with the third
/// sample; the first two only anchor the price path.
fn advance_race(
    tracker: &mut PositionTracker,
    samples: &mut Vec<PricePoint>,
    point: PricePoint,
) -> Option<(Decimal, Decimal)> {
    samples.push(point);
    if samples.len() <= 2 {
        return None;
    }
    let prev = samples[samples.len() - 2];
    let delta = point.price - prev.price;
    let dt = Duration::from_millis((point.ts - prev.ts).max(0) as u64);
    Some(tracker.apply_delta(delta, dt))
}

/// Drives rounds and accepts wagers
pub struct RoundScheduler {
    cfg: GameConfig,
    feed: PriceFeed,
    ledger: Arc<dyn WagerLedger>,
    verifier: Arc<dyn BetVerifier>,
    payouts: Arc<dyn PayoutSink>,
    broadcaster: Broadcaster,
    settlement: SettlementEngine,
    state: Mutex<RoundState>,
}

impl RoundScheduler {
    pub fn new(
        cfg: GameConfig,
        feed: PriceFeed,
        ledger: Arc<dyn WagerLedger>,
        verifier: Arc<dyn BetVerifier>,
        payouts: Arc<dyn PayoutSink>,
        broadcaster: Broadcaster,
    ) -> Self {
        let margin = Decimal::from_f64(cfg.margin).unwrap_or_else(|| Decimal::new(5, 2));
        Self {
            cfg,
            feed,
            ledger,
            verifier,
            payouts,
            broadcaster,
            settlement: SettlementEngine::new(margin),
            state: Mutex::new(RoundState {
                betting_open: false,
                racing: false,
                round_id: Uuid::nil(),
            }),
        }
    }

    /// Current published state, as bettors see it
    pub fn state(&self) -> RoundState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_state(&self, next: RoundState) {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = next;
    }

    /// Push the current round state to one identified wallet, so a client
    /// that just attached renders the live phase without waiting for the
    /// next transition.
    pub fn send_state_snapshot(&self, wallet: &str) {
        self.broadcaster
            .to_user(wallet, GameEvent::RoundState(self.state()));
    }

    /// Run the round cycle until shutdown
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let betting_window = Duration::from_secs(self.cfg.bet_secs);
        let racing_window = Duration::from_secs(self.cfg.racing_secs);
        let cooldown = Duration::from_secs(self.cfg.cooldown_secs);
        let track_length =
            Decimal::from_f64(self.cfg.track_length).unwrap_or_else(|| Decimal::from(290));
        let mut tracker = PositionTracker::new(track_length, racing_window);

        info!(
            bet_secs = self.cfg.bet_secs,
            racing_secs = self.cfg.racing_secs,
            cooldown_secs = self.cfg.cooldown_secs,
            "Round scheduler started"
        );

        loop {
            if *shutdown_rx.borrow() {
                info!("Round scheduler stopped");
                return Ok(());
            }

            // ---- Betting ----
            let round = Round::open_now();
            if let Err(e) = self.ledger.create_round(&round).await {
                error!(error = %e, "Failed to open a round; retrying after cooldown");
                tokio::time::sleep(cooldown).await;
                continue;
            }
            let state = RoundState {
                betting_open: true,
                racing: false,
                round_id: round.id,
            };
            self.publish_state(state);
            self.broadcaster.round_state(state);
            info!(round = %round.id, "🎲 Betting open");

            tokio::select! {
                _ = self.run_countdown(betting_window) => {}
                _ = wait_shutdown(&mut shutdown_rx) => {
                    info!("Round scheduler stopped");
                    return Ok(());
                }
            }

            // ---- Racing ----
            let state = RoundState {
                betting_open: false,
                racing: true,
                round_id: round.id,
            };
            self.publish_state(state);
            self.broadcaster.round_state(state);
            info!(round = %round.id, "🔄 Racing");

            let samples = match self.run_race(&mut tracker, &mut shutdown_rx).await {
                Some(samples) => samples,
                None => {
                    info!("Round scheduler stopped");
                    return Ok(());
                }
            };

            // ---- Settling ----
            self.settle(&round, &samples, &mut tracker).await;

            tokio::select! {
                _ = tokio::time::sleep(cooldown) => {}
                _ = wait_shutdown(&mut shutdown_rx) => {
                    info!("Round scheduler stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Emit countdown ticks for one window. Throttled so each rendered
    /// value goes out once; the terminal tick always lands exactly on the
    /// window length.
    async fn run_countdown(&self, window: Duration) {
        let started = Instant::now();
        let total = window.as_secs_f64();
        let mut last_sent = f64::NEG_INFINITY;

        loop {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed >= total {
                break;
            }
            let rounded = (elapsed * 100.0).round() / 100.0;
            if (rounded - last_sent).abs() > COUNTDOWN_EPSILON {
                self.broadcaster.timer(rounded);
                last_sent = rounded;
            }
            tokio::time::sleep(COUNTDOWN_POLL).await;
        }
        self.broadcaster.timer(total);
    }

    /// Consume the price stream for one racing window. Returns the sampled
    /// price path, or `None` when shutdown interrupted the race.
    async fn run_race(
        &self,
        tracker: &mut PositionTracker,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<Vec<PricePoint>> {
        tracker.reset();
        self.broadcaster.race_tick(Decimal::ZERO, Decimal::ZERO);

        let mut stream = self.feed.subscribe();
        let mut samples: Vec<PricePoint> = Vec::new();
        // The race anchors on the last known price, not the next tick
        if let Some(point) = self.feed.current_price() {
            samples.push(point);
        }

        let ambient_step = Decimal::from_f64(self.cfg.ambient_step).unwrap_or_default();
        let frame_every = Duration::from_millis(self.cfg.frame_interval_ms.max(1));
        let mut frames = tokio::time::interval_at(Instant::now() + frame_every, frame_every);
        // Missed frames fire in a burst so ambient motion keeps pace with
        // wall time
        frames.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let countdown = self.run_countdown(Duration::from_secs(self.cfg.racing_secs));
        tokio::pin!(countdown);

        let mut feed_live = true;
        loop {
            tokio::select! {
                _ = &mut countdown => break,

                maybe_tick = stream.next_tick(), if feed_live => match maybe_tick {
                    Some(point) => {
                        if let Some((long_x, short_x)) =
                            advance_race(tracker, &mut samples, point)
                        {
                            self.broadcaster.race_tick(long_x, short_x);
                        }
                    }
                    None => {
                        warn!("Price stream ended mid-race; continuing on ambient motion");
                        feed_live = false;
                    }
                },

                _ = frames.tick() => {
                    let (long_x, short_x) = tracker.apply_ambient(ambient_step);
                    self.broadcaster.race_tick(long_x, short_x);
                }

                _ = wait_shutdown(shutdown_rx) => return None,
            }
        }
        Some(samples)
    }

    /// Resolve the race, persist the outcome and pay the winners
    async fn settle(&self, round: &Round, samples: &[PricePoint], tracker: &mut PositionTracker) {
        let winner = match race_outcome(samples) {
            Some(side) => side,
            None => {
                warn!(round = %round.id, "No price samples this race; settling as a tie");
                Side::Tie
            }
        };

        let lead = Decimal::from_f64(self.cfg.lead_margin).unwrap_or_default();
        tracker.normalize_final(winner, lead);
        let (long_x, short_x) = tracker.positions();
        self.broadcaster.race_tick(long_x, short_x);

        self.publish_state(RoundState {
            betting_open: false,
            racing: false,
            round_id: round.id,
        });

        if let Err(e) = self.ledger.record_result(round.id, winner).await {
            error!(round = %round.id, error = %e, "Failed to record the round result");
        }

        // The wire state reopens betting with the settled round id still
        // attached; the published state stays closed until the next round
        // id lands, so a stale bet fails the round check first.
        self.broadcaster.round_result(
            winner,
            RoundState {
                betting_open: true,
                racing: false,
                round_id: round.id,
            },
        );
        info!(round = %round.id, winner = %winner, samples = samples.len(), "🏁 Round settled");

        let bets = match self.ledger.bets_for_round(round.id).await {
            Ok(bets) => bets,
            Err(e) => {
                error!(round = %round.id, error = %e, "Failed to load bets; no payouts this round");
                return;
            }
        };
        if bets.is_empty() {
            return;
        }

        let total_pool: Decimal = bets.iter().map(|b| b.amount).sum();
        let winning_bets: Vec<Bet> = bets.iter().filter(|b| b.side == winner).cloned().collect();
        let payouts = self.settlement.payouts(total_pool, &winning_bets);
        info!(
            round = %round.id,
            pool = %total_pool,
            bets = bets.len(),
            winners = payouts.len(),
            "Settlement computed"
        );
        if payouts.is_empty() {
            return;
        }

        let paid = self.payouts.disburse(payouts).await;
        for record in &paid {
            self.broadcaster.payout(&record.wallet, record.amount);
        }
    }

    /// Take one wager through the full gate: round id, phase, side, amount,
    /// duplicate check, on-chain verification, persistence. The outcome is
    /// pushed to the bettor either way.
    pub async fn place_bet(
        &self,
        round_id: Uuid,
        wallet: &str,
        side: &str,
        amount: Decimal,
        tx_hash: &str,
    ) -> std::result::Result<Bet, GameError> {
        match self
            .try_place_bet(round_id, wallet, side, amount, tx_hash)
            .await
        {
            Ok(bet) => {
                self.broadcaster.bet_accepted(
                    wallet,
                    BetAcceptedPayload {
                        bet_id: bet.id,
                        round_id: bet.round_id,
                        side: bet.side,
                        amount: bet.amount,
                    },
                );
                info!(
                    round = %bet.round_id,
                    wallet = %wallet,
                    side = %bet.side,
                    amount = %bet.amount,
                    "✅ Bet accepted"
                );
                Ok(bet)
            }
            Err(e) => {
                self.broadcaster.bet_rejected(wallet, e.to_string());
                warn!(round = %round_id, wallet = %wallet, reason = %e, "Bet rejected");
                Err(e)
            }
        }
    }

    async fn try_place_bet(
        &self,
        round_id: Uuid,
        wallet: &str,
        side: &str,
        amount: Decimal,
        tx_hash: &str,
    ) -> std::result::Result<Bet, GameError> {
        let state = self.state();
        if round_id != state.round_id {
            return Err(GameError::RoundFinished);
        }
        if !state.betting_open {
            return Err(GameError::BettingClosed);
        }
        // Tie is an outcome, not a biddable side
        let side = match Side::from_str(side) {
            Some(Side::Tie) | None => return Err(GameError::InvalidSide(side.to_string())),
            Some(side) => side,
        };
        if amount <= Decimal::ZERO {
            return Err(GameError::InvalidAmount(amount));
        }
        if self
            .ledger
            .has_bet(round_id, wallet)
            .await
            .map_err(|e| GameError::Ledger(e.to_string()))?
        {
            return Err(GameError::DuplicateBet);
        }

        self.verifier.verify_payment(tx_hash, wallet).await?;

        // The confirmation wait can outlive the betting window. A bet that
        // verified late still lands as long as its round is the one it
        // paid into.
        if round_id != self.state().round_id {
            return Err(GameError::RoundFinished);
        }

        let bet = Bet {
            id: Uuid::new_v4(),
            round_id,
            wallet: wallet.to_string(),
            amount,
            side,
            tx_hash: tx_hash.to_string(),
        };
        self.ledger.add_bet(&bet).await?;
        Ok(bet)
    }
}
