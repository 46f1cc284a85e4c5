//! Outcome and pari-mutuel settlement
//!
//! The winning side comes from the first and last price samples of the
//! racing window. Winners split the losing pool, minus the house margin,
//! proportionally to stake; every winner at least recovers their stake.

use rust_decimal::Decimal;

use crate::types::{Bet, PayoutRecord, PricePoint, Side};

/// Winning side for a racing window. `None` when no samples arrived at all
/// (feed outage for the entire window).
pub fn race_outcome(samples: &[PricePoint]) -> Option<Side> {
    let first = samples.first()?.price;
    let last = samples.last()?.price;

    Some(if last == first {
        Side::Tie
    } else if last > first {
        Side::Long
    } else {
        Side::Short
    })
}

#[derive(Debug, Clone)]
pub struct SettlementEngine {
    margin: Decimal,
}

impl SettlementEngine {
    pub fn new(margin: Decimal) -> Self {
        Self { margin }
    }

    /// Compute each winner's payout from the round's total pool.
    ///
    /// An empty pool or a round without winners distributes nothing; the
    /// pool stays where it is (push semantics).
    pub fn payouts(&self, total_pool: Decimal, winning_bets: &[Bet]) -> Vec<PayoutRecord> {
        if total_pool <= Decimal::ZERO || winning_bets.is_empty() {
            return Vec::new();
        }

        let total_winning_stake: Decimal = winning_bets.iter().map(|b| b.amount).sum();
        let losing_pool = total_pool - total_winning_stake;
        let distributable = losing_pool * (Decimal::ONE - self.margin);

        winning_bets
            .iter()
            .map(|bet| {
                let mut payout = bet.amount;
                if distributable > Decimal::ZERO && total_winning_stake > Decimal::ZERO {
                    payout += bet.amount / total_winning_stake * distributable;
                }
                PayoutRecord {
                    bet_id: bet.id,
                    wallet: bet.wallet.clone(),
                    amount: payout,
                    tx_hash: None,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn bet(wallet: &str, amount: Decimal, side: Side) -> Bet {
        Bet {
            id: Uuid::new_v4(),
            round_id: Uuid::new_v4(),
            wallet: wallet.to_string(),
            amount,
            side,
            tx_hash: format!("0x{:064x}", 1),
        }
    }

    fn sample(price: Decimal) -> PricePoint {
        PricePoint { ts: 0, price }
    }

    #[test]
    fn rising_price_means_long() {
        let samples = [sample(dec!(100)), sample(dec!(100.5)), sample(dec!(101))];
        assert_eq!(race_outcome(&samples), Some(Side::Long));
    }

    #[test]
    fn falling_price_means_short() {
        let samples = [sample(dec!(101)), sample(dec!(99))];
        assert_eq!(race_outcome(&samples), Some(Side::Short));
    }

    #[test]
    fn flat_window_is_a_tie() {
        let samples = [sample(dec!(100)), sample(dec!(100))];
        assert_eq!(race_outcome(&samples), Some(Side::Tie));
    }

    #[test]
    fn round_trip_back_to_start_is_a_tie() {
        let samples = [sample(dec!(100)), sample(dec!(104)), sample(dec!(100))];
        assert_eq!(race_outcome(&samples), Some(Side::Tie));
    }

    #[test]
    fn single_sample_is_a_tie() {
        assert_eq!(race_outcome(&[sample(dec!(100))]), Some(Side::Tie));
    }

    #[test]
    fn no_samples_no_outcome() {
        assert_eq!(race_outcome(&[]), None);
    }

    #[test]
    fn two_winners_split_losing_pool_proportionally() {
        // pool 1000, winners staked 100 and 300, losing pool 600,
        // margin 5% leaves 570 to distribute
        let engine = SettlementEngine::new(dec!(0.05));
        let winners = [
            bet("0xaaa", dec!(100), Side::Long),
            bet("0xbbb", dec!(300), Side::Long),
        ];

        let payouts = engine.payouts(dec!(1000), &winners);

        assert_eq!(payouts.len(), 2);
        assert_eq!(payouts[0].amount, dec!(242.5));
        assert_eq!(payouts[1].amount, dec!(727.5));

        let total: Decimal = payouts.iter().map(|p| p.amount).sum();
        assert_eq!(total, dec!(970));
        assert!(total <= dec!(1000));
    }

    #[test]
    fn no_winners_distributes_nothing() {
        let engine = SettlementEngine::new(dec!(0.05));
        assert!(engine.payouts(dec!(1000), &[]).is_empty());
    }

    #[test]
    fn empty_pool_distributes_nothing() {
        let engine = SettlementEngine::new(dec!(0.05));
        let winners = [bet("0xaaa", dec!(100), Side::Tie)];
        assert!(engine.payouts(Decimal::ZERO, &winners).is_empty());
    }

    #[test]
    fn winners_only_round_returns_stakes() {
        // Everyone picked the winning side; losing pool is zero
        let engine = SettlementEngine::new(dec!(0.05));
        let winners = [
            bet("0xaaa", dec!(40), Side::Long),
            bet("0xbbb", dec!(60), Side::Long),
        ];

        let payouts = engine.payouts(dec!(100), &winners);

        assert_eq!(payouts[0].amount, dec!(40));
        assert_eq!(payouts[1].amount, dec!(60));
    }

    #[test]
    fn every_payout_covers_its_stake_and_sum_stays_in_pool() {
        let engine = SettlementEngine::new(dec!(0.05));
        let winners = [
            bet("0xaaa", dec!(17.37), Side::Short),
            bet("0xbbb", dec!(250), Side::Short),
            bet("0xccc", dec!(0.01), Side::Short),
        ];
        let total_pool = dec!(1234.56);

        let payouts = engine.payouts(total_pool, &winners);

        for (payout, bet) in payouts.iter().zip(winners.iter()) {
            assert!(
                payout.amount >= bet.amount,
                "payout {} under stake {}",
                payout.amount,
                bet.amount
            );
        }
        let total: Decimal = payouts.iter().map(|p| p.amount).sum();
        assert!(total <= total_pool, "distributed {} of pool {}", total, total_pool);
    }
}
