//! Race position tracking
//!
//! Turns consecutive price deltas into bounded movement on the long and
//! short tracks. Movement per tick is capped so that total travel over the
//! racing window never exceeds the track length, whatever the volatility.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::time::Duration;

use crate::types::Side;

#[derive(Debug, Clone)]
pub struct PositionTracker {
    track_length: Decimal,
    racing_secs: Decimal,
    long_x: Decimal,
    short_x: Decimal,
}

impl PositionTracker {
    pub fn new(track_length: Decimal, racing: Duration) -> Self {
        Self {
            track_length,
            racing_secs: Decimal::from_f64(racing.as_secs_f64()).unwrap_or(Decimal::ONE),
            long_x: Decimal::ZERO,
            short_x: Decimal::ZERO,
        }
    }

    /// Zero both tracks at the start of a racing window.
    pub fn reset(&mut self) {
        self.long_x = Decimal::ZERO;
        self.short_x = Decimal::ZERO;
    }

    pub fn positions(&self) -> (Decimal, Decimal) {
        (self.long_x, self.short_x)
    }

    /// Largest movement allowed for a tick that arrives `dt` after the
    /// previous applied one.
    pub fn max_step(&self, dt: Duration) -> Decimal {
        let dt_secs = Decimal::from_f64(dt.as_secs_f64()).unwrap_or(Decimal::ZERO);
        self.track_length * dt_secs / self.racing_secs
    }

    /// Apply one price delta. Positive deltas advance the long track,
    /// negative the short track, zero moves nothing.
    pub fn apply_delta(&mut self, delta: Decimal, dt: Duration) -> (Decimal, Decimal) {
        let step = delta.abs().min(self.max_step(dt)).round_dp(2);

        if delta > Decimal::ZERO {
            self.long_x = (self.long_x + step).min(self.track_length);
        } else if delta < Decimal::ZERO {
            self.short_x = (self.short_x + step).min(self.track_length);
        }
        self.positions()
    }

    /// Constant forward motion applied to both tracks each frame,
    /// independent of price.
    pub fn apply_ambient(&mut self, step: Decimal) -> (Decimal, Decimal) {
        self.long_x = (self.long_x + step).min(self.track_length);
        self.short_x = (self.short_x + step).min(self.track_length);
        self.positions()
    }

    /// Adjust the final render so the declared winner is visibly ahead by at
    /// least `lead`, clamped to the track length. A tie renders both tracks
    /// at the longer of the two.
    pub fn normalize_final(&mut self, winner: Side, lead: Decimal) {
        match winner {
            Side::Tie => {
                if self.long_x != self.short_x {
                    self.long_x = self.long_x.max(self.short_x);
                    self.short_x = self.long_x;
                }
            }
            Side::Long => {
                if self.long_x < self.short_x {
                    self.long_x = (self.short_x + lead)
                        .clamp(Decimal::ZERO, self.track_length);
                }
            }
            Side::Short => {
                if self.short_x < self.long_x {
                    self.short_x = (self.long_x + lead)
                        .clamp(Decimal::ZERO, self.track_length);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tracker() -> PositionTracker {
        PositionTracker::new(dec!(290), Duration::from_secs(15))
    }

    #[test]
    fn zero_delta_moves_nothing() {
        let mut t = tracker();
        let (long_x, short_x) = t.apply_delta(Decimal::ZERO, Duration::from_millis(100));
        assert_eq!(long_x, Decimal::ZERO);
        assert_eq!(short_x, Decimal::ZERO);
    }

    #[test]
    fn positive_delta_advances_long_only() {
        let mut t = tracker();
        let (long_x, short_x) = t.apply_delta(dec!(0.5), Duration::from_millis(100));
        assert_eq!(long_x, dec!(0.5));
        assert_eq!(short_x, Decimal::ZERO);
    }

    #[test]
    fn negative_delta_advances_short_only() {
        let mut t = tracker();
        let (long_x, short_x) = t.apply_delta(dec!(-0.5), Duration::from_millis(100));
        assert_eq!(long_x, Decimal::ZERO);
        assert_eq!(short_x, dec!(0.5));
    }

    #[test]
    fn movement_never_exceeds_max_step() {
        let mut t = tracker();
        for dt_ms in [10u64, 50, 100, 500, 1000] {
            t.reset();
            let dt = Duration::from_millis(dt_ms);
            let cap = t.max_step(dt);
            // A delta far larger than any cap
            let (long_x, _) = t.apply_delta(dec!(100000), dt);
            assert!(
                long_x <= cap.round_dp(2),
                "dt={}ms long_x={} cap={}",
                dt_ms,
                long_x,
                cap
            );
        }
    }

    #[test]
    fn full_window_of_capped_ticks_travels_at_most_track_length() {
        let mut t = tracker();
        // 150 ticks of 100ms = the whole 15s window, every tick saturated
        for _ in 0..150 {
            t.apply_delta(dec!(100000), Duration::from_millis(100));
        }
        let (long_x, _) = t.positions();
        assert!(long_x <= dec!(290), "long_x={}", long_x);
    }

    #[test]
    fn ambient_moves_both_tracks() {
        let mut t = tracker();
        let (long_x, short_x) = t.apply_ambient(dec!(0.15));
        assert_eq!(long_x, dec!(0.15));
        assert_eq!(short_x, dec!(0.15));
    }

    #[test]
    fn positions_clamp_at_track_length() {
        let mut t = tracker();
        for _ in 0..3000 {
            t.apply_ambient(dec!(0.15));
        }
        let (long_x, short_x) = t.positions();
        assert_eq!(long_x, dec!(290));
        assert_eq!(short_x, dec!(290));
    }

    #[test]
    fn tie_normalization_equalizes_tracks() {
        let mut t = tracker();
        t.apply_delta(dec!(0.4), Duration::from_millis(100));
        t.apply_delta(dec!(-0.9), Duration::from_millis(100));
        t.normalize_final(Side::Tie, dec!(20));
        let (long_x, short_x) = t.positions();
        assert_eq!(long_x, short_x);
        assert_eq!(long_x, dec!(0.9));
    }

    #[test]
    fn long_winner_is_pushed_ahead_when_behind() {
        let mut t = tracker();
        t.apply_delta(dec!(-1.5), Duration::from_millis(100));
        t.normalize_final(Side::Long, dec!(20));
        let (long_x, short_x) = t.positions();
        assert!(long_x >= short_x + dec!(20) || long_x == dec!(290));
        assert_eq!(long_x, dec!(21.5));
    }

    #[test]
    fn winner_already_ahead_is_untouched() {
        let mut t = tracker();
        t.apply_delta(dec!(2.0), Duration::from_millis(200));
        let before = t.positions();
        t.normalize_final(Side::Long, dec!(20));
        assert_eq!(t.positions(), before);
    }

    #[test]
    fn normalized_lead_clamps_to_track_length() {
        let mut t = tracker();
        // Short track nearly at the end, then long declared winner
        for _ in 0..2000 {
            t.apply_delta(dec!(-100000), Duration::from_millis(100));
        }
        t.normalize_final(Side::Long, dec!(20));
        let (long_x, _) = t.positions();
        assert_eq!(long_x, dec!(290));
    }
}
