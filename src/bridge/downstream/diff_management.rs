use super::Downstream;
use crate::{
    bridge::{
        codec::{Message, Notification},
        pow::{pow2_ceil, pow2_round},
    },
    config::BridgeConfig,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// How often session workers ask their controller for a new difficulty.
pub const VARDIFF_TICK: Duration = Duration::from_secs(10);

/// Shortest window an estimate is computed over.
const MIN_ADJUST_INTERVAL: Duration = Duration::from_secs(30);
/// Shares needed before a window shorter than `MAX_WINDOW` is trusted.
const MIN_SAMPLES: u32 = 10;
/// A window this long is evaluated whatever its share count, so an idle miner still decays.
const MAX_WINDOW: Duration = Duration::from_secs(120);
/// Bounds on the per adjustment change factor.
const MAX_STEP_DOWN: f64 = 0.5;
const MAX_STEP_UP: f64 = 2.0;

/// Per session control loop steering the share rate towards `shares_per_min`.
#[derive(Debug, Clone)]
pub struct VarDiff {
    difficulty: f64,
    min_difficulty: f64,
    target_shares_per_min: f64,
    tolerance: f64,
    pow2_clamp: bool,
    share_count: u32,
    window_start: Instant,
    last_adjustment: Instant,
}

impl VarDiff {
    pub fn new(config: &BridgeConfig, now: Instant) -> Self {
        let min_difficulty = if config.pow2_clamp {
            pow2_ceil(config.min_share_diff)
        } else {
            config.min_share_diff
        };
        Self {
            difficulty: min_difficulty,
            min_difficulty,
            target_shares_per_min: config.shares_per_min as f64,
            tolerance: config.var_diff_tolerance,
            pow2_clamp: config.pow2_clamp,
            share_count: 0,
            window_start: now,
            last_adjustment: now,
        }
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    /// Counts a share done at the current difficulty, valid or low difficulty alike.
    pub fn record_share(&mut self) {
        self.share_count = self.share_count.saturating_add(1);
    }

    /// Shares per minute observed in the current window.
    pub fn observed_rate(&self, now: Instant) -> f64 {
        let minutes = now.saturating_duration_since(self.window_start).as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        self.share_count as f64 / minutes
    }

    fn reset_window(&mut self, now: Instant) {
        self.share_count = 0;
        self.window_start = now;
    }

    /// Returns the new difficulty if the observed rate left the tolerance band.
    pub fn try_adjust(&mut self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < MIN_ADJUST_INTERVAL {
            return None;
        }
        if self.share_count < MIN_SAMPLES && elapsed < MAX_WINDOW {
            return None;
        }
        let ratio = self.observed_rate(now) / self.target_shares_per_min;
        self.reset_window(now);
        if (ratio - 1.0).abs() <= self.tolerance {
            return None;
        }

        let factor = ratio.clamp(MAX_STEP_DOWN, MAX_STEP_UP);
        let mut next = f64::max(self.difficulty * factor, self.min_difficulty);
        if self.pow2_clamp {
            next = pow2_round(next);
            if next < self.min_difficulty {
                next = pow2_ceil(self.min_difficulty);
            }
        }
        if next == self.difficulty {
            return None;
        }
        self.difficulty = next;
        self.last_adjustment = now;
        Some(next)
    }

    pub fn since_last_adjustment(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_adjustment)
    }
}

impl Downstream {
    /// Runs the session's controller and returns the `mining.set_difficulty` to send if the
    /// difficulty changed.
    pub(super) fn try_update_difficulty(&mut self, now: Instant) -> Option<Message> {
        if !self.is_authorized() {
            return None;
        }
        let next = self.vardiff.as_mut()?.try_adjust(now)?;
        info!(
            "Downstream {}: difficulty {} -> {}",
            self.worker_name(),
            self.difficulty,
            next
        );
        self.set_difficulty(next);
        Some(Notification::set_difficulty(next).into())
    }

    pub(super) fn log_vardiff_stats(&self, now: Instant) {
        match &self.vardiff {
            Some(vardiff) => info!(
                "Vardiff {} | diff {} | {:.2} shares/min in window | last change {:?} ago",
                self.worker_name(),
                vardiff.difficulty(),
                vardiff.observed_rate(now),
                vardiff.since_last_adjustment(now)
            ),
            None => warn!(
                "Vardiff stats requested for {} but difficulty follows the network",
                self.worker_name()
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(min: f64, shares_per_min: u32, pow2_clamp: bool) -> BridgeConfig {
        BridgeConfig {
            min_share_diff: min,
            shares_per_min,
            pow2_clamp,
            ..Default::default()
        }
    }

    /// Feeds one window of shares from a miner whose rate at difficulty `d` is `work / d`
    /// shares per minute, then asks for an adjustment.
    fn run_window(vardiff: &mut VarDiff, now: &mut Instant, work: f64, window: Duration) {
        let shares = (work / vardiff.difficulty() * window.as_secs_f64() / 60.0).round() as u32;
        for _ in 0..shares {
            vardiff.record_share();
        }
        *now += window;
        vardiff.try_adjust(*now);
    }

    #[test]
    fn converges_to_target_rate() {
        let start = Instant::now();
        let mut now = start;
        let mut vardiff = VarDiff::new(&config(4.0, 20, false), start);
        // equilibrium difficulty is 1000
        let work = 20.0 * 1000.0;
        for _ in 0..20 {
            run_window(&mut vardiff, &mut now, work, Duration::from_secs(60));
        }
        let rate = work / vardiff.difficulty();
        assert!(
            (rate / 20.0 - 1.0).abs() <= 0.2,
            "rate {} at difficulty {}",
            rate,
            vardiff.difficulty()
        );
        // stays put once inside the band
        let settled = vardiff.difficulty();
        run_window(&mut vardiff, &mut now, work, Duration::from_secs(60));
        assert_eq!(vardiff.difficulty(), settled);
    }

    #[test]
    fn never_drops_below_floor() {
        let start = Instant::now();
        let mut now = start;
        let mut vardiff = VarDiff::new(&config(4.0, 20, false), start);
        for _ in 0..10 {
            run_window(&mut vardiff, &mut now, 1.0, Duration::from_secs(120));
            assert!(vardiff.difficulty() >= 4.0);
        }
        assert_eq!(vardiff.difficulty(), 4.0);
    }

    #[test]
    fn change_factor_is_clamped() {
        let start = Instant::now();
        let mut vardiff = VarDiff::new(&config(4.0, 20, false), start);
        for _ in 0..1000 {
            vardiff.record_share();
        }
        assert_eq!(vardiff.try_adjust(start + Duration::from_secs(60)), Some(8.0));
    }

    #[test]
    fn waits_for_samples_or_long_window() {
        let start = Instant::now();
        let mut vardiff = VarDiff::new(&config(4.0, 20, false), start);
        for _ in 0..1000 {
            vardiff.record_share();
        }
        assert_eq!(vardiff.try_adjust(start + Duration::from_secs(60)), Some(8.0));

        vardiff.record_share();
        assert_eq!(vardiff.try_adjust(start + Duration::from_secs(70)), None);
        assert_eq!(vardiff.try_adjust(start + Duration::from_secs(120)), None);
        // one share in two minutes: decays by the maximum step
        assert_eq!(
            vardiff.try_adjust(start + Duration::from_secs(180)),
            Some(4.0)
        );
    }

    #[test]
    fn pow2_clamp_rounds_to_nearest_power_and_respects_floor() {
        let start = Instant::now();
        let mut vardiff = VarDiff::new(&config(3.0, 20, true), start);
        assert_eq!(vardiff.difficulty(), 4.0);
        // 26 shares/min: 5.2 is closer to 4 than to 8
        for _ in 0..26 {
            vardiff.record_share();
        }
        assert_eq!(vardiff.try_adjust(start + Duration::from_secs(60)), None);
        // 38 shares/min: 7.6 rounds up to 8
        for _ in 0..38 {
            vardiff.record_share();
        }
        assert_eq!(
            vardiff.try_adjust(start + Duration::from_secs(120)),
            Some(8.0)
        );
        // idle miner decays back to the floor, never below it
        assert_eq!(
            vardiff.try_adjust(start + Duration::from_secs(240)),
            Some(4.0)
        );
        assert_eq!(vardiff.try_adjust(start + Duration::from_secs(360)), None);
    }

    #[test]
    fn pow2_clamp_converges_from_just_under_double_rate() {
        let start = Instant::now();
        let mut now = start;
        let mut vardiff = VarDiff::new(&config(4.0, 20, true), start);
        // 38 shares/min at difficulty 4
        let work = 38.0 * 4.0;
        for _ in 0..30 {
            run_window(&mut vardiff, &mut now, work, Duration::from_secs(60));
        }
        assert_eq!(vardiff.difficulty(), 8.0);
        let rate = work / vardiff.difficulty();
        assert!((rate / 20.0 - 1.0).abs() <= 0.2, "rate {}", rate);
    }
}
