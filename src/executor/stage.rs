//! Stage interpolation and arrival accounting, shared by the ramping and
//! arrival-rate executors.
//!
//! A ramping profile is a list of [`Stage`]s. Between stage boundaries the
//! level (VU count or arrival rate) is linearly interpolated from the
//! previous level to the stage target. The arrival-rate executors convert
//! the continuous rate into discrete iteration-start events once per
//! governor tick; the fractional remainder is carried across ticks so small
//! per-tick contributions are never lost and the long-run average matches
//! the interpolated rate.

use std::time::Duration;

/// One segment of a ramping profile: ramp linearly to `target` over
/// `duration`.
///
/// A zero-duration stage jumps the level to `target` instantly. That is how
/// starting levels (`start_rate`, `start_vus`) are injected, and how spike
/// profiles express an immediate step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stage {
    pub duration: Duration,
    /// Target level: VUs for ramping-vus, iteration starts per time unit
    /// for ramping-arrival-rate.
    pub target: f64,
}

impl Stage {
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }
}

/// Sum of all stage durations.
pub(crate) fn total_duration(stages: &[Stage]) -> Duration {
    stages.iter().map(|s| s.duration).sum()
}

/// Linear interpolation between two levels, clamped at the endpoint.
pub(crate) fn lerp(start: f64, end: f64, elapsed: Duration, duration: Duration) -> f64 {
    if duration.is_zero() {
        return end;
    }
    let t = (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0);
    start + (end - start) * t
}

/// The profile level at `elapsed`, starting from `initial` before the
/// first stage. Past the final stage the level holds at its target.
pub(crate) fn level_at(initial: f64, stages: &[Stage], elapsed: Duration) -> f64 {
    let mut level = initial;
    let mut offset = Duration::ZERO;
    for stage in stages {
        if stage.duration.is_zero() {
            level = stage.target;
            continue;
        }
        let end = offset + stage.duration;
        if elapsed < end {
            return lerp(level, stage.target, elapsed - offset, stage.duration);
        }
        level = stage.target;
        offset = end;
    }
    level
}

/// How many iteration-start events to release this tick.
///
/// Interpolates the rate at `elapsed` within the stage, converts it to a
/// per-tick quantity, and carries the fractional part to the next tick.
/// Returns `(events, next_fractional)`.
pub(crate) fn arrivals_for_tick(
    elapsed: Duration,
    stage_duration: Duration,
    start_rate: f64,
    end_rate: f64,
    fractional: f64,
    tick: Duration,
) -> (u64, f64) {
    let rate = lerp(start_rate, end_rate, elapsed, stage_duration);
    let add_f = rate * tick.as_secs_f64();
    let total_f = (add_f + fractional).floor();
    let fractional = (add_f + fractional) - total_f;
    let total = if total_f < 0.0 {
        0
    } else if total_f >= u64::MAX as f64 {
        u64::MAX
    } else {
        total_f as u64
    };
    (total, fractional)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linearity() {
        let mut end_rate = 100.;
        let mut expected = 1;
        for _ in 0..10 {
            let (n, f) = arrivals_for_tick(
                Duration::from_secs(1),
                Duration::from_secs(10),
                0.,
                end_rate,
                0.,
                Duration::from_millis(100),
            );
            assert_eq!(n, expected);
            // powers of 10 never leave a fractional carry
            assert_eq!(f, 0.);
            end_rate *= 10.;
            expected *= 10;
        }
    }

    #[test]
    fn fractional_accumulation() {
        let start_rate = 12.5;
        let mut carry = 0.;
        let expected_fs = [0.25, 0.5, 0.75, 0.];
        for i in 0..10 {
            let (n, f) = arrivals_for_tick(
                Duration::from_secs(1),
                Duration::from_secs(10),
                start_rate,
                start_rate,
                carry,
                Duration::from_millis(100),
            );
            carry = f;
            let expected_f = expected_fs[i % 4];
            let expected_n = if expected_f == 0. { 2 } else { 1 };
            assert_eq!(n, expected_n);
            assert_eq!(f, expected_f);
        }
    }

    #[test]
    fn ramp_up() {
        for i in 0..10 {
            let (n, f) = arrivals_for_tick(
                Duration::from_secs(i),
                Duration::from_secs(10),
                0.,
                100.,
                0.,
                Duration::from_millis(100),
            );
            assert_eq!(n, i);
            assert_eq!(f, 0.);
        }
    }

    #[test]
    fn ramp_down() {
        for i in 0..10 {
            let (n, f) = arrivals_for_tick(
                Duration::from_secs(i),
                Duration::from_secs(10),
                100.,
                0.,
                0.,
                Duration::from_millis(100),
            );
            assert_eq!(n, 10 - i);
            assert_eq!(f, 0.);
        }
    }

    #[test]
    fn hold_steady() {
        for i in 0..10 {
            let (n, f) = arrivals_for_tick(
                Duration::from_secs(i),
                Duration::from_secs(10),
                100.,
                100.,
                0.,
                Duration::from_millis(100),
            );
            assert_eq!(n, 10);
            assert_eq!(f, 0.);
        }
    }

    #[test]
    fn elapsed_past_duration_caps_at_end_rate() {
        for i in 0..10 {
            let (n, f) = arrivals_for_tick(
                Duration::from_secs(10 + i),
                Duration::from_secs(10),
                0.,
                100.,
                0.,
                Duration::from_millis(100),
            );
            assert_eq!(n, 10);
            assert_eq!(f, 0.);
        }
    }

    #[test]
    fn negative_rate_releases_nothing() {
        let (n, f) = arrivals_for_tick(
            Duration::from_secs(1),
            Duration::from_secs(10),
            -100.,
            -100.,
            0.,
            Duration::from_millis(100),
        );
        assert_eq!(n, 0);
        assert_eq!(f, 0.);
    }

    #[test]
    fn level_follows_the_piecewise_profile() {
        // 10s ramp to 5, 20s ramp to 15, 10s ramp to 0
        let stages = [
            Stage::new(Duration::from_secs(10), 5.0),
            Stage::new(Duration::from_secs(20), 15.0),
            Stage::new(Duration::from_secs(10), 0.0),
        ];
        assert_eq!(level_at(0.0, &stages, Duration::ZERO), 0.0);
        assert_eq!(level_at(0.0, &stages, Duration::from_secs(5)), 2.5);
        assert_eq!(level_at(0.0, &stages, Duration::from_secs(10)), 5.0);
        assert_eq!(level_at(0.0, &stages, Duration::from_secs(20)), 10.0);
        assert_eq!(level_at(0.0, &stages, Duration::from_secs(30)), 15.0);
        assert_eq!(level_at(0.0, &stages, Duration::from_secs(35)), 7.5);
        assert_eq!(level_at(0.0, &stages, Duration::from_secs(40)), 0.0);
        assert_eq!(level_at(0.0, &stages, Duration::from_secs(99)), 0.0);
    }

    #[test]
    fn zero_duration_stage_jumps_instantly() {
        let stages = [
            Stage::new(Duration::ZERO, 50.0),
            Stage::new(Duration::from_secs(10), 50.0),
        ];
        assert_eq!(level_at(0.0, &stages, Duration::ZERO), 50.0);
        assert_eq!(level_at(0.0, &stages, Duration::from_secs(5)), 50.0);
    }

    #[test]
    fn initial_level_seeds_the_first_ramp() {
        let stages = [Stage::new(Duration::from_secs(10), 0.0)];
        assert_eq!(level_at(10.0, &stages, Duration::from_secs(5)), 5.0);
    }

    #[test]
    fn totals_sum_stage_durations() {
        let stages = [
            Stage::new(Duration::ZERO, 1.0),
            Stage::new(Duration::from_secs(3), 1.0),
            Stage::new(Duration::from_secs(7), 0.0),
        ];
        assert_eq!(total_duration(&stages), Duration::from_secs(10));
    }
}
