//! Forward error correction ratio controller.
//!
//! Turns packet loss, bandwidth probe and latency feedback into the fraction of redundancy added
//! to each outgoing video frame. The ratio is the sum of two parts:
//!
//! * a base ratio tracking the packet loss the congestion controller does not get rid of, and
//! * an extra ratio padding bandwidth probes of the congestion controller.
//!
//! The total is then gated by latency since FEC is pointless when retransmissions are cheap.

mod base_ratio;
mod config;
mod extra_ratio;
mod sliding_window;

pub use self::config::{ConfigError, FecConfig};

use self::{
    base_ratio::BaseRatioController, extra_ratio::ExtraRatioController,
    sliding_window::SlidingWindowStat,
};
use session_stats::{Statistic, StatisticRegistry};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Decision of the congestion controller on the last tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BandwidthOp {
    Increase,
    Decrease,
    Hold,
}

/// Time elapsed since `then`, treating a missing `then` as infinitely long ago.
fn elapsed_since(now: Instant, then: Option<Instant>) -> Duration {
    then.map(|t| now.saturating_duration_since(t))
        .unwrap_or(Duration::MAX)
}

pub struct FecController {
    base_ratio_controller: BaseRatioController,
    extra_ratio_controller: ExtraRatioController,
    /// Round trip latency in milliseconds
    latency_stat: SlidingWindowStat,
    fec_min_start: f64,
    fec_min_step: f64,
    max_fec_ratio: f64,
    latency_lower_bound_ms: f64,
    latency_upper_bound_ms: f64,
    fec_ratio_override: Option<f64>,
    statistics: Option<Arc<StatisticRegistry>>,
}

impl FecController {
    pub fn new(config: &FecConfig, now: Instant) -> Result<FecController, ConfigError> {
        config.validate()?;

        Ok(FecController {
            base_ratio_controller: BaseRatioController::new(config, now),
            extra_ratio_controller: ExtraRatioController::new(config),
            latency_stat: SlidingWindowStat::new(
                "latency",
                Duration::from_secs_f64(config.latency_window_secs),
                Duration::from_secs_f64(config.latency_sample_period_secs),
            ),
            fec_min_start: config.fec_min_start,
            fec_min_step: config.fec_min_step,
            max_fec_ratio: config.max_fec_ratio,
            latency_lower_bound_ms: config.latency_lower_bound_ms,
            latency_upper_bound_ms: config.latency_upper_bound_ms,
            fec_ratio_override: config.fec_ratio_override,
            statistics: None,
        })
    }

    /// Records ratio changes into `statistics`.
    pub fn with_statistics(mut self, statistics: Arc<StatisticRegistry>) -> FecController {
        self.statistics = Some(statistics);
        self
    }

    /// Feeds the packet loss measured by the congestion controller on the last tick.
    ///
    /// `packet_loss` is in `[0, 1]` and bitrates are in bits per second.
    pub fn feed_network_info(
        &mut self,
        now: Instant,
        packet_loss: f64,
        current_bitrate: u64,
        min_bitrate: u64,
        op: BandwidthOp,
    ) {
        self.base_ratio_controller
            .feed_network_info(now, packet_loss, current_bitrate, min_bitrate, op);
    }

    /// Feeds the bitrate change decided by the congestion controller on the last tick.
    pub fn feed_bandwidth_probe_info(
        &mut self,
        now: Instant,
        old_bitrate: u64,
        new_bitrate: u64,
        op: BandwidthOp,
    ) {
        self.extra_ratio_controller
            .feed_bandwidth_probe_info(now, old_bitrate, new_bitrate, op);
    }

    /// Feeds everything the congestion controller produces in one tick.
    pub fn feed_info(
        &mut self,
        now: Instant,
        op: BandwidthOp,
        packet_loss: f64,
        old_bitrate: u64,
        current_bitrate: u64,
        min_bitrate: u64,
    ) {
        match op {
            BandwidthOp::Increase => tracing::debug!(
                "Bitrate increase from {old_bitrate} to {current_bitrate}, loss {packet_loss:.3}"
            ),
            BandwidthOp::Decrease => tracing::debug!(
                "Bitrate decrease from {old_bitrate} to {current_bitrate}, loss {packet_loss:.3}"
            ),
            BandwidthOp::Hold => {}
        }
        self.feed_network_info(now, packet_loss, current_bitrate, min_bitrate, op);
        self.feed_bandwidth_probe_info(now, old_bitrate, current_bitrate, op);
    }

    pub fn feed_latency(&mut self, now: Instant, latency: Duration) {
        self.latency_stat.slide_window(now);
        self.latency_stat.insert(now, latency.as_secs_f64() * 1000.0);
    }

    /// FEC ratio covering the measured packet loss. Returns the previous value if there are no
    /// trusted samples.
    pub fn base_fec_ratio(&mut self, now: Instant) -> f64 {
        self.base_ratio_controller.base_fec_ratio(now)
    }

    /// FEC ratio padding an ongoing bandwidth probe, zero if there is none.
    pub fn extra_fec_ratio(&mut self, now: Instant) -> f64 {
        self.extra_ratio_controller.extra_fec_ratio(now)
    }

    /// Multiplier in `[0, 1]` applied to the FEC ratio based on the 90th percentile latency.
    fn latency_fix_factor(&mut self, now: Instant) -> f64 {
        let latency = self
            .latency_stat
            .percentile_max(now, 90)
            .unwrap_or(f64::INFINITY);

        if latency < self.latency_lower_bound_ms {
            0.0
        } else if latency < self.latency_upper_bound_ms {
            (latency - self.latency_lower_bound_ms)
                / (self.latency_upper_bound_ms - self.latency_lower_bound_ms)
        } else {
            1.0
        }
    }

    /// Computes the FEC ratio for the next frame.
    ///
    /// `old_value` is the ratio currently in use. If the new ratio differs from it by less than
    /// the minimum step, `old_value` is returned to avoid renegotiating the FEC parameters on
    /// every frame.
    pub fn total_fec_ratio(&mut self, now: Instant, old_value: f64) -> f64 {
        let base_fec_ratio = self.base_fec_ratio(now);
        let extra_fec_ratio = self.extra_fec_ratio(now);

        // Base FEC only protects the portion not already padded with extra FEC
        let adjusted_base_fec_ratio = (1.0 - extra_fec_ratio) * base_fec_ratio;
        let mut total_fec_ratio = adjusted_base_fec_ratio + extra_fec_ratio;

        // Tiny ratios only add overhead after rounding to whole packets
        if total_fec_ratio < self.fec_min_start {
            total_fec_ratio = 0.0;
        }
        total_fec_ratio = f64::min(total_fec_ratio, self.max_fec_ratio);

        let total_fec_ratio_original = total_fec_ratio;
        total_fec_ratio *= self.latency_fix_factor(now);

        // Retransmissions may get lost too so keep a few spare packets around
        if total_fec_ratio_original > 0.01 {
            total_fec_ratio = f64::max(0.01, total_fec_ratio);
        }

        if (total_fec_ratio - old_value).abs() < self.fec_min_step {
            total_fec_ratio = old_value;
        } else {
            tracing::info!(
                "FEC ratio base {base_fec_ratio:.3} extra {extra_fec_ratio:.3} \
                 total {total_fec_ratio_original:.3} gated {total_fec_ratio:.3} \
                 previous {old_value:.3}"
            );
            if let Some(statistics) = &self.statistics {
                statistics.record(Statistic::FecBaseRatio, base_fec_ratio);
                statistics.record(Statistic::FecExtraRatio, extra_fec_ratio);
                statistics.record(Statistic::FecTotalRatioOriginal, total_fec_ratio_original);
                statistics.record(Statistic::FecTotalRatio, total_fec_ratio);
            }
        }

        self.fec_ratio_override.unwrap_or(total_fec_ratio)
    }

    /// Forces the total ratio, `None` hands control back to the network feedback. A ratio
    /// outside `[0, 1]` is rejected and the previous override stays.
    pub fn set_fec_ratio_override(&mut self, fec_ratio: Option<f64>) -> Result<(), ConfigError> {
        if let Some(ratio) = fec_ratio {
            config::check_ratio(ratio, "fec_ratio_override")?;
        }
        self.fec_ratio_override = fec_ratio;
        Ok(())
    }

    pub fn fec_ratio_override(&self) -> Option<f64> {
        self.fec_ratio_override
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{
        distributions::{Distribution, Uniform},
        rngs::StdRng,
        Rng, SeedableRng,
    };

    const BITRATE: u64 = 10_000_000;
    const MIN_BITRATE: u64 = 1_000_000;

    fn at(start: Instant, secs: f64) -> Instant {
        start + Duration::from_secs_f64(secs)
    }

    fn controller(start: Instant) -> FecController {
        FecController::new(&FecConfig::default(), start).unwrap()
    }

    /// Feeds a constant loss every 500 ms in `[from, to)` and a latency high enough to not gate
    /// the ratio.
    fn feed_constant_loss(
        controller: &mut FecController,
        start: Instant,
        from: f64,
        to: f64,
        packet_loss: f64,
    ) {
        let mut t = from;
        while t < to {
            let now = at(start, t);
            controller.feed_info(now, BandwidthOp::Hold, packet_loss, BITRATE, BITRATE, MIN_BITRATE);
            controller.feed_latency(now, Duration::from_millis(80));
            t += 0.5;
        }
    }

    #[test]
    fn sustained_loss_converges_to_cap() {
        let start = Instant::now();
        let mut controller = controller(start);

        feed_constant_loss(&mut controller, start, 0.0, 60.0, 0.2);
        assert_relative_eq!(controller.base_fec_ratio(at(start, 60.0)), 0.1 * 1.2);
    }

    #[test]
    fn base_ratio_is_bounded() {
        let start = Instant::now();
        let mut controller = controller(start);
        let mut rng = StdRng::seed_from_u64(7);
        let loss_dist = Uniform::new_inclusive(0.0f64, 1.0f64);

        for i in 0..2000 {
            let now = at(start, i as f64 * 0.1);
            let op = match rng.gen_range(0..3) {
                0 => BandwidthOp::Increase,
                1 => BandwidthOp::Decrease,
                _ => BandwidthOp::Hold,
            };
            let current_bitrate = if rng.gen_bool(0.2) { MIN_BITRATE } else { BITRATE };
            controller.feed_network_info(
                now,
                loss_dist.sample(&mut rng),
                current_bitrate,
                MIN_BITRATE,
                op,
            );

            let base = controller.base_fec_ratio(now);
            assert!((0.0..=0.1 * 1.2 + 1e-12).contains(&base), "{base}");
        }
    }

    #[test]
    fn total_combines_base_and_extra() {
        let start = Instant::now();
        let mut controller = controller(start);

        feed_constant_loss(&mut controller, start, 0.0, 20.0, 0.05);
        let now = at(start, 20.0);
        let base = controller.base_fec_ratio(now);
        assert_relative_eq!(base, 0.06, epsilon = 1e-12);

        controller.feed_bandwidth_probe_info(now, BITRATE, BITRATE * 5 / 4, BandwidthOp::Increase);
        let total = controller.total_fec_ratio(now, 0.0);
        assert_relative_eq!(total, (1.0 - 0.25) * 0.06 + 0.25, epsilon = 1e-9);
    }

    #[test]
    fn total_is_idempotent() {
        let start = Instant::now();
        let mut controller = controller(start);

        feed_constant_loss(&mut controller, start, 0.0, 30.0, 0.03);
        let now = at(start, 30.0);
        let first = controller.total_fec_ratio(now, 0.0);
        let second = controller.total_fec_ratio(now, first);
        let third = controller.total_fec_ratio(now, second);
        assert!(first > 0.0);
        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[test]
    fn small_changes_are_suppressed() {
        let start = Instant::now();
        let mut controller = controller(start);

        feed_constant_loss(&mut controller, start, 0.0, 30.0, 0.05);
        let now = at(start, 30.0);
        // Real ratio is 0.06, within the minimum step of 0.058
        assert_relative_eq!(controller.total_fec_ratio(now, 0.058), 0.058);
        assert_relative_eq!(controller.total_fec_ratio(now, 0.05), 0.06, epsilon = 1e-12);
    }

    #[test]
    fn tiny_ratio_snaps_to_zero() {
        let start = Instant::now();
        let mut controller = controller(start);

        feed_constant_loss(&mut controller, start, 0.0, 30.0, 0.003);
        let now = at(start, 30.0);
        assert!(controller.base_fec_ratio(now) < 0.005);
        assert_eq!(controller.total_fec_ratio(now, 0.1), 0.0);
    }

    #[test]
    fn total_is_clamped() {
        let start = Instant::now();
        let mut controller = controller(start);

        controller.feed_bandwidth_probe_info(start, 1_000, 100_000, BandwidthOp::Increase);
        assert_relative_eq!(controller.total_fec_ratio(start, 0.0), 0.5);
    }

    #[test]
    fn latency_gates_ratio() {
        let start = Instant::now();
        let mut controller = controller(start);
        controller.feed_bandwidth_probe_info(start, 10_000, 12_000, BandwidthOp::Increase);

        // No latency samples yet, full effect
        assert_relative_eq!(controller.total_fec_ratio(start, 0.0), 0.2, epsilon = 1e-9);

        // Low latency disables FEC except for the floor
        controller.feed_latency(start, Duration::from_millis(10));
        assert_relative_eq!(controller.total_fec_ratio(start, 0.2), 0.01);

        // 30 ms is halfway between the bounds
        let now = at(start, 31.0);
        controller.feed_bandwidth_probe_info(now, 10_000, 12_000, BandwidthOp::Increase);
        controller.feed_latency(now, Duration::from_millis(30));
        assert_relative_eq!(controller.total_fec_ratio(now, 0.0), 0.1, epsilon = 1e-9);
    }

    #[test]
    fn override_wins() {
        let start = Instant::now();
        let mut controller = controller(start);

        controller.set_fec_ratio_override(Some(0.3)).unwrap();
        assert_relative_eq!(controller.total_fec_ratio(start, 0.0), 0.3);

        controller.set_fec_ratio_override(None).unwrap();
        assert_relative_eq!(controller.total_fec_ratio(start, 0.0), 0.0);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let start = Instant::now();
        let mut controller = controller(start);
        controller.set_fec_ratio_override(Some(0.3)).unwrap();

        for ratio in [f64::NAN, -0.1, 1.5] {
            assert_eq!(
                controller.set_fec_ratio_override(Some(ratio)),
                Err(ConfigError::RatioOutOfRange("fec_ratio_override"))
            );
        }
        assert_eq!(controller.fec_ratio_override(), Some(0.3));
        assert_relative_eq!(controller.total_fec_ratio(start, 0.0), 0.3);
    }

    #[test]
    fn oversized_window_is_an_error() {
        let config = FecConfig {
            latency_window_secs: 1e30,
            ..Default::default()
        };
        assert!(matches!(
            FecController::new(&config, Instant::now()),
            Err(ConfigError::InvalidDuration("latency_window_secs"))
        ));
    }

    #[test]
    fn changes_are_recorded() {
        let start = Instant::now();
        let statistics = Arc::new(StatisticRegistry::new(Duration::from_secs(10)));
        let mut controller = controller(start).with_statistics(statistics.clone());

        controller.feed_bandwidth_probe_info(start, 10_000, 12_000, BandwidthOp::Increase);
        controller.total_fec_ratio(start, 0.0);
        controller.total_fec_ratio(start, 0.2);

        let summary = statistics.summary(Statistic::FecTotalRatio).unwrap();
        assert_eq!(summary.count, 1);
        assert_relative_eq!(summary.max, 0.2, epsilon = 1e-9);
    }
}
