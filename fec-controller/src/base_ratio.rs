use crate::{config::FecConfig, elapsed_since, sliding_window::SlidingWindowStat, BandwidthOp};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Derives the base FEC ratio from measured packet loss.
///
/// The base ratio protects against the inherent loss of the network plus the portion of loss the
/// congestion controller fails or refuses to react to. Loss samples that might just be congestion
/// are staged until the congestion controller has had time to react.
pub(crate) struct BaseRatioController {
    packet_loss_stat: SlidingWindowStat,
    /// Samples not yet trusted, waiting to see if a bandwidth decrease follows them
    packet_loss_record_queue: VecDeque<(Instant, f64)>,
    init_time: Instant,
    last_fec_ratio: f64,
    last_increase_bandwidth_time: Option<Instant>,
    last_non_hit_min_bitrate_time: Option<Instant>,

    start_cooldown: Duration,
    small_wait_time: Duration,
    packet_loss_max: f64,
    protecting_factor: f64,
}

impl BaseRatioController {
    pub fn new(config: &FecConfig, now: Instant) -> BaseRatioController {
        BaseRatioController {
            packet_loss_stat: SlidingWindowStat::new(
                "packet_loss",
                Duration::from_secs_f64(config.packet_loss_window_secs),
                Duration::from_secs_f64(config.packet_loss_sample_period_secs),
            ),
            packet_loss_record_queue: VecDeque::new(),
            init_time: now,
            last_fec_ratio: config.initial_fec_ratio,
            last_increase_bandwidth_time: None,
            last_non_hit_min_bitrate_time: None,
            start_cooldown: config.start_cooldown(),
            small_wait_time: config.small_wait_time(),
            packet_loss_max: config.packet_loss_max,
            protecting_factor: config.base_fec_protecting_factor,
        }
    }

    fn admit_sample(&mut self, now: Instant, packet_loss: f64) {
        if self.packet_loss_stat.insert(now, packet_loss) {
            tracing::debug!("Sampled packet loss {:.2}%", packet_loss * 100.0);
        }
    }

    pub fn feed_network_info(
        &mut self,
        now: Instant,
        packet_loss: f64,
        current_bitrate: u64,
        min_bitrate: u64,
        op: BandwidthOp,
    ) {
        self.packet_loss_stat.slide_window(now);

        if current_bitrate != min_bitrate {
            self.last_non_hit_min_bitrate_time = Some(now);
        }

        // The stream is unstable during startup
        if now.saturating_duration_since(self.init_time) < self.start_cooldown {
            return;
        }

        // The bitrate cannot go any lower so the loss has to be lived with
        if elapsed_since(now, self.last_non_hit_min_bitrate_time) > self.small_wait_time {
            self.admit_sample(now, packet_loss);
            return;
        }

        // An increase means the network is not congested right now
        if op == BandwidthOp::Increase {
            self.admit_sample(now, packet_loss);
            self.packet_loss_record_queue.clear();
            self.last_increase_bandwidth_time = Some(now);
        }

        if elapsed_since(now, self.last_increase_bandwidth_time) < self.small_wait_time {
            return;
        }

        self.packet_loss_record_queue.push_back((now, packet_loss));

        // Likely congestion, nothing staged can be trusted
        if op == BandwidthOp::Decrease {
            self.packet_loss_record_queue.clear();
        }

        while let Some(&(time, value)) = self.packet_loss_record_queue.front() {
            if now.saturating_duration_since(time) < self.small_wait_time {
                break;
            }
            self.admit_sample(now, value);
            self.packet_loss_record_queue.pop_front();
        }
    }

    pub fn base_fec_ratio(&mut self, now: Instant) -> f64 {
        let (Some(max_packet_loss), Some(avg_packet_loss)) = (
            self.packet_loss_stat.max(now),
            self.packet_loss_stat.average(now),
        )
        else {
            return self.last_fec_ratio;
        };

        let mut packet_loss = max_packet_loss;

        // Clip outliers by the average
        packet_loss = f64::min(packet_loss, 4.0 * avg_packet_loss + 0.05);

        // Clip outliers by the 90th percentile once there are enough samples for it to mean
        // anything
        if self.packet_loss_stat.len() >= 10 {
            if let Some(p90) = self.packet_loss_stat.percentile_max(now, 90) {
                packet_loss = f64::min(packet_loss, p90 + 0.05);
            }
        }

        packet_loss = f64::min(packet_loss, self.packet_loss_max);

        let fec_ratio = packet_loss * self.protecting_factor;
        self.last_fec_ratio = fec_ratio;
        fec_ratio
    }

    #[cfg(test)]
    pub fn num_samples(&self) -> usize {
        self.packet_loss_stat.len()
    }

    #[cfg(test)]
    pub fn num_staged_samples(&self) -> usize {
        self.packet_loss_record_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const BITRATE: u64 = 10_000_000;
    const MIN_BITRATE: u64 = 1_000_000;

    fn at(start: Instant, secs: f64) -> Instant {
        start + Duration::from_secs_f64(secs)
    }

    #[test]
    fn cooldown_drops_samples() {
        let start = Instant::now();
        let mut controller = BaseRatioController::new(&FecConfig::default(), start);

        for i in 0..10 {
            let now = at(start, i as f64 * 0.5);
            controller.feed_network_info(now, 0.3, BITRATE, MIN_BITRATE, BandwidthOp::Increase);
        }
        assert_eq!(controller.num_samples(), 0);
        assert_relative_eq!(controller.base_fec_ratio(at(start, 5.0)), 0.0);
    }

    #[test]
    fn staged_samples_are_promoted_without_decrease() {
        let start = Instant::now();
        let mut controller = BaseRatioController::new(&FecConfig::default(), start);

        controller.feed_network_info(at(start, 6.0), 0.05, BITRATE, MIN_BITRATE, BandwidthOp::Hold);
        assert_eq!(controller.num_staged_samples(), 1);
        assert_eq!(controller.num_samples(), 0);

        controller.feed_network_info(at(start, 9.0), 0.05, BITRATE, MIN_BITRATE, BandwidthOp::Hold);
        assert_eq!(controller.num_samples(), 1);
        assert_eq!(controller.num_staged_samples(), 1);
    }

    #[test]
    fn decrease_discards_staged_samples() {
        let start = Instant::now();
        let mut controller = BaseRatioController::new(&FecConfig::default(), start);

        controller.feed_network_info(at(start, 6.0), 0.2, BITRATE, MIN_BITRATE, BandwidthOp::Hold);
        controller.feed_network_info(at(start, 7.0), 0.2, BITRATE, MIN_BITRATE, BandwidthOp::Hold);
        controller.feed_network_info(
            at(start, 8.0),
            0.2,
            BITRATE,
            MIN_BITRATE,
            BandwidthOp::Decrease,
        );
        assert_eq!(controller.num_staged_samples(), 0);

        controller.feed_network_info(at(start, 9.5), 0.0, BITRATE, MIN_BITRATE, BandwidthOp::Hold);
        assert_eq!(controller.num_samples(), 0);
    }

    #[test]
    fn increase_is_trusted_immediately() {
        let start = Instant::now();
        let mut controller = BaseRatioController::new(&FecConfig::default(), start);

        controller.feed_network_info(at(start, 6.0), 0.02, BITRATE, MIN_BITRATE, BandwidthOp::Hold);
        controller.feed_network_info(
            at(start, 7.0),
            0.04,
            BITRATE,
            MIN_BITRATE,
            BandwidthOp::Increase,
        );
        assert_eq!(controller.num_samples(), 1);
        assert_eq!(controller.num_staged_samples(), 0);

        // Staging is skipped for a while after an increase
        controller.feed_network_info(at(start, 8.0), 0.5, BITRATE, MIN_BITRATE, BandwidthOp::Hold);
        assert_eq!(controller.num_staged_samples(), 0);
        assert_relative_eq!(controller.base_fec_ratio(at(start, 8.0)), 0.04 * 1.2);
    }

    #[test]
    fn min_bitrate_is_trusted_immediately() {
        let start = Instant::now();
        let mut controller = BaseRatioController::new(&FecConfig::default(), start);

        for i in 0..4 {
            let now = at(start, 6.0 + i as f64 * 1.5);
            controller.feed_network_info(
                now,
                0.05,
                MIN_BITRATE,
                MIN_BITRATE,
                BandwidthOp::Decrease,
            );
        }
        // Never left the minimum bitrate, so every sample is trusted
        assert_eq!(controller.num_samples(), 4);
        assert_eq!(controller.num_staged_samples(), 0);
    }

    #[test]
    fn recently_reached_min_bitrate_is_staged() {
        let start = Instant::now();
        let mut controller = BaseRatioController::new(&FecConfig::default(), start);

        controller.feed_network_info(at(start, 6.0), 0.02, BITRATE, MIN_BITRATE, BandwidthOp::Hold);
        assert_eq!(controller.num_staged_samples(), 1);

        // At the minimum since t = 7 but the bitrate was last elsewhere at t = 6
        for t in [7.0, 8.5] {
            controller.feed_network_info(
                at(start, t),
                0.02,
                MIN_BITRATE,
                MIN_BITRATE,
                BandwidthOp::Hold,
            );
            assert_eq!(controller.num_samples(), 0);
        }
        assert_eq!(controller.num_staged_samples(), 3);

        // 3.5s since the bitrate left the minimum, a decrease no longer matters
        controller.feed_network_info(
            at(start, 9.5),
            0.05,
            MIN_BITRATE,
            MIN_BITRATE,
            BandwidthOp::Decrease,
        );
        assert_eq!(controller.num_samples(), 1);
        assert_eq!(controller.num_staged_samples(), 3);
        assert_relative_eq!(controller.base_fec_ratio(at(start, 9.5)), 0.05 * 1.2);
    }

    #[test]
    fn outliers_are_clipped_by_average() {
        let start = Instant::now();
        let mut controller = BaseRatioController::new(&FecConfig::default(), start);

        // One 8% spike among zeros; avg = 0.02, 4 * avg + 0.05 = 0.13 > 0.08 so no clip
        for (i, loss) in [0.0, 0.0, 0.08, 0.0].into_iter().enumerate() {
            let now = at(start, 6.0 + i as f64 * 1.5);
            controller.feed_network_info(now, loss, MIN_BITRATE, MIN_BITRATE, BandwidthOp::Hold);
        }
        assert_relative_eq!(controller.base_fec_ratio(at(start, 12.0)), 0.08 * 1.2);

        // A lone 50% spike among 20 zeros is clipped to the 90th percentile + 0.05
        let start = Instant::now();
        let mut controller = BaseRatioController::new(&FecConfig::default(), start);
        for i in 0..20 {
            let loss = if i == 10 { 0.5 } else { 0.0 };
            let now = at(start, 6.0 + i as f64 * 1.5);
            controller.feed_network_info(now, loss, MIN_BITRATE, MIN_BITRATE, BandwidthOp::Hold);
        }
        assert_eq!(controller.num_samples(), 20);
        assert_relative_eq!(controller.base_fec_ratio(at(start, 36.0)), 0.05 * 1.2);
    }
}
