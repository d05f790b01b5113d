use crate::{config::FecConfig, BandwidthOp};
use std::time::{Duration, Instant};

/// Pads bandwidth probes of the congestion controller with FEC.
///
/// When the congestion controller probes for more bandwidth, the increase is filled with
/// redundancy instead of video so a failed probe costs recoverable packets rather than frames.
pub(crate) struct ExtraRatioController {
    extra_fec_in_use: bool,
    /// Only meaningful while `extra_fec_in_use` is set
    extra_fec_ratio: f64,
    last_used_extra_fec_time: Option<Instant>,
    extend_cnt_left: u32,

    upper_bound: f64,
    last_time: Duration,
    max_extend_cnt: u32,
}

impl ExtraRatioController {
    pub fn new(config: &FecConfig) -> ExtraRatioController {
        ExtraRatioController {
            extra_fec_in_use: false,
            extra_fec_ratio: 0.0,
            last_used_extra_fec_time: None,
            extend_cnt_left: 0,
            upper_bound: config.extra_fec_upper_bound(),
            last_time: config.extra_fec_last_time(),
            max_extend_cnt: config.extra_fec_max_extend_count,
        }
    }

    pub fn feed_bandwidth_probe_info(
        &mut self,
        now: Instant,
        old_bitrate: u64,
        new_bitrate: u64,
        op: BandwidthOp,
    ) {
        if op == BandwidthOp::Increase && new_bitrate > old_bitrate {
            // Same as the bandwidth increase ratio. A zero `old_bitrate` ends up at the upper
            // bound.
            let ratio = new_bitrate as f64 / old_bitrate as f64 - 1.0;
            self.extra_fec_ratio = f64::min(ratio, self.upper_bound);
            self.extra_fec_in_use = true;
            self.extend_cnt_left = self.max_extend_cnt;
            self.last_used_extra_fec_time = Some(now);
            tracing::debug!("Enabled extra FEC {:.3}", self.extra_fec_ratio);
        } else if self.extra_fec_in_use {
            // Congestion during the protection period, wait a bit longer for it to go away
            if op == BandwidthOp::Decrease && self.extend_cnt_left > 0 {
                self.extend_cnt_left -= 1;
                self.last_used_extra_fec_time = Some(now);
                tracing::debug!("Refreshed extra FEC {:.3}", self.extra_fec_ratio);
            }
            self.expire(now);
        }
    }

    /// Turns extra FEC off once the protection period ran out. The base ratio reacts to whatever
    /// loss is left after that.
    fn expire(&mut self, now: Instant) {
        if !self.extra_fec_in_use {
            return;
        }
        let expired = self
            .last_used_extra_fec_time
            .map(|t| now.saturating_duration_since(t) > self.last_time)
            .unwrap_or(true);
        if expired {
            self.extra_fec_in_use = false;
            tracing::debug!("Disabled extra FEC");
        }
    }

    pub fn extra_fec_ratio(&mut self, now: Instant) -> f64 {
        self.expire(now);
        if self.extra_fec_in_use {
            self.extra_fec_ratio
        } else {
            0.0
        }
    }

    #[cfg(test)]
    pub fn extend_cnt_left(&self) -> u32 {
        self.extend_cnt_left
    }
}
