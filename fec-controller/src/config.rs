use serde::Deserialize;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("`{0}` must be a non-negative number of seconds, at most one day")]
    InvalidDuration(&'static str),
    #[error("`{0}` must be within [0, 1]")]
    RatioOutOfRange(&'static str),
    #[error("The latency lower bound must be below the upper bound")]
    InvertedLatencyBounds,
    #[error("`{0}` must be positive")]
    NotPositive(&'static str),
}

/// Tunables of the FEC ratio controller.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    /// Samples fed during the first seconds of the stream are ignored.
    pub start_cooldown_secs: f64,
    /// How long a staged packet-loss sample must survive without a bandwidth decrease, and how
    /// long the bitrate must sit at its minimum before samples are trusted immediately.
    pub small_wait_time_secs: f64,
    pub packet_loss_window_secs: f64,
    pub packet_loss_sample_period_secs: f64,
    pub latency_window_secs: f64,
    pub latency_sample_period_secs: f64,
    /// Base FEC only reacts to packet loss up to this value.
    pub packet_loss_max: f64,
    /// Units of FEC ratio used to protect one unit of packet loss.
    pub base_fec_protecting_factor: f64,
    pub initial_fec_ratio: f64,
    /// Largest bitrate increase the congestion controller does in one step (%).
    pub max_increase_percentage: f64,
    /// How long extra FEC protects a bandwidth probe.
    pub extra_fec_last_time_secs: f64,
    /// How many times a congestion signal may extend the extra FEC period.
    pub extra_fec_max_extend_count: u32,
    /// Totals below this are rounded down to zero.
    pub fec_min_start: f64,
    /// Changes smaller than this are not propagated.
    pub fec_min_step: f64,
    pub max_fec_ratio: f64,
    /// Below this 90th percentile latency FEC is disabled.
    pub latency_lower_bound_ms: f64,
    /// Above this 90th percentile latency FEC takes full effect.
    pub latency_upper_bound_ms: f64,
    /// Forces the total FEC ratio regardless of the network state.
    pub fec_ratio_override: Option<f64>,
}

impl Default for FecConfig {
    fn default() -> Self {
        FecConfig {
            start_cooldown_secs: 5.0,
            small_wait_time_secs: 3.0,
            packet_loss_window_secs: 45.0,
            packet_loss_sample_period_secs: 1.5,
            latency_window_secs: 30.0,
            latency_sample_period_secs: 0.3,
            packet_loss_max: 0.1,
            base_fec_protecting_factor: 1.2,
            initial_fec_ratio: 0.0,
            max_increase_percentage: 20.0,
            extra_fec_last_time_secs: 3.0,
            extra_fec_max_extend_count: 1,
            fec_min_start: 0.005,
            fec_min_step: 0.005,
            max_fec_ratio: 0.5,
            latency_lower_bound_ms: 20.0,
            latency_upper_bound_ms: 40.0,
            fec_ratio_override: None,
        }
    }
}

/// Durations are added to `Instant`s, anything longer is rejected before it can overflow.
const MAX_SECS: f64 = 24.0 * 60.0 * 60.0;

fn check_secs(value: f64, name: &'static str) -> Result<(), ConfigError> {
    match Duration::try_from_secs_f64(value) {
        Ok(_) if value <= MAX_SECS => Ok(()),
        _ => Err(ConfigError::InvalidDuration(name)),
    }
}

fn check_window(value: f64, name: &'static str) -> Result<(), ConfigError> {
    check_secs(value, name)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive(name))
    }
}

pub(crate) fn check_ratio(value: f64, name: &'static str) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::RatioOutOfRange(name))
    }
}

impl FecConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs(self.start_cooldown_secs, "start_cooldown_secs")?;
        check_secs(self.small_wait_time_secs, "small_wait_time_secs")?;
        check_window(self.packet_loss_window_secs, "packet_loss_window_secs")?;
        check_secs(
            self.packet_loss_sample_period_secs,
            "packet_loss_sample_period_secs",
        )?;
        check_window(self.latency_window_secs, "latency_window_secs")?;
        check_secs(self.latency_sample_period_secs, "latency_sample_period_secs")?;
        check_secs(self.extra_fec_last_time_secs, "extra_fec_last_time_secs")?;

        check_ratio(self.packet_loss_max, "packet_loss_max")?;
        check_ratio(self.initial_fec_ratio, "initial_fec_ratio")?;
        check_ratio(self.fec_min_start, "fec_min_start")?;
        check_ratio(self.fec_min_step, "fec_min_step")?;
        check_ratio(self.max_fec_ratio, "max_fec_ratio")?;
        if let Some(ratio) = self.fec_ratio_override {
            check_ratio(ratio, "fec_ratio_override")?;
        }

        if !(self.base_fec_protecting_factor > 0.0) {
            return Err(ConfigError::NotPositive("base_fec_protecting_factor"));
        }
        if !(self.max_increase_percentage > 0.0) {
            return Err(ConfigError::NotPositive("max_increase_percentage"));
        }
        if !(self.latency_lower_bound_ms < self.latency_upper_bound_ms) {
            return Err(ConfigError::InvertedLatencyBounds);
        }
        Ok(())
    }

    pub(crate) fn start_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.start_cooldown_secs)
    }

    pub(crate) fn small_wait_time(&self) -> Duration {
        Duration::from_secs_f64(self.small_wait_time_secs)
    }

    pub(crate) fn extra_fec_last_time(&self) -> Duration {
        Duration::from_secs_f64(self.extra_fec_last_time_secs)
    }

    /// Upper bound of the extra FEC ratio.
    pub(crate) fn extra_fec_upper_bound(&self) -> f64 {
        1.0 + self.max_increase_percentage / 100.0
    }
}
