use crate::SessionError;
use fec_controller::FecConfig;
use ltr_scheduler::LtrConfig;
use network_throttle::ThrottleConfig;
use serde::Deserialize;
use session_stats::StatsConfig;
use std::path::Path;

/// Everything a streaming session can be tuned with. Missing fields take their defaults.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Used when `RUST_LOG` is not set.
    pub log_level: Option<String>,
    pub fec: FecConfig,
    pub ltr: LtrConfig,
    pub throttle: ThrottleConfig,
    pub stats: StatsConfig,
    pub simulation: SimulationConfig,
}

/// Parameters of the simulated link driven by the `stream-control` binary.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub duration_secs: u64,
    pub seed: u64,
    pub frame_rate: u32,
    pub packet_size: usize,
    pub sender_threads: usize,
    pub start_bitrate: u64,
    pub min_bitrate: u64,
    pub max_bitrate: u64,
    /// Burst bitrate handed to the throttle as a multiple of the video bitrate.
    pub burst_factor: f64,
    /// Loss of the link when it is not congested.
    pub base_packet_loss: f64,
    pub round_trip_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            duration_secs: 20,
            seed: 0,
            frame_rate: 60,
            packet_size: 1200,
            sender_threads: 2,
            start_bitrate: 8_000_000,
            min_bitrate: 1_000_000,
            max_bitrate: 20_000_000,
            burst_factor: 4.0,
            base_packet_loss: 0.01,
            round_trip_ms: 30,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<SessionConfig, SessionError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<SessionConfig, SessionError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        self.fec.validate()?;
        self.ltr.validate()?;
        self.throttle.validate()?;
        Ok(())
    }
}
