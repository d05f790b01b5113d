//! Adaptive reliability and pacing control plane of a video stream.
//!
//! A [`Session`] ties together the FEC ratio controller, the long-term reference scheduler and
//! the network throttle, all reporting into one statistic registry.

mod config;
mod session;
pub mod simulation;

pub use self::{
    config::{SessionConfig, SimulationConfig},
    session::Session,
    simulation::SimulationReport,
};
pub use fec_controller::{BandwidthOp, ConfigError};
pub use ltr_scheduler::{Feedback, FrameType, LtrAction, LtrError, LtrSnapshot};
pub use network_throttle::{Allocation, NetworkThrottle, ThrottleError};
pub use session_stats::{Statistic, StatisticRegistry, StatisticSummary};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Invalid FEC configuration: {0}")]
    FecConfig(#[from] ConfigError),
    #[error("LTR scheduler: {0}")]
    Ltr(#[from] LtrError),
    #[error("Invalid throttle configuration: {0}")]
    Throttle(#[from] ThrottleError),
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Session was terminated")]
    Terminated,
    #[error("Sender threads exited early")]
    SendersExited,
}
