//! Per-session statistic accumulators.
//!
//! Every component that wants to report numbers gets a shared reference to the session's
//! `StatisticRegistry` instead of writing into a process-wide table.

use parking_lot::Mutex;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Statistics recorded by the control plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Statistic {
    /// Time a packet spent in `wait_byte_allocation` (ms).
    ThrottledPacketDelay,
    /// Throttle delay normalized by the packet size (ms per byte).
    ThrottledPacketDelayRate,
    /// Number of credit polls a packet needed before it was released.
    ThrottledPacketDelayLoops,
    FecBaseRatio,
    FecExtraRatio,
    /// Total FEC ratio before the latency gate.
    FecTotalRatioOriginal,
    FecTotalRatio,
    LtrIntraFrames,
    LtrReferLongTermFrames,
    LtrCreateLongTermFrames,
    LtrNormalFrames,
    LtrAcks,
    LtrNacks,
}

impl Statistic {
    pub const COUNT: usize = 13;

    pub const ALL: [Statistic; Statistic::COUNT] = [
        Statistic::ThrottledPacketDelay,
        Statistic::ThrottledPacketDelayRate,
        Statistic::ThrottledPacketDelayLoops,
        Statistic::FecBaseRatio,
        Statistic::FecExtraRatio,
        Statistic::FecTotalRatioOriginal,
        Statistic::FecTotalRatio,
        Statistic::LtrIntraFrames,
        Statistic::LtrReferLongTermFrames,
        Statistic::LtrCreateLongTermFrames,
        Statistic::LtrNormalFrames,
        Statistic::LtrAcks,
        Statistic::LtrNacks,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Statistic::ThrottledPacketDelay => "THROTTLED_PACKET_DELAY",
            Statistic::ThrottledPacketDelayRate => "THROTTLED_PACKET_DELAY_RATE",
            Statistic::ThrottledPacketDelayLoops => "THROTTLED_PACKET_DELAY_LOOPS",
            Statistic::FecBaseRatio => "FEC_BASE_RATIO",
            Statistic::FecExtraRatio => "FEC_EXTRA_RATIO",
            Statistic::FecTotalRatioOriginal => "FEC_TOTAL_RATIO_ORIGINAL",
            Statistic::FecTotalRatio => "FEC_TOTAL_RATIO",
            Statistic::LtrIntraFrames => "LTR_INTRA_FRAMES",
            Statistic::LtrReferLongTermFrames => "LTR_REFER_LONG_TERM_FRAMES",
            Statistic::LtrCreateLongTermFrames => "LTR_CREATE_LONG_TERM_FRAMES",
            Statistic::LtrNormalFrames => "LTR_NORMAL_FRAMES",
            Statistic::LtrAcks => "LTR_ACKS",
            Statistic::LtrNacks => "LTR_NACKS",
        }
    }
}

/// Accumulated values of one statistic since the last report.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatisticSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl StatisticSummary {
    const EMPTY: StatisticSummary = StatisticSummary {
        count: 0,
        sum: 0.0,
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
    };

    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = f64::min(self.min, value);
        self.max = f64::max(self.max, value);
    }

    pub fn average(&self) -> f64 {
        self.sum / self.count as f64
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// How often accumulated statistics are logged and reset (ms).
    pub report_interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            report_interval_ms: 10_000,
        }
    }
}

struct Accumulators {
    summaries: [StatisticSummary; Statistic::COUNT],
    last_report: Option<Instant>,
}

pub struct StatisticRegistry {
    report_interval: Duration,
    inner: Mutex<Accumulators>,
}

impl StatisticRegistry {
    pub fn new(report_interval: Duration) -> StatisticRegistry {
        StatisticRegistry {
            report_interval,
            inner: Mutex::new(Accumulators {
                summaries: [StatisticSummary::EMPTY; Statistic::COUNT],
                last_report: None,
            }),
        }
    }

    pub fn from_config(config: &StatsConfig) -> StatisticRegistry {
        StatisticRegistry::new(Duration::from_millis(config.report_interval_ms))
    }

    /// Adds a sample to `stat`.
    pub fn record(&self, stat: Statistic, value: f64) {
        self.inner.lock().summaries[stat as usize].add(value);
    }

    /// Returns the accumulated values of `stat`, or `None` if nothing was recorded since the last
    /// report.
    pub fn summary(&self, stat: Statistic) -> Option<StatisticSummary> {
        let summary = self.inner.lock().summaries[stat as usize];
        (summary.count > 0).then_some(summary)
    }

    pub fn snapshot(&self) -> Vec<(Statistic, StatisticSummary)> {
        let inner = self.inner.lock();
        Statistic::ALL
            .iter()
            .zip(inner.summaries.iter())
            .filter(|(_, summary)| summary.count > 0)
            .map(|(&stat, &summary)| (stat, summary))
            .collect()
    }

    /// Logs and resets every non-empty statistic once the report interval has elapsed since the
    /// previous report. The first call only starts the interval.
    ///
    /// Returns `true` if a report was emitted.
    pub fn report_if_due(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let last_report = match inner.last_report {
            Some(t) => t,
            None => {
                inner.last_report = Some(now);
                return false;
            }
        };
        if now.saturating_duration_since(last_report) < self.report_interval {
            return false;
        }

        for (stat, summary) in Statistic::ALL.iter().zip(inner.summaries.iter_mut()) {
            if summary.count > 0 {
                tracing::info!(
                    "{}: avg {:.3} min {:.3} max {:.3} count {}",
                    stat.name(),
                    summary.average(),
                    summary.min,
                    summary.max,
                    summary.count
                );
            }
            *summary = StatisticSummary::EMPTY;
        }
        inner.last_report = Some(now);
        true
    }
}
