use crate::{SessionConfig, SessionError};
use fec_controller::{BandwidthOp, FecController};
use ltr_scheduler::{Feedback, LtrAction, LtrError, LtrScheduler, LtrSnapshot};
use network_throttle::NetworkThrottle;
use session_stats::StatisticRegistry;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Control plane of one streaming session.
///
/// A broken ack/nack contract is fatal: the session stops and every later call returns
/// [`SessionError::Terminated`].
pub struct Session {
    fec_controller: FecController,
    ltr_scheduler: LtrScheduler,
    throttle: NetworkThrottle,
    statistics: Arc<StatisticRegistry>,
    fec_ratio: f64,
    terminated: bool,
}

impl Session {
    pub fn new(config: &SessionConfig, now: Instant) -> Result<Session, SessionError> {
        config.validate()?;

        let statistics = Arc::new(StatisticRegistry::from_config(&config.stats));
        let fec_controller =
            FecController::new(&config.fec, now)?.with_statistics(statistics.clone());
        let ltr_scheduler =
            LtrScheduler::new(config.ltr.clone())?.with_statistics(statistics.clone());
        let throttle = NetworkThrottle::with_statistics(&config.throttle, statistics.clone())?;

        Ok(Session {
            fec_controller,
            ltr_scheduler,
            throttle,
            statistics,
            fec_ratio: config.fec.initial_fec_ratio,
            terminated: false,
        })
    }

    fn check(&self) -> Result<(), SessionError> {
        if self.terminated {
            Err(SessionError::Terminated)
        } else {
            Ok(())
        }
    }

    fn ltr_result<T>(&mut self, result: Result<T, LtrError>) -> Result<T, SessionError> {
        result.map_err(|e| {
            tracing::error!("Terminating session: {}", e);
            self.terminated = true;
            SessionError::Ltr(e)
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn feed_network_info(
        &mut self,
        now: Instant,
        packet_loss: f64,
        current_bitrate: u64,
        min_bitrate: u64,
        op: BandwidthOp,
    ) -> Result<(), SessionError> {
        self.check()?;
        self.fec_controller
            .feed_network_info(now, packet_loss, current_bitrate, min_bitrate, op);
        Ok(())
    }

    pub fn feed_bandwidth_probe_info(
        &mut self,
        now: Instant,
        old_bitrate: u64,
        new_bitrate: u64,
        op: BandwidthOp,
    ) -> Result<(), SessionError> {
        self.check()?;
        self.fec_controller
            .feed_bandwidth_probe_info(now, old_bitrate, new_bitrate, op);
        Ok(())
    }

    pub fn feed_info(
        &mut self,
        now: Instant,
        op: BandwidthOp,
        packet_loss: f64,
        old_bitrate: u64,
        current_bitrate: u64,
        min_bitrate: u64,
    ) -> Result<(), SessionError> {
        self.check()?;
        self.fec_controller.feed_info(
            now,
            op,
            packet_loss,
            old_bitrate,
            current_bitrate,
            min_bitrate,
        );
        Ok(())
    }

    pub fn feed_latency(&mut self, now: Instant, latency: Duration) -> Result<(), SessionError> {
        self.check()?;
        self.fec_controller.feed_latency(now, latency);
        Ok(())
    }

    /// FEC ratio for the next video frame.
    pub fn fec_ratio(&mut self, now: Instant) -> Result<f64, SessionError> {
        self.check()?;
        self.fec_ratio = self.fec_controller.total_fec_ratio(now, self.fec_ratio);
        Ok(self.fec_ratio)
    }

    pub fn set_fec_ratio_override(&mut self, fec_ratio: Option<f64>) -> Result<(), SessionError> {
        self.check()?;
        self.fec_controller.set_fec_ratio_override(fec_ratio)?;
        Ok(())
    }

    /// Decides how the frame about to be sent as `frame_id` is encoded.
    pub fn next_frame_action(&mut self, frame_id: u32) -> Result<LtrAction, SessionError> {
        self.check()?;
        let result = self.ltr_scheduler.get_next_action(frame_id);
        self.ltr_result(result)
    }

    pub fn ack(&mut self, frame_id: u32) -> Result<Feedback, SessionError> {
        self.check()?;
        let result = self.ltr_scheduler.ack(frame_id);
        self.ltr_result(result)
    }

    pub fn nack(&mut self, frame_id: u32) -> Result<Feedback, SessionError> {
        self.check()?;
        let result = self.ltr_scheduler.nack(frame_id);
        self.ltr_result(result)
    }

    pub fn mark_stream_broken(&mut self) -> Result<(), SessionError> {
        self.check()?;
        let result = self.ltr_scheduler.mark_stream_broken();
        self.ltr_result(result)
    }

    pub fn force_intra(&mut self) -> Result<(), SessionError> {
        self.check()?;
        self.ltr_scheduler.force_intra();
        Ok(())
    }

    pub fn ltr_state(&self) -> LtrSnapshot {
        self.ltr_scheduler.state()
    }

    pub fn set_burst_bitrate(&self, burst_bitrate: i64) -> Result<(), SessionError> {
        self.check()?;
        self.throttle.set_burst_bitrate(burst_bitrate);
        Ok(())
    }

    /// Handle for sender threads.
    pub fn throttle(&self) -> NetworkThrottle {
        self.throttle.clone()
    }

    pub fn statistics(&self) -> Arc<StatisticRegistry> {
        self.statistics.clone()
    }

    /// Logs the accumulated statistics if the reporting interval elapsed.
    pub fn report_statistics(&self, now: Instant) -> bool {
        self.statistics.report_if_due(now)
    }

    /// Ends the session, waiting for threads blocked in the throttle to leave.
    pub fn shutdown(&mut self) {
        self.terminated = true;
        self.throttle.destroy();
    }
}
