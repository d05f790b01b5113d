//! Codec-independent long-term reference decisions.
//!
//! The scheduler picks, for every frame, whether the encoder should produce a normal frame, an
//! intra frame, a frame stored into a long-term slot, or a frame referring to a long-term slot.
//! Acks and nacks from the far end decide which long-term frame is known to be decodable so that
//! a loss can be repaired by referring to it instead of sending an expensive intra frame.
//!
//! Frames move through three lists: `pending` (action picked, not sent yet), `inflight` (sent,
//! waiting for feedback) and `done` (acked, nacked, or too old to matter). Each list is ordered
//! by frame counter, so a frame's reference is always earlier in the list than the frame itself.

mod frame;

pub use self::frame::{FrameType, LtrAction, LtrFrame, LONG_TERM_SLOTS};

use serde::Deserialize;
use session_stats::{Statistic, StatisticRegistry};
use std::{collections::VecDeque, sync::Arc};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LtrError {
    #[error("Frame {frame_id} was acked after being nacked")]
    AckAfterNack { frame_id: u32 },
    #[error("Frame {frame_id} was nacked after being acked")]
    NackAfterAck { frame_id: u32 },
    #[error("A frame was sent without picking an action for it first")]
    NoPendingFrame,
    #[error("`{0}` must be positive")]
    InvalidConfig(&'static str),
}

/// Outcome of an ack or nack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feedback {
    Applied,
    /// The frame already had the same feedback.
    AlreadyApplied,
    /// The frame id is unknown or the frame is too old to be tracked.
    Unknown,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LtrConfig {
    /// Frames to wait for an intra frame to be acked before sending another.
    pub new_intra_frame_delay: u64,
    /// In-flight frames beyond this are assumed lost and moved to the done list. This should
    /// not happen unless the RTT is unreasonably high.
    pub max_inflight_frames: usize,
    /// Done frames kept around for diagnostics.
    pub max_done_frames: usize,
}

impl Default for LtrConfig {
    fn default() -> Self {
        LtrConfig {
            new_intra_frame_delay: 60,
            max_inflight_frames: 60,
            max_done_frames: 60,
        }
    }
}

impl LtrConfig {
    pub fn validate(&self) -> Result<(), LtrError> {
        if self.new_intra_frame_delay == 0 {
            return Err(LtrError::InvalidConfig("new_intra_frame_delay"));
        }
        if self.max_inflight_frames == 0 {
            return Err(LtrError::InvalidConfig("max_inflight_frames"));
        }
        Ok(())
    }
}

/// Copy of the scheduler's flags and counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LtrSnapshot {
    pub frame_counter: u64,
    pub intra_frame_needed: bool,
    pub last_frame_is_bad: bool,
    pub refer_long_term_outstanding: bool,
    pub create_long_term_outstanding: bool,
    pub have_good_long_term_frame: bool,
    pub good_long_term_frame_index: u8,
    pub intra_frame_counter: u64,
    pub refer_long_term_frame_counter: u64,
    pub create_long_term_frame_counter: u64,
    pub good_long_term_frame_counter: u64,
    pub pending_frames: usize,
    pub inflight_frames: usize,
    pub done_frames: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FrameList {
    Pending,
    Inflight,
    Done,
}

pub struct LtrScheduler {
    pending: VecDeque<LtrFrame>,
    inflight: VecDeque<LtrFrame>,
    done: VecDeque<LtrFrame>,

    /// Counter of the most recent frame. Usually the reference for the next frame unless it got
    /// nacked.
    frame_counter: u64,

    intra_frame_needed: bool,
    /// The most recent frame was nacked and the stream has to be repaired.
    last_frame_is_bad: bool,
    /// Nothing else is tried to repair the stream until this reference gets a response.
    refer_long_term_outstanding: bool,
    /// No new long-term frame is created until this one gets a response.
    create_long_term_outstanding: bool,
    /// Only unset at the start of the stream and after an intra frame.
    have_good_long_term_frame: bool,
    good_long_term_frame_index: u8,

    /// Frames older than this do not affect the stream state.
    intra_frame_counter: u64,
    refer_long_term_frame_counter: u64,
    create_long_term_frame_counter: u64,
    good_long_term_frame_counter: u64,

    config: LtrConfig,
    statistics: Option<Arc<StatisticRegistry>>,
}

impl LtrScheduler {
    pub fn new(config: LtrConfig) -> Result<LtrScheduler, LtrError> {
        config.validate()?;
        Ok(LtrScheduler {
            pending: VecDeque::new(),
            inflight: VecDeque::with_capacity(config.max_inflight_frames + 1),
            done: VecDeque::with_capacity(config.max_done_frames + 1),
            frame_counter: 0,
            intra_frame_needed: false,
            last_frame_is_bad: false,
            refer_long_term_outstanding: false,
            create_long_term_outstanding: false,
            have_good_long_term_frame: false,
            good_long_term_frame_index: 0,
            intra_frame_counter: 0,
            refer_long_term_frame_counter: 0,
            create_long_term_frame_counter: 0,
            good_long_term_frame_counter: 0,
            config,
            statistics: None,
        })
    }

    pub fn with_statistics(mut self, statistics: Arc<StatisticRegistry>) -> LtrScheduler {
        self.statistics = Some(statistics);
        self
    }

    fn record(&self, stat: Statistic) {
        if let Some(statistics) = &self.statistics {
            statistics.record(stat, 1.0);
        }
    }

    pub fn state(&self) -> LtrSnapshot {
        LtrSnapshot {
            frame_counter: self.frame_counter,
            intra_frame_needed: self.intra_frame_needed,
            last_frame_is_bad: self.last_frame_is_bad,
            refer_long_term_outstanding: self.refer_long_term_outstanding,
            create_long_term_outstanding: self.create_long_term_outstanding,
            have_good_long_term_frame: self.have_good_long_term_frame,
            good_long_term_frame_index: self.good_long_term_frame_index,
            intra_frame_counter: self.intra_frame_counter,
            refer_long_term_frame_counter: self.refer_long_term_frame_counter,
            create_long_term_frame_counter: self.create_long_term_frame_counter,
            good_long_term_frame_counter: self.good_long_term_frame_counter,
            pending_frames: self.pending.len(),
            inflight_frames: self.inflight.len(),
            done_frames: self.done.len(),
        }
    }

    /// Returns a copy of the tracked frame sent with `frame_id`.
    pub fn frame(&self, frame_id: u32) -> Option<LtrFrame> {
        self.locate_sent(frame_id)
            .map(|(list, index)| self.list(list)[index])
    }

    /// Iterates over every tracked frame, oldest list first.
    pub fn frames(&self) -> impl Iterator<Item = &LtrFrame> {
        self.done
            .iter()
            .chain(self.inflight.iter())
            .chain(self.pending.iter())
    }

    fn list(&self, list: FrameList) -> &VecDeque<LtrFrame> {
        match list {
            FrameList::Pending => &self.pending,
            FrameList::Inflight => &self.inflight,
            FrameList::Done => &self.done,
        }
    }

    fn list_mut(&mut self, list: FrameList) -> &mut VecDeque<LtrFrame> {
        match list {
            FrameList::Pending => &mut self.pending,
            FrameList::Inflight => &mut self.inflight,
            FrameList::Done => &mut self.done,
        }
    }

    fn dump_state(&self) {
        tracing::debug!(
            "LTR state: frame_counter {} intra_frame_needed {} last_frame_is_bad {} \
             good_long_term {} ({}, {}) intra_frame {} refer_long_term {} ({}) \
             create_long_term {} ({})",
            self.frame_counter,
            self.intra_frame_needed,
            self.last_frame_is_bad,
            self.have_good_long_term_frame,
            self.good_long_term_frame_index,
            self.good_long_term_frame_counter,
            self.intra_frame_counter,
            self.refer_long_term_outstanding,
            self.refer_long_term_frame_counter,
            self.create_long_term_outstanding,
            self.create_long_term_frame_counter,
        );
    }

    /// Drops the excess of the in-flight and done lists; nothing interesting is going to happen
    /// to those frames anymore.
    fn clear_old_frames(&mut self) {
        while self.inflight.len() > self.config.max_inflight_frames {
            if let Some(frame) = self.inflight.pop_front() {
                self.done.push_back(frame);
            }
        }
        while self.done.len() > self.config.max_done_frames {
            self.done.pop_front();
        }
    }

    /// Decides how the next frame should be encoded and queues it as pending.
    pub fn pick_next_action(&mut self) -> LtrAction {
        self.dump_state();
        self.clear_old_frames();

        let (action, reference_frame_counter) = if self.frame_counter == 0
            || self.intra_frame_needed
            // The previous intra frame did not get through in time, try another
            || (!self.have_good_long_term_frame
                && self.frame_counter + 1 - self.intra_frame_counter
                    >= self.config.new_intra_frame_delay)
            // Broken stream with nothing to repair it from
            || (self.last_frame_is_bad && !self.have_good_long_term_frame)
        {
            self.intra_frame_needed = false;
            self.last_frame_is_bad = false;
            (LtrAction::new(FrameType::Intra, 0), 0)
        } else if self.last_frame_is_bad {
            self.last_frame_is_bad = false;
            (
                LtrAction::new(FrameType::ReferLongTerm, self.good_long_term_frame_index),
                self.good_long_term_frame_counter,
            )
        } else if self.have_good_long_term_frame
            && !self.refer_long_term_outstanding
            && !self.create_long_term_outstanding
        {
            // Nothing else going on, so try to make a new long-term frame in the other slot
            let slot = (self.good_long_term_frame_index + 1) % LONG_TERM_SLOTS;
            (
                LtrAction::new(FrameType::CreateLongTerm, slot),
                self.frame_counter,
            )
        } else {
            (LtrAction::new(FrameType::Normal, 0), self.frame_counter)
        };

        self.frame_counter += 1;
        let frame_counter = self.frame_counter;
        self.pending
            .push_back(LtrFrame::new(action, frame_counter, reference_frame_counter));

        match action.frame_type {
            FrameType::Intra => {
                // Frames before this one are still tracked but must not affect the stream
                self.intra_frame_counter = frame_counter;
                self.refer_long_term_outstanding = false;
                self.create_long_term_outstanding = false;
                self.have_good_long_term_frame = false;
                self.record(Statistic::LtrIntraFrames);
            }
            FrameType::ReferLongTerm => {
                // Any long-term frame being created is useless now
                self.refer_long_term_frame_counter = frame_counter;
                self.refer_long_term_outstanding = true;
                self.create_long_term_outstanding = false;
                self.record(Statistic::LtrReferLongTermFrames);
            }
            FrameType::CreateLongTerm => {
                self.create_long_term_frame_counter = frame_counter;
                self.create_long_term_outstanding = true;
                self.record(Statistic::LtrCreateLongTermFrames);
            }
            FrameType::Normal => self.record(Statistic::LtrNormalFrames),
        }

        action
    }

    /// Marks the oldest pending frame as sent with `frame_id`. Frames must be sent in the order
    /// their actions were picked.
    pub fn mark_frame_sent(&mut self, frame_id: u32) -> Result<(), LtrError> {
        let mut frame = self.pending.pop_front().ok_or(LtrError::NoPendingFrame)?;
        frame.frame_id = frame_id;
        frame.sent = true;

        // Already known to be undecodable
        if frame.nack {
            self.done.push_back(frame);
        } else {
            self.inflight.push_back(frame);
        }
        Ok(())
    }

    /// Picks the action for the next frame and marks it as sent with `frame_id`.
    pub fn get_next_action(&mut self, frame_id: u32) -> Result<LtrAction, LtrError> {
        let action = self.pick_next_action();
        self.mark_frame_sent(frame_id)?;
        Ok(action)
    }

    pub fn force_intra(&mut self) {
        self.intra_frame_needed = true;
    }

    fn locate_sent(&self, frame_id: u32) -> Option<(FrameList, usize)> {
        if let Some(index) = self.inflight.iter().position(|f| f.frame_id == frame_id) {
            return Some((FrameList::Inflight, index));
        }
        self.done
            .iter()
            .rposition(|f| f.frame_id == frame_id)
            .map(|index| (FrameList::Done, index))
    }

    fn locate_unfinished(&self, frame_counter: u64) -> Option<(FrameList, usize)> {
        if let Some(index) = self
            .inflight
            .iter()
            .position(|f| f.frame_counter == frame_counter)
        {
            return Some((FrameList::Inflight, index));
        }
        self.pending
            .iter()
            .position(|f| f.frame_counter == frame_counter)
            .map(|index| (FrameList::Pending, index))
    }

    /// Handles an ack for the frame sent with `frame_id`. The frame and every frame it depends
    /// on are known to be decodable.
    pub fn ack(&mut self, frame_id: u32) -> Result<Feedback, LtrError> {
        match self.locate_sent(frame_id) {
            Some((FrameList::Inflight, index)) => {
                let frame_counter = self.inflight[index].frame_counter;
                self.ack_frame(frame_counter)?;
                self.record(Statistic::LtrAcks);
                Ok(Feedback::Applied)
            }
            Some((_, index)) => {
                let frame = self.done[index];
                if frame.nack {
                    Err(LtrError::AckAfterNack { frame_id })
                } else if frame.ack {
                    Ok(Feedback::AlreadyApplied)
                } else {
                    // Expired from the in-flight list
                    Ok(Feedback::Unknown)
                }
            }
            None => {
                tracing::debug!("Ack for unknown frame {frame_id}");
                Ok(Feedback::Unknown)
            }
        }
    }

    fn ack_frame(&mut self, frame_counter: u64) -> Result<(), LtrError> {
        let Some(index) = self
            .inflight
            .iter()
            .position(|f| f.frame_counter == frame_counter)
        else {
            return Ok(());
        };

        let frame = &mut self.inflight[index];
        if frame.nack {
            return Err(LtrError::AckAfterNack {
                frame_id: frame.frame_id,
            });
        }
        if frame.ack {
            return Ok(());
        }
        frame.ack = true;
        let frame = *frame;

        tracing::debug!(
            "Ack for frame {} ({:?}, fc {} ref {})",
            frame.frame_id,
            frame.action,
            frame.frame_counter,
            frame.reference_frame_counter
        );

        // The reference is earlier in the list and decodable too. Ack it first so this frame's
        // effect on the long-term state is applied last.
        let reference = self
            .inflight
            .range(..index)
            .rev()
            .find(|f| f.frame_counter == frame.reference_frame_counter)
            .map(|f| f.frame_counter);
        if let Some(reference) = reference {
            self.ack_frame(reference)?;
        }

        if frame.frame_counter >= self.intra_frame_counter {
            match frame.action.frame_type {
                FrameType::ReferLongTerm => {
                    // An older reference is useless since later frames are already known bad
                    if frame.frame_counter == self.refer_long_term_frame_counter {
                        self.refer_long_term_outstanding = false;
                    }
                }
                FrameType::Intra => self.set_good_long_term_frame(&frame),
                FrameType::CreateLongTerm => {
                    // A superseded attempt did create a long-term frame on the far end, but the
                    // stream was already repaired from another one
                    if frame.frame_counter == self.create_long_term_frame_counter {
                        self.set_good_long_term_frame(&frame);
                        self.create_long_term_outstanding = false;
                    }
                }
                FrameType::Normal => {}
            }
        }

        // Keep the done list ordered so references come before the frames using them
        if let Some(index) = self
            .inflight
            .iter()
            .position(|f| f.frame_counter == frame_counter)
        {
            if let Some(frame) = self.inflight.remove(index) {
                self.done.push_back(frame);
            }
        }
        Ok(())
    }

    fn set_good_long_term_frame(&mut self, frame: &LtrFrame) {
        self.have_good_long_term_frame = true;
        self.good_long_term_frame_index = frame.action.long_term_slot_index;
        self.good_long_term_frame_counter = frame.frame_counter;
    }

    /// Handles a nack for the frame sent with `frame_id`. The frame and every frame depending on
    /// it can't be decoded.
    pub fn nack(&mut self, frame_id: u32) -> Result<Feedback, LtrError> {
        match self.locate_sent(frame_id) {
            Some((FrameList::Inflight, index)) => {
                let frame_counter = self.inflight[index].frame_counter;
                self.nack_frame(frame_counter)?;
                self.record(Statistic::LtrNacks);
                Ok(Feedback::Applied)
            }
            Some((_, index)) => {
                let frame = self.done[index];
                if frame.ack {
                    Err(LtrError::NackAfterAck { frame_id })
                } else if frame.nack {
                    Ok(Feedback::AlreadyApplied)
                } else {
                    Ok(Feedback::Unknown)
                }
            }
            None => {
                tracing::debug!("Nack for unknown frame {frame_id}");
                Ok(Feedback::Unknown)
            }
        }
    }

    fn nack_frame(&mut self, frame_counter: u64) -> Result<(), LtrError> {
        let Some((list, index)) = self.locate_unfinished(frame_counter) else {
            return Ok(());
        };

        let frame = &mut self.list_mut(list)[index];
        if frame.ack {
            return Err(LtrError::NackAfterAck {
                frame_id: frame.frame_id,
            });
        }
        if frame.nack {
            return Ok(());
        }
        frame.nack = true;
        let frame = *frame;

        tracing::debug!(
            "Nack for frame {} ({:?}, fc {} ref {})",
            frame.frame_id,
            frame.action,
            frame.frame_counter,
            frame.reference_frame_counter
        );

        if frame.frame_counter == self.frame_counter {
            self.last_frame_is_bad = true;
        }

        if frame.frame_counter >= self.intra_frame_counter {
            match frame.action.frame_type {
                FrameType::ReferLongTerm
                    if frame.frame_counter == self.refer_long_term_frame_counter =>
                {
                    self.refer_long_term_outstanding = false;
                }
                FrameType::CreateLongTerm
                    if frame.frame_counter == self.create_long_term_frame_counter =>
                {
                    self.create_long_term_outstanding = false;
                }
                _ => {}
            }
        }

        // Pending frames stay put until they are sent
        if list == FrameList::Inflight {
            if let Some(frame) = self.inflight.remove(index) {
                self.done.push_back(frame);
            }
        }

        // Dependents are later in the in-flight list or still pending
        let dependents: Vec<u64> = self
            .inflight
            .iter()
            .chain(self.pending.iter())
            .filter(|f| f.reference_frame_counter == frame_counter)
            .map(|f| f.frame_counter)
            .collect();
        for dependent in dependents {
            self.nack_frame(dependent)?;
        }
        Ok(())
    }

    /// Handles the far end reporting that it can't decode the stream anymore.
    pub fn mark_stream_broken(&mut self) -> Result<(), LtrError> {
        match self.inflight.back() {
            Some(frame) => {
                let frame_counter = frame.frame_counter;
                self.nack_frame(frame_counter)
            }
            None => {
                // The far end claims to have everything we sent, which is inconsistent. Start
                // over with an intra frame.
                tracing::warn!(
                    "Stream marked as broken but all outstanding frames have been received, \
                     starting again with a new intra frame"
                );
                self.dump_state();
                self.intra_frame_needed = true;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashSet;

    fn scheduler() -> LtrScheduler {
        LtrScheduler::new(LtrConfig::default()).unwrap()
    }

    fn next(ltr: &mut LtrScheduler, frame_id: u32) -> LtrAction {
        ltr.get_next_action(frame_id).unwrap()
    }

    #[test]
    fn ltr_simple_sequence() {
        let mut ltr = scheduler();

        // First frame is always intra
        let action = next(&mut ltr, 1);
        assert_eq!(action, LtrAction::new(FrameType::Intra, 0));
        assert_eq!(ltr.state().frame_counter, 1);

        assert_eq!(ltr.ack(1729), Ok(Feedback::Unknown));

        assert_eq!(next(&mut ltr, 2).frame_type, FrameType::Normal);

        assert_eq!(ltr.ack(1), Ok(Feedback::Applied));
        let state = ltr.state();
        assert!(state.have_good_long_term_frame);
        assert_eq!(state.good_long_term_frame_counter, 1);

        // The intra frame is known good, so make a new long-term frame in the other slot
        assert_eq!(
            next(&mut ltr, 3),
            LtrAction::new(FrameType::CreateLongTerm, 1)
        );

        assert_eq!(ltr.ack(2), Ok(Feedback::Applied));
        assert_eq!(next(&mut ltr, 4).frame_type, FrameType::Normal);

        assert_eq!(ltr.ack(3), Ok(Feedback::Applied));
        assert_eq!(
            next(&mut ltr, 5),
            LtrAction::new(FrameType::CreateLongTerm, 0)
        );

        // Transitively nacks the long-term frame just made as well
        assert_eq!(ltr.nack(4), Ok(Feedback::Applied));
        assert!(ltr.frame(5).unwrap().nack);
        assert!(ltr.state().last_frame_is_bad);

        // Repair using the good long-term frame
        assert_eq!(
            next(&mut ltr, 6),
            LtrAction::new(FrameType::ReferLongTerm, 1)
        );
        assert_eq!(ltr.frame(6).unwrap().reference_frame_counter, 3);

        assert_eq!(next(&mut ltr, 7).frame_type, FrameType::Normal);

        assert_eq!(ltr.ack(7), Ok(Feedback::Applied));
        assert!(ltr.frame(6).unwrap().ack);
        assert!(!ltr.state().refer_long_term_outstanding);
    }

    #[test]
    fn ltr_forced_intra() {
        let mut ltr = scheduler();

        // Twenty frames acked with a three frame delay
        for i in 0..20 {
            if i == 10 {
                ltr.force_intra();
            }

            let action = next(&mut ltr, i);
            if i == 0 || i == 10 {
                assert_eq!(action, LtrAction::new(FrameType::Intra, 0));
            } else {
                assert_ne!(action.frame_type, FrameType::Intra);
            }

            if i >= 3 {
                assert_eq!(ltr.ack(i - 3), Ok(Feedback::Applied));
            }
        }
    }

    #[test]
    fn ltr_no_feedback() {
        let mut ltr = scheduler();

        // New intra frames every 60 frames without a response
        for i in 0..300 {
            let action = next(&mut ltr, i);
            if i % 60 == 0 {
                assert_eq!(action, LtrAction::new(FrameType::Intra, 0));
            } else {
                assert_eq!(action, LtrAction::new(FrameType::Normal, 0));
            }

            let state = ltr.state();
            assert!(state.inflight_frames <= 61);
            assert!(state.done_frames <= 60);
        }
    }

    #[test]
    fn ltr_recovery_after_gap() {
        let mut ltr = scheduler();
        let mut last_create_long_term = 0;

        // A hundred frames with twenty in the middle lost
        for i in 0..100 {
            let action = next(&mut ltr, i);

            if i == 0 {
                assert_eq!(action, LtrAction::new(FrameType::Intra, 0));
            } else if i == 60 {
                assert_eq!(action.frame_type, FrameType::ReferLongTerm);
            } else {
                assert_ne!(action.frame_type, FrameType::Intra);
                assert_ne!(action.frame_type, FrameType::ReferLongTerm);
                if action.frame_type == FrameType::CreateLongTerm {
                    last_create_long_term = i;
                }
            }

            if (3..40).contains(&i) {
                assert_eq!(ltr.ack(i - 3), Ok(Feedback::Applied));
            } else if i == 59 {
                assert_eq!(ltr.nack(44), Ok(Feedback::Applied));
            } else if i >= 63 {
                assert_eq!(ltr.ack(i - 3), Ok(Feedback::Applied));
            }
        }

        assert!(last_create_long_term > 60);
    }

    #[test]
    fn nack_of_current_frame_refers_long_term() {
        let mut ltr = scheduler();

        next(&mut ltr, 1);
        ltr.ack(1).unwrap();
        next(&mut ltr, 2);
        next(&mut ltr, 3);

        ltr.nack(3).unwrap();
        let action = ltr.pick_next_action();
        assert_eq!(action, LtrAction::new(FrameType::ReferLongTerm, 0));
    }

    #[test]
    fn nack_without_good_frame_forces_intra() {
        let mut ltr = scheduler();

        next(&mut ltr, 1);
        next(&mut ltr, 2);
        ltr.nack(2).unwrap();
        assert_eq!(next(&mut ltr, 3).frame_type, FrameType::Intra);
    }

    #[test]
    fn double_feedback() {
        let mut ltr = scheduler();

        next(&mut ltr, 1);
        next(&mut ltr, 2);
        next(&mut ltr, 3);

        assert_eq!(ltr.ack(1), Ok(Feedback::Applied));
        assert_eq!(ltr.ack(1), Ok(Feedback::AlreadyApplied));
        assert_eq!(ltr.nack(1), Err(LtrError::NackAfterAck { frame_id: 1 }));

        assert_eq!(ltr.nack(2), Ok(Feedback::Applied));
        assert_eq!(ltr.nack(2), Ok(Feedback::AlreadyApplied));
        assert_eq!(ltr.ack(2), Err(LtrError::AckAfterNack { frame_id: 2 }));

        // Nacked through its reference
        assert_eq!(ltr.nack(3), Ok(Feedback::AlreadyApplied));
    }

    #[test]
    fn ack_propagates_to_references() {
        let mut ltr = scheduler();

        for i in 1..=5 {
            next(&mut ltr, i);
        }
        ltr.ack(5).unwrap();

        for i in 1..=5 {
            assert!(ltr.frame(i).unwrap().ack, "frame {i}");
        }
        let state = ltr.state();
        assert_eq!(state.inflight_frames, 0);
        assert!(state.have_good_long_term_frame);
        assert_eq!(state.good_long_term_frame_counter, 1);

        // Done list is ordered by validity
        let counters: Vec<u64> = ltr.frames().map(|f| f.frame_counter).collect();
        assert_eq!(counters, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn stale_create_long_term_does_not_win() {
        let mut ltr = scheduler();

        next(&mut ltr, 1);
        ltr.ack(1).unwrap();
        // Frame 2 creates a long-term frame in slot 1
        assert_eq!(
            next(&mut ltr, 2),
            LtrAction::new(FrameType::CreateLongTerm, 1)
        );
        next(&mut ltr, 3);
        // Frame 3 is lost, repair by referring to slot 0
        ltr.nack(3).unwrap();
        assert_eq!(
            next(&mut ltr, 4),
            LtrAction::new(FrameType::ReferLongTerm, 0)
        );
        ltr.ack(4).unwrap();
        assert!(!ltr.state().refer_long_term_outstanding);

        // Another attempt at slot 1
        assert_eq!(
            next(&mut ltr, 5),
            LtrAction::new(FrameType::CreateLongTerm, 1)
        );

        // The superseded attempt arrives late and is ignored
        assert_eq!(ltr.ack(2), Ok(Feedback::Applied));
        let state = ltr.state();
        assert_eq!(state.good_long_term_frame_counter, 1);
        assert_eq!(state.good_long_term_frame_index, 0);
        assert!(state.create_long_term_outstanding);

        ltr.ack(5).unwrap();
        let state = ltr.state();
        assert_eq!(state.good_long_term_frame_counter, 5);
        assert_eq!(state.good_long_term_frame_index, 1);
    }

    #[test]
    fn pending_frames_are_nacked_with_their_reference() {
        let mut ltr = scheduler();

        next(&mut ltr, 1);
        next(&mut ltr, 2);
        let action = ltr.pick_next_action();
        assert_eq!(action.frame_type, FrameType::Normal);

        ltr.nack(2).unwrap();
        let pending = ltr.frames().last().copied().unwrap();
        assert!(!pending.sent);
        assert!(pending.nack);

        // Sent straight into the done list
        ltr.mark_frame_sent(3).unwrap();
        assert!(ltr.frame(3).unwrap().nack);
        assert_eq!(ltr.state().inflight_frames, 1);
    }

    #[test]
    fn stream_broken_nacks_last_sent_frame() {
        let mut ltr = scheduler();

        next(&mut ltr, 1);
        ltr.ack(1).unwrap();
        next(&mut ltr, 2);
        next(&mut ltr, 3);

        ltr.mark_stream_broken().unwrap();
        assert!(ltr.frame(3).unwrap().nack);
        assert!(!ltr.frame(2).unwrap().nack);
        assert_eq!(next(&mut ltr, 4).frame_type, FrameType::ReferLongTerm);
    }

    #[test]
    fn stream_broken_with_nothing_inflight_forces_intra() {
        let mut ltr = scheduler();

        next(&mut ltr, 1);
        ltr.ack(1).unwrap();
        assert_eq!(ltr.state().inflight_frames, 0);

        ltr.mark_stream_broken().unwrap();
        assert!(ltr.state().intra_frame_needed);
        assert_eq!(next(&mut ltr, 2).frame_type, FrameType::Intra);
    }

    #[test]
    fn sending_without_action_fails() {
        let mut ltr = scheduler();
        assert_eq!(ltr.mark_frame_sent(1), Err(LtrError::NoPendingFrame));
    }

    #[test]
    fn random_feedback_keeps_invariants() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut ltr = scheduler();
        let mut acked = HashSet::new();
        let mut nacked = HashSet::new();

        for frame_id in 0..2000u32 {
            let action = next(&mut ltr, frame_id);
            if action.frame_type == FrameType::ReferLongTerm {
                assert!(ltr.frame(frame_id).unwrap().reference_frame_counter > 0);
            }

            // Feedback for a random recent frame
            if frame_id >= 5 {
                let target = frame_id - rng.gen_range(1..5);
                let result = if rng.gen_bool(0.9) {
                    ltr.ack(target)
                } else {
                    ltr.nack(target)
                };
                match result {
                    Ok(_) => {}
                    Err(LtrError::AckAfterNack { frame_id }) => assert!(nacked.contains(&frame_id)),
                    Err(LtrError::NackAfterAck { frame_id }) => assert!(acked.contains(&frame_id)),
                    Err(e) => panic!("{e}"),
                }
            }

            // Frame counters are unique and feedback is exclusive
            let mut counters = HashSet::new();
            for frame in ltr.frames() {
                assert!(counters.insert(frame.frame_counter));
                assert!(!(frame.ack && frame.nack));
                if frame.ack {
                    acked.insert(frame.frame_id);
                }
                if frame.nack {
                    nacked.insert(frame.frame_id);
                }
            }

            // A nacked last frame is never followed by a normal frame
            if ltr.state().last_frame_is_bad {
                let action = ltr.pick_next_action();
                assert!(matches!(
                    action.frame_type,
                    FrameType::Intra | FrameType::ReferLongTerm
                ));
                ltr.mark_frame_sent(u32::MAX - frame_id).unwrap();
            }
        }
    }
}
