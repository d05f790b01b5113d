/// How the encoder should code a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Refers to the previous frame.
    Normal,
    /// Decodable on its own. Also stored in long-term slot 0.
    Intra,
    /// Refers to the previous frame and is stored in a long-term slot.
    CreateLongTerm,
    /// Refers to the frame held in a long-term slot instead of the previous frame.
    ReferLongTerm,
}

/// Number of long-term reference slots on the decoder side.
pub const LONG_TERM_SLOTS: u8 = 2;

/// Action passed to the encoder for the next frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LtrAction {
    pub frame_type: FrameType,
    /// Slot written by `CreateLongTerm` or read by `ReferLongTerm`; zero otherwise.
    pub long_term_slot_index: u8,
}

impl LtrAction {
    pub(crate) const fn new(frame_type: FrameType, long_term_slot_index: u8) -> LtrAction {
        LtrAction {
            frame_type,
            long_term_slot_index,
        }
    }
}

/// Book-keeping for a frame the scheduler picked an action for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LtrFrame {
    pub action: LtrAction,
    /// Monotonic counter of the frame, starting at 1.
    pub frame_counter: u64,
    /// Counter of the frame this one was encoded with reference to. Zero if it has no reference.
    pub reference_frame_counter: u64,
    /// Identifier assigned by the caller when the frame is sent, used to match acks and nacks.
    pub frame_id: u32,
    pub sent: bool,
    pub ack: bool,
    pub nack: bool,
}

impl LtrFrame {
    pub(crate) fn new(action: LtrAction, frame_counter: u64, reference_frame_counter: u64) -> Self {
        LtrFrame {
            action,
            frame_counter,
            reference_frame_counter,
            frame_id: 0,
            sent: false,
            ack: false,
            nack: false,
        }
    }
}
