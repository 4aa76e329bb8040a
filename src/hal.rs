//! Traits the reader-side hardware collaborators must implement.
//!
//! The USART-in-smartcard-mode driver, the RST/VCC/presence GPIOs, and the
//! microsecond tick source live outside this crate. These traits are the
//! seam: an implementation of all four is enough to drive a real board.

/// State of an in-flight byte transmit, mirroring the driver's own pending
/// bookkeeping so the caller never blocks inside an interrupt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
#[repr(u32)]
pub enum PendingState {
    Idle = 0,
    Sending = 1,
    Sent = 2,
    RetryParity = 3,
    RetryFrame = 4,
}

impl PendingState {
    /// Decodes the raw value of a hardware pending-send register, for
    /// drivers that expose it as a bare `u32` rather than this enum.
    pub fn from_register(v: u32) -> Option<Self> {
        num_traits::FromPrimitive::from_u32(v)
    }
}

/// Raw byte transmit, independent of convention (the caller mirrors bytes
/// before handing them over when the inverse convention is in effect).
pub trait ByteDriver {
    /// Start sending `byte`. Must not block.
    fn begin_send(&mut self, byte: u8);
    /// Poll the state of the most recent `begin_send`.
    fn pending_state(&self) -> PendingState;
}

/// RST/VCC/presence control for a single contact slot.
pub trait CardControl {
    fn set_rst(&mut self, high: bool);
    fn set_vcc(&mut self, high: bool);
    /// `true` when a card is seated in the slot.
    fn card_present(&self) -> bool;
}

/// Applies a negotiated clock/baud/guard-time program to the USART and its
/// clock generator. `card_clock_hz` is the frequency delivered to the card;
/// `baud_divisor` is the resulting ETU expressed in USART bit-clock ticks;
/// `guard_program` is the extra guard time in ETUs (the card's TC1, or 1 if
/// it didn't supply one).
pub trait ClockProgram {
    fn apply(&mut self, card_clock_hz: u32, baud_divisor: u32, guard_program: u32);
}

/// Monotonic microsecond clock.
pub trait Ticker {
    fn now_us(&self) -> u64;
}
