//! Test doubles for the hardware seam traits. Only compiled for tests.

use crate::hal::{ByteDriver, PendingState, Ticker};
use core::cell::Cell;
use heapless::consts::*;
use heapless::Vec;

pub struct FakeTicker {
    pub now: Cell<u64>,
}

impl FakeTicker {
    pub fn new() -> Self { FakeTicker { now: Cell::new(0) } }
    pub fn advance(&self, us: u64) { self.now.set(self.now.get() + us); }
}

impl Ticker for FakeTicker {
    fn now_us(&self) -> u64 { self.now.get() }
}

/// A driver that accepts every send instantly and records what was sent.
pub struct FakeDriver {
    pub sent: Vec<u8, U64>,
}

impl FakeDriver {
    pub fn new() -> Self { FakeDriver { sent: Vec::new() } }
}

impl ByteDriver for FakeDriver {
    fn begin_send(&mut self, byte: u8) {
        let _ = self.sent.push(byte);
    }
    fn pending_state(&self) -> PendingState { PendingState::Sent }
}
