//! Electrical convention and the wait-time constants that govern every
//! inter-character and inter-block delay in the stack.

use crate::hal::Ticker;

/// Electrical transmission convention signalled by the ATR's TS byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// Raw TS = 0x3B. Bits are sent MSB-first, logic 1 is the high level.
    Direct,
    /// Raw TS = 0x03, which mirrors to the canonical 0x3F. Bits are sent
    /// LSB-first, logic 0 is the high level.
    Inverse,
}

impl Convention {
    /// `ts` is the byte exactly as sampled off the wire, before any
    /// mirroring: the card always drives the same physical pattern, and a
    /// receiver naively decoding it under the direct convention sees 0x3B
    /// for a direct-convention card and 0x03 for an inverse-convention one.
    pub fn from_ts(ts: u8) -> Option<Self> {
        match ts {
            0x3B => Some(Convention::Direct),
            0x03 => Some(Convention::Inverse),
            _ => None,
        }
    }
}

/// `b' = reverse_bits(!b)`. Applying this twice is the identity; it is how
/// a byte received or sent under the inverse convention is translated to
/// and from its direct-convention value.
pub fn mirror(b: u8) -> u8 {
    (!b).reverse_bits()
}

/// Default timing values per ISO/IEC 7816-3, all expressed in ETUs except
/// `rst_timeout_cycles`, which is in card-clock cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingContext {
    /// Character guard time: minimum delay between leading edges of two
    /// consecutive characters sent in the same direction.
    pub cgt: u32,
    /// Wait time: maximum delay allowed between two consecutive characters.
    pub wt: u32,
    /// Block guard time: minimum delay between the leading edges of two
    /// characters of opposite direction (T=1).
    pub bgt: u32,
    /// Character wait time (T=1 I/R-block inter-character delay).
    pub cwt: u32,
    /// Block wait time (T=1 time to the first character of a response).
    pub bwt: u32,
}

pub const ATR_ETU_TIMEOUT: u32 = 110;
pub const SC_RST_TIMEOUT_CYCLES: u32 = 400_000;

impl Default for TimingContext {
    fn default() -> Self {
        TimingContext {
            cgt: 0,
            wt: 9600,
            bgt: 22,
            cwt: 1 << 13,
            bwt: 1 << 4,
        }
    }
}

impl TimingContext {
    /// Busy-waits until `ticker` has advanced by at least `etus` elementary
    /// time units at the given `etu_us` (an ETU's duration in microseconds).
    pub fn delay_etus(&self, ticker: &dyn Ticker, etus: u32, etu_us: u32) {
        let start = ticker.now_us();
        let target = start + (etus as u64) * (etu_us as u64);
        while ticker.now_us() < target {}
    }
}

/// Busy-waits `cycles` card-clock cycles at `f_hz`, i.e. `cycles·1e6/f_hz`
/// microseconds. Used for the cold-reset RST delay, which the card clock
/// measures in cycles rather than ETUs since no ETU is in force yet.
pub fn delay_cycles(ticker: &dyn Ticker, cycles: u32, f_hz: u32) {
    if f_hz == 0 {
        return;
    }
    let start = ticker.now_us();
    let target = start + (cycles as u64) * 1_000_000 / (f_hz as u64);
    while ticker.now_us() < target {}
}
