//! Session FSM (C8): cold reset, protocol negotiation, and the steady
//! `send_apdu` state held for one inserted card.

use crate::apdu::{ApduCommand, ApduResponse};
use crate::atr::{read_atr, Atr};
use crate::channel::{ByteChannel, RxRing};
use crate::error::{ProtocolError, Result};
use crate::hal::{ByteDriver, CardControl, ClockProgram, Ticker};
use crate::pts::negotiate;
use crate::t0::send_apdu_t0;
use crate::t1::{send_apdu_t1, T1Session};
use crate::timing::{delay_cycles, Convention, TimingContext, SC_RST_TIMEOUT_CYCLES};

/// Safety bound on consecutive cold-reset attempts without reaching
/// `IdleCmd`.
pub const MAX_INSERTION_ATTEMPTS: u32 = 2000;

/// Default Fi/Di/clock applied for the very first ATR read, before any PTS
/// negotiation: Fi code 1 (372 cycles/ETU), Di code 1, card clock 5.25 MHz.
pub const DEFAULT_ATR_FI_CODE: u8 = 1;
pub const DEFAULT_ATR_DI_CODE: u8 = 1;
pub const DEFAULT_ATR_CLOCK_HZ: u32 = 5_250_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Idle,
    PowerCard,
    ProtocolNeg,
    IdleCmd,
    /// Reserved for finer-grained instrumentation; never entered.
    WaitResp,
    /// Reserved for finer-grained instrumentation; never entered.
    WaitCmdComp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    Contact,
}

/// Host callback invoked on every transition back to `Idle` via [`lost`].
pub type RemovalHandler = fn();

/// Everything the task owns for one inserted card: the FSM state, the ATR,
/// the negotiated protocol/clock, and the T=1 sliding-sequence/IFSC state
/// (idle and unused when the session is running T=0).
pub struct CardSession {
    pub kind: CardKind,
    pub state: FsmState,
    pub info: Option<Atr>,
    pub protocol: u8,
    /// Fi code currently committed (spec's `F_curr`).
    pub fi_code: u8,
    /// Di code currently committed (spec's `D_curr`).
    pub di_code: u8,
    /// Card clock frequency in Hz (spec's `f_curr`).
    pub f_curr_hz: u32,
    /// Elementary time unit in microseconds (spec's `etu_curr`).
    pub etu_curr_us: u32,
    pub convention: Convention,
    pub timing: TimingContext,
    pub t1: T1Session,
    bus_hz: u32,
    insertion_attempts: u32,
    removal_handler: Option<RemovalHandler>,
}

impl CardSession {
    /// `bus_hz` is the USART reference clock the card-clock divider is
    /// taken from.
    pub fn new(bus_hz: u32) -> Self {
        CardSession {
            kind: CardKind::Contact,
            state: FsmState::Idle,
            info: None,
            protocol: 0,
            fi_code: DEFAULT_ATR_FI_CODE,
            di_code: DEFAULT_ATR_DI_CODE,
            f_curr_hz: DEFAULT_ATR_CLOCK_HZ,
            etu_curr_us: default_atr_etu_us(),
            convention: Convention::Direct,
            timing: TimingContext::default(),
            t1: T1Session::default(),
            bus_hz,
            insertion_attempts: 0,
            removal_handler: None,
        }
    }
}

fn default_atr_etu_us() -> u32 {
    // 372 cycles/ETU at 5.25 MHz.
    (372u64 * 1_000_000 / DEFAULT_ATR_CLOCK_HZ as u64) as u32
}

/// One-shot hardware bring-up: hold RST and VCC low until [`init`] runs the
/// cold-reset sequence.
pub fn early_init(card: &mut dyn CardControl) {
    card.set_rst(false);
    card.set_vcc(false);
}

pub fn is_inserted(card: &dyn CardControl) -> bool {
    card.card_present()
}

/// Host-initiated card removal: the only path back to `Idle` besides a
/// protocol layer reporting `CardLost`.
pub fn lost(session: &mut CardSession) {
    session.state = FsmState::Idle;
    session.info = None;
    session.t1 = T1Session::default();
    if let Some(handler) = session.removal_handler {
        handler();
    }
}

pub fn register_removal_handler(session: &mut CardSession, handler: RemovalHandler) {
    session.removal_handler = Some(handler);
}

/// Negotiation flags for [`init`]; the entirety of this crate's
/// configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InitFlags {
    pub do_negotiate: bool,
    pub do_change_baud: bool,
    pub force_protocol: Option<u8>,
    pub force_etu: Option<u32>,
}

/// Runs `Idle -> PowerCard -> ProtocolNeg -> IdleCmd`. On ATR failure
/// (timeout, bad TS, bad checksum) or PTS failure, re-enters `Idle` and
/// retries the cold reset, up to [`MAX_INSERTION_ATTEMPTS`] times.
pub fn init(
    session: &mut CardSession,
    card: &mut dyn CardControl,
    clock_prog: &mut dyn ClockProgram,
    ring: &mut RxRing,
    driver: &mut dyn ByteDriver,
    ticker: &dyn Ticker,
    flags: InitFlags,
) -> Result<()> {
    loop {
        session.state = FsmState::Idle;
        card.set_rst(false);
        card.set_vcc(false);
        while !card.card_present() {}

        session.state = FsmState::PowerCard;
        session.insertion_attempts += 1;
        if session.insertion_attempts > MAX_INSERTION_ATTEMPTS {
            session.state = FsmState::Idle;
            return Err(ProtocolError::InsertionGivesUp);
        }

        card.set_vcc(true);
        delay_cycles(ticker, SC_RST_TIMEOUT_CYCLES, DEFAULT_ATR_CLOCK_HZ);
        card.set_rst(true);

        session.convention = Convention::Direct;
        let mut chan = ByteChannel::new(ring, driver, ticker, session.convention, session.etu_curr_us);
        let atr = match read_atr(&mut chan, session.timing.wt) {
            Ok(atr) => atr,
            Err(_) => continue,
        };
        // `read_atr` already synced `chan.convention` to the byte it
        // sampled; mirror it onto the session for everything after this
        // loop iteration.
        session.convention = atr.convention;

        session.state = FsmState::ProtocolNeg;
        let negotiated = if flags.do_negotiate {
            negotiate(&mut chan, &atr, session.bus_hz, flags.force_protocol, &session.timing)
        } else {
            crate::pts::default_protocol(&atr)
                .map(|protocol| crate::pts::Negotiated { protocol, clock: None, guard_etu: 1 })
        };
        let negotiated = match negotiated {
            Ok(n) => n,
            Err(_) => continue,
        };

        session.info = Some(atr);
        session.protocol = negotiated.protocol;

        if flags.do_change_baud {
            if let Some(clock) = negotiated.clock {
                session.f_curr_hz = clock.card_clock_hz;
                session.etu_curr_us = clock.etu_us;
                session.timing.cgt = negotiated.guard_etu;
                clock_prog.apply(clock.card_clock_hz, clock.etu_us, negotiated.guard_etu);
            }
        }
        if let Some(etu) = flags.force_etu {
            session.etu_curr_us = etu;
        }

        session.t1 = T1Session::default();
        session.state = FsmState::IdleCmd;
        return Ok(());
    }
}

/// Dispatches `cmd` to T=0 or T=1 per the session's negotiated protocol.
/// Errors never leave `IdleCmd` unless they are `CardLost`, in which case
/// the session drops back to `Idle`.
pub fn send_apdu(
    session: &mut CardSession,
    ring: &mut RxRing,
    driver: &mut dyn ByteDriver,
    ticker: &dyn Ticker,
    cmd: &ApduCommand,
) -> Result<ApduResponse> {
    let mut chan = ByteChannel::new(ring, driver, ticker, session.convention, session.etu_curr_us);
    let result = match session.protocol {
        1 => send_apdu_t1(&mut chan, &mut session.t1, &mut session.timing, cmd),
        _ => send_apdu_t0(&mut chan, cmd, &session.timing),
    };
    if result == Err(ProtocolError::CardLost) {
        lost(session);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeDriver, FakeTicker};

    struct FakeCard {
        present: bool,
        rst: bool,
        vcc: bool,
    }

    impl CardControl for FakeCard {
        fn set_rst(&mut self, high: bool) { self.rst = high; }
        fn set_vcc(&mut self, high: bool) { self.vcc = high; }
        fn card_present(&self) -> bool { self.present }
    }

    struct FakeClockProgram {
        applied: Option<(u32, u32, u32)>,
    }
    impl ClockProgram for FakeClockProgram {
        fn apply(&mut self, card_clock_hz: u32, baud_divisor: u32, guard_program: u32) {
            self.applied = Some((card_clock_hz, baud_divisor, guard_program));
        }
    }

    #[test]
    fn early_init_drives_rst_and_vcc_low() {
        let mut card = FakeCard { present: false, rst: true, vcc: true };
        early_init(&mut card);
        assert!(!card.rst);
        assert!(!card.vcc);
    }

    #[test]
    fn lost_resets_to_idle_and_clears_state() {
        let mut session = CardSession::new(4_000_000);
        session.state = FsmState::IdleCmd;
        session.t1.send_seq = 1;
        lost(&mut session);
        assert_eq!(session.state, FsmState::Idle);
        assert!(session.info.is_none());
        assert_eq!(session.t1.send_seq, 0);
    }

    #[test]
    fn init_runs_to_idle_cmd_with_minimal_atr_and_no_negotiation() {
        let mut session = CardSession::new(4_000_000);
        let mut card = FakeCard { present: true, rst: false, vcc: false };
        let mut clock_prog = FakeClockProgram { applied: None };
        let mut ring: RxRing = RxRing::new();
        // Minimal ATR: direct convention, no interface bytes, no TCK.
        ring.try_push(0x3B);
        ring.try_push(0x00);
        let mut driver = FakeDriver::new();
        let ticker = FakeTicker::new();

        let flags = InitFlags { do_negotiate: false, do_change_baud: false, force_protocol: None, force_etu: None };
        init(&mut session, &mut card, &mut clock_prog, &mut ring, &mut driver, &ticker, flags).unwrap();

        assert_eq!(session.state, FsmState::IdleCmd);
        assert_eq!(session.protocol, 0);
        assert!(card.rst);
        assert!(card.vcc);
        assert!(session.info.is_some());
    }

    #[test]
    fn insertion_ceiling_gives_up_when_exhausted() {
        // Pre-exhaust the ceiling so the very first pass through
        // `PowerCard` trips it, rather than driving 2000 real cold-reset
        // attempts (or a timeout loop `FakeTicker` cannot honestly model).
        let mut session = CardSession::new(4_000_000);
        session.insertion_attempts = MAX_INSERTION_ATTEMPTS;
        let mut card = FakeCard { present: true, rst: false, vcc: false };
        let mut clock_prog = FakeClockProgram { applied: None };
        let mut ring: RxRing = RxRing::new();
        let mut driver = FakeDriver::new();
        let ticker = FakeTicker::new();

        let flags = InitFlags::default();
        let result = init(&mut session, &mut card, &mut clock_prog, &mut ring, &mut driver, &ticker, flags);
        assert_eq!(result, Err(ProtocolError::InsertionGivesUp));
        assert_eq!(session.state, FsmState::Idle);
    }

    #[test]
    fn send_apdu_dispatches_t1_when_protocol_is_one() {
        let mut session = CardSession::new(4_000_000);
        session.protocol = 1;
        session.state = FsmState::IdleCmd;
        let mut ring: RxRing = RxRing::new();
        let resp_body = [0x00u8, 0x40, 0x02, 0x90, 0x00];
        for b in resp_body {
            ring.try_push(b);
        }
        ring.try_push(crate::t1::lrc(&resp_body));
        let mut driver = FakeDriver::new();
        let ticker = FakeTicker::new();
        let cmd = ApduCommand {
            cla: 0x00,
            ins: 0xA4,
            p1: 0x04,
            p2: 0x00,
            data: heapless::Vec::new(),
            le: 0,
            send_le: crate::apdu::LeEncoding::Absent,
        };
        let resp = send_apdu(&mut session, &mut ring, &mut driver, &ticker, &cmd).unwrap();
        assert_eq!(resp.status_word(), 0x9000);
    }
}
