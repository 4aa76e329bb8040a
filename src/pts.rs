//! PPS/PTS negotiation (ISO/IEC 7816-3 §9).

use crate::atr::Atr;
use crate::channel::ByteChannel;
use crate::clock::ClockNegotiator;
use crate::error::{ProtocolError, Result};
use crate::timing::TimingContext;
use heapless::consts::*;
use heapless::Vec;

const PTSS: u8 = 0xFF;

/// Outcome of a successful negotiation: the protocol now in force, the
/// clock/timing context to apply if the card accepted a change, and the
/// extra guard time (in ETUs) the card asked for via TC1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub protocol: u8,
    pub clock: Option<crate::clock::CommittedClock>,
    pub guard_etu: u32,
}

/// The protocol named by TD1 (`groups[0].td`), constrained to {0,1} — the
/// only two protocols this stack implements — or T=0 if TD1 is absent.
pub fn default_protocol(atr: &Atr) -> Result<u8> {
    let protocol = atr.td1().map(|td| td & 0x0F).unwrap_or(0);
    if protocol != 0 && protocol != 1 {
        return Err(ProtocolError::UnsupportedProtocol);
    }
    Ok(protocol)
}

/// Negotiates a protocol and, optionally, Fi/Di and extra guard time, via
/// a PPS request/response exchange. If `atr`'s TA2 specifies "specific
/// mode" (bit 7 set), no PPS is attempted and the ATR-specified protocol
/// and default clock are used unconditionally.
pub fn negotiate(
    chan: &mut ByteChannel,
    atr: &Atr,
    bus_hz: u32,
    requested_protocol: Option<u8>,
    timing: &TimingContext,
) -> Result<Negotiated> {
    let ta2 = atr.groups.get(1).and_then(|g| g.ta);
    if let Some(ta2) = ta2 {
        if ta2 & 0x80 != 0 {
            let protocol = ta2 & 0x0F;
            return Ok(Negotiated { protocol, clock: None, guard_etu: 1 });
        }
    }

    let protocol = match requested_protocol {
        Some(p) => {
            if p != 0 && p != 1 {
                return Err(ProtocolError::UnsupportedProtocol);
            }
            p
        }
        None => default_protocol(atr)?,
    };

    let ta1 = atr.groups.get(0).and_then(|g| g.ta);
    let tc1 = atr.groups.get(0).and_then(|g| g.tc);
    let asked_ta1 = ta1.is_some();
    let asked_tc1 = tc1.is_some();

    let pts0_present_mask = ((asked_ta1 as u8) << 4) | ((asked_tc1 as u8) << 5);
    let pts0 = pts0_present_mask | (protocol & 0x0F);

    let mut request: Vec<u8, U6> = Vec::new();
    let _ = request.push(PTSS);
    let _ = request.push(pts0);
    if let Some(ta1) = ta1 { let _ = request.push(ta1); }
    if let Some(tc1) = tc1 { let _ = request.push(tc1); }
    let mut pck = 0u8;
    for b in request.iter() { pck ^= *b; }
    let _ = request.push(pck);

    for b in request.iter() {
        chan.put_byte(*b, timing)?;
    }

    let mut echoed: Vec<u8, U6> = Vec::new();
    for _ in 0..request.len() {
        echoed.push(chan.get_byte(timing.wt)?).map_err(|_| ProtocolError::InvalidEncoding)?;
    }
    if echoed != request {
        return Err(ProtocolError::PpsRejected);
    }

    let clock = if asked_ta1 || asked_tc1 {
        let ta1 = ta1.unwrap_or(0x11);
        let fi_code = (ta1 & 0xF0) >> 4;
        let di_code = ta1 & 0x0F;
        Some(ClockNegotiator::commit(bus_hz, fi_code, di_code)?)
    } else {
        None
    };
    // TC1 carries the card's preferred extra guard time directly; absent
    // TC1, the guard time is left at its default of 1 ETU.
    let guard_etu = tc1.map(|v| v as u32).unwrap_or(1);

    Ok(Negotiated { protocol, clock, guard_etu })
}
