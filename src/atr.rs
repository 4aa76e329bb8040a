//! Answer-To-Reset acquisition and parsing.

use crate::channel::ByteChannel;
use crate::error::{ProtocolError, Result};
use crate::timing::{mirror, Convention, ATR_ETU_TIMEOUT};
use heapless::consts::*;
use heapless::Vec;

/// One TA/TB/TC/TD interface byte group following TS/T0 or a TDi.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceBytes {
    pub ta: Option<u8>,
    pub tb: Option<u8>,
    pub tc: Option<u8>,
    pub td: Option<u8>,
}

/// Parsed ATR. Historical bytes are opaque here; interpreting their
/// category byte / TLV structure is left to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atr {
    pub convention: Convention,
    /// Number of historical bytes (`T0 & 0x0F`).
    pub h_num: u8,
    /// Interface byte groups, one per TDi present, in wire order. Index 0
    /// is the group signalled by T0 itself (TA1/TB1/TC1/TD1).
    pub groups: Vec<InterfaceBytes, U4>,
    pub historical_bytes: Vec<u8, U16>,
    /// `Some` only if at least one TDi indicated a protocol other than
    /// T=0, which is when the checksum byte is mandatory.
    pub tck: Option<u8>,
}

impl Atr {
    /// TD1 itself, i.e. the interface byte group T0 announces
    /// (`groups[0]`). Protocol selection reads only this byte, never the
    /// rest of the TD chain.
    pub fn td1(&self) -> Option<u8> {
        self.groups.get(0).and_then(|g| g.td)
    }
}

/// Reads and parses an ATR from the channel, validating TCK when present.
///
/// Mirrors the ATR acquisition loop: TS has its own timeout
/// (`ATR_ETU_TIMEOUT`), every subsequent byte uses the current `wt`, and
/// the rolling `mask` tracks which of TA/TB/TC/TD the most recent TD byte
/// announced for the next group.
pub fn read_atr(chan: &mut ByteChannel, wt: u32) -> Result<Atr> {
    // TS is read raw (direct convention) since the convention is not yet
    // known; the byte's own value identifies it either way: 0x3B for a
    // direct-convention card, 0x03 for an inverse-convention one.
    let ts_raw = chan.get_byte(ATR_ETU_TIMEOUT)?;
    let convention = crate::timing::Convention::from_ts(ts_raw).ok_or(ProtocolError::BadTs)?;
    chan.convention = convention;
    // The wire pattern for an inverse-convention card decodes as 0x03 under
    // a naive direct read; mirror it to the canonical 0x3F before it joins
    // the running checksum alongside every other (already-decoded) byte.
    let ts = match convention {
        Convention::Direct => ts_raw,
        Convention::Inverse => mirror(ts_raw),
    };
    let t0 = chan.get_byte(wt)?;
    let h_num = t0 & 0x0F;
    let mut mask = (t0 & 0xF0) >> 4;

    let mut groups: Vec<InterfaceBytes, U4> = Vec::new();
    let mut any_td_nonzero_proto = false;

    loop {
        if mask == 0 {
            break;
        }
        let mut group = InterfaceBytes::default();
        if mask & 0x1 != 0 {
            group.ta = Some(chan.get_byte(wt)?);
        }
        if mask & 0x2 != 0 {
            group.tb = Some(chan.get_byte(wt)?);
        }
        if mask & 0x4 != 0 {
            group.tc = Some(chan.get_byte(wt)?);
        }
        let next_mask = if mask & 0x8 != 0 {
            let td = chan.get_byte(wt)?;
            group.td = Some(td);
            if td & 0x0F != 0 {
                any_td_nonzero_proto = true;
            }
            (td & 0xF0) >> 4
        } else {
            0
        };
        groups.push(group).map_err(|_| ProtocolError::InvalidEncoding)?;
        mask = next_mask;
        if groups.len() >= groups.capacity() {
            break;
        }
    }

    let mut historical_bytes: Vec<u8, U16> = Vec::new();
    for _ in 0..h_num {
        let b = chan.get_byte(wt)?;
        historical_bytes.push(b).map_err(|_| ProtocolError::InvalidEncoding)?;
    }

    let tck = if any_td_nonzero_proto {
        Some(chan.get_byte(wt)?)
    } else {
        None
    };

    if let Some(tck) = tck {
        let mut xor = ts ^ t0;
        for g in groups.iter() {
            if let Some(b) = g.ta { xor ^= b; }
            if let Some(b) = g.tb { xor ^= b; }
            if let Some(b) = g.tc { xor ^= b; }
            if let Some(b) = g.td { xor ^= b; }
        }
        for b in historical_bytes.iter() {
            xor ^= *b;
        }
        xor ^= tck;
        if xor != 0 {
            return Err(ProtocolError::BadChecksum);
        }
    }

    Ok(Atr { convention, h_num, groups, historical_bytes, tck })
}
