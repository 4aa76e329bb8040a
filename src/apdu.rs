//! Shared APDU command/response data model (ISO/IEC 7816-4).
//!
//! Both engines (T=0 and T=1) build their wire encodings from the same
//! logical command; only the framing around it differs.

use crate::error::{ProtocolError, Result};
use heapless::consts::*;
use heapless::Vec;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// Matches `APDU_MAX_BUFF_LEN` in the original header: the largest command
/// data or response body this stack will hold without an allocator.
pub const APDU_MAX_BUFF_LEN: usize = 512;
pub const SHORT_APDU_LC_MAX: usize = 255;
pub const SHORT_APDU_LE_MAX: usize = 256;

/// How (and whether) the command asks for a response.
///
/// `ShortPreferred` is promoted to extended form by [`ApduCommand::case`]
/// and [`ApduCommand::logical_encode`] whenever `le > 256` with no `Lc`
/// present, since a short-form Le byte cannot name more than 256.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum LeEncoding {
    Absent = 0,
    ShortPreferred = 1,
    ForceExtended = 2,
}

impl LeEncoding {
    pub fn from_wire(v: u8) -> Option<Self> {
        FromPrimitive::from_u8(v)
    }
}

/// A logical APDU command: CLA INS P1 P2 [Lc data] [Le].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8, U512>,
    /// Expected response length, `0..=65536` (`65536` names "as much as the
    /// card has"; a short-form Le byte of `0x00` also means this).
    pub le: u32,
    pub send_le: LeEncoding,
}

impl ApduCommand {
    /// ISO/IEC 7816-4 case number: 1 (no data, no Le), 2 (Le only), 3 (data
    /// only), or 4 (data and Le).
    pub fn case(&self) -> u8 {
        match (!self.data.is_empty(), self.send_le != LeEncoding::Absent) {
            (false, false) => 1,
            (false, true) => 2,
            (true, false) => 3,
            (true, true) => 4,
        }
    }

    /// `true` once either Lc or Le no longer fits the short (single-byte)
    /// form, per §4.6/§4.7: extended Lc is three bytes (`0x00 hi lo`) and
    /// extended Le is two (or three, with no Lc) bytes.
    pub fn uses_extended(&self) -> bool {
        self.data.len() > SHORT_APDU_LC_MAX
            || (self.send_le != LeEncoding::Absent && self.le > SHORT_APDU_LE_MAX as u32)
    }

    /// Builds the full logical byte encoding of this command: header, the
    /// Lc/data block if any, and the Le block if requested. This is the
    /// "logically encoded form" that §4.6's ENVELOPE fragmenter and §4.7's
    /// T=1 chaining both split into fixed-size chunks.
    pub fn logical_encode(&self) -> Result<Vec<u8, U576>> {
        let mut out: Vec<u8, U576> = Vec::new();
        let push = |v: &mut Vec<u8, U576>, b: u8| v.push(b).map_err(|_| ProtocolError::OverflowBuffer);
        push(&mut out, self.cla)?;
        push(&mut out, self.ins)?;
        push(&mut out, self.p1)?;
        push(&mut out, self.p2)?;

        let extended = self.uses_extended();
        let want_le = self.send_le != LeEncoding::Absent;

        if extended {
            if !self.data.is_empty() {
                push(&mut out, 0x00)?;
                push(&mut out, (self.data.len() >> 8) as u8)?;
                push(&mut out, (self.data.len() & 0xFF) as u8)?;
                out.extend_from_slice(&self.data).map_err(|_| ProtocolError::OverflowBuffer)?;
            }
            if want_le {
                if self.data.is_empty() {
                    push(&mut out, 0x00)?;
                }
                let le = if self.le >= 65536 { 0 } else { self.le };
                push(&mut out, (le >> 8) as u8)?;
                push(&mut out, (le & 0xFF) as u8)?;
            }
        } else {
            if !self.data.is_empty() {
                push(&mut out, self.data.len() as u8)?;
                out.extend_from_slice(&self.data).map_err(|_| ProtocolError::OverflowBuffer)?;
            }
            if want_le {
                let le_byte = if self.le == 0 || self.le >= 256 { 0 } else { self.le as u8 };
                push(&mut out, le_byte)?;
            }
        }
        Ok(out)
    }
}

/// An APDU response body plus its trailing status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8, U512>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ApduResponse {
    pub fn status_word(&self) -> u16 { ((self.sw1 as u16) << 8) | self.sw2 as u16 }
    pub fn is_success(&self) -> bool { self.status_word() == 0x9000 }
    /// `61xx`: more response data is available via GET RESPONSE.
    pub fn more_available(&self) -> Option<u8> {
        if self.sw1 == 0x61 { Some(self.sw2) } else { None }
    }
}
