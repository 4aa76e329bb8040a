//! Error taxonomy for the ISO/IEC 7816-3 reader stack.

use core::fmt;

/// Everything that can go wrong while powering, negotiating with, or
/// talking to a contact smart card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A character, block, or response did not arrive within its allotted
    /// wait time (CGT/WT/CWT/BWT or the ATR timeout).
    Timeout,
    /// TS was neither the direct (0x3B) nor inverse (0x03) convention byte.
    BadTs,
    /// The ATR's TCK, a T=1 LRC, or a T=1 CRC did not match.
    BadChecksum,
    /// The card echoed back a PPS exchange that did not match what was sent.
    PpsRejected,
    /// The requested Fi/Di pairing has no representable divisor of the
    /// available clock, or names a reserved table slot.
    ClockUnrepresentable,
    /// A response would not fit in the caller's buffer.
    OverflowBuffer,
    /// TD1 (or a forced protocol) named something other than T=0 or T=1.
    UnsupportedProtocol,
    /// The card's procedure byte requested T=0 one-byte-at-a-time transfer,
    /// which this stack does not implement.
    T0OneByteUnsupported,
    /// A T=1 S-block arrived that was not expected in the current context.
    UnexpectedSBlock,
    /// T=1 retransmission was exhausted without recovering synchronization.
    LineBroken,
    /// The card was withdrawn, or its presence line dropped mid-session.
    CardLost,
    /// The insertion-detection loop exceeded its retry ceiling.
    InsertionGivesUp,
    /// A byte sequence could not be decoded as a well-formed ATR/TPDU/APDU.
    InvalidEncoding,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ProtocolError::Timeout => "timed out waiting for the card",
            ProtocolError::BadTs => "invalid TS byte",
            ProtocolError::BadChecksum => "checksum mismatch",
            ProtocolError::PpsRejected => "card rejected the PPS request",
            ProtocolError::ClockUnrepresentable => "requested Fi/Di has no usable divisor",
            ProtocolError::OverflowBuffer => "response exceeds buffer capacity",
            ProtocolError::UnsupportedProtocol => "protocol is neither T=0 nor T=1",
            ProtocolError::T0OneByteUnsupported => "card requested T=0 one-byte transfer mode",
            ProtocolError::UnexpectedSBlock => "unexpected T=1 S-block",
            ProtocolError::LineBroken => "T=1 link could not be resynchronized",
            ProtocolError::CardLost => "card was withdrawn",
            ProtocolError::InsertionGivesUp => "gave up waiting for card insertion",
            ProtocolError::InvalidEncoding => "malformed byte encoding",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, ProtocolError>;
