//! T=1 (block-oriented) APDU transmission: TPDU framing, LRC/CRC epilogue,
//! sliding sequence numbers, chaining, R-block error recovery, and S-block
//! waiting-time extension.

use crate::apdu::{ApduCommand, ApduResponse};
use crate::channel::ByteChannel;
use crate::error::{ProtocolError, Result};
use crate::timing::TimingContext;
use heapless::consts::*;
use heapless::Vec;

/// Default information-field size for the card, per §4.7; overridden by a
/// card's TA3 when present and in range `[1, 0xFE]`.
pub const IFSC_DEFAULT: usize = 32;
/// Consecutive R-block (or EDC-mismatch) errors tolerated before the link
/// is declared broken.
pub const MAX_R_RETRIES: u8 = 3;

const S_RESYNCH: u8 = 0;
const S_IFS: u8 = 1;
const S_ABORT: u8 = 2;
const S_WTX: u8 = 3;

/// Epilogue checksum in force for the session, selected once from TC2 bit 0
/// and held stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdcType {
    Lrc,
    Crc,
}

/// One TPDU: NAD is always zero (single-slot addressing only), PCB
/// classifies the block, and `data` is the information field (max 254
/// bytes, the largest `u8`-encodable `LEN`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpdu {
    pub nad: u8,
    pub pcb: u8,
    pub data: Vec<u8, U254>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RError {
    None,
    Edc,
    Other,
}

/// The decoded meaning of a PCB byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    I { seq: u8, chaining: bool },
    R { seq: u8, error: RError },
    S { code: u8, response: bool },
}

impl BlockKind {
    pub fn from_pcb(pcb: u8) -> Self {
        if pcb & 0x80 == 0 {
            BlockKind::I { seq: (pcb >> 6) & 1, chaining: pcb & 0x20 != 0 }
        } else if pcb & 0x40 == 0 {
            let error = match pcb & 0x03 {
                0 => RError::None,
                1 => RError::Edc,
                _ => RError::Other,
            };
            BlockKind::R { seq: (pcb >> 4) & 1, error }
        } else {
            BlockKind::S { code: pcb & 0x1F, response: pcb & 0x20 != 0 }
        }
    }

    pub fn to_pcb(self) -> u8 {
        match self {
            BlockKind::I { seq, chaining } => ((seq & 1) << 6) | if chaining { 0x20 } else { 0 },
            BlockKind::R { seq, error } => {
                let e = match error {
                    RError::None => 0,
                    RError::Edc => 1,
                    RError::Other => 2,
                };
                0x80 | ((seq & 1) << 4) | e
            }
            BlockKind::S { code, response } => 0xC0 | if response { 0x20 } else { 0 } | (code & 0x1F),
        }
    }
}

/// Per-session T=1 state: the sliding sequence counters, the negotiated
/// IFSC, and the epilogue type. Lives inside `CardSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct T1Session {
    pub ifsc: usize,
    pub edc_type: EdcType,
    pub send_seq: u8,
    pub recv_seq: u8,
}

impl Default for T1Session {
    fn default() -> Self {
        T1Session { ifsc: IFSC_DEFAULT, edc_type: EdcType::Lrc, send_seq: 0, recv_seq: 0 }
    }
}

impl T1Session {
    /// Applies a card-offered TA3 IFSC, if any; values 0x00 and 0xFF are
    /// reserved and leave the default in place.
    pub fn with_ifsc_from_ta3(mut self, ta3: Option<u8>) -> Self {
        if let Some(v) = ta3 {
            if v >= 1 && v <= 0xFE {
                self.ifsc = v as usize;
            }
        }
        self
    }
}

pub fn lrc(buf: &[u8]) -> u8 {
    buf.iter().fold(0u8, |acc, b| acc ^ b)
}

/// CRC-CCITT, polynomial 0x8408 (the bit-reflected form of 0x1021), seed
/// 0xFFFF, final one's complement. The returned value is placed on the
/// wire high byte first.
pub fn crc_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        crc ^= b as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

fn prologue_and_data(tpdu: &Tpdu) -> Result<Vec<u8, U258>> {
    let mut out: Vec<u8, U258> = Vec::new();
    out.push(tpdu.nad).map_err(|_| ProtocolError::OverflowBuffer)?;
    out.push(tpdu.pcb).map_err(|_| ProtocolError::OverflowBuffer)?;
    out.push(tpdu.data.len() as u8).map_err(|_| ProtocolError::OverflowBuffer)?;
    out.extend_from_slice(&tpdu.data).map_err(|_| ProtocolError::OverflowBuffer)?;
    Ok(out)
}

/// Sends one TPDU on the wire: prologue, information field, then the LRC or
/// CRC epilogue.
pub fn write_tpdu(
    chan: &mut ByteChannel,
    tpdu: &Tpdu,
    edc_type: EdcType,
    timing: &TimingContext,
) -> Result<()> {
    chan.put_byte(tpdu.nad, timing)?;
    chan.put_byte(tpdu.pcb, timing)?;
    chan.put_byte(tpdu.data.len() as u8, timing)?;
    for b in tpdu.data.iter() {
        chan.put_byte(*b, timing)?;
    }
    let pd = prologue_and_data(tpdu)?;
    match edc_type {
        EdcType::Lrc => chan.put_byte(lrc(&pd), timing)?,
        EdcType::Crc => {
            let crc = crc_ccitt(&pd);
            chan.put_byte((crc >> 8) as u8, timing)?;
            chan.put_byte((crc & 0xFF) as u8, timing)?;
        }
    }
    Ok(())
}

/// Reads one TPDU, validating its epilogue. The first byte (NAD) is read
/// with `first_byte_wait` (BWT for a fresh receive); every subsequent byte
/// uses CWT. Returns the parsed TPDU and whether its EDC matched, never an
/// error purely for EDC mismatch (the caller decides how to react).
pub fn read_tpdu(
    chan: &mut ByteChannel,
    timing: &TimingContext,
    first_byte_wait: u32,
    edc_type: EdcType,
) -> Result<(Tpdu, bool)> {
    let nad = chan.get_byte(first_byte_wait)?;
    let pcb = chan.get_byte(timing.cwt)?;
    let len = chan.get_byte(timing.cwt)?;
    let mut data: Vec<u8, U254> = Vec::new();
    for _ in 0..len {
        let b = chan.get_byte(timing.cwt)?;
        data.push(b).map_err(|_| ProtocolError::OverflowBuffer)?;
    }
    let tpdu = Tpdu { nad, pcb, data };
    let pd = prologue_and_data(&tpdu)?;
    let edc_ok = match edc_type {
        EdcType::Lrc => {
            let want = chan.get_byte(timing.cwt)?;
            lrc(&pd) == want
        }
        EdcType::Crc => {
            let hi = chan.get_byte(timing.cwt)?;
            let lo = chan.get_byte(timing.cwt)?;
            crc_ccitt(&pd) == (((hi as u16) << 8) | lo as u16)
        }
    };
    Ok((tpdu, edc_ok))
}

fn block_guard_time(chan: &ByteChannel, timing: &TimingContext) {
    timing.delay_etus(chan.ticker(), timing.bgt, chan.etu_us);
}

fn wtx_factor(resp: &Tpdu) -> u32 {
    resp.data.get(0).copied().unwrap_or(1).max(1) as u32
}

fn wtx_echo(
    chan: &mut ByteChannel,
    t1: &T1Session,
    timing: &mut TimingContext,
    resp: &Tpdu,
) -> Result<()> {
    let echo = Tpdu {
        nad: 0,
        pcb: BlockKind::S { code: S_WTX, response: true }.to_pcb(),
        data: resp.data.clone(),
    };
    block_guard_time(chan, timing);
    write_tpdu(chan, &echo, t1.edc_type, timing)?;
    timing.bwt = timing.bwt.saturating_mul(wtx_factor(resp));
    Ok(())
}

/// Sends one I-block, retrying on EDC mismatch or R-block error up to
/// `MAX_R_RETRIES`, servicing any waiting-time-extension S-block along the
/// way. For a non-final (chained) block this returns `Ok(None)` once the
/// positive R-ACK arrives and flips `send_seq`; for the final block it
/// returns the first TPDU of the response, unvalidated against `recv_seq`
/// (the caller, `receive_loop`, owns that check and the toggle).
fn send_i_block_with_retry(
    chan: &mut ByteChannel,
    t1: &mut T1Session,
    timing: &mut TimingContext,
    chunk: &[u8],
    chaining: bool,
) -> Result<Option<Tpdu>> {
    let seq = t1.send_seq;
    let mut retries = 0u8;

    'resend: loop {
        let mut data: Vec<u8, U254> = Vec::new();
        data.extend_from_slice(chunk).map_err(|_| ProtocolError::OverflowBuffer)?;
        let out = Tpdu { nad: 0, pcb: BlockKind::I { seq, chaining }.to_pcb(), data };

        block_guard_time(chan, timing);
        write_tpdu(chan, &out, t1.edc_type, timing)?;

        // Wait for a reply to THIS transmission. A corrupted frame or a
        // WTX request is serviced here without touching the I-block we
        // just sent; only a negative R-block naming our own sequence (the
        // card telling us it got garbage) sends us back to 'resend.
        loop {
            let (resp, edc_ok) = read_tpdu(chan, timing, timing.bwt, t1.edc_type)?;

            if !edc_ok {
                retries += 1;
                if retries >= MAX_R_RETRIES {
                    return Err(ProtocolError::LineBroken);
                }
                block_guard_time(chan, timing);
                // Best-effort sequence bit from the corrupted frame's own
                // PCB; only the epilogue is suspect, framing bytes are
                // trusted. This asks the card to resend its last block.
                let nack_seq = (resp.pcb >> 6) & 1;
                let nack = Tpdu { nad: 0, pcb: BlockKind::R { seq: nack_seq, error: RError::Edc }.to_pcb(), data: Vec::new() };
                write_tpdu(chan, &nack, t1.edc_type, timing)?;
                continue;
            }

            match BlockKind::from_pcb(resp.pcb) {
                BlockKind::R { seq: rseq, error } => {
                    if error != RError::None && rseq == seq {
                        retries += 1;
                        if retries >= MAX_R_RETRIES {
                            return Err(ProtocolError::LineBroken);
                        }
                        block_guard_time(chan, timing);
                        continue 'resend;
                    }
                    if error == RError::None && chaining && rseq == (seq ^ 1) {
                        t1.send_seq ^= 1;
                        return Ok(None);
                    }
                    return Err(ProtocolError::UnexpectedSBlock);
                }
                BlockKind::S { code, response: false } if code == S_WTX => {
                    wtx_echo(chan, t1, timing, &resp)?;
                    continue;
                }
                BlockKind::S { .. } => return Err(ProtocolError::UnexpectedSBlock),
                BlockKind::I { .. } if !chaining => return Ok(Some(resp)),
                BlockKind::I { .. } => return Err(ProtocolError::UnexpectedSBlock),
            }
        }
    }
}

fn ack_and_pull(
    chan: &mut ByteChannel,
    t1: &mut T1Session,
    timing: &mut TimingContext,
    ack_seq: u8,
) -> Result<Tpdu> {
    let mut r_errors = 0u8;
    loop {
        block_guard_time(chan, timing);
        let ack = Tpdu { nad: 0, pcb: BlockKind::R { seq: ack_seq, error: RError::None }.to_pcb(), data: Vec::new() };
        write_tpdu(chan, &ack, t1.edc_type, timing)?;

        let (resp, edc_ok) = read_tpdu(chan, timing, timing.bwt, t1.edc_type)?;
        if !edc_ok {
            r_errors += 1;
            if r_errors >= MAX_R_RETRIES {
                return Err(ProtocolError::LineBroken);
            }
            continue;
        }
        match BlockKind::from_pcb(resp.pcb) {
            BlockKind::I { .. } => return Ok(resp),
            BlockKind::S { code, response: false } if code == S_WTX => {
                wtx_echo(chan, t1, timing, &resp)?;
                continue;
            }
            _ => return Err(ProtocolError::UnexpectedSBlock),
        }
    }
}

/// Appends chained I-blocks into a response buffer, ACKing each one, until
/// a block with the chain-bit clear terminates the exchange. Splits the
/// trailing two bytes into SW1/SW2.
fn receive_loop(
    chan: &mut ByteChannel,
    t1: &mut T1Session,
    timing: &mut TimingContext,
    first: Tpdu,
) -> Result<ApduResponse> {
    let mut data: Vec<u8, U512> = Vec::new();
    let mut block = first;

    loop {
        let (seq, chaining) = match BlockKind::from_pcb(block.pcb) {
            BlockKind::I { seq, chaining } => (seq, chaining),
            _ => return Err(ProtocolError::UnexpectedSBlock),
        };
        if seq != t1.recv_seq {
            return Err(ProtocolError::UnexpectedSBlock);
        }
        data.extend_from_slice(&block.data).map_err(|_| ProtocolError::OverflowBuffer)?;
        t1.recv_seq ^= 1;

        if !chaining {
            break;
        }
        block = ack_and_pull(chan, t1, timing, seq ^ 1)?;
    }

    if data.len() < 2 {
        return Err(ProtocolError::InvalidEncoding);
    }
    let sw2 = data.pop().unwrap();
    let sw1 = data.pop().unwrap();
    Ok(ApduResponse { data, sw1, sw2 })
}

/// Sends a logically-encoded APDU over T=1, chunked to the session's IFSC,
/// and returns the card's reassembled response.
pub fn send_apdu_t1(
    chan: &mut ByteChannel,
    t1: &mut T1Session,
    timing: &mut TimingContext,
    cmd: &ApduCommand,
) -> Result<ApduResponse> {
    let logical = cmd.logical_encode()?;
    let ifsc = t1.ifsc.max(1);
    let chunk_count = if logical.is_empty() { 1 } else { (logical.len() + ifsc - 1) / ifsc };

    let mut offset = 0usize;
    let mut final_tpdu = None;
    for i in 0..chunk_count {
        let end = (offset + ifsc).min(logical.len());
        let chunk = &logical[offset..end];
        offset = end;
        let is_final = i + 1 == chunk_count;

        let outcome = send_i_block_with_retry(chan, t1, timing, chunk, !is_final)?;
        if is_final {
            final_tpdu = outcome;
        }
    }

    let first = final_tpdu.ok_or(ProtocolError::InvalidEncoding)?;
    receive_loop(chan, t1, timing, first)
}
