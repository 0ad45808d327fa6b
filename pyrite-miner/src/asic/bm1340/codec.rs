//! Wire framing for the BM1340 chip protocol.
//!
//! Host-to-chip frames open with `55 AA`, chip-to-host frames with
//! `AA 55`. Commands are CRC5-protected; the 82-byte job frame uses a
//! CRC16 transmitted big-endian. All multi-byte job fields are
//! little-endian except the two 32-byte hashes, which cross the wire with
//! their eight 4-byte words in reversed order.
//!
//! Everything here packs and unpacks byte-by-byte; nothing depends on
//! struct memory layout.

use bitcoin::block::Version;
use bitcoin::hash_types::{BlockHash, TxMerkleNode};
use bitcoin::hashes::Hash;
use bitcoin::pow::CompactTarget;
use bitvec::prelude::*;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use strum::FromRepr;

use super::crc::{crc16, crc5};
use crate::error::EncodingError;
use crate::job::MiningJob;

pub(crate) const TX_PREAMBLE: [u8; 2] = [0x55, 0xaa];
pub(crate) const RX_PREAMBLE: [u8; 2] = [0xaa, 0x55];

/// Fixed size of the job frame payload:
/// job_id(1) + num_midstates(1) + starting_nonce(4) + nbits(4) + ntime(4)
/// + merkle_root(32) + prev_block_hash(32) + version(4).
pub const JOB_PAYLOAD_LEN: usize = 82;

/// Job frame length counted from the flags byte: flags + length field +
/// payload + CRC16.
const JOB_FRAME_LEN: usize = 1 + 1 + JOB_PAYLOAD_LEN + 2;

/// Every chip-to-host frame is 11 bytes: preamble, 8 payload bytes, and a
/// trailer byte holding the response type (top 3 bits) and CRC5 (low 5).
pub const RESPONSE_LEN: usize = 11;

const RESPONSE_DATA_LEN: usize = RESPONSE_LEN - RX_PREAMBLE.len();
const TRAILER_CRC_MASK: u8 = 0x1f;

/// Rolled version bits sit in block header bits 13..29.
const VERSION_SHIFT: u32 = 13;

/// Formats a byte slice as space-separated hex for frame tracing.
pub(crate) struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Registers the driver programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegisterAddress {
    ChipId = 0x00,
    PllDivider = 0x08,
    TicketMask = 0x14,
    UartBaud = 0x28,
    VersionMask = 0xa4,
}

#[repr(u8)]
enum FrameType {
    Job = 1,
    Command = 2,
}

#[repr(u8)]
enum CommandKind {
    SetChipAddress = 0,
    WriteRegisterOrJob = 1,
    ReadRegister = 2,
    ChainInactive = 3,
}

/// The flags byte: frame type in bits 5..7, broadcast in bit 4, command
/// kind in bits 0..4.
fn flags(typ: FrameType, broadcast: bool, kind: CommandKind) -> u8 {
    let mut byte = 0u8;
    let bits = byte.view_bits_mut::<Lsb0>();
    bits[5..7].store(typ as u8);
    bits.set(4, broadcast);
    bits[0..4].store(kind as u8);
    byte
}

/// Host-to-chip control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Put the chain into addressing mode so address assignments forward
    /// chip to chip.
    ChainInactive,
    /// Assign an address to the first unaddressed chip.
    SetChipAddress { address: u8 },
    ReadRegister {
        broadcast: bool,
        chip_address: u8,
        register: RegisterAddress,
    },
    WriteRegister {
        broadcast: bool,
        chip_address: u8,
        register: RegisterAddress,
        value: [u8; 4],
    },
}

impl Command {
    /// Serialize to a complete wire frame, preamble and CRC5 included.
    pub fn to_frame(&self) -> BytesMut {
        let mut dst = BytesMut::with_capacity(16);
        dst.put_slice(&TX_PREAMBLE);

        match *self {
            Command::ChainInactive => {
                dst.put_u8(flags(FrameType::Command, true, CommandKind::ChainInactive));
                dst.put_u8(0x05); // flags + length + 2 reserved + crc
                dst.put_u8(0x00);
                dst.put_u8(0x00);
            }
            Command::SetChipAddress { address } => {
                dst.put_u8(flags(FrameType::Command, false, CommandKind::SetChipAddress));
                dst.put_u8(0x05);
                dst.put_u8(address);
                dst.put_u8(0x00);
            }
            Command::ReadRegister {
                broadcast,
                chip_address,
                register,
            } => {
                dst.put_u8(flags(FrameType::Command, broadcast, CommandKind::ReadRegister));
                dst.put_u8(0x05);
                dst.put_u8(chip_address);
                dst.put_u8(register as u8);
            }
            Command::WriteRegister {
                broadcast,
                chip_address,
                register,
                value,
            } => {
                dst.put_u8(flags(
                    FrameType::Command,
                    broadcast,
                    CommandKind::WriteRegisterOrJob,
                ));
                dst.put_u8(0x09); // flags + length + addr + register + 4 data + crc
                dst.put_u8(chip_address);
                dst.put_u8(register as u8);
                dst.put_slice(&value);
            }
        }

        let crc = crc5(&dst[TX_PREAMBLE.len()..]);
        dst.put_u8(crc);
        dst
    }
}

/// Reverse the order of the eight 4-byte words in a 32-byte hash. The
/// transform is its own inverse, so it converts in both directions
/// between Bitcoin's internal order and chip wire order.
fn swap_hash_words(src: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, word) in src.chunks_exact(4).enumerate() {
        out[(7 - i) * 4..(8 - i) * 4].copy_from_slice(word);
    }
    out
}

/// Structured view of a job frame payload, as recovered by
/// [`WireJobFrame::unpack`]. Hashes are back in internal byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFields {
    pub job_id: u8,
    pub num_midstates: u8,
    pub starting_nonce: u32,
    pub bits: CompactTarget,
    pub time: u32,
    pub merkle_root: TxMerkleNode,
    pub prev_blockhash: BlockHash,
    pub version: Version,
}

/// The fixed-layout binary encoding of one mining job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireJobFrame {
    payload: [u8; JOB_PAYLOAD_LEN],
}

impl WireJobFrame {
    /// Most midstates the chip accepts per job.
    pub const MAX_MIDSTATES: u8 = 4;

    /// Pack a job into its wire payload. Rejects jobs the chip cannot
    /// take before anything is transmitted.
    pub fn encode(job: &MiningJob, job_id: u8) -> Result<Self, EncodingError> {
        if job.num_midstates == 0 {
            return Err(EncodingError::ZeroMidstates);
        }
        if job.num_midstates > Self::MAX_MIDSTATES {
            return Err(EncodingError::TooManyMidstates {
                got: job.num_midstates,
                max: Self::MAX_MIDSTATES,
            });
        }

        let mut payload = [0u8; JOB_PAYLOAD_LEN];
        payload[0] = job_id;
        payload[1] = job.num_midstates;
        payload[2..6].copy_from_slice(&job.starting_nonce.to_le_bytes());
        payload[6..10].copy_from_slice(&job.bits.to_consensus().to_le_bytes());
        payload[10..14].copy_from_slice(&job.time.to_le_bytes());
        payload[14..46].copy_from_slice(&swap_hash_words(&job.merkle_root.to_byte_array()));
        payload[46..78].copy_from_slice(&swap_hash_words(&job.prev_blockhash.to_byte_array()));
        payload[78..82].copy_from_slice(&(job.version.to_consensus() as u32).to_le_bytes());

        Ok(Self { payload })
    }

    pub fn payload(&self) -> &[u8; JOB_PAYLOAD_LEN] {
        &self.payload
    }

    /// Serialize to a complete wire frame: preamble, flags, length,
    /// payload, CRC16 (big-endian).
    pub fn to_frame(&self) -> BytesMut {
        let mut dst = BytesMut::with_capacity(TX_PREAMBLE.len() + JOB_FRAME_LEN);
        dst.put_slice(&TX_PREAMBLE);
        dst.put_u8(flags(FrameType::Job, false, CommandKind::WriteRegisterOrJob));
        dst.put_u8(JOB_FRAME_LEN as u8);
        dst.put_slice(&self.payload);
        let crc = crc16(&dst[TX_PREAMBLE.len()..]);
        dst.put_slice(&crc.to_be_bytes());
        dst
    }

    /// Recover the structured fields from the payload. Diagnostic aid for
    /// captured-frame inspection; also the inverse of [`Self::encode`].
    pub fn unpack(&self) -> JobFields {
        let p = &self.payload;
        let word = |range: std::ops::Range<usize>| {
            u32::from_le_bytes([p[range.start], p[range.start + 1], p[range.start + 2], p[range.end - 1]])
        };

        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&p[14..46]);
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&p[46..78]);

        JobFields {
            job_id: p[0],
            num_midstates: p[1],
            starting_nonce: word(2..6),
            bits: CompactTarget::from_consensus(word(6..10)),
            time: word(10..14),
            merkle_root: TxMerkleNode::from_byte_array(swap_hash_words(&merkle)),
            prev_blockhash: BlockHash::from_byte_array(swap_hash_words(&prev)),
            version: Version::from_consensus(word(78..82) as i32),
        }
    }
}

#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ResponseKind {
    RegisterValue = 0,
    Nonce = 4,
}

/// Chip-to-host frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Register readback: `value(4 LE) chip_address(1) register(1)
    /// reserved(2)`.
    RegisterValue {
        chip_address: u8,
        register: u8,
        value: [u8; 4],
    },
    /// Completed nonce search: `nonce(4 LE) midstate_id(1) job_id(1)
    /// version(2 BE)`.
    Nonce {
        job_id: u8,
        nonce: u32,
        /// Version bits used, shifted into block header position.
        version_bits: u32,
        midstate_id: u8,
    },
}

/// Result of one decode attempt over the receive accumulator.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A complete, valid frame was consumed.
    Frame(Response),
    /// Fewer bytes than one frame are buffered; keep them and poll again.
    Incomplete,
    /// Structurally invalid bytes were dropped up to the next plausible
    /// frame boundary. Recoverable; the driver treats it as a desync.
    Invalid { discarded: usize },
}

/// Check the trailer CRC of the 9 data bytes of a response. The CRC is
/// computed with the trailer's CRC bits cleared and stored in those bits.
fn response_crc_ok(data: &[u8; RESPONSE_DATA_LEN]) -> bool {
    let mut shadow = *data;
    shadow[RESPONSE_DATA_LEN - 1] &= !TRAILER_CRC_MASK;
    crc5(&shadow) == data[RESPONSE_DATA_LEN - 1] & TRAILER_CRC_MASK
}

fn find_preamble(buf: &[u8]) -> Option<usize> {
    buf.windows(RX_PREAMBLE.len())
        .position(|pair| pair == &RX_PREAMBLE)
}

/// Try to decode one response frame from the front of `src`.
///
/// Consumes exactly one frame's worth of bytes on success; on an invalid
/// frame, consumes up to the next candidate preamble so the following
/// call starts at a plausible boundary. Never fails hard: garbage on the
/// line produces [`DecodeOutcome::Invalid`], not an error.
pub fn decode_response(src: &mut BytesMut) -> DecodeOutcome {
    match find_preamble(src) {
        Some(0) => {}
        Some(n) => {
            src.advance(n);
            return DecodeOutcome::Invalid { discarded: n };
        }
        None => {
            // Keep a trailing 0xAA; it may be the first half of the next
            // frame's preamble.
            let keep = usize::from(src.last() == Some(&RX_PREAMBLE[0]));
            let n = src.len() - keep;
            if n == 0 {
                return DecodeOutcome::Incomplete;
            }
            src.advance(n);
            return DecodeOutcome::Invalid { discarded: n };
        }
    }

    if src.len() < RESPONSE_LEN {
        return DecodeOutcome::Incomplete;
    }

    let mut data = [0u8; RESPONSE_DATA_LEN];
    data.copy_from_slice(&src[RX_PREAMBLE.len()..RESPONSE_LEN]);

    if !response_crc_ok(&data) {
        // False preamble or corrupted frame; skip to the next candidate.
        let skip = match find_preamble(&src[RX_PREAMBLE.len()..]) {
            Some(n) => n + RX_PREAMBLE.len(),
            None => {
                let keep = usize::from(src.last() == Some(&RX_PREAMBLE[0]));
                src.len() - keep
            }
        };
        src.advance(skip);
        return DecodeOutcome::Invalid { discarded: skip };
    }

    src.advance(RESPONSE_LEN);

    let kind = data[RESPONSE_DATA_LEN - 1] >> 5;
    match ResponseKind::from_repr(kind) {
        Some(ResponseKind::RegisterValue) => DecodeOutcome::Frame(Response::RegisterValue {
            value: [data[0], data[1], data[2], data[3]],
            chip_address: data[4],
            register: data[5],
        }),
        Some(ResponseKind::Nonce) => DecodeOutcome::Frame(Response::Nonce {
            nonce: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            midstate_id: data[4],
            job_id: data[5],
            version_bits: u32::from(u16::from_be_bytes([data[6], data[7]])) << VERSION_SHIFT,
        }),
        None => DecodeOutcome::Invalid {
            discarded: RESPONSE_LEN,
        },
    }
}

/// Build the 11-byte wire form of a response. Used by tests and bus
/// simulators; the driver only ever decodes.
#[cfg(test)]
pub(crate) fn seal_response(payload: [u8; 8], kind: u8) -> [u8; RESPONSE_LEN] {
    let mut frame = [0u8; RESPONSE_LEN];
    frame[..2].copy_from_slice(&RX_PREAMBLE);
    frame[2..10].copy_from_slice(&payload);
    frame[10] = kind << 5;
    frame[10] |= crc5(&frame[2..]) & TRAILER_CRC_MASK;
    frame
}

/// PLL divider settings for one hash frequency, derived from the 25 MHz
/// crystal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PllConfig {
    pub fb_div: u8,
    pub ref_div: u8,
    /// Post dividers packed as `(post1-1) << 4 | (post2-1)`.
    pub post_div: u8,
}

impl PllConfig {
    pub const CRYSTAL_MHZ: f32 = 25.0;
    pub const MIN_MHZ: f32 = 50.0;
    pub const MAX_MHZ: f32 = 800.0;

    /// Search the divider space for the closest achievable frequency.
    /// Returns `None` when the request is out of range or no combination
    /// lands within 1 MHz.
    pub fn for_frequency(mhz: f32) -> Option<Self> {
        if !(Self::MIN_MHZ..=Self::MAX_MHZ).contains(&mhz) {
            return None;
        }

        let mut best: Option<(f32, Self)> = None;
        for ref_div in [2u8, 1] {
            for post1 in (1u8..=7).rev() {
                // post2 must not exceed post1
                for post2 in (1u8..=post1).rev() {
                    let fb = (f32::from(post1) * f32::from(post2) * mhz * f32::from(ref_div)
                        / Self::CRYSTAL_MHZ)
                        .round();
                    // Feedback divider register range
                    if !(160.0..=239.0).contains(&fb) {
                        continue;
                    }
                    let candidate = Self {
                        fb_div: fb as u8,
                        ref_div,
                        post_div: ((post1 - 1) << 4) | (post2 - 1),
                    };
                    let error = (mhz - candidate.actual_mhz()).abs();
                    if error < 1.0 && best.is_none_or(|(e, _)| error < e) {
                        best = Some((error, candidate));
                    }
                }
            }
        }

        best.map(|(_, config)| config)
    }

    /// The frequency these dividers actually produce.
    pub fn actual_mhz(&self) -> f32 {
        let post1 = f32::from(((self.post_div >> 4) & 0xf) + 1);
        let post2 = f32::from((self.post_div & 0xf) + 1);
        Self::CRYSTAL_MHZ * f32::from(self.fb_div) / (f32::from(self.ref_div) * post1 * post2)
    }

    /// Register bytes: VCO flag, feedback, reference, post dividers.
    pub fn register_value(&self) -> [u8; 4] {
        let vco_mhz = Self::CRYSTAL_MHZ * f32::from(self.fb_div) / f32::from(self.ref_div);
        let flag = if vco_mhz >= 2400.0 { 0x50 } else { 0x40 };
        [flag, self.fb_div, self.ref_div, self.post_div]
    }
}

/// The nonce-reporting threshold register. Derived from the job
/// difficulty rounded down to a power of two; the chip compares against
/// bit-reversed hash bytes, so the mask bytes are bit-reversed and
/// byte-swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketMask {
    bytes: [u8; 4],
}

impl TicketMask {
    pub fn from_difficulty(difficulty: u32) -> Self {
        let mask = largest_power_of_two(difficulty).saturating_sub(1);
        let mut bytes = [0u8; 4];
        for (i, byte) in mask.to_le_bytes().into_iter().enumerate() {
            bytes[3 - i] = reverse_bits(byte);
        }
        Self { bytes }
    }

    pub fn register_value(&self) -> [u8; 4] {
        self.bytes
    }
}

fn largest_power_of_two(n: u32) -> u32 {
    if n == 0 {
        return 1;
    }
    1 << (31 - n.leading_zeros())
}

fn reverse_bits(byte: u8) -> u8 {
    let mut out = 0u8;
    for i in 0..8 {
        out = (out << 1) | ((byte >> i) & 1);
    }
    out
}

/// UART rates the chain supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudRate {
    /// 115200 baud, the rate chips wake up at.
    Default,
    /// 1 Mbaud, for initialized chains.
    Max,
}

impl BaudRate {
    pub fn bits_per_sec(&self) -> u32 {
        match self {
            BaudRate::Default => 115_200,
            BaudRate::Max => 1_000_000,
        }
    }

    pub fn register_value(&self) -> [u8; 4] {
        let raw: u32 = match self {
            BaudRate::Default => 0x0000_0271,
            BaudRate::Max => 0x0002_3011,
        };
        raw.to_le_bytes()
    }
}

/// Version-rolling register payload: the enable pattern plus the 16
/// rollable bits of the mask (header bits 13..29).
pub fn version_mask_register(mask: u32) -> [u8; 4] {
    const ENABLE_ROLLING: u16 = 0x0090;
    let rolled = ((mask >> VERSION_SHIFT) & 0xffff) as u16;
    let mut out = [0u8; 4];
    out[..2].copy_from_slice(&ENABLE_ROLLING.to_le_bytes());
    out[2..].copy_from_slice(&rolled.to_le_bytes());
    out
}
