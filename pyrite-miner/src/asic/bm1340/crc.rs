//! Frame checksums for the BM1340 serial protocol.
//!
//! Command and response frames carry a 5-bit CRC (USB polynomial); job
//! frames carry a 16-bit CRC (CCITT-FALSE), transmitted big-endian.

use crc_all::CrcAlgo;

const CRC5_INIT: u8 = 0x1f;

const CRC5: CrcAlgo<u8> = CrcAlgo::<u8>::new(
    0x5,       // polynomial (CRC-5-USB)
    5,         // width
    CRC5_INIT, // init
    0,         // xorout
    false,     // reflect
);

/// CRC-5 over a byte slice. For command frames this runs over everything
/// after the preamble, excluding the CRC byte itself.
pub fn crc5(data: &[u8]) -> u8 {
    let mut crc = CRC5_INIT;
    CRC5.update_crc(&mut crc, data);
    CRC5.finish_crc(&crc)
}

const CRC16_INIT: u16 = 0xFFFF;

const CRC16: CrcAlgo<u16> = CrcAlgo::<u16>::new(
    0x1021,     // polynomial (CRC-16-CCITT-FALSE)
    16,         // width
    CRC16_INIT, // init
    0,          // xorout
    false,      // reflect
);

/// CRC-16 over a job frame body (flags, length and job data; the preamble
/// is excluded).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    CRC16.update_crc(&mut crc, data);
    CRC16.finish_crc(&crc)
}
