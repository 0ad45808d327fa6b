//! Mining job and result types shared between the job source and the
//! chain driver.

use bitcoin::block::Version;
use bitcoin::hash_types::{BlockHash, TxMerkleNode};
use bitcoin::pow::CompactTarget;

/// A unit of work produced by the job source, read-only to the driver.
///
/// Hashes are held in Bitcoin's internal (little-endian) byte order; the
/// frame codec converts to chip wire order on encode.
#[derive(Debug, Clone)]
pub struct MiningJob {
    /// Identifier assigned by the job source. Opaque here; correlation on
    /// the wire uses the chip-assigned job id byte instead.
    pub id: String,

    /// First nonce of the search window.
    pub starting_nonce: u32,

    /// Encoded difficulty target.
    pub bits: CompactTarget,

    /// Block timestamp.
    pub time: u32,

    /// Transaction merkle tree root.
    pub merkle_root: TxMerkleNode,

    /// Previous block hash.
    pub prev_blockhash: BlockHash,

    /// Base block version; the chip may roll masked bits on top.
    pub version: Version,

    /// Number of precomputed midstates submitted with the job. 1 for
    /// plain jobs; more amortize chip setup across nonce ranges.
    pub num_midstates: u8,
}

/// A completed nonce search reported by a chip.
///
/// Decoded from one RX frame and handed to the result sink immediately;
/// the driver keeps nothing beyond the current poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    /// Chip-assigned id of the job this nonce solves.
    pub job_id: u8,

    /// Winning nonce.
    pub nonce: u32,

    /// Version bits the chip actually used, already shifted into block
    /// header position. Zero unless version rolling is enabled.
    pub version_bits: u32,

    /// Which midstate produced the nonce.
    pub midstate_id: u8,
}
