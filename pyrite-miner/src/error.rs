//! Crate-wide error types.
//!
//! Recoverable protocol conditions (desync, empty poll) are not errors;
//! they're expressed as [`PollOutcome`](crate::asic::bm1340::PollOutcome)
//! values so the driver keeps running through them. The variants here are
//! the conditions a caller has to act on.

/// Errors surfaced by the ASIC link driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Every job id in the rolling space is still awaiting results. The
    /// caller must back off, retire stale jobs, or drop this one; the
    /// driver never overwrites an outstanding id.
    #[error("no free job id ({outstanding} outstanding)")]
    WorkQueueFull { outstanding: usize },

    /// The job cannot be represented in the chip's wire format. Detected
    /// before any bytes hit the bus, so nothing is partially sent.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// Work was submitted before a successful handshake.
    #[error("link not initialized")]
    NotInitialized,

    /// No PLL divider combination reaches the requested frequency.
    #[error("unsupported hash frequency {mhz} MHz")]
    InvalidFrequency { mhz: f32 },

    /// Transport-level I/O failure. Distinct from protocol desync: the
    /// connection is gone, not merely misaligned.
    #[error("serial transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job-to-wire encoding failures.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("job requests {got} midstates, chip supports at most {max}")]
    TooManyMidstates { got: u8, max: u8 },

    #[error("job midstate count must be at least 1")]
    ZeroMidstates,
}

pub type Result<T, E = DriverError> = std::result::Result<T, E>;
