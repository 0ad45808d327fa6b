//! Link driver for a chain of BM1340 hashing chips.
//!
//! The driver owns the serial session: chain enumeration, register
//! configuration, work dispatch and non-blocking result retrieval.
//! Callers run it from one control loop; nothing here blocks
//! indefinitely.
//!
//! Desync recovery: a malformed frame moves the link to
//! [`LinkState::Degraded`] and drops buffered bytes up to the next
//! plausible frame boundary. The next validly decoded frame returns the
//! link to [`LinkState::Running`]; no reset is required.

pub mod codec;
pub mod crc;

use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};

use crate::error::{DriverError, Result};
use crate::job::{MiningJob, TaskResult};
use crate::tracing::prelude::*;
use crate::transport::Transport;
use codec::{
    BaudRate, Command, DecodeOutcome, HexBytes, PllConfig, RegisterAddress, Response, TicketMask,
    WireJobFrame, version_mask_register,
};

/// Chip id reported in the ChipId register.
const CHIP_ID_BYTES: [u8; 2] = [0x13, 0x40];

/// Chips are addressed every other bus address.
const CHIP_ADDRESS_STRIDE: u8 = 2;

/// Job ids roll through multiples of 8 in 0..128; the chip echoes the id
/// with midstate bits folded into the low three bits.
const JOB_ID_STRIDE: u8 = 8;
const JOB_ID_SPACE: u8 = 128;
const JOB_ID_FIELD_MASK: u8 = 0x78;

/// Distinct ids available before [`DriverError::WorkQueueFull`].
pub const MAX_INFLIGHT_JOBS: usize = (JOB_ID_SPACE / JOB_ID_STRIDE) as usize;

/// How long `init` listens for chip id responses.
const HANDSHAKE_WINDOW: Duration = Duration::from_secs(1);
const HANDSHAKE_POLL: Duration = Duration::from_millis(10);

/// Pause between writing the baud register and switching the local rate,
/// so the chips latch the change first.
const BAUD_SETTLE: Duration = Duration::from_millis(10);

/// Upper bound on buffered receive bytes. Overflow indicates the decoder
/// has lost the frame boundary; oldest bytes are discarded.
const RX_BUFFER_CAP: usize = 256;

/// Link session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Uninitialized,
    Handshaking,
    Running,
    /// Frame sync lost; recovering. Work submission still allowed.
    Degraded,
}

/// What one `process_work` poll produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A chip finished a nonce search.
    Completed(TaskResult),
    /// No complete frame available yet.
    Pending,
    /// Malformed bytes were dropped; the link is resynchronizing.
    Desync,
}

/// Driver knobs. Frame tracing is a diagnostic side channel; protocol
/// behavior is identical with it off.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Log transmitted frames as hex at trace level.
    pub trace_tx_frames: bool,
    /// Log received bytes as hex at trace level.
    pub trace_rx_frames: bool,
}

/// Driver for one BM1340 chain over one serial transport.
pub struct Bm1340Driver<T: Transport> {
    transport: T,
    config: DriverConfig,
    state: LinkState,
    rx_buf: BytesMut,
    /// One bit per job id slot (id / 8).
    outstanding: u16,
    next_job_id: u8,
    chip_count: u16,
    desync_count: u64,
}

impl<T: Transport> Bm1340Driver<T> {
    pub fn new(transport: T, config: DriverConfig) -> Self {
        Self {
            transport,
            config,
            state: LinkState::Uninitialized,
            rx_buf: BytesMut::with_capacity(RX_BUFFER_CAP),
            outstanding: 0,
            next_job_id: 0,
            chip_count: 0,
            desync_count: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Chips detected by the last successful `init`.
    pub fn chip_count(&self) -> u16 {
        self.chip_count
    }

    /// Job ids currently awaiting results.
    pub fn outstanding_jobs(&self) -> usize {
        self.outstanding.count_ones() as usize
    }

    /// Malformed-frame events since construction.
    pub fn desync_count(&self) -> u64 {
        self.desync_count
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Enumerate the chain and program initial frequency and difficulty.
    ///
    /// Returns the number of chips that answered the handshake. Zero means
    /// no chip responded within the window; the link stays uninitialized
    /// and the caller decides whether that is fatal.
    pub async fn init(&mut self, frequency: f32, asic_count: u16, difficulty: u32) -> Result<u16> {
        info!(
            frequency_mhz = frequency,
            expected_chips = asic_count,
            difficulty,
            "Initializing BM1340 chain"
        );
        self.state = LinkState::Handshaking;
        self.rx_buf.clear();
        self.outstanding = 0;
        self.next_job_id = 0;
        self.chip_count = 0;

        self.transport.clear().await?;
        self.send_command(&Command::ReadRegister {
            broadcast: true,
            chip_address: 0,
            register: RegisterAddress::ChipId,
        })
        .await?;

        let chips = self.count_chips().await?;
        if chips == 0 {
            warn!("No chips responded within the handshake window");
            self.state = LinkState::Uninitialized;
            return Ok(0);
        }
        if chips != asic_count {
            warn!(
                detected = chips,
                expected = asic_count,
                "Chain length differs from configuration"
            );
        }

        self.send_command(&Command::ChainInactive).await?;
        for chip in 0..chips {
            self.send_command(&Command::SetChipAddress {
                address: (chip as u8).wrapping_mul(CHIP_ADDRESS_STRIDE),
            })
            .await?;
        }

        self.send_hash_frequency(frequency).await?;
        self.set_job_difficulty_mask(difficulty).await?;

        self.chip_count = chips;
        self.state = LinkState::Running;
        info!(chips, "Chain initialized");
        Ok(chips)
    }

    /// Collect chip id responses until the handshake window closes.
    async fn count_chips(&mut self) -> Result<u16> {
        let deadline = Instant::now() + HANDSHAKE_WINDOW;
        let mut chips: u16 = 0;

        loop {
            let received = self.transport.recv_available(&mut self.rx_buf).await?;
            if received == 0 {
                if Instant::now() >= deadline {
                    break;
                }
                sleep(HANDSHAKE_POLL).await;
                continue;
            }
            if self.config.trace_rx_frames {
                trace!(bytes = received, frame = %HexBytes(&self.rx_buf), "RX");
            }

            loop {
                match codec::decode_response(&mut self.rx_buf) {
                    DecodeOutcome::Frame(Response::RegisterValue {
                        register, value, ..
                    }) if register == RegisterAddress::ChipId as u8 => {
                        if value[..2] == CHIP_ID_BYTES {
                            info!(
                                chip = chips,
                                core_count = value[2],
                                address = value[3],
                                "Chip detected"
                            );
                            chips += 1;
                        } else {
                            warn!(response = %HexBytes(&value), "Chip id mismatch");
                        }
                    }
                    DecodeOutcome::Frame(other) => {
                        debug!(?other, "Unexpected frame during handshake")
                    }
                    DecodeOutcome::Invalid { discarded } => {
                        warn!(discarded, "Discarded bytes during handshake")
                    }
                    DecodeOutcome::Incomplete => break,
                }
            }
        }

        Ok(chips)
    }

    /// Encode and transmit one job, returning the chip-assigned job id.
    ///
    /// Ids still awaiting results are never reused; with every id in
    /// flight this fails with [`DriverError::WorkQueueFull`] rather than
    /// silently overwriting.
    pub async fn send_work(&mut self, job: &MiningJob) -> Result<u8> {
        if matches!(
            self.state,
            LinkState::Uninitialized | LinkState::Handshaking
        ) {
            return Err(DriverError::NotInitialized);
        }

        let job_id = self.next_free_job_id()?;
        let frame = WireJobFrame::encode(job, job_id)?.to_frame();
        if self.config.trace_tx_frames {
            trace!(frame = %HexBytes(&frame), "TX job");
        }
        self.transport.send(&frame).await?;

        self.outstanding |= job_slot(job_id);
        self.next_job_id = (job_id + JOB_ID_STRIDE) % JOB_ID_SPACE;
        debug!(job_id, source_id = %job.id, "Job dispatched");
        Ok(job_id)
    }

    /// Non-blocking poll of the receive side.
    ///
    /// Accumulates whatever bytes the transport has (frames may arrive
    /// split across polls) and attempts to decode one frame. A decoded
    /// nonce releases its job id. Malformed input degrades the link and
    /// reports [`PollOutcome::Desync`]; it never crashes the driver.
    pub async fn process_work(&mut self) -> Result<PollOutcome> {
        if matches!(
            self.state,
            LinkState::Uninitialized | LinkState::Handshaking
        ) {
            return Err(DriverError::NotInitialized);
        }

        let received = self.transport.recv_available(&mut self.rx_buf).await?;
        if self.config.trace_rx_frames && received > 0 {
            trace!(bytes = received, buffered = self.rx_buf.len(), "RX");
        }

        if self.rx_buf.len() > RX_BUFFER_CAP {
            let excess = self.rx_buf.len() - RX_BUFFER_CAP;
            self.rx_buf.advance(excess);
            return Ok(self.note_desync(excess, "RX buffer overflow"));
        }

        match codec::decode_response(&mut self.rx_buf) {
            DecodeOutcome::Incomplete => Ok(PollOutcome::Pending),
            DecodeOutcome::Invalid { discarded } => {
                Ok(self.note_desync(discarded, "Malformed frame"))
            }
            DecodeOutcome::Frame(response) => {
                if self.state == LinkState::Degraded {
                    info!("Frame boundary recovered");
                    self.state = LinkState::Running;
                }
                Ok(self.accept(response))
            }
        }
    }

    fn accept(&mut self, response: Response) -> PollOutcome {
        match response {
            Response::Nonce {
                job_id,
                nonce,
                version_bits,
                midstate_id,
            } => {
                let id = job_id & JOB_ID_FIELD_MASK;
                if self.outstanding & job_slot(id) == 0 {
                    // Late result for a job the source already expired.
                    warn!(job_id = id, "Nonce for unknown job id");
                    return PollOutcome::Pending;
                }
                self.outstanding &= !job_slot(id);
                debug!(
                    job_id = id,
                    nonce = %format_args!("{nonce:#010x}"),
                    version_bits = %format_args!("{version_bits:#010x}"),
                    "Nonce result"
                );
                PollOutcome::Completed(TaskResult {
                    job_id: id,
                    nonce,
                    version_bits,
                    midstate_id,
                })
            }
            Response::RegisterValue {
                chip_address,
                register,
                value,
            } => {
                debug!(
                    chip_address,
                    register = %format_args!("{register:#04x}"),
                    value = %HexBytes(&value),
                    "Register readback"
                );
                PollOutcome::Pending
            }
        }
    }

    fn note_desync(&mut self, discarded: usize, what: &str) -> PollOutcome {
        self.desync_count += 1;
        if self.state == LinkState::Degraded {
            debug!(discarded, "{what}; still resynchronizing");
        } else {
            warn!(discarded, "{what}; link degraded, resynchronizing");
            self.state = LinkState::Degraded;
        }
        PollOutcome::Desync
    }

    /// Enable version rolling over the masked header bits.
    pub async fn set_version_mask(&mut self, mask: u32) -> Result<()> {
        debug!(mask = %format_args!("{mask:#010x}"), "Setting version mask");
        self.send_command(&Command::WriteRegister {
            broadcast: true,
            chip_address: 0,
            register: RegisterAddress::VersionMask,
            value: version_mask_register(mask),
        })
        .await
    }

    /// Switch chain and transport to the maximum rate. Quiesce in-flight
    /// work first; frames in transit across the switch will be misread.
    pub async fn set_max_baud(&mut self) -> Result<u32> {
        self.switch_baud(BaudRate::Max).await
    }

    /// Return chain and transport to the power-on rate.
    pub async fn set_default_baud(&mut self) -> Result<u32> {
        self.switch_baud(BaudRate::Default).await
    }

    async fn switch_baud(&mut self, rate: BaudRate) -> Result<u32> {
        let baud = rate.bits_per_sec();
        info!(baud, "Switching chain baud rate");
        self.send_command(&Command::WriteRegister {
            broadcast: true,
            chip_address: 0,
            register: RegisterAddress::UartBaud,
            value: rate.register_value(),
        })
        .await?;
        sleep(BAUD_SETTLE).await;
        self.transport.set_baud(baud).await?;
        Ok(baud)
    }

    /// Program the PLL for a new hash frequency.
    pub async fn send_hash_frequency(&mut self, frequency: f32) -> Result<()> {
        let pll = PllConfig::for_frequency(frequency)
            .ok_or(DriverError::InvalidFrequency { mhz: frequency })?;
        info!(
            target_mhz = frequency,
            actual_mhz = pll.actual_mhz(),
            "Setting ASIC hash frequency"
        );
        self.send_command(&Command::WriteRegister {
            broadcast: true,
            chip_address: 0,
            register: RegisterAddress::PllDivider,
            value: pll.register_value(),
        })
        .await
    }

    /// Program the nonce-reporting threshold from a share difficulty.
    pub async fn set_job_difficulty_mask(&mut self, difficulty: u32) -> Result<()> {
        debug!(difficulty, "Setting job difficulty mask");
        self.send_command(&Command::WriteRegister {
            broadcast: true,
            chip_address: 0,
            register: RegisterAddress::TicketMask,
            value: TicketMask::from_difficulty(difficulty).register_value(),
        })
        .await
    }

    /// Release a job id whose result the job source has given up on.
    /// Returns whether the id was outstanding.
    pub fn retire_job(&mut self, job_id: u8) -> bool {
        let slot = job_slot(job_id & JOB_ID_FIELD_MASK);
        let was = self.outstanding & slot != 0;
        self.outstanding &= !slot;
        was
    }

    fn next_free_job_id(&self) -> Result<u8> {
        let mut id = self.next_job_id;
        for _ in 0..MAX_INFLIGHT_JOBS {
            if self.outstanding & job_slot(id) == 0 {
                return Ok(id);
            }
            id = (id + JOB_ID_STRIDE) % JOB_ID_SPACE;
        }
        Err(DriverError::WorkQueueFull {
            outstanding: self.outstanding_jobs(),
        })
    }

    async fn send_command(&mut self, command: &Command) -> Result<()> {
        let frame = command.to_frame();
        if self.config.trace_tx_frames {
            trace!(cmd = ?command, frame = %HexBytes(&frame), "TX");
        }
        self.transport.send(&frame).await?;
        Ok(())
    }
}

fn job_slot(job_id: u8) -> u16 {
    1 << (job_id / JOB_ID_STRIDE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use bitcoin::block::Version;
    use bitcoin::hash_types::{BlockHash, TxMerkleNode};
    use bitcoin::hashes::Hash;
    use bitcoin::pow::CompactTarget;
    use codec::RESPONSE_LEN;

    fn chip_id_frame() -> [u8; RESPONSE_LEN] {
        // value = chip id, core count, assigned address
        codec::seal_response([0x13, 0x40, 0x70, 0x00, 0x00, 0x00, 0x00, 0x00], 0)
    }

    fn nonce_frame(job_id: u8, nonce: u32, version: u16) -> [u8; RESPONSE_LEN] {
        let n = nonce.to_le_bytes();
        codec::seal_response(
            [
                n[0],
                n[1],
                n[2],
                n[3],
                0x00,
                job_id,
                (version >> 8) as u8,
                version as u8,
            ],
            4,
        )
    }

    fn sample_job() -> MiningJob {
        MiningJob {
            id: "job-0".into(),
            starting_nonce: 0,
            bits: CompactTarget::from_consensus(0x1705_dc17),
            time: 0x6815_16d6,
            merkle_root: TxMerkleNode::from_byte_array([0x3c; 32]),
            prev_blockhash: BlockHash::from_byte_array([0x5a; 32]),
            version: Version::from_consensus(0x2000_0000),
            num_midstates: 1,
        }
    }

    async fn ready_driver() -> Bm1340Driver<MockTransport> {
        let mut transport = MockTransport::new();
        transport.queue_read(&chip_id_frame());
        let mut driver = Bm1340Driver::new(transport, DriverConfig::default());
        assert_eq!(driver.init(525.0, 1, 256).await.unwrap(), 1);
        driver.transport_mut().take_written();
        driver
    }

    #[tokio::test(start_paused = true)]
    async fn init_detects_responding_chip() {
        let mut transport = MockTransport::new();
        transport.queue_read(&chip_id_frame());
        let mut driver = Bm1340Driver::new(transport, DriverConfig::default());

        let chips = driver.init(525.0, 1, 256).await.unwrap();

        assert_eq!(chips, 1);
        assert_eq!(driver.chip_count(), 1);
        assert_eq!(driver.state(), LinkState::Running);
        assert_eq!(driver.transport().clear_count(), 1);

        let written = driver.transport().written().to_vec();
        // Broadcast chip id read goes out first...
        assert_eq!(&written[..7], &[0x55, 0xaa, 0x52, 0x05, 0x00, 0x00, 0x0a]);
        // ...then chain inactive opens addressing.
        assert_eq!(&written[7..14], &[0x55, 0xaa, 0x53, 0x05, 0x00, 0x00, 0x03]);
        // ...then the sole chip gets address zero.
        assert_eq!(&written[14..21], &[0x55, 0xaa, 0x40, 0x05, 0x00, 0x00, 0x1c]);
    }

    #[tokio::test(start_paused = true)]
    async fn init_returns_zero_on_silent_chain() {
        let transport = MockTransport::new();
        let mut driver = Bm1340Driver::new(transport, DriverConfig::default());

        let chips = driver.init(525.0, 1, 256).await.unwrap();

        assert_eq!(chips, 0);
        assert_eq!(driver.state(), LinkState::Uninitialized);
        // Only the chip id probe was sent; configuration never started.
        assert_eq!(driver.transport().written().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn send_work_assigns_rolling_ids() {
        let mut driver = ready_driver().await;
        let job = sample_job();

        assert_eq!(driver.send_work(&job).await.unwrap(), 0);
        assert_eq!(driver.send_work(&job).await.unwrap(), 8);
        assert_eq!(driver.send_work(&job).await.unwrap(), 16);
        assert_eq!(driver.outstanding_jobs(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn send_work_refuses_to_reuse_outstanding_ids() {
        let mut driver = ready_driver().await;
        let job = sample_job();

        for _ in 0..MAX_INFLIGHT_JOBS {
            driver.send_work(&job).await.unwrap();
        }

        let err = driver.send_work(&job).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::WorkQueueFull { outstanding } if outstanding == MAX_INFLIGHT_JOBS
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_result_releases_its_id() {
        let mut driver = ready_driver().await;
        let job = sample_job();

        for _ in 0..MAX_INFLIGHT_JOBS {
            driver.send_work(&job).await.unwrap();
        }

        driver
            .transport_mut()
            .queue_read(&nonce_frame(0, 0xdead_beef, 0));
        let outcome = driver.process_work().await.unwrap();
        assert!(matches!(outcome, PollOutcome::Completed(_)));

        // The freed id is handed out again.
        assert_eq!(driver.send_work(&job).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retire_job_frees_an_expired_id() {
        let mut driver = ready_driver().await;
        let job = sample_job();

        let id = driver.send_work(&job).await.unwrap();
        assert!(driver.retire_job(id));
        assert!(!driver.retire_job(id));
        assert_eq!(driver.outstanding_jobs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn process_work_accumulates_split_frames() {
        let mut driver = ready_driver().await;
        let id = driver.send_work(&sample_job()).await.unwrap();

        let frame = nonce_frame(id, 0x0abc_1234, 0x0002);
        driver.transport_mut().queue_read(&frame[..5]);
        driver.transport_mut().queue_read(&frame[5..]);

        assert_eq!(driver.process_work().await.unwrap(), PollOutcome::Pending);
        assert_eq!(
            driver.process_work().await.unwrap(),
            PollOutcome::Completed(TaskResult {
                job_id: id,
                nonce: 0x0abc_1234,
                version_bits: 0x2 << 13,
                midstate_id: 0,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_frame_degrades_then_recovers() {
        let mut driver = ready_driver().await;
        let id = driver.send_work(&sample_job()).await.unwrap();

        let mut corrupt = nonce_frame(id, 0x1111_2222, 0);
        corrupt[6] ^= 0xff;
        driver.transport_mut().queue_read(&corrupt);
        driver
            .transport_mut()
            .queue_read(&nonce_frame(id, 0x3333_4444, 0));

        assert_eq!(driver.process_work().await.unwrap(), PollOutcome::Desync);
        assert_eq!(driver.state(), LinkState::Degraded);
        assert_eq!(driver.desync_count(), 1);

        let outcome = driver.process_work().await.unwrap();
        assert!(matches!(outcome, PollOutcome::Completed(ref r) if r.nonce == 0x3333_4444));
        assert_eq!(driver.state(), LinkState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_for_unknown_id_is_dropped() {
        let mut driver = ready_driver().await;

        driver
            .transport_mut()
            .queue_read(&nonce_frame(0x40, 0x5555_6666, 0));
        assert_eq!(driver.process_work().await.unwrap(), PollOutcome::Pending);
        assert_eq!(driver.state(), LinkState::Running);
    }

    #[tokio::test]
    async fn work_requires_initialization() {
        let mut driver = Bm1340Driver::new(MockTransport::new(), DriverConfig::default());

        assert!(matches!(
            driver.send_work(&sample_job()).await.unwrap_err(),
            DriverError::NotInitialized
        ));
        assert!(matches!(
            driver.process_work().await.unwrap_err(),
            DriverError::NotInitialized
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn baud_switch_writes_register_before_local_change() {
        let mut driver = ready_driver().await;

        assert_eq!(driver.set_max_baud().await.unwrap(), 1_000_000);
        assert_eq!(
            driver.transport().written(),
            &[0x55, 0xaa, 0x51, 0x09, 0x00, 0x28, 0x11, 0x30, 0x02, 0x00, 0x03]
        );
        assert_eq!(driver.transport().baud_history(), &[1_000_000]);

        driver.transport_mut().take_written();
        assert_eq!(driver.set_default_baud().await.unwrap(), 115_200);
        assert_eq!(driver.transport().baud_history(), &[1_000_000, 115_200]);
    }

    #[tokio::test(start_paused = true)]
    async fn version_mask_frame_matches_capture() {
        let mut driver = ready_driver().await;

        driver.set_version_mask(0x1fff_e000).await.unwrap();
        assert_eq!(
            driver.transport().written(),
            &[0x55, 0xaa, 0x51, 0x09, 0x00, 0xa4, 0x90, 0x00, 0xff, 0xff, 0x1c]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_frequency_is_rejected_before_io() {
        let mut driver = ready_driver().await;

        let err = driver.send_hash_frequency(10.0).await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidFrequency { .. }));
        assert!(driver.transport().written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_surfaces_as_io_error() {
        let mut driver = ready_driver().await;
        driver.transport_mut().set_fail_io(true);

        assert!(matches!(
            driver.process_work().await.unwrap_err(),
            DriverError::Io(_)
        ));
    }
}
