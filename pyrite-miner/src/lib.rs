//! Control core for a BM1340 ASIC mining chain.
//!
//! Two halves. The [`asic`] side owns the serial session to the chips:
//! chain enumeration, register configuration, work dispatch and
//! non-blocking result retrieval. The [`thermal`] side is a generic
//! closed-loop controller, the mining-specific regulator around it, and
//! a monitor task that publishes fan output and frequency-throttle
//! requests.
//!
//! Everything else is an external collaborator: the job source produces
//! [`MiningJob`]s and consumes [`TaskResult`]s, sensors feed the
//! temperature watch channel, and the [`transport::Transport`] trait
//! abstracts the physical bus.

pub mod asic;
pub mod error;
pub mod job;
pub mod thermal;
pub mod tracing;
pub mod transport;

pub use error::{DriverError, EncodingError};
pub use job::{MiningJob, TaskResult};
