//! ASIC chain drivers.
//!
//! One driver instance owns one physical chain: the serial session, the
//! outstanding-job bookkeeping and the receive accumulator all live in
//! the instance, never in process-wide state. Multiple chains mean
//! multiple driver instances over separate transports.

pub mod bm1340;
