mod config;
mod filter;
mod monitor;
mod pid;
mod regulator;

pub use config::ThermalConfig;
pub use filter::TemperatureFilter;
pub use monitor::{FanCommand, FrequencyCommand, ThermalMonitor};
pub use pid::PidController;
pub use regulator::ThermalRegulator;
