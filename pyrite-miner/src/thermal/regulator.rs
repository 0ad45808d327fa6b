//! Thermal regulation policy over the generic PID controller.

use std::time::Duration;

use super::config::ThermalConfig;
use super::pid::PidController;

/// Drives a cooling actuator toward a target chip temperature.
///
/// Runs the PID in inverse mode with setpoint = target temperature, so
/// output rises as the chips heat past target and snaps back to the fan
/// floor once they are at or below it. The regulator only computes:
/// applying the output to the fan, and requesting a frequency change
/// when the output saturates, are the caller's policy (see
/// [`ThermalMonitor`](super::monitor::ThermalMonitor)).
#[derive(Debug, Clone)]
pub struct ThermalRegulator {
    pid: PidController,
}

impl ThermalRegulator {
    pub fn new(config: &ThermalConfig) -> Self {
        Self {
            pid: PidController::new(
                config.kp,
                config.ki,
                config.kd,
                config.target_temperature_c,
                config.fan_min_percent,
                config.fan_max_percent,
                true,
            ),
        }
    }

    /// One regulation step: temperature in, cooling output (fan %) out.
    /// `dt` is the time since the previous step and must be non-zero.
    pub fn regulate(&mut self, temperature_c: f32, dt: Duration) -> f32 {
        self.pid.compute(temperature_c, dt)
    }

    pub fn reset(&mut self) {
        self.pid.reset()
    }

    pub fn set_tunings(&mut self, kp: f32, ki: f32, kd: f32) {
        self.pid.set_tunings(kp, ki, kd)
    }

    pub fn set_output_limits(&mut self, min: f32, max: f32) {
        self.pid.set_output_limits(min, max)
    }

    pub fn setpoint(&self) -> f32 {
        self.pid.setpoint()
    }

    pub fn output_limits(&self) -> (f32, f32) {
        self.pid.output_limits()
    }
}
