//! Generic closed-loop PID controller.
//!
//! Supports two sign conventions. Standard mode drives the output up when
//! the measured value is below the setpoint. Inverse mode is for cooling:
//! the output rises as the measured value climbs above the setpoint, with
//! a guaranteed minimum response to small errors and a one-sided integral
//! that never anticipates below-setpoint conditions.

use std::time::Duration;

/// Floor gain applied to a positive error in inverse mode: the output
/// never falls below `output_min + error * MIN_RESPONSE_GAIN`.
const MIN_RESPONSE_GAIN: f32 = 5.0;

#[derive(Debug, Clone)]
pub struct PidController {
    kp: f32,
    ki: f32,
    kd: f32,
    setpoint: f32,
    output_min: f32,
    output_max: f32,
    /// Integral clamp, half the output span.
    max_integral: f32,
    integral: f32,
    last_error: f32,
    last_input: f32,
    inverse: bool,
}

impl PidController {
    pub fn new(
        kp: f32,
        ki: f32,
        kd: f32,
        setpoint: f32,
        output_min: f32,
        output_max: f32,
        inverse: bool,
    ) -> Self {
        Self {
            kp,
            ki,
            kd,
            setpoint,
            output_min,
            output_max,
            max_integral: (output_max - output_min) / 2.0,
            integral: 0.0,
            last_error: 0.0,
            last_input: 0.0,
            inverse,
        }
    }

    /// Advance the loop by one sample and return the bounded output.
    ///
    /// `dt` is the interval since the previous call and must be non-zero;
    /// the sampling cadence is the caller's responsibility.
    pub fn compute(&mut self, measured: f32, dt: Duration) -> f32 {
        let dt_s = dt.as_secs_f32();

        let error = if self.inverse {
            measured - self.setpoint
        } else {
            self.setpoint - measured
        };

        // At or below setpoint in inverse mode there is nothing to cool:
        // drop the accumulated integral so output returns to minimum
        // immediately instead of bleeding off.
        if self.inverse && error <= 0.0 {
            self.integral = 0.0;
            return self.output_min;
        }

        let p_term = self.kp * error;

        self.integral += error * dt_s;
        self.integral = self.integral.clamp(0.0, self.max_integral);
        let i_term = self.ki * self.integral;

        let derivative = (measured - self.last_input) / dt_s;
        let d_term = if self.inverse {
            self.kd * derivative
        } else {
            -self.kd * derivative
        };

        let output = if self.inverse {
            let output = self.output_min + p_term + i_term + d_term;
            // Small positive errors still get a proportional floor.
            output.max(self.output_min + error * MIN_RESPONSE_GAIN)
        } else {
            p_term + i_term + d_term
        };

        self.last_error = error;
        self.last_input = measured;

        output.clamp(self.output_min, self.output_max)
    }

    /// Clear accumulated state without touching the tunings.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_input = 0.0;
    }

    /// Swap gains; accumulated state is kept.
    pub fn set_tunings(&mut self, kp: f32, ki: f32, kd: f32) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    /// Change the output range. The integral clamp is re-derived and the
    /// accumulator re-clamped so the next output cannot jump past the new
    /// bounds.
    pub fn set_output_limits(&mut self, min: f32, max: f32) {
        self.output_min = min;
        self.output_max = max;
        self.max_integral = (max - min) / 2.0;
        self.integral = self.integral.clamp(-self.max_integral, self.max_integral);
    }

    pub fn setpoint(&self) -> f32 {
        self.setpoint
    }

    pub fn output_limits(&self) -> (f32, f32) {
        (self.output_min, self.output_max)
    }
}
