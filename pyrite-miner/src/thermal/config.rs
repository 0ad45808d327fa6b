use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    /// Regulation target (°C). Adjust for cooling capacity and ambient
    /// conditions.
    pub target_temperature_c: f32,

    /// Overheat threshold (°C). Above this the monitor forces full
    /// cooling and throttles frequency. Must exceed
    /// `target_temperature_c`.
    pub max_temperature_c: f32,

    /// PID gains, tuned for the slow thermal time constant of a hashing
    /// board.
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,

    /// Fan output floor (%). Fans stall below this on most boards.
    pub fan_min_percent: f32,

    /// Fan output ceiling (%).
    pub fan_max_percent: f32,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            target_temperature_c: 60.0,
            max_temperature_c: 75.0,
            kp: 2.0,
            ki: 0.1,
            kd: 1.0,
            fan_min_percent: 35.0,
            fan_max_percent: 100.0,
        }
    }
}
