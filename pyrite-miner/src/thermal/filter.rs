use std::collections::VecDeque;

/// Plausible sensor range; anything outside is a read glitch.
const MIN_VALID_C: f32 = -20.0;
const MAX_VALID_C: f32 = 110.0;

/// Sliding-window noise filter for temperature readings.
///
/// Keeps a short history and rejects readings that jump too far from the
/// window average, so a single corrupted sensor read cannot kick the
/// regulator. Genuine trends pass through: each accepted reading shifts
/// the average toward it.
#[derive(Debug, Clone)]
pub struct TemperatureFilter {
    window: VecDeque<f32>,
    window_size: usize,
    max_jump_c: f32,
}

impl TemperatureFilter {
    pub fn new(window_size: usize, max_jump_c: f32) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            max_jump_c,
        }
    }

    /// Offer a reading; `Some` if accepted into the window, `None` if
    /// rejected as noise.
    pub fn accept(&mut self, reading: f32) -> Option<f32> {
        if !(MIN_VALID_C..=MAX_VALID_C).contains(&reading) {
            return None;
        }

        if !self.window.is_empty() {
            let average = self.window.iter().sum::<f32>() / self.window.len() as f32;
            if (reading - average).abs() > self.max_jump_c {
                return None;
            }
        }

        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(reading);

        Some(reading)
    }
}
