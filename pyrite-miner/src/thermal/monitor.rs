//! Thermal monitor task: closes the loop between the temperature feed,
//! the cooling actuator and chip frequency.
//!
//! The monitor owns its regulator exclusively. It consumes filtered
//! temperature readings, publishes fan commands every tick, and asks the
//! chain owner to bump frequency down when cooling saturates (and back
//! up once temperatures recover). Applying the commands to hardware is
//! the receiver's job.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::ThermalConfig;
use super::filter::TemperatureFilter;
use super::regulator::ThermalRegulator;
use crate::tracing::prelude::*;

const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing between frequency adjustments, letting each change
/// settle thermally before the next.
const FREQUENCY_ADJUST_COOLDOWN: Duration = Duration::from_secs(20);

/// Deadband around the target before frequency moves, so transient
/// spikes don't throttle the chain.
const OVER_TARGET_MARGIN_C: f32 = 2.0;

/// How close to the fan ceiling counts as saturated.
const SATURATION_EPSILON: f32 = 0.5;

const FILTER_WINDOW: usize = 5;
const FILTER_MAX_JUMP_C: f32 = 15.0;

/// Cooling output for the fan actuator, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanCommand {
    pub percent: f32,
}

/// Request to the chain owner to step hash frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyCommand {
    BumpUp,
    BumpDown,
}

pub struct ThermalMonitor {
    config: ThermalConfig,
    regulator: ThermalRegulator,
    filter: TemperatureFilter,
    fan_tx: watch::Sender<FanCommand>,
    frequency_tx: mpsc::Sender<FrequencyCommand>,
    temperature_rx: watch::Receiver<Option<f32>>,
    tick_interval: Duration,
    last_tick: Option<Instant>,
    last_frequency_adjust: Option<Instant>,
    /// Down-bumps not yet undone; BumpUp never exceeds the starting
    /// frequency.
    bumps_down: u32,
}

impl ThermalMonitor {
    pub fn new(
        config: ThermalConfig,
        fan_tx: watch::Sender<FanCommand>,
        frequency_tx: mpsc::Sender<FrequencyCommand>,
        temperature_rx: watch::Receiver<Option<f32>>,
    ) -> Self {
        let regulator = ThermalRegulator::new(&config);
        Self {
            config,
            regulator,
            filter: TemperatureFilter::new(FILTER_WINDOW, FILTER_MAX_JUMP_C),
            fan_tx,
            frequency_tx,
            temperature_rx,
            tick_interval: TICK_INTERVAL,
            last_tick: None,
            last_frequency_adjust: None,
            bumps_down: 0,
        }
    }

    pub async fn run(mut self, cancellation: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&mut self) {
        let Some(reading) = *self.temperature_rx.borrow() else {
            debug!("Thermal tick: no temperature reading available yet");
            return;
        };
        let Some(temperature) = self.filter.accept(reading) else {
            debug!(reading, "Temperature reading rejected as noise");
            return;
        };

        let now = Instant::now();
        let dt = self
            .last_tick
            .map(|last| now.duration_since(last))
            .filter(|dt| !dt.is_zero())
            .unwrap_or(self.tick_interval);
        self.last_tick = Some(now);

        let mut output = self.regulator.regulate(temperature, dt);

        if temperature > self.config.max_temperature_c {
            warn!(
                temp_c = temperature,
                limit_c = self.config.max_temperature_c,
                "Overheat: forcing full cooling"
            );
            output = self.config.fan_max_percent;
            self.request_adjustment(FrequencyCommand::BumpDown, now).await;
        } else if output >= self.config.fan_max_percent - SATURATION_EPSILON
            && temperature >= self.config.target_temperature_c + OVER_TARGET_MARGIN_C
        {
            // Cooling is maxed and still over target; only less work helps.
            self.request_adjustment(FrequencyCommand::BumpDown, now).await;
        } else if self.bumps_down > 0
            && temperature <= self.config.target_temperature_c - OVER_TARGET_MARGIN_C
        {
            self.request_adjustment(FrequencyCommand::BumpUp, now).await;
        }

        debug!(
            temp_c = temperature,
            dt_s = dt.as_secs_f32(),
            fan_pct = output,
            "Thermal tick"
        );

        if self.fan_tx.send(FanCommand { percent: output }).is_err() {
            debug!("Fan command channel closed");
        }
    }

    async fn request_adjustment(&mut self, command: FrequencyCommand, now: Instant) {
        let cooling_down = self
            .last_frequency_adjust
            .map(|last| now.duration_since(last) < FREQUENCY_ADJUST_COOLDOWN)
            .unwrap_or(false);
        if cooling_down {
            return;
        }

        match command {
            FrequencyCommand::BumpDown => self.bumps_down += 1,
            FrequencyCommand::BumpUp => self.bumps_down -= 1,
        }
        info!(?command, outstanding_bumps = self.bumps_down, "Thermal frequency adjustment");

        if self.frequency_tx.send(command).await.is_err() {
            debug!("Frequency command channel closed");
        }
        self.last_frequency_adjust = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_monitor() -> (
        ThermalMonitor,
        watch::Receiver<FanCommand>,
        mpsc::Receiver<FrequencyCommand>,
        watch::Sender<Option<f32>>,
    ) {
        let (fan_tx, fan_rx) = watch::channel(FanCommand { percent: 0.0 });
        let (freq_tx, freq_rx) = mpsc::channel(4);
        let (temp_tx, temp_rx) = watch::channel(None::<f32>);

        let monitor = ThermalMonitor::new(ThermalConfig::default(), fan_tx, freq_tx, temp_rx);

        (monitor, fan_rx, freq_rx, temp_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_fan_command_on_tick() {
        let (mut monitor, fan_rx, _freq_rx, temp_tx) = create_monitor();

        temp_tx.send(Some(61.0)).unwrap();
        monitor.tick().await;

        // error=1 over a 5 s tick: P=2, I=0.5, D=12.2 over the 35% floor.
        let command = *fan_rx.borrow();
        assert!((command.percent - 49.7).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn no_reading_means_no_commands() {
        let (mut monitor, fan_rx, mut freq_rx, _temp_tx) = create_monitor();

        monitor.tick().await;

        assert_eq!(fan_rx.borrow().percent, 0.0);
        assert!(freq_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn overheat_forces_full_fan_and_throttles() {
        let (mut monitor, fan_rx, mut freq_rx, temp_tx) = create_monitor();

        temp_tx.send(Some(80.0)).unwrap();
        monitor.tick().await;

        assert_eq!(fan_rx.borrow().percent, 100.0);
        assert_eq!(freq_rx.try_recv().unwrap(), FrequencyCommand::BumpDown);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_cooling_bumps_down_once_per_cooldown() {
        let (mut monitor, fan_rx, mut freq_rx, temp_tx) = create_monitor();

        // 14 over target saturates the fan through the response floor.
        temp_tx.send(Some(74.0)).unwrap();
        monitor.tick().await;
        assert_eq!(fan_rx.borrow().percent, 100.0);
        assert_eq!(freq_rx.try_recv().unwrap(), FrequencyCommand::BumpDown);

        // Still saturated, but the cooldown suppresses a second request.
        monitor.tick().await;
        assert!(freq_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_bumps_frequency_back_up() {
        let (mut monitor, _fan_rx, mut freq_rx, temp_tx) = create_monitor();

        temp_tx.send(Some(74.0)).unwrap();
        monitor.tick().await;
        assert_eq!(freq_rx.try_recv().unwrap(), FrequencyCommand::BumpDown);

        tokio::time::advance(FREQUENCY_ADJUST_COOLDOWN + Duration::from_secs(1)).await;
        temp_tx.send(Some(62.0)).unwrap();
        monitor.tick().await;
        assert!(freq_rx.try_recv().is_err());

        tokio::time::advance(FREQUENCY_ADJUST_COOLDOWN + Duration::from_secs(1)).await;
        temp_tx.send(Some(56.0)).unwrap();
        monitor.tick().await;
        assert_eq!(freq_rx.try_recv().unwrap(), FrequencyCommand::BumpUp);

        // All bumps undone; cooler readings don't raise frequency further.
        tokio::time::advance(FREQUENCY_ADJUST_COOLDOWN + Duration::from_secs(1)).await;
        temp_tx.send(Some(55.0)).unwrap();
        monitor.tick().await;
        assert!(freq_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn noisy_reading_is_ignored() {
        let (mut monitor, fan_rx, _freq_rx, temp_tx) = create_monitor();

        temp_tx.send(Some(61.0)).unwrap();
        monitor.tick().await;
        let before = fan_rx.borrow().percent;

        temp_tx.send(Some(95.0)).unwrap();
        monitor.tick().await;

        assert_eq!(fan_rx.borrow().percent, before);
    }
}
