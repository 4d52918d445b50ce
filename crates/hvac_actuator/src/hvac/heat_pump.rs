//! Heat Pump
//!
//! Three switches: mode (on = heating), running (compressor stage) and fan.
//! Changing mode with the compressor running stops it first, waits for the
//! refrigerant pressure to settle, switches the mode and re-asserts the stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use hvac_types::{Error, HvacCommand, HvacMode, Signal};

use super::{HvacDevice, HvacDeviceStatus, Sequencer, close_in_order, drive, emit, run};
use crate::device::Actuator;

/// Default pause between stopping the compressor and changing the mode
pub const DEFAULT_MODE_CHANGE_DELAY: Duration = Duration::from_secs(10);

const MODES: [HvacMode; 2] = [HvacMode::Cooling, HvacMode::Heating];

pub struct HeatPump {
    id: String,
    mode: Arc<dyn Actuator<bool>>,
    running: Arc<dyn Actuator<bool>>,
    fan: Arc<dyn Actuator<bool>>,
    mode_change_delay: Duration,
    requested: HvacCommand,
    actual: HvacCommand,
}

impl HeatPump {
    /// Switch polarity is the switches' business; use inverted switches for
    /// units wired the other way round.
    pub fn new(
        id: impl Into<String>,
        mode: Arc<dyn Actuator<bool>>,
        running: Arc<dyn Actuator<bool>>,
        fan: Arc<dyn Actuator<bool>>,
    ) -> Self {
        Self {
            id: id.into(),
            mode,
            running,
            fan,
            mode_change_delay: DEFAULT_MODE_CHANGE_DELAY,
            requested: HvacCommand::default(),
            actual: HvacCommand::default(),
        }
    }

    pub fn with_mode_change_delay(mut self, delay: Duration) -> Self {
        self.mode_change_delay = delay;
        self
    }

    fn status(&self) -> HvacDeviceStatus {
        HvacDeviceStatus {
            requested: self.requested,
            actual: self.actual,
        }
    }

    async fn report(&self, out: &mpsc::Sender<Signal<HvacDeviceStatus>>) {
        emit(out, Signal::new(Utc::now(), self.status())).await;
    }

    async fn reject(&self, error: Error, out: &mpsc::Sender<Signal<HvacDeviceStatus>>) {
        tracing::error!(device = %self.id, error = %error, "Command rejected");
        emit(out, Signal::failure(Utc::now(), Some(self.status()), error)).await;
    }

    async fn change_mode(&mut self, mode: HvacMode, out: &mpsc::Sender<Signal<HvacDeviceStatus>>) {
        if self.actual.wants_demand() {
            tracing::info!(
                device = %self.id,
                from = ?self.requested.mode,
                to = %mode,
                delay_ms = self.mode_change_delay.as_millis() as u64,
                "Stopping compressor for mode change"
            );

            self.requested.demand = Some(0.0);
            drive(&self.id, &self.running, false).await;
            self.actual.demand = Some(0.0);
            self.report(out).await;

            tokio::time::sleep(self.mode_change_delay).await;
        }

        drive(&self.id, &self.mode, mode == HvacMode::Heating).await;
        self.requested.mode = Some(mode);
        self.actual.mode = Some(mode);
        self.report(out).await;
    }

    /// Apply demand and fan speed; the stage is always written again
    async fn set_others(&mut self, command: HvacCommand, out: &mpsc::Sender<Signal<HvacDeviceStatus>>) {
        let update = HvacCommand {
            mode: None,
            ..command
        };
        self.requested = self.requested.reconcile(&update);

        drive(&self.id, &self.running, self.requested.wants_demand()).await;
        self.actual.demand = self.requested.demand;

        if let Some(fan_speed) = command.fan_speed {
            drive(&self.id, &self.fan, fan_speed > 0.0).await;
            self.actual.fan_speed = Some(fan_speed);
        }

        self.report(out).await;
    }
}

#[async_trait]
impl Sequencer for HeatPump {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(&mut self, command: HvacCommand, out: &mpsc::Sender<Signal<HvacDeviceStatus>>) {
        tracing::debug!(device = %self.id, %command, "Processing");

        if self.requested.mode.is_none() && command.mode.is_none() && command.wants_demand() {
            let e = Error::illegal_state("Can't accept demand > 0 before setting the operating mode");
            self.reject(e, out).await;
            return;
        }

        if let Some(mode) = command.mode {
            if !MODES.contains(&mode) {
                let e = Error::invalid(format!("{}: unsupported mode {mode}", self.id));
                self.reject(e, out).await;
                return;
            }
            if Some(mode) != self.requested.mode {
                self.change_mode(mode, out).await;
            }
        }

        self.set_others(command, out).await;
    }

    async fn close(&mut self) {
        close_in_order(&self.id, &[&self.running, &self.fan, &self.mode]).await;
    }
}

impl HvacDevice for HeatPump {
    fn id(&self) -> &str {
        &self.id
    }

    fn modes(&self) -> &[HvacMode] {
        &MODES
    }

    fn compute(
        self,
        commands: mpsc::Receiver<Signal<HvacCommand>>,
    ) -> mpsc::Receiver<Signal<HvacDeviceStatus>> {
        run(self, commands)
    }
}
