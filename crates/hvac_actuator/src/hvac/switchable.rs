//! Single-switch HVAC device (window unit, baseboard heater, plain fan).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use hvac_types::{Error, HvacCommand, HvacMode, Signal};

use super::{HvacDevice, HvacDeviceStatus, Sequencer, close_in_order, drive, emit, run};
use crate::device::Actuator;

/// Device with a fixed mode and one on/off switch
///
/// The switch is on while demand or fan speed is positive.
pub struct SwitchableHvacDevice {
    id: String,
    mode: [HvacMode; 1],
    switch: Arc<dyn Actuator<bool>>,
    requested: HvacCommand,
    actual: HvacCommand,
}

impl SwitchableHvacDevice {
    pub fn new(id: impl Into<String>, mode: HvacMode, switch: Arc<dyn Actuator<bool>>) -> Self {
        Self {
            id: id.into(),
            mode: [mode],
            switch,
            requested: HvacCommand::default(),
            actual: HvacCommand::default(),
        }
    }

    fn status(&self) -> HvacDeviceStatus {
        HvacDeviceStatus {
            requested: self.requested,
            actual: self.actual,
        }
    }
}

#[async_trait]
impl Sequencer for SwitchableHvacDevice {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(&mut self, command: HvacCommand, out: &mpsc::Sender<Signal<HvacDeviceStatus>>) {
        if let Some(mode) = command.mode {
            if mode != self.mode[0] {
                let e = Error::invalid(format!(
                    "{}: only {} is supported, requested {mode}",
                    self.id, self.mode[0]
                ));
                tracing::error!(device = %self.id, error = %e, "Command rejected");
                emit(out, Signal::failure(Utc::now(), Some(self.status()), e)).await;
                return;
            }
        }

        self.requested = self.requested.reconcile(&command);
        let on = self.requested.wants_demand() || self.requested.wants_fan();
        drive(&self.id, &self.switch, on).await;
        self.actual = self.requested;

        emit(out, Signal::new(Utc::now(), self.status())).await;
    }

    async fn close(&mut self) {
        close_in_order(&self.id, &[&self.switch]).await;
    }
}

impl HvacDevice for SwitchableHvacDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn modes(&self) -> &[HvacMode] {
        &self.mode
    }

    fn compute(
        self,
        commands: mpsc::Receiver<Signal<HvacCommand>>,
    ) -> mpsc::Receiver<Signal<HvacDeviceStatus>> {
        run(self, commands)
    }
}
