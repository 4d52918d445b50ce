//! Single-stage unit controller
//!
//! Converts unit demand into [`HvacCommand`]s for a fixed mode: any positive
//! demand runs the stage at full output, anything else stops it. Commands are
//! only emitted when the stage changes, except for the first one which also
//! sets the mode.

use chrono::Utc;
use tokio::sync::mpsc;

use hvac_types::{HvacCommand, HvacMode, SIGNAL_BUFFER, Signal, UnitControlSignal};

#[derive(Debug, Clone)]
pub struct SingleStageUnitController {
    mode: HvacMode,
    fan_with_stage: bool,
}

impl SingleStageUnitController {
    pub fn new(mode: HvacMode) -> Self {
        Self {
            mode,
            fan_with_stage: true,
        }
    }

    /// Run the fan along with the stage; otherwise the fan is left alone
    pub fn with_fan(mut self, fan_with_stage: bool) -> Self {
        self.fan_with_stage = fan_with_stage;
        self
    }

    pub fn mode(&self) -> HvacMode {
        self.mode
    }

    fn command(&self, running: bool, first: bool) -> HvacCommand {
        let output = if running { 1.0 } else { 0.0 };
        HvacCommand {
            mode: first.then_some(self.mode),
            demand: Some(output),
            fan_speed: self.fan_with_stage.then_some(output),
        }
    }

    /// Failed unit signals stop the stage
    pub fn compute(
        self,
        mut signals: mpsc::Receiver<Signal<UnitControlSignal>>,
    ) -> mpsc::Receiver<Signal<HvacCommand>> {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);

        tokio::spawn(async move {
            let mut running: Option<bool> = None;

            while let Some(signal) = signals.recv().await {
                let wanted = match signal.value() {
                    Some(unit) if !signal.is_error() => unit.demand > 0.0,
                    _ => {
                        tracing::warn!(error = ?signal.error().map(|e| e.to_string()), "Unit signal failed, stopping");
                        false
                    }
                };

                if running == Some(wanted) {
                    continue;
                }

                let command = self.command(wanted, running.is_none());
                tracing::info!(mode = %self.mode, running = wanted, "Stage change");
                running = Some(wanted);

                if tx.send(Signal::new(Utc::now(), command)).await.is_err() {
                    break;
                }
            }
        });

        rx
    }
}
