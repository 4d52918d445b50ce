//! HVAC Devices
//!
//! Devices driven by a stream of [`HvacCommand`]s rather than by single
//! commands. Every device brackets the input with an initialization command
//! (demand off) and a shutdown command (demand off, then fan off), so even
//! an empty input produces exactly two status signals.

mod heat_pump;
mod switchable;

pub use heat_pump::*;
pub use switchable::*;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use hvac_types::{HvacCommand, HvacMode, SIGNAL_BUFFER, Signal};

use crate::device::Actuator;

/// Requested and confirmed state of an HVAC device
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HvacDeviceStatus {
    pub requested: HvacCommand,
    pub actual: HvacCommand,
}

/// A device that turns a command stream into a status stream
///
/// When the input stream ends the device shuts down and closes its switches;
/// the output stream completes afterwards.
pub trait HvacDevice: Send + 'static {
    fn id(&self) -> &str;

    /// Modes this device can operate in
    fn modes(&self) -> &[HvacMode];

    fn compute(
        self,
        commands: mpsc::Receiver<Signal<HvacCommand>>,
    ) -> mpsc::Receiver<Signal<HvacDeviceStatus>>
    where
        Self: Sized;
}

/// Sent before any input
pub(crate) const INIT_COMMAND: HvacCommand = HvacCommand {
    mode: None,
    demand: Some(0.0),
    fan_speed: None,
};

/// Sent after the input ends
pub(crate) const SHUTDOWN_COMMAND: HvacCommand = HvacCommand {
    mode: None,
    demand: Some(0.0),
    fan_speed: Some(0.0),
};

/// Drive a switch, logging instead of failing
///
/// Switches retry hardware errors on their own; the only error left is a
/// closed switch, which shouldn't stop the rest of the sequence.
pub(crate) async fn drive(device: &str, switch: &Arc<dyn Actuator<bool>>, on: bool) {
    if let Err(e) = switch.apply(on).await {
        tracing::error!(device, switch = switch.id(), on, error = %e, "Switch write failed");
    }
}

/// Close switches one after another, in the given order
pub(crate) async fn close_in_order(device: &str, switches: &[&Arc<dyn Actuator<bool>>]) {
    for switch in switches {
        if let Err(e) = switch.close().await {
            tracing::warn!(device, switch = switch.id(), error = %e, "Switch close failed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Per-device part of the command loop
#[async_trait]
pub(crate) trait Sequencer: Send + 'static {
    fn id(&self) -> &str;

    /// Apply one command, emitting as many status signals as it takes
    async fn process(&mut self, command: HvacCommand, out: &mpsc::Sender<Signal<HvacDeviceStatus>>);

    /// Close the underlying switches
    async fn close(&mut self);
}

/// Run init, every healthy input command, then shutdown
pub(crate) fn run<S: Sequencer>(
    mut device: S,
    mut commands: mpsc::Receiver<Signal<HvacCommand>>,
) -> mpsc::Receiver<Signal<HvacDeviceStatus>> {
    let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);

    tokio::spawn(async move {
        tracing::debug!(device = device.id(), "HVAC device started");
        device.process(INIT_COMMAND, &tx).await;

        while let Some(signal) = commands.recv().await {
            if !signal.is_ok() {
                tracing::debug!(
                    device = device.id(),
                    status = %signal.status(),
                    "Ignoring unhealthy command signal"
                );
                continue;
            }
            if let Some(command) = signal.into_value() {
                device.process(command, &tx).await;
            }
        }

        tracing::info!(device = device.id(), "Input complete, shutting down");
        device.process(SHUTDOWN_COMMAND, &tx).await;
        device.close().await;
    });

    rx
}

/// Send a status; a gone consumer doesn't stop the hardware sequence
pub(crate) async fn emit(
    out: &mpsc::Sender<Signal<HvacDeviceStatus>>,
    signal: Signal<HvacDeviceStatus>,
) {
    let _ = out.send(signal).await;
}
