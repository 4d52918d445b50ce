//! Switch
//!
//! Boolean actuator. An inverted switch keeps logical state in
//! requested/actual and writes the opposite value to hardware.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use hvac_types::{DeviceState, Result, Signal};

use crate::device::{Actuator, Completion, CqrsDevice, DeviceOptions, Driver};

/// Inverts every command on its way to the hardware
struct Inverted {
    target: Arc<dyn Driver<bool>>,
}

#[async_trait]
impl Driver<bool> for Inverted {
    async fn write(&self, command: &bool) -> Result<()> {
        self.target.write(&!command).await
    }
}

/// Boolean actuator backed by a device worker
///
/// Closing turns the switch logically off.
#[derive(Clone, Debug)]
pub struct Switch {
    device: CqrsDevice<bool>,
    inverted: bool,
}

impl Switch {
    pub fn new(
        id: impl Into<String>,
        driver: Arc<dyn Driver<bool>>,
        options: DeviceOptions,
    ) -> Result<Self> {
        Self::build(id, driver, false, options)
    }

    /// Switch whose logical "on" is physical "off"
    pub fn inverted(
        id: impl Into<String>,
        driver: Arc<dyn Driver<bool>>,
        options: DeviceOptions,
    ) -> Result<Self> {
        Self::build(id, driver, true, options)
    }

    fn build(
        id: impl Into<String>,
        driver: Arc<dyn Driver<bool>>,
        inverted: bool,
        options: DeviceOptions,
    ) -> Result<Self> {
        let driver: Arc<dyn Driver<bool>> = if inverted {
            Arc::new(Inverted { target: driver })
        } else {
            driver
        };

        Ok(Self {
            device: CqrsDevice::spawn(id, driver, false, options)?,
            inverted,
        })
    }

    pub fn is_inverted(&self) -> bool {
        self.inverted
    }
}

#[async_trait]
impl Actuator<bool> for Switch {
    fn id(&self) -> &str {
        self.device.id()
    }

    fn set_state(&self, command: bool) -> Result<DeviceState<bool>> {
        self.device.set_state(command)
    }

    fn submit(&self, command: bool) -> Result<Completion> {
        self.device.submit(command)
    }

    fn state(&self) -> DeviceState<bool> {
        self.device.state()
    }

    fn flux(&self) -> broadcast::Receiver<Signal<DeviceState<bool>>> {
        self.device.flux()
    }

    async fn close(&self) -> Result<DeviceState<bool>> {
        self.device.close().await
    }
}
