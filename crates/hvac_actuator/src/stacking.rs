//! Stacking Switch
//!
//! Lets several consumers share one physical switch. Each consumer gets its
//! own [`VirtualSwitch`]; the physical target is on while at least one
//! member is on.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use hvac_types::{DeviceState, Error, Result, Signal};

use crate::device::{Actuator, Completion, CqrsDevice, DeviceOptions, Driver};

/// Members currently demanding the target on
type Demand = Arc<Mutex<BTreeSet<String>>>;

// ─────────────────────────────────────────────────────────────────────────────
// Member Driver
// ─────────────────────────────────────────────────────────────────────────────

/// Turns a member's write into an update of the shared demand set
struct MemberDriver {
    address: String,
    demand: Demand,
    target: Arc<dyn Actuator<bool>>,
}

#[async_trait]
impl Driver<bool> for MemberDriver {
    async fn write(&self, on: &bool) -> Result<()> {
        let completion = {
            let mut demand = self.demand.lock();
            let before = !demand.is_empty();

            let mut next = demand.clone();
            if *on {
                next.insert(self.address.clone());
            } else {
                next.remove(&self.address);
            }

            let after = !next.is_empty();
            // Submitted under the lock so the target sees aggregate changes in order
            let completion = if before == after {
                None
            } else {
                Some(self.target.submit(after)?)
            };

            // Only once the target has taken the change
            *demand = next;
            completion
        };

        match completion {
            Some(done) => done
                .await
                .map_err(|_| Error::Closed(self.target.id().to_string())),
            None => {
                tracing::trace!(member = %self.address, on, "Aggregate unchanged");
                Ok(())
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Virtual Switch
// ─────────────────────────────────────────────────────────────────────────────

/// One member of a [`StackingSwitch`]
#[derive(Clone, Debug)]
pub struct VirtualSwitch {
    device: CqrsDevice<bool>,
}

#[async_trait]
impl Actuator<bool> for VirtualSwitch {
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

// ─────────────────────────────────────────────────────────────────────────────
// Stacking Switch
// ─────────────────────────────────────────────────────────────────────────────

/// Fan-in of many virtual switches onto one target
///
/// The target itself is only driven through members; there is no way to set
/// it directly.
pub struct StackingSwitch {
    id: String,
    target: Arc<dyn Actuator<bool>>,
    members: DashMap<String, VirtualSwitch>,
    demand: Demand,
    options: DeviceOptions,
}

impl StackingSwitch {
    pub fn new(id: impl Into<String>, target: Arc<dyn Actuator<bool>>) -> Self {
        Self {
            id: id.into(),
            target,
            members: DashMap::new(),
            demand: Arc::new(Mutex::new(BTreeSet::new())),
            options: DeviceOptions::default(),
        }
    }

    /// Options for member workers created from now on
    pub fn with_options(mut self, options: DeviceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &Arc<dyn Actuator<bool>> {
        &self.target
    }

    /// Get the member for `address`, creating it on first use
    pub fn member(&self, address: &str) -> Result<VirtualSwitch> {
        match self.members.entry(address.to_string()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(vacant) => {
                let driver = Arc::new(MemberDriver {
                    address: address.to_string(),
                    demand: Arc::clone(&self.demand),
                    target: Arc::clone(&self.target),
                });
                let device = CqrsDevice::spawn(
                    format!("{}/{}", self.id, address),
                    driver,
                    false,
                    self.options,
                )?;
                let member = VirtualSwitch { device };

                vacant.insert(member.clone());
                tracing::debug!(stack = %self.id, address, "Member created");
                Ok(member)
            }
        }
    }

    /// Addresses of members currently demanding the target on
    pub fn demand(&self) -> Vec<String> {
        self.demand.lock().iter().cloned().collect()
    }

    /// Close every member, then the target
    pub async fn close(&self) -> Result<DeviceState<bool>> {
        let members: Vec<VirtualSwitch> = self.members.iter().map(|m| m.value().clone()).collect();

        for result in join_all(members.iter().map(|m| m.close())).await {
            if let Err(e) = result {
                tracing::warn!(stack = %self.id, error = %e, "Member close failed");
            }
        }

        self.target.close().await
    }
}
