//! Command/State Separated Devices
//!
//! A device separates three concerns:
//!
//! - **command**: [`Actuator::set_state`] records the request and returns at once
//! - **query**: [`Actuator::state`] is a lock-protected snapshot, never blocked by I/O
//! - **execution**: one worker task per device applies commands to the
//!   [`Driver`] in submission order, with pacing, heartbeat and retry
//!
//! Concrete actuators compose a [`CqrsDevice`] with a driver of their own
//! rather than inheriting from a base type.

mod pace;
mod worker;

pub use pace::*;
pub use worker::*;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

use hvac_types::{DeviceState, Error, Result, Signal};

// ─────────────────────────────────────────────────────────────────────────────
// Command
// ─────────────────────────────────────────────────────────────────────────────

/// Anything a device can be told to do
pub trait Command: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Debug + Send + Sync + 'static> Command for T {}

/// Resolves once the command it was issued for has been executed or paced away
pub type Completion = oneshot::Receiver<()>;

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

/// Hardware access for one device
///
/// Called only from the device worker, one command at a time. A returned
/// error makes the worker retry the same command after the back-off, unless
/// it is [permanent](hvac_types::Error::is_permanent): then the command is
/// abandoned and the device stays unavailable.
#[async_trait]
pub trait Driver<C>: Send + Sync + 'static {
    async fn write(&self, command: &C) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Actuator
// ─────────────────────────────────────────────────────────────────────────────

/// Capability set shared by every actuator
#[async_trait]
pub trait Actuator<C: Command>: Send + Sync {
    /// Device identifier
    fn id(&self) -> &str;

    /// Accept a command without waiting for it to execute
    fn set_state(&self, command: C) -> Result<DeviceState<C>>;

    /// Accept a command and hand back a completion for it
    fn submit(&self, command: C) -> Result<Completion>;

    /// Current requested/actual state
    fn state(&self) -> DeviceState<C>;

    /// Stream of state changes, completing when the device is closed
    fn flux(&self) -> broadcast::Receiver<Signal<DeviceState<C>>>;

    /// Run the closing command and stop accepting new ones
    async fn close(&self) -> Result<DeviceState<C>>;

    /// Submit a command and wait until the worker is done with it
    async fn apply(&self, command: C) -> Result<DeviceState<C>> {
        self.submit(command)?
            .await
            .map_err(|_| Error::Closed(self.id().to_string()))?;
        Ok(self.state())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Options
// ─────────────────────────────────────────────────────────────────────────────

/// Execution options of a device worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Minimum interval between identical hardware writes
    pub pace: Option<Duration>,

    /// Maximum interval before the last command is written again
    pub heartbeat: Option<Duration>,

    /// Delay between attempts of a failed hardware write
    pub retry_backoff: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            pace: None,
            heartbeat: None,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl DeviceOptions {
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Reject combinations the worker can't honor
    pub fn validate(&self) -> Result<()> {
        if let Some(heartbeat) = self.heartbeat {
            if heartbeat.is_zero() {
                return Err(Error::invalid("heartbeat must be positive"));
            }
            if let Some(pace) = self.pace {
                if heartbeat <= pace {
                    return Err(Error::invalid(format!(
                        "heartbeat ({heartbeat:?}) must be longer than pace ({pace:?})"
                    )));
                }
            }
        }

        if self.retry_backoff.is_zero() {
            return Err(Error::invalid("retry back-off must be positive"));
        }

        Ok(())
    }
}
