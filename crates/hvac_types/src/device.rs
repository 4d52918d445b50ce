//! Actuator state as seen by instrumentation

use serde::{Deserialize, Serialize};

/// Snapshot of a command/state-separated device
///
/// `requested` is updated as soon as a command is accepted, `actual` only
/// once the hardware write has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState<T> {
    /// Device identifier
    pub id: String,

    /// False while hardware writes are failing
    pub available: bool,

    /// Last accepted command
    pub requested: Option<T>,

    /// Last command confirmed by the hardware
    pub actual: Option<T>,

    /// Commands accepted but not yet executed or dropped
    pub queue_depth: usize,
}

impl<T> DeviceState<T> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            available: true,
            requested: None,
            actual: None,
            queue_depth: 0,
        }
    }
}
