//! HVAC Actuator - Command/state-separated hardware devices
//!
//! Every device accepts commands without blocking, exposes its requested and
//! actual state at any time, and applies commands to hardware through a
//! single ordered worker per device.
//!
//! - [`device`] - the worker, pacing, heartbeat and the [`Actuator`] capability set
//! - [`switch`], [`stacking`], [`damper`] - boolean and positional actuators
//! - [`hvac`] - mode/demand/fan-speed devices driven by command streams
//! - [`null`] - in-memory driver for tests and dry runs

pub mod damper;
pub mod device;
pub mod hvac;
pub mod null;
pub mod stacking;
pub mod switch;

pub use damper::{DamperMultiplexer, DamperOptions, SwitchDamper};
pub use device::{Actuator, Command, Completion, CqrsDevice, DeviceOptions, Driver, Pacer};
pub use hvac::{HeatPump, HvacDevice, HvacDeviceStatus, SwitchableHvacDevice};
pub use null::NullDriver;
pub use stacking::{StackingSwitch, VirtualSwitch};
pub use switch::Switch;
