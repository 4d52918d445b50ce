//! HVAC Types - Core value types shared by the zoning controller
//!
//! This crate contains the pure data structures that flow between the
//! thermostat, zone, aggregation and actuator layers: the [`Signal`]
//! envelope, the error taxonomy, and HVAC command/state types.

mod device;
mod error;
mod hvac;
mod signal;

pub use device::*;
pub use error::*;
pub use hvac::*;
pub use signal::*;
