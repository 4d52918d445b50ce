//! Process Controllers
//!
//! Building blocks of the thermostat: a PID controller producing a signed
//! control signal, a hysteresis renderer turning it into on/off, and a
//! setpoint smoother that keeps setpoint changes from jolting the output.

mod hysteresis;
mod pid;
mod setpoint;

pub use hysteresis::*;
pub use pid::*;
pub use setpoint::*;
