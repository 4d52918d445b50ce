//! Zone control
//!
//! Thermostats, zones and the voting zone controller that together decide
//! how hard the HVAC unit should run.
//!
//! Data flows one way: temperature samples go into a [`Zone`], which runs
//! them through its [`Thermostat`]; the [`ZoneController`] folds every zone's
//! output into a unit demand, and the [`SingleStageUnitController`] turns that
//! into commands for an HVAC device.

pub mod config;
pub mod controller;
pub mod stream;
pub mod thermostat;
pub mod unit;
pub mod zone;
pub mod zone_controller;

pub use config::Config;
pub use thermostat::{CallingStatus, Thermostat};
pub use unit::SingleStageUnitController;
pub use zone::{Zone, ZoneSettings, ZoneSettingsUpdate, ZoneStatus};
pub use zone_controller::{ZoneController, ZoneControllerHandle, ZoneControllerSnapshot};
