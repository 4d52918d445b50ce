//! Configuration
//!
//! TOML layout:
//!
//! ```toml
//! [unit]
//! mode = "cooling"
//! mode_change_delay_ms = 10000
//!
//! [device]
//! heartbeat_ms = 60000
//!
//! [[zone]]
//! name = "bedroom"
//! setpoint = 22.0
//! p = 1.0
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use hvac_actuator::DeviceOptions;
use hvac_types::HvacMode;

use crate::controller::{Hysteresis, PidController};
use crate::thermostat::Thermostat;
use crate::zone::{Zone, ZoneSettings};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Can't build zone {zone}: {source}")]
    Zone {
        zone: String,
        source: hvac_types::Error,
    },
}

/// Top-level configuration (zonectl.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub unit: UnitConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default, rename = "zone")]
    pub zones: Vec<ZoneConfig>,
}

/// Kind of HVAC unit behind the zones
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Mode, running and fan switches
    #[default]
    HeatPump,

    /// One switch, fixed mode
    Switchable,
}

/// HVAC unit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    #[serde(default)]
    pub kind: UnitKind,

    #[serde(default = "default_mode")]
    pub mode: HvacMode,

    /// Switchable units only: switch on means unit off
    #[serde(default)]
    pub inverted: bool,

    /// Heat pump pause between stopping the compressor and switching mode
    #[serde(default = "default_mode_change_delay_ms")]
    pub mode_change_delay_ms: u64,

    /// Run the fan together with the stage
    #[serde(default = "default_true")]
    pub fan_with_stage: bool,
}

fn default_mode() -> HvacMode {
    HvacMode::Cooling
}

fn default_mode_change_delay_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            kind: UnitKind::default(),
            mode: default_mode(),
            inverted: false,
            mode_change_delay_ms: default_mode_change_delay_ms(),
            fan_with_stage: true,
        }
    }
}

impl UnitConfig {
    pub fn mode_change_delay(&self) -> Duration {
        Duration::from_millis(self.mode_change_delay_ms)
    }
}

/// Defaults for every device worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub pace_ms: Option<u64>,
    pub heartbeat_ms: Option<u64>,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Null driver write delay range
    #[serde(default)]
    pub min_delay_ms: u64,
    #[serde(default)]
    pub max_delay_ms: u64,
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            pace_ms: None,
            heartbeat_ms: None,
            retry_backoff_ms: default_retry_backoff_ms(),
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

impl DeviceConfig {
    pub fn options(&self) -> DeviceOptions {
        let mut options = DeviceOptions::default()
            .with_retry_backoff(Duration::from_millis(self.retry_backoff_ms));
        if let Some(pace) = self.pace_ms {
            options = options.with_pace(Duration::from_millis(pace));
        }
        if let Some(heartbeat) = self.heartbeat_ms {
            options = options.with_heartbeat(Duration::from_millis(heartbeat));
        }
        options
    }

    pub fn delay(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// One zone and its thermostat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    pub setpoint: f64,

    #[serde(default = "default_p")]
    pub p: f64,
    #[serde(default)]
    pub i: f64,
    #[serde(default)]
    pub d: f64,
    #[serde(default)]
    pub limit: f64,

    #[serde(default = "default_hysteresis")]
    pub hysteresis: f64,

    /// Setpoint change half-life, 0 for immediate
    #[serde(default)]
    pub half_life_ms: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub voting: bool,
    #[serde(default)]
    pub hold: bool,
    #[serde(default)]
    pub dump_priority: i32,
}

fn default_p() -> f64 {
    1.0
}

fn default_hysteresis() -> f64 {
    crate::controller::DEFAULT_HYSTERESIS
}

impl ZoneConfig {
    pub fn settings(&self) -> ZoneSettings {
        ZoneSettings::new(self.setpoint)
            .with_enabled(self.enabled)
            .with_voting(self.voting)
            .with_hold(self.hold)
            .with_dump_priority(self.dump_priority)
    }

    fn pid(&self) -> hvac_types::Result<PidController> {
        PidController::new(self.p, self.i, self.d, self.limit)
    }

    /// Mode the zone's thermostat works in, from the sign of its gains
    pub fn mode(&self) -> hvac_types::Result<HvacMode> {
        Ok(self.pid()?.mode())
    }

    pub fn build(&self) -> hvac_types::Result<Zone> {
        let pid = self.pid()?;
        let thermostat = Thermostat::new(&self.name, self.setpoint, pid)?
            .with_hysteresis(Hysteresis::new(self.hysteresis)?)
            .with_half_life(Duration::from_millis(self.half_life_ms));

        Zone::new(thermostat, self.settings())
    }
}

impl Config {
    /// Load and parse a configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).await?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unit.kind == UnitKind::HeatPump && self.unit.mode == HvacMode::Fan {
            return Err(ConfigError::Invalid("a heat pump can't run in fan mode".into()));
        }

        if self.zones.is_empty() {
            return Err(ConfigError::Invalid("no zones configured".into()));
        }

        let mut names = HashSet::new();
        for zone in &self.zones {
            if !names.insert(zone.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate zone name: {}", zone.name)));
            }
            if !zone.setpoint.is_finite() {
                return Err(ConfigError::Invalid(format!("{}: setpoint is not finite", zone.name)));
            }
            if zone.p == 0.0 && zone.i == 0.0 && zone.d == 0.0 {
                return Err(ConfigError::Invalid(format!("{}: all PID gains are zero", zone.name)));
            }
            if zone.limit < 0.0 {
                return Err(ConfigError::Invalid(format!("{}: negative limit", zone.name)));
            }

            // A fan has no direction, any thermostat may call for it
            if self.unit.mode != HvacMode::Fan {
                let mode = zone
                    .mode()
                    .map_err(|e| ConfigError::Invalid(format!("{}: {e}", zone.name)))?;
                if mode != self.unit.mode {
                    return Err(ConfigError::Invalid(format!(
                        "{}: {mode} thermostat can't drive a {} unit (check the sign of the gains)",
                        zone.name, self.unit.mode
                    )));
                }
            }
        }

        self.device
            .options()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Build every configured zone
    pub fn build_zones(&self) -> Result<Vec<Zone>, ConfigError> {
        self.zones
            .iter()
            .map(|zone| {
                zone.build().map_err(|source| ConfigError::Zone {
                    zone: zone.name.clone(),
                    source,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    const SAMPLE: &str = r#"
[unit]
mode = "heating"

[device]
pace_ms = 500
heartbeat_ms = 60000

[[zone]]
name = "bedroom"
setpoint = 21.0
p = -1.0
voting = false

[[zone]]
name = "office"
setpoint = 24.5
p = -0.5
i = -0.00001
limit = 3.0
half_life_ms = 300000
"#;

    #[tokio::test]
    async fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_ok!(config.validate());

        assert_eq!(config.unit.kind, UnitKind::HeatPump);
        assert_eq!(config.unit.mode, HvacMode::Heating);
        assert_eq!(config.unit.mode_change_delay(), Duration::from_secs(10));
        assert!(config.unit.fan_with_stage);

        let options = config.device.options();
        assert_eq!(options.pace, Some(Duration::from_millis(500)));
        assert_eq!(options.heartbeat, Some(Duration::from_secs(60)));
        assert_eq!(options.retry_backoff, Duration::from_secs(1));

        assert_eq!(config.zones.len(), 2);
        let bedroom = &config.zones[0];
        assert_eq!(bedroom.p, -1.0);
        assert_eq!(bedroom.hysteresis, 1.0);
        assert!(bedroom.enabled);
        assert!(!bedroom.voting);
        assert_eq!(config.zones[1].half_life_ms, 300_000);
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(dir.path().join("nope.toml")).await;
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn malformed_toml_rejected() {
        let result = Config::parse("[[zone]]\nname = 1");
        assert!(matches!(result, Err(ConfigError::TomlParseError(_))));
    }

    #[test]
    fn validation() {
        let valid = Config::parse(SAMPLE).unwrap();

        let mut c = valid.clone();
        c.zones.clear();
        assert_err!(c.validate());

        let mut c = valid.clone();
        c.zones[1].name = "bedroom".into();
        assert_err!(c.validate());

        let mut c = valid.clone();
        c.zones[0].setpoint = f64::NAN;
        assert_err!(c.validate());

        let mut c = valid.clone();
        c.zones[0].p = 0.0;
        assert_err!(c.validate());

        let mut c = valid.clone();
        c.zones[0].limit = -1.0;
        assert_err!(c.validate());

        let mut c = valid.clone();
        c.device.heartbeat_ms = Some(500);
        assert_err!(c.validate());

        let mut c = valid.clone();
        c.unit.mode = HvacMode::Fan;
        assert_err!(c.validate());

        let mut c = valid;
        c.unit.kind = UnitKind::Switchable;
        c.unit.mode = HvacMode::Fan;
        assert_ok!(c.validate());
    }

    #[test]
    fn thermostat_mode_must_match_unit() {
        let config = Config::parse(
            r#"
[unit]
mode = "heating"

[[zone]]
name = "bedroom"
setpoint = 21.0
p = 1.0
"#,
        )
        .unwrap();
        assert_eq!(config.zones[0].mode().unwrap(), HvacMode::Cooling);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut c = Config::parse(SAMPLE).unwrap();
        c.zones[1].p = 0.5;
        c.zones[1].i = 0.00001;
        assert_err!(c.validate());

        let mut c = Config::parse(SAMPLE).unwrap();
        c.unit.mode = HvacMode::Cooling;
        assert_err!(c.validate());
        for zone in &mut c.zones {
            zone.p = -zone.p;
            zone.i = -zone.i;
        }
        assert_ok!(c.validate());
    }

    #[tokio::test]
    async fn builds_zones() {
        let config = Config::parse(SAMPLE).unwrap();
        let zones = config.build_zones().unwrap();

        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].name(), "bedroom");
        assert!(!zones[0].settings().voting);
        assert_eq!(zones[1].thermostat().setpoint(), 24.5);
        assert_eq!(zones[1].thermostat().mode(), HvacMode::Heating);
    }

    #[test]
    fn out_of_range_setpoint_fails_to_build() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.zones[0].setpoint = 50.0;

        let result = config.build_zones();
        assert!(matches!(result, Err(ConfigError::Zone { zone, .. }) if zone == "bedroom"));
    }
}
