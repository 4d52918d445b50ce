//! HVAC command and unit signal types

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Mode
// ─────────────────────────────────────────────────────────────────────────────

/// Operating mode of an HVAC unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Cooling,
    Heating,
    Fan,
}

impl std::fmt::Display for HvacMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HvacMode::Cooling => write!(f, "cooling"),
            HvacMode::Heating => write!(f, "heating"),
            HvacMode::Fan => write!(f, "fan"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command
// ─────────────────────────────────────────────────────────────────────────────

/// Command for an HVAC device
///
/// Absent fields mean "leave as is".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HvacCommand {
    pub mode: Option<HvacMode>,
    pub demand: Option<f64>,
    pub fan_speed: Option<f64>,
}

impl HvacCommand {
    pub fn new(mode: Option<HvacMode>, demand: Option<f64>, fan_speed: Option<f64>) -> Self {
        Self {
            mode,
            demand,
            fan_speed,
        }
    }

    /// Overlay `other` on top of this command; fields present in `other` win
    pub fn reconcile(&self, other: &HvacCommand) -> HvacCommand {
        HvacCommand {
            mode: other.mode.or(self.mode),
            demand: other.demand.or(self.demand),
            fan_speed: other.fan_speed.or(self.fan_speed),
        }
    }

    /// Whether the command asks the compressor/stage to run
    pub fn wants_demand(&self) -> bool {
        self.demand.is_some_and(|d| d > 0.0)
    }

    /// Whether the command asks the fan to run
    pub fn wants_fan(&self) -> bool {
        self.fan_speed.is_some_and(|f| f > 0.0)
    }
}

impl std::fmt::Display for HvacCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn show<T: std::fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map_or_else(|| "-".to_string(), |v| v.to_string())
        }
        write!(
            f,
            "{{mode={}, demand={}, fan_speed={}}}",
            show(&self.mode),
            show(&self.demand),
            show(&self.fan_speed)
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unit Signal
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregate demand for the whole HVAC unit
///
/// Positive demand means "run harder in the configured direction".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitControlSignal {
    pub demand: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_speed: Option<f64>,
}

impl UnitControlSignal {
    pub fn new(demand: f64) -> Self {
        Self {
            demand,
            fan_speed: None,
        }
    }
}
