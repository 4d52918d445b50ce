//! Zone
//!
//! A thermostat plus the user-facing settings of the space it serves. The
//! zone's output is the thermostat output tagged with the zone name and the
//! settings in force when it was produced.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use hvac_types::{Error, Result, SIGNAL_BUFFER, Signal};

use crate::thermostat::{CallingStatus, Thermostat, check_setpoint};

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Economizer parameters, carried along but not acted upon here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomizerSettings {
    /// Minimum indoor/outdoor difference to use outside air
    pub changeover_delta: f64,

    pub target_temperature: f64,

    /// Keep the HVAC running while economizing
    #[serde(default)]
    pub keep_hvac_on: bool,
}

/// Zone settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSettings {
    pub enabled: bool,
    pub setpoint: f64,

    /// Whether this zone alone can start the unit
    pub voting: bool,

    /// Ignore period (schedule) settings while set
    pub hold: bool,

    pub dump_priority: i32,

    #[serde(default)]
    pub economizer: Option<EconomizerSettings>,
}

impl ZoneSettings {
    pub fn new(setpoint: f64) -> Self {
        Self {
            enabled: true,
            setpoint,
            voting: true,
            hold: false,
            dump_priority: 0,
            economizer: None,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_voting(mut self, voting: bool) -> Self {
        self.voting = voting;
        self
    }

    pub fn with_hold(mut self, hold: bool) -> Self {
        self.hold = hold;
        self
    }

    pub fn with_dump_priority(mut self, dump_priority: i32) -> Self {
        self.dump_priority = dump_priority;
        self
    }

    pub fn with_economizer(mut self, economizer: EconomizerSettings) -> Self {
        self.economizer = Some(economizer);
        self
    }

    /// Apply every field present in `update`
    pub fn merge(&self, update: &ZoneSettingsUpdate) -> Self {
        Self {
            enabled: update.enabled.unwrap_or(self.enabled),
            setpoint: update.setpoint.unwrap_or(self.setpoint),
            voting: update.voting.unwrap_or(self.voting),
            hold: update.hold.unwrap_or(self.hold),
            dump_priority: update.dump_priority.unwrap_or(self.dump_priority),
            economizer: update
                .economizer
                .clone()
                .or_else(|| self.economizer.clone()),
        }
    }
}

/// Partial settings change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneSettingsUpdate {
    pub enabled: Option<bool>,
    pub setpoint: Option<f64>,
    pub voting: Option<bool>,
    pub hold: Option<bool>,
    pub dump_priority: Option<i32>,
    pub economizer: Option<EconomizerSettings>,
}

/// Zone output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneStatus {
    pub zone: String,
    pub settings: ZoneSettings,

    /// Thermostat output; `calling` is forced off for disabled zones
    pub thermostat: CallingStatus,
}

impl ZoneStatus {
    pub fn is_calling(&self) -> bool {
        self.thermostat.calling
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Zone
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable zone handle
#[derive(Clone)]
pub struct Zone {
    name: Arc<str>,
    thermostat: Thermostat,
    settings: Arc<Mutex<ZoneSettings>>,
    replay_tx: mpsc::UnboundedSender<()>,
    replay_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<()>>>>,
}

impl Zone {
    /// The zone takes its name from the thermostat and pushes its setpoint to it
    pub fn new(thermostat: Thermostat, settings: ZoneSettings) -> Result<Self> {
        thermostat.set_setpoint(settings.setpoint)?;
        let (replay_tx, replay_rx) = mpsc::unbounded_channel();

        Ok(Self {
            name: Arc::from(thermostat.name()),
            thermostat,
            settings: Arc::new(Mutex::new(settings)),
            replay_tx,
            replay_rx: Arc::new(Mutex::new(Some(replay_rx))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thermostat(&self) -> &Thermostat {
        &self.thermostat
    }

    pub fn settings(&self) -> ZoneSettings {
        self.settings.lock().clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.update(|s| s.enabled = enabled);
    }

    pub fn set_voting(&self, voting: bool) {
        self.update(|s| s.voting = voting);
    }

    pub fn set_hold(&self, hold: bool) {
        self.update(|s| s.hold = hold);
    }

    pub fn set_dump_priority(&self, dump_priority: i32) {
        self.update(|s| s.dump_priority = dump_priority);
    }

    /// The thermostat emits the recomputed status itself
    pub fn set_setpoint(&self, setpoint: f64) -> Result<()> {
        let setpoint = check_setpoint(setpoint)?;
        self.settings.lock().setpoint = setpoint;
        self.thermostat.set_setpoint(setpoint)
    }

    /// Apply a partial settings change
    pub fn set_settings(&self, update: &ZoneSettingsUpdate) -> Result<()> {
        if let Some(setpoint) = update.setpoint {
            check_setpoint(setpoint)?;
        }

        let (before, after) = {
            let mut settings = self.settings.lock();
            let before = settings.clone();
            *settings = settings.merge(update);
            (before, settings.clone())
        };

        if before.setpoint != after.setpoint {
            self.thermostat.set_setpoint(after.setpoint)?;
        }
        if before != after {
            tracing::debug!(zone = %self.name, ?after, "Settings changed");
            self.replay();
        }
        Ok(())
    }

    /// Apply schedule settings unless the zone is on hold
    ///
    /// Returns whether the settings were applied.
    pub fn set_period_settings(&self, settings: &ZoneSettings) -> Result<bool> {
        if self.settings.lock().hold {
            tracing::info!(zone = %self.name, "On hold, period settings ignored");
            return Ok(false);
        }

        let update = ZoneSettingsUpdate {
            enabled: Some(settings.enabled),
            setpoint: Some(settings.setpoint),
            voting: Some(settings.voting),
            hold: Some(settings.hold),
            dump_priority: Some(settings.dump_priority),
            economizer: settings.economizer.clone(),
        };
        self.set_settings(&update)?;
        Ok(true)
    }

    /// See [`Thermostat::raise`]
    pub fn raise(&self) {
        self.thermostat.raise();
    }

    fn update(&self, change: impl FnOnce(&mut ZoneSettings)) {
        let changed = {
            let mut settings = self.settings.lock();
            let before = settings.clone();
            change(&mut settings);
            *settings != before
        };
        if changed {
            self.replay();
        }
    }

    fn replay(&self) {
        if self.replay_tx.send(()).is_err() {
            tracing::debug!(zone = %self.name, "Output complete, replay ignored");
        }
    }

    /// Start producing the output stream from temperature samples
    ///
    /// Can only be called once; the stream ends when `samples` does.
    pub fn compute(
        &self,
        samples: mpsc::Receiver<Signal<f64>>,
    ) -> Result<mpsc::Receiver<Signal<ZoneStatus>>> {
        let mut replay = self.replay_rx.lock().take().ok_or_else(|| {
            Error::illegal_state(format!("{}: already computing", self.name))
        })?;
        let mut input = self.thermostat.compute(samples)?;

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let zone = self.clone();

        tokio::spawn(async move {
            let mut last: Option<Signal<CallingStatus>> = None;

            loop {
                let status = tokio::select! {
                    signal = input.recv() => match signal {
                        Some(signal) => {
                            let status = zone.status(&signal);
                            last = Some(signal);
                            Some(status)
                        }
                        None => break,
                    },
                    Some(()) = replay.recv() => last.as_ref().map(|signal| zone.status(signal)),
                };

                if let Some(status) = status {
                    if tx.send(status).await.is_err() {
                        break;
                    }
                }
            }
            tracing::debug!(zone = %zone.name, "Input complete");
        });

        Ok(rx)
    }

    fn status(&self, signal: &Signal<CallingStatus>) -> Signal<ZoneStatus> {
        let settings = self.settings();
        let mut thermostat = signal.value().copied().unwrap_or(CallingStatus::IDLE);
        if !settings.enabled {
            thermostat.calling = false;
        }

        signal.with_value(ZoneStatus {
            zone: self.name.to_string(),
            settings,
            thermostat,
        })
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("name", &self.name)
            .field("settings", &self.settings())
            .finish()
    }
}
