//! Setpoint smoothing
//!
//! A setpoint change doesn't take effect at once; the effective setpoint
//! decays exponentially from the old value toward the new one, closing half
//! the remaining distance every half-life.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Effective setpoint tracker
#[derive(Debug, Clone)]
pub struct SetpointSmoother {
    half_life: Duration,
    target: f64,
    from: f64,
    changed_at: Option<DateTime<Utc>>,
}

impl SetpointSmoother {
    /// A zero half-life makes every change immediate
    pub fn new(setpoint: f64, half_life: Duration) -> Self {
        Self {
            half_life,
            target: setpoint,
            from: setpoint,
            changed_at: None,
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    /// Start moving toward `setpoint` from wherever the effective value is now
    pub fn set(&mut self, setpoint: f64, at: DateTime<Utc>) {
        self.from = self.effective(at);
        self.target = setpoint;
        self.changed_at = Some(at);
    }

    pub fn effective(&self, at: DateTime<Utc>) -> f64 {
        let Some(changed_at) = self.changed_at else {
            return self.target;
        };
        if self.half_life.is_zero() {
            return self.target;
        }

        let elapsed = (at - changed_at).num_milliseconds().max(0) as f64;
        let half_lives = elapsed / self.half_life.as_millis() as f64;

        self.target + (self.from - self.target) * 0.5f64.powf(half_lives)
    }
}
