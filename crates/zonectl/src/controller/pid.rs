//! PID controller
//!
//! `error = pv - setpoint`. Positive gains make the output rise with the
//! process variable (cooling); negative gains make it fall (heating).
//! Integral and derivative terms work in milliseconds.

use chrono::{DateTime, Utc};
use serde::Serialize;

use hvac_types::{Error, HvacMode, Result};

/// One computation step, components included for instrumentation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PidStatus {
    pub setpoint: f64,
    pub error: f64,
    pub signal: f64,
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

#[derive(Debug, Clone, Copy)]
struct Step {
    timestamp: DateTime<Utc>,
    error: f64,
    signal: f64,
}

/// PID controller with saturation limit
///
/// With a non-zero `limit` the integral only accumulates while both the
/// previous output and the integral term stay inside `±limit`.
#[derive(Debug, Clone)]
pub struct PidController {
    p: f64,
    i: f64,
    d: f64,
    limit: f64,
    integral: f64,
    last_i: f64,
    last: Option<Step>,
}

impl PidController {
    pub fn new(p: f64, i: f64, d: f64, limit: f64) -> Result<Self> {
        if ![p, i, d, limit].iter().all(|v| v.is_finite()) {
            return Err(Error::invalid(format!(
                "PID parameters must be finite: P={p} I={i} D={d} limit={limit}"
            )));
        }
        if p == 0.0 && i == 0.0 && d == 0.0 {
            return Err(Error::invalid(
                "All PID components are zeroed: check the configuration",
            ));
        }
        if limit < 0.0 {
            return Err(Error::invalid(format!("limit must be non-negative (given: {limit})")));
        }

        Ok(Self {
            p,
            i,
            d,
            limit,
            integral: 0.0,
            last_i: 0.0,
            last: None,
        })
    }

    /// Direction implied by the gain signs
    pub fn mode(&self) -> HvacMode {
        let gain = [self.p, self.i, self.d]
            .into_iter()
            .find(|g| *g != 0.0)
            .unwrap_or(self.p);
        if gain > 0.0 {
            HvacMode::Cooling
        } else {
            HvacMode::Heating
        }
    }

    pub fn compute(&mut self, setpoint: f64, pv: f64, timestamp: DateTime<Utc>) -> Result<PidStatus> {
        if !pv.is_finite() {
            return Err(Error::invalid(format!("process variable is not finite: {pv}")));
        }

        let error = pv - setpoint;
        let p = error * self.p;

        let dt = self.last.map(|last| {
            let millis = (timestamp - last.timestamp).num_milliseconds() as f64;
            if millis < 0.0 {
                tracing::warn!(millis, "Timestamp went backwards, skipping integral and derivative");
            }
            millis
        });

        if self.limit == 0.0 {
            self.integrate(error, dt);
            self.last_i = self.integral * self.i;
        } else if self.last.is_some_and(|last| last.signal.abs() < self.limit) {
            self.integrate(error, dt);
            let i = self.integral * self.i;
            // Integral term saturated: keep the previous one
            if i.abs() < self.limit {
                self.last_i = i;
            }
        }

        let d = match (self.last, dt) {
            (Some(last), Some(dt)) if dt > 0.0 => {
                let derivative = (error - last.error) / dt * self.d;
                if derivative.is_finite() { derivative } else { 0.0 }
            }
            _ => 0.0,
        };

        let signal = p + self.last_i + d;
        if signal.is_nan() {
            return Err(Error::illegal_state(format!(
                "signal is NaN, components: p={p} i={} d={d}",
                self.last_i
            )));
        }

        self.last = Some(Step {
            timestamp,
            error,
            signal,
        });

        Ok(PidStatus {
            setpoint,
            error,
            signal,
            p,
            i: self.last_i,
            d,
        })
    }

    fn integrate(&mut self, error: f64, dt: Option<f64>) {
        if let Some(dt) = dt {
            if dt > 0.0 {
                self.integral += error * dt;
            }
        }
    }
}
