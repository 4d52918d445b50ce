//! Hysteresis renderer: signed signal in, on/off out.

use hvac_types::{Error, Result};

/// Default half-width of the dead band
pub const DEFAULT_HYSTERESIS: f64 = 1.0;

/// Turns on at `signal >= +threshold`, off at `signal <= -threshold`, and
/// holds its state in between.
#[derive(Debug, Clone)]
pub struct Hysteresis {
    low: f64,
    high: f64,
    on: bool,
    last_input: Option<f64>,
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self {
            low: -DEFAULT_HYSTERESIS,
            high: DEFAULT_HYSTERESIS,
            on: false,
            last_input: None,
        }
    }
}

impl Hysteresis {
    pub fn new(threshold: f64) -> Result<Self> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(Error::invalid(format!(
                "hysteresis must be positive (given: {threshold})"
            )));
        }

        Ok(Self {
            low: -threshold,
            high: threshold,
            ..Self::default()
        })
    }

    pub fn compute(&mut self, input: f64) -> bool {
        if self.on {
            if input <= self.low {
                self.on = false;
            }
        } else if input >= self.high {
            self.on = true;
        }

        self.last_input = Some(input);
        self.on
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn last_input(&self) -> Option<f64> {
        self.last_input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_band_holds_state() {
        let mut h = Hysteresis::default();

        let states: Vec<bool> = [0.0, 0.5, 1.0, 0.5, 0.0, -0.5, -1.0, -0.5]
            .into_iter()
            .map(|input| h.compute(input))
            .collect();

        assert_eq!(states, vec![false, false, true, true, true, true, false, false]);
        assert_eq!(h.last_input(), Some(-0.5));
    }

    #[test]
    fn threshold_must_be_positive() {
        assert!(Hysteresis::new(0.0).is_err());
        assert!(Hysteresis::new(-1.0).is_err());
        assert!(Hysteresis::new(f64::INFINITY).is_err());

        let h = Hysteresis::new(0.5).unwrap();
        assert_eq!((h.low(), h.high()), (-0.5, 0.5));
    }
}
