//! Thermostat
//!
//! Turns a stream of temperature samples into a stream of
//! [`CallingStatus`]: how much the zone wants conditioning and whether it is
//! actually calling for it.
//!
//! A PID controller produces the control signal, a [`Hysteresis`] renderer
//! decides `calling`, and `demand` is the control signal shifted by the
//! hysteresis half-width so that it is zero at the bottom of the dead band.
//! Setpoint changes go through a [`SetpointSmoother`].

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use hvac_types::{Error, HvacMode, Result, SIGNAL_BUFFER, Signal};

use crate::controller::{Hysteresis, PidController, SetpointSmoother};

/// Setpoints outside this range are rejected
pub const SETPOINT_RANGE: RangeInclusive<f64> = 10.0..=40.0;

/// Thermostat output
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CallingStatus {
    pub demand: f64,
    pub calling: bool,
}

impl CallingStatus {
    /// Nothing wanted
    pub const IDLE: Self = Self {
        demand: 0.0,
        calling: false,
    };
}

pub(crate) fn check_setpoint(setpoint: f64) -> Result<f64> {
    if !setpoint.is_finite() || !SETPOINT_RANGE.contains(&setpoint) {
        return Err(Error::invalid(format!(
            "setpoint must be within {}..{} (given: {setpoint})",
            SETPOINT_RANGE.start(),
            SETPOINT_RANGE.end()
        )));
    }
    Ok(setpoint)
}

// ─────────────────────────────────────────────────────────────────────────────
// Core
// ─────────────────────────────────────────────────────────────────────────────

struct Core {
    name: Arc<str>,
    pid: PidController,
    renderer: Hysteresis,
    smoother: SetpointSmoother,
    last_sample: Option<Signal<f64>>,
    last_signal: Option<f64>,
    status: Signal<CallingStatus>,
}

impl Core {
    fn process(&mut self, sample: Signal<f64>) -> Signal<CallingStatus> {
        let timestamp = sample.timestamp();
        self.last_sample = Some(sample.clone());

        let status = match sample.value() {
            Some(&pv) if !sample.is_error() => {
                let setpoint = self.smoother.effective(timestamp);
                match self.pid.compute(setpoint, pv, timestamp) {
                    Ok(pid) => {
                        self.last_signal = Some(pid.signal);
                        let calling = self.renderer.compute(pid.signal);
                        sample.with_value(CallingStatus {
                            demand: pid.signal - self.renderer.low(),
                            calling,
                        })
                    }
                    Err(e) => {
                        tracing::warn!(thermostat = %self.name, pv, error = %e, "Can't compute");
                        Signal::failure(timestamp, Some(CallingStatus::IDLE), e)
                    }
                }
            }
            _ => {
                let e = sample
                    .error()
                    .cloned()
                    .unwrap_or_else(|| Error::TotalFailure(self.name.to_string()));
                Signal::failure(timestamp, Some(CallingStatus::IDLE), e)
            }
        };

        self.status = status.clone();
        status
    }

    /// Recompute the last sample as of `now`
    fn replay(&mut self, now: DateTime<Utc>) -> Option<Signal<CallingStatus>> {
        let sample = self.last_sample.clone()?;
        Some(self.process(sample.at(now)))
    }

    /// Force calling if the last signal sits inside the dead band
    fn raise(&mut self, now: DateTime<Utc>) -> Option<Signal<CallingStatus>> {
        if self.renderer.is_on() {
            return None;
        }
        let signal = self.last_signal?;
        let input = self.renderer.last_input()?;
        if !self.last_sample.as_ref().is_some_and(|s| !s.is_error()) {
            return None;
        }
        if input < self.renderer.low() || input >= self.renderer.high() {
            return None;
        }

        let calling = self.renderer.compute(self.renderer.high());
        tracing::debug!(thermostat = %self.name, signal, "Raised");

        let status = Signal::new(
            now,
            CallingStatus {
                demand: signal - self.renderer.low(),
                calling,
            },
        );
        self.status = status.clone();
        Some(status)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Thermostat
// ─────────────────────────────────────────────────────────────────────────────

enum Control {
    /// Setpoint changed, recompute the last sample
    Setpoint,
    Raise,
}

enum Input {
    Sample(Signal<f64>),
    Control(Control),
}

fn step(core: &Mutex<Core>, input: Input) -> Option<Signal<CallingStatus>> {
    let mut core = core.lock();
    match input {
        Input::Sample(sample) => Some(core.process(sample)),
        Input::Control(Control::Setpoint) => core.replay(Utc::now()),
        Input::Control(Control::Raise) => core.raise(Utc::now()),
    }
}

/// Cloneable thermostat handle
///
/// Setpoint changes and raises can come from any clone; the output stream is
/// produced by the single task started with [`Thermostat::compute`].
#[derive(Clone)]
pub struct Thermostat {
    name: Arc<str>,
    core: Arc<Mutex<Core>>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Control>>>>,
}

impl Thermostat {
    pub fn new(name: impl Into<String>, setpoint: f64, pid: PidController) -> Result<Self> {
        let name: Arc<str> = Arc::from(name.into());
        let setpoint = check_setpoint(setpoint)?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let core = Core {
            name: Arc::clone(&name),
            pid,
            renderer: Hysteresis::default(),
            smoother: SetpointSmoother::new(setpoint, Duration::ZERO),
            last_sample: None,
            last_signal: None,
            status: Signal::failure(Utc::now(), None, Error::NoData),
        };

        Ok(Self {
            name,
            core: Arc::new(Mutex::new(core)),
            control_tx,
            control_rx: Arc::new(Mutex::new(Some(control_rx))),
        })
    }

    pub fn with_hysteresis(self, renderer: Hysteresis) -> Self {
        self.core.lock().renderer = renderer;
        self
    }

    /// Smooth setpoint changes over `half_life`
    pub fn with_half_life(self, half_life: Duration) -> Self {
        {
            let mut core = self.core.lock();
            let target = core.smoother.target();
            core.smoother = SetpointSmoother::new(target, half_life);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target setpoint, not the smoothed one
    pub fn setpoint(&self) -> f64 {
        self.core.lock().smoother.target()
    }

    pub fn mode(&self) -> HvacMode {
        self.core.lock().pid.mode()
    }

    /// Last emitted status; a failure with [`Error::NoData`] before the first sample
    pub fn status(&self) -> Signal<CallingStatus> {
        self.core.lock().status.clone()
    }

    /// Change the setpoint
    ///
    /// Emits a recomputed status if a sample has been seen already.
    pub fn set_setpoint(&self, setpoint: f64) -> Result<()> {
        let setpoint = check_setpoint(setpoint)?;
        self.core.lock().smoother.set(setpoint, Utc::now());

        tracing::debug!(thermostat = %self.name, setpoint, "Setpoint changed");
        self.control(Control::Setpoint);
        Ok(())
    }

    /// Make the thermostat call if it is inside the dead band and not calling yet
    ///
    /// Used to let nearly unhappy zones ride along when the unit starts
    /// anyway. Does nothing if the thermostat is calling, has no data, or
    /// sits below the dead band.
    pub fn raise(&self) {
        self.control(Control::Raise);
    }

    fn control(&self, message: Control) {
        if self.control_tx.send(message).is_err() {
            tracing::debug!(thermostat = %self.name, "Output complete, control ignored");
        }
    }

    /// Start producing the output stream
    ///
    /// Can only be called once; the stream ends when `samples` does.
    pub fn compute(
        &self,
        mut samples: mpsc::Receiver<Signal<f64>>,
    ) -> Result<mpsc::Receiver<Signal<CallingStatus>>> {
        let mut control = self.control_rx.lock().take().ok_or_else(|| {
            Error::illegal_state(format!("{}: already computing", self.name))
        })?;

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let core = Arc::clone(&self.core);
        let name = Arc::clone(&self.name);

        tokio::spawn(async move {
            loop {
                let input = tokio::select! {
                    sample = samples.recv() => match sample {
                        Some(sample) => Input::Sample(sample),
                        None => break,
                    },
                    Some(message) = control.recv() => Input::Control(message),
                };

                if let Some(status) = step(&core, input) {
                    if tx.send(status).await.is_err() {
                        break;
                    }
                }
            }
            tracing::debug!(thermostat = %name, "Input complete");
        });

        Ok(rx)
    }
}

impl std::fmt::Debug for Thermostat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thermostat")
            .field("name", &self.name)
            .field("setpoint", &self.setpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thermostat(setpoint: f64) -> Thermostat {
        let pid = PidController::new(1.0, 0.0, 0.0, 1.0).unwrap();
        Thermostat::new("ts", setpoint, pid).unwrap()
    }

    async fn feed(
        out: &mut mpsc::Receiver<Signal<CallingStatus>>,
        tx: &mpsc::Sender<Signal<f64>>,
        sample: Signal<f64>,
    ) -> Signal<CallingStatus> {
        tx.send(sample).await.unwrap();
        out.recv().await.unwrap()
    }

    #[tokio::test]
    async fn demand_and_calling_follow_hysteresis() {
        let ts = thermostat(20.0);
        let (tx, rx) = mpsc::channel(16);
        let mut out = ts.compute(rx).unwrap();

        let mut demand = Vec::new();
        let mut calling = Vec::new();
        for pv in [20.0, 20.5, 21.0, 20.5, 20.0, 19.5, 19.0] {
            let s = feed(&mut out, &tx, Signal::new(Utc::now(), pv)).await;
            assert!(s.is_ok());
            demand.push(s.value().unwrap().demand);
            calling.push(s.value().unwrap().calling);
        }

        assert_eq!(demand, vec![1.0, 1.5, 2.0, 1.5, 1.0, 0.5, 0.0]);
        assert_eq!(calling, vec![false, false, true, true, true, true, false]);
        assert_eq!(ts.mode(), HvacMode::Cooling);
    }

    #[tokio::test]
    async fn no_data_before_first_sample() {
        let ts = thermostat(20.0);
        let status = ts.status();

        assert!(status.is_error());
        assert_eq!(status.error(), Some(&Error::NoData));
    }

    #[tokio::test(start_paused = true)]
    async fn setpoint_change_before_any_sample_emits_nothing() {
        let ts = thermostat(20.0);
        let (tx, rx) = mpsc::channel(16);
        let mut out = ts.compute(rx).unwrap();

        ts.set_setpoint(22.0).unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(100), out.recv()).await;
        assert!(nothing.is_err());

        // Now there is a sample to replay
        let s = feed(&mut out, &tx, Signal::new(Utc::now(), 23.0)).await;
        assert_eq!(s.value().unwrap().demand, 2.0);

        ts.set_setpoint(21.0).unwrap();
        let replayed = out.recv().await.unwrap();
        assert_eq!(replayed.value().unwrap().demand, 3.0);
        assert_eq!(ts.setpoint(), 21.0);
    }

    #[tokio::test]
    async fn setpoint_outside_range_rejected() {
        let ts = thermostat(20.0);

        for setpoint in [9.9, 40.1, f64::NAN, f64::INFINITY] {
            assert!(matches!(ts.set_setpoint(setpoint), Err(Error::InvalidArgument(_))));
        }
        assert_eq!(ts.setpoint(), 20.0);

        let pid = PidController::new(1.0, 0.0, 0.0, 0.0).unwrap();
        assert!(Thermostat::new("ts", 50.0, pid).is_err());
    }

    #[tokio::test]
    async fn failures_propagate() {
        let ts = thermostat(20.0);
        let (tx, rx) = mpsc::channel(16);
        let mut out = ts.compute(rx).unwrap();

        let failed = feed(
            &mut out,
            &tx,
            Signal::failure(Utc::now(), None, Error::TotalFailure("sensor".into())),
        )
        .await;
        assert!(failed.is_error());
        assert_eq!(failed.value(), Some(&CallingStatus::IDLE));
        assert_eq!(failed.error(), Some(&Error::TotalFailure("sensor".into())));

        let partial = feed(
            &mut out,
            &tx,
            Signal::partial(Utc::now(), 22.0, Error::PartialFailure("1 of 2 sensors".into())),
        )
        .await;
        assert!(!partial.is_ok());
        assert!(!partial.is_error());
        assert_eq!(partial.value().unwrap().demand, 3.0);
        assert!(partial.value().unwrap().calling);
    }

    #[tokio::test(start_paused = true)]
    async fn raise_inside_dead_band() {
        let ts = thermostat(20.0);
        let (tx, rx) = mpsc::channel(16);
        let mut out = ts.compute(rx).unwrap();

        let s = feed(&mut out, &tx, Signal::new(Utc::now(), 20.5)).await;
        assert!(!s.value().unwrap().calling);

        ts.raise();
        let raised = out.recv().await.unwrap();
        assert_eq!(raised.value().unwrap().demand, 1.5);
        assert!(raised.value().unwrap().calling);
        assert!(ts.status().value().unwrap().calling);

        // Already calling, nothing to do
        ts.raise();
        let nothing = tokio::time::timeout(Duration::from_millis(100), out.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn raise_below_dead_band_does_nothing() {
        let ts = thermostat(20.0);
        let (tx, rx) = mpsc::channel(16);
        let mut out = ts.compute(rx).unwrap();

        feed(&mut out, &tx, Signal::new(Utc::now(), 18.0)).await;

        ts.raise();
        let nothing = tokio::time::timeout(Duration::from_millis(100), out.recv()).await;
        assert!(nothing.is_err());
        assert!(!ts.status().value().unwrap().calling);
    }

    #[tokio::test]
    async fn setpoint_change_is_smoothed() {
        let ts = thermostat(20.0).with_half_life(Duration::from_secs(60));
        let (tx, rx) = mpsc::channel(16);
        let mut out = ts.compute(rx).unwrap();

        feed(&mut out, &tx, Signal::new(Utc::now(), 20.0)).await;

        ts.set_setpoint(24.0).unwrap();
        let replayed = out.recv().await.unwrap();
        assert!((replayed.value().unwrap().demand - 1.0).abs() < 0.01);

        let later = Utc::now() + chrono::Duration::seconds(60);
        let s = feed(&mut out, &tx, Signal::new(later, 20.0)).await;
        assert!((s.value().unwrap().demand + 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn compute_only_once() {
        let ts = thermostat(20.0);
        let (_tx, rx) = mpsc::channel(1);
        let _out = ts.compute(rx).unwrap();

        let (_tx2, rx2) = mpsc::channel(1);
        assert!(matches!(ts.compute(rx2), Err(Error::IllegalState(_))));
    }
}
