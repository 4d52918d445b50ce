//! Dampers
//!
//! Positional actuators (0.0 closed .. 1.0 fully open). A [`SwitchDamper`]
//! drives an on/off switch; a [`DamperMultiplexer`] moves several dampers as
//! one and only reports completion once all of them have moved.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use hvac_types::{DeviceState, Error, Result, Signal};

use crate::device::{Actuator, Completion, CqrsDevice, DeviceOptions, Driver};

/// Fully open, the safe position for ducts
pub const DEFAULT_PARK_POSITION: f64 = 1.0;

/// Positions above this open a switch damper
pub const DEFAULT_THRESHOLD: f64 = 0.5;

fn check_position(position: f64) -> Result<f64> {
    if !position.is_finite() || !(0.0..=1.0).contains(&position) {
        return Err(Error::invalid(format!(
            "position must be within 0..1 (given: {position})"
        )));
    }
    Ok(position)
}

// ─────────────────────────────────────────────────────────────────────────────
// Switch Damper
// ─────────────────────────────────────────────────────────────────────────────

/// Options for a [`SwitchDamper`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamperOptions {
    /// Positions strictly above this turn the switch on
    pub threshold: f64,

    /// Swap the switch meaning (on = closed)
    pub inverted: bool,

    /// Position taken when parked or closed
    pub park_position: f64,

    /// Worker options for the damper itself
    pub device: DeviceOptions,
}

impl Default for DamperOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            inverted: false,
            park_position: DEFAULT_PARK_POSITION,
            device: DeviceOptions::default(),
        }
    }
}

impl DamperOptions {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_inverted(mut self, inverted: bool) -> Self {
        self.inverted = inverted;
        self
    }

    pub fn with_park_position(mut self, park_position: f64) -> Self {
        self.park_position = park_position;
        self
    }

    pub fn with_device(mut self, device: DeviceOptions) -> Self {
        self.device = device;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(Error::invalid(format!(
                "threshold must be within (0, 1) (given: {})",
                self.threshold
            )));
        }
        check_position(self.park_position)?;
        self.device.validate()
    }
}

/// Maps a position onto a switch state
struct SwitchPosition {
    target: Arc<dyn Actuator<bool>>,
    threshold: f64,
    inverted: bool,
}

#[async_trait]
impl Driver<f64> for SwitchPosition {
    async fn write(&self, position: &f64) -> Result<()> {
        let on = (*position > self.threshold) != self.inverted;
        self.target.apply(on).await.map(|_| ())
    }
}

/// Damper driven by an on/off switch
///
/// Heartbeat, when needed to counter relays losing state, belongs on the
/// target switch's own [`DeviceOptions`].
#[derive(Clone, Debug)]
pub struct SwitchDamper {
    device: CqrsDevice<f64>,
    park_position: f64,
}

impl SwitchDamper {
    pub fn new(
        id: impl Into<String>,
        target: Arc<dyn Actuator<bool>>,
        options: DamperOptions,
    ) -> Result<Self> {
        options.validate()?;

        let driver = Arc::new(SwitchPosition {
            target,
            threshold: options.threshold,
            inverted: options.inverted,
        });

        Ok(Self {
            device: CqrsDevice::spawn(id, driver, options.park_position, options.device)?,
            park_position: options.park_position,
        })
    }

    pub fn park_position(&self) -> f64 {
        self.park_position
    }

    /// Move to the park position and wait until done
    pub async fn park(&self) -> Result<DeviceState<f64>> {
        self.apply(self.park_position).await
    }
}

#[async_trait]
impl Actuator<f64> for SwitchDamper {
    fn id(&self) -> &str {
        self.device.id()
    }

    fn set_state(&self, position: f64) -> Result<DeviceState<f64>> {
        self.device.set_state(check_position(position)?)
    }

    fn submit(&self, position: f64) -> Result<Completion> {
        self.device.submit(check_position(position)?)
    }

    fn state(&self) -> DeviceState<f64> {
        self.device.state()
    }

    fn flux(&self) -> broadcast::Receiver<Signal<DeviceState<f64>>> {
        self.device.flux()
    }

    async fn close(&self) -> Result<DeviceState<f64>> {
        self.device.close().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Damper Multiplexer
// ─────────────────────────────────────────────────────────────────────────────

/// Members already done with the position being written
struct Progress {
    position: f64,
    done: Vec<bool>,
}

/// Moves every member and waits for all of them
struct FanOut {
    members: Vec<Arc<dyn Actuator<f64>>>,
    progress: Mutex<Option<Progress>>,
}

impl FanOut {
    fn new(members: Vec<Arc<dyn Actuator<f64>>>) -> Self {
        Self {
            members,
            progress: Mutex::new(None),
        }
    }

    /// Members still to be driven to `position`
    fn pending(&self, position: f64) -> Vec<usize> {
        let mut progress = self.progress.lock();
        if !matches!(&*progress, Some(p) if p.position == position) {
            *progress = Some(Progress {
                position,
                done: vec![false; self.members.len()],
            });
        }

        progress.as_ref().map_or_else(Vec::new, |p| {
            (0..p.done.len()).filter(|&i| !p.done[i]).collect()
        })
    }
}

#[async_trait]
impl Driver<f64> for FanOut {
    async fn write(&self, position: &f64) -> Result<()> {
        let pending = self.pending(*position);
        let results = join_all(pending.iter().map(|&i| self.members[i].apply(*position))).await;

        let mut retry = Vec::new();
        let mut gone = Vec::new();
        {
            let mut progress = self.progress.lock();
            for (&i, result) in pending.iter().zip(results) {
                let member = self.members[i].id();
                match result {
                    Ok(_) => {}
                    Err(e) if e.is_permanent() => {
                        tracing::warn!(member, error = %e, "Damper gone, skipping it");
                        gone.push(format!("{member}: {e}"));
                    }
                    Err(e) => {
                        retry.push(format!("{member}: {e}"));
                        continue;
                    }
                }
                if let Some(p) = progress.as_mut() {
                    p.done[i] = true;
                }
            }

            if retry.is_empty() {
                // Next write of any position drives everyone again
                *progress = None;
            }
        }

        if !retry.is_empty() {
            Err(Error::HardwareIo(retry.join("; ")))
        } else if !gone.is_empty() {
            Err(Error::Closed(gone.join("; ")))
        } else {
            Ok(())
        }
    }
}

/// Several dampers acting as one
///
/// A command completes only when every member has completed it. Closing
/// parks the members but leaves them open for their owners to close.
#[derive(Clone)]
pub struct DamperMultiplexer {
    device: CqrsDevice<f64>,
    members: Vec<Arc<dyn Actuator<f64>>>,
    park_position: f64,
}

impl DamperMultiplexer {
    pub fn new(
        id: impl Into<String>,
        members: Vec<Arc<dyn Actuator<f64>>>,
        park_position: f64,
        options: DeviceOptions,
    ) -> Result<Self> {
        let id = id.into();
        if members.is_empty() {
            return Err(Error::invalid(format!("{id}: no dampers to multiplex")));
        }
        check_position(park_position)?;

        let driver = Arc::new(FanOut::new(members.clone()));

        Ok(Self {
            device: CqrsDevice::spawn(id, driver, park_position, options)?,
            members,
            park_position,
        })
    }

    pub fn members(&self) -> &[Arc<dyn Actuator<f64>>] {
        &self.members
    }

    pub fn park_position(&self) -> f64 {
        self.park_position
    }

    /// Park all members and wait until every one of them is done
    pub async fn park(&self) -> Result<DeviceState<f64>> {
        self.apply(self.park_position).await
    }
}

#[async_trait]
impl Actuator<f64> for DamperMultiplexer {
    fn id(&self) -> &str {
        self.device.id()
    }

    fn set_state(&self, position: f64) -> Result<DeviceState<f64>> {
        self.device.set_state(check_position(position)?)
    }

    fn submit(&self, position: f64) -> Result<Completion> {
        self.device.submit(check_position(position)?)
    }

    fn state(&self) -> DeviceState<f64> {
        self.device.state()
    }

    fn flux(&self) -> broadcast::Receiver<Signal<DeviceState<f64>>> {
        self.device.flux()
    }

    async fn close(&self) -> Result<DeviceState<f64>> {
        self.device.close().await
    }
}

impl std::fmt::Debug for DamperMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DamperMultiplexer")
            .field("device", &self.device)
            .field("members", &self.members.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NullDriver, Switch};
    use std::time::Duration;

    fn damper(id: &str, options: DamperOptions) -> (SwitchDamper, Arc<NullDriver<bool>>) {
        let driver = Arc::new(NullDriver::<bool>::new(id));
        let switch = Switch::new(id, driver.clone(), DeviceOptions::default()).unwrap();
        (SwitchDamper::new(id, Arc::new(switch), options).unwrap(), driver)
    }

    #[tokio::test]
    async fn threshold_maps_position_to_switch() {
        let (d, driver) = damper("d1", DamperOptions::default());

        d.apply(0.4).await.unwrap();
        d.apply(0.5).await.unwrap();
        d.apply(0.6).await.unwrap();

        assert_eq!(driver.writes(), vec![false, false, true]);
    }

    #[tokio::test]
    async fn inverted_damper() {
        let (d, driver) = damper("d1", DamperOptions::default().with_inverted(true));

        d.apply(1.0).await.unwrap();
        d.apply(0.0).await.unwrap();

        assert_eq!(driver.writes(), vec![false, true]);
    }

    #[tokio::test]
    async fn close_parks() {
        let (d, driver) = damper("d1", DamperOptions::default());

        d.apply(0.0).await.unwrap();
        let state = d.close().await.unwrap();

        assert_eq!(state.actual, Some(DEFAULT_PARK_POSITION));
        assert_eq!(driver.writes(), vec![false, true]);
    }

    #[tokio::test]
    async fn invalid_options_and_positions_rejected() {
        let driver = Arc::new(NullDriver::<bool>::new("s"));
        let switch: Arc<dyn Actuator<bool>> =
            Arc::new(Switch::new("s", driver, DeviceOptions::default()).unwrap());

        for threshold in [0.0, 1.0, -0.1] {
            let options = DamperOptions::default().with_threshold(threshold);
            assert!(SwitchDamper::new("d", switch.clone(), options).is_err());
        }
        let options = DamperOptions::default().with_park_position(1.5);
        assert!(SwitchDamper::new("d", switch.clone(), options).is_err());

        let d = SwitchDamper::new("d", switch, DamperOptions::default()).unwrap();
        assert!(matches!(d.set_state(f64::NAN), Err(Error::InvalidArgument(_))));
        assert!(matches!(d.set_state(1.1), Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn multiplexer_waits_for_all_members() {
        let slow = Arc::new(
            NullDriver::<bool>::new("slow")
                .with_delay(Duration::from_millis(30), Duration::from_millis(30)),
        );
        let slow_switch = Switch::new("slow", slow.clone(), DeviceOptions::default()).unwrap();
        let slow_damper =
            SwitchDamper::new("slow", Arc::new(slow_switch), DamperOptions::default()).unwrap();
        let (fast_damper, fast) = damper("fast", DamperOptions::default());

        let mux = DamperMultiplexer::new(
            "mux",
            vec![
                Arc::new(slow_damper) as Arc<dyn Actuator<f64>>,
                Arc::new(fast_damper),
            ],
            DEFAULT_PARK_POSITION,
            DeviceOptions::default(),
        )
        .unwrap();

        let state = mux.apply(0.0).await.unwrap();

        assert_eq!(state.actual, Some(0.0));
        assert_eq!(slow.writes(), vec![false]);
        assert_eq!(fast.writes(), vec![false]);
        for member in mux.members() {
            assert_eq!(member.state().actual, Some(0.0));
        }

        let state = mux.park().await.unwrap();
        assert_eq!(state.actual, Some(DEFAULT_PARK_POSITION));
        assert_eq!(slow.last(), Some(true));
        assert_eq!(fast.last(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn close_completes_after_target_closed() {
        let driver = Arc::new(NullDriver::<bool>::new("s"));
        let switch = Arc::new(Switch::new("s", driver.clone(), DeviceOptions::default()).unwrap());
        let d = SwitchDamper::new("d", switch.clone(), DamperOptions::default()).unwrap();

        d.apply(0.0).await.unwrap();
        switch.close().await.unwrap();

        let state = tokio::time::timeout(Duration::from_secs(3600), d.close())
            .await
            .expect("close must not retry a closed target")
            .unwrap();

        assert!(!state.available);
        assert_eq!(state.actual, Some(0.0));
        assert_eq!(driver.writes(), vec![false, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn multiplexer_skips_closed_member() {
        let (gone, _) = damper("gone", DamperOptions::default());
        let (live, live_driver) = damper("live", DamperOptions::default());
        gone.close().await.unwrap();

        let mux = DamperMultiplexer::new(
            "mux",
            vec![
                Arc::new(gone) as Arc<dyn Actuator<f64>>,
                Arc::new(live.clone()),
            ],
            DEFAULT_PARK_POSITION,
            DeviceOptions::default(),
        )
        .unwrap();

        let state = tokio::time::timeout(Duration::from_secs(3600), mux.apply(0.0))
            .await
            .unwrap()
            .unwrap();
        assert!(!state.available);
        assert_eq!(live.state().actual, Some(0.0));
        assert_eq!(live_driver.writes(), vec![false]);

        tokio::time::timeout(Duration::from_secs(3600), mux.close())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live_driver.writes(), vec![false, true]);
    }

    #[tokio::test]
    async fn empty_multiplexer_rejected() {
        let result = DamperMultiplexer::new("mux", vec![], 1.0, DeviceOptions::default());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
