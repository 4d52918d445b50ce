//! Zone Controller
//!
//! Aggregates zone signals into one unit demand.
//!
//! Only zones that are calling and enabled count ("unhappy" zones). The unit
//! runs only if at least one unhappy zone is voting; non-voting zones can add
//! to the demand once it runs. If no enabled zone is configured as voting,
//! every zone counts as voting so the unit can still be started.
//!
//! When the unit goes from idle to running, every other zone is raised so
//! zones sitting inside their dead band get conditioned in the same cycle.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use hvac_types::{Error, Result, SIGNAL_BUFFER, Signal, UnitControlSignal};

use crate::zone::{Zone, ZoneStatus};

#[derive(Debug, Clone, Copy)]
struct Unhappy {
    demand: f64,
    voting: bool,
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneControllerSnapshot {
    pub zones: Vec<String>,
    pub unhappy: Vec<String>,
    pub unhappy_voting: Vec<String>,
    pub failed: Vec<String>,
    pub demand: f64,
}

/// Voting zone controller state
///
/// Synchronous; [`ZoneController::spawn`] runs it as an actor.
pub struct ZoneController {
    zones: BTreeMap<String, Zone>,
    unhappy: BTreeMap<String, Unhappy>,
    failed: BTreeSet<String>,
}

impl ZoneController {
    pub fn new(zones: impl IntoIterator<Item = Zone>) -> Result<Self> {
        let mut controller = Self {
            zones: BTreeMap::new(),
            unhappy: BTreeMap::new(),
            failed: BTreeSet::new(),
        };
        for zone in zones {
            controller.add_zone(zone)?;
        }
        Ok(controller)
    }

    pub fn add_zone(&mut self, zone: Zone) -> Result<()> {
        let name = zone.name().to_string();
        if self.zones.contains_key(&name) {
            return Err(Error::invalid(format!("duplicate zone name: {name}")));
        }

        tracing::debug!(zone = %name, "Zone added");
        self.zones.insert(name, zone);
        Ok(())
    }

    /// Forget a zone and whatever it was asking for
    pub fn remove_zone(&mut self, name: &str) -> Result<Zone> {
        let zone = self
            .zones
            .remove(name)
            .ok_or_else(|| Error::UnknownZone(name.to_string()))?;

        self.unhappy.remove(name);
        self.failed.remove(name);
        tracing::debug!(zone = %name, "Zone removed");
        Ok(zone)
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    /// Feed one zone signal, get the resulting unit demand
    pub fn process(&mut self, signal: Signal<ZoneStatus>) -> Result<Signal<UnitControlSignal>> {
        let status = signal
            .value()
            .ok_or_else(|| Error::invalid("zone signal carries no zone status"))?;
        let name = status.zone.as_str();

        if !self.zones.contains_key(name) {
            return Err(Error::UnknownZone(name.to_string()));
        }

        let was_idle = !self.unhappy.keys().any(|zone| self.is_voting(zone));
        self.unhappy.remove(name);

        if signal.is_error() {
            if self.failed.insert(name.to_string()) {
                tracing::warn!(
                    zone = %name,
                    error = ?signal.error().map(|e| e.to_string()),
                    "Zone failed, excluded from demand"
                );
            }
        } else {
            if self.failed.remove(name) {
                tracing::info!(zone = %name, "Zone recovered");
            }
            if status.is_calling() && status.settings.enabled {
                self.unhappy.insert(
                    name.to_string(),
                    Unhappy {
                        demand: status.thermostat.demand,
                        voting: status.settings.voting,
                    },
                );
            }
        }

        if was_idle && self.is_voting(name) {
            self.bump(name);
        }

        Ok(Signal::new(signal.timestamp(), UnitControlSignal::new(self.demand())))
    }

    /// Whether `zone` is unhappy and counts as voting
    fn is_voting(&self, zone: &str) -> bool {
        self.unhappy
            .get(zone)
            .is_some_and(|u| u.voting || !self.any_voting_zone())
    }

    /// Whether any enabled zone is configured as voting
    fn any_voting_zone(&self) -> bool {
        self.zones.values().any(|zone| {
            let settings = zone.settings();
            settings.enabled && settings.voting
        })
    }

    pub fn demand(&self) -> f64 {
        let voting: Vec<f64> = self
            .unhappy
            .iter()
            .filter(|(zone, _)| self.is_voting(zone))
            .map(|(_, u)| u.demand)
            .collect();

        if voting.is_empty() {
            return 0.0;
        }

        let voting: f64 = voting.iter().sum();
        let total: f64 = self.unhappy.values().map(|u| u.demand).sum();

        if voting * total >= 0.0 && total.abs() > voting.abs() {
            total
        } else {
            voting
        }
    }

    /// Raise every zone except the one that started the unit
    fn bump(&self, starter: &str) {
        tracing::info!(zone = %starter, "Unit starting, raising other zones");
        for (name, zone) in &self.zones {
            if name != starter {
                zone.raise();
            }
        }
    }

    pub fn snapshot(&self) -> ZoneControllerSnapshot {
        ZoneControllerSnapshot {
            zones: self.zones.keys().cloned().collect(),
            unhappy: self.unhappy.keys().cloned().collect(),
            unhappy_voting: self
                .unhappy
                .keys()
                .filter(|zone| self.is_voting(zone))
                .cloned()
                .collect(),
            failed: self.failed.iter().cloned().collect(),
            demand: self.demand(),
        }
    }

    /// Run as an actor; stops when every handle is dropped
    pub fn spawn(mut self) -> ZoneControllerHandle {
        let (command_tx, mut command_rx) = mpsc::channel(SIGNAL_BUFFER);

        tokio::spawn(async move {
            tracing::debug!(zones = self.zones.len(), "Zone controller started");

            while let Some(command) = command_rx.recv().await {
                match command {
                    ControllerCommand::Signal(signal, reply) => {
                        let _ = reply.send(self.process(signal));
                    }
                    ControllerCommand::AddZone(zone, reply) => {
                        let _ = reply.send(self.add_zone(zone));
                    }
                    ControllerCommand::RemoveZone(name, reply) => {
                        let _ = reply.send(self.remove_zone(&name));
                    }
                    ControllerCommand::Snapshot(reply) => {
                        let _ = reply.send(self.snapshot());
                    }
                }
            }

            tracing::debug!("Zone controller stopped");
        });

        ZoneControllerHandle { command_tx }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

enum ControllerCommand {
    Signal(Signal<ZoneStatus>, oneshot::Sender<Result<Signal<UnitControlSignal>>>),
    AddZone(Zone, oneshot::Sender<Result<()>>),
    RemoveZone(String, oneshot::Sender<Result<Zone>>),
    Snapshot(oneshot::Sender<ZoneControllerSnapshot>),
}

/// Handle to a running [`ZoneController`]
#[derive(Clone)]
pub struct ZoneControllerHandle {
    command_tx: mpsc::Sender<ControllerCommand>,
}

impl ZoneControllerHandle {
    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> ControllerCommand,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(command(tx))
            .await
            .map_err(|_| Error::ChannelClosed)?;

        rx.await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn submit(&self, signal: Signal<ZoneStatus>) -> Result<Signal<UnitControlSignal>> {
        self.request(|reply| ControllerCommand::Signal(signal, reply))
            .await?
    }

    pub async fn add_zone(&self, zone: Zone) -> Result<()> {
        self.request(|reply| ControllerCommand::AddZone(zone, reply))
            .await?
    }

    pub async fn remove_zone(&self, name: impl Into<String>) -> Result<Zone> {
        let name = name.into();
        self.request(|reply| ControllerCommand::RemoveZone(name, reply))
            .await?
    }

    pub async fn snapshot(&self) -> Result<ZoneControllerSnapshot> {
        self.request(ControllerCommand::Snapshot).await
    }

    /// Turn a stream of zone signals into a stream of unit demand
    ///
    /// Signals from unknown zones are logged and dropped.
    pub fn compute(
        &self,
        mut signals: mpsc::Receiver<Signal<ZoneStatus>>,
    ) -> mpsc::Receiver<Signal<UnitControlSignal>> {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let handle = self.clone();

        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                match handle.submit(signal).await {
                    Ok(demand) => {
                        tracing::debug!(demand = ?demand.value(), "Unit demand");
                        if tx.send(demand).await.is_err() {
                            break;
                        }
                    }
                    Err(Error::ChannelClosed) => {
                        tracing::error!("Zone controller gone");
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "Zone signal dropped"),
                }
            }
        });

        rx
    }
}

impl std::fmt::Debug for ZoneControllerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneControllerHandle")
            .field("closed", &self.command_tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::PidController;
    use crate::stream::merge;
    use crate::thermostat::{CallingStatus, Thermostat};
    use crate::zone::ZoneSettings;
    use chrono::Utc;
    use std::time::Duration;

    fn zone(name: &str, settings: ZoneSettings) -> Zone {
        let pid = PidController::new(1.0, 0.0, 0.0, 1.0).unwrap();
        let ts = Thermostat::new(name, settings.setpoint, pid).unwrap();
        Zone::new(ts, settings).unwrap()
    }

    fn status(zone: &Zone, demand: f64, calling: bool) -> Signal<ZoneStatus> {
        Signal::new(
            Utc::now(),
            ZoneStatus {
                zone: zone.name().to_string(),
                settings: zone.settings(),
                thermostat: CallingStatus { demand, calling },
            },
        )
    }

    /// Zones wired through the whole async chain
    struct Rig {
        zones: Vec<Zone>,
        inputs: BTreeMap<String, mpsc::Sender<Signal<f64>>>,
        out: mpsc::Receiver<Signal<UnitControlSignal>>,
        handle: ZoneControllerHandle,
    }

    impl Rig {
        fn new(zones: Vec<Zone>) -> Self {
            Self::with_aliens(zones, vec![])
        }

        /// `aliens` feed the controller without being configured in it
        fn with_aliens(zones: Vec<Zone>, aliens: Vec<Zone>) -> Self {
            let handle = ZoneController::new(zones.clone()).unwrap().spawn();

            let mut inputs = BTreeMap::new();
            let mut outputs = Vec::new();
            for zone in zones.iter().chain(&aliens) {
                let (tx, rx) = mpsc::channel(16);
                outputs.push(zone.compute(rx).unwrap());
                inputs.insert(zone.name().to_string(), tx);
            }
            let out = handle.compute(merge(outputs));

            Self {
                zones,
                inputs,
                out,
                handle,
            }
        }

        async fn send(&self, zone: &str, sample: Signal<f64>) {
            self.inputs[zone].send(sample).await.unwrap();
        }

        async fn demand(&mut self) -> f64 {
            self.out.recv().await.unwrap().value().unwrap().demand
        }

        async fn sample(&mut self, zone: &str, value: f64) -> f64 {
            self.send(zone, Signal::new(Utc::now(), value)).await;
            self.demand().await
        }

        async fn fail(&mut self, zone: &str) -> f64 {
            let error = Error::TotalFailure(format!("{zone} sensor"));
            self.send(zone, Signal::failure(Utc::now(), None, error)).await;
            self.demand().await
        }

        /// Close inputs and collect whatever demand is left
        async fn drain(mut self) -> Vec<f64> {
            self.inputs.clear();
            let mut rest = Vec::new();
            while let Some(s) = self.out.recv().await {
                rest.push(s.value().unwrap().demand);
            }
            rest
        }
    }

    #[tokio::test]
    async fn one_zone() {
        let mut rig = Rig::new(vec![zone("z1", ZoneSettings::new(20.0))]);

        let mut demand = Vec::new();
        for pv in [20.0, 20.5, 21.0, 20.5, 20.0, 19.5, 19.0] {
            demand.push(rig.sample("z1", pv).await);
        }

        assert_eq!(demand, vec![0.0, 0.0, 2.0, 1.5, 1.0, 0.5, 0.0]);
    }

    #[tokio::test]
    async fn cold_start_two_zones() {
        let mut rig = Rig::new(vec![
            zone("z1", ZoneSettings::new(20.0)),
            zone("z2", ZoneSettings::new(25.0)),
        ]);

        assert_eq!(rig.sample("z1", 30.0).await, 11.0);
        assert_eq!(rig.sample("z2", 30.0).await, 17.0);
    }

    #[tokio::test]
    async fn non_voting_zone_cant_start_unit() {
        let mut rig = Rig::new(vec![
            zone("z1", ZoneSettings::new(20.0).with_voting(false)),
            zone("z2", ZoneSettings::new(25.0)),
        ]);

        assert_eq!(rig.sample("z1", 23.0).await, 0.0);
        assert_eq!(rig.sample("z2", 23.0).await, 0.0);

        let snapshot = rig.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.unhappy, vec!["z1".to_string()]);
        assert!(snapshot.unhappy_voting.is_empty());
    }

    #[tokio::test]
    async fn last_enabled_zone_votes_even_if_non_voting() {
        let mut rig = Rig::new(vec![
            zone("z1", ZoneSettings::new(20.0).with_voting(false)),
            zone("z2", ZoneSettings::new(25.0).with_enabled(false)),
        ]);

        assert_eq!(rig.sample("z1", 23.0).await, 4.0);
        assert_eq!(rig.sample("z2", 23.0).await, 4.0);
    }

    #[tokio::test]
    async fn only_zone_non_voting() {
        let mut rig = Rig::new(vec![zone("z1", ZoneSettings::new(20.0).with_voting(false))]);

        assert_eq!(rig.sample("z1", 23.0).await, 4.0);
    }

    #[tokio::test]
    async fn disabled_zone_contributes_nothing() {
        let mut rig = Rig::new(vec![zone("z1", ZoneSettings::new(20.0).with_enabled(false))]);

        assert_eq!(rig.sample("z1", 23.0).await, 0.0);
    }

    #[tokio::test]
    async fn failed_zone_excluded_until_recovered() {
        let mut rig = Rig::new(vec![zone("z1", ZoneSettings::new(20.0))]);

        assert_eq!(rig.sample("z1", 30.0).await, 11.0);
        assert_eq!(rig.fail("z1").await, 0.0);
        assert_eq!(rig.handle.snapshot().await.unwrap().failed, vec!["z1".to_string()]);

        assert_eq!(rig.sample("z1", 30.0).await, 11.0);
        assert!(rig.handle.snapshot().await.unwrap().failed.is_empty());
    }

    #[tokio::test]
    async fn failure_in_one_of_many_zones() {
        let mut rig = Rig::new(vec![
            zone("z1", ZoneSettings::new(20.0)),
            zone("z2", ZoneSettings::new(25.0)),
        ]);

        assert_eq!(rig.sample("z1", 30.0).await, 11.0);
        assert_eq!(rig.fail("z2").await, 11.0);
        assert_eq!(rig.sample("z2", 30.0).await, 17.0);
        assert_eq!(rig.fail("z2").await, 11.0);
        assert_eq!(rig.sample("z2", 30.0).await, 17.0);
    }

    #[tokio::test]
    async fn alien_zone_signals_dropped() {
        let mut rig = Rig::with_aliens(
            vec![zone("z1", ZoneSettings::new(20.0))],
            vec![zone("alien", ZoneSettings::new(20.0))],
        );

        rig.send("alien", Signal::new(Utc::now(), 30.0)).await;
        rig.send("z1", Signal::new(Utc::now(), 30.0)).await;

        assert_eq!(rig.demand().await, 11.0);
        assert!(rig.drain().await.is_empty());
    }

    #[tokio::test]
    async fn submit_from_unknown_zone_is_an_error() {
        let alien = zone("alien", ZoneSettings::new(20.0));
        let handle = ZoneController::new(vec![zone("z1", ZoneSettings::new(20.0))])
            .unwrap()
            .spawn();

        let result = handle.submit(status(&alien, 5.0, true)).await;
        assert!(matches!(result, Err(Error::UnknownZone(name)) if name == "alien"));
    }

    #[tokio::test(start_paused = true)]
    async fn unit_start_raises_zones_in_dead_band() {
        let mut rig = Rig::new(vec![
            zone("t1", ZoneSettings::new(20.0)),
            zone("t2", ZoneSettings::new(25.0)),
            zone("t3", ZoneSettings::new(30.0)),
        ]);

        // Inside the dead band, below it, inside it
        assert_eq!(rig.sample("t1", 20.9).await, 0.0);
        assert_eq!(rig.sample("t2", 25.9).await, 0.0);
        assert_eq!(rig.sample("t3", 28.0).await, 0.0);

        assert_eq!(rig.sample("t1", 25.0).await, 6.0);

        // t2 was raised and joins in
        let with_t2 = rig.demand().await;
        assert!((with_t2 - 7.9).abs() < 1e-9);
        assert!(rig.zones[1].thermostat().status().value().unwrap().calling);

        // t3 was below the dead band and stays put
        let nothing = tokio::time::timeout(Duration::from_millis(100), rig.out.recv()).await;
        assert!(nothing.is_err());
        assert!(!rig.zones[2].thermostat().status().value().unwrap().calling);
    }

    #[test]
    fn duplicate_zone_names_rejected() {
        let result = ZoneController::new(vec![
            zone("z1", ZoneSettings::new(20.0)),
            zone("z1", ZoneSettings::new(22.0)),
        ]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn non_voting_zones_add_to_running_unit() {
        let voter = zone("voter", ZoneSettings::new(20.0));
        let rider = zone("rider", ZoneSettings::new(20.0).with_voting(false));
        let mut c = ZoneController::new(vec![voter.clone(), rider.clone()]).unwrap();

        let out = c.process(status(&rider, 3.0, true)).unwrap();
        assert_eq!(out.value().unwrap().demand, 0.0);

        let out = c.process(status(&voter, 2.0, true)).unwrap();
        assert_eq!(out.value().unwrap().demand, 5.0);

        let out = c.process(status(&voter, 0.5, false)).unwrap();
        assert_eq!(out.value().unwrap().demand, 0.0);
    }

    #[test]
    fn non_voting_opposite_sign_cant_flip_demand() {
        let voter = zone("voter", ZoneSettings::new(20.0));
        let rider = zone("rider", ZoneSettings::new(20.0).with_voting(false));
        let mut c = ZoneController::new(vec![voter.clone(), rider.clone()]).unwrap();

        let out = c.process(status(&voter, 2.0, true)).unwrap();
        assert_eq!(out.value().unwrap().demand, 2.0);

        // Total would be -48.0
        let out = c.process(status(&rider, -50.0, true)).unwrap();
        assert_eq!(out.value().unwrap().demand, 2.0);
        assert_eq!(c.snapshot().unhappy.len(), 2);
    }

    #[test]
    fn disabling_every_voter_promotes_non_voters() {
        let voter = zone("voter", ZoneSettings::new(20.0));
        let rider = zone("rider", ZoneSettings::new(20.0).with_voting(false));
        let mut c = ZoneController::new(vec![voter.clone(), rider.clone()]).unwrap();

        c.process(status(&rider, 3.0, true)).unwrap();
        assert_eq!(c.demand(), 0.0);

        voter.set_enabled(false);
        assert_eq!(c.demand(), 3.0);
        assert_eq!(c.snapshot().unhappy_voting, vec!["rider".to_string()]);
    }

    #[test]
    fn calling_but_disabled_is_ignored() {
        let z = zone("z1", ZoneSettings::new(20.0).with_enabled(false));
        let mut c = ZoneController::new(vec![z.clone()]).unwrap();

        let out = c.process(status(&z, 5.0, true)).unwrap();
        assert_eq!(out.value().unwrap().demand, 0.0);
        assert!(c.snapshot().unhappy.is_empty());
    }

    #[tokio::test]
    async fn zones_added_and_removed_at_runtime() {
        let z1 = zone("z1", ZoneSettings::new(20.0));
        let z2 = zone("z2", ZoneSettings::new(20.0));
        let handle = ZoneController::new(vec![z1.clone()]).unwrap().spawn();

        assert!(matches!(
            handle.submit(status(&z2, 2.0, true)).await,
            Err(Error::UnknownZone(_))
        ));

        handle.add_zone(z2.clone()).await.unwrap();
        assert!(handle.add_zone(z2.clone()).await.is_err());

        let out = handle.submit(status(&z2, 2.0, true)).await.unwrap();
        assert_eq!(out.value().unwrap().demand, 2.0);

        let removed = handle.remove_zone("z2").await.unwrap();
        assert_eq!(removed.name(), "z2");

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.zones, vec!["z1".to_string()]);
        assert!(snapshot.unhappy.is_empty());
        assert_eq!(snapshot.demand, 0.0);

        assert!(matches!(
            handle.remove_zone("z2").await,
            Err(Error::UnknownZone(_))
        ));
    }
}
