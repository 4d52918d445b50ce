//! zonectl
//!
//! Runs the zone control pipeline against in-memory hardware. Reads
//! `zone value` lines from stdin and prints every unit demand signal as a
//! JSON line on stdout; logs go to stderr.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hvac_actuator::{
    Actuator, HeatPump, HvacDevice, HvacDeviceStatus, NullDriver, Switch, SwitchableHvacDevice,
};
use hvac_types::{Error, HvacCommand, SIGNAL_BUFFER, Signal};

use zonectl::config::UnitKind;
use zonectl::stream::merge;
use zonectl::{Config, SingleStageUnitController, ZoneController};

/// HVAC zone controller
#[derive(Parser, Debug)]
#[command(name = "zonectl")]
#[command(about = "HVAC zone controller", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "zonectl.toml")]
    config: PathBuf,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting zonectl v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args.config)
        .await
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    config.validate().context("Invalid configuration")?;

    // Zones
    let zones = config.build_zones()?;
    let mut inputs = HashMap::new();
    let mut outputs = Vec::new();
    for zone in &zones {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        outputs.push(zone.compute(rx)?);
        inputs.insert(zone.name().to_string(), tx);
        info!(zone = zone.name(), setpoint = zone.settings().setpoint, "Zone ready");
    }

    let controller = ZoneController::new(zones)?.spawn();
    let mut demand = controller.compute(merge(outputs));

    // Unit
    let (unit_tx, unit_rx) = mpsc::channel(SIGNAL_BUFFER);
    let commands = SingleStageUnitController::new(config.unit.mode)
        .with_fan(config.unit.fan_with_stage)
        .compute(unit_rx);
    let mut status = start_unit(&config, commands)?;

    let printer = tokio::spawn(async move {
        while let Some(signal) = demand.recv().await {
            match serde_json::to_string(&signal) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Can't serialize unit signal"),
            }
            if unit_tx.send(signal).await.is_err() {
                warn!("Unit controller gone");
                break;
            }
        }
    });

    let unit = tokio::spawn(async move {
        while let Some(signal) = status.recv().await {
            match signal.value() {
                Some(s) if signal.is_ok() => debug!(requested = %s.requested, actual = %s.actual, "Unit status"),
                _ => warn!(error = ?signal.error().map(|e| e.to_string()), "Unit status failed"),
            }
        }
    });

    // Samples
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((zone, value)) = line.split_once(char::is_whitespace) else {
            warn!(line, "Expected `zone value`");
            continue;
        };
        let Some(input) = inputs.get(zone) else {
            warn!(zone, "Unknown zone");
            continue;
        };
        if input.send(parse_sample(value.trim())).await.is_err() {
            warn!(zone, "Zone input closed");
        }
    }

    info!("Input complete, shutting down");
    drop(inputs);

    printer.await.context("Printer task failed")?;
    unit.await.context("Unit task failed")?;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("zonectl=info,hvac_actuator=info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Unreadable values become failed samples rather than being skipped
fn parse_sample(value: &str) -> Signal<f64> {
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Signal::new(Utc::now(), v),
        _ => Signal::failure(
            Utc::now(),
            None,
            Error::TotalFailure(format!("unreadable sample: {value}")),
        ),
    }
}

/// Build the configured unit on null drivers and start it
fn start_unit(
    config: &Config,
    commands: mpsc::Receiver<Signal<HvacCommand>>,
) -> Result<mpsc::Receiver<Signal<HvacDeviceStatus>>> {
    let (min, max) = config.device.delay();
    let options = config.device.options();
    let inverted = config.unit.inverted;

    let switch = |id: &str, inverted: bool| -> Result<Arc<dyn Actuator<bool>>> {
        let driver = Arc::new(NullDriver::<bool>::new(id).with_delay(min, max));
        let switch = if inverted {
            Switch::inverted(id, driver, options)?
        } else {
            Switch::new(id, driver, options)?
        };
        Ok(Arc::new(switch))
    };

    let status = match config.unit.kind {
        UnitKind::HeatPump => {
            let device = HeatPump::new(
                "heat-pump",
                switch("mode", false)?,
                switch("running", false)?,
                switch("fan", false)?,
            )
            .with_mode_change_delay(config.unit.mode_change_delay());
            info!(device = device.id(), modes = ?device.modes(), "Unit ready");
            device.compute(commands)
        }
        UnitKind::Switchable => {
            let device =
                SwitchableHvacDevice::new("unit", config.unit.mode, switch("unit", inverted)?);
            info!(device = device.id(), modes = ?device.modes(), "Unit ready");
            device.compute(commands)
        }
    };

    Ok(status)
}
