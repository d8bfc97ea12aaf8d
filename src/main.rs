/* Copyright 2023-2025 Bruce Merry
 *
 * This program is free software: you can redistribute it and/or modify it
 * under the terms of the GNU General Public License as published by the Free
 * Software Foundation, either version 3 of the License, or (at your option)
 * any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
 * FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
 * more details.
 *
 * You should have received a copy of the GNU General Public License along
 * with this program. If not, see <https://www.gnu.org/licenses/>.
 */

use clap::Parser;
use log::info;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use timeline_charge::config::Config;
use timeline_charge::control::{self, Devices};
use timeline_charge::ess::{Charger, DryrunEss, Ess};
use timeline_charge::influxdb2::Influxdb2Monitor;
use timeline_charge::monitoring::{Monitor, NullMonitor};
use timeline_charge::rest::{RestCharger, RestClient, RestEss, RestMeter};

#[derive(Parser)]
#[clap(author, version)]
struct Args {
    #[clap()]
    config_file: PathBuf,
}

#[cfg(unix)]
async fn wait_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    };
    Ok(())
}

#[cfg(not(unix))]
async fn wait_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let mut config = Config::load(&args.config_file)?;
    let schedule = config.schedule_source();

    let client = RestClient::new(&config.bus)?;
    let ess = RestEss::new(client.clone(), &config.bus.ess);
    let ess: Box<dyn Ess> = if config.bus.dry_run {
        Box::new(DryrunEss::new(ess))
    } else {
        Box::new(ess)
    };
    let chargers: Vec<Box<dyn Charger>> = config
        .bus
        .chargers
        .iter()
        .map(|id| Box::new(RestCharger::new(client.clone(), id)) as Box<dyn Charger>)
        .collect();
    info!(
        "Controlling {} with meter {} and {} charger(s)",
        config.bus.ess,
        config.bus.meter,
        chargers.len()
    );
    let mut devices = Devices {
        ess,
        meter: Box::new(RestMeter::new(client, &config.bus.meter)),
        chargers,
    };

    let mut monitor: Box<dyn Monitor> = match &config.influxdb2 {
        Some(conf) => Box::new(Influxdb2Monitor::new(conf).await),
        None => Box::new(NullMonitor {}),
    };
    let token = CancellationToken::new();
    let control_token = token.clone();
    let control_handle = tokio::spawn(async move {
        control::control_ess(
            &mut devices,
            &config.control,
            &schedule,
            &mut *monitor,
            control_token,
        )
        .await;
    });

    wait_shutdown().await?;
    token.cancel();
    control_handle.await?;
    Ok(())
}
