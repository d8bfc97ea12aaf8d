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

use chrono::naive::NaiveDateTime;
use chrono::{DateTime, Local, TimeZone, Utc};
use log::{debug, warn};
use std::error::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ControlConfig, ScheduleSource};
use crate::engine::{Decision, EssReading, TimelineCharge, grid_budget};
use crate::ess::{self, Charger, Ess, Meter};
use crate::monitoring::{CycleUpdate, Monitor};
use crate::schedule::TargetPoint;

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("cannot read {what}: {source}")]
    Measurement {
        what: &'static str,
        source: Box<dyn Error + Send + Sync>,
    },
    #[error("cannot load schedule: {0}")]
    Schedule(#[from] ConfigError),
}

fn unreadable(what: &'static str) -> impl FnOnce(Box<dyn Error + Send + Sync>) -> CycleError {
    move |source| CycleError::Measurement { what, source }
}

/// Collaborators the controller reads from and writes to.
pub struct Devices {
    pub ess: Box<dyn Ess>,
    pub meter: Box<dyn Meter>,
    pub chargers: Vec<Box<dyn Charger>>,
}

/// Inputs and outputs of a completed cycle.
#[derive(Clone, Debug)]
pub struct CycleOutcome {
    pub budget: i64,
    pub reading: EssReading,
    pub decision: Decision,
}

fn to_local<Tz: TimeZone>(dt: DateTime<Tz>) -> NaiveDateTime {
    dt.with_timezone(&Local {}).naive_local()
}

/// Treat an unreadable optional value as absent.
fn or_zero(value: ess::Result<Option<i64>>, what: &str) -> i64 {
    match value {
        Ok(value) => value.unwrap_or(0),
        Err(err) => {
            debug!("Treating {what} as 0: {err}");
            0
        }
    }
}

/// Total production over all chargers. Chargers that can't be read are
/// left out of the sum.
pub async fn read_production(chargers: &mut [Box<dyn Charger>]) -> i64 {
    let mut total = 0;
    for charger in chargers.iter_mut() {
        match charger.get_power().await {
            Ok(power) => total = i64::saturating_add(total, power),
            Err(err) => warn!("Can't read power from {}: {err}", charger.id()),
        }
    }
    total
}

/// Run a single control cycle.
///
/// The min bound is pushed and the production recorded as soon as they are
/// known, so both stick even if a later read fails and the cycle is
/// abandoned.
pub async fn run_cycle(
    controller: &mut TimelineCharge,
    ess: &mut dyn Ess,
    meter: &mut dyn Meter,
    chargers: &mut [Box<dyn Charger>],
    schedule: &ScheduleSource,
    config: &ControlConfig,
    now: NaiveDateTime,
) -> Result<CycleOutcome, CycleError> {
    ess.start_cycle();
    let grid_apparent = meter
        .get_apparent_power()
        .await
        .map_err(unreadable("grid apparent power"))?;
    let ess_active = or_zero(ess.get_active_power().await, "ESS active power");
    let ess_reactive = or_zero(ess.get_reactive_power().await, "ESS reactive power");
    let budget = grid_budget(
        config.allowed_apparent,
        grid_apparent,
        ess_active,
        ess_reactive,
    );
    if let Err(err) = ess.push_min(-budget).await {
        warn!("Failed to set min active power to {} W: {err}", -budget);
    }
    let production = read_production(chargers).await;
    controller.record_production(production);

    let schedule = schedule.load()?;
    let soc = ess.get_soc().await.map_err(unreadable("ESS SoC"))?;
    let capacity = ess
        .get_capacity()
        .await
        .map_err(unreadable("ESS capacity"))?;
    let in_force = ess.get_bounds().await.unwrap_or_else(|err| {
        warn!("Can't read bounds in force: {err}");
        Default::default()
    });
    let reading = EssReading {
        soc,
        capacity,
        production,
        in_force,
    };

    let decision = controller.decide(now, budget, &reading, &schedule);
    if let Some(max_power) = decision.bounds.max {
        if let Err(err) = ess.push_max(max_power).await {
            warn!("Failed to set max active power to {max_power} W: {err}");
        }
    }
    Ok(CycleOutcome {
        budget,
        reading,
        decision,
    })
}

fn make_update(time: DateTime<Utc>, now: NaiveDateTime, outcome: &CycleOutcome) -> CycleUpdate {
    let decision = &outcome.decision;
    let target_seconds = if decision.target == TargetPoint::SENTINEL {
        None
    } else {
        Some((decision.target.time - now).num_milliseconds() as f64 * 1e-3)
    };
    CycleUpdate {
        time,
        current_soc: outcome.reading.soc,
        target_soc: decision.target.soc,
        target_seconds,
        predicted_pv: decision.forecast,
        grid_budget: outcome.budget,
        min_bound: decision.bounds.min,
        max_bound: decision.bounds.max,
        state: decision.state,
        strategy: decision.strategy,
    }
}

/// Run control cycles every `config.interval` until `token` is cancelled.
pub async fn control_ess(
    devices: &mut Devices,
    config: &ControlConfig,
    schedule: &ScheduleSource,
    monitor: &mut dyn Monitor,
    token: CancellationToken,
) {
    let mut controller = TimelineCharge::new();
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let time = Utc::now();
        let now = to_local(time);
        let result = run_cycle(
            &mut controller,
            devices.ess.as_mut(),
            devices.meter.as_mut(),
            &mut devices.chargers,
            schedule,
            config,
            now,
        )
        .await;
        match result {
            Ok(outcome) => {
                if let Err(err) = monitor.update(make_update(time, now, &outcome)).await {
                    warn!("Failed to update monitoring: {err}");
                }
            }
            Err(err) => warn!("Failed to run control cycle: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PowerBounds, Strategy};
    use crate::ess::tighten;
    use crate::schedule::{ScheduleEntry, WeeklySchedule};
    use async_trait::async_trait;
    use chrono::naive::NaiveDate;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeEss {
        soc: Option<u8>,
        active: Option<i64>,
        fail_writes: bool,
        bounds: PowerBounds,
        writes: Vec<(&'static str, i64)>,
    }

    #[async_trait]
    impl Ess for FakeEss {
        fn start_cycle(&mut self) {
            self.bounds = PowerBounds::default();
        }

        async fn get_soc(&mut self) -> ess::Result<u8> {
            self.soc.ok_or_else(|| "soc unavailable".into())
        }

        async fn get_capacity(&mut self) -> ess::Result<i64> {
            Ok(10000)
        }

        async fn get_active_power(&mut self) -> ess::Result<Option<i64>> {
            Ok(self.active)
        }

        async fn get_reactive_power(&mut self) -> ess::Result<Option<i64>> {
            Err("no reactive power channel".into())
        }

        async fn get_bounds(&mut self) -> ess::Result<PowerBounds> {
            Ok(self.bounds)
        }

        async fn push_min(&mut self, power: i64) -> ess::Result<()> {
            if self.fail_writes {
                return Err("write rejected".into());
            }
            self.writes.push(("min", power));
            self.bounds.min = Some(tighten(self.bounds.min, power, i64::max));
            Ok(())
        }

        async fn push_max(&mut self, power: i64) -> ess::Result<()> {
            if self.fail_writes {
                return Err("write rejected".into());
            }
            self.writes.push(("max", power));
            self.bounds.max = Some(tighten(self.bounds.max, power, i64::min));
            Ok(())
        }
    }

    struct FakeMeter(Option<i64>);

    #[async_trait]
    impl Meter for FakeMeter {
        async fn get_apparent_power(&mut self) -> ess::Result<i64> {
            self.0.ok_or_else(|| "meter offline".into())
        }
    }

    struct FakeCharger(&'static str, Option<i64>);

    #[async_trait]
    impl Charger for FakeCharger {
        fn id(&self) -> &str {
            self.0
        }

        async fn get_power(&mut self) -> ess::Result<i64> {
            self.1.ok_or_else(|| "charger offline".into())
        }
    }

    fn config() -> ControlConfig {
        ControlConfig {
            allowed_apparent: 10000,
            interval: Duration::from_secs(1),
            schedule_file: None,
        }
    }

    fn schedule() -> ScheduleSource {
        ScheduleSource::Inline(WeeklySchedule {
            monday: vec![ScheduleEntry::new("12:00", 80)],
            ..Default::default()
        })
    }

    // Monday morning
    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn ess(soc: Option<u8>) -> FakeEss {
        FakeEss {
            soc,
            ..Default::default()
        }
    }

    async fn cycle(
        ess: &mut FakeEss,
        meter: Option<i64>,
        chargers: &mut [Box<dyn Charger>],
        schedule: &ScheduleSource,
    ) -> Result<CycleOutcome, CycleError> {
        let mut controller = TimelineCharge::new();
        run_cycle(
            &mut controller,
            ess,
            &mut FakeMeter(meter),
            chargers,
            schedule,
            &config(),
            now(),
        )
        .await
    }

    #[tokio::test]
    async fn pushes_budget_as_min_bound() {
        let mut ess = ess(Some(50));
        let outcome = cycle(&mut ess, Some(2000), &mut [], &schedule())
            .await
            .unwrap();
        assert_eq!(outcome.budget, 7200);
        assert_eq!(ess.writes[0], ("min", -7200));
        assert_eq!(outcome.reading.in_force.min, Some(-7200));
        // No production: charge from the grid, limited by the min bound
        assert_eq!(outcome.decision.strategy, Strategy::GridCharge);
        assert_eq!(ess.writes[1], ("max", -7200));
    }

    #[tokio::test]
    async fn ess_power_counts_towards_budget() {
        let mut ess = ess(Some(50));
        ess.active = Some(-3000);
        let outcome = cycle(&mut ess, Some(5000), &mut [], &schedule())
            .await
            .unwrap();
        assert_eq!(outcome.budget, 7200);
    }

    #[tokio::test]
    async fn unreadable_meter_aborts_before_pushing() {
        let mut ess = ess(Some(50));
        let result = cycle(&mut ess, None, &mut [], &schedule()).await;
        assert!(matches!(result, Err(CycleError::Measurement { .. })));
        assert!(ess.writes.is_empty());
    }

    #[tokio::test]
    async fn unreadable_soc_keeps_min_bound() {
        let mut ess = ess(None);
        let result = cycle(&mut ess, Some(2000), &mut [], &schedule()).await;
        match result {
            Err(CycleError::Measurement { what, .. }) => assert_eq!(what, "ESS SoC"),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(ess.writes, vec![("min", -7200)]);
    }

    #[tokio::test]
    async fn unreadable_charger_is_skipped() {
        let mut ess = ess(Some(50));
        let mut chargers: Vec<Box<dyn Charger>> = vec![
            Box::new(FakeCharger("charger0", Some(800))),
            Box::new(FakeCharger("charger1", None)),
            Box::new(FakeCharger("charger2", Some(500))),
        ];
        let outcome = cycle(&mut ess, Some(2000), &mut chargers, &schedule())
            .await
            .unwrap();
        assert_eq!(outcome.reading.production, 1300);
        assert_eq!(outcome.decision.forecast, 1300.0);
    }

    #[tokio::test]
    async fn production_is_recorded_when_cycle_aborts() {
        let mut controller = TimelineCharge::new();
        let mut meter = FakeMeter(Some(2000));
        let mut sunny: Vec<Box<dyn Charger>> = vec![Box::new(FakeCharger("charger0", Some(2000)))];
        let mut dark: Vec<Box<dyn Charger>> = vec![Box::new(FakeCharger("charger0", Some(0)))];

        let result = run_cycle(
            &mut controller,
            &mut ess(None),
            &mut meter,
            &mut sunny,
            &schedule(),
            &config(),
            now(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(controller.forecast().len(), 1);

        let outcome = run_cycle(
            &mut controller,
            &mut ess(Some(50)),
            &mut meter,
            &mut dark,
            &schedule(),
            &config(),
            now(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.decision.forecast, 1000.0);
    }

    #[tokio::test]
    async fn huge_production_saturates() {
        let mut chargers: Vec<Box<dyn Charger>> = vec![
            Box::new(FakeCharger("charger0", Some(i64::MAX))),
            Box::new(FakeCharger("charger1", Some(1))),
        ];
        assert_eq!(read_production(&mut chargers).await, i64::MAX);
    }

    #[tokio::test]
    async fn push_failure_is_not_fatal() {
        let mut ess = ess(Some(50));
        ess.fail_writes = true;
        let outcome = cycle(&mut ess, Some(2000), &mut [], &schedule())
            .await
            .unwrap();
        assert_eq!(outcome.reading.in_force, PowerBounds::default());
        assert_eq!(outcome.decision.bounds.max, Some(-7200));
    }

    #[tokio::test]
    async fn missing_schedule_file_aborts_cycle() {
        let mut ess = ess(Some(50));
        let source = ScheduleSource::File("/nonexistent/schedule.toml".into());
        let result = cycle(&mut ess, Some(2000), &mut [], &source).await;
        assert!(matches!(result, Err(CycleError::Schedule(_))));
        assert_eq!(ess.writes, vec![("min", -7200)]);
    }

    #[tokio::test]
    async fn update_reports_cycle() {
        let mut ess = ess(Some(50));
        let outcome = cycle(&mut ess, Some(2000), &mut [], &schedule())
            .await
            .unwrap();
        let time = Utc::now();
        let update = make_update(time, now(), &outcome);
        assert_eq!(update.current_soc, 50);
        assert_eq!(update.target_soc, 80);
        assert_eq!(update.target_seconds, Some(7200.0));
        assert_eq!(update.min_bound, Some(-7200));
        assert_eq!(update.strategy, Strategy::GridCharge);
    }

    #[tokio::test]
    async fn loop_stops_when_cancelled() {
        let mut devices = Devices {
            ess: Box::new(ess(Some(50))),
            meter: Box::new(FakeMeter(Some(2000))),
            chargers: vec![],
        };
        let token = CancellationToken::new();
        token.cancel();
        let mut monitor = crate::monitoring::NullMonitor;
        control_ess(&mut devices, &config(), &schedule(), &mut monitor, token).await;
    }
}
