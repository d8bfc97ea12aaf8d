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

//! Per-cycle charge decision.
//!
//! The engine does no I/O: it is handed the measurements for one cycle and
//! returns the bounds to push. Power is in watts (negative for charging),
//! energy in watt-hours.

use chrono::naive::NaiveDateTime;
use log::info;
use std::fmt;

use crate::forecast::ForecastWindow;
use crate::hysteresis::{Hysteresis, State};
use crate::schedule::{TargetPoint, WeeklySchedule};

/// Fraction of the grid headroom that may be used, leaving a safety margin
const TOLERANCE: f64 = 0.9;
/// Average production (W) needed before relying on it to reach a target
pub const MIN_FORECAST_POWER: f64 = 1000.0;

/// Bounds on the ESS active power setpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PowerBounds {
    /// Most negative allowed power (i.e. charge limit)
    pub min: Option<i64>,
    /// Most positive allowed power (i.e. discharge limit)
    pub max: Option<i64>,
}

/// Measurements for one cycle, taken after the min bound was pushed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EssReading {
    pub soc: u8,             // %
    pub capacity: i64,       // Wh
    pub production: i64,     // W, summed over all chargers
    pub in_force: PowerBounds,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Already at or above the upcoming target
    Satisfied,
    /// Production alone is too slow, but grid help can wait
    HoldForProduction,
    /// Charge from the grid towards the upcoming target
    GridCharge,
    /// No reachable deadline: hold the last target SoC
    Fallback,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Satisfied => "satisfied",
            Strategy::HoldForProduction => "hold-for-production",
            Strategy::GridCharge => "grid-charge",
            Strategy::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub bounds: PowerBounds,
    pub strategy: Strategy,
    pub state: State,
    pub target: TargetPoint,
    pub forecast: f64,          // W
    pub time_via_forecast: f64, // s
    pub time_via_grid: f64,     // s
}

/// Magnitude of the complex power, truncated to whole watts.
pub fn apparent_power(active: i64, reactive: i64) -> i64 {
    (active as f64).hypot(reactive as f64) as i64
}

/// Power (W) the ESS may draw from the grid without exceeding the
/// connection limit.
///
/// The ESS's own apparent power is added back, since it is part of what the
/// grid meter sees.
pub fn grid_budget(
    allowed_apparent: i64,
    grid_apparent: i64,
    ess_active: i64,
    ess_reactive: i64,
) -> i64 {
    let headroom = allowed_apparent
        .saturating_sub(grid_apparent)
        .saturating_add(apparent_power(ess_active, ess_reactive));
    (headroom as f64 * TOLERANCE) as i64
}

/// Energy (Wh) needed to go from `soc` to `target_soc`. Negative if the
/// battery is already above the target.
pub fn required_energy(capacity: i64, target_soc: u8, soc: u8) -> f64 {
    capacity as f64 / 100.0 * (target_soc as f64 - soc as f64)
}

/// Seconds needed to store `energy` at `power`.
///
/// Infinite if `power` is not positive, zero if nothing needs storing.
pub fn charge_time(energy: f64, power: f64) -> f64 {
    if energy <= 0.0 {
        0.0
    } else if power <= 0.0 {
        f64::INFINITY
    } else {
        energy / power * 3600.0
    }
}

/// Number of (non-integer) seconds from `now` to `deadline`
fn seconds_until(now: NaiveDateTime, deadline: NaiveDateTime) -> f64 {
    (deadline - now).num_milliseconds() as f64 * 1e-3
}

/// State carried from one cycle to the next.
#[derive(Clone, Debug, Default)]
pub struct TimelineCharge {
    forecast: ForecastWindow,
    hysteresis: Hysteresis,
}

impl TimelineCharge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: State) -> Self {
        Self {
            forecast: ForecastWindow::default(),
            hysteresis: Hysteresis::with_state(state),
        }
    }

    pub fn state(&self) -> State {
        self.hysteresis.state()
    }

    pub fn forecast(&self) -> &ForecastWindow {
        &self.forecast
    }

    /// Feed this cycle's production sum into the forecast.
    ///
    /// Called once per cycle as soon as production is known, even if the
    /// cycle is later abandoned.
    pub fn record_production(&mut self, production: i64) {
        self.forecast.add(production);
    }

    /// Run one cycle.
    ///
    /// `budget` is the result of [`grid_budget`]; its negation is returned
    /// as the min bound, and is expected to be in force already (reflected
    /// in `reading.in_force`). The production in `reading` must already have
    /// been passed to [`Self::record_production`].
    pub fn decide(
        &mut self,
        now: NaiveDateTime,
        budget: i64,
        reading: &EssReading,
        schedule: &WeeklySchedule,
    ) -> Decision {
        let forecast = self.forecast.average();

        let target = schedule.next_target(now);
        let required = required_energy(reading.capacity, target.soc, reading.soc);
        let time_via_forecast = charge_time(required, forecast);
        let time_via_grid = charge_time(required, forecast + budget as f64);
        info!(
            "Target {}% at {}: required time via production {:.0}s, via production and grid {:.0}s",
            target.soc, target.time, time_via_forecast, time_via_grid
        );

        let remaining = seconds_until(now, target.time);
        let in_time = |seconds: f64| seconds < remaining;
        let deadline_ahead = target.time > now;

        let mut bounds = PowerBounds {
            min: Some(-budget),
            max: None,
        };
        let strategy = if required <= 0.0 && deadline_ahead {
            Strategy::Satisfied
        } else if forecast >= MIN_FORECAST_POWER
            && !in_time(time_via_forecast)
            && in_time(time_via_grid)
        {
            // Block discharge and let production do the charging
            bounds.max = Some(0);
            Strategy::HoldForProduction
        } else if in_time(time_via_grid) && deadline_ahead {
            // Never ask for more charge than the min bound already allows
            let max_power = match reading.in_force.min {
                Some(min) => min.max(-budget),
                None => -budget,
            };
            bounds.max = Some(max_power);
            Strategy::GridCharge
        } else {
            let min_soc = schedule.prior_target(now).soc;
            bounds.max = self.hysteresis.step(reading.soc, min_soc, &reading.in_force);
            info!(
                "Holding minimum SoC {}% (currently {}%, state {})",
                min_soc,
                reading.soc,
                self.hysteresis.state()
            );
            Strategy::Fallback
        };
        info!("Strategy {strategy}: max bound {:?}", bounds.max);

        Decision {
            bounds,
            strategy,
            state: self.hysteresis.state(),
            target,
            forecast,
            time_via_forecast,
            time_via_grid,
        }
    }
}
