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

use async_trait::async_trait;
use log::info;
use std::error::Error;

use crate::engine::PowerBounds;

pub type Result<T> = std::result::Result<T, Box<dyn Error + Send + Sync>>;

/// Energy storage system, as seen through the channel bus.
///
/// Bounds are proposals: the bus intersects them with those of other
/// controllers. Within a cycle a pushed min bound only ever raises the min
/// in force and a pushed max bound only ever lowers the max, so pushing the
/// same value twice has no further effect.
#[async_trait]
pub trait Ess: Send {
    /// Forget the bounds pushed during the previous cycle.
    fn start_cycle(&mut self);

    async fn get_soc(&mut self) -> Result<u8>;

    /// Usable capacity in Wh
    async fn get_capacity(&mut self) -> Result<i64>;

    /// Active power in W (positive for discharge), if known
    async fn get_active_power(&mut self) -> Result<Option<i64>>;

    /// Reactive power in var, if known
    async fn get_reactive_power(&mut self) -> Result<Option<i64>>;

    /// Bounds currently in force for this cycle: those reported by the bus
    /// for all controllers, tightened by this controller's own pushes
    async fn get_bounds(&mut self) -> Result<PowerBounds>;

    async fn push_min(&mut self, power: i64) -> Result<()>;

    async fn push_max(&mut self, power: i64) -> Result<()>;
}

#[async_trait]
pub trait Meter: Send {
    /// Apparent power at the grid connection in VA
    async fn get_apparent_power(&mut self) -> Result<i64>;
}

/// A local production source (e.g. a PV charger).
#[async_trait]
pub trait Charger: Send {
    fn id(&self) -> &str;

    /// Instantaneous production in W
    async fn get_power(&mut self) -> Result<i64>;
}

/// The bound in force after pushing `new` on top of `current`.
///
/// `tighter` picks the more restrictive of two values.
pub(crate) fn tighten(current: Option<i64>, new: i64, tighter: fn(i64, i64) -> i64) -> i64 {
    match current {
        Some(old) => tighter(old, new),
        None => new,
    }
}

/// Combine a bound reported by the bus with the one pushed this cycle.
pub(crate) fn merge_bound(
    pushed: Option<i64>,
    bus: Option<i64>,
    tighter: fn(i64, i64) -> i64,
) -> Option<i64> {
    match bus {
        Some(value) => Some(tighten(pushed, value, tighter)),
        None => pushed,
    }
}

/// Wraps another ESS, passing through reads but only logging writes.
pub struct DryrunEss<E: Ess> {
    base: E,
    bounds: PowerBounds,
}

impl<E: Ess> DryrunEss<E> {
    pub fn new(base: E) -> Self {
        Self {
            base,
            bounds: PowerBounds::default(),
        }
    }
}

#[async_trait]
impl<E: Ess> Ess for DryrunEss<E> {
    fn start_cycle(&mut self) {
        self.bounds = PowerBounds::default();
        self.base.start_cycle();
    }

    async fn get_soc(&mut self) -> Result<u8> {
        self.base.get_soc().await
    }

    async fn get_capacity(&mut self) -> Result<i64> {
        self.base.get_capacity().await
    }

    async fn get_active_power(&mut self) -> Result<Option<i64>> {
        self.base.get_active_power().await
    }

    async fn get_reactive_power(&mut self) -> Result<Option<i64>> {
        self.base.get_reactive_power().await
    }

    async fn get_bounds(&mut self) -> Result<PowerBounds> {
        // Pushes never reach the base, so it only sees other controllers
        let base = self.base.get_bounds().await?;
        Ok(PowerBounds {
            min: merge_bound(self.bounds.min, base.min, i64::max),
            max: merge_bound(self.bounds.max, base.max, i64::min),
        })
    }

    async fn push_min(&mut self, power: i64) -> Result<()> {
        info!("Would set min active power to {power} W");
        self.bounds.min = Some(tighten(self.bounds.min, power, i64::max));
        Ok(())
    }

    async fn push_max(&mut self, power: i64) -> Result<()> {
        info!("Would set max active power to {power} W");
        self.bounds.max = Some(tighten(self.bounds.max, power, i64::min));
        Ok(())
    }
}
