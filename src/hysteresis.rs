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

//! Fallback state machine used once no deadline governs charging.
//!
//! Holds the battery at the most recent scheduled SoC: discharge is blocked
//! at or below it, and charging is forced once SoC drops a further
//! [`MARGIN`] points. Entry and exit thresholds are [`MARGIN`] apart so the
//! state does not flap when SoC sits on a threshold.

use std::cmp::max;
use std::fmt;

use crate::engine::PowerBounds;

/// Gap (in percentage points) between entry and exit thresholds
pub const MARGIN: i32 = 5;
/// Max bound (W) used to force charging when no charge limit is in force
pub const FALLBACK_CHARGE_POWER: i64 = -1000;
/// Fraction of the charge limit used when forcing charging
const FORCE_CHARGE_DIVISOR: i64 = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Normal,
    MinSoc,
    ChargeSoc,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Normal => "normal",
            State::MinSoc => "min-soc",
            State::ChargeSoc => "charge-soc",
        };
        f.write_str(name)
    }
}

/// SoC below which charging is forced, given the minimum SoC.
pub fn charge_soc(min_soc: u8) -> i32 {
    max(1, min_soc as i32 - MARGIN)
}

#[derive(Clone, Debug, Default)]
pub struct Hysteresis {
    state: State,
}

impl Hysteresis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: State) -> Self {
        Self { state }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Advance by one cycle, returning the max bound to push (if any).
    ///
    /// `in_force` holds the bounds already applied to the ESS this cycle.
    /// A cycle that changes state never emits a bound; the new state acts
    /// from the next cycle on.
    pub fn step(&mut self, soc: u8, min_soc: u8, in_force: &PowerBounds) -> Option<i64> {
        let charge_threshold = charge_soc(min_soc);
        let soc = soc as i32;
        let min_soc = min_soc as i32;
        match self.state {
            State::Normal => {
                if soc <= min_soc {
                    self.state = State::MinSoc;
                }
                None
            }
            State::MinSoc => {
                if soc < charge_threshold {
                    self.state = State::ChargeSoc;
                    None
                } else if soc >= min_soc + MARGIN {
                    self.state = State::Normal;
                    None
                } else {
                    // Block discharge
                    Some(in_force.max.map_or(0, |current| current.min(0)))
                }
            }
            State::ChargeSoc => {
                if soc > min_soc {
                    self.state = State::MinSoc;
                    None
                } else {
                    match in_force.min {
                        Some(limit) if limit < 0 => Some(limit / FORCE_CHARGE_DIVISOR),
                        _ => Some(FALLBACK_CHARGE_POWER),
                    }
                }
            }
        }
    }
}
