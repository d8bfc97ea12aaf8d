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

use std::collections::VecDeque;

pub const WINDOW_SIZE: usize = 10;

/// Moving average over the most recent production samples (in watts).
#[derive(Clone, Debug)]
pub struct ForecastWindow {
    samples: VecDeque<i64>,
    capacity: usize,
}

impl Default for ForecastWindow {
    fn default() -> Self {
        Self::new(WINDOW_SIZE)
    }
}

impl ForecastWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Append a sample, dropping the oldest once the window is full.
    pub fn add(&mut self, sample: i64) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Mean of the held samples, or 0 if there are none.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: i128 = self.samples.iter().map(|&x| x as i128).sum();
        sum as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
