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

use chrono::Weekday;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::schedule::{ScheduleError, WeeklySchedule};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid schedule for {day}: {source}")]
    Schedule { day: Weekday, source: ScheduleError },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    /// Apparent power (VA) the grid connection can take
    pub allowed_apparent: i64,
    #[serde(default = "interval_default", with = "humantime_serde")]
    pub interval: Duration,
    /// If given, the schedule is read from this file on every cycle
    pub schedule_file: Option<PathBuf>,
}

fn interval_default() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    #[serde(default = "timeout_default", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "dry_run_default")]
    pub dry_run: bool,
    #[serde(default = "ess_default")]
    pub ess: String,
    #[serde(default = "meter_default")]
    pub meter: String,
    #[serde(default)]
    pub chargers: Vec<String>,
}

fn timeout_default() -> Duration {
    Duration::from_secs(2)
}

fn dry_run_default() -> bool {
    false
}

fn ess_default() -> String {
    "ess0".to_owned()
}

fn meter_default() -> String {
    "meter0".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Influxdb2Config {
    pub host: String,
    pub org: String,
    pub token: String,
    pub bucket: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub control: ControlConfig,
    pub bus: BusConfig,
    pub schedule: Option<WeeklySchedule>,
    pub influxdb2: Option<Influxdb2Config>,
}

/// Where the weekly schedule comes from on each cycle.
#[derive(Debug)]
pub enum ScheduleSource {
    Inline(WeeklySchedule),
    File(PathBuf),
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

fn check_schedule(schedule: &WeeklySchedule) -> Result<(), ConfigError> {
    schedule
        .validate()
        .map_err(|(day, source)| ConfigError::Schedule { day, source })
}

impl ScheduleSource {
    /// Get the current schedule. A file is re-read every time.
    ///
    /// The result is not validated: a day that fails to parse is skipped
    /// by the lookups instead.
    pub fn load(&self) -> Result<Cow<'_, WeeklySchedule>, ConfigError> {
        match self {
            ScheduleSource::Inline(schedule) => Ok(Cow::Borrowed(schedule)),
            ScheduleSource::File(path) => Ok(Cow::Owned(read_toml(path)?)),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Config = read_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control.allowed_apparent <= 0 {
            return Err(ConfigError::Invalid(format!(
                "allowed_apparent must be positive (got {})",
                self.control.allowed_apparent
            )));
        }
        if self.control.interval.is_zero() {
            return Err(ConfigError::Invalid("interval must be non-zero".to_owned()));
        }
        match (&self.schedule, &self.control.schedule_file) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(
                "schedule and schedule_file are mutually exclusive".to_owned(),
            )),
            (None, None) => Err(ConfigError::Invalid(
                "one of schedule or schedule_file is required".to_owned(),
            )),
            (Some(schedule), None) => check_schedule(schedule),
            (None, Some(path)) => check_schedule(&read_toml(path)?),
        }
    }

    /// Take the schedule source out of the configuration.
    pub fn schedule_source(&mut self) -> ScheduleSource {
        match self.control.schedule_file.clone() {
            Some(path) => ScheduleSource::File(path),
            None => ScheduleSource::Inline(self.schedule.take().unwrap_or_default()),
        }
    }
}
