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

//! Access to device channels through a REST/JSON channel API.
//!
//! Each channel is addressed as `{url}/{component}/{channel}`. A GET returns
//! an object whose `value` field holds the current value (or `null` if it
//! is unavailable); a POST with `{"value": ...}` writes it.

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use crate::config::BusConfig;
use crate::engine::PowerBounds;
use crate::ess::{Charger, Ess, Meter, Result, merge_bound, tighten};

const CHANNEL_SOC: &str = "Soc";
const CHANNEL_CAPACITY: &str = "Capacity";
const CHANNEL_ACTIVE_POWER: &str = "ActivePower";
const CHANNEL_REACTIVE_POWER: &str = "ReactivePower";
const CHANNEL_SET_MIN: &str = "SetActivePowerGreaterOrEquals";
const CHANNEL_SET_MAX: &str = "SetActivePowerLessOrEquals";
const CHANNEL_APPARENT_POWER: &str = "ApparentPower";
const CHANNEL_CHARGER_POWER: &str = "ActualPower";

#[derive(Debug, thiserror::Error)]
#[error("channel {0} has no value")]
pub struct Unavailable(String);

#[derive(Deserialize)]
struct ChannelValue {
    value: Option<f64>,
}

#[derive(Serialize)]
struct WriteValue {
    value: i64,
}

/// Whether pushing `value` changes the bound already pushed this cycle
fn needs_write(pushed: Option<i64>, value: i64) -> bool {
    pushed != Some(value)
}

/// Convert state of charge to u8 and clamp
fn round_soc(soc: f64) -> u8 {
    if soc < 0.0 {
        0
    } else if soc >= 100.0 {
        100
    } else {
        soc.round() as u8
    }
}

#[derive(Clone)]
pub struct RestClient {
    base: String,
    user: Option<String>,
    password: Option<String>,
    client: Client,
}

impl RestClient {
    pub fn new(config: &BusConfig) -> reqwest::Result<Self> {
        Ok(Self {
            base: config.url.trim_end_matches('/').to_owned(),
            user: config.user.clone(),
            password: config.password.clone(),
            client: reqwest::ClientBuilder::new()
                .timeout(config.timeout)
                .build()?,
        })
    }

    fn address(component: &str, channel: &str) -> String {
        format!("{component}/{channel}")
    }

    fn url(&self, component: &str, channel: &str) -> String {
        format!("{}/{}", self.base, Self::address(component, channel))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.user {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    /// Read a channel, returning `None` if it currently has no value.
    pub async fn read(&self, component: &str, channel: &str) -> reqwest::Result<Option<f64>> {
        let response: ChannelValue = self
            .authorize(self.client.get(self.url(component, channel)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.value)
    }

    /// Read a channel that must have a value.
    pub async fn read_value(&self, component: &str, channel: &str) -> Result<f64> {
        self.read(component, channel)
            .await?
            .ok_or_else(|| Unavailable(Self::address(component, channel)).into())
    }

    pub async fn write(&self, component: &str, channel: &str, value: i64) -> reqwest::Result<()> {
        debug!("Writing {value} to {}", Self::address(component, channel));
        self.authorize(self.client.post(self.url(component, channel)))
            .json(&WriteValue { value })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct RestEss {
    client: RestClient,
    component: String,
    bounds: PowerBounds,
}

impl RestEss {
    pub fn new(client: RestClient, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
            bounds: PowerBounds::default(),
        }
    }

    async fn read_optional(&self, channel: &str) -> Result<Option<i64>> {
        let value = self.client.read(&self.component, channel).await?;
        Ok(value.map(|x| x.round() as i64))
    }

    /// Bound currently reported by the bus, if it can be read.
    async fn read_bound(&self, channel: &str) -> Option<i64> {
        match self.read_optional(channel).await {
            Ok(value) => value,
            Err(err) => {
                debug!("Can't read {channel}: {err}");
                None
            }
        }
    }
}

#[async_trait]
impl Ess for RestEss {
    fn start_cycle(&mut self) {
        self.bounds = PowerBounds::default();
    }

    async fn get_soc(&mut self) -> Result<u8> {
        let soc = self.client.read_value(&self.component, CHANNEL_SOC).await?;
        Ok(round_soc(soc))
    }

    async fn get_capacity(&mut self) -> Result<i64> {
        let capacity = self
            .client
            .read_value(&self.component, CHANNEL_CAPACITY)
            .await?;
        Ok(capacity.round() as i64)
    }

    async fn get_active_power(&mut self) -> Result<Option<i64>> {
        self.read_optional(CHANNEL_ACTIVE_POWER).await
    }

    async fn get_reactive_power(&mut self) -> Result<Option<i64>> {
        self.read_optional(CHANNEL_REACTIVE_POWER).await
    }

    async fn get_bounds(&mut self) -> Result<PowerBounds> {
        // The bus may not reflect this cycle's pushes yet
        let bus_min = self.read_bound(CHANNEL_SET_MIN).await;
        let bus_max = self.read_bound(CHANNEL_SET_MAX).await;
        Ok(PowerBounds {
            min: merge_bound(self.bounds.min, bus_min, i64::max),
            max: merge_bound(self.bounds.max, bus_max, i64::min),
        })
    }

    async fn push_min(&mut self, power: i64) -> Result<()> {
        let value = tighten(self.bounds.min, power, i64::max);
        // Nothing to do if it's already in force this cycle
        if needs_write(self.bounds.min, value) {
            self.client
                .write(&self.component, CHANNEL_SET_MIN, value)
                .await?;
            self.bounds.min = Some(value);
        }
        Ok(())
    }

    async fn push_max(&mut self, power: i64) -> Result<()> {
        let value = tighten(self.bounds.max, power, i64::min);
        if needs_write(self.bounds.max, value) {
            self.client
                .write(&self.component, CHANNEL_SET_MAX, value)
                .await?;
            self.bounds.max = Some(value);
        }
        Ok(())
    }
}

pub struct RestMeter {
    client: RestClient,
    component: String,
}

impl RestMeter {
    pub fn new(client: RestClient, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }
}

#[async_trait]
impl Meter for RestMeter {
    async fn get_apparent_power(&mut self) -> Result<i64> {
        let power = self
            .client
            .read_value(&self.component, CHANNEL_APPARENT_POWER)
            .await?;
        Ok(power.round() as i64)
    }
}

pub struct RestCharger {
    client: RestClient,
    component: String,
}

impl RestCharger {
    pub fn new(client: RestClient, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }
}

#[async_trait]
impl Charger for RestCharger {
    fn id(&self) -> &str {
        &self.component
    }

    async fn get_power(&mut self) -> Result<i64> {
        let power = self
            .client
            .read_value(&self.component, CHANNEL_CHARGER_POWER)
            .await?;
        Ok(power.round() as i64)
    }
}
