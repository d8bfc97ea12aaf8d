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
use influxdb2::Client;
use influxdb2::api::write::TimestampPrecision;
use influxdb2::models::DataPoint;
use influxdb2::models::health::Status;
use log::{info, warn};
use std::error::Error;

use crate::config::Influxdb2Config;
use crate::monitoring::{CycleUpdate, Monitor};

pub struct Influxdb2Monitor {
    client: Client,
    bucket: String,
}

impl Influxdb2Monitor {
    pub async fn new(config: &Influxdb2Config) -> Self {
        let client = Client::new(&config.host, &config.org, &config.token);
        match client.health().await {
            Ok(health_check) => {
                if health_check.status == Status::Fail {
                    match health_check.message {
                        Some(ref message) => {
                            warn!("Influxdb server is unhealthy: {}", message);
                        }
                        None => {
                            warn!("Influxdb server is unhealthy");
                        }
                    }
                } else {
                    info!(
                        "Successfully connected to Influxdb server at {}",
                        &config.host
                    );
                }
            }
            Err(err) => {
                warn!("Could not connect to Influxdb server: {}", err);
            }
        }
        Self {
            client,
            bucket: config.bucket.to_owned(),
        }
    }
}

#[async_trait]
impl Monitor for Influxdb2Monitor {
    async fn update(&mut self, update: CycleUpdate) -> Result<(), Box<dyn Error>> {
        let mut builder = DataPoint::builder("timeline-charge")
            .timestamp(update.time.timestamp())
            .tag("state", update.state.to_string())
            .tag("strategy", update.strategy.to_string())
            .field("current_soc", update.current_soc as i64)
            .field("target_soc", update.target_soc as i64)
            .field("predicted_pv", update.predicted_pv)
            .field("grid_budget", update.grid_budget);
        if let Some(seconds) = update.target_seconds {
            builder = builder.field("target_seconds", seconds);
        }
        if let Some(min_bound) = update.min_bound {
            builder = builder.field("min_bound", min_bound);
        }
        if let Some(max_bound) = update.max_bound {
            builder = builder.field("max_bound", max_bound);
        }
        let point = builder.build()?;
        let strm = futures::stream::once(async { point });
        self.client
            .write_with_precision(&self.bucket, strm, TimestampPrecision::Seconds)
            .await?;
        Ok(())
    }
}
