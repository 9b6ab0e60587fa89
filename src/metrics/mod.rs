/*
 * Copyright 2020 Damian Peckett <damian@pecke.tt>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::error::*;
use crate::metrics::local::LocalCounterMetricSource;
use crate::metrics::prometheus::PrometheusMetricSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enum_dispatch::enum_dispatch;
use serde::Serialize;
use slog::{debug, warn, Logger};

/// Cpu utilization from local kernel accounting counters.
pub mod local;
/// Cpu utilization from a Prometheus instant query.
pub mod prometheus;

/// A single cpu utilization sample, as a percentage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UtilizationReading {
    /// Utilization percentage, rounded to two decimal places.
    pub value: f64,
    /// When the sample was taken.
    pub collected_at: DateTime<Utc>,
}

impl UtilizationReading {
    pub fn new(value: f64) -> Self {
        Self {
            value: round_percentage(value),
            collected_at: Utc::now(),
        }
    }

    /// The fallback reading used whenever a measurement fails.
    pub fn neutral() -> Self {
        Self::new(0.0)
    }
}

/// Sources of cpu utilization.
#[enum_dispatch]
pub enum MetricSource {
    /// Differenced snapshots of /proc/stat.
    LocalCounters(LocalCounterMetricSource),
    /// A Prometheus compatible query endpoint.
    Prometheus(PrometheusMetricSource),
}

#[async_trait]
#[enum_dispatch(MetricSource)]
pub trait MetricSourceTrait {
    /// Take a raw utilization measurement.
    async fn measure(&self) -> Result<f64, Error>;
}

/// Sample a metric source. Never fails, a neutral reading is returned instead.
pub async fn sample<M>(logger: &Logger, source: &M) -> UtilizationReading
where
    M: MetricSourceTrait + Sync + ?Sized,
{
    match source.measure().await {
        Ok(value) if value.is_finite() => {
            let reading = UtilizationReading::new(value);
            debug!(logger, "Sampled cpu utilization"; "cpu_usage" => reading.value);
            reading
        }
        Ok(value) => {
            warn!(logger, "Discarding non-finite cpu utilization sample";
                "cpu_usage" => value);
            UtilizationReading::neutral()
        }
        Err(err) => {
            warn!(logger, "Failed to sample cpu utilization, using neutral reading";
                "error" => format!("{}", err));
            UtilizationReading::neutral()
        }
    }
}

fn round_percentage(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
