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
use crate::metrics::MetricSourceTrait;
use async_trait::async_trait;
use serde::Deserialize;
use snafu::{ensure, OptionExt, ResultExt};
use std::time::Duration;

/// Instant query endpoint of a local Prometheus server.
pub const DEFAULT_QUERY_URL: &str = "http://localhost:9090/api/v1/query";

/// Cluster cpu utilization, as a percentage, averaged over the last five minutes.
pub const DEFAULT_CPU_QUERY: &str =
    "100 - (avg by(instance) (rate(node_cpu_seconds_total{mode='idle'}[5m])) * 100)";

#[derive(Debug, Deserialize)]
struct QueryResponse {
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySample>,
}

#[derive(Debug, Deserialize)]
struct QuerySample {
    /// Timestamp and value, Prometheus encodes the value as a string.
    value: (f64, String),
}

/// Measures utilization with a Prometheus instant query.
pub struct PrometheusMetricSource {
    client: reqwest::Client,
    query_url: String,
    query: String,
}

impl PrometheusMetricSource {
    pub fn new(query_url: &str, query: &str, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(HttpClient {})?;
        Ok(Self {
            client,
            query_url: query_url.into(),
            query: query.into(),
        })
    }
}

#[async_trait]
impl MetricSourceTrait for PrometheusMetricSource {
    async fn measure(&self) -> Result<f64, Error> {
        let response = self
            .client
            .get(&self.query_url)
            .query(&[("query", &self.query)])
            .send()
            .await
            .context(HttpClient {})?;

        let status = response.status();
        let body = response.text().await.context(HttpClient {})?;
        ensure!(
            status.is_success(),
            MetricUnavailable {
                reason: format!("query endpoint returned {}: {}", status, body.trim()),
            }
        );

        extract_scalar(&body)
    }
}

/// Pull the first sample value out of an instant query response.
fn extract_scalar(body: &str) -> Result<f64, Error> {
    let response: QueryResponse = serde_json::from_str(body).context(JsonSerialization {})?;
    let sample = response
        .data
        .and_then(|data| data.result.into_iter().next())
        .context(MetricUnavailable {
            reason: "query returned no samples",
        })?;

    sample.value.1.parse().map_err(|_| Error::MetricUnavailable {
        reason: format!("non-numeric sample value {:?}", sample.value.1),
    })
}
