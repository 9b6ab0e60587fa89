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
use snafu::OptionExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;

/// Kernel cpu accounting file.
pub const DEFAULT_STAT_PATH: &str = "/proc/stat";

/// Cumulative cpu ticks from the aggregate `cpu` line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuCounters {
    pub idle: u64,
    pub total: u64,
}

impl CpuCounters {
    /// Parse the aggregate cpu line out of a /proc/stat style document.
    pub fn parse(stat: &str) -> Result<Self, Error> {
        let line = stat
            .lines()
            .find(|line| line.starts_with("cpu "))
            .context(ProcStat {
                reason: "no aggregate cpu line",
            })?;

        let mut values: Vec<u64> = Vec::new();
        for field in line.split_whitespace().skip(1) {
            values.push(field.parse().map_err(|_| Error::ProcStat {
                reason: format!("invalid counter {:?}", field),
            })?);
        }

        // user nice system idle ...
        let idle = *values.get(3).context(ProcStat {
            reason: "missing idle counter",
        })?;

        Ok(Self {
            idle,
            total: values.iter().sum(),
        })
    }
}

/// Utilization percentage between two snapshots.
pub fn cpu_usage(before: &CpuCounters, after: &CpuCounters) -> Result<f64, Error> {
    let (idle_delta, total_delta) = match (
        after.idle.checked_sub(before.idle),
        after.total.checked_sub(before.total),
    ) {
        (Some(idle_delta), Some(total_delta)) => (idle_delta, total_delta),
        _ => {
            return ProcStat {
                reason: "counters went backwards",
            }
            .fail()
        }
    };

    if total_delta == 0 {
        return ProcStat {
            reason: "no ticks elapsed between snapshots",
        }
        .fail();
    }

    Ok(100.0 * (1.0 - idle_delta as f64 / total_delta as f64))
}

/// Measures utilization by differencing two snapshots of the kernel counters.
pub struct LocalCounterMetricSource {
    stat_path: PathBuf,
    interval: Duration,
}

impl LocalCounterMetricSource {
    pub fn new(stat_path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            stat_path: stat_path.into(),
            interval,
        }
    }

    async fn snapshot(&self) -> Result<CpuCounters, Error> {
        let stat = tokio::fs::read_to_string(&self.stat_path)
            .await
            .map_err(|err| Error::ProcStat {
                reason: format!("reading {}: {}", self.stat_path.display(), err),
            })?;
        CpuCounters::parse(&stat)
    }
}

#[async_trait]
impl MetricSourceTrait for LocalCounterMetricSource {
    async fn measure(&self) -> Result<f64, Error> {
        let before = self.snapshot().await?;
        sleep(self.interval).await;
        let after = self.snapshot().await?;
        cpu_usage(&before, &after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::sample;
    use crate::metrics::tests::get_logger;

    const FIRST_SNAPSHOT: &str = "cpu  100 0 100 800 0 0 0 0 0 0\n\
                                  cpu0 100 0 100 800 0 0 0 0 0 0\n\
                                  intr 12345\n";
    const SECOND_SNAPSHOT: &str = "cpu  150 0 140 810 0 0 0 0 0 0\n\
                                   cpu0 150 0 140 810 0 0 0 0 0 0\n\
                                   intr 12399\n";

    #[test]
    fn test_parse_counters() {
        let counters = CpuCounters::parse(FIRST_SNAPSHOT).unwrap();
        assert_eq!(counters, CpuCounters { idle: 800, total: 1000 });
    }

    #[test]
    fn test_parse_rejects_missing_cpu_line() {
        assert!(CpuCounters::parse("intr 1 2 3\n").is_err());
        assert!(CpuCounters::parse("cpu  1 2 3\n").is_err());
        assert!(CpuCounters::parse("cpu  1 x 3 4\n").is_err());
    }

    #[test]
    fn test_cpu_usage() {
        let before = CpuCounters { idle: 0, total: 0 };
        let after = CpuCounters { idle: 10, total: 100 };
        assert_eq!(cpu_usage(&before, &after).unwrap(), 90.0);
    }

    #[test]
    fn test_cpu_usage_without_elapsed_ticks() {
        let counters = CpuCounters { idle: 10, total: 100 };
        assert!(cpu_usage(&counters, &counters).is_err());
        assert!(cpu_usage(&counters, &CpuCounters { idle: 5, total: 90 }).is_err());
    }

    #[tokio::test]
    async fn test_snapshots_from_stat_file() {
        let dir = tempfile::tempdir().unwrap();
        let stat_path = dir.path().join("stat");
        std::fs::write(&stat_path, FIRST_SNAPSHOT).unwrap();
        let source = LocalCounterMetricSource::new(&stat_path, Duration::from_secs(1));

        let before = source.snapshot().await.unwrap();
        std::fs::write(&stat_path, SECOND_SNAPSHOT).unwrap();
        let after = source.snapshot().await.unwrap();

        assert_eq!(before, CpuCounters { idle: 800, total: 1000 });
        assert_eq!(after, CpuCounters { idle: 810, total: 1100 });
        assert_eq!(cpu_usage(&before, &after).unwrap(), 90.0);
    }

    #[tokio::test]
    async fn test_sample_unchanged_counters_is_neutral() {
        let dir = tempfile::tempdir().unwrap();
        let stat_path = dir.path().join("stat");
        std::fs::write(&stat_path, FIRST_SNAPSHOT).unwrap();

        let source = LocalCounterMetricSource::new(&stat_path, Duration::from_millis(10));
        assert_eq!(sample(&get_logger(), &source).await.value, 0.0);
    }

    #[tokio::test]
    async fn test_sample_missing_stat_file_is_neutral() {
        let dir = tempfile::tempdir().unwrap();
        let source =
            LocalCounterMetricSource::new(dir.path().join("missing"), Duration::from_millis(10));
        assert_eq!(sample(&get_logger(), &source).await.value, 0.0);
    }
}
