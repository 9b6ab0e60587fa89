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

use crate::cloud::InstanceGroup;
use crate::control::MigrationGuard;
use crate::controller::ReadinessPolicy;
use crate::deploy::DeploymentPlan;
use crate::error::*;
use crate::metrics::local::DEFAULT_STAT_PATH;
use crate::metrics::prometheus::{DEFAULT_CPU_QUERY, DEFAULT_QUERY_URL};
use clap::{
    arg_enum, crate_authors, crate_description, crate_name, crate_version, value_t, App, Arg,
    ArgMatches,
};
use slog::Level;
use std::path::PathBuf;
use std::time::Duration;

arg_enum! {
    /// Log level command line argument.
    #[derive(PartialEq, Debug, Clone, Copy)]
    pub enum LogLevelArgument {
        Critical,
        Error,
        Warning,
        Info,
        Debug,
        Trace,
    }
}

impl From<LogLevelArgument> for Level {
    fn from(level_arg: LogLevelArgument) -> Level {
        match level_arg {
            LogLevelArgument::Critical => Level::Critical,
            LogLevelArgument::Error => Level::Error,
            LogLevelArgument::Warning => Level::Warning,
            LogLevelArgument::Info => Level::Info,
            LogLevelArgument::Debug => Level::Debug,
            LogLevelArgument::Trace => Level::Trace,
        }
    }
}

arg_enum! {
    /// Where cpu utilization is read from.
    #[derive(PartialEq, Debug, Clone, Copy)]
    pub enum MetricSourceKind {
        LocalCounters,
        Prometheus,
    }
}

arg_enum! {
    /// How deployment step failures are handled.
    #[derive(PartialEq, Debug, Clone, Copy)]
    pub enum DeployMode {
        FailFast,
        BestEffort,
    }
}

/// Cloudburst runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub group: InstanceGroup,
    /// Path to the gcloud binary.
    pub gcloud: String,
    /// Cpu usage percentage above which a migration starts.
    pub threshold: f64,
    pub metric_source: MetricSourceKind,
    pub stat_path: PathBuf,
    pub sample_interval: Duration,
    pub prometheus_url: String,
    pub prometheus_query: String,
    pub prometheus_timeout: Duration,
    pub readiness: ReadinessPolicy,
    pub deployment: DeploymentPlan,
    pub deploy_mode: DeployMode,
    pub guard: MigrationGuard,
    /// Persisted migration state, kept in memory when unset.
    pub state_file: Option<PathBuf>,
    /// Run periodically rather than once.
    pub interval: Option<Duration>,
}

/// Command line interface, every option can also be set from the environment.
pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .author(crate_authors!())
        .arg(
            Arg::with_name("LOG_LEVEL")
                .long("log-level")
                .env("CLOUDBURST_LOG_LEVEL")
                .help("set the application log level")
                .takes_value(true)
                .possible_values(&LogLevelArgument::variants())
                .case_insensitive(true)
                .default_value("Info"),
        )
        .arg(
            Arg::with_name("PROJECT")
                .long("project")
                .env("CLOUDBURST_PROJECT")
                .help("cloud project of the instance group")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("ZONE")
                .long("zone")
                .env("CLOUDBURST_ZONE")
                .help("zone of the instance group")
                .takes_value(true)
                .default_value("us-central1-a"),
        )
        .arg(
            Arg::with_name("INSTANCE_GROUP")
                .long("instance-group")
                .env("CLOUDBURST_INSTANCE_GROUP")
                .help("managed instance group to scale out")
                .takes_value(true)
                .default_value("web-migration"),
        )
        .arg(
            Arg::with_name("GCLOUD")
                .long("gcloud")
                .env("CLOUDBURST_GCLOUD")
                .help("gcloud binary")
                .takes_value(true)
                .default_value("gcloud"),
        )
        .arg(
            Arg::with_name("CPU_THRESHOLD")
                .long("cpu-threshold")
                .env("CLOUDBURST_CPU_THRESHOLD")
                .help("cpu usage percentage above which to migrate")
                .takes_value(true)
                .default_value("75"),
        )
        .arg(
            Arg::with_name("METRIC_SOURCE")
                .long("metric-source")
                .env("CLOUDBURST_METRIC_SOURCE")
                .help("where to read cpu usage from")
                .takes_value(true)
                .possible_values(&MetricSourceKind::variants())
                .case_insensitive(true)
                .default_value("LocalCounters"),
        )
        .arg(
            Arg::with_name("STAT_PATH")
                .long("stat-path")
                .env("CLOUDBURST_STAT_PATH")
                .help("kernel cpu accounting file")
                .takes_value(true)
                .default_value(DEFAULT_STAT_PATH),
        )
        .arg(
            Arg::with_name("SAMPLE_INTERVAL")
                .long("sample-interval")
                .env("CLOUDBURST_SAMPLE_INTERVAL")
                .help("seconds between the two cpu accounting snapshots")
                .takes_value(true)
                .default_value("1"),
        )
        .arg(
            Arg::with_name("PROMETHEUS_URL")
                .long("prometheus-url")
                .env("CLOUDBURST_PROMETHEUS_URL")
                .help("prometheus instant query endpoint")
                .takes_value(true)
                .default_value(DEFAULT_QUERY_URL),
        )
        .arg(
            Arg::with_name("PROMETHEUS_QUERY")
                .long("prometheus-query")
                .env("CLOUDBURST_PROMETHEUS_QUERY")
                .help("query returning cpu usage as a percentage")
                .takes_value(true)
                .default_value(DEFAULT_CPU_QUERY),
        )
        .arg(
            Arg::with_name("PROMETHEUS_TIMEOUT")
                .long("prometheus-timeout")
                .env("CLOUDBURST_PROMETHEUS_TIMEOUT")
                .help("prometheus request timeout in seconds")
                .takes_value(true)
                .default_value("10"),
        )
        .arg(
            Arg::with_name("SETTLE_DELAY")
                .long("settle-delay")
                .env("CLOUDBURST_SETTLE_DELAY")
                .help("seconds to wait after resizing before looking for the new instance")
                .takes_value(true)
                .default_value("10"),
        )
        .arg(
            Arg::with_name("RETRY_DELAY")
                .long("retry-delay")
                .env("CLOUDBURST_RETRY_DELAY")
                .help("seconds between instance readiness checks")
                .takes_value(true)
                .default_value("5"),
        )
        .arg(
            Arg::with_name("MAX_ATTEMPTS")
                .long("max-attempts")
                .env("CLOUDBURST_MAX_ATTEMPTS")
                .help("give up after this many readiness checks")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("READY_TIMEOUT")
                .long("ready-timeout")
                .env("CLOUDBURST_READY_TIMEOUT")
                .help("seconds to wait for a new instance before giving up")
                .takes_value(true)
                .default_value("600"),
        )
        .arg(
            Arg::with_name("LOCAL_PAYLOAD_PATH")
                .long("local-payload-path")
                .env("CLOUDBURST_LOCAL_PAYLOAD_PATH")
                .help("workload file to deploy")
                .takes_value(true)
                .default_value("~/app/app.py"),
        )
        .arg(
            Arg::with_name("REMOTE_DIRECTORY")
                .long("remote-directory")
                .env("CLOUDBURST_REMOTE_DIRECTORY")
                .help("deployment directory on the new instance")
                .takes_value(true)
                .default_value("~/app"),
        )
        .arg(
            Arg::with_name("REMOTE_PAYLOAD_PATH")
                .long("remote-payload-path")
                .env("CLOUDBURST_REMOTE_PAYLOAD_PATH")
                .help("where the workload file is copied to on the new instance")
                .takes_value(true)
                .default_value("~/app/app.py"),
        )
        .arg(
            Arg::with_name("SETUP_COMMAND")
                .long("setup-command")
                .env("CLOUDBURST_SETUP_COMMAND")
                .help("installs the workload runtime and dependencies")
                .takes_value(true)
                .default_value(
                    "sudo apt update && sudo apt install -y python3-pip && pip3 install flask",
                ),
        )
        .arg(
            Arg::with_name("LAUNCHER")
                .long("launcher")
                .env("CLOUDBURST_LAUNCHER")
                .help("program the workload is started with")
                .takes_value(true)
                .default_value("python3"),
        )
        .arg(
            Arg::with_name("DEPLOY_MODE")
                .long("deploy-mode")
                .env("CLOUDBURST_DEPLOY_MODE")
                .help("whether a failed deployment step aborts the deployment")
                .takes_value(true)
                .possible_values(&DeployMode::variants())
                .case_insensitive(true)
                .default_value("FailFast"),
        )
        .arg(
            Arg::with_name("COOLDOWN")
                .long("cooldown")
                .env("CLOUDBURST_COOLDOWN")
                .help("minimum seconds between migrations")
                .takes_value(true)
                .default_value("300"),
        )
        .arg(
            Arg::with_name("STALE_AFTER")
                .long("stale-after")
                .env("CLOUDBURST_STALE_AFTER")
                .help("seconds after which an unfinished migration is assumed abandoned")
                .takes_value(true)
                .default_value("1800"),
        )
        .arg(
            Arg::with_name("STATE_FILE")
                .long("state-file")
                .env("CLOUDBURST_STATE_FILE")
                .help("migration state file, empty to keep state in memory")
                .takes_value(true)
                .empty_values(true)
                .default_value("cloudburst-state.json"),
        )
        .arg(
            Arg::with_name("INTERVAL")
                .long("interval")
                .env("CLOUDBURST_INTERVAL")
                .help("run every this many seconds instead of once")
                .takes_value(true),
        )
}

impl Config {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, Error> {
        let threshold = value_t!(matches, "CPU_THRESHOLD", f64).map_err(invalid)?;
        if !threshold.is_finite() {
            return Configuration {
                reason: "cpu threshold must be a number",
            }
            .fail();
        }

        let retry_delay = seconds(matches, "RETRY_DELAY")?;
        if retry_delay == Duration::from_secs(0) {
            return Configuration {
                reason: "retry delay must be positive",
            }
            .fail();
        }

        let max_attempts = match matches.value_of("MAX_ATTEMPTS") {
            Some(max_attempts) => Some(
                max_attempts
                    .parse::<u32>()
                    .ok()
                    .filter(|max_attempts| *max_attempts > 0)
                    .ok_or_else(|| Error::Configuration {
                        reason: format!("invalid max attempts {:?}", max_attempts),
                    })?,
            ),
            None => None,
        };

        let interval = match matches.value_of("INTERVAL") {
            Some(_) => {
                let interval = seconds(matches, "INTERVAL")?;
                if interval == Duration::from_secs(0) {
                    return Configuration {
                        reason: "interval must be positive",
                    }
                    .fail();
                }
                Some(interval)
            }
            None => None,
        };

        Ok(Self {
            group: InstanceGroup {
                name: string(matches, "INSTANCE_GROUP")?,
                zone: string(matches, "ZONE")?,
                project: string(matches, "PROJECT")?,
            },
            gcloud: string(matches, "GCLOUD")?,
            threshold,
            metric_source: value_t!(matches, "METRIC_SOURCE", MetricSourceKind).map_err(invalid)?,
            stat_path: PathBuf::from(string(matches, "STAT_PATH")?),
            sample_interval: seconds(matches, "SAMPLE_INTERVAL")?,
            prometheus_url: string(matches, "PROMETHEUS_URL")?,
            prometheus_query: string(matches, "PROMETHEUS_QUERY")?,
            prometheus_timeout: seconds(matches, "PROMETHEUS_TIMEOUT")?,
            readiness: ReadinessPolicy {
                settle_delay: seconds(matches, "SETTLE_DELAY")?,
                retry_delay,
                max_attempts,
                timeout: seconds(matches, "READY_TIMEOUT")?,
            },
            deployment: DeploymentPlan {
                local_payload_path: expand_home(&string(matches, "LOCAL_PAYLOAD_PATH")?),
                remote_directory: string(matches, "REMOTE_DIRECTORY")?,
                remote_payload_path: string(matches, "REMOTE_PAYLOAD_PATH")?,
                setup_command: string(matches, "SETUP_COMMAND")?,
                launcher: string(matches, "LAUNCHER")?,
            },
            deploy_mode: value_t!(matches, "DEPLOY_MODE", DeployMode).map_err(invalid)?,
            guard: MigrationGuard {
                cooldown: chrono_seconds(matches, "COOLDOWN")?,
                stale_after: chrono_seconds(matches, "STALE_AFTER")?,
            },
            state_file: matches
                .value_of("STATE_FILE")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            interval,
        })
    }
}

fn invalid(err: clap::Error) -> Error {
    Error::Configuration {
        reason: err.message,
    }
}

fn string(matches: &ArgMatches, name: &str) -> Result<String, Error> {
    matches
        .value_of(name)
        .map(String::from)
        .ok_or_else(|| Error::Configuration {
            reason: format!("missing {}", name.to_lowercase().replace('_', "-")),
        })
}

/// Upper bound on any configured delay, one year.
const MAX_SECONDS: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// A non-negative number of seconds, fractions allowed, at most a year.
fn seconds(matches: &ArgMatches, name: &str) -> Result<Duration, Error> {
    let value = string(matches, name)?;
    match value.parse::<f64>() {
        Ok(seconds) if (0.0..=MAX_SECONDS).contains(&seconds) => {
            Ok(Duration::from_secs_f64(seconds))
        }
        _ => Configuration {
            reason: format!(
                "invalid {} {:?}",
                name.to_lowercase().replace('_', "-"),
                value
            ),
        }
        .fail(),
    }
}

fn chrono_seconds(matches: &ArgMatches, name: &str) -> Result<chrono::Duration, Error> {
    chrono::Duration::from_std(seconds(matches, name)?).map_err(|_| Error::Configuration {
        reason: format!("{} out of range", name.to_lowercase().replace('_', "-")),
    })
}

/// Expand a leading `~/` to the current user's home directory.
fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, Error> {
        let matches = app()
            .get_matches_from_safe(std::iter::once("cloudburst").chain(args.iter().copied()))
            .map_err(invalid)?;
        Config::from_matches(&matches)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--project", "demo"]).unwrap();

        assert_eq!(config.group.project, "demo");
        assert_eq!(config.group.zone, "us-central1-a");
        assert_eq!(config.group.name, "web-migration");
        assert_eq!(config.threshold, 75.0);
        assert_eq!(config.metric_source, MetricSourceKind::LocalCounters);
        assert_eq!(config.sample_interval, Duration::from_secs(1));
        assert_eq!(config.readiness.settle_delay, Duration::from_secs(10));
        assert_eq!(config.readiness.retry_delay, Duration::from_secs(5));
        assert_eq!(config.readiness.max_attempts, None);
        assert_eq!(config.deploy_mode, DeployMode::FailFast);
        assert_eq!(config.deployment.remote_payload_path, "~/app/app.py");
        assert_eq!(
            config.state_file,
            Some(PathBuf::from("cloudburst-state.json"))
        );
        assert_eq!(config.interval, None);
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--project",
            "demo",
            "--cpu-threshold",
            "60.5",
            "--metric-source",
            "prometheus",
            "--retry-delay",
            "0.5",
            "--max-attempts",
            "12",
            "--deploy-mode",
            "besteffort",
            "--state-file",
            "",
            "--interval",
            "30",
        ])
        .unwrap();

        assert_eq!(config.threshold, 60.5);
        assert_eq!(config.metric_source, MetricSourceKind::Prometheus);
        assert_eq!(config.readiness.retry_delay, Duration::from_millis(500));
        assert_eq!(config.readiness.max_attempts, Some(12));
        assert_eq!(config.deploy_mode, DeployMode::BestEffort);
        assert_eq!(config.state_file, None);
        assert_eq!(config.interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_invalid() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--project", "demo", "--cpu-threshold", "high"]).is_err());
        assert!(parse(&["--project", "demo", "--retry-delay", "0"]).is_err());
        assert!(parse(&["--project", "demo", "--settle-delay", "-1"]).is_err());
        assert!(parse(&["--project", "demo", "--max-attempts", "0"]).is_err());
        assert!(parse(&["--project", "demo", "--interval", "0"]).is_err());
    }

    #[test]
    fn test_out_of_range_delays() {
        for value in &["1e30", "inf", "NaN", "31536001"] {
            match parse(&["--project", "demo", "--settle-delay", value]) {
                Err(Error::Configuration { reason }) => assert!(reason.contains("settle-delay")),
                other => panic!("unexpected result for {}: {:?}", value, other.map(|_| ())),
            }
        }
        assert!(parse(&["--project", "demo", "--cooldown", "1e300"]).is_err());

        let config = parse(&["--project", "demo", "--ready-timeout", "31536000"]).unwrap();
        assert_eq!(config.readiness.timeout, Duration::from_secs(31_536_000));
    }

    #[test]
    fn test_expand_home() {
        let home = std::env::var("HOME").unwrap();
        assert_eq!(
            expand_home("~/app/app.py"),
            format!("{}/app/app.py", home.trim_end_matches('/'))
        );
        assert_eq!(expand_home("/srv/app.py"), "/srv/app.py");
    }
}
