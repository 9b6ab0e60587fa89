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

use crate::cloud::gcloud::GcloudCloudControl;
use crate::config::{Config, LogLevelArgument, MetricSourceKind};
use crate::control::{ControlLoop, Outcome};
use crate::controller::ClusterController;
use crate::deploy::DeploymentExecutor;
use crate::error::*;
use crate::metrics::local::LocalCounterMetricSource;
use crate::metrics::prometheus::PrometheusMetricSource;
use crate::metrics::MetricSource;
use crate::state::MigrationStateStore;
use crate::strategy::threshold::ThresholdAutoScalerStrategy;
use crate::strategy::AutoScalerStrategy;
use clap::{crate_name, crate_version, value_t};
use futures::future;
use futures::StreamExt;
use slog::{crit, debug, error, info, o, Drain, LevelFilter, Logger};
use std::panic;
use std::process::exit;
use std::sync::{Arc, Mutex as StdMutex};
use stream_cancel::{StreamExt as StreamCancelExt, Tripwire};
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

/// Cloud provider abstraction.
mod cloud;
/// Command line and environment configuration.
mod config;
/// The monitor, decide, migrate control loop.
mod control;
/// Instance group resizing and readiness polling.
mod controller;
/// Remote workload deployment.
mod deploy;
/// Cloudburst error types.
mod error;
/// Cpu utilization sources.
mod metrics;
/// Cooldown and in-progress bookkeeping.
mod state;
/// Scaling decision strategies.
mod strategy;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let matches = config::app().get_matches();

    let log_level = value_t!(matches, "LOG_LEVEL", LogLevelArgument).unwrap_or_else(|e| e.exit());
    let logger = Logger::root(
        StdMutex::new(LevelFilter::new(
            slog_json::Json::default(std::io::stdout()),
            log_level.into(),
        ))
        .map(slog::Fuse),
        o!("application" => crate_name!(), "version" => crate_version!()),
    );

    // Replace the panic handler with one that will exit the process on panics (in any thread).
    let panic_logger = logger.clone();
    let _ = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        crit!(panic_logger, "Thread panicked"; "error" => format!("{}", panic_info));
        exit(1);
    }));

    let config = match Config::from_matches(&matches) {
        Ok(config) => config,
        Err(err) => {
            crit!(logger, "Invalid configuration"; "error" => format!("{}", err));
            exit(1);
        }
    };

    let logger = logger.new(o!(
        "instance_group" => config.group.name.clone(),
        "zone" => config.group.zone.clone()));
    info!(logger, "Starting cloudburst";
        "metric_source" => config.metric_source.to_string(),
        "cpu_threshold" => config.threshold,
        "deploy_mode" => config.deploy_mode.to_string());

    let metric_source = match config.metric_source {
        MetricSourceKind::LocalCounters => MetricSource::LocalCounters(
            LocalCounterMetricSource::new(config.stat_path.clone(), config.sample_interval),
        ),
        MetricSourceKind::Prometheus => MetricSource::Prometheus(PrometheusMetricSource::new(
            &config.prometheus_url,
            &config.prometheus_query,
            config.prometheus_timeout,
        )?),
    };

    let cloud = Arc::new(GcloudCloudControl::new(&config.gcloud, &config.group.project));
    let state = match &config.state_file {
        Some(state_file) => MigrationStateStore::with_file(state_file),
        None => MigrationStateStore::in_memory(),
    };
    let previous = state.load().await?;
    debug!(logger, "Loaded migration state";
        "in_progress_since" => previous.in_progress_since.map(|since| since.to_rfc3339()),
        "last_migration" => previous.last_migration.map(|at| at.to_rfc3339()));

    let control_loop = ControlLoop::new(
        logger.clone(),
        metric_source,
        AutoScalerStrategy::Threshold(ThresholdAutoScalerStrategy::new(config.threshold)),
        ClusterController::new(
            logger.clone(),
            cloud.clone(),
            config.group.clone(),
            config.readiness.clone(),
        ),
        DeploymentExecutor::new(
            logger.clone(),
            cloud,
            config.deployment.clone(),
            config.deploy_mode,
        ),
        state,
        config.guard.clone(),
    );

    // Interrupting trips the wire, which aborts any readiness wait and stops the timer.
    let (trigger, tripwire) = Tripwire::new();
    let signal_logger = logger.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(signal_logger, "Received interrupt, shutting down"),
            Err(err) => {
                error!(signal_logger, "Failed to listen for interrupts";
                    "error" => format!("{}", err));
                future::pending::<()>().await;
            }
        }
        drop(trigger);
    });

    match config.interval {
        None => {
            let outcome = control_loop.run_once(tripwire).await?;
            report(&logger, &outcome);
        }
        Some(period) => {
            debug!(logger, "Starting periodic control loop";
                "period" => period.as_secs_f64());

            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let ticks = IntervalStream::new(timer).take_until_if(tripwire.clone());
            tokio::pin!(ticks);

            // Iterations run back to back, never concurrently.
            while ticks.next().await.is_some() {
                match control_loop.run_once(tripwire.clone()).await {
                    Ok(outcome) => report(&logger, &outcome),
                    Err(err) => {
                        error!(logger, "Control loop iteration failed";
                            "error" => format!("{}", err));
                    }
                }
            }

            debug!(logger, "Stopped periodic control loop");
        }
    }

    Ok(())
}

fn report(logger: &Logger, outcome: &Outcome) {
    match outcome {
        Outcome::NoActionTaken { .. }
        | Outcome::MigrationCompleted { .. }
        | Outcome::CooldownActive { .. }
        | Outcome::MigrationInProgress { .. } => {
            info!(logger, "Control loop finished"; "outcome" => format!("{:?}", outcome))
        }
        _ => error!(logger, "Migration did not complete"; "outcome" => format!("{:?}", outcome)),
    }
}
