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

use crate::cloud::CloudControl;
use crate::controller::{ClusterController, Readiness};
use crate::deploy::{DeploymentExecutor, DeploymentStep};
use crate::error::*;
use crate::metrics::{sample, MetricSourceTrait};
use crate::state::{Admission, MigrationStateStore};
use crate::strategy::{AutoScalerStrategy, AutoScalerStrategyTrait, ScalingDecision};
use chrono::{DateTime, Duration, Utc};
use slog::{error, info, warn, Logger};
use stream_cancel::Tripwire;

/// How a single control loop invocation ended.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Utilization was at or below the threshold.
    NoActionTaken { reading: f64 },
    /// A recent migration is still cooling down.
    CooldownActive { until: DateTime<Utc> },
    /// Another invocation is migrating right now.
    MigrationInProgress { since: DateTime<Utc> },
    /// The group could not be resized.
    ScaleUpFailed { reason: String },
    /// No new instance became ready in time.
    ReadinessTimedOut { attempts: u32 },
    /// The readiness wait was aborted.
    Cancelled,
    /// A deployment step failed.
    DeploymentFailed { step: DeploymentStep, output: String },
    /// The workload is running on a new instance.
    MigrationCompleted { instance: String },
}

/// Guards against repeated or overlapping migrations.
#[derive(Clone, Debug)]
pub struct MigrationGuard {
    /// Minimum time between two migrations.
    pub cooldown: Duration,
    /// Age after which an in-progress marker is considered abandoned.
    pub stale_after: Duration,
}

impl Default for MigrationGuard {
    fn default() -> Self {
        Self {
            cooldown: Duration::seconds(300),
            stale_after: Duration::seconds(1800),
        }
    }
}

/// Sample, decide, and when needed, scale out and redeploy.
pub struct ControlLoop<M, C> {
    logger: Logger,
    metric_source: M,
    strategy: AutoScalerStrategy,
    controller: ClusterController<C>,
    executor: DeploymentExecutor<C>,
    state: MigrationStateStore,
    guard: MigrationGuard,
}

impl<M, C> ControlLoop<M, C>
where
    M: MetricSourceTrait + Sync,
    C: CloudControl,
{
    pub fn new(
        logger: Logger,
        metric_source: M,
        strategy: AutoScalerStrategy,
        controller: ClusterController<C>,
        executor: DeploymentExecutor<C>,
        state: MigrationStateStore,
        guard: MigrationGuard,
    ) -> Self {
        Self {
            logger,
            metric_source,
            strategy,
            controller,
            executor,
            state,
            guard,
        }
    }

    /// A single pass of the control loop.
    ///
    /// Errors are limited to the migration state store, everything else is
    /// reported through the outcome.
    pub async fn run_once(&self, tripwire: Tripwire) -> Result<Outcome, Error> {
        let reading = sample(&self.logger, &self.metric_source).await;
        info!(self.logger, "Current cpu usage";
            "cpu_usage" => reading.value,
            "collected_at" => reading.collected_at.to_rfc3339());

        if self.strategy.evaluate(&reading) == ScalingDecision::NoAction {
            info!(self.logger, "Cpu usage is normal, no action required");
            return Ok(Outcome::NoActionTaken {
                reading: reading.value,
            });
        }

        let admission = self
            .state
            .begin(Utc::now(), self.guard.cooldown, self.guard.stale_after)
            .await?;
        match admission {
            Admission::Proceed => (),
            Admission::InProgress { since } => {
                warn!(self.logger, "Skipping migration, another migration is in progress";
                    "since" => since.to_rfc3339());
                return Ok(Outcome::MigrationInProgress { since });
            }
            Admission::Cooldown { until } => {
                info!(self.logger, "Skipping migration, cooldown is active";
                    "until" => until.to_rfc3339());
                return Ok(Outcome::CooldownActive { until });
            }
        }

        let outcome = self.migrate(tripwire).await;

        // Any attempt that got as far as resizing the group starts the cooldown.
        let resized = !matches!(outcome, Outcome::ScaleUpFailed { .. });
        self.state.finish(Utc::now(), resized).await?;

        Ok(outcome)
    }

    async fn migrate(&self, tripwire: Tripwire) -> Outcome {
        warn!(self.logger, "High cpu usage detected, scaling out";
            "instance_group" => &self.controller.group().name);

        let known = match self.controller.scale_up().await {
            Ok(known) => known,
            Err(err) => {
                error!(self.logger, "Failed to scale out instance group";
                    "error" => format!("{}", err));
                return Outcome::ScaleUpFailed {
                    reason: format!("{}", err),
                };
            }
        };

        let instance = match self.controller.wait_for_ready_instance(&known, tripwire).await {
            Readiness::Ready(instance) => instance,
            Readiness::TimedOut { attempts } => {
                error!(self.logger, "Gave up waiting for a new running instance";
                    "attempts" => attempts);
                return Outcome::ReadinessTimedOut { attempts };
            }
            Readiness::Cancelled => {
                warn!(self.logger, "Migration cancelled while waiting for a new instance");
                return Outcome::Cancelled;
            }
        };

        match self
            .executor
            .deploy(&instance, &self.controller.group().zone)
            .await
        {
            Ok(()) => {
                info!(self.logger, "Migration completed"; "instance" => &instance.name);
                Outcome::MigrationCompleted {
                    instance: instance.name,
                }
            }
            Err(failure) => Outcome::DeploymentFailed {
                step: failure.step,
                output: failure.output,
            },
        }
    }
}
