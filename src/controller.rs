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

use crate::cloud::{CloudControl, InstanceGroup, InstanceRecord};
use crate::error::*;
use futures::StreamExt;
use slog::{debug, info, warn, Logger};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stream_cancel::{StreamExt as StreamCancelExt, Tripwire};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

/// Timing of the readiness poll.
#[derive(Clone, Debug)]
pub struct ReadinessPolicy {
    /// Pause after a resize before the first poll.
    pub settle_delay: Duration,
    /// Pause between polls.
    pub retry_delay: Duration,
    /// Give up after this many polls.
    pub max_attempts: Option<u32>,
    /// Give up once this much time has passed since the resize.
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
            max_attempts: None,
            timeout: Duration::from_secs(600),
        }
    }
}

/// Result of waiting for a new instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready(InstanceRecord),
    TimedOut { attempts: u32 },
    Cancelled,
}

/// Resizes an instance group and tracks down the instance that resize created.
pub struct ClusterController<C> {
    logger: Logger,
    cloud: Arc<C>,
    group: InstanceGroup,
    policy: ReadinessPolicy,
}

impl<C: CloudControl> ClusterController<C> {
    pub fn new(
        logger: Logger,
        cloud: Arc<C>,
        group: InstanceGroup,
        policy: ReadinessPolicy,
    ) -> Self {
        Self {
            logger,
            cloud,
            group,
            policy,
        }
    }

    pub fn group(&self) -> &InstanceGroup {
        &self.group
    }

    /// Grow the group by one instance.
    ///
    /// Returns the names of the instances that existed before the resize.
    pub async fn scale_up(&self) -> Result<HashSet<String>, Error> {
        let instances = self.cloud.list_instances(&self.group).await?;
        let known: HashSet<String> = instances.into_iter().map(|record| record.name).collect();
        let size = known.len() + 1;

        info!(self.logger, "Resizing instance group";
            "current_size" => known.len(),
            "size" => size);

        self.cloud.resize_group(&self.group, size).await?;
        Ok(known)
    }

    /// The first running instance that isn't in `known`, in listing order.
    ///
    /// Listing errors are logged and reported as no instance.
    pub async fn find_new_ready_instance(&self, known: &HashSet<String>) -> Option<InstanceRecord> {
        match self.cloud.list_instances(&self.group).await {
            Ok(instances) => instances
                .into_iter()
                .find(|record| record.is_running() && !known.contains(&record.name)),
            Err(err) => {
                warn!(self.logger, "Failed to list instance group";
                    "error" => format!("{}", err));
                None
            }
        }
    }

    /// Poll until a new instance is running, the policy runs out, or the tripwire fires.
    pub async fn wait_for_ready_instance(
        &self,
        known: &HashSet<String>,
        tripwire: Tripwire,
    ) -> Readiness {
        let first_attempt = match Instant::now().checked_add(self.policy.settle_delay) {
            Some(first_attempt) => first_attempt,
            None => {
                warn!(self.logger, "Settle delay is out of range, not waiting";
                    "settle_delay" => self.policy.settle_delay.as_secs_f64());
                return Readiness::TimedOut { attempts: 0 };
            }
        };
        let mut attempts = 0u32;

        let poll = async {
            let mut timer = interval_at(first_attempt, self.policy.retry_delay);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let ticks = IntervalStream::new(timer).take_until_if(tripwire);
            tokio::pin!(ticks);

            while ticks.next().await.is_some() {
                attempts += 1;
                if let Some(record) = self.find_new_ready_instance(known).await {
                    info!(self.logger, "Found new running instance";
                        "instance" => &record.name,
                        "attempts" => attempts);
                    return Readiness::Ready(record);
                }

                if let Some(max_attempts) = self.policy.max_attempts {
                    if attempts >= max_attempts {
                        return Readiness::TimedOut { attempts };
                    }
                }

                debug!(self.logger, "No new running instance yet"; "attempts" => attempts);
            }

            Readiness::Cancelled
        };

        let readiness = timeout(self.policy.timeout, poll).await;
        match readiness {
            Ok(readiness) => readiness,
            Err(_) => Readiness::TimedOut { attempts },
        }
    }
}
