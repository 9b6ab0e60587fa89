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

use crate::cloud::{CloudControl, InstanceRecord};
use crate::config::DeployMode;
use crate::error::*;
use slog::{debug, error, info, o, warn, Logger};
use std::fmt;
use std::sync::Arc;

/// A single remote deployment step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentStep {
    /// Create the deployment directory.
    EnsureDirectory,
    /// Copy the workload payload onto the instance.
    TransferPayload,
    /// Install the runtime and start the workload in the background.
    LaunchWorkload,
}

impl fmt::Display for DeploymentStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStep::EnsureDirectory => f.write_str("ensure_directory"),
            DeploymentStep::TransferPayload => f.write_str("transfer_payload"),
            DeploymentStep::LaunchWorkload => f.write_str("launch_workload"),
        }
    }
}

/// What to deploy and how to start it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentPlan {
    pub local_payload_path: String,
    pub remote_directory: String,
    pub remote_payload_path: String,
    /// Installs the runtime and dependencies, runs before launch.
    pub setup_command: String,
    /// Interpreter the payload is run with.
    pub launcher: String,
}

impl Default for DeploymentPlan {
    fn default() -> Self {
        Self {
            local_payload_path: "~/app/app.py".into(),
            remote_directory: "~/app".into(),
            remote_payload_path: "~/app/app.py".into(),
            setup_command:
                "sudo apt update && sudo apt install -y python3-pip && pip3 install flask".into(),
            launcher: "python3".into(),
        }
    }
}

impl DeploymentPlan {
    /// Steps, in execution order.
    pub const STEPS: [DeploymentStep; 3] = [
        DeploymentStep::EnsureDirectory,
        DeploymentStep::TransferPayload,
        DeploymentStep::LaunchWorkload,
    ];

    pub fn directory_command(&self) -> String {
        format!("mkdir -p {}", self.remote_directory)
    }

    /// Setup followed by a detached launch, with combined output sent to a log file.
    pub fn launch_command(&self) -> String {
        let launch = format!(
            "nohup {} {} > {}/log.txt 2>&1 &",
            self.launcher,
            self.remote_payload_path,
            self.remote_directory.trim_end_matches('/')
        );
        if self.setup_command.trim().is_empty() {
            launch
        } else {
            format!("{} && {}", self.setup_command, launch)
        }
    }
}

/// The step a deployment stopped at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentFailure {
    pub step: DeploymentStep,
    pub output: String,
}

/// Pushes and launches the workload on an instance.
pub struct DeploymentExecutor<C> {
    logger: Logger,
    cloud: Arc<C>,
    plan: DeploymentPlan,
    mode: DeployMode,
}

impl<C: CloudControl> DeploymentExecutor<C> {
    pub fn new(logger: Logger, cloud: Arc<C>, plan: DeploymentPlan, mode: DeployMode) -> Self {
        Self {
            logger,
            cloud,
            plan,
            mode,
        }
    }

    /// Run every step in order against the instance.
    ///
    /// In fail fast mode the first failing step ends the deployment, in best
    /// effort mode failures are logged and the remaining steps still run.
    pub async fn deploy(
        &self,
        instance: &InstanceRecord,
        zone: &str,
    ) -> Result<(), DeploymentFailure> {
        let logger = self.logger.new(o!("instance" => instance.name.clone()));
        info!(logger, "Deploying workload";
            "payload" => &self.plan.local_payload_path,
            "mode" => self.mode.to_string());

        for step in DeploymentPlan::STEPS.iter().copied() {
            match self.run_step(step, &instance.name, zone).await {
                Ok(output) => {
                    debug!(logger, "Deployment step finished";
                        "step" => step.to_string(),
                        "output" => output.trim());
                }
                Err(err) if self.mode == DeployMode::FailFast => {
                    error!(logger, "Deployment step failed, aborting deployment";
                        "step" => step.to_string(),
                        "error" => format!("{}", err));
                    return Err(DeploymentFailure {
                        step,
                        output: format!("{}", err),
                    });
                }
                Err(err) => {
                    warn!(logger, "Deployment step failed, continuing";
                        "step" => step.to_string(),
                        "error" => format!("{}", err));
                }
            }
        }

        info!(logger, "Workload deployed");
        Ok(())
    }

    async fn run_step(
        &self,
        step: DeploymentStep,
        instance: &str,
        zone: &str,
    ) -> Result<String, Error> {
        match step {
            DeploymentStep::EnsureDirectory => {
                self.cloud
                    .run_remote_command(instance, zone, &self.plan.directory_command())
                    .await
            }
            DeploymentStep::TransferPayload => {
                self.cloud
                    .copy_file(
                        &self.plan.local_payload_path,
                        instance,
                        &self.plan.remote_payload_path,
                        zone,
                    )
                    .await
            }
            DeploymentStep::LaunchWorkload => {
                self.cloud
                    .run_remote_command(instance, zone, &self.plan.launch_command())
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{running, FakeCloudControl};
    use crate::metrics::tests::get_logger;

    fn test_plan() -> DeploymentPlan {
        DeploymentPlan {
            local_payload_path: "/srv/payload/app.py".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_launch_command() {
        assert_eq!(
            test_plan().launch_command(),
            "sudo apt update && sudo apt install -y python3-pip && pip3 install flask && \
             nohup python3 ~/app/app.py > ~/app/log.txt 2>&1 &"
        );

        let plan = DeploymentPlan {
            setup_command: "".into(),
            remote_directory: "/opt/app/".into(),
            remote_payload_path: "/opt/app/app.py".into(),
            ..test_plan()
        };
        assert_eq!(
            plan.launch_command(),
            "nohup python3 /opt/app/app.py > /opt/app/log.txt 2>&1 &"
        );
    }

    #[tokio::test]
    async fn test_deploy_runs_steps_in_order() {
        let cloud = Arc::new(FakeCloudControl::default());
        let executor =
            DeploymentExecutor::new(get_logger(), cloud.clone(), test_plan(), DeployMode::FailFast);

        executor.deploy(&running("i1"), "us-central1-a").await.unwrap();

        assert_eq!(
            cloud.calls(),
            vec![
                "ssh i1 mkdir -p ~/app".to_string(),
                "scp /srv/payload/app.py i1:~/app/app.py".to_string(),
                format!("ssh i1 {}", test_plan().launch_command()),
            ]
        );
    }

    #[tokio::test]
    async fn test_deploy_fail_fast() {
        let cloud = Arc::new(FakeCloudControl {
            failing_commands: vec!["/srv/payload".into()],
            ..Default::default()
        });
        let executor =
            DeploymentExecutor::new(get_logger(), cloud.clone(), test_plan(), DeployMode::FailFast);

        let failure = executor
            .deploy(&running("i1"), "us-central1-a")
            .await
            .unwrap_err();

        assert_eq!(failure.step, DeploymentStep::TransferPayload);
        assert!(failure.output.contains("scp"));
        assert_eq!(cloud.count("ssh"), 1);
    }

    #[tokio::test]
    async fn test_deploy_best_effort() {
        let cloud = Arc::new(FakeCloudControl {
            failing_commands: vec!["mkdir".into()],
            ..Default::default()
        });
        let executor = DeploymentExecutor::new(
            get_logger(),
            cloud.clone(),
            test_plan(),
            DeployMode::BestEffort,
        );

        assert!(executor.deploy(&running("i1"), "us-central1-a").await.is_ok());
        assert_eq!(cloud.calls().len(), 3);
    }
}
