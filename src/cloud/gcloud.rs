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

use crate::cloud::common::run_command;
use crate::cloud::{CloudControl, InstanceGroup, InstanceRecord, InstanceStatus};
use crate::error::*;
use async_trait::async_trait;
use serde::Deserialize;
use snafu::ResultExt;

/// Google Cloud control plane, driven through the gcloud command line tool.
pub struct GcloudCloudControl {
    binary: String,
    /// Project of the instances reached over ssh and scp.
    project: String,
}

/// An entry of `gcloud compute instance-groups managed list-instances --format=json`.
#[derive(Debug, Deserialize)]
struct ManagedInstance {
    /// Full resource url, the instance name is the last path segment.
    instance: String,
    #[serde(rename = "instanceStatus")]
    instance_status: Option<String>,
}

impl GcloudCloudControl {
    pub fn new(binary: &str, project: &str) -> Self {
        Self {
            binary: binary.into(),
            project: project.into(),
        }
    }

    async fn gcloud(&self, mut args: Vec<String>, project: &str) -> Result<String, Error> {
        args.push(format!("--project={}", project));
        run_command(&self.binary, &args).await
    }
}

#[async_trait]
impl CloudControl for GcloudCloudControl {
    async fn resize_group(&self, group: &InstanceGroup, size: usize) -> Result<(), Error> {
        let args = vec![
            "compute".into(),
            "instance-groups".into(),
            "managed".into(),
            "resize".into(),
            group.name.clone(),
            format!("--size={}", size),
            format!("--zone={}", group.zone),
        ];
        self.gcloud(args, &group.project).await?;
        Ok(())
    }

    async fn list_instances(&self, group: &InstanceGroup) -> Result<Vec<InstanceRecord>, Error> {
        let args = vec![
            "compute".into(),
            "instance-groups".into(),
            "managed".into(),
            "list-instances".into(),
            group.name.clone(),
            format!("--zone={}", group.zone),
            "--format=json".into(),
        ];
        let listing = self.gcloud(args, &group.project).await?;
        parse_instance_listing(&listing)
    }

    async fn run_remote_command(
        &self,
        instance: &str,
        zone: &str,
        command: &str,
    ) -> Result<String, Error> {
        let args = vec![
            "compute".into(),
            "ssh".into(),
            instance.into(),
            format!("--zone={}", zone),
            format!("--command={}", command),
        ];
        self.gcloud(args, &self.project).await
    }

    async fn copy_file(
        &self,
        local_path: &str,
        instance: &str,
        remote_path: &str,
        zone: &str,
    ) -> Result<String, Error> {
        let args = vec![
            "compute".into(),
            "scp".into(),
            local_path.into(),
            format!("{}:{}", instance, remote_path),
            format!("--zone={}", zone),
        ];
        self.gcloud(args, &self.project).await
    }
}

/// Convert a managed instance listing into records, preserving listing order.
pub(crate) fn parse_instance_listing(listing: &str) -> Result<Vec<InstanceRecord>, Error> {
    let instances: Vec<ManagedInstance> =
        serde_json::from_str(listing).context(JsonSerialization {})?;
    Ok(instances
        .into_iter()
        .map(|instance| InstanceRecord {
            name: instance
                .instance
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
            status: instance
                .instance_status
                .as_deref()
                .map(InstanceStatus::from)
                .unwrap_or_else(|| InstanceStatus::Other("UNKNOWN".into())),
        })
        .collect())
}
