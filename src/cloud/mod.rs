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
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

mod common;
pub mod gcloud;

/// A managed instance group and where it lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanceGroup {
    pub name: String,
    pub zone: String,
    pub project: String,
}

/// Lifecycle state of an instance, as reported by the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Other(String),
}

impl From<&str> for InstanceStatus {
    fn from(status: &str) -> Self {
        match status {
            "PROVISIONING" => InstanceStatus::Provisioning,
            "RUNNING" => InstanceStatus::Running,
            other => InstanceStatus::Other(other.into()),
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Provisioning => f.write_str("PROVISIONING"),
            InstanceStatus::Running => f.write_str("RUNNING"),
            InstanceStatus::Other(status) => f.write_str(status),
        }
    }
}

/// An instance belonging to a group, in provider listing order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRecord {
    pub name: String,
    pub status: InstanceStatus,
}

impl InstanceRecord {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

/// Cloud provider control plane operations.
#[async_trait]
pub trait CloudControl: Send + Sync {
    /// Set the target size of an instance group.
    async fn resize_group(&self, group: &InstanceGroup, size: usize) -> Result<(), Error>;
    /// List every instance in a group.
    async fn list_instances(&self, group: &InstanceGroup) -> Result<Vec<InstanceRecord>, Error>;
    /// Run a shell command on an instance, returning its output.
    async fn run_remote_command(
        &self,
        instance: &str,
        zone: &str,
        command: &str,
    ) -> Result<String, Error>;
    /// Copy a local file onto an instance.
    async fn copy_file(
        &self,
        local_path: &str,
        instance: &str,
        remote_path: &str,
        zone: &str,
    ) -> Result<String, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_status() {
        assert_eq!(InstanceStatus::from("RUNNING"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::from("PROVISIONING"), InstanceStatus::Provisioning);
        assert_eq!(
            InstanceStatus::from("STAGING"),
            InstanceStatus::Other("STAGING".into())
        );
        assert_eq!(InstanceStatus::Other("STOPPING".into()).to_string(), "STOPPING");
    }
}
