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

use snafu::Snafu;
use std::path::PathBuf;

/// Cloudburst errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    /// General HTTP client errors.
    #[snafu(display("http client error: {}", source))]
    HttpClient { source: reqwest::Error },

    /// JSON serialization errors.
    #[snafu(display("json serialization error: {}", source))]
    JsonSerialization { source: serde_json::Error },

    /// An external command could not be started.
    #[snafu(display("failed to spawn `{}`: {}", command, source))]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    /// An external command exited unsuccessfully.
    #[snafu(display("`{}` exited with {}: {}", command, status, stderr))]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The cpu accounting snapshot could not be read or made no sense.
    #[snafu(display("cpu accounting error: {}", reason))]
    ProcStat { reason: String },

    /// The monitoring backend returned nothing usable.
    #[snafu(display("metric unavailable: {}", reason))]
    MetricUnavailable { reason: String },

    /// Reading or writing the migration state file failed.
    #[snafu(display("state file {}: {}", path.display(), source))]
    StateFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid or missing configuration.
    #[snafu(display("configuration error: {}", reason))]
    Configuration { reason: String },
}
