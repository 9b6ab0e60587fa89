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
use snafu::ResultExt;
use std::process::Stdio;
use tokio::process::Command;

/// Run an external command to completion, returning its stdout.
///
/// A non-zero exit status is an error carrying the command's stderr.
pub(crate) async fn run_command(program: &str, args: &[String]) -> Result<String, Error> {
    let command = render_command(program, args);

    // Dropping the future (eg. a cancelled migration) kills the child.
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .context(CommandSpawn {
            command: command.clone(),
        })?;

    if !output.status.success() {
        return CommandFailed {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .fail();
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Render a command line for logging and error messages.
pub(crate) fn render_command(program: &str, args: &[String]) -> String {
    args.iter()
        .fold(String::from(program), |mut command_line, arg| {
            command_line.push(' ');
            if arg.contains(char::is_whitespace) {
                command_line.push_str(&format!("{:?}", arg));
            } else {
                command_line.push_str(arg);
            }
            command_line
        })
}
