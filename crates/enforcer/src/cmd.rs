/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */
use std::time::Duration;

use tokio::time::timeout;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whichever stream carries the complaint.
    pub fn error_details(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CmdError {
    #[error("error running '{program}': {error}")]
    Run { program: String, error: String },
    #[error("'{program}' produced output that is not valid UTF8")]
    OutputParse { program: String },
    #[error("'{program}' timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },
}

/// Seam between rule composition and the system tooling. The production
/// implementation spawns the process; tests record the argv instead.
///
/// A non-zero exit is not an error at this layer: probes like `iptables -C`
/// use the exit code as their answer, so callers inspect [`CmdOutput`].
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput, CmdError>;
}

#[derive(Debug, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput, CmdError> {
        let limit = self.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let output = timeout(
            limit,
            tokio::process::Command::new(program).args(args).output(),
        )
        .await
        .map_err(|_| CmdError::Timeout {
            program: program.to_string(),
            seconds: limit.as_secs(),
        })?
        .map_err(|error| CmdError::Run {
            program: program.to_string(),
            error: error.to_string(),
        })?;

        Ok(CmdOutput {
            stdout: String::from_utf8(output.stdout).map_err(|_| CmdError::OutputParse {
                program: program.to_string(),
            })?,
            stderr: String::from_utf8(output.stderr).map_err(|_| CmdError::OutputParse {
                program: program.to_string(),
            })?,
            exit_code: output.status.code().unwrap_or_default(),
        })
    }
}
