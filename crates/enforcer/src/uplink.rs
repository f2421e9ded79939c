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

//! Uplink interface discovery. Configuration wins; otherwise the
//! default-route interface is resolved once at startup and cached by the
//! caller. No uplink means the enforcer cannot start, and neither can the
//! process.

use crate::cmd::{CmdError, CommandRunner};
use crate::neighbor::IP_BIN;

#[derive(thiserror::Error, Debug)]
pub enum UplinkError {
    #[error("no uplink interface configured and no default route found")]
    NotFound,
    #[error("error inspecting routes: {0}")]
    Command(#[from] CmdError),
}

pub async fn detect(
    runner: &dyn CommandRunner,
    configured: Option<&str>,
) -> Result<String, UplinkError> {
    if let Some(name) = configured {
        if !name.is_empty() {
            tracing::info!(uplink = name, "using configured uplink interface");
            return Ok(name.to_string());
        }
    }

    let output = runner
        .run(IP_BIN, &["-4", "route", "show", "default"])
        .await?;
    if !output.success() {
        return Err(UplinkError::NotFound);
    }
    match parse_default_route(&output.stdout) {
        Some(dev) => {
            tracing::info!(uplink = %dev, "auto-detected uplink interface");
            Ok(dev)
        }
        None => Err(UplinkError::NotFound),
    }
}

/// Pull the `dev` token out of `ip -4 route show default` output, e.g.
/// `default via 10.0.0.1 dev eth0 proto dhcp metric 100`.
fn parse_default_route(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.starts_with("default"))?;
    let mut tokens = line.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "dev" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}
