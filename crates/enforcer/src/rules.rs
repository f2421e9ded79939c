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

//! FORWARD-chain rule management. All rules carry a `vps-gateway:<ip>`
//! comment so removal can find them even without the MAC, and so collisions
//! with other tooling are distinguishable.
//!
//! Inputs reaching this module have already passed the address validators.

use crate::EnforcerError;
use crate::cmd::CommandRunner;

pub const IPTABLES_BIN: &str = "iptables";
const CHAIN: &str = "FORWARD";

fn comment_tag(ip: &str) -> String {
    format!("vps-gateway:{ip}")
}

fn accept_rule(ip: &str, mac: &str) -> Vec<String> {
    vec![
        "-s".into(),
        ip.into(),
        "-m".into(),
        "mac".into(),
        "--mac-source".into(),
        mac.into(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        comment_tag(ip),
        "-j".into(),
        "ACCEPT".into(),
    ]
}

fn drop_rule(ip: &str) -> Vec<String> {
    vec![
        "-s".into(),
        ip.into(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        comment_tag(ip),
        "-j".into(),
        "DROP".into(),
    ]
}

pub async fn ensure_accept_rule(
    runner: &dyn CommandRunner,
    ip: &str,
    mac: &str,
) -> Result<(), EnforcerError> {
    ensure_rule(runner, ip, "accept", &accept_rule(ip, mac)).await
}

pub async fn ensure_drop_rule(runner: &dyn CommandRunner, ip: &str) -> Result<(), EnforcerError> {
    ensure_rule(runner, ip, "drop", &drop_rule(ip)).await
}

pub async fn delete_accept_rule(
    runner: &dyn CommandRunner,
    ip: &str,
    mac: &str,
) -> Result<(), EnforcerError> {
    delete_rule(runner, ip, &accept_rule(ip, mac)).await
}

pub async fn delete_drop_rule(runner: &dyn CommandRunner, ip: &str) -> Result<(), EnforcerError> {
    delete_rule(runner, ip, &drop_rule(ip)).await
}

/// Append the rule unless an identical one is already present.
async fn ensure_rule(
    runner: &dyn CommandRunner,
    ip: &str,
    action: &'static str,
    rule: &[String],
) -> Result<(), EnforcerError> {
    if rule_exists(runner, rule).await? {
        tracing::debug!(ip, action, "filter rule already present");
        return Ok(());
    }

    let args = rule_args("-A", rule);
    let output = runner.run(IPTABLES_BIN, &args).await?;
    if !output.success() {
        return Err(EnforcerError::Filter {
            action,
            ip: ip.to_string(),
            detail: output.error_details().to_string(),
        });
    }
    Ok(())
}

async fn rule_exists(runner: &dyn CommandRunner, rule: &[String]) -> Result<bool, EnforcerError> {
    let args = rule_args("-C", rule);
    let output = runner.run(IPTABLES_BIN, &args).await?;
    Ok(output.success())
}

/// Delete a fully-specified rule. A rule that is not there is success.
async fn delete_rule(
    runner: &dyn CommandRunner,
    ip: &str,
    rule: &[String],
) -> Result<(), EnforcerError> {
    let args = rule_args("-D", rule);
    let output = runner.run(IPTABLES_BIN, &args).await?;
    if !output.success() {
        tracing::debug!(ip, detail = output.error_details(), "filter rule was not present");
    }
    Ok(())
}

/// Remove every rule carrying the address's comment tag. Used when the
/// caller no longer knows the MAC the rules were installed with.
pub async fn delete_rules_by_tag(
    runner: &dyn CommandRunner,
    ip: &str,
) -> Result<(), EnforcerError> {
    let output = runner.run(IPTABLES_BIN, &["-S", CHAIN]).await?;
    if !output.success() {
        return Err(EnforcerError::Filter {
            action: "list",
            ip: ip.to_string(),
            detail: output.error_details().to_string(),
        });
    }

    let tag = comment_tag(ip);
    for line in output.stdout.lines() {
        let Some(spec) = line.strip_prefix("-A ") else {
            continue;
        };
        // Our tags contain no whitespace, so a token match is exact.
        if !spec.split_whitespace().any(|tok| tok == tag) {
            continue;
        }
        let mut args = vec!["-D"];
        args.extend(spec.split_whitespace());
        let deleted = runner.run(IPTABLES_BIN, &args).await?;
        if !deleted.success() {
            tracing::debug!(ip, rule = spec, "tagged rule vanished before delete");
        }
    }
    Ok(())
}

fn rule_args<'a>(op: &'a str, rule: &'a [String]) -> Vec<&'a str> {
    let mut args = vec![op, CHAIN];
    args.extend(rule.iter().map(String::as_str));
    args
}
