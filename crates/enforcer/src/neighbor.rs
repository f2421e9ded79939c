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

//! Static neighbor entries on the uplink interface, pinning each public
//! address to its MAC so ARP replies from other tenants are ignored.

use crate::EnforcerError;
use crate::cmd::CommandRunner;

pub const IP_BIN: &str = "ip";

/// Install a permanent `ip -> mac` mapping. A stale entry with a different
/// MAC is removed first.
pub async fn ensure_entry(
    runner: &dyn CommandRunner,
    uplink: &str,
    ip: &str,
    mac: &str,
) -> Result<(), EnforcerError> {
    let current = runner
        .run(IP_BIN, &["neigh", "show", ip, "dev", uplink])
        .await?;
    if current.success() && !current.stdout.is_empty() {
        if current.stdout.contains(mac) {
            tracing::debug!(ip, mac, "neighbor entry already present");
            return Ok(());
        }
        tracing::info!(ip, "replacing stale neighbor entry");
        let deleted = runner
            .run(IP_BIN, &["neigh", "del", ip, "dev", uplink])
            .await?;
        if !deleted.success() {
            tracing::debug!(ip, detail = deleted.error_details(), "stale neighbor delete failed");
        }
    }

    let replaced = runner
        .run(
            IP_BIN,
            &[
                "neigh",
                "replace",
                ip,
                "lladdr",
                mac,
                "nud",
                "permanent",
                "dev",
                uplink,
            ],
        )
        .await?;
    if !replaced.success() {
        return Err(EnforcerError::Neighbor {
            ip: ip.to_string(),
            detail: replaced.error_details().to_string(),
        });
    }
    Ok(())
}

/// Drop the static entry. Absence is success.
pub async fn delete_entry(
    runner: &dyn CommandRunner,
    uplink: &str,
    ip: &str,
) -> Result<(), EnforcerError> {
    let output = runner
        .run(IP_BIN, &["neigh", "del", ip, "dev", uplink])
        .await?;
    if !output.success() {
        tracing::debug!(ip, detail = output.error_details(), "neighbor entry was not present");
    }
    Ok(())
}

/// Check that the kernel can route to the address. The upstream router
/// usually owns this, so a miss is only logged.
pub async fn probe_route(runner: &dyn CommandRunner, ip: &str) {
    match runner.run(IP_BIN, &["route", "get", ip]).await {
        Ok(output) if output.success() => {}
        Ok(output) => {
            tracing::warn!(ip, detail = output.error_details(), "no route to public IP");
        }
        Err(error) => {
            tracing::warn!(ip, %error, "route probe failed");
        }
    }
}
