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

//! Link-layer enforcement for public allocations.
//!
//! For every public `(ip, mac)` binding the gateway installs a pair of
//! FORWARD rules (accept traffic from the address when the source MAC
//! matches, drop it otherwise) and a static neighbor entry on the uplink
//! interface. Private pool addresses never pass through here; their L2
//! segment is trusted and the DHCP hosts file enforces the binding.
//!
//! Addresses and MACs are re-validated at every entry point before they are
//! composed into command arguments; that validation is the only barrier in
//! front of the system tooling, so nothing may bypass it.

pub mod cmd;
mod neighbor;
mod rules;
pub mod uplink;

use std::sync::Arc;

use cmd::{CmdError, CommandRunner};

#[derive(thiserror::Error, Debug)]
pub enum EnforcerError {
    #[error(transparent)]
    InvalidInput(#[from] network::AddressError),
    #[error("packet filter {action} for {ip}: {detail}")]
    Filter {
        action: &'static str,
        ip: String,
        detail: String,
    },
    #[error("neighbor entry for {ip}: {detail}")]
    Neighbor { ip: String, detail: String },
    #[error(transparent)]
    Command(#[from] CmdError),
}

pub struct Enforcer {
    runner: Arc<dyn CommandRunner>,
    uplink: String,
}

impl Enforcer {
    pub fn new(runner: Arc<dyn CommandRunner>, uplink: String) -> Self {
        Self { runner, uplink }
    }

    pub fn uplink(&self) -> &str {
        &self.uplink
    }

    /// Bind `ip` to `mac` on the uplink: ACCEPT-from-mac and DROP-otherwise
    /// filter rules plus a permanent neighbor entry. Safe to call again for
    /// an already-secured binding.
    pub async fn secure_public_ip(
        &self,
        ip: &str,
        mac: &str,
        vps_id: &str,
    ) -> Result<(), EnforcerError> {
        let ip = network::parse_ipv4(ip)?.to_string();
        let mac = network::normalize_mac(mac)?;

        tracing::info!(vps_id, %ip, %mac, "securing public IP");

        // The ACCEPT rule must precede the DROP rule; appending in this
        // order satisfies that.
        rules::ensure_accept_rule(self.runner.as_ref(), &ip, &mac).await?;
        rules::ensure_drop_rule(self.runner.as_ref(), &ip).await?;
        neighbor::ensure_entry(self.runner.as_ref(), &self.uplink, &ip, &mac).await?;
        neighbor::probe_route(self.runner.as_ref(), &ip).await;
        Ok(())
    }

    /// Undo [`Self::secure_public_ip`]. Missing rules or entries are
    /// success. An empty `mac` removes whatever rules carry the address's
    /// comment tag.
    pub async fn remove_public_ip(&self, ip: &str, mac: &str) -> Result<(), EnforcerError> {
        let ip = network::parse_ipv4(ip)?.to_string();

        if mac.is_empty() {
            rules::delete_rules_by_tag(self.runner.as_ref(), &ip).await?;
        } else {
            let mac = network::normalize_mac(mac)?;
            rules::delete_accept_rule(self.runner.as_ref(), &ip, &mac).await?;
            rules::delete_drop_rule(self.runner.as_ref(), &ip).await?;
        }
        neighbor::delete_entry(self.runner.as_ref(), &self.uplink, &ip).await?;

        tracing::info!(%ip, "removed public IP enforcement");
        Ok(())
    }
}
