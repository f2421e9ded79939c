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

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use allocation::PoolConfig;
use duration_str::deserialize_duration;
use network::Ipv4Range;
use serde::{Deserialize, Serialize, Serializer};

/// Configuration for the gateway. Fields are documented as comments in the
/// output of [`Config::into_annotated_config_file`]. The API secret is
/// deliberately absent: it only ever arrives through the CLI or the
/// `GATEWAY_API_SECRET` environment variable.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "Defaults::listen_address")]
    pub listen_address: SocketAddr,
    #[serde(default = "Defaults::metrics_address")]
    pub metrics_address: SocketAddr,
    #[serde(default = "Defaults::pool_start")]
    pub pool_start: Ipv4Addr,
    #[serde(default = "Defaults::pool_end")]
    pub pool_end: Ipv4Addr,
    #[serde(default = "Defaults::subnet_mask")]
    pub subnet_mask: Ipv4Addr,
    #[serde(default = "Defaults::gateway_ip")]
    pub gateway_ip: Ipv4Addr,
    #[serde(default = "Defaults::dns_servers")]
    pub dns_servers: Vec<Ipv4Addr>,
    /// Interface carrying default-route traffic. Auto-detected when unset.
    #[serde(default)]
    pub uplink_interface: Option<String>,
    #[serde(default = "Defaults::hosts_file_path")]
    pub hosts_file_path: PathBuf,
    #[serde(default = "Defaults::lease_file_path")]
    pub lease_file_path: PathBuf,
    #[serde(default = "Defaults::reload_command")]
    pub reload_command: Vec<String>,
    #[serde(
        default = "Defaults::lease_poll_interval",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub lease_poll_interval: Duration,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = std::fs::read_to_string(path).map_err(|error| ConfigError::CouldNotRead {
            path: path.to_string_lossy().to_string(),
            error,
        })?;
        toml::from_str::<Self>(&cfg).map_err(|error| ConfigError::InvalidToml {
            path: path.to_string_lossy().to_string(),
            error,
        })
    }

    /// Validate the pool fields into the store's configuration.
    pub fn pool_config(&self) -> Result<PoolConfig, ConfigError> {
        let range = Ipv4Range::new(self.pool_start, self.pool_end)
            .map_err(|error| ConfigError::InvalidPool(error.to_string()))?;
        Ok(PoolConfig {
            range,
            subnet_mask: self.subnet_mask,
            gateway: self.gateway_ip,
            dns_servers: self.dns_servers.clone(),
        })
    }

    pub fn into_annotated_config_file(self) -> String {
        let Self {
            listen_address,
            metrics_address,
            pool_start,
            pool_end,
            subnet_mask,
            gateway_ip,
            dns_servers,
            uplink_interface: _,
            hosts_file_path,
            lease_file_path,
            reload_command,
            lease_poll_interval,
        } = self;
        let listen_address = listen_address.to_string();
        let metrics_address = metrics_address.to_string();
        let dns_servers = dns_servers
            .iter()
            .map(|ip| format!("\"{ip}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let reload_command = reload_command
            .iter()
            .map(|arg| format!("{arg:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        let lease_poll_interval = format!("{}s", lease_poll_interval.as_secs());

        format!(
            r#"
#####
## This is a default config file for vps-gateway. Everything in this file is optional: Any
## non-comment line in this file simply represents default values. Commented lines with a single `#`
## represent examples for optional configuration which is not part of the default config.
#####

## What address to listen on for API and stream traffic.
listen_address = {listen_address:?}

## Address to listen on for prometheus metrics requests (HTTP)
metrics_address = {metrics_address:?}

## DHCP pool range, both ends included. Private allocations are drawn from
## here; anything outside the range is a public (routed) address.
pool_start = "{pool_start}"
pool_end = "{pool_end}"

## Network parameters handed out with private allocations.
subnet_mask = "{subnet_mask}"
gateway_ip = "{gateway_ip}"
dns_servers = [{dns_servers}]

## Interface that carries default-route traffic. Leave unset to auto-detect
## from the routing table at startup.
# uplink_interface = "eth0"

## Static hosts file consumed by the DHCP server (written by the gateway).
hosts_file_path = {hosts_file_path:?}

## Lease file produced by the DHCP server (read by the gateway).
lease_file_path = {lease_file_path:?}

## Command that tells the DHCP server to re-read the hosts file. Arguments
## are passed positionally, no shell involved.
reload_command = [{reload_command}]

## How often to check the lease file for changes.
lease_poll_interval = {lease_poll_interval:?}

## The API secret is not configured here. Set GATEWAY_API_SECRET in the
## environment (or pass --api-secret); the gateway refuses to start
## without it.
"#
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: Defaults::listen_address(),
            metrics_address: Defaults::metrics_address(),
            pool_start: Defaults::pool_start(),
            pool_end: Defaults::pool_end(),
            subnet_mask: Defaults::subnet_mask(),
            gateway_ip: Defaults::gateway_ip(),
            dns_servers: Defaults::dns_servers(),
            uplink_interface: None,
            hosts_file_path: Defaults::hosts_file_path(),
            lease_file_path: Defaults::lease_file_path(),
            reload_command: Defaults::reload_command(),
            lease_poll_interval: Defaults::lease_poll_interval(),
        }
    }
}

pub struct Defaults;

impl Defaults {
    pub fn listen_address() -> SocketAddr {
        "0.0.0.0:7080"
            .parse()
            .expect("BUG: default listen_address is invalid")
    }

    pub fn metrics_address() -> SocketAddr {
        "0.0.0.0:9090"
            .parse()
            .expect("BUG: default metrics_address is invalid")
    }

    pub fn pool_start() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 10)
    }

    pub fn pool_end() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 250)
    }

    pub fn subnet_mask() -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    pub fn gateway_ip() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 1)
    }

    pub fn dns_servers() -> Vec<Ipv4Addr> {
        vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]
    }

    pub fn hosts_file_path() -> PathBuf {
        "/var/lib/vps-gateway/dhcp-hosts".into()
    }

    pub fn lease_file_path() -> PathBuf {
        "/var/lib/misc/dnsmasq.leases".into()
    }

    pub fn reload_command() -> Vec<String> {
        vec![
            "systemctl".to_string(),
            "reload".to_string(),
            "dnsmasq".to_string(),
        ]
    }

    pub fn lease_poll_interval() -> Duration {
        Duration::from_secs(60)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file at {path}: {error}")]
    CouldNotRead { path: String, error: std::io::Error },
    #[error("TOML error reading config file at {path}: {error}")]
    InvalidToml {
        path: String,
        error: toml::de::Error,
    },
    #[error("Invalid DHCP pool: {0}")]
    InvalidPool(String),
}

fn serialize_duration<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}s", d.as_secs()))
}
