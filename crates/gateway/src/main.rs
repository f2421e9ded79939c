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
use std::net::AddrParseError;
use std::path::PathBuf;

use clap::Parser;
use gateway::config::{Config, ConfigError};
use gateway::shutdown::ShutdownHandle;
use tracing::metadata::LevelFilter;

#[tokio::main(flavor = "multi_thread")]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    setup_logging(&cli);

    match cli.command {
        Command::Run(run_command) => {
            let api_secret = run_command.api_secret.clone();
            let config: Config = (*run_command).try_into()?;
            let spawn_handle = gateway::spawn(config, api_secret).await?;
            // Let the service run forever by awaiting the join handle,
            // while holding onto the shutdown handle.
            let (_shutdown_tx, join_handle) = spawn_handle.into_parts();
            join_handle.await.expect("vps-gateway task panicked");
        }
        Command::DefaultRunConfig => {
            print!("{}", Config::default().into_annotated_config_file())
        }
    }

    Ok(())
}

#[derive(clap::Parser, Debug)]
struct Cli {
    #[clap(long, short, help = "Turn on debug loggging (same as RUST_LOG=debug)")]
    debug: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Parser, Debug)]
enum Command {
    Run(Box<RunCommand>),
    #[clap(about = "Output a default TOML config file for use with run -c")]
    DefaultRunConfig,
}

#[derive(clap::Parser, Debug)]
struct RunCommand {
    #[clap(long, short, help = "Path to TOML configuration file")]
    config: Option<PathBuf>,
    #[clap(
        long,
        short,
        help = "Address to listen on for API traffic, overriding configuration file"
    )]
    address: Option<String>,
    #[clap(
        long,
        short,
        help = "Address to listen on for prometheus metrics requests (HTTP), overriding configuration file"
    )]
    metrics_address: Option<String>,
    #[clap(
        long,
        env = "GATEWAY_API_SECRET",
        hide_env_values = true,
        help = "Shared secret controllers must present in the x-api-secret header. \
                Defaults to the GATEWAY_API_SECRET environment variable; startup aborts without it."
    )]
    api_secret: String,
    #[clap(
        long,
        short = 'u',
        help = "Uplink interface name, overriding configuration file and auto-detection"
    )]
    uplink_interface: Option<String>,
    #[clap(long, help = "Path of the DHCP hosts file to write")]
    hosts_file: Option<PathBuf>,
    #[clap(long, help = "Path of the DHCP lease file to read")]
    lease_file: Option<PathBuf>,
}

impl TryInto<Config> for RunCommand {
    type Error = CliError;

    // Load the config file, or the default, allowing CLI flags to override
    // the corresponding settings.
    fn try_into(self) -> Result<Config, Self::Error> {
        let mut config = if let Some(config_path) = self.config {
            Config::load(&config_path)?
        } else {
            Config::default()
        };

        if let Some(address) = self.address {
            config.listen_address =
                address
                    .parse()
                    .map_err(|error| CliError::InvalidListeningAddress {
                        addr: address,
                        error,
                    })?;
        }
        if let Some(metrics_address) = self.metrics_address {
            config.metrics_address =
                metrics_address
                    .parse()
                    .map_err(|error| CliError::InvalidMetricsAddress {
                        addr: metrics_address,
                        error,
                    })?;
        }
        if let Some(uplink_interface) = self.uplink_interface {
            config.uplink_interface = Some(uplink_interface);
        }
        if let Some(hosts_file) = self.hosts_file {
            config.hosts_file_path = hosts_file;
        }
        if let Some(lease_file) = self.lease_file {
            config.lease_file_path = lease_file;
        }

        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Invalid listening address {addr}: {error}")]
    InvalidListeningAddress { addr: String, error: AddrParseError },
    #[error("Invalid metrics address {addr}: {error}")]
    InvalidMetricsAddress { addr: String, error: AddrParseError },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

fn setup_logging(cli: &Cli) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = if cli.debug {
        Some(LevelFilter::DEBUG)
    } else {
        None
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::Layer::default().compact())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.map(Into::into).unwrap_or(LevelFilter::INFO.into()))
                .from_env_lossy(),
        )
        .try_init()
    {
        panic!(
            "Failed to initialize trace logging for vps-gateway. It's possible some earlier \
            code path has already set a global default log subscriber: {e}"
        );
    }
}
