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
use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};

use crate::DhcpFileError;

/// A live dynamic lease, projected from the DHCP server's lease file.
/// Never stored; the file is re-parsed on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub mac_address: String,
    pub ip_address: Ipv4Addr,
    pub hostname: String,
    pub expires_at: DateTime<Utc>,
}

/// Parse the lease file. The format is line oriented:
/// `<expires-epoch> <mac> <ip> <hostname> <client-id>`.
/// Expired and malformed lines are dropped (the latter with a warning).
pub fn parse(contents: &str, now: DateTime<Utc>) -> Vec<Lease> {
    let mut leases = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line, now) {
            Ok(Some(lease)) => leases.push(lease),
            Ok(None) => {} // expired
            Err(reason) => {
                tracing::warn!(lineno = lineno + 1, reason, "skipping bad lease line");
            }
        }
    }
    leases
}

pub fn read_file(path: &Path, now: DateTime<Utc>) -> Result<Vec<Lease>, DhcpFileError> {
    let contents = std::fs::read_to_string(path).map_err(|error| DhcpFileError::Io {
        what: "reading lease file",
        error,
    })?;
    Ok(parse(&contents, now))
}

fn parse_line(line: &str, now: DateTime<Utc>) -> Result<Option<Lease>, &'static str> {
    let mut fields = line.split_whitespace();
    let expires = fields.next().ok_or("missing expiry")?;
    let mac = fields.next().ok_or("missing mac")?;
    let ip = fields.next().ok_or("missing ip")?;
    let hostname = fields.next().ok_or("missing hostname")?;
    let _client_id = fields.next().ok_or("missing client id")?;

    let expires: i64 = expires.parse().map_err(|_| "expiry is not an epoch")?;
    let expires_at = Utc
        .timestamp_opt(expires, 0)
        .single()
        .ok_or("expiry out of range")?;
    if expires_at <= now {
        return Ok(None);
    }

    let mac_address = network::normalize_mac(mac).map_err(|_| "bad mac")?;
    let ip_address = network::parse_ipv4(ip).map_err(|_| "bad ip")?;

    Ok(Some(Lease {
        mac_address,
        ip_address,
        hostname: hostname.to_string(),
        expires_at,
    }))
}
