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

use once_cell::sync::Lazy;
use regex::Regex;

use crate::AddressError;

static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]{1,3}\.){3}[0-9]{1,3}$").expect("BUG: IPv4 regex is invalid")
});

/// Parse an IPv4 address in dotted-quad form.
///
/// The shape check runs before the structural parse so that anything which
/// is not four dot-separated decimal runs is rejected up front, including
/// strings the std parser would otherwise tolerate.
pub fn parse_ipv4(value: &str) -> Result<Ipv4Addr, AddressError> {
    if !IPV4_RE.is_match(value) {
        return Err(AddressError::InvalidIpv4(value.to_string()));
    }
    value
        .parse::<Ipv4Addr>()
        .map_err(|_| AddressError::InvalidIpv4(value.to_string()))
}

/// The conventional gateway for a public address: same /24, last octet 1.
pub fn default_gateway_for(ip: Ipv4Addr) -> Ipv4Addr {
    let o = ip.octets();
    Ipv4Addr::new(o[0], o[1], o[2], 1)
}

/// Numeric form used for range comparison and ordering.
pub fn ip_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

pub fn u32_to_ip(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}
