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

//! Low-level address handling shared by the gateway crates.
//!
//! Everything that ends up in a command invocation or a hosts file goes
//! through the validators in here first; they are the only sanitization
//! barrier in front of the packet-filter and neighbor-table tooling.

pub mod ipv4;
pub mod mac;
pub mod range;

pub use ipv4::{default_gateway_for, ip_to_u32, parse_ipv4, u32_to_ip};
pub use mac::normalize_mac;
pub use range::Ipv4Range;

/// Prefix length used for public allocations when the caller does not
/// specify one.
pub const DEFAULT_PUBLIC_PREFIX_LEN: u8 = 24;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("IP address {0} is not valid")]
    InvalidIpv4(String),
    #[error("MAC address {0} is not valid")]
    InvalidMac(String),
    #[error("IP range start {start} is above range end {end}")]
    InvalidRange { start: String, end: String },
}
