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

use chrono::{DateTime, Utc};
use network::Ipv4Range;
use wire::api::AllocationRecord;

/// Immutable pool configuration the store is built with.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub range: Ipv4Range,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
}

/// One live binding of an address to a VPS.
///
/// `lease_expires` is advisory; the authoritative expiry lives in the
/// external DHCP server's lease file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub vps_id: String,
    pub organization_id: String,
    pub ip_address: Ipv4Addr,
    pub mac_address: String,
    pub allocated_at: DateTime<Utc>,
    pub lease_expires: DateTime<Utc>,
    pub is_public: bool,
}

impl From<&Allocation> for AllocationRecord {
    fn from(a: &Allocation) -> Self {
        AllocationRecord {
            vps_id: a.vps_id.clone(),
            organization_id: a.organization_id.clone(),
            ip_address: a.ip_address.to_string(),
            mac_address: a.mac_address.clone(),
            allocated_at: a.allocated_at,
            lease_expires: a.lease_expires,
            is_public: a.is_public,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AllocateParams {
    pub vps_id: String,
    pub organization_id: String,
    /// Raw MAC as received; the store normalizes and validates it.
    pub mac_address: String,
    pub preferred_ip: Option<Ipv4Addr>,
    pub allow_public: bool,
}

/// Result of a release. Releasing an absent binding is a success, not an
/// error; callers that care can still tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    Removed(Allocation),
    NotPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub pool_size: u64,
    pub allocated: u64,
}

/// What a reconciliation run changed, with enough detail for the caller to
/// mirror the changes into the packet filter.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub added: Vec<Allocation>,
    pub removed: Vec<Allocation>,
    /// Rows where the VPS stayed but its binding changed: (old, new).
    pub rebound: Vec<(Allocation, Allocation)>,
    pub errors: Vec<String>,
}

impl SyncOutcome {
    pub fn added_count(&self) -> u32 {
        self.added.len() as u32
    }

    pub fn removed_count(&self) -> u32 {
        self.removed.len() as u32
    }
}
