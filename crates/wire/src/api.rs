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

//! Request and response bodies for the unary API endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateIpRequest {
    #[serde(rename = "vpsID")]
    pub vps_id: String,
    #[serde(rename = "organizationID")]
    pub organization_id: String,
    pub mac_address: String,
    #[serde(default)]
    pub preferred_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateIpResponse {
    pub ip_address: String,
    pub subnet_mask: String,
    pub gateway: String,
    pub dns_servers: Vec<String>,
    pub lease_expires: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatePublicIpRequest {
    #[serde(rename = "vpsID")]
    pub vps_id: String,
    #[serde(rename = "organizationID")]
    pub organization_id: String,
    pub mac_address: String,
    pub ip_address: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub netmask_prefix: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatePublicIpResponse {
    pub ip_address: String,
    pub gateway: String,
    pub netmask_prefix: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseIpRequest {
    #[serde(rename = "vpsID")]
    pub vps_id: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleasePublicIpRequest {
    #[serde(rename = "vpsID")]
    pub vps_id: String,
    pub ip_address: String,
    #[serde(default)]
    pub mac_address: String,
}

/// `released` is false when the binding was already gone; both cases are
/// success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseIpResponse {
    pub released: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListIpsRequest {
    #[serde(rename = "organizationID", default)]
    pub organization_id: Option<String>,
    #[serde(rename = "vpsID", default)]
    pub vps_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListIpsResponse {
    pub allocations: Vec<AllocationRecord>,
}

/// One live allocation, as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRecord {
    #[serde(rename = "vpsID")]
    pub vps_id: String,
    #[serde(rename = "organizationID")]
    pub organization_id: String,
    pub ip_address: String,
    pub mac_address: String,
    pub allocated_at: DateTime<Utc>,
    pub lease_expires: DateTime<Utc>,
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub mac_address: String,
    pub ip_address: String,
    pub hostname: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLeasesResponse {
    pub leases: Vec<LeaseRecord>,
}

/// One row of the controller's desired state, pushed via SyncAllocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredAllocation {
    #[serde(rename = "vpsID")]
    pub vps_id: String,
    #[serde(rename = "organizationID")]
    pub organization_id: String,
    pub ip_address: String,
    pub mac_address: String,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAllocationsRequest {
    pub allocations: Vec<DesiredAllocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub added: u32,
    pub removed: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfoResponse {
    pub pool_start: String,
    pub pool_end: String,
    pub subnet_mask: String,
    pub gateway: String,
    pub dns_servers: Vec<String>,
    pub uplink_interface: String,
    pub total_ips: u64,
    pub allocated_ips: u64,
    pub dhcp_status: String,
    pub ssh_active_sessions: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_fields_keep_go_casing() {
        let req = AllocateIpRequest {
            vps_id: "vps-1".to_string(),
            organization_id: "org-a".to_string(),
            mac_address: "aa:bb:cc:dd:ee:01".to_string(),
            preferred_ip: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["vpsID"], "vps-1");
        assert_eq!(json["organizationID"], "org-a");
        assert_eq!(json["macAddress"], "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_preferred_ip_is_optional() {
        let req: AllocateIpRequest = serde_json::from_str(
            r#"{"vpsID":"vps-1","organizationID":"org-a","macAddress":"aa:bb:cc:dd:ee:01"}"#,
        )
        .unwrap();
        assert_eq!(req.preferred_ip, None);
    }

    #[test]
    fn test_desired_allocation_round_trip() {
        let desired = DesiredAllocation {
            vps_id: "vps-4".to_string(),
            organization_id: "org-b".to_string(),
            ip_address: "203.0.113.9".to_string(),
            mac_address: "aa:bb:cc:dd:ee:04".to_string(),
            is_public: true,
        };
        let json = serde_json::to_string(&desired).unwrap();
        let back: DesiredAllocation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desired);
    }
}
