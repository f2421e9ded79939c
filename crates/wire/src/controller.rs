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

//! Messages on the per-controller registration stream.
//!
//! The same message set flows in both directions: controllers send
//! `register`, `heartbeat`, `sync_allocations`, `request` and `response`;
//! the gateway answers with `registered`, `heartbeat`, `sync_result`,
//! `response`, and issues its own `request` fan-outs.

use serde::{Deserialize, Serialize};

use crate::api::{DesiredAllocation, SyncResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    /// First message on every stream.
    Register {
        #[serde(rename = "gatewayID")]
        gateway_id: String,
        version: String,
    },
    Registered,
    Heartbeat,
    /// Fire-and-forget metrics push from a controller; the payload is
    /// opaque to the gateway.
    Metrics {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Request {
        #[serde(rename = "requestID")]
        request_id: String,
        method: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Response {
        #[serde(rename = "requestID")]
        request_id: String,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default)]
        error: Option<String>,
    },
    SyncAllocations {
        allocations: Vec<DesiredAllocation>,
    },
    SyncResult(SyncResult),
    /// Sent just before the gateway closes a misbehaving stream.
    ProtocolError { message: String },
}

/// Method name of the gateway's lease-resolution fan-out.
pub const METHOD_FIND_VPS_BY_LEASE: &str = "find_vps_by_lease";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindVpsByLeaseRequest {
    pub ip_address: String,
    pub mac_address: String,
}

/// An empty `vps_id` means the controller has no record of the lease.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindVpsByLeaseResponse {
    #[serde(rename = "vpsID", default)]
    pub vps_id: String,
    #[serde(rename = "organizationID", default)]
    pub organization_id: String,
}
