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

//! The in-memory allocation store.
//!
//! This is the gateway's runtime truth for which VPS holds which address.
//! Invariants maintained here: one allocation per VPS, one VPS per address,
//! and the public/private classification always agrees with the pool range.
//!
//! The store is deliberately I/O free. Side effects (hosts file, packet
//! filter, DHCP reload) are driven by the coordinator *after* the in-memory
//! mutation committed, and rolled back through the store if they fail.

mod store;
mod types;

pub use store::AllocationStore;
pub use types::{
    Allocation, AllocateParams, PoolConfig, Released, StoreStats, SyncOutcome,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AllocationError {
    #[error("no free addresses left in the DHCP pool")]
    PoolExhausted,
    #[error("IP address {ip} is already allocated to {holder}")]
    IpInUse { ip: String, holder: String },
    #[error(transparent)]
    InvalidAddress(#[from] network::AddressError),
    #[error("IP address {0} is outside the DHCP pool and public allocation is not permitted here")]
    PublicIpNotPermitted(String),
    #[error("{vps_id} already holds a different binding ({ip}, {mac})")]
    ConflictingExisting {
        vps_id: String,
        ip: String,
        mac: String,
    },
}
