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

//! Coordination with the external DHCP server.
//!
//! The gateway and the DHCP server share two files: the gateway writes the
//! static hosts file (one `mac,ip,hostname` binding per line) and reads the
//! server's lease file. The server is told to pick up hosts-file changes
//! through a reload command, which is debounced and retried here.

pub mod hosts;
pub mod leases;
pub mod reload;

#[derive(thiserror::Error, Debug)]
pub enum DhcpFileError {
    #[error("error {what}: {error}")]
    Io {
        what: &'static str,
        error: std::io::Error,
    },
    #[error("error replacing {path}: {error}")]
    Persist {
        path: String,
        error: std::io::Error,
    },
}
