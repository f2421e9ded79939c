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
use std::io::Write;
use std::path::Path;

use allocation::Allocation;

use crate::DhcpFileError;

/// Render the static hosts file the DHCP server consumes. One
/// `mac,ip,hostname` line per allocation, hostname being the VPS ID.
/// Output is sorted by address so consecutive writes of the same state are
/// byte-identical.
pub fn render(allocations: &[Allocation]) -> String {
    let mut rows: Vec<&Allocation> = allocations.iter().collect();
    rows.sort_by_key(|a| network::ip_to_u32(a.ip_address));

    let mut out = String::new();
    for a in rows {
        out.push_str(&a.mac_address);
        out.push(',');
        out.push_str(&a.ip_address.to_string());
        out.push(',');
        out.push_str(&a.vps_id);
        out.push('\n');
    }
    out
}

/// Atomically replace `path` with `contents`: the new content is written to
/// a temporary file in the same directory and renamed into place, so the
/// DHCP server can never observe a partial write.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), DhcpFileError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|error| DhcpFileError::Io {
        what: "creating hosts temp file",
        error,
    })?;
    tmp.write_all(contents.as_bytes())
        .map_err(|error| DhcpFileError::Io {
            what: "writing hosts temp file",
            error,
        })?;
    tmp.flush().map_err(|error| DhcpFileError::Io {
        what: "flushing hosts temp file",
        error,
    })?;
    tmp.persist(path).map_err(|error| DhcpFileError::Persist {
        path: path.display().to_string(),
        error: error.error,
    })?;
    Ok(())
}
