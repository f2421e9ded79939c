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
use once_cell::sync::Lazy;
use regex::Regex;

use crate::AddressError;

static MAC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2}$").expect("BUG: MAC regex is invalid")
});

/// Validate a colon-separated MAC address and normalize it to lowercase.
///
/// All MACs held by the gateway are stored in this form; comparisons
/// elsewhere are plain string equality.
pub fn normalize_mac(value: &str) -> Result<String, AddressError> {
    if !MAC_RE.is_match(value) {
        return Err(AddressError::InvalidMac(value.to_string()));
    }
    Ok(value.to_ascii_lowercase())
}
