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

use crate::AddressError;
use crate::ipv4::{ip_to_u32, u32_to_ip};

/// An inclusive IPv4 range. "In range" is a 32-bit unsigned comparison, so
/// the range may span octet boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Range {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl Ipv4Range {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, AddressError> {
        if ip_to_u32(start) > ip_to_u32(end) {
            return Err(AddressError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = ip_to_u32(ip);
        ip_to_u32(self.start) <= ip && ip <= ip_to_u32(self.end)
    }

    /// Number of addresses in the range, both ends included.
    pub fn len(&self) -> u64 {
        u64::from(ip_to_u32(self.end)) - u64::from(ip_to_u32(self.start)) + 1
    }

    pub fn is_empty(&self) -> bool {
        // A range always holds at least its start address.
        false
    }

    /// Iterate the range lowest address first.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let start = ip_to_u32(self.start);
        let end = ip_to_u32(self.end);
        (start..=end).map(u32_to_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: &str, end: &str) -> Ipv4Range {
        Ipv4Range::new(start.parse().unwrap(), end.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_contains_is_inclusive() {
        let r = range("10.0.0.10", "10.0.0.12");
        assert!(r.contains("10.0.0.10".parse().unwrap()));
        assert!(r.contains("10.0.0.11".parse().unwrap()));
        assert!(r.contains("10.0.0.12".parse().unwrap()));
        assert!(!r.contains("10.0.0.9".parse().unwrap()));
        assert!(!r.contains("10.0.0.13".parse().unwrap()));
    }

    #[test]
    fn test_contains_spans_octets() {
        let r = range("10.0.0.200", "10.0.1.50");
        assert!(r.contains("10.0.0.255".parse().unwrap()));
        assert!(r.contains("10.0.1.0".parse().unwrap()));
        assert!(!r.contains("10.0.1.51".parse().unwrap()));
    }

    #[test]
    fn test_len_and_iter() {
        let r = range("10.0.0.10", "10.0.0.12");
        assert_eq!(r.len(), 3);
        let ips: Vec<String> = r.iter().map(|ip| ip.to_string()).collect();
        assert_eq!(ips, vec!["10.0.0.10", "10.0.0.11", "10.0.0.12"]);
    }

    #[test]
    fn test_single_address_range() {
        let r = range("10.0.0.10", "10.0.0.10");
        assert_eq!(r.len(), 1);
        assert!(r.contains("10.0.0.10".parse().unwrap()));
    }

    #[test]
    fn test_inverted_range_rejected() {
        assert!(
            Ipv4Range::new(
                "10.0.0.12".parse().unwrap(),
                "10.0.0.10".parse().unwrap()
            )
            .is_err()
        );
    }
}
