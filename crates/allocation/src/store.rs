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
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::RwLock;

use chrono::{Duration, Utc};
use network::normalize_mac;
use wire::api::DesiredAllocation;

use crate::types::{
    Allocation, AllocateParams, PoolConfig, Released, StoreStats, SyncOutcome,
};
use crate::AllocationError;

/// Advisory lifetime reported on allocations. The DHCP server's lease file
/// is the authority; this only feeds the API response.
const ADVISORY_LEASE_HOURS: i64 = 24;

pub struct AllocationStore {
    pool: PoolConfig,
    // Keyed by vps_id. Writers exclusive, readers shared; nothing held
    // across I/O or awaits.
    inner: RwLock<HashMap<String, Allocation>>,
}

impl AllocationStore {
    pub fn new(pool: PoolConfig) -> Self {
        Self {
            pool,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    pub fn is_ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        self.pool.range.contains(ip)
    }

    /// Allocate an address for a VPS, or refresh the identical existing
    /// binding. See [`AllocationError`] for the admission failures.
    pub fn allocate(&self, params: AllocateParams) -> Result<Allocation, AllocationError> {
        let mut map = self.inner.write().expect("BUG: allocation store poisoned");
        Self::allocate_locked(&self.pool, &mut map, params)
    }

    /// Remove the binding iff both the VPS and the address match.
    pub fn release(&self, vps_id: &str, ip: Ipv4Addr) -> Released {
        let mut map = self.inner.write().expect("BUG: allocation store poisoned");
        Self::release_locked(&mut map, vps_id, ip)
    }

    /// Snapshot of the current allocations, optionally filtered. Filters
    /// are exact matches on the respective field.
    pub fn list(&self, org_filter: Option<&str>, vps_filter: Option<&str>) -> Vec<Allocation> {
        let map = self.inner.read().expect("BUG: allocation store poisoned");
        let mut out: Vec<Allocation> = map
            .values()
            .filter(|a| org_filter.is_none_or(|org| a.organization_id == org))
            .filter(|a| vps_filter.is_none_or(|vps| a.vps_id == vps))
            .cloned()
            .collect();
        out.sort_by_key(|a| network::ip_to_u32(a.ip_address));
        out
    }

    pub fn find_by_ip(&self, ip: Ipv4Addr) -> Option<Allocation> {
        let map = self.inner.read().expect("BUG: allocation store poisoned");
        map.values().find(|a| a.ip_address == ip).cloned()
    }

    /// True when the `(mac, ip)` pair matches a live allocation. Used by the
    /// lease reconciler to spot leases the gateway does not know about.
    pub fn has_binding(&self, mac: &str, ip: Ipv4Addr) -> bool {
        let map = self.inner.read().expect("BUG: allocation store poisoned");
        map.values()
            .any(|a| a.ip_address == ip && a.mac_address == mac)
    }

    /// Undo a just-committed insert whose side effects failed. Same
    /// contract as [`Self::release`]; this is the recovery path, so the
    /// entry being gone already is fine.
    pub fn rollback_insert(&self, vps_id: &str, ip: Ipv4Addr) -> Released {
        tracing::debug!(vps_id, %ip, "rolling back allocation");
        self.release(vps_id, ip)
    }

    /// Put back an allocation that a failed side effect rolled out. Only
    /// used on recovery paths; an existing entry for the VPS wins.
    pub fn restore(&self, allocation: Allocation) {
        let mut map = self.inner.write().expect("BUG: allocation store poisoned");
        map.entry(allocation.vps_id.clone()).or_insert(allocation);
    }

    pub fn stats(&self) -> StoreStats {
        let map = self.inner.read().expect("BUG: allocation store poisoned");
        StoreStats {
            pool_size: self.pool.range.len(),
            allocated: map.len() as u64,
        }
    }

    /// Reconcile the store against the controller's desired set. The
    /// desired set wins: anything absent from it is released, anything new
    /// in it is allocated, and a VPS whose binding changed is rebound.
    /// Per-row failures are collected and skipped; the rest of the run
    /// continues.
    pub fn sync_desired(&self, desired: &[DesiredAllocation]) -> SyncOutcome {
        let mut map = self.inner.write().expect("BUG: allocation store poisoned");
        let mut outcome = SyncOutcome::default();

        let desired_ids: HashSet<&str> = desired.iter().map(|d| d.vps_id.as_str()).collect();

        // Pass 1: drop everything the controller no longer wants, freeing
        // addresses the remaining rows may be about to take over.
        let stale: Vec<(String, Ipv4Addr)> = map
            .values()
            .filter(|a| !desired_ids.contains(a.vps_id.as_str()))
            .map(|a| (a.vps_id.clone(), a.ip_address))
            .collect();
        for (vps_id, ip) in stale {
            if let Released::Removed(old) = Self::release_locked(&mut map, &vps_id, ip) {
                outcome.removed.push(old);
            }
        }

        // Pass 2: apply every desired row.
        for row in desired {
            let ip = match network::parse_ipv4(&row.ip_address) {
                Ok(ip) => ip,
                Err(error) => {
                    tracing::warn!(vps_id = %row.vps_id, %error, "skipping desired allocation");
                    outcome.errors.push(format!("{}: {error}", row.vps_id));
                    continue;
                }
            };

            let params = AllocateParams {
                vps_id: row.vps_id.clone(),
                organization_id: row.organization_id.clone(),
                mac_address: row.mac_address.clone(),
                preferred_ip: Some(ip),
                allow_public: row.is_public,
            };

            let preexisting = map.contains_key(&row.vps_id);
            match Self::allocate_locked(&self.pool, &mut map, params.clone()) {
                // A pre-existing identical binding is an idempotent refresh
                // and counts as neither added nor removed.
                Ok(new) => {
                    if !preexisting {
                        outcome.added.push(new);
                    }
                }
                Err(AllocationError::ConflictingExisting { .. }) => {
                    // The VPS exists with a different binding; the desired
                    // row is authoritative, so rebind.
                    let old = match Self::take_locked(&mut map, &row.vps_id) {
                        Some(old) => old,
                        None => continue,
                    };
                    match Self::allocate_locked(&self.pool, &mut map, params) {
                        Ok(new) => outcome.rebound.push((old, new)),
                        Err(error) => {
                            tracing::warn!(
                                vps_id = %row.vps_id,
                                %error,
                                "failed to rebind desired allocation"
                            );
                            outcome.errors.push(format!("{}: {error}", row.vps_id));
                        }
                    }
                    continue;
                }
                Err(error) => {
                    tracing::warn!(vps_id = %row.vps_id, %error, "failed to apply desired allocation");
                    outcome.errors.push(format!("{}: {error}", row.vps_id));
                    continue;
                }
            }
        }
        outcome
    }

    //
    // Internals. All `_locked` functions assume the write guard is held.
    //

    fn allocate_locked(
        pool: &PoolConfig,
        map: &mut HashMap<String, Allocation>,
        params: AllocateParams,
    ) -> Result<Allocation, AllocationError> {
        let mac = normalize_mac(&params.mac_address)?;

        if let Some(existing) = map.get_mut(&params.vps_id) {
            let same_ip = params
                .preferred_ip
                .is_none_or(|ip| ip == existing.ip_address);
            if same_ip && existing.mac_address == mac {
                // Idempotent refresh.
                existing.lease_expires = Utc::now() + Duration::hours(ADVISORY_LEASE_HOURS);
                return Ok(existing.clone());
            }
            return Err(AllocationError::ConflictingExisting {
                vps_id: params.vps_id,
                ip: existing.ip_address.to_string(),
                mac: existing.mac_address.clone(),
            });
        }

        let (ip, is_public) = match params.preferred_ip {
            Some(ip) => {
                if let Some(holder) = map.values().find(|a| a.ip_address == ip) {
                    return Err(AllocationError::IpInUse {
                        ip: ip.to_string(),
                        holder: holder.vps_id.clone(),
                    });
                }
                if pool.range.contains(ip) {
                    (ip, false)
                } else if params.allow_public {
                    (ip, true)
                } else {
                    return Err(AllocationError::PublicIpNotPermitted(ip.to_string()));
                }
            }
            None => {
                let used: HashSet<Ipv4Addr> = map.values().map(|a| a.ip_address).collect();
                let free = pool
                    .range
                    .iter()
                    .find(|ip| !used.contains(ip))
                    .ok_or(AllocationError::PoolExhausted)?;
                (free, false)
            }
        };

        let now = Utc::now();
        let allocation = Allocation {
            vps_id: params.vps_id.clone(),
            organization_id: params.organization_id,
            ip_address: ip,
            mac_address: mac,
            allocated_at: now,
            lease_expires: now + Duration::hours(ADVISORY_LEASE_HOURS),
            is_public,
        };
        map.insert(params.vps_id, allocation.clone());
        Ok(allocation)
    }

    fn release_locked(
        map: &mut HashMap<String, Allocation>,
        vps_id: &str,
        ip: Ipv4Addr,
    ) -> Released {
        match map.get(vps_id) {
            Some(existing) if existing.ip_address == ip => {
                let removed = map.remove(vps_id).expect("BUG: entry vanished under lock");
                Released::Removed(removed)
            }
            Some(existing) => {
                tracing::debug!(
                    vps_id,
                    held = %existing.ip_address,
                    requested = %ip,
                    "release skipped, address does not match"
                );
                Released::NotPresent
            }
            None => {
                tracing::debug!(vps_id, requested = %ip, "release of unknown vps, treating as success");
                Released::NotPresent
            }
        }
    }

    fn take_locked(map: &mut HashMap<String, Allocation>, vps_id: &str) -> Option<Allocation> {
        map.remove(vps_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PoolConfig {
        PoolConfig {
            range: network::Ipv4Range::new(
                "10.0.0.10".parse().unwrap(),
                "10.0.0.12".parse().unwrap(),
            )
            .unwrap(),
            subnet_mask: "255.255.255.0".parse().unwrap(),
            gateway: "10.0.0.1".parse().unwrap(),
            dns_servers: vec!["1.1.1.1".parse().unwrap()],
        }
    }

    fn params(vps: &str, mac: &str) -> AllocateParams {
        AllocateParams {
            vps_id: vps.to_string(),
            organization_id: "org-a".to_string(),
            mac_address: mac.to_string(),
            preferred_ip: None,
            allow_public: false,
        }
    }

    fn desired(vps: &str, ip: &str, mac: &str, public: bool) -> DesiredAllocation {
        DesiredAllocation {
            vps_id: vps.to_string(),
            organization_id: "org-a".to_string(),
            ip_address: ip.to_string(),
            mac_address: mac.to_string(),
            is_public: public,
        }
    }

    #[test]
    fn test_allocate_picks_lowest_free() {
        let store = AllocationStore::new(pool());
        let a = store.allocate(params("vps-1", "aa:bb:cc:dd:ee:01")).unwrap();
        assert_eq!(a.ip_address.to_string(), "10.0.0.10");
        assert!(!a.is_public);

        let b = store.allocate(params("vps-2", "aa:bb:cc:dd:ee:02")).unwrap();
        assert_eq!(b.ip_address.to_string(), "10.0.0.11");
    }

    #[test]
    fn test_allocate_release_round_trip() {
        // P1/R1: after release the vps is gone from list().
        let store = AllocationStore::new(pool());
        let a = store.allocate(params("vps-1", "aa:bb:cc:dd:ee:01")).unwrap();
        assert_eq!(store.list(None, None).len(), 1);

        let released = store.release("vps-1", a.ip_address);
        assert!(matches!(released, Released::Removed(_)));
        assert!(store.list(None, None).is_empty());

        // Releasing again is a silent no-op.
        assert_eq!(store.release("vps-1", a.ip_address), Released::NotPresent);
    }

    #[test]
    fn test_allocate_is_idempotent() {
        // R2: identical arguments return the same allocation.
        let store = AllocationStore::new(pool());
        let first = store.allocate(params("vps-1", "aa:bb:cc:dd:ee:01")).unwrap();
        let second = store.allocate(params("vps-1", "aa:bb:cc:dd:ee:01")).unwrap();
        assert_eq!(first.ip_address, second.ip_address);
        assert_eq!(first.mac_address, second.mac_address);
        assert!(second.lease_expires >= first.lease_expires);
        assert_eq!(store.list(None, None).len(), 1);
    }

    #[test]
    fn test_mac_is_normalized() {
        let store = AllocationStore::new(pool());
        let a = store.allocate(params("vps-1", "AA:BB:CC:DD:EE:01")).unwrap();
        assert_eq!(a.mac_address, "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_invalid_mac_rejected() {
        let store = AllocationStore::new(pool());
        let err = store
            .allocate(params("vps-1", "not-a-mac"))
            .unwrap_err();
        assert!(matches!(err, AllocationError::InvalidAddress(_)));
    }

    #[test]
    fn test_conflicting_existing() {
        let store = AllocationStore::new(pool());
        store.allocate(params("vps-1", "aa:bb:cc:dd:ee:01")).unwrap();
        let err = store
            .allocate(params("vps-1", "aa:bb:cc:dd:ee:99"))
            .unwrap_err();
        assert!(matches!(err, AllocationError::ConflictingExisting { .. }));
    }

    #[test]
    fn test_preferred_ip_in_use() {
        // P2/S2: the second taker of an address gets IpInUse.
        let store = AllocationStore::new(pool());
        let mut p1 = params("vps-1", "aa:bb:cc:dd:ee:01");
        p1.preferred_ip = Some("10.0.0.10".parse().unwrap());
        store.allocate(p1).unwrap();

        let mut p2 = params("vps-2", "aa:bb:cc:dd:ee:02");
        p2.preferred_ip = Some("10.0.0.10".parse().unwrap());
        let err = store.allocate(p2).unwrap_err();
        assert_eq!(
            err,
            AllocationError::IpInUse {
                ip: "10.0.0.10".to_string(),
                holder: "vps-1".to_string(),
            }
        );
    }

    #[test]
    fn test_concurrent_allocate_same_preferred_ip() {
        // P2 under actual concurrency: exactly one thread wins.
        let store = std::sync::Arc::new(AllocationStore::new(pool()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut p = params(&format!("vps-{i}"), &format!("aa:bb:cc:dd:ee:{i:02x}"));
                p.preferred_ip = Some("10.0.0.11".parse().unwrap());
                store.allocate(p)
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(AllocationError::IpInUse { .. })))
                .count(),
            7
        );
    }

    #[test]
    fn test_pool_exhaustion() {
        let store = AllocationStore::new(pool());
        for i in 0..3 {
            store
                .allocate(params(&format!("vps-{i}"), &format!("aa:bb:cc:dd:ee:{i:02x}")))
                .unwrap();
        }
        let err = store.allocate(params("vps-9", "aa:bb:cc:dd:ee:09")).unwrap_err();
        assert_eq!(err, AllocationError::PoolExhausted);
    }

    #[test]
    fn test_public_classification() {
        // P3: in-pool preferred IPs are private, out-of-pool need allow_public.
        let store = AllocationStore::new(pool());

        let mut private = params("vps-1", "aa:bb:cc:dd:ee:01");
        private.preferred_ip = Some("10.0.0.12".parse().unwrap());
        assert!(!store.allocate(private).unwrap().is_public);

        let mut denied = params("vps-2", "aa:bb:cc:dd:ee:02");
        denied.preferred_ip = Some("203.0.113.5".parse().unwrap());
        assert!(matches!(
            store.allocate(denied).unwrap_err(),
            AllocationError::PublicIpNotPermitted(_)
        ));

        let mut public = params("vps-3", "aa:bb:cc:dd:ee:03");
        public.preferred_ip = Some("203.0.113.5".parse().unwrap());
        public.allow_public = true;
        assert!(store.allocate(public).unwrap().is_public);
    }

    #[test]
    fn test_list_filters() {
        let store = AllocationStore::new(pool());
        store.allocate(params("vps-1", "aa:bb:cc:dd:ee:01")).unwrap();
        let mut other_org = params("vps-2", "aa:bb:cc:dd:ee:02");
        other_org.organization_id = "org-b".to_string();
        store.allocate(other_org).unwrap();

        assert_eq!(store.list(Some("org-a"), None).len(), 1);
        assert_eq!(store.list(Some("org-b"), None).len(), 1);
        assert_eq!(store.list(None, Some("vps-2")).len(), 1);
        assert_eq!(store.list(Some("org-a"), Some("vps-2")).len(), 0);
    }

    #[test]
    fn test_sync_desired_converges() {
        // P4/S6: the desired set wins.
        let store = AllocationStore::new(pool());
        for i in 1..=3 {
            store
                .allocate(params(&format!("vps-{i}"), &format!("aa:bb:cc:dd:ee:{i:02x}")))
                .unwrap();
        }

        let desired = vec![
            desired("vps-2", "10.0.0.11", "aa:bb:cc:dd:ee:02", false),
            desired("vps-4", "10.0.0.12", "aa:bb:cc:dd:ee:04", false),
        ];
        // vps-2 already holds 10.0.0.11 (second lowest); vps-4 takes over
        // vps-3's released address.
        let outcome = store.sync_desired(&desired);
        assert_eq!(outcome.added_count(), 1);
        assert_eq!(outcome.removed_count(), 2);
        assert!(outcome.errors.is_empty());

        let ids: Vec<String> = store
            .list(None, None)
            .into_iter()
            .map(|a| a.vps_id)
            .collect();
        assert_eq!(ids, vec!["vps-2".to_string(), "vps-4".to_string()]);
    }

    #[test]
    fn test_sync_desired_is_idempotent() {
        // R3: a second run of the same desired set changes nothing.
        let store = AllocationStore::new(pool());
        let desired = vec![
            desired("vps-1", "10.0.0.10", "aa:bb:cc:dd:ee:01", false),
            desired("vps-2", "203.0.113.5", "aa:bb:cc:dd:ee:02", true),
        ];
        let first = store.sync_desired(&desired);
        assert_eq!(first.added_count(), 2);
        assert_eq!(first.removed_count(), 0);

        let second = store.sync_desired(&desired);
        assert_eq!(second.added_count(), 0);
        assert_eq!(second.removed_count(), 0);
        assert!(second.rebound.is_empty());
    }

    #[test]
    fn test_sync_desired_rebinds_changed_mac() {
        let store = AllocationStore::new(pool());
        store
            .sync_desired(&[desired("vps-1", "10.0.0.10", "aa:bb:cc:dd:ee:01", false)]);

        let outcome =
            store.sync_desired(&[desired("vps-1", "10.0.0.10", "aa:bb:cc:dd:ee:99", false)]);
        assert_eq!(outcome.added_count(), 0);
        assert_eq!(outcome.removed_count(), 0);
        assert_eq!(outcome.rebound.len(), 1);
        let (old, new) = &outcome.rebound[0];
        assert_eq!(old.mac_address, "aa:bb:cc:dd:ee:01");
        assert_eq!(new.mac_address, "aa:bb:cc:dd:ee:99");

        let live = store.list(None, Some("vps-1"));
        assert_eq!(live[0].mac_address, "aa:bb:cc:dd:ee:99");
    }

    #[test]
    fn test_sync_desired_skips_bad_rows() {
        let store = AllocationStore::new(pool());
        let outcome = store.sync_desired(&[
            desired("vps-1", "10.0.0.10", "aa:bb:cc:dd:ee:01", false),
            desired("vps-bad", "not-an-ip", "aa:bb:cc:dd:ee:02", false),
            desired("vps-worse", "203.0.113.7", "aa:bb:cc:dd:ee:03", false),
        ]);
        assert_eq!(outcome.added_count(), 1);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(store.list(None, None).len(), 1);
    }

    #[test]
    fn test_rollback_insert_removes_the_binding() {
        let store = AllocationStore::new(pool());
        let a = store.allocate(params("vps-1", "aa:bb:cc:dd:ee:01")).unwrap();

        assert!(matches!(
            store.rollback_insert("vps-1", a.ip_address),
            Released::Removed(_)
        ));
        assert!(store.list(None, None).is_empty());
        // Rolling back twice is as harmless as releasing twice.
        assert_eq!(
            store.rollback_insert("vps-1", a.ip_address),
            Released::NotPresent
        );
    }

    #[test]
    fn test_find_by_ip_and_has_binding() {
        let store = AllocationStore::new(pool());
        let a = store.allocate(params("vps-1", "aa:bb:cc:dd:ee:01")).unwrap();
        assert_eq!(store.find_by_ip(a.ip_address).unwrap().vps_id, "vps-1");
        assert!(store.has_binding("aa:bb:cc:dd:ee:01", a.ip_address));
        assert!(!store.has_binding("aa:bb:cc:dd:ee:02", a.ip_address));
        assert!(store.find_by_ip("10.0.0.99".parse().unwrap()).is_none());
    }

    #[test]
    fn test_stats() {
        let store = AllocationStore::new(pool());
        store.allocate(params("vps-1", "aa:bb:cc:dd:ee:01")).unwrap();
        let stats = store.stats();
        assert_eq!(stats.pool_size, 3);
        assert_eq!(stats.allocated, 1);
    }
}
