//! Per-domain routing tables and DHCP allocator (§4.4/C4).
//!
//! A `Domain` is the live, in-memory half of a `domains` row: the persisted
//! shape (`DomainRecord`) plus the two routing tables the relay actually
//! forwards against. Table membership (`ws_device_map`/`ip_ws_map`) is
//! guarded by `tables`, a `tokio::sync::RwLock`, matching the teacher's
//! pattern of an async `RwLock` wrapping a small struct of collections
//! rather than field-by-field locks. Per-handler lock granularity follows
//! the design notes: VMAC/AUTH/cleanup/domain-delete take the write half;
//! FORWARD/PEER/DHCP/DISCOVERY/GENERAL take the read half.
//!
//! `host_id` sits outside that lock as an `AtomicU32`. The original walks
//! this counter under nothing stronger than the handler's read lock, so two
//! concurrent DHCP requests can interleave; an atomic compare-exchange loop
//! gives the same "advance without serializing" behaviour without the data
//! race the original has in Go.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nohash_hasher::BuildNoHashHasher;
use rand::Rng;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::device::DeviceHandle;
use crate::error::RelayError;
use crate::persistence::PersistenceAdapter;
use crate::session::SessionId;

/// The persisted shape of a `domains` row (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct DomainRecord {
    pub name: String,
    pub password: Vec<u8>,
    pub dhcp: String,
    pub broadcast: bool,
}

#[derive(Default)]
pub(crate) struct DomainTables {
    pub(crate) ws_device_map: HashMap<SessionId, Arc<DeviceHandle>>,
    pub(crate) ip_ws_map: HashMap<u32, Arc<DeviceHandle>, BuildNoHashHasher<u32>>,
}

pub struct Domain {
    pub name: String,
    pub password: Vec<u8>,
    pub dhcp_cidr: String,
    pub broadcast: bool,
    mask: u32,
    net_id: u32,
    host_id: AtomicU32,
    tables: RwLock<DomainTables>,
}

impl Domain {
    /// Builds the live `Domain` from its persisted record. Returns `None`
    /// when a DHCP CIDR is configured but leaves fewer than two usable host
    /// addresses (I6): such a domain can never hand out an address and is
    /// treated as unusable rather than crashing later on the first request.
    pub fn from_record(record: DomainRecord) -> Option<Self> {
        let (mask, net_id, host_id) = if record.dhcp.is_empty() {
            (0, 0, 0)
        } else {
            let (mask, net_id) = parse_cidr(&record.dhcp)?;
            let not_mask = !mask;
            if not_mask < 2 {
                return None;
            }
            (mask, net_id, seed_host_id(not_mask))
        };
        Some(Self {
            name: record.name,
            password: record.password,
            dhcp_cidr: record.dhcp,
            broadcast: record.broadcast,
            mask,
            net_id,
            host_id: AtomicU32::new(host_id),
            tables: RwLock::new(DomainTables::default()),
        })
    }

    pub fn dhcp_enabled(&self) -> bool {
        !self.dhcp_cidr.is_empty()
    }

    pub fn prefix_len(&self) -> u8 {
        self.mask.count_ones() as u8
    }

    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn not_mask(&self) -> u32 {
        !self.mask
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, DomainTables> {
        self.tables.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, DomainTables> {
        self.tables.write().await
    }

    /// One step of the bounded sweep (§4.4 step 2): advance past the current
    /// host id, skipping the all-zero and all-ones host values (I6), and
    /// return the new value. Racing callers never observe 0 or `!mask`.
    fn advance_host_id(&self) -> u32 {
        let not_mask = !self.mask;
        loop {
            let cur = self.host_id.load(Ordering::SeqCst);
            let next = cur.wrapping_add(1) & not_mask;
            if self
                .host_id
                .compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            if next != 0 && next != not_mask {
                return next;
            }
        }
    }

    /// Runs the full allocation sweep against the persisted device table:
    /// advance the host counter, check nobody already owns the resulting
    /// address, and stop successfully or fail once the sweep has come all
    /// the way back around (§4.4 steps 1-5).
    pub async fn allocate_host(
        &self,
        persistence: &dyn PersistenceAdapter,
    ) -> Result<u32, RelayError> {
        let old_host_id = self.host_id.load(Ordering::SeqCst);
        loop {
            let candidate = self.advance_host_id();
            let candidate_ip = self.net_id | candidate;
            let ip_text = Ipv4Addr::from(candidate_ip).to_string();
            if !persistence.device_owns_ip(&self.name, &ip_text).await? {
                return Ok(candidate_ip);
            }
            if candidate == old_host_id {
                return Err(RelayError::exhausted("dhcp address space exhausted"));
            }
        }
    }
}

/// Picks the initial rolling allocation cursor: a uniformly random host part,
/// masked by `not_mask` and normalized away from the all-zero and all-ones
/// host values (I6, §4.3 step 3).
fn seed_host_id(not_mask: u32) -> u32 {
    let candidate = rand::thread_rng().gen::<u32>() & not_mask;
    match candidate {
        0 => 1,
        h if h == not_mask => not_mask - 1,
        h => h,
    }
}

/// Parses an IPv4 CIDR string (`"a.b.c.d/n"`) into `(mask, net_id)`.
fn parse_cidr(cidr: &str) -> Option<(u32, u32)> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Some((mask, u32::from(addr) & mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(dhcp: &str) -> DomainRecord {
        DomainRecord { name: "d".into(), password: b"pw".to_vec(), dhcp: dhcp.into(), broadcast: false }
    }

    #[test]
    fn rejects_cidr_with_fewer_than_two_hosts() {
        assert!(Domain::from_record(record("10.0.0.0/31")).is_none());
        assert!(Domain::from_record(record("10.0.0.0/32")).is_none());
    }

    #[test]
    fn accepts_cidr_with_two_hosts() {
        assert!(Domain::from_record(record("10.0.0.0/30")).is_some());
    }

    #[test]
    fn no_dhcp_domain_is_always_usable() {
        assert!(Domain::from_record(record("")).is_some());
    }

    #[tokio::test]
    async fn allocate_host_skips_zero_and_broadcast() {
        struct NeverOwns;
        #[async_trait::async_trait]
        impl PersistenceAdapter for NeverOwns {
            async fn auto_migrate(&self) -> Result<(), RelayError> { Ok(()) }
            async fn find_domain(&self, _: &str) -> Result<Option<DomainRecord>, RelayError> { Ok(None) }
            async fn delete_domain(&self, _: &str) -> Result<(), RelayError> { Ok(()) }
            async fn find_device(&self, _: &str, _: &str) -> Result<Option<crate::device::Device>, RelayError> { Ok(None) }
            async fn save_device(&self, _: &crate::device::Device) -> Result<(), RelayError> { Ok(()) }
            async fn devices_by_ip(&self, _: &str, _: &str) -> Result<Vec<crate::device::Device>, RelayError> { Ok(vec![]) }
            async fn device_owns_ip(&self, _: &str, _: &str) -> Result<bool, RelayError> { Ok(false) }
            async fn reset_all_online_false(&self) -> Result<(), RelayError> { Ok(()) }
            async fn config_value(&self, _: &str) -> Result<Option<String>, RelayError> { Ok(None) }
        }

        let domain = Domain::from_record(record("10.0.0.0/30")).unwrap();
        let persistence = NeverOwns;
        let ip = domain.allocate_host(&persistence).await.unwrap();
        assert_ne!(ip & !domain.mask, 0);
        assert_ne!(ip & !domain.mask, !domain.mask);
    }

    #[tokio::test]
    async fn write_lock_waits_for_outstanding_read_lock() {
        // Models the AUTH-eviction-vs-FORWARD open question (§9): a handler
        // holding the domain's read lock (FORWARD, PEER, DHCP, ...) delays
        // any writer (VMAC, AUTH, cleanup) until it releases.
        let domain = Domain::from_record(record("10.0.0.0/24")).unwrap();
        let read_guard = domain.read().await;
        let write_attempt = tokio::time::timeout(std::time::Duration::from_millis(50), domain.write());
        assert!(write_attempt.await.is_err(), "write lock should not be granted while a reader holds it");
        drop(read_guard);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), domain.write()).await.is_ok());
    }

    #[tokio::test]
    async fn allocate_host_reports_exhaustion() {
        struct AlwaysOwns;
        #[async_trait::async_trait]
        impl PersistenceAdapter for AlwaysOwns {
            async fn auto_migrate(&self) -> Result<(), RelayError> { Ok(()) }
            async fn find_domain(&self, _: &str) -> Result<Option<DomainRecord>, RelayError> { Ok(None) }
            async fn delete_domain(&self, _: &str) -> Result<(), RelayError> { Ok(()) }
            async fn find_device(&self, _: &str, _: &str) -> Result<Option<crate::device::Device>, RelayError> { Ok(None) }
            async fn save_device(&self, _: &crate::device::Device) -> Result<(), RelayError> { Ok(()) }
            async fn devices_by_ip(&self, _: &str, _: &str) -> Result<Vec<crate::device::Device>, RelayError> { Ok(vec![]) }
            async fn device_owns_ip(&self, _: &str, _: &str) -> Result<bool, RelayError> { Ok(true) }
            async fn reset_all_online_false(&self) -> Result<(), RelayError> { Ok(()) }
            async fn config_value(&self, _: &str) -> Result<Option<String>, RelayError> { Ok(None) }
        }

        let domain = Domain::from_record(record("10.0.0.0/30")).unwrap();
        let persistence = AlwaysOwns;
        assert!(domain.allocate_host(&persistence).await.is_err());
    }
}
