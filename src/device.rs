//! The `Device` record (§3): one row per `(Domain, VMac)`, persisted across
//! sessions. The `ip` field is the volatile routing key (integer form of
//! `IP`); everything else mirrors what gets written to the store on AUTH
//! and on disconnect.

use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::net::transport::Websocket;
use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub domain: String,
    pub vmac: String,
    pub ip_text: String,
    pub country: String,
    pub region: String,
    pub online: bool,
    pub conn_updated_at: DateTime<Utc>,
    pub rx: u64,
    pub tx: u64,
    pub os: String,
    pub version: String,

    /// Volatile: the integer form of `ip_text`, used as the routing key in
    /// `ip_ws_map`. Not persisted directly (derived from `ip_text`).
    pub ip: u32,
}

impl Device {
    /// A freshly-seen device: created from a VMAC frame, not yet
    /// associated with an address or marked online.
    pub fn new(domain: impl Into<String>, vmac: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            vmac: vmac.into(),
            ip_text: String::new(),
            country: String::new(),
            region: String::new(),
            online: false,
            conn_updated_at: Utc::now(),
            rx: 0,
            tx: 0,
            os: String::new(),
            version: String::new(),
            ip: 0,
        }
    }

    pub fn set_ip(&mut self, ip: u32) {
        self.ip = ip;
        self.ip_text = Ipv4Addr::from(ip).to_string();
    }
}

/// The live, per-connection counterpart to `Device` (§4.4/C4). Held behind
/// an `Arc` in both of a domain's routing tables, so forwarding a frame or
/// closing a connection never needs more than the table's read lock: the
/// mutable bits below use interior mutability instead of requiring the
/// write half.
///
/// Counters are plain atomics — relaxed, unserialized with respect to the
/// table lock — matching the original's unsynchronized struct field writes
/// under a read lock (§9). `os`/`version`/location fields use a small
/// std `Mutex` instead: Rust has no safe atomic string, and a short
/// non-blocking critical section is the narrowest faithful substitute.
pub struct DeviceHandle {
    pub session_id: SessionId,
    pub domain: String,
    pub vmac: String,
    pub transport: Arc<Websocket>,
    ip: AtomicU32,
    ip_text: Mutex<String>,
    country: Mutex<String>,
    region: Mutex<String>,
    online: AtomicBool,
    conn_updated_at: Mutex<DateTime<Utc>>,
    rx: AtomicU64,
    tx: AtomicU64,
    os: Mutex<String>,
    version: Mutex<String>,
}

impl DeviceHandle {
    pub fn new(
        session_id: SessionId,
        domain: impl Into<String>,
        vmac: impl Into<String>,
        transport: Arc<Websocket>,
    ) -> Self {
        Self {
            session_id,
            domain: domain.into(),
            vmac: vmac.into(),
            transport,
            ip: AtomicU32::new(0),
            ip_text: Mutex::new(String::new()),
            country: Mutex::new(String::new()),
            region: Mutex::new(String::new()),
            online: AtomicBool::new(false),
            conn_updated_at: Mutex::new(Utc::now()),
            rx: AtomicU64::new(0),
            tx: AtomicU64::new(0),
            os: Mutex::new(String::new()),
            version: Mutex::new(String::new()),
        }
    }

    pub fn ip(&self) -> u32 {
        self.ip.load(Ordering::Relaxed)
    }

    pub fn ip_text(&self) -> String {
        self.ip_text.lock().unwrap().clone()
    }

    pub fn set_ip(&self, ip: u32) {
        self.ip.store(ip, Ordering::Relaxed);
        *self.ip_text.lock().unwrap() = Ipv4Addr::from(ip).to_string();
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
        *self.conn_updated_at.lock().unwrap() = Utc::now();
    }

    pub fn add_rx(&self, n: u64) {
        self.rx.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tx(&self, n: u64) {
        self.tx.fetch_add(n, Ordering::Relaxed);
    }

    pub fn rx(&self) -> u64 {
        self.rx.load(Ordering::Relaxed)
    }

    pub fn tx(&self) -> u64 {
        self.tx.load(Ordering::Relaxed)
    }

    pub fn set_location(&self, country: impl Into<String>, region: impl Into<String>) {
        *self.country.lock().unwrap() = country.into();
        *self.region.lock().unwrap() = region.into();
    }

    pub fn update_os_version(&self, os: impl Into<String>, version: impl Into<String>) {
        *self.os.lock().unwrap() = os.into();
        *self.version.lock().unwrap() = version.into();
    }

    /// Loads a previously-persisted row's RX/TX/location/version fields onto
    /// this handle (§4.4 AUTH: `storage.Find(device)`). Called after any
    /// in-memory eviction carry-over, so a reconnecting device's own last
    /// persisted counters take precedence over a same-vmac evictee's
    /// in-memory ones (mirroring the original's field-by-field overwrite).
    pub fn restore_persisted_counters(&self, persisted: &Device) {
        self.rx.store(persisted.rx, Ordering::Relaxed);
        self.tx.store(persisted.tx, Ordering::Relaxed);
        *self.country.lock().unwrap() = persisted.country.clone();
        *self.region.lock().unwrap() = persisted.region.clone();
        *self.os.lock().unwrap() = persisted.os.clone();
        *self.version.lock().unwrap() = persisted.version.clone();
    }

    /// A persistable snapshot, used by `save_device` on AUTH, on disconnect
    /// and by the periodic sync task.
    pub fn snapshot(&self) -> Device {
        Device {
            domain: self.domain.clone(),
            vmac: self.vmac.clone(),
            ip_text: self.ip_text(),
            country: self.country.lock().unwrap().clone(),
            region: self.region.lock().unwrap().clone(),
            online: self.is_online(),
            conn_updated_at: *self.conn_updated_at.lock().unwrap(),
            rx: self.rx.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            os: self.os.lock().unwrap().clone(),
            version: self.version.lock().unwrap().clone(),
            ip: self.ip(),
        }
    }
}
