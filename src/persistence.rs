//! Façade over an embedded SQL store for `Device`, `Domain` and `Config`
//! rows (§4.5/C6). Generalizes the teacher's generic `DataPool`/`DbManager`
//! pair (built for an arbitrary `Data` record) into the concrete operation
//! surface the relay core actually calls: upsert-by-primary-key, point
//! lookups, the set-based lookups the DHCP allocator needs, and the
//! single `reset_all_online_false` bulk update run once at startup.
//!
//! The relay core depends on the `PersistenceAdapter` trait, not on this
//! module's mysql-backed implementation, so tests can substitute an
//! in-memory fake.

use async_trait::async_trait;
use chrono::Utc;
use mysql::prelude::Queryable;
use mysql::{params, Opts, Pool};

use crate::device::Device;
use crate::domain::state::DomainRecord;
use crate::error::RelayError;

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn auto_migrate(&self) -> Result<(), RelayError>;

    async fn find_domain(&self, name: &str) -> Result<Option<DomainRecord>, RelayError>;
    async fn delete_domain(&self, name: &str) -> Result<(), RelayError>;

    async fn find_device(&self, domain: &str, vmac: &str) -> Result<Option<Device>, RelayError>;
    async fn save_device(&self, device: &Device) -> Result<(), RelayError>;
    /// Devices in `domain` currently holding `ip_text`. Used by the DHCP
    /// reuse-vs-allocate decision (§4.4).
    async fn devices_by_ip(&self, domain: &str, ip_text: &str) -> Result<Vec<Device>, RelayError>;
    /// Whether any persisted device in `domain` already owns `ip_text`.
    /// Used by the DHCP allocation sweep.
    async fn device_owns_ip(&self, domain: &str, ip_text: &str) -> Result<bool, RelayError>;
    /// Reset every persisted device's `online` flag to false. Run once at
    /// startup: the previous process's live connections are gone.
    async fn reset_all_online_false(&self) -> Result<(), RelayError>;

    async fn config_value(&self, key: &str) -> Result<Option<String>, RelayError>;
}

pub struct MySqlPersistence {
    pool: Pool,
}

impl MySqlPersistence {
    pub fn connect(dsn: &str) -> Result<Self, RelayError> {
        let opts = Opts::from_url(dsn).map_err(|e| RelayError::persistence(e.to_string()))?;
        let pool = Pool::new(opts).map_err(|e| RelayError::persistence(e.to_string()))?;
        Ok(Self { pool })
    }

    fn get_conn(&self) -> Result<mysql::PooledConn, RelayError> {
        self.pool.get_conn().map_err(|e| RelayError::persistence(e.to_string()))
    }
}

#[async_trait]
impl PersistenceAdapter for MySqlPersistence {
    async fn auto_migrate(&self) -> Result<(), RelayError> {
        let mut conn = self.get_conn()?;
        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS domains (
                name VARCHAR(255) PRIMARY KEY,
                password VARBINARY(255),
                dhcp VARCHAR(64),
                broadcast BOOLEAN
            )",
        )
        .map_err(|e| RelayError::persistence(e.to_string()))?;
        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS devices (
                domain VARCHAR(255),
                vmac VARCHAR(16),
                ip VARCHAR(15),
                country VARCHAR(8),
                region VARCHAR(64),
                online BOOLEAN,
                conn_updated_at VARCHAR(32),
                rx BIGINT UNSIGNED,
                tx BIGINT UNSIGNED,
                os VARCHAR(32),
                version VARCHAR(32),
                PRIMARY KEY (domain, vmac)
            )",
        )
        .map_err(|e| RelayError::persistence(e.to_string()))?;
        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS configs (
                `key` VARCHAR(255) PRIMARY KEY,
                value VARCHAR(255)
            )",
        )
        .map_err(|e| RelayError::persistence(e.to_string()))?;
        Ok(())
    }

    async fn find_domain(&self, name: &str) -> Result<Option<DomainRecord>, RelayError> {
        let mut conn = self.get_conn()?;
        let row: Option<(String, Vec<u8>, String, bool)> = conn
            .exec_first(
                "SELECT name, password, dhcp, broadcast FROM domains WHERE name = :name",
                params! { "name" => name },
            )
            .map_err(|e| RelayError::persistence(e.to_string()))?;
        Ok(row.map(|(name, password, dhcp, broadcast)| DomainRecord { name, password, dhcp, broadcast }))
    }

    async fn delete_domain(&self, name: &str) -> Result<(), RelayError> {
        let mut conn = self.get_conn()?;
        conn.exec_drop("DELETE FROM domains WHERE name = :name", params! { "name" => name })
            .map_err(|e| RelayError::persistence(e.to_string()))
    }

    async fn find_device(&self, domain: &str, vmac: &str) -> Result<Option<Device>, RelayError> {
        let mut conn = self.get_conn()?;
        let row: Option<(String, String, String, String, bool, String, u64, u64, String, String)> = conn
            .exec_first(
                "SELECT domain, vmac, ip, country, region, online, conn_updated_at, rx, tx, os, version
                 FROM devices WHERE domain = :domain AND vmac = :vmac",
                params! { "domain" => domain, "vmac" => vmac },
            )
            .map_err(|e| RelayError::persistence(e.to_string()))?;
        Ok(row.map(row_to_device))
    }

    async fn save_device(&self, device: &Device) -> Result<(), RelayError> {
        let mut conn = self.get_conn()?;
        conn.exec_drop(
            "INSERT INTO devices (domain, vmac, ip, country, region, online, conn_updated_at, rx, tx, os, version)
             VALUES (:domain, :vmac, :ip, :country, :region, :online, :conn_updated_at, :rx, :tx, :os, :version)
             ON DUPLICATE KEY UPDATE
                ip = VALUES(ip), country = VALUES(country), region = VALUES(region),
                online = VALUES(online), conn_updated_at = VALUES(conn_updated_at),
                rx = VALUES(rx), tx = VALUES(tx), os = VALUES(os), version = VALUES(version)",
            params! {
                "domain" => &device.domain,
                "vmac" => &device.vmac,
                "ip" => &device.ip_text,
                "country" => &device.country,
                "region" => &device.region,
                "online" => device.online,
                "conn_updated_at" => device.conn_updated_at.to_rfc3339(),
                "rx" => device.rx,
                "tx" => device.tx,
                "os" => &device.os,
                "version" => &device.version,
            },
        )
        .map_err(|e| RelayError::persistence(e.to_string()))
    }

    async fn devices_by_ip(&self, domain: &str, ip_text: &str) -> Result<Vec<Device>, RelayError> {
        let mut conn = self.get_conn()?;
        let rows: Vec<(String, String, String, String, bool, String, u64, u64, String, String)> = conn
            .exec(
                "SELECT domain, vmac, ip, country, region, online, conn_updated_at, rx, tx, os, version
                 FROM devices WHERE domain = :domain AND ip = :ip",
                params! { "domain" => domain, "ip" => ip_text },
            )
            .map_err(|e| RelayError::persistence(e.to_string()))?;
        Ok(rows.into_iter().map(row_to_device).collect())
    }

    async fn device_owns_ip(&self, domain: &str, ip_text: &str) -> Result<bool, RelayError> {
        let mut conn = self.get_conn()?;
        let count: Option<i64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM devices WHERE domain = :domain AND ip = :ip",
                params! { "domain" => domain, "ip" => ip_text },
            )
            .map_err(|e| RelayError::persistence(e.to_string()))?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn reset_all_online_false(&self) -> Result<(), RelayError> {
        let mut conn = self.get_conn()?;
        conn.query_drop("UPDATE devices SET online = FALSE WHERE online = TRUE")
            .map_err(|e| RelayError::persistence(e.to_string()))
    }

    async fn config_value(&self, key: &str) -> Result<Option<String>, RelayError> {
        let mut conn = self.get_conn()?;
        conn.exec_first("SELECT value FROM configs WHERE `key` = :key", params! { "key" => key })
            .map_err(|e| RelayError::persistence(e.to_string()))
    }
}

#[allow(clippy::type_complexity)]
fn row_to_device(row: (String, String, String, String, bool, String, u64, u64, String, String)) -> Device {
    let (domain, vmac, ip_text, country, region, online, conn_updated_at, rx, tx, os, version) = row;
    let ip: u32 = ip_text.parse::<std::net::Ipv4Addr>().map(u32::from).unwrap_or(0);
    Device {
        domain,
        vmac,
        ip_text,
        country,
        region,
        online,
        conn_updated_at: chrono::DateTime::parse_from_rfc3339(&conn_updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        rx,
        tx,
        os,
        version,
        ip,
    }
}
