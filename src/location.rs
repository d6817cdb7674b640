//! IP geolocation lookup (§4.6/C7), used to populate `Device.country` and
//! `Device.region` on AUTH. Mirrors `candy/location.go`: try an online
//! lookup service first, fall back to a local flat-file database keyed by
//! address prefix, and finally give up quietly — geolocation is cosmetic,
//! never a reason to reject a connection.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::RelayResult;
use crate::persistence::PersistenceAdapter;

#[async_trait]
pub trait LocationAdapter: Send + Sync {
    /// Returns `(country, region)` for a dotted-quad address. Implementors
    /// should prefer returning an error over blocking the caller for long;
    /// the handshake handler treats a failure as "unknown location", not a
    /// reason to reject AUTH.
    async fn lookup(&self, ip: &str) -> RelayResult<(String, String)>;
}

#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    #[serde(default)]
    country: String,
    #[serde(default)]
    region: String,
}

/// Looks up addresses against an ipinfo.io-style HTTP API, falling back to
/// a local `ip,country,region` CSV snapshot when the request fails (no
/// network, rate limited, API key revoked, ...). The `Config{Key:"ipinfo"}`
/// row is re-read from persistence on every lookup rather than cached at
/// startup (§4.6) — an admin can add, change or remove the key at runtime
/// and the next lookup picks it up without a restart.
pub struct HttpLocationAdapter {
    client: reqwest::Client,
    persistence: Arc<dyn PersistenceAdapter>,
    fallback: HashMap<u32, (String, String)>,
}

impl HttpLocationAdapter {
    pub fn new(persistence: Arc<dyn PersistenceAdapter>) -> Self {
        Self { client: reqwest::Client::new(), persistence, fallback: HashMap::new() }
    }

    /// Loads a local fallback database from a CSV file of
    /// `start_ip,country,region` rows, one network's first address per row.
    pub fn load_fallback(mut self, path: &Path) -> Self {
        if let Ok(contents) = std::fs::read_to_string(path) {
            for line in contents.lines() {
                let mut parts = line.splitn(3, ',');
                if let (Some(ip), Some(country), Some(region)) = (parts.next(), parts.next(), parts.next()) {
                    if let Ok(addr) = ip.parse::<Ipv4Addr>() {
                        self.fallback.insert(u32::from(addr), (country.to_string(), region.to_string()));
                    }
                }
            }
        }
        self
    }

    /// Falls back to the local file, and finally to empty strings on any
    /// miss (bad address, no fallback database, unknown prefix) — mirroring
    /// `ip2CountryRegion`, which never errors and instead returns `("", "")`
    /// so a failed refresh clears a device's previous location.
    fn fallback_lookup(&self, ip: &str) -> RelayResult<(String, String)> {
        let country_region = ip
            .parse::<Ipv4Addr>()
            .ok()
            .and_then(|addr| self.fallback.get(&u32::from(addr)).cloned())
            .unwrap_or_default();
        Ok(country_region)
    }
}

#[async_trait]
impl LocationAdapter for HttpLocationAdapter {
    async fn lookup(&self, ip: &str) -> RelayResult<(String, String)> {
        // The online service is only consulted when a `Config{Key:"ipinfo"}`
        // row currently exists (§4.6); without one, go straight to the
        // local fallback rather than making an unauthenticated request.
        let key = match self.persistence.config_value("ipinfo").await {
            Ok(Some(key)) => key,
            _ => return self.fallback_lookup(ip),
        };
        let url = format!("https://ipinfo.io/{ip}/json?token={key}");

        let response = self.client.get(&url).send().await;
        match response {
            Ok(resp) => match resp.json::<IpInfoResponse>().await {
                Ok(body) if !body.country.is_empty() => Ok((body.country, body.region)),
                _ => self.fallback_lookup(ip),
            },
            Err(_) => self.fallback_lookup(ip),
        }
    }
}

/// A no-op adapter for domains/deployments that don't care about location
/// (and for tests): always reports unknown.
pub struct NullLocationAdapter;

#[async_trait]
impl LocationAdapter for NullLocationAdapter {
    async fn lookup(&self, _ip: &str) -> RelayResult<(String, String)> {
        Ok((String::new(), String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::state::DomainRecord;
    use crate::device::Device;

    struct NoIpinfoConfig;

    #[async_trait]
    impl PersistenceAdapter for NoIpinfoConfig {
        async fn auto_migrate(&self) -> RelayResult<()> {
            Ok(())
        }
        async fn find_domain(&self, _: &str) -> RelayResult<Option<DomainRecord>> {
            Ok(None)
        }
        async fn delete_domain(&self, _: &str) -> RelayResult<()> {
            Ok(())
        }
        async fn find_device(&self, _: &str, _: &str) -> RelayResult<Option<Device>> {
            Ok(None)
        }
        async fn save_device(&self, _: &Device) -> RelayResult<()> {
            Ok(())
        }
        async fn devices_by_ip(&self, _: &str, _: &str) -> RelayResult<Vec<Device>> {
            Ok(vec![])
        }
        async fn device_owns_ip(&self, _: &str, _: &str) -> RelayResult<bool> {
            Ok(false)
        }
        async fn reset_all_online_false(&self) -> RelayResult<()> {
            Ok(())
        }
        async fn config_value(&self, _: &str) -> RelayResult<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn fallback_file_resolves_known_prefix() {
        let path = std::env::temp_dir().join(format!("overlay-relay-test-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, "10.0.0.1,US,CA\n").unwrap();
        let adapter = HttpLocationAdapter::new(Arc::new(NoIpinfoConfig)).load_fallback(&path);
        let (country, region) = adapter.fallback_lookup("10.0.0.1").unwrap();
        assert_eq!(country, "US");
        assert_eq!(region, "CA");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn lookup_falls_back_when_no_ipinfo_config_row() {
        let path = std::env::temp_dir().join(format!("overlay-relay-test-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, "10.0.0.1,US,CA\n").unwrap();
        let adapter = HttpLocationAdapter::new(Arc::new(NoIpinfoConfig)).load_fallback(&path);
        let (country, region) = adapter.lookup("10.0.0.1").await.unwrap();
        assert_eq!(country, "US");
        assert_eq!(region, "CA");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn fallback_miss_returns_empty_not_error() {
        let adapter = HttpLocationAdapter::new(Arc::new(NoIpinfoConfig));
        let (country, region) = adapter.lookup("10.0.0.1").await.unwrap();
        assert!(country.is_empty() && region.is_empty());
    }

    #[tokio::test]
    async fn null_adapter_always_succeeds_with_unknown() {
        let adapter = NullLocationAdapter;
        let (country, region) = adapter.lookup("10.0.0.1").await.unwrap();
        assert!(country.is_empty() && region.is_empty());
    }
}
