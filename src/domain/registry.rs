//! The process-wide domain cache (§4.3/C3): a single `name -> Arc<Domain>`
//! map behind one `tokio::sync::Mutex`, generalizing the teacher's
//! `DbManager`-backed singleton registries into a lazily-populated,
//! persistence-backed cache. Any task can hold an `Arc<Domain>` across
//! `.await` points once looked up; the registry itself is only touched for
//! the lookup, insert, delete and periodic sync operations.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::domain::state::Domain;
use crate::error::RelayResult;
use crate::persistence::PersistenceAdapter;

pub struct DomainRegistry {
    persistence: Arc<dyn PersistenceAdapter>,
    cache: Mutex<HashMap<String, Arc<Domain>>>,
}

impl DomainRegistry {
    pub fn new(persistence: Arc<dyn PersistenceAdapter>) -> Self {
        Self { persistence, cache: Mutex::new(HashMap::new()) }
    }

    /// Looks up a domain by name, populating the cache from persistence on
    /// a miss. Returns `Ok(None)` both when the domain doesn't exist and
    /// when it exists but is unusable (a DHCP CIDR with fewer than two
    /// host addresses, §I6) — callers treat both as "no such domain".
    pub async fn get_domain(&self, name: &str) -> RelayResult<Option<Arc<Domain>>> {
        {
            let cache = self.cache.lock().await;
            if let Some(domain) = cache.get(name) {
                return Ok(Some(domain.clone()));
            }
        }

        let record = match self.persistence.find_domain(name).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let domain = match Domain::from_record(record) {
            Some(domain) => Arc::new(domain),
            None => {
                warn!("domain {name} has an unusable dhcp cidr, refusing connections");
                return Ok(None);
            }
        };

        let mut cache = self.cache.lock().await;
        let domain = cache.entry(name.to_string()).or_insert(domain).clone();
        Ok(Some(domain))
    }

    /// Evicts a domain from the cache and drops its persisted row, closing
    /// every live connection first (§4.3). A subsequent `get_domain` for the
    /// same name either fails (row gone) or reconstructs a fresh `Domain`.
    pub async fn delete_domain(&self, name: &str) -> RelayResult<()> {
        let domain = {
            let mut cache = self.cache.lock().await;
            cache.remove(name)
        };
        if let Some(domain) = domain {
            let tables = domain.read().await;
            for handle in tables.ws_device_map.values() {
                handle.transport.close().await;
            }
        }
        self.persistence.delete_domain(name).await
    }

    /// Persists the counters and state of every online device across every
    /// cached domain. Run on a fixed interval by the bootstrap task (§4.7).
    pub async fn sync(&self) {
        let domains: Vec<Arc<Domain>> = {
            let cache = self.cache.lock().await;
            cache.values().cloned().collect()
        };
        for domain in domains {
            let handles: Vec<_> = {
                let tables = domain.read().await;
                tables.ws_device_map.values().cloned().collect()
            };
            for handle in handles {
                if handle.is_online() {
                    if let Err(e) = self.persistence.save_device(&handle.snapshot()).await {
                        warn!("sync: failed to persist device {}/{}: {e}", handle.domain, handle.vmac);
                    }
                }
            }
        }
        info!("domain sync complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::domain::state::DomainRecord;
    use crate::error::RelayError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakePersistence {
        domains: StdMutex<HashMap<String, DomainRecord>>,
    }

    #[async_trait]
    impl PersistenceAdapter for FakePersistence {
        async fn auto_migrate(&self) -> RelayResult<()> {
            Ok(())
        }
        async fn find_domain(&self, name: &str) -> RelayResult<Option<DomainRecord>> {
            Ok(self.domains.lock().unwrap().get(name).cloned())
        }
        async fn delete_domain(&self, name: &str) -> RelayResult<()> {
            self.domains.lock().unwrap().remove(name);
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

    fn fake(records: Vec<DomainRecord>) -> Arc<dyn PersistenceAdapter> {
        let mut map = HashMap::new();
        for r in records {
            map.insert(r.name.clone(), r);
        }
        Arc::new(FakePersistence { domains: StdMutex::new(map) })
    }

    #[tokio::test]
    async fn missing_domain_returns_none() {
        let registry = DomainRegistry::new(fake(vec![]));
        assert!(registry.get_domain("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn caches_after_first_lookup() {
        let registry = DomainRegistry::new(fake(vec![DomainRecord {
            name: "d".into(),
            password: b"pw".to_vec(),
            dhcp: String::new(),
            broadcast: false,
        }]));
        let a = registry.get_domain("d").await.unwrap().unwrap();
        let b = registry.get_domain("d").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn unusable_dhcp_cidr_is_treated_as_missing() {
        let registry = DomainRegistry::new(fake(vec![DomainRecord {
            name: "d".into(),
            password: b"pw".to_vec(),
            dhcp: "10.0.0.0/31".into(),
            broadcast: false,
        }]));
        assert!(registry.get_domain("d").await.unwrap().is_none());
    }
}
