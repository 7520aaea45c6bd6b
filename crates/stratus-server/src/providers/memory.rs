//! In-process provider.
//!
//! Keeps zone records in a named in-memory store shared by every provider
//! instance opened with the same `store` config value. Used for locally
//! managed zones and as the provider double in engine tests, where the
//! test holds a handle to the same store the server operates on.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use serde::Deserialize;

use stratus_common::types::ProviderRecord;
use stratus_common::{Error, Result};

use super::Provider;

type ZoneMap = HashMap<String, Vec<ProviderRecord>>;

static STORES: LazyLock<Mutex<HashMap<String, Arc<Mutex<ZoneMap>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static NEXT_ID: LazyLock<Mutex<u64>> = LazyLock::new(|| Mutex::new(1));

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    store: String,
}

pub(super) fn factory(config: &str) -> Result<Arc<dyn Provider>> {
    let cfg: Config = serde_json::from_str(config)
        .map_err(|e| Error::user(format!("parsing memory provider config: {e}")))?;
    Ok(Arc::new(MemoryProvider::handle(&cfg.store)))
}

#[derive(Clone)]
pub struct MemoryProvider {
    zones: Arc<Mutex<ZoneMap>>,
}

impl MemoryProvider {
    /// A provider over the named shared store, creating it when absent.
    pub fn handle(store: &str) -> Self {
        let mut stores = STORES.lock().expect("store registry poisoned");
        let zones = stores
            .entry(store.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone();
        MemoryProvider { zones }
    }

    /// Replaces the records of a zone outright. Test and seeding hook.
    pub fn put_zone(&self, zone: &str, records: Vec<ProviderRecord>) {
        let mut zones = self.zones.lock().expect("zone map poisoned");
        zones.insert(zone.to_string(), records);
    }

    pub fn records(&self, zone: &str) -> Vec<ProviderRecord> {
        let zones = self.zones.lock().expect("zone map poisoned");
        zones.get(zone).cloned().unwrap_or_default()
    }

    fn next_id() -> String {
        let mut next = NEXT_ID.lock().expect("id counter poisoned");
        let id = *next;
        *next += 1;
        format!("mem-{id}")
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn get_records(&self, zone: &str) -> Result<Vec<ProviderRecord>> {
        Ok(self.records(zone))
    }

    async fn append_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>> {
        let mut zones = self.zones.lock().expect("zone map poisoned");
        let existing = zones.entry(zone.to_string()).or_default();
        let mut created = Vec::with_capacity(records.len());
        for mut record in records {
            if record.id.is_empty() {
                record.id = Self::next_id();
            }
            existing.push(record.clone());
            created.push(record);
        }
        Ok(created)
    }

    async fn set_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>> {
        let mut zones = self.zones.lock().expect("zone map poisoned");
        let existing = zones.entry(zone.to_string()).or_default();
        let mut set = Vec::with_capacity(records.len());
        for mut record in records {
            if record.id.is_empty() {
                // Upsert by (name, type).
                existing
                    .retain(|r| !(r.name == record.name && r.rtype == record.rtype));
                record.id = Self::next_id();
            } else {
                existing.retain(|r| r.id != record.id);
            }
            existing.push(record.clone());
            set.push(record);
        }
        Ok(set)
    }

    async fn delete_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>> {
        let mut zones = self.zones.lock().expect("zone map poisoned");
        let existing = zones.entry(zone.to_string()).or_default();
        let mut deleted = Vec::new();
        for record in records {
            existing.retain(|r| {
                let matched = if !record.id.is_empty() {
                    r.id == record.id
                } else {
                    r.name == record.name
                        && r.rtype == record.rtype
                        && r.value == record.value
                };
                if matched {
                    deleted.push(r.clone());
                }
                !matched
            });
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, rtype: &str, value: &str) -> ProviderRecord {
        ProviderRecord {
            id: String::new(),
            rtype: rtype.to_string(),
            name: name.to_string(),
            value: value.to_string(),
            ttl: 300,
        }
    }

    #[tokio::test]
    async fn append_set_delete() {
        let p = MemoryProvider::handle("append_set_delete");
        let created = p
            .append_records("z.", vec![rec("a", "A", "10.0.0.1")])
            .await
            .unwrap();
        assert!(!created[0].id.is_empty());

        p.append_records("z.", vec![rec("a", "A", "10.0.0.2")]).await.unwrap();
        assert_eq!(p.records("z.").len(), 2);

        // Set by (name, type) replaces both A records.
        p.set_records("z.", vec![rec("a", "A", "10.0.0.3")]).await.unwrap();
        let after = p.records("z.");
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].value, "10.0.0.3");

        let deleted = p
            .delete_records("z.", vec![rec("a", "A", "10.0.0.3")])
            .await
            .unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(p.records("z.").is_empty());
    }

    #[tokio::test]
    async fn handles_share_state() {
        let a = MemoryProvider::handle("shared");
        let b = MemoryProvider::handle("shared");
        a.put_zone("z.", vec![rec("a", "A", "10.0.0.1")]);
        assert_eq!(b.records("z.").len(), 1);
    }
}
