//! Record store: typed, transactional access over redb.
//!
//! ## Table structure
//!
//! ```text
//! zones                  : zone name (string)   -> Zone (JSON)
//! provider_configs       : config name (string) -> ProviderConfig (JSON)
//! credentials            : UUID (bytes)         -> Credential (JSON)
//! credentials_by_name    : name (string)        -> UUID (bytes)
//! credentials_by_tls_key : spki hash (string)   -> UUID (bytes), multimap
//! zone_credentials       : UUID (bytes)         -> ZoneCredential (JSON)
//! zone_credentials_by_zone : zone (string)      -> UUID (bytes), multimap
//! zone_notifies          : UUID (bytes)         -> ZoneNotify (JSON)
//! zone_notifies_by_zone  : zone (string)        -> UUID (bytes), multimap
//! records                : UUID (bytes)         -> Record (JSON)
//! records_by_zone        : zone (string)        -> UUID (bytes), multimap
//! ```
//!
//! All writes go through [`Store::write`], whose closure runs inside a
//! single transaction that commits atomically on success. Callers that
//! also talk to a provider hold the zone lock around the transaction.

use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable,
    TableDefinition,
};
use thiserror::Error;
use uuid::Uuid;

use stratus_common::types::{
    Credential, ProviderConfig, Record, Zone, ZoneCredential, ZoneNotify,
    RTYPE_SOA,
};

const ZONES: TableDefinition<&str, &str> = TableDefinition::new("zones_v1");
const PROVIDER_CONFIGS: TableDefinition<&str, &str> =
    TableDefinition::new("provider_configs_v1");
const CREDENTIALS: TableDefinition<&[u8; 16], &str> =
    TableDefinition::new("credentials_v1");
const CREDENTIALS_BY_NAME: TableDefinition<&str, &[u8; 16]> =
    TableDefinition::new("credentials_by_name_v1");
const CREDENTIALS_BY_TLS_KEY: MultimapTableDefinition<&str, &[u8; 16]> =
    MultimapTableDefinition::new("credentials_by_tls_key_v1");
const ZONE_CREDENTIALS: TableDefinition<&[u8; 16], &str> =
    TableDefinition::new("zone_credentials_v1");
const ZONE_CREDENTIALS_BY_ZONE: MultimapTableDefinition<&str, &[u8; 16]> =
    MultimapTableDefinition::new("zone_credentials_by_zone_v1");
const ZONE_NOTIFIES: TableDefinition<&[u8; 16], &str> =
    TableDefinition::new("zone_notifies_v1");
const ZONE_NOTIFIES_BY_ZONE: MultimapTableDefinition<&str, &[u8; 16]> =
    MultimapTableDefinition::new("zone_notifies_by_zone_v1");
const RECORDS: TableDefinition<&[u8; 16], &str> =
    TableDefinition::new("records_v1");
const RECORDS_BY_ZONE: MultimapTableDefinition<&str, &[u8; 16]> =
    MultimapTableDefinition::new("records_by_zone_v1");

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("reference violation: {0}")]
    Reference(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for stratus_common::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(m) => stratus_common::Error::NotFound(m),
            StoreError::AlreadyExists(m) | StoreError::Reference(m) => {
                stratus_common::Error::UserInput(m)
            }
            StoreError::Database(m) | StoreError::Serialization(m) => {
                stratus_common::Error::Invariant(m)
            }
        }
    }
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// The embedded database. Cheap to clone; all clones share one redb file.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Opens (or creates) the database and ensures all tables exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Database::create(path).map_err(db_err)?;
        let tx = db.begin_write().map_err(db_err)?;
        {
            tx.open_table(ZONES).map_err(db_err)?;
            tx.open_table(PROVIDER_CONFIGS).map_err(db_err)?;
            tx.open_table(CREDENTIALS).map_err(db_err)?;
            tx.open_table(CREDENTIALS_BY_NAME).map_err(db_err)?;
            tx.open_multimap_table(CREDENTIALS_BY_TLS_KEY).map_err(db_err)?;
            tx.open_table(ZONE_CREDENTIALS).map_err(db_err)?;
            tx.open_multimap_table(ZONE_CREDENTIALS_BY_ZONE).map_err(db_err)?;
            tx.open_table(ZONE_NOTIFIES).map_err(db_err)?;
            tx.open_multimap_table(ZONE_NOTIFIES_BY_ZONE).map_err(db_err)?;
            tx.open_table(RECORDS).map_err(db_err)?;
            tx.open_multimap_table(RECORDS_BY_ZONE).map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(Store { db: Arc::new(db) })
    }

    /// Runs a closure against a read transaction.
    pub fn read<T>(&self, f: impl FnOnce(&ReadTx) -> Result<T>) -> Result<T> {
        let tx = self.db.begin_read().map_err(db_err)?;
        f(&ReadTx { tx })
    }

    /// Runs a closure against a write transaction, committing on success.
    /// Any error aborts the transaction; no partial writes survive.
    pub fn write<T>(&self, f: impl FnOnce(&WriteTx) -> Result<T>) -> Result<T> {
        let tx = self.db.begin_write().map_err(db_err)?;
        let wtx = WriteTx { tx };
        let out = f(&wtx)?;
        wtx.tx.commit().map_err(db_err)?;
        Ok(out)
    }

    /// [`Store::read`] from async context.
    pub async fn read_async<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ReadTx) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read(f))
            .await
            .map_err(|e| StoreError::Database(format!("join: {e}")))?
    }

    /// [`Store::write`] from async context.
    pub async fn write_async<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&WriteTx) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.write(f))
            .await
            .map_err(|e| StoreError::Database(format!("join: {e}")))?
    }
}

/// Read-only transaction wrapper.
pub struct ReadTx {
    tx: redb::ReadTransaction,
}

/// Read-write transaction wrapper.
pub struct WriteTx {
    tx: redb::WriteTransaction,
}

// Shared row accessors over any readable table.

fn table_get<T: serde::de::DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static str>,
    key: &str,
    what: &str,
) -> Result<T> {
    match table.get(key).map_err(db_err)? {
        Some(guard) => from_json(guard.value()),
        None => Err(StoreError::NotFound(format!("{what} {key:?}"))),
    }
}

fn table_get_id<T: serde::de::DeserializeOwned>(
    table: &impl ReadableTable<&'static [u8; 16], &'static str>,
    id: Uuid,
    what: &str,
) -> Result<T> {
    match table.get(&id.into_bytes()).map_err(db_err)? {
        Some(guard) => from_json(guard.value()),
        None => Err(StoreError::NotFound(format!("{what} {id}"))),
    }
}

fn ids_for_zone(
    index: &impl ReadableMultimapTable<&'static str, &'static [u8; 16]>,
    zone: &str,
) -> Result<Vec<Uuid>> {
    let mut ids = Vec::new();
    for guard in index.get(zone).map_err(db_err)? {
        ids.push(Uuid::from_bytes(*guard.map_err(db_err)?.value()));
    }
    Ok(ids)
}

macro_rules! read_ops {
    ($ty:ident) => {
        impl $ty {
            pub fn zone(&self, name: &str) -> Result<Zone> {
                table_get(&self.tx.open_table(ZONES).map_err(db_err)?, name, "zone")
            }

            pub fn zones(&self) -> Result<Vec<Zone>> {
                let table = self.tx.open_table(ZONES).map_err(db_err)?;
                let mut out = Vec::new();
                for item in table.iter().map_err(db_err)? {
                    let (_, v) = item.map_err(db_err)?;
                    out.push(from_json(v.value())?);
                }
                Ok(out)
            }

            pub fn provider_config(&self, name: &str) -> Result<ProviderConfig> {
                table_get(
                    &self.tx.open_table(PROVIDER_CONFIGS).map_err(db_err)?,
                    name,
                    "provider config",
                )
            }

            /// A zone together with the provider config it references.
            pub fn zone_and_config(
                &self,
                name: &str,
            ) -> Result<(Zone, ProviderConfig)> {
                let zone = self.zone(name)?;
                let config = self.provider_config(&zone.provider_config)?;
                Ok((zone, config))
            }

            pub fn provider_configs(&self) -> Result<Vec<ProviderConfig>> {
                let table = self.tx.open_table(PROVIDER_CONFIGS).map_err(db_err)?;
                let mut out = Vec::new();
                for item in table.iter().map_err(db_err)? {
                    let (_, v) = item.map_err(db_err)?;
                    out.push(from_json(v.value())?);
                }
                Ok(out)
            }

            pub fn credential(&self, id: Uuid) -> Result<Credential> {
                table_get_id(
                    &self.tx.open_table(CREDENTIALS).map_err(db_err)?,
                    id,
                    "credential",
                )
            }

            pub fn credential_by_name(&self, name: &str) -> Result<Credential> {
                let index =
                    self.tx.open_table(CREDENTIALS_BY_NAME).map_err(db_err)?;
                let id = match index.get(name).map_err(db_err)? {
                    Some(guard) => Uuid::from_bytes(*guard.value()),
                    None => {
                        return Err(StoreError::NotFound(format!(
                            "credential {name:?}"
                        )))
                    }
                };
                self.credential(id)
            }

            pub fn credential_by_tls_key(&self, spki_hash: &str) -> Result<Credential> {
                let index = self
                    .tx
                    .open_multimap_table(CREDENTIALS_BY_TLS_KEY)
                    .map_err(db_err)?;
                for guard in index.get(spki_hash).map_err(db_err)? {
                    let id = Uuid::from_bytes(*guard.map_err(db_err)?.value());
                    return self.credential(id);
                }
                Err(StoreError::NotFound(format!("tls public key {spki_hash:?}")))
            }

            pub fn credentials(&self) -> Result<Vec<Credential>> {
                let table = self.tx.open_table(CREDENTIALS).map_err(db_err)?;
                let mut out = Vec::new();
                for item in table.iter().map_err(db_err)? {
                    let (_, v) = item.map_err(db_err)?;
                    out.push(from_json(v.value())?);
                }
                Ok(out)
            }

            pub fn zone_credentials(&self, zone: &str) -> Result<Vec<ZoneCredential>> {
                let index = self
                    .tx
                    .open_multimap_table(ZONE_CREDENTIALS_BY_ZONE)
                    .map_err(db_err)?;
                let table = self.tx.open_table(ZONE_CREDENTIALS).map_err(db_err)?;
                let mut out = Vec::new();
                for id in ids_for_zone(&index, zone)? {
                    out.push(table_get_id(&table, id, "zone credential")?);
                }
                Ok(out)
            }

            pub fn zone_notifies(&self, zone: &str) -> Result<Vec<ZoneNotify>> {
                let index = self
                    .tx
                    .open_multimap_table(ZONE_NOTIFIES_BY_ZONE)
                    .map_err(db_err)?;
                let table = self.tx.open_table(ZONE_NOTIFIES).map_err(db_err)?;
                let mut out = Vec::new();
                for id in ids_for_zone(&index, zone)? {
                    out.push(table_get_id(&table, id, "zone notify")?);
                }
                Ok(out)
            }

            pub fn zone_notify(&self, id: Uuid) -> Result<ZoneNotify> {
                table_get_id(
                    &self.tx.open_table(ZONE_NOTIFIES).map_err(db_err)?,
                    id,
                    "zone notify",
                )
            }

            pub fn record(&self, id: Uuid) -> Result<Record> {
                table_get_id(&self.tx.open_table(RECORDS).map_err(db_err)?, id, "record")
            }

            /// All record rows of a zone, tombstones included.
            pub fn records_all(&self, zone: &str) -> Result<Vec<Record>> {
                let index =
                    self.tx.open_multimap_table(RECORDS_BY_ZONE).map_err(db_err)?;
                let table = self.tx.open_table(RECORDS).map_err(db_err)?;
                let mut out: Vec<Record> = Vec::new();
                for id in ids_for_zone(&index, zone)? {
                    out.push(table_get_id(&table, id, "record")?);
                }
                // UUIDv7 ids are time-ordered; sort for deterministic output.
                out.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(out)
            }

            /// Live (not tombstoned) record rows of a zone.
            pub fn live_records(&self, zone: &str) -> Result<Vec<Record>> {
                Ok(self
                    .records_all(zone)?
                    .into_iter()
                    .filter(|r| r.is_live())
                    .collect())
            }

            /// The live SOA row at the zone apex, when the zone has one.
            pub fn live_soa(&self, zone: &str) -> Result<Option<Record>> {
                Ok(self.live_records(zone)?.into_iter().find(|r| {
                    r.rtype == RTYPE_SOA && r.abs_name == r.zone
                }))
            }
        }
    };
}

read_ops!(ReadTx);
read_ops!(WriteTx);

impl WriteTx {
    pub fn zone_insert(&self, zone: &Zone) -> Result<()> {
        {
            let configs = self.tx.open_table(PROVIDER_CONFIGS).map_err(db_err)?;
            if configs.get(zone.provider_config.as_str()).map_err(db_err)?.is_none() {
                return Err(StoreError::Reference(format!(
                    "provider config {:?}",
                    zone.provider_config
                )));
            }
        }
        let mut table = self.tx.open_table(ZONES).map_err(db_err)?;
        if table.get(zone.name.as_str()).map_err(db_err)?.is_some() {
            return Err(StoreError::AlreadyExists(format!("zone {:?}", zone.name)));
        }
        table
            .insert(zone.name.as_str(), to_json(zone)?.as_str())
            .map_err(db_err)?;
        Ok(())
    }

    pub fn zone_update(&self, zone: &Zone) -> Result<()> {
        let mut table = self.tx.open_table(ZONES).map_err(db_err)?;
        if table.get(zone.name.as_str()).map_err(db_err)?.is_none() {
            return Err(StoreError::NotFound(format!("zone {:?}", zone.name)));
        }
        table
            .insert(zone.name.as_str(), to_json(zone)?.as_str())
            .map_err(db_err)?;
        Ok(())
    }

    /// Deletes a zone and everything hanging off it: records, notify
    /// targets, and credential links (not the credentials themselves).
    pub fn zone_delete(&self, name: &str) -> Result<()> {
        {
            let mut table = self.tx.open_table(ZONES).map_err(db_err)?;
            if table.remove(name).map_err(db_err)?.is_none() {
                return Err(StoreError::NotFound(format!("zone {name:?}")));
            }
        }
        {
            let mut index =
                self.tx.open_multimap_table(RECORDS_BY_ZONE).map_err(db_err)?;
            let mut table = self.tx.open_table(RECORDS).map_err(db_err)?;
            let ids = ids_for_zone(&index, name)?;
            for id in ids {
                table.remove(&id.into_bytes()).map_err(db_err)?;
            }
            index.remove_all(name).map_err(db_err)?;
        }
        {
            let mut index = self
                .tx
                .open_multimap_table(ZONE_NOTIFIES_BY_ZONE)
                .map_err(db_err)?;
            let mut table = self.tx.open_table(ZONE_NOTIFIES).map_err(db_err)?;
            let ids = ids_for_zone(&index, name)?;
            for id in ids {
                table.remove(&id.into_bytes()).map_err(db_err)?;
            }
            index.remove_all(name).map_err(db_err)?;
        }
        {
            let mut index = self
                .tx
                .open_multimap_table(ZONE_CREDENTIALS_BY_ZONE)
                .map_err(db_err)?;
            let mut table = self.tx.open_table(ZONE_CREDENTIALS).map_err(db_err)?;
            let ids = ids_for_zone(&index, name)?;
            for id in ids {
                table.remove(&id.into_bytes()).map_err(db_err)?;
            }
            index.remove_all(name).map_err(db_err)?;
        }
        Ok(())
    }

    pub fn provider_config_insert(&self, pc: &ProviderConfig) -> Result<()> {
        let mut table = self.tx.open_table(PROVIDER_CONFIGS).map_err(db_err)?;
        if table.get(pc.name.as_str()).map_err(db_err)?.is_some() {
            return Err(StoreError::AlreadyExists(format!(
                "provider config {:?}",
                pc.name
            )));
        }
        table
            .insert(pc.name.as_str(), to_json(pc)?.as_str())
            .map_err(db_err)?;
        Ok(())
    }

    pub fn provider_config_update(&self, pc: &ProviderConfig) -> Result<()> {
        let mut table = self.tx.open_table(PROVIDER_CONFIGS).map_err(db_err)?;
        if table.get(pc.name.as_str()).map_err(db_err)?.is_none() {
            return Err(StoreError::NotFound(format!(
                "provider config {:?}",
                pc.name
            )));
        }
        table
            .insert(pc.name.as_str(), to_json(pc)?.as_str())
            .map_err(db_err)?;
        Ok(())
    }

    pub fn provider_config_delete(&self, name: &str) -> Result<()> {
        for zone in self.zones()? {
            if zone.provider_config == name {
                return Err(StoreError::Reference(format!(
                    "zone {:?} references provider config {name:?}",
                    zone.name
                )));
            }
        }
        let mut table = self.tx.open_table(PROVIDER_CONFIGS).map_err(db_err)?;
        if table.remove(name).map_err(db_err)?.is_none() {
            return Err(StoreError::NotFound(format!("provider config {name:?}")));
        }
        Ok(())
    }

    pub fn credential_insert(&self, cred: &Credential) -> Result<()> {
        {
            let names = self.tx.open_table(CREDENTIALS_BY_NAME).map_err(db_err)?;
            if names.get(cred.name.as_str()).map_err(db_err)?.is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "credential {:?}",
                    cred.name
                )));
            }
        }
        let id = cred.id.into_bytes();
        self.tx
            .open_table(CREDENTIALS)
            .map_err(db_err)?
            .insert(&id, to_json(cred)?.as_str())
            .map_err(db_err)?;
        self.tx
            .open_table(CREDENTIALS_BY_NAME)
            .map_err(db_err)?
            .insert(cred.name.as_str(), &id)
            .map_err(db_err)?;
        if !cred.tls_public_key.is_empty() {
            self.tx
                .open_multimap_table(CREDENTIALS_BY_TLS_KEY)
                .map_err(db_err)?
                .insert(cred.tls_public_key.as_str(), &id)
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Removes a credential and any zone links to it.
    pub fn credential_delete(&self, id: Uuid) -> Result<()> {
        let cred: Credential = {
            let table = self.tx.open_table(CREDENTIALS).map_err(db_err)?;
            table_get_id(&table, id, "credential")?
        };
        self.tx
            .open_table(CREDENTIALS)
            .map_err(db_err)?
            .remove(&id.into_bytes())
            .map_err(db_err)?;
        self.tx
            .open_table(CREDENTIALS_BY_NAME)
            .map_err(db_err)?
            .remove(cred.name.as_str())
            .map_err(db_err)?;
        if !cred.tls_public_key.is_empty() {
            self.tx
                .open_multimap_table(CREDENTIALS_BY_TLS_KEY)
                .map_err(db_err)?
                .remove(cred.tls_public_key.as_str(), &id.into_bytes())
                .map_err(db_err)?;
        }
        // Drop zone links pointing at the credential.
        let links: Vec<ZoneCredential> = {
            let table = self.tx.open_table(ZONE_CREDENTIALS).map_err(db_err)?;
            let mut out = Vec::new();
            for item in table.iter().map_err(db_err)? {
                let (_, v) = item.map_err(db_err)?;
                let link: ZoneCredential = from_json(v.value())?;
                if link.credential_id == id {
                    out.push(link);
                }
            }
            out
        };
        for link in links {
            self.zone_credential_delete(link.id)?;
        }
        Ok(())
    }

    pub fn zone_credential_insert(&self, link: &ZoneCredential) -> Result<()> {
        self.zone(&link.zone)?;
        self.credential(link.credential_id)?;
        self.tx
            .open_table(ZONE_CREDENTIALS)
            .map_err(db_err)?
            .insert(&link.id.into_bytes(), to_json(link)?.as_str())
            .map_err(db_err)?;
        self.tx
            .open_multimap_table(ZONE_CREDENTIALS_BY_ZONE)
            .map_err(db_err)?
            .insert(link.zone.as_str(), &link.id.into_bytes())
            .map_err(db_err)?;
        Ok(())
    }

    pub fn zone_credential_delete(&self, id: Uuid) -> Result<()> {
        let link: ZoneCredential = {
            let table = self.tx.open_table(ZONE_CREDENTIALS).map_err(db_err)?;
            table_get_id(&table, id, "zone credential")?
        };
        self.tx
            .open_table(ZONE_CREDENTIALS)
            .map_err(db_err)?
            .remove(&id.into_bytes())
            .map_err(db_err)?;
        self.tx
            .open_multimap_table(ZONE_CREDENTIALS_BY_ZONE)
            .map_err(db_err)?
            .remove(link.zone.as_str(), &id.into_bytes())
            .map_err(db_err)?;
        Ok(())
    }

    pub fn zone_notify_insert(&self, zn: &ZoneNotify) -> Result<()> {
        self.zone(&zn.zone)?;
        self.tx
            .open_table(ZONE_NOTIFIES)
            .map_err(db_err)?
            .insert(&zn.id.into_bytes(), to_json(zn)?.as_str())
            .map_err(db_err)?;
        self.tx
            .open_multimap_table(ZONE_NOTIFIES_BY_ZONE)
            .map_err(db_err)?
            .insert(zn.zone.as_str(), &zn.id.into_bytes())
            .map_err(db_err)?;
        Ok(())
    }

    pub fn zone_notify_delete(&self, id: Uuid) -> Result<()> {
        let zn: ZoneNotify = {
            let table = self.tx.open_table(ZONE_NOTIFIES).map_err(db_err)?;
            table_get_id(&table, id, "zone notify")?
        };
        self.tx
            .open_table(ZONE_NOTIFIES)
            .map_err(db_err)?
            .remove(&id.into_bytes())
            .map_err(db_err)?;
        self.tx
            .open_multimap_table(ZONE_NOTIFIES_BY_ZONE)
            .map_err(db_err)?
            .remove(zn.zone.as_str(), &id.into_bytes())
            .map_err(db_err)?;
        Ok(())
    }

    pub fn record_insert(&self, record: &Record) -> Result<()> {
        self.tx
            .open_table(RECORDS)
            .map_err(db_err)?
            .insert(&record.id.into_bytes(), to_json(record)?.as_str())
            .map_err(db_err)?;
        self.tx
            .open_multimap_table(RECORDS_BY_ZONE)
            .map_err(db_err)?
            .insert(record.zone.as_str(), &record.id.into_bytes())
            .map_err(db_err)?;
        Ok(())
    }

    pub fn record_update(&self, record: &Record) -> Result<()> {
        let mut table = self.tx.open_table(RECORDS).map_err(db_err)?;
        if table.get(&record.id.into_bytes()).map_err(db_err)?.is_none() {
            return Err(StoreError::NotFound(format!("record {}", record.id)));
        }
        table
            .insert(&record.id.into_bytes(), to_json(record)?.as_str())
            .map_err(db_err)?;
        Ok(())
    }

    /// Deletes tombstoned rows of a zone, keeping live records.
    pub fn purge_history(&self, zone: &str) -> Result<usize> {
        let stale: Vec<Uuid> = self
            .records_all(zone)?
            .into_iter()
            .filter(|r| !r.is_live())
            .map(|r| r.id)
            .collect();
        let mut index =
            self.tx.open_multimap_table(RECORDS_BY_ZONE).map_err(db_err)?;
        let mut table = self.tx.open_table(RECORDS).map_err(db_err)?;
        for id in &stale {
            table.remove(&id.into_bytes()).map_err(db_err)?;
            index.remove(zone, &id.into_bytes()).map_err(db_err)?;
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests;
