//! Persisted entities.
//!
//! All rows serialize to JSON in the store. Record rows are append-only:
//! a mutation tombstones the prior row (`deleted` + `serial_deleted`) and
//! inserts a replacement stamped with the serial of the SOA that introduced
//! it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record type SOA, as a raw wire value.
pub const RTYPE_SOA: u16 = 6;
/// Record type NS.
pub const RTYPE_NS: u16 = 2;
/// Record type CNAME.
pub const RTYPE_CNAME: u16 = 5;
/// Class INET.
pub const CLASS_IN: u16 = 1;

/// Zone for which records are managed through a provider; the unit of
/// delegation, identified by its absolute lower-case apex name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    /// Absolute name with trailing dot, lower-case. Unique.
    pub name: String,

    /// Name of the [`ProviderConfig`] used to reach the remote zone.
    pub provider_config: String,

    /// Locally managed serial. 0 for newly created zones. Can differ from
    /// `serial_remote`: not all name servers bump serials on change.
    pub serial_local: u32,

    /// Serial as last seen at the remote. Not meaningful when <= 1
    /// (e.g. always for providers that do not expose SOA).
    pub serial_remote: u32,

    /// Last time a sync was attempted.
    pub last_sync: Option<DateTime<Utc>>,

    /// Last time a change in records was detected.
    pub last_record_change: Option<DateTime<Utc>>,

    /// Interval between automatic full syncs of all records.
    #[serde(with = "duration_secs")]
    pub sync_interval: Duration,

    /// Interval between SOA freshness checks. After a detected change,
    /// checks run on an accelerated schedule for one interval.
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,

    pub next_sync: DateTime<Utc>,
    pub next_refresh: DateTime<Utc>,
}

/// Named provider configuration: which provider kind, and its opaque JSON
/// config parsed by the provider factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    /// Registered provider kind, e.g. "memory" or "httpjson".
    pub provider: String,

    /// JSON blob handed to the provider factory.
    pub config: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialKind {
    #[serde(rename = "tsig")]
    Tsig,
    #[serde(rename = "tlspubkey")]
    TlsPublicKey,
}

/// Credential for TSIG or mutual-TLS authentication on the DNS interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub created: DateTime<Utc>,

    /// Unique. Stored without trailing dot for TSIG; the DNS layer appends
    /// it when matching key names.
    pub name: String,

    pub kind: CredentialKind,

    /// Base64-encoded TSIG secret. Empty for TLS credentials.
    pub tsig_secret: String,

    /// Raw-url-base64 SHA-256 of the TLS certificate SubjectPublicKeyInfo.
    /// Empty for TSIG credentials. Indexed.
    pub tls_public_key: String,
}

/// Authorizes a credential to read and change records of a zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneCredential {
    pub id: Uuid,
    pub zone: String,
    pub credential_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyProtocol {
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    Udp,
}

/// Address to send DNS NOTIFY to when a zone change is committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneNotify {
    pub id: Uuid,
    pub created: DateTime<Utc>,
    pub zone: String,
    /// E.g. `127.0.0.1:53`.
    pub address: String,
    pub protocol: NotifyProtocol,
}

/// One version of one DNS record, as discovered through the provider API or
/// written through DNS UPDATE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,

    /// Zone apex name, lower-case.
    pub zone: String,

    /// Serial of the SOA that was live when this row was inserted. For SOA
    /// rows this equals the record's own serial field.
    pub serial_first: u32,

    /// Serial of the SOA that superseded this row. 0 while live.
    pub serial_deleted: u32,

    pub first: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,

    /// Fully qualified, lower-case.
    pub abs_name: String,

    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,

    /// Canonical uncompressed RDATA, hex-encoded.
    pub data_hex: String,

    /// Zone-file text of the RDATA, for humans and providers.
    pub value: String,

    /// Provider-assigned record id, when the provider exposes one.
    pub provider_id: String,
}

/// A record in the shape the provider APIs speak: type mnemonic, name
/// relative to the zone (or absolute with trailing dot), zone-file text
/// value. Provider ids may or may not be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    #[serde(default)]
    pub id: String,
    pub rtype: String,
    pub name: String,
    pub value: String,
    pub ttl: u32,
}

/// Identity of an RRset: every record sharing this key belongs to one set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RrsetKey {
    pub abs_name: String,
    pub rtype: u16,
    pub class: u16,
}

/// Identity of a record value within an RRset, TTL included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub abs_name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data_hex: String,
}

impl Record {
    pub fn rrset_key(&self) -> RrsetKey {
        RrsetKey {
            abs_name: self.abs_name.clone(),
            rtype: self.rtype,
            class: self.class,
        }
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey {
            abs_name: self.abs_name.clone(),
            rtype: self.rtype,
            class: self.class,
            ttl: self.ttl,
            data_hex: self.data_hex.clone(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.deleted.is_none()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Duration,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(de)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys() {
        let r = Record {
            id: Uuid::nil(),
            zone: "z0.example.".into(),
            serial_first: 7,
            serial_deleted: 0,
            first: Utc::now(),
            deleted: None,
            abs_name: "testhost.z0.example.".into(),
            rtype: 1,
            class: CLASS_IN,
            ttl: 300,
            data_hex: "0a000001".into(),
            value: "10.0.0.1".into(),
            provider_id: String::new(),
        };
        let mut other = r.clone();
        other.ttl = 600;
        assert_eq!(r.rrset_key(), other.rrset_key());
        assert_ne!(r.record_key(), other.record_key());
    }

    #[test]
    fn zone_roundtrips_through_json() {
        let z = Zone {
            name: "z0.example.".into(),
            provider_config: "test".into(),
            serial_local: 2024010100,
            serial_remote: 1,
            last_sync: None,
            last_record_change: Some(Utc::now()),
            sync_interval: Duration::from_secs(3600),
            refresh_interval: Duration::from_secs(86400),
            next_sync: Utc::now(),
            next_refresh: Utc::now(),
        };
        let json = serde_json::to_string(&z).unwrap();
        let back: Zone = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, z.name);
        assert_eq!(back.sync_interval, z.sync_interval);
    }
}
