use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use stratus_common::types::{
    Credential, CredentialKind, NotifyProtocol, ProviderConfig, Record, Zone,
    ZoneCredential, ZoneNotify, CLASS_IN, RTYPE_SOA,
};

use super::{Store, StoreError};

fn test_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().join("stratus.db")).expect("open store");
    (dir, store)
}

fn test_zone(name: &str) -> Zone {
    Zone {
        name: name.to_string(),
        provider_config: "test".to_string(),
        serial_local: 0,
        serial_remote: 0,
        last_sync: None,
        last_record_change: None,
        sync_interval: Duration::from_secs(3600),
        refresh_interval: Duration::from_secs(86400),
        next_sync: Utc::now(),
        next_refresh: Utc::now(),
    }
}

fn test_config() -> ProviderConfig {
    ProviderConfig {
        name: "test".to_string(),
        provider: "memory".to_string(),
        config: "{}".to_string(),
    }
}

fn test_record(zone: &str, name: &str, rtype: u16) -> Record {
    Record {
        id: Uuid::now_v7(),
        zone: zone.to_string(),
        serial_first: 1,
        serial_deleted: 0,
        first: Utc::now(),
        deleted: None,
        abs_name: name.to_string(),
        rtype,
        class: CLASS_IN,
        ttl: 300,
        data_hex: "0a000001".to_string(),
        value: "10.0.0.1".to_string(),
        provider_id: String::new(),
    }
}

#[test]
fn zone_requires_provider_config() {
    let (_dir, store) = test_store();
    let err = store
        .write(|tx| tx.zone_insert(&test_zone("z0.example.")))
        .unwrap_err();
    assert!(matches!(err, StoreError::Reference(_)));

    store
        .write(|tx| {
            tx.provider_config_insert(&test_config())?;
            tx.zone_insert(&test_zone("z0.example."))
        })
        .unwrap();

    let err = store
        .write(|tx| tx.zone_insert(&test_zone("z0.example.")))
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));

    let zone = store.read(|tx| tx.zone("z0.example.")).unwrap();
    assert_eq!(zone.provider_config, "test");
}

#[test]
fn failed_write_aborts_whole_transaction() {
    let (_dir, store) = test_store();
    store.write(|tx| tx.provider_config_insert(&test_config())).unwrap();

    let err = store.write(|tx| {
        tx.zone_insert(&test_zone("z0.example."))?;
        Err::<(), _>(StoreError::Database("boom".into()))
    });
    assert!(err.is_err());
    // The zone insert from the failed transaction must not be visible.
    assert!(matches!(
        store.read(|tx| tx.zone("z0.example.")),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn records_live_and_soa() {
    let (_dir, store) = test_store();
    store
        .write(|tx| {
            tx.provider_config_insert(&test_config())?;
            tx.zone_insert(&test_zone("z0.example."))
        })
        .unwrap();

    let mut soa = test_record("z0.example.", "z0.example.", RTYPE_SOA);
    let a = test_record("z0.example.", "testhost.z0.example.", 1);
    let mut tombstoned = test_record("z0.example.", "old.z0.example.", 1);
    tombstoned.deleted = Some(Utc::now());
    tombstoned.serial_deleted = 2;

    store
        .write(|tx| {
            tx.record_insert(&soa)?;
            tx.record_insert(&a)?;
            tx.record_insert(&tombstoned)
        })
        .unwrap();

    let live = store.read(|tx| tx.live_records("z0.example.")).unwrap();
    assert_eq!(live.len(), 2);
    let found = store.read(|tx| tx.live_soa("z0.example.")).unwrap().unwrap();
    assert_eq!(found.id, soa.id);
    let all = store.read(|tx| tx.records_all("z0.example.")).unwrap();
    assert_eq!(all.len(), 3);

    // Tombstoning the SOA makes live_soa come up empty.
    soa.deleted = Some(Utc::now());
    store.write(|tx| tx.record_update(&soa)).unwrap();
    assert!(store.read(|tx| tx.live_soa("z0.example.")).unwrap().is_none());

    let purged = store.write(|tx| tx.purge_history("z0.example.")).unwrap();
    assert_eq!(purged, 2);
    assert_eq!(store.read(|tx| tx.records_all("z0.example.")).unwrap().len(), 1);
}

#[test]
fn zone_delete_cascades() {
    let (_dir, store) = test_store();
    let cred = Credential {
        id: Uuid::now_v7(),
        created: Utc::now(),
        name: "z0.example".to_string(),
        kind: CredentialKind::Tsig,
        tsig_secret: "c2VjcmV0".to_string(),
        tls_public_key: String::new(),
    };
    store
        .write(|tx| {
            tx.provider_config_insert(&test_config())?;
            tx.zone_insert(&test_zone("z0.example."))?;
            tx.record_insert(&test_record("z0.example.", "z0.example.", RTYPE_SOA))?;
            tx.credential_insert(&cred)?;
            tx.zone_credential_insert(&ZoneCredential {
                id: Uuid::now_v7(),
                zone: "z0.example.".to_string(),
                credential_id: cred.id,
            })?;
            tx.zone_notify_insert(&ZoneNotify {
                id: Uuid::now_v7(),
                created: Utc::now(),
                zone: "z0.example.".to_string(),
                address: "127.0.0.1:53".to_string(),
                protocol: NotifyProtocol::Udp,
            })
        })
        .unwrap();

    store.write(|tx| tx.zone_delete("z0.example.")).unwrap();

    store
        .read(|tx| {
            assert!(tx.records_all("z0.example.")?.is_empty());
            assert!(tx.zone_notifies("z0.example.")?.is_empty());
            assert!(tx.zone_credentials("z0.example.")?.is_empty());
            // The credential itself survives the zone.
            tx.credential_by_name("z0.example")?;
            Ok(())
        })
        .unwrap();
}

#[test]
fn credentials_by_name_and_tls_key() {
    let (_dir, store) = test_store();
    let tls = Credential {
        id: Uuid::now_v7(),
        created: Utc::now(),
        name: "operator-cert".to_string(),
        kind: CredentialKind::TlsPublicKey,
        tsig_secret: String::new(),
        tls_public_key: "AbCdEf012345".to_string(),
    };
    store.write(|tx| tx.credential_insert(&tls)).unwrap();

    let found = store
        .read(|tx| tx.credential_by_tls_key("AbCdEf012345"))
        .unwrap();
    assert_eq!(found.id, tls.id);

    let err = store
        .write(|tx| {
            tx.credential_insert(&Credential {
                id: Uuid::now_v7(),
                ..tls.clone()
            })
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));

    store.write(|tx| tx.credential_delete(tls.id)).unwrap();
    assert!(store.read(|tx| tx.credential_by_tls_key("AbCdEf012345")).is_err());
    assert!(store.read(|tx| tx.credential_by_name("operator-cert")).is_err());
}

#[test]
fn provider_config_delete_guarded_by_references() {
    let (_dir, store) = test_store();
    store
        .write(|tx| {
            tx.provider_config_insert(&test_config())?;
            tx.zone_insert(&test_zone("z0.example."))
        })
        .unwrap();
    let err = store.write(|tx| tx.provider_config_delete("test")).unwrap_err();
    assert!(matches!(err, StoreError::Reference(_)));

    store.write(|tx| tx.zone_delete("z0.example.")).unwrap();
    store.write(|tx| tx.provider_config_delete("test")).unwrap();
}
