use std::time::Duration;

use chrono::Utc;

use stratus_common::types::{
    ProviderConfig, ProviderRecord, Zone, RTYPE_SOA,
};

use super::{check_done, date_serial, sync_records};
use crate::store::Store;

const ZONE: &str = "z0.example.";

fn test_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().join("stratus.db")).expect("open store");
    store
        .write(|tx| {
            tx.provider_config_insert(&ProviderConfig {
                name: "test".into(),
                provider: "memory".into(),
                config: "{}".into(),
            })?;
            tx.zone_insert(&test_zone())
        })
        .expect("seed store");
    (dir, store)
}

fn test_zone() -> Zone {
    Zone {
        name: ZONE.into(),
        provider_config: "test".into(),
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

fn pr(name: &str, rtype: &str, value: &str) -> ProviderRecord {
    ProviderRecord {
        id: String::new(),
        rtype: rtype.into(),
        name: name.into(),
        value: value.into(),
        ttl: 300,
    }
}

fn soa(serial: u32) -> ProviderRecord {
    pr(
        "@",
        "SOA",
        &format!("ns0.{ZONE} mail.{ZONE} {serial} 3600 300 1209600 300"),
    )
}

#[test]
fn initial_sync_inserts_records_and_soa() {
    let (_dir, store) = test_store();
    let latest = vec![soa(7), pr("testhost", "A", "10.0.0.1")];

    let outcome = store
        .write(|tx| {
            sync_records(tx, &tx.zone(ZONE)?, &latest)
                .map_err(|e| crate::store::StoreError::Database(e.to_string()))
        })
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.soa.serial_first, 7);
    assert_eq!(outcome.inserted.len(), 1);

    store
        .read(|tx| {
            let live = tx.live_records(ZONE)?;
            assert_eq!(live.len(), 2);
            let soa = tx.live_soa(ZONE)?.expect("live soa");
            assert_eq!(soa.serial_first, 7);
            for r in &live {
                assert_eq!(r.serial_first, soa.serial_first);
            }
            let z = tx.zone(ZONE)?;
            assert_eq!(z.serial_local, 7);
            assert_eq!(z.serial_remote, 7);
            assert!(z.last_record_change.is_some());
            assert!(z.last_sync.is_some());
            Ok(())
        })
        .unwrap();
}

#[test]
fn unchanged_sync_is_a_noop() {
    let (_dir, store) = test_store();
    let latest = vec![soa(7), pr("testhost", "A", "10.0.0.1")];

    store
        .write(|tx| {
            sync_records(tx, &tx.zone(ZONE)?, &latest)
                .map_err(|e| crate::store::StoreError::Database(e.to_string()))?;
            Ok(())
        })
        .unwrap();

    let rows_before =
        store.read(|tx| tx.records_all(ZONE)).unwrap().len();
    let outcome = store
        .write(|tx| {
            sync_records(tx, &tx.zone(ZONE)?, &latest)
                .map_err(|e| crate::store::StoreError::Database(e.to_string()))
        })
        .unwrap();
    assert!(!outcome.changed);
    assert!(outcome.inserted.is_empty());
    assert!(outcome.deleted.is_empty());
    // Same serial, no new rows.
    assert_eq!(store.read(|tx| tx.records_all(ZONE)).unwrap().len(), rows_before);
    assert_eq!(store.read(|tx| tx.zone(ZONE)).unwrap().serial_local, 7);
}

#[test]
fn removed_record_is_tombstoned_with_new_serial() {
    let (_dir, store) = test_store();
    store
        .write(|tx| {
            sync_records(
                tx,
                &tx.zone(ZONE)?,
                &[
                    soa(7),
                    pr("testhost", "A", "10.0.0.1"),
                    pr("testhost", "A", "10.0.0.2"),
                ],
            )
            .map_err(|e| crate::store::StoreError::Database(e.to_string()))?;
            Ok(())
        })
        .unwrap();

    // Remote dropped 10.0.0.2 and bumped the serial.
    let outcome = store
        .write(|tx| {
            sync_records(
                tx,
                &tx.zone(ZONE)?,
                &[soa(8), pr("testhost", "A", "10.0.0.1")],
            )
            .map_err(|e| crate::store::StoreError::Database(e.to_string()))
        })
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.soa.serial_first, 8);
    // The whole rrset is replaced: two tombstones, one reinsert.
    assert_eq!(outcome.deleted.len(), 2);
    assert_eq!(outcome.inserted.len(), 1);

    store
        .read(|tx| {
            let all = tx.records_all(ZONE)?;
            for r in all.iter().filter(|r| !r.is_live()) {
                if r.rtype != RTYPE_SOA {
                    assert_eq!(r.serial_deleted, 8);
                }
            }
            let live: Vec<_> =
                all.iter().filter(|r| r.is_live() && r.rtype != RTYPE_SOA).collect();
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].value, "10.0.0.1");
            assert_eq!(live[0].serial_first, 8);
            Ok(())
        })
        .unwrap();
}

#[test]
fn fabricates_serial_when_remote_serial_unusable() {
    let (_dir, store) = test_store();
    // Providers like route53 report serial 1 forever.
    let outcome = store
        .write(|tx| {
            sync_records(
                tx,
                &tx.zone(ZONE)?,
                &[soa(1), pr("testhost", "A", "10.0.0.1")],
            )
            .map_err(|e| crate::store::StoreError::Database(e.to_string()))
        })
        .unwrap();
    let today = date_serial(Utc::now());
    assert_eq!(outcome.soa.serial_first, today);

    // A record change without a remote serial bump advances locally.
    let outcome = store
        .write(|tx| {
            sync_records(
                tx,
                &tx.zone(ZONE)?,
                &[soa(1), pr("testhost", "A", "10.0.0.2")],
            )
            .map_err(|e| crate::store::StoreError::Database(e.to_string()))
        })
        .unwrap();
    assert!(outcome.changed);
    assert!(outcome.soa.serial_first > today);
    let z = store.read(|tx| tx.zone(ZONE)).unwrap();
    assert_eq!(z.serial_local, outcome.soa.serial_first);
    assert_eq!(z.serial_remote, 1);
}

#[test]
fn out_of_zone_absolute_name_is_rejected() {
    let (_dir, store) = test_store();
    let err = store.write(|tx| {
        sync_records(
            tx,
            &tx.zone(ZONE)?,
            &[soa(7), pr("host.other.example.", "A", "10.0.0.1")],
        )
        .map_err(|e| crate::store::StoreError::Database(e.to_string()))?;
        Ok(())
    });
    assert!(err.is_err());
    // Nothing was committed.
    assert!(store.read(|tx| tx.records_all(ZONE)).unwrap().is_empty());
}

#[test]
fn duplicate_soa_from_axfr_kept_once() {
    let (_dir, store) = test_store();
    let outcome = store
        .write(|tx| {
            sync_records(
                tx,
                &tx.zone(ZONE)?,
                &[soa(7), pr("testhost", "A", "10.0.0.1"), soa(7)],
            )
            .map_err(|e| crate::store::StoreError::Database(e.to_string()))
        })
        .unwrap();
    assert!(outcome.changed);
    let soas = store
        .read(|tx| {
            Ok(tx
                .live_records(ZONE)?
                .into_iter()
                .filter(|r| r.rtype == RTYPE_SOA)
                .count())
        })
        .unwrap();
    assert_eq!(soas, 1);
}

#[test]
fn missing_soa_fails() {
    let (_dir, store) = test_store();
    let err = store.write(|tx| {
        sync_records(tx, &tx.zone(ZONE)?, &[pr("testhost", "A", "10.0.0.1")])
            .map_err(|e| crate::store::StoreError::Database(e.to_string()))?;
        Ok(())
    });
    assert!(err.is_err());
}

#[test]
fn next_sync_respects_minimum() {
    let (_dir, store) = test_store();
    store
        .write(|tx| {
            let mut z = tx.zone(ZONE)?;
            z.sync_interval = Duration::from_secs(1);
            tx.zone_update(&z)
        })
        .unwrap();
    let before = Utc::now();
    store
        .write(|tx| {
            sync_records(tx, &tx.zone(ZONE)?, &[soa(7)])
                .map_err(|e| crate::store::StoreError::Database(e.to_string()))?;
            Ok(())
        })
        .unwrap();
    let z = store.read(|tx| tx.zone(ZONE)).unwrap();
    assert!(z.next_sync >= before + chrono::Duration::seconds(60));
}

#[test]
fn check_done_matches_adds_and_deletes() {
    let (_dir, store) = test_store();
    store
        .write(|tx| {
            sync_records(
                tx,
                &tx.zone(ZONE)?,
                &[soa(7), pr("testhost", "A", "10.0.0.1")],
            )
            .map_err(|e| crate::store::StoreError::Database(e.to_string()))?;
            Ok(())
        })
        .unwrap();
    let live = store.read(|tx| tx.live_records(ZONE)).unwrap();
    let a_row = live.iter().find(|r| r.rtype == 1).unwrap().clone();

    // Expected add present, expected delete gone.
    let done = check_done(&live, &[a_row.record_key()], &[]);
    assert!(done.is_some());

    // An expected delete that still exists blocks completion.
    assert!(check_done(&live, &[], std::slice::from_ref(&a_row)).is_none());

    // An expected add that is missing blocks completion.
    let mut missing = a_row.clone();
    missing.value = "10.0.0.9".into();
    missing.data_hex = "0a000009".into();
    assert!(check_done(&live, &[missing.record_key()], &[]).is_none());
}
