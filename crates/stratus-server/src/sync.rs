//! Sync engine: reconciling the stored mirror with provider state.
//!
//! [`sync_records`] diffs a fresh provider listing against the stored live
//! records of a zone, tombstoning and inserting whole RRsets so the
//! versioned log stays consistent, and advances the local serial whenever
//! anything changed. It runs inside one write transaction while the caller
//! holds the zone lock.
//!
//! [`ensure_propagate`] re-fetches and re-syncs on a back-off schedule
//! after a mutation was issued, until the expected adds appear and the
//! expected deletes are gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};
use uuid::Uuid;

use stratus_common::name::{absolute_name, in_zone};
use stratus_common::types::{
    ProviderRecord, Record, RecordKey, RrsetKey, Zone, RTYPE_SOA,
};
use stratus_common::{Error, Result};
use stratus_dns::record::{parse_provider_record, soa_from_hex, WireRecord};

use crate::metrics;
use crate::providers::Gateway;
use crate::store::WriteTx;
use crate::App;

/// Floor for the automatic sync interval.
const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Floor for the accelerated refresh after a record change.
const MIN_ACCELERATED_REFRESH: Duration = Duration::from_secs(5);

/// Per-zone mutual exclusion.
///
/// At most one of sync, UPDATE processing, AXFR, propagation waiting, or
/// admin-initiated mutation runs per zone. Dropping the guard unlocks;
/// moving it into a background task hands the lock off.
#[derive(Clone, Default)]
pub struct ZoneLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

pub type ZoneGuard = OwnedMutexGuard<()>;

impl ZoneLocks {
    pub async fn lock(&self, zone: &str) -> ZoneGuard {
        let mutex = {
            let mut map = self.inner.lock().expect("zone lock table poisoned");
            map.entry(zone.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

/// The `YYYYMMDD00` serial for a point in time.
fn date_serial(t: DateTime<Utc>) -> u32 {
    100 * (t.day() + 100 * (t.month() + 100 * t.year() as u32))
}

/// Result of one [`sync_records`] run. When `changed`, the caller must
/// schedule NOTIFY fan-out for the zone after its transaction commits and
/// its response (if any) is written.
#[derive(Debug)]
pub struct SyncOutcome {
    pub changed: bool,
    /// The zone's SOA row after the sync: freshly inserted when changed,
    /// otherwise the candidate equivalent of the stored one.
    pub soa: Record,
    pub inserted: Vec<Record>,
    pub deleted: Vec<Record>,
}

struct SoaState {
    latest: Record,
    known: Option<Record>,
    new_soa: bool,
}

/// Ensures a live SOA row with a fresh serial exists, fabricating a
/// `YYYYMMDDNN` serial when the remote one is unusable or unchanged.
fn ensure_soa(tx: &WriteTx, st: &mut SoaState, now: DateTime<Utc>) -> Result<()> {
    if st.new_soa {
        return Ok(());
    }
    if st.latest.serial_first <= 1 {
        st.latest.serial_first = date_serial(now);
    } else if let Some(known) = &st.known {
        if known.serial_first == st.latest.serial_first {
            let today = date_serial(now);
            let tomorrow = date_serial(now + chrono::Duration::days(1));
            if st.latest.serial_first < tomorrow - 1
                && st.latest.serial_first < today
            {
                st.latest.serial_first = today;
            } else {
                st.latest.serial_first += 1;
            }
        }
    }
    if let Some(known) = &mut st.known {
        known.deleted = Some(now);
        known.serial_deleted = st.latest.serial_first;
        tx.record_update(known)?;
    }
    debug!(serial = st.latest.serial_first, "inserting new soa");
    tx.record_insert(&st.latest)?;
    st.known = Some(st.latest.clone());
    st.new_soa = true;
    Ok(())
}

/// Multiset equality of a fresh and a stored RRset, TTL included.
fn rrset_equal(fresh: &[WireRecord], stored: &[Record]) -> bool {
    if fresh.len() != stored.len() {
        return false;
    }
    let mut fresh_keys: HashMap<RecordKey, usize> = HashMap::new();
    let mut stored_keys: HashMap<RecordKey, usize> = HashMap::new();
    for f in fresh {
        *fresh_keys.entry(f.record_key()).or_default() += 1;
    }
    for s in stored {
        *stored_keys.entry(s.record_key()).or_default() += 1;
    }
    fresh_keys == stored_keys
}

/// Syncs the stored records of `zone` with a fresh provider listing.
///
/// Must run inside one write transaction with the zone lock held. When the
/// outcome says `changed`, the caller owes the zone a NOTIFY.
pub fn sync_records(
    tx: &WriteTx,
    zone: &Zone,
    latest: &[ProviderRecord],
) -> Result<SyncOutcome> {
    let now = Utc::now();
    let res = sync_records_inner(tx, zone, latest, now);
    if res.is_err() {
        metrics::SYNC_ERRORS.inc();
    }
    res
}

fn sync_records_inner(
    tx: &WriteTx,
    zone: &Zone,
    latest: &[ProviderRecord],
    now: DateTime<Utc>,
) -> Result<SyncOutcome> {
    // Group the stored live records by rrset; the apex SOA is handled
    // separately. A record change replaces its whole rrset (tombstone and
    // insert) so the serial-stamped log stays usable for history.
    let mut known_soa: Option<Record> = None;
    let mut rrset_known: HashMap<RrsetKey, Vec<Record>> = HashMap::new();
    for r in tx.live_records(&zone.name)? {
        if r.rtype == RTYPE_SOA && r.abs_name == zone.name {
            known_soa = Some(r);
            continue;
        }
        rrset_known.entry(r.rrset_key()).or_default().push(r);
    }
    let had_prev_soa = known_soa.is_some();

    // Parse and group the fresh records. Absolute names outside the zone
    // are a hard error; for AXFR-shaped input carrying the SOA twice only
    // one is kept.
    let mut latest_soa: Option<Record> = None;
    let mut rrset_latest: HashMap<RrsetKey, Vec<WireRecord>> = HashMap::new();
    for pr in latest {
        let abs = if pr.name.ends_with('.') {
            if !in_zone(&pr.name.to_ascii_lowercase(), &zone.name) {
                return Err(Error::user(format!(
                    "received out of zone absolute name {:?}",
                    pr.name
                )));
            }
            pr.name.clone()
        } else {
            absolute_name(&pr.name, &zone.name)
        };
        let wr = parse_provider_record(&abs, pr.ttl, &pr.rtype, &pr.value, &pr.id)?;
        debug!(record = ?wr, "latest record");
        if wr.rtype == RTYPE_SOA && wr.abs_name == zone.name {
            let soa = soa_from_hex(&wr.data_hex)?;
            latest_soa = Some(Record {
                id: Uuid::now_v7(),
                zone: zone.name.clone(),
                serial_first: u32::from(soa.serial()),
                serial_deleted: 0,
                first: now,
                deleted: None,
                abs_name: wr.abs_name,
                rtype: wr.rtype,
                class: wr.class,
                ttl: wr.ttl,
                data_hex: wr.data_hex,
                value: wr.value,
                provider_id: wr.provider_id,
            });
            continue;
        }
        rrset_latest.entry(wr.rrset_key()).or_default().push(wr);
    }

    let mut latest_soa =
        latest_soa.ok_or_else(|| Error::user("missing soa record"))?;

    // The remote serial is recorded as-is; locally we may use another.
    // Some name servers never change serials on record changes.
    let new_serial_remote = latest_soa.serial_first;
    if let Some(known) = &known_soa {
        if latest_soa.serial_first <= 1 {
            latest_soa.serial_first = known.serial_first;
        }
    }

    let mut st = SoaState {
        latest: latest_soa,
        known: known_soa,
        new_soa: false,
    };
    let mut inserted: Vec<Record> = Vec::new();
    let mut deleted: Vec<Record> = Vec::new();

    if st.known.is_none() {
        ensure_soa(tx, &mut st, now)?;
    }

    let mut tombstone = |tx: &WriteTx,
                         st: &mut SoaState,
                         deleted: &mut Vec<Record>,
                         rows: &[Record]|
     -> Result<()> {
        if !rows.is_empty() && !had_prev_soa {
            return Err(Error::invariant(
                "cannot delete records without a previous soa".to_string(),
            ));
        }
        ensure_soa(tx, st, now)?;
        for row in rows {
            let mut row = row.clone();
            row.deleted = Some(now);
            row.serial_deleted = st.latest.serial_first;
            tx.record_update(&row)?;
            deleted.push(row);
        }
        Ok(())
    };

    let mut insert = |tx: &WriteTx,
                      st: &mut SoaState,
                      inserted: &mut Vec<Record>,
                      fresh: &[WireRecord]|
     -> Result<()> {
        ensure_soa(tx, st, now)?;
        for wr in fresh {
            let row = Record {
                id: Uuid::now_v7(),
                zone: zone.name.clone(),
                serial_first: st.latest.serial_first,
                serial_deleted: 0,
                first: now,
                deleted: None,
                abs_name: wr.abs_name.clone(),
                rtype: wr.rtype,
                class: wr.class,
                ttl: wr.ttl,
                data_hex: wr.data_hex.clone(),
                value: wr.value.clone(),
                provider_id: wr.provider_id.clone(),
            };
            tx.record_insert(&row)?;
            inserted.push(row);
        }
        Ok(())
    };

    // Replace changed rrsets and add new ones.
    static EMPTY: Vec<Record> = Vec::new();
    for (key, fresh) in &rrset_latest {
        let stored = rrset_known.get(key).unwrap_or(&EMPTY);
        if rrset_equal(fresh, stored) {
            continue;
        }
        tombstone(tx, &mut st, &mut deleted, stored)?;
        insert(tx, &mut st, &mut inserted, fresh)?;
    }

    // Tombstone rrsets that disappeared remotely.
    for (key, stored) in &rrset_known {
        if !rrset_latest.contains_key(key) {
            tombstone(tx, &mut st, &mut deleted, stored)?;
        }
    }

    debug!(
        inserted = inserted.len(),
        deleted = deleted.len(),
        changed = st.new_soa,
        "sync outcome"
    );

    // Refresh the zone row's bookkeeping under the same transaction,
    // against a freshly read row.
    let mut z = tx.zone(&zone.name)?;
    z.last_sync = Some(now);
    z.next_sync = now
        + chrono::Duration::from_std(z.sync_interval.max(MIN_SYNC_INTERVAL))
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
    if st.new_soa {
        z.last_record_change = Some(now);
        z.serial_local = st.latest.serial_first;
        z.serial_remote = new_serial_remote;
        if !z.refresh_interval.is_zero() {
            let accelerated =
                (z.refresh_interval / 50).max(MIN_ACCELERATED_REFRESH);
            z.next_refresh = now
                + chrono::Duration::from_std(accelerated)
                    .unwrap_or_else(|_| chrono::Duration::seconds(5));
        }
    }
    tx.zone_update(&z)?;

    Ok(SyncOutcome {
        changed: st.new_soa,
        soa: st.latest,
        inserted,
        deleted,
    })
}

/// Fetches provider records and guarantees an SOA is among them, fetching
/// one straight from the authoritative name servers when the provider
/// listing has none.
pub async fn latest_records(
    gateway: &Gateway,
    zone: &str,
) -> Result<Vec<ProviderRecord>> {
    let mut records = gateway.get_records(zone).await?;
    let has_soa = records.iter().any(|r| {
        r.rtype.eq_ignore_ascii_case("SOA")
            && (r.name.is_empty()
                || r.name == "@"
                || r.name.eq_ignore_ascii_case(zone))
    });
    if !has_soa {
        metrics::SOA_GET.inc();
        match stratus_dns::soa::fetch_soa(zone).await {
            Ok(soa) => records.push(ProviderRecord {
                id: String::new(),
                rtype: "SOA".to_string(),
                name: zone.to_string(),
                value: soa.value,
                ttl: soa.ttl,
            }),
            Err(e) => {
                metrics::SOA_GET_ERRORS.inc();
                return Err(e);
            }
        }
    }
    Ok(records)
}

/// Polls the provider after a mutation until all expected adds are present
/// (by record key) and all expected deletes are gone (by provider id when
/// known, else by record key). Each round re-syncs the store so the mirror
/// follows whatever the provider reports.
///
/// The caller hands its zone lock over via `guard`; it is released when
/// the wait finishes.
pub async fn ensure_propagate(
    app: &Arc<App>,
    guard: ZoneGuard,
    gateway: &Gateway,
    zone: &Zone,
    exp_add: Vec<RecordKey>,
    exp_del: Vec<Record>,
    prev_serial: u32,
) -> Result<(Vec<Record>, Vec<Record>)> {
    let _guard = guard;
    debug!(
        zone = %zone.name,
        adds = exp_add.len(),
        deletes = exp_del.len(),
        prev_serial,
        "ensuring propagation"
    );

    let mut notify = false;
    let res = propagate_rounds(app, gateway, zone, &exp_add, &exp_del, &mut notify)
        .await;
    if res.is_err() {
        metrics::PROPAGATE_ERRORS.inc();
    }
    if notify {
        spawn_zone_notify(app.clone(), zone.name.clone());
    }
    res
}

async fn propagate_rounds(
    app: &Arc<App>,
    gateway: &Gateway,
    zone: &Zone,
    exp_add: &[RecordKey],
    exp_del: &[Record],
    notify: &mut bool,
) -> Result<(Vec<Record>, Vec<Record>)> {
    let waits = [
        app.propagation_first_wait,
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(3),
    ];
    let mut shutdown = app.shutdown.clone();

    for wait in waits {
        tokio::select! {
            _ = shutdown.changed() => {
                return Err(Error::transient("shutting down"));
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let latest = latest_records(gateway, &zone.name).await?;
        let zone_clone = zone.clone();
        let exp_add = exp_add.to_vec();
        let exp_del = exp_del.to_vec();
        let (changed, done) = app
            .store
            .write_async(move |tx| {
                let outcome = sync_records(tx, &zone_clone, &latest)
                    .map_err(|e| crate::store::StoreError::Database(e.to_string()))?;
                let current = tx.live_records(&zone_clone.name)?;
                Ok((outcome.changed, check_done(&current, &exp_add, &exp_del)))
            })
            .await
            .map_err(Error::from)?;
        *notify = *notify || changed;

        if let Some(found) = done {
            return Ok(found);
        }
        debug!(zone = %zone.name, wait = ?wait, "changes not yet visible, waiting");
    }
    Err(Error::provider("not all changes found".to_string()))
}

/// Whether all expected adds are live and all expected deletes are gone.
fn check_done(
    current: &[Record],
    exp_add: &[RecordKey],
    exp_del: &[Record],
) -> Option<(Vec<Record>, Vec<Record>)> {
    let mut by_key: HashMap<RecordKey, &Record> = HashMap::new();
    let mut by_provider_id: HashMap<&str, &Record> = HashMap::new();
    for r in current {
        by_key.insert(r.record_key(), r);
        if !r.provider_id.is_empty() {
            by_provider_id.insert(r.provider_id.as_str(), r);
        }
    }

    let mut inserted = Vec::new();
    for key in exp_add {
        match by_key.get(key) {
            Some(r) => inserted.push((*r).clone()),
            None => {
                debug!(record = ?key, "record not yet added");
                return None;
            }
        }
    }
    let mut deleted = Vec::new();
    for d in exp_del {
        let still_there = if !d.provider_id.is_empty() {
            by_provider_id.contains_key(d.provider_id.as_str())
        } else {
            by_key.contains_key(&d.record_key())
        };
        if still_there {
            debug!(record = ?d.record_key(), "record not yet deleted");
            return None;
        }
        deleted.push(d.clone());
    }
    Some((inserted, deleted))
}

/// Schedules NOTIFY fan-out for a zone on a background worker.
pub fn spawn_zone_notify(app: Arc<App>, zone: String) {
    crate::spawn_guarded("zone notify fan-out", async move {
        send_zone_notify(&app, &zone).await;
    });
}

/// Sends NOTIFY to every registered target of the zone. Best effort:
/// failures are logged, the next change tries again.
pub async fn send_zone_notify(app: &Arc<App>, zone: &str) {
    // A change also means the refresher should reconsider its schedule.
    app.refresh_kick.notify_one();

    let zone_name = zone.to_string();
    let loaded = app
        .store
        .read_async(move |tx| {
            let soa = tx.live_soa(&zone_name)?;
            let targets = tx.zone_notifies(&zone_name)?;
            Ok((soa, targets))
        })
        .await;
    let (soa, targets) = match loaded {
        Ok((Some(soa), targets)) => (soa, targets),
        Ok((None, _)) => {
            error!(zone, "no live soa for zone, skipping notify");
            return;
        }
        Err(e) => {
            error!(zone, err = %e, "gathering notify destinations");
            return;
        }
    };

    debug!(zone, destinations = targets.len(), "sending dns notify");
    for target in targets {
        let soa = soa.clone();
        crate::spawn_guarded("sending dns notify", async move {
            if let Err(e) = stratus_dns::notify::send_notify(&target, &soa).await {
                info!(
                    zone = %target.zone,
                    address = %target.address,
                    err = %e,
                    "sending dns notify"
                );
            }
        });
    }
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod sync_tests;
