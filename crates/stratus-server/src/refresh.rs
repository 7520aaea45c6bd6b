//! Background refresher.
//!
//! Sleeps until the earliest `next_sync` or `next_refresh` across all
//! zones, collects and re-arms due zones atomically, then works them with
//! a small stagger so a restart doesn't stampede the providers. A kick
//! signal forces immediate rescheduling after admin changes.
//!
//! After a recent record change, refresh checks run on an accelerated
//! schedule: five steps of `interval/50`, then nine of `interval/10`,
//! taking the first step past now. DNS zones tend to be quiet for months
//! and then see several changes in a row while someone is working on
//! them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use stratus_common::types::Zone;
use stratus_common::{Error, Result};

use crate::metrics;
use crate::sync::{latest_records, spawn_zone_notify, sync_records};
use crate::App;

const STAGGER: Duration = Duration::from_secs(2);
/// Sleep when there is nothing scheduled; a kick wakes us earlier.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

pub async fn refresher(app: Arc<App>) {
    let mut shutdown = app.shutdown.clone();
    loop {
        let (next_sync, next_refresh) = match schedule(&app).await {
            Ok(v) => v,
            Err(e) => {
                error!(err = %e, "rescheduling refresher");
                (None, None)
            }
        };
        debug!(?next_sync, ?next_refresh, "refresher schedule");

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = app.refresh_kick.notified() => {
                // Something about a zone changed; recompute timers.
                continue;
            }
            _ = sleep_until(next_sync) => {
                if let Err(e) = run_due_syncs(&app).await {
                    error!(err = %e, "running due zone syncs");
                }
            }
            _ = sleep_until(next_refresh) => {
                if let Err(e) = run_due_refreshes(&app).await {
                    error!(err = %e, "running due zone refreshes");
                }
            }
        }
    }
}

async fn sleep_until(at: Option<DateTime<Utc>>) {
    let wait = match at {
        Some(at) => (at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO),
        None => IDLE_WAIT,
    };
    tokio::time::sleep(wait).await;
}

/// Earliest `next_sync` and `next_refresh` across all zones.
async fn schedule(
    app: &Arc<App>,
) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    let zones = app.store.read_async(|tx| tx.zones()).await?;
    let next_sync = zones.iter().map(|z| z.next_sync).min();
    let next_refresh = zones.iter().map(|z| z.next_refresh).min();
    Ok((next_sync, next_refresh))
}

/// Collects zones whose sync is due, re-arms them in one transaction, and
/// spawns the syncs with a stagger.
async fn run_due_syncs(app: &Arc<App>) -> Result<()> {
    let due = app
        .store
        .write_async(|tx| {
            let now = Utc::now();
            let mut due = Vec::new();
            for mut zone in tx.zones()? {
                if zone.next_sync > now {
                    continue;
                }
                zone.next_sync = now
                    + chrono::Duration::from_std(
                        zone.sync_interval.max(Duration::from_secs(60)),
                    )
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                tx.zone_update(&zone)?;
                due.push(zone);
            }
            Ok(due)
        })
        .await?;

    let app = app.clone();
    crate::spawn_guarded("automatic zone syncs", async move {
        for (i, zone) in due.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(STAGGER).await;
            }
            let app = app.clone();
            crate::spawn_guarded("automatic zone sync", async move {
                if let Err(e) = refresh_zone_sync(&app, &zone).await {
                    error!(zone = %zone.name, err = %e, "automatic zone sync");
                }
            });
        }
    });
    Ok(())
}

/// Collects zones whose SOA check is due, re-arms them (accelerated after
/// recent changes), and spawns the checks.
async fn run_due_refreshes(app: &Arc<App>) -> Result<()> {
    let due = app
        .store
        .write_async(|tx| {
            let now = Utc::now();
            let mut due = Vec::new();
            for mut zone in tx.zones()? {
                if zone.next_refresh > now {
                    continue;
                }
                zone.next_refresh = next_refresh_time(&zone, now);
                tx.zone_update(&zone)?;
                due.push(zone);
            }
            Ok(due)
        })
        .await?;

    let app = app.clone();
    crate::spawn_guarded("automatic zone refreshes", async move {
        for (i, zone) in due.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(STAGGER).await;
            }
            let app = app.clone();
            crate::spawn_guarded("automatic zone refresh", async move {
                if let Err(e) = refresh_zone_soa_check(&app, &zone).await {
                    error!(zone = %zone.name, err = %e, "automatic zone refresh");
                }
            });
        }
    });
    Ok(())
}

/// The next SOA-check time for a zone.
///
/// After a record change within one refresh interval, the check times step
/// through five intervals of `interval/50` followed by nine of
/// `interval/10` from the change, taking the first step past now.
/// Otherwise simply one interval from now.
pub(crate) fn next_refresh_time(zone: &Zone, now: DateTime<Utc>) -> DateTime<Utc> {
    let interval = zone.refresh_interval.max(Duration::from_secs(60));
    let chrono_interval = chrono::Duration::from_std(interval)
        .unwrap_or_else(|_| chrono::Duration::seconds(60));

    if let Some(changed) = zone.last_record_change {
        if now - changed < chrono_interval {
            let mut t = changed;
            let fast = chrono_interval / 50;
            for _ in 0..5 {
                if t > now {
                    break;
                }
                t += fast;
            }
            let slow = chrono_interval / 10;
            for _ in 0..9 {
                if t > now {
                    break;
                }
                t += slow;
            }
            return t;
        }
    }
    now + chrono_interval
}

/// Full sync of one zone: fetch from the provider, reconcile, notify on
/// change.
pub async fn refresh_zone_sync(app: &Arc<App>, zone: &Zone) -> Result<()> {
    let config_name = zone.provider_config.clone();
    let config = app
        .store
        .read_async(move |tx| tx.provider_config(&config_name))
        .await?;
    let gateway = app
        .registry
        .open(&config.name, &config.provider, &config.config)?;

    let _guard = app.locks.lock(&zone.name).await;

    let latest = latest_records(&gateway, &zone.name).await?;
    let zone_clone = zone.clone();
    let changed = app
        .store
        .write_async(move |tx| {
            sync_records(tx, &zone_clone, &latest)
                .map(|o| o.changed)
                .map_err(|e| crate::store::StoreError::Database(e.to_string()))
        })
        .await?;
    if changed {
        spawn_zone_notify(app.clone(), zone.name.clone());
    }
    Ok(())
}

/// SOA-only freshness check: query the authoritative servers directly and
/// fall back to a full sync when the remote serial moved.
pub async fn refresh_zone_soa_check(app: &Arc<App>, zone: &Zone) -> Result<()> {
    metrics::SOA_GET.inc();
    let soa = match stratus_dns::soa::fetch_soa(&zone.name).await {
        Ok(soa) => soa,
        Err(e) => {
            metrics::SOA_GET_ERRORS.inc();
            return Err(Error::transient(format!(
                "get latest soa from authoritative name servers: {e}"
            )));
        }
    };

    if zone.serial_remote == soa.serial {
        debug!(zone = %zone.name, serial = soa.serial, "zone still up to date");
        return Ok(());
    }
    debug!(zone = %zone.name, "refresh indicates zone has changed");
    refresh_zone_sync(app, zone).await
}
