//! Incoming DNS NOTIFY.
//!
//! A NOTIFY makes us check freshness immediately. When the request's
//! answer section carries an SOA whose serial we already have, nothing
//! needs to happen. Otherwise a full provider fetch and sync runs in the
//! background; the response does not wait for it. NOTIFY requires no
//! authentication; nothing in the request is trusted.

use domain::base::iana::ExtendedErrorCode;
use domain::base::iana::Rcode;
use domain::rdata::rfc1035::Soa;
use tracing::{debug, error};

use crate::store::StoreError;
use crate::sync::{latest_records, spawn_zone_notify, sync_records};

use super::{Reply, ReqCtx};

pub(crate) async fn handle(ctx: &mut ReqCtx) -> Reply {
    let qname = ctx.qname.clone();
    let loaded = ctx
        .app
        .store
        .read_async(move |tx| {
            let (zone, config) = tx.zone_and_config(&qname)?;
            let soa = tx.live_soa(&zone.name)?;
            Ok((zone, config, soa))
        })
        .await;
    let (zone, config, local_soa) = match loaded {
        Ok(v) => v,
        Err(StoreError::NotFound(_)) => {
            return ctx.error_reply(
                Rcode::NotAuth,
                ExtendedErrorCode::NotAuthoritative,
                "unknown zone",
            );
        }
        Err(e) => return ctx.servfail(format!("get zone and provider: {e}")),
    };

    // When the supplied SOA matches what we have, the zone is up to date.
    if ctx.msg.header_counts().ancount() == 1 {
        if let Some(serial) = answer_soa_serial(ctx) {
            if let Some(local) = &local_soa {
                if serial == local.serial_first {
                    debug!(
                        cid = ctx.cid,
                        zone = %zone.name,
                        serial,
                        "notify with soa serial we already have"
                    );
                    return ok_reply(ctx);
                }
            }
        }
    }

    let gateway =
        match ctx
            .app
            .registry
            .open(&config.name, &config.provider, &config.config)
        {
            Ok(g) => g,
            Err(e) => return ctx.failure_reply(e),
        };

    let app = ctx.app.clone();
    let task = async move {
        let _guard = app.locks.lock(&zone.name).await;

        let latest = match latest_records(&gateway, &zone.name).await {
            Ok(latest) => latest,
            Err(e) => {
                error!(zone = %zone.name, err = %e, "get records from provider");
                return;
            }
        };
        let zone_name = zone.name.clone();
        let changed = app
            .store
            .write_async(move |tx| {
                sync_records(tx, &zone, &latest)
                    .map(|o| o.changed)
                    .map_err(|e| StoreError::Database(e.to_string()))
            })
            .await;
        match changed {
            Ok(true) => spawn_zone_notify(app.clone(), zone_name),
            Ok(false) => {}
            Err(e) => error!(zone = %zone_name, err = %e, "updating records"),
        }
    };
    if ctx.app.synchronous_background {
        task.await;
    } else {
        crate::spawn_guarded("syncing zone after dns notify", task);
    }

    ok_reply(ctx)
}

fn ok_reply(ctx: &mut ReqCtx) -> Reply {
    let frame = ctx
        .answer_builder(Rcode::NoError)
        .map(|b| b.additional())
        .and_then(|b| ctx.finish(b, None, None));
    match frame {
        Ok(frame) => ctx.reply(vec![frame], "noerror".to_string()),
        Err(e) => ctx.servfail(e.to_string()),
    }
}

/// The serial of the answer-section SOA, when there is exactly one and it
/// parses.
fn answer_soa_serial(ctx: &ReqCtx) -> Option<u32> {
    let answer = ctx.msg.answer().ok()?;
    for rr in answer.limit_to::<Soa<_>>() {
        if let Ok(rr) = rr {
            return Some(u32::from(rr.data().serial()));
        }
    }
    None
}
