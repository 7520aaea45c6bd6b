//! AXFR responses (RFC 5936).
//!
//! The zone is synced from the provider first, then serialized as
//! `[SOA, ...records..., SOA]` over as many messages as needed. With a
//! verified TSIG request every message is signed, each MAC chaining from
//! the previous one.

use domain::base::iana::ExtendedErrorCode;
use domain::base::iana::Rcode;

use stratus_common::types::{Record, RTYPE_SOA};
use stratus_dns::axfr::chunk_answers;
use stratus_dns::record::stored_to_wire;

use crate::store::StoreError;
use crate::sync::{latest_records, sync_records};

use super::{Reply, ReqCtx};

pub(crate) async fn handle(ctx: &mut ReqCtx) -> Reply {
    let counts = ctx.msg.header_counts();
    if counts.ancount() != 0 || counts.nscount() != 0 {
        return ctx.error_reply(
            Rcode::FormErr,
            ExtendedErrorCode::Other,
            "answer and authority section must be empty for xfr",
        );
    }

    // Authorization before the zone lookup, as for UPDATE.
    let (zone, config) = match super::authorized_zone(ctx).await {
        Ok(found) => found,
        Err(e) => return ctx.failure_reply(e),
    };
    let gateway =
        match ctx
            .app
            .registry
            .open(&config.name, &config.provider, &config.config)
        {
            Ok(g) => g,
            Err(e) => return ctx.failure_reply(e),
        };

    let _guard = ctx.app.locks.lock(&zone.name).await;

    let latest = match latest_records(&gateway, &zone.name).await {
        Ok(latest) => latest,
        Err(e) => {
            return ctx.error_reply(
                Rcode::ServFail,
                ExtendedErrorCode::NetworkError,
                format!("get records from provider: {e}"),
            );
        }
    };
    let zone_for_sync = zone.clone();
    let synced = ctx
        .app
        .store
        .write_async(move |tx| {
            let outcome = sync_records(tx, &zone_for_sync, &latest)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let current: Vec<Record> = tx
                .live_records(&zone_for_sync.name)?
                .into_iter()
                .filter(|r| r.rtype != RTYPE_SOA)
                .collect();
            Ok((outcome.changed, outcome.soa, current))
        })
        .await;
    let (changed, soa, current) = match synced {
        Ok(v) => v,
        Err(e) => return ctx.servfail(e.to_string()),
    };

    // The transfer starts and ends with the SOA.
    let soa_rr = match stored_to_wire(&soa) {
        Ok(rr) => rr,
        Err(e) => return ctx.servfail(format!("soa rr: {e}")),
    };
    let mut answers = Vec::with_capacity(2 + current.len());
    answers.push(soa_rr.clone());
    for record in &current {
        match stored_to_wire(record) {
            Ok(rr) => answers.push(rr),
            Err(e) => return ctx.servfail(format!("db record rr: {e}")),
        }
    }
    answers.push(soa_rr);

    let builders = match chunk_answers(&ctx.msg, &answers) {
        Ok(builders) => builders,
        Err(e) => return ctx.servfail(e.to_string()),
    };
    let mut frames = Vec::with_capacity(builders.len());
    for builder in builders {
        match ctx.finish(builder, None, None) {
            Ok(frame) => frames.push(frame),
            Err(e) => return ctx.servfail(e.to_string()),
        }
    }

    let mut reply = ctx.reply(frames, "noerror".to_string());
    if changed {
        reply.notify_zone = Some(zone.name);
    }
    reply
}
