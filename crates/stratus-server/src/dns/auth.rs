//! Authoritative queries.
//!
//! Only SOA is answered (AXFR clients check freshness before initiating a
//! transfer), plus the CHAOS `version.bind.` TXT. Anything else gets an
//! explicit error rather than a misleading NOERROR.

use std::str::FromStr;

use domain::base::iana::ExtendedErrorCode;
use domain::base::iana::{Class, Rcode, Rtype};
use domain::base::name::Dname;
use domain::base::record::Record as DnsRecord;
use domain::rdata::rfc1035::Txt;

use stratus_common::types::Record;
use stratus_dns::record::stored_to_wire;

use crate::store::StoreError;

use super::{Reply, ReqCtx};

pub(crate) async fn handle(ctx: &mut ReqCtx, qclass: Class) -> Reply {
    let counts = ctx.msg.header_counts();
    if counts.ancount() != 0 || counts.nscount() != 0 {
        return ctx.error_reply(
            Rcode::FormErr,
            ExtendedErrorCode::Other,
            "answer and authority section must be empty",
        );
    }

    if qclass == Class::Ch {
        return handle_version(ctx);
    }

    // We should answer NOERROR/NXDOMAIN for other types, but we don't
    // want to mislead. Better tell clients something is wrong.
    if ctx.qtype != Rtype::Soa {
        return ctx.servfail("only soa records can be requested");
    }

    // The name may be below a zone we serve; walk up to the apex so we
    // can answer NXDOMAIN instead of NOTAUTH.
    let qname = ctx.qname.clone();
    let lookup = ctx
        .app
        .store
        .read_async(move |tx| {
            let mut name = qname.as_str();
            loop {
                match tx.zone(name) {
                    Ok(zone) => {
                        let soa = tx.live_soa(&zone.name)?.ok_or_else(|| {
                            StoreError::Database(format!(
                                "no live soa for zone {name:?}"
                            ))
                        })?;
                        return Ok(Some((zone.name.clone(), soa)));
                    }
                    Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                name = match name.split_once('.') {
                    Some((_, rest)) if !rest.is_empty() => rest,
                    _ => return Ok(None),
                };
            }
        })
        .await;

    let (zone_name, soa) = match lookup {
        Ok(Some(found)) => found,
        Ok(None) => {
            return ctx.error_reply(
                Rcode::NotAuth,
                ExtendedErrorCode::NotAuthoritative,
                "unknown zone",
            );
        }
        Err(e) => return ctx.servfail(format!("get zone and soa: {e}")),
    };
    if zone_name != ctx.qname {
        return ctx.error_reply(
            Rcode::NXDomain,
            ExtendedErrorCode::Other,
            "no soa record for this subdomain",
        );
    }

    answer_soa(ctx, &soa)
}

fn answer_soa(ctx: &mut ReqCtx, soa: &Record) -> Reply {
    let rr = match stored_to_wire(soa) {
        Ok(rr) => rr,
        Err(e) => return ctx.servfail(format!("making soa for zone: {e}")),
    };
    let frame = ctx
        .answer_builder(Rcode::NoError)
        .and_then(|mut builder| {
            builder
                .push(&rr)
                .map_err(|e| {
                    stratus_common::Error::invariant(format!("answer record: {e}"))
                })
                .map(|_| builder.additional())
        })
        .and_then(|b| ctx.finish(b, None, None));
    match frame {
        Ok(frame) => ctx.reply(vec![frame], "noerror".to_string()),
        Err(e) => ctx.servfail(e.to_string()),
    }
}

/// CHAOS TXT `version.bind.` with our version string.
fn handle_version(ctx: &mut ReqCtx) -> Reply {
    if ctx.qtype != Rtype::Txt || ctx.qname != "version.bind." {
        return ctx.error_reply(
            Rcode::Refused,
            ExtendedErrorCode::Other,
            "only the version.bind txt can be requested for chaos",
        );
    }
    let name = match Dname::<Vec<u8>>::from_str("version.bind.") {
        Ok(name) => name,
        Err(e) => return ctx.servfail(format!("version name: {e}")),
    };
    let txt = match Txt::<Vec<u8>>::try_from_slice(ctx.app.version.as_bytes()) {
        Ok(txt) => txt,
        Err(e) => return ctx.servfail(format!("version txt: {e}")),
    };
    let rr = DnsRecord::new(name, Class::Ch, 0, txt);
    let frame = ctx
        .answer_builder(Rcode::NoError)
        .and_then(|mut builder| {
            builder
                .push(&rr)
                .map_err(|e| {
                    stratus_common::Error::invariant(format!("answer record: {e}"))
                })
                .map(|_| builder.additional())
        })
        .and_then(|b| ctx.finish(b, None, None));
    match frame {
        Ok(frame) => ctx.reply(vec![frame], "noerror".to_string()),
        Err(e) => ctx.servfail(e.to_string()),
    }
}
