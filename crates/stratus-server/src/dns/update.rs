//! DNS UPDATE processing (RFC 2136).
//!
//! The zone is named by the question section; the answer section holds
//! prerequisites, the authority section the changes. The zone is synced
//! from the provider before prerequisites are evaluated, so decisions are
//! made against fresh state. The resulting changes go to the provider as
//! three batched calls in delete, set, append order; the provider API has
//! no transactions, so a partial failure leaves the intermediate state for
//! the next sync to observe. After responding, a background waiter polls
//! the provider until the changes are visible.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use domain::base::iana::ExtendedErrorCode;
use domain::base::iana::{Rcode, Rtype};
use domain::base::message::RecordSection;
use domain::dep::octseq::Octets;
use domain::rdata::ZoneRecordData;
use tracing::{debug, error, info};
use uuid::Uuid;

use stratus_common::name::{clean_abs_name, in_zone};
use stratus_common::types::{
    Record, RecordKey, RrsetKey, CLASS_IN, RTYPE_CNAME, RTYPE_NS, RTYPE_SOA,
};
use stratus_common::{Error, Result};
use stratus_dns::record::to_provider_record;

use crate::store::StoreError;
use crate::sync::{ensure_propagate, latest_records, sync_records};

use super::{Reply, ReqCtx};

/// One record of the answer or authority section, with the raw RDATA
/// length and, where parseable, the canonical RDATA.
struct UpdateRr {
    name_raw: String,
    rtype: u16,
    class: u16,
    ttl: u32,
    rdlen: usize,
    data_hex: String,
    value: String,
}

fn parse_update_section<'a, Octs>(
    section: RecordSection<'a, Octs>,
) -> Result<Vec<UpdateRr>>
where
    Octs: Octets + ?Sized,
{
    let mut out = Vec::new();
    for item in section {
        let parsed =
            item.map_err(|e| Error::user(format!("parsing record: {e}")))?;
        let raw = parsed
            .to_record::<domain::base::rdata::UnknownRecordData<_>>()
            .map_err(|e| Error::user(format!("parsing record data: {e}")))?
            .ok_or_else(|| Error::user("unparseable record data"))?;
        let rdlen = raw.data().data().as_ref().len();

        // RDATA is stored in canonical form: typed parsing expands any
        // name compression. Empty RDATA (prerequisites, deletions) stays
        // empty.
        let (data_hex, value) = if rdlen > 0 {
            let rec = parsed
                .to_record::<ZoneRecordData<_, _>>()
                .map_err(|e| Error::user(format!("parsing record data: {e}")))?
                .ok_or_else(|| Error::user("unparseable record data"))?;
            let mut buf = Vec::new();
            match rec.data().compose_rdata(&mut buf) {
                Ok(()) => {}
                Err(never) => match never {},
            }
            (hex::encode(&buf), rec.data().to_string())
        } else {
            (String::new(), String::new())
        };

        out.push(UpdateRr {
            name_raw: stratus_dns::record::abs_string(&parsed.owner()),
            rtype: parsed.rtype().to_int(),
            class: parsed.class().to_int(),
            ttl: parsed.ttl(),
            rdlen,
            data_hex,
            value,
        });
    }
    Ok(out)
}

const CLASS_ANY: u16 = 255;
const CLASS_NONE: u16 = 254;
const RTYPE_ANY: u16 = 255;

/// Record types that may not appear in the update section.
fn is_meta_rtype(rtype: u16) -> bool {
    rtype == 0
        || matches!(
            Rtype::from_int(rtype),
            Rtype::Tkey | Rtype::Tsig | Rtype::Ixfr | Rtype::Axfr
                | Rtype::Mailb | Rtype::Maila
        )
}

struct Working {
    known: HashMap<RecordKey, Record>,
    rrsets: HashMap<RrsetKey, Vec<Record>>,
}

impl Working {
    fn add(&mut self, r: Record) {
        self.known.insert(r.record_key(), r.clone());
        self.rrsets.entry(r.rrset_key()).or_default().push(r);
    }

    fn del(&mut self, r: &Record) {
        let key = r.record_key();
        if self.known.remove(&key).is_none() {
            panic!("working set: no record deleted");
        }
        let rrset_key = r.rrset_key();
        if let Some(list) = self.rrsets.get_mut(&rrset_key) {
            list.retain(|c| c.record_key() != key);
            if list.is_empty() {
                self.rrsets.remove(&rrset_key);
            }
        }
    }
}

/// Multiset equality of two record lists, ignoring TTL.
fn rrset_equal_no_ttl(a: &[Record], b: &[Record]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let strip = |r: &Record| {
        let mut key = r.record_key();
        key.ttl = 0;
        key
    };
    let mut a_keys: HashMap<RecordKey, usize> = HashMap::new();
    let mut b_keys: HashMap<RecordKey, usize> = HashMap::new();
    for r in a {
        *a_keys.entry(strip(r)).or_default() += 1;
    }
    for r in b {
        *b_keys.entry(strip(r)).or_default() += 1;
    }
    a_keys == b_keys
}

pub(crate) async fn handle(ctx: &mut ReqCtx) -> Reply {
    if ctx.qtype != Rtype::Soa {
        return ctx.error_reply(
            Rcode::FormErr,
            ExtendedErrorCode::Other,
            "exactly 1 soa question needed",
        );
    }

    // Authorization first, then the zone: missing credentials are
    // REFUSED no matter whether the zone exists; an unknown zone is
    // NOTAUTH only for an authorized caller.
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

    let guard = ctx.app.locks.lock(&zone.name).await;

    // Sync the latest zone state before evaluating anything.
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
            let soa = tx.live_soa(&zone_for_sync.name)?;
            let current: Vec<Record> = tx
                .live_records(&zone_for_sync.name)?
                .into_iter()
                .filter(|r| r.rtype != RTYPE_SOA)
                .collect();
            Ok((outcome.changed, soa, current))
        })
        .await;
    let (changed, prior_soa, current) = match synced {
        Ok(v) => v,
        Err(e) => return ctx.servfail(format!("ensuring records are fresh: {e}")),
    };

    // Working copies of the live records, kept current while evaluating,
    // so later decisions see the intended post-state.
    let mut working = Working {
        known: HashMap::new(),
        rrsets: HashMap::new(),
    };
    for r in current {
        working.add(r);
    }

    let reply = match evaluate(ctx, &zone.name, &mut working) {
        Ok(plan) => plan,
        Err(reject) => return reject_reply(ctx, reject),
    };
    let Plan { add, set, remove } = reply;

    debug!(
        cid = ctx.cid,
        zone = %zone.name,
        add = add.len(),
        set = set.len(),
        remove = remove.len(),
        "dns update evaluated"
    );

    // Not atomic: the provider API cannot do that. Deletes go first so a
    // replace never leaves both values; a partial failure leaves the
    // intermediate state for the next sync.
    if !remove.is_empty() {
        let records = remove.iter().map(to_provider_record).collect();
        if let Err(e) = gateway.delete_records(&zone.name, records).await {
            return ctx.error_reply(
                Rcode::ServFail,
                ExtendedErrorCode::NetworkError,
                format!("removing records: {e}"),
            );
        }
    }
    if !set.is_empty() {
        let records = set.iter().map(to_provider_record).collect();
        if let Err(e) = gateway.set_records(&zone.name, records).await {
            return ctx.error_reply(
                Rcode::ServFail,
                ExtendedErrorCode::NetworkError,
                format!("setting records: {e}"),
            );
        }
    }
    if !add.is_empty() {
        let records = add.iter().map(to_provider_record).collect();
        if let Err(e) = gateway.append_records(&zone.name, records).await {
            return ctx.error_reply(
                Rcode::ServFail,
                ExtendedErrorCode::NetworkError,
                format!("adding records: {e}"),
            );
        }
    }

    // Hand the zone lock to the propagation waiter and respond. The
    // waiter re-syncs until the changes are visible at the provider.
    let exp_add: Vec<RecordKey> = add.iter().map(Record::record_key).collect();
    let prev_serial = prior_soa.as_ref().map(|s| s.serial_first).unwrap_or(0);
    let app = ctx.app.clone();
    let zone_bg = zone.clone();
    let gateway_bg = gateway.clone();
    let waiter = async move {
        if let Err(e) = ensure_propagate(
            &app,
            guard,
            &gateway_bg,
            &zone_bg,
            exp_add,
            remove,
            prev_serial,
        )
        .await
        {
            error!(zone = %zone_bg.name, err = %e, "ensuring propagation of dns update");
        }
    };
    if ctx.app.synchronous_background {
        waiter.await;
    } else {
        crate::spawn_guarded("ensuring updated zone after dns update", waiter);
    }

    let frame = ctx
        .answer_builder(Rcode::NoError)
        .map(|b| b.additional())
        .and_then(|b| ctx.finish(b, None, None));
    match frame {
        Ok(frame) => {
            let mut reply = ctx.reply(vec![frame], "noerror".to_string());
            if changed {
                reply.notify_zone = Some(zone.name);
            }
            reply
        }
        Err(e) => ctx.servfail(e.to_string()),
    }
}

struct Plan {
    add: Vec<Record>,
    set: Vec<Record>,
    remove: Vec<Record>,
}

struct Reject {
    rcode: Rcode,
    msg: String,
}

fn reject(rcode: Rcode, msg: impl Into<String>) -> Reject {
    Reject {
        rcode,
        msg: msg.into(),
    }
}

fn reject_reply(ctx: &mut ReqCtx, r: Reject) -> Reply {
    ctx.error_reply(r.rcode, ExtendedErrorCode::Other, r.msg)
}

/// Evaluates prerequisites and updates against the working state,
/// producing the provider call plan or the rejection rcode.
fn evaluate(
    ctx: &ReqCtx,
    zone: &str,
    working: &mut Working,
) -> std::result::Result<Plan, Reject> {
    let now = Utc::now();

    let prereqs = ctx
        .msg
        .answer()
        .map_err(|e| reject(Rcode::FormErr, format!("parsing answer: {e}")))
        .and_then(|section| {
            parse_update_section(section)
                .map_err(|e| reject(Rcode::FormErr, e.to_string()))
        })?;
    check_prerequisites(zone, &prereqs, working, now)?;
    debug!(cid = ctx.cid, "dns update prerequisites are ok");

    let updates = ctx
        .msg
        .authority()
        .map_err(|e| reject(Rcode::FormErr, format!("parsing authority: {e}")))
        .and_then(|section| {
            parse_update_section(section)
                .map_err(|e| reject(Rcode::FormErr, e.to_string()))
        })?;
    evaluate_updates(zone, &updates, working, now)
}

fn check_prerequisites(
    zone: &str,
    prereqs: &[UpdateRr],
    working: &Working,
    now: DateTime<Utc>,
) -> std::result::Result<(), Reject> {
    // Value prerequisites are collected per rrset and checked as a group.
    let mut rrsets_check: HashMap<RrsetKey, Vec<Record>> = HashMap::new();

    for rr in prereqs {
        if rr.ttl != 0 {
            return Err(reject(
                Rcode::FormErr,
                "ttl of prerequisites must be 0",
            ));
        }
        let name = clean_abs_name(&rr.name_raw)
            .map_err(|_| reject(Rcode::FormErr, format!("bad name {}", rr.name_raw)))?;
        if !in_zone(&name, zone) {
            return Err(reject(Rcode::NotZone, "name must be in zone"));
        }

        match rr.class {
            CLASS_ANY => {
                if rr.rdlen != 0 {
                    return Err(reject(
                        Rcode::FormErr,
                        "prereq with class any must have empty rdata",
                    ));
                }
                // Name (or rrset) must be in use.
                let exists = working.known.values().any(|cr| {
                    cr.abs_name == name
                        && (rr.rtype == RTYPE_ANY || rr.rtype == cr.rtype)
                });
                if !exists {
                    let rcode = if rr.rtype == RTYPE_ANY {
                        Rcode::NXDomain
                    } else {
                        Rcode::NXRRSet
                    };
                    return Err(reject(rcode, "prerequisite failed"));
                }
            }
            CLASS_NONE => {
                if rr.rdlen != 0 {
                    return Err(reject(
                        Rcode::FormErr,
                        "prereq with class none must have empty rdata",
                    ));
                }
                // Name (or rrset) must not be in use.
                let exists = working.known.values().any(|cr| {
                    cr.abs_name == name
                        && (rr.rtype == RTYPE_ANY || rr.rtype == cr.rtype)
                });
                if exists {
                    let rcode = if rr.rtype == RTYPE_ANY {
                        Rcode::YXDomain
                    } else {
                        Rcode::YXRRSet
                    };
                    return Err(reject(rcode, "prerequisite failed"));
                }
            }
            CLASS_IN => {
                let record = Record {
                    id: Uuid::nil(),
                    zone: zone.to_string(),
                    serial_first: 0,
                    serial_deleted: 0,
                    first: now,
                    deleted: None,
                    abs_name: name,
                    rtype: rr.rtype,
                    class: CLASS_IN,
                    ttl: 0,
                    data_hex: rr.data_hex.clone(),
                    value: rr.value.clone(),
                    provider_id: String::new(),
                };
                rrsets_check
                    .entry(record.rrset_key())
                    .or_default()
                    .push(record);
            }
            _ => {
                return Err(reject(Rcode::FormErr, "class must be inet"));
            }
        }
    }

    static EMPTY: Vec<Record> = Vec::new();
    for (key, expected) in &rrsets_check {
        let current = working.rrsets.get(key).unwrap_or(&EMPTY);
        if !rrset_equal_no_ttl(expected, current) {
            return Err(reject(
                Rcode::NXRRSet,
                format!("prerequisite failed for {key:?}"),
            ));
        }
    }
    Ok(())
}

fn evaluate_updates(
    zone: &str,
    updates: &[UpdateRr],
    working: &mut Working,
    now: DateTime<Utc>,
) -> std::result::Result<Plan, Reject> {
    let mut plan = Plan {
        add: Vec::new(),
        set: Vec::new(),
        remove: Vec::new(),
    };

    for rr in updates {
        match rr.class {
            CLASS_ANY | CLASS_NONE | CLASS_IN => {}
            _ => {
                return Err(reject(
                    Rcode::FormErr,
                    "can only add records with class INET",
                ));
            }
        }

        let name = clean_abs_name(&rr.name_raw)
            .map_err(|_| reject(Rcode::FormErr, format!("bad name {}", rr.name_raw)))?;
        if !in_zone(&name, zone) {
            return Err(reject(Rcode::NotZone, "name must be in zone"));
        }
        if is_meta_rtype(rr.rtype) {
            return Err(reject(Rcode::FormErr, "meta record types not allowed"));
        }
        if rr.class != CLASS_ANY && rr.rtype == RTYPE_ANY {
            return Err(reject(
                Rcode::FormErr,
                "record type any not allowed for class other than any",
            ));
        }

        if rr.class == CLASS_ANY {
            if rr.ttl != 0 {
                return Err(reject(Rcode::FormErr, "ttl must be zero for class any"));
            }
            if rr.rdlen != 0 {
                return Err(reject(
                    Rcode::FormErr,
                    "rdlength must be zero for class any",
                ));
            }
            // Delete all rrsets of the name (or only the named type),
            // never the apex SOA or apex NS.
            let victims: Vec<Record> = working
                .known
                .values()
                .filter(|cr| {
                    cr.abs_name == name
                        && (rr.rtype == RTYPE_ANY || rr.rtype == cr.rtype)
                        && !(name == zone
                            && (cr.rtype == RTYPE_SOA || cr.rtype == RTYPE_NS))
                })
                .cloned()
                .collect();
            for victim in victims {
                working.del(&victim);
                plan.remove.push(victim);
            }
            continue;
        }

        let mut record = Record {
            id: Uuid::nil(),
            zone: zone.to_string(),
            serial_first: 0,
            serial_deleted: 0,
            first: now,
            deleted: None,
            abs_name: name.clone(),
            rtype: rr.rtype,
            class: CLASS_IN,
            ttl: rr.ttl,
            data_hex: rr.data_hex.clone(),
            value: rr.value.clone(),
            provider_id: String::new(),
        };

        if rr.class == CLASS_NONE {
            // Deleting the zone SOA is ignored.
            if record.abs_name == zone && record.rtype == RTYPE_SOA {
                debug!(record = ?record.record_key(), "removing soa for zone is ignored");
                continue;
            }
            // Attempts to delete the last apex NS are ignored.
            if record.abs_name == zone
                && record.rtype == RTYPE_NS
                && working
                    .rrsets
                    .get(&record.rrset_key())
                    .map(|l| l.len())
                    .unwrap_or(0)
                    == 1
            {
                debug!("removing last ns record for zone is ignored");
                continue;
            }

            // Remove all records matching (name, type, data); TTL is not
            // part of the match.
            let victims: Vec<Record> = working
                .known
                .values()
                .filter(|cr| {
                    cr.abs_name == record.abs_name
                        && cr.rtype == record.rtype
                        && cr.data_hex == record.data_hex
                })
                .cloned()
                .collect();
            for victim in victims {
                working.del(&victim);
                plan.remove.push(victim);
            }
            continue;
        }

        // Class INET: additions.

        // Identical record already present: nothing to do.
        if working.known.contains_key(&record.record_key()) {
            continue;
        }

        if record.rtype == RTYPE_SOA {
            return Err(reject(Rcode::Refused, "setting soa not implemented"));
        }

        if record.rtype != RTYPE_CNAME {
            // A CNAME at the name shadows everything else; ignore.
            let cname_key = RrsetKey {
                abs_name: record.abs_name.clone(),
                rtype: RTYPE_CNAME,
                class: CLASS_IN,
            };
            if working.rrsets.get(&cname_key).map(|l| !l.is_empty()) == Some(true) {
                info!("attempt to add record for name that has a cname, ignoring");
                continue;
            }
            plan.add.push(record.clone());
            working.add(record);
            continue;
        }

        // CNAME: only a single value can exist. An existing CNAME is
        // replaced through a set, preserving the provider id; an existing
        // non-CNAME makes us ignore the change.
        let existing = working
            .rrsets
            .get(&record.rrset_key())
            .cloned()
            .unwrap_or_default();
        if !existing.is_empty() {
            record.provider_id = existing[0].provider_id.clone();
            plan.set.push(record.clone());
            for victim in existing {
                working.del(&victim);
            }
            working.add(record);
        } else {
            let other_data = working
                .known
                .values()
                .any(|cr| cr.abs_name == record.abs_name);
            if !other_data {
                plan.add.push(record.clone());
                working.add(record);
            }
        }
    }

    Ok(plan)
}

#[cfg(test)]
#[path = "update_tests.rs"]
mod update_tests;
