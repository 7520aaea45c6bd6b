//! Propagation-history reconstruction.
//!
//! Given the full record log of a zone (tombstones included), rebuilds the
//! per-RRset timeline of what resolvers may still be observing: positive
//! periods while records were live (plus one TTL of cache tail after
//! deletion), windows where a wildcard shadowed the name, and negative
//! caching windows bounded by the SOA minimum TTL in effect at the time.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use stratus_common::types::{Record, RTYPE_SOA};
use stratus_common::{Error, Result};
use stratus_dns::record::soa_from_hex;

/// Records (values) for one name and type, one version per change, with
/// the propagation states attached to the latest version.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSet {
    /// At least one record; all with the same name, type and creation
    /// time. Sorted by value.
    pub records: Vec<Record>,

    /// Historic propagation states. Only filled on the latest version of
    /// a set.
    pub states: Vec<PropagationState>,
}

/// One period during which a particular value set (or a negative result)
/// may be observed by resolvers.
#[derive(Debug, Clone, Serialize)]
pub struct PropagationState {
    pub start: DateTime<Utc>,
    /// `None` while still active.
    pub end: Option<DateTime<Utc>>,

    /// A period during which a negative lookup result may be cached;
    /// `records` is empty.
    pub negative: bool,

    pub records: Vec<Record>,
}

/// Effective maximum negative-caching TTL over a period, from the SOA
/// history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub max_negative_ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RecordSetKey {
    pub abs_name: String,
    pub rtype: u16,
}

fn ttl_duration(ttl: u32) -> Duration {
    Duration::seconds(i64::from(ttl))
}

/// When the record stops being observable: deletion plus one TTL of cache
/// tail, or `None` while live.
fn effective_end(r: &Record) -> Option<DateTime<Utc>> {
    r.deleted.map(|d| d + ttl_duration(r.ttl))
}

/// Derives the non-overlapping, start-sorted sequence of negative-TTL
/// periods from the (historic) SOA record sets, which must be sorted by
/// increasing creation time. Where SOA effectivity windows overlap, a
/// higher negative TTL wins only for the overlap slice; periods are split
/// to preserve the maxima. A zone always has an SOA, so callers rely on
/// `start` and treat the periods as contiguous.
pub fn gather_max_negative_ttls(
    now: DateTime<Utc>,
    soa_sets: &[RecordSet],
) -> Result<Vec<TtlPeriod>> {
    if soa_sets.is_empty() {
        return Err(Error::invariant(
            "got zero soa record sets, need at least 1".to_string(),
        ));
    }

    let mut periods: Vec<TtlPeriod> = Vec::new();
    // Offset into `periods` that is final; one SOA may need to adjust or
    // split several periods after it.
    let mut done = 0usize;

    'soa: for (idx, set) in soa_sets.iter().enumerate() {
        if set.records.len() != 1 {
            return Err(Error::invariant(format!(
                "got {} soa records in a set, 1 required",
                set.records.len()
            )));
        }
        if idx > 0 && soa_sets[idx - 1].records[0].first >= set.records[0].first {
            return Err(Error::invariant("soa record sets not sorted".to_string()));
        }

        let r = &set.records[0];
        let soa = soa_from_hex(&r.data_hex)?;
        let ttl = ttl_duration(r.ttl);
        let neg_ttl = ttl_duration(soa.minimum().as_secs());

        let mut start = r.first;
        let end = match r.deleted {
            Some(d) => d + ttl,
            None => now + ttl,
        };

        if periods.is_empty() {
            periods.push(TtlPeriod {
                start,
                end,
                max_negative_ttl: neg_ttl,
            });
            continue;
        }

        if done > 0 && start < periods[done - 1].end {
            return Err(Error::invariant(
                "soa periods out of order".to_string(),
            ));
        }

        let mut i = done;
        while i < periods.len() && start < end {
            let p = periods[i].clone();

            if start > p.end {
                break;
            }

            if neg_ttl <= p.max_negative_ttl {
                i += 1;
                start = p.end;
                continue;
            }

            if start > p.start {
                if i != done {
                    return Err(Error::invariant(
                        "soa period split out of place".to_string(),
                    ));
                }
                // Split p; the next round replaces the second half's
                // negative TTL and handles the end.
                periods[i].end = start;
                periods.insert(
                    i + 1,
                    TtlPeriod {
                        start,
                        end: p.end,
                        max_negative_ttl: p.max_negative_ttl,
                    },
                );
                i += 1;
                done += 1;
                continue;
            }

            // start == p.start from here on.

            if end < p.end {
                // Split p, keeping its tail.
                periods.insert(
                    i,
                    TtlPeriod {
                        start,
                        end,
                        max_negative_ttl: neg_ttl,
                    },
                );
                periods[i + 1].start = end;
                continue 'soa;
            }

            // end >= p.end: overwrite p.
            periods[i].max_negative_ttl = neg_ttl;
            i += 1;
            done += 1;
            start = p.end;
        }
        if start >= end {
            continue;
        }

        let last = periods[periods.len() - 1].clone();
        if start == last.end && neg_ttl == last.max_negative_ttl {
            periods[i - 1].end = end;
        } else if start >= last.end {
            // May leave a gap; callers only use `start`.
            periods.push(TtlPeriod {
                start,
                end,
                max_negative_ttl: neg_ttl,
            });
            done = periods.len() - 1;
        }
    }
    Ok(periods)
}

/// Groups a zone's record log into record sets over time and attaches
/// propagation states to the latest version of each set. Negative lookup
/// caching (from the SOA minimum TTL) and wildcard shadowing are taken
/// into account.
///
/// With `only` set, the result holds just the one record set for that
/// (relative name, type); otherwise all sets of the zone. With
/// `old_active_only`, the currently-active state and states that cannot
/// be in any cache anymore are dropped.
pub fn propagation_states(
    now: DateTime<Utc>,
    mut records: Vec<Record>,
    rel_name: &str,
    only: Option<u16>,
    old_active_only: bool,
) -> Result<HashMap<RecordSetKey, Vec<RecordSet>>> {
    let mut sets: HashMap<RecordSetKey, Vec<RecordSet>> = HashMap::new();
    if records.is_empty() {
        return Ok(sets);
    }
    let zone = records[0].zone.clone();
    let abs_name = stratus_common::name::absolute_name(rel_name, &zone);

    records.sort_by_key(|r| r.first);

    // Split records into per-key versions; records of one key created at
    // the same instant form one version.
    for r in records {
        if let Some(typ) = only {
            let wildcard = format!(
                "*.{}",
                abs_name.split_once('.').map(|(_, rest)| rest).unwrap_or("")
            );
            let keep = (typ == r.rtype && r.abs_name == abs_name)
                || (typ == r.rtype && r.abs_name == wildcard)
                || (r.rtype == RTYPE_SOA && r.abs_name == r.zone);
            if !keep {
                continue;
            }
        }

        let key = RecordSetKey {
            abs_name: r.abs_name.clone(),
            rtype: r.rtype,
        };
        let versions = sets.entry(key).or_default();
        match versions.last_mut() {
            Some(last) if last.records[0].first == r.first => {
                last.records.push(r);
            }
            _ => versions.push(RecordSet {
                records: vec![r],
                states: Vec::new(),
            }),
        }
    }

    let soa_sets = sets
        .get(&RecordSetKey {
            abs_name: zone.clone(),
            rtype: RTYPE_SOA,
        })
        .cloned()
        .ok_or_else(|| Error::invariant("no soa record sets found".to_string()))?;

    let neg_ttls = gather_max_negative_ttls(now, &soa_sets)?;

    let keys: Vec<RecordSetKey> = sets.keys().cloned().collect();
    for key in keys {
        if let Some(typ) = only {
            if typ != key.rtype || key.abs_name != abs_name {
                continue;
            }
        }
        let wildcard_name = format!(
            "*.{}",
            key.abs_name
                .split_once('.')
                .map(|(_, rest)| rest)
                .unwrap_or("")
        );
        let wildcards = if wildcard_name != key.abs_name {
            sets.get(&RecordSetKey {
                abs_name: wildcard_name,
                rtype: key.rtype,
            })
            .cloned()
            .unwrap_or_default()
        } else {
            Vec::new()
        };

        let versions = sets.get_mut(&key).expect("key just listed");
        add_sets_propagation_states(
            now,
            versions,
            &neg_ttls,
            &wildcards,
            old_active_only,
        );
    }

    if let Some(typ) = only {
        let key = RecordSetKey {
            abs_name,
            rtype: typ,
        };
        let set = sets
            .remove(&key)
            .ok_or_else(|| Error::user("record set does not exist".to_string()))?;
        sets = HashMap::from([(key, set)]);
    }

    // Sort each version's records by value for stable display.
    for versions in sets.values_mut() {
        for set in versions.iter_mut() {
            set.records.sort_by(|a, b| a.value.cmp(&b.value));
        }
    }

    Ok(sets)
}

/// Attaches propagation states to the last version in `versions`,
/// filling gaps between versions with wildcard coverage and negative
/// caching windows.
fn add_sets_propagation_states(
    now: DateTime<Utc>,
    versions: &mut [RecordSet],
    neg_ttls: &[TtlPeriod],
    wildcards: &[RecordSet],
    old_active_only: bool,
) {
    let mut states: Vec<PropagationState> = Vec::new();
    let first_created = versions[0].records[0].first;

    for i in 0..versions.len() {
        let r0 = versions[i].records[0].clone();
        let end = effective_end(&r0);

        // A gap between the previous version's deletion and this
        // version's creation is filled with wildcard and/or negative
        // states.
        let gap_start = if i > 0 {
            versions[i - 1].records[0].deleted
        } else {
            None
        };
        fill_gap_wildcard_negative(
            &mut states,
            now,
            first_created,
            gap_start,
            r0.first,
            neg_ttls,
            wildcards,
            old_active_only,
        );

        if !old_active_only || end.map_or(true, |e| e > now) {
            states.push(PropagationState {
                start: r0.first,
                end,
                negative: false,
                records: versions[i].records.clone(),
            });
        }
    }

    // Wildcards still in effect after the final deletion.
    let last_deleted = versions[versions.len() - 1].records[0].deleted;
    if let Some(deleted) = last_deleted {
        let mut rest = wildcards;
        while let Some(wc) = rest.first() {
            match wc.records[0].deleted {
                Some(d) if d <= deleted => rest = &rest[1..],
                _ => break,
            }
        }
        for set in rest {
            let start = set.records[0].first.max(deleted);
            let end = set
                .records[0]
                .deleted
                .map(|d| d + ttl_duration(set.records[0].ttl));
            states.push(PropagationState {
                start,
                end,
                negative: false,
                records: set.records.clone(),
            });
        }
    }

    // Drop the still-active current value when only historic,
    // still-cachable states were asked for.
    if old_active_only {
        if let Some(last) = states.last() {
            if !last.negative
                && !last.records.is_empty()
                && last.records[0].deleted.is_none()
            {
                states.pop();
            }
        }
    }

    versions[versions.len() - 1].states = states;
}

/// Fills `gap_start..gap_end` with wildcard and negative-cache states.
/// Added states may reach past `gap_end` because of caching. A `None`
/// `gap_start` means the period before the first record; only negative
/// states are added before the first exact or wildcard record then.
/// `first_created` is the creation time of the first regular record.
#[allow(clippy::too_many_arguments)]
fn fill_gap_wildcard_negative(
    states: &mut Vec<PropagationState>,
    now: DateTime<Utc>,
    first_created: DateTime<Utc>,
    gap_start: Option<DateTime<Utc>>,
    gap_end: DateTime<Utc>,
    neg_ttls: &[TtlPeriod],
    wildcards: &[RecordSet],
    old_active_only: bool,
) {
    let mut first_created = first_created;
    // The open start (before the first record) keeps its sentinel until
    // a period has been processed.
    let mut gap_start = gap_start.unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut neg_ttls = neg_ttls;
    let mut wildcards = wildcards;

    while gap_start < gap_end {
        // Skip periods and wildcards that ended before the gap.
        while let Some(p) = neg_ttls.first() {
            if gap_start > p.end {
                neg_ttls = &neg_ttls[1..];
            } else {
                break;
            }
        }
        while let Some(wc) = wildcards.first() {
            match effective_end(&wc.records[0]) {
                Some(end) if gap_start > end => wildcards = &wildcards[1..],
                _ => break,
            }
        }

        // A wildcard covering the gap start shadows the name.
        if let Some(wc) = wildcards.first() {
            if gap_start >= wc.records[0].first {
                let r0 = &wc.records[0];
                let ttl = ttl_duration(r0.ttl);
                let eff_end = match effective_end(r0) {
                    Some(end) if end <= gap_end => end,
                    // Live past the gap: visible for one TTL beyond it.
                    _ => gap_end + ttl,
                };
                if !old_active_only || eff_end > now {
                    states.push(PropagationState {
                        start: gap_start,
                        end: Some(eff_end),
                        negative: false,
                        records: wc.records.clone(),
                    });
                }
                if r0.first < first_created {
                    first_created = r0.first;
                }
                gap_start = eff_end - ttl;
                wildcards = &wildcards[1..];
                continue;
            }
        }

        // Only possible when the SOA history is incomplete.
        let Some(p) = neg_ttls.first() else {
            if let Some(wc) = wildcards.first() {
                gap_start = wc.records[0].first;
                continue;
            }
            break;
        };

        let mut period_end = p.end.min(gap_end);
        if let Some(wc) = wildcards.first() {
            if period_end > wc.records[0].first {
                period_end = wc.records[0].first;
            }
        }
        period_end += p.max_negative_ttl;

        let start_open = gap_start == DateTime::<Utc>::MIN_UTC;
        let relevant = !old_active_only
            || (period_end > now
                && (!start_open || !states.is_empty() || p.start >= gap_start));
        if relevant {
            if states.is_empty() && gap_start < first_created {
                gap_start = first_created - p.max_negative_ttl;
            }
            states.push(PropagationState {
                start: gap_start,
                end: Some(period_end),
                negative: true,
                records: Vec::new(),
            });
        }
        gap_start = period_end - p.max_negative_ttl;
    }
}

#[cfg(test)]
#[path = "hist_tests.rs"]
mod hist_tests;
