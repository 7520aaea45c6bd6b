use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use stratus_common::types::{Record, RTYPE_SOA};
use stratus_dns::record::parse_provider_record;

use super::{
    gather_max_negative_ttls, propagation_states, RecordSet, RecordSetKey,
    TtlPeriod,
};

const ZONE: &str = "example.";

fn soa_data_hex(serial: u32, neg_ttl: i64) -> String {
    parse_provider_record(
        ZONE,
        300,
        "SOA",
        &format!("ns0.example. mail.example. {serial} 3600 300 1209600 {neg_ttl}"),
        "",
    )
    .expect("parse soa")
    .data_hex
}

fn record(
    zone_offset_record: (
        &str,          // abs name
        u16,           // rtype
        u32,           // ttl
        &str,          // value
        String,        // data hex
    ),
    serial_first: u32,
    serial_deleted: u32,
    first: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
) -> Record {
    let (abs_name, rtype, ttl, value, data_hex) = zone_offset_record;
    Record {
        id: Uuid::now_v7(),
        zone: ZONE.to_string(),
        serial_first,
        serial_deleted,
        first,
        deleted,
        abs_name: abs_name.to_string(),
        rtype,
        class: 1,
        ttl,
        data_hex,
        value: value.to_string(),
        provider_id: String::new(),
    }
}

#[test]
fn gather_negative_ttls() {
    let now = Utc::now();
    let start = now - Duration::minutes(10);

    // One SOA "record set": starts at start+s, deleted halfway to e, with
    // a TTL chosen so the effective end lands exactly on start+e.
    let rrset = |s: i64, e: i64, negttl: i64| -> RecordSet {
        let half = (e - s) / 2;
        let deleted = start + Duration::seconds(s + half);
        let ttl = e - (s + half);
        RecordSet {
            records: vec![record(
                (ZONE, RTYPE_SOA, ttl as u32, "", soa_data_hex(2024123100, negttl)),
                1,
                0,
                start + Duration::seconds(s),
                Some(deleted),
            )],
            states: Vec::new(),
        }
    };
    let period = |s: i64, e: i64, negttl: i64| TtlPeriod {
        start: start + Duration::seconds(s),
        end: start + Duration::seconds(e),
        max_negative_ttl: Duration::seconds(negttl),
    };

    let check = |sets: Vec<RecordSet>, expected: Vec<TtlPeriod>| {
        let got = gather_max_negative_ttls(now, &sets).expect("gather");
        assert_eq!(got, expected);
    };

    // A higher negative TTL wins only for the overlap slice.
    check(
        vec![rrset(0, 180, 600), rrset(60, 120, 900)],
        vec![period(0, 60, 600), period(60, 120, 900), period(120, 180, 600)],
    );

    // Contiguous periods with the same TTL merge.
    check(
        vec![rrset(0, 60, 300), rrset(60, 120, 300), rrset(120, 180, 300)],
        vec![period(0, 180, 300)],
    );

    check(
        vec![
            rrset(0, 120, 600),    // initial
            rrset(10, 20, 120),    // smaller than previous, dropped
            rrset(60, 120, 300),   // smaller than previous, dropped
            rrset(110, 140, 60),   // first part smaller, second part new
            rrset(130, 150, 120),  // last part replaced
            rrset(150, 160, 120),  // last part extended, same negttl
            rrset(160, 170, 60),   // last part extended, lower negttl
            rrset(170, 180, 180),  // last part extended, higher negttl
            rrset(180, 280, 600),
            rrset(190, 270, 1200),
            rrset(200, 260, 1800),
            rrset(300, 310, 60),   // with gap before
            rrset(320, 330, 60),   // with gap
        ],
        vec![
            period(0, 120, 600),
            period(120, 130, 60),
            period(130, 160, 120),
            period(160, 170, 60),
            period(170, 180, 180),
            period(180, 190, 600),
            period(190, 200, 1200),
            period(200, 260, 1800),
            period(260, 270, 1200),
            period(270, 280, 600),
            period(300, 310, 60),
            period(320, 330, 60),
        ],
    );
}

struct Input {
    start: i64,
    end: i64, // -1: still live
    name: &'static str,
    ttl: u32,
    rtype: u16,
    value: &'static str,
}

struct Output {
    start: i64,
    end: i64, // -1: still active
    negative: bool,
    ttl: u32,
    values: &'static [&'static str],
}

const TYPE_A: u16 = 1;

fn check_history(inputs: &[Input], outputs: &[Output]) {
    let now = Utc::now();
    let at = |secs: i64| now + Duration::seconds(secs);

    // Build an SOA version per distinct boundary time, each superseded by
    // the next, mirroring what the sync engine writes.
    let mut times: Vec<i64> = vec![0];
    for inp in inputs {
        times.push(inp.start);
        if inp.end >= 0 {
            times.push(inp.end);
        }
    }
    times.sort_unstable();
    times.dedup();

    let mut records = Vec::new();
    let mut soa_at = std::collections::HashMap::new();
    for (i, &t) in times.iter().enumerate() {
        let serial_first = (2 + i) as u32;
        let (deleted, serial_deleted) = if i < times.len() - 1 {
            (Some(at(times[i + 1])), (2 + i + 1) as u32)
        } else {
            (None, 0)
        };
        let soa = record(
            (ZONE, RTYPE_SOA, 300, "", soa_data_hex(serial_first, 300)),
            serial_first,
            serial_deleted,
            at(t),
            deleted,
        );
        soa_at.insert(t, soa.clone());
        records.push(soa);
    }

    for inp in inputs {
        let start_soa = &soa_at[&inp.start];
        let (deleted, serial_deleted) = if inp.end >= 0 {
            let end_soa = &soa_at[&inp.end];
            (Some(end_soa.first), end_soa.serial_first)
        } else {
            (None, 0)
        };
        records.push(record(
            (
                &format!("{}.{ZONE}", inp.name),
                inp.rtype,
                inp.ttl,
                inp.value,
                String::new(),
            ),
            start_soa.serial_first,
            serial_deleted,
            start_soa.first,
            deleted,
        ));
    }

    // The full-zone form produces sets for every name.
    let all = propagation_states(now, records.clone(), "", None, true)
        .expect("propagation states");
    assert!(all.len() > 1);

    let sets = propagation_states(now, records, "host1", Some(TYPE_A), false)
        .expect("propagation states");
    assert_eq!(sets.len(), 1);
    let versions = &sets[&RecordSetKey {
        abs_name: format!("host1.{ZONE}"),
        rtype: TYPE_A,
    }];
    let states = &versions[versions.len() - 1].states;

    assert_eq!(
        states.len(),
        outputs.len(),
        "state count mismatch: {states:#?}"
    );
    for (state, expected) in states.iter().zip(outputs) {
        assert_eq!(state.start, at(expected.start), "start of {state:?}");
        if expected.end < 0 {
            assert!(state.end.is_none(), "expected active: {state:?}");
        } else {
            assert_eq!(state.end, Some(at(expected.end)), "end of {state:?}");
        }
        assert_eq!(state.negative, expected.negative, "negative of {state:?}");
        assert_eq!(state.records.len(), expected.values.len());
        for (r, v) in state.records.iter().zip(expected.values) {
            assert_eq!(&r.value, v);
        }
        if !expected.negative {
            assert_eq!(state.records[0].ttl, expected.ttl);
        }
    }
}

#[test]
fn history_negative_and_positive_periods() {
    let inputs = [
        Input { start: 300, end: 900, name: "host0", ttl: 300, rtype: TYPE_A, value: "9.9.9.9" },
        Input { start: 600, end: 1200, name: "host1", ttl: 300, rtype: TYPE_A, value: "1.1.1.1" },
        Input { start: 600, end: 1200, name: "host1", ttl: 300, rtype: TYPE_A, value: "2.2.2.2" },
        Input { start: 1500, end: 1800, name: "host1", ttl: 600, rtype: TYPE_A, value: "3.3.3.3" },
        Input { start: 1800, end: 1900, name: "host1", ttl: 300, rtype: TYPE_A, value: "3.3.3.3" },
        Input { start: 1900, end: -1, name: "host1", ttl: 600, rtype: TYPE_A, value: "4.4.4.4" },
    ];
    let outputs = [
        Output { start: 300, end: 900, negative: true, ttl: 0, values: &[] },
        Output { start: 600, end: 1200 + 300, negative: false, ttl: 300, values: &["1.1.1.1", "2.2.2.2"] },
        Output { start: 1200, end: 1800, negative: true, ttl: 0, values: &[] },
        Output { start: 1500, end: 1800 + 600, negative: false, ttl: 600, values: &["3.3.3.3"] },
        Output { start: 1800, end: 1900 + 300, negative: false, ttl: 300, values: &["3.3.3.3"] },
        Output { start: 1900, end: -1, negative: false, ttl: 600, values: &["4.4.4.4"] },
    ];
    check_history(&inputs, &outputs);
}

#[test]
fn history_wildcard_takes_over_after_deletion() {
    let inputs = [
        Input { start: 300, end: 900, name: "host0", ttl: 300, rtype: TYPE_A, value: "9.9.9.9" },
        Input { start: 600, end: 1200, name: "host1", ttl: 300, rtype: TYPE_A, value: "1.1.1.1" },
        Input { start: 900, end: 1500, name: "*", ttl: 600, rtype: TYPE_A, value: "3.3.3.3" },
    ];
    let outputs = [
        Output { start: 300, end: 900, negative: true, ttl: 0, values: &[] },
        Output { start: 600, end: 1200 + 300, negative: false, ttl: 300, values: &["1.1.1.1"] },
        Output { start: 1200, end: 1500 + 600, negative: false, ttl: 600, values: &["3.3.3.3"] },
    ];
    check_history(&inputs, &outputs);
}

#[test]
fn history_wildcard_shadowed_by_exact_record() {
    let inputs = [
        Input { start: 300, end: 900, name: "host0", ttl: 300, rtype: TYPE_A, value: "9.9.9.9" },
        Input { start: 600, end: 1200, name: "*", ttl: 300, rtype: TYPE_A, value: "1.1.1.1" },
        Input { start: 900, end: 1500, name: "host1", ttl: 600, rtype: TYPE_A, value: "3.3.3.3" },
    ];
    let outputs = [
        Output { start: 600, end: 900, negative: true, ttl: 0, values: &[] },
        Output { start: 600, end: 900 + 300, negative: false, ttl: 300, values: &["1.1.1.1"] },
        Output { start: 900, end: 1500 + 600, negative: false, ttl: 600, values: &["3.3.3.3"] },
    ];
    check_history(&inputs, &outputs);
}

#[test]
fn history_alternating_wildcard_and_exact() {
    let inputs = [
        Input { start: 300, end: 900, name: "host0", ttl: 300, rtype: TYPE_A, value: "9.9.9.9" },
        Input { start: 600, end: 750, name: "*", ttl: 300, rtype: TYPE_A, value: "1.1.1.1" },
        Input { start: 700, end: 800, name: "host1", ttl: 600, rtype: TYPE_A, value: "2.2.2.2" },
        Input { start: 750, end: 1200, name: "*", ttl: 300, rtype: TYPE_A, value: "1.1.1.2" },
        Input { start: 900, end: 1000, name: "host1", ttl: 600, rtype: TYPE_A, value: "3.3.3.3" },
    ];
    let outputs = [
        Output { start: 700 - 300, end: 600 + 300, negative: true, ttl: 0, values: &[] },
        Output { start: 600, end: 700 + 300, negative: false, ttl: 300, values: &["1.1.1.1"] },
        Output { start: 700, end: 800 + 600, negative: false, ttl: 600, values: &["2.2.2.2"] },
        Output { start: 800, end: 900 + 300, negative: false, ttl: 300, values: &["1.1.1.2"] },
        Output { start: 900, end: 1000 + 600, negative: false, ttl: 600, values: &["3.3.3.3"] },
        Output { start: 1000, end: 1200 + 300, negative: false, ttl: 300, values: &["1.1.1.2"] },
    ];
    check_history(&inputs, &outputs);
}

#[test]
fn history_wildcard_ends_before_record_returns() {
    let inputs = [
        Input { start: 300, end: 900, name: "host0", ttl: 300, rtype: TYPE_A, value: "9.9.9.9" },
        Input { start: 600, end: 1000, name: "host1", ttl: 300, rtype: TYPE_A, value: "1.1.1.1" },
        Input { start: 900, end: 1200, name: "*", ttl: 300, rtype: TYPE_A, value: "2.2.2.2" },
        Input { start: 1100, end: 1300, name: "host1", ttl: 300, rtype: TYPE_A, value: "3.3.3.3" },
    ];
    let outputs = [
        Output { start: 600 - 300, end: 600 + 300, negative: true, ttl: 0, values: &[] },
        Output { start: 600, end: 1000 + 300, negative: false, ttl: 300, values: &["1.1.1.1"] },
        Output { start: 1000, end: 1100 + 300, negative: false, ttl: 300, values: &["2.2.2.2"] },
        Output { start: 1100, end: 1300 + 300, negative: false, ttl: 300, values: &["3.3.3.3"] },
    ];
    check_history(&inputs, &outputs);
}
