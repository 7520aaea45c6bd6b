//! Wire-level tests: real listeners on loopback, the in-process memory
//! provider southbound, and `domain`'s client-side TSIG for signing.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use domain::base::iana::{Class, Opcode, Rcode, Rtype};
use domain::base::message::Message;
use domain::base::message_builder::{
    AdditionalBuilder, MessageBuilder, StreamTarget,
};
use domain::base::name::Dname;
use domain::base::rdata::UnknownRecordData;
use domain::rdata::rfc1035::{Soa, A};
use domain::rdata::tsig::{Time48, Tsig};
use domain::tsig::{Algorithm, ClientSequence, ClientTransaction, Key, KeyName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use uuid::Uuid;

use base64::Engine;
use stratus_common::types::{
    Credential, CredentialKind, ProviderConfig, ProviderRecord, Zone,
    ZoneCredential,
};
use stratus_dns::client::exchange_tcp;
use stratus_server::providers::MemoryProvider;
use stratus_server::store::Store;
use stratus_server::{dns, refresh, App};

const ZONE: &str = "z0.example.";
const TSIG_SECRET: &[u8; 32] = b"0123456789abcdef0123456789abcdef";
const RTYPE_A: u16 = 1;

struct Harness {
    app: Arc<App>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    provider: MemoryProvider,
    _shutdown: watch::Sender<()>,
    _dir: tempfile::TempDir,
}

fn pr(name: &str, rtype: &str, value: &str) -> ProviderRecord {
    ProviderRecord {
        id: String::new(),
        rtype: rtype.to_string(),
        name: name.to_string(),
        value: value.to_string(),
        ttl: 300,
    }
}

fn soa_pr(serial: u32) -> ProviderRecord {
    pr(
        "@",
        "SOA",
        &format!("ns0.{ZONE} mail.{ZONE} {serial} 3600 300 1209600 300"),
    )
}

async fn start(store_name: &str) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().join("stratus.db")).expect("open store");

    let provider = MemoryProvider::handle(store_name);
    provider.put_zone(
        ZONE,
        vec![
            soa_pr(7),
            pr("testhost", "A", "10.0.0.1"),
            pr("testhost", "A", "10.0.0.2"),
        ],
    );

    let credential = Credential {
        id: Uuid::now_v7(),
        created: Utc::now(),
        name: ZONE.trim_end_matches('.').to_string(),
        kind: CredentialKind::Tsig,
        tsig_secret: base64::engine::general_purpose::STANDARD
            .encode(TSIG_SECRET),
        tls_public_key: String::new(),
    };
    let far_future = Utc::now() + chrono::Duration::days(365);
    let zone = Zone {
        name: ZONE.to_string(),
        provider_config: "test".to_string(),
        serial_local: 0,
        serial_remote: 0,
        last_sync: None,
        last_record_change: None,
        sync_interval: Duration::from_secs(3600),
        refresh_interval: Duration::from_secs(86400),
        next_sync: far_future,
        next_refresh: far_future,
    };
    let config = ProviderConfig {
        name: "test".to_string(),
        provider: "memory".to_string(),
        config: format!("{{\"store\":\"{store_name}\"}}"),
    };
    {
        let (zone, config, credential) =
            (zone.clone(), config.clone(), credential.clone());
        store
            .write(move |tx| {
                tx.provider_config_insert(&config)?;
                tx.zone_insert(&zone)?;
                tx.credential_insert(&credential)?;
                tx.zone_credential_insert(&ZoneCredential {
                    id: Uuid::now_v7(),
                    zone: ZONE.to_string(),
                    credential_id: credential.id,
                })
            })
            .expect("seed store");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut app = App::new(store, "adminpw".to_string(), shutdown_rx);
    app.propagation_first_wait = Duration::from_millis(1);
    app.synchronous_background = true;
    let app = Arc::new(app);

    // Mirror the provider into the store before serving.
    refresh::refresh_zone_sync(&app, &zone)
        .await
        .expect("initial sync");

    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind tcp");
    let tcp_addr = tcp.local_addr().expect("tcp addr");
    let ops = dns::ListenerOps {
        notify: true,
        updates: true,
        xfr: true,
        auth: true,
    };
    tokio::spawn(dns::serve_tcp(app.clone(), tcp, ops));

    let udp = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind udp");
    let udp_addr = udp.local_addr().expect("udp addr");
    let udp_ops = dns::ListenerOps {
        notify: true,
        updates: false,
        xfr: false,
        auth: true,
    };
    tokio::spawn(dns::serve_udp(app.clone(), udp, udp_ops));

    Harness {
        app,
        tcp_addr,
        udp_addr,
        provider,
        _shutdown: shutdown_tx,
        _dir: dir,
    }
}

fn name(s: &str) -> Dname<Vec<u8>> {
    Dname::from_str(s).expect("valid name")
}

fn client_key() -> Arc<Key> {
    Arc::new(
        Key::new(
            Algorithm::Sha256,
            TSIG_SECRET,
            KeyName::from_str(ZONE).expect("key name"),
            None,
            None,
        )
        .expect("key"),
    )
}

fn query(opcode: Opcode, zone: &str, rtype: Rtype) -> AdditionalBuilder<StreamTarget<Vec<u8>>> {
    let mut builder = MessageBuilder::new_stream_vec();
    builder.header_mut().set_id(rand_id());
    builder.header_mut().set_opcode(opcode);
    let mut question = builder.question();
    question.push((name(zone), rtype)).expect("push question");
    question.additional()
}

fn rand_id() -> u16 {
    (SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .subsec_nanos()
        % u32::from(u16::MAX)) as u16
}

async fn exchange(addr: SocketAddr, frame: &StreamTarget<Vec<u8>>) -> Message<Vec<u8>> {
    let resp = exchange_tcp(addr, frame.as_stream_slice(), Duration::from_secs(10))
        .await
        .expect("dns exchange");
    Message::from_octets(resp).expect("parse response")
}

fn live_a_records(harness: &Harness) -> Vec<String> {
    let mut values: Vec<String> = harness
        .app
        .store
        .read(|tx| tx.live_records(ZONE))
        .expect("live records")
        .into_iter()
        .filter(|r| r.rtype == RTYPE_A)
        .map(|r| r.value)
        .collect();
    values.sort();
    values
}

#[tokio::test]
async fn authoritative_soa_and_version() {
    let h = start("auth_soa").await;

    // SOA at the apex answers authoritatively.
    let msg = exchange(h.tcp_addr, &query(Opcode::Query, ZONE, Rtype::Soa).finish())
        .await;
    assert_eq!(msg.header().rcode(), Rcode::NoError);
    assert!(msg.header().aa());
    assert_eq!(msg.header_counts().ancount(), 1);
    let answer = msg.answer().expect("answer section");
    let soa = answer
        .limit_to::<Soa<_>>()
        .next()
        .expect("soa answer")
        .expect("parse soa");
    assert_eq!(u32::from(soa.data().serial()), 7);

    // Below the apex there is no SOA: NXDOMAIN.
    let msg = exchange(
        h.tcp_addr,
        &query(Opcode::Query, &format!("sub.{ZONE}"), Rtype::Soa).finish(),
    )
    .await;
    assert_eq!(msg.header().rcode(), Rcode::NXDomain);

    // Unknown zones are NOTAUTH.
    let msg = exchange(
        h.tcp_addr,
        &query(Opcode::Query, "other.example.", Rtype::Soa).finish(),
    )
    .await;
    assert_eq!(msg.header().rcode(), Rcode::NotAuth);

    // Only SOA can be asked for.
    let msg = exchange(h.tcp_addr, &query(Opcode::Query, ZONE, Rtype::A).finish())
        .await;
    assert_eq!(msg.header().rcode(), Rcode::ServFail);

    // CHAOS version.bind.
    let mut builder = MessageBuilder::new_stream_vec();
    builder.header_mut().set_id(rand_id());
    builder.header_mut().set_opcode(Opcode::Query);
    let mut question = builder.question();
    question
        .push((name("version.bind."), Rtype::Txt, Class::Ch))
        .expect("push question");
    let msg = exchange(h.tcp_addr, &question.additional().finish()).await;
    assert_eq!(msg.header().rcode(), Rcode::NoError);
    assert_eq!(msg.header_counts().ancount(), 1);
}

#[tokio::test]
async fn notify_with_known_serial_is_idempotent() {
    let h = start("notify_idem").await;
    let soa_row = h
        .app
        .store
        .read(|tx| tx.live_soa(ZONE))
        .expect("read soa")
        .expect("live soa");
    let rows_before = h.app.store.read(|tx| tx.records_all(ZONE)).expect("rows").len();

    // NOTIFY carrying the serial we already have: success, no work.
    let mut mb = MessageBuilder::new_stream_vec();
    mb.header_mut().set_id(rand_id());
    mb.header_mut().set_opcode(Opcode::Notify);
    let mut question = mb.question();
    question.push((name(ZONE), Rtype::Soa)).expect("question");
    let mut answer = question.answer();
    answer
        .push(stratus_dns::record::stored_to_wire(&soa_row).expect("soa wire"))
        .expect("answer");
    let builder = answer.additional();

    let msg = exchange(h.tcp_addr, &builder.finish()).await;
    assert_eq!(msg.header().rcode(), Rcode::NoError);

    let rows_after = h.app.store.read(|tx| tx.records_all(ZONE)).expect("rows").len();
    assert_eq!(rows_before, rows_after);
    let zone = h.app.store.read(|tx| tx.zone(ZONE)).expect("zone");
    assert_eq!(zone.serial_local, soa_row.serial_first);
}

#[tokio::test]
async fn notify_without_answer_converges_via_udp() {
    let h = start("notify_conv").await;

    // The provider grew a record out of band.
    h.provider.put_zone(
        ZONE,
        vec![
            soa_pr(8),
            pr("testhost", "A", "10.0.0.1"),
            pr("testhost", "A", "10.0.0.2"),
            pr("nhost", "A", "10.0.0.3"),
        ],
    );

    let frame = query(Opcode::Notify, ZONE, Rtype::Soa).finish();
    let resp = stratus_dns::client::exchange_udp(
        h.udp_addr,
        frame.as_dgram_slice(),
        Duration::from_secs(10),
    )
    .await
    .expect("udp exchange");
    let msg = Message::from_octets(resp).expect("parse response");
    assert_eq!(msg.header().rcode(), Rcode::NoError);

    // The background sync ran before the response (test mode): the new
    // record and a new SOA row are visible.
    let values = live_a_records(&h);
    assert!(values.contains(&"10.0.0.3".to_string()), "got {values:?}");
    let zone = h.app.store.read(|tx| tx.zone(ZONE)).expect("zone");
    assert_eq!(zone.serial_local, 8);
}

fn update_add_a(zone: &str, host: &str, addr: &str) -> AdditionalBuilder<StreamTarget<Vec<u8>>> {
    let mut builder = MessageBuilder::new_stream_vec();
    builder.header_mut().set_id(rand_id());
    builder.header_mut().set_opcode(Opcode::Update);
    let mut question = builder.question();
    question.push((name(zone), Rtype::Soa)).expect("question");
    let mut authority = question.answer().authority();
    authority
        .push((
            name(&format!("{host}.{zone}")),
            Class::In,
            300u32,
            A::new(addr.parse().expect("ipv4")),
        ))
        .expect("authority record");
    authority.additional()
}

#[tokio::test]
async fn update_add_replaces_rrset() {
    let h = start("update_add").await;
    let key = client_key();

    let mut builder = update_add_a(ZONE, "testhost", "10.0.0.3");
    let transaction =
        ClientTransaction::request(key.clone(), &mut builder, Time48::now())
            .expect("sign request");
    let mut msg = exchange(h.tcp_addr, &builder.finish()).await;
    transaction
        .answer(&mut msg, Time48::now())
        .expect("verify response tsig");
    assert_eq!(msg.header().rcode(), Rcode::NoError);

    // Two A rows tombstoned, three live.
    let values = live_a_records(&h);
    assert_eq!(values, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let tombstoned = h
        .app
        .store
        .read(|tx| tx.records_all(ZONE))
        .expect("rows")
        .into_iter()
        .filter(|r| r.rtype == RTYPE_A && !r.is_live())
        .count();
    assert_eq!(tombstoned, 2);

    // The provider saw the append.
    let provider_a = h
        .provider
        .records(ZONE)
        .into_iter()
        .filter(|r| r.rtype == "A")
        .count();
    assert_eq!(provider_a, 3);

    // The zone's local serial advanced.
    let zone = h.app.store.read(|tx| tx.zone(ZONE)).expect("zone");
    assert!(zone.serial_local > 7);
}

#[tokio::test]
async fn update_without_credentials_is_refused() {
    let h = start("update_refused").await;
    let msg =
        exchange(h.tcp_addr, &update_add_a(ZONE, "testhost", "10.0.0.3").finish())
            .await;
    assert_eq!(msg.header().rcode(), Rcode::Refused);
}

#[tokio::test]
async fn unauthorized_requests_refused_before_zone_lookup() {
    // Credential presentation is checked first: without a usable
    // credential the answer is REFUSED whether or not the zone exists,
    // and the response never reveals which it was.
    let h = start("refused_first").await;

    let msg = exchange(
        h.tcp_addr,
        &update_add_a("other.example.", "testhost", "10.0.0.3").finish(),
    )
    .await;
    assert_eq!(msg.header().rcode(), Rcode::Refused);

    // A valid key that is not linked to the (unknown) zone: still
    // REFUSED, not NOTAUTH.
    let key = client_key();
    let mut builder = query(Opcode::Query, "other.example.", Rtype::Axfr);
    ClientSequence::request(key, &mut builder, Time48::now()).expect("sign");
    let msg = exchange(h.tcp_addr, &builder.finish()).await;
    assert_eq!(msg.header().rcode(), Rcode::Refused);
}

#[tokio::test]
async fn update_prerequisite_failure_changes_nothing() {
    let h = start("update_prereq").await;
    let key = client_key();

    // Prerequisite: testhost must not exist. It does.
    let mut builder = MessageBuilder::new_stream_vec();
    builder.header_mut().set_id(rand_id());
    builder.header_mut().set_opcode(Opcode::Update);
    let mut question = builder.question();
    question.push((name(ZONE), Rtype::Soa)).expect("question");
    let mut answer = question.answer();
    answer
        .push((
            name(&format!("testhost.{ZONE}")),
            Class::None,
            0u32,
            UnknownRecordData::from_octets(Rtype::Any, Vec::new()),
        ))
        .expect("prereq");
    let mut authority = answer.authority();
    authority
        .push((
            name(&format!("testhost.{ZONE}")),
            Class::In,
            300u32,
            A::new("10.0.0.3".parse().expect("ipv4")),
        ))
        .expect("authority record");
    let mut builder = authority.additional();
    ClientTransaction::request(key, &mut builder, Time48::now()).expect("sign");

    let msg = exchange(h.tcp_addr, &builder.finish()).await;
    assert_eq!(msg.header().rcode(), Rcode::YXDomain);

    let values = live_a_records(&h);
    assert_eq!(values, vec!["10.0.0.1", "10.0.0.2"]);
}

#[tokio::test]
async fn axfr_unauthenticated_is_refused() {
    let h = start("axfr_refused").await;
    let msg =
        exchange(h.tcp_addr, &query(Opcode::Query, ZONE, Rtype::Axfr).finish())
            .await;
    assert_eq!(msg.header().rcode(), Rcode::Refused);
}

#[tokio::test]
async fn axfr_with_stale_tsig_is_badtime() {
    let h = start("axfr_badtime").await;
    let key = client_key();

    let stale = Time48::from_u64(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_secs()
            - 3600,
    );
    let mut builder = query(Opcode::Query, ZONE, Rtype::Axfr);
    ClientSequence::request(key, &mut builder, stale).expect("sign");
    let msg = exchange(h.tcp_addr, &builder.finish()).await;
    assert_eq!(msg.header().rcode(), Rcode::NotAuth);

    // The TSIG record of the answer carries BADTIME.
    let additional = msg.additional().expect("additional");
    let tsig = additional
        .limit_to::<Tsig<_, _>>()
        .next()
        .expect("tsig record")
        .expect("parse tsig");
    assert_eq!(
        tsig.data().error(),
        domain::base::iana::TsigRcode::BADTIME
    );
}

#[tokio::test]
async fn axfr_with_tsig_spans_chained_messages() {
    let h = start("axfr_chain").await;
    let key = client_key();

    // 256 TXT records of about 1 KiB each: the transfer cannot fit one
    // message.
    let mut records = vec![
        soa_pr(9),
        pr("testhost", "A", "10.0.0.1"),
        pr("testhost", "A", "10.0.0.2"),
    ];
    let chunk = "x".repeat(250);
    for i in 0..256 {
        records.push(pr(
            &format!("t{i}"),
            "TXT",
            &format!("\"{chunk}\" \"{chunk}\" \"{chunk}\" \"{chunk}\""),
        ));
    }
    h.provider.put_zone(ZONE, records);

    let mut builder = query(Opcode::Query, ZONE, Rtype::Axfr);
    let mut sequence =
        ClientSequence::request(key, &mut builder, Time48::now()).expect("sign");
    let frame = builder.finish();

    let mut stream = tokio::net::TcpStream::connect(h.tcp_addr)
        .await
        .expect("connect");
    stream
        .write_all(frame.as_stream_slice())
        .await
        .expect("send request");

    let mut messages = 0usize;
    let mut answers: Vec<(String, Rtype)> = Vec::new();
    'messages: loop {
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await.expect("frame length");
        let size = usize::from(u16::from_be_bytes(len));
        let mut buf = vec![0u8; size];
        stream.read_exact(&mut buf).await.expect("frame body");
        let mut msg = Message::from_octets(buf).expect("parse message");
        assert_eq!(msg.header().rcode(), Rcode::NoError);

        // Verifies the MAC chain: each message's signature depends on the
        // previous one.
        sequence
            .answer(&mut msg, Time48::now())
            .expect("verify chained tsig");
        messages += 1;

        for rr in msg.answer().expect("answer section") {
            let rr = rr.expect("answer record");
            answers.push((rr.owner().to_string(), rr.rtype()));
            if answers.len() > 1 && rr.rtype() == Rtype::Soa {
                break 'messages;
            }
        }
    }
    sequence.done().expect("sequence complete");

    assert!(messages > 1, "expected a multi-message transfer");
    assert_eq!(answers.first().map(|(_, t)| *t), Some(Rtype::Soa));
    assert_eq!(answers.last().map(|(_, t)| *t), Some(Rtype::Soa));
    // SOA, 2 A, 256 TXT, SOA.
    assert_eq!(answers.len(), 260);
    let txt = answers.iter().filter(|(_, t)| *t == Rtype::Txt).count();
    assert_eq!(txt, 256);
}

#[tokio::test]
async fn non_inet_class_is_refused() {
    let h = start("class_refused").await;
    let mut builder = MessageBuilder::new_stream_vec();
    builder.header_mut().set_id(rand_id());
    builder.header_mut().set_opcode(Opcode::Query);
    let mut question = builder.question();
    question
        .push((name(ZONE), Rtype::Soa, Class::Hs))
        .expect("question");
    let msg = exchange(h.tcp_addr, &question.additional().finish()).await;
    assert_eq!(msg.header().rcode(), Rcode::Refused);
}

#[tokio::test]
async fn soa_row_serial_tracks_store_rows() {
    // After an update, tombstoned rows carry the serial that superseded
    // them and live rows the serial that introduced them.
    let h = start("serial_rows").await;
    let key = client_key();

    let mut builder = update_add_a(ZONE, "testhost", "10.0.0.3");
    ClientTransaction::request(key, &mut builder, Time48::now()).expect("sign");
    let msg = exchange(h.tcp_addr, &builder.finish()).await;
    assert_eq!(msg.header().rcode(), Rcode::NoError);

    let soa = h
        .app
        .store
        .read(|tx| tx.live_soa(ZONE))
        .expect("soa")
        .expect("live soa");
    let rows = h.app.store.read(|tx| tx.records_all(ZONE)).expect("rows");
    for row in rows.iter().filter(|r| r.rtype == RTYPE_A) {
        if row.is_live() {
            if row.value == "10.0.0.3" {
                assert_eq!(row.serial_first, soa.serial_first);
            }
        } else {
            assert_eq!(row.serial_deleted, soa.serial_first);
        }
    }
}
