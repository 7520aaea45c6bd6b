//! Out-of-band SOA fetching.
//!
//! Resolves the zone's NS set through the host's recursive resolver, then
//! asks each authoritative address for the SOA directly over TCP with
//! recursion-desired cleared. Used when a provider listing carries no SOA
//! and for freshness checks between full syncs. The result is not
//! DNSSEC-verified; that is a documented limitation.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use domain::base::iana::Rtype;
use domain::base::message::Message;
use domain::base::message_builder::MessageBuilder;
use domain::base::name::Dname;
use domain::rdata::rfc1035::{Ns, Soa};
use domain::resolv::StubResolver;
use tracing::debug;

use stratus_common::{Error, Result};

use crate::client;
use crate::record::{abs_string, soa_value};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// An SOA fetched straight from an authoritative server.
#[derive(Debug, Clone)]
pub struct FetchedSoa {
    pub ttl: u32,
    pub serial: u32,
    /// Zone-file text of the SOA RDATA, names absolute.
    pub value: String,
}

/// Fetches the SOA of `zone` from its authoritative name servers.
///
/// Tries every (nameserver, address) candidate in order and returns the
/// first valid single-answer SOA; fails with the last error only when all
/// candidates failed.
pub async fn fetch_soa(zone: &str) -> Result<FetchedSoa> {
    let resolver = StubResolver::new();
    let zone_name = Dname::<Vec<u8>>::from_str(zone)
        .map_err(|e| Error::user(format!("zone name {zone:?}: {e}")))?;

    let answer = resolver
        .query((zone_name.clone(), Rtype::Ns))
        .await
        .map_err(|e| Error::transient(format!("looking up nameservers: {e}")))?;
    let mut nameservers = Vec::new();
    let records = answer
        .answer()
        .map_err(|e| Error::Protocol(format!("parsing ns answer: {e}")))?;
    for rr in records.limit_to::<Ns<_>>() {
        let rr =
            rr.map_err(|e| Error::Protocol(format!("parsing ns record: {e}")))?;
        nameservers.push(abs_string(rr.data().nsdname()));
    }
    if nameservers.is_empty() {
        return Err(Error::transient(format!("no nameservers for {zone}")));
    }

    let mut last_err = Error::transient("no usable nameserver address");
    for ns in &nameservers {
        let ns_name = match Dname::<Vec<u8>>::from_str(ns) {
            Ok(n) => n,
            Err(e) => {
                last_err = Error::Protocol(format!("nameserver name {ns:?}: {e}"));
                continue;
            }
        };
        let hosts = match resolver.lookup_host(&ns_name).await {
            Ok(hosts) => hosts,
            Err(e) => {
                debug!(nameserver = %ns, err = %e, "looking up nameserver address");
                last_err =
                    Error::transient(format!("looking up addresses of {ns}: {e}"));
                continue;
            }
        };
        for ip in hosts.iter() {
            match query_soa(&zone_name, SocketAddr::new(ip, 53)).await {
                Ok(soa) => return Ok(soa),
                Err(e) => {
                    debug!(nameserver = %ns, addr = %ip, err = %e,
                        "querying soa from nameserver, trying next");
                    last_err = e;
                }
            }
        }
    }
    Err(last_err)
}

/// One direct SOA query over TCP, recursion-desired cleared.
async fn query_soa(zone: &Dname<Vec<u8>>, addr: SocketAddr) -> Result<FetchedSoa> {
    let mut builder = MessageBuilder::new_stream_vec();
    builder.header_mut().set_id(rand::random());
    builder.header_mut().set_rd(false);
    let mut question = builder.question();
    question
        .push((zone.clone(), Rtype::Soa))
        .map_err(|e| Error::invariant(format!("building soa query: {e}")))?;
    let frame = question.additional().finish();

    let resp =
        client::exchange_tcp(addr, frame.as_stream_slice(), QUERY_TIMEOUT).await?;
    let msg = Message::from_octets(resp)
        .map_err(|e| Error::Protocol(format!("parsing soa response: {e}")))?;
    client::response_error(&msg)?;

    if msg.header_counts().ancount() != 1 {
        return Err(Error::Protocol(format!(
            "got {} answer records, expected 1 soa",
            msg.header_counts().ancount()
        )));
    }
    let answer = msg
        .answer()
        .map_err(|e| Error::Protocol(format!("parsing soa answer: {e}")))?;
    for rr in answer.limit_to::<Soa<_>>() {
        let rr =
            rr.map_err(|e| Error::Protocol(format!("parsing soa record: {e}")))?;
        return Ok(FetchedSoa {
            ttl: rr.ttl().as_secs(),
            serial: u32::from(rr.data().serial()),
            value: soa_value(rr.data()),
        });
    }
    Err(Error::Protocol("response is not a soa record".to_string()))
}
