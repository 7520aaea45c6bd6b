//! Conversion between stored records and their wire and text forms.
//!
//! The store keeps RDATA in canonical uncompressed form (hex) plus the
//! zone-file text value. Records arriving from the wire are parsed into
//! typed record data first so compressed names are expanded; records
//! arriving from providers come as zone-file text and are scanned through
//! the zone-file parser.

use std::convert::Infallible;
use std::str::FromStr;

use bytes::Bytes;
use domain::base::iana::{Class, Rtype};
use domain::base::message::RecordSection;
use domain::base::name::{Dname, FlattenInto, ParsedDname, ToDname};
use domain::base::rdata::{ComposeRecordData, UnknownRecordData};
use domain::base::record::Record as DnsRecord;
use domain::base::record::Ttl;
use domain::dep::octseq::parse::Parser;
use domain::rdata::rfc1035::Soa;
use domain::rdata::ZoneRecordData;
use domain::dep::octseq::Octets;
use domain::zonefile::inplace::{Entry, Zonefile};

use stratus_common::name::clean_abs_name;
use stratus_common::types::{ProviderRecord, Record};
use stratus_common::{Error, Result};

/// Unwraps results whose error is uninhabited.
fn infallible<T>(res: std::result::Result<T, Infallible>) -> T {
    match res {
        Ok(v) => v,
        Err(e) => match e {},
    }
}

/// Renders a wire name as an absolute string with trailing dot.
///
/// The name types print without the trailing dot (and the root as the empty
/// string), so this is the inverse of what the store expects.
pub fn abs_string(name: &impl std::fmt::Display) -> String {
    let s = name.to_string();
    if s.is_empty() || s == "." {
        ".".to_string()
    } else {
        format!("{s}.")
    }
}

/// A record lifted off the wire or out of a provider listing, with its
/// RDATA in canonical form. Owner names are cleaned (absolute, lower-case).
#[derive(Debug, Clone)]
pub struct WireRecord {
    pub abs_name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data_hex: String,
    pub value: String,
    /// Provider-assigned id, when the record came from a provider.
    pub provider_id: String,
}

impl WireRecord {
    pub fn rrset_key(&self) -> stratus_common::RrsetKey {
        stratus_common::RrsetKey {
            abs_name: self.abs_name.clone(),
            rtype: self.rtype,
            class: self.class,
        }
    }

    pub fn record_key(&self) -> stratus_common::RecordKey {
        stratus_common::RecordKey {
            abs_name: self.abs_name.clone(),
            rtype: self.rtype,
            class: self.class,
            ttl: self.ttl,
            data_hex: self.data_hex.clone(),
        }
    }
}

/// Parses every record of a message section into [`WireRecord`]s.
///
/// Record data is re-composed after parsing, which expands any name
/// compression; the hex form is therefore canonical and comparable.
pub fn section_records<'a, Octs>(
    section: RecordSection<'a, Octs>,
) -> Result<Vec<WireRecord>>
where
    Octs: Octets + ?Sized,
{
    let mut out = Vec::new();
    for item in section {
        let parsed = item
            .map_err(|e| Error::user(format!("parsing record: {e}")))?;
        let rec = parsed
            .to_record::<ZoneRecordData<_, _>>()
            .map_err(|e| Error::user(format!("parsing record data: {e}")))?
            .ok_or_else(|| Error::user("unparseable record data"))?;

        let abs_name = clean_abs_name(&abs_string(rec.owner()))?;
        let mut buf = Vec::new();
        infallible(rec.data().compose_rdata(&mut buf));

        out.push(WireRecord {
            abs_name,
            rtype: rec.rtype().to_int(),
            class: rec.class().to_int(),
            ttl: rec.ttl().as_secs(),
            value: rec.data().to_string(),
            data_hex: hex::encode(&buf),
            provider_id: String::new(),
        });
    }
    Ok(out)
}

/// Parses one provider record (zone-file text value) into a [`WireRecord`].
///
/// `abs_name` must already be absolute; the caller is responsible for
/// absolutizing relative provider names within the zone first.
pub fn parse_provider_record(
    abs_name: &str,
    ttl: u32,
    rtype: &str,
    value: &str,
    provider_id: &str,
) -> Result<WireRecord> {
    let line = format!("{abs_name} {ttl} IN {rtype} {value}\n");
    let mut zonefile = Zonefile::from(line.as_str());
    let entry = zonefile
        .next_entry()
        .map_err(|e| Error::user(format!("parsing record {line:?}: {e}")))?
        .ok_or_else(|| Error::user(format!("no record in {line:?}")))?;
    let rec = match entry {
        Entry::Record(rec) => rec,
        _ => return Err(Error::user(format!("unexpected entry in {line:?}"))),
    };

    let owner = rec
        .owner()
        .to_dname::<Vec<u8>>()
        .map_err(|e| Error::user(format!("owner of {line:?}: {e}")))?;
    let abs_name = clean_abs_name(&abs_string(&owner))?;
    let mut buf = Vec::new();
    infallible(rec.data().compose_rdata(&mut buf));

    Ok(WireRecord {
        abs_name,
        rtype: rec.rtype().to_int(),
        class: rec.class().to_int(),
        ttl: rec.ttl().as_secs(),
        value: rec.data().to_string(),
        data_hex: hex::encode(&buf),
        provider_id: provider_id.to_string(),
    })
}

/// Builds the wire form of a stored record, with generic record data.
pub fn stored_to_wire(
    r: &Record,
) -> Result<DnsRecord<Dname<Vec<u8>>, UnknownRecordData<Vec<u8>>>> {
    let name = Dname::<Vec<u8>>::from_str(&r.abs_name)
        .map_err(|e| Error::invariant(format!("stored name {:?}: {e}", r.abs_name)))?;
    let data = hex::decode(&r.data_hex)
        .map_err(|e| Error::invariant(format!("stored rdata: {e}")))?;
    Ok(DnsRecord::new(
        name,
        Class::from_int(r.class),
        Ttl::from_secs(r.ttl),
        UnknownRecordData::from_octets(Rtype::from_int(r.rtype), data)
            .map_err(|e| Error::invariant(format!("stored rdata too long: {e}")))?,
    ))
}

/// Parses stored SOA RDATA (canonical hex) back into typed SOA fields.
pub fn soa_from_hex(data_hex: &str) -> Result<Soa<Dname<Bytes>>> {
    let buf = hex::decode(data_hex)
        .map_err(|e| Error::invariant(format!("stored soa rdata: {e}")))?;
    let mut parser = Parser::from_ref(buf.as_slice());
    let soa = Soa::<ParsedDname<_>>::parse(&mut parser)
        .map_err(|e| Error::invariant(format!("parsing stored soa: {e}")))?;
    Ok(soa.flatten_into())
}

/// The zone-file text of an SOA, with absolute names, suitable for
/// round-tripping through [`parse_provider_record`].
pub fn soa_value<N: ToDname + std::fmt::Display>(soa: &Soa<N>) -> String {
    format!(
        "{} {} {} {} {} {} {}",
        abs_string(soa.mname()),
        abs_string(soa.rname()),
        u32::from(soa.serial()),
        soa.refresh().as_secs(),
        soa.retry().as_secs(),
        soa.expire().as_secs(),
        soa.minimum().as_secs(),
    )
}

/// The stored record converted into a provider record (relative name,
/// zone-file value).
pub fn to_provider_record(r: &Record) -> ProviderRecord {
    ProviderRecord {
        id: r.provider_id.clone(),
        rtype: Rtype::from_int(r.rtype).to_string(),
        name: stratus_common::name::relative_name(&r.abs_name, &r.zone),
        value: r.value.clone(),
        ttl: r.ttl,
    }
}
