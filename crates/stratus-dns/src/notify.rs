//! Outgoing DNS NOTIFY.
//!
//! After a committed zone change the server sends NOTIFY to every
//! registered target, carrying the new SOA in the answer section. One
//! attempt per target; failures are logged by the caller, the next change
//! or refresh tick tries again.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use domain::base::iana::{Opcode, Rtype};
use domain::base::message::Message;
use domain::base::message_builder::MessageBuilder;
use domain::base::name::Dname;

use stratus_common::types::{NotifyProtocol, Record, ZoneNotify};
use stratus_common::{Error, Result};

use crate::client;
use crate::record::stored_to_wire;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends a single NOTIFY for `soa`'s zone to one target and checks the
/// response rcode.
pub async fn send_notify(target: &ZoneNotify, soa: &Record) -> Result<()> {
    let zone = Dname::<Vec<u8>>::from_str(&soa.zone)
        .map_err(|e| Error::invariant(format!("zone name {:?}: {e}", soa.zone)))?;

    let mut builder = MessageBuilder::new_stream_vec();
    builder.header_mut().set_id(rand::random());
    builder.header_mut().set_opcode(Opcode::Notify);
    builder.header_mut().set_aa(true);
    let mut question = builder.question();
    question
        .push((zone, Rtype::Soa))
        .map_err(|e| Error::invariant(format!("building notify: {e}")))?;
    let mut answer = question.answer();
    answer
        .push(stored_to_wire(soa)?)
        .map_err(|e| Error::invariant(format!("building notify: {e}")))?;
    let target_buf = answer.additional().finish();

    let addr: SocketAddr = target
        .address
        .parse()
        .map_err(|e| Error::user(format!("notify address {:?}: {e}", target.address)))?;

    let resp = match target.protocol {
        NotifyProtocol::Tcp => {
            client::exchange_tcp(addr, target_buf.as_stream_slice(), NOTIFY_TIMEOUT)
                .await?
        }
        NotifyProtocol::Udp => {
            client::exchange_udp(addr, target_buf.as_dgram_slice(), NOTIFY_TIMEOUT)
                .await?
        }
    };

    let msg = Message::from_octets(resp)
        .map_err(|e| Error::Protocol(format!("parsing notify response: {e}")))?;
    client::response_error(&msg)
}
