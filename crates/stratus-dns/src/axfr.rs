//! AXFR response chunking.
//!
//! A zone transfer answers with `[SOA, ...records..., SOA]`, split over as
//! many messages as needed. Each message is kept under 64 KiB minus slack
//! for the TSIG record the signer appends afterwards. The fill strategy
//! shrinks the record count proportionally to the overshoot, always by at
//! least one record per round.

use domain::base::message::Message;
use domain::base::message_builder::{
    AdditionalBuilder, MessageBuilder, StreamTarget,
};
use domain::base::name::Dname;
use domain::base::rdata::UnknownRecordData;
use domain::base::record::Record as DnsRecord;
use domain::dep::octseq::Octets;

use stratus_common::{Error, Result};

/// Room for one TSIG record below the 64 KiB message ceiling.
pub const MAX_MESSAGE: usize = 64 * 1024 - 512;

pub type AxfrAnswer = DnsRecord<Dname<Vec<u8>>, UnknownRecordData<Vec<u8>>>;

/// Splits `answers` over response messages for `req`, each within
/// [`MAX_MESSAGE`]. The returned builders are positioned at the additional
/// section, ready for OPT and TSIG records.
pub fn chunk_answers<Octs>(
    req: &Message<Octs>,
    answers: &[AxfrAnswer],
) -> Result<Vec<AdditionalBuilder<StreamTarget<Vec<u8>>>>>
where
    Octs: Octets + ?Sized,
{
    let mut out = Vec::new();
    let mut rest = answers;
    while !rest.is_empty() {
        let take = fit_answers(req, rest)?;
        let mut builder = MessageBuilder::new_stream_vec()
            .start_answer(req, domain::base::iana::Rcode::NoError)
            .map_err(|e| Error::invariant(format!("building axfr answer: {e}")))?;
        builder.header_mut().set_aa(true);
        for rr in &rest[..take] {
            builder
                .push(rr)
                .map_err(|e| Error::invariant(format!("axfr answer record: {e}")))?;
        }
        out.push(builder.additional());
        rest = &rest[take..];
    }
    Ok(out)
}

/// How many of `answers` fit into one message.
///
/// Measures against an unbounded byte builder so oversized trial fills
/// never error, then shrinks proportionally (`cap * use / size`) with a
/// minimum step of one.
fn fit_answers<Octs>(req: &Message<Octs>, answers: &[AxfrAnswer]) -> Result<usize>
where
    Octs: Octets + ?Sized,
{
    let mut take = answers.len();
    loop {
        let mut builder = MessageBuilder::new_vec()
            .start_answer(req, domain::base::iana::Rcode::NoError)
            .map_err(|e| Error::invariant(format!("measuring axfr answer: {e}")))?;
        for rr in &answers[..take] {
            builder
                .push(rr)
                .map_err(|e| Error::invariant(format!("measuring axfr answer: {e}")))?;
        }
        let size = builder.as_slice().len();
        if size <= MAX_MESSAGE {
            return Ok(take);
        }
        let next = MAX_MESSAGE * take / size;
        take = if next >= take { take - 1 } else { next };
        if take == 0 {
            return Err(Error::invariant(
                "single record does not fit in an axfr response".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::iana::{Class, Opcode, Rtype};
    use std::str::FromStr;

    fn axfr_request(zone: &str) -> Message<Vec<u8>> {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_id(17);
        builder.header_mut().set_opcode(Opcode::Query);
        let mut question = builder.question();
        question
            .push((Dname::<Vec<u8>>::from_str(zone).unwrap(), Rtype::Axfr))
            .unwrap();
        Message::from_octets(question.additional().finish()).unwrap()
    }

    fn txt_answer(i: usize, payload: usize) -> AxfrAnswer {
        // One TXT record with a payload of `payload` octets, split into
        // character strings of at most 255.
        let mut rdata = Vec::new();
        let mut left = payload;
        while left > 0 {
            let n = left.min(255);
            rdata.push(n as u8);
            rdata.extend(std::iter::repeat(b'x').take(n));
            left -= n;
        }
        DnsRecord::new(
            Dname::<Vec<u8>>::from_str(&format!("t{i}.z0.example.")).unwrap(),
            Class::In,
            300,
            UnknownRecordData::from_octets(Rtype::Txt, rdata),
        )
    }

    #[test]
    fn small_zone_fits_one_message() {
        let req = axfr_request("z0.example.");
        let answers: Vec<_> = (0..10).map(|i| txt_answer(i, 16)).collect();
        let msgs = chunk_answers(&req, &answers).unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn large_zone_spans_messages_in_order() {
        let req = axfr_request("z0.example.");
        // 256 records of about 1 KiB exceeds one 64 KiB message.
        let answers: Vec<_> = (0..256).map(|i| txt_answer(i, 1024)).collect();
        let msgs = chunk_answers(&req, &answers).unwrap();
        assert!(msgs.len() > 1, "expected multiple messages");
        for m in &msgs {
            assert!(m.as_slice().len() <= MAX_MESSAGE);
        }
        // Every record is present exactly once, in order.
        let mut seen = 0usize;
        for m in msgs {
            let msg =
                Message::from_octets(m.finish().as_dgram_slice().to_vec()).unwrap();
            for rr in msg.answer().unwrap() {
                let rr = rr.unwrap();
                assert_eq!(
                    rr.owner().to_string(),
                    format!("t{seen}.z0.example")
                );
                seen += 1;
            }
        }
        assert_eq!(seen, 256);
    }
}
