use bytes::{Bytes, BytesMut};

use crate::dns_header::{DnsHeader, HEADER_LEN};
use crate::dns_question_and_answer::{DnsQuestion, RecordSummary, RECORD_TYPE_OPT};
use crate::error::ParseError;

/// Parse the header and first question of a DNS message.
/// Only the first question is read; further questions are relayed untouched.
pub fn parse_request(buf: &[u8]) -> Result<(DnsHeader, DnsQuestion), ParseError> {
    let header = DnsHeader::from_bytes(buf)?;

    if header.question_count == 0 {
        return Err(ParseError::NoQuestion);
    }

    let (question, _) = DnsQuestion::from_bytes(buf, HEADER_LEN)?;
    Ok((header, question))
}

/// Smallest TTL across the answer records of a response, ignoring OPT records.
/// `None` when the response has no answers or its records cannot be walked.
pub fn min_answer_ttl(buf: &[u8]) -> Option<u32> {
    let header = DnsHeader::from_bytes(buf).ok()?;

    let mut offset = HEADER_LEN;
    for _ in 0..header.question_count {
        offset = DnsQuestion::skip(buf, offset).ok()?;
    }

    let mut min_ttl: Option<u32> = None;
    for _ in 0..header.answer_count {
        let (record, next) = RecordSummary::from_bytes(buf, offset).ok()?;
        if record.rtype != RECORD_TYPE_OPT {
            min_ttl = Some(min_ttl.map_or(record.ttl, |ttl| ttl.min(record.ttl)));
        }
        offset = next;
    }

    min_ttl
}

/// Transaction ID of a raw message, if it is long enough to carry one.
pub fn transaction_id(buf: &[u8]) -> Option<u16> {
    match buf {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Return `payload` carrying transaction ID `id`.
/// The payload is shared as-is when it already carries that ID.
pub fn with_transaction_id(payload: &Bytes, id: u16) -> Bytes {
    if payload.len() < 2 || transaction_id(payload) == Some(id) {
        return payload.clone();
    }

    let mut rewritten = BytesMut::from(&payload[..]);
    rewritten[0..2].copy_from_slice(&id.to_be_bytes());
    rewritten.freeze()
}
