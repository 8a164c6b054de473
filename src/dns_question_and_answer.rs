use std::fmt::Write;

use crate::error::ParseError;

/// Maximum label length allowed by RFC 1035; the two top bits of a length byte
/// select the label type instead.
const MAX_LABEL_LEN: u8 = 63;
const POINTER_MASK: u8 = 0xC0;

/// DNS Question Section
/// Format: QNAME + QTYPE (2 bytes) + QCLASS (2 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String, // Domain name (e.g., "example.com"), case preserved
    pub qtype: u16,   // Query type (A, AAAA, CNAME, etc.)
    pub qclass: u16,  // Query class (usually IN for Internet)
}

/// Fixed part of a resource record, read without decoding the owner name or RDATA.
/// Format: NAME + TYPE (2 bytes) + CLASS (2 bytes) + TTL (4 bytes) + RDLENGTH (2 bytes) + RDATA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSummary {
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdlength: u16,
}

/// OPT pseudo-records carry EDNS data in their TTL field, not a lifetime.
pub const RECORD_TYPE_OPT: u16 = 41;

impl DnsQuestion {
    /// Parse a DNS question from bytes starting at the given offset
    /// Returns the question and the new offset after parsing
    pub fn from_bytes(bytes: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let (name, new_offset) = parse_question_name(bytes, offset)?;

        if new_offset + 4 > bytes.len() {
            return Err(ParseError::TruncatedRecord(new_offset));
        }

        let qtype = u16::from_be_bytes([bytes[new_offset], bytes[new_offset + 1]]);
        let qclass = u16::from_be_bytes([bytes[new_offset + 2], bytes[new_offset + 3]]);

        Ok((
            DnsQuestion {
                name,
                qtype,
                qclass,
            },
            new_offset + 4,
        ))
    }

    /// Advance past a question without building its name.
    pub fn skip(bytes: &[u8], offset: usize) -> Result<usize, ParseError> {
        let offset = skip_name(bytes, offset)?;
        if offset + 4 > bytes.len() {
            return Err(ParseError::TruncatedRecord(offset));
        }
        Ok(offset + 4)
    }
}

impl RecordSummary {
    /// Read the fixed fields of the resource record at `offset`.
    /// Returns the summary and the offset of the next record.
    pub fn from_bytes(bytes: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let fields = skip_name(bytes, offset)?;

        if fields + 10 > bytes.len() {
            return Err(ParseError::TruncatedRecord(offset));
        }

        let rtype = u16::from_be_bytes([bytes[fields], bytes[fields + 1]]);
        let rclass = u16::from_be_bytes([bytes[fields + 2], bytes[fields + 3]]);
        let ttl = u32::from_be_bytes([
            bytes[fields + 4],
            bytes[fields + 5],
            bytes[fields + 6],
            bytes[fields + 7],
        ]);
        let rdlength = u16::from_be_bytes([bytes[fields + 8], bytes[fields + 9]]);

        let next = fields + 10 + rdlength as usize;
        if next > bytes.len() {
            return Err(ParseError::TruncatedRecord(offset));
        }

        Ok((
            RecordSummary {
                rtype,
                rclass,
                ttl,
                rdlength,
            },
            next,
        ))
    }
}

/// Parse an uncompressed domain name from the question section.
/// Labels are joined with '.' as they appear on the wire, case preserved; the
/// root name is returned as ".". Label bytes outside printable ASCII are written
/// as `\DDD` and a literal `.` or `\` inside a label is backslash-escaped, so
/// distinct wire names always give distinct strings.
/// Returns the parsed domain name and the offset just past its terminator.
pub fn parse_question_name(bytes: &[u8], mut offset: usize) -> Result<(String, usize), ParseError> {
    let mut name = String::new();

    loop {
        let Some(&length) = bytes.get(offset) else {
            return Err(ParseError::UnterminatedName(offset));
        };

        if length > MAX_LABEL_LEN {
            return Err(ParseError::UnsupportedLabel(length & POINTER_MASK));
        }

        // Move past the length byte
        offset += 1;

        if length == 0 {
            break;
        }

        let remaining = bytes.len() - offset;
        if length as usize > remaining {
            return Err(ParseError::LabelOverrun {
                offset: offset - 1,
                length: length as usize,
                remaining,
            });
        }

        if !name.is_empty() {
            name.push('.');
        }
        push_escaped_label(&mut name, &bytes[offset..offset + length as usize]);
        offset += length as usize;
    }

    if name.is_empty() {
        name.push('.');
    }

    Ok((name, offset))
}

fn push_escaped_label(name: &mut String, label: &[u8]) {
    for &byte in label {
        match byte {
            b'.' | b'\\' => {
                name.push('\\');
                name.push(byte as char);
            }
            0x21..=0x7E => name.push(byte as char),
            _ => {
                let _ = write!(name, "\\{:03}", byte);
            }
        }
    }
}

/// Step over a possibly compressed name without following pointers.
/// A compression pointer always ends the name, so only its two bytes are consumed.
pub fn skip_name(bytes: &[u8], mut offset: usize) -> Result<usize, ParseError> {
    loop {
        let Some(&length) = bytes.get(offset) else {
            return Err(ParseError::UnterminatedName(offset));
        };

        match length & POINTER_MASK {
            POINTER_MASK => {
                if offset + 2 > bytes.len() {
                    return Err(ParseError::UnterminatedName(offset));
                }
                return Ok(offset + 2);
            }
            0 => {}
            other => return Err(ParseError::UnsupportedLabel(other)),
        }

        offset += 1;
        if length == 0 {
            return Ok(offset);
        }

        let remaining = bytes.len() - offset;
        if length as usize > remaining {
            return Err(ParseError::LabelOverrun {
                offset: offset - 1,
                length: length as usize,
                remaining,
            });
        }
        offset += length as usize;
    }
}

/// Encode a domain name to DNS message format
/// Example: "example.com" -> [7]example[3]com[0]
#[cfg(test)]
pub fn encode_domain_name(name: &str) -> Vec<u8> {
    let mut encoded = Vec::new();

    for label in name.split('.').filter(|l| !l.is_empty()) {
        encoded.push(label.len() as u8);
        encoded.extend_from_slice(label.as_bytes());
    }

    encoded.push(0);
    encoded
}
