use crate::error::ParseError;

/// Size of the fixed DNS header that precedes the question section.
pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub question_count: u16,
    pub answer_count: u16,
    pub authority_count: u16,
    pub additional_count: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct DnsFlags {
    pub qr: bool,              // Query/Response (false = query, true = response)
    pub tc: bool,              // Truncation
    pub rcode: u8,             // Response code (0 = no error, 3 = NXDOMAIN, ...)
}

impl DnsFlags {
    pub fn from_u16(flags: u16) -> Self {
        DnsFlags {
            qr: (flags & (1 << 15)) != 0,
            tc: (flags & (1 << 9)) != 0,
            rcode: (flags & 0xF) as u8,
        }
    }
}

impl DnsHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < HEADER_LEN {
            return Err(ParseError::TooShortForHeader(bytes.len()));
        }

        Ok(DnsHeader {
            id: u16::from_be_bytes([bytes[0], bytes[1]]),
            flags: u16::from_be_bytes([bytes[2], bytes[3]]),
            question_count: u16::from_be_bytes([bytes[4], bytes[5]]),
            answer_count: u16::from_be_bytes([bytes[6], bytes[7]]),
            authority_count: u16::from_be_bytes([bytes[8], bytes[9]]),
            additional_count: u16::from_be_bytes([bytes[10], bytes[11]]),
        })
    }

    pub fn flags(&self) -> DnsFlags {
        DnsFlags::from_u16(self.flags)
    }

    pub fn is_response(&self) -> bool {
        self.flags().qr
    }
}

#[cfg(test)]
impl DnsHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.flags.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.question_count.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.answer_count.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.authority_count.to_be_bytes());
        bytes[10..12].copy_from_slice(&self.additional_count.to_be_bytes());
        bytes
    }
}
