use std::error;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;
use crate::protocol::{
    DOMAINNAME_MAX_LEN, HEADER_MASK_AA, HEADER_MASK_OPCODE, HEADER_MASK_QR, HEADER_MASK_RA,
    HEADER_MASK_RCODE, HEADER_MASK_RD, HEADER_MASK_TC, HEADER_OFFSET_OPCODE, HEADER_OFFSET_RCODE,
    LABEL_MAX_LEN,
};

/// An error occurred while parsing a wire-format message. Every
/// variant carries the byte offset parsing had reached, so it can be
/// logged alongside the raw packet.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    HeaderTooShort(usize),
    QuestionTooShort(usize),
    ResourceRecordTooShort(usize),
    ResourceRecordInvalid(usize),
    DomainTooShort(usize),
    DomainTooLong(usize),
    DomainPointerInvalid(usize),
    DomainLabelInvalid(usize),
    CompletelyBusted(usize),
}

impl Error {
    /// The byte offset at which parsing failed, for logging.
    pub fn id(&self) -> usize {
        match self {
            Error::HeaderTooShort(n)
            | Error::QuestionTooShort(n)
            | Error::ResourceRecordTooShort(n)
            | Error::ResourceRecordInvalid(n)
            | Error::DomainTooShort(n)
            | Error::DomainTooLong(n)
            | Error::DomainPointerInvalid(n)
            | Error::DomainLabelInvalid(n)
            | Error::CompletelyBusted(n) => *n,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::HeaderTooShort(n) => write!(f, "header too short at offset {n}"),
            Error::QuestionTooShort(n) => write!(f, "question too short at offset {n}"),
            Error::ResourceRecordTooShort(n) => {
                write!(f, "resource record too short at offset {n}")
            }
            Error::ResourceRecordInvalid(n) => {
                write!(f, "resource record invalid at offset {n}")
            }
            Error::DomainTooShort(n) => write!(f, "domain name too short at offset {n}"),
            Error::DomainTooLong(n) => write!(f, "domain name too long at offset {n}"),
            Error::DomainPointerInvalid(n) => {
                write!(f, "domain name compression pointer invalid at offset {n}")
            }
            Error::DomainLabelInvalid(n) => write!(f, "domain name label invalid at offset {n}"),
            Error::CompletelyBusted(n) => write!(f, "message unparseable at offset {n}"),
        }
    }
}

impl error::Error for Error {}

/// A cursor over an immutable byte slice, used to parse a wire-format
/// message. Keeps track of the absolute offset so domain name
/// compression pointers can be followed.
#[derive(Debug, Clone, Copy)]
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn peek(&self, n: usize) -> Option<&'a [u8]> {
        self.octets.get(self.position..self.position + n)
    }

    fn take_u8(&mut self) -> Option<u8> {
        let octet = *self.octets.get(self.position)?;
        self.position += 1;
        Some(octet)
    }

    fn take_u16(&mut self) -> Option<u16> {
        let bytes = self.peek(2)?;
        let value = u16::from_be_bytes([bytes[0], bytes[1]]);
        self.position += 2;
        Some(value)
    }

    fn take_u32(&mut self) -> Option<u32> {
        let bytes = self.peek(4)?;
        let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.position += 4;
        Some(value)
    }

    fn take_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.peek(n)?;
        self.position += n;
        Some(bytes)
    }

    /// Jump to an absolute offset, for following compression
    /// pointers. Does not affect the "furthest offset reached" used by
    /// the caller to compute the consumed length of the outer record.
    fn at_offset(&self, offset: usize) -> Self {
        Self {
            octets: self.octets,
            position: offset,
        }
    }
}

impl Message {
    pub fn deserialise(mut buffer: ConsumableBuffer) -> Result<Self, Error> {
        let wire_header = WireHeader::deserialise(&mut buffer)?;

        let mut questions = Vec::with_capacity(wire_header.qdcount.into());
        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(&mut buffer)?);
        }

        let mut answers = Vec::with_capacity(wire_header.ancount.into());
        for _ in 0..wire_header.ancount {
            answers.push(ResourceRecord::deserialise(&mut buffer)?);
        }

        let mut authority = Vec::with_capacity(wire_header.nscount.into());
        for _ in 0..wire_header.nscount {
            authority.push(ResourceRecord::deserialise(&mut buffer)?);
        }

        let mut additional = Vec::with_capacity(wire_header.arcount.into());
        for _ in 0..wire_header.arcount {
            additional.push(ResourceRecord::deserialise(&mut buffer)?);
        }

        Ok(Message {
            header: wire_header.header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl WireHeader {
    fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let start = buffer.position();

        let id = buffer
            .take_u16()
            .ok_or(Error::HeaderTooShort(start))?;
        let flags1 = buffer
            .take_u8()
            .ok_or(Error::HeaderTooShort(start))?;
        let flags2 = buffer
            .take_u8()
            .ok_or(Error::HeaderTooShort(start))?;
        let qdcount = buffer
            .take_u16()
            .ok_or(Error::HeaderTooShort(start))?;
        let ancount = buffer
            .take_u16()
            .ok_or(Error::HeaderTooShort(start))?;
        let nscount = buffer
            .take_u16()
            .ok_or(Error::HeaderTooShort(start))?;
        let arcount = buffer
            .take_u16()
            .ok_or(Error::HeaderTooShort(start))?;

        let header = Header {
            id,
            is_response: flags1 & HEADER_MASK_QR != 0,
            opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
            is_authoritative: flags1 & HEADER_MASK_AA != 0,
            is_truncated: flags1 & HEADER_MASK_TC != 0,
            recursion_desired: flags1 & HEADER_MASK_RD != 0,
            recursion_available: flags2 & HEADER_MASK_RA != 0,
            rcode: Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE),
        };

        Ok(WireHeader {
            header,
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(buffer)?;
        let start = buffer.position();
        let qtype = buffer
            .take_u16()
            .ok_or(Error::QuestionTooShort(start))?;
        let qclass = buffer
            .take_u16()
            .ok_or(Error::QuestionTooShort(start))?;

        Ok(Question {
            name,
            qtype: QueryType::from(qtype),
            qclass: QueryClass::from(qclass),
        })
    }
}

impl ResourceRecord {
    fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(buffer)?;
        let start = buffer.position();

        let rtype = buffer
            .take_u16()
            .ok_or(Error::ResourceRecordTooShort(start))?;
        let rclass = buffer
            .take_u16()
            .ok_or(Error::ResourceRecordTooShort(start))?;
        let ttl = buffer
            .take_u32()
            .ok_or(Error::ResourceRecordTooShort(start))?;
        let rdlength = buffer
            .take_u16()
            .ok_or(Error::ResourceRecordTooShort(start))?;

        let rdata_start = buffer.position();
        let rdata = buffer
            .take_bytes(rdlength.into())
            .ok_or(Error::ResourceRecordTooShort(start))?;

        let rtype_with_data = RecordTypeWithData::deserialise(
            RecordType::from(rtype),
            rdata,
            *buffer,
            rdata_start,
        )?;

        Ok(ResourceRecord {
            name,
            rtype_with_data,
            rclass: RecordClass::from(rclass),
            ttl,
        })
    }
}

impl RecordTypeWithData {
    fn deserialise(
        rtype: RecordType,
        rdata: &[u8],
        message_buffer: ConsumableBuffer,
        rdata_start: usize,
    ) -> Result<Self, Error> {
        // Domain names embedded in RDATA may use compression pointers
        // that refer to offsets elsewhere in the whole message, so
        // they are parsed against a cursor over the full message,
        // seeked to the start of this record's RDATA, rather than
        // against `rdata` alone.
        let mut cursor = message_buffer.at_offset(rdata_start);

        let value = match rtype {
            RecordType::A => {
                if rdata.len() != 4 {
                    return Err(Error::ResourceRecordInvalid(rdata_start));
                }
                RecordTypeWithData::A {
                    address: Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]),
                }
            }
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: DomainName::deserialise(&mut cursor)?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: DomainName::deserialise(&mut cursor)?,
            },
            RecordType::SOA => {
                let mname = DomainName::deserialise(&mut cursor)?;
                let rname = DomainName::deserialise(&mut cursor)?;
                let serial = cursor
                    .take_u32()
                    .ok_or(Error::ResourceRecordTooShort(rdata_start))?;
                let refresh = cursor
                    .take_u32()
                    .ok_or(Error::ResourceRecordTooShort(rdata_start))?;
                let retry = cursor
                    .take_u32()
                    .ok_or(Error::ResourceRecordTooShort(rdata_start))?;
                let expire = cursor
                    .take_u32()
                    .ok_or(Error::ResourceRecordTooShort(rdata_start))?;
                let minimum = cursor
                    .take_u32()
                    .ok_or(Error::ResourceRecordTooShort(rdata_start))?;
                RecordTypeWithData::SOA {
                    mname,
                    rname,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                }
            }
            RecordType::MX => {
                let preference = cursor
                    .take_u16()
                    .ok_or(Error::ResourceRecordTooShort(rdata_start))?;
                let exchange = DomainName::deserialise(&mut cursor)?;
                RecordTypeWithData::MX {
                    preference,
                    exchange,
                }
            }
            RecordType::TXT => RecordTypeWithData::TXT {
                octets: rdata.to_vec(),
            },
            RecordType::AAAA => {
                if rdata.len() != 16 {
                    return Err(Error::ResourceRecordInvalid(rdata_start));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                RecordTypeWithData::AAAA {
                    address: Ipv6Addr::from(octets),
                }
            }
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
                tag,
                octets: rdata.to_vec(),
            },
        };

        Ok(value)
    }
}

impl DomainName {
    /// Parses a domain name, following RFC 1035 section 4.1.4
    /// compression pointers. Pointers may only point backwards, which
    /// this relies on to bound the number of hops taken.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut labels = Vec::new();
        let mut octets = Vec::new();
        let mut jumped = false;
        // After following a pointer, the caller's buffer position must
        // only advance past the pointer itself, not through the
        // pointed-to data. `resume_at` records where to leave it.
        let mut resume_at = None;
        let mut hops = 0;

        loop {
            hops += 1;
            if hops > DOMAINNAME_MAX_LEN {
                return Err(Error::DomainPointerInvalid(buffer.position()));
            }

            let start = buffer.position();
            let len = buffer.take_u8().ok_or(Error::DomainTooShort(start))?;

            if len == 0 {
                octets.push(0);
                labels.push(Vec::new());
                break;
            } else if len & 0b1100_0000 == 0b1100_0000 {
                let lo = buffer.take_u8().ok_or(Error::DomainPointerInvalid(start))?;
                let pointer = (((len & 0b0011_1111) as usize) << 8) | lo as usize;
                if pointer >= start {
                    return Err(Error::DomainPointerInvalid(start));
                }
                if resume_at.is_none() {
                    resume_at = Some(buffer.position());
                }
                *buffer = buffer.at_offset(pointer);
                jumped = true;
                continue;
            } else if len & 0b1100_0000 != 0 {
                return Err(Error::DomainLabelInvalid(start));
            } else if len as usize > LABEL_MAX_LEN {
                return Err(Error::DomainLabelInvalid(start));
            }

            let label = buffer
                .take_bytes(len.into())
                .ok_or(Error::DomainTooShort(start))?;

            octets.push(len);
            octets.extend_from_slice(label);
            labels.push(label.to_ascii_lowercase());

            if octets.len() > DOMAINNAME_MAX_LEN {
                return Err(Error::DomainTooLong(start));
            }
        }

        if let Some(resume_at) = resume_at {
            buffer.position = resume_at;
        }
        let _ = jumped;

        if octets.len() > DOMAINNAME_MAX_LEN {
            return Err(Error::DomainTooLong(buffer.position()));
        }

        Ok(DomainName { octets, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::serialise::WritableBuffer;
    use crate::protocol::types::test_util::domain;

    #[test]
    fn domain_name_roundtrip_no_compression() {
        let name = domain("www.example.com.");
        let mut buffer = WritableBuffer::new();
        buffer.append_domain_name(&name);
        let octets = buffer.into_octets();

        let mut cursor = ConsumableBuffer::new(&octets);
        let parsed = DomainName::deserialise(&mut cursor).unwrap();
        assert_eq!(name, parsed);
        assert_eq!(octets.len(), cursor.position());
    }

    #[test]
    fn domain_name_follows_compression_pointer() {
        let mut octets = Vec::new();
        // "example.com." at offset 0
        let base = domain("example.com.");
        octets.extend_from_slice(&base.octets);
        // "www" + pointer back to offset 0
        octets.push(3);
        octets.extend_from_slice(b"www");
        let pointer_offset = base.octets.len() as u16;
        octets.extend_from_slice(&(0b1100_0000_0000_0000u16 | pointer_offset).to_be_bytes());

        let mut cursor = ConsumableBuffer::new(&octets);
        // skip past "example.com." to parse the compressed name
        cursor.position = base.octets.len();
        let parsed = DomainName::deserialise(&mut cursor).unwrap();
        assert_eq!(domain("www.example.com."), parsed);
    }

    #[test]
    fn domain_name_rejects_forward_pointer() {
        let octets = vec![0b1100_0000, 0x05];
        let mut cursor = ConsumableBuffer::new(&octets);
        assert!(DomainName::deserialise(&mut cursor).is_err());
    }

    #[test]
    fn header_too_short_is_reported() {
        let octets = [0u8; 4];
        let err = Message::deserialise(ConsumableBuffer::new(&octets)).unwrap_err();
        assert_eq!(err, Error::HeaderTooShort(0));
    }
}
