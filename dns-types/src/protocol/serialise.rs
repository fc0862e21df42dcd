use std::error;
use std::fmt;

use crate::protocol::types::*;
use crate::protocol::{
    HEADER_MASK_AA, HEADER_MASK_OPCODE, HEADER_MASK_QR, HEADER_MASK_RA, HEADER_MASK_RCODE,
    HEADER_MASK_RD, HEADER_MASK_TC, HEADER_OFFSET_OPCODE, HEADER_OFFSET_RCODE,
};

/// An error occurred while serialising a value to the wire.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// A section held more entries than can be represented by the
    /// 16-bit counter fields in the header.
    CounterTooLarge { counter: &'static str, value: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::CounterTooLarge { counter, value } => {
                write!(f, "{counter} count {value} does not fit in 16 bits")
            }
        }
    }
}

impl error::Error for Error {}

fn usize_to_u16(counter: &'static str, value: usize) -> Result<u16, Error> {
    value
        .try_into()
        .map_err(|_| Error::CounterTooLarge { counter, value })
}

/// An expanding buffer of octets, used to build up a wire-format
/// message incrementally.
#[derive(Debug, Clone, Default)]
pub struct WritableBuffer {
    octets: Vec<u8>,
}

impl WritableBuffer {
    pub fn new() -> Self {
        Self { octets: Vec::new() }
    }

    pub fn into_octets(self) -> Vec<u8> {
        self.octets
    }

    pub fn len(&self) -> usize {
        self.octets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.octets.is_empty()
    }

    pub fn append_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn append_u16(&mut self, value: u16) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn append_u32(&mut self, value: u32) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.octets.extend_from_slice(bytes);
    }

    pub fn append_domain_name(&mut self, name: &DomainName) {
        self.append_bytes(&name.octets);
    }

    /// Writes a length-prefixed blob where the length is a single
    /// octet, as used for TXT record character-strings.
    pub fn append_character_string(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let len = usize_to_u16("character-string", bytes.len())?;
        self.append_u8(len as u8);
        self.append_bytes(bytes);
        Ok(())
    }
}

impl Message {
    /// Serialises this message to wire format.
    pub fn serialise(&self) -> Result<Vec<u8>, Error> {
        let mut buffer = WritableBuffer::new();

        let wire_header = WireHeader {
            header: self.header,
            qdcount: usize_to_u16("question", self.questions.len())?,
            ancount: usize_to_u16("answer", self.answers.len())?,
            nscount: usize_to_u16("authority", self.authority.len())?,
            arcount: usize_to_u16("additional", self.additional.len())?,
        };
        wire_header.serialise(&mut buffer);

        for question in &self.questions {
            question.serialise(&mut buffer);
        }
        for rr in &self.answers {
            rr.serialise(&mut buffer)?;
        }
        for rr in &self.authority {
            rr.serialise(&mut buffer)?;
        }
        for rr in &self.additional {
            rr.serialise(&mut buffer)?;
        }

        Ok(buffer.into_octets())
    }
}

impl WireHeader {
    fn serialise(&self, buffer: &mut WritableBuffer) {
        let header = &self.header;

        buffer.append_u16(header.id);

        let mut flags1 = 0u8;
        if header.is_response {
            flags1 |= HEADER_MASK_QR;
        }
        flags1 |= (u8::from(header.opcode) << HEADER_OFFSET_OPCODE) & HEADER_MASK_OPCODE;
        if header.is_authoritative {
            flags1 |= HEADER_MASK_AA;
        }
        if header.is_truncated {
            flags1 |= HEADER_MASK_TC;
        }
        if header.recursion_desired {
            flags1 |= HEADER_MASK_RD;
        }
        buffer.append_u8(flags1);

        let mut flags2 = 0u8;
        if header.recursion_available {
            flags2 |= HEADER_MASK_RA;
        }
        flags2 |= (u8::from(header.rcode) << HEADER_OFFSET_RCODE) & HEADER_MASK_RCODE;
        buffer.append_u8(flags2);

        buffer.append_u16(self.qdcount);
        buffer.append_u16(self.ancount);
        buffer.append_u16(self.nscount);
        buffer.append_u16(self.arcount);
    }
}

impl Question {
    fn serialise(&self, buffer: &mut WritableBuffer) {
        buffer.append_domain_name(&self.name);
        buffer.append_u16(self.qtype.into());
        buffer.append_u16(self.qclass.into());
    }
}

impl ResourceRecord {
    fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        buffer.append_domain_name(&self.name);
        buffer.append_u16(self.rtype_with_data.rtype().into());
        buffer.append_u16(self.rclass.into());
        buffer.append_u32(self.ttl);

        // RDATA is length-prefixed, but the length is only known once
        // the data itself has been serialised, so it is built into a
        // scratch buffer first.
        let mut rdata = WritableBuffer::new();
        self.rtype_with_data.serialise(&mut rdata)?;
        let rdata = rdata.into_octets();

        buffer.append_u16(usize_to_u16("RDLENGTH", rdata.len())?);
        buffer.append_bytes(&rdata);

        Ok(())
    }
}

impl RecordTypeWithData {
    fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        match self {
            RecordTypeWithData::A { address } => {
                buffer.append_bytes(&address.octets());
            }
            RecordTypeWithData::NS { nsdname } => {
                buffer.append_domain_name(nsdname);
            }
            RecordTypeWithData::CNAME { cname } => {
                buffer.append_domain_name(cname);
            }
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                buffer.append_domain_name(mname);
                buffer.append_domain_name(rname);
                buffer.append_u32(*serial);
                buffer.append_u32(*refresh);
                buffer.append_u32(*retry);
                buffer.append_u32(*expire);
                buffer.append_u32(*minimum);
            }
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.append_u16(*preference);
                buffer.append_domain_name(exchange);
            }
            RecordTypeWithData::TXT { octets } => {
                buffer.append_character_string(octets)?;
            }
            RecordTypeWithData::AAAA { address } => {
                buffer.append_bytes(&address.octets());
            }
            RecordTypeWithData::Unknown { octets, .. } => {
                buffer.append_bytes(octets);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::deserialise::ConsumableBuffer;
    use crate::protocol::types::test_util::*;
    use std::net::Ipv4Addr;

    #[test]
    fn serialise_simple_query() {
        let message = Message {
            header: Header {
                id: 1234,
                is_response: false,
                opcode: Opcode::Standard,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: true,
                recursion_available: false,
                rcode: Rcode::NoError,
            },
            questions: vec![Question {
                name: domain("example.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };

        let octets = message.serialise().unwrap();
        let roundtripped = Message::deserialise(ConsumableBuffer::new(&octets)).unwrap();
        assert_eq!(message, roundtripped);
    }

    #[test]
    fn serialise_a_response() {
        let mut message = Message {
            header: Header {
                id: 4321,
                is_response: true,
                opcode: Opcode::Standard,
                is_authoritative: true,
                is_truncated: false,
                recursion_desired: false,
                recursion_available: true,
                rcode: Rcode::NoError,
            },
            questions: vec![Question {
                name: domain("10-0-0-5.example.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            answers: vec![a_record(
                "10-0-0-5.example.com.",
                Ipv4Addr::new(10, 0, 0, 5),
                300,
            )],
            authority: Vec::new(),
            additional: Vec::new(),
        };
        message.answers.push(txt_record("example.com.", "hello", 60));

        let octets = message.serialise().unwrap();
        let roundtripped = Message::deserialise(ConsumableBuffer::new(&octets)).unwrap();
        assert_eq!(message, roundtripped);
    }
}
