//! The DNS wire message format (RFC 1035 section 4), restricted to the
//! record types this service ever synthesises or parses: A, NS, SOA,
//! CNAME and TXT. Other record types are retained as `Unknown` so that
//! zone files containing them still round-trip through the responder.

pub mod deserialise;
pub mod serialise;
pub mod types;

pub(crate) const HEADER_MASK_QR: u8 = 0b1000_0000;
pub(crate) const HEADER_MASK_OPCODE: u8 = 0b0111_1000;
pub(crate) const HEADER_OFFSET_OPCODE: u8 = 3;
pub(crate) const HEADER_MASK_AA: u8 = 0b0000_0100;
pub(crate) const HEADER_MASK_TC: u8 = 0b0000_0010;
pub(crate) const HEADER_MASK_RD: u8 = 0b0000_0001;
pub(crate) const HEADER_MASK_RA: u8 = 0b1000_0000;
pub(crate) const HEADER_MASK_RCODE: u8 = 0b0000_1111;
pub(crate) const HEADER_OFFSET_RCODE: u8 = 0;

pub(crate) const LABEL_MAX_LEN: usize = 63;
pub(crate) const DOMAINNAME_MAX_LEN: usize = 255;
