use std::net::Ipv4Addr;

use dns_types::protocol::deserialise::ConsumableBuffer;
use dns_types::protocol::types::*;

fn domain(name: &str) -> DomainName {
    DomainName::from_dotted_string(name).unwrap()
}

#[test]
fn query_for_synthesised_a_record_roundtrips() {
    let message = Message {
        header: Header {
            id: 0xbeef,
            is_response: false,
            opcode: Opcode::Standard,
            is_authoritative: false,
            is_truncated: false,
            recursion_desired: true,
            recursion_available: false,
            rcode: Rcode::NoError,
        },
        questions: vec![Question {
            name: domain("10-20-30-40.example.com."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        }],
        answers: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
    };

    let octets = message.serialise().unwrap();
    let parsed = Message::deserialise(ConsumableBuffer::new(&octets)).unwrap();
    assert_eq!(message, parsed);
}

#[test]
fn response_with_answer_and_authority_roundtrips() {
    let apex = domain("example.com.");
    let message = Message {
        header: Header {
            id: 1,
            is_response: true,
            opcode: Opcode::Standard,
            is_authoritative: true,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: true,
            rcode: Rcode::NoError,
        },
        questions: vec![Question {
            name: domain("10-0-0-1.example.com."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        }],
        answers: vec![ResourceRecord {
            name: domain("10-0-0-1.example.com."),
            rtype_with_data: RecordTypeWithData::A {
                address: Ipv4Addr::new(10, 0, 0, 1),
            },
            rclass: RecordClass::IN,
            ttl: 60,
        }],
        authority: vec![ResourceRecord {
            name: apex.clone(),
            rtype_with_data: RecordTypeWithData::SOA {
                mname: DomainName::prepend("ns1", &apex).unwrap(),
                rname: DomainName::prepend("hostmaster", &apex).unwrap(),
                serial: 2026072601,
                refresh: 3600,
                retry: 600,
                expire: 604_800,
                minimum: 300,
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }],
        additional: Vec::new(),
    };

    let octets = message.serialise().unwrap();
    let parsed = Message::deserialise(ConsumableBuffer::new(&octets)).unwrap();
    assert_eq!(message, parsed);
}

#[test]
fn nxdomain_response_has_no_answers() {
    let message = Message {
        header: Header {
            id: 7,
            is_response: true,
            opcode: Opcode::Standard,
            is_authoritative: true,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: true,
            rcode: Rcode::NameError,
        },
        questions: vec![Question {
            name: domain("not-an-ip.example.com."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        }],
        answers: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
    };

    let octets = message.serialise().unwrap();
    let parsed = Message::deserialise(ConsumableBuffer::new(&octets)).unwrap();
    assert_eq!(Rcode::NameError, parsed.header.rcode);
    assert!(parsed.answers.is_empty());
}

#[test]
fn unknown_record_type_passes_through_octets() {
    let tag = match RecordType::from(99) {
        RecordType::Unknown(tag) => tag,
        _ => unreachable!(),
    };

    let message = Message {
        header: Header {
            id: 99,
            is_response: true,
            opcode: Opcode::Standard,
            is_authoritative: true,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: true,
            rcode: Rcode::NoError,
        },
        questions: Vec::new(),
        answers: vec![ResourceRecord {
            name: domain("example.com."),
            rtype_with_data: RecordTypeWithData::Unknown {
                tag,
                octets: vec![1, 2, 3, 4],
            },
            rclass: RecordClass::IN,
            ttl: 60,
        }],
        authority: Vec::new(),
        additional: Vec::new(),
    };

    let octets = message.serialise().unwrap();
    let parsed = Message::deserialise(ConsumableBuffer::new(&octets)).unwrap();
    assert_eq!(message, parsed);
}
