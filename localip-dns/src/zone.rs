//! A deliberately small master-file parser and the delegation-aware
//! query handler for the optional static zone file.
//!
//! This is not a general nameserver algorithm: it does not build a
//! name tree or track SOA/NS authority boundaries the way a full
//! recursive or authoritative resolver would. It linearly scans every
//! record in the file for each query, which is fine for the handful
//! of custom records an operator hangs off their local-ip domain, and
//! synthesises NS-referral and glue-record behaviour the same way the
//! original service did.

use std::error;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use dns_types::protocol::types::{
    DomainName, Message, QueryType, Question, Rcode, RecordClass, RecordType, RecordTypeWithData,
    ResourceRecord,
};

pub type Zone = Vec<ResourceRecord>;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Malformed { line: usize, text: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "{err}"),
            Error::Malformed { line, text } => {
                write!(f, "malformed zone file entry at line {line}: {text:?}")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Malformed { .. } => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

pub async fn zone_from_file(origin: &DomainName, path: &Path) -> Result<Zone, Error> {
    let text = tokio::fs::read_to_string(path).await?;
    parse_zone(origin, &text)
}

/// Resolves a name token against the zone's origin: absolute names
/// end with a dot, relative names are suffixed with the origin.
fn resolve_name(token: &str, origin: &DomainName) -> Option<DomainName> {
    if token.ends_with('.') {
        DomainName::from_dotted_string(token)
    } else {
        DomainName::prepend(token, origin)
    }
}

pub fn parse_zone(origin: &DomainName, source: &str) -> Result<Zone, Error> {
    let mut zone = Zone::new();

    for (lineno, raw_line) in source.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }

        let malformed = || Error::Malformed {
            line: lineno + 1,
            text: raw_line.to_string(),
        };

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 4 {
            return Err(malformed());
        }

        let name = resolve_name(tokens[0], origin).ok_or_else(malformed)?;
        let ttl: u32 = tokens[1].parse().map_err(|_| malformed())?;
        if !tokens[2].eq_ignore_ascii_case("IN") {
            return Err(malformed());
        }
        let rtype = tokens[3].to_ascii_uppercase();
        let rdata = &tokens[4..];

        let rtype_with_data = match rtype.as_str() {
            "A" => {
                let address: Ipv4Addr = rdata
                    .first()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(malformed)?;
                RecordTypeWithData::A { address }
            }
            "NS" => {
                let nsdname = rdata
                    .first()
                    .and_then(|tok| resolve_name(tok, origin))
                    .ok_or_else(malformed)?;
                RecordTypeWithData::NS { nsdname }
            }
            "CNAME" => {
                let cname = rdata
                    .first()
                    .and_then(|tok| resolve_name(tok, origin))
                    .ok_or_else(malformed)?;
                RecordTypeWithData::CNAME { cname }
            }
            "TXT" => {
                let joined = rdata.join(" ");
                let text = joined.trim_matches('"');
                RecordTypeWithData::TXT {
                    octets: text.as_bytes().to_vec(),
                }
            }
            _ => return Err(malformed()),
        };

        zone.push(ResourceRecord {
            name,
            rtype_with_data,
            rclass: RecordClass::IN,
            ttl,
        });
    }

    Ok(zone)
}

/// Answers a query out of the static zone, following NS delegations
/// and attaching glue records the way the zone's authority boundary
/// needs.
///
/// Returns `None` if no entry in the zone applies to this query at
/// all, leaving the caller free to fall through to NXDOMAIN.
pub fn handle_zone(zone: &Zone, query: &Message) -> Message {
    let mut response = query.make_response();
    response.header.is_authoritative = true;
    response.header.rcode = Rcode::NameError;

    let question = &query.questions[0];
    let qname = &question.name;
    let qname_label_count = qname.label_count();
    let qtype = question.qtype;

    let mut extra_names: Vec<DomainName> = Vec::new();

    for rr in zone {
        if !qname.is_subdomain_of(&rr.name) {
            continue;
        }

        let exact = rr.name.label_count() == qname_label_count;

        match &rr.rtype_with_data {
            RecordTypeWithData::NS { nsdname } => {
                if qtype == QueryType::Record(RecordType::NS) && exact {
                    response.answers.push(rr.clone());
                } else {
                    response.authority.push(ResourceRecord {
                        name: qname.clone(),
                        rtype_with_data: RecordTypeWithData::NS {
                            nsdname: nsdname.clone(),
                        },
                        rclass: rr.rclass,
                        ttl: rr.ttl,
                    });
                }
                response.header.rcode = Rcode::NoError;
                extra_names.push(nsdname.clone());
            }
            RecordTypeWithData::CNAME { cname } => {
                if exact {
                    response.answers.push(ResourceRecord {
                        name: qname.clone(),
                        rtype_with_data: RecordTypeWithData::CNAME {
                            cname: cname.clone(),
                        },
                        rclass: rr.rclass,
                        ttl: rr.ttl,
                    });
                    extra_names.push(cname.clone());
                    response.header.rcode = Rcode::NoError;
                }
            }
            _ => {
                if exact && rr.matches(&Question {
                    name: qname.clone(),
                    qtype,
                    qclass: question.qclass,
                }) {
                    response.answers.push(rr.clone());
                    response.header.rcode = Rcode::NoError;
                }
            }
        }
    }

    if !extra_names.is_empty() {
        extra_names.sort_by(|a, b| a.octets.cmp(&b.octets));
        extra_names.dedup();

        for name in &extra_names {
            for rr in zone {
                if &rr.name == name && rr.rtype_with_data.rtype() == query_type_rtype(qtype) {
                    response.additional.push(rr.clone());
                }
            }
        }
    }

    response
}

fn query_type_rtype(qtype: QueryType) -> RecordType {
    match qtype {
        QueryType::Record(rtype) => rtype,
        // glue lookups only ever care about concrete record types;
        // anything else simply matches nothing below.
        _ => RecordType::from(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::{Header, Opcode, QueryClass, Rcode};

    fn origin() -> DomainName {
        DomainName::from_dotted_string("test.com.").unwrap()
    }

    fn domain(name: &str) -> DomainName {
        DomainName::from_dotted_string(name).unwrap()
    }

    const GLUE_ZONE: &str = "
sub 30 IN NS ns.sub

ns.sub 30 IN A 1.2.3.4
ns.sub 30 IN A 1.2.3.5
";

    #[test]
    fn parses_glue_records() {
        let zone = parse_zone(&origin(), GLUE_ZONE).unwrap();
        assert_eq!(
            vec![
                ResourceRecord {
                    name: domain("sub.test.com."),
                    rtype_with_data: RecordTypeWithData::NS {
                        nsdname: domain("ns.sub.test.com.")
                    },
                    rclass: RecordClass::IN,
                    ttl: 30,
                },
                ResourceRecord {
                    name: domain("ns.sub.test.com."),
                    rtype_with_data: RecordTypeWithData::A {
                        address: Ipv4Addr::new(1, 2, 3, 4)
                    },
                    rclass: RecordClass::IN,
                    ttl: 30,
                },
                ResourceRecord {
                    name: domain("ns.sub.test.com."),
                    rtype_with_data: RecordTypeWithData::A {
                        address: Ipv4Addr::new(1, 2, 3, 5)
                    },
                    rclass: RecordClass::IN,
                    ttl: 30,
                },
            ],
            zone
        );
    }

    #[test]
    fn handle_zone_returns_delegation_with_glue() {
        let zone = parse_zone(&origin(), GLUE_ZONE).unwrap();

        let query = Message {
            header: Header {
                id: 0,
                is_response: false,
                opcode: Opcode::Standard,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: false,
                recursion_available: false,
                rcode: Rcode::NoError,
            },
            questions: vec![Question {
                name: domain("label.sub.test.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };

        let response = handle_zone(&zone, &query);

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert_eq!(
            vec![ResourceRecord {
                name: domain("label.sub.test.com."),
                rtype_with_data: RecordTypeWithData::NS {
                    nsdname: domain("ns.sub.test.com.")
                },
                rclass: RecordClass::IN,
                ttl: 30,
            }],
            response.authority
        );
        assert_eq!(
            vec![
                ResourceRecord {
                    name: domain("ns.sub.test.com."),
                    rtype_with_data: RecordTypeWithData::A {
                        address: Ipv4Addr::new(1, 2, 3, 4)
                    },
                    rclass: RecordClass::IN,
                    ttl: 30,
                },
                ResourceRecord {
                    name: domain("ns.sub.test.com."),
                    rtype_with_data: RecordTypeWithData::A {
                        address: Ipv4Addr::new(1, 2, 3, 5)
                    },
                    rclass: RecordClass::IN,
                    ttl: 30,
                },
            ],
            response.additional
        );
    }

    #[test]
    fn handle_zone_nxdomain_for_unrelated_name() {
        let zone = parse_zone(&origin(), GLUE_ZONE).unwrap();

        let query = Message {
            header: Header {
                id: 0,
                is_response: false,
                opcode: Opcode::Standard,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: false,
                recursion_available: false,
                rcode: Rcode::NoError,
            },
            questions: vec![Question {
                name: domain("nothing.test.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };

        let response = handle_zone(&zone, &query);
        assert_eq!(Rcode::NameError, response.header.rcode);
    }
}
