//! The authoritative logic for the local-ip domain itself: answering
//! the apex, `ns.`, `whoami.` and `test.` names, synthesising A
//! records from encoded subdomains, and falling back to ACME
//! challenge TXT records or a loaded zone file.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use dns_types::protocol::types::{
    DomainName, Header, Message, QueryType, Rcode, RecordClass, RecordType, RecordTypeWithData,
    ResourceRecord,
};

use crate::challenge::ChallengeStore;
use crate::zone::{handle_zone, Zone};

/// A fixed, documentation-only address (RFC 5737 TEST-NET-3) returned
/// for `test.<domain>`, so operators can check connectivity without
/// depending on the requester's own address.
const TEST_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 0);

const SOA_TTL: u32 = 86400;
const NS_TTL: u32 = 300;
const A_TTL: u32 = 86400;
const CHALLENGE_TTL: u32 = 120;

pub struct Responder<'a> {
    pub domain: &'a DomainName,
    pub self_ip: Ipv4Addr,
    pub challenges: &'a ChallengeStore,
    pub zone: Option<&'a Zone>,
}

impl<'a> Responder<'a> {
    /// Builds a response for a single-question query. The caller is
    /// responsible for rejecting multi-question and unknown-class
    /// requests before calling this.
    ///
    /// Returns `None` for a qname outside the served domain: an
    /// authoritative server with no data for a name drops the query
    /// silently rather than replying, so it can't be used as a
    /// reflector against names it has nothing to do with.
    pub fn respond(&self, query: &Message, peer: SocketAddr) -> Option<Message> {
        let mut response = query.make_response();
        response.header.is_authoritative = true;
        response.header.recursion_available = false;

        let question = &query.questions[0];
        let qname = &question.name;
        let qtype = question.qtype;

        if !qname.is_subdomain_of(self.domain) {
            return None;
        }

        let ns_name = DomainName::prepend("ns", self.domain).expect("valid label");
        let whoami_name = DomainName::prepend("whoami", self.domain).expect("valid label");
        let test_name = DomainName::prepend("test", self.domain).expect("valid label");

        let synthesised_ip = if *qname == *self.domain || *qname == ns_name {
            Some(self.self_ip)
        } else if *qname == whoami_name {
            peer_ipv4(peer)
        } else if *qname == test_name {
            Some(TEST_IP)
        } else {
            extract_subdomain_ip(qname, self.domain).filter(|ip| allowed(*ip))
        };

        if *qname == *self.domain && qtype == QueryType::Record(RecordType::SOA) {
            response.answers.push(soa_record(self.domain, &ns_name));
            response.header.rcode = Rcode::NoError;
        } else if *qname == *self.domain && qtype == QueryType::Record(RecordType::NS) {
            response.answers.push(ResourceRecord {
                name: self.domain.clone(),
                rtype_with_data: RecordTypeWithData::NS {
                    nsdname: ns_name.clone(),
                },
                rclass: RecordClass::IN,
                ttl: NS_TTL,
            });
            response.header.rcode = Rcode::NoError;
        } else if let Some(ip) = synthesised_ip {
            if qtype == QueryType::Record(RecordType::A) {
                response.answers.push(ResourceRecord {
                    name: qname.clone(),
                    rtype_with_data: RecordTypeWithData::A { address: ip },
                    rclass: RecordClass::IN,
                    ttl: A_TTL,
                });
            }
            response.header.rcode = Rcode::NoError;
        } else if let Some(values) = self.challenges.lookup(qname) {
            if qtype == QueryType::Record(RecordType::TXT) {
                for value in values {
                    response.answers.push(ResourceRecord {
                        name: qname.clone(),
                        rtype_with_data: RecordTypeWithData::TXT {
                            octets: value.into_bytes(),
                        },
                        rclass: RecordClass::IN,
                        ttl: CHALLENGE_TTL,
                    });
                }
            }
            response.header.rcode = Rcode::NoError;
        } else if let Some(zone) = self.zone {
            let zone_response = handle_zone(zone, query);
            return Some(Message {
                header: Header {
                    is_authoritative: true,
                    ..zone_response.header
                },
                ..zone_response
            });
        } else {
            response.header.rcode = Rcode::NameError;
        }

        Some(response)
    }
}

fn soa_record(domain: &DomainName, ns_name: &DomainName) -> ResourceRecord {
    ResourceRecord {
        name: domain.clone(),
        rtype_with_data: RecordTypeWithData::SOA {
            mname: ns_name.clone(),
            rname: ns_name.clone(),
            serial: 0,
            refresh: 1200,
            retry: 300,
            expire: 1_209_600,
            minimum: 300,
        },
        rclass: RecordClass::IN,
        ttl: SOA_TTL,
    }
}

/// Recovers the address a UDP or TCP client connected from, ignoring
/// the port.
fn peer_ipv4(peer: SocketAddr) -> Option<Ipv4Addr> {
    match peer.ip() {
        IpAddr::V4(addr) => Some(addr),
        IpAddr::V6(_) => None,
    }
}

/// Parses the leftmost label run of `qname` (after `domain` is
/// stripped) as a dash-separated IPv4 address, e.g.
/// `10-0-0-5.example.com.` under domain `example.com.` becomes
/// `10.0.0.5`.
///
/// A `--` anywhere in the subdomain discards everything before it, so
/// `staging--10-0-0-5.example.com.` also resolves, letting a caller
/// prefix the encoded address with an arbitrary, human-readable tag.
/// Only a single label is permitted: anything with an extra dot
/// returns `None`.
pub fn extract_subdomain_ip(qname: &DomainName, domain: &DomainName) -> Option<Ipv4Addr> {
    if qname.label_count() != domain.label_count() + 1 {
        return None;
    }

    let label = &qname.labels[0];
    let text = std::str::from_utf8(label).ok()?;

    let text = match text.rfind("--") {
        Some(idx) => &text[idx + 2..],
        None => text,
    };

    let dotted = text.replace('-', ".");
    dotted.parse().ok()
}

/// Only ever resolve to addresses that cannot route off the local
/// network: RFC 1918 private space and the 100.64.0.0/10 CGNAT block.
/// This keeps the service from being abused as an open DNS-based proxy
/// for arbitrary public IPv4 addresses.
///
/// Matches the second octet against exactly 64, not the full /10
/// range: the original only ever checks `ip4[1] == 64`, so
/// `100.70.0.1` (inside 100.64.0.0/10 but outside the narrower check)
/// is rejected here too, for parity.
pub fn allowed(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_private() || (octets[0] == 100 && octets[1] == 64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> DomainName {
        DomainName::from_dotted_string(name).unwrap()
    }

    #[test]
    fn extract_subdomain_ip_simple() {
        assert_eq!(
            Some(Ipv4Addr::new(1, 2, 3, 4)),
            extract_subdomain_ip(&domain("1-2-3-4.domain.com."), &domain("domain.com."))
        );
    }

    #[test]
    fn extract_subdomain_ip_with_prefix_tag() {
        assert_eq!(
            Some(Ipv4Addr::new(1, 2, 3, 4)),
            extract_subdomain_ip(
                &domain("someting--1-2-3-4.domain.com."),
                &domain("domain.com.")
            )
        );
    }

    #[test]
    fn extract_subdomain_ip_wrong_domain() {
        assert_eq!(
            None,
            extract_subdomain_ip(
                &domain("someting--1-2-3-4.domain.com."),
                &domain("other-domain.com.")
            )
        );
    }

    #[test]
    fn extract_subdomain_ip_rejects_extra_label() {
        assert_eq!(
            None,
            extract_subdomain_ip(&domain("1.2.3.4.domain.com."), &domain("domain.com."))
        );
    }

    #[test]
    fn allowed_accepts_rfc1918_and_cgnat() {
        assert!(allowed(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(allowed(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(allowed(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(allowed(Ipv4Addr::new(100, 64, 0, 1)));
    }

    #[test]
    fn allowed_rejects_public_addresses() {
        assert!(!allowed(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!allowed(Ipv4Addr::new(100, 128, 0, 1)));
    }

    #[test]
    fn allowed_rejects_wider_cgnat_block_outside_second_octet_64() {
        assert!(!allowed(Ipv4Addr::new(100, 70, 0, 1)));
        assert!(!allowed(Ipv4Addr::new(100, 65, 0, 1)));
    }
}
