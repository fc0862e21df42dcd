//! In-memory store for the DNS-01 challenge values the ACME client is
//! currently waiting on. The responder answers TXT queries for
//! `_acme-challenge.<domain>` directly out of this store, so no
//! record ever needs to be written to a zone file.

use std::collections::HashMap;
use std::sync::RwLock;

use dns_types::protocol::types::DomainName;

use crate::metrics::{CHALLENGE_ACTIVE, CHALLENGE_CLEANUP_TOTAL, CHALLENGE_PRESENT_TOTAL};

#[derive(Debug, Default)]
pub struct ChallengeStore {
    values: RwLock<HashMap<DomainName, Vec<String>>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn present(&self, fqdn: DomainName, value: String) {
        let mut values = self.values.write().expect("challenge store lock poisoned");
        values.entry(fqdn.clone()).or_default().push(value);
        CHALLENGE_PRESENT_TOTAL
            .with_label_values(&[&fqdn.to_dotted_string()])
            .inc();
        CHALLENGE_ACTIVE.inc();
    }

    /// Removes a single instance of `value` for `fqdn`, from the tail
    /// end, matching the order used when multiple concurrent
    /// authorizations share a name.
    pub fn clean_up(&self, fqdn: &DomainName, value: &str) {
        let mut values = self.values.write().expect("challenge store lock poisoned");
        if let Some(entries) = values.get_mut(fqdn) {
            for i in (0..entries.len()).rev() {
                if entries[i] == value {
                    entries.remove(i);
                    CHALLENGE_CLEANUP_TOTAL
                        .with_label_values(&[&fqdn.to_dotted_string()])
                        .inc();
                    CHALLENGE_ACTIVE.dec();
                    break;
                }
            }
            if entries.is_empty() {
                values.remove(fqdn);
            }
        }
    }

    pub fn lookup(&self, fqdn: &DomainName) -> Option<Vec<String>> {
        let values = self.values.read().expect("challenge store lock poisoned");
        values.get(fqdn).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> DomainName {
        DomainName::from_dotted_string(name).unwrap()
    }

    #[test]
    fn present_then_lookup() {
        let store = ChallengeStore::new();
        let fqdn = domain("_acme-challenge.example.com.");
        store.present(fqdn.clone(), "abc".to_string());
        assert_eq!(Some(vec!["abc".to_string()]), store.lookup(&fqdn));
    }

    #[test]
    fn clean_up_removes_only_matching_value() {
        let store = ChallengeStore::new();
        let fqdn = domain("_acme-challenge.example.com.");
        store.present(fqdn.clone(), "abc".to_string());
        store.present(fqdn.clone(), "def".to_string());

        store.clean_up(&fqdn, "abc");
        assert_eq!(Some(vec!["def".to_string()]), store.lookup(&fqdn));

        store.clean_up(&fqdn, "def");
        assert_eq!(None, store.lookup(&fqdn));
    }

    #[test]
    fn clean_up_of_unknown_value_is_a_no_op() {
        let store = ChallengeStore::new();
        let fqdn = domain("_acme-challenge.example.com.");
        store.present(fqdn.clone(), "abc".to_string());
        store.clean_up(&fqdn, "xyz");
        assert_eq!(Some(vec!["abc".to_string()]), store.lookup(&fqdn));
    }
}
