//! Serial forking by contact preference.
//!
//! Contacts are grouped by their `q` value, highest first. Contacts sharing a
//! `q` are forked in parallel; groups are tried one after the other, the next
//! group typically being forked from a failure route.

use std::collections::VecDeque;

use crate::transaction::BranchTarget;

/// One registered contact.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub uri: String,
    /// Preference in `0.0..=1.0`. Missing values count as 1.0.
    pub q: Option<f32>,
    pub next_hop: Option<String>,
}

impl Contact {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into(), q: None, next_hop: None }
    }

    pub fn with_q(mut self, q: f32) -> Self {
        self.q = Some(q);
        self
    }

    pub fn with_next_hop(mut self, next_hop: impl Into<String>) -> Self {
        self.next_hop = Some(next_hop.into());
        self
    }

    /// `q` in thousandths, clamped to the valid range.
    fn q_millis(&self) -> u16 {
        let q = self.q.unwrap_or(1.0);
        if q.is_nan() {
            return 1000;
        }
        (q.clamp(0.0, 1.0) * 1000.0).round() as u16
    }

    fn to_target(&self) -> BranchTarget {
        let mut target = BranchTarget::uri(self.uri.clone());
        target.next_hop = self.next_hop.clone();
        target
    }
}

/// Contacts ordered into fork groups.
#[derive(Debug, Clone, Default)]
pub struct ContactSet {
    groups: VecDeque<Vec<Contact>>,
}

impl ContactSet {
    /// Orders `contacts` by descending `q`, keeping the given order among
    /// contacts of equal preference.
    pub fn load(contacts: impl IntoIterator<Item = Contact>) -> Self {
        let mut contacts: Vec<Contact> = contacts.into_iter().collect();
        contacts.sort_by(|a, b| b.q_millis().cmp(&a.q_millis()));
        let mut groups: VecDeque<Vec<Contact>> = VecDeque::new();
        for contact in contacts {
            match groups.back_mut() {
                Some(group) if group[0].q_millis() == contact.q_millis() => group.push(contact),
                _ => groups.push_back(vec![contact]),
            }
        }
        Self { groups }
    }

    /// Targets of the next group to fork, `None` once exhausted.
    pub fn next_group(&mut self) -> Option<Vec<BranchTarget>> {
        self.groups.pop_front().map(|group| group.iter().map(Contact::to_target).collect())
    }

    /// Number of groups not handed out yet.
    pub fn remaining(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_by_descending_q() {
        let mut set = ContactSet::load(vec![
            Contact::new("sip:a@example.com").with_q(0.5),
            Contact::new("sip:b@example.com"),
            Contact::new("sip:c@example.com").with_q(0.5),
            Contact::new("sip:d@example.com").with_q(0.9),
        ]);
        assert_eq!(set.remaining(), 3);
        let uris = |g: Vec<BranchTarget>| g.into_iter().map(|t| t.uri).collect::<Vec<_>>();
        assert_eq!(uris(set.next_group().unwrap()), vec!["sip:b@example.com"]);
        assert_eq!(uris(set.next_group().unwrap()), vec!["sip:d@example.com"]);
        assert_eq!(uris(set.next_group().unwrap()), vec!["sip:a@example.com", "sip:c@example.com"]);
        assert!(set.next_group().is_none());
    }

    #[test]
    fn test_equal_q_is_one_parallel_group() {
        let mut set = ContactSet::load(vec![Contact::new("sip:a@x"), Contact::new("sip:b@x").with_next_hop("sip:p@x")]);
        let group = set.next_group().unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group[1].next_hop.as_deref(), Some("sip:p@x"));
        assert!(set.is_empty());
    }
}
