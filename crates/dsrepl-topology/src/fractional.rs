//! Fractional replication attribute lists.
//!
//! The exclude lists are stored as `(objectclass=*) $ EXCLUDE mail sn`. The
//! strip list is a plain space-separated list. Lists are kept sorted so two
//! lists with the same members always compare and encode the same way.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Sentinel that precedes the members of an exclude list.
pub const FRACTIONAL_PREFIX: &str = "(objectclass=*) $ EXCLUDE";

/// An order-insensitive set of attribute names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrList(BTreeSet<String>);

impl AttrList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no attribute is listed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether `attr` is listed.
    pub fn contains(&self, attr: &str) -> bool {
        self.0.contains(attr)
    }

    /// Sorted members.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Members joined by single spaces, as the tool's list flags expect.
    pub fn members(&self) -> String {
        self.iter().collect::<Vec<_>>().join(" ")
    }

    /// Attribute value of an exclude list. Empty lists encode as `""`.
    pub fn encode_fractional(&self) -> String {
        if self.is_empty() {
            String::new()
        } else {
            format!("{} {}", FRACTIONAL_PREFIX, self.members())
        }
    }

    /// Decode an exclude list, with or without the sentinel.
    pub fn decode_fractional(value: &str) -> Self {
        let trimmed = value.trim();
        let body = match trimmed.get(..FRACTIONAL_PREFIX.len()) {
            Some(head) if head.eq_ignore_ascii_case(FRACTIONAL_PREFIX) => {
                &trimmed[FRACTIONAL_PREFIX.len()..]
            }
            _ => trimmed,
        };
        Self::decode_plain(body)
    }

    /// Decode a plain space-separated list.
    pub fn decode_plain(value: &str) -> Self {
        value.split_whitespace().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for AttrList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        AttrList(
            iter.into_iter()
                .map(Into::into)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_sorted_with_prefix() {
        let list: AttrList = ["sn", "mail"].into_iter().collect();
        assert_eq!(list.encode_fractional(), "(objectclass=*) $ EXCLUDE mail sn");
        assert_eq!(list.members(), "mail sn");
    }

    #[test]
    fn test_decode_ignores_order() {
        let a = AttrList::decode_fractional("(objectclass=*) $ EXCLUDE sn mail");
        let b = AttrList::decode_fractional("(objectClass=*) $ EXCLUDE mail  sn");
        assert_eq!(a, b);
        assert!(a.contains("mail"));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_decode_without_prefix() {
        let list = AttrList::decode_fractional("memberof accountUnlockTime");
        assert_eq!(list.members(), "accountUnlockTime memberof");
    }

    #[test]
    fn test_empty() {
        assert_eq!(AttrList::new().encode_fractional(), "");
        assert!(AttrList::decode_fractional("").is_empty());
        assert!(AttrList::decode_fractional(FRACTIONAL_PREFIX).is_empty());
        assert!(AttrList::decode_plain("   ").is_empty());
    }

    proptest! {
        #[test]
        fn test_fractional_round_trip(attrs in proptest::collection::vec("[a-zA-Z][a-zA-Z0-9-]{0,15}", 0..8)) {
            let list: AttrList = attrs.iter().cloned().collect();
            let mut reversed = attrs.clone();
            reversed.reverse();
            let other: AttrList = reversed.into_iter().collect();
            prop_assert_eq!(AttrList::decode_fractional(&list.encode_fractional()), other);
        }
    }
}
