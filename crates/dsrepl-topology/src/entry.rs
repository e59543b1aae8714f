//! Directory-entry view of gateway payloads.
//!
//! The administration tool answers with JSON documents whose interesting parts
//! are an `attrs` object (one entry) or an `items` array (many entries, each
//! with its own `attrs`). Attribute names are case-insensitive, values are
//! ordered lists of strings.

use crate::error::{Result, TopologyError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Multi-valued attribute map of a single directory entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    attrs: BTreeMap<String, Vec<String>>,
}

impl Entry {
    /// Empty entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly for fixtures.
    pub fn with<I, S>(mut self, attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(attr, values.into_iter().map(Into::into).collect());
        self
    }

    /// Replace all values of `attr`.
    pub fn insert(&mut self, attr: &str, values: Vec<String>) {
        self.attrs.insert(attr.to_ascii_lowercase(), values);
    }

    /// All values of `attr` (empty when absent).
    pub fn values(&self, attr: &str) -> &[String] {
        self.attrs
            .get(&attr.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value of `attr`.
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.values(attr).first().map(String::as_str)
    }

    /// First value of `attr`, treating an empty string as absent.
    pub fn first_nonempty(&self, attr: &str) -> Option<&str> {
        self.first(attr).filter(|v| !v.is_empty())
    }

    /// Whether `attr` is present at all.
    pub fn contains(&self, attr: &str) -> bool {
        self.attrs.contains_key(&attr.to_ascii_lowercase())
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// True when the entry carries no attributes.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    fn from_attrs_value(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| TopologyError::MalformedPayload {
            msg: "\"attrs\" is not an object".to_string(),
        })?;
        let mut entry = Entry::new();
        for (name, vals) in obj {
            let list = match vals {
                Value::Array(items) => items.iter().map(scalar_to_string).collect(),
                Value::Null => Vec::new(),
                other => vec![scalar_to_string(other)],
            };
            entry.insert(name, list);
        }
        Ok(entry)
    }
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Structured result of a successful gateway call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(Value);

impl Payload {
    /// Wrap a decoded JSON document.
    pub fn new(value: Value) -> Self {
        Payload(value)
    }

    /// Payload of a command that prints nothing.
    pub fn empty() -> Self {
        Payload(Value::Null)
    }

    /// A bare status message (e.g. the answer to `init-status`).
    pub fn message_payload(msg: impl Into<String>) -> Self {
        Payload(Value::String(msg.into()))
    }

    /// Payload holding a single entry under `attrs`.
    pub fn from_entry(entry: &Entry) -> Self {
        Payload(serde_json::json!({ "attrs": entry.attrs }))
    }

    /// Payload holding a list of entries under `items`.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let items: Vec<Value> = entries
            .into_iter()
            .map(|e| serde_json::json!({ "attrs": e.attrs }))
            .collect();
        Payload(serde_json::json!({ "type": "list", "items": items }))
    }

    /// Raw JSON.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Decode the single entry under `attrs`.
    pub fn entry(&self) -> Result<Entry> {
        let attrs = self.0.get("attrs").ok_or_else(|| TopologyError::MalformedPayload {
            msg: "missing \"attrs\"".to_string(),
        })?;
        Entry::from_attrs_value(attrs)
    }

    /// Decode every entry under `items`. A payload without `items` is an
    /// empty list.
    pub fn items(&self) -> Result<Vec<Entry>> {
        let Some(items) = self.0.get("items") else {
            return Ok(Vec::new());
        };
        let arr = items.as_array().ok_or_else(|| TopologyError::MalformedPayload {
            msg: "\"items\" is not an array".to_string(),
        })?;
        arr.iter()
            .map(|item| match item.get("attrs") {
                Some(attrs) => Entry::from_attrs_value(attrs),
                None => Entry::from_attrs_value(item),
            })
            .collect()
    }

    /// The payload as a plain string, when it is one.
    pub fn message(&self) -> Option<&str> {
        self.0.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_case_insensitive() {
        let e = Entry::new().with("nsDS5ReplicaHost", ["h1"]);
        assert_eq!(e.first("nsds5replicahost"), Some("h1"));
        assert!(e.contains("NSDS5REPLICAHOST"));
        assert!(e.values("missing").is_empty());
    }

    #[test]
    fn test_payload_attrs() {
        let p = Payload::new(json!({
            "dn": "cn=replica,cn=config",
            "attrs": {
                "nsDS5ReplicaBindDN": ["cn=m1,cn=config", "cn=m2,cn=config"],
                "nsds5replicatype": ["3"]
            }
        }));
        let e = p.entry().unwrap();
        assert_eq!(e.values("nsds5replicabinddn").len(), 2);
        assert_eq!(e.first("nsds5replicatype"), Some("3"));
    }

    #[test]
    fn test_payload_items() {
        let p = Payload::new(json!({
            "type": "list",
            "items": [
                {"dn": "cn=a", "attrs": {"cn": ["a"]}},
                {"dn": "cn=b", "attrs": {"cn": ["b"]}}
            ]
        }));
        let items = p.items().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].first("cn"), Some("b"));
    }

    #[test]
    fn test_payload_missing_attrs_is_error() {
        let p = Payload::new(json!({"items": []}));
        assert!(matches!(
            p.entry(),
            Err(TopologyError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_payload_message() {
        let p = Payload::message_payload("Agreement successfully initialized.");
        assert_eq!(p.message(), Some("Agreement successfully initialized."));
        assert!(Payload::empty().items().unwrap().is_empty());
    }

    #[test]
    fn test_from_entry_round_trip() {
        let e = Entry::new().with("cn", ["x"]).with("nsds5replicaport", ["389"]);
        assert_eq!(Payload::from_entry(&e).entry().unwrap(), e);
        let items = Payload::from_entries([&e, &e]).items().unwrap();
        assert_eq!(items, vec![e.clone(), e]);
    }
}
