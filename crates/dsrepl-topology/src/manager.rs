//! Replication managers: the bind identities suppliers use to push updates.

use crate::error::ValidationError;
use crate::secret::Secret;
use serde::Serialize;
use std::collections::BTreeMap;

/// Loose distinguished-name shape check: one or more `attr=value` RDNs
/// separated by unescaped commas.
pub fn is_dn(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return false;
    }
    split_rdns(value).iter().all(|rdn| match rdn.split_once('=') {
        Some((attr, val)) => {
            let attr = attr.trim();
            !attr.is_empty()
                && attr
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
                && !val.trim().is_empty()
        }
        None => false,
    })
}

fn split_rdns(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => {
                parts.push(&dn[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    parts.push(&dn[start..]);
    parts
}

/// Check that an optional DN field is DN-shaped when set.
pub(crate) fn check_dn(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || is_dn(value) {
        Ok(())
    } else {
        Err(ValidationError::MalformedDn {
            field,
            value: value.to_string(),
        })
    }
}

/// Request to create a manager entry and register it on a replica.
#[derive(Debug, Clone, Default)]
pub struct NewManager {
    /// Full DN, e.g. `cn=replication manager,cn=config`.
    pub dn: String,
    /// Bind password.
    pub secret: Secret,
    /// Must equal `secret`.
    pub confirm: Secret,
}

impl NewManager {
    /// Client-side checks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut missing = Vec::new();
        if self.dn.trim().is_empty() {
            missing.push("manager DN");
        }
        if self.secret.is_empty() {
            missing.push("manager password");
        }
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields { fields: missing });
        }
        if !is_dn(&self.dn) {
            return Err(ValidationError::MalformedDn {
                field: "manager DN",
                value: self.dn.clone(),
            });
        }
        if self.secret != self.confirm {
            return Err(ValidationError::PasswordMismatch);
        }
        Ok(())
    }
}

/// Where a manager is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    /// Listed as a bind DN on the replica.
    Registered,
    /// Unregistered but the entry could not be deleted yet.
    RemovalPending,
}

/// Managers known for one replica.
///
/// The replica's bind DN list is authoritative for registered managers. A
/// manager whose two-step removal stopped half way stays listed as
/// [`ManagerState::RemovalPending`] until its entry is confirmed deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerRegistry {
    managers: BTreeMap<String, ManagerState>,
}

impl ManagerRegistry {
    /// Replace registered managers with the bind DNs read from the server,
    /// keeping pending removals.
    pub fn sync(&mut self, bind_dns: &[String]) {
        self.managers
            .retain(|_, state| *state == ManagerState::RemovalPending);
        for dn in bind_dns {
            self.managers.insert(dn.clone(), ManagerState::Registered);
        }
    }

    /// Record a freshly created manager.
    pub fn register(&mut self, dn: &str) {
        self.managers.insert(dn.to_string(), ManagerState::Registered);
    }

    /// Record that `dn` was unregistered but its entry still exists.
    pub fn mark_removal_pending(&mut self, dn: &str) {
        self.managers
            .insert(dn.to_string(), ManagerState::RemovalPending);
    }

    /// Forget `dn` after its entry was deleted.
    pub fn remove(&mut self, dn: &str) -> bool {
        self.managers.remove(dn).is_some()
    }

    /// State of `dn`, if known.
    pub fn state(&self, dn: &str) -> Option<ManagerState> {
        self.managers.get(dn).copied()
    }

    /// DNs currently registered as bind DNs.
    pub fn registered(&self) -> impl Iterator<Item = &str> {
        self.managers
            .iter()
            .filter(|(_, s)| **s == ManagerState::Registered)
            .map(|(dn, _)| dn.as_str())
    }

    /// True when at least one manager is registered.
    pub fn has_registered(&self) -> bool {
        self.registered().next().is_some()
    }

    /// Every known manager.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ManagerState)> {
        self.managers.iter().map(|(dn, s)| (dn.as_str(), *s))
    }
}
