//! Windows sync agreements.
//!
//! The Active Directory peer is addressed by one composite token:
//!
//! ```text
//! <proto>://<host>:<port>[/<subtree>] <maxConns>,<maxOps>,<timeout>,<ldapVersion>,<connLifetime>,<startTLS 0|1>
//! ```
//!
//! The connection parameter list is optional. Tokens are decomposed on load
//! and recomposed unchanged on save.

use crate::agreement::{
    check_credential, diff_secret, diff_value, parse_schedule, schedule_value, Transport,
};
use crate::entry::Entry;
use crate::error::{Result, TopologyError, ValidationError};
use crate::events::Snapshot;
use crate::fractional::AttrList;
use crate::gateway::ArgValue;
use crate::lifecycle::{AgreementKind, AgreementRecord, AgreementSpec};
use crate::manager::check_dn;
use crate::schedule::Schedule;
use crate::secret::Secret;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A winsync agreement as listed.
pub type WinsyncAgreement = AgreementRecord<WinsyncFields>;

/// Connection tuning carried after the URL part of the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnParams {
    /// Maximum connections.
    pub max_conns: u32,
    /// Maximum outstanding operations per connection.
    pub max_ops: u32,
    /// Operation timeout, seconds.
    pub timeout: u32,
    /// LDAP protocol version.
    pub ldap_version: u8,
    /// Connection lifetime, seconds.
    pub conn_lifetime: u32,
    /// Upgrade with StartTLS.
    pub start_tls: bool,
}

/// Decomposed address of the Active Directory peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WinsyncAddress {
    /// `Ldap` or `Ldaps`, from the URL scheme.
    pub transport: Transport,
    /// Host name or bracketed IPv6 address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Optional subtree path after the port.
    pub subtree: Option<String>,
    /// Optional connection parameters.
    pub params: Option<ConnParams>,
}

impl WinsyncAddress {
    /// Address without subtree or connection parameters.
    pub fn new(transport: Transport, host: &str, port: u16) -> Self {
        Self {
            transport,
            host: host.to_string(),
            port,
            subtree: None,
            params: None,
        }
    }

    /// Transport the agreement effectively uses.
    pub fn effective_transport(&self) -> Transport {
        match (self.transport, self.params) {
            (Transport::Ldap, Some(p)) if p.start_tls => Transport::StartTls,
            (t, _) => t,
        }
    }

    fn parse_params(token: &str, raw: &str) -> Result<ConnParams> {
        let malformed = |msg: String| TopologyError::MalformedAddress {
            token: token.to_string(),
            msg,
        };
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        if parts.len() != 6 {
            return Err(malformed(format!(
                "expected 6 connection parameters, found {}",
                parts.len()
            )));
        }
        let num = |i: usize, name: &str| {
            parts[i]
                .parse::<u32>()
                .map_err(|_| malformed(format!("{} is not a number: {:?}", name, parts[i])))
        };
        let ldap_version = parts[3]
            .parse::<u8>()
            .map_err(|_| malformed(format!("ldap version is not a number: {:?}", parts[3])))?;
        let start_tls = match parts[5] {
            "0" => false,
            "1" => true,
            other => return Err(malformed(format!("startTLS must be 0 or 1, got {:?}", other))),
        };
        Ok(ConnParams {
            max_conns: num(0, "max connections")?,
            max_ops: num(1, "max operations")?,
            timeout: num(2, "timeout")?,
            ldap_version,
            conn_lifetime: num(4, "connection lifetime")?,
            start_tls,
        })
    }
}

impl FromStr for WinsyncAddress {
    type Err = TopologyError;

    fn from_str(token: &str) -> Result<Self> {
        let malformed = |msg: &str| TopologyError::MalformedAddress {
            token: token.to_string(),
            msg: msg.to_string(),
        };
        let trimmed = token.trim();
        let (url, params) = match trimmed.split_once(char::is_whitespace) {
            Some((url, params)) => (url, Some(params.trim())),
            None => (trimmed, None),
        };
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| malformed("missing \"://\" separator"))?;
        let transport = if scheme.eq_ignore_ascii_case("ldap") {
            Transport::Ldap
        } else if scheme.eq_ignore_ascii_case("ldaps") {
            Transport::Ldaps
        } else {
            return Err(malformed("scheme must be ldap or ldaps"));
        };
        let (host_port, subtree) = match rest.split_once('/') {
            Some((hp, subtree)) => (hp, Some(subtree.to_string())),
            None => (rest, None),
        };
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| malformed("missing \":\" port separator"))?;
        if host.is_empty() {
            return Err(malformed("empty host"));
        }
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| malformed("invalid port"))?;
        let params = params
            .map(|raw| WinsyncAddress::parse_params(token, raw))
            .transpose()?;
        Ok(Self {
            transport,
            host: host.to_string(),
            port,
            subtree,
            params,
        })
    }
}

impl fmt::Display for WinsyncAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.transport {
            Transport::Ldaps => "ldaps",
            Transport::Ldap | Transport::StartTls => "ldap",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)?;
        if let Some(subtree) = &self.subtree {
            write!(f, "/{}", subtree)?;
        }
        if let Some(p) = &self.params {
            write!(
                f,
                " {},{},{},{},{},{}",
                p.max_conns,
                p.max_ops,
                p.timeout,
                p.ldap_version,
                p.conn_lifetime,
                u8::from(p.start_tls)
            )?;
        }
        Ok(())
    }
}

/// Editable settings of a winsync agreement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WinsyncFields {
    /// Active Directory peer.
    pub address: Option<WinsyncAddress>,
    /// DN used to bind to Active Directory.
    pub bind_dn: String,
    /// Bind password.
    #[serde(skip)]
    pub credential: Secret,
    /// Confirmation of a new password, checked on save.
    #[serde(skip)]
    pub credential_confirm: Option<Secret>,
    /// `None` synchronizes continuously.
    pub schedule: Option<Schedule>,
    /// Attributes excluded from synchronization.
    pub frac_exclude: AttrList,
    /// Active Directory domain.
    pub windows_domain: String,
    /// Active Directory subtree.
    pub windows_subtree: String,
    /// Local subtree.
    pub directory_subtree: String,
    /// Create local users for new AD users.
    pub sync_new_users: bool,
    /// Create local groups for new AD groups.
    pub sync_new_groups: bool,
    /// Seconds between AD change checks.
    pub sync_interval: String,
    /// `toWindows`, `fromWindows` or `both`.
    pub one_way_sync: String,
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

impl WinsyncFields {
    fn token(&self) -> String {
        self.address
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut missing = Vec::new();
        if self.address.is_none() {
            missing.push("server address");
        }
        if self.bind_dn.trim().is_empty() {
            missing.push("bind DN");
        }
        if self.credential.is_empty() {
            missing.push("credential");
        }
        if self.windows_domain.trim().is_empty() {
            missing.push("windows domain");
        }
        if self.windows_subtree.trim().is_empty() {
            missing.push("windows subtree");
        }
        if self.directory_subtree.trim().is_empty() {
            missing.push("directory subtree");
        }
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields { fields: missing });
        }
        check_dn("bind DN", self.bind_dn.trim())?;
        check_dn("windows subtree", self.windows_subtree.trim())?;
        check_dn("directory subtree", self.directory_subtree.trim())?;
        check_credential(&self.credential, self.credential_confirm.as_ref())?;
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        Ok(())
    }
}

impl AgreementSpec for WinsyncFields {
    const KIND: AgreementKind = AgreementKind::Winsync;

    fn from_entry(entry: &Entry) -> Result<Self> {
        let address = match entry.first_nonempty("nsds7windowsserverurl") {
            Some(token) => Some(token.parse::<WinsyncAddress>()?),
            None => {
                let host = entry.first_nonempty("nsds5replicahost");
                let port = entry
                    .first_nonempty("nsds5replicaport")
                    .and_then(|p| p.trim().parse::<u16>().ok());
                let transport = entry
                    .first_nonempty("nsds5replicatransportinfo")
                    .and_then(|t| t.parse::<Transport>().ok())
                    .unwrap_or(Transport::Ldap);
                match (host, port) {
                    (Some(host), Some(port)) => Some(WinsyncAddress::new(transport, host, port)),
                    _ => None,
                }
            }
        };
        let flag = |attr: &str| {
            entry
                .first(attr)
                .map_or(false, |v| v.eq_ignore_ascii_case("on"))
        };
        let text = |attr: &str| entry.first(attr).unwrap_or_default().to_string();
        Ok(Self {
            address,
            bind_dn: text("nsds5replicabinddn"),
            credential: Secret::new(text("nsds5replicacredentials")),
            credential_confirm: None,
            schedule: parse_schedule(entry)?,
            frac_exclude: AttrList::decode_fractional(
                entry.first("nsds5replicatedattributelist").unwrap_or_default(),
            ),
            windows_domain: text("nsds7windowsdomain"),
            windows_subtree: text("nsds7windowsreplicasubtree"),
            directory_subtree: text("nsds7directoryreplicasubtree"),
            sync_new_users: flag("nsds7newwinusersyncenabled"),
            sync_new_groups: flag("nsds7newwingroupsyncenabled"),
            sync_interval: text("winsyncinterval"),
            one_way_sync: text("onewaysync"),
        })
    }

    fn redacted(mut self) -> Self {
        self.credential = Secret::default();
        self.credential_confirm = None;
        self
    }

    fn validate_create(&self) -> std::result::Result<(), ValidationError> {
        self.validate()
    }

    fn create_flags(&self) -> Vec<(&'static str, ArgValue)> {
        let mut flags = vec![
            ("server-url", ArgValue::from(self.token())),
            ("bind-dn", ArgValue::from(self.bind_dn.trim())),
            ("bind-passwd", ArgValue::Secret(self.credential.clone())),
            ("win-domain", ArgValue::from(self.windows_domain.trim())),
            ("win-subtree", ArgValue::from(self.windows_subtree.trim())),
            ("ds-subtree", ArgValue::from(self.directory_subtree.trim())),
            ("sync-users", ArgValue::from(on_off(self.sync_new_users))),
            ("sync-groups", ArgValue::from(on_off(self.sync_new_groups))),
        ];
        if !self.sync_interval.trim().is_empty() {
            flags.push(("sync-interval", ArgValue::from(self.sync_interval.trim())));
        }
        if !self.one_way_sync.trim().is_empty() {
            flags.push(("one-way-sync", ArgValue::from(self.one_way_sync.trim())));
        }
        if let Some(schedule) = &self.schedule {
            flags.push(("schedule", ArgValue::from(schedule.encode())));
        }
        if !self.frac_exclude.is_empty() {
            flags.push(("frac-list", ArgValue::from(self.frac_exclude.encode_fractional())));
        }
        flags
    }

    fn diff_flags(
        &self,
        pending: &Self,
    ) -> std::result::Result<Vec<(&'static str, ArgValue)>, ValidationError> {
        pending.validate()?;
        let mut out = Vec::new();
        diff_value(&mut out, "server-url", &self.token(), &pending.token());
        diff_value(&mut out, "bind-dn", self.bind_dn.trim(), pending.bind_dn.trim());
        diff_secret(&mut out, "bind-passwd", &self.credential, &pending.credential);
        diff_value(
            &mut out,
            "win-domain",
            self.windows_domain.trim(),
            pending.windows_domain.trim(),
        );
        diff_value(
            &mut out,
            "win-subtree",
            self.windows_subtree.trim(),
            pending.windows_subtree.trim(),
        );
        diff_value(
            &mut out,
            "ds-subtree",
            self.directory_subtree.trim(),
            pending.directory_subtree.trim(),
        );
        diff_value(
            &mut out,
            "sync-users",
            on_off(self.sync_new_users),
            on_off(pending.sync_new_users),
        );
        diff_value(
            &mut out,
            "sync-groups",
            on_off(self.sync_new_groups),
            on_off(pending.sync_new_groups),
        );
        diff_value(
            &mut out,
            "sync-interval",
            self.sync_interval.trim(),
            pending.sync_interval.trim(),
        );
        diff_value(
            &mut out,
            "one-way-sync",
            self.one_way_sync.trim(),
            pending.one_way_sync.trim(),
        );
        diff_value(
            &mut out,
            "schedule",
            &schedule_value(&self.schedule),
            &schedule_value(&pending.schedule),
        );
        diff_value(
            &mut out,
            "frac-list",
            &self.frac_exclude.encode_fractional(),
            &pending.frac_exclude.encode_fractional(),
        );
        Ok(out)
    }

    fn snapshot(suffix: String, agreements: Vec<WinsyncAgreement>) -> Snapshot {
        Snapshot::WinsyncAgreements { suffix, agreements }
    }
}
