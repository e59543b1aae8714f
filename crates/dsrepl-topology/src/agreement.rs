//! Replication agreements: one-way links from this replica to a remote one.

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

/// A replication agreement as listed.
pub type Agreement = AgreementRecord<AgreementFields>;

/// Connection security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Transport {
    /// Plain LDAP.
    Ldap,
    /// LDAP over TLS.
    Ldaps,
    /// LDAP upgraded with StartTLS.
    StartTls,
}

impl Transport {
    /// Value of `--conn-protocol`.
    pub fn as_arg(self) -> &'static str {
        match self {
            Transport::Ldap => "LDAP",
            Transport::Ldaps => "LDAPS",
            Transport::StartTls => "StartTLS",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

impl FromStr for Transport {
    type Err = String;

    /// Accepts the flag values and the stored `SSL`/`TLS` spellings.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ldap" => Ok(Transport::Ldap),
            "ldaps" | "ssl" => Ok(Transport::Ldaps),
            "starttls" | "tls" => Ok(Transport::StartTls),
            other => Err(format!("unknown connection protocol {:?}", other)),
        }
    }
}

/// How the supplier authenticates to the remote replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BindMethod {
    /// Bind DN and password.
    Simple,
    /// SASL DIGEST-MD5.
    SaslDigestMd5,
    /// SASL GSSAPI (Kerberos).
    SaslGssapi,
    /// TLS client certificate.
    SslClientAuth,
}

impl BindMethod {
    /// Value of `--bind-method`.
    pub fn as_arg(self) -> &'static str {
        match self {
            BindMethod::Simple => "SIMPLE",
            BindMethod::SaslDigestMd5 => "SASL/DIGEST-MD5",
            BindMethod::SaslGssapi => "SASL/GSSAPI",
            BindMethod::SslClientAuth => "SSLCLIENTAUTH",
        }
    }
}

impl fmt::Display for BindMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

impl FromStr for BindMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SIMPLE" => Ok(BindMethod::Simple),
            "SASL/DIGEST-MD5" | "SASL/DIGEST" => Ok(BindMethod::SaslDigestMd5),
            "SASL/GSSAPI" => Ok(BindMethod::SaslGssapi),
            "SSLCLIENTAUTH" => Ok(BindMethod::SslClientAuth),
            other => Err(format!("unknown bind method {:?}", other)),
        }
    }
}

/// Total update state of an agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStatus {
    /// Never initialized.
    NotInitialized,
    /// A total update is running.
    InProgress,
    /// Last total update succeeded.
    Initialized,
    /// Last total update failed.
    Failed,
}

const NEVER_STARTED: &str = "19700101000000Z";

/// Init status shown for a listed agreement.
pub fn derive_init_status(entry: &Entry) -> InitStatus {
    let status = entry
        .first("nsds5replicalastinitstatus")
        .unwrap_or_default()
        .trim();
    if status.is_empty() {
        return match entry.first("nsds5replicalastinitstart") {
            Some(NEVER_STARTED) => InitStatus::NotInitialized,
            _ => InitStatus::Initialized,
        };
    }
    if status == "Error (0) Total update in progress" || status == "Error (0)" {
        return InitStatus::InProgress;
    }
    if status.starts_with("Error (0) Total update succeeded") {
        return InitStatus::Initialized;
    }
    let failed_code = status
        .strip_prefix("Error (")
        .and_then(|rest| rest.split_once(')'))
        .and_then(|(code, _)| code.trim().parse::<i64>().ok())
        .map_or(false, |code| code != 0);
    if failed_code || status.to_ascii_lowercase().contains("fail") {
        InitStatus::Failed
    } else {
        InitStatus::Initialized
    }
}

/// Editable settings of a replication agreement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgreementFields {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: Option<u16>,
    /// Connection security.
    pub transport: Option<Transport>,
    /// Authentication method.
    pub bind_method: Option<BindMethod>,
    /// DN used to bind to the remote replica.
    pub bind_dn: String,
    /// Bind password.
    #[serde(skip)]
    pub credential: Secret,
    /// Confirmation of a new password, checked on save.
    #[serde(skip)]
    pub credential_confirm: Option<Secret>,
    /// `None` replicates continuously.
    pub schedule: Option<Schedule>,
    /// Excluded from incremental updates.
    pub frac_exclude: AttrList,
    /// Excluded from total updates.
    pub frac_exclude_total: AttrList,
    /// Stripped from updates that only touch these attributes.
    pub strip_attrs: AttrList,
}

impl AgreementFields {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("host");
        }
        if self.port.is_none() {
            missing.push("port");
        }
        if self.transport.is_none() {
            missing.push("connection protocol");
        }
        if self.bind_method.is_none() {
            missing.push("bind method");
        }
        if self.bind_dn.trim().is_empty() {
            missing.push("bind DN");
        }
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields { fields: missing });
        }
        if self.port == Some(0) {
            return Err(ValidationError::InvalidPort("0".to_string()));
        }
        check_dn("bind DN", self.bind_dn.trim())?;
        check_credential(&self.credential, self.credential_confirm.as_ref())?;
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        Ok(())
    }
}

pub(crate) fn check_credential(
    credential: &Secret,
    confirm: Option<&Secret>,
) -> std::result::Result<(), ValidationError> {
    match confirm {
        Some(c) if c != credential => Err(ValidationError::PasswordMismatch),
        _ => Ok(()),
    }
}

/// Push `flag` when `old` and `new` differ; a cleared value becomes a delete.
pub(crate) fn diff_value(
    out: &mut Vec<(&'static str, ArgValue)>,
    flag: &'static str,
    old: &str,
    new: &str,
) {
    if old != new {
        let value = if new.is_empty() {
            ArgValue::Delete
        } else {
            ArgValue::from(new)
        };
        out.push((flag, value));
    }
}

pub(crate) fn diff_secret(
    out: &mut Vec<(&'static str, ArgValue)>,
    flag: &'static str,
    old: &Secret,
    new: &Secret,
) {
    if old != new {
        let value = if new.is_empty() {
            ArgValue::Delete
        } else {
            ArgValue::Secret(new.clone())
        };
        out.push((flag, value));
    }
}

pub(crate) fn schedule_value(schedule: &Option<Schedule>) -> String {
    schedule.as_ref().map(Schedule::encode).unwrap_or_default()
}

pub(crate) fn parse_schedule(entry: &Entry) -> Result<Option<Schedule>> {
    entry
        .first_nonempty("nsds5replicaupdateschedule")
        .map(Schedule::decode)
        .transpose()
}

impl AgreementSpec for AgreementFields {
    const KIND: AgreementKind = AgreementKind::Replication;

    fn from_entry(entry: &Entry) -> Result<Self> {
        let port = entry
            .first_nonempty("nsds5replicaport")
            .map(|p| {
                p.trim().parse::<u16>().map_err(|_| TopologyError::MalformedPayload {
                    msg: format!("invalid port {:?}", p),
                })
            })
            .transpose()?;
        Ok(Self {
            host: entry.first("nsds5replicahost").unwrap_or_default().to_string(),
            port,
            transport: entry
                .first_nonempty("nsds5replicatransportinfo")
                .and_then(|t| t.parse().ok()),
            bind_method: entry
                .first_nonempty("nsds5replicabindmethod")
                .and_then(|m| m.parse().ok()),
            bind_dn: entry.first("nsds5replicabinddn").unwrap_or_default().to_string(),
            credential: Secret::new(entry.first("nsds5replicacredentials").unwrap_or_default()),
            credential_confirm: None,
            schedule: parse_schedule(entry)?,
            frac_exclude: AttrList::decode_fractional(
                entry.first("nsds5replicatedattributelist").unwrap_or_default(),
            ),
            frac_exclude_total: AttrList::decode_fractional(
                entry.first("nsds5replicatedattributelisttotal").unwrap_or_default(),
            ),
            strip_attrs: AttrList::decode_plain(
                entry.first("nsds5replicastripattrs").unwrap_or_default(),
            ),
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
            ("host", ArgValue::from(self.host.trim())),
            (
                "port",
                ArgValue::from(self.port.map(|p| p.to_string()).unwrap_or_default()),
            ),
            (
                "conn-protocol",
                ArgValue::from(self.transport.map(Transport::as_arg).unwrap_or_default()),
            ),
            (
                "bind-method",
                ArgValue::from(self.bind_method.map(BindMethod::as_arg).unwrap_or_default()),
            ),
            ("bind-dn", ArgValue::from(self.bind_dn.trim())),
            ("bind-passwd", ArgValue::Secret(self.credential.clone())),
        ];
        if let Some(schedule) = &self.schedule {
            flags.push(("schedule", ArgValue::from(schedule.encode())));
        }
        if !self.frac_exclude.is_empty() {
            flags.push(("frac-list", ArgValue::from(self.frac_exclude.encode_fractional())));
        }
        if !self.frac_exclude_total.is_empty() {
            flags.push((
                "frac-list-total",
                ArgValue::from(self.frac_exclude_total.encode_fractional()),
            ));
        }
        if !self.strip_attrs.is_empty() {
            flags.push(("strip-list", ArgValue::from(self.strip_attrs.members())));
        }
        flags
    }

    fn diff_flags(
        &self,
        pending: &Self,
    ) -> std::result::Result<Vec<(&'static str, ArgValue)>, ValidationError> {
        pending.validate()?;
        let mut out = Vec::new();
        diff_value(&mut out, "host", self.host.trim(), pending.host.trim());
        diff_value(
            &mut out,
            "port",
            &self.port.map(|p| p.to_string()).unwrap_or_default(),
            &pending.port.map(|p| p.to_string()).unwrap_or_default(),
        );
        diff_value(
            &mut out,
            "conn-protocol",
            self.transport.map(Transport::as_arg).unwrap_or_default(),
            pending.transport.map(Transport::as_arg).unwrap_or_default(),
        );
        diff_value(
            &mut out,
            "bind-method",
            self.bind_method.map(BindMethod::as_arg).unwrap_or_default(),
            pending.bind_method.map(BindMethod::as_arg).unwrap_or_default(),
        );
        diff_value(&mut out, "bind-dn", self.bind_dn.trim(), pending.bind_dn.trim());
        diff_secret(&mut out, "bind-passwd", &self.credential, &pending.credential);
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
        diff_value(
            &mut out,
            "frac-list-total",
            &self.frac_exclude_total.encode_fractional(),
            &pending.frac_exclude_total.encode_fractional(),
        );
        diff_value(
            &mut out,
            "strip-list",
            &self.strip_attrs.members(),
            &pending.strip_attrs.members(),
        );
        Ok(out)
    }

    fn snapshot(suffix: String, agreements: Vec<Agreement>) -> Snapshot {
        Snapshot::Agreements { suffix, agreements }
    }
}
