//! Replica role, identity and tuning attributes of one suffix.
//!
//! Role changes are planned here as pure functions; the controller executes
//! them. Every scalar attribute is kept as an optional string so a save can
//! be diffed against the last-loaded baseline and batched into one command.

use crate::entry::Entry;
use crate::error::{Result, TopologyError, ValidationError};
use crate::gateway::{ArgValue, Command, Operation};
use crate::manager::{check_dn, ManagerRegistry, NewManager};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Replication role of a suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaRole {
    /// No replication.
    Disabled,
    /// Read-only replica.
    Consumer,
    /// Forwards updates; no direct client writes.
    Hub,
    /// Read-write supplier.
    Master,
}

impl ReplicaRole {
    /// Role derived from the replica entry.
    pub fn from_entry(entry: &Entry) -> Self {
        if entry.first("nsds5replicatype") == Some("3") {
            ReplicaRole::Master
        } else if entry.first("nsds5flags") == Some("1") {
            ReplicaRole::Hub
        } else {
            ReplicaRole::Consumer
        }
    }

    /// True for every role but `Disabled`.
    pub fn is_enabled(self) -> bool {
        self != ReplicaRole::Disabled
    }

    fn rank(self) -> u8 {
        match self {
            ReplicaRole::Disabled => 0,
            ReplicaRole::Consumer => 1,
            ReplicaRole::Hub => 2,
            ReplicaRole::Master => 3,
        }
    }

    /// Value of the tool's `--role`/`--newrole` flags.
    pub fn as_arg(self) -> &'static str {
        match self {
            ReplicaRole::Disabled => "disabled",
            ReplicaRole::Consumer => "consumer",
            ReplicaRole::Hub => "hub",
            ReplicaRole::Master => "master",
        }
    }
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

impl FromStr for ReplicaRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(ReplicaRole::Disabled),
            "consumer" => Ok(ReplicaRole::Consumer),
            "hub" => Ok(ReplicaRole::Hub),
            "master" | "supplier" => Ok(ReplicaRole::Master),
            other => Err(format!("unknown replica role {:?}", other)),
        }
    }
}

/// Replica id of a master, in `[1, 65534]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ReplicaId(u16);

impl ReplicaId {
    /// Smallest valid id.
    pub const MIN: u16 = 1;
    /// Largest valid id; 65535 is reserved for read-only replicas.
    pub const MAX: u16 = 65534;

    /// Parse user input.
    pub fn parse(input: &str) -> std::result::Result<Self, ValidationError> {
        let out_of_range = || ValidationError::ReplicaIdOutOfRange {
            value: input.to_string(),
        };
        let n: u32 = input.trim().parse().map_err(|_| out_of_range())?;
        if n < u32::from(Self::MIN) || n > u32::from(Self::MAX) {
            return Err(out_of_range());
        }
        Ok(ReplicaId(n as u16))
    }

    /// Numeric value.
    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scalar attribute with a directory name and a `set` flag.
pub trait SettingKey: Copy + Ord + fmt::Debug + Serialize + 'static {
    /// Every key, in display order.
    const ALL: &'static [Self];
    /// Directory attribute name.
    fn attribute(self) -> &'static str;
    /// Flag of the `set` command, without dashes.
    fn flag(self) -> &'static str;
}

/// Tuning attributes of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaAttr {
    /// Changelog purge delay.
    PurgeDelay,
    /// Tombstone purge interval.
    TombstonePurgeInterval,
    /// Precise tombstone purging (`on`/`off`).
    PrecisePurging,
    /// Bind DN group.
    BindDnGroup,
    /// Bind DN group check interval.
    BindDnGroupCheckInterval,
    /// Replication protocol timeout.
    ProtocolTimeout,
    /// Minimum backoff.
    BackoffMin,
    /// Maximum backoff.
    BackoffMax,
    /// Replica release timeout.
    ReleaseTimeout,
}

impl SettingKey for ReplicaAttr {
    const ALL: &'static [Self] = &[
        ReplicaAttr::PurgeDelay,
        ReplicaAttr::TombstonePurgeInterval,
        ReplicaAttr::PrecisePurging,
        ReplicaAttr::BindDnGroup,
        ReplicaAttr::BindDnGroupCheckInterval,
        ReplicaAttr::ProtocolTimeout,
        ReplicaAttr::BackoffMin,
        ReplicaAttr::BackoffMax,
        ReplicaAttr::ReleaseTimeout,
    ];

    fn attribute(self) -> &'static str {
        match self {
            ReplicaAttr::PurgeDelay => "nsds5replicapurgedelay",
            ReplicaAttr::TombstonePurgeInterval => "nsds5replicatombstonepurgeinterval",
            ReplicaAttr::PrecisePurging => "nsds5replicaprecisetombstonepurging",
            ReplicaAttr::BindDnGroup => "nsds5replicabinddngroup",
            ReplicaAttr::BindDnGroupCheckInterval => "nsds5replicabinddngroupcheckinterval",
            ReplicaAttr::ProtocolTimeout => "nsds5replicaprotocoltimeout",
            ReplicaAttr::BackoffMin => "nsds5replicabackoffmin",
            ReplicaAttr::BackoffMax => "nsds5replicabackoffmax",
            ReplicaAttr::ReleaseTimeout => "nsds5replicareleasetimeout",
        }
    }

    fn flag(self) -> &'static str {
        match self {
            ReplicaAttr::PurgeDelay => "repl-purge-delay",
            ReplicaAttr::TombstonePurgeInterval => "repl-tombstone-purge-interval",
            ReplicaAttr::PrecisePurging => "repl-fast-tombstone-purging",
            ReplicaAttr::BindDnGroup => "repl-bind-group",
            ReplicaAttr::BindDnGroupCheckInterval => "repl-bind-group-interval",
            ReplicaAttr::ProtocolTimeout => "repl-protocol-timeout",
            ReplicaAttr::BackoffMin => "repl-backoff-min",
            ReplicaAttr::BackoffMax => "repl-backoff-max",
            ReplicaAttr::ReleaseTimeout => "repl-release-timeout",
        }
    }
}

/// Changelog attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangelogAttr {
    /// Changelog directory.
    Dir,
    /// Maximum number of entries.
    MaxEntries,
    /// Maximum age.
    MaxAge,
    /// Database compaction interval.
    CompactInterval,
    /// Trimming interval.
    TrimInterval,
}

impl SettingKey for ChangelogAttr {
    const ALL: &'static [Self] = &[
        ChangelogAttr::Dir,
        ChangelogAttr::MaxEntries,
        ChangelogAttr::MaxAge,
        ChangelogAttr::CompactInterval,
        ChangelogAttr::TrimInterval,
    ];

    fn attribute(self) -> &'static str {
        match self {
            ChangelogAttr::Dir => "nsslapd-changelogdir",
            ChangelogAttr::MaxEntries => "nsslapd-changelogmaxentries",
            ChangelogAttr::MaxAge => "nsslapd-changelogmaxage",
            ChangelogAttr::CompactInterval => "nsslapd-changelogcompactdb-interval",
            ChangelogAttr::TrimInterval => "nsslapd-changelogtrim-interval",
        }
    }

    fn flag(self) -> &'static str {
        match self {
            ChangelogAttr::Dir => "cl-dir",
            ChangelogAttr::MaxEntries => "max-entries",
            ChangelogAttr::MaxAge => "max-age",
            ChangelogAttr::CompactInterval => "compact-interval",
            ChangelogAttr::TrimInterval => "trim-interval",
        }
    }
}

/// Independently settable and clearable scalar attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings<K: SettingKey> {
    values: BTreeMap<K, String>,
}

impl<K: SettingKey> Default for Settings<K> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }
}

/// Replica tuning attributes.
pub type ReplicaSettings = Settings<ReplicaAttr>;
/// Changelog attributes.
pub type ChangelogSettings = Settings<ChangelogAttr>;

impl<K: SettingKey> Settings<K> {
    /// Values found in `entry`.
    pub fn from_entry(entry: &Entry) -> Self {
        let mut settings = Self::default();
        for key in K::ALL {
            if let Some(v) = entry.first_nonempty(key.attribute()) {
                settings.values.insert(*key, v.to_string());
            }
        }
        settings
    }

    /// Current value of `key`.
    pub fn get(&self, key: K) -> Option<&str> {
        self.values.get(&key).map(String::as_str)
    }

    /// Set or clear `key`. An empty value clears.
    pub fn set(&mut self, key: K, value: Option<&str>) {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => {
                self.values.insert(key, v.to_string());
            }
            None => {
                self.values.remove(&key);
            }
        }
    }

    /// True when nothing is set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Changed keys as `set` flags; cleared keys become [`ArgValue::Delete`].
    pub fn diff(&self, pending: &Self) -> Vec<(&'static str, ArgValue)> {
        K::ALL
            .iter()
            .filter(|k| self.get(**k) != pending.get(**k))
            .map(|k| {
                let value = match pending.get(*k) {
                    Some(v) => ArgValue::from(v),
                    None => ArgValue::Delete,
                };
                (k.flag(), value)
            })
            .collect()
    }

    /// Flags establishing every set value, for create commands.
    pub fn create_flags(&self) -> Vec<(&'static str, ArgValue)> {
        self.values
            .iter()
            .map(|(k, v)| (k.flag(), ArgValue::from(v.as_str())))
            .collect()
    }
}

impl ReplicaSettings {
    /// Precise tombstone purging, when set.
    pub fn precise_purging(&self) -> Option<bool> {
        self.get(ReplicaAttr::PrecisePurging)
            .map(|v| v.eq_ignore_ascii_case("on"))
    }

    /// Set precise tombstone purging.
    pub fn set_precise_purging(&mut self, on: bool) {
        self.set(ReplicaAttr::PrecisePurging, Some(if on { "on" } else { "off" }));
    }
}

/// Replication state of one suffix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaConfig {
    /// Suffix served.
    pub suffix: String,
    /// Current role.
    pub role: ReplicaRole,
    /// Set iff `role` is `Master`.
    pub replica_id: Option<ReplicaId>,
    /// Tuning attributes.
    pub settings: ReplicaSettings,
    /// Bind managers.
    pub managers: ManagerRegistry,
    /// `None` until the changelog exists.
    pub changelog: Option<ChangelogSettings>,
}

impl ReplicaConfig {
    /// State of a suffix without replication.
    pub fn disabled(suffix: &str) -> Self {
        Self {
            suffix: suffix.to_string(),
            role: ReplicaRole::Disabled,
            replica_id: None,
            settings: ReplicaSettings::default(),
            managers: ManagerRegistry::default(),
            changelog: None,
        }
    }

    /// Decode the answer of `replication get`.
    pub fn from_entry(suffix: &str, entry: &Entry) -> Result<Self> {
        let role = ReplicaRole::from_entry(entry);
        let replica_id = if role == ReplicaRole::Master {
            let raw = entry.first("nsds5replicaid").unwrap_or_default();
            let id = ReplicaId::parse(raw).map_err(|e| TopologyError::MalformedPayload {
                msg: e.to_string(),
            })?;
            Some(id)
        } else {
            None
        };
        let mut managers = ManagerRegistry::default();
        managers.sync(entry.values("nsds5replicabinddn"));
        Ok(Self {
            suffix: suffix.to_string(),
            role,
            replica_id,
            settings: ReplicaSettings::from_entry(entry),
            managers,
            changelog: None,
        })
    }

    /// Whether a manager or a bind group is configured.
    pub fn has_bind_identity(&self) -> bool {
        self.managers.has_registered() || self.settings.get(ReplicaAttr::BindDnGroup).is_some()
    }
}

/// Request to enable replication on a disabled suffix.
#[derive(Debug, Clone)]
pub struct EnableRequest {
    /// Target role.
    pub role: ReplicaRole,
    /// Raw replica id input; required for masters.
    pub replica_id: String,
    /// Manager to create and register together with the replica.
    pub manager: Option<NewManager>,
    /// Bind DN group.
    pub bind_group: String,
}

impl EnableRequest {
    /// Enable request for `role` with nothing else set.
    pub fn new(role: ReplicaRole) -> Self {
        Self {
            role,
            replica_id: String::new(),
            manager: None,
            bind_group: String::new(),
        }
    }

    /// Client-side checks.
    pub fn validate(&self) -> std::result::Result<Option<ReplicaId>, ValidationError> {
        let manager = self.manager.as_ref().filter(|m| !m.dn.trim().is_empty());
        let id = match self.role {
            ReplicaRole::Disabled => {
                return Err(ValidationError::IllegalTransition {
                    from: ReplicaRole::Disabled.to_string(),
                    to: ReplicaRole::Disabled.to_string(),
                })
            }
            ReplicaRole::Master => Some(ReplicaId::parse(&self.replica_id)?),
            ReplicaRole::Hub | ReplicaRole::Consumer => {
                if manager.is_none() && self.bind_group.trim().is_empty() {
                    return Err(ValidationError::MissingBindIdentity);
                }
                None
            }
        };
        if let Some(m) = manager {
            m.validate()?;
        }
        check_dn("bind group DN", self.bind_group.trim())?;
        Ok(id)
    }

    /// The `replication enable` command.
    pub(crate) fn command(&self, suffix: &str, id: Option<ReplicaId>) -> Command {
        let mut cmd =
            Command::for_suffix(Operation::ReplicationEnable, suffix).flag("role", self.role.as_arg());
        if let Some(id) = id {
            cmd = cmd.flag("replica-id", id.to_string());
        }
        if let Some(m) = self.manager.as_ref().filter(|m| !m.dn.trim().is_empty()) {
            cmd = cmd
                .flag("bind-dn", m.dn.trim())
                .secret_flag("bind-passwd", &m.secret);
        }
        if !self.bind_group.trim().is_empty() {
            cmd = cmd.flag("bind-group-dn", self.bind_group.trim());
        }
        cmd
    }
}

/// Request to move an enabled replica to another enabled role.
#[derive(Debug, Clone)]
pub struct RoleRequest {
    /// Target role.
    pub role: ReplicaRole,
    /// Raw replica id input; required when promoting to master.
    pub replica_id: String,
    /// Tuning edits saved once the role change went through.
    pub settings: Option<ReplicaSettings>,
}

impl RoleRequest {
    /// Request for `role` with nothing else set.
    pub fn new(role: ReplicaRole) -> Self {
        Self {
            role,
            replica_id: String::new(),
            settings: None,
        }
    }
}

/// One edge of the role graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    /// Disabled to an enabled role.
    Enable(ReplicaRole),
    /// Any enabled role to Disabled.
    Disable,
    /// Towards master.
    Promote(ReplicaRole),
    /// Away from master.
    Demote(ReplicaRole),
}

impl RoleChange {
    /// The edge from `from` to `to`, `None` when they are equal.
    pub fn plan(from: ReplicaRole, to: ReplicaRole) -> Option<RoleChange> {
        if from == to {
            None
        } else if from == ReplicaRole::Disabled {
            Some(RoleChange::Enable(to))
        } else if to == ReplicaRole::Disabled {
            Some(RoleChange::Disable)
        } else if to.rank() > from.rank() {
            Some(RoleChange::Promote(to))
        } else {
            Some(RoleChange::Demote(to))
        }
    }
}

/// Batched `replication set`, or `None` when nothing changed.
pub(crate) fn settings_command(
    suffix: &str,
    baseline: &ReplicaSettings,
    pending: &ReplicaSettings,
    replica_id: Option<(Option<ReplicaId>, ReplicaId)>,
) -> Option<Command> {
    let mut changes = baseline.diff(pending);
    if let Some((old, new)) = replica_id {
        if old != Some(new) {
            changes.push(("replica-id", ArgValue::from(new.to_string())));
        }
    }
    if changes.is_empty() {
        return None;
    }
    let mut cmd = Command::for_suffix(Operation::ReplicationSet, suffix);
    for (flag, value) in changes {
        cmd = cmd.flag(flag, value);
    }
    Some(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::Secret;

    #[test]
    fn test_role_from_entry() {
        let master = Entry::new().with("nsds5replicatype", ["3"]).with("nsds5flags", ["1"]);
        let hub = Entry::new().with("nsds5replicatype", ["2"]).with("nsds5flags", ["1"]);
        let consumer = Entry::new().with("nsds5replicatype", ["2"]).with("nsds5flags", ["0"]);
        assert_eq!(ReplicaRole::from_entry(&master), ReplicaRole::Master);
        assert_eq!(ReplicaRole::from_entry(&hub), ReplicaRole::Hub);
        assert_eq!(ReplicaRole::from_entry(&consumer), ReplicaRole::Consumer);
    }

    #[test]
    fn test_replica_id_bounds() {
        assert!(ReplicaId::parse("0").is_err());
        assert!(ReplicaId::parse("65535").is_err());
        assert!(ReplicaId::parse("-1").is_err());
        assert!(ReplicaId::parse("").is_err());
        assert!(ReplicaId::parse("abc").is_err());
        assert_eq!(ReplicaId::parse("1").unwrap().get(), 1);
        assert_eq!(ReplicaId::parse(" 65534 ").unwrap().get(), 65534);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Supplier".parse::<ReplicaRole>().unwrap(), ReplicaRole::Master);
        assert_eq!("hub".parse::<ReplicaRole>().unwrap(), ReplicaRole::Hub);
        assert!("leader".parse::<ReplicaRole>().is_err());
    }

    #[test]
    fn test_plan_edges() {
        use ReplicaRole::*;
        assert_eq!(RoleChange::plan(Hub, Hub), None);
        assert_eq!(RoleChange::plan(Disabled, Hub), Some(RoleChange::Enable(Hub)));
        assert_eq!(RoleChange::plan(Master, Disabled), Some(RoleChange::Disable));
        assert_eq!(RoleChange::plan(Consumer, Hub), Some(RoleChange::Promote(Hub)));
        assert_eq!(RoleChange::plan(Consumer, Master), Some(RoleChange::Promote(Master)));
        assert_eq!(RoleChange::plan(Master, Consumer), Some(RoleChange::Demote(Consumer)));
        assert_eq!(RoleChange::plan(Hub, Consumer), Some(RoleChange::Demote(Consumer)));
    }

    #[test]
    fn test_enable_needs_bind_identity() {
        for role in [ReplicaRole::Hub, ReplicaRole::Consumer] {
            assert_eq!(
                EnableRequest::new(role).validate(),
                Err(ValidationError::MissingBindIdentity)
            );
        }
        let mut req = EnableRequest::new(ReplicaRole::Consumer);
        req.bind_group = "cn=repl group,ou=groups,dc=example,dc=com".to_string();
        assert_eq!(req.validate(), Ok(None));

        req.bind_group = "not a dn".to_string();
        assert!(matches!(req.validate(), Err(ValidationError::MalformedDn { .. })));
    }

    #[test]
    fn test_enable_master_command() {
        let mut req = EnableRequest::new(ReplicaRole::Master);
        req.replica_id = "7".to_string();
        req.manager = Some(NewManager {
            dn: "cn=replication manager,cn=config".to_string(),
            secret: Secret::new("pw"),
            confirm: Secret::new("pw"),
        });
        let id = req.validate().unwrap();
        let cmd = req.command("dc=example,dc=com", id);
        assert_eq!(cmd.operation, Operation::ReplicationEnable);
        assert_eq!(cmd.named_arg("role").and_then(ArgValue::as_str), Some("master"));
        assert_eq!(cmd.named_arg("replica-id").and_then(ArgValue::as_str), Some("7"));
        assert_eq!(cmd.named_arg("bind-passwd").map(ArgValue::render), Some("pw"));
        assert!(cmd.named_arg("bind-group-dn").is_none());
    }

    #[test]
    fn test_config_from_entry() {
        let entry = Entry::new()
            .with("nsds5replicatype", ["3"])
            .with("nsds5replicaid", ["12"])
            .with("nsds5replicabinddn", ["cn=m1,cn=config"])
            .with("nsds5replicapurgedelay", ["604800"])
            .with("nsds5replicaprecisetombstonepurging", ["on"]);
        let cfg = ReplicaConfig::from_entry("dc=example,dc=com", &entry).unwrap();
        assert_eq!(cfg.role, ReplicaRole::Master);
        assert_eq!(cfg.replica_id.map(ReplicaId::get), Some(12));
        assert!(cfg.has_bind_identity());
        assert_eq!(cfg.settings.get(ReplicaAttr::PurgeDelay), Some("604800"));
        assert_eq!(cfg.settings.precise_purging(), Some(true));

        let bad = Entry::new().with("nsds5replicatype", ["3"]).with("nsds5replicaid", ["0"]);
        assert!(ReplicaConfig::from_entry("dc=x", &bad).is_err());
    }

    #[test]
    fn test_settings_diff() {
        let mut base = ReplicaSettings::default();
        base.set(ReplicaAttr::PurgeDelay, Some("100"));
        base.set(ReplicaAttr::BackoffMin, Some("3"));
        let same = base.clone();
        assert!(base.diff(&same).is_empty());
        assert!(settings_command("dc=x", &base, &same, None).is_none());

        let mut pending = base.clone();
        pending.set(ReplicaAttr::PurgeDelay, Some("200"));
        pending.set(ReplicaAttr::BackoffMin, Some(""));
        pending.set_precise_purging(false);
        let cmd = settings_command("dc=x", &base, &pending, None).unwrap();
        assert_eq!(cmd.named.len(), 3);
        assert_eq!(
            cmd.named_arg("repl-purge-delay").and_then(ArgValue::as_str),
            Some("200")
        );
        assert_eq!(cmd.named_arg("repl-backoff-min"), Some(&ArgValue::Delete));
        assert_eq!(
            cmd.named_arg("repl-fast-tombstone-purging").and_then(ArgValue::as_str),
            Some("off")
        );
    }

    #[test]
    fn test_settings_command_replica_id() {
        let s = ReplicaSettings::default();
        let id = ReplicaId::parse("4").unwrap();
        assert!(settings_command("dc=x", &s, &s, Some((Some(id), id))).is_none());
        let cmd = settings_command("dc=x", &s, &s, Some((None, id))).unwrap();
        assert_eq!(cmd.named_arg("replica-id").and_then(ArgValue::as_str), Some("4"));
    }
}
