//! The command gateway: the only boundary the controller depends on.
//!
//! A [`Command`] names an administrative [`Operation`], an optional target
//! suffix, ordered positional arguments and named flag arguments. The gateway
//! answers with a [`Payload`] or a verbatim error message.

use crate::entry::Payload;
use crate::secret::Secret;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

/// Administrative operations issued by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Enable replication on a suffix.
    ReplicationEnable,
    /// Disable replication on a suffix (drops its agreements).
    ReplicationDisable,
    /// Promote a replica.
    ReplicationPromote,
    /// Demote a replica.
    ReplicationDemote,
    /// Read the replica configuration entry.
    ReplicationGet,
    /// Modify replica configuration attributes.
    ReplicationSet,
    /// Create a manager entry and register it as bind DN.
    CreateManager,
    /// Delete a manager entry.
    DeleteManager,
    /// Create the replication changelog.
    CreateChangelog,
    /// Read the changelog configuration.
    GetChangelog,
    /// Modify changelog configuration.
    SetChangelog,
    /// Remove the changelog.
    DeleteChangelog,
    /// List replication agreements.
    AgmtList,
    /// Read one agreement.
    AgmtGet,
    /// Create an agreement.
    AgmtCreate,
    /// Modify an agreement.
    AgmtSet,
    /// Delete an agreement.
    AgmtDelete,
    /// Resume an agreement.
    AgmtEnable,
    /// Pause an agreement.
    AgmtDisable,
    /// Start a total update.
    AgmtInit,
    /// Query total update progress.
    AgmtInitStatus,
    /// Send pending updates now.
    AgmtPoke,
    /// List winsync agreements.
    WinsyncList,
    /// Read one winsync agreement.
    WinsyncGet,
    /// Create a winsync agreement.
    WinsyncCreate,
    /// Modify a winsync agreement.
    WinsyncSet,
    /// Delete a winsync agreement.
    WinsyncDelete,
    /// Resume a winsync agreement.
    WinsyncEnable,
    /// Pause a winsync agreement.
    WinsyncDisable,
    /// Start a winsync total update.
    WinsyncInit,
    /// Query winsync total update progress.
    WinsyncInitStatus,
    /// Send pending winsync updates now.
    WinsyncPoke,
    /// Launch a CleanAllRUV task.
    CleanAllRuv,
    /// List CleanAllRUV tasks.
    ListCleanAllRuv,
    /// Abort a CleanAllRUV task.
    AbortCleanAllRuv,
}

impl Operation {
    /// The `dsconf` subcommand words for this operation.
    pub fn words(self) -> [&'static str; 2] {
        use Operation::*;
        match self {
            ReplicationEnable => ["replication", "enable"],
            ReplicationDisable => ["replication", "disable"],
            ReplicationPromote => ["replication", "promote"],
            ReplicationDemote => ["replication", "demote"],
            ReplicationGet => ["replication", "get"],
            ReplicationSet => ["replication", "set"],
            CreateManager => ["replication", "create-manager"],
            DeleteManager => ["replication", "delete-manager"],
            CreateChangelog => ["replication", "create-changelog"],
            GetChangelog => ["replication", "get-changelog"],
            SetChangelog => ["replication", "set-changelog"],
            DeleteChangelog => ["replication", "delete-changelog"],
            AgmtList => ["repl-agmt", "list"],
            AgmtGet => ["repl-agmt", "get"],
            AgmtCreate => ["repl-agmt", "create"],
            AgmtSet => ["repl-agmt", "set"],
            AgmtDelete => ["repl-agmt", "delete"],
            AgmtEnable => ["repl-agmt", "enable"],
            AgmtDisable => ["repl-agmt", "disable"],
            AgmtInit => ["repl-agmt", "init"],
            AgmtInitStatus => ["repl-agmt", "init-status"],
            AgmtPoke => ["repl-agmt", "poke"],
            WinsyncList => ["repl-winsync-agmt", "list"],
            WinsyncGet => ["repl-winsync-agmt", "get"],
            WinsyncCreate => ["repl-winsync-agmt", "create"],
            WinsyncSet => ["repl-winsync-agmt", "set"],
            WinsyncDelete => ["repl-winsync-agmt", "delete"],
            WinsyncEnable => ["repl-winsync-agmt", "enable"],
            WinsyncDisable => ["repl-winsync-agmt", "disable"],
            WinsyncInit => ["repl-winsync-agmt", "init"],
            WinsyncInitStatus => ["repl-winsync-agmt", "init-status"],
            WinsyncPoke => ["repl-winsync-agmt", "poke"],
            CleanAllRuv => ["repl-tasks", "cleanallruv"],
            ListCleanAllRuv => ["repl-tasks", "list-cleanruv-tasks"],
            AbortCleanAllRuv => ["repl-tasks", "abort-cleanallruv"],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [group, verb] = self.words();
        write!(f, "{} {}", group, verb)
    }
}

/// Value of a named argument.
#[derive(Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// Set the attribute to this value. An empty string is sent as-is.
    Value(String),
    /// A secret value; redacted in logs and `Debug`.
    Secret(Secret),
    /// Remove the attribute.
    Delete,
    /// A bare switch without a value.
    Switch,
}

impl ArgValue {
    /// Wire form of the value (`Delete` renders as empty).
    pub fn render(&self) -> &str {
        match self {
            ArgValue::Value(v) => v,
            ArgValue::Secret(s) => s.expose(),
            ArgValue::Delete | ArgValue::Switch => "",
        }
    }

    /// Plain value or `None` for secrets and deletes.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Value(v) => write!(f, "{:?}", v),
            ArgValue::Secret(_) => f.write_str("<secret>"),
            ArgValue::Delete => f.write_str("<delete>"),
            ArgValue::Switch => f.write_str("<switch>"),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Value(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Value(v)
    }
}

/// A structured administrative command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// What to do.
    pub operation: Operation,
    /// Target suffix, when the operation is suffix-scoped.
    pub suffix: Option<String>,
    /// Ordered positional arguments (typically the agreement name).
    pub positional: Vec<String>,
    /// Named arguments keyed by flag name without the leading dashes.
    pub named: BTreeMap<String, ArgValue>,
}

impl Command {
    /// New command without a suffix.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            suffix: None,
            positional: Vec::new(),
            named: BTreeMap::new(),
        }
    }

    /// New command targeting `suffix`.
    pub fn for_suffix(operation: Operation, suffix: &str) -> Self {
        let mut cmd = Self::new(operation);
        cmd.suffix = Some(suffix.to_string());
        cmd
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named argument.
    pub fn flag(mut self, name: &str, value: impl Into<ArgValue>) -> Self {
        self.named.insert(name.to_string(), value.into());
        self
    }

    /// Set a named argument carrying a secret.
    pub fn secret_flag(mut self, name: &str, secret: &Secret) -> Self {
        self.named
            .insert(name.to_string(), ArgValue::Secret(secret.clone()));
        self
    }

    /// Look up a named argument.
    pub fn named_arg(&self, name: &str) -> Option<&ArgValue> {
        self.named.get(name)
    }
}

/// Executes administrative commands against one directory instance.
#[async_trait]
pub trait CommandGateway: Send + Sync + 'static {
    /// Run `cmd`. `Err` carries the remote message verbatim.
    async fn execute(&self, cmd: Command) -> std::result::Result<Payload, String>;
}
