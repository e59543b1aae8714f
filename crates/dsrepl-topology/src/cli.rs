//! Command-line front end of the controller.

use crate::agreement::{AgreementFields, BindMethod, Transport};
use crate::controller::ReplicationController;
use crate::fractional::AttrList;
use crate::lifecycle::{AgreementManager, AgreementSpec};
use crate::manager::NewManager;
use crate::poller::{PollOutcome, PollTicket};
use crate::replica::{
    ChangelogAttr, ChangelogSettings, EnableRequest, ReplicaAttr, ReplicaId, ReplicaRole,
    RoleRequest, SettingKey, Settings,
};
use crate::schedule::Schedule;
use crate::secret::Secret;
use crate::winsync::{WinsyncAddress, WinsyncFields};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dsrepl")]
#[command(about = "Replication topology controller for 389 Directory Server", long_about = None)]
pub struct Cli {
    /// Controller configuration file (.toml or .json).
    #[arg(short, long, default_value = "/etc/dsrepl/dsrepl.toml")]
    pub config: PathBuf,

    /// Server id or LDAP URL, overriding the configuration file.
    #[arg(short, long, env = "DSREPL_INSTANCE")]
    pub instance: Option<String>,

    /// Log in JSON.
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Replica role and configuration.
    Replica {
        #[command(subcommand)]
        cmd: ReplicaCmd,
    },
    /// Replication managers.
    Manager {
        #[command(subcommand)]
        cmd: ManagerCmd,
    },
    /// Replication changelog.
    Changelog {
        #[command(subcommand)]
        cmd: ChangelogCmd,
    },
    /// Replication agreements.
    Agmt {
        #[command(subcommand)]
        cmd: AgmtCmd,
    },
    /// Windows sync agreements.
    Winsync {
        #[command(subcommand)]
        cmd: WinsyncCmd,
    },
    /// CleanAllRUV tasks.
    Cleanallruv {
        #[command(subcommand)]
        cmd: CleanAllRuvCmd,
    },
}

#[derive(Subcommand)]
pub enum ReplicaCmd {
    Show {
        #[arg(long)]
        suffix: String,
    },
    Enable {
        #[arg(long)]
        suffix: String,
        #[arg(long)]
        role: ReplicaRole,
        #[arg(long, default_value = "")]
        replica_id: String,
        #[arg(long)]
        bind_dn: Option<String>,
        #[arg(long, env = "DSREPL_BIND_PASSWD", hide_env_values = true)]
        bind_passwd: Option<String>,
        #[arg(long, default_value = "")]
        bind_group_dn: String,
    },
    Disable {
        #[arg(long)]
        suffix: String,
    },
    SetRole {
        #[arg(long)]
        suffix: String,
        #[arg(long)]
        newrole: ReplicaRole,
        #[arg(long, default_value = "")]
        replica_id: String,
    },
    /// Change tuning attributes, e.g. `--attr repl-purge-delay=3600`. An
    /// empty value clears the attribute.
    Set {
        #[arg(long)]
        suffix: String,
        #[arg(long)]
        replica_id: Option<String>,
        #[arg(long = "attr", value_parser = parse_key_val)]
        attrs: Vec<(String, String)>,
    },
}

#[derive(Subcommand)]
pub enum ManagerCmd {
    Create {
        #[arg(long)]
        suffix: String,
        #[arg(long)]
        name: String,
        #[arg(long, env = "DSREPL_MANAGER_PASSWD", hide_env_values = true)]
        passwd: String,
    },
    Delete {
        #[arg(long)]
        suffix: String,
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand)]
pub enum ChangelogCmd {
    Create {
        #[arg(long)]
        suffix: String,
        #[arg(long = "attr", value_parser = parse_key_val)]
        attrs: Vec<(String, String)>,
    },
    Show {
        #[arg(long)]
        suffix: String,
    },
    Set {
        #[arg(long)]
        suffix: String,
        #[arg(long = "attr", value_parser = parse_key_val)]
        attrs: Vec<(String, String)>,
    },
    Delete {
        #[arg(long)]
        suffix: String,
    },
}

#[derive(Args, Clone)]
pub struct Target {
    #[arg(long)]
    pub suffix: String,
    pub name: String,
}

#[derive(Args, Clone, Default)]
pub struct AgmtArgs {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub conn_protocol: Option<Transport>,
    #[arg(long)]
    pub bind_method: Option<BindMethod>,
    #[arg(long)]
    pub bind_dn: Option<String>,
    #[arg(long, env = "DSREPL_BIND_PASSWD", hide_env_values = true)]
    pub bind_passwd: Option<String>,
    /// `HHMM-HHMM <days>`; empty replicates continuously.
    #[arg(long)]
    pub schedule: Option<String>,
    #[arg(long)]
    pub frac_list: Option<String>,
    #[arg(long)]
    pub frac_list_total: Option<String>,
    #[arg(long)]
    pub strip_list: Option<String>,
}

#[derive(Args, Clone, Default)]
pub struct WinsyncArgs {
    /// `ldap[s]://host:port[/subtree] [maxConns,maxOps,timeout,ldapVersion,connLifetime,startTLS]`
    #[arg(long)]
    pub server_url: Option<String>,
    #[arg(long)]
    pub bind_dn: Option<String>,
    #[arg(long, env = "DSREPL_BIND_PASSWD", hide_env_values = true)]
    pub bind_passwd: Option<String>,
    #[arg(long)]
    pub win_domain: Option<String>,
    #[arg(long)]
    pub win_subtree: Option<String>,
    #[arg(long)]
    pub ds_subtree: Option<String>,
    #[arg(long)]
    pub sync_users: Option<bool>,
    #[arg(long)]
    pub sync_groups: Option<bool>,
    #[arg(long)]
    pub sync_interval: Option<String>,
    #[arg(long)]
    pub one_way_sync: Option<String>,
    #[arg(long)]
    pub schedule: Option<String>,
    #[arg(long)]
    pub frac_list: Option<String>,
}

#[derive(Subcommand)]
pub enum AgmtCmd {
    List {
        #[arg(long)]
        suffix: String,
    },
    Create {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        args: AgmtArgs,
        /// Start a total update right away and wait for it.
        #[arg(long)]
        init: bool,
    },
    Set {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        args: AgmtArgs,
    },
    Delete(Target),
    Enable(Target),
    Disable(Target),
    Init(Target),
    Poke(Target),
}

#[derive(Subcommand)]
pub enum WinsyncCmd {
    List {
        #[arg(long)]
        suffix: String,
    },
    Create {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        args: WinsyncArgs,
        /// Start a total update right away and wait for it.
        #[arg(long)]
        init: bool,
    },
    Set {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        args: WinsyncArgs,
    },
    Delete(Target),
    Enable(Target),
    Disable(Target),
    Init(Target),
    Poke(Target),
}

#[derive(Subcommand)]
pub enum CleanAllRuvCmd {
    Run {
        #[arg(long)]
        suffix: String,
        #[arg(long, default_value = "")]
        replica_id: String,
        #[arg(long)]
        force_cleaning: bool,
    },
    List {
        #[arg(long)]
        suffix: String,
    },
    Abort {
        #[arg(long)]
        suffix: String,
        #[arg(long)]
        replica_id: String,
    },
}

/// Agreement subcommand independent of the flavor.
enum Action<A> {
    List(String),
    Create(Target, A, bool),
    Set(Target, A),
    Delete(Target),
    Enable(Target),
    Disable(Target),
    Init(Target),
    Poke(Target),
}

impl From<AgmtCmd> for Action<AgmtArgs> {
    fn from(cmd: AgmtCmd) -> Self {
        match cmd {
            AgmtCmd::List { suffix } => Action::List(suffix),
            AgmtCmd::Create { target, args, init } => Action::Create(target, args, init),
            AgmtCmd::Set { target, args } => Action::Set(target, args),
            AgmtCmd::Delete(t) => Action::Delete(t),
            AgmtCmd::Enable(t) => Action::Enable(t),
            AgmtCmd::Disable(t) => Action::Disable(t),
            AgmtCmd::Init(t) => Action::Init(t),
            AgmtCmd::Poke(t) => Action::Poke(t),
        }
    }
}

impl From<WinsyncCmd> for Action<WinsyncArgs> {
    fn from(cmd: WinsyncCmd) -> Self {
        match cmd {
            WinsyncCmd::List { suffix } => Action::List(suffix),
            WinsyncCmd::Create { target, args, init } => Action::Create(target, args, init),
            WinsyncCmd::Set { target, args } => Action::Set(target, args),
            WinsyncCmd::Delete(t) => Action::Delete(t),
            WinsyncCmd::Enable(t) => Action::Enable(t),
            WinsyncCmd::Disable(t) => Action::Disable(t),
            WinsyncCmd::Init(t) => Action::Init(t),
            WinsyncCmd::Poke(t) => Action::Poke(t),
        }
    }
}

/// Options that edit the fields of one agreement flavor. Absent options
/// leave a field alone; empty strings clear it.
trait ApplyFields<F> {
    fn apply(&self, fields: &mut F) -> Result<()>;
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|v| !v.is_empty())
}

fn parse_schedule(value: &str) -> Result<Option<Schedule>> {
    non_empty(value)
        .map(Schedule::decode)
        .transpose()
        .context("invalid --schedule")
}

impl ApplyFields<AgreementFields> for AgmtArgs {
    fn apply(&self, f: &mut AgreementFields) -> Result<()> {
        if let Some(host) = &self.host {
            f.host = host.trim().to_string();
        }
        if let Some(port) = self.port {
            f.port = Some(port);
        }
        if let Some(transport) = self.conn_protocol {
            f.transport = Some(transport);
        }
        if let Some(method) = self.bind_method {
            f.bind_method = Some(method);
        }
        if let Some(dn) = &self.bind_dn {
            f.bind_dn = dn.trim().to_string();
        }
        if let Some(passwd) = &self.bind_passwd {
            f.credential = Secret::new(passwd.as_str());
        }
        if let Some(schedule) = &self.schedule {
            f.schedule = parse_schedule(schedule)?;
        }
        if let Some(list) = &self.frac_list {
            f.frac_exclude = AttrList::decode_fractional(list);
        }
        if let Some(list) = &self.frac_list_total {
            f.frac_exclude_total = AttrList::decode_fractional(list);
        }
        if let Some(list) = &self.strip_list {
            f.strip_attrs = AttrList::decode_plain(list);
        }
        Ok(())
    }
}

impl ApplyFields<WinsyncFields> for WinsyncArgs {
    fn apply(&self, f: &mut WinsyncFields) -> Result<()> {
        if let Some(token) = &self.server_url {
            f.address = non_empty(token)
                .map(str::parse::<WinsyncAddress>)
                .transpose()?;
        }
        if let Some(dn) = &self.bind_dn {
            f.bind_dn = dn.trim().to_string();
        }
        if let Some(passwd) = &self.bind_passwd {
            f.credential = Secret::new(passwd.as_str());
        }
        if let Some(domain) = &self.win_domain {
            f.windows_domain = domain.trim().to_string();
        }
        if let Some(subtree) = &self.win_subtree {
            f.windows_subtree = subtree.trim().to_string();
        }
        if let Some(subtree) = &self.ds_subtree {
            f.directory_subtree = subtree.trim().to_string();
        }
        if let Some(on) = self.sync_users {
            f.sync_new_users = on;
        }
        if let Some(on) = self.sync_groups {
            f.sync_new_groups = on;
        }
        if let Some(interval) = &self.sync_interval {
            f.sync_interval = interval.trim().to_string();
        }
        if let Some(direction) = &self.one_way_sync {
            f.one_way_sync = direction.trim().to_string();
        }
        if let Some(schedule) = &self.schedule {
            f.schedule = parse_schedule(schedule)?;
        }
        if let Some(list) = &self.frac_list {
            f.frac_exclude = AttrList::decode_fractional(list);
        }
        Ok(())
    }
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))
}

/// Apply `--attr flag=value` pairs, matching keys against the set flags.
fn apply_attrs<K: SettingKey>(settings: &mut Settings<K>, attrs: &[(String, String)]) -> Result<()> {
    for (key, value) in attrs {
        let name = key.trim_start_matches('-');
        let Some(k) = K::ALL.iter().find(|k| k.flag() == name) else {
            let known: Vec<&str> = K::ALL.iter().map(|k| k.flag()).collect();
            bail!("unknown attribute {:?}, expected one of: {}", key, known.join(", "));
        };
        settings.set(*k, Some(value.as_str()));
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn wait_for(controller: &ReplicationController, ticket: PollTicket) -> Result<()> {
    let key = ticket.key().clone();
    let outcome = tokio::select! {
        outcome = ticket.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            controller.shutdown();
            bail!("interrupted while waiting for {} to initialize", key.name);
        }
    };
    match outcome {
        Some(PollOutcome::Initialized(status)) => {
            println!("{}", status);
            Ok(())
        }
        Some(PollOutcome::Failed(status)) => bail!("initialization of {} failed: {}", key.name, status),
        Some(PollOutcome::TimedOut(attempts)) => {
            bail!("initialization of {} still running after {} checks", key.name, attempts)
        }
        None => bail!("polling of {} was cancelled", key.name),
    }
}

async fn run_agreement<F, A>(
    controller: &ReplicationController,
    manager: &AgreementManager<F>,
    action: Action<A>,
) -> Result<()>
where
    F: AgreementSpec,
    A: ApplyFields<F>,
{
    match action {
        Action::List(suffix) => print_json(&manager.list(&suffix).await?),
        Action::Create(t, args, init) => {
            let mut fields = F::default();
            args.apply(&mut fields)?;
            let ticket = manager.create(&t.suffix, &t.name, &fields, init).await?;
            println!("created {}", t.name);
            match ticket {
                Some(ticket) => wait_for(controller, ticket).await,
                None => Ok(()),
            }
        }
        Action::Set(t, args) => {
            let mut edit = manager.get(&t.suffix, &t.name).await?;
            args.apply(&mut edit.pending)?;
            if manager.update(&edit).await? {
                println!("updated {}", t.name);
            } else {
                println!("nothing to change on {}", t.name);
            }
            Ok(())
        }
        Action::Delete(t) => manager.delete(&t.suffix, &t.name).await.map_err(Into::into),
        Action::Enable(t) => manager.enable(&t.suffix, &t.name).await.map_err(Into::into),
        Action::Disable(t) => manager.disable(&t.suffix, &t.name).await.map_err(Into::into),
        Action::Init(t) => {
            let ticket = manager.initialize(&t.suffix, &t.name).await?;
            wait_for(controller, ticket).await
        }
        Action::Poke(t) => manager.poke(&t.suffix, &t.name).await.map_err(Into::into),
    }
}

impl Cli {
    /// Execute the parsed command against `controller`.
    pub async fn run(self, controller: &ReplicationController) -> Result<()> {
        match self.command {
            Command::Replica { cmd } => replica(controller, cmd).await,
            Command::Manager { cmd } => manager(controller, cmd).await,
            Command::Changelog { cmd } => changelog(controller, cmd).await,
            Command::Agmt { cmd } => {
                run_agreement(controller, controller.agreements(), cmd.into()).await
            }
            Command::Winsync { cmd } => {
                run_agreement(controller, controller.winsync(), cmd.into()).await
            }
            Command::Cleanallruv { cmd } => cleanallruv(controller, cmd).await,
        }
    }
}

async fn replica(controller: &ReplicationController, cmd: ReplicaCmd) -> Result<()> {
    match cmd {
        ReplicaCmd::Show { suffix } => print_json(&controller.load_replica(&suffix).await?),
        ReplicaCmd::Enable {
            suffix,
            role,
            replica_id,
            bind_dn,
            bind_passwd,
            bind_group_dn,
        } => {
            let mut request = EnableRequest::new(role);
            request.replica_id = replica_id;
            request.bind_group = bind_group_dn;
            if let Some(dn) = bind_dn {
                let secret = Secret::new(bind_passwd.unwrap_or_default());
                request.manager = Some(NewManager {
                    dn,
                    confirm: secret.clone(),
                    secret,
                });
            }
            print_json(&controller.enable(&suffix, &request).await?)
        }
        ReplicaCmd::Disable { suffix } => print_json(&controller.disable(&suffix).await?),
        ReplicaCmd::SetRole {
            suffix,
            newrole,
            replica_id,
        } => {
            let mut request = RoleRequest::new(newrole);
            request.replica_id = replica_id;
            print_json(&controller.change_role(&suffix, &request).await?)
        }
        ReplicaCmd::Set {
            suffix,
            replica_id,
            attrs,
        } => {
            let current = controller.load_replica(&suffix).await?;
            let mut pending = current.settings.clone();
            apply_attrs::<ReplicaAttr>(&mut pending, &attrs)?;
            let id = replica_id
                .as_deref()
                .map(ReplicaId::parse)
                .transpose()?;
            if controller.save_replica(&suffix, &pending, id).await? {
                print_json(&controller.replica(&suffix))
            } else {
                println!("nothing to change");
                Ok(())
            }
        }
    }
}

async fn manager(controller: &ReplicationController, cmd: ManagerCmd) -> Result<()> {
    match cmd {
        ManagerCmd::Create {
            suffix,
            name,
            passwd,
        } => {
            let secret = Secret::new(passwd);
            let request = NewManager {
                dn: name,
                confirm: secret.clone(),
                secret,
            };
            print_json(&controller.create_manager(&suffix, &request).await?.managers)
        }
        ManagerCmd::Delete { suffix, name } => {
            print_json(&controller.delete_manager(&suffix, &name).await?.managers)
        }
    }
}

async fn changelog(controller: &ReplicationController, cmd: ChangelogCmd) -> Result<()> {
    match cmd {
        ChangelogCmd::Create { suffix, attrs } => {
            let mut settings = ChangelogSettings::default();
            apply_attrs::<ChangelogAttr>(&mut settings, &attrs)?;
            print_json(&controller.create_changelog(&suffix, &settings).await?.changelog)
        }
        ChangelogCmd::Show { suffix } => print_json(&controller.load_changelog(&suffix).await?),
        ChangelogCmd::Set { suffix, attrs } => {
            let Some(mut pending) = controller.load_changelog(&suffix).await? else {
                bail!("no changelog on {}; create it first", suffix);
            };
            apply_attrs::<ChangelogAttr>(&mut pending, &attrs)?;
            if controller.save_changelog(&suffix, &pending).await? {
                print_json(&controller.replica(&suffix).and_then(|cfg| cfg.changelog))
            } else {
                println!("nothing to change");
                Ok(())
            }
        }
        ChangelogCmd::Delete { suffix } => {
            controller.delete_changelog(&suffix).await?;
            Ok(())
        }
    }
}

async fn cleanallruv(controller: &ReplicationController, cmd: CleanAllRuvCmd) -> Result<()> {
    let tasks = controller.cleanallruv();
    match cmd {
        CleanAllRuvCmd::Run {
            suffix,
            replica_id,
            force_cleaning,
        } => print_json(&tasks.launch(&suffix, &replica_id, force_cleaning).await?),
        CleanAllRuvCmd::List { suffix } => print_json(&tasks.refresh_list(&suffix).await?),
        CleanAllRuvCmd::Abort { suffix, replica_id } => {
            tasks.abort(&suffix, &replica_id).await?;
            println!("abort requested for replica id {}", replica_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_agmt_create() {
        let cli = Cli::try_parse_from([
            "dsrepl",
            "agmt",
            "create",
            "--suffix",
            "dc=example,dc=com",
            "to-replica2",
            "--host",
            "replica2.example.com",
            "--port",
            "636",
            "--conn-protocol",
            "LDAPS",
            "--bind-method",
            "SIMPLE",
            "--bind-dn",
            "cn=replication manager,cn=config",
            "--init",
        ])
        .unwrap();
        let Command::Agmt {
            cmd: AgmtCmd::Create { target, args, init },
        } = cli.command
        else {
            panic!("wrong subcommand");
        };
        assert_eq!(target.name, "to-replica2");
        assert!(init);
        let mut fields = AgreementFields::default();
        args.apply(&mut fields).unwrap();
        assert_eq!(fields.port, Some(636));
        assert_eq!(fields.transport, Some(Transport::Ldaps));
        assert_eq!(fields.bind_method, Some(BindMethod::Simple));
    }

    #[test]
    fn test_apply_clears_with_empty_value() {
        let mut fields = AgreementFields {
            schedule: Some(Schedule::decode("0800-1700 12345").unwrap()),
            ..Default::default()
        };
        let args = AgmtArgs {
            schedule: Some(String::new()),
            frac_list: Some("mail sn".to_string()),
            ..Default::default()
        };
        args.apply(&mut fields).unwrap();
        assert!(fields.schedule.is_none());
        assert!(fields.frac_exclude.contains("mail"));
    }

    #[test]
    fn test_apply_attrs() {
        let mut settings = ChangelogSettings::default();
        apply_attrs(
            &mut settings,
            &[("max-age".to_string(), "7d".to_string())],
        )
        .unwrap();
        assert_eq!(settings.get(ChangelogAttr::MaxAge), Some("7d"));
        assert!(apply_attrs(&mut settings, &[("bogus".to_string(), "1".to_string())]).is_err());
        assert!(parse_key_val("no-separator").is_err());
    }
}
