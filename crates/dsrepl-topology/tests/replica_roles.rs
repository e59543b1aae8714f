//! Replica role transitions, manager bootstrap and changelog handling
//! against a scripted gateway.

mod common;

use common::*;
use dsrepl_topology::{
    ArgValue, ChangelogAttr, EnableRequest, EntityKind, Entry, ManagerState, NewManager,
    Operation, Payload, ReplicaAttr, ReplicaId, ReplicaRole, RoleRequest, Secret, TopologyError,
    ValidationError,
};

fn rule(err: &TopologyError) -> &ValidationError {
    match err {
        TopologyError::Validation { source, .. } => source,
        other => panic!("expected a validation error, got {:?}", other),
    }
}

fn manager(dn: &str, secret: &str, confirm: &str) -> NewManager {
    NewManager {
        dn: dn.to_string(),
        secret: Secret::new(secret),
        confirm: Secret::new(confirm),
    }
}

#[tokio::test]
async fn test_consumer_and_hub_need_bind_identity() {
    for role in [ReplicaRole::Consumer, ReplicaRole::Hub] {
        let gw = gateway();
        let obs = RecordingObserver::new();
        let ctrl = controller(&gw, &obs);

        let err = ctrl.enable(SUFFIX, &EnableRequest::new(role)).await.unwrap_err();
        assert_eq!(rule(&err), &ValidationError::MissingBindIdentity);
        assert!(gw.calls().is_empty(), "{} issued gateway calls", role);
        assert_eq!(obs.errors().len(), 1);
    }
}

#[tokio::test]
async fn test_enable_with_bind_group_only() {
    let gw = gateway();
    gw.push_err(Operation::ReplicationGet, "No such object");
    gw.always(Operation::ReplicationGet, Ok(hub_entry(&[])));
    let ctrl = controller(&gw, &RecordingObserver::new());

    let mut request = EnableRequest::new(ReplicaRole::Hub);
    request.bind_group = "cn=repl group,ou=groups,dc=example,dc=com".to_string();
    let cfg = ctrl.enable(SUFFIX, &request).await.unwrap();
    assert_eq!(cfg.role, ReplicaRole::Hub);

    let cmd = gw.last(Operation::ReplicationEnable).unwrap();
    assert_eq!(cmd.named_arg("role"), Some(&ArgValue::from("hub")));
    assert!(cmd.named_arg("replica-id").is_none());
    assert!(cmd.named_arg("bind-dn").is_none());
}

#[tokio::test]
async fn test_enable_master_replica_id_bounds() {
    for bad in ["0", "65535", "", "abc"] {
        let gw = gateway();
        let ctrl = controller(&gw, &RecordingObserver::new());
        let mut request = EnableRequest::new(ReplicaRole::Master);
        request.replica_id = bad.to_string();
        let err = ctrl.enable(SUFFIX, &request).await.unwrap_err();
        assert!(matches!(
            rule(&err),
            ValidationError::ReplicaIdOutOfRange { .. }
        ));
        assert!(gw.calls().is_empty());
    }

    for good in ["1", "65534"] {
        let gw = gateway();
        gw.push_err(Operation::ReplicationGet, "No such object");
        gw.always(Operation::ReplicationGet, Ok(master_entry(good, &[])));
        let ctrl = controller(&gw, &RecordingObserver::new());
        let mut request = EnableRequest::new(ReplicaRole::Master);
        request.replica_id = good.to_string();
        let cfg = ctrl.enable(SUFFIX, &request).await.unwrap();
        assert_eq!(cfg.role, ReplicaRole::Master);
        assert_eq!(cfg.replica_id.map(|id| id.to_string()).as_deref(), Some(good));
        let cmd = gw.last(Operation::ReplicationEnable).unwrap();
        assert_eq!(cmd.named_arg("replica-id"), Some(&ArgValue::from(good)));
    }
}

#[tokio::test]
async fn test_enable_bootstraps_manager() {
    let gw = gateway();
    gw.push_err(Operation::ReplicationGet, "No such object");
    gw.always(Operation::ReplicationGet, Ok(hub_entry(&[MANAGER_DN])));
    let ctrl = controller(&gw, &RecordingObserver::new());

    let mut request = EnableRequest::new(ReplicaRole::Consumer);
    request.manager = Some(manager(MANAGER_DN, "secret", "other"));
    let err = ctrl.enable(SUFFIX, &request).await.unwrap_err();
    assert_eq!(rule(&err), &ValidationError::PasswordMismatch);
    assert!(gw.calls().is_empty());

    request.manager = Some(manager("not a dn", "secret", "secret"));
    let err = ctrl.enable(SUFFIX, &request).await.unwrap_err();
    assert!(matches!(rule(&err), ValidationError::MalformedDn { .. }));

    request.manager = Some(manager(MANAGER_DN, "secret", "secret"));
    let cfg = ctrl.enable(SUFFIX, &request).await.unwrap();
    assert_eq!(cfg.managers.state(MANAGER_DN), Some(ManagerState::Registered));
    let cmd = gw.last(Operation::ReplicationEnable).unwrap();
    assert_eq!(cmd.named_arg("bind-dn"), Some(&ArgValue::from(MANAGER_DN)));
    assert!(matches!(cmd.named_arg("bind-passwd"), Some(ArgValue::Secret(_))));
}

#[tokio::test]
async fn test_failed_enable_is_rolled_back() {
    let gw = gateway();
    gw.always(Operation::ReplicationGet, Err("No such object".to_string()));
    gw.push_err(Operation::ReplicationEnable, "Operations error");
    let ctrl = controller(&gw, &RecordingObserver::new());

    let mut request = EnableRequest::new(ReplicaRole::Master);
    request.replica_id = "7".to_string();
    let err = ctrl.enable(SUFFIX, &request).await.unwrap_err();
    match &err {
        TopologyError::Gateway { message, .. } => assert_eq!(message, "Operations error"),
        other => panic!("unexpected {:?}", other),
    }
    let ops = gw.ops();
    let enable = ops.iter().position(|op| *op == Operation::ReplicationEnable).unwrap();
    let disable = ops.iter().position(|op| *op == Operation::ReplicationDisable).unwrap();
    assert!(enable < disable);
    assert_eq!(gw.count(Operation::ReplicationDisable), 1);
    assert_eq!(ctrl.replica(SUFFIX).unwrap().role, ReplicaRole::Disabled);
}

#[tokio::test]
async fn test_failed_rollback_reports_both_errors() {
    let gw = gateway();
    gw.always(Operation::ReplicationGet, Err("No such object".to_string()));
    gw.push_err(Operation::ReplicationEnable, "Operations error");
    gw.push_err(Operation::ReplicationDisable, "Server is unwilling to perform");
    let ctrl = controller(&gw, &RecordingObserver::new());

    let mut request = EnableRequest::new(ReplicaRole::Master);
    request.replica_id = "7".to_string();
    let err = ctrl.enable(SUFFIX, &request).await.unwrap_err();
    assert!(matches!(err, TopologyError::Compensation { .. }));
    let text = err.to_string();
    assert!(text.contains("Operations error"));
    assert!(text.contains("Server is unwilling to perform"));
    // One compensating attempt only.
    assert_eq!(gw.count(Operation::ReplicationDisable), 1);
}

#[tokio::test]
async fn test_enable_on_enabled_suffix_is_rejected() {
    let gw = gateway();
    gw.always(Operation::ReplicationGet, Ok(master_entry("1", &[])));
    let ctrl = controller(&gw, &RecordingObserver::new());
    ctrl.load_replica(SUFFIX).await.unwrap();
    gw.clear_calls();

    let mut request = EnableRequest::new(ReplicaRole::Master);
    request.replica_id = "2".to_string();
    let err = ctrl.enable(SUFFIX, &request).await.unwrap_err();
    assert!(matches!(rule(&err), ValidationError::IllegalTransition { .. }));
    assert!(gw.calls().is_empty());
}

#[tokio::test]
async fn test_enable_reads_server_state_first() {
    let gw = gateway();
    gw.always(Operation::ReplicationGet, Ok(master_entry("1", &[MANAGER_DN])));
    gw.push_err(
        Operation::ReplicationEnable,
        "Replication is already enabled for this suffix",
    );
    let obs = RecordingObserver::new();
    let ctrl = controller(&gw, &obs);

    let mut request = EnableRequest::new(ReplicaRole::Master);
    request.replica_id = "2".to_string();
    let err = ctrl.enable(SUFFIX, &request).await.unwrap_err();
    assert_eq!(
        rule(&err),
        &ValidationError::IllegalTransition {
            from: ReplicaRole::Master.to_string(),
            to: ReplicaRole::Master.to_string(),
        }
    );
    assert_eq!(gw.count(Operation::ReplicationEnable), 0);
    assert_eq!(gw.count(Operation::ReplicationDisable), 0);
    assert_eq!(ctrl.replica(SUFFIX).unwrap().role, ReplicaRole::Master);
    assert_eq!(obs.errors().len(), 1);
}

#[tokio::test]
async fn test_promote_to_master_bounds() {
    let gw = gateway();
    gw.push_ok(Operation::ReplicationGet, hub_entry(&[MANAGER_DN]));
    let ctrl = controller(&gw, &RecordingObserver::new());
    ctrl.load_replica(SUFFIX).await.unwrap();

    for bad in ["0", "65535"] {
        let mut request = RoleRequest::new(ReplicaRole::Master);
        request.replica_id = bad.to_string();
        let err = ctrl.change_role(SUFFIX, &request).await.unwrap_err();
        assert!(matches!(rule(&err), ValidationError::ReplicaIdOutOfRange { .. }));
    }
    assert_eq!(gw.count(Operation::ReplicationPromote), 0);

    gw.push_ok(Operation::ReplicationGet, master_entry("65534", &[MANAGER_DN]));
    let mut request = RoleRequest::new(ReplicaRole::Master);
    request.replica_id = "65534".to_string();
    let cfg = ctrl.change_role(SUFFIX, &request).await.unwrap();
    assert_eq!(cfg.role, ReplicaRole::Master);
    assert_eq!(cfg.replica_id, Some(ReplicaId::parse("65534").unwrap()));

    let cmd = gw.last(Operation::ReplicationPromote).unwrap();
    assert_eq!(cmd.named_arg("newrole"), Some(&ArgValue::from("master")));
    assert_eq!(cmd.named_arg("replica-id"), Some(&ArgValue::from("65534")));
}

#[tokio::test]
async fn test_demote_without_manager_sends_no_demote() {
    let gw = gateway();
    gw.always(Operation::ReplicationGet, Ok(master_entry("1", &[])));
    let ctrl = controller(&gw, &RecordingObserver::new());

    for target in [ReplicaRole::Hub, ReplicaRole::Consumer] {
        let err = ctrl
            .change_role(SUFFIX, &RoleRequest::new(target))
            .await
            .unwrap_err();
        assert_eq!(
            rule(&err),
            &ValidationError::MissingManager {
                target: target.to_string()
            }
        );
    }
    assert_eq!(gw.count(Operation::ReplicationDemote), 0);
}

#[tokio::test]
async fn test_promote_consumer_to_hub_needs_bind_identity() {
    let gw = gateway();
    gw.always(Operation::ReplicationGet, Ok(consumer_entry(&[])));
    let ctrl = controller(&gw, &RecordingObserver::new());

    let err = ctrl
        .change_role(SUFFIX, &RoleRequest::new(ReplicaRole::Hub))
        .await
        .unwrap_err();
    assert_eq!(rule(&err), &ValidationError::MissingBindIdentity);
    assert_eq!(gw.count(Operation::ReplicationPromote), 0);

    gw.always(Operation::ReplicationGet, Ok(consumer_entry(&[MANAGER_DN])));
    ctrl.load_replica(SUFFIX).await.unwrap();
    gw.always(Operation::ReplicationGet, Ok(hub_entry(&[MANAGER_DN])));
    let cfg = ctrl
        .change_role(SUFFIX, &RoleRequest::new(ReplicaRole::Hub))
        .await
        .unwrap();
    assert_eq!(cfg.role, ReplicaRole::Hub);
    let cmd = gw.last(Operation::ReplicationPromote).unwrap();
    assert_eq!(cmd.named_arg("newrole"), Some(&ArgValue::from("hub")));
}

#[tokio::test]
async fn test_demote_with_manager() {
    let gw = gateway();
    gw.push_ok(Operation::ReplicationGet, master_entry("1", &[MANAGER_DN]));
    gw.push_ok(Operation::ReplicationGet, master_entry("1", &[MANAGER_DN]));
    gw.push_ok(Operation::ReplicationGet, hub_entry(&[MANAGER_DN]));
    let ctrl = controller(&gw, &RecordingObserver::new());

    let cfg = ctrl
        .change_role(SUFFIX, &RoleRequest::new(ReplicaRole::Hub))
        .await
        .unwrap();
    assert_eq!(cfg.role, ReplicaRole::Hub);
    assert!(cfg.replica_id.is_none());
    let cmd = gw.last(Operation::ReplicationDemote).unwrap();
    assert_eq!(cmd.named_arg("newrole"), Some(&ArgValue::from("hub")));
}

#[tokio::test]
async fn test_same_role_is_noop_and_disabled_edges_are_illegal() {
    let gw = gateway();
    gw.always(Operation::ReplicationGet, Ok(master_entry("1", &[MANAGER_DN])));
    let ctrl = controller(&gw, &RecordingObserver::new());
    ctrl.load_replica(SUFFIX).await.unwrap();
    gw.clear_calls();

    let cfg = ctrl
        .change_role(SUFFIX, &RoleRequest::new(ReplicaRole::Master))
        .await
        .unwrap();
    assert_eq!(cfg.role, ReplicaRole::Master);
    assert!(gw.calls().is_empty());

    let err = ctrl
        .change_role(SUFFIX, &RoleRequest::new(ReplicaRole::Disabled))
        .await
        .unwrap_err();
    assert!(matches!(rule(&err), ValidationError::IllegalTransition { .. }));

    let gw = gateway();
    gw.always(Operation::ReplicationGet, Err("No such object".to_string()));
    let ctrl = controller(&gw, &RecordingObserver::new());
    let err = ctrl
        .change_role(SUFFIX, &RoleRequest::new(ReplicaRole::Hub))
        .await
        .unwrap_err();
    assert!(matches!(rule(&err), ValidationError::IllegalTransition { .. }));
    assert_eq!(gw.count(Operation::ReplicationPromote), 0);
}

#[tokio::test]
async fn test_promotion_then_save_excludes_replica_id() {
    let gw = gateway();
    gw.push_ok(Operation::ReplicationGet, hub_entry(&[MANAGER_DN]));
    gw.always(Operation::ReplicationGet, Ok(master_entry("5", &[MANAGER_DN])));
    let ctrl = controller(&gw, &RecordingObserver::new());

    let mut request = RoleRequest::new(ReplicaRole::Master);
    request.replica_id = "5".to_string();
    let mut settings = dsrepl_topology::ReplicaSettings::default();
    settings.set(ReplicaAttr::PurgeDelay, Some("86400"));
    request.settings = Some(settings);
    ctrl.change_role(SUFFIX, &request).await.unwrap();

    let set = gw.last(Operation::ReplicationSet).unwrap();
    assert_eq!(set.named_arg("repl-purge-delay"), Some(&ArgValue::from("86400")));
    assert!(set.named_arg("replica-id").is_none());
}

#[tokio::test]
async fn test_save_replica_sends_only_changes() {
    let entry = Entry::new()
        .with("nsds5replicatype", ["3"])
        .with("nsds5replicaid", ["1"])
        .with("nsds5replicapurgedelay", ["604800"])
        .with("nsds5replicabackoffmin", ["3"]);
    let gw = gateway();
    gw.always(Operation::ReplicationGet, Ok(Payload::from_entry(&entry)));
    let ctrl = controller(&gw, &RecordingObserver::new());
    let cfg = ctrl.load_replica(SUFFIX).await.unwrap();

    let pending = cfg.settings.clone();
    assert!(!ctrl.save_replica(SUFFIX, &pending, None).await.unwrap());
    assert!(!ctrl
        .save_replica(SUFFIX, &pending, cfg.replica_id)
        .await
        .unwrap());
    assert_eq!(gw.count(Operation::ReplicationSet), 0);

    let mut pending = cfg.settings.clone();
    pending.set(ReplicaAttr::PurgeDelay, Some("3600"));
    pending.set(ReplicaAttr::BackoffMin, None);
    assert!(ctrl.save_replica(SUFFIX, &pending, None).await.unwrap());
    let set = gw.last(Operation::ReplicationSet).unwrap();
    assert_eq!(set.named.len(), 2);
    assert_eq!(set.named_arg("repl-purge-delay"), Some(&ArgValue::from("3600")));
    assert_eq!(set.named_arg("repl-backoff-min"), Some(&ArgValue::Delete));

    let new_id = ReplicaId::parse("9").unwrap();
    assert!(ctrl
        .save_replica(SUFFIX, &cfg.settings, Some(new_id))
        .await
        .unwrap());
    let set = gw.last(Operation::ReplicationSet).unwrap();
    assert_eq!(set.named_arg("replica-id"), Some(&ArgValue::from("9")));
}

#[tokio::test]
async fn test_manager_create_and_two_step_removal() {
    let gw = gateway();
    gw.always(Operation::ReplicationGet, Ok(master_entry("1", &[MANAGER_DN])));
    let obs = RecordingObserver::new();
    let ctrl = controller(&gw, &obs);

    let err = ctrl
        .create_manager(SUFFIX, &manager(MANAGER_DN, "a", "b"))
        .await
        .unwrap_err();
    assert_eq!(rule(&err), &ValidationError::PasswordMismatch);
    assert!(gw.calls().is_empty());

    ctrl.create_manager(SUFFIX, &manager(MANAGER_DN, "secret", "secret"))
        .await
        .unwrap();
    let create = gw.last(Operation::CreateManager).unwrap();
    assert_eq!(create.named_arg("name"), Some(&ArgValue::from(MANAGER_DN)));
    assert!(matches!(create.named_arg("passwd"), Some(ArgValue::Secret(_))));
    assert!(obs.changes().iter().any(|(k, _)| *k == EntityKind::Manager));

    // The entry delete fails after the bind DN was unregistered.
    gw.always(Operation::ReplicationGet, Ok(master_entry("1", &[])));
    gw.push_err(Operation::DeleteManager, "Insufficient access");
    assert!(ctrl.delete_manager(SUFFIX, MANAGER_DN).await.is_err());
    let unregister = gw.last(Operation::ReplicationSet).unwrap();
    assert_eq!(
        unregister.named_arg("repl-del-bind-dn"),
        Some(&ArgValue::from(MANAGER_DN))
    );
    let cfg = ctrl.replica(SUFFIX).unwrap();
    assert_eq!(cfg.managers.state(MANAGER_DN), Some(ManagerState::RemovalPending));
    assert!(!cfg.managers.has_registered());

    // A retry resumes with the entry delete.
    let cfg = ctrl.delete_manager(SUFFIX, MANAGER_DN).await.unwrap();
    assert_eq!(gw.count(Operation::ReplicationSet), 1);
    assert_eq!(gw.count(Operation::DeleteManager), 2);
    assert_eq!(cfg.managers.state(MANAGER_DN), None);
}

#[tokio::test]
async fn test_changelog_lifecycle() {
    let gw = gateway();
    gw.always(Operation::ReplicationGet, Ok(master_entry("1", &[])));
    let ctrl = controller(&gw, &RecordingObserver::new());

    let cfg = ctrl.load_replica(SUFFIX).await.unwrap();
    assert!(cfg.changelog.is_none());
    let mut pending = dsrepl_topology::ChangelogSettings::default();
    pending.set(ChangelogAttr::MaxAge, Some("7d"));
    let err = ctrl.save_changelog(SUFFIX, &pending).await.unwrap_err();
    assert_eq!(rule(&err), &ValidationError::ChangelogMissing);
    assert_eq!(gw.count(Operation::SetChangelog), 0);

    let changelog = Entry::new()
        .with("nsslapd-changelogdir", ["/var/lib/dirsrv/slapd-localhost/changelogdb"])
        .with("nsslapd-changelogmaxage", ["7d"]);
    gw.always(Operation::GetChangelog, Ok(Payload::from_entry(&changelog)));
    let cfg = ctrl.create_changelog(SUFFIX, &pending).await.unwrap();
    let create = gw.last(Operation::CreateChangelog).unwrap();
    assert_eq!(create.named_arg("max-age"), Some(&ArgValue::from("7d")));
    let baseline = cfg.changelog.unwrap();
    assert_eq!(baseline.get(ChangelogAttr::MaxAge), Some("7d"));

    assert!(!ctrl.save_changelog(SUFFIX, &baseline).await.unwrap());
    let mut pending = baseline.clone();
    pending.set(ChangelogAttr::MaxEntries, Some("50000"));
    assert!(ctrl.save_changelog(SUFFIX, &pending).await.unwrap());
    let set = gw.last(Operation::SetChangelog).unwrap();
    assert_eq!(set.named.len(), 1);
    assert_eq!(set.named_arg("max-entries"), Some(&ArgValue::from("50000")));
}
