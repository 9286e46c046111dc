//! Save-data backup and restore through the fleet.

mod common;

use common::{spec, tenant, test_fleet};
use gamefleet::env;
use gamefleet::error::FleetError;
use gamefleet::model::ObservedState;
use std::fs;
use test_tag::tag;

#[tokio::test]
#[tag(integration, backup)]
async fn test_restore_replaces_save_data() {
    let harness = test_fleet().await;
    let alice = tenant("alice");
    let instance = harness
        .fleet
        .create_instance(&alice, spec("Saves"))
        .await
        .unwrap();

    let saved = env::instance_server_dir_path(harness.temp_dir.path(), &instance.id.to_string())
        .join(env::SAVED_DIR_RELATIVE);
    fs::create_dir_all(saved.join("SavedArks")).unwrap();
    fs::write(saved.join("SavedArks/TheIsland.ark"), "day 1").unwrap();

    let backups = harness.fleet.backups();
    let backup = backups.create(instance.id).await.unwrap();
    assert_eq!(backups.list(instance.id).await.unwrap().len(), 1);

    fs::write(saved.join("SavedArks/TheIsland.ark"), "day 2").unwrap();
    let restored = backups.restore(instance.id, &backup.name).await.unwrap();
    assert_eq!(restored.name, backup.name);
    assert_eq!(
        fs::read_to_string(saved.join("SavedArks/TheIsland.ark")).unwrap(),
        "day 1"
    );

    // A safety archive of "day 2" sits next to the backup but is not listed.
    let dir = env::instance_backups_dir_path(harness.temp_dir.path(), &instance.id.to_string());
    assert_eq!(fs::read_dir(dir).unwrap().count(), 2);
    assert_eq!(backups.list(instance.id).await.unwrap().len(), 1);

    let status = harness.fleet.status(&alice, instance.id).await.unwrap();
    assert!(status.instance.busy.is_none());
}

#[tokio::test]
#[tag(integration, backup)]
async fn test_restore_refuses_running_instance() {
    let harness = test_fleet().await;
    let instance = harness.running_instance("alice", 30).await;

    let saved = env::instance_server_dir_path(harness.temp_dir.path(), &instance.id.to_string())
        .join(env::SAVED_DIR_RELATIVE);
    fs::create_dir_all(&saved).unwrap();
    fs::write(saved.join("Game.ini"), "[ServerSettings]").unwrap();

    let backups = harness.fleet.backups();
    let backup = backups.create(instance.id).await.unwrap();
    let err = backups
        .restore(instance.id, &backup.name)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FleetError::InvalidState {
            state: ObservedState::Running,
            ..
        }
    ));
}

#[tokio::test]
#[tag(integration, backup)]
async fn test_restore_rejects_path_names() {
    let harness = test_fleet().await;
    let instance = harness
        .fleet
        .create_instance(&tenant("alice"), spec("Names"))
        .await
        .unwrap();

    let err = harness
        .fleet
        .backups()
        .restore(instance.id, "../../etc/passwd.tar.gz")
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Backup(_)));
}

#[tokio::test]
#[tag(integration, backup)]
async fn test_backup_of_unknown_instance() {
    let harness = test_fleet().await;
    let err = harness
        .fleet
        .backups()
        .create(uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InstanceNotFound(_)));
}
