//! Filesystem bridge tests over the scripted fake engine.

use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use pykernel::testing::FakeEngine;
use pykernel::{InterpreterManager, KernelConfig, ManagerConfig, MountMode};

async fn started(fake: FakeEngine) -> InterpreterManager {
    InterpreterManager::start(fake.into_loader(), ManagerConfig::default()).await
}

#[tokio::test]
async fn mount_then_immediate_sync_succeeds() {
    let manager = started(FakeEngine::new()).await;
    let dir = tempfile::tempdir().unwrap();

    assert!(manager.mount("/mnt/data", dir.path(), MountMode::ReadWrite).await);

    // Nothing written yet; sync of an untouched mount is a trivial success.
    let outcome = manager.sync("/mnt/data").await;
    assert!(outcome.success);
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn mount_failure_returns_false() {
    let fake = FakeEngine::new();
    let controls = fake.controls();
    controls.fail_mount.store(true, Ordering::SeqCst);
    let manager = started(fake).await;
    let dir = tempfile::tempdir().unwrap();

    assert!(!manager.mount("/mnt/data", dir.path(), MountMode::Read).await);
}

#[tokio::test]
async fn sync_failure_surfaces_the_engine_message() {
    let fake = FakeEngine::new();
    let controls = fake.controls();
    let manager = started(fake).await;
    let dir = tempfile::tempdir().unwrap();

    assert!(manager.mount("/mnt/data", dir.path(), MountMode::ReadWrite).await);
    controls.fail_sync.store(true, Ordering::SeqCst);

    let outcome = manager.sync("/mnt/data").await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("sync failure"));
}

#[tokio::test]
async fn sync_of_unmounted_path_fails_without_error() {
    let manager = started(FakeEngine::new()).await;

    let outcome = manager.sync("/mnt/never-mounted").await;
    assert!(!outcome.success);
    assert!(outcome.error.is_some());
}

#[tokio::test]
async fn mounted_directory_lists_only_image_files() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a.png", "b.jpg", "c.tif", "notes.txt", "data.csv"] {
        File::create(dir.path().join(name)).unwrap();
    }

    let engine = Arc::new(FakeEngine::new().spawn());
    let kernel_id = engine.create_kernel(&KernelConfig::default()).await.unwrap();
    assert!(
        engine
            .mount_fs(&kernel_id, "/mnt/images", dir.path(), MountMode::Read)
            .await
            .unwrap()
    );

    let entries = engine.list_dir(&kernel_id, "/mnt/images").await.unwrap();
    assert_eq!(entries, vec!["a.png", "b.jpg", "c.tif"]);
}

#[tokio::test]
async fn remount_points_at_the_new_directory() {
    let manager = started(FakeEngine::new()).await;
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();

    assert!(manager.mount("/mnt/data", first.path(), MountMode::Read).await);
    assert!(manager.mount("/mnt/data", second.path(), MountMode::ReadWrite).await);

    // Still one mount point, still syncable.
    assert!(manager.sync("/mnt/data").await.success);
}
