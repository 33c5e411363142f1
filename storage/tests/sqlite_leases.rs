#![cfg(feature = "sqlite")]

use lease::{
    test_utils::{fast_scope_options, race_create, unique_resource_name},
    LockManager, ScopeState,
};
use std::{path::Path, sync::Arc, time::Duration};
use storage::{LockConfig, LockManagerBuilder, SqliteLeaseStore};
use tempfile::TempDir;

/// A manager with its own connection to the database at `path`, standing in
/// for a separate process.
fn process(path: &Path) -> LockManager {
    let store = SqliteLeaseStore::open(path, "ProcessLock").expect("open sqlite store");
    LockManager::new(Arc::new(store))
        .with_scope_options(fast_scope_options())
        .expect("valid scope options")
}

async fn shared_db() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("Could not create temp dir");
    let path = dir.path().join("locks.db");
    // provision once so racing connections only contend on rows
    process(&path).store().ensure_table_exists().await.unwrap();
    (dir, path)
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let (_dir, path) = shared_db().await;
    let manager = process(&path);

    let first = manager.create("job-A", 250).await.unwrap();
    assert!(first.is_some());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = manager.create("job-A", 250).await.unwrap();
    assert!(second.is_some());
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_active_lease_blocks_other_process() {
    let (_dir, path) = shared_db().await;
    let a = process(&path);
    let b = process(&path);

    assert!(a.create("job-B", 250).await.unwrap().is_some());
    assert!(b.create("job-B", 250).await.unwrap().is_none());
    assert!(b.exists("job-B").await.unwrap());
}

#[tokio::test]
async fn test_scope_visible_to_other_process() {
    let (_dir, path) = shared_db().await;
    let holder = process(&path);
    let observer = process(&path);

    let mut scope = holder.begin_scope("job-C").await.unwrap();
    assert!(scope.is_locked());
    assert!(observer.exists("job-C").await.unwrap());

    let mut rival = observer.begin_scope("job-C").await.unwrap();
    assert_eq!(rival.state(), ScopeState::Denied);
    rival.stop().await.unwrap();

    scope.stop().await.unwrap();
    assert!(!observer.exists("job-C").await.unwrap());
}

#[tokio::test]
async fn test_renew_and_release_across_processes() {
    let (_dir, path) = shared_db().await;
    let a = process(&path);
    let b = process(&path);
    let name = unique_resource_name("renew");

    let token = a.create(&name, 500).await.unwrap().unwrap();
    assert!(!b.renew(&token, 500, 100).await.unwrap());
    assert!(b.renew(&token, 2000, 500).await.unwrap());

    let record = a.lookup(&token).await.unwrap().unwrap();
    assert_eq!(record.lock_duration_ms, 2000);
    assert_eq!(record.resource_name, name);

    b.release(&token).await.unwrap();
    b.release(&token).await.unwrap();
    assert!(!a.exists(&name).await.unwrap());
    assert!(a.lookup(&token).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_create_race_across_connections() {
    let (_dir, path) = shared_db().await;
    let managers: Vec<_> = (0..8).map(|_| process(&path)).collect();

    for round in 0..10 {
        let name = format!("fresh-{round}");
        let granted = race_create(&managers, &name, 5000).await.unwrap();
        assert_eq!(granted.len(), 1, "round {round} granted {granted:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_takeover_race_across_connections() {
    let (_dir, path) = shared_db().await;
    let managers: Vec<_> = (0..8).map(|_| process(&path)).collect();

    for round in 0..5 {
        let name = format!("takeover-{round}");
        assert!(managers[0].create(&name, 20).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let granted = race_create(&managers, &name, 5000).await.unwrap();
        assert_eq!(granted.len(), 1, "round {round} granted {granted:?}");
    }
}

#[tokio::test]
async fn test_scope_keeps_lease_past_its_duration() {
    let (_dir, path) = shared_db().await;
    let holder = process(&path);
    let rival = process(&path);
    let name = unique_resource_name("long-job");

    let mut scope = holder.begin_scope(&name).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(scope.is_locked());
    assert!(rival.create(&name, 1000).await.unwrap().is_none());

    scope.stop().await.unwrap();
    assert!(rival.create(&name, 1000).await.unwrap().is_some());
}

#[tokio::test]
async fn test_unique_table_suffix_isolates_instances() {
    let dir = TempDir::new().expect("Could not create temp dir");
    let config = LockConfig::sqlite(dir.path().join("locks.db")).use_unique_table_suffix();

    let a = LockManagerBuilder::new(config.clone()).build().await.unwrap();
    let b = LockManagerBuilder::new(config).build().await.unwrap();

    assert!(a.create("job", 5000).await.unwrap().is_some());
    assert!(b.create("job", 5000).await.unwrap().is_some());

    a.store().drop_table().await.unwrap();
    assert!(!a.store().table_exists().await.unwrap());
    assert!(b.store().table_exists().await.unwrap());
}

#[tokio::test]
async fn test_create_after_drop_table_provisions_again() {
    let (_dir, path) = shared_db().await;
    let manager = process(&path);

    let first = manager.create("job", 5000).await.unwrap();
    assert!(first.is_some());

    manager.store().drop_table().await.unwrap();
    assert!(!manager.exists("job").await.unwrap());

    let second = manager.create("job", 5000).await.unwrap();
    assert!(second.is_some());
    assert_ne!(first, second);
    assert!(manager.store().table_exists().await.unwrap());
}

#[tokio::test]
async fn test_builder_opens_sqlite_from_toml() {
    let dir = TempDir::new().expect("Could not create temp dir");
    let db = dir.path().join("nested").join("locks.db");
    let config = LockConfig::from_toml(&format!(
        "[backend]\nkind = \"sqlite\"\npath = {:?}\n",
        db.display().to_string()
    ))
    .unwrap();

    let manager = LockManagerBuilder::new(config).build().await.unwrap();
    assert!(manager.create("job", 5000).await.unwrap().is_some());
    assert!(db.exists());

    // a second process sees the row
    assert!(process(&db).exists("job").await.unwrap());
}
