//! Store durability across reopen, compaction, and backup.

use crate::common::{TestStore, basis, tagged};
use plotarmor::storage::prune_backups;
use plotarmor::{StorageError, Vector, VectorStore};

fn ids(store: &VectorStore) -> Vec<String> {
    store
        .scan_all()
        .unwrap()
        .iter()
        .map(|v| v.id.clone())
        .collect()
}

#[test]
fn test_state_survives_reopen_and_compaction() {
    let test = TestStore::new(8);
    {
        let store = test.open();
        store
            .store_batch((0..20).map(|i| Vector::new(format!("v{i:02}"), basis(8, i % 8))).collect())
            .unwrap();
        store.compact().unwrap();
        for i in 0..5 {
            store.delete(&format!("v{i:02}")).unwrap();
        }
        store.store(tagged("extra", basis(8, 1), "x")).unwrap();
        store.close().unwrap();
    }

    let store = test.open();
    let stored = ids(&store);
    assert_eq!(stored.len(), 16);
    assert_eq!(stored.first().map(String::as_str), Some("extra"));
    assert!(!stored.contains(&"v00".to_string()));
    assert_eq!(
        store
            .retrieve("extra")
            .unwrap()
            .unwrap()
            .metadata
            .get("category")
            .map(String::as_str),
        Some("x")
    );
    assert_eq!(store.statistics().key_count, 16);
}

#[test]
fn test_backup_restores_point_in_time() {
    let test = TestStore::new(4);
    let store = test.open();
    store.store(Vector::new("before", basis(4, 0))).unwrap();

    let backup_dir = test.dir.path().join("snapshots").join("first");
    store.create_backup(&backup_dir).unwrap();
    store.store(Vector::new("after", basis(4, 1))).unwrap();
    store.delete("before").unwrap();

    let restored = VectorStore::open(&backup_dir, test.settings.storage_options()).unwrap();
    assert_eq!(ids(&restored), vec!["before"]);
    assert_eq!(ids(&store), vec!["after"]);

    // A second backup to the same place replaces the first.
    restored.close().unwrap();
    store.create_backup(&backup_dir).unwrap();
    let restored = VectorStore::open(&backup_dir, test.settings.storage_options()).unwrap();
    assert_eq!(ids(&restored), vec!["after"]);
}

#[test]
fn test_timestamped_backups_and_pruning() {
    let test = TestStore::new(4);
    let store = test.open();
    store.store(Vector::new("a", basis(4, 0))).unwrap();

    let base = test.dir.path().join("backups");
    let path = store.create_timestamped_backup(&base).unwrap();
    let name = path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("backup_"));

    std::fs::create_dir_all(base.join("backup_19990101_000000")).unwrap();
    let removed = prune_backups(&base, 1).unwrap();
    assert_eq!(removed, vec![base.join("backup_19990101_000000")]);
    assert!(path.exists());
}

#[test]
fn test_closed_store_rejects_operations() {
    let test = TestStore::new(4);
    let store = test.open();
    store.close().unwrap();

    assert!(matches!(store.scan_all(), Err(StorageError::Closed)));
    assert!(matches!(store.delete("a"), Err(StorageError::Closed)));
    assert!(matches!(
        store.create_backup(test.dir.path().join("bk")),
        Err(StorageError::Closed)
    ));
    // Statistics stay readable.
    assert_eq!(store.statistics().key_count, 0);
}
