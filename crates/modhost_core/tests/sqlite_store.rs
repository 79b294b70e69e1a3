use modhost_core::{
    BootstrapHook, ExtensionKind, ExtensionRecord, ExtensionStatus, ExtensionStore,
    RawDescriptor, RepoError, SqliteExtensionStore,
};
use serde_json::json;

fn installed_record(id: &str) -> ExtensionRecord {
    let mut descriptor = RawDescriptor::new(id, format!("{id} module"));
    descriptor
        .metadata
        .insert("owner".to_string(), json!("engine"));
    let mut record = ExtensionRecord::discovered(&descriptor);
    record.schema_version = 7001;
    record.installed_at = Some(1_700_000_000_000);
    record.changed_at = 1_700_000_000_500;
    record
}

#[test]
fn put_then_get_round_trips_every_column() {
    let store = SqliteExtensionStore::open_in_memory().expect("store should open");
    let mut record = installed_record("node");
    record.status = ExtensionStatus::Enabled;
    record.weight = -5;
    record.bootstrap.insert(BootstrapHook::Boot);
    record.bootstrap.insert(BootstrapHook::LanguageInit);

    store.put(&record).expect("put should succeed");
    let loaded = store
        .get("node")
        .expect("get should succeed")
        .expect("record should exist");

    assert_eq!(loaded, record);
    assert_eq!(loaded.owner, "engine");
    assert_eq!(loaded.kind, ExtensionKind::Module);
}

#[test]
fn put_is_an_upsert_and_list_orders_by_id() {
    let store = SqliteExtensionStore::open_in_memory().expect("store should open");
    store.put(&installed_record("user")).expect("put user");
    store.put(&installed_record("block")).expect("put block");

    let mut updated = installed_record("user");
    updated.weight = 10;
    store.put(&updated).expect("upsert user");

    let ids: Vec<String> = store
        .list()
        .expect("list should succeed")
        .into_iter()
        .map(|record| record.id)
        .collect();
    assert_eq!(ids, vec!["block", "user"]);
    assert_eq!(
        store
            .get("user")
            .expect("get user")
            .expect("user exists")
            .weight,
        10
    );
}

#[test]
fn delete_removes_row_and_reports_missing_rows() {
    let store = SqliteExtensionStore::open_in_memory().expect("store should open");
    store.put(&installed_record("node")).expect("put");

    store.delete("node").expect("delete should succeed");
    assert!(store.get("node").expect("get").is_none());
    assert!(matches!(store.delete("node"), Err(RepoError::NotFound(id)) if id == "node"));
}

#[test]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("registry.sqlite3");

    {
        let store = SqliteExtensionStore::open(&path).expect("first open");
        store.put(&installed_record("node")).expect("put");
    }

    let store = SqliteExtensionStore::open(&path).expect("reopen");
    let loaded = store
        .get("node")
        .expect("get")
        .expect("record should persist");
    assert_eq!(loaded.schema_version, 7001);
    assert_eq!(loaded.installed_at, Some(1_700_000_000_000));
}

#[test]
fn enabled_but_uninstalled_record_is_rejected() {
    let store = SqliteExtensionStore::open_in_memory().expect("store should open");
    let mut record = ExtensionRecord::discovered(&RawDescriptor::new("node", "Node"));
    record.status = ExtensionStatus::Enabled;

    assert!(matches!(store.put(&record), Err(RepoError::Validation(_))));
    assert!(store.get("node").expect("get").is_none());
}
