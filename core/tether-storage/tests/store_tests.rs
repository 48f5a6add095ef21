use serde::{Deserialize, Serialize};
use tether_storage::{load_json, save_json, KeyValueStore, MemoryStore, SqliteStore};

fn stores() -> Vec<(&'static str, Box<dyn KeyValueStore>)> {
    vec![
        ("memory", Box::new(MemoryStore::new())),
        ("sqlite", Box::new(SqliteStore::open_in_memory().unwrap())),
    ]
}

// ── Basic contract ───────────────────────────────────────────────

#[test]
fn get_missing_is_none() {
    for (name, store) in stores() {
        assert!(store.get("nope").unwrap().is_none(), "{name}");
    }
}

#[test]
fn set_then_get() {
    for (name, store) in stores() {
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"), "{name}");
    }
}

#[test]
fn set_overwrites() {
    for (name, store) in stores() {
        store.set("a", "1").unwrap();
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"), "{name}");
    }
}

#[test]
fn remove_deletes_and_is_idempotent() {
    for (name, store) in stores() {
        store.set("a", "1").unwrap();
        store.remove("a").unwrap();
        store.remove("a").unwrap();
        assert!(store.get("a").unwrap().is_none(), "{name}");
    }
}

// ── JSON helpers ─────────────────────────────────────────────────

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Record {
    id: u32,
    tags: Vec<String>,
}

#[test]
fn json_helpers_roundtrip() {
    let store = MemoryStore::new();
    let records = vec![Record { id: 1, tags: vec!["x".into()] }];
    save_json(&store, "app:records", &records).unwrap();
    let loaded: Option<Vec<Record>> = load_json(&store, "app:records").unwrap();
    assert_eq!(loaded, Some(records));
}

#[test]
fn load_json_reports_corruption() {
    let store = MemoryStore::new();
    store.set("app:records", "{not json").unwrap();
    let loaded: Result<Option<Vec<Record>>, _> = load_json(&store, "app:records");
    assert!(loaded.is_err());
}

// ── Failure injection ────────────────────────────────────────────

#[test]
fn memory_store_fail_writes() {
    let store = MemoryStore::new();
    store.set("a", "1").unwrap();
    store.set_fail_writes(true);
    assert!(store.set("a", "2").is_err());
    assert!(store.remove("a").is_err());
    assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
    store.set_fail_writes(false);
    store.set("a", "2").unwrap();
    assert_eq!(store.len(), 1);
}

// ── Durability ───────────────────────────────────────────────────

#[test]
fn sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tether.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        store.set("tether:offline_queue", "[1,2,3]").unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(
        store.get("tether:offline_queue").unwrap().as_deref(),
        Some("[1,2,3]")
    );
}

#[test]
fn sqlite_keys_with_prefix() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set("app:b", "1").unwrap();
    store.set("app:a", "1").unwrap();
    store.set("other:c", "1").unwrap();
    assert_eq!(store.keys_with_prefix("app:").unwrap(), vec!["app:a", "app:b"]);
}
