//! End-to-end scenarios through the public API: the full
//! call/commit/undo/redo lifecycle, automatic rollback on failure, crash
//! recovery, and cross-manager contention on one data directory.

use parking_lot::Mutex;
use rewind::prelude::*;
use rewind_storage::{CallTable, Store};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

type EnvMap = Arc<Mutex<BTreeMap<String, String>>>;

fn args(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect()
}

/// `setenv(key, val)`: the reference transactional function. An empty
/// `val` removes the key; the dry run reports the inverse call.
fn build_registry(env: EnvMap) -> StaticRegistry {
    let mut registry = StaticRegistry::new();
    registry.register("setenv", FuncMeta::full(), move |_tm, input| {
        let Some(key) = input.args.get("key").and_then(Value::as_str) else {
            return Envelope::new(codes::BAD_REQUEST, "missing key");
        };
        let val = input.args.get("val").and_then(Value::as_str).unwrap_or("");
        let mut map = env.lock();
        let old = map.get(key).cloned().unwrap_or_default();
        if input.special.dry_run {
            if old == val {
                return Envelope::new(codes::NOT_MODIFIED, "No change")
                    .with_extra("undo_data", json!([]));
            }
            return Envelope::ok()
                .with_extra("undo_data", json!([["setenv", {"key": key, "val": old}]]));
        }
        if val.is_empty() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), val.to_string());
        }
        Envelope::ok()
    });
    registry
}

fn open_manager(dir: &TempDir, env: EnvMap, registry: Option<StaticRegistry>) -> TxManager {
    let registry = registry.unwrap_or_else(|| build_registry(env));
    TxManager::builder()
        .data_dir(dir.path())
        .registry(Arc::new(registry))
        .lock_retry([Duration::from_millis(5), Duration::from_millis(5)])
        .open()
        .unwrap()
}

fn status_of(tm: &mut TxManager, id: &str) -> String {
    let resp = tm.list(Some(id), None, true);
    assert_eq!(resp.code, codes::OK, "{}", resp.message);
    resp.payload.unwrap()[0]["status"]
        .as_str()
        .unwrap()
        .to_string()
}

fn counts(dir: &TempDir, id: &str) -> (i64, i64) {
    let store = Store::open(dir.path()).unwrap();
    let rec = store.get_tx_by_str_id(id).unwrap().unwrap();
    (
        store.count_calls(CallTable::Forward, rec.ser_id).unwrap(),
        store.count_calls(CallTable::Undo, rec.ser_id).unwrap(),
    )
}

/// Scenarios 1-3: commit, undo and redo chained on one transaction.
#[test]
fn test_commit_undo_redo_lifecycle() {
    let dir = tempdir().unwrap();
    let env: EnvMap = Arc::new(Mutex::new(BTreeMap::new()));
    let mut tm = open_manager(&dir, env.clone(), None);

    // Scenario 1: begin, set a variable, commit.
    assert_eq!(tm.begin("t1", None, None).code, codes::OK);
    let resp = tm.call(None, "setenv", args(&[("key", "A"), ("val", "1")]), false);
    assert_eq!(resp.code, codes::OK, "{}", resp.message);
    assert_eq!(tm.commit(None).code, codes::OK);

    assert_eq!(status_of(&mut tm, "t1"), "C");
    let (calls, undo_calls) = counts(&dir, "t1");
    assert_eq!(calls, 0, "commit drops the forward log");
    assert_eq!(undo_calls, 1, "the undo program is kept");
    {
        let store = Store::open(dir.path()).unwrap();
        let rec = store.get_tx_by_str_id("t1").unwrap().unwrap();
        let undo = store
            .select_calls(CallTable::Undo, rec.ser_id, false, None)
            .unwrap();
        assert_eq!(undo[0].f, "setenv");
    }

    // Scenario 2: undo restores the environment and swaps the programs.
    assert_eq!(tm.undo(None).code, codes::OK);
    assert_eq!(status_of(&mut tm, "t1"), "U");
    assert!(env.lock().get("A").is_none(), "A is back to unset");
    let (calls, undo_calls) = counts(&dir, "t1");
    assert_eq!(calls, 1, "the recorded inverse is the redo program");
    assert_eq!(undo_calls, 0);

    // Scenario 3: redo brings the effect and the tables back.
    assert_eq!(tm.redo(None).code, codes::OK);
    assert_eq!(status_of(&mut tm, "t1"), "C");
    assert_eq!(env.lock().get("A").unwrap(), "1");
    let (calls, undo_calls) = counts(&dir, "t1");
    assert_eq!((calls, undo_calls), (0, 1));
}

/// Scenario 4: the second call fails; the manager rolls back, the first
/// call's undo runs, and the response says so.
#[test]
fn test_failed_call_triggers_automatic_rollback() {
    let dir = tempdir().unwrap();
    let env: EnvMap = Arc::new(Mutex::new(BTreeMap::new()));
    let mut registry = build_registry(env.clone());
    registry.register("explode", FuncMeta::full(), |_tm, input| {
        if input.special.dry_run {
            return Envelope::ok().with_extra("undo_data", json!([]));
        }
        Envelope::new(codes::INTERNAL, "explode always fails")
    });
    let mut tm = open_manager(&dir, env.clone(), Some(registry));

    tm.begin("t2", None, None);
    assert_eq!(
        tm.call(None, "setenv", args(&[("key", "A"), ("val", "1")]), false)
            .code,
        codes::OK
    );
    assert_eq!(env.lock().get("A").unwrap(), "1");

    let resp = tm.call(None, "explode", Map::new(), false);
    assert_eq!(resp.code, codes::ENVIRONMENT);
    assert!(resp.message.contains("explode always fails"), "{}", resp.message);
    assert!(resp.message.ends_with("(rolled back)"), "{}", resp.message);

    assert!(env.lock().get("A").is_none(), "first call was undone");
    assert_eq!(status_of(&mut tm, "t2"), "R");
}

/// Scenario 5: a process dies after the undo data is recorded but before
/// the real call runs. The next manager on the data directory rolls the
/// transaction back to `R` before it is handed out, and the world shows
/// no side effects.
#[test]
fn test_crash_before_real_call_is_recovered_on_open() {
    let dir = tempdir().unwrap();
    let env: EnvMap = Arc::new(Mutex::new(BTreeMap::new()));

    // Stage exactly what the call loop leaves behind at that point:
    // status `i`, no resume marker, the probe's inverse recorded.
    {
        let mut store = Store::open(dir.path()).unwrap();
        let rec = store.insert_tx("t3", "", None).unwrap();
        store
            .insert_call(
                CallTable::Undo,
                rec.ser_id,
                None,
                "setenv",
                &args(&[("key", "A"), ("val", "")]),
            )
            .unwrap();
    }

    let mut tm = open_manager(&dir, env.clone(), None);

    assert_eq!(status_of(&mut tm, "t3"), "R");
    assert!(env.lock().get("A").is_none(), "no side effects survived");
    assert_eq!(counts(&dir, "t3"), (0, 0));
}

/// Scenario 6: two managers on one data directory. The second `begin`
/// with the same id waits its turn on the file lock, then answers 409.
#[test]
fn test_duplicate_begin_across_managers() {
    let dir = tempdir().unwrap();
    let env: EnvMap = Arc::new(Mutex::new(BTreeMap::new()));
    let mut tm1 = open_manager(&dir, env.clone(), None);
    let mut tm2 = open_manager(&dir, env.clone(), None);

    assert_eq!(tm1.begin("t4", None, None).code, codes::OK);
    assert_eq!(tm2.begin("t4", None, None).code, codes::DUPLICATE_TX);

    // Both observe the one transaction.
    let ids = tm2.list(None, None, false).payload.unwrap();
    assert_eq!(ids, json!(["t4"]));
}

/// The tx id boundary values surface as 400 at the facade.
#[test]
fn test_tx_id_bounds() {
    let dir = tempdir().unwrap();
    let env: EnvMap = Arc::new(Mutex::new(BTreeMap::new()));
    let mut tm = open_manager(&dir, env, None);

    assert_eq!(tm.begin("", None, None).code, codes::BAD_REQUEST);
    assert_eq!(tm.begin(&"x".repeat(201), None, None).code, codes::BAD_REQUEST);
    assert_eq!(tm.begin(&"x".repeat(200), None, None).code, codes::OK);
}
