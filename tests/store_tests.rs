// ABOUTME: Tests for SQLite-backed session records, bindings, and transcripts.
// ABOUTME: Every test runs against its own temp directory database.

use crossbar::store::SessionStore;
use tempfile::TempDir;

fn store() -> (SessionStore, TempDir) {
    let tmp = TempDir::new().unwrap();
    (SessionStore::new(tmp.path()).unwrap(), tmp)
}

#[test]
fn create_then_get_session() {
    let (store, tmp) = store();
    let ws = tmp.path().join("research");
    store
        .create_session("research", &ws.to_string_lossy(), None)
        .unwrap();

    let record = store.get_session("research").unwrap().unwrap();
    assert_eq!(record.name, "research");
    assert!(record.session_id.is_none());
    assert!(ws.is_dir(), "workspace directory should be created");
}

#[test]
fn duplicate_create_fails() {
    let (store, tmp) = store();
    let ws = tmp.path().join("a").to_string_lossy().into_owned();
    store.create_session("a", &ws, None).unwrap();
    assert!(store.create_session("a", &ws, None).is_err());
}

#[test]
fn get_or_create_materializes_under_default_workspace() {
    let (store, _tmp) = store();
    let (record, created) = store.get_or_create_session("fresh").unwrap();
    assert!(created);
    assert!(record.workspace.ends_with("fresh"));

    let (again, created) = store.get_or_create_session("fresh").unwrap();
    assert!(!created);
    assert_eq!(again.workspace, record.workspace);
}

#[test]
fn session_id_updates_and_clears() {
    let (store, _tmp) = store();
    store.get_or_create_session("s").unwrap();

    store.update_session_id("s", "backend-123").unwrap();
    assert_eq!(
        store.get_session("s").unwrap().unwrap().session_id.as_deref(),
        Some("backend-123")
    );

    store.clear_session_id("s").unwrap();
    assert!(store.get_session("s").unwrap().unwrap().session_id.is_none());
}

#[test]
fn list_sessions_is_sorted_by_name() {
    let (store, _tmp) = store();
    store.get_or_create_session("zeta").unwrap();
    store.get_or_create_session("alpha").unwrap();

    let names: Vec<String> = store
        .list_sessions()
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
}

#[test]
fn bindings_persist_and_unbind() {
    let (store, _tmp) = store();
    store.bind_channel("matrix", "!r1", "research").unwrap();
    store.bind_channel("slack", "C1", "research").unwrap();

    let bindings = store.load_bindings().unwrap();
    assert_eq!(bindings.len(), 2);

    assert!(store.unbind_channel("matrix", "!r1").unwrap());
    assert!(!store.unbind_channel("matrix", "!r1").unwrap());
    assert_eq!(store.load_bindings().unwrap().len(), 1);

    assert_eq!(store.unbind_session("research").unwrap(), 1);
    assert!(store.load_bindings().unwrap().is_empty());
}

#[test]
fn rebinding_a_channel_replaces_the_session() {
    let (store, _tmp) = store();
    store.bind_channel("matrix", "!r1", "research").unwrap();
    store.bind_channel("matrix", "!r1", "ops").unwrap();

    let bindings = store.load_bindings().unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].session_name, "ops");
}

#[test]
fn transcript_tail_returns_newest_in_order() {
    let (store, _tmp) = store();
    for i in 0..5 {
        store
            .append_transcript("research", "user", &format!("message {i}"))
            .unwrap();
    }

    let tail = store.tail_transcript("research", 3).unwrap();
    let bodies: Vec<&str> = tail.iter().map(|e| e.body.as_str()).collect();
    assert_eq!(bodies, vec!["message 2", "message 3", "message 4"]);
}

#[test]
fn transcript_is_per_session() {
    let (store, _tmp) = store();
    store.append_transcript("a", "user", "for a").unwrap();
    store.append_transcript("b", "user", "for b").unwrap();

    let tail = store.tail_transcript("a", 10).unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].body, "for a");
}

#[test]
fn delete_session_cascades_bindings_and_transcript() {
    let (store, _tmp) = store();
    store.get_or_create_session("doomed").unwrap();
    store.bind_channel("matrix", "!r1", "doomed").unwrap();
    store.append_transcript("doomed", "user", "bye").unwrap();

    assert!(store.delete_session("doomed").unwrap());
    assert!(store.get_session("doomed").unwrap().is_none());
    assert!(store.load_bindings().unwrap().is_empty());
    assert!(store.tail_transcript("doomed", 10).unwrap().is_empty());

    assert!(!store.delete_session("doomed").unwrap());
}

#[test]
fn store_reopens_with_existing_data() {
    let tmp = TempDir::new().unwrap();
    {
        let store = SessionStore::new(tmp.path()).unwrap();
        store.get_or_create_session("kept").unwrap();
        store.update_session_id("kept", "id-1").unwrap();
    }
    let store = SessionStore::new(tmp.path()).unwrap();
    let record = store.get_session("kept").unwrap().unwrap();
    assert_eq!(record.session_id.as_deref(), Some("id-1"));
}
