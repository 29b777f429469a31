use std::fs;

use harvest_core::storage::StorageError;
use harvest_core::{FileStorage, RunParameters, Session, Storage, StorageConfig, Target, TaskResult};
use tempfile::TempDir;

fn create_test_storage() -> (FileStorage, TempDir, StorageConfig) {
    let temp_dir = TempDir::new().unwrap();
    let config = StorageConfig {
        data_dir: temp_dir.path().to_string_lossy().to_string(),
        ..StorageConfig::default()
    };
    let storage = FileStorage::with_config(config.clone());
    (storage, temp_dir, config)
}

fn session(id: &str, names: &[&str]) -> Session {
    let targets = names
        .iter()
        .map(|n| Target::from_path(format!("/certs/{n}.jks")))
        .collect();
    Session::new(id, RunParameters::new("/certs", "?d?d?d", "batch"), targets).unwrap()
}

#[test]
fn test_save_and_load_session() {
    let (storage, _temp, _config) = create_test_storage();

    let mut original = session("abc123", &["a", "b"]);
    let id = original.tasks()[0].target_id.clone();
    original.begin(&id).unwrap();
    original.complete(&id, TaskResult::new("changeit")).unwrap();
    storage.save_session(&original).unwrap();

    let loaded = storage.load_session("abc123").unwrap();
    assert_eq!(loaded, original);
}

#[test]
fn test_document_shape() {
    let (storage, _temp, _config) = create_test_storage();

    let mut doc = session("shape", &["a"]);
    let id = doc.tasks()[0].target_id.clone();
    doc.begin(&id).unwrap();
    doc.fail(&id, "bad container").unwrap();
    storage.save_session(&doc).unwrap();

    let raw = fs::read_to_string(storage.session_file("shape")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["failed_count"], 1);
    assert_eq!(value["tasks"][0]["status"], "failed");
    assert_eq!(value["tasks"][0]["error"], "bad container");
    assert!(value["tasks"][0].get("result").is_none());
}

#[test]
fn test_load_missing_and_corrupt() {
    let (storage, _temp, _config) = create_test_storage();

    assert!(storage.load_session("nope").unwrap_err().is_not_found());

    storage.save_session(&session("broken", &["a"])).unwrap();
    fs::write(storage.session_file("broken"), "{ not json").unwrap();
    assert!(matches!(
        storage.load_session("broken"),
        Err(StorageError::Corrupt { .. })
    ));
}

#[test]
fn test_counter_drift_is_corrupt() {
    let (storage, _temp, _config) = create_test_storage();
    storage.save_session(&session("drift", &["a", "b"])).unwrap();

    let path = storage.session_file("drift");
    let mut value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    value["completed_count"] = serde_json::json!(2);
    fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

    assert!(matches!(
        storage.load_session("drift"),
        Err(StorageError::Corrupt { .. })
    ));
}

#[test]
fn test_list_skips_unreadable_documents() {
    let (storage, _temp, config) = create_test_storage();

    storage.save_session(&session("first", &["a"])).unwrap();
    storage.save_session(&session("second", &["b"])).unwrap();
    fs::write(config.sessions_path().join("garbage.json"), "[]").unwrap();
    fs::write(config.sessions_path().join("notes.txt"), "ignored").unwrap();

    let listed = storage.list_sessions().unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[0].updated_at >= listed[1].updated_at);
}

#[test]
fn test_delete_removes_work_dir() {
    let (storage, _temp, config) = create_test_storage();
    storage.save_session(&session("gone", &["a"])).unwrap();

    let work = config.work_path("gone");
    fs::create_dir_all(&work).unwrap();
    fs::write(work.join("hashes.txt"), "h\n").unwrap();

    storage.delete_session("gone").unwrap();
    assert!(!storage.session_file("gone").exists());
    assert!(!work.exists());
    assert!(storage.delete_session("gone").unwrap_err().is_not_found());
}
