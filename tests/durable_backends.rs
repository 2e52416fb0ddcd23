use std::sync::Arc;

use genevault::{
    FileKeyStore, KeyManager, KeyMaterial, KeyStore, PayloadShape, ProtectedRecordRepository,
    RecordPayload, RecordStore, SqliteRecordStore, StoredRecord,
};
use tempfile::TempDir;

#[test]
fn key_document_is_swapped_atomically() {
    let dir = TempDir::new().expect("tempdir");
    let master = KeyMaterial::random();
    let path = dir.path().join("keys.json");
    let store = FileKeyStore::open(&path, &master).expect("open store");

    for key_id in ["health_data_key", "dna_data_key", "research_key"] {
        store.generate(key_id, None).expect("generate");
        // every rewrite leaves a parseable document and no temp residue
        let document = std::fs::read_to_string(&path).expect("read document");
        serde_json::from_str::<serde_json::Value>(&document).expect("valid json");
        assert!(!dir.path().join("keys.json.tmp").exists());
    }
}

#[cfg(unix)]
#[test]
fn key_document_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().expect("tempdir");
    let master = KeyMaterial::random();
    let path = dir.path().join("vault").join("keys.json");
    let store = FileKeyStore::open(&path, &master).expect("open store");
    store.generate("health_data_key", None).expect("generate");

    let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode();
    assert_eq!(file_mode & 0o777, 0o600);
    let dir_mode = std::fs::metadata(path.parent().expect("parent"))
        .expect("dir metadata")
        .permissions()
        .mode();
    assert_eq!(dir_mode & 0o777, 0o700);
}

#[test]
fn sqlite_records_survive_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("records.db");

    {
        let store = SqliteRecordStore::open(&path).expect("open");
        store
            .put(StoredRecord {
                record_id: 7,
                owner_id: 42,
                data_type: "medical_record".to_string(),
                shape: PayloadShape::Text,
                envelope: b"opaque".to_vec(),
            })
            .expect("put");
    }

    let store = SqliteRecordStore::open(&path).expect("reopen");
    let record = store.get(7).expect("get").expect("present");
    assert_eq!(record.owner_id, 42);
    assert_eq!(record.envelope, b"opaque");
    assert_eq!(store.max_record_id().expect("max"), Some(7));
}

#[test]
fn record_ids_resume_after_restart() {
    let dir = TempDir::new().expect("tempdir");
    let keys_path = dir.path().join("keys.json");
    let records_path = dir.path().join("records.db");
    let master = KeyMaterial::random();

    let first_id = {
        let store: Arc<dyn KeyStore> =
            Arc::new(FileKeyStore::open(&keys_path, &master).expect("open keys"));
        let keys = Arc::new(KeyManager::new(store));
        let records = Arc::new(SqliteRecordStore::open(&records_path).expect("open records"));
        let repository = ProtectedRecordRepository::new(keys, records).expect("repository");
        repository
            .save(42, "medical_record", RecordPayload::Text("bp:120/80".into()))
            .expect("save")
    };

    let store: Arc<dyn KeyStore> =
        Arc::new(FileKeyStore::open(&keys_path, &master).expect("reopen keys"));
    let keys = Arc::new(KeyManager::new(store));
    let records = Arc::new(SqliteRecordStore::open(&records_path).expect("reopen records"));
    let repository = ProtectedRecordRepository::new(keys, records).expect("repository");

    let second_id = repository
        .save(42, "medical_record", RecordPayload::Text("bp:118/79".into()))
        .expect("save after restart");
    assert!(second_id > first_id);

    // both generations of records decrypt with the persisted key
    match repository.get(first_id).expect("get first") {
        Some(RecordPayload::Text(text)) => assert_eq!(text, "bp:120/80"),
        other => panic!("unexpected payload: {other:?}"),
    }
    match repository.get(second_id).expect("get second") {
        Some(RecordPayload::Text(text)) => assert_eq!(text, "bp:118/79"),
        other => panic!("unexpected payload: {other:?}"),
    }
}
