use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex as ParkingMutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::cipher::EnvelopeCipher;
use crate::error::{VaultError, VaultResult};
use crate::models::{
    Envelope, PayloadShape, RecordId, RecordOutcome, RecordPayload, StoredRecord,
    DNA_DATA_KEY_ID, HEALTH_DATA_KEY_ID,
};
use crate::storage::KeyStore;
use crate::KeyManager;

/// Static, total mapping from a record's classification to the key id
/// protecting it. Genomic classifications (any `data_type` containing
/// "dna", case-insensitive) get their own key; everything else shares the
/// general health key. Identical inputs always map to the same key.
pub fn key_id_for_data_type(data_type: &str) -> &'static str {
    if data_type.to_ascii_lowercase().contains("dna") {
        DNA_DATA_KEY_ID
    } else {
        HEALTH_DATA_KEY_ID
    }
}

/// Key-value persistence boundary for protected records.
///
/// Implementations never see plaintext; the envelope blob is opaque to
/// them.
pub trait RecordStore: Send + Sync {
    /// Insert or replace the record under its id.
    fn put(&self, record: StoredRecord) -> VaultResult<()>;

    fn get(&self, record_id: RecordId) -> VaultResult<Option<StoredRecord>>;

    /// All records for `owner_id`, optionally narrowed to one
    /// `data_type`, ordered by record id.
    fn list_by_owner(&self, owner_id: i64, data_type: Option<&str>)
        -> VaultResult<Vec<StoredRecord>>;

    /// Remove the record. Returns false if it was absent.
    fn delete(&self, record_id: RecordId) -> VaultResult<bool>;

    /// Highest record id currently stored, so the repository can seed its
    /// id allocator without the store growing allocation semantics.
    fn max_record_id(&self) -> VaultResult<Option<RecordId>>;
}

/// In-memory record store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<RecordId, StoredRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn put(&self, record: StoredRecord) -> VaultResult<()> {
        self.records.write().insert(record.record_id, record);
        Ok(())
    }

    fn get(&self, record_id: RecordId) -> VaultResult<Option<StoredRecord>> {
        Ok(self.records.read().get(&record_id).cloned())
    }

    fn list_by_owner(
        &self,
        owner_id: i64,
        data_type: Option<&str>,
    ) -> VaultResult<Vec<StoredRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|record| record.owner_id == owner_id)
            .filter(|record| data_type.map_or(true, |dt| record.data_type == dt))
            .cloned()
            .collect())
    }

    fn delete(&self, record_id: RecordId) -> VaultResult<bool> {
        Ok(self.records.write().remove(&record_id).is_some())
    }

    fn max_record_id(&self) -> VaultResult<Option<RecordId>> {
        Ok(self.records.read().keys().next_back().copied())
    }
}

/// SQLite-backed record store enabling database deployments.
pub struct SqliteRecordStore {
    conn: ParkingMutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let conn = Connection::open(path).map_err(VaultError::store)?;
        Self::initialise(conn)
    }

    /// Private in-memory database, handy for tests.
    pub fn open_in_memory() -> VaultResult<Self> {
        let conn = Connection::open_in_memory().map_err(VaultError::store)?;
        Self::initialise(conn)
    }

    fn initialise(conn: Connection) -> VaultResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS protected_records (
                record_id INTEGER PRIMARY KEY,
                owner_id INTEGER NOT NULL,
                data_type TEXT NOT NULL,
                payload_shape TEXT NOT NULL,
                envelope BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_protected_records_owner
                ON protected_records (owner_id, data_type);
            "#,
        )
        .map_err(VaultError::store)?;
        Ok(Self {
            conn: ParkingMutex::new(conn),
        })
    }
}

type RawRecord = (i64, i64, String, String, Vec<u8>);

fn record_from_raw((record_id, owner_id, data_type, shape, envelope): RawRecord) -> VaultResult<StoredRecord> {
    Ok(StoredRecord {
        record_id,
        owner_id,
        data_type,
        shape: PayloadShape::from_tag(&shape)?,
        envelope,
    })
}

impl RecordStore for SqliteRecordStore {
    fn put(&self, record: StoredRecord) -> VaultResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO protected_records
                 (record_id, owner_id, data_type, payload_shape, envelope)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.record_id,
                record.owner_id,
                record.data_type,
                record.shape.as_str(),
                record.envelope,
            ],
        )
        .map_err(VaultError::store)?;
        Ok(())
    }

    fn get(&self, record_id: RecordId) -> VaultResult<Option<StoredRecord>> {
        let conn = self.conn.lock();
        let raw: Option<RawRecord> = conn
            .query_row(
                "SELECT record_id, owner_id, data_type, payload_shape, envelope
                   FROM protected_records WHERE record_id = ?1",
                params![record_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .map_err(VaultError::store)?;
        raw.map(record_from_raw).transpose()
    }

    fn list_by_owner(
        &self,
        owner_id: i64,
        data_type: Option<&str>,
    ) -> VaultResult<Vec<StoredRecord>> {
        let conn = self.conn.lock();
        let raw: Vec<RawRecord> = match data_type {
            Some(data_type) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT record_id, owner_id, data_type, payload_shape, envelope
                           FROM protected_records
                          WHERE owner_id = ?1 AND data_type = ?2
                          ORDER BY record_id",
                    )
                    .map_err(VaultError::store)?;
                let rows = stmt
                    .query_map(params![owner_id, data_type], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    })
                    .map_err(VaultError::store)?;
                rows.collect::<Result<_, _>>().map_err(VaultError::store)?
            }
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT record_id, owner_id, data_type, payload_shape, envelope
                           FROM protected_records
                          WHERE owner_id = ?1
                          ORDER BY record_id",
                    )
                    .map_err(VaultError::store)?;
                let rows = stmt
                    .query_map(params![owner_id], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    })
                    .map_err(VaultError::store)?;
                rows.collect::<Result<_, _>>().map_err(VaultError::store)?
            }
        };
        raw.into_iter().map(record_from_raw).collect()
    }

    fn delete(&self, record_id: RecordId) -> VaultResult<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "DELETE FROM protected_records WHERE record_id = ?1",
                params![record_id],
            )
            .map_err(VaultError::store)?;
        Ok(changed > 0)
    }

    fn max_record_id(&self) -> VaultResult<Option<RecordId>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT MAX(record_id) FROM protected_records", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .map_err(VaultError::store)
    }
}

/// Routes each record to the key its classification demands, encrypts
/// through [`EnvelopeCipher`], and persists opaque envelopes in a
/// [`RecordStore`].
///
/// Key material and record blobs have independent lifecycles: deleting a
/// record leaves its key untouched, because classification keys are
/// shared across many records.
pub struct ProtectedRecordRepository<S: KeyStore + ?Sized, R: RecordStore + ?Sized> {
    keys: Arc<KeyManager<S>>,
    records: Arc<R>,
    next_id: AtomicI64,
}

impl<S, R> ProtectedRecordRepository<S, R>
where
    S: KeyStore + ?Sized,
    R: RecordStore + ?Sized,
{
    /// Wire the repository to an explicitly constructed key manager and
    /// record store. The id allocator resumes after the highest stored
    /// id.
    pub fn new(keys: Arc<KeyManager<S>>, records: Arc<R>) -> VaultResult<Self> {
        let next_id = records.max_record_id()?.unwrap_or(0) + 1;
        Ok(Self {
            keys,
            records,
            next_id: AtomicI64::new(next_id),
        })
    }

    /// Encrypt `payload` under the key for `data_type` and persist it.
    /// The key is minted on first use of its classification.
    pub fn save(
        &self,
        owner_id: i64,
        data_type: &str,
        payload: RecordPayload,
    ) -> VaultResult<RecordId> {
        let key_id = key_id_for_data_type(data_type);
        let material = self.keys.get_or_create(key_id)?;
        let envelope =
            EnvelopeCipher::for_key(key_id, material).encrypt(&payload.encode()?, None)?;
        let record_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records.put(StoredRecord {
            record_id,
            owner_id,
            data_type: data_type.to_string(),
            shape: payload.shape(),
            envelope: envelope.to_bytes()?,
        })?;
        Ok(record_id)
    }

    /// Decrypt one record. Absence is `Ok(None)`; an undecryptable record
    /// is an error.
    pub fn get(&self, record_id: RecordId) -> VaultResult<Option<RecordPayload>> {
        match self.records.get(record_id)? {
            Some(record) => self.open_record(&record).map(Some),
            None => Ok(None),
        }
    }

    /// Decrypt every record for `owner_id`, optionally narrowed to one
    /// `data_type`. Failures are reported per record; one undecryptable
    /// record never hides its neighbors.
    pub fn get_by_owner(
        &self,
        owner_id: i64,
        data_type: Option<&str>,
    ) -> VaultResult<Vec<RecordOutcome>> {
        let stored = self.records.list_by_owner(owner_id, data_type)?;
        let mut outcomes = Vec::with_capacity(stored.len());
        for record in stored {
            let outcome = self.open_record(&record);
            if let Err(err) = &outcome {
                warn!(record_id = record.record_id, error = %err, "record failed to decrypt");
            }
            outcomes.push(RecordOutcome {
                record_id: record.record_id,
                data_type: record.data_type,
                outcome,
            });
        }
        Ok(outcomes)
    }

    /// Remove the stored envelope only. The classification key survives;
    /// other records depend on it.
    pub fn delete(&self, record_id: RecordId) -> VaultResult<bool> {
        self.records.delete(record_id)
    }

    fn open_record(&self, record: &StoredRecord) -> VaultResult<RecordPayload> {
        let envelope = Envelope::from_bytes(&record.envelope)?;
        let key_id = match envelope.key_id.as_deref() {
            Some(id) => id.to_string(),
            None => key_id_for_data_type(&record.data_type).to_string(),
        };
        let material = self.keys.resolve(&key_id)?;
        let plaintext = EnvelopeCipher::new(material).decrypt(&envelope)?;
        RecordPayload::decode(record.shape, &plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PayloadShape;

    #[test]
    fn dna_classifications_get_their_own_key() {
        assert_eq!(key_id_for_data_type("dna_analysis"), DNA_DATA_KEY_ID);
        assert_eq!(key_id_for_data_type("DNA_TEST"), DNA_DATA_KEY_ID);
        assert_eq!(key_id_for_data_type("mitochondrial-dna"), DNA_DATA_KEY_ID);
        assert_eq!(key_id_for_data_type("medical_record"), HEALTH_DATA_KEY_ID);
        assert_eq!(key_id_for_data_type("lab_result"), HEALTH_DATA_KEY_ID);
        assert_eq!(key_id_for_data_type(""), HEALTH_DATA_KEY_ID);
    }

    #[test]
    fn mapping_is_deterministic() {
        for data_type in ["dna_analysis", "medical_record", "prescription"] {
            assert_eq!(
                key_id_for_data_type(data_type),
                key_id_for_data_type(data_type)
            );
        }
    }

    fn sample_record(record_id: RecordId, owner_id: i64, data_type: &str) -> StoredRecord {
        StoredRecord {
            record_id,
            owner_id,
            data_type: data_type.to_string(),
            shape: PayloadShape::Text,
            envelope: format!("blob-{record_id}").into_bytes(),
        }
    }

    #[test]
    fn memory_store_filters_by_owner_and_type() {
        let store = MemoryRecordStore::new();
        store.put(sample_record(1, 42, "medical_record")).expect("put");
        store.put(sample_record(2, 42, "dna_analysis")).expect("put");
        store.put(sample_record(3, 7, "medical_record")).expect("put");

        assert_eq!(store.list_by_owner(42, None).expect("list").len(), 2);
        let narrowed = store
            .list_by_owner(42, Some("dna_analysis"))
            .expect("list");
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].record_id, 2);
        assert_eq!(store.max_record_id().expect("max"), Some(3));

        assert!(store.delete(2).expect("delete"));
        assert!(!store.delete(2).expect("second delete"));
        assert_eq!(store.get(2).expect("get"), None);
    }

    #[test]
    fn sqlite_store_round_trips_records() {
        let store = SqliteRecordStore::open_in_memory().expect("open");
        assert_eq!(store.max_record_id().expect("max"), None);

        let record = StoredRecord {
            record_id: 7,
            owner_id: 42,
            data_type: "medical_record".to_string(),
            shape: PayloadShape::Structured,
            envelope: vec![1, 2, 3, 4],
        };
        store.put(record.clone()).expect("put");

        let fetched = store.get(7).expect("get").expect("present");
        assert_eq!(fetched, record);
        assert_eq!(store.max_record_id().expect("max"), Some(7));

        let listed = store.list_by_owner(42, Some("medical_record")).expect("list");
        assert_eq!(listed, vec![record]);
        assert!(store.list_by_owner(42, Some("dna_analysis")).expect("list").is_empty());

        assert!(store.delete(7).expect("delete"));
        assert_eq!(store.get(7).expect("get"), None);
    }

    #[test]
    fn sqlite_put_replaces_in_place() {
        let store = SqliteRecordStore::open_in_memory().expect("open");
        let mut record = sample_record(5, 42, "medical_record");
        store.put(record.clone()).expect("put");
        record.envelope = b"rewritten".to_vec();
        store.put(record.clone()).expect("replace");
        assert_eq!(store.get(5).expect("get").expect("present"), record);
        assert_eq!(store.list_by_owner(42, None).expect("list").len(), 1);
    }
}
