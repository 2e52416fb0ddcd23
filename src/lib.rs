//! Envelope encryption and key management for classified health records.
//!
//! `genevault` protects sensitive records before they reach persistent
//! storage. A [`KeyStore`] holds 32-byte data keys sealed at rest, a
//! [`KeyManager`] layers get-or-create and strict resolution semantics on
//! top of it, an [`EnvelopeCipher`] turns plaintext into self-describing
//! [`Envelope`]s, a [`CloudKeyBackend`] swaps the local store for AWS KMS,
//! Azure Key Vault, or Google Cloud KMS, and a
//! [`ProtectedRecordRepository`] routes each record to the key its
//! classification demands.
//!
//! Two key ids exist out of the box: [`HEALTH_DATA_KEY_ID`] for general
//! health data and [`DNA_DATA_KEY_ID`] for genomic data. The mapping from
//! a record's `data_type` to its key id is total and static, so the same
//! classification always reaches the same key.
//!
//! ```no_run
//! use std::sync::Arc;
//! use genevault::{
//!     KeyManager, KeyMaterial, FileKeyStore, KeyStore, MemoryRecordStore,
//!     ProtectedRecordRepository, RecordPayload,
//! };
//!
//! # fn main() -> genevault::VaultResult<()> {
//! let master = KeyMaterial::random();
//! let store: Arc<dyn KeyStore> = Arc::new(FileKeyStore::open("keys.json", &master)?);
//! let keys = Arc::new(KeyManager::new(store));
//! let records = Arc::new(MemoryRecordStore::new());
//! let repository = ProtectedRecordRepository::new(keys, records)?;
//!
//! let id = repository.save(42, "medical_record", RecordPayload::Text("bp:120/80".into()))?;
//! let payload = repository.get(id)?;
//! # let _ = payload;
//! # Ok(())
//! # }
//! ```

pub mod cipher;
pub mod cloud;
pub mod config;
pub mod error;
pub mod fs_utils;
pub mod models;
pub mod repository;
pub mod storage;

#[cfg(feature = "aws-kms")]
mod aws_kms;
#[cfg(feature = "azure-kms")]
mod azure_kms;
#[cfg(feature = "gcp-kms")]
mod gcp_kms;

pub use cipher::EnvelopeCipher;
pub use cloud::{CloudKey, CloudKeyBackend, LocalKms};
pub use config::{KmsConfig, KmsProvider};
pub use error::{VaultError, VaultResult};
pub use models::{
    Envelope, KeyId, KeyMaterial, KeyRecord, PayloadShape, RecordId, RecordOutcome, RecordPayload,
    StoredRecord, DNA_DATA_KEY_ID, ENVELOPE_ALGORITHM, HEALTH_DATA_KEY_ID,
};
pub use repository::{
    key_id_for_data_type, MemoryRecordStore, ProtectedRecordRepository, RecordStore,
    SqliteRecordStore,
};
pub use storage::{FileKeyStore, KeyStore, MemoryKeyStore, SealedMaterial, SealingEngine};

#[cfg(feature = "aws-kms")]
pub use aws_kms::AwsKms;
#[cfg(feature = "azure-kms")]
pub use azure_kms::AzureKms;
#[cfg(feature = "gcp-kms")]
pub use gcp_kms::GcpKms;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as ParkingMutex;
use tracing::info;

/// Primary facade for key resolution: get-or-create on the encrypt path,
/// strict resolve on the decrypt path.
///
/// Constructed explicitly over an injected store and passed to whatever
/// needs keys; there is no process-global instance.
pub struct KeyManager<S: KeyStore + ?Sized> {
    store: Arc<S>,
    mint_locks: ParkingMutex<HashMap<String, Arc<ParkingMutex<()>>>>,
}

impl<S> KeyManager<S>
where
    S: KeyStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            mint_locks: ParkingMutex::new(HashMap::new()),
        }
    }

    /// Material for `key_id`, minting it on first use.
    ///
    /// Racing callers are serialized per key id and re-check the store
    /// under the lock, so at most one generation event occurs; every
    /// caller sees the same material.
    pub fn get_or_create(&self, key_id: &str) -> VaultResult<KeyMaterial> {
        if let Some(record) = self.store.get(key_id)? {
            return Ok(record.material);
        }
        let mint_lock = self.mint_lock(key_id);
        let _guard = mint_lock.lock();
        if let Some(record) = self.store.get(key_id)? {
            return Ok(record.material);
        }
        let material = self.store.generate(key_id, None)?;
        info!(key_id = %key_id, "minted new data key");
        Ok(material)
    }

    /// Strict lookup for the decrypt path. A missing key is a hard
    /// [`VaultError::KeyNotFound`], never a silent mint: fresh material
    /// could not decrypt anything written under the old id and would
    /// strand that data permanently.
    pub fn resolve(&self, key_id: &str) -> VaultResult<KeyMaterial> {
        match self.store.get(key_id)? {
            Some(record) => Ok(record.material),
            None => Err(VaultError::KeyNotFound(key_id.to_string())),
        }
    }

    /// The stored salt for `key_id`, for derivation and rotation use.
    pub fn salt_for(&self, key_id: &str) -> VaultResult<[u8; models::SALT_LEN]> {
        match self.store.get(key_id)? {
            Some(record) => Ok(record.salt),
            None => Err(VaultError::KeyNotFound(key_id.to_string())),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn mint_lock(&self, key_id: &str) -> Arc<ParkingMutex<()>> {
        let mut locks = self.mint_locks.lock();
        locks
            .entry(key_id.to_string())
            .or_insert_with(|| Arc::new(ParkingMutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager() -> KeyManager<MemoryKeyStore> {
        KeyManager::new(Arc::new(MemoryKeyStore::new()))
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let manager = manager();
        let first = manager.get_or_create("health_data_key").expect("first");
        let second = manager.get_or_create("health_data_key").expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn resolve_never_mints() {
        let manager = manager();
        let err = manager.resolve("health_data_key").expect_err("missing key");
        assert!(matches!(err, VaultError::KeyNotFound(_)));
        // the failed resolve must not have provisioned anything
        assert!(manager
            .store()
            .get("health_data_key")
            .expect("get")
            .is_none());
    }

    #[test]
    fn racing_callers_mint_exactly_once() {
        let manager = Arc::new(manager());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                manager.get_or_create("racy_key").expect("get_or_create")
            }));
        }
        let materials: Vec<KeyMaterial> =
            handles.into_iter().map(|h| h.join().expect("join")).collect();
        let stored = manager
            .store()
            .get("racy_key")
            .expect("get")
            .expect("record present");
        for material in &materials {
            assert_eq!(material, &stored.material);
        }
    }

    #[test]
    fn salt_for_requires_an_existing_key() {
        let manager = manager();
        assert!(matches!(
            manager.salt_for("health_data_key"),
            Err(VaultError::KeyNotFound(_))
        ));
        manager.get_or_create("health_data_key").expect("mint");
        assert_eq!(
            manager.salt_for("health_data_key").expect("salt").len(),
            models::SALT_LEN
        );
    }
}
