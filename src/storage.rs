use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose, Engine as _};
use fs2::FileExt;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex as ParkingMutex, RwLock};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use tracing::warn;

use crate::error::{VaultError, VaultResult};
use crate::fs_utils;
use crate::models::{KeyId, KeyMaterial, KeyRecord, SALT_LEN};

type HmacSha256 = Hmac<Sha256>;

const SEAL_NONCE_LEN: usize = 12;

/// Durable mapping from key id to key material.
///
/// Absence is reported as `Ok(None)`; the strict lookup that turns
/// absence into an error lives in
/// [`KeyManager::resolve`](crate::KeyManager::resolve).
pub trait KeyStore: Send + Sync {
    /// Provision fresh material for `key_id`, drawing a random 16-byte
    /// salt when none is supplied. Overwrites any existing record;
    /// callers that need create-only semantics go through
    /// [`KeyManager::get_or_create`](crate::KeyManager::get_or_create).
    fn generate(&self, key_id: &str, salt: Option<[u8; SALT_LEN]>) -> VaultResult<KeyMaterial>;

    /// Pure lookup, no side effects.
    fn get(&self, key_id: &str) -> VaultResult<Option<KeyRecord>>;

    /// Remove the record for `key_id`. Returns false if it was absent.
    fn delete(&self, key_id: &str) -> VaultResult<bool>;
}

/// Seals key material for the at-rest document.
///
/// AES-256-GCM with the key id as associated data, plus an HMAC-SHA256
/// tag over nonce, key id, and ciphertext so tampering is reported before
/// decryption is attempted. Both subkeys come from one master secret via
/// HKDF-SHA256.
pub struct SealingEngine {
    seal_key: [u8; 32],
    mac_key: [u8; 32],
}

/// Output of [`SealingEngine::seal`]: nonce-prefixed ciphertext plus the
/// integrity tag, both destined for base64 in the document.
pub struct SealedMaterial {
    pub sealed: Vec<u8>,
    pub tag: Vec<u8>,
}

impl SealingEngine {
    pub fn new(master: &KeyMaterial) -> VaultResult<Self> {
        let hkdf = Hkdf::<Sha256>::new(None, master.as_bytes());
        let mut seal_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        hkdf.expand(b"genevault/key-store/seal", &mut seal_key)
            .map_err(|_| VaultError::store("HKDF expansion failed for seal key"))?;
        hkdf.expand(b"genevault/key-store/mac", &mut mac_key)
            .map_err(|_| VaultError::store("HKDF expansion failed for mac key"))?;
        Ok(Self { seal_key, mac_key })
    }

    pub fn seal(&self, key_id: &str, material: &KeyMaterial) -> VaultResult<SealedMaterial> {
        let cipher = Aes256Gcm::new_from_slice(&self.seal_key).map_err(VaultError::store)?;
        let mut nonce = [0u8; SEAL_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    aad: key_id.as_bytes(),
                    msg: material.as_bytes(),
                },
            )
            .map_err(|_| VaultError::store("failed to seal key material"))?;

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key).map_err(VaultError::store)?;
        mac.update(&nonce);
        mac.update(key_id.as_bytes());
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes().to_vec();

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(SealedMaterial { sealed, tag })
    }

    pub fn open(&self, key_id: &str, sealed: &[u8], tag: &[u8]) -> VaultResult<KeyMaterial> {
        if sealed.len() <= SEAL_NONCE_LEN {
            return Err(VaultError::store(format!(
                "sealed entry for {key_id} is truncated"
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(SEAL_NONCE_LEN);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key).map_err(VaultError::store)?;
        mac.update(nonce);
        mac.update(key_id.as_bytes());
        mac.update(ciphertext);
        mac.verify_slice(tag).map_err(|_| {
            VaultError::store(format!("key store entry for {key_id} failed integrity check"))
        })?;

        let cipher = Aes256Gcm::new_from_slice(&self.seal_key).map_err(VaultError::store)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    aad: key_id.as_bytes(),
                    msg: ciphertext,
                },
            )
            .map_err(|_| {
                VaultError::store(format!("failed to unseal key material for {key_id}"))
            })?;
        KeyMaterial::try_from_slice(&plaintext).map_err(|_| {
            VaultError::store(format!("unsealed material for {key_id} has invalid length"))
        })
    }
}

/// On-disk form of one provisioned key. All binary fields are base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKeyEntry {
    /// nonce followed by the AES-GCM ciphertext of the 32-byte material.
    material: String,
    /// HMAC-SHA256 over nonce, key id, and ciphertext.
    mac: String,
    salt: String,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

type KeyDocument = BTreeMap<KeyId, StoredKeyEntry>;

/// Key store backed by a single JSON document of sealed entries.
///
/// Mutations rewrite the document atomically (temp file plus rename), so
/// a failed generate leaves no partial record behind. Writers are
/// serialized by an in-process mutex and a sidecar advisory lock; readers
/// take the advisory lock shared.
pub struct FileKeyStore {
    path: PathBuf,
    lock_path: PathBuf,
    sealing: SealingEngine,
    write_lock: ParkingMutex<()>,
}

impl FileKeyStore {
    /// Open (or create) the document at `path`, sealing entries under
    /// subkeys derived from `master`. A document that exists but does not
    /// parse fails here rather than on first use.
    pub fn open<P: AsRef<Path>>(path: P, master: &KeyMaterial) -> VaultResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs_utils::secure_dir(parent).map_err(VaultError::store)?;
            }
        }
        let store = Self {
            lock_path: fs_utils::sibling_path(&path, ".lock"),
            path,
            sealing: SealingEngine::new(master)?,
            write_lock: ParkingMutex::new(()),
        };
        store.load_document()?;
        Ok(store)
    }

    fn lock_file(&self) -> VaultResult<File> {
        let mut options = OpenOptions::new();
        options.create(true).write(true);
        fs_utils::open_secure(&self.lock_path, &mut options).map_err(VaultError::store)
    }

    fn load_document(&self) -> VaultResult<KeyDocument> {
        let lock = self.lock_file()?;
        FileExt::lock_shared(&lock).map_err(VaultError::store)?;
        let result = self.read_document();
        let _ = FileExt::unlock(&lock);
        result
    }

    fn read_document(&self) -> VaultResult<KeyDocument> {
        if !self.path.exists() {
            return Ok(KeyDocument::new());
        }
        fs_utils::restrict_permissions(&self.path).map_err(VaultError::store)?;
        let file = File::open(&self.path).map_err(VaultError::store)?;
        serde_json::from_reader(BufReader::new(file)).map_err(VaultError::store)
    }

    fn write_document(&self, document: &KeyDocument) -> VaultResult<()> {
        let bytes = serde_json::to_vec_pretty(document).map_err(VaultError::store)?;
        fs_utils::write_atomic(&self.path, &bytes).map_err(VaultError::store)
    }

    fn generate_locked(
        &self,
        key_id: &str,
        salt: Option<[u8; SALT_LEN]>,
    ) -> VaultResult<KeyMaterial> {
        let mut document = self.read_document()?;
        if document.contains_key(key_id) {
            warn!(key_id = %key_id, "overwriting existing key material");
        }
        let material = KeyMaterial::random();
        let salt = salt.unwrap_or_else(random_salt);
        let SealedMaterial { sealed, tag } = self.sealing.seal(key_id, &material)?;
        document.insert(
            key_id.to_string(),
            StoredKeyEntry {
                material: general_purpose::STANDARD.encode(sealed),
                mac: general_purpose::STANDARD.encode(tag),
                salt: general_purpose::STANDARD.encode(salt),
                created_at: OffsetDateTime::now_utc(),
            },
        );
        self.write_document(&document)?;
        Ok(material)
    }

    fn delete_locked(&self, key_id: &str) -> VaultResult<bool> {
        let mut document = self.read_document()?;
        if document.remove(key_id).is_none() {
            return Ok(false);
        }
        self.write_document(&document)?;
        Ok(true)
    }
}

impl std::fmt::Debug for FileKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKeyStore")
            .field("path", &self.path)
            .field("lock_path", &self.lock_path)
            .finish_non_exhaustive()
    }
}

impl KeyStore for FileKeyStore {
    fn generate(&self, key_id: &str, salt: Option<[u8; SALT_LEN]>) -> VaultResult<KeyMaterial> {
        let _guard = self.write_lock.lock();
        let lock = self.lock_file()?;
        FileExt::lock_exclusive(&lock).map_err(VaultError::store)?;
        let result = self.generate_locked(key_id, salt);
        let _ = FileExt::unlock(&lock);
        result
    }

    fn get(&self, key_id: &str) -> VaultResult<Option<KeyRecord>> {
        let document = self.load_document()?;
        let entry = match document.get(key_id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let sealed = general_purpose::STANDARD
            .decode(&entry.material)
            .map_err(VaultError::store)?;
        let tag = general_purpose::STANDARD
            .decode(&entry.mac)
            .map_err(VaultError::store)?;
        let material = self.sealing.open(key_id, &sealed, &tag)?;
        let salt_bytes = general_purpose::STANDARD
            .decode(&entry.salt)
            .map_err(VaultError::store)?;
        let salt: [u8; SALT_LEN] = salt_bytes.as_slice().try_into().map_err(|_| {
            VaultError::store(format!("stored salt for {key_id} has invalid length"))
        })?;
        Ok(Some(KeyRecord {
            key_id: key_id.to_string(),
            material,
            salt,
            created_at: entry.created_at,
        }))
    }

    fn delete(&self, key_id: &str) -> VaultResult<bool> {
        let _guard = self.write_lock.lock();
        let lock = self.lock_file()?;
        FileExt::lock_exclusive(&lock).map_err(VaultError::store)?;
        let result = self.delete_locked(key_id);
        let _ = FileExt::unlock(&lock);
        result
    }
}

/// In-memory store for tests and ephemeral deployments. Material is held
/// unsealed and disappears with the process.
#[derive(Default)]
pub struct MemoryKeyStore {
    records: RwLock<HashMap<KeyId, KeyRecord>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn generate(&self, key_id: &str, salt: Option<[u8; SALT_LEN]>) -> VaultResult<KeyMaterial> {
        let mut records = self.records.write();
        if records.contains_key(key_id) {
            warn!(key_id = %key_id, "overwriting existing key material");
        }
        let material = KeyMaterial::random();
        records.insert(
            key_id.to_string(),
            KeyRecord {
                key_id: key_id.to_string(),
                material: material.clone(),
                salt: salt.unwrap_or_else(random_salt),
                created_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(material)
    }

    fn get(&self, key_id: &str) -> VaultResult<Option<KeyRecord>> {
        Ok(self.records.read().get(key_id).cloned())
    }

    fn delete(&self, key_id: &str) -> VaultResult<bool> {
        Ok(self.records.write().remove(key_id).is_some())
    }
}

fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}
