use std::collections::BTreeMap;

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{VaultError, VaultResult};

/// Logical name of a data key. Stable for the lifetime of everything
/// encrypted under it.
pub type KeyId = String;

/// Key id protecting general health records.
pub const HEALTH_DATA_KEY_ID: &str = "health_data_key";

/// Key id protecting genomic records.
pub const DNA_DATA_KEY_ID: &str = "dna_data_key";

/// Algorithm tag stamped on every envelope this crate produces.
pub const ENVELOPE_ALGORITHM: &str = "AES-256-CBC";

/// Data keys are always 256 bits.
pub const KEY_LEN: usize = 32;

/// Per-key salt stored for derivation and rotation use.
pub const SALT_LEN: usize = 16;

/// AES block size; also the CBC initialization vector length.
pub const IV_LEN: usize = 16;

/// 32 bytes of symmetric key material.
///
/// Deliberately not serializable: material leaves the process only in
/// sealed form via a key store. The debug representation is redacted and
/// the bytes are zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh material from the operating system RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> VaultResult<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            VaultError::config(format!(
                "key material must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

/// A provisioned key as returned by a [`KeyStore`](crate::KeyStore)
/// lookup.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub key_id: KeyId,
    pub material: KeyMaterial,
    pub salt: [u8; SALT_LEN],
    pub created_at: OffsetDateTime,
}

/// Self-describing encrypted payload.
///
/// The wire form is JSON with base64 binary fields. `key_id` records which
/// data key produced the ciphertext so the decrypt path can re-resolve it;
/// `metadata` carries caller context and is neither encrypted nor
/// authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<KeyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Envelope {
    /// Wire form persisted by the record layer.
    pub fn to_bytes(&self) -> VaultResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(VaultError::store)
    }

    /// Parse the persisted wire form. A blob that does not parse is
    /// undecryptable, so the failure surfaces as `DecryptionFailed`.
    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| VaultError::decryption(format!("malformed envelope: {err}")))
    }
}

mod b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Storage key for protected records.
pub type RecordId = i64;

/// Declared shape of a record's plaintext. Recorded alongside the
/// envelope so retrieval decodes by declaration instead of sniffing the
/// decrypted bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadShape {
    Structured,
    Text,
}

impl PayloadShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Text => "text",
        }
    }

    pub fn from_tag(tag: &str) -> VaultResult<Self> {
        match tag {
            "structured" => Ok(Self::Structured),
            "text" => Ok(Self::Text),
            other => Err(VaultError::store(format!("unknown payload shape: {other}"))),
        }
    }
}

/// Plaintext of a protected record, in its caller-declared shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    Structured(Value),
    Text(String),
}

impl RecordPayload {
    pub fn shape(&self) -> PayloadShape {
        match self {
            Self::Structured(_) => PayloadShape::Structured,
            Self::Text(_) => PayloadShape::Text,
        }
    }

    /// Bytes handed to the cipher.
    pub fn encode(&self) -> VaultResult<Vec<u8>> {
        match self {
            Self::Structured(value) => serde_json::to_vec(value).map_err(VaultError::store),
            Self::Text(text) => Ok(text.clone().into_bytes()),
        }
    }

    /// Decode decrypted bytes according to the declared shape. A mismatch
    /// means the record cannot be returned, so it is a decryption failure.
    pub fn decode(shape: PayloadShape, bytes: &[u8]) -> VaultResult<Self> {
        match shape {
            PayloadShape::Structured => serde_json::from_slice(bytes)
                .map(Self::Structured)
                .map_err(|err| {
                    VaultError::decryption(format!(
                        "payload declared structured but does not parse: {err}"
                    ))
                }),
            PayloadShape::Text => String::from_utf8(bytes.to_vec())
                .map(Self::Text)
                .map_err(|_| VaultError::decryption("payload declared text but is not valid UTF-8")),
        }
    }
}

/// Row shape at the record-store boundary: an owner-scoped, classified,
/// opaque envelope blob. Stores never see plaintext.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record_id: RecordId,
    pub owner_id: i64,
    pub data_type: String,
    pub shape: PayloadShape,
    pub envelope: Vec<u8>,
}

/// Per-record result of a bulk retrieval. One record failing to decrypt
/// never hides its neighbors.
#[derive(Debug)]
pub struct RecordOutcome {
    pub record_id: RecordId,
    pub data_type: String,
    pub outcome: VaultResult<RecordPayload>,
}
