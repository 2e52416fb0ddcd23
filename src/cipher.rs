use std::collections::BTreeMap;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};

use crate::error::{VaultError, VaultResult};
use crate::models::{Envelope, KeyId, KeyMaterial, ENVELOPE_ALGORITHM, IV_LEN, KEY_LEN};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Stateless AES-256-CBC cipher bound to one 32-byte key.
///
/// Every encryption draws a fresh random initialization vector, so equal
/// plaintexts produce different envelopes. PKCS7 padding always adds at
/// least one byte; decrypting with the wrong key fails the padding check
/// and is reported as [`VaultError::DecryptionFailed`].
pub struct EnvelopeCipher {
    key: KeyMaterial,
    key_id: Option<KeyId>,
}

impl EnvelopeCipher {
    /// Cipher over externally supplied material. Envelopes carry no
    /// key id.
    pub fn new(key: KeyMaterial) -> Self {
        Self { key, key_id: None }
    }

    /// Cipher over material resolved by identifier. Envelopes record the
    /// id so the decrypt path can re-resolve the same key.
    pub fn for_key(key_id: impl Into<KeyId>, key: KeyMaterial) -> Self {
        Self {
            key,
            key_id: Some(key_id.into()),
        }
    }

    /// Key derived from a passphrase the legacy way: pad with ASCII
    /// spaces to 32 bytes, truncate beyond. Kept so data written before
    /// managed keys existed stays readable; new callers should resolve
    /// material through [`KeyManager`](crate::KeyManager).
    pub fn from_legacy_passphrase(passphrase: &[u8]) -> Self {
        let mut key = [0x20u8; KEY_LEN];
        let take = passphrase.len().min(KEY_LEN);
        key[..take].copy_from_slice(&passphrase[..take]);
        Self::new(KeyMaterial::from_bytes(key))
    }

    pub fn encrypt(
        &self,
        plaintext: &[u8],
        metadata: Option<BTreeMap<String, String>>,
    ) -> VaultResult<Envelope> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = Aes256CbcEnc::new(self.key.as_bytes().into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        Ok(Envelope {
            iv: iv.to_vec(),
            ciphertext,
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            key_id: self.key_id.clone(),
            metadata,
        })
    }

    pub fn decrypt(&self, envelope: &Envelope) -> VaultResult<Vec<u8>> {
        if envelope.algorithm != ENVELOPE_ALGORITHM {
            return Err(VaultError::DecryptionFailed(format!(
                "unsupported envelope algorithm: {}",
                envelope.algorithm
            )));
        }
        if envelope.iv.len() != IV_LEN {
            return Err(VaultError::DecryptionFailed(format!(
                "initialization vector must be {IV_LEN} bytes, got {}",
                envelope.iv.len()
            )));
        }
        if envelope.ciphertext.is_empty() || envelope.ciphertext.len() % IV_LEN != 0 {
            return Err(VaultError::DecryptionFailed(format!(
                "ciphertext length {} is not a whole number of blocks",
                envelope.ciphertext.len()
            )));
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&envelope.iv);
        Aes256CbcDec::new(self.key.as_bytes().into(), (&iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(&envelope.ciphertext)
            .map_err(|_| {
                VaultError::DecryptionFailed(
                    "padding check failed: wrong key or corrupted ciphertext".to_string(),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> EnvelopeCipher {
        EnvelopeCipher::new(KeyMaterial::random())
    }

    #[test]
    fn round_trips_plaintext() {
        let cipher = cipher();
        let envelope = cipher.encrypt(b"blood_type:O+", None).expect("encrypt");
        assert_eq!(envelope.algorithm, ENVELOPE_ALGORITHM);
        assert_eq!(envelope.iv.len(), IV_LEN);
        assert_eq!(cipher.decrypt(&envelope).expect("decrypt"), b"blood_type:O+");
    }

    #[test]
    fn equal_plaintexts_produce_distinct_envelopes() {
        let cipher = cipher();
        let first = cipher.encrypt(b"genome sequence", None).expect("encrypt");
        let second = cipher.encrypt(b"genome sequence", None).expect("encrypt");
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
        assert_eq!(cipher.decrypt(&first).expect("decrypt"), b"genome sequence");
        assert_eq!(cipher.decrypt(&second).expect("decrypt"), b"genome sequence");
    }

    #[test]
    fn padding_always_extends_ciphertext() {
        let cipher = cipher();
        let short = cipher.encrypt(&[7u8; 13], None).expect("encrypt");
        assert_eq!(short.ciphertext.len(), 16);
        let exact = cipher.encrypt(&[7u8; 16], None).expect("encrypt");
        assert_eq!(exact.ciphertext.len(), 32);
        let empty = cipher.encrypt(b"", None).expect("encrypt");
        assert_eq!(empty.ciphertext.len(), 16);
        assert_eq!(cipher.decrypt(&empty).expect("decrypt"), b"");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let envelope = cipher().encrypt(b"patient:42", None).expect("encrypt");
        let err = cipher().decrypt(&envelope).expect_err("different key must fail");
        assert!(matches!(err, VaultError::DecryptionFailed(_)));
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        let cipher = cipher();
        let good = cipher.encrypt(b"payload", None).expect("encrypt");

        let mut wrong_algorithm = good.clone();
        wrong_algorithm.algorithm = "AES-256-GCM".to_string();
        assert!(matches!(
            cipher.decrypt(&wrong_algorithm),
            Err(VaultError::DecryptionFailed(_))
        ));

        let mut short_iv = good.clone();
        short_iv.iv.truncate(8);
        assert!(matches!(
            cipher.decrypt(&short_iv),
            Err(VaultError::DecryptionFailed(_))
        ));

        let mut ragged = good.clone();
        ragged.ciphertext.pop();
        assert!(matches!(
            cipher.decrypt(&ragged),
            Err(VaultError::DecryptionFailed(_))
        ));

        let mut empty = good;
        empty.ciphertext.clear();
        assert!(matches!(
            cipher.decrypt(&empty),
            Err(VaultError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn legacy_passphrase_pads_with_spaces() {
        let envelope = EnvelopeCipher::from_legacy_passphrase(b"secret")
            .encrypt(b"legacy record", None)
            .expect("encrypt");

        let mut expected = [0x20u8; KEY_LEN];
        expected[..6].copy_from_slice(b"secret");
        let padded = EnvelopeCipher::new(KeyMaterial::from_bytes(expected));
        assert_eq!(padded.decrypt(&envelope).expect("decrypt"), b"legacy record");
    }

    #[test]
    fn legacy_passphrase_truncates_past_32_bytes() {
        let long = b"0123456789abcdef0123456789abcdef-and-then-some";
        let envelope = EnvelopeCipher::from_legacy_passphrase(long)
            .encrypt(b"legacy record", None)
            .expect("encrypt");

        let mut expected = [0u8; KEY_LEN];
        expected.copy_from_slice(&long[..KEY_LEN]);
        let truncated = EnvelopeCipher::new(KeyMaterial::from_bytes(expected));
        assert_eq!(truncated.decrypt(&envelope).expect("decrypt"), b"legacy record");
    }

    #[test]
    fn key_id_and_metadata_are_recorded() {
        let mut metadata = BTreeMap::new();
        metadata.insert("origin".to_string(), "lab-7".to_string());
        let envelope = EnvelopeCipher::for_key("dna_data_key", KeyMaterial::random())
            .encrypt(b"acgt", Some(metadata.clone()))
            .expect("encrypt");
        assert_eq!(envelope.key_id.as_deref(), Some("dna_data_key"));
        assert_eq!(envelope.metadata, Some(metadata));
    }
}
