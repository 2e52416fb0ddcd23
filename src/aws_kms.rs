use std::time::Duration;

use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;
use tokio::time::timeout;
use tracing::info;

use crate::cloud::CloudKey;
use crate::config::AwsSettings;
use crate::error::{VaultError, VaultResult};
use crate::models::KeyMaterial;

/// AWS KMS backend.
///
/// Data keys are generated under a configured root key and the root key
/// never leaves the service; encrypt and decrypt round-trip through it.
/// Every call runs under the configured deadline and an exceeded deadline
/// is reported as [`VaultError::BackendUnavailable`].
pub struct AwsKms {
    client: aws_sdk_kms::Client,
    root_key_id: String,
    timeout: Duration,
}

impl AwsKms {
    /// Build the client. Fails when the root key id is missing;
    /// credential problems only surface per call.
    pub async fn connect(settings: &AwsSettings, timeout_secs: u64) -> VaultResult<Self> {
        let root_key_id = settings
            .kms_key_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| VaultError::unavailable("AWS_KMS_KEY_ID is not configured"))?;
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()))
            .load()
            .await;
        let client = aws_sdk_kms::Client::new(&sdk_config);
        info!(region = %settings.region, "connected to AWS KMS");
        Ok(Self {
            client,
            root_key_id,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Create a new customer master key and return its id.
    pub async fn generate_key(&self, key_id: &str) -> VaultResult<CloudKey> {
        let call = self
            .client
            .create_key()
            .description(format!("genevault data key for {key_id}"))
            .send();
        let output = timeout(self.timeout, call)
            .await
            .map_err(|_| deadline_error("CreateKey"))?
            .map_err(|err| VaultError::unavailable(format!("AWS KMS CreateKey failed: {err}")))?;
        let created = output
            .key_metadata()
            .map(|metadata| metadata.key_id().to_string())
            .ok_or_else(|| VaultError::unavailable("AWS KMS CreateKey returned no key metadata"))?;
        info!(key_id = %created, "created AWS KMS key");
        Ok(CloudKey::Path(created))
    }

    /// A fresh 32-byte data key under the root key. The plaintext half is
    /// returned for immediate use; only the service can reproduce it.
    pub async fn get_key(&self, _key_id: &str) -> VaultResult<CloudKey> {
        let call = self
            .client
            .generate_data_key()
            .key_id(&self.root_key_id)
            .key_spec(DataKeySpec::Aes256)
            .send();
        let output = timeout(self.timeout, call)
            .await
            .map_err(|_| deadline_error("GenerateDataKey"))?
            .map_err(|err| {
                VaultError::unavailable(format!("AWS KMS GenerateDataKey failed: {err}"))
            })?;
        let plaintext = output
            .plaintext()
            .ok_or_else(|| VaultError::unavailable("AWS KMS returned no plaintext data key"))?;
        let material = KeyMaterial::try_from_slice(plaintext.as_ref())
            .map_err(|_| VaultError::unavailable("AWS KMS data key was not 32 bytes"))?;
        Ok(CloudKey::Material(material))
    }

    pub async fn encrypt(&self, _key_id: &str, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        let call = self
            .client
            .encrypt()
            .key_id(&self.root_key_id)
            .plaintext(Blob::new(plaintext))
            .send();
        let output = timeout(self.timeout, call)
            .await
            .map_err(|_| deadline_error("Encrypt"))?
            .map_err(|err| VaultError::unavailable(format!("AWS KMS Encrypt failed: {err}")))?;
        let blob = output
            .ciphertext_blob()
            .ok_or_else(|| VaultError::unavailable("AWS KMS Encrypt returned no ciphertext"))?;
        Ok(blob.as_ref().to_vec())
    }

    /// Decrypt a blob produced by [`Self::encrypt`]. The service derives
    /// the key from the ciphertext itself; a rejected blob is a
    /// [`VaultError::DecryptionFailed`], anything else is availability.
    pub async fn decrypt(&self, _key_id: &str, ciphertext: &[u8]) -> VaultResult<Vec<u8>> {
        let call = self
            .client
            .decrypt()
            .ciphertext_blob(Blob::new(ciphertext))
            .send();
        let output = timeout(self.timeout, call)
            .await
            .map_err(|_| deadline_error("Decrypt"))?
            .map_err(|err| {
                let service = err.into_service_error();
                if service.is_invalid_ciphertext_exception() {
                    VaultError::decryption("AWS KMS rejected the ciphertext")
                } else {
                    VaultError::unavailable(format!("AWS KMS Decrypt failed: {service}"))
                }
            })?;
        let blob = output
            .plaintext()
            .ok_or_else(|| VaultError::unavailable("AWS KMS Decrypt returned no plaintext"))?;
        Ok(blob.as_ref().to_vec())
    }
}

fn deadline_error(operation: &str) -> VaultError {
    VaultError::unavailable(format!("AWS KMS {operation} timed out"))
}
