use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use parking_lot::Mutex as ParkingMutex;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::info;

use crate::cloud::CloudKey;
use crate::config::{require_setting, GcpSettings};
use crate::error::{VaultError, VaultResult};

const KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Google Cloud KMS backend.
///
/// Material never leaves the service: `get_key` yields the fully
/// qualified key path and encrypt/decrypt are remote calls against it.
/// Credentials come from `GCP_ACCESS_TOKEN` when set, otherwise from the
/// GCE metadata server.
pub struct GcpKms {
    http: reqwest::Client,
    key_path: String,
    parent: String,
    key_name: String,
    access_token: Option<String>,
    token: ParkingMutex<Option<CachedToken>>,
}

struct CachedToken {
    bearer: String,
    expires_at: OffsetDateTime,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct CryptoKeyResource {
    name: String,
}

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

impl GcpKms {
    /// Build the client. Fails when the key path cannot be assembled;
    /// credentials are only checked per call.
    pub fn connect(settings: &GcpSettings, timeout_secs: u64) -> VaultResult<Self> {
        let project_id = require_setting(settings.project_id.as_deref(), "GCP_PROJECT_ID")?;
        let key_ring = require_setting(settings.key_ring.as_deref(), "GCP_KEY_RING")?;
        let key_name = require_setting(settings.key_name.as_deref(), "GCP_KEY_NAME")?;
        let parent = format!(
            "projects/{}/locations/{}/keyRings/{}",
            project_id, settings.location, key_ring
        );
        let key_path = format!("{parent}/cryptoKeys/{key_name}");
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| VaultError::unavailable(format!("failed to build HTTP client: {err}")))?;
        info!(key_path = %key_path, "configured Google Cloud KMS backend");
        Ok(Self {
            http,
            key_path,
            parent,
            key_name,
            access_token: settings.access_token.clone(),
            token: ParkingMutex::new(None),
        })
    }

    async fn bearer_token(&self) -> VaultResult<String> {
        if let Some(token) = &self.access_token {
            return Ok(format!("Bearer {token}"));
        }
        if let Some(cached) = self.token.lock().as_ref() {
            if cached.expires_at > OffsetDateTime::now_utc() {
                return Ok(cached.bearer.clone());
            }
        }
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|err| {
                VaultError::unavailable(format!(
                    "no GCP credentials: metadata server unreachable: {err}"
                ))
            })?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(VaultError::unavailable(format!(
                "GCP metadata server refused a token: {status}"
            )));
        }
        let token: TokenResponse = response.json().await.map_err(transport_error)?;
        let bearer = format!("Bearer {}", token.access_token);
        let expires_at =
            OffsetDateTime::now_utc() + time::Duration::seconds((token.expires_in - 60).max(0));
        *self.token.lock() = Some(CachedToken {
            bearer: bearer.clone(),
            expires_at,
        });
        Ok(bearer)
    }

    /// Create the configured crypto key inside its key ring.
    pub async fn generate_key(&self, _key_id: &str) -> VaultResult<CloudKey> {
        let bearer = self.bearer_token().await?;
        let url = format!(
            "{KMS_ENDPOINT}/{}/cryptoKeys?cryptoKeyId={}",
            self.parent, self.key_name
        );
        let body = json!({ "purpose": "ENCRYPT_DECRYPT" });
        let response = self
            .http
            .post(&url)
            .header("Authorization", &bearer)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(VaultError::unavailable(format!(
                "Google Cloud KMS key creation failed: {status} {text}"
            )));
        }
        let created: CryptoKeyResource = response.json().await.map_err(transport_error)?;
        info!(key_path = %created.name, "created Google Cloud KMS key");
        Ok(CloudKey::Path(created.name))
    }

    /// The key path. This backend never releases raw material.
    pub async fn get_key(&self, _key_id: &str) -> VaultResult<CloudKey> {
        Ok(CloudKey::Path(self.key_path.clone()))
    }

    pub async fn encrypt(&self, _key_id: &str, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        let bearer = self.bearer_token().await?;
        let url = format!("{KMS_ENDPOINT}/{}:encrypt", self.key_path);
        let body = json!({ "plaintext": general_purpose::STANDARD.encode(plaintext) });
        let response = self
            .http
            .post(&url)
            .header("Authorization", &bearer)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(VaultError::unavailable(format!(
                "Google Cloud KMS encrypt failed: {status} {text}"
            )));
        }
        let result: EncryptResponse = response.json().await.map_err(transport_error)?;
        general_purpose::STANDARD.decode(result.ciphertext).map_err(|err| {
            VaultError::unavailable(format!("Google Cloud KMS returned malformed ciphertext: {err}"))
        })
    }

    pub async fn decrypt(&self, _key_id: &str, ciphertext: &[u8]) -> VaultResult<Vec<u8>> {
        let bearer = self.bearer_token().await?;
        let url = format!("{KMS_ENDPOINT}/{}:decrypt", self.key_path);
        let body = json!({ "ciphertext": general_purpose::STANDARD.encode(ciphertext) });
        let response = self
            .http
            .post(&url)
            .header("Authorization", &bearer)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let text = response.text().await.unwrap_or_default();
            return Err(VaultError::decryption(format!(
                "Google Cloud KMS rejected the ciphertext: {text}"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VaultError::unavailable(format!(
                "Google Cloud KMS decrypt failed: {status} {text}"
            )));
        }
        let result: DecryptResponse = response.json().await.map_err(transport_error)?;
        general_purpose::STANDARD.decode(result.plaintext).map_err(|err| {
            VaultError::decryption(format!("Google Cloud KMS returned malformed plaintext: {err}"))
        })
    }
}

fn transport_error(err: reqwest::Error) -> VaultError {
    if err.is_timeout() {
        VaultError::unavailable("Google Cloud KMS call timed out")
    } else {
        VaultError::unavailable(format!("Google Cloud KMS transport error: {err}"))
    }
}
