use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use parking_lot::Mutex as ParkingMutex;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::info;

use crate::cloud::CloudKey;
use crate::config::{require_setting, AzureSettings};
use crate::error::{VaultError, VaultResult};
use crate::models::KeyMaterial;

const API_VERSION: &str = "7.4";
const TOKEN_SCOPE: &str = "https://vault.azure.net/.default";

/// Azure Key Vault backend.
///
/// The vault holds an RSA key-encryption key that never leaves it. Data
/// keys are drawn locally and only wrap-sized payloads travel to the
/// vault for RSA-OAEP encryption or decryption. Access tokens come from a
/// client-credentials grant and are cached until shortly before expiry.
pub struct AzureKms {
    http: reqwest::Client,
    vault_url: String,
    key_name: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
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
struct KeyBundle {
    key: KeyInfo,
}

#[derive(Deserialize)]
struct KeyInfo {
    kid: String,
}

#[derive(Deserialize)]
struct CryptoResponse {
    value: String,
}

impl AzureKms {
    /// Build the client. Fails when any of the vault or credential
    /// settings is missing; the vault itself is only contacted per call.
    pub fn connect(settings: &AzureSettings, timeout_secs: u64) -> VaultResult<Self> {
        let vault_url = require_setting(settings.vault_url.as_deref(), "AZURE_VAULT_URL")?;
        let key_name = require_setting(settings.key_name.as_deref(), "AZURE_KEY_NAME")?;
        let tenant_id = require_setting(settings.tenant_id.as_deref(), "AZURE_TENANT_ID")?;
        let client_id = require_setting(settings.client_id.as_deref(), "AZURE_CLIENT_ID")?;
        let client_secret =
            require_setting(settings.client_secret.as_deref(), "AZURE_CLIENT_SECRET")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| VaultError::unavailable(format!("failed to build HTTP client: {err}")))?;
        info!(vault = %vault_url, key = %key_name, "configured Azure Key Vault backend");
        Ok(Self {
            http,
            vault_url: vault_url.trim_end_matches('/').to_string(),
            key_name,
            tenant_id,
            client_id,
            client_secret,
            token: ParkingMutex::new(None),
        })
    }

    async fn bearer_token(&self) -> VaultResult<String> {
        if let Some(cached) = self.token.lock().as_ref() {
            if cached.expires_at > OffsetDateTime::now_utc() {
                return Ok(cached.bearer.clone());
            }
        }
        let endpoint = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant_id
        );
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", TOKEN_SCOPE),
        ];
        let response = self
            .http
            .post(&endpoint)
            .form(&params)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VaultError::unavailable(format!(
                "Azure token request failed: {status} {body}"
            )));
        }
        let token: TokenResponse = response.json().await.map_err(transport_error)?;
        let bearer = format!("Bearer {}", token.access_token);
        // renew a minute early so in-flight calls never carry a dead token
        let expires_at =
            OffsetDateTime::now_utc() + time::Duration::seconds((token.expires_in - 60).max(0));
        *self.token.lock() = Some(CachedToken {
            bearer: bearer.clone(),
            expires_at,
        });
        Ok(bearer)
    }

    /// The key's full versioned identifier, used as the base URL for
    /// cryptographic operations.
    async fn key_identifier(&self) -> VaultResult<String> {
        let bearer = self.bearer_token().await?;
        let url = format!(
            "{}/keys/{}?api-version={}",
            self.vault_url, self.key_name, API_VERSION
        );
        let response = self
            .http
            .get(&url)
            .header("Authorization", &bearer)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VaultError::unavailable(format!(
                "Azure Key Vault key lookup failed: {status} {body}"
            )));
        }
        let bundle: KeyBundle = response.json().await.map_err(transport_error)?;
        Ok(bundle.key.kid)
    }

    /// Create (or add a version to) the configured vault key.
    pub async fn generate_key(&self, _key_id: &str) -> VaultResult<CloudKey> {
        let bearer = self.bearer_token().await?;
        let url = format!(
            "{}/keys/{}/create?api-version={}",
            self.vault_url, self.key_name, API_VERSION
        );
        let body = json!({
            "kty": "RSA",
            "key_size": 2048,
            "key_ops": ["encrypt", "decrypt", "wrapKey", "unwrapKey"],
        });
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
                "Azure Key Vault key creation failed: {status} {text}"
            )));
        }
        let bundle: KeyBundle = response.json().await.map_err(transport_error)?;
        info!(kid = %bundle.key.kid, "created Azure Key Vault key");
        Ok(CloudKey::Path(bundle.key.kid))
    }

    /// A fresh 32-byte data key. The vault key only ever wraps material,
    /// so the material itself is drawn locally.
    pub async fn get_key(&self, _key_id: &str) -> VaultResult<CloudKey> {
        Ok(CloudKey::Material(KeyMaterial::random()))
    }

    pub async fn encrypt(&self, _key_id: &str, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        let kid = self.key_identifier().await?;
        let bearer = self.bearer_token().await?;
        let url = format!("{kid}/encrypt?api-version={API_VERSION}");
        let body = json!({
            "alg": "RSA-OAEP",
            "value": general_purpose::URL_SAFE_NO_PAD.encode(plaintext),
        });
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
                "Azure Key Vault encrypt failed: {status} {text}"
            )));
        }
        let result: CryptoResponse = response.json().await.map_err(transport_error)?;
        general_purpose::URL_SAFE_NO_PAD
            .decode(result.value)
            .map_err(|err| {
                VaultError::unavailable(format!("Azure returned malformed ciphertext: {err}"))
            })
    }

    pub async fn decrypt(&self, _key_id: &str, ciphertext: &[u8]) -> VaultResult<Vec<u8>> {
        let kid = self.key_identifier().await?;
        let bearer = self.bearer_token().await?;
        let url = format!("{kid}/decrypt?api-version={API_VERSION}");
        let body = json!({
            "alg": "RSA-OAEP",
            "value": general_purpose::URL_SAFE_NO_PAD.encode(ciphertext),
        });
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
                "Azure Key Vault rejected the ciphertext: {text}"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VaultError::unavailable(format!(
                "Azure Key Vault decrypt failed: {status} {text}"
            )));
        }
        let result: CryptoResponse = response.json().await.map_err(transport_error)?;
        general_purpose::URL_SAFE_NO_PAD
            .decode(result.value)
            .map_err(|err| {
                VaultError::decryption(format!("Azure returned malformed plaintext: {err}"))
            })
    }
}

fn transport_error(err: reqwest::Error) -> VaultError {
    if err.is_timeout() {
        VaultError::unavailable("Azure Key Vault call timed out")
    } else {
        VaultError::unavailable(format!("Azure Key Vault transport error: {err}"))
    }
}
