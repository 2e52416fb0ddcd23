use std::env;
use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{VaultError, VaultResult};
use crate::models::KeyMaterial;

/// Seconds a cloud key operation may take before it is reported as
/// [`VaultError::BackendUnavailable`].
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Closed set of key backend providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KmsProvider {
    Local,
    Aws,
    Azure,
    Gcp,
}

impl KmsProvider {
    /// Parse the configured selector. An unrecognized value falls back to
    /// the local backend with a warning; selection must never take the
    /// process down.
    pub fn from_config_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "local" => Self::Local,
            "aws" => Self::Aws,
            "azure" => Self::Azure,
            "gcp" => Self::Gcp,
            other => {
                warn!(value = %other, "unrecognized key management service, falling back to local");
                Self::Local
            }
        }
    }
}

impl fmt::Display for KmsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
        };
        f.write_str(name)
    }
}

/// AWS KMS settings (`AWS_REGION`, `AWS_KMS_KEY_ID`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsSettings {
    pub region: String,
    /// Root key under which data keys are generated.
    pub kms_key_id: Option<String>,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            kms_key_id: None,
        }
    }
}

/// Azure Key Vault settings (`AZURE_VAULT_URL`, `AZURE_KEY_NAME`, and the
/// client-credential triple `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`,
/// `AZURE_CLIENT_SECRET`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureSettings {
    pub vault_url: Option<String>,
    pub key_name: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
}

/// Google Cloud KMS settings (`GCP_PROJECT_ID`, `GCP_LOCATION`,
/// `GCP_KEY_RING`, `GCP_KEY_NAME`, optional `GCP_ACCESS_TOKEN`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcpSettings {
    pub project_id: Option<String>,
    pub location: String,
    pub key_ring: Option<String>,
    pub key_name: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
}

impl Default for GcpSettings {
    fn default() -> Self {
        Self {
            project_id: None,
            location: "global".to_string(),
            key_ring: None,
            key_name: None,
            access_token: None,
        }
    }
}

/// Backend selection plus per-provider identifiers.
///
/// Unset values make the selected backend report `BackendUnavailable` at
/// call time; they never crash startup and never trigger a fallback to a
/// different key source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsConfig {
    pub provider: KmsProvider,
    pub timeout_secs: u64,
    #[serde(default)]
    pub aws: AwsSettings,
    #[serde(default)]
    pub azure: AzureSettings,
    #[serde(default)]
    pub gcp: GcpSettings,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            provider: KmsProvider::Local,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            aws: AwsSettings::default(),
            azure: AzureSettings::default(),
            gcp: GcpSettings::default(),
        }
    }
}

impl KmsConfig {
    /// Local-only configuration.
    pub fn local() -> Self {
        Self::default()
    }

    /// Read configuration from the process environment. Every value has a
    /// usable default except the provider-specific identifiers, whose
    /// absence surfaces per call as `BackendUnavailable`.
    pub fn from_env() -> Self {
        let provider = match env::var("KEY_MANAGEMENT_SERVICE") {
            Ok(value) => KmsProvider::from_config_value(&value),
            Err(_) => KmsProvider::Local,
        };
        let timeout_secs = env::var("KMS_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Self {
            provider,
            timeout_secs,
            aws: AwsSettings {
                region: env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                kms_key_id: env::var("AWS_KMS_KEY_ID").ok(),
            },
            azure: AzureSettings {
                vault_url: env::var("AZURE_VAULT_URL").ok(),
                key_name: env::var("AZURE_KEY_NAME").ok(),
                tenant_id: env::var("AZURE_TENANT_ID").ok(),
                client_id: env::var("AZURE_CLIENT_ID").ok(),
                client_secret: env::var("AZURE_CLIENT_SECRET").ok(),
            },
            gcp: GcpSettings {
                project_id: env::var("GCP_PROJECT_ID").ok(),
                location: env::var("GCP_LOCATION").unwrap_or_else(|_| "global".to_string()),
                key_ring: env::var("GCP_KEY_RING").ok(),
                key_name: env::var("GCP_KEY_NAME").ok(),
                access_token: env::var("GCP_ACCESS_TOKEN").ok(),
            },
        }
    }
}

/// Master secret sealing the local key store, from `GENEVAULT_MASTER_KEY`
/// (base64, exactly 32 bytes).
pub fn master_key_from_env() -> VaultResult<KeyMaterial> {
    let raw = env::var("GENEVAULT_MASTER_KEY")
        .map_err(|_| VaultError::config("GENEVAULT_MASTER_KEY is not set"))?;
    master_key_from_base64(&raw)
}

/// Decode a base64 master secret. Must decode to exactly 32 bytes.
pub fn master_key_from_base64(encoded: &str) -> VaultResult<KeyMaterial> {
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| VaultError::config(format!("master key is not valid base64: {err}")))?;
    KeyMaterial::try_from_slice(&bytes).map_err(|_| {
        VaultError::config(format!(
            "master key must decode to 32 bytes, got {}",
            bytes.len()
        ))
    })
}

/// Reject empty or missing provider settings with a uniform message.
#[cfg(any(feature = "azure-kms", feature = "gcp-kms"))]
pub(crate) fn require_setting(value: Option<&str>, name: &str) -> VaultResult<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
        _ => Err(VaultError::unavailable(format!("{name} is not configured"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_selector_is_case_insensitive() {
        assert_eq!(KmsProvider::from_config_value("aws"), KmsProvider::Aws);
        assert_eq!(KmsProvider::from_config_value("AWS"), KmsProvider::Aws);
        assert_eq!(KmsProvider::from_config_value(" Azure "), KmsProvider::Azure);
        assert_eq!(KmsProvider::from_config_value("gcp"), KmsProvider::Gcp);
        assert_eq!(KmsProvider::from_config_value("local"), KmsProvider::Local);
        assert_eq!(KmsProvider::from_config_value(""), KmsProvider::Local);
    }

    #[test]
    fn unknown_selectors_fall_back_to_local() {
        assert_eq!(
            KmsProvider::from_config_value("hashicorp"),
            KmsProvider::Local
        );
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = KmsConfig::local();
        assert_eq!(config.provider, KmsProvider::Local);
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.aws.region, "us-east-1");
        assert_eq!(config.gcp.location, "global");
        assert!(config.azure.vault_url.is_none());
    }

    #[test]
    fn master_key_decoding_enforces_length() {
        use base64::{engine::general_purpose, Engine as _};

        let encoded = general_purpose::STANDARD.encode([9u8; 32]);
        let material = master_key_from_base64(&encoded).expect("valid key");
        assert_eq!(material.as_bytes(), &[9u8; 32]);

        let short = general_purpose::STANDARD.encode([9u8; 16]);
        assert!(matches!(
            master_key_from_base64(&short),
            Err(VaultError::Config(_))
        ));
        assert!(matches!(
            master_key_from_base64("%%% not base64 %%%"),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn secrets_are_not_serialized() {
        let mut config = KmsConfig::local();
        config.azure.client_secret = Some("hunter2".to_string());
        config.gcp.access_token = Some("ya29.token".to_string());
        let rendered = serde_json::to_string(&config).expect("serialize");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("ya29.token"));
    }
}
