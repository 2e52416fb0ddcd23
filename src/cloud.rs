use std::sync::Arc;

use tracing::info;

use crate::cipher::EnvelopeCipher;
use crate::config::{KmsConfig, KmsProvider};
use crate::error::{VaultError, VaultResult};
use crate::models::{Envelope, KeyMaterial};
use crate::storage::KeyStore;
use crate::KeyManager;

#[cfg(feature = "aws-kms")]
use crate::aws_kms::AwsKms;
#[cfg(feature = "azure-kms")]
use crate::azure_kms::AzureKms;
#[cfg(feature = "gcp-kms")]
use crate::gcp_kms::GcpKms;

/// What a backend hands back for a key: raw 32-byte material usable with
/// [`EnvelopeCipher`], or a fully qualified remote key path for backends
/// that never release material.
#[derive(Debug, Clone, PartialEq)]
pub enum CloudKey {
    Material(KeyMaterial),
    Path(String),
}

impl CloudKey {
    /// The raw material, or `BackendUnavailable` when the backend only
    /// exposes a remote path.
    pub fn material(self) -> VaultResult<KeyMaterial> {
        match self {
            Self::Material(material) => Ok(material),
            Self::Path(path) => Err(VaultError::unavailable(format!(
                "backend returned key path {path} where raw material was required"
            ))),
        }
    }
}

/// Always-available backend over the local key store.
///
/// Keys live in the injected [`KeyManager`], payloads go through
/// [`EnvelopeCipher`], and the ciphertext blob is the serialized
/// [`Envelope`].
pub struct LocalKms {
    manager: Arc<KeyManager<dyn KeyStore>>,
}

impl LocalKms {
    pub fn new(manager: Arc<KeyManager<dyn KeyStore>>) -> Self {
        Self { manager }
    }

    fn ensure_key(&self, key_id: &str) -> VaultResult<KeyMaterial> {
        self.manager.get_or_create(key_id)
    }

    fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        let material = self.manager.get_or_create(key_id)?;
        let envelope = EnvelopeCipher::for_key(key_id, material).encrypt(plaintext, None)?;
        envelope.to_bytes()
    }

    fn decrypt(&self, key_id: &str, blob: &[u8]) -> VaultResult<Vec<u8>> {
        let envelope = Envelope::from_bytes(blob)?;
        // the id recorded at encryption time wins over the caller's hint
        let resolved = envelope.key_id.clone().unwrap_or_else(|| key_id.to_string());
        let material = self.manager.resolve(&resolved)?;
        EnvelopeCipher::new(material).decrypt(&envelope)
    }
}

/// Key backend resolved once at startup from [`KmsConfig`].
///
/// A selected provider whose client cannot be built is carried as
/// [`CloudKeyBackend::Unavailable`] and every operation on it fails with
/// [`VaultError::BackendUnavailable`]. There is no fallback to another
/// key source: ciphertext written under a substitute key would be
/// unreadable once the intended backend returns.
pub enum CloudKeyBackend {
    Local(LocalKms),
    #[cfg(feature = "aws-kms")]
    Aws(AwsKms),
    #[cfg(feature = "azure-kms")]
    Azure(AzureKms),
    #[cfg(feature = "gcp-kms")]
    Gcp(GcpKms),
    Unavailable {
        provider: KmsProvider,
        reason: String,
    },
}

impl CloudKeyBackend {
    /// Resolve the configured variant. Never fails: configuration
    /// problems surface later, per call.
    pub async fn from_config(
        config: &KmsConfig,
        manager: Arc<KeyManager<dyn KeyStore>>,
    ) -> Self {
        let backend = match config.provider {
            KmsProvider::Local => Self::Local(LocalKms::new(manager)),
            KmsProvider::Aws => Self::connect_aws(config).await,
            KmsProvider::Azure => Self::connect_azure(config),
            KmsProvider::Gcp => Self::connect_gcp(config),
        };
        info!(
            provider = %backend.provider(),
            available = backend.is_available(),
            "key backend selected"
        );
        backend
    }

    #[cfg(feature = "aws-kms")]
    async fn connect_aws(config: &KmsConfig) -> Self {
        match AwsKms::connect(&config.aws, config.timeout_secs).await {
            Ok(backend) => Self::Aws(backend),
            Err(err) => Self::unavailable(KmsProvider::Aws, err),
        }
    }

    #[cfg(not(feature = "aws-kms"))]
    async fn connect_aws(_config: &KmsConfig) -> Self {
        Self::unavailable(KmsProvider::Aws, "built without aws-kms support")
    }

    #[cfg(feature = "azure-kms")]
    fn connect_azure(config: &KmsConfig) -> Self {
        match AzureKms::connect(&config.azure, config.timeout_secs) {
            Ok(backend) => Self::Azure(backend),
            Err(err) => Self::unavailable(KmsProvider::Azure, err),
        }
    }

    #[cfg(not(feature = "azure-kms"))]
    fn connect_azure(_config: &KmsConfig) -> Self {
        Self::unavailable(KmsProvider::Azure, "built without azure-kms support")
    }

    #[cfg(feature = "gcp-kms")]
    fn connect_gcp(config: &KmsConfig) -> Self {
        match GcpKms::connect(&config.gcp, config.timeout_secs) {
            Ok(backend) => Self::Gcp(backend),
            Err(err) => Self::unavailable(KmsProvider::Gcp, err),
        }
    }

    #[cfg(not(feature = "gcp-kms"))]
    fn connect_gcp(_config: &KmsConfig) -> Self {
        Self::unavailable(KmsProvider::Gcp, "built without gcp-kms support")
    }

    fn unavailable<R: std::fmt::Display>(provider: KmsProvider, reason: R) -> Self {
        Self::Unavailable {
            provider,
            reason: reason.to_string(),
        }
    }

    pub fn provider(&self) -> KmsProvider {
        match self {
            Self::Local(_) => KmsProvider::Local,
            #[cfg(feature = "aws-kms")]
            Self::Aws(_) => KmsProvider::Aws,
            #[cfg(feature = "azure-kms")]
            Self::Azure(_) => KmsProvider::Azure,
            #[cfg(feature = "gcp-kms")]
            Self::Gcp(_) => KmsProvider::Gcp,
            Self::Unavailable { provider, .. } => *provider,
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Unavailable { .. })
    }

    /// Create (or ensure) a key and return its material or remote path.
    pub async fn generate_key(&self, key_id: &str) -> VaultResult<CloudKey> {
        match self {
            Self::Local(local) => local.ensure_key(key_id).map(CloudKey::Material),
            #[cfg(feature = "aws-kms")]
            Self::Aws(aws) => aws.generate_key(key_id).await,
            #[cfg(feature = "azure-kms")]
            Self::Azure(azure) => azure.generate_key(key_id).await,
            #[cfg(feature = "gcp-kms")]
            Self::Gcp(gcp) => gcp.generate_key(key_id).await,
            Self::Unavailable { provider, reason } => Err(unavailable_error(*provider, reason)),
        }
    }

    /// Fetch key material or the remote key path for `key_id`.
    pub async fn get_key(&self, key_id: &str) -> VaultResult<CloudKey> {
        match self {
            Self::Local(local) => local.ensure_key(key_id).map(CloudKey::Material),
            #[cfg(feature = "aws-kms")]
            Self::Aws(aws) => aws.get_key(key_id).await,
            #[cfg(feature = "azure-kms")]
            Self::Azure(azure) => azure.get_key(key_id).await,
            #[cfg(feature = "gcp-kms")]
            Self::Gcp(gcp) => gcp.get_key(key_id).await,
            Self::Unavailable { provider, reason } => Err(unavailable_error(*provider, reason)),
        }
    }

    /// Encrypt `plaintext` under the key named `key_id`. The returned
    /// blob is opaque to callers and only readable by [`Self::decrypt`]
    /// on the same backend.
    pub async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        match self {
            Self::Local(local) => local.encrypt(key_id, plaintext),
            #[cfg(feature = "aws-kms")]
            Self::Aws(aws) => aws.encrypt(key_id, plaintext).await,
            #[cfg(feature = "azure-kms")]
            Self::Azure(azure) => azure.encrypt(key_id, plaintext).await,
            #[cfg(feature = "gcp-kms")]
            Self::Gcp(gcp) => gcp.encrypt(key_id, plaintext).await,
            Self::Unavailable { provider, reason } => Err(unavailable_error(*provider, reason)),
        }
    }

    /// Decrypt a blob produced by [`Self::encrypt`].
    pub async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> VaultResult<Vec<u8>> {
        match self {
            Self::Local(local) => local.decrypt(key_id, ciphertext),
            #[cfg(feature = "aws-kms")]
            Self::Aws(aws) => aws.decrypt(key_id, ciphertext).await,
            #[cfg(feature = "azure-kms")]
            Self::Azure(azure) => azure.decrypt(key_id, ciphertext).await,
            #[cfg(feature = "gcp-kms")]
            Self::Gcp(gcp) => gcp.decrypt(key_id, ciphertext).await,
            Self::Unavailable { provider, reason } => Err(unavailable_error(*provider, reason)),
        }
    }
}

fn unavailable_error(provider: KmsProvider, reason: &str) -> VaultError {
    VaultError::BackendUnavailable(format!("{provider} backend unavailable: {reason}"))
}
