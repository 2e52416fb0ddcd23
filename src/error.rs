use thiserror::Error;

/// Convenience alias used across the crate.
pub type VaultResult<T> = Result<T, VaultError>;

/// Errors surfaced by key management, envelope encryption, and record
/// protection operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A key id was referenced on the decrypt path but no material exists
    /// for it. Never raised by get-or-create flows.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The selected key backend cannot serve the request: missing
    /// configuration, unreachable service, or an exceeded deadline.
    #[error("key backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Ciphertext could not be decrypted: wrong key, corrupted bytes, a
    /// malformed envelope, or a payload that does not match its declared
    /// shape.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// The key store or record store failed to read or persist data.
    #[error("store error: {0}")]
    StoreError(String),

    /// Invalid or missing configuration values.
    #[error("configuration error: {0}")]
    Config(String),
}

impl VaultError {
    pub fn store<E: std::fmt::Display>(err: E) -> Self {
        Self::StoreError(err.to_string())
    }

    pub fn decryption<E: std::fmt::Display>(err: E) -> Self {
        Self::DecryptionFailed(err.to_string())
    }

    pub fn unavailable<E: std::fmt::Display>(err: E) -> Self {
        Self::BackendUnavailable(err.to_string())
    }

    pub fn config<E: std::fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }
}
