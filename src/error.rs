//! Error types for modseal

use thiserror::Error;

/// Errors produced by the build pipeline and the runtime loader
#[derive(Debug, Error)]
pub enum SealError {
    /// External toolchain exited non-zero; carries its captured output
    #[error("compilation failed: {0}")]
    Compile(String),

    /// No artifact matching the unit's name and the platform suffix
    #[error("compiled artifact not found: {0}")]
    ArtifactNotFound(String),

    /// More than one artifact candidate in the output directory
    #[error("ambiguous compiled artifact: {0}")]
    AmbiguousArtifact(String),

    /// Encryption failed (cipher or randomness failure)
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Wrong key, tampered ciphertext, unknown version, or malformed
    /// container. A single opaque kind: callers learn nothing about which
    /// check rejected the input.
    #[error("decryption failed: container rejected")]
    Decryption,

    /// Key resolution failed transiently (remote strategy only)
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    /// Key material of the wrong shape, rejected at configuration time
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A different module is already registered under this name
    #[error("module name conflict: {0}")]
    ModuleNameConflict(String),

    /// The native loader rejected the staged module
    #[error("module load failed: {0}")]
    ModuleLoad(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation cancelled before completion
    #[error("operation cancelled")]
    Cancelled,
}

impl SealError {
    /// Whether retrying the failed operation can reasonably succeed.
    ///
    /// Only transient key-service failures qualify. Decryption failures in
    /// particular must not be retried with the same key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SealError::KeyUnavailable(_))
    }
}

/// Result type for modseal operations
pub type SealResult<T> = Result<T, SealError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_key_unavailable_is_retryable() {
        assert!(SealError::KeyUnavailable("timeout".into()).is_retryable());
        assert!(!SealError::Decryption.is_retryable());
        assert!(!SealError::Compile("cc exploded".into()).is_retryable());
        assert!(!SealError::ModuleNameConflict("pricing".into()).is_retryable());
    }

    #[test]
    fn test_decryption_message_is_fixed() {
        // The message carries no detail about why the container was rejected.
        assert_eq!(
            SealError::Decryption.to_string(),
            "decryption failed: container rejected"
        );
    }
}
