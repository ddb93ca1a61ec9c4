//! Build-time pipeline: compile, encrypt, persist
//!
//! Composes the compiler adapter and the container codec. After a build the
//! container file is the only artifact left behind; the plaintext module
//! lives in a scoped directory that is removed with the build.

use crate::compiler::{CompiledArtifact, Compiler, SourceUnit};
use crate::config::SealConfig;
use crate::container::{self, EncryptionContainer};
use crate::keys::{KeyId, KeySource};
use crate::SealResult;
use std::path::{Path, PathBuf};

/// Container file extension
pub const CONTAINER_EXTENSION: &str = "sealed";

/// Outcome of a full build
#[derive(Debug)]
pub struct BuildReport {
    /// Unit identifier
    pub unit: String,
    /// Compiled artifact size in bytes
    pub artifact_size: u64,
    /// Persisted container size in bytes
    pub container_size: u64,
    /// Where the container was written
    pub container_path: PathBuf,
    /// Identifier of the key the container was sealed with
    pub key_id: KeyId,
}

/// Build-time pipeline
pub struct Pipeline {
    config: SealConfig,
    compiler: Compiler,
    keys: KeySource,
}

impl Pipeline {
    /// Build a pipeline from a validated configuration.
    ///
    /// Key-provider misconfiguration (wrong-sized embedded key, empty
    /// descriptor set, bad endpoint) fails here, not mid-build.
    pub fn new(config: SealConfig) -> SealResult<Self> {
        let keys = KeySource::from_config(&config.key_source)?;
        let compiler = Compiler::new(config.toolchain.clone());
        Ok(Self {
            config,
            compiler,
            keys,
        })
    }

    /// Compile a source unit into the configured output directory.
    ///
    /// The artifact persists for the caller to inspect or encrypt later;
    /// the caller owns the output directory's cleanup.
    pub fn compile(&self, source: &Path) -> SealResult<CompiledArtifact> {
        let unit = SourceUnit::from_path(source)?;
        self.compiler.compile(&unit, &self.config.effective_output_dir())
    }

    /// Encrypt a compiled artifact under the key labeled `key_label`
    pub fn encrypt_artifact(
        &self,
        artifact: &CompiledArtifact,
        key_label: &str,
    ) -> SealResult<EncryptionContainer> {
        let key = self.keys.resolve(KeyId::from_label(key_label))?;
        container::encrypt(&artifact.bytes, &key)
    }

    /// Encrypt an artifact file from disk, writing `<stem>.sealed` next to
    /// it. Returns the container path.
    pub fn encrypt_file(&self, artifact_path: &Path, key_label: &str) -> SealResult<PathBuf> {
        let bytes = std::fs::read(artifact_path)?;
        let key = self.keys.resolve(KeyId::from_label(key_label))?;
        let sealed = container::encrypt(&bytes, &key)?;

        let container_path = artifact_path.with_extension(CONTAINER_EXTENSION);
        sealed.write_file(&container_path)?;

        tracing::info!(
            artifact = %artifact_path.display(),
            container = %container_path.display(),
            key_id = %key.id(),
            "artifact sealed"
        );
        Ok(container_path)
    }

    /// Full build: compile, encrypt, persist `<stem>.sealed` next to the
    /// source.
    ///
    /// The plaintext artifact is produced in a scoped directory that is
    /// removed before this returns; only the container persists.
    pub fn build(&self, source: &Path, key_label: &str) -> SealResult<BuildReport> {
        let unit = SourceUnit::from_path(source)?;

        let artifact_dir = tempfile::Builder::new().prefix("modseal-out-").tempdir()?;
        let artifact = self.compiler.compile(&unit, artifact_dir.path())?;

        let sealed = self.encrypt_artifact(&artifact, key_label)?;
        let container_path = container_path_for(source);
        sealed.write_file(&container_path)?;

        tracing::info!(
            unit = %artifact.name,
            container = %container_path.display(),
            artifact_size = artifact.len(),
            container_size = sealed.ciphertext_len() + crate::container::HEADER_SIZE,
            "build complete"
        );

        Ok(BuildReport {
            unit: artifact.name.clone(),
            artifact_size: artifact.len() as u64,
            container_size: (sealed.ciphertext_len() + crate::container::HEADER_SIZE) as u64,
            container_path,
            key_id: sealed.key_id(),
        })
    }
}

/// Default container location for a source unit: `<stem>.sealed` next to it
pub fn container_path_for(source: &Path) -> PathBuf {
    source.with_extension(CONTAINER_EXTENSION)
}
