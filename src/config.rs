//! Configuration for the build pipeline and the runtime loader
//!
//! All knobs live in one serde-backed structure supplied explicitly to the
//! components that need them. Nothing is read from ad-hoc globals.

use crate::{SealError, SealResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// External toolchain invocation.
///
/// The compiler itself is an opaque subprocess; modseal only knows how to
/// invoke it and where to look for its output. Argument strings may contain
/// the placeholders `{source}`, `{output}`, `{name}` and `{suffix}`, which
/// are substituted per compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Compiler executable
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments, with placeholders
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Keep the staged build directory for debugging instead of removing it
    #[serde(default)]
    pub keep_build_dir: bool,
}

fn default_command() -> String {
    "cc".to_string()
}

fn default_args() -> Vec<String> {
    vec![
        "-shared".to_string(),
        "-fPIC".to_string(),
        "-O2".to_string(),
        "-o".to_string(),
        "{output}/{name}.{suffix}".to_string(),
        "{source}".to_string(),
    ]
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            keep_build_dir: false,
        }
    }
}

/// Which stable machine characteristics feed the machine-bound key
/// derivation. At least one must be enabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MachineDescriptors {
    /// Host name
    #[serde(default = "default_true")]
    pub hostname: bool,
    /// Operating system name and kernel release string
    #[serde(default = "default_true")]
    pub os_release: bool,
    /// Machine identifier file (`/etc/machine-id` on Linux), where present
    #[serde(default = "default_true")]
    pub machine_id: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MachineDescriptors {
    fn default() -> Self {
        Self {
            hostname: true,
            os_release: true,
            machine_id: true,
        }
    }
}

impl MachineDescriptors {
    /// True if no descriptor field is selected
    pub fn is_empty(&self) -> bool {
        !self.hostname && !self.os_release && !self.machine_id
    }
}

/// Key-provider strategy selection.
///
/// Strategies are interchangeable behind [`crate::keys::KeySource`]; the
/// codec and the loader are unaware of which one is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum KeySourceConfig {
    /// Fixed key baked into the consuming binary or its config.
    ///
    /// Weakest strategy: deters casual inspection only. Anyone who can run
    /// the binary can recover the key.
    Embedded {
        /// Key bytes, base64
        key: String,
    },

    /// Key derived from stable local-machine characteristics. Binds a
    /// container to the machine it was sealed on.
    MachineBound {
        #[serde(default)]
        descriptors: MachineDescriptors,
    },

    /// Key fetched from a key-issuing service. The only strategy with a
    /// network suspension point; bounded by `timeout_secs`.
    Remote {
        /// Key service endpoint URL
        endpoint: String,
        /// Bearer token for the authenticated request
        #[serde(default)]
        token: Option<String>,
        /// Request timeout in seconds
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for KeySourceConfig {
    fn default() -> Self {
        Self::MachineBound {
            descriptors: MachineDescriptors::default(),
        }
    }
}

/// Configuration for the whole pipeline
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SealConfig {
    /// External compiler invocation
    #[serde(default)]
    pub toolchain: ToolchainConfig,

    /// Key-provider strategy
    #[serde(default)]
    pub key_source: KeySourceConfig,

    /// Directory for compiled artifacts (default: `build` next to the cwd)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Directory for transient plaintext staging at load time
    /// (default: the system temp directory)
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

impl SealConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config from a JSON file
    pub fn load(path: &Path) -> SealResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| SealError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Set the toolchain command
    pub fn toolchain_command(mut self, command: impl Into<String>) -> Self {
        self.toolchain.command = command.into();
        self
    }

    /// Set the toolchain arguments
    pub fn toolchain_args(mut self, args: Vec<String>) -> Self {
        self.toolchain.args = args;
        self
    }

    /// Set the key-provider strategy
    pub fn key_source(mut self, key_source: KeySourceConfig) -> Self {
        self.key_source = key_source;
        self
    }

    /// Set the artifact output directory
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Set the plaintext staging directory
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Effective artifact output directory
    pub fn effective_output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("build"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SealConfig::default();
        assert_eq!(config.toolchain.command, "cc");
        assert!(!config.toolchain.keep_build_dir);
        assert!(matches!(
            config.key_source,
            KeySourceConfig::MachineBound { .. }
        ));
    }

    #[test]
    fn test_parse_remote_config() {
        let json = r#"{
            "toolchain": { "command": "cythonize-native" },
            "key_source": {
                "strategy": "remote",
                "endpoint": "https://keys.example.com/v1/issue",
                "token": "t0ken"
            }
        }"#;
        let config: SealConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.toolchain.command, "cythonize-native");
        match config.key_source {
            KeySourceConfig::Remote {
                endpoint,
                token,
                timeout_secs,
            } => {
                assert_eq!(endpoint, "https://keys.example.com/v1/issue");
                assert_eq!(token.as_deref(), Some("t0ken"));
                assert_eq!(timeout_secs, 10);
            }
            other => panic!("unexpected strategy: {:?}", other),
        }
    }

    #[test]
    fn test_parse_embedded_config() {
        let json = r#"{ "key_source": { "strategy": "embedded", "key": "AAAA" } }"#;
        let config: SealConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config.key_source, KeySourceConfig::Embedded { .. }));
        // Unspecified toolchain falls back to defaults.
        assert_eq!(config.toolchain.command, "cc");
    }

    #[test]
    fn test_builder() {
        let config = SealConfig::new()
            .toolchain_command("clang")
            .output_dir("out")
            .staging_dir("/tmp/stage");
        assert_eq!(config.toolchain.command, "clang");
        assert_eq!(config.effective_output_dir(), PathBuf::from("out"));
        assert_eq!(config.staging_dir, Some(PathBuf::from("/tmp/stage")));
    }

    #[test]
    fn test_empty_descriptors_detected() {
        let descriptors = MachineDescriptors {
            hostname: false,
            os_release: false,
            machine_id: false,
        };
        assert!(descriptors.is_empty());
        assert!(!MachineDescriptors::default().is_empty());
    }
}
