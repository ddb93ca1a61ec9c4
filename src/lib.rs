//! modseal - Protected Native-Module Distribution
//!
//! Compiles sensitive source into a native binary module, encrypts that
//! binary at rest, and at run time decrypts-and-loads it into the host
//! process without writing plaintext machine code to persistent storage.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     Build Time (Dev Machine)                   │
//! ├────────────────────────────────────────────────────────────────┤
//! │  source ──► external toolchain ──► native module (.so/.dll)    │
//! │                                         │                      │
//! │                                         ▼                      │
//! │                               AES-256-GCM encrypt              │
//! │                                         │                      │
//! │                                         ▼                      │
//! │                              <unit>.sealed container           │
//! └────────────────────────────────────────────────────────────────┘
//!
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     Runtime (User Machine)                     │
//! ├────────────────────────────────────────────────────────────────┤
//! │  1. key provider resolves key (embedded/machine-bound/remote)  │
//! │                                                                │
//! │  2. container ──► AES decrypt ──► zeroize-on-drop buffer       │
//! │                                                                │
//! │  3. stage (0600 temp file) ──► dlopen ──► unlink ──► registry  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The container is the only form of the module permitted to persist. A
//! wrong key, a corrupted container, or a platform mismatch fails closed
//! with a typed error; transient plaintext is zeroed and removed on every
//! exit path.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use modseal::{Pipeline, RuntimeLoader, KeySource, SealConfig};
//!
//! // Build time: compile + encrypt.
//! let config = SealConfig::load(Path::new("modseal.json"))?;
//! let report = Pipeline::new(config.clone())?.build(Path::new("pricing.c"), "k1")?;
//!
//! // Run time: decrypt + load, in a different process lifetime.
//! let loader = RuntimeLoader::new(KeySource::from_config(&config.key_source)?);
//! let module = loader.load_file(&report.container_path, "pricing")?;
//! let status = module.call_entry("pricing_total")?;
//! ```

pub mod compiler;
mod config;
pub mod container;
mod error;
pub mod keys;
pub mod loader;
mod pipeline;
pub mod platform;

pub use compiler::{CancelToken, CompiledArtifact, Compiler, SourceUnit};
pub use config::{KeySourceConfig, MachineDescriptors, SealConfig, ToolchainConfig};
pub use container::EncryptionContainer;
pub use error::{SealError, SealResult};
pub use keys::{KeyId, KeyMaterial, KeySource};
pub use loader::{LoadState, LoadedModule, ModuleRegistry, RuntimeLoader};
pub use pipeline::{container_path_for, BuildReport, Pipeline, CONTAINER_EXTENSION};
pub use platform::PlatformDescriptor;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
