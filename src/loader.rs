//! Runtime loader for encrypted native modules
//!
//! Drives a container through `Idle → Decrypting → Staged → Loaded`, with
//! any failure landing in `Failed`. Plaintext exists in exactly two places,
//! both transient: a zeroize-on-drop buffer, and a restrictively-permissioned
//! staging file that a guard scrubs and removes on every exit path. On Unix
//! the staging file is unlinked immediately after the native loader has
//! opened it.
//!
//! Module bindings live in a locked registry. Loading a second, different
//! container under an existing name is a [`SealError::ModuleNameConflict`];
//! re-loading the same container under the same name returns the existing
//! handle instead of reloading.

use crate::container::{self, EncryptionContainer};
use crate::keys::KeySource;
use crate::platform::module_suffix;
use crate::{SealError, SealResult};
use libloading::Library;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Loader state for one `load` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// No work started
    Idle,
    /// Key resolved, container being decrypted
    Decrypting,
    /// Plaintext staged for the native loader
    Staged,
    /// Module bound in the registry (terminal)
    Loaded,
    /// Terminal failure; transient artifacts already released
    Failed,
}

fn trace_state(module: &str, state: LoadState) {
    tracing::debug!(module, state = ?state, "loader transition");
}

// ============================================================================
// Loaded Module
// ============================================================================

/// A native module bound into the host process.
///
/// Exists only for the lifetime of the process; never persisted. The
/// library handle owns the executable mapping.
pub struct LoadedModule {
    name: String,
    fingerprint: [u8; 32],
    library: Library,
    // A mapped DLL cannot be unlinked on Windows; the staging file is
    // retained for the module's lifetime and removed when it drops.
    #[cfg(windows)]
    _staged: tempfile::TempPath,
}

impl LoadedModule {
    /// Registered module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fingerprint of the container this module was loaded from
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// The underlying library handle
    pub fn library(&self) -> &Library {
        &self.library
    }

    /// Resolve and invoke an `extern "C" fn() -> i32` entry point.
    ///
    /// The entry runs exactly once per call; module initializers ran once at
    /// load time. The symbol must match the expected signature; that
    /// contract is the module author's to uphold.
    pub fn call_entry(&self, symbol: &str) -> SealResult<i32> {
        unsafe {
            let entry: libloading::Symbol<unsafe extern "C" fn() -> i32> = self
                .library
                .get(symbol.as_bytes())
                .map_err(|e| SealError::ModuleLoad(format!("symbol {}: {}", symbol, e)))?;
            Ok(entry())
        }
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .field("fingerprint", &crate::keys::hex_encode(&self.fingerprint[..4]))
            .finish()
    }
}

// ============================================================================
// Module Registry
// ============================================================================

enum Slot {
    /// A load is in flight for this name
    Pending,
    /// A module is bound under this name
    Ready(Arc<LoadedModule>),
}

/// Name → module map shared by all `load` calls.
///
/// A name is reserved before the expensive decrypt/stage/load work begins,
/// so two racing loads of the same name resolve to exactly one winner; the
/// loser observes a conflict, never a corrupted entry.
pub struct ModuleRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ModuleRegistry {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a bound module
    pub fn get(&self, name: &str) -> Option<Arc<LoadedModule>> {
        match self.slots.lock().get(name) {
            Some(Slot::Ready(module)) => Some(module.clone()),
            _ => None,
        }
    }

    /// Names of all bound modules
    pub fn names(&self) -> Vec<String> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn begin(&self, name: &str, fingerprint: [u8; 32]) -> SealResult<Bind<'_>> {
        let mut slots = self.slots.lock();
        match slots.get(name) {
            Some(Slot::Ready(module)) if module.fingerprint == fingerprint => {
                Ok(Bind::Existing(module.clone()))
            }
            Some(_) => Err(SealError::ModuleNameConflict(name.to_string())),
            None => {
                slots.insert(name.to_string(), Slot::Pending);
                Ok(Bind::Reserved(Reservation {
                    registry: self,
                    name: name.to_string(),
                    committed: false,
                }))
            }
        }
    }
}

enum Bind<'a> {
    Existing(Arc<LoadedModule>),
    Reserved(Reservation<'a>),
}

/// Exclusive claim on a registry name while a load is in flight.
///
/// Dropping without committing releases the name, so a failed load does not
/// poison it for later attempts.
struct Reservation<'a> {
    registry: &'a ModuleRegistry,
    name: String,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, module: Arc<LoadedModule>) {
        self.registry
            .slots
            .lock()
            .insert(self.name.clone(), Slot::Ready(module));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.slots.lock().remove(&self.name);
        }
    }
}

// ============================================================================
// Staging
// ============================================================================

/// Guard around the transient plaintext staging file.
///
/// Created with owner-only permissions (tempfile's default on Unix). Drop
/// overwrites the contents with zeros and unlinks the file, so no exit path
/// leaves plaintext machine code on disk.
struct StagedFile {
    path: Option<tempfile::TempPath>,
    len: usize,
}

impl StagedFile {
    fn create(staging_dir: Option<&Path>, plaintext: &[u8]) -> SealResult<Self> {
        let suffix = format!(".{}", module_suffix());
        let mut builder = tempfile::Builder::new();
        builder.prefix("modseal-stage-").suffix(&suffix);
        let mut file = match staging_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(plaintext)?;
        file.as_file().sync_all()?;
        Ok(Self {
            path: Some(file.into_temp_path()),
            len: plaintext.len(),
        })
    }

    fn path(&self) -> &Path {
        self.path.as_deref().expect("staged file already released")
    }

    /// Remove the staging file without scrubbing it first.
    ///
    /// Used after a successful load only: the dynamic loader's private
    /// mapping may still fault pages in from the file, so its contents must
    /// stay intact until the unlink.
    #[cfg(not(windows))]
    fn unlink(mut self) {
        if let Some(temp_path) = self.path.take() {
            drop(temp_path);
        }
    }

    /// Hand the file over to a `LoadedModule` instead of removing it
    /// (Windows keeps the mapped DLL's backing file alive).
    #[cfg(windows)]
    fn into_retained(mut self) -> tempfile::TempPath {
        self.path.take().expect("staged file already released")
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Some(temp_path) = self.path.take() {
            // Best-effort scrub before unlink; removal happens regardless.
            if let Ok(mut file) = fs::OpenOptions::new().write(true).open(&temp_path) {
                let _ = file.write_all(&vec![0u8; self.len]);
                let _ = file.sync_all();
            }
            drop(temp_path);
        }
    }
}

// ============================================================================
// Runtime Loader
// ============================================================================

/// Decrypts containers and binds the resulting native modules into the
/// host process.
pub struct RuntimeLoader {
    keys: KeySource,
    registry: ModuleRegistry,
    staging_dir: Option<PathBuf>,
}

impl RuntimeLoader {
    /// Create a loader using the given key-provider strategy
    pub fn new(keys: KeySource) -> Self {
        Self {
            keys,
            registry: ModuleRegistry::new(),
            staging_dir: None,
        }
    }

    /// Stage plaintext under `dir` instead of the system temp directory
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Look up an already-loaded module
    pub fn get(&self, name: &str) -> Option<Arc<LoadedModule>> {
        self.registry.get(name)
    }

    /// Names of all loaded modules
    pub fn loaded(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Read a container file and load it under `module_name`
    pub fn load_file(&self, path: &Path, module_name: &str) -> SealResult<Arc<LoadedModule>> {
        let container = EncryptionContainer::read_file(path)?;
        self.load(&container, module_name)
    }

    /// Decrypt a container and bind the module under `module_name`.
    ///
    /// Repeating a successful load of the same container under the same
    /// name returns the existing handle. A different container under an
    /// existing name is a [`SealError::ModuleNameConflict`]. On any failure
    /// the staged plaintext is zeroed and its file removed before the error
    /// is returned.
    pub fn load(
        &self,
        container: &EncryptionContainer,
        module_name: &str,
    ) -> SealResult<Arc<LoadedModule>> {
        validate_module_name(module_name)?;
        trace_state(module_name, LoadState::Idle);

        let fingerprint = container.fingerprint();
        let reservation = match self.registry.begin(module_name, fingerprint)? {
            Bind::Existing(module) => {
                tracing::debug!(module = module_name, "already loaded, reusing handle");
                return Ok(module);
            }
            Bind::Reserved(reservation) => reservation,
        };

        trace_state(module_name, LoadState::Decrypting);
        let plaintext = self
            .keys
            .resolve(container.key_id())
            .and_then(|key| container::decrypt(container, &key))
            .inspect_err(|_| trace_state(module_name, LoadState::Failed))?;
        // Decrypt failures never create a staging artifact.

        let staged = StagedFile::create(self.staging_dir.as_deref(), &plaintext)
            .inspect_err(|_| trace_state(module_name, LoadState::Failed))?;
        drop(plaintext); // zeroed; the staged file is now the only plaintext copy
        trace_state(module_name, LoadState::Staged);

        let library = unsafe { Library::new(staged.path()) }.map_err(|e| {
            trace_state(module_name, LoadState::Failed);
            SealError::ModuleLoad(e.to_string())
        })?;

        #[cfg(windows)]
        let module = Arc::new(LoadedModule {
            name: module_name.to_string(),
            fingerprint,
            library,
            _staged: staged.into_retained(),
        });
        #[cfg(not(windows))]
        let module = {
            // Open-then-unlink: the mapping survives; the file does not.
            staged.unlink();
            Arc::new(LoadedModule {
                name: module_name.to_string(),
                fingerprint,
                library,
            })
        };

        reservation.commit(module.clone());
        trace_state(module_name, LoadState::Loaded);
        tracing::info!(module = module_name, "native module loaded");
        Ok(module)
    }
}

fn validate_module_name(name: &str) -> SealResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(SealError::Config(format!("invalid module name {:?}", name)));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
