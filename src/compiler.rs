//! External compiler adapter
//!
//! Turns a source unit into a platform-native module by invoking the
//! configured toolchain as a subprocess. The toolchain is opaque: modseal
//! validates only its exit status and the presence of exactly one output
//! artifact. The source is staged into an isolated build directory that is
//! removed on every exit path, including compiler failure and cancellation.

use crate::config::ToolchainConfig;
use crate::platform::PlatformDescriptor;
use crate::{SealError, SealResult};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

/// A unit of sensitive source handed to the toolchain.
///
/// Immutable once constructed; the identifier names both the expected output
/// artifact and, later, the default module registration.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    /// Path-derived identifier (file stem)
    pub name: String,
    /// Location of the source file
    pub path: PathBuf,
}

impl SourceUnit {
    /// Build a unit from a source path.
    ///
    /// The file must exist and be readable.
    pub fn from_path(path: &Path) -> SealResult<Self> {
        // Opening (not just stat-ing) proves readability up front.
        fs::File::open(path)?;

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                SealError::Config(format!("cannot derive a unit name from {}", path.display()))
            })?
            .to_string();

        Ok(Self {
            name,
            path: path.to_path_buf(),
        })
    }
}

/// A platform-specific binary module produced by the toolchain.
///
/// Produced once per build and never mutated.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    /// Unit identifier the artifact was built from
    pub name: String,
    /// Platform the artifact targets
    pub platform: PlatformDescriptor,
    /// Raw module bytes
    pub bytes: Vec<u8>,
}

impl CompiledArtifact {
    /// Artifact size in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length artifact
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Cooperative cancellation flag for a running compilation.
///
/// Cancelling kills the toolchain subprocess; the staged build directory is
/// still removed before the call returns.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Adapter around the external native-code compiler
#[derive(Debug, Clone)]
pub struct Compiler {
    toolchain: ToolchainConfig,
}

impl Compiler {
    /// Create an adapter for the given toolchain
    pub fn new(toolchain: ToolchainConfig) -> Self {
        Self { toolchain }
    }

    /// Compile a source unit, leaving the artifact in `output_dir`.
    ///
    /// The caller owns `output_dir` and its cleanup.
    pub fn compile(&self, unit: &SourceUnit, output_dir: &Path) -> SealResult<CompiledArtifact> {
        self.compile_with_cancel(unit, output_dir, &CancelToken::new())
    }

    /// Compile with a cancellation token.
    ///
    /// On cancellation the subprocess is killed and the build directory
    /// removed before [`SealError::Cancelled`] is returned.
    pub fn compile_with_cancel(
        &self,
        unit: &SourceUnit,
        output_dir: &Path,
        cancel: &CancelToken,
    ) -> SealResult<CompiledArtifact> {
        let platform = PlatformDescriptor::current();
        fs::create_dir_all(output_dir)?;

        // Isolated build directory; Drop removes it on every exit path.
        let build_dir = tempfile::Builder::new()
            .prefix("modseal-build-")
            .tempdir()?;

        let staged = build_dir.path().join(
            unit.path
                .file_name()
                .ok_or_else(|| SealError::Config(format!("bad source path {}", unit.path.display())))?,
        );
        fs::copy(&unit.path, &staged)?;

        let args: Vec<String> = self
            .toolchain
            .args
            .iter()
            .map(|arg| render_arg(arg, &staged, output_dir, &unit.name, platform.suffix))
            .collect();

        tracing::debug!(
            command = %self.toolchain.command,
            unit = %unit.name,
            "invoking toolchain"
        );

        let status = run_toolchain(
            &self.toolchain.command,
            &args,
            build_dir.path(),
            cancel,
        )?;

        if !status.success {
            return Err(SealError::Compile(format!(
                "{} exited with {}: {}",
                self.toolchain.command, status.code, status.diagnostics
            )));
        }
        // stderr output alone is not a failure; the exit status decides.

        if self.toolchain.keep_build_dir {
            let kept = build_dir.keep();
            tracing::debug!(path = %kept.display(), "keeping build directory");
        }

        let path = discover_artifact(output_dir, &unit.name, platform.suffix)?;
        let bytes = fs::read(&path)?;

        tracing::info!(
            unit = %unit.name,
            artifact = %path.display(),
            size = bytes.len(),
            "compiled"
        );

        Ok(CompiledArtifact {
            name: unit.name.clone(),
            platform,
            bytes,
        })
    }
}

/// Substitute the `{source}`, `{output}`, `{name}` and `{suffix}`
/// placeholders in one toolchain argument.
fn render_arg(arg: &str, source: &Path, output_dir: &Path, name: &str, suffix: &str) -> String {
    arg.replace("{source}", &source.display().to_string())
        .replace("{output}", &output_dir.display().to_string())
        .replace("{name}", name)
        .replace("{suffix}", suffix)
}

struct ToolchainExit {
    success: bool,
    code: i32,
    diagnostics: String,
}

/// Spawn the toolchain, drain its output off-thread, and poll for exit or
/// cancellation. Killing the child on cancel is immediate; the reader
/// threads then see EOF and finish.
fn run_toolchain(
    command: &str,
    args: &[String],
    cwd: &Path,
    cancel: &CancelToken,
) -> SealResult<ToolchainExit> {
    let mut child = Command::new(command)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SealError::Compile(format!("failed to run {}: {}", command, e)))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = std::thread::spawn(move || read_all(stdout));
    let err_reader = std::thread::spawn(move || read_all(stderr));

    let status = loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            let _ = out_reader.join();
            let _ = err_reader.join();
            return Err(SealError::Cancelled);
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => std::thread::sleep(Duration::from_millis(20)),
        }
    };

    let stdout_text = out_reader.join().unwrap_or_default();
    let stderr_text = err_reader.join().unwrap_or_default();

    let mut diagnostics = String::new();
    if !stdout_text.trim().is_empty() {
        diagnostics.push_str(stdout_text.trim());
    }
    if !stderr_text.trim().is_empty() {
        if !diagnostics.is_empty() {
            diagnostics.push('\n');
        }
        diagnostics.push_str(stderr_text.trim());
    }

    Ok(ToolchainExit {
        success: status.success(),
        code: status.code().unwrap_or(-1),
        diagnostics,
    })
}

fn read_all<R: Read>(handle: Option<R>) -> String {
    let mut text = String::new();
    if let Some(mut handle) = handle {
        let _ = handle.read_to_string(&mut text);
    }
    text
}

/// Scan the output directory for exactly one artifact whose base name
/// matches the unit and whose suffix matches the platform.
///
/// Toolchains commonly append a platform tag to the stem
/// (`pricing.cpython-311-x86_64-linux-gnu.so`), so `<name>.<anything>` is
/// accepted alongside the plain `<name>`.
fn discover_artifact(output_dir: &Path, name: &str, suffix: &str) -> SealResult<PathBuf> {
    let tagged_prefix = format!("{}.", name);
    let mut candidates: Vec<PathBuf> = WalkDir::new(output_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == suffix))
        .filter(|e| {
            e.path()
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| stem == name || stem.starts_with(&tagged_prefix))
        })
        .map(|e| e.path().to_path_buf())
        .collect();

    match candidates.len() {
        0 => Err(SealError::ArtifactNotFound(format!(
            "no {}.{} (or {}*.{}) in {}",
            name,
            suffix,
            tagged_prefix,
            suffix,
            output_dir.display()
        ))),
        1 => Ok(candidates.pop().expect("len checked")),
        _ => {
            candidates.sort();
            let names: Vec<String> = candidates
                .iter()
                .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
                .collect();
            Err(SealError::AmbiguousArtifact(format!(
                "{} candidates for {} in {}: {}",
                names.len(),
                name,
                output_dir.display(),
                names.join(", ")
            )))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::module_suffix;
    use tempfile::TempDir;

    fn sh_toolchain(script: String) -> ToolchainConfig {
        ToolchainConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script],
            keep_build_dir: false,
        }
    }

    fn write_unit(dir: &TempDir, name: &str) -> SourceUnit {
        let path = dir.path().join(format!("{}.c", name));
        std::fs::write(&path, "int pricing_total(void) { return 42; }\n").unwrap();
        SourceUnit::from_path(&path).unwrap()
    }

    #[test]
    fn test_source_unit_requires_readable_file() {
        let result = SourceUnit::from_path(Path::new("/nonexistent/pricing.c"));
        assert!(matches!(result, Err(SealError::Io(_))));
    }

    #[test]
    fn test_source_unit_name_is_stem() {
        let dir = TempDir::new().unwrap();
        let unit = write_unit(&dir, "pricing");
        assert_eq!(unit.name, "pricing");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_toolchain_produces_artifact() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let unit = write_unit(&dir, "pricing");

        let compiler = Compiler::new(sh_toolchain(
            "cp {source} {output}/{name}.{suffix}".to_string(),
        ));
        let artifact = compiler.compile(&unit, out.path()).unwrap();

        assert_eq!(artifact.name, "pricing");
        assert_eq!(artifact.platform.suffix, module_suffix());
        assert!(!artifact.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_carries_diagnostics() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let unit = write_unit(&dir, "pricing");

        let compiler = Compiler::new(sh_toolchain(
            "echo 'pricing.c:1: broken' >&2; exit 3".to_string(),
        ));
        let err = compiler.compile(&unit, out.path()).unwrap_err();

        match err {
            SealError::Compile(msg) => {
                assert!(msg.contains("exited with 3"), "message: {}", msg);
                assert!(msg.contains("pricing.c:1: broken"), "message: {}", msg);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_stderr_output_alone_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let unit = write_unit(&dir, "pricing");

        let compiler = Compiler::new(sh_toolchain(
            "echo 'warning: deprecated' >&2; cp {source} {output}/{name}.{suffix}".to_string(),
        ));
        assert!(compiler.compile(&unit, out.path()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_artifact_detected() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let unit = write_unit(&dir, "pricing");

        let compiler = Compiler::new(sh_toolchain("true".to_string()));
        let err = compiler.compile(&unit, out.path()).unwrap_err();
        assert!(matches!(err, SealError::ArtifactNotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_ambiguous_artifact_detected() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let unit = write_unit(&dir, "pricing");

        let compiler = Compiler::new(sh_toolchain(
            "touch {output}/{name}.{suffix} {output}/{name}.x86.{suffix}".to_string(),
        ));
        let err = compiler.compile(&unit, out.path()).unwrap_err();
        assert!(matches!(err, SealError::AmbiguousArtifact(_)));
    }

    #[test]
    fn test_discovery_ignores_other_units() {
        let out = TempDir::new().unwrap();
        let suffix = module_suffix();
        std::fs::write(out.path().join(format!("pricing.{}", suffix)), b"x").unwrap();
        std::fs::write(out.path().join(format!("pricing2.{}", suffix)), b"x").unwrap();
        std::fs::write(out.path().join("pricing.txt"), b"x").unwrap();

        let found = discover_artifact(out.path(), "pricing", suffix).unwrap();
        assert_eq!(
            found.file_name().and_then(|n| n.to_str()),
            Some(format!("pricing.{}", suffix).as_str())
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_cancellation_kills_toolchain() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let unit = write_unit(&dir, "pricing");

        let compiler = Compiler::new(sh_toolchain("sleep 30".to_string()));
        let cancel = CancelToken::new();

        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                cancel.cancel();
            })
        };

        let started = std::time::Instant::now();
        let err = compiler
            .compile_with_cancel(&unit, out.path(), &cancel)
            .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, SealError::Cancelled));
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "cancellation took {:?}",
            started.elapsed()
        );
    }
}
