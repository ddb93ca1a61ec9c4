//! Platform descriptor for native modules

use serde::{Deserialize, Serialize};

/// Identifies the platform a native module was built for, and the file
/// suffix the platform's dynamic loader expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDescriptor {
    /// Operating system (`linux`, `macos`, `windows`, ...)
    pub os: &'static str,
    /// CPU architecture (`x86_64`, `aarch64`, ...)
    pub arch: &'static str,
    /// Native module file suffix, without the leading dot
    pub suffix: &'static str,
}

impl PlatformDescriptor {
    /// Descriptor for the platform this process is running on
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            suffix: module_suffix(),
        }
    }
}

impl std::fmt::Display for PlatformDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{} (.{})", self.os, self.arch, self.suffix)
    }
}

/// Native module suffix for the current platform.
///
/// Used both for artifact discovery after compilation and for naming the
/// staging file at load time.
pub fn module_suffix() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "dll"
    }
    #[cfg(target_os = "macos")]
    {
        "dylib"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "so"
    }
}
