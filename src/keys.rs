//! Key resolution for container encryption and decryption
//!
//! Three interchangeable strategies behind one interface:
//!
//! - **Embedded**: a fixed key baked into the consuming binary, stored as
//!   XOR-masked parts. Deters casual inspection only; documented as the
//!   weakest strategy.
//! - **Machine-bound**: key derived from stable local-machine
//!   characteristics. Pure and deterministic on one machine, no network.
//! - **Remote**: key fetched from an issuing service over an authenticated,
//!   timeout-bounded request.
//!
//! Every strategy yields exactly [`KEY_SIZE`] bytes. A provider that cannot
//! is rejected at construction time, not at decrypt time.

use crate::config::{KeySourceConfig, MachineDescriptors};
use crate::{SealError, SealResult};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use zeroize::Zeroize;

// ============================================================================
// Constants
// ============================================================================

/// Symmetric key size in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Key-identifier size in bytes (fixed by the container wire format)
pub const KEY_ID_SIZE: usize = 16;

/// Domain-separation context for machine-bound key derivation
const MACHINE_KEY_CONTEXT: &str = "modseal 2025-07 machine-bound key v1";

/// Domain-separation context for key-id derivation from labels
const KEY_ID_CONTEXT: &str = "modseal 2025-07 key id v1";

// ============================================================================
// Key Identifier
// ============================================================================

/// Opaque label distinguishing which key a container was encrypted with,
/// without revealing the key itself.
///
/// User-facing labels of any length are hashed down to the fixed width the
/// wire format carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId([u8; KEY_ID_SIZE]);

impl KeyId {
    /// Derive an identifier from a user-facing label
    pub fn from_label(label: &str) -> Self {
        let digest = blake3::derive_key(KEY_ID_CONTEXT, label.as_bytes());
        let mut id = [0u8; KEY_ID_SIZE];
        id.copy_from_slice(&digest[..KEY_ID_SIZE]);
        Self(id)
    }

    /// Construct from raw identifier bytes (container deserialization)
    pub fn from_bytes(bytes: [u8; KEY_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; KEY_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_encode(&self.0))
    }
}

// ============================================================================
// Key Material
// ============================================================================

/// Raw symmetric key bytes plus their identifier.
///
/// Never logged (`Debug` is redacted), never serialized, zeroed on drop.
pub struct KeyMaterial {
    id: KeyId,
    bytes: [u8; KEY_SIZE],
}

impl KeyMaterial {
    /// Wrap raw key bytes
    pub fn new(id: KeyId, bytes: [u8; KEY_SIZE]) -> Self {
        Self { id, bytes }
    }

    /// Generate a fresh random key under the given identifier
    pub fn generate(id: KeyId) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { id, bytes }
    }

    /// The key's identifier
    pub fn id(&self) -> KeyId {
        self.id
    }

    /// Key bytes, for the cipher only
    pub(crate) fn bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Key bytes encoded for operator hand-off (keygen output)
    pub fn export_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.bytes)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

// ============================================================================
// Embedded Key Storage
// ============================================================================

/// Obfuscated in-binary key storage.
///
/// The key is split into 8-byte parts XOR'd with random masks so the raw
/// bytes never appear contiguously in the binary or in config memory.
#[derive(Clone)]
pub struct ObfuscatedKey {
    parts: [[u8; 8]; KEY_SIZE / 8],
    masks: [[u8; 8]; KEY_SIZE / 8],
}

impl ObfuscatedKey {
    /// Split and mask a key
    pub fn conceal(key: &[u8; KEY_SIZE]) -> Self {
        let mut parts = [[0u8; 8]; KEY_SIZE / 8];
        let mut masks = [[0u8; 8]; KEY_SIZE / 8];

        for (i, chunk) in key.chunks_exact(8).enumerate() {
            OsRng.fill_bytes(&mut masks[i]);
            for j in 0..8 {
                parts[i][j] = chunk[j] ^ masks[i][j];
            }
        }

        Self { parts, masks }
    }

    /// Reconstruct the original key
    pub fn reveal(&self) -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        for i in 0..KEY_SIZE / 8 {
            for j in 0..8 {
                key[i * 8 + j] = self.parts[i][j] ^ self.masks[i][j];
            }
        }
        key
    }
}

impl fmt::Debug for ObfuscatedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ObfuscatedKey(<redacted>)")
    }
}

// ============================================================================
// Key Source Strategies
// ============================================================================

/// A configured key-provider strategy.
///
/// Built once from [`KeySourceConfig`] via [`KeySource::from_config`], which
/// validates key shape and endpoint reachability parameters up front.
#[derive(Debug)]
pub enum KeySource {
    /// Fixed key baked into the binary/config
    Embedded { key: ObfuscatedKey },

    /// Key derived from local machine characteristics
    MachineBound { descriptors: MachineDescriptors },

    /// Key fetched from an issuing service
    Remote {
        endpoint: String,
        token: Option<String>,
        timeout: Duration,
        client: reqwest::blocking::Client,
    },
}

/// Response shape of the key-issuing service
#[derive(Deserialize)]
struct IssuedKey {
    key: String,
}

impl KeySource {
    /// Validate a strategy configuration and build the provider.
    ///
    /// Fails fast on anything that would otherwise surface as a confusing
    /// decrypt-time error: wrong embedded key length, empty descriptor
    /// selection, unusable endpoint.
    pub fn from_config(config: &KeySourceConfig) -> SealResult<Self> {
        match config {
            KeySourceConfig::Embedded { key } => {
                use base64::Engine;
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(key)
                    .map_err(|e| SealError::InvalidKey(format!("embedded key is not base64: {}", e)))?;
                let mut bytes: [u8; KEY_SIZE] = raw.try_into().map_err(|raw: Vec<u8>| {
                    SealError::InvalidKey(format!(
                        "embedded key must be {} bytes, got {}",
                        KEY_SIZE,
                        raw.len()
                    ))
                })?;
                let concealed = ObfuscatedKey::conceal(&bytes);
                bytes.zeroize();
                Ok(Self::Embedded { key: concealed })
            }
            KeySourceConfig::MachineBound { descriptors } => {
                if descriptors.is_empty() {
                    return Err(SealError::Config(
                        "machine-bound key source needs at least one descriptor field".to_string(),
                    ));
                }
                Ok(Self::MachineBound {
                    descriptors: *descriptors,
                })
            }
            KeySourceConfig::Remote {
                endpoint,
                token,
                timeout_secs,
            } => {
                if endpoint.is_empty() {
                    return Err(SealError::Config(
                        "remote key source needs an endpoint".to_string(),
                    ));
                }
                let timeout = Duration::from_secs((*timeout_secs).max(1));
                let client = reqwest::blocking::Client::builder()
                    .timeout(timeout)
                    .build()
                    .map_err(|e| SealError::Config(format!("key service client: {}", e)))?;
                Ok(Self::Remote {
                    endpoint: endpoint.clone(),
                    token: token.clone(),
                    timeout,
                    client,
                })
            }
        }
    }

    /// Resolve the key for the given identifier.
    ///
    /// For a given identifier the same strategy configuration yields the
    /// identical key at encrypt and decrypt time.
    pub fn resolve(&self, id: KeyId) -> SealResult<KeyMaterial> {
        match self {
            Self::Embedded { key } => Ok(KeyMaterial::new(id, key.reveal())),
            Self::MachineBound { descriptors } => {
                let fingerprint = machine_fingerprint(descriptors);
                let mut ikm = Vec::with_capacity(fingerprint.len() + KEY_ID_SIZE);
                ikm.extend_from_slice(fingerprint.as_bytes());
                ikm.extend_from_slice(id.as_bytes());
                let derived = blake3::derive_key(MACHINE_KEY_CONTEXT, &ikm);
                ikm.zeroize();
                Ok(KeyMaterial::new(id, derived))
            }
            Self::Remote {
                endpoint,
                token,
                timeout,
                client,
            } => {
                tracing::debug!(key_id = %id, timeout_secs = timeout.as_secs(), "requesting key from service");
                let mut request = client.get(endpoint).query(&[("key_id", id.to_string())]);
                if let Some(token) = token {
                    request = request.bearer_auth(token);
                }
                let response = request.send().map_err(|e| {
                    SealError::KeyUnavailable(format!("key service request failed: {}", e))
                })?;
                if !response.status().is_success() {
                    return Err(SealError::KeyUnavailable(format!(
                        "key service returned {}",
                        response.status()
                    )));
                }
                let issued: IssuedKey = response.json().map_err(|e| {
                    SealError::KeyUnavailable(format!("malformed key service response: {}", e))
                })?;
                use base64::Engine;
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(&issued.key)
                    .map_err(|_| {
                        SealError::KeyUnavailable("malformed key service response".to_string())
                    })?;
                let bytes: [u8; KEY_SIZE] = raw.try_into().map_err(|_| {
                    SealError::KeyUnavailable(format!(
                        "key service issued a key of the wrong size (want {})",
                        KEY_SIZE
                    ))
                })?;
                Ok(KeyMaterial::new(id, bytes))
            }
        }
    }
}

// ============================================================================
// Machine Descriptors
// ============================================================================

/// Concatenate the selected machine characteristics into a stable string.
///
/// Reads system descriptors only; no network, no mutation. Repeated calls on
/// the same machine produce the same value.
fn machine_fingerprint(descriptors: &MachineDescriptors) -> String {
    let mut parts = Vec::new();
    if descriptors.hostname {
        parts.push(read_hostname());
    }
    if descriptors.os_release {
        parts.push(format!("{}/{}", std::env::consts::OS, os_release()));
    }
    if descriptors.machine_id {
        if let Some(id) = read_machine_id() {
            parts.push(id);
        }
    }
    parts.join("\n")
}

fn read_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
            let name = name.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
        std::env::var("HOSTNAME").unwrap_or_default()
    }
    #[cfg(windows)]
    {
        std::env::var("COMPUTERNAME").unwrap_or_default()
    }
}

fn os_release() -> String {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }
    #[cfg(not(target_os = "linux"))]
    {
        String::new()
    }
}

fn read_machine_id() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/machine-id")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

// ============================================================================
// Hex Utilities
// ============================================================================

/// Hex encode bytes
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hex decode a string
pub fn hex_decode(s: &str) -> SealResult<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(SealError::InvalidKey(
            "hex string must have even length".to_string(),
        ));
    }

    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| SealError::InvalidKey(format!("invalid hex character: {}", e)))
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_id_is_stable_and_label_dependent() {
        let a1 = KeyId::from_label("k1");
        let a2 = KeyId::from_label("k1");
        let b = KeyId::from_label("k2");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.to_string().len(), KEY_ID_SIZE * 2);
    }

    #[test]
    fn test_key_material_debug_is_redacted() {
        let key = KeyMaterial::generate(KeyId::from_label("k1"));
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(&key.export_base64()));
    }

    #[test]
    fn test_obfuscated_key_roundtrip() {
        let mut original = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut original);
        let concealed = ObfuscatedKey::conceal(&original);
        assert_eq!(concealed.reveal(), original);
        // The masked parts are not the key itself.
        let flattened: Vec<u8> = concealed.parts.iter().flatten().copied().collect();
        assert_ne!(flattened, original.to_vec());
    }

    #[test]
    fn test_embedded_wrong_size_fails_at_config_time() {
        use base64::Engine;
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        let result = KeySource::from_config(&KeySourceConfig::Embedded { key: short });
        assert!(matches!(result, Err(SealError::InvalidKey(_))));
    }

    #[test]
    fn test_embedded_resolves_configured_key() {
        use base64::Engine;
        let raw = [7u8; KEY_SIZE];
        let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
        let source = KeySource::from_config(&KeySourceConfig::Embedded { key: encoded }).unwrap();
        let material = source.resolve(KeyId::from_label("k1")).unwrap();
        assert_eq!(material.bytes(), &raw);
    }

    #[test]
    fn test_machine_bound_is_deterministic() {
        let source = KeySource::from_config(&KeySourceConfig::MachineBound {
            descriptors: MachineDescriptors::default(),
        })
        .unwrap();
        let id = KeyId::from_label("k1");
        let first = source.resolve(id).unwrap();
        let second = source.resolve(id).unwrap();
        assert_eq!(first.bytes(), second.bytes());

        // Different identifiers derive different keys.
        let other = source.resolve(KeyId::from_label("k2")).unwrap();
        assert_ne!(first.bytes(), other.bytes());
    }

    #[test]
    fn test_machine_bound_rejects_empty_descriptors() {
        let result = KeySource::from_config(&KeySourceConfig::MachineBound {
            descriptors: MachineDescriptors {
                hostname: false,
                os_release: false,
                machine_id: false,
            },
        });
        assert!(matches!(result, Err(SealError::Config(_))));
    }

    #[test]
    fn test_remote_rejects_empty_endpoint() {
        let result = KeySource::from_config(&KeySourceConfig::Remote {
            endpoint: String::new(),
            token: None,
            timeout_secs: 5,
        });
        assert!(matches!(result, Err(SealError::Config(_))));
    }

    #[test]
    fn test_remote_unreachable_is_retryable() {
        let source = KeySource::from_config(&KeySourceConfig::Remote {
            endpoint: "http://127.0.0.1:9/issue".to_string(),
            token: None,
            timeout_secs: 1,
        })
        .unwrap();
        let err = source.resolve(KeyId::from_label("k1")).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_hex_roundtrip() {
        let bytes = [0x00, 0x01, 0xab, 0xff];
        let encoded = hex_encode(&bytes);
        assert_eq!(encoded, "0001abff");
        assert_eq!(hex_decode(&encoded).unwrap(), bytes.to_vec());
        assert!(hex_decode("abc").is_err());
        assert!(hex_decode("zz").is_err());
    }
}
